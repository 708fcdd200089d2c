// Typed configuration for templates, programs and instruments.
//
// Each of `Template`, `Program` and `Instrument` carries a free-text
// `config` block. The block is a JSON object with camelCase keys; a blank
// block means "all defaults", and any key left out takes its default. The
// parsed structs are the only way fabrication reads configuration.
//
// Unparseable text is a `ContentError::Configuration`. Values that parse but
// fall outside their valid range (a probability above 1.0, a zero-beat bar)
// are logged with `warn!` and replaced by the default, so one bad field
// never takes a whole template down.
//
// Per-instrument-type tables (`intensityLayers`, `choiceMuteProbability`,
// ...) may be given partially; types missing from a supplied table fall
// back to their default entry.
//
// See also: `model.rs` for the entities that carry these blocks, and the
// fabricator in `ostinato_fabric`, which parses them once per segment.

use crate::enums::InstrumentType;
use crate::error::ContentError;
use crate::meme::MemeTaxonomy;
use ostinato_music::Bar;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::warn;

fn parse_block<T: DeserializeOwned + Default>(
    subject: &str,
    text: &str,
) -> Result<T, ContentError> {
    if text.trim().is_empty() {
        return Ok(T::default());
    }
    serde_json::from_str(text).map_err(|e| ContentError::Configuration {
        subject: subject.to_string(),
        reason: e.to_string(),
    })
}

fn unit_interval(value: f64) -> bool {
    (0.0..=1.0).contains(&value)
}

// ---------------------------------------------------------------------------
// TemplateConfig
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TemplateConfig {
    pub choice_mute_probability: BTreeMap<InstrumentType, f64>,
    pub delta_arc_beat_layers_incoming: u32,
    pub delta_arc_beat_layers_to_prioritize: Vec<String>,
    pub delta_arc_detail_layers_incoming: u32,
    pub delta_arc_enabled: bool,
    pub detail_layer_order: Vec<InstrumentType>,
    pub dub_master_volume: BTreeMap<InstrumentType, f64>,
    pub event_names_large: Vec<String>,
    pub event_names_medium: Vec<String>,
    pub event_names_small: Vec<String>,
    pub instrument_types_for_audio_length_finalization: BTreeSet<InstrumentType>,
    pub instrument_types_for_inversion_seeking: BTreeSet<InstrumentType>,
    pub intensity_auto_crescendo_enabled: bool,
    pub intensity_auto_crescendo_maximum: f64,
    pub intensity_auto_crescendo_minimum: f64,
    pub intensity_layers: BTreeMap<InstrumentType, u32>,
    pub intensity_threshold: BTreeMap<InstrumentType, f64>,
    pub main_program_length_max_delta: i32,
    /// Further main sequence-binding offsets that must remain for the next
    /// segment to stay on the current macro program.
    pub next_macro_lookahead: u32,
    pub meme_taxonomy: MemeTaxonomy,
    pub mixer_compress_ahead_seconds: f64,
    pub mixer_compress_decay_seconds: f64,
    pub mixer_compress_ratio_max: f64,
    pub mixer_compress_ratio_min: f64,
    pub mixer_compress_to_amplitude: f64,
    pub mixer_dsp_buffer_size: u32,
    pub mixer_highpass_threshold_hz: f64,
    pub mixer_lowpass_threshold_hz: f64,
    pub mixer_normalization_boost_threshold: f64,
    pub mixer_normalization_ceiling: f64,
    pub sticky_bun_enabled: bool,
}

const DEFAULT_INTENSITY_LAYERS: [(InstrumentType, u32); 10] = [
    (InstrumentType::Background, 3),
    (InstrumentType::Bass, 1),
    (InstrumentType::Drum, 1),
    (InstrumentType::Hook, 3),
    (InstrumentType::Pad, 3),
    (InstrumentType::Percussion, 3),
    (InstrumentType::Stab, 2),
    (InstrumentType::Sticky, 2),
    (InstrumentType::Stripe, 2),
    (InstrumentType::Transition, 3),
];

const DEFAULT_CHOICE_MUTE_PROBABILITY: f64 = 0.0;
const DEFAULT_DUB_MASTER_VOLUME: f64 = 1.0;
const DEFAULT_INTENSITY_THRESHOLD: f64 = 0.5;

fn per_type<T: Copy>(value: T) -> BTreeMap<InstrumentType, T> {
    InstrumentType::ALL.iter().map(|t| (*t, value)).collect()
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

impl Default for TemplateConfig {
    fn default() -> Self {
        use InstrumentType::*;
        Self {
            choice_mute_probability: per_type(DEFAULT_CHOICE_MUTE_PROBABILITY),
            delta_arc_beat_layers_incoming: 1,
            delta_arc_beat_layers_to_prioritize: strings(&["kick"]),
            delta_arc_detail_layers_incoming: 1,
            delta_arc_enabled: false,
            detail_layer_order: vec![Bass, Pad, Stab, Sticky, Stripe],
            dub_master_volume: per_type(DEFAULT_DUB_MASTER_VOLUME),
            event_names_large: strings(&["BIG", "HIGH", "LARGE", "PRIMARY"]),
            event_names_medium: strings(&["MEDIUM", "MIDDLE", "REGULAR", "SECONDARY"]),
            event_names_small: strings(&["LITTLE", "LOW", "SMALL"]),
            instrument_types_for_audio_length_finalization: [Bass, Pad, Stab, Sticky, Stripe]
                .into_iter()
                .collect(),
            instrument_types_for_inversion_seeking: [Pad, Stab, Sticky, Stripe]
                .into_iter()
                .collect(),
            intensity_auto_crescendo_enabled: true,
            intensity_auto_crescendo_maximum: 0.8,
            intensity_auto_crescendo_minimum: 0.2,
            intensity_layers: DEFAULT_INTENSITY_LAYERS.into_iter().collect(),
            intensity_threshold: per_type(DEFAULT_INTENSITY_THRESHOLD),
            main_program_length_max_delta: 280,
            next_macro_lookahead: 2,
            meme_taxonomy: MemeTaxonomy::default_taxonomy(),
            mixer_compress_ahead_seconds: 0.05,
            mixer_compress_decay_seconds: 0.125,
            mixer_compress_ratio_max: 1.0,
            mixer_compress_ratio_min: 0.3,
            mixer_compress_to_amplitude: 1.0,
            mixer_dsp_buffer_size: 1024,
            mixer_highpass_threshold_hz: 30.0,
            mixer_lowpass_threshold_hz: 15000.0,
            mixer_normalization_boost_threshold: 1.0,
            mixer_normalization_ceiling: 0.999,
            sticky_bun_enabled: true,
        }
    }
}

impl TemplateConfig {
    pub fn parse(text: &str) -> Result<Self, ContentError> {
        let mut config: Self = parse_block("template", text)?;
        config.sanitize();
        Ok(config)
    }

    fn sanitize(&mut self) {
        let defaults = Self::default();
        for (t, p) in self.choice_mute_probability.iter_mut() {
            if !unit_interval(*p) {
                warn!(
                    instrument_type = %t,
                    value = *p,
                    "choiceMuteProbability out of range, using default"
                );
                *p = DEFAULT_CHOICE_MUTE_PROBABILITY;
            }
        }
        for (t, p) in self.intensity_threshold.iter_mut() {
            if !unit_interval(*p) {
                warn!(
                    instrument_type = %t,
                    value = *p,
                    "intensityThreshold out of range, using default"
                );
                *p = DEFAULT_INTENSITY_THRESHOLD;
            }
        }
        for (t, layers) in self.intensity_layers.iter_mut() {
            if *layers == 0 {
                warn!(instrument_type = %t, "intensityLayers must be at least 1, using default");
                *layers = default_intensity_layers(*t);
            }
        }
        let min = self.intensity_auto_crescendo_minimum;
        let max = self.intensity_auto_crescendo_maximum;
        if !unit_interval(min) || !unit_interval(max) || min > max {
            warn!(min, max, "intensityAutoCrescendo bounds invalid, using defaults");
            self.intensity_auto_crescendo_minimum = defaults.intensity_auto_crescendo_minimum;
            self.intensity_auto_crescendo_maximum = defaults.intensity_auto_crescendo_maximum;
        }
        if self.main_program_length_max_delta <= 0 {
            warn!(
                value = self.main_program_length_max_delta,
                "mainProgramLengthMaxDelta must be positive, using default"
            );
            self.main_program_length_max_delta = defaults.main_program_length_max_delta;
        }
        if self.next_macro_lookahead == 0 {
            warn!("nextMacroLookahead must be at least 1, using default");
            self.next_macro_lookahead = defaults.next_macro_lookahead;
        }
    }

    pub fn choice_mute_probability(&self, t: InstrumentType) -> f64 {
        self.choice_mute_probability
            .get(&t)
            .copied()
            .unwrap_or(DEFAULT_CHOICE_MUTE_PROBABILITY)
    }

    pub fn dub_master_volume(&self, t: InstrumentType) -> f64 {
        self.dub_master_volume
            .get(&t)
            .copied()
            .unwrap_or(DEFAULT_DUB_MASTER_VOLUME)
    }

    pub fn intensity_layers(&self, t: InstrumentType) -> u32 {
        self.intensity_layers
            .get(&t)
            .copied()
            .unwrap_or_else(|| default_intensity_layers(t))
    }

    pub fn intensity_threshold(&self, t: InstrumentType) -> f64 {
        self.intensity_threshold
            .get(&t)
            .copied()
            .unwrap_or(DEFAULT_INTENSITY_THRESHOLD)
    }

    pub fn is_inversion_seeking(&self, t: InstrumentType) -> bool {
        self.instrument_types_for_inversion_seeking.contains(&t)
    }

    pub fn finalizes_audio_length(&self, t: InstrumentType) -> bool {
        self.instrument_types_for_audio_length_finalization
            .contains(&t)
    }
}

fn default_intensity_layers(t: InstrumentType) -> u32 {
    DEFAULT_INTENSITY_LAYERS
        .iter()
        .find(|(k, _)| *k == t)
        .map(|(_, v)| *v)
        .unwrap_or(1)
}

// ---------------------------------------------------------------------------
// ProgramConfig
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProgramConfig {
    pub bar_beats: u32,
    pub cutoff_minimum_beats: f64,
    /// Restart each voice's pattern at every chord change instead of
    /// running it across the whole segment.
    pub do_pattern_restart_on_chord: bool,
}

impl Default for ProgramConfig {
    fn default() -> Self {
        Self {
            bar_beats: 4,
            cutoff_minimum_beats: 0.0,
            do_pattern_restart_on_chord: false,
        }
    }
}

impl ProgramConfig {
    pub fn parse(text: &str) -> Result<Self, ContentError> {
        let mut config: Self = parse_block("program", text)?;
        if config.bar_beats == 0 {
            warn!("barBeats must be at least 1, using default");
            config.bar_beats = Self::default().bar_beats;
        }
        if config.cutoff_minimum_beats < 0.0 {
            warn!(
                value = config.cutoff_minimum_beats,
                "cutoffMinimumBeats negative, using default"
            );
            config.cutoff_minimum_beats = 0.0;
        }
        Ok(config)
    }

    pub fn bar(&self) -> Bar {
        Bar::of(self.bar_beats).unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// InstrumentConfig
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct InstrumentConfig {
    pub attack_millis: u32,
    /// Keep reusing the audios picked in earlier segments of the same
    /// through-line instead of choosing fresh ones.
    pub is_audio_selection_persistent: bool,
    pub is_multiphonic: bool,
    pub is_one_shot: bool,
    pub is_one_shot_cutoff_enabled: bool,
    pub is_tonal: bool,
    /// Track names whose events are held for their written length even on a
    /// one-shot instrument.
    pub one_shot_observe_length_of_events: Vec<String>,
    pub release_millis: u32,
}

impl Default for InstrumentConfig {
    fn default() -> Self {
        Self {
            attack_millis: 1,
            is_audio_selection_persistent: true,
            is_multiphonic: false,
            is_one_shot: false,
            is_one_shot_cutoff_enabled: true,
            is_tonal: false,
            one_shot_observe_length_of_events: Vec::new(),
            release_millis: 5,
        }
    }
}

impl InstrumentConfig {
    pub fn parse(text: &str) -> Result<Self, ContentError> {
        parse_block("instrument", text)
    }

    /// True when events on `track_name` keep their written length.
    pub fn observes_length_of(&self, track_name: &str) -> bool {
        self.one_shot_observe_length_of_events
            .iter()
            .any(|n| n.eq_ignore_ascii_case(track_name.trim()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_block_is_all_defaults() {
        assert_eq!(TemplateConfig::parse("").unwrap(), TemplateConfig::default());
        assert_eq!(ProgramConfig::parse("  ").unwrap(), ProgramConfig::default());
        let instrument = InstrumentConfig::parse("").unwrap();
        assert!(instrument.is_audio_selection_persistent);
        assert!(!instrument.is_one_shot);
    }

    #[test]
    fn documented_defaults() {
        let config = TemplateConfig::default();
        assert!(!config.delta_arc_enabled);
        assert!(config.sticky_bun_enabled);
        assert_eq!(config.main_program_length_max_delta, 280);
        assert_eq!(config.next_macro_lookahead, 2);
        assert_eq!(config.intensity_layers(InstrumentType::Pad), 3);
        assert_eq!(config.intensity_layers(InstrumentType::Bass), 1);
        assert_eq!(config.delta_arc_beat_layers_to_prioritize, vec!["kick"]);
        assert!(config.is_inversion_seeking(InstrumentType::Stab));
        assert!(!config.is_inversion_seeking(InstrumentType::Bass));
        assert_eq!(ProgramConfig::default().bar().beats(), 4);
    }

    #[test]
    fn partial_json_overrides_only_named_keys() {
        let config = TemplateConfig::parse(
            r#"{"deltaArcEnabled": true, "intensityLayers": {"Pad": 5}, "stickyBunEnabled": false}"#,
        )
        .unwrap();
        assert!(config.delta_arc_enabled);
        assert!(!config.sticky_bun_enabled);
        assert_eq!(config.intensity_layers(InstrumentType::Pad), 5);
        assert_eq!(config.intensity_layers(InstrumentType::Hook), 3);
        assert_eq!(config.main_program_length_max_delta, 280);
    }

    #[test]
    fn out_of_range_values_fall_back() {
        let config = TemplateConfig::parse(
            r#"{"choiceMuteProbability": {"Drum": 7.0}, "intensityAutoCrescendoMinimum": 0.9,
                "nextMacroLookahead": 0}"#,
        )
        .unwrap();
        assert_eq!(config.choice_mute_probability(InstrumentType::Drum), 0.0);
        assert_eq!(config.intensity_auto_crescendo_minimum, 0.2);
        assert_eq!(config.intensity_auto_crescendo_maximum, 0.8);
        assert_eq!(config.next_macro_lookahead, 2);
        let program = ProgramConfig::parse(r#"{"barBeats": 0}"#).unwrap();
        assert_eq!(program.bar_beats, 4);
    }

    #[test]
    fn unparseable_text_is_a_configuration_error() {
        let err = TemplateConfig::parse("deltaArcEnabled = true").unwrap_err();
        assert!(matches!(err, ContentError::Configuration { .. }));
    }

    #[test]
    fn instrument_flags_and_observed_events() {
        let config = InstrumentConfig::parse(
            r#"{"isOneShot": true, "isMultiphonic": true, "oneShotObserveLengthOfEvents": ["Crash"]}"#,
        )
        .unwrap();
        assert!(config.is_one_shot);
        assert!(config.is_multiphonic);
        assert!(config.observes_length_of(" crash "));
        assert!(!config.observes_length_of("kick"));
    }

    #[test]
    fn custom_taxonomy_replaces_default() {
        let config =
            TemplateConfig::parse(r#"{"memeTaxonomy": [{"name": "MOOD", "memes": ["UP", "DOWN"]}]}"#)
                .unwrap();
        assert_eq!(config.meme_taxonomy.categories().len(), 1);
        assert_eq!(config.meme_taxonomy.categories()[0].name, "MOOD");
    }
}
