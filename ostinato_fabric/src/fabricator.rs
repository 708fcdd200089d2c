// Fabricator: the per-segment context that craft operates against.
//
// One `Fabricator` is built for one target segment, used by the three craft
// passes, and dropped. It borrows the content store (read-only) and the
// segment store (read-write) for its whole life, owns the retrospective
// window, the parsed template config and the segment's `SeededRng`, and
// answers every question craft asks:
// - segment type resolution (`compute_type`)
// - timing: beat position to segment microseconds under a tempo ramp
// - chords and voicings actually placed in this segment
// - range and transposition maths for detail voices
// - sequence-binding navigation within macro and main programs
// - continuity: which previous choices carry on, preferred audios
// - meme bookkeeping on every choice, messages, reports, sticky buns
//
// Content lookups return references with the content store's lifetime.
// Segment entities are always returned as owned clones so that no
// reference into the segment store outlives a write to it.
//
// **Critical constraint: determinism.** All randomness comes from `rng`,
// all ids from `ids`, and every collection craft iterates is ordered.
// The `FxHashMap`s here are memo caches and are never iterated.
//
// See also: `factory.rs` (construction), `craft/` (the policies),
// `retrospective.rs`, `segment_store.rs`.

use crate::enums::{SegmentMessageType, SegmentType};
use crate::error::FabricationError;
use crate::marble_bag::quick_pick;
use crate::retrospective::Retrospective;
use crate::segment::*;
use crate::segment_store::SegmentStore;
use crate::sticky_bun::StickyBun;
use ostinato_content::enums::{ContentBindingType, InstrumentMode, InstrumentType, ProgramType};
use ostinato_content::ids::*;
use ostinato_content::meme::to_meme;
use ostinato_content::model::*;
use ostinato_content::{
    ContentStore, IdGenerator, InstrumentConfig, MemeIsometry, ProgramConfig, TemplateConfig,
};
use ostinato_music::{Chord, Note, NoteRange, PitchClass};
use ostinato_prng::SeededRng;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, error, warn};

const MICROS_PER_MINUTE: f64 = 60_000_000.0;

/// Below this tempo slope (bpm per beat) the ramp is treated as flat.
const FLAT_RAMP_EPSILON: f64 = 1e-9;

/// Everything a fabricator needs besides the two stores.
#[derive(Clone, Debug)]
pub struct FabricatorParams {
    pub segment_id: SegmentId,
    pub seed: u64,
    pub output_frame_rate: f64,
    pub output_channels: u32,
    /// Forces the segment type instead of computing it.
    pub type_override: Option<SegmentType>,
}

pub struct Fabricator<'a> {
    content: &'a ContentStore,
    store: &'a mut SegmentStore,
    retrospective: Retrospective,
    chain: Chain,
    template_config: TemplateConfig,
    bound_program_ids: BTreeSet<ProgramId>,
    bound_instrument_ids: BTreeSet<InstrumentId>,
    segment_id: SegmentId,
    output_frame_rate: f64,
    output_channels: u32,
    type_override: Option<SegmentType>,
    rng: SeededRng,
    ids: IdGenerator,
    segment_type: Option<SegmentType>,
    preferred_audios: FxHashMap<String, InstrumentAudioId>,
    program_configs: FxHashMap<ProgramId, ProgramConfig>,
    instrument_configs: FxHashMap<InstrumentId, InstrumentConfig>,
}

impl<'a> Fabricator<'a> {
    pub fn new(
        content: &'a ContentStore,
        store: &'a mut SegmentStore,
        retrospective: Retrospective,
        params: FabricatorParams,
    ) -> Result<Self, FabricationError> {
        let chain = store.chain()?.clone();
        if store.read_segment(params.segment_id).is_none() {
            return Err(FabricationError::not_found(params.segment_id.to_string()));
        }
        let template_config = TemplateConfig::parse(&chain.config)?;

        let mut bound_program_ids = BTreeSet::new();
        let mut bound_instrument_ids = BTreeSet::new();
        for binding in content.bindings_of_template(chain.template_id) {
            match binding.type_ {
                ContentBindingType::Program => {
                    bound_program_ids.insert(ProgramId(binding.target_id));
                }
                ContentBindingType::Instrument => {
                    bound_instrument_ids.insert(InstrumentId(binding.target_id));
                }
                ContentBindingType::Library => {}
            }
        }

        let mut fabricator = Self {
            content,
            store,
            retrospective,
            chain,
            template_config,
            bound_program_ids,
            bound_instrument_ids,
            segment_id: params.segment_id,
            output_frame_rate: params.output_frame_rate,
            output_channels: params.output_channels,
            type_override: params.type_override,
            rng: SeededRng::new(params.seed),
            ids: IdGenerator::new(SeededRng::derive_seed(&[params.seed, 0x1D5])),
            segment_type: None,
            preferred_audios: FxHashMap::default(),
            program_configs: FxHashMap::default(),
            instrument_configs: FxHashMap::default(),
        };
        fabricator.seed_preferred_audios()?;
        Ok(fabricator)
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    pub fn content(&self) -> &'a ContentStore {
        self.content
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    pub fn template_config(&self) -> &TemplateConfig {
        &self.template_config
    }

    pub fn retrospective(&self) -> &Retrospective {
        &self.retrospective
    }

    pub fn segment_id(&self) -> SegmentId {
        self.segment_id
    }

    pub fn rng(&mut self) -> &mut SeededRng {
        &mut self.rng
    }

    pub fn ids(&mut self) -> &mut IdGenerator {
        &mut self.ids
    }

    pub fn output_frame_rate(&self) -> f64 {
        self.output_frame_rate
    }

    pub fn output_channels(&self) -> u32 {
        self.output_channels
    }

    pub fn segment(&self) -> Result<Segment, FabricationError> {
        self.store
            .read_segment(self.segment_id)
            .cloned()
            .ok_or_else(|| FabricationError::not_found(self.segment_id.to_string()))
    }

    pub fn update_segment(&mut self, segment: Segment) -> Result<(), FabricationError> {
        self.store.update_segment(segment)
    }

    pub fn is_initial_segment(&self) -> bool {
        self.segment_id.0 == 0
    }

    // -----------------------------------------------------------------------
    // Segment type
    // -----------------------------------------------------------------------

    /// The segment type: the override, else the resolved type, memoised.
    pub fn segment_type(&mut self) -> Result<SegmentType, FabricationError> {
        if let Some(t) = self.segment_type {
            return Ok(t);
        }
        let t = self.compute_type()?;
        self.segment_type = Some(t);
        Ok(t)
    }

    /// Classify this segment against the previous one's macro and main
    /// choices.
    pub fn compute_type(&self) -> Result<SegmentType, FabricationError> {
        if let Some(t) = self.type_override {
            return Ok(t);
        }
        if self.is_initial_segment() {
            return Ok(SegmentType::Initial);
        }
        let Some(previous_main) = self.retrospective.previous_choice_of_type(ProgramType::Main)
        else {
            debug!(segment_id = self.segment_id.0, "no previous main choice, starting next macro");
            return Ok(SegmentType::NextMacro);
        };
        let previous_delta = self
            .retrospective
            .previous_segment()
            .map(|s| s.delta)
            .unwrap_or(0);
        let resolved = if self.has_more_sequence_binding_offsets(previous_main, 1)
            && self.template_config.main_program_length_max_delta > previous_delta
        {
            SegmentType::Continue
        } else if self
            .retrospective
            .previous_choice_of_type(ProgramType::Macro)
            .is_some_and(|m| {
                let lookahead = self.template_config.next_macro_lookahead as usize;
                self.has_more_sequence_binding_offsets(m, lookahead)
            })
        {
            SegmentType::NextMain
        } else {
            SegmentType::NextMacro
        };
        debug!(segment_id = self.segment_id.0, segment_type = %resolved, "resolved segment type");
        Ok(resolved)
    }

    /// True for segment types that keep the previous macro program.
    pub fn is_continuation_of_macro_program(&mut self) -> Result<bool, FabricationError> {
        Ok(matches!(self.segment_type()?, SegmentType::Continue | SegmentType::NextMain))
    }

    // -----------------------------------------------------------------------
    // Timing
    // -----------------------------------------------------------------------

    /// Microseconds from the segment start to beat `position`, with the
    /// tempo ramping linearly from the previous segment's tempo at beat 0
    /// to `tempo` at the segment's last beat, and holding after that.
    pub fn segment_micros_at_position(
        &self,
        tempo: f64,
        position: f64,
    ) -> Result<i64, FabricationError> {
        if tempo <= 0.0 {
            return Err(FabricationError::Configuration {
                subject: self.segment_id.to_string(),
                reason: format!("tempo must be positive, got {tempo}"),
            });
        }
        let total = self.segment()?.total as f64;
        let start = self
            .retrospective
            .previous_segment()
            .map(|s| s.tempo)
            .filter(|t| *t > 0.0)
            .unwrap_or(tempo);
        Ok(ramp_micros(start, tempo, total, position.max(0.0)).round() as i64)
    }

    pub fn total_segment_micros(&self) -> Result<i64, FabricationError> {
        let segment = self.segment()?;
        self.segment_micros_at_position(segment.tempo, segment.total as f64)
    }

    // -----------------------------------------------------------------------
    // Chords and voicings
    // -----------------------------------------------------------------------

    /// Chords placed in this segment, by position.
    pub fn chords(&self) -> Vec<SegmentChord> {
        let mut chords: Vec<SegmentChord> = self
            .store
            .read_all::<SegmentChord>(self.segment_id)
            .into_iter()
            .cloned()
            .collect();
        chords.sort_by(|a, b| a.position.total_cmp(&b.position).then(a.id.cmp(&b.id)));
        chords
    }

    /// The latest chord at or before `position`, else the first chord, else
    /// an unsaved chord named after the segment key.
    pub fn chord_at(&self, position: f64) -> Result<SegmentChord, FabricationError> {
        let chords = self.chords();
        if let Some(chord) = chords.iter().rev().find(|c| c.position <= position) {
            return Ok(chord.clone());
        }
        if let Some(first) = chords.first() {
            return Ok(first.clone());
        }
        let segment = self.segment()?;
        Ok(SegmentChord {
            segment_id: self.segment_id,
            name: Chord::of(&segment.key).name().to_string(),
            ..Default::default()
        })
    }

    pub fn voicings(&self) -> Vec<SegmentChordVoicing> {
        self.store
            .read_all::<SegmentChordVoicing>(self.segment_id)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn voicings_of_chord(&self, chord_id: SegmentChordId) -> Vec<SegmentChordVoicing> {
        self.voicings()
            .into_iter()
            .filter(|v| v.segment_chord_id == chord_id)
            .collect()
    }

    /// A random voicing of `type_` for the chord, among those with notes.
    pub fn choose_voicing(
        &mut self,
        chord_id: SegmentChordId,
        type_: InstrumentType,
    ) -> Option<SegmentChordVoicing> {
        let candidates: Vec<SegmentChordVoicing> = self
            .voicings_of_chord(chord_id)
            .into_iter()
            .filter(|v| v.type_ == type_ && v.contains_any_valid_notes())
            .collect();
        quick_pick(&candidates, &mut self.rng)
    }

    pub fn distinct_chord_voicing_types(&self) -> BTreeSet<InstrumentType> {
        self.voicings().iter().map(|v| v.type_).collect()
    }

    /// Range of every voicing note of `type_` in this segment.
    pub fn program_voicing_note_range(&self, type_: InstrumentType) -> NoteRange {
        let notes: Vec<Note> = self
            .voicings()
            .iter()
            .filter(|v| v.type_ == type_)
            .flat_map(|v| v.valid_notes())
            .collect();
        NoteRange::of_notes(&notes)
    }

    /// One chord per position of a sequence: where several chords share a
    /// position, the one whose voicings hold the most notes.
    pub fn program_sequence_chords(
        &self,
        sequence_id: ProgramSequenceId,
    ) -> Vec<&'a ProgramSequenceChord> {
        let content = self.content;
        let mut kept: Vec<(&'a ProgramSequenceChord, usize)> = Vec::new();
        for chord in content.chords_of_sequence(sequence_id) {
            let notes: usize = content
                .voicings_of_chord(chord.id)
                .iter()
                .map(|v| csv_values(&v.notes).len())
                .sum();
            match kept.last_mut() {
                Some((held, held_notes)) if held.position == chord.position => {
                    if notes > *held_notes {
                        *held = chord;
                        *held_notes = notes;
                    }
                }
                _ => kept.push((chord, notes)),
            }
        }
        kept.into_iter().map(|(c, _)| c).collect()
    }

    /// The voicing note of the chord root nearest the middle of the
    /// voicing's range.
    pub fn root_note_mid_range(&self, voicing_notes: &str, chord: &Chord) -> Option<Note> {
        let values = csv_values(voicing_notes);
        NoteRange::of_strings(values.iter().map(String::as_str)).note_nearest_median(chord.root())
    }

    // -----------------------------------------------------------------------
    // Keys, ranges, transposition
    // -----------------------------------------------------------------------

    /// The chosen sequence's key, else its program's key.
    pub fn key_for_choice(&self, choice: &SegmentChoice) -> Result<String, FabricationError> {
        if let Some(sequence) = self.program_sequence(choice)
            && !sequence.key.trim().is_empty()
        {
            return Ok(sequence.key.clone());
        }
        let program_id = choice
            .program_id
            .ok_or_else(|| {
                FabricationError::not_found(format!("program of choice {}", choice.id))
            })?;
        self.content
            .get::<Program>(program_id)
            .map(|p| p.key.clone())
            .ok_or_else(|| FabricationError::not_found(program_id.to_string()))
    }

    /// Semitones to move material written over `from` so it fits `to`. Bass
    /// follows the target's bass note; every other type follows the root.
    pub fn program_target_shift(&self, type_: InstrumentType, from: &Chord, to: &Chord) -> i32 {
        if from.is_no_chord() || to.is_no_chord() {
            return 0;
        }
        let target = if type_ == InstrumentType::Bass { to.bass() } else { to.root() };
        pitch_class_shift(from.root(), target)
    }

    /// Range of tonal notes used by a program's events in voices of
    /// `type_`.
    pub fn program_range(&self, program_id: ProgramId, type_: InstrumentType) -> NoteRange {
        let content = self.content;
        let mut range = NoteRange::empty();
        for event in content.events_of_program(program_id) {
            if content.voice_of_event(event).is_none_or(|v| v.type_ != type_) {
                continue;
            }
            for tone in csv_values(&event.tones) {
                let note = Note::of(&tone);
                if !note.is_atonal() {
                    range.expand_note(note);
                }
            }
        }
        range
    }

    /// Octaves to move `source` into `target` for an instrument type.
    pub fn program_range_shift_octaves(
        &self,
        type_: InstrumentType,
        source: &NoteRange,
        target: &NoteRange,
    ) -> i32 {
        match type_ {
            InstrumentType::Bass => NoteRange::lowest_optimal_range_shift_octaves(source, target),
            InstrumentType::Drum => 0,
            _ => NoteRange::median_optimal_range_shift_octaves(source, target),
        }
    }

    // -----------------------------------------------------------------------
    // Sequence navigation
    // -----------------------------------------------------------------------

    fn binding_of_choice(&self, choice: &SegmentChoice) -> Option<&'a ProgramSequenceBinding> {
        choice
            .program_sequence_binding_id
            .and_then(|id| self.content.get::<ProgramSequenceBinding>(id))
    }

    /// The sequence a choice plays: direct, or through its binding.
    pub fn program_sequence(&self, choice: &SegmentChoice) -> Option<&'a ProgramSequence> {
        let content = self.content;
        choice
            .program_sequence_id
            .and_then(|id| content.get::<ProgramSequence>(id))
            .or_else(|| {
                self.binding_of_choice(choice)
                    .and_then(|b| content.sequence_of_binding(b))
            })
    }

    pub fn sequence_binding_offset_for_choice(&self, choice: &SegmentChoice) -> i32 {
        self.binding_of_choice(choice).map(|b| b.offset).unwrap_or(0)
    }

    /// The smallest available offset after the choice's, else 0.
    pub fn next_sequence_binding_offset(&self, choice: &SegmentChoice) -> i32 {
        let Some(program_id) = choice.program_id else {
            return 0;
        };
        let current = self.sequence_binding_offset_for_choice(choice);
        self.content
            .available_offsets(program_id)
            .into_iter()
            .find(|o| *o > current)
            .unwrap_or(0)
    }

    /// The second available offset of a program, else its first, else 0.
    pub fn second_macro_sequence_binding_offset(&self, program_id: ProgramId) -> i32 {
        let offsets = self.content.available_offsets(program_id);
        offsets.get(1).or(offsets.first()).copied().unwrap_or(0)
    }

    /// Whether at least `n` more offsets follow the choice's binding.
    pub fn has_more_sequence_binding_offsets(&self, choice: &SegmentChoice, n: usize) -> bool {
        let (Some(program_id), Some(binding)) = (choice.program_id, self.binding_of_choice(choice))
        else {
            return false;
        };
        let offsets = self.content.available_offsets(program_id);
        offsets
            .iter()
            .position(|o| *o == binding.offset)
            .is_some_and(|index| index + n < offsets.len())
    }

    pub fn randomly_selected_sequence(
        &mut self,
        program_id: ProgramId,
    ) -> Option<&'a ProgramSequence> {
        let sequences = self.content.sequences_of_program(program_id);
        quick_pick(&sequences, &mut self.rng)
    }

    /// A random binding at `offset`, or at the nearest offset the program
    /// has.
    pub fn randomly_selected_sequence_binding_at_offset(
        &mut self,
        program_id: ProgramId,
        offset: i32,
    ) -> Option<&'a ProgramSequenceBinding> {
        let bindings = self.content.bindings_at_offset_of_program(program_id, offset, true);
        quick_pick(&bindings, &mut self.rng)
    }

    /// A random pattern of the sequence for the voice, falling back to any
    /// pattern of that voice.
    pub fn randomly_selected_pattern_of_sequence_by_voice_and_type(
        &mut self,
        sequence_id: ProgramSequenceId,
        voice_id: ProgramVoiceId,
    ) -> Option<&'a ProgramSequencePattern> {
        let content = self.content;
        let mut patterns = content.patterns_of_sequence_and_voice(sequence_id, voice_id);
        if patterns.is_empty() {
            patterns = content.patterns_of_voice(voice_id);
        }
        quick_pick(&patterns, &mut self.rng)
    }

    // -----------------------------------------------------------------------
    // Binding and config checks
    // -----------------------------------------------------------------------

    pub fn is_directly_bound_program(&self, program_id: ProgramId) -> bool {
        self.bound_program_ids.contains(&program_id)
    }

    pub fn is_directly_bound_instrument(&self, instrument_id: InstrumentId) -> bool {
        self.bound_instrument_ids.contains(&instrument_id)
    }

    pub fn is_directly_bound_audio(&self, audio: &InstrumentAudio) -> bool {
        self.is_directly_bound_instrument(audio.instrument_id)
    }

    pub fn program_config(
        &mut self,
        program_id: ProgramId,
    ) -> Result<ProgramConfig, FabricationError> {
        if let Some(config) = self.program_configs.get(&program_id) {
            return Ok(config.clone());
        }
        let program = self
            .content
            .get::<Program>(program_id)
            .ok_or_else(|| FabricationError::not_found(program_id.to_string()))?;
        let config = ProgramConfig::parse(&program.config)?;
        self.program_configs.insert(program_id, config.clone());
        Ok(config)
    }

    pub fn instrument_config(
        &mut self,
        instrument_id: InstrumentId,
    ) -> Result<InstrumentConfig, FabricationError> {
        if let Some(config) = self.instrument_configs.get(&instrument_id) {
            return Ok(config.clone());
        }
        let instrument = self
            .content
            .get::<Instrument>(instrument_id)
            .ok_or_else(|| FabricationError::not_found(instrument_id.to_string()))?;
        let config = InstrumentConfig::parse(&instrument.config)?;
        self.instrument_configs.insert(instrument_id, config.clone());
        Ok(config)
    }

    /// Config of this segment's main program; defaults before one is
    /// chosen.
    pub fn current_main_program_config(&mut self) -> Result<ProgramConfig, FabricationError> {
        match self.current_choice_of_type(ProgramType::Main).and_then(|c| c.program_id) {
            Some(program_id) => self.program_config(program_id),
            None => Ok(ProgramConfig::default()),
        }
    }

    /// One-shot, unless the instrument observes the length of `track`.
    pub fn is_one_shot(
        &mut self,
        instrument_id: InstrumentId,
        track: Option<&str>,
    ) -> Result<bool, FabricationError> {
        let config = self.instrument_config(instrument_id)?;
        Ok(config.is_one_shot && track.is_none_or(|t| !config.observes_length_of(t)))
    }

    pub fn is_one_shot_cutoff_enabled(
        &mut self,
        instrument_id: InstrumentId,
    ) -> Result<bool, FabricationError> {
        Ok(self.instrument_config(instrument_id)?.is_one_shot_cutoff_enabled)
    }

    // -----------------------------------------------------------------------
    // Continuity
    // -----------------------------------------------------------------------

    fn continued_choices(&mut self) -> Result<Vec<SegmentChoice>, FabricationError> {
        if self.segment_type()? != SegmentType::Continue {
            return Ok(Vec::new());
        }
        Ok(self.retrospective.previous_choices().into_iter().cloned().collect())
    }

    /// The previous choice for a voice with the same name and type.
    pub fn choice_if_continued_voice(
        &mut self,
        voice: &ProgramVoice,
    ) -> Result<Option<SegmentChoice>, FabricationError> {
        let content = self.content;
        Ok(self.continued_choices()?.into_iter().find(|c| {
            c.program_voice_id
                .and_then(|id| content.get::<ProgramVoice>(id))
                .is_some_and(|v| v.name == voice.name && v.type_ == voice.type_)
        }))
    }

    pub fn choice_if_continued_instrument_type(
        &mut self,
        type_: InstrumentType,
    ) -> Result<Option<SegmentChoice>, FabricationError> {
        Ok(self
            .continued_choices()?
            .into_iter()
            .find(|c| c.instrument_type == Some(type_)))
    }

    pub fn choice_if_continued_type_mode(
        &mut self,
        type_: InstrumentType,
        mode: InstrumentMode,
    ) -> Result<Option<SegmentChoice>, FabricationError> {
        Ok(self
            .continued_choices()?
            .into_iter()
            .find(|c| c.instrument_type == Some(type_) && c.instrument_mode == Some(mode)))
    }

    pub fn choices_if_continued(
        &mut self,
        program_type: ProgramType,
    ) -> Result<Vec<SegmentChoice>, FabricationError> {
        Ok(self
            .continued_choices()?
            .into_iter()
            .filter(|c| c.program_type == Some(program_type))
            .collect())
    }

    fn preferred_key(parent: &str, ident: &str) -> String {
        format!("{parent}__{ident}")
    }

    pub fn preferred_audio(&self, parent: &str, ident: &str) -> Option<InstrumentAudioId> {
        self.preferred_audios
            .get(&Self::preferred_key(parent, ident))
            .copied()
    }

    pub fn put_preferred_audio(&mut self, parent: &str, ident: &str, audio_id: InstrumentAudioId) {
        self.preferred_audios
            .insert(Self::preferred_key(parent, ident), audio_id);
    }

    /// Remember every audio the retained lineage picked, under the same
    /// keys the event and chord selectors use.
    fn seed_preferred_audios(&mut self) -> Result<(), FabricationError> {
        let instrument_ids: BTreeSet<InstrumentId> = self
            .retrospective
            .picks()
            .into_iter()
            .filter_map(|pick| self.retrospective.choice_of_pick(pick))
            .filter_map(|choice| choice.instrument_id)
            .collect();
        let mut multiphonic = BTreeMap::new();
        for id in instrument_ids {
            multiphonic.insert(id, self.instrument_config(id)?.is_multiphonic);
        }

        let content = self.content;
        let mut seeds = Vec::new();
        for pick in self.retrospective.picks() {
            let Some(choice) = self.retrospective.choice_of_pick(pick) else {
                continue;
            };
            match pick
                .program_sequence_pattern_event_id
                .and_then(|id| content.get::<ProgramSequencePatternEvent>(id))
            {
                Some(event) => {
                    let is_multiphonic = choice
                        .instrument_id
                        .and_then(|id| multiphonic.get(&id).copied())
                        .unwrap_or(false);
                    let ident = if is_multiphonic { &pick.tones } else { &event.tones };
                    seeds.push((
                        event.program_voice_track_id.uuid().to_string(),
                        ident.clone(),
                        pick.instrument_audio_id,
                    ));
                }
                None => {
                    if let Some(instrument_id) = choice.instrument_id {
                        seeds.push((
                            instrument_id.uuid().to_string(),
                            pick.tones.clone(),
                            pick.instrument_audio_id,
                        ));
                    }
                }
            }
        }
        for (parent, ident, audio) in seeds {
            self.put_preferred_audio(&parent, &ident, audio);
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Memes and isometry
    // -----------------------------------------------------------------------

    pub fn meme_names(&self) -> BTreeSet<String> {
        self.store
            .read_all::<SegmentMeme>(self.segment_id)
            .iter()
            .map(|m| m.name.clone())
            .collect()
    }

    pub fn meme_isometry_of_segment(&self) -> MemeIsometry {
        let names = self.meme_names();
        MemeIsometry::of(&self.template_config.meme_taxonomy, names.iter().map(String::as_str))
    }

    /// Memes of the previous macro program plus those of its bindings at
    /// the offset after the one it last played.
    pub fn meme_isometry_of_next_sequence_in_previous_macro(&self) -> MemeIsometry {
        let Some(previous_macro) = self.retrospective.previous_choice_of_type(ProgramType::Macro)
        else {
            return MemeIsometry::none();
        };
        let Some(program_id) = previous_macro.program_id else {
            return MemeIsometry::none();
        };
        let content = self.content;
        let mut memes = content.meme_names_of_program(program_id);
        let next_offset = self.sequence_binding_offset_for_choice(previous_macro) + 1;
        for binding in content.bindings_at_offset_of_program(program_id, next_offset, true) {
            memes.extend(content.meme_names_of_sequence_binding(binding.id));
        }
        MemeIsometry::of(&self.template_config.meme_taxonomy, memes.iter().map(String::as_str))
    }

    /// Add a meme unless the segment already carries it.
    pub fn put_meme(&mut self, name: &str) -> Result<(), FabricationError> {
        let name = to_meme(name);
        if name.is_empty() || self.meme_names().contains(&name) {
            return Ok(());
        }
        let meme = SegmentMeme {
            id: SegmentMemeId::generate(&mut self.ids),
            segment_id: self.segment_id,
            name,
        };
        self.store.put(meme)?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Choices, arrangements, picks, chords
    // -----------------------------------------------------------------------

    pub fn choices(&self) -> Vec<SegmentChoice> {
        self.store
            .read_all::<SegmentChoice>(self.segment_id)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn current_choice_of_type(&self, program_type: ProgramType) -> Option<SegmentChoice> {
        self.store.read_choice(self.segment_id, program_type).cloned()
    }

    /// Store a choice and the memes of its program, binding and instrument.
    /// Unless `force`d, a choice whose memes would break the taxonomy
    /// against the segment's memes is refused.
    pub fn put_choice(
        &mut self,
        mut choice: SegmentChoice,
        force: bool,
    ) -> Result<SegmentChoice, FabricationError> {
        if choice.id.is_nil() {
            choice.id = SegmentChoiceId::generate(&mut self.ids);
        }
        choice.segment_id = self.segment_id;

        let content = self.content;
        let mut names = BTreeSet::new();
        if let Some(id) = choice.program_id {
            names.extend(content.meme_names_of_program(id));
        }
        if let Some(id) = choice.program_sequence_binding_id {
            names.extend(content.meme_names_of_sequence_binding(id));
        }
        if let Some(id) = choice.instrument_id {
            names.extend(content.meme_names_of_instrument(id));
        }

        if !force && !self.meme_isometry_of_segment().is_allowed(names.iter().map(String::as_str)) {
            let memes = names.iter().cloned().collect::<Vec<_>>().join(", ");
            self.add_message(
                SegmentMessageType::Warning,
                &format!("Refused choice ({}) with memes [{memes}]", choice.describe()),
            )?;
            return Err(FabricationError::TaxonomyViolation { memes });
        }
        for name in &names {
            self.put_meme(name)?;
        }
        self.store.put(choice.clone())?;
        Ok(choice)
    }

    pub fn arrangements(&self) -> Vec<SegmentChoiceArrangement> {
        self.store
            .read_all::<SegmentChoiceArrangement>(self.segment_id)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn put_arrangement(
        &mut self,
        choice_id: SegmentChoiceId,
        pattern_id: Option<ProgramSequencePatternId>,
    ) -> Result<SegmentChoiceArrangement, FabricationError> {
        let arrangement = SegmentChoiceArrangement {
            id: SegmentChoiceArrangementId::generate(&mut self.ids),
            segment_id: self.segment_id,
            segment_choice_id: choice_id,
            program_sequence_pattern_id: pattern_id,
        };
        self.store.put(arrangement.clone())?;
        Ok(arrangement)
    }

    pub fn picks(&self) -> Vec<SegmentChoiceArrangementPick> {
        self.store
            .read_all::<SegmentChoiceArrangementPick>(self.segment_id)
            .into_iter()
            .cloned()
            .collect()
    }

    pub fn put_pick(
        &mut self,
        mut pick: SegmentChoiceArrangementPick,
    ) -> Result<SegmentChoiceArrangementPick, FabricationError> {
        if pick.id.is_nil() {
            pick.id = SegmentChoiceArrangementPickId::generate(&mut self.ids);
        }
        pick.segment_id = self.segment_id;
        self.store.put(pick.clone())?;
        Ok(pick)
    }

    pub fn update_pick(
        &mut self,
        pick: SegmentChoiceArrangementPick,
    ) -> Result<(), FabricationError> {
        self.store.put(pick)?;
        Ok(())
    }

    pub fn delete_pick(
        &mut self,
        id: SegmentChoiceArrangementPickId,
    ) -> Result<(), FabricationError> {
        self.store
            .delete::<SegmentChoiceArrangementPick>(self.segment_id, id)?;
        Ok(())
    }

    pub fn put_chord(
        &mut self,
        name: &str,
        position: f64,
    ) -> Result<SegmentChord, FabricationError> {
        let chord = SegmentChord {
            id: SegmentChordId::generate(&mut self.ids),
            segment_id: self.segment_id,
            name: Chord::of(name).name().to_string(),
            position,
        };
        self.store.put(chord.clone())?;
        Ok(chord)
    }

    pub fn put_voicing(
        &mut self,
        chord_id: SegmentChordId,
        type_: InstrumentType,
        notes: &str,
    ) -> Result<SegmentChordVoicing, FabricationError> {
        let voicing = SegmentChordVoicing {
            id: SegmentChordVoicingId::generate(&mut self.ids),
            segment_id: self.segment_id,
            segment_chord_id: chord_id,
            type_,
            notes: notes.to_string(),
        };
        self.store.put(voicing.clone())?;
        Ok(voicing)
    }

    // -----------------------------------------------------------------------
    // Meta, sticky buns
    // -----------------------------------------------------------------------

    pub fn meta(&self, key: &str) -> Option<SegmentMeta> {
        self.store
            .read_all::<SegmentMeta>(self.segment_id)
            .into_iter()
            .find(|m| m.key == key)
            .cloned()
    }

    /// Set a meta value, replacing any earlier value under the same key.
    pub fn put_meta(&mut self, key: &str, value: &str) -> Result<(), FabricationError> {
        let id = match self.meta(key) {
            Some(existing) => existing.id,
            None => SegmentMetaId::generate(&mut self.ids),
        };
        self.store.put(SegmentMeta {
            id,
            segment_id: self.segment_id,
            key: key.to_string(),
            value: value.to_string(),
        })?;
        Ok(())
    }

    /// The sticky bun for a pattern event: this segment's, else the previous
    /// segment's (carried forward), else a fresh one. `None` when sticky
    /// buns are disabled.
    pub fn sticky_bun(
        &mut self,
        event_id: ProgramSequencePatternEventId,
        size: usize,
    ) -> Result<Option<StickyBun>, FabricationError> {
        if !self.template_config.sticky_bun_enabled {
            return Ok(None);
        }
        let key = StickyBun::meta_key_of(event_id);
        if let Some(meta) = self.meta(&key) {
            return Ok(Some(StickyBun::from_json(&meta.value)?));
        }
        let bun = match self.retrospective.previous_meta(&key) {
            Some(meta) => StickyBun::from_json(&meta.value)?,
            None => StickyBun::generate(event_id, size.max(1), &mut self.rng),
        };
        self.put_meta(&key, &bun.to_json()?)?;
        Ok(Some(bun))
    }

    // -----------------------------------------------------------------------
    // Messages and reports
    // -----------------------------------------------------------------------

    pub fn add_message(
        &mut self,
        type_: SegmentMessageType,
        body: &str,
    ) -> Result<(), FabricationError> {
        match type_ {
            SegmentMessageType::Error => error!(segment_id = self.segment_id.0, "{body}"),
            SegmentMessageType::Warning => warn!(segment_id = self.segment_id.0, "{body}"),
            SegmentMessageType::Debug | SegmentMessageType::Info => {}
        }
        let message = SegmentMessage {
            id: SegmentMessageId::generate(&mut self.ids),
            segment_id: self.segment_id,
            type_,
            body: body.to_string(),
        };
        self.store.put(message)?;
        Ok(())
    }

    pub fn add_error_message(&mut self, body: &str) -> Result<(), FabricationError> {
        self.add_message(SegmentMessageType::Error, body)
    }

    pub fn add_warning_message(&mut self, body: &str) -> Result<(), FabricationError> {
        self.add_message(SegmentMessageType::Warning, body)
    }

    pub fn add_info_message(&mut self, body: &str) -> Result<(), FabricationError> {
        self.add_message(SegmentMessageType::Info, body)
    }

    /// Record a structured report as a Debug message `key: {json}`.
    pub fn put_report(&mut self, key: &str, report: Value) -> Result<(), FabricationError> {
        debug!(segment_id = self.segment_id.0, key, %report, "report");
        self.add_message(SegmentMessageType::Debug, &format!("{key}: {report}"))
    }

    pub fn messages(&self) -> Vec<SegmentMessage> {
        self.store
            .read_all::<SegmentMessage>(self.segment_id)
            .into_iter()
            .cloned()
            .collect()
    }

    // -----------------------------------------------------------------------
    // Ship key
    // -----------------------------------------------------------------------

    pub fn compute_ship_key(chain: &Chain, segment: &Segment) -> String {
        let prefix = if chain.ship_key.trim().is_empty() {
            format!("chain-{}", chain.id.uuid())
        } else {
            chain.ship_key.trim().to_string()
        };
        format!("{prefix}-{}", segment.begin_at_chain_micros)
    }

    pub fn ensure_ship_key(&mut self) -> Result<(), FabricationError> {
        let mut segment = self.segment()?;
        if segment.storage_key.trim().is_empty() {
            segment.storage_key = Self::compute_ship_key(&self.chain, &segment);
            self.update_segment(segment)?;
        }
        Ok(())
    }
}

/// Microseconds to beat `position` under a tempo ramp from `start` to `end`
/// bpm over `total` beats, holding `end` afterwards.
fn ramp_micros(start: f64, end: f64, total: f64, position: f64) -> f64 {
    if total <= 0.0 {
        return MICROS_PER_MINUTE * position / end;
    }
    let ramped = position.min(total);
    let slope = (end - start) / total;
    let within = if slope.abs() < FLAT_RAMP_EPSILON {
        MICROS_PER_MINUTE * ramped / start
    } else {
        MICROS_PER_MINUTE / slope * ((start + slope * ramped) / start).ln()
    };
    within + MICROS_PER_MINUTE * (position - ramped) / end
}

/// Shortest signed move between pitch classes, in `(-6, 6]`.
fn pitch_class_shift(from: PitchClass, to: PitchClass) -> i32 {
    match (from.semitone(), to.semitone()) {
        (Some(a), Some(b)) => {
            let up = (b - a).rem_euclid(12);
            if up > 6 { up - 12 } else { up }
        }
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::SegmentState;
    use ostinato_content::ContentBuilder;

    struct Setup {
        content: ContentStore,
        store: SegmentStore,
        main: ProgramId,
        sequence: ProgramSequenceId,
    }

    fn setup(config: &str) -> Setup {
        let mut b = ContentBuilder::new(31);
        let project = b.project("P");
        let library = b.library(project, "L");
        let template = b.template(project, "T", "t", config);
        b.bind_library(template, library);
        let main = b.program(library, ProgramType::Main, "Main", "C", 120.0);
        b.program_meme(main, "Winter");
        let bass = b.voice(main, InstrumentType::Bass, "Bass");
        let pad = b.voice(main, InstrumentType::Pad, "Pad");
        let sequence = b.sequence(main, "A", "", 8, 0.5);
        for offset in [0, 3, 7] {
            b.sequence_binding(sequence, offset);
        }
        let thin = b.chord(sequence, "C", 0.0);
        b.voicing(thin, pad, "C4");
        let thick = b.chord(sequence, "C", 0.0);
        b.voicing(thick, pad, "C4, E4, G4");
        b.voicing(thick, bass, "C2");
        b.chord(sequence, "G", 4.0);
        let track = b.track(bass, "BASS");
        let pattern = b.pattern(sequence, bass, "Line", 4);
        b.event(pattern, track, 0.0, 1.0, "C2, G2");
        b.event(pattern, track, 1.0, 1.0, "X");
        let content = b.build();

        let mut ids = IdGenerator::new(8);
        let mut store = SegmentStore::new();
        store
            .put_chain(Chain {
                id: ChainId::generate(&mut ids),
                template_id: template,
                config: config.to_string(),
                ..Default::default()
            })
            .unwrap();
        let chain_id = store.chain().unwrap().id;
        store
            .create_segment(Segment {
                id: SegmentId(0),
                chain_id,
                state: SegmentState::Crafting,
                key: "C".to_string(),
                total: 8,
                tempo: 120.0,
                ..Default::default()
            })
            .unwrap();
        Setup {
            content,
            store,
            main,
            sequence,
        }
    }

    fn params() -> FabricatorParams {
        FabricatorParams {
            segment_id: SegmentId(0),
            seed: 99,
            output_frame_rate: 48_000.0,
            output_channels: 2,
            type_override: None,
        }
    }

    fn fabricator<'a>(content: &'a ContentStore, store: &'a mut SegmentStore) -> Fabricator<'a> {
        Fabricator::new(content, store, Retrospective::empty(), params()).unwrap()
    }

    #[test]
    fn first_segment_is_initial() {
        let mut s = setup("");
        let mut fab = fabricator(&s.content, &mut s.store);
        assert_eq!(fab.segment_type().unwrap(), SegmentType::Initial);
    }

    #[test]
    fn override_wins_over_computed_type() {
        let mut s = setup("");
        let mut p = params();
        p.type_override = Some(SegmentType::NextMain);
        let mut fab = Fabricator::new(&s.content, &mut s.store, Retrospective::empty(), p).unwrap();
        assert_eq!(fab.segment_type().unwrap(), SegmentType::NextMain);
    }

    #[test]
    fn flat_tempo_micros() {
        let mut s = setup("");
        let fab = fabricator(&s.content, &mut s.store);
        assert_eq!(fab.segment_micros_at_position(120.0, 4.0).unwrap(), 2_000_000);
        assert_eq!(fab.total_segment_micros().unwrap(), 4_000_000);
        assert!(fab.segment_micros_at_position(0.0, 1.0).is_err());
    }

    #[test]
    fn tempo_ramp_differs_from_flat() {
        // 120 -> 240 over 8 beats: 60e6 / 15 * ln(2) microseconds.
        let ramped = ramp_micros(120.0, 240.0, 8.0, 8.0);
        let expected = 4_000_000.0 * std::f64::consts::LN_2;
        assert!((ramped - expected).abs() < 1.0, "{ramped}");
        let flat = MICROS_PER_MINUTE * 8.0 / 240.0;
        assert!((ramped - flat).abs() > 100_000.0);
        // Past the end the tempo holds at 240.
        assert!((ramp_micros(120.0, 240.0, 8.0, 9.0) - ramped - 250_000.0).abs() < 1.0);
    }

    #[test]
    fn ghost_chords_keep_most_notes() {
        let mut s = setup("");
        let fab = fabricator(&s.content, &mut s.store);
        let chords = fab.program_sequence_chords(s.sequence);
        assert_eq!(chords.len(), 2);
        let kept = s.content.voicings_of_chord(chords[0].id);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn chord_at_falls_back_to_key_then_first() {
        let mut s = setup("");
        let mut fab = fabricator(&s.content, &mut s.store);
        assert_eq!(fab.chord_at(3.0).unwrap().name, "C");
        assert!(fab.chord_at(3.0).unwrap().id.is_nil());
        fab.put_chord("Am", 2.0).unwrap();
        fab.put_chord("F", 6.0).unwrap();
        assert_eq!(fab.chord_at(0.0).unwrap().name, "Am");
        assert_eq!(fab.chord_at(5.9).unwrap().name, "Am");
        assert_eq!(fab.chord_at(6.0).unwrap().name, "F");
    }

    #[test]
    fn offsets_navigate_forward() {
        let mut s = setup("");
        let binding = s.content.bindings_at_offset_of_program(s.main, 3, false)[0].id;
        let fab = fabricator(&s.content, &mut s.store);
        let choice = SegmentChoice {
            program_id: Some(s.main),
            program_sequence_binding_id: Some(binding),
            ..Default::default()
        };
        assert_eq!(fab.next_sequence_binding_offset(&choice), 7);
        assert!(fab.has_more_sequence_binding_offsets(&choice, 1));
        assert!(!fab.has_more_sequence_binding_offsets(&choice, 2));
        assert_eq!(fab.second_macro_sequence_binding_offset(s.main), 3);
    }

    #[test]
    fn target_shift_follows_bass_note_for_bass() {
        let mut s = setup("");
        let fab = fabricator(&s.content, &mut s.store);
        let from = Chord::of("C");
        let to = Chord::of("Ab/C");
        assert_eq!(fab.program_target_shift(InstrumentType::Pad, &from, &to), -4);
        assert_eq!(fab.program_target_shift(InstrumentType::Bass, &from, &to), 0);
        assert_eq!(fab.program_target_shift(InstrumentType::Pad, &Chord::no_chord(), &to), 0);
    }

    #[test]
    fn program_range_skips_atonal_events() {
        let mut s = setup("");
        let fab = fabricator(&s.content, &mut s.store);
        let range = fab.program_range(s.main, InstrumentType::Bass);
        assert_eq!(range.low(), Some(Note::of("C2")));
        assert_eq!(range.high(), Some(Note::of("G2")));
        assert!(fab.program_range(s.main, InstrumentType::Pad).is_empty());
    }

    #[test]
    fn sticky_bun_is_idempotent_within_segment() {
        let mut s = setup("");
        let event = s.content.events_of_program(s.main)[1].id;
        let mut fab = fabricator(&s.content, &mut s.store);
        let first = fab.sticky_bun(event, 3).unwrap().unwrap();
        let second = fab.sticky_bun(event, 3).unwrap().unwrap();
        assert_eq!(first, second);
        assert!(fab.meta(&first.meta_key()).is_some());
    }

    #[test]
    fn sticky_bun_disabled_by_config() {
        let mut s = setup(r#"{"stickyBunEnabled": false}"#);
        let event = s.content.events_of_program(s.main)[1].id;
        let mut fab = fabricator(&s.content, &mut s.store);
        assert!(fab.sticky_bun(event, 3).unwrap().is_none());
    }

    #[test]
    fn taxonomy_violation_is_refused_unless_forced() {
        let mut s = setup("");
        let mut fab = fabricator(&s.content, &mut s.store);
        fab.put_meme("summer").unwrap();
        let choice = SegmentChoice {
            program_id: Some(s.main),
            program_type: Some(ProgramType::Main),
            ..Default::default()
        };
        let err = fab.put_choice(choice.clone(), false).unwrap_err();
        assert!(err.is_recoverable());
        assert!(fab.choices().is_empty());
        assert!(fab.messages().iter().any(|m| m.type_ == SegmentMessageType::Warning));

        fab.put_choice(choice, true).unwrap();
        assert!(fab.meme_names().contains("WINTER"));
        assert_eq!(fab.choices().len(), 1);
    }

    #[test]
    fn memes_are_deduplicated() {
        let mut s = setup("");
        let mut fab = fabricator(&s.content, &mut s.store);
        fab.put_meme("Dark").unwrap();
        fab.put_meme(" dark ").unwrap();
        assert_eq!(fab.meme_names().len(), 1);
    }

    #[test]
    fn ship_key_uses_chain_key_or_id() {
        let mut s = setup("");
        let mut fab = fabricator(&s.content, &mut s.store);
        fab.ensure_ship_key().unwrap();
        let segment = fab.segment().unwrap();
        assert!(segment.storage_key.starts_with("chain-"));
        assert!(segment.storage_key.ends_with("-0"));
        let keyed = Chain {
            ship_key: "radio".to_string(),
            ..fab.chain().clone()
        };
        assert_eq!(Fabricator::compute_ship_key(&keyed, &segment), "radio-0");
    }

    #[test]
    fn reports_become_debug_messages() {
        let mut s = setup("");
        let mut fab = fabricator(&s.content, &mut s.store);
        fab.put_report("choiceOfMainProgram", serde_json::json!({"1": {"a": 2}}))
            .unwrap();
        let messages = fab.messages();
        assert_eq!(messages[0].type_, SegmentMessageType::Debug);
        assert_eq!(messages[0].body, r#"choiceOfMainProgram: {"1":{"a":2}}"#);
    }
}
