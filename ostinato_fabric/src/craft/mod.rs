// Craft: the selection policies every craft pass shares.
//
// A `Craft` wraps the segment's `Fabricator` and adds the decisions that
// turn content into choices, arrangements and picks:
// - delta arcs: `precompute_deltas` staggers when layers enter, and
//   `in_bounds` gates each picked note against its choice's window
// - fresh choices: programs, instruments and audios are drawn from a
//   `MarbleBag` whose phases rank directly bound content above published
//   content and whose weights reward meme overlap with the segment
// - note events: patterns are laid end to end across the segment (or
//   restarted at each chord), events are voiced against the current chord,
//   and every voiced note becomes a pick of some instrument audio
// - chord parts and loops for chord-mode and loop-mode instruments
// - one-shot cutoffs once all picks of a choice are placed
//
// The passes built on top are `MacroMainCraft` (programs, harmony, segment
// timing), `BeatCraft` (the drum layer) and `DetailCraft` (everything else,
// by instrument type).
//
// **Critical constraint: determinism.** Every draw goes through the
// fabricator's `SeededRng` and every candidate set is ordered before it is
// drawn from.
//
// See also: `fabricator.rs`, `marble_bag.rs`, `sticky_bun.rs`.

pub mod beat;
pub mod detail;
pub mod macro_main;

pub use beat::BeatCraft;
pub use detail::DetailCraft;
pub use macro_main::MacroMainCraft;

use crate::enums::SegmentType;
use crate::error::FabricationError;
use crate::fabricator::Fabricator;
use crate::marble_bag::{MarbleBag, quick_pick};
use crate::segment::*;
use ostinato_content::enums::{
    InstrumentMode, InstrumentState, InstrumentType, ProgramState, ProgramType,
};
use ostinato_content::ids::*;
use ostinato_content::model::*;
use ostinato_content::ContentStore;
use ostinato_music::chord::ChordMatch;
use ostinato_music::note::ATONAL;
use ostinato_music::{Accidental, Chord, Note, NotePicker, NoteRange};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// Maps a choice to the delta-arc layer it belongs to.
pub type ChoiceIndex = fn(&ContentStore, &SegmentChoice) -> String;

/// A chord and the beats it holds, `[from, to)`.
#[derive(Clone, Debug)]
pub struct Section {
    pub chord: SegmentChord,
    pub from: f64,
    pub to: f64,
}

/// Fixed while one pattern is laid out.
struct PatternSpan<'a, 'c> {
    tempo: f64,
    instrument: &'a Instrument,
    choice: &'c SegmentChoice,
    arrangement_id: SegmentChoiceArrangementId,
    from: f64,
    to: f64,
    default_atonal: bool,
}

/// One voiced note waiting for an audio.
struct NotePick<'a> {
    note: String,
    instrument: &'a Instrument,
    event: &'a ProgramSequencePatternEvent,
    event_name: String,
    arrangement_id: SegmentChoiceArrangementId,
    start_at_segment_micros: i64,
    length_micros: Option<i64>,
    voicing_id: Option<SegmentChordVoicingId>,
    volume_ratio: f64,
}

/// Round `value` to the nearest multiple of `multiple`.
fn round_to_nearest(multiple: i32, value: i32) -> i32 {
    if multiple <= 0 {
        return value;
    }
    ((value as f64 / multiple as f64).round() as i32) * multiple
}

/// Whether `value` lies in `[floor, ceiling)`, with `DELTA_UNLIMITED`
/// lifting the limit on its side.
pub fn in_bounds(floor: i32, ceiling: i32, value: f64) -> bool {
    (floor == DELTA_UNLIMITED || value >= floor as f64)
        && (ceiling == DELTA_UNLIMITED || value < ceiling as f64)
}

pub struct Craft<'f, 'a> {
    pub(crate) fab: &'f mut Fabricator<'a>,
    delta_ins: BTreeMap<String, i32>,
    delta_outs: BTreeMap<String, i32>,
    choice_index: Option<ChoiceIndex>,
}

impl<'f, 'a> Craft<'f, 'a> {
    pub fn new(fab: &'f mut Fabricator<'a>) -> Self {
        Self {
            fab,
            delta_ins: BTreeMap::new(),
            delta_outs: BTreeMap::new(),
            choice_index: None,
        }
    }

    // -----------------------------------------------------------------------
    // Delta arcs
    // -----------------------------------------------------------------------

    /// The segment's own delta span, `[delta, delta + total)`.
    fn delta_span(&self) -> Result<(i32, i32), FabricationError> {
        let segment = self.fab.segment()?;
        Ok((segment.delta, segment.delta + segment.total as i32))
    }

    /// The choice's window opens inside this segment.
    pub fn is_intro_segment(&self, choice: &SegmentChoice) -> Result<bool, FabricationError> {
        let (start, end) = self.delta_span()?;
        Ok(choice.delta_in != DELTA_UNLIMITED && choice.delta_in >= start && choice.delta_in < end)
    }

    /// The choice's window closes inside this segment.
    pub fn is_outro_segment(&self, choice: &SegmentChoice) -> Result<bool, FabricationError> {
        let (start, end) = self.delta_span()?;
        Ok(choice.delta_out != DELTA_UNLIMITED
            && choice.delta_out <= end
            && choice.delta_out > start)
    }

    /// The choice's window misses this segment altogether.
    pub fn is_silent_entire_segment(
        &self,
        choice: &SegmentChoice,
    ) -> Result<bool, FabricationError> {
        let (start, end) = self.delta_span()?;
        Ok((choice.delta_out != DELTA_UNLIMITED && choice.delta_out <= start)
            || (choice.delta_in != DELTA_UNLIMITED && choice.delta_in >= end))
    }

    /// The choice's window covers this segment from start to end.
    pub fn is_active_entire_segment(
        &self,
        choice: &SegmentChoice,
    ) -> Result<bool, FabricationError> {
        let (start, end) = self.delta_span()?;
        Ok((choice.delta_in == DELTA_UNLIMITED || choice.delta_in <= start)
            && (choice.delta_out == DELTA_UNLIMITED || choice.delta_out >= end))
    }

    /// Assign a delta window to each layer.
    ///
    /// With delta arcs disabled every layer is unlimited. A segment that
    /// starts new material shuffles the layers (prioritised ones first) and
    /// staggers their entry in subsection-sized steps, `incoming` of them
    /// before the segment starts. A continued segment reuses the windows
    /// the retained choices already carry.
    pub fn precompute_deltas(
        &mut self,
        filter: fn(&SegmentChoice) -> bool,
        index: ChoiceIndex,
        layers: &[String],
        prioritize: &[String],
        incoming: u32,
    ) -> Result<(), FabricationError> {
        self.choice_index = Some(index);
        self.delta_ins.clear();
        self.delta_outs.clear();

        if !self.fab.template_config().delta_arc_enabled {
            for layer in layers {
                self.delta_ins.insert(layer.clone(), DELTA_UNLIMITED);
                self.delta_outs.insert(layer.clone(), DELTA_UNLIMITED);
            }
            return Ok(());
        }

        match self.fab.segment_type()? {
            SegmentType::Pending => {}
            SegmentType::Initial | SegmentType::NextMain | SegmentType::NextMacro => {
                let total = self.fab.segment()?.total;
                let units = self
                    .fab
                    .current_main_program_config()?
                    .bar()
                    .compute_subsection_beats(total) as i32;
                let searches: Vec<String> = prioritize.iter().map(|s| s.to_lowercase()).collect();
                let (mut primary, mut secondary): (Vec<String>, Vec<String>) =
                    layers.iter().cloned().partition(|layer| {
                        let name = layer.to_lowercase();
                        searches.iter().any(|s| name.contains(s.as_str()))
                    });
                self.fab.rng().shuffle(&mut primary);
                self.fab.rng().shuffle(&mut secondary);
                if !primary.is_empty() {
                    self.fab
                        .add_info_message(&format!("Prioritized {}", primary.join(", ")))?;
                }

                let draw = self.fab.rng().below((units * 4).max(0) as u64) as i32;
                let mut delta = round_to_nearest(units, draw - units * 2 * incoming as i32);
                for layer in primary.into_iter().chain(secondary) {
                    let delta_in = if delta > 0 { delta } else { DELTA_UNLIMITED };
                    self.delta_ins.insert(layer.clone(), delta_in);
                    self.delta_outs.insert(layer, DELTA_UNLIMITED);
                    let step = self.fab.rng().below((units * 5).max(0) as u64) as i32;
                    delta += round_to_nearest(units, step);
                }
            }
            SegmentType::Continue => {
                let content = self.fab.content();
                for choice in self.fab.retrospective().choices() {
                    if !filter(choice) {
                        continue;
                    }
                    let layer = index(content, choice);
                    if layers.contains(&layer) {
                        self.delta_ins.insert(layer.clone(), choice.delta_in);
                        self.delta_outs.insert(layer, choice.delta_out);
                    }
                }
            }
        }
        debug!(
            segment_id = self.fab.segment_id().0,
            ins = ?self.delta_ins,
            "precomputed delta arcs"
        );
        Ok(())
    }

    fn layer_of(&self, choice: &SegmentChoice) -> Option<String> {
        self.choice_index.map(|index| index(self.fab.content(), choice))
    }

    pub fn compute_delta_in(&self, choice: &SegmentChoice) -> i32 {
        self.layer_of(choice)
            .and_then(|layer| self.delta_ins.get(&layer).copied())
            .unwrap_or(DELTA_UNLIMITED)
    }

    pub fn compute_delta_out(&self, choice: &SegmentChoice) -> i32 {
        self.layer_of(choice)
            .and_then(|layer| self.delta_outs.get(&layer).copied())
            .unwrap_or(DELTA_UNLIMITED)
    }

    /// 1 when the note falls inside its choice's delta window (or delta arcs
    /// are off), else 0.
    pub fn compute_volume_ratio_for_picked_note(
        &self,
        choice: &SegmentChoice,
        position: f64,
    ) -> Result<f64, FabricationError> {
        if !self.fab.template_config().delta_arc_enabled {
            return Ok(1.0);
        }
        let delta = self.fab.segment()?.delta as f64;
        Ok(if in_bounds(choice.delta_in, choice.delta_out, delta + position) {
            1.0
        } else {
            0.0
        })
    }

    pub fn compute_mute(&mut self, type_: InstrumentType) -> bool {
        let probability = self.fab.template_config().choice_mute_probability(type_);
        self.fab.rng().random_bool(probability)
    }

    // -----------------------------------------------------------------------
    // Fresh choices
    // -----------------------------------------------------------------------

    /// A program of `program_type`, optionally one that has a voice of
    /// `voicing_type`. Directly bound programs outrank published ones.
    pub fn choose_fresh_program(
        &mut self,
        program_type: ProgramType,
        voicing_type: Option<InstrumentType>,
    ) -> Result<Option<&'a Program>, FabricationError> {
        let content = self.fab.content();
        let iso = self.fab.meme_isometry_of_segment();
        let mut bag = MarbleBag::new();
        for program in content.programs_of_type(program_type) {
            if let Some(t) = voicing_type
                && !content.voices_of_program(program.id).iter().any(|v| v.type_ == t)
            {
                continue;
            }
            let memes = content.meme_names_of_program(program.id);
            if !iso.is_allowed(memes.iter().map(String::as_str)) {
                continue;
            }
            let marbles = 1 + iso.score(memes.iter().map(String::as_str)) as u64;
            if self.fab.is_directly_bound_program(program.id) {
                bag.add(1, program.id, marbles);
            }
            if program.state == ProgramState::Published {
                bag.add(2, program.id, marbles);
            }
        }
        let label = format!(
            "choiceOf{}{}Program",
            voicing_type.map(|t| t.as_str()).unwrap_or(""),
            program_type
        );
        self.fab.put_report(&label, bag.report())?;
        Ok(bag.pick(self.fab.rng()).and_then(|id| content.get::<Program>(id)))
    }

    /// An instrument of `type_` whose audios cover every required event.
    pub fn choose_fresh_instrument(
        &mut self,
        type_: InstrumentType,
        required_events: &BTreeSet<String>,
    ) -> Result<Option<&'a Instrument>, FabricationError> {
        let content = self.fab.content();
        let iso = self.fab.meme_isometry_of_segment();
        let mut bag = MarbleBag::new();
        for instrument in content.instruments_of_type(type_) {
            if !self.instrument_contains_audio_events_like(instrument, required_events) {
                continue;
            }
            let memes = content.meme_names_of_instrument(instrument.id);
            if !iso.is_allowed(memes.iter().map(String::as_str)) {
                continue;
            }
            let marbles = 1 + iso.score(memes.iter().map(String::as_str)) as u64;
            if self.fab.is_directly_bound_instrument(instrument.id) {
                bag.add(1, instrument.id, marbles);
            }
            if instrument.state == InstrumentState::Published {
                bag.add(2, instrument.id, marbles);
            }
        }
        self.fab
            .put_report(&format!("choiceOf{type_}Instrument"), bag.report())?;
        Ok(bag.pick(self.fab.rng()).and_then(|id| content.get::<Instrument>(id)))
    }

    /// An audio of the given instrument types and modes, skipping `avoid`.
    /// Audios whose event is preferred outrank the rest within each of
    /// bound and published.
    pub fn choose_fresh_instrument_audio(
        &mut self,
        types: &BTreeSet<InstrumentType>,
        modes: &BTreeSet<InstrumentMode>,
        avoid: &BTreeSet<InstrumentAudioId>,
        preferred_events: &BTreeSet<String>,
    ) -> Result<Option<&'a InstrumentAudio>, FabricationError> {
        let content = self.fab.content();
        let iso = self.fab.meme_isometry_of_segment();
        let mut bag = MarbleBag::new();
        for audio in content.audios_of_instrument_types_and_modes(types, modes) {
            if avoid.contains(&audio.id) {
                continue;
            }
            let memes = content.meme_names_of_instrument(audio.instrument_id);
            if !iso.is_allowed(memes.iter().map(String::as_str)) {
                continue;
            }
            let marbles = 1 + iso.score(memes.iter().map(String::as_str)) as u64;
            let preferred = preferred_events.contains(&audio.event);
            if self.fab.is_directly_bound_audio(audio) {
                bag.add(if preferred { 1 } else { 3 }, audio.id, marbles);
            }
            let published = content
                .get::<Instrument>(audio.instrument_id)
                .is_some_and(|i| i.state == InstrumentState::Published);
            if published {
                bag.add(if preferred { 2 } else { 4 }, audio.id, marbles);
            }
        }
        let type_names: Vec<&str> = types.iter().map(|t| t.as_str()).collect();
        let mode_names: Vec<&str> = modes.iter().map(|m| m.as_str()).collect();
        self.fab.put_report(
            &format!("choice{}{}", type_names.join(","), mode_names.join(",")),
            bag.report(),
        )?;
        Ok(bag.pick(self.fab.rng()).and_then(|id| content.get::<InstrumentAudio>(id)))
    }

    /// Every required event name matches some audio's event.
    pub fn instrument_contains_audio_events_like(
        &self,
        instrument: &Instrument,
        required_events: &BTreeSet<String>,
    ) -> bool {
        let audios = self.fab.content().audios_of_instrument(instrument.id);
        required_events
            .iter()
            .all(|event| audios.iter().any(|a| a.event.eq_ignore_ascii_case(event)))
    }

    // -----------------------------------------------------------------------
    // Intensity layers
    // -----------------------------------------------------------------------

    /// Split audios into `layers` buckets by ascending intensity and pick
    /// one from each non-empty bucket.
    pub fn select_audio_intensity_layers(
        &mut self,
        mut audios: Vec<&'a InstrumentAudio>,
        layers: u32,
    ) -> Vec<&'a InstrumentAudio> {
        if audios.is_empty() || layers == 0 {
            return Vec::new();
        }
        audios.sort_by(|a, b| a.intensity.total_cmp(&b.intensity).then(a.id.cmp(&b.id)));
        let per_layer = audios.len().div_ceil(layers as usize);
        audios
            .chunks(per_layer)
            .filter_map(|bucket| quick_pick(bucket, self.fab.rng()))
            .collect()
    }

    /// The instrument's previous picks when its audio selection persists,
    /// else fresh intensity layers.
    pub fn select_general_audio_intensity_layers(
        &mut self,
        instrument: &'a Instrument,
    ) -> Result<Vec<&'a InstrumentAudio>, FabricationError> {
        let content = self.fab.content();
        let previous: BTreeSet<InstrumentAudioId> = self
            .fab
            .retrospective()
            .previous_picks_of_instrument(instrument.id)
            .iter()
            .map(|p| p.instrument_audio_id)
            .collect();
        if !previous.is_empty()
            && self
                .fab
                .instrument_config(instrument.id)?
                .is_audio_selection_persistent
        {
            return Ok(previous
                .into_iter()
                .filter_map(|id| content.get::<InstrumentAudio>(id))
                .collect());
        }
        let layers = self.fab.template_config().intensity_layers(instrument.type_);
        Ok(self.select_audio_intensity_layers(content.audios_of_instrument(instrument.id), layers))
    }

    // -----------------------------------------------------------------------
    // Note events
    // -----------------------------------------------------------------------

    /// One choice per voice, each arranged from its patterns. A voice that
    /// continues from the previous segment keeps its window and instrument;
    /// otherwise `provide` supplies the instrument, and a voice it cannot
    /// supply is skipped.
    pub fn craft_note_events(
        &mut self,
        tempo: f64,
        sequence: &'a ProgramSequence,
        voices: &[&'a ProgramVoice],
        default_atonal: bool,
        mut provide: impl FnMut(
            &mut Self,
            &'a ProgramVoice,
        ) -> Result<Option<&'a Instrument>, FabricationError>,
    ) -> Result<(), FabricationError> {
        let content = self.fab.content();
        for &voice in voices {
            let program = content
                .get::<Program>(voice.program_id)
                .ok_or_else(|| {
                    FabricationError::not_found(format!("program of voice {}", voice.id))
                })?;
            let mut choice = SegmentChoice {
                mute: self.compute_mute(voice.type_),
                program_type: Some(program.type_),
                instrument_type: Some(voice.type_),
                program_id: Some(voice.program_id),
                program_sequence_id: Some(sequence.id),
                program_voice_id: Some(voice.id),
                ..Default::default()
            };

            let prior = self
                .fab
                .choice_if_continued_voice(voice)?
                .filter(|c| c.instrument_id.is_some());
            if let Some(prior) = prior {
                choice.delta_in = prior.delta_in;
                choice.delta_out = prior.delta_out;
                choice.instrument_id = prior.instrument_id;
                choice.instrument_mode = prior.instrument_mode;
            } else {
                let Some(instrument) = provide(&mut *self, voice)? else {
                    debug!(voice = %voice.name, "no instrument for voice");
                    continue;
                };
                choice.delta_in = self.compute_delta_in(&choice);
                choice.delta_out = self.compute_delta_out(&choice);
                choice.instrument_id = Some(instrument.id);
                choice.instrument_mode = Some(instrument.mode);
            }

            let choice = match self.fab.put_choice(choice, false) {
                Ok(choice) => choice,
                Err(e) if e.is_recoverable() => continue,
                Err(e) => return Err(e),
            };
            debug!(
                voice = %voice.name,
                intro = self.is_intro_segment(&choice)?,
                outro = self.is_outro_segment(&choice)?,
                "crafting voice"
            );
            self.craft_note_event_arrangements(tempo, &choice, default_atonal)?;
        }
        Ok(())
    }

    /// Lay patterns across the whole segment, or restart them at each chord
    /// when the program asks for it, then finalise one-shot lengths.
    pub fn craft_note_event_arrangements(
        &mut self,
        tempo: f64,
        choice: &SegmentChoice,
        default_atonal: bool,
    ) -> Result<(), FabricationError> {
        let program_id = choice
            .program_id
            .ok_or_else(|| {
                FabricationError::not_found(format!("program of choice {}", choice.id))
            })?;
        let config = self.fab.program_config(program_id)?;
        let total = self.fab.segment()?.total as f64;
        let mut range = NoteRange::empty();

        if self.fab.chords().is_empty() || !config.do_pattern_restart_on_chord {
            self.craft_note_event_section(tempo, choice, 0.0, total, &mut range, default_atonal)?;
        } else {
            for section in self.compute_sections()? {
                self.craft_note_event_section(
                    tempo,
                    choice,
                    section.from,
                    section.to,
                    &mut range,
                    default_atonal,
                )?;
            }
        }
        self.finalize_note_event_cutoffs_of_one_shot_instrument_audio_picks(choice)
    }

    /// Chord-delimited spans: each chord holds until the next one, the last
    /// until the segment ends.
    pub fn compute_sections(&self) -> Result<Vec<Section>, FabricationError> {
        let total = self.fab.segment()?.total as f64;
        let chords = self.fab.chords();
        Ok(chords
            .iter()
            .enumerate()
            .map(|(i, chord)| Section {
                chord: chord.clone(),
                from: chord.position,
                to: chords.get(i + 1).map(|next| next.position).unwrap_or(total),
            })
            .collect())
    }

    fn craft_note_event_section(
        &mut self,
        tempo: f64,
        choice: &SegmentChoice,
        from: f64,
        to: f64,
        range: &mut NoteRange,
        default_atonal: bool,
    ) -> Result<(), FabricationError> {
        let (Some(sequence_id), Some(voice_id), Some(instrument_id)) =
            (choice.program_sequence_id, choice.program_voice_id, choice.instrument_id)
        else {
            return Ok(());
        };
        let instrument = self
            .fab
            .content()
            .get::<Instrument>(instrument_id)
            .ok_or_else(|| FabricationError::not_found(instrument_id.to_string()))?;

        let mut position = from;
        while position < to {
            let Some(pattern) = self
                .fab
                .randomly_selected_pattern_of_sequence_by_voice_and_type(sequence_id, voice_id)
            else {
                break;
            };
            let arrangement = self.fab.put_arrangement(choice.id, Some(pattern.id))?;
            let span = PatternSpan {
                tempo,
                instrument,
                choice,
                arrangement_id: arrangement.id,
                from: position,
                to,
                default_atonal,
            };
            let advance = self.craft_pattern_events(&span, pattern, range)?;
            if advance <= 0.0 {
                break;
            }
            position += advance;
        }
        Ok(())
    }

    /// Pick every event of one pattern; returns the beats it covered.
    fn craft_pattern_events(
        &mut self,
        span: &PatternSpan<'a, '_>,
        pattern: &'a ProgramSequencePattern,
        range: &mut NoteRange,
    ) -> Result<f64, FabricationError> {
        for event in self.fab.content().events_of_pattern(pattern.id) {
            self.pick_notes_and_instrument_audio_for_event(span, event, range)?;
        }
        Ok((span.to - span.from).min(pattern.total as f64))
    }

    /// Voice one event against the chord it falls under and pick an audio
    /// per resulting note. Events past the segment end are dropped and
    /// durations are clipped to the span.
    fn pick_notes_and_instrument_audio_for_event(
        &mut self,
        span: &PatternSpan<'a, '_>,
        event: &'a ProgramSequencePatternEvent,
        range: &mut NoteRange,
    ) -> Result<(), FabricationError> {
        let total = self.fab.segment()?.total as f64;
        let position = span.from + event.position;
        if position < 0.0 || position >= total {
            return Ok(());
        }
        let duration = event.duration.min(span.to - position);

        let chord = self.fab.chord_at(position)?;
        let voicing = self.fab.choose_voicing(chord.id, span.instrument.type_);
        let volume_ratio = self.compute_volume_ratio_for_picked_note(span.choice, position)?;
        if volume_ratio <= 0.0 {
            return Ok(());
        }

        let notes: Vec<String> = match &voicing {
            Some(v) => self.pick_notes_for_event(
                span.instrument.type_,
                span.choice,
                event,
                &chord,
                v,
                range,
            )?,
            None if span.default_atonal => vec![ATONAL.to_string()],
            None => Vec::new(),
        };

        let track = self
            .fab
            .content()
            .track_of_event(event)
            .ok_or_else(|| FabricationError::not_found(format!("track of event {}", event.id)))?;
        let start = self.fab.segment_micros_at_position(span.tempo, position)?;
        let length = if self.fab.is_one_shot(span.instrument.id, Some(&track.name))? {
            None
        } else {
            Some(self.fab.segment_micros_at_position(span.tempo, position + duration)? - start)
        };

        for note in notes {
            self.pick_instrument_audio(NotePick {
                note,
                instrument: span.instrument,
                event,
                event_name: track.name.clone(),
                arrangement_id: span.arrangement_id,
                start_at_segment_micros: start,
                length_micros: length,
                voicing_id: voicing.as_ref().map(|v| v.id),
                volume_ratio,
            })?;
        }
        Ok(())
    }

    /// Transpose an event's tones from the program's key into the segment
    /// chord and range, then map each onto the voicing: tonal notes through
    /// the `NotePicker`, atonal `X` notes through the event's sticky bun.
    /// `range` carries voice leading from one event to the next.
    pub fn pick_notes_for_event(
        &mut self,
        type_: InstrumentType,
        choice: &SegmentChoice,
        event: &ProgramSequencePatternEvent,
        segment_chord: &SegmentChord,
        voicing: &SegmentChordVoicing,
        range: &mut NoteRange,
    ) -> Result<Vec<String>, FabricationError> {
        let chord = Chord::of(&segment_chord.name);
        let key = Chord::of(&self.fab.key_for_choice(choice)?);
        let program_id = choice
            .program_id
            .ok_or_else(|| {
                FabricationError::not_found(format!("program of choice {}", choice.id))
            })?;
        let program_range = self.fab.program_range(program_id, type_);
        let voicing_range = self.fab.program_voicing_note_range(type_);

        // Semitone shift first, so the octave shift sees the transposed range.
        let transpose = self.fab.program_target_shift(type_, &key, &chord);
        let source_range = program_range.shifted(transpose);
        let octaves = self
            .fab
            .program_range_shift_octaves(type_, &source_range, &voicing_range);
        let shift = transpose + 12 * octaves;

        let mut event_notes: Vec<Note> = csv_values(&event.tones)
            .iter()
            .map(|t| Note::of(t).shift(shift))
            .collect();
        event_notes.sort();

        if range.is_empty() {
            range.expand(&program_range.shifted(shift));
        }

        let bun = if event_notes.iter().any(Note::is_atonal) {
            self.fab.sticky_bun(event.id, event_notes.len())?
        } else {
            None
        };
        let voicing_notes = voicing.valid_notes();
        let seek_inversions = self.fab.template_config().is_inversion_seeking(type_);
        let mut picker =
            NotePicker::new(range.clone(), voicing_notes.iter().copied(), seek_inversions);

        let mut picked = Vec::with_capacity(event_notes.len());
        for (i, note) in event_notes.iter().enumerate() {
            let note = match &bun {
                Some(bun) if note.is_atonal() => bun.compute(&voicing_notes, i),
                _ => picker.pick(*note, self.fab.rng()),
            };
            picked.push(note);
        }
        range.expand_notes(&picked);

        let names: BTreeSet<String> = picked
            .iter()
            .map(|n| n.to_string(chord.accidental()))
            .collect();
        Ok(names.into_iter().collect())
    }

    fn pick_instrument_audio(&mut self, pick: NotePick<'a>) -> Result<(), FabricationError> {
        let config = self.fab.instrument_config(pick.instrument.id)?;
        let audio = if config.is_multiphonic {
            self.select_multiphonic_instrument_audio(pick.instrument, pick.event, &pick.note)?
        } else {
            self.select_monophonic_instrument_audio(pick.instrument, pick.event)?
        };
        let Some(audio) = audio else {
            return Ok(());
        };
        self.fab.put_pick(SegmentChoiceArrangementPick {
            segment_choice_arrangement_id: pick.arrangement_id,
            program_sequence_pattern_event_id: Some(pick.event.id),
            segment_chord_voicing_id: pick.voicing_id,
            instrument_audio_id: audio.id,
            event: pick.event_name,
            start_at_segment_micros: pick.start_at_segment_micros,
            length_micros: pick.length_micros,
            amplitude: pick.event.velocity * pick.volume_ratio,
            tones: if config.is_tonal { pick.note } else { ATONAL.to_string() },
            ..Default::default()
        })?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Audio selection
    // -----------------------------------------------------------------------

    /// Reuse the preferred audio under `(parent, ident)` when the
    /// instrument persists its selections, else select anew.
    fn select_persistent(
        &mut self,
        instrument: &'a Instrument,
        parent: &str,
        ident: &str,
        select: impl FnOnce(&mut Self) -> Result<Option<&'a InstrumentAudio>, FabricationError>,
    ) -> Result<Option<&'a InstrumentAudio>, FabricationError> {
        if !self.fab.instrument_config(instrument.id)?.is_audio_selection_persistent {
            return select(&mut *self);
        }
        let content = self.fab.content();
        if let Some(id) = self.fab.preferred_audio(parent, ident) {
            return Ok(content.get::<InstrumentAudio>(id));
        }
        let audio = select(&mut *self)?;
        if let Some(audio) = audio {
            self.fab.put_preferred_audio(parent, ident, audio.id);
        }
        Ok(audio)
    }

    pub fn select_multiphonic_instrument_audio(
        &mut self,
        instrument: &'a Instrument,
        event: &ProgramSequencePatternEvent,
        note: &str,
    ) -> Result<Option<&'a InstrumentAudio>, FabricationError> {
        let parent = event.program_voice_track_id.uuid().to_string();
        self.select_persistent(instrument, &parent, note, |craft| {
            craft.select_new_multiphonic_instrument_audio(instrument, note)
        })
    }

    pub fn select_monophonic_instrument_audio(
        &mut self,
        instrument: &'a Instrument,
        event: &ProgramSequencePatternEvent,
    ) -> Result<Option<&'a InstrumentAudio>, FabricationError> {
        let parent = event.program_voice_track_id.uuid().to_string();
        let persistent = self.fab.instrument_config(instrument.id)?.is_audio_selection_persistent;
        let audio = self.select_persistent(instrument, &parent, &event.tones, |craft| {
            craft.select_new_note_event_instrument_audio(instrument, event)
        })?;
        if persistent && audio.is_none() {
            return Err(FabricationError::no_candidates(format!(
                "note event audio of instrument {}",
                instrument.name
            )));
        }
        Ok(audio)
    }

    pub fn select_chord_part_instrument_audio(
        &mut self,
        instrument: &'a Instrument,
        chord: &Chord,
    ) -> Result<Option<&'a InstrumentAudio>, FabricationError> {
        let parent = instrument.id.uuid().to_string();
        self.select_persistent(instrument, &parent, chord.name(), |craft| {
            Ok(craft.select_new_chord_part_instrument_audio(instrument, chord))
        })
    }

    /// Highest-scoring audio for an event: drums match the track name to
    /// the audio event (300), everything else matches the note (100). Ties
    /// are drawn at random.
    fn select_new_note_event_instrument_audio(
        &mut self,
        instrument: &'a Instrument,
        event: &ProgramSequencePatternEvent,
    ) -> Result<Option<&'a InstrumentAudio>, FabricationError> {
        let content = self.fab.content();
        let track_name = content
            .track_of_event(event)
            .map(|t| t.name.as_str())
            .unwrap_or_default();
        let event_note = Note::of(&event.tones);
        let scored: Vec<(&'a InstrumentAudio, u32)> = content
            .audios_of_instrument(instrument.id)
            .into_iter()
            .map(|audio| {
                let score = if instrument.type_ == InstrumentType::Drum {
                    if audio.event.eq_ignore_ascii_case(track_name) { 300 } else { 0 }
                } else if Note::of(&audio.tones) == event_note {
                    100
                } else {
                    0
                };
                (audio, score)
            })
            .collect();
        let Some(best) = scored.iter().map(|(_, s)| *s).max() else {
            return Ok(None);
        };
        let top: Vec<&'a InstrumentAudio> = scored
            .into_iter()
            .filter(|(_, s)| *s == best)
            .map(|(a, _)| a)
            .collect();
        Ok(quick_pick(&top, self.fab.rng()))
    }

    /// A random audio whose tone matches `note` (either side atonal
    /// matches anything).
    fn select_new_multiphonic_instrument_audio(
        &mut self,
        instrument: &'a Instrument,
        note: &str,
    ) -> Result<Option<&'a InstrumentAudio>, FabricationError> {
        let audios = self.fab.content().audios_of_instrument(instrument.id);
        let wanted = Note::of(note);
        let candidates: Vec<&'a InstrumentAudio> = audios
            .iter()
            .filter(|a| !a.tones.trim().is_empty())
            .filter(|a| {
                let offered = Note::of(&a.tones);
                wanted.is_atonal() || offered.is_atonal() || offered == wanted
            })
            .copied()
            .collect();
        if candidates.is_empty() {
            let mut available: Vec<Note> = audios.iter().map(|a| Note::of(&a.tones)).collect();
            available.sort();
            let names: Vec<String> = available
                .iter()
                .map(|n| n.to_string(Accidental::Sharp))
                .collect();
            self.fab.put_report(
                "missing",
                json!({
                    "instrumentId": instrument.id.uuid().to_string(),
                    "searchForNote": note,
                    "availableNotes": names.join(", "),
                }),
            )?;
            return Ok(None);
        }
        Ok(quick_pick(&candidates, self.fab.rng()))
    }

    /// An audio whose chord label fits `chord`: exact (whitespace
    /// insensitive) first, then slash-root fallback, then synonym.
    pub fn select_new_chord_part_instrument_audio(
        &mut self,
        instrument: &'a Instrument,
        chord: &Chord,
    ) -> Option<&'a InstrumentAudio> {
        let mut bag = MarbleBag::new();
        for audio in self.fab.content().audios_of_instrument(instrument.id) {
            let phase = match chord.match_with(&Chord::of(&audio.tones)) {
                Some(ChordMatch::Exact) => 1,
                Some(ChordMatch::SlashRoot) => 2,
                Some(ChordMatch::Synonym) => 3,
                None => continue,
            };
            bag.add(phase, audio.id, 1);
        }
        bag.pick(self.fab.rng())
            .and_then(|id| self.fab.content().get::<InstrumentAudio>(id))
    }

    // -----------------------------------------------------------------------
    // Chord, event and loop parts
    // -----------------------------------------------------------------------

    /// A choice for an instrument of a detail layer, continuing the
    /// previous one of the same type and mode when there is one. `None`
    /// when the taxonomy refuses it.
    fn put_instrument_choice(
        &mut self,
        instrument: &'a Instrument,
    ) -> Result<Option<(SegmentChoice, &'a Instrument)>, FabricationError> {
        let content = self.fab.content();
        let mut choice = SegmentChoice {
            mute: self.compute_mute(instrument.type_),
            instrument_type: Some(instrument.type_),
            instrument_mode: Some(instrument.mode),
            instrument_id: Some(instrument.id),
            ..Default::default()
        };
        let mut instrument = instrument;
        match self
            .fab
            .choice_if_continued_type_mode(instrument.type_, instrument.mode)?
        {
            Some(prior) => {
                choice.delta_in = prior.delta_in;
                choice.delta_out = prior.delta_out;
                if let Some(continued) = prior
                    .instrument_id
                    .and_then(|id| content.get::<Instrument>(id))
                {
                    choice.instrument_id = Some(continued.id);
                    instrument = continued;
                }
            }
            None => {
                choice.delta_in = self.compute_delta_in(&choice);
                choice.delta_out = self.compute_delta_out(&choice);
            }
        }
        match self.fab.put_choice(choice, false) {
            Ok(choice) => Ok(Some((choice, instrument))),
            Err(e) if e.is_recoverable() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// One pick per chord section, using an audio labelled with that chord.
    pub fn craft_chord_parts(
        &mut self,
        tempo: f64,
        instrument: &'a Instrument,
    ) -> Result<(), FabricationError> {
        let Some((choice, instrument)) = self.put_instrument_choice(instrument)? else {
            return Ok(());
        };
        if self.fab.chords().is_empty() || self.is_silent_entire_segment(&choice)? {
            return Ok(());
        }
        let arrangement = self.fab.put_arrangement(choice.id, None)?;
        let one_shot = self.fab.is_one_shot(instrument.id, None)?;

        for section in self.compute_sections()? {
            let chord = Chord::of(&section.chord.name);
            let Some(audio) = self.select_chord_part_instrument_audio(instrument, &chord)? else {
                continue;
            };
            let volume_ratio = self.compute_volume_ratio_for_picked_note(&choice, section.from)?;
            if volume_ratio <= 0.0 {
                continue;
            }
            let start = self.fab.segment_micros_at_position(tempo, section.from)?;
            let length = if one_shot {
                None
            } else {
                Some(self.fab.segment_micros_at_position(tempo, section.to)? - start)
            };
            self.fab.put_pick(SegmentChoiceArrangementPick {
                segment_choice_arrangement_id: arrangement.id,
                instrument_audio_id: audio.id,
                event: instrument.type_.as_str().to_uppercase(),
                start_at_segment_micros: start,
                length_micros: length,
                amplitude: volume_ratio,
                tones: chord.name().to_string(),
                ..Default::default()
            })?;
        }
        self.finalize_note_event_cutoffs_of_one_shot_instrument_audio_picks(&choice)
    }

    /// Voices of `program` matching the instrument's type, played by it.
    pub fn craft_event_parts(
        &mut self,
        tempo: f64,
        instrument: &'a Instrument,
        program: &'a Program,
    ) -> Result<(), FabricationError> {
        let Some(sequence) = self.fab.randomly_selected_sequence(program.id) else {
            return Ok(());
        };
        let voices: Vec<&'a ProgramVoice> = self
            .fab
            .content()
            .voices_of_program(program.id)
            .into_iter()
            .filter(|v| v.type_ == instrument.type_)
            .collect();
        if voices.is_empty() {
            return Ok(());
        }
        self.craft_note_events(tempo, sequence, &voices, false, |_, _| Ok(Some(instrument)))
    }

    /// Intensity-layer audios, each repeated every `loop_beats` to the
    /// segment end.
    pub fn craft_loop_parts(
        &mut self,
        tempo: f64,
        instrument: &'a Instrument,
    ) -> Result<(), FabricationError> {
        let Some((choice, instrument)) = self.put_instrument_choice(instrument)? else {
            return Ok(());
        };
        if self.is_silent_entire_segment(&choice)? {
            return Ok(());
        }
        let total = self.fab.segment()?.total as f64;
        let arrangement = self.fab.put_arrangement(choice.id, None)?;
        for audio in self.select_general_audio_intensity_layers(instrument)? {
            let loop_beats = if audio.loop_beats > 0.0 { audio.loop_beats } else { total };
            if loop_beats <= 0.0 {
                continue;
            }
            let mut position = 0.0;
            while position < total {
                let volume_ratio = self.compute_volume_ratio_for_picked_note(&choice, position)?;
                if volume_ratio > 0.0 {
                    let start = self.fab.segment_micros_at_position(tempo, position)?;
                    let end_position = (position + loop_beats).min(total);
                    let end = self.fab.segment_micros_at_position(tempo, end_position)?;
                    self.fab.put_pick(SegmentChoiceArrangementPick {
                        segment_choice_arrangement_id: arrangement.id,
                        instrument_audio_id: audio.id,
                        event: audio.event.clone(),
                        start_at_segment_micros: start,
                        length_micros: Some(end - start),
                        amplitude: volume_ratio,
                        tones: audio.tones.clone(),
                        ..Default::default()
                    })?;
                }
                position += loop_beats;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // One-shot cutoffs
    // -----------------------------------------------------------------------

    fn picks_of_choice(&self, choice_id: SegmentChoiceId) -> Vec<SegmentChoiceArrangementPick> {
        let arrangements: BTreeSet<SegmentChoiceArrangementId> = self
            .fab
            .arrangements()
            .into_iter()
            .filter(|a| a.segment_choice_id == choice_id)
            .map(|a| a.id)
            .collect();
        let mut picks: Vec<SegmentChoiceArrangementPick> = self
            .fab
            .picks()
            .into_iter()
            .filter(|p| arrangements.contains(&p.segment_choice_arrangement_id))
            .collect();
        picks.sort_by_key(|p| (p.start_at_segment_micros, p.id));
        picks
    }

    /// Give each unlengthened one-shot pick a length that runs to the next
    /// pick of the same choice, or to the segment end; a pick starting at
    /// or past the end is deleted.
    pub fn finalize_note_event_cutoffs_of_one_shot_instrument_audio_picks(
        &mut self,
        choice: &SegmentChoice,
    ) -> Result<(), FabricationError> {
        let instrument_id = choice
            .instrument_id
            .ok_or_else(|| {
                FabricationError::not_found(format!("instrument of choice {}", choice.id))
            })?;
        let instrument = self
            .fab
            .content()
            .get::<Instrument>(instrument_id)
            .ok_or_else(|| FabricationError::not_found(instrument_id.to_string()))?;
        if !self.fab.is_one_shot(instrument.id, None)?
            || !self.fab.is_one_shot_cutoff_enabled(instrument.id)?
            || !self.fab.template_config().finalizes_audio_length(instrument.type_)
        {
            return Ok(());
        }

        let picks = self.picks_of_choice(choice.id);
        if picks.is_empty() {
            return Ok(());
        }
        let cutoffs: Vec<i64> = picks.iter().map(|p| p.start_at_segment_micros).collect();
        let total = self.fab.total_segment_micros()?;
        for mut pick in picks {
            if pick.length_micros.is_some_and(|l| l > 0) {
                continue;
            }
            let start = pick.start_at_segment_micros;
            if start >= total {
                self.fab.delete_pick(pick.id)?;
                continue;
            }
            let end = cutoffs
                .iter()
                .find(|c| **c > start)
                .map_or(total, |next| (*next).min(total));
            pick.length_micros = Some(end - start);
            self.fab.update_pick(pick)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::SegmentState;
    use crate::retrospective::Retrospective;
    use crate::segment_store::SegmentStore;
    use crate::test_support::params;
    use ostinato_content::{ContentBuilder, IdGenerator};

    fn store_for(template: TemplateId, config: &str, delta: i32) -> SegmentStore {
        let mut ids = IdGenerator::new(3);
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
                total: 16,
                tempo: 120.0,
                delta,
                ..Default::default()
            })
            .unwrap();
        store
    }

    fn fabricator<'a>(content: &'a ContentStore, store: &'a mut SegmentStore) -> Fabricator<'a> {
        let fab_params = params(SegmentId(0), 5, None);
        Fabricator::new(content, store, Retrospective::empty(), fab_params).unwrap()
    }

    fn window(delta_in: i32, delta_out: i32) -> SegmentChoice {
        SegmentChoice {
            delta_in,
            delta_out,
            ..Default::default()
        }
    }

    #[test]
    fn in_bounds_is_half_open() {
        assert!(in_bounds(4, 8, 4.0));
        assert!(in_bounds(4, 8, 7.9));
        assert!(!in_bounds(4, 8, 8.0));
        assert!(!in_bounds(4, 8, 3.0));
        assert!(in_bounds(DELTA_UNLIMITED, 8, -100.0));
        assert!(in_bounds(4, DELTA_UNLIMITED, 1e9));
        assert!(in_bounds(DELTA_UNLIMITED, DELTA_UNLIMITED, 0.0));
    }

    #[test]
    fn choice_windows_against_segment_span() {
        let mut b = ContentBuilder::new(1);
        let project = b.project("P");
        let template = b.template(project, "T", "t", "");
        let content = b.build();
        // Segment covers deltas [32, 48).
        let mut store = store_for(template, "", 32);
        let mut fab = fabricator(&content, &mut store);
        let craft = Craft::new(&mut fab);

        let intro = window(40, DELTA_UNLIMITED);
        assert!(craft.is_intro_segment(&intro).unwrap());
        assert!(!craft.is_active_entire_segment(&intro).unwrap());

        let outro = window(DELTA_UNLIMITED, 48);
        assert!(craft.is_outro_segment(&outro).unwrap());
        assert!(craft.is_active_entire_segment(&outro).unwrap());

        assert!(craft.is_silent_entire_segment(&window(48, DELTA_UNLIMITED)).unwrap());
        assert!(craft.is_silent_entire_segment(&window(DELTA_UNLIMITED, 32)).unwrap());
        let unlimited = window(DELTA_UNLIMITED, DELTA_UNLIMITED);
        assert!(!craft.is_silent_entire_segment(&unlimited).unwrap());
        assert!(craft.is_active_entire_segment(&unlimited).unwrap());
    }

    fn by_type(_: &ContentStore, choice: &SegmentChoice) -> String {
        choice
            .instrument_type
            .map(|t| t.to_string())
            .unwrap_or_default()
    }

    fn any_choice(_: &SegmentChoice) -> bool {
        true
    }

    #[test]
    fn disabled_delta_arcs_leave_layers_unlimited() {
        let mut b = ContentBuilder::new(1);
        let project = b.project("P");
        let template = b.template(project, "T", "t", "");
        let content = b.build();
        let mut store = store_for(template, "", 0);
        let mut fab = fabricator(&content, &mut store);
        let mut craft = Craft::new(&mut fab);
        let layers = vec!["Bass".to_string(), "Pad".to_string()];
        craft.precompute_deltas(any_choice, by_type, &layers, &[], 1).unwrap();
        let pad = SegmentChoice {
            instrument_type: Some(InstrumentType::Pad),
            ..Default::default()
        };
        assert_eq!(craft.compute_delta_in(&pad), DELTA_UNLIMITED);
        assert_eq!(craft.compute_delta_out(&pad), DELTA_UNLIMITED);
        let ratio = craft.compute_volume_ratio_for_picked_note(&window(100, 200), 0.0);
        assert_eq!(ratio.unwrap(), 1.0);
    }

    #[test]
    fn enabled_delta_arcs_stagger_layers_on_subsection_grid() {
        let mut b = ContentBuilder::new(1);
        let project = b.project("P");
        let config = r#"{"deltaArcEnabled": true}"#;
        let template = b.template(project, "T", "t", config);
        let content = b.build();
        let mut store = store_for(template, config, 0);
        let mut fab = fabricator(&content, &mut store);
        let mut craft = Craft::new(&mut fab);
        let layers: Vec<String> = ["Bass", "Pad", "Stab", "Sticky"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        craft.precompute_deltas(any_choice, by_type, &layers, &[], 1).unwrap();

        // 16 beats in 4-beat bars: subsections of 4 beats.
        for layer in &layers {
            let delta_in = craft.delta_ins[layer];
            assert!(
                delta_in == DELTA_UNLIMITED || (delta_in > 0 && delta_in % 4 == 0),
                "{delta_in}"
            );
            assert_eq!(craft.delta_outs[layer], DELTA_UNLIMITED);
        }
        assert_eq!(craft.compute_volume_ratio_for_picked_note(&window(8, 12), 4.0).unwrap(), 0.0);
        assert_eq!(craft.compute_volume_ratio_for_picked_note(&window(8, 12), 8.0).unwrap(), 1.0);
    }

    #[test]
    fn prioritized_layers_enter_first() {
        let mut b = ContentBuilder::new(1);
        let project = b.project("P");
        let config = r#"{"deltaArcEnabled": true}"#;
        let template = b.template(project, "T", "t", config);
        let content = b.build();
        for seed in 0..20 {
            let mut store = store_for(template, config, 0);
            let mut p = params(SegmentId(0), 5, None);
            p.seed = seed;
            let mut fab = Fabricator::new(&content, &mut store, Retrospective::empty(), p).unwrap();
            let mut craft = Craft::new(&mut fab);
            let layers: Vec<String> = ["HiHat", "Kick", "Snare"]
                .iter()
                .map(|s| s.to_string())
                .collect();
            craft
                .precompute_deltas(any_choice, by_type, &layers, &["kick".to_string()], 1)
                .unwrap();
            let kick = craft.delta_ins["Kick"];
            for other in ["HiHat", "Snare"] {
                let d = craft.delta_ins[other];
                assert!(
                    kick == DELTA_UNLIMITED || (d != DELTA_UNLIMITED && kick <= d),
                    "seed {seed}"
                );
            }
        }
    }

    fn chord_instrument(tones: &[&str]) -> (ContentStore, TemplateId, InstrumentId) {
        let mut b = ContentBuilder::new(9);
        let project = b.project("P");
        let library = b.library(project, "L");
        let template = b.template(project, "T", "t", "");
        b.bind_library(template, library);
        let instrument =
            b.instrument(library, InstrumentType::Stab, InstrumentMode::Chord, "Stabs");
        for (i, t) in tones.iter().enumerate() {
            b.audio(instrument, &format!("stab {i}"), "STAB", t);
        }
        (b.build(), template, instrument)
    }

    #[test]
    fn chord_part_matches_despite_irregular_whitespace() {
        let (content, template, instrument_id) = chord_instrument(&["G major"]);
        let instrument = content.get::<Instrument>(instrument_id).unwrap();
        let mut store = store_for(template, "", 0);
        let mut fab = fabricator(&content, &mut store);
        let mut craft = Craft::new(&mut fab);
        let audio = craft
            .select_new_chord_part_instrument_audio(instrument, &Chord::of(" G   major  "))
            .unwrap();
        assert_eq!(audio.tones, "G major");
    }

    #[test]
    fn chord_part_falls_back_to_slash_root() {
        let (content, template, instrument_id) = chord_instrument(&["Ab/C", "Eb/G"]);
        let instrument = content.get::<Instrument>(instrument_id).unwrap();
        let mut store = store_for(template, "", 0);
        let mut fab = fabricator(&content, &mut store);
        let mut craft = Craft::new(&mut fab);
        for _ in 0..20 {
            let audio = craft
                .select_new_chord_part_instrument_audio(instrument, &Chord::of("Ab"))
                .unwrap();
            assert_eq!(audio.tones, "Ab/C");
        }
        assert!(craft
            .select_new_chord_part_instrument_audio(instrument, &Chord::of("F#m"))
            .is_none());
    }

    #[test]
    fn chord_part_selection_persists_per_chord() {
        let (content, template, instrument_id) = chord_instrument(&["C", "C", "C"]);
        let instrument = content.get::<Instrument>(instrument_id).unwrap();
        let mut store = store_for(template, "", 0);
        let mut fab = fabricator(&content, &mut store);
        let mut craft = Craft::new(&mut fab);
        let first = craft
            .select_chord_part_instrument_audio(instrument, &Chord::of("C"))
            .unwrap()
            .unwrap();
        for _ in 0..10 {
            let again = craft
                .select_chord_part_instrument_audio(instrument, &Chord::of("C"))
                .unwrap()
                .unwrap();
            assert_eq!(again.id, first.id);
        }
    }

    #[test]
    fn three_intensity_layers_yield_one_audio_each() {
        let mut b = ContentBuilder::new(4);
        let project = b.project("P");
        let library = b.library(project, "L");
        let template = b.template(project, "T", "t", "");
        b.bind_library(template, library);
        let instrument =
            b.instrument(library, InstrumentType::Percussion, InstrumentMode::Loop, "Perc");
        for (i, intensity) in [0.2, 0.8, 0.5, 0.2, 0.8, 0.5].iter().enumerate() {
            let audio = b.audio(instrument, &format!("loop {i}"), "LOOP", "X");
            b.edit::<InstrumentAudio>(audio, |a| a.intensity = *intensity);
        }
        let content = b.build();
        let instrument = content.get::<Instrument>(instrument).unwrap();
        let mut store = store_for(template, "", 0);
        let mut fab = fabricator(&content, &mut store);
        let mut craft = Craft::new(&mut fab);
        for _ in 0..10 {
            let picked = craft.select_general_audio_intensity_layers(instrument).unwrap();
            let intensities: Vec<f64> = picked.iter().map(|a| a.intensity).collect();
            assert_eq!(intensities, vec![0.2, 0.5, 0.8]);
        }
    }

    #[test]
    fn fresh_program_needs_voice_of_type_and_prefers_bound() {
        let mut b = ContentBuilder::new(6);
        let project = b.project("P");
        let library = b.library(project, "L");
        let template = b.template(project, "T", "t", "");
        let bound = b.program(library, ProgramType::Detail, "Bound", "C", 120.0);
        b.voice(bound, InstrumentType::Bass, "Bass");
        b.bind_program(template, bound);
        let loose = b.program(library, ProgramType::Detail, "Loose", "C", 120.0);
        b.voice(loose, InstrumentType::Bass, "Bass");
        let padded = b.program(library, ProgramType::Detail, "Pads", "C", 120.0);
        b.voice(padded, InstrumentType::Pad, "Pad");
        let content = b.build();

        let mut store = store_for(template, "", 0);
        let mut fab = fabricator(&content, &mut store);
        let mut craft = Craft::new(&mut fab);
        for _ in 0..10 {
            let chosen = craft
                .choose_fresh_program(ProgramType::Detail, Some(InstrumentType::Bass))
                .unwrap()
                .unwrap();
            assert_eq!(chosen.id, bound);
        }
        let pad = craft
            .choose_fresh_program(ProgramType::Detail, Some(InstrumentType::Pad))
            .unwrap()
            .unwrap();
        assert_eq!(pad.id, padded);
        assert!(craft
            .fab
            .messages()
            .iter()
            .any(|m| m.body.starts_with("choiceOfBassDetailProgram: ")));
    }

    #[test]
    fn fresh_instrument_requires_events_and_audio_prefers_events() {
        let mut b = ContentBuilder::new(8);
        let project = b.project("P");
        let library = b.library(project, "L");
        let template = b.template(project, "T", "t", "");
        b.bind_library(template, library);
        let partial = b.instrument(library, InstrumentType::Drum, InstrumentMode::Event, "Partial");
        b.audio(partial, "kick", "KICK", "X");
        let full = b.instrument(library, InstrumentType::Drum, InstrumentMode::Event, "Full");
        b.audio(full, "kick", "KICK", "X");
        let snare = b.audio(full, "snare", "SNARE", "X");
        let content = b.build();

        let mut store = store_for(template, "", 0);
        let mut fab = fabricator(&content, &mut store);
        let mut craft = Craft::new(&mut fab);
        let required: BTreeSet<String> = ["KICK", "snare"].iter().map(|s| s.to_string()).collect();
        let chosen = craft
            .choose_fresh_instrument(InstrumentType::Drum, &required)
            .unwrap()
            .unwrap();
        assert_eq!(chosen.id, full);

        let types = BTreeSet::from([InstrumentType::Drum]);
        let preferred = BTreeSet::from(["SNARE".to_string()]);
        for _ in 0..10 {
            let audio = craft
                .choose_fresh_instrument_audio(
                    &types,
                    &BTreeSet::new(),
                    &BTreeSet::new(),
                    &preferred,
                )
                .unwrap()
                .unwrap();
            assert_eq!(audio.id, snare);
        }
        let avoided = craft
            .choose_fresh_instrument_audio(
                &types,
                &BTreeSet::new(),
                &BTreeSet::from([snare]),
                &preferred,
            )
            .unwrap()
            .unwrap();
        assert_eq!(avoided.event, "KICK");
    }

    #[test]
    fn one_shot_cutoffs_run_to_next_pick_or_segment_end() {
        let mut b = ContentBuilder::new(2);
        let project = b.project("P");
        let library = b.library(project, "L");
        let template = b.template(project, "T", "t", "");
        b.bind_library(template, library);
        let instrument =
            b.instrument(library, InstrumentType::Bass, InstrumentMode::Event, "Pluck");
        b.edit::<Instrument>(instrument, |i| i.config = r#"{"isOneShot": true}"#.to_string());
        let audio = b.audio(instrument, "pluck", "PLUCK", "C2");
        let content = b.build();

        let mut store = store_for(template, "", 0);
        let mut fab = fabricator(&content, &mut store);
        let choice = fab
            .put_choice(
                SegmentChoice {
                    instrument_id: Some(instrument),
                    instrument_type: Some(InstrumentType::Bass),
                    ..Default::default()
                },
                true,
            )
            .unwrap();
        let arrangement = fab.put_arrangement(choice.id, None).unwrap();
        for start in [0, 2_000_000, 9_000_000] {
            fab.put_pick(SegmentChoiceArrangementPick {
                segment_choice_arrangement_id: arrangement.id,
                instrument_audio_id: audio,
                start_at_segment_micros: start,
                ..Default::default()
            })
            .unwrap();
        }
        let mut craft = Craft::new(&mut fab);
        craft
            .finalize_note_event_cutoffs_of_one_shot_instrument_audio_picks(&choice)
            .unwrap();

        // 16 beats at 120 bpm: 8 seconds.
        let mut lengths: Vec<(i64, Option<i64>)> = craft
            .fab
            .picks()
            .iter()
            .map(|p| (p.start_at_segment_micros, p.length_micros))
            .collect();
        lengths.sort();
        assert_eq!(lengths, vec![(0, Some(2_000_000)), (2_000_000, Some(6_000_000))]);
    }
}
