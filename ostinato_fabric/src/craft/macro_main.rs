// MacroMainCraft: the first craft pass of every segment.
//
// Chooses the macro and main programs, the sequence bindings they play at
// this segment's offsets, and from the main sequence derives everything the
// later passes depend on: the segment's chords and voicings, tempo, key,
// total beats, duration, delta and intensity.
//
// Macro selection, in order: an explicit override; the previous macro when
// the segment continues it (Continue, NextMain); a uniform draw on the
// chain's first segment; otherwise a seven-phase bag biased toward programs
// whose opening memes fit the previous macro's next sequence. Main
// selection: the previous main on Continue, else a four-phase bag over
// programs the segment's memes allow, avoiding the previous main.
//
// Both choices are written with `force`, since nothing else can proceed
// without them. With override memes the memes are placed first and main is
// chosen before macro, so the main choice is steered by the override.
//
// See also: `craft/mod.rs`, `Fabricator::compute_type`.

use super::Craft;
use crate::enums::SegmentType;
use crate::error::FabricationError;
use crate::fabricator::Fabricator;
use crate::marble_bag::MarbleBag;
use crate::segment::{DELTA_UNLIMITED, SegmentChoice};
use ostinato_content::enums::{ProgramState, ProgramType};
use ostinato_content::ids::ProgramId;
use ostinato_content::model::{Program, ProgramSequence, ProgramVoice};
use ostinato_content::MemeIsometry;
use ostinato_music::Chord;
use std::collections::BTreeSet;
use tracing::info;

pub struct MacroMainCraft<'f, 'a> {
    craft: Craft<'f, 'a>,
    override_macro_program: Option<&'a Program>,
    override_memes: Option<BTreeSet<String>>,
}

impl<'f, 'a> MacroMainCraft<'f, 'a> {
    pub fn new(fab: &'f mut Fabricator<'a>) -> Self {
        Self {
            craft: Craft::new(fab),
            override_macro_program: None,
            override_memes: None,
        }
    }

    /// Play this macro program instead of choosing one.
    pub fn with_override_macro_program(mut self, program: &'a Program) -> Self {
        self.override_macro_program = Some(program);
        self
    }

    /// Force these memes onto the segment and steer both choices by them.
    pub fn with_override_memes(mut self, memes: BTreeSet<String>) -> Self {
        self.override_memes = Some(memes);
        self
    }

    fn fab(&mut self) -> &mut Fabricator<'a> {
        self.craft.fab
    }

    pub fn do_work(mut self) -> Result<(), FabricationError> {
        let (macro_sequence, main_sequence) = match self.override_memes.clone() {
            Some(memes) => {
                for meme in &memes {
                    self.fab().put_meme(meme)?;
                }
                let main = self.do_main_choice_work()?;
                (self.do_macro_choice_work()?, main)
            }
            None => {
                let macro_ = self.do_macro_choice_work()?;
                (macro_, self.do_main_choice_work()?)
            }
        };
        if main_sequence.total == 0 {
            return Err(FabricationError::Configuration {
                subject: main_sequence.id.to_string(),
                reason: "main sequence has no beats".to_string(),
            });
        }
        let content = self.fab().content();
        let main_program = content
            .get::<Program>(main_sequence.program_id)
            .ok_or_else(|| {
                FabricationError::not_found(format!("main program {}", main_sequence.program_id))
            })?;

        self.copy_chords(main_sequence)?;

        let segment_type = self.fab().segment_type()?;
        let mut segment = self.fab().segment()?;
        segment.type_ = segment_type;
        segment.tempo = main_program.tempo;
        segment.key = self.compute_segment_key(main_sequence, main_program);
        segment.total = main_sequence.total;
        self.fab().update_segment(segment.clone())?;

        segment.duration_micros = Some(
            self.fab()
                .segment_micros_at_position(main_program.tempo, main_sequence.total as f64)?,
        );
        segment.delta = match (segment_type, self.fab().retrospective().previous_segment()) {
            (SegmentType::Continue, Some(previous)) => previous.delta + previous.total as i32,
            _ => 0,
        };
        segment.intensity =
            self.compute_segment_intensity(segment.delta, macro_sequence, main_sequence);
        self.fab().update_segment(segment)
    }

    /// Canonical chords of the main sequence that fall within it, each with
    /// its voicings typed by the voice they belong to.
    fn copy_chords(&mut self, main_sequence: &'a ProgramSequence) -> Result<(), FabricationError> {
        let content = self.fab().content();
        for sequence_chord in self.fab().program_sequence_chords(main_sequence.id) {
            if sequence_chord.position >= main_sequence.total as f64 {
                continue;
            }
            let chord = self.fab().put_chord(&sequence_chord.name, sequence_chord.position)?;
            for voicing in content.voicings_of_chord(sequence_chord.id) {
                let voice = content
                    .get::<ProgramVoice>(voicing.program_voice_id)
                    .ok_or_else(|| {
                        FabricationError::not_found(format!("voice of voicing {}", voicing.id))
                    })?;
                self.fab().put_voicing(chord.id, voice.type_, &voicing.notes)?;
            }
        }
        Ok(())
    }

    fn compute_segment_key(
        &self,
        main_sequence: &ProgramSequence,
        main_program: &Program,
    ) -> String {
        let key = if main_sequence.key.trim().is_empty() {
            &main_program.key
        } else {
            &main_sequence.key
        };
        Chord::of(key).name().trim().to_string()
    }

    /// Average of the two sequences' intensities, scaled through the
    /// auto-crescendo window by how far the main program has run.
    fn compute_segment_intensity(
        &self,
        delta: i32,
        macro_: &ProgramSequence,
        main: &ProgramSequence,
    ) -> f64 {
        let config = self.craft.fab.template_config();
        let average = (macro_.intensity + main.intensity) / 2.0;
        if !config.intensity_auto_crescendo_enabled {
            return average;
        }
        let min = config.intensity_auto_crescendo_minimum;
        let max = config.intensity_auto_crescendo_maximum;
        let progress = delta as f64 / config.main_program_length_max_delta as f64;
        let intensity = min + (max - min) * progress * average;
        (intensity * 100.0).round() / 100.0
    }

    // -----------------------------------------------------------------------
    // Choices
    // -----------------------------------------------------------------------

    fn do_macro_choice_work(&mut self) -> Result<&'a ProgramSequence, FabricationError> {
        let program = self.choose_macro_program()?;
        let offset = self.compute_macro_sequence_binding_offset()?;
        let sequence = self.put_program_choice(program, ProgramType::Macro, offset)?;
        info!(
            segment_id = self.craft.fab.segment_id().0,
            program = %program.name,
            offset,
            "chose macro program"
        );
        Ok(sequence)
    }

    fn do_main_choice_work(&mut self) -> Result<&'a ProgramSequence, FabricationError> {
        let program = self.choose_main_program()?;
        let offset = self.compute_main_sequence_binding_offset()?;
        let sequence = self.put_program_choice(program, ProgramType::Main, offset)?;
        info!(
            segment_id = self.craft.fab.segment_id().0,
            program = %program.name,
            offset,
            "chose main program"
        );
        Ok(sequence)
    }

    /// Bind the program at `offset` (or the nearest offset it has) and
    /// force the choice into the segment.
    fn put_program_choice(
        &mut self,
        program: &'a Program,
        program_type: ProgramType,
        offset: i32,
    ) -> Result<&'a ProgramSequence, FabricationError> {
        let content = self.fab().content();
        let binding = self
            .fab()
            .randomly_selected_sequence_binding_at_offset(program.id, offset)
            .ok_or_else(|| {
                FabricationError::not_found(format!(
                    "{program_type} sequence binding of {}",
                    program.name
                ))
            })?;
        let sequence = content
            .sequence_of_binding(binding)
            .ok_or_else(|| {
                FabricationError::not_found(format!("sequence of binding {}", binding.id))
            })?;
        self.fab().put_choice(
            SegmentChoice {
                program_id: Some(program.id),
                program_sequence_id: Some(sequence.id),
                program_sequence_binding_id: Some(binding.id),
                program_type: Some(program_type),
                delta_in: DELTA_UNLIMITED,
                delta_out: DELTA_UNLIMITED,
                ..Default::default()
            },
            true,
        )?;
        Ok(sequence)
    }

    fn compute_macro_sequence_binding_offset(&mut self) -> Result<i32, FabricationError> {
        let segment_type = self.fab().segment_type()?;
        if matches!(segment_type, SegmentType::Initial | SegmentType::NextMacro) {
            return Ok(match self.override_macro_program {
                Some(program) => self.craft.fab.second_macro_sequence_binding_offset(program.id),
                None => 0,
            });
        }
        let Some(previous) = self
            .craft
            .fab
            .retrospective()
            .previous_choice_of_type(ProgramType::Macro)
            .cloned()
        else {
            return Ok(0);
        };
        match segment_type {
            SegmentType::Continue => {
                Ok(self.craft.fab.sequence_binding_offset_for_choice(&previous))
            }
            SegmentType::NextMain => Ok(self.craft.fab.next_sequence_binding_offset(&previous)),
            other => Err(FabricationError::Configuration {
                subject: self.craft.fab.segment_id().to_string(),
                reason: format!("no macro sequence offset for segment type {other}"),
            }),
        }
    }

    fn compute_main_sequence_binding_offset(&mut self) -> Result<i32, FabricationError> {
        match self.fab().segment_type()? {
            SegmentType::Initial | SegmentType::NextMain | SegmentType::NextMacro => Ok(0),
            SegmentType::Continue => {
                let previous = self
                    .craft
                    .fab
                    .retrospective()
                    .previous_choice_of_type(ProgramType::Main)
                    .ok_or_else(|| FabricationError::not_found("previous main choice"))?;
                Ok(self.craft.fab.next_sequence_binding_offset(previous))
            }
            SegmentType::Pending => Err(FabricationError::Configuration {
                subject: self.craft.fab.segment_id().to_string(),
                reason: "no main sequence offset for a pending segment".to_string(),
            }),
        }
    }

    /// The program a previous choice of `program_type` played.
    fn previous_program(&self, program_type: ProgramType) -> Option<ProgramId> {
        self.craft
            .fab
            .retrospective()
            .previous_choice_of_type(program_type)
            .and_then(|c| c.program_id)
    }

    fn pick_program(
        &mut self,
        bag: &MarbleBag<ProgramId>,
        what: &str,
    ) -> Result<&'a Program, FabricationError> {
        let content = self.fab().content();
        let picked = bag.pick(self.fab().rng());
        match picked.and_then(|id| content.get::<Program>(id)) {
            Some(program) => Ok(program),
            None => {
                let message = format!(
                    "Unable to choose {what} program for Segment[{}]",
                    self.craft.fab.segment_id()
                );
                self.fab().add_error_message(&message)?;
                Err(FabricationError::no_candidates(format!("{what} program")))
            }
        }
    }

    /// Uniform over bound programs, then published, then any, preferring
    /// those not in `avoid` at each level.
    fn choose_random_program(
        &mut self,
        candidates: &[&'a Program],
        avoid: Option<ProgramId>,
    ) -> Result<&'a Program, FabricationError> {
        let mut bag = MarbleBag::new();
        for program in candidates {
            let avoided = avoid == Some(program.id);
            if self.craft.fab.is_directly_bound_program(program.id) {
                if !avoided {
                    bag.add(1, program.id, 1);
                }
                bag.add(2, program.id, 1);
            }
            if program.state == ProgramState::Published {
                if !avoided {
                    bag.add(3, program.id, 1);
                }
                bag.add(4, program.id, 1);
            }
            bag.add(5, program.id, 1);
        }
        self.pick_program(&bag, "random")
    }

    fn choose_macro_program(&mut self) -> Result<&'a Program, FabricationError> {
        if let Some(program) = self.override_macro_program {
            return Ok(program);
        }
        let content = self.fab().content();
        let candidates = content.programs_of_type(ProgramType::Macro);

        if self.craft.fab.is_initial_segment() {
            return self.choose_random_program(&candidates, None);
        }

        let previous = self.previous_program(ProgramType::Macro);
        if self.fab().is_continuation_of_macro_program()?
            && let Some(id) = previous
        {
            return content
                .get::<Program>(id)
                .ok_or_else(|| FabricationError::not_found(format!("previous macro program {id}")));
        }

        let iso = match &self.override_memes {
            Some(memes) => MemeIsometry::of(
                &self.craft.fab.template_config().meme_taxonomy,
                memes.iter().map(String::as_str),
            ),
            None => self.craft.fab.meme_isometry_of_next_sequence_in_previous_macro(),
        };

        let mut bag = MarbleBag::new();
        for program in &candidates {
            let memes = content.memes_at_beginning(program.id);
            let score = iso.score(memes.iter().map(String::as_str)) as u64;
            let avoided = previous == Some(program.id);
            if self.craft.fab.is_directly_bound_program(program.id) {
                if !avoided {
                    bag.add(1, program.id, score);
                    bag.add(2, program.id, 1 + score);
                }
                bag.add(3, program.id, 1);
            }
            if program.state == ProgramState::Published {
                if !avoided {
                    bag.add(4, program.id, score);
                    bag.add(5, program.id, 1 + score);
                }
                bag.add(6, program.id, 1);
            }
            bag.add(7, program.id, 1);
        }
        self.fab().put_report("macroChoice", bag.report())?;
        self.pick_program(&bag, "macro")
    }

    fn choose_main_program(&mut self) -> Result<&'a Program, FabricationError> {
        let content = self.fab().content();
        let previous = self.previous_program(ProgramType::Main);
        if self.fab().segment_type()? == SegmentType::Continue
            && let Some(id) = previous
        {
            return content
                .get::<Program>(id)
                .ok_or_else(|| FabricationError::not_found(format!("previous main program {id}")));
        }

        let iso = self.craft.fab.meme_isometry_of_segment();
        let mut bag = MarbleBag::new();
        for program in content.programs_of_type(ProgramType::Main) {
            let memes = content.memes_at_beginning(program.id);
            if iso.is_allowed(memes.iter().map(String::as_str)) {
                let marbles = 1 + iso.score(memes.iter().map(String::as_str)) as u64;
                if self.craft.fab.is_directly_bound_program(program.id) {
                    bag.add(1, program.id, marbles);
                }
                if program.state == ProgramState::Published {
                    let phase = if previous == Some(program.id) { 3 } else { 2 };
                    bag.add(phase, program.id, marbles);
                }
            }
            bag.add(4, program.id, 1);
        }
        self.fab().put_report("mainChoice", bag.report())?;
        self.pick_program(&bag, "main")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::enums::SegmentState;
    use crate::retrospective::Retrospective;
    use crate::segment::{SegmentChord, SegmentChordVoicing, SegmentId, SegmentMeme};
    use crate::segment_store::SegmentStore;
    use crate::test_support::{chain_store, craft_next, params, plan_segment};
    use ostinato_content::enums::InstrumentType;
    use ostinato_content::ids::{ProgramSequenceBindingId, TemplateId};
    use ostinato_content::{ContentBuilder, ContentStore};

    struct Library {
        content: ContentStore,
        template: TemplateId,
        macro_program: ProgramId,
        main_program: ProgramId,
        main_bindings: Vec<ProgramSequenceBindingId>,
    }

    /// One macro program (2 offsets) and one 8-beat main program (3
    /// offsets) with a ghosted chord and a chord past the sequence end.
    fn library() -> Library {
        let mut b = ContentBuilder::new(31);
        let project = b.project("P");
        let library = b.library(project, "L");
        let template = b.template(project, "T", "t", "");
        b.bind_library(template, library);

        let macro_program = b.program(library, ProgramType::Macro, "Macro", "C", 120.0);
        b.program_meme(macro_program, "Winter");
        let macro_sequence = b.sequence(macro_program, "M", "", 0, 0.6);
        b.sequence_binding(macro_sequence, 0);
        b.sequence_binding(macro_sequence, 1);

        let main_program = b.program(library, ProgramType::Main, "Main", "G", 130.0);
        let pad = b.voice(main_program, InstrumentType::Pad, "Pad");
        let main_sequence = b.sequence(main_program, "A", "Eb minor", 8, 0.4);
        let main_bindings = (0..3).map(|o| b.sequence_binding(main_sequence, o)).collect();
        let first = b.chord(main_sequence, "Eb-", 0.0);
        b.voicing(first, pad, "Eb4, Gb4, Bb4");
        let ghost = b.chord(main_sequence, "Ebm7", 0.0);
        b.voicing(ghost, pad, "Eb4");
        let second = b.chord(main_sequence, "Ab", 4.0);
        b.voicing(second, pad, "Ab3, C4, Eb4");
        b.chord(main_sequence, "Bb", 8.0);

        Library {
            content: b.build(),
            template,
            macro_program,
            main_program,
            main_bindings,
        }
    }

    fn macro_main(
        lib: &Library,
        store: &mut SegmentStore,
        type_override: Option<SegmentType>,
    ) -> SegmentId {
        craft_next(&lib.content, store, type_override, |fab| {
            MacroMainCraft::new(fab).do_work().unwrap();
        })
    }

    #[test]
    fn initial_segment_takes_timing_and_harmony_from_main() {
        let lib = library();
        let mut store = chain_store(lib.template, "");
        let id = macro_main(&lib, &mut store, None);

        let segment = store.read_segment(id).unwrap();
        assert_eq!(segment.type_, SegmentType::Initial);
        assert_eq!(segment.tempo, 130.0);
        assert_eq!(segment.key, "Eb minor");
        assert_eq!(segment.total, 8);
        assert_eq!(segment.delta, 0);
        // 8 beats at a flat 130 bpm.
        assert_eq!(segment.duration_micros, Some((8.0 * 60_000_000.0 / 130.0_f64).round() as i64));
        // Crescendo from zero delta pins intensity to the minimum.
        assert_eq!(segment.intensity, 0.2);

        let main = store.read_choice(id, ProgramType::Main).unwrap();
        assert_eq!(main.program_id, Some(lib.main_program));
        assert_eq!(main.program_sequence_binding_id, Some(lib.main_bindings[0]));
        let macro_ = store.read_choice(id, ProgramType::Macro).unwrap();
        assert_eq!(macro_.program_id, Some(lib.macro_program));

        let mut chords: Vec<(f64, String)> = store
            .read_all::<SegmentChord>(id)
            .iter()
            .map(|c| (c.position, c.name.clone()))
            .collect();
        chords.sort_by(|a, b| a.0.total_cmp(&b.0));
        assert_eq!(chords.len(), 2, "ghost and out-of-range chords are dropped");
        assert_eq!(chords[1].1, "Ab");
        let voicings = store.read_all::<SegmentChordVoicing>(id);
        assert_eq!(voicings.len(), 2);
        assert!(voicings.iter().all(|v| v.type_ == InstrumentType::Pad));

        let memes: Vec<String> = store
            .read_all::<SegmentMeme>(id)
            .iter()
            .map(|m| m.name.clone())
            .collect();
        assert_eq!(memes, vec!["WINTER".to_string()]);
    }

    #[test]
    fn continue_advances_main_offset_and_delta() {
        let lib = library();
        let mut store = chain_store(lib.template, "");
        macro_main(&lib, &mut store, None);
        let second = macro_main(&lib, &mut store, None);

        let segment = store.read_segment(second).unwrap();
        assert_eq!(segment.type_, SegmentType::Continue);
        assert_eq!(segment.delta, 8);
        let main = store.read_choice(second, ProgramType::Main).unwrap();
        assert_eq!(main.program_sequence_binding_id, Some(lib.main_bindings[1]));
        let macro_ = store.read_choice(second, ProgramType::Macro).unwrap();
        assert_eq!(macro_.program_id, Some(lib.macro_program));
        // Further along the main program, so louder than the first segment.
        assert!(segment.intensity > 0.2);
    }

    #[test]
    fn next_macro_restarts_main_at_first_offset() {
        let lib = library();
        let mut store = chain_store(lib.template, "");
        macro_main(&lib, &mut store, None);
        let second = macro_main(&lib, &mut store, Some(SegmentType::NextMacro));

        let segment = store.read_segment(second).unwrap();
        assert_eq!(segment.type_, SegmentType::NextMacro);
        assert_eq!(segment.delta, 0);
        // The previous macro is avoided only while an alternative exists.
        let macro_ = store.read_choice(second, ProgramType::Macro).unwrap();
        assert_eq!(macro_.program_id, Some(lib.macro_program));
        let main = store.read_choice(second, ProgramType::Main).unwrap();
        assert_eq!(main.program_sequence_binding_id, Some(lib.main_bindings[0]));
    }

    #[test]
    fn main_sequence_without_beats_is_refused() {
        let mut lib = library();
        let mut sequence = lib
            .content
            .all::<ProgramSequence>()
            .into_iter()
            .find(|s| s.program_id == lib.main_program)
            .cloned()
            .unwrap();
        sequence.total = 0;
        lib.content.put(sequence).unwrap();

        let mut store = chain_store(lib.template, "");
        let id = plan_segment(&mut store);
        let retrospective = Retrospective::load(&store, id);
        let mut fab =
            Fabricator::new(&lib.content, &mut store, retrospective, params(id, 1, None)).unwrap();
        let err = MacroMainCraft::new(&mut fab).do_work().unwrap_err();
        assert!(matches!(err, FabricationError::Configuration { .. }), "{err}");
    }

    #[test]
    fn override_memes_are_forced_and_reported() {
        let lib = library();
        let mut store = chain_store(lib.template, "");
        let id = plan_segment(&mut store);
        let retrospective = Retrospective::load(&store, id);
        let mut fab =
            Fabricator::new(&lib.content, &mut store, retrospective, params(id, 1, None)).unwrap();
        MacroMainCraft::new(&mut fab)
            .with_override_memes(BTreeSet::from(["Summer".to_string()]))
            .do_work()
            .unwrap();
        let memes = fab.meme_names();
        assert!(memes.contains("SUMMER"));
        // The forced macro choice still brings its own memes.
        assert!(memes.contains("WINTER"));
        assert!(fab.messages().iter().any(|m| m.body.starts_with("mainChoice: ")));
        drop(fab);
        store.update_segment_state(id, SegmentState::Crafted).unwrap();
    }

    #[test]
    fn override_macro_program_starts_at_its_second_offset() {
        let lib = library();
        let macro_program = lib.content.get::<Program>(lib.macro_program).unwrap();
        let mut store = chain_store(lib.template, "");
        let id = plan_segment(&mut store);
        let retrospective = Retrospective::load(&store, id);
        let mut fab =
            Fabricator::new(&lib.content, &mut store, retrospective, params(id, 1, None)).unwrap();
        MacroMainCraft::new(&mut fab)
            .with_override_macro_program(macro_program)
            .do_work()
            .unwrap();
        drop(fab);
        let choice = store.read_choice(id, ProgramType::Macro).unwrap();
        let binding = choice
            .program_sequence_binding_id
            .and_then(|b| lib.content.get::<ostinato_content::model::ProgramSequenceBinding>(b))
            .unwrap();
        assert_eq!(binding.offset, 1);
    }
}
