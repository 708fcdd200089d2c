// Test-only fixtures and a chain harness for end-to-end fabrication tests.
//
// `TestChain` wraps the real `CraftWork` and exposes the segment store
// through small read helpers, so tests read like "fabricate six segments,
// then look at what segment 3 chose". Nothing here short-circuits
// fabrication: every segment goes through the same plan/craft/ship path as
// the demo binary.
//
// Fixtures are built with `ContentBuilder`; the bigger "some music"
// library is `ostinato_content::demo::demo_library`.
//
// See also: `tests/full_chain.rs` for the scenarios.

use std::collections::{BTreeMap, BTreeSet};

use ostinato_content::demo::demo_library;
use ostinato_content::enums::{InstrumentMode, InstrumentType, ProgramType};
use ostinato_content::ids::{InstrumentId, LibraryId, ProgramId, TemplateId};
use ostinato_content::model::Program;
use ostinato_content::{ContentBuilder, ContentStore};
use ostinato_fabric::segment::{
    Segment, SegmentChoice, SegmentChoiceArrangementPick, SegmentId, SegmentMeme, SegmentMeta,
};
use ostinato_fabric::{CraftWork, FabricationError, FabricatorFactory};

/// A chain under test, fabricated one segment at a time.
pub struct TestChain {
    pub work: CraftWork,
}

impl TestChain {
    pub fn start(content: &ContentStore, template: Option<&str>, seed: u64) -> Self {
        let work = CraftWork::start(content, template, FabricatorFactory::new(seed))
            .expect("TestChain::start failed");
        Self { work }
    }

    pub fn demo(seed: u64) -> Self {
        Self::start(&demo_library(), None, seed)
    }

    pub fn try_next(&mut self) -> Result<SegmentId, FabricationError> {
        self.work.fabricate_next()
    }

    /// Fabricate `n` more segments, panicking on the first failure.
    pub fn run(&mut self, n: usize) -> Vec<SegmentId> {
        (0..n)
            .map(|_| {
                self.work
                    .fabricate_next()
                    .unwrap_or_else(|e| panic!("fabrication failed: {e}"))
            })
            .collect()
    }

    pub fn segment(&self, id: SegmentId) -> &Segment {
        self.work.store().read_segment(id).expect("no such segment")
    }

    pub fn choice(&self, id: SegmentId, program_type: ProgramType) -> Option<&SegmentChoice> {
        self.work.store().read_choice(id, program_type)
    }

    pub fn choices(&self, id: SegmentId) -> Vec<&SegmentChoice> {
        self.work.store().read_all::<SegmentChoice>(id)
    }

    pub fn picks(&self, id: SegmentId) -> Vec<&SegmentChoiceArrangementPick> {
        self.work.store().read_all::<SegmentChoiceArrangementPick>(id)
    }

    pub fn memes(&self, id: SegmentId) -> BTreeSet<String> {
        self.work
            .store()
            .read_all::<SegmentMeme>(id)
            .into_iter()
            .map(|m| m.name.clone())
            .collect()
    }

    pub fn metas(&self, id: SegmentId) -> BTreeMap<String, String> {
        self.work
            .store()
            .read_all::<SegmentMeta>(id)
            .into_iter()
            .map(|m| (m.key.clone(), m.value.clone()))
            .collect()
    }

    /// Name of the program a segment chose for `program_type`.
    pub fn program_name(&self, id: SegmentId, program_type: ProgramType) -> Option<String> {
        self.choice(id, program_type)
            .and_then(|c| c.program_id)
            .and_then(|p| self.work.content().get::<Program>(p))
            .map(|p| p.name.clone())
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// What `small_library` created.
pub struct SmallLibrary {
    pub macro_program: ProgramId,
    pub main_program: ProgramId,
    pub beat_program: ProgramId,
    pub kit: InstrumentId,
}

/// A complete but tiny library: one macro (2 offsets), one 4-beat main
/// program (2 offsets, chords on beats 0 and 2), one beat program on a
/// KICK/SNARE kit, and a chord-mode pad. Names are prefixed with `prefix`.
pub fn small_library(
    b: &mut ContentBuilder,
    library: LibraryId,
    prefix: &str,
    tempo: f64,
) -> SmallLibrary {
    let macro_name = format!("{prefix} Macro");
    let macro_program = b.program(library, ProgramType::Macro, &macro_name, "C", tempo);
    for offset in 0..2 {
        let sequence = b.sequence(macro_program, &format!("M{offset}"), "", 0, 0.5);
        b.sequence_binding(sequence, offset);
    }

    let main_program = b.program(library, ProgramType::Main, &format!("{prefix} Main"), "C", tempo);
    let pad_voice = b.voice(main_program, InstrumentType::Pad, "Pad");
    let sequence = b.sequence(main_program, "A", "C", 4, 0.5);
    b.sequence_binding(sequence, 0);
    b.sequence_binding(sequence, 1);
    let c = b.chord(sequence, "C", 0.0);
    b.voicing(c, pad_voice, "C4, E4, G4");
    let g = b.chord(sequence, "G", 2.0);
    b.voicing(g, pad_voice, "B3, D4, G4");

    let beat_program = b.program(library, ProgramType::Beat, &format!("{prefix} Beat"), "C", tempo);
    let drums = b.voice(beat_program, InstrumentType::Drum, "Drums");
    let kick = b.track(drums, "KICK");
    let snare = b.track(drums, "SNARE");
    let groove = b.sequence(beat_program, "Groove", "", 4, 0.5);
    let pattern = b.pattern(groove, drums, "Basic", 4);
    for position in [0.0, 2.0] {
        b.event(pattern, kick, position, 0.5, "X");
    }
    for position in [1.0, 3.0] {
        b.event(pattern, snare, position, 0.5, "X");
    }

    let kit_name = format!("{prefix} Kit");
    let kit = b.instrument(library, InstrumentType::Drum, InstrumentMode::Event, &kit_name);
    b.audio(kit, "kick", "KICK", "X");
    b.audio(kit, "snare", "SNARE", "X");

    let pad_name = format!("{prefix} Pad");
    let pad = b.instrument(library, InstrumentType::Pad, InstrumentMode::Chord, &pad_name);
    for chord in ["C", "G"] {
        b.audio(pad, &format!("pad {chord}"), "PAD", chord);
    }

    SmallLibrary {
        macro_program,
        main_program,
        beat_program,
        kit,
    }
}

/// Two templates in one project, each bound to its own small library.
pub struct TwoTemplates {
    pub content: ContentStore,
    pub dawn: TemplateId,
    pub dusk: TemplateId,
    pub dawn_library: SmallLibrary,
    pub dusk_library: SmallLibrary,
}

pub fn two_templates() -> TwoTemplates {
    let mut b = ContentBuilder::new(0xDA_0D);
    let project = b.project("Days");
    let dawn_lib = b.library(project, "Dawn Library");
    let dusk_lib = b.library(project, "Dusk Library");
    let dawn = b.template(project, "Dawn", "dawn", "");
    let dusk = b.template(project, "Dusk", "dusk", "");
    b.bind_library(dawn, dawn_lib);
    b.bind_library(dusk, dusk_lib);
    let dawn_library = small_library(&mut b, dawn_lib, "Dawn", 100.0);
    let dusk_library = small_library(&mut b, dusk_lib, "Dusk", 140.0);
    TwoTemplates {
        content: b.build(),
        dawn,
        dusk,
        dawn_library,
        dusk_library,
    }
}
