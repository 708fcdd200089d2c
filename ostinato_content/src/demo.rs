// Built-in demo library.
//
// A small but complete project used by the `fabricate` binary when no
// content file is given, by the benches, and by integration tests that just
// need "some music". It exercises every craft path:
// - two Macro programs whose bindings carry season memes
// - two Main programs with chord progressions voiced for Bass and Pad
// - two Beat programs on a KICK/SNARE/HAT kit
// - Detail programs for Bass (tonal, with an atonal sticky-bun step) and Stab
// - Event, Chord and Loop instruments
//
// The library is rebuilt from a fixed seed, so ids are stable across runs.

use crate::builder::ContentBuilder;
use crate::enums::{InstrumentMode, InstrumentType, ProgramType};
use crate::ids::{InstrumentId, LibraryId, ProgramId};
use crate::model::{Instrument, InstrumentAudio};
use crate::store::ContentStore;

/// Ship key of the demo template.
pub const DEMO_TEMPLATE: &str = "demo";

const DEMO_SEED: u64 = 0x05F1_4A70;

/// (position, chord, bass voicing, pad voicing, stab voicing)
type ChordRow = (f64, &'static str, &'static str, &'static str, &'static str);

const DRIFT_A: [ChordRow; 4] = [
    (0.0, "C", "C2", "C4, E4, G4", "E4, G4, C5"),
    (4.0, "Am", "A1", "A3, C4, E4", "C4, E4, A4"),
    (8.0, "F", "F1", "F3, A3, C4", "A4, C5, F5"),
    (12.0, "G", "G1", "G3, B3, D4", "B4, D5, G5"),
];

const DRIFT_B: [ChordRow; 4] = [
    (0.0, "Am", "A1", "A3, C4, E4", "C4, E4, A4"),
    (4.0, "F", "F1", "F3, A3, C4", "A4, C5, F5"),
    (8.0, "C", "C2", "C4, E4, G4", "E4, G4, C5"),
    (12.0, "G", "G1", "G3, B3, D4", "B4, D5, G5"),
];

const EMBER_RISE: [ChordRow; 4] = [
    (0.0, "G", "G1", "G3, B3, D4", "B4, D5, G5"),
    (4.0, "Em", "E2", "E3, G3, B3", "G4, B4, E5"),
    (8.0, "C", "C2", "C4, E4, G4", "E4, G4, C5"),
    (12.0, "D", "D2", "D4, F#4, A4", "F#4, A4, D5"),
];

const EMBER_FALL: [ChordRow; 4] = [
    (0.0, "Em", "E2", "E3, G3, B3", "G4, B4, E5"),
    (4.0, "C", "C2", "C4, E4, G4", "E4, G4, C5"),
    (8.0, "G", "G1", "G3, B3, D4", "B4, D5, G5"),
    (12.0, "D", "D2", "D4, F#4, A4", "F#4, A4, D5"),
];

struct MainSpec<'a> {
    name: &'a str,
    key: &'a str,
    tempo: f64,
    meme: &'a str,
    /// (name, key, intensity, chords)
    sequences: &'a [(&'a str, &'a str, f64, &'a [ChordRow])],
    /// Index into `sequences` for each successive binding offset.
    offsets: &'a [usize],
}

fn main_program(b: &mut ContentBuilder, library: LibraryId, spec: &MainSpec) -> ProgramId {
    let program = b.program(library, ProgramType::Main, spec.name, spec.key, spec.tempo);
    b.program_meme(program, spec.meme);
    let bass = b.voice(program, InstrumentType::Bass, "Bass");
    let pad = b.voice(program, InstrumentType::Pad, "Pad");
    let stab = b.voice(program, InstrumentType::Stab, "Stab");
    let mut sequence_ids = Vec::new();
    for (seq_name, seq_key, intensity, chords) in spec.sequences {
        let sequence = b.sequence(program, seq_name, seq_key, 16, *intensity);
        for (position, chord_name, bass_notes, pad_notes, stab_notes) in chords.iter() {
            let chord = b.chord(sequence, chord_name, *position);
            b.voicing(chord, bass, bass_notes);
            b.voicing(chord, pad, pad_notes);
            b.voicing(chord, stab, stab_notes);
        }
        sequence_ids.push(sequence);
    }
    for (offset, index) in spec.offsets.iter().enumerate() {
        if let Some(sequence) = sequence_ids.get(*index) {
            b.sequence_binding(*sequence, offset as i32);
        }
    }
    program
}

fn macro_program(
    b: &mut ContentBuilder,
    library: LibraryId,
    name: &str,
    steps: &[(&str, f64, &str)],
) -> ProgramId {
    let program = b.program(library, ProgramType::Macro, name, "C", 120.0);
    for (offset, (seq_name, intensity, meme)) in steps.iter().enumerate() {
        let sequence = b.sequence(program, seq_name, "", 0, *intensity);
        let binding = b.sequence_binding(sequence, offset as i32);
        b.binding_meme(binding, meme);
    }
    program
}

fn beat_program(b: &mut ContentBuilder, library: LibraryId, name: &str, hits: &[(&str, &[f64])]) {
    let program = b.program(library, ProgramType::Beat, name, "C", 120.0);
    let voice = b.voice(program, InstrumentType::Drum, "Drums");
    let sequence = b.sequence(program, "Groove", "C", 4, 0.5);
    let pattern = b.pattern(sequence, voice, "Basic", 4);
    for (track_name, positions) in hits {
        let track = b.track(voice, track_name);
        for position in positions.iter() {
            b.event(pattern, track, *position, 0.25, "X");
        }
    }
}

fn detail_program(
    b: &mut ContentBuilder,
    library: LibraryId,
    name: &str,
    type_: InstrumentType,
    notes: &[(f64, f64, &str)],
) {
    let program = b.program(library, ProgramType::Detail, name, "C", 120.0);
    let voice = b.voice(program, type_, type_.as_str());
    let track = b.track(voice, &type_.as_str().to_uppercase());
    let sequence = b.sequence(program, "Line", "C", 4, 0.5);
    let pattern = b.pattern(sequence, voice, "Line", 4);
    for (position, duration, tones) in notes {
        b.event(pattern, track, *position, *duration, tones);
    }
}

fn configure(b: &mut ContentBuilder, instrument: InstrumentId, config: &str) {
    let config = config.to_string();
    b.edit::<Instrument>(instrument, |i| i.config = config);
}

/// Build the demo project: one library bound to the `demo` template.
pub fn demo_library() -> ContentStore {
    let mut b = ContentBuilder::new(DEMO_SEED);
    let project = b.project("Ostinato Demo");
    let library = b.library(project, "Slow Seasons");
    let template = b.template(project, "Demo", DEMO_TEMPLATE, "");
    b.bind_library(template, library);

    macro_program(
        &mut b,
        library,
        "Winter Arc",
        &[("Snow", 0.4, "Winter"), ("Ice", 0.5, "Winter"), ("Melt", 0.6, "Spring")],
    );
    macro_program(
        &mut b,
        library,
        "Summer Arc",
        &[("Sun", 0.6, "Summer"), ("Heat", 0.7, "Summer"), ("Dusk", 0.5, "Fall")],
    );

    main_program(
        &mut b,
        library,
        &MainSpec {
            name: "Drift",
            key: "C",
            tempo: 120.0,
            meme: "Calm",
            sequences: &[("A", "C", 0.5, &DRIFT_A[..]), ("B", "Am", 0.6, &DRIFT_B[..])],
            offsets: &[0, 1, 0, 1],
        },
    );
    main_program(
        &mut b,
        library,
        &MainSpec {
            name: "Ember",
            key: "G",
            tempo: 126.0,
            meme: "Warm",
            sequences: &[("Rise", "G", 0.6, &EMBER_RISE[..]), ("Fall", "Em", 0.5, &EMBER_FALL[..])],
            offsets: &[0, 1, 0],
        },
    );

    beat_program(
        &mut b,
        library,
        "Four Floor",
        &[
            ("KICK", &[0.0, 1.0, 2.0, 3.0]),
            ("SNARE", &[1.0, 3.0]),
            ("HAT", &[0.5, 1.5, 2.5, 3.5]),
        ],
    );
    beat_program(
        &mut b,
        library,
        "Broken",
        &[("KICK", &[0.0, 1.5, 2.75]), ("SNARE", &[1.0, 3.0]), ("HAT", &[0.0, 1.0, 2.0, 3.0])],
    );

    detail_program(
        &mut b,
        library,
        "Walking Bass",
        InstrumentType::Bass,
        &[(0.0, 1.0, "C2"), (1.0, 1.0, "E2"), (2.0, 1.0, "G2"), (3.0, 1.0, "X")],
    );
    detail_program(
        &mut b,
        library,
        "Offbeat Stabs",
        InstrumentType::Stab,
        &[(0.5, 0.5, "C4, E4, G4"), (2.5, 0.5, "C4, E4, G4")],
    );

    let kit = b.instrument(library, InstrumentType::Drum, InstrumentMode::Event, "Kit");
    configure(&mut b, kit, r#"{"isOneShot": true}"#);
    for event in ["KICK", "SNARE", "HAT"] {
        b.audio(kit, &event.to_lowercase(), event, "X");
    }

    let sub = b.instrument(library, InstrumentType::Bass, InstrumentMode::Event, "Sub");
    configure(&mut b, sub, r#"{"isTonal": true, "isMultiphonic": true}"#);
    for note in ["C2", "D2", "E2", "F2", "G2", "A2", "B2", "X"] {
        b.audio(sub, &format!("sub {note}"), "BASS", note);
    }

    let pad = b.instrument(library, InstrumentType::Pad, InstrumentMode::Chord, "Warm Pad");
    for chord in ["C", "Am", "F", "G", "Em", "D"] {
        b.audio(pad, &format!("pad {chord}"), "PAD", chord);
    }

    let stab = b.instrument(library, InstrumentType::Stab, InstrumentMode::Event, "Brass");
    configure(&mut b, stab, r#"{"isTonal": true, "isMultiphonic": true, "isOneShot": true}"#);
    for note in ["C4", "E4", "G4", "X"] {
        b.audio(stab, &format!("brass {note}"), "STAB", note);
    }

    let shimmer = b.instrument(library, InstrumentType::Stripe, InstrumentMode::Loop, "Shimmer");
    for (name, intensity) in [("air", 0.2), ("glass", 0.5), ("storm", 0.8)] {
        let audio = b.audio(shimmer, name, "", "");
        b.edit::<InstrumentAudio>(audio, |a| a.intensity = intensity);
    }

    b.build()
}
