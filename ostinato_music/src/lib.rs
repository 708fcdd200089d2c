// Ostinato music theory primitives.
//
// Value types shared by the content model and the fabrication engine. None
// of these know about programs, segments or stores; they only describe
// pitches and how to move them around.
//
// Architecture:
// - pitch.rs: PitchClass (twelve classes + atonal) and Accidental spelling
// - note.rs: Note (pitch class + octave), parsing "C#4"/"X", shifting, deltas
// - chord.rs: Chord names, whitespace normalisation, slash roots, the
//   synonym table and tiered ChordMatch
// - note_range.rs: NoteRange low/high tracking and octave-shift solvers
// - note_picker.rs: NotePicker, mapping event notes onto chord voicings
// - bar.rs: Bar length and delta-arc subsection sizing
//
// Everything here is deterministic. The only randomness (atonal note picks)
// comes from a caller-supplied `SeededRng`.

pub mod bar;
pub mod chord;
pub mod note;
pub mod note_picker;
pub mod note_range;
pub mod pitch;

pub use bar::Bar;
pub use chord::{Chord, ChordMatch};
pub use note::Note;
pub use note_picker::NotePicker;
pub use note_range::NoteRange;
pub use pitch::{Accidental, PitchClass};
