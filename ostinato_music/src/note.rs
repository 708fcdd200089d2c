// A single pitched note (pitch class + octave), or the atonal placeholder.
//
// Notes are parsed from strings like "C#4", "Bb2" or "X". Any text that does
// not start with a note letter parses as atonal; a missing octave means
// octave 0. Ordering is by absolute semitone, with atonal notes sorting
// below every tonal note.
//
// See also: `pitch.rs` (pitch-class parsing), `note_range.rs` (min/max
// tracking over collections of notes).

use crate::pitch::{Accidental, PitchClass};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Name used for atonal notes in pattern events and picks.
pub const ATONAL: &str = "X";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Note {
    pitch_class: PitchClass,
    octave: i32,
}

impl Note {
    pub fn of(text: &str) -> Self {
        let text = text.trim();
        let (pitch_class, used) = PitchClass::parse_prefix(text);
        if pitch_class == PitchClass::None {
            return Self::atonal();
        }
        let octave = text[used..].trim().parse::<i32>().unwrap_or(0);
        Self {
            pitch_class,
            octave,
        }
    }

    pub fn of_pitch_class(pitch_class: PitchClass, octave: i32) -> Self {
        if pitch_class == PitchClass::None {
            return Self::atonal();
        }
        Self {
            pitch_class,
            octave,
        }
    }

    /// The note `semitones` above C0.
    pub fn of_semitones(semitones: i32) -> Self {
        Self {
            pitch_class: PitchClass::from_semitone(semitones),
            octave: semitones.div_euclid(12),
        }
    }

    pub fn atonal() -> Self {
        Self {
            pitch_class: PitchClass::None,
            octave: 0,
        }
    }

    /// True if `text` names a tonal note.
    pub fn is_valid(text: &str) -> bool {
        !Self::of(text).is_atonal()
    }

    pub fn is_atonal(&self) -> bool {
        self.pitch_class == PitchClass::None
    }

    pub fn pitch_class(&self) -> PitchClass {
        self.pitch_class
    }

    pub fn octave(&self) -> i32 {
        self.octave
    }

    /// Absolute semitones above C0, or `None` when atonal.
    pub fn semitones(&self) -> Option<i32> {
        self.pitch_class.semitone().map(|s| self.octave * 12 + s)
    }

    pub fn shift(&self, semitones: i32) -> Self {
        match self.semitones() {
            Some(s) => Self::of_semitones(s + semitones),
            None => *self,
        }
    }

    /// Semitones from this note up to `target` (negative when `target` is
    /// lower). Zero if either note is atonal.
    pub fn delta(&self, target: &Note) -> i32 {
        match (self.semitones(), target.semitones()) {
            (Some(a), Some(b)) => b - a,
            _ => 0,
        }
    }

    /// The note of pitch class `pitch_class` nearest to this one, searching
    /// up to six semitones in each direction (lower wins a tritone tie).
    pub fn nearest_of_class(&self, pitch_class: PitchClass) -> Self {
        let Some(here) = self.semitones() else {
            return *self;
        };
        for step in 0..=6 {
            for candidate in [here - step, here + step] {
                if PitchClass::from_semitone(candidate) == pitch_class {
                    return Self::of_semitones(candidate);
                }
            }
        }
        *self
    }

    pub fn to_string(&self, accidental: Accidental) -> String {
        if self.is_atonal() {
            return ATONAL.to_string();
        }
        format!("{}{}", self.pitch_class.name(accidental), self.octave)
    }
}

impl Ord for Note {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.semitones(), other.semitones()) {
            (Some(a), Some(b)) => a.cmp(&b),
            (None, Some(_)) => Ordering::Less,
            (Some(_), None) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        }
    }
}

impl PartialOrd for Note {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Note {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_string(Accidental::Sharp))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_note_with_octave() {
        let n = Note::of("C#4");
        assert_eq!(n.pitch_class(), PitchClass::Cs);
        assert_eq!(n.octave(), 4);
        assert_eq!(n.semitones(), Some(49));
    }

    #[test]
    fn parse_atonal_and_garbage() {
        assert!(Note::of("X").is_atonal());
        assert!(Note::of("  ").is_atonal());
        assert!(Note::of("hello").is_atonal());
        assert!(!Note::is_valid("X"));
        assert!(Note::is_valid(" Eb3 "));
    }

    #[test]
    fn shift_crosses_octaves() {
        assert_eq!(Note::of("B3").shift(1), Note::of("C4"));
        assert_eq!(Note::of("C4").shift(-13), Note::of("B2"));
        assert!(Note::of("X").shift(5).is_atonal());
    }

    #[test]
    fn delta_is_signed() {
        assert_eq!(Note::of("C4").delta(&Note::of("G4")), 7);
        assert_eq!(Note::of("G4").delta(&Note::of("C4")), -7);
        assert_eq!(Note::of("X").delta(&Note::of("C4")), 0);
    }

    #[test]
    fn ordering_is_by_pitch_with_atonal_first() {
        let mut notes = vec![Note::of("G4"), Note::of("X"), Note::of("C2"), Note::of("Bb3")];
        notes.sort();
        assert!(notes[0].is_atonal());
        assert_eq!(notes[1], Note::of("C2"));
        assert_eq!(notes[3], Note::of("G4"));
    }

    #[test]
    fn nearest_of_class_prefers_closest() {
        assert_eq!(Note::of("C4").nearest_of_class(PitchClass::B), Note::of("B3"));
        assert_eq!(Note::of("C4").nearest_of_class(PitchClass::E), Note::of("E4"));
        assert_eq!(Note::of("C4").nearest_of_class(PitchClass::Fs), Note::of("F#3"));
    }

    #[test]
    fn to_string_respects_spelling() {
        assert_eq!(Note::of("G#2").to_string(Accidental::Flat), "Ab2");
        assert_eq!(Note::of("Ab2").to_string(Accidental::Sharp), "G#2");
        assert_eq!(Note::of("X").to_string(Accidental::Flat), "X");
    }
}
