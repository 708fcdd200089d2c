// Pitch classes and accidentals.
//
// A `PitchClass` is one of the twelve equal-tempered semitone classes, or
// `None` for atonal material (percussion hits written as "X"). `Accidental`
// records whether a name was spelled with sharps or flats so that picked
// notes can be written back in the same spelling as the chord they follow.
//
// Parsing accepts an uppercase letter A-G followed by any number of `#`/`♯`
// or `b`/`♭` characters. Anything else is atonal.
//
// See also: `note.rs` (pitch class + octave), `chord.rs` (root and slash
// root parsing).

use serde::{Deserialize, Serialize};

/// One of the twelve semitone classes, or `None` for atonal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PitchClass {
    None,
    C,
    Cs,
    D,
    Ds,
    E,
    F,
    Fs,
    G,
    Gs,
    A,
    As,
    B,
}

const CHROMATIC: [PitchClass; 12] = [
    PitchClass::C,
    PitchClass::Cs,
    PitchClass::D,
    PitchClass::Ds,
    PitchClass::E,
    PitchClass::F,
    PitchClass::Fs,
    PitchClass::G,
    PitchClass::Gs,
    PitchClass::A,
    PitchClass::As,
    PitchClass::B,
];

const SHARP_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

const FLAT_NAMES: [&str; 12] = [
    "C", "Db", "D", "Eb", "E", "F", "Gb", "G", "Ab", "A", "Bb", "B",
];

impl PitchClass {
    /// Semitones above C (0-11), or `None` when atonal.
    pub fn semitone(self) -> Option<i32> {
        CHROMATIC.iter().position(|&pc| pc == self).map(|i| i as i32)
    }

    /// The pitch class `semitones` above C, wrapping in both directions.
    pub fn from_semitone(semitones: i32) -> Self {
        CHROMATIC[semitones.rem_euclid(12) as usize]
    }

    /// Parse a leading pitch-class name and report how many bytes it used.
    ///
    /// Returns `(PitchClass::None, 0)` when the text does not start with a
    /// note letter.
    pub fn parse_prefix(text: &str) -> (Self, usize) {
        let mut chars = text.char_indices();
        let base = match chars.next() {
            Some((_, 'C')) => 0,
            Some((_, 'D')) => 2,
            Some((_, 'E')) => 4,
            Some((_, 'F')) => 5,
            Some((_, 'G')) => 7,
            Some((_, 'A')) => 9,
            Some((_, 'B')) => 11,
            _ => return (PitchClass::None, 0),
        };
        let mut offset = 0;
        let mut consumed = 1;
        for (i, c) in chars {
            match c {
                '#' | '♯' => offset += 1,
                'b' | '♭' => offset -= 1,
                _ => break,
            }
            consumed = i + c.len_utf8();
        }
        (Self::from_semitone(base + offset), consumed)
    }

    /// Transpose by a number of semitones. Atonal stays atonal.
    pub fn shift(self, semitones: i32) -> Self {
        match self.semitone() {
            Some(s) => Self::from_semitone(s + semitones),
            None => PitchClass::None,
        }
    }

    /// Spell this pitch class with the given accidental preference.
    pub fn name(self, accidental: Accidental) -> &'static str {
        match self.semitone() {
            Some(s) if accidental == Accidental::Flat => FLAT_NAMES[s as usize],
            Some(s) => SHARP_NAMES[s as usize],
            None => "X",
        }
    }
}

/// Sharp or flat spelling preference.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Accidental {
    #[default]
    Natural,
    Sharp,
    Flat,
}

impl Accidental {
    /// Detect the spelling of a note or chord name from the characters
    /// directly after its root letter.
    pub fn of(name: &str) -> Self {
        let mut chars = name.trim_start().chars();
        if chars.next().is_none() {
            return Accidental::Natural;
        }
        match chars.next() {
            Some('#' | '♯') => Accidental::Sharp,
            Some('b' | '♭') => Accidental::Flat,
            _ => Accidental::Natural,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_naturals_and_accidentals() {
        assert_eq!(PitchClass::parse_prefix("C"), (PitchClass::C, 1));
        assert_eq!(PitchClass::parse_prefix("F#4"), (PitchClass::Fs, 2));
        assert_eq!(PitchClass::parse_prefix("Bb3"), (PitchClass::As, 2));
        assert_eq!(PitchClass::parse_prefix("Cb"), (PitchClass::B, 2));
        assert_eq!(PitchClass::parse_prefix("E♭"), (PitchClass::Ds, 4));
    }

    #[test]
    fn non_letters_are_atonal() {
        assert_eq!(PitchClass::parse_prefix("X"), (PitchClass::None, 0));
        assert_eq!(PitchClass::parse_prefix(""), (PitchClass::None, 0));
        assert_eq!(PitchClass::parse_prefix("NC"), (PitchClass::None, 0));
    }

    #[test]
    fn shift_wraps_both_directions() {
        assert_eq!(PitchClass::C.shift(-1), PitchClass::B);
        assert_eq!(PitchClass::A.shift(5), PitchClass::D);
        assert_eq!(PitchClass::None.shift(3), PitchClass::None);
    }

    #[test]
    fn spelling_follows_accidental() {
        assert_eq!(PitchClass::Gs.name(Accidental::Flat), "Ab");
        assert_eq!(PitchClass::Gs.name(Accidental::Sharp), "G#");
        assert_eq!(PitchClass::Gs.name(Accidental::Natural), "G#");
        assert_eq!(PitchClass::None.name(Accidental::Flat), "X");
    }

    #[test]
    fn accidental_detection() {
        assert_eq!(Accidental::of("Ab/C"), Accidental::Flat);
        assert_eq!(Accidental::of("C#m7"), Accidental::Sharp);
        assert_eq!(Accidental::of("Cm"), Accidental::Natural);
        assert_eq!(Accidental::of(""), Accidental::Natural);
    }
}
