// Inclusive low/high range over tonal notes.
//
// Ranges track the extent of the notes a program actually uses, the notes a
// voicing offers, and the notes picked so far in a section (used for voice
// leading). Atonal notes never widen a range. An empty range has neither
// bound.
//
// The two octave-shift computations decide how far to transpose a program's
// source range so that it sits inside a target voicing range:
// - median-optimal averages the low-to-low and high-to-high deltas and
//   rounds to the nearest whole octave;
// - lowest-optimal picks the smallest shift that puts the source low note
//   at or above the target low note (used for bass lines).

use crate::note::Note;
use crate::pitch::{Accidental, PitchClass};
use serde::{Deserialize, Serialize};

/// How far the lowest-optimal search looks in each direction, in octaves.
const OCTAVE_SEARCH_LIMIT: i32 = 10;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteRange {
    low: Option<Note>,
    high: Option<Note>,
}

impl NoteRange {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn of_bounds(low: Note, high: Note) -> Self {
        let mut range = Self::empty();
        range.expand_note(low);
        range.expand_note(high);
        range
    }

    pub fn of_notes<'a>(notes: impl IntoIterator<Item = &'a Note>) -> Self {
        let mut range = Self::empty();
        for note in notes {
            range.expand_note(*note);
        }
        range
    }

    pub fn of_strings<'a>(notes: impl IntoIterator<Item = &'a str>) -> Self {
        let mut range = Self::empty();
        for note in notes {
            range.expand_note(Note::of(note));
        }
        range
    }

    pub fn low(&self) -> Option<Note> {
        self.low
    }

    pub fn high(&self) -> Option<Note> {
        self.high
    }

    pub fn is_empty(&self) -> bool {
        self.low.is_none() || self.high.is_none()
    }

    pub fn expand_note(&mut self, note: Note) {
        if note.is_atonal() {
            return;
        }
        if self.low.is_none_or(|low| note < low) {
            self.low = Some(note);
        }
        if self.high.is_none_or(|high| note > high) {
            self.high = Some(note);
        }
    }

    pub fn expand_notes<'a>(&mut self, notes: impl IntoIterator<Item = &'a Note>) {
        for note in notes {
            self.expand_note(*note);
        }
    }

    pub fn expand(&mut self, other: &NoteRange) {
        if let Some(low) = other.low {
            self.expand_note(low);
        }
        if let Some(high) = other.high {
            self.expand_note(high);
        }
    }

    pub fn shifted(&self, semitones: i32) -> Self {
        Self {
            low: self.low.map(|n| n.shift(semitones)),
            high: self.high.map(|n| n.shift(semitones)),
        }
    }

    /// The note halfway between low and high, rounded down.
    pub fn median_note(&self) -> Option<Note> {
        let low = self.low?.semitones()?;
        let high = self.high?.semitones()?;
        Some(Note::of_semitones((low + high).div_euclid(2)))
    }

    /// Semitones from this range's median to `target`'s median; zero if
    /// either range is empty.
    pub fn delta_semitones(&self, target: &NoteRange) -> i32 {
        match (self.median_note(), target.median_note()) {
            (Some(a), Some(b)) => a.delta(&b),
            _ => 0,
        }
    }

    /// The note of `pitch_class` nearest this range's median.
    pub fn note_nearest_median(&self, pitch_class: PitchClass) -> Option<Note> {
        if pitch_class == PitchClass::None {
            return None;
        }
        self.median_note().map(|m| m.nearest_of_class(pitch_class))
    }

    pub fn includes(&self, note: &Note) -> bool {
        match (self.low, self.high) {
            (Some(low), Some(high)) => !note.is_atonal() && low <= *note && *note <= high,
            _ => false,
        }
    }

    /// Octaves to shift `source` so it sits best within `target`, by
    /// averaging the low and high deltas.
    pub fn median_optimal_range_shift_octaves(source: &NoteRange, target: &NoteRange) -> i32 {
        let (Some(sl), Some(sh), Some(tl), Some(th)) =
            (source.low, source.high, target.low, target.high)
        else {
            return 0;
        };
        let average = (sl.delta(&tl) + sh.delta(&th)) as f64 / 2.0;
        (average / 12.0).round() as i32
    }

    /// Smallest octave shift that puts `source`'s low note at or above
    /// `target`'s low note.
    pub fn lowest_optimal_range_shift_octaves(source: &NoteRange, target: &NoteRange) -> i32 {
        let (Some(sl), Some(tl)) = (source.low, target.low) else {
            return 0;
        };
        let mut best: Option<(i32, i32)> = None;
        for octaves in (-OCTAVE_SEARCH_LIMIT..=OCTAVE_SEARCH_LIMIT).rev() {
            let delta = tl.delta(&sl.shift(octaves * 12));
            if delta >= 0 && best.is_none_or(|(d, _)| delta < d) {
                best = Some((delta, octaves));
            }
        }
        best.map(|(_, octaves)| octaves).unwrap_or(0)
    }

    pub fn to_string(&self, accidental: Accidental) -> String {
        match (self.low, self.high) {
            (Some(low), Some(high)) => {
                format!("{}-{}", low.to_string(accidental), high.to_string(accidental))
            }
            _ => "Empty".to_string(),
        }
    }
}
