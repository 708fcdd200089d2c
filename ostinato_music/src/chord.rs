// Chord names: parsing, normalisation and fluent matching.
//
// A chord name is a root (`Ab`), a free-text description (`m7`, ` major`,
// `add9`) and an optional slash root (`/C`). Names are normalised on parse
// by trimming and collapsing internal runs of whitespace, so `" G   major "`
// and `"G major"` are the same chord.
//
// Matching between a requested chord and a chord-part audio label is tiered
// (`ChordMatch`): an exact normalised-name match beats a slash-root-only
// match, which beats a synonym match through the canonical description
// table below. Callers rank candidates by tier and take the best.
//
// See also: `pitch.rs` for root parsing, and the chord-part audio selection
// in `ostinato_fabric::craft`, which is the main consumer.

use crate::pitch::{Accidental, PitchClass};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Name used for the "no chord" placeholder.
pub const NO_CHORD: &str = "NC";

/// Aliases that describe the same chord quality. The first entry of each
/// row is the canonical spelling. Descriptions are compared with all
/// whitespace removed.
const SYNONYMS: &[&[&str]] = &[
    &["", "M", "maj", "Maj", "major", "Major"],
    &["m", "-", "mi", "min", "minor", "Minor"],
    &["7", "dom7", "dominant7"],
    &["maj7", "M7", "Maj7", "ma7", "major7", "Δ", "Δ7"],
    &["m7", "-7", "mi7", "min7", "minor7"],
    &["dim", "o", "°", "diminished"],
    &["dim7", "o7", "°7", "diminished7"],
    &["m7b5", "-7b5", "min7b5", "ø", "ø7", "half-diminished"],
    &["aug", "+", "augmented"],
    &["sus4", "sus", "suspended", "suspended4"],
    &["add9", "Madd9", "majadd9", "majoradd9", "add2"],
    &["madd9", "-add9", "minadd9", "minoradd9"],
    &["6", "M6", "maj6", "major6", "add6"],
    &["m6", "-6", "min6", "minor6"],
    &["9", "dom9"],
    &["maj9", "M9", "Maj9", "Δ9"],
    &["m9", "-9", "min9", "minor9"],
];

/// How well a candidate chord label fits a requested chord.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ChordMatch {
    /// Identical normalised names.
    Exact,
    /// Same name before the slash; one or both carry a slash root.
    SlashRoot,
    /// Same root and slash root, descriptions are listed synonyms.
    Synonym,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chord {
    name: String,
    root: PitchClass,
    description: String,
    slash_root: PitchClass,
    accidental: Accidental,
}

impl Chord {
    pub fn of(name: &str) -> Self {
        let name = normalize_whitespace(name);
        let (head, slash) = match name.split_once('/') {
            Some((head, slash)) => (head.trim(), Some(slash.trim())),
            None => (name.as_str(), None),
        };
        let (root, used) = PitchClass::parse_prefix(head);
        let description = head[used..].trim().to_string();
        let slash_root = slash
            .map(|s| PitchClass::parse_prefix(s).0)
            .unwrap_or(PitchClass::None);
        Self {
            accidental: Accidental::of(&name),
            name,
            root,
            description,
            slash_root,
        }
    }

    pub fn no_chord() -> Self {
        Self::of(NO_CHORD)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn root(&self) -> PitchClass {
        self.root
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn slash_root(&self) -> PitchClass {
        self.slash_root
    }

    pub fn has_slash(&self) -> bool {
        self.slash_root != PitchClass::None
    }

    pub fn accidental(&self) -> Accidental {
        self.accidental
    }

    pub fn is_no_chord(&self) -> bool {
        self.root == PitchClass::None
    }

    /// The bass pitch class: the slash root if present, else the root.
    pub fn bass(&self) -> PitchClass {
        if self.has_slash() {
            self.slash_root
        } else {
            self.root
        }
    }

    /// The name with any slash root removed, e.g. "Ab" for "Ab/C".
    pub fn name_without_slash(&self) -> &str {
        match self.name.split_once('/') {
            Some((head, _)) => head.trim(),
            None => &self.name,
        }
    }

    /// Canonical spelling of the description, looked up in the synonym
    /// table. Unlisted descriptions are returned with whitespace removed.
    pub fn canonical_description(&self) -> String {
        let compact: String = self
            .description
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect();
        SYNONYMS
            .iter()
            .find(|row| row.contains(&compact.as_str()))
            .map(|row| row[0].to_string())
            .unwrap_or(compact)
    }

    /// Classify how `candidate` fits this chord, or `None` for no match.
    pub fn match_with(&self, candidate: &Chord) -> Option<ChordMatch> {
        if self.name == candidate.name {
            return Some(ChordMatch::Exact);
        }
        if (self.has_slash() || candidate.has_slash())
            && self.name_without_slash() == candidate.name_without_slash()
        {
            return Some(ChordMatch::SlashRoot);
        }
        if !self.is_no_chord()
            && self.root == candidate.root
            && self.slash_root == candidate.slash_root
            && self.canonical_description() == candidate.canonical_description()
        {
            return Some(ChordMatch::Synonym);
        }
        None
    }

    /// Transpose root and slash root, respelling with this chord's
    /// accidental.
    pub fn shift(&self, semitones: i32) -> Self {
        if self.is_no_chord() {
            return self.clone();
        }
        let root = self.root.shift(semitones).name(self.accidental);
        let mut name = format!("{root}{}", self.description_separator());
        if self.has_slash() {
            name.push('/');
            name.push_str(self.slash_root.shift(semitones).name(self.accidental));
        }
        Self::of(&name)
    }

    fn description_separator(&self) -> String {
        if self.description.is_empty() {
            return String::new();
        }
        // Preserve a space between root and a word-like description.
        let head = self.name_without_slash();
        let root_len = PitchClass::parse_prefix(head).1;
        if head[root_len..].starts_with(' ') {
            format!(" {}", self.description)
        } else {
            self.description.clone()
        }
    }
}

impl fmt::Display for Chord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Trim and collapse internal whitespace runs to one space.
pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}
