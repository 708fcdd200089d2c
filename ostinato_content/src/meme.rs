// Memes: descriptive tags, their taxonomy, stacks and isometry scores.
//
// Memes are short tags ("WINTER", "DARK") attached to programs, sequence
// bindings and instruments. A segment accumulates the memes of everything
// chosen for it, and later choices are biased toward candidates sharing
// those memes.
//
// - `MemeTaxonomy` groups memes into mutually-exclusive categories, e.g.
//   SEASON = {WINTER, SPRING, SUMMER, FALL}. At most one member of a
//   category may be active on a segment.
// - `MemeStack` is a set of active memes; `is_allowed` checks taxonomy
//   exclusivity and anti-memes ("!DARK" cannot coexist with "DARK").
// - `MemeIsometry` scores a candidate's memes against a source set: one
//   point per exact match. Taxonomy violations are not low scores; they
//   are rejected outright through `is_allowed`.
//
// All names are normalised with `to_meme` (uppercase alphanumerics, with a
// leading `!` kept) so "winter " and "Winter" compare equal.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Prefix marking an anti-meme.
pub const ANTI_PREFIX: char = '!';

/// Normalise a raw meme name.
pub fn to_meme(raw: &str) -> String {
    let raw = raw.trim();
    let (anti, body) = match raw.strip_prefix(ANTI_PREFIX) {
        Some(rest) => (true, rest),
        None => (false, raw),
    };
    let body: String = body
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_uppercase)
        .collect();
    if anti && !body.is_empty() {
        format!("{ANTI_PREFIX}{body}")
    } else {
        body
    }
}

/// Normalise a collection of names into a sorted, deduplicated set.
pub fn to_memes<'a>(raw: impl IntoIterator<Item = &'a str>) -> BTreeSet<String> {
    raw.into_iter()
        .map(to_meme)
        .filter(|m| !m.is_empty())
        .collect()
}

// ---------------------------------------------------------------------------
// Taxonomy
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemeCategory {
    pub name: String,
    pub memes: Vec<String>,
}

impl MemeCategory {
    pub fn new(name: &str, memes: &[&str]) -> Self {
        Self {
            name: to_meme(name),
            memes: memes.iter().map(|m| to_meme(m)).collect(),
        }
    }

    pub fn contains(&self, meme: &str) -> bool {
        self.memes.iter().any(|m| to_meme(m) == meme)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MemeTaxonomy {
    categories: Vec<MemeCategory>,
}

impl MemeTaxonomy {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn of(categories: Vec<MemeCategory>) -> Self {
        Self { categories }
    }

    /// The taxonomy templates get when they do not configure one.
    pub fn default_taxonomy() -> Self {
        Self::of(vec![
            MemeCategory::new("COLOR", &["BLUE", "GREEN", "RED"]),
            MemeCategory::new("SEASON", &["FALL", "SPRING", "SUMMER", "WINTER"]),
        ])
    }

    pub fn categories(&self) -> &[MemeCategory] {
        &self.categories
    }

    /// True if no category has more than one member in `memes`.
    pub fn is_allowed(&self, memes: &BTreeSet<String>) -> bool {
        self.categories
            .iter()
            .all(|c| memes.iter().filter(|m| c.contains(m)).count() <= 1)
    }
}

// ---------------------------------------------------------------------------
// Stack
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default)]
pub struct MemeStack {
    taxonomy: MemeTaxonomy,
    memes: BTreeSet<String>,
}

impl MemeStack {
    pub fn of<'a>(taxonomy: &MemeTaxonomy, memes: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            taxonomy: taxonomy.clone(),
            memes: to_memes(memes),
        }
    }

    pub fn memes(&self) -> &BTreeSet<String> {
        &self.memes
    }

    /// True when the stack holds no anti-meme conflict and respects the
    /// taxonomy.
    pub fn is_allowed(&self) -> bool {
        let anti_conflict = self.memes.iter().any(|m| {
            m.strip_prefix(ANTI_PREFIX)
                .is_some_and(|body| self.memes.contains(body))
        });
        !anti_conflict && self.taxonomy.is_allowed(&self.memes)
    }
}

// ---------------------------------------------------------------------------
// Isometry
// ---------------------------------------------------------------------------

/// Similarity of candidate meme sets to a fixed source set.
#[derive(Clone, Debug, Default)]
pub struct MemeIsometry {
    taxonomy: MemeTaxonomy,
    sources: BTreeSet<String>,
}

impl MemeIsometry {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn of<'a>(taxonomy: &MemeTaxonomy, sources: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            taxonomy: taxonomy.clone(),
            sources: to_memes(sources),
        }
    }

    pub fn sources(&self) -> &BTreeSet<String> {
        &self.sources
    }

    pub fn add(&mut self, meme: &str) {
        let meme = to_meme(meme);
        if !meme.is_empty() {
            self.sources.insert(meme);
        }
    }

    /// One point per target meme also present in the sources.
    pub fn score<'a>(&self, targets: impl IntoIterator<Item = &'a str>) -> u32 {
        to_memes(targets)
            .iter()
            .filter(|t| self.sources.contains(*t))
            .count() as u32
    }

    /// Whether adding `targets` to the sources keeps the stack allowed.
    pub fn is_allowed<'a>(&self, targets: impl IntoIterator<Item = &'a str>) -> bool {
        let mut combined = self.sources.clone();
        combined.extend(to_memes(targets));
        MemeStack {
            taxonomy: self.taxonomy.clone(),
            memes: combined,
        }
        .is_allowed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn to_meme_normalises() {
        assert_eq!(to_meme(" winter "), "WINTER");
        assert_eq!(to_meme("Deep-House"), "DEEPHOUSE");
        assert_eq!(to_meme("!dark"), "!DARK");
        assert_eq!(to_meme("!"), "");
        assert_eq!(to_memes(["a", "A", " a "]).len(), 1);
    }

    #[test]
    fn taxonomy_allows_one_per_category() {
        let tax = MemeTaxonomy::default_taxonomy();
        assert!(tax.is_allowed(&to_memes(["RED", "WINTER", "DARK"])));
        assert!(!tax.is_allowed(&to_memes(["RED", "BLUE"])));
        assert!(MemeTaxonomy::empty().is_allowed(&to_memes(["RED", "BLUE"])));
    }

    #[test]
    fn anti_memes_conflict_with_their_body() {
        let tax = MemeTaxonomy::empty();
        assert!(!MemeStack::of(&tax, ["DARK", "!dark"]).is_allowed());
        assert!(MemeStack::of(&tax, ["LIGHT", "!DARK"]).is_allowed());
    }

    #[test]
    fn isometry_scores_exact_matches() {
        let iso = MemeIsometry::of(&MemeTaxonomy::empty(), ["70BPM", "Dark"]);
        assert_eq!(iso.score(["70bpm"]), 1);
        assert_eq!(iso.score(["DARK", "70BPM", "LOUD"]), 2);
        assert_eq!(iso.score(["90BPM"]), 0);
    }

    #[test]
    fn isometry_rejects_taxonomy_violation() {
        let iso = MemeIsometry::of(&MemeTaxonomy::default_taxonomy(), ["WINTER"]);
        assert!(iso.is_allowed(["RED"]));
        assert!(iso.is_allowed(["winter"]));
        assert!(!iso.is_allowed(["SUMMER"]));
    }

    #[test]
    fn taxonomy_json_is_a_list_of_categories() {
        let tax: MemeTaxonomy =
            serde_json::from_str(r#"[{"name": "MOOD", "memes": ["HAPPY", "SAD"]}]"#).unwrap();
        assert_eq!(tax.categories().len(), 1);
        assert!(!tax.is_allowed(&to_memes(["HAPPY", "SAD"])));
    }
}
