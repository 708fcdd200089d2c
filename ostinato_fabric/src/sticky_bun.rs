// Sticky buns: persisted note choices for atonal pattern events.
//
// An atonal event ("X") in a tonal voice must land on some voicing note,
// and that choice should not wander every time the pattern repeats. A
// sticky bun stores one value in `[0, 100)` per tone of the event; at pick
// time each value selects a note by its relative position within the
// current voicing, lowest to highest. The same bun over a different chord
// therefore lands on the "same place" in the new voicing.
//
// Buns live in `SegmentMeta` under `StickyBun_{event uuid}` as JSON, and
// the fabricator carries them forward from the previous segment.
//
// See also: `Fabricator::sticky_bun`, `craft::pick_notes_for_event`.

use crate::error::FabricationError;
use ostinato_content::ids::ProgramSequencePatternEventId;
use ostinato_music::Note;
use ostinato_prng::SeededRng;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

const META_KEY_PREFIX: &str = "StickyBun_";

/// Exclusive upper bound of a bun value.
const VALUE_CEILING: u64 = 100;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StickyBun {
    pub parent_id: ProgramSequencePatternEventId,
    pub values: SmallVec<[u8; 8]>,
}

impl StickyBun {
    /// A fresh bun with `size` random values.
    pub fn generate(
        parent_id: ProgramSequencePatternEventId,
        size: usize,
        rng: &mut SeededRng,
    ) -> Self {
        let values = (0..size).map(|_| rng.below(VALUE_CEILING) as u8).collect();
        Self { parent_id, values }
    }

    pub fn meta_key_of(parent_id: ProgramSequencePatternEventId) -> String {
        format!("{META_KEY_PREFIX}{}", parent_id.uuid())
    }

    pub fn meta_key(&self) -> String {
        Self::meta_key_of(self.parent_id)
    }

    /// The voicing note picked by the value at `index`. Falls back to the
    /// first value when the event has more tones than the bun, and to an
    /// atonal note when there is nothing to pick from.
    pub fn compute(&self, voicing_notes: &[Note], index: usize) -> Note {
        let mut notes: Vec<Note> = voicing_notes
            .iter()
            .filter(|n| !n.is_atonal())
            .copied()
            .collect();
        let Some(value) = self.values.get(index).or(self.values.first()) else {
            return Note::atonal();
        };
        if notes.is_empty() {
            return Note::atonal();
        }
        notes.sort();
        let slot = (notes.len() * *value as usize) / VALUE_CEILING as usize;
        notes[slot.min(notes.len() - 1)]
    }

    pub fn to_json(&self) -> Result<String, FabricationError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self, FabricationError> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ostinato_content::IdGenerator;

    fn bun(values: &[u8]) -> StickyBun {
        StickyBun {
            parent_id: ProgramSequencePatternEventId::generate(&mut IdGenerator::new(1)),
            values: values.iter().copied().collect(),
        }
    }

    fn notes(names: &[&str]) -> Vec<Note> {
        names.iter().map(|n| Note::of(n)).collect()
    }

    #[test]
    fn values_pick_relative_position_in_voicing() {
        let b = bun(&[0, 50, 99]);
        let voicing = notes(&["G4", "C4", "E4"]);
        assert_eq!(b.compute(&voicing, 0), Note::of("C4"));
        assert_eq!(b.compute(&voicing, 1), Note::of("E4"));
        assert_eq!(b.compute(&voicing, 2), Note::of("G4"));
    }

    #[test]
    fn same_bun_lands_on_same_place_in_another_chord() {
        let b = bun(&[70]);
        assert_eq!(b.compute(&notes(&["C4", "E4", "G4"]), 0), Note::of("G4"));
        assert_eq!(b.compute(&notes(&["A3", "C4", "F4"]), 0), Note::of("F4"));
    }

    #[test]
    fn degenerate_inputs_are_atonal() {
        assert!(bun(&[]).compute(&notes(&["C4"]), 0).is_atonal());
        assert!(bun(&[10]).compute(&[], 0).is_atonal());
        assert_eq!(bun(&[10]).compute(&notes(&["C4"]), 5), Note::of("C4"));
    }

    #[test]
    fn generated_values_stay_below_ceiling() {
        let mut rng = SeededRng::new(4);
        let b = StickyBun::generate(bun(&[]).parent_id, 64, &mut rng);
        assert_eq!(b.values.len(), 64);
        assert!(b.values.iter().all(|v| *v < 100));
    }

    #[test]
    fn meta_value_round_trips() {
        let b = bun(&[3, 97]);
        assert!(b.meta_key().starts_with("StickyBun_"));
        assert_eq!(StickyBun::from_json(&b.to_json().unwrap()).unwrap(), b);
    }
}
