// MarbleBag: phased, weighted random selection.
//
// Candidates go into numbered phases with a marble count each. `pick` draws
// from the lowest phase that holds any marbles and ignores every later
// phase, so phase numbers express preference tiers ("directly bound before
// published", "preferred event before any event") while weights express
// likelihood within a tier.
//
// Draws use the fabricator's `SeededRng`; candidates within a phase are kept
// in a `BTreeMap` so the draw order never depends on insertion order.

use ostinato_prng::SeededRng;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Clone, Debug)]
pub struct MarbleBag<T: Copy + Ord + fmt::Display> {
    phases: BTreeMap<u32, BTreeMap<T, u64>>,
}

impl<T: Copy + Ord + fmt::Display> Default for MarbleBag<T> {
    fn default() -> Self {
        Self { phases: BTreeMap::new() }
    }
}

impl<T: Copy + Ord + fmt::Display> MarbleBag<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `marbles` for `item` in `phase`. Adding the same item twice in a
    /// phase accumulates.
    pub fn add(&mut self, phase: u32, item: T, marbles: u64) {
        *self.phases.entry(phase).or_default().entry(item).or_insert(0) += marbles;
    }

    /// Total marbles across every phase.
    pub fn size(&self) -> u64 {
        self.phases.values().flat_map(|p| p.values()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Draw from the lowest phase that has marbles.
    pub fn pick(&self, rng: &mut SeededRng) -> Option<T> {
        for phase in self.phases.values() {
            let items: Vec<T> = phase.keys().copied().collect();
            let weights: Vec<u64> = phase.values().copied().collect();
            if let Some(i) = rng.weighted_index(&weights) {
                return items.get(i).copied();
            }
        }
        None
    }

    /// Phase-by-phase contents, for segment debug reports.
    pub fn report(&self) -> Value {
        let mut phases = Map::new();
        for (phase, items) in &self.phases {
            let entries: Map<String, Value> = items
                .iter()
                .map(|(item, marbles)| (item.to_string(), Value::from(*marbles)))
                .collect();
            phases.insert(phase.to_string(), Value::Object(entries));
        }
        Value::Object(phases)
    }
}

/// Uniform pick from a slice.
pub fn quick_pick<T: Clone>(items: &[T], rng: &mut SeededRng) -> Option<T> {
    if items.is_empty() {
        None
    } else {
        items.get(rng.range_usize(0, items.len())).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn earlier_phase_always_wins() {
        let mut bag = MarbleBag::new();
        bag.add(2, 20u32, 1_000);
        bag.add(1, 10u32, 1);
        let mut rng = SeededRng::new(3);
        for _ in 0..50 {
            assert_eq!(bag.pick(&mut rng), Some(10));
        }
    }

    #[test]
    fn empty_phase_falls_through() {
        let mut bag = MarbleBag::new();
        bag.add(1, 1u32, 0);
        bag.add(3, 7u32, 2);
        assert_eq!(bag.size(), 2);
        assert_eq!(bag.pick(&mut SeededRng::new(1)), Some(7));
        assert!(MarbleBag::<u32>::new().pick(&mut SeededRng::new(1)).is_none());
    }

    #[test]
    fn weights_bias_the_draw() {
        let mut bag = MarbleBag::new();
        bag.add(1, 1u32, 1);
        bag.add(1, 2u32, 9);
        let mut rng = SeededRng::new(11);
        let heavy = (0..1_000).filter(|_| bag.pick(&mut rng) == Some(2)).count();
        assert!(heavy > 800, "heavy item drawn {heavy} times");
    }

    #[test]
    fn report_lists_phases_and_marbles() {
        let mut bag = MarbleBag::new();
        bag.add(1, 5u32, 3);
        bag.add(1, 5u32, 1);
        assert_eq!(bag.report().to_string(), r#"{"1":{"5":4}}"#);
    }

    #[test]
    fn quick_pick_handles_empty() {
        let mut rng = SeededRng::new(0);
        assert_eq!(quick_pick::<u8>(&[], &mut rng), None);
        assert_eq!(quick_pick(&[9], &mut rng), Some(9));
    }
}
