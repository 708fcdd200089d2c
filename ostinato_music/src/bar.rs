// Bar length in beats, and the subsection size used by delta arcs.

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bar {
    beats: u32,
}

impl Bar {
    /// A bar of `beats` beats; `None` for a zero-length bar.
    pub fn of(beats: u32) -> Option<Self> {
        (beats > 0).then_some(Self { beats })
    }

    pub fn beats(&self) -> u32 {
        self.beats
    }

    /// The largest power-of-two multiple of the bar that still divides
    /// `total_beats` into at least four subsections. Never less than one
    /// bar.
    pub fn compute_subsection_beats(&self, total_beats: u32) -> u32 {
        let mut sub = self.beats;
        while total_beats / (sub * 2) >= 4 {
            sub *= 2;
        }
        sub
    }
}

impl Default for Bar {
    fn default() -> Self {
        Self { beats: 4 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_beats_is_rejected() {
        assert!(Bar::of(0).is_none());
        assert_eq!(Bar::of(3).map(|b| b.beats()), Some(3));
    }

    #[test]
    fn subsections_scale_with_total() {
        let bar = Bar::default();
        assert_eq!(bar.compute_subsection_beats(16), 4);
        assert_eq!(bar.compute_subsection_beats(32), 8);
        assert_eq!(bar.compute_subsection_beats(64), 16);
        assert_eq!(bar.compute_subsection_beats(4), 4);
        assert_eq!(Bar::of(3).map(|b| b.compute_subsection_beats(48)), Some(12));
    }
}
