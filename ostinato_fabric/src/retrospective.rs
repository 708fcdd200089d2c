// Retrospective: a read-only window over recently crafted history.
//
// Built once per target segment, before any crafting starts. It walks back
// from the immediately preceding segment and keeps every crafted segment
// that belongs to the same main-program through-line: the walk stops at the
// first segment that is not `Crafted`, has no Main choice, or chose a
// different main program than the previous segment did.
//
// The retained entities are cloned out of the segment store, so the window
// stays valid while the fabricator writes the target segment.
//
// See also: `fabricator.rs` (continuity lookups), `sticky_bun.rs` (previous
// meta), `factory.rs` (construction entry point).

use crate::enums::{SegmentState, SegmentType};
use crate::segment::*;
use crate::segment_store::SegmentStore;
use ostinato_content::enums::{InstrumentMode, InstrumentType, ProgramType};
use ostinato_content::ids::InstrumentId;
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Clone, Debug, Default)]
struct Slice {
    choices: Vec<SegmentChoice>,
    arrangements: Vec<SegmentChoiceArrangement>,
    picks: Vec<SegmentChoiceArrangementPick>,
    chords: Vec<SegmentChord>,
    voicings: Vec<SegmentChordVoicing>,
    memes: Vec<SegmentMeme>,
    metas: Vec<SegmentMeta>,
}

impl Slice {
    fn of(store: &SegmentStore, id: SegmentId) -> Self {
        fn owned<E: crate::segment_store::SegmentEntity>(
            store: &SegmentStore,
            id: SegmentId,
        ) -> Vec<E> {
            store.read_all::<E>(id).into_iter().cloned().collect()
        }
        let mut chords: Vec<SegmentChord> = owned(store, id);
        chords.sort_by(|a, b| a.position.total_cmp(&b.position));
        Self {
            choices: owned(store, id),
            arrangements: owned(store, id),
            picks: owned(store, id),
            chords,
            voicings: owned(store, id),
            memes: owned(store, id),
            metas: owned(store, id),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct Retrospective {
    previous_segment: Option<Segment>,
    /// The previous segment's entities, kept even when it starts no lineage.
    previous: Option<Slice>,
    /// Retained lineage, oldest first.
    segments: Vec<Segment>,
    slices: BTreeMap<SegmentId, Slice>,
}

impl Retrospective {
    /// A window with no history, as seen by the first segment of a chain.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn load(store: &SegmentStore, segment_id: SegmentId) -> Self {
        let Some(previous) = segment_id.previous().and_then(|id| store.read_segment(id)) else {
            return Self::empty();
        };
        let mut retro = Self {
            previous_segment: Some(previous.clone()),
            previous: Some(Slice::of(store, previous.id)),
            ..Self::default()
        };
        let Some(main_program) = store
            .read_choice(previous.id, ProgramType::Main)
            .and_then(|c| c.program_id)
        else {
            debug!(segment_id = segment_id.0, "previous segment has no main choice");
            return retro;
        };

        let mut cursor = Some(previous.id);
        while let Some(id) = cursor {
            let Some(segment) = store.read_segment(id) else {
                break;
            };
            let same_main = store
                .read_choice(id, ProgramType::Main)
                .and_then(|c| c.program_id)
                == Some(main_program);
            if segment.state != SegmentState::Crafted || !same_main {
                break;
            }
            retro.segments.push(segment.clone());
            retro.slices.insert(id, Slice::of(store, id));
            cursor = id.previous();
        }
        retro.segments.reverse();
        debug!(
            segment_id = segment_id.0,
            retained = retro.segments.len(),
            "loaded retrospective"
        );
        retro
    }

    pub fn previous_segment(&self) -> Option<&Segment> {
        self.previous_segment.as_ref()
    }

    /// Retained lineage, oldest first.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    fn previous_slice(&self) -> Option<&Slice> {
        self.previous.as_ref()
    }

    fn flat<'a, T: 'a>(&'a self, field: impl Fn(&'a Slice) -> &'a Vec<T>) -> Vec<&'a T> {
        self.slices.values().flat_map(|s| field(s).iter()).collect()
    }

    // -- choices ----------------------------------------------------------------

    /// Every choice of the retained lineage.
    pub fn choices(&self) -> Vec<&SegmentChoice> {
        self.flat(|s| &s.choices)
    }

    pub fn previous_choices(&self) -> Vec<&SegmentChoice> {
        self.previous_slice()
            .map(|s| s.choices.iter().collect())
            .unwrap_or_default()
    }

    pub fn previous_choice_of_type(&self, program_type: ProgramType) -> Option<&SegmentChoice> {
        self.previous_choices()
            .into_iter()
            .find(|c| c.program_type == Some(program_type))
    }

    pub fn previous_choices_of_instrument(
        &self,
        instrument_id: InstrumentId,
    ) -> Vec<&SegmentChoice> {
        self.previous_choices()
            .into_iter()
            .filter(|c| c.instrument_id == Some(instrument_id))
            .collect()
    }

    pub fn previous_choices_of_instrument_type(
        &self,
        instrument_type: InstrumentType,
    ) -> Vec<&SegmentChoice> {
        self.previous_choices()
            .into_iter()
            .filter(|c| c.instrument_type == Some(instrument_type))
            .collect()
    }

    pub fn previous_choices_of_type_and_mode(
        &self,
        instrument_type: InstrumentType,
        instrument_mode: InstrumentMode,
    ) -> Vec<&SegmentChoice> {
        self.previous_choices_of_instrument_type(instrument_type)
            .into_iter()
            .filter(|c| c.instrument_mode == Some(instrument_mode))
            .collect()
    }

    /// The choices a segment of `segment_type` may continue from: the whole
    /// lineage for `Continue`, only macro and main choices when the main
    /// program changes, and nothing for the first segment.
    pub fn choices_for(&self, segment_type: SegmentType) -> Vec<&SegmentChoice> {
        match segment_type {
            SegmentType::Continue => self.choices(),
            SegmentType::NextMain | SegmentType::NextMacro => self
                .choices()
                .into_iter()
                .filter(|c| matches!(c.program_type, Some(ProgramType::Macro | ProgramType::Main)))
                .collect(),
            SegmentType::Initial | SegmentType::Pending => Vec::new(),
        }
    }

    // -- arrangements and picks -----------------------------------------------

    pub fn arrangements(&self) -> Vec<&SegmentChoiceArrangement> {
        self.flat(|s| &s.arrangements)
    }

    pub fn picks(&self) -> Vec<&SegmentChoiceArrangementPick> {
        self.flat(|s| &s.picks)
    }

    /// The choice a retained pick was made under.
    pub fn choice_of_pick(&self, pick: &SegmentChoiceArrangementPick) -> Option<&SegmentChoice> {
        let slice = self.slices.get(&pick.segment_id).or_else(|| {
            self.previous_slice()
                .filter(|_| self.previous_segment.as_ref().is_some_and(|s| s.id == pick.segment_id))
        })?;
        let arrangement = slice
            .arrangements
            .iter()
            .find(|a| a.id == pick.segment_choice_arrangement_id)?;
        slice.choices.iter().find(|c| c.id == arrangement.segment_choice_id)
    }

    /// Picks of the previous segment made for one instrument.
    pub fn previous_picks_of_instrument(
        &self,
        instrument_id: InstrumentId,
    ) -> Vec<&SegmentChoiceArrangementPick> {
        let Some(slice) = self.previous_slice() else {
            return Vec::new();
        };
        slice
            .picks
            .iter()
            .filter(|p| {
                self.choice_of_pick(p)
                    .is_some_and(|c| c.instrument_id == Some(instrument_id))
            })
            .collect()
    }

    // -- harmony, memes, meta -----------------------------------------------------

    /// Chords of every retained segment, in segment then position order.
    pub fn chords(&self) -> Vec<&SegmentChord> {
        self.flat(|s| &s.chords)
    }

    pub fn voicings(&self) -> Vec<&SegmentChordVoicing> {
        self.flat(|s| &s.voicings)
    }

    pub fn previous_memes(&self) -> Vec<&SegmentMeme> {
        self.previous_slice()
            .map(|s| s.memes.iter().collect())
            .unwrap_or_default()
    }

    /// Meta written to the previous segment under `key`.
    pub fn previous_meta(&self, key: &str) -> Option<&SegmentMeta> {
        self.previous_slice()?.metas.iter().find(|m| m.key == key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ostinato_content::IdGenerator;
    use ostinato_content::ids::ProgramId;

    struct History {
        store: SegmentStore,
        ids: IdGenerator,
    }

    impl History {
        fn new() -> Self {
            let mut ids = IdGenerator::new(21);
            let mut store = SegmentStore::new();
            store
                .put_chain(Chain {
                    id: ChainId::generate(&mut ids),
                    ..Default::default()
                })
                .unwrap();
            Self { store, ids }
        }

        /// Append a crafted segment whose main choice is `main`.
        fn push(&mut self, main: Option<ProgramId>, meta: Option<(&str, &str)>) -> SegmentId {
            let chain_id = self.store.chain().unwrap().id;
            let (id, begin) = match self.store.read_segment_last() {
                Some(last) => (last.id.next(), last.end_at_chain_micros().unwrap()),
                None => (SegmentId(0), 0),
            };
            self.store
                .create_segment(Segment {
                    id,
                    chain_id,
                    state: SegmentState::Crafting,
                    begin_at_chain_micros: begin,
                    duration_micros: Some(1_000),
                    ..Default::default()
                })
                .unwrap();
            if let Some(program) = main {
                self.store
                    .put(SegmentChoice {
                        id: SegmentChoiceId::generate(&mut self.ids),
                        segment_id: id,
                        program_id: Some(program),
                        program_type: Some(ProgramType::Main),
                        ..Default::default()
                    })
                    .unwrap();
            }
            if let Some((key, value)) = meta {
                self.store
                    .put(SegmentMeta {
                        id: SegmentMetaId::generate(&mut self.ids),
                        segment_id: id,
                        key: key.to_string(),
                        value: value.to_string(),
                    })
                    .unwrap();
            }
            self.store.update_segment_state(id, SegmentState::Crafted).unwrap();
            id
        }
    }

    #[test]
    fn first_segment_has_empty_window() {
        let history = History::new();
        let retro = Retrospective::load(&history.store, SegmentId(0));
        assert!(retro.previous_segment().is_none());
        assert!(retro.segments().is_empty());
    }

    #[test]
    fn lineage_stops_at_main_program_change() {
        let mut history = History::new();
        let a = ProgramId::generate(&mut history.ids);
        let b = ProgramId::generate(&mut history.ids);
        history.push(Some(a), None);
        history.push(Some(b), None);
        history.push(Some(b), Some(("k", "v")));
        let retro = Retrospective::load(&history.store, SegmentId(3));
        let ids: Vec<u32> = retro.segments().iter().map(|s| s.id.0).collect();
        assert_eq!(ids, vec![1, 2]);
        assert_eq!(retro.previous_segment().map(|s| s.id), Some(SegmentId(2)));
        assert_eq!(retro.previous_meta("k").map(|m| m.value.as_str()), Some("v"));
        assert_eq!(retro.choices().len(), 2);
    }

    #[test]
    fn missing_main_choice_keeps_only_previous_segment() {
        let mut history = History::new();
        history.push(None, Some(("StickyBun_x", "[3]")));
        let retro = Retrospective::load(&history.store, SegmentId(1));
        assert_eq!(retro.previous_segment().map(|s| s.id), Some(SegmentId(0)));
        assert!(retro.segments().is_empty());
        assert!(retro.choices().is_empty());
        assert!(retro.previous_choice_of_type(ProgramType::Main).is_none());
        assert_eq!(
            retro.previous_meta("StickyBun_x").map(|m| m.value.as_str()),
            Some("[3]")
        );
    }

    #[test]
    fn choices_for_segment_type() {
        let mut history = History::new();
        let main = ProgramId::generate(&mut history.ids);
        history.push(Some(main), None);
        let retro = Retrospective::load(&history.store, SegmentId(1));
        assert_eq!(retro.choices_for(SegmentType::Continue).len(), 1);
        assert_eq!(retro.choices_for(SegmentType::NextMain).len(), 1);
        assert!(retro.choices_for(SegmentType::Initial).is_empty());
    }
}
