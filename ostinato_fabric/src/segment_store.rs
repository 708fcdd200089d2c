// Segment store: the read-write half of fabrication.
//
// Holds one `Chain`, its gap-free run of `Segment`s, and every sub-entity
// partitioned by owning segment id. Sub-entities go through the generic
// `SegmentEntity` repository (`put`, `read`, `read_all`, `delete`); each kind
// implements it through the `segment_entity!` table, mirroring how the
// content store declares its tables.
//
// Two indexes sit beside the primary `segments` table:
// - `by_begin` maps `begin_at_chain_micros` to segment id, so "segment at
//   chain time T" is one `range(..=T).next_back()` away. Because segments are
//   half-open, the later segment wins when T sits on a boundary, and also
//   when a zero-length segment shares its begin with its successor.
// - `partitions` maps segment id to that segment's sub-entity tables, so
//   clearing or pruning a segment drops everything below it in one step.
//
// Invariants enforced here:
// - Segment ids are gap-free: a new segment must take the next id, and it
//   must begin exactly where the previous one ends.
// - Segment state changes go through `protect_segment_state_transition`.
// - A segment's chain never changes.
// - Sub-entities are written or deleted only while their segment is
//   `Crafting`.
//
// **Critical constraint: determinism.** All tables are `BTreeMap`s.
//
// See also: `segment.rs` (the entities), `retrospective.rs` (read-only view
// over crafted history), `fabricator.rs` (the only writer during craft).

use crate::enums::SegmentState;
use crate::error::FabricationError;
use crate::segment::*;
use ostinato_content::enums::ProgramType;
use std::collections::BTreeMap;
use std::fmt;
use tracing::debug;

// ---------------------------------------------------------------------------
// Generic repository
// ---------------------------------------------------------------------------

/// A sub-entity kind stored per segment.
pub trait SegmentEntity: Clone + fmt::Debug {
    type Id: Copy + Ord + fmt::Display + fmt::Debug;

    const NAME: &'static str;

    fn id(&self) -> Self::Id;

    fn segment_id(&self) -> SegmentId;

    fn partition(p: &SegmentPartition) -> &BTreeMap<Self::Id, Self>;

    fn partition_mut(p: &mut SegmentPartition) -> &mut BTreeMap<Self::Id, Self>;
}

/// Every sub-entity table of one segment.
#[derive(Clone, Debug, Default)]
pub struct SegmentPartition {
    choices: BTreeMap<SegmentChoiceId, SegmentChoice>,
    arrangements: BTreeMap<SegmentChoiceArrangementId, SegmentChoiceArrangement>,
    picks: BTreeMap<SegmentChoiceArrangementPickId, SegmentChoiceArrangementPick>,
    chords: BTreeMap<SegmentChordId, SegmentChord>,
    voicings: BTreeMap<SegmentChordVoicingId, SegmentChordVoicing>,
    memes: BTreeMap<SegmentMemeId, SegmentMeme>,
    messages: BTreeMap<SegmentMessageId, SegmentMessage>,
    metas: BTreeMap<SegmentMetaId, SegmentMeta>,
}

macro_rules! segment_entity {
    ($entity:ident, $id:ident, $table:ident) => {
        impl SegmentEntity for $entity {
            type Id = $id;
            const NAME: &'static str = stringify!($entity);

            fn id(&self) -> $id {
                self.id
            }

            fn segment_id(&self) -> SegmentId {
                self.segment_id
            }

            fn partition(p: &SegmentPartition) -> &BTreeMap<$id, Self> {
                &p.$table
            }

            fn partition_mut(p: &mut SegmentPartition) -> &mut BTreeMap<$id, Self> {
                &mut p.$table
            }
        }
    };
}

segment_entity!(SegmentChoice, SegmentChoiceId, choices);
segment_entity!(SegmentChoiceArrangement, SegmentChoiceArrangementId, arrangements);
segment_entity!(SegmentChoiceArrangementPick, SegmentChoiceArrangementPickId, picks);
segment_entity!(SegmentChord, SegmentChordId, chords);
segment_entity!(SegmentChordVoicing, SegmentChordVoicingId, voicings);
segment_entity!(SegmentMeme, SegmentMemeId, memes);
segment_entity!(SegmentMessage, SegmentMessageId, messages);
segment_entity!(SegmentMeta, SegmentMetaId, metas);

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Fail unless `from -> to` is an allowed segment state transition.
pub fn protect_segment_state_transition(
    from: SegmentState,
    to: SegmentState,
) -> Result<(), FabricationError> {
    use SegmentState::*;
    let allowed = match from {
        Planned => matches!(to, Planned | Crafting),
        Crafting => matches!(to, Crafting | Crafted | Failed | Planned),
        Crafted => matches!(to, Crafted | Crafting),
        Failed => matches!(to, Failed),
    };
    if allowed {
        Ok(())
    } else {
        Err(FabricationError::IllegalStateTransition { from, to })
    }
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, Default)]
pub struct SegmentStore {
    chain: Option<Chain>,
    segments: BTreeMap<SegmentId, Segment>,
    by_begin: BTreeMap<i64, SegmentId>,
    partitions: BTreeMap<SegmentId, SegmentPartition>,
}

impl SegmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    // -- chain -----------------------------------------------------------------

    /// Install the chain. Replacing it with a different chain id is refused
    /// while segments exist.
    pub fn put_chain(&mut self, chain: Chain) -> Result<(), FabricationError> {
        if let Some(existing) = &self.chain
            && existing.id != chain.id
            && !self.segments.is_empty()
        {
            return Err(FabricationError::ChainMismatch {
                reason: format!("store already holds segments of {}", existing.id),
            });
        }
        self.chain = Some(chain);
        Ok(())
    }

    pub fn chain(&self) -> Result<&Chain, FabricationError> {
        self.chain.as_ref().ok_or_else(|| FabricationError::not_found("Chain"))
    }

    // -- segments --------------------------------------------------------------

    /// Add a new segment. It must take the next gap-free id and begin where
    /// the last segment ends.
    pub fn create_segment(&mut self, segment: Segment) -> Result<Segment, FabricationError> {
        let chain = self.chain()?;
        if segment.chain_id != chain.id {
            return Err(FabricationError::ChainMismatch {
                reason: format!("{} belongs to {}, not {}", segment.id, segment.chain_id, chain.id),
            });
        }
        if let Some(last) = self.read_segment_last() {
            if segment.id != last.id.next() {
                return Err(FabricationError::ChainMismatch {
                    reason: format!(
                        "expected {} after {}, got {}",
                        last.id.next(),
                        last.id,
                        segment.id
                    ),
                });
            }
            let end = last.end_at_chain_micros().ok_or_else(|| FabricationError::Configuration {
                subject: last.id.to_string(),
                reason: "previous segment has no duration".to_string(),
            })?;
            if segment.begin_at_chain_micros != end {
                return Err(FabricationError::ChainMismatch {
                    reason: format!(
                        "{} begins at {} but previous segment ends at {}",
                        segment.id, segment.begin_at_chain_micros, end
                    ),
                });
            }
        }
        self.by_begin.insert(segment.begin_at_chain_micros, segment.id);
        self.partitions.entry(segment.id).or_default();
        self.segments.insert(segment.id, segment.clone());
        debug!(segment_id = segment.id.0, begin = segment.begin_at_chain_micros, "created segment");
        Ok(segment)
    }

    /// Replace a segment's fields. The state change, if any, must be
    /// allowed and the chain id must not change.
    pub fn update_segment(&mut self, segment: Segment) -> Result<(), FabricationError> {
        let existing = self
            .segments
            .get(&segment.id)
            .ok_or_else(|| FabricationError::not_found(segment.id.to_string()))?;
        if existing.chain_id != segment.chain_id {
            return Err(FabricationError::ChainMismatch {
                reason: format!("cannot move {} to {}", segment.id, segment.chain_id),
            });
        }
        protect_segment_state_transition(existing.state, segment.state)?;
        let old_begin = existing.begin_at_chain_micros;
        if old_begin != segment.begin_at_chain_micros {
            self.unindex(old_begin, segment.id);
            self.by_begin.insert(segment.begin_at_chain_micros, segment.id);
        }
        self.segments.insert(segment.id, segment);
        Ok(())
    }

    pub fn update_segment_state(
        &mut self,
        id: SegmentId,
        to: SegmentState,
    ) -> Result<(), FabricationError> {
        let mut segment = self
            .read_segment(id)
            .cloned()
            .ok_or_else(|| FabricationError::not_found(id.to_string()))?;
        segment.state = to;
        self.update_segment(segment)
    }

    pub fn read_segment(&self, id: SegmentId) -> Option<&Segment> {
        self.segments.get(&id)
    }

    pub fn read_segment_last(&self) -> Option<&Segment> {
        self.segments.values().next_back()
    }

    /// Segments with ids in `from..=to`.
    pub fn read_segments_from_to_offset(&self, from: SegmentId, to: SegmentId) -> Vec<&Segment> {
        if from > to {
            return Vec::new();
        }
        self.segments.range(from..=to).map(|(_, s)| s).collect()
    }

    /// The segment whose half-open span covers `chain_micros`.
    pub fn read_segment_at_chain_micros(&self, chain_micros: i64) -> Option<&Segment> {
        let (_, id) = self.by_begin.range(..=chain_micros).next_back()?;
        self.segments
            .get(id)
            .filter(|s| s.is_spanning(chain_micros, chain_micros))
    }

    /// Segments touching `[from, to]`, in id order.
    pub fn read_all_segments_spanning(
        &self,
        from_chain_micros: i64,
        to_chain_micros: i64,
    ) -> Vec<&Segment> {
        self.segments
            .values()
            .filter(|s| s.is_spanning(from_chain_micros, to_chain_micros))
            .collect()
    }

    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }

    /// The choice of a given program type in a segment, if any.
    pub fn read_choice(
        &self,
        segment_id: SegmentId,
        program_type: ProgramType,
    ) -> Option<&SegmentChoice> {
        self.read_all::<SegmentChoice>(segment_id)
            .into_iter()
            .find(|c| c.program_type == Some(program_type))
    }

    /// Fingerprint of a segment's choices: sorted choice ids joined by `_`.
    pub fn read_choice_hash(&self, segment_id: SegmentId) -> String {
        self.read_all::<SegmentChoice>(segment_id)
            .iter()
            .map(|c| c.id.uuid().to_string())
            .collect::<Vec<_>>()
            .join("_")
    }

    // -- sub-entities ----------------------------------------------------------

    fn writable_partition(
        &mut self,
        segment_id: SegmentId,
    ) -> Result<&mut SegmentPartition, FabricationError> {
        let segment = self
            .segments
            .get(&segment_id)
            .ok_or_else(|| FabricationError::not_found(segment_id.to_string()))?;
        if segment.state != SegmentState::Crafting {
            return Err(FabricationError::SegmentNotWritable {
                segment_id,
                state: segment.state,
            });
        }
        Ok(self.partitions.entry(segment_id).or_default())
    }

    /// Insert or replace a sub-entity of a `Crafting` segment.
    pub fn put<E: SegmentEntity>(&mut self, entity: E) -> Result<E::Id, FabricationError> {
        let id = entity.id();
        let partition = self.writable_partition(entity.segment_id())?;
        E::partition_mut(partition).insert(id, entity);
        Ok(id)
    }

    pub fn read<E: SegmentEntity>(&self, segment_id: SegmentId, id: E::Id) -> Option<&E> {
        self.partitions
            .get(&segment_id)
            .and_then(|p| E::partition(p).get(&id))
    }

    /// Every entity of one kind in a segment, in id order.
    pub fn read_all<E: SegmentEntity>(&self, segment_id: SegmentId) -> Vec<&E> {
        self.partitions
            .get(&segment_id)
            .map(|p| E::partition(p).values().collect())
            .unwrap_or_default()
    }

    /// Remove a sub-entity of a `Crafting` segment, returning it.
    pub fn delete<E: SegmentEntity>(
        &mut self,
        segment_id: SegmentId,
        id: E::Id,
    ) -> Result<Option<E>, FabricationError> {
        let partition = self.writable_partition(segment_id)?;
        Ok(E::partition_mut(partition).remove(&id))
    }

    // -- pruning ---------------------------------------------------------------

    /// Remove a segment and everything below it.
    pub fn delete_segment(&mut self, id: SegmentId) -> Option<Segment> {
        let segment = self.segments.remove(&id)?;
        self.unindex(segment.begin_at_chain_micros, id);
        self.partitions.remove(&id);
        Some(segment)
    }

    /// Drop `id` from the begin index if it still owns `begin`, handing the
    /// entry to the latest other segment that starts there.
    fn unindex(&mut self, begin: i64, id: SegmentId) {
        if self.by_begin.get(&begin) != Some(&id) {
            return;
        }
        self.by_begin.remove(&begin);
        if let Some(other) = self
            .segments
            .values()
            .rev()
            .find(|s| s.id != id && s.begin_at_chain_micros == begin)
        {
            self.by_begin.insert(begin, other.id);
        }
    }

    /// Remove every segment with an id lower than `id`.
    pub fn delete_segments_before(&mut self, id: SegmentId) -> usize {
        let doomed: Vec<SegmentId> = self.segments.range(..id).map(|(k, _)| *k).collect();
        self.delete_all(doomed)
    }

    /// Remove every segment with an id higher than `id`.
    pub fn delete_segments_after(&mut self, id: SegmentId) -> usize {
        let doomed: Vec<SegmentId> = self.segments.range(id.next()..).map(|(k, _)| *k).collect();
        self.delete_all(doomed)
    }

    fn delete_all(&mut self, ids: Vec<SegmentId>) -> usize {
        let count = ids.len();
        for id in ids {
            self.delete_segment(id);
        }
        if count > 0 {
            debug!(count, "pruned segments");
        }
        count
    }

    /// Drop every segment but keep the chain.
    pub fn clear(&mut self) {
        self.segments.clear();
        self.by_begin.clear();
        self.partitions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ostinato_content::IdGenerator;

    struct Fixture {
        store: SegmentStore,
        chain: ChainId,
        ids: IdGenerator,
    }

    fn fixture() -> Fixture {
        let mut ids = IdGenerator::new(5);
        let chain = ChainId::generate(&mut ids);
        let mut store = SegmentStore::new();
        store
            .put_chain(Chain {
                id: chain,
                ..Default::default()
            })
            .unwrap();
        Fixture { store, chain, ids }
    }

    fn segment(f: &Fixture, id: u32, begin: i64, duration: Option<i64>) -> Segment {
        Segment {
            id: SegmentId(id),
            chain_id: f.chain,
            begin_at_chain_micros: begin,
            duration_micros: duration,
            ..Default::default()
        }
    }

    fn with_three_segments() -> Fixture {
        let mut f = fixture();
        for (i, begin) in [0, 1_000, 2_000].into_iter().enumerate() {
            let s = segment(&f, i as u32, begin, Some(1_000));
            f.store.create_segment(s).unwrap();
        }
        f
    }

    #[test]
    fn state_transitions_follow_allow_list() {
        use SegmentState::*;
        let allowed = [
            (Planned, Planned),
            (Planned, Crafting),
            (Crafting, Crafting),
            (Crafting, Crafted),
            (Crafting, Failed),
            (Crafting, Planned),
            (Crafted, Crafted),
            (Crafted, Crafting),
            (Failed, Failed),
        ];
        for from in SegmentState::ALL {
            for to in SegmentState::ALL {
                let result = protect_segment_state_transition(*from, *to);
                if allowed.contains(&(*from, *to)) {
                    assert!(result.is_ok(), "{from} -> {to} should be allowed");
                } else {
                    assert!(
                        matches!(result, Err(FabricationError::IllegalStateTransition { .. })),
                        "{from} -> {to} should be refused"
                    );
                }
            }
        }
    }

    #[test]
    fn create_requires_gap_free_ids_and_times() {
        let mut f = with_three_segments();
        let skipped = segment(&f, 4, 3_000, None);
        assert!(matches!(
            f.store.create_segment(skipped),
            Err(FabricationError::ChainMismatch { .. })
        ));
        let overlapping = segment(&f, 3, 2_500, None);
        assert!(f.store.create_segment(overlapping).is_err());
        let good = segment(&f, 3, 3_000, None);
        assert!(f.store.create_segment(good).is_ok());
    }

    #[test]
    fn boundary_lookup_prefers_later_segment() {
        let f = with_three_segments();
        assert_eq!(f.store.read_segment_at_chain_micros(1_000).map(|s| s.id), Some(SegmentId(1)));
        assert_eq!(f.store.read_segment_at_chain_micros(999).map(|s| s.id), Some(SegmentId(0)));
        assert_eq!(f.store.read_segment_at_chain_micros(2_999).map(|s| s.id), Some(SegmentId(2)));
        assert!(f.store.read_segment_at_chain_micros(3_000).is_none());
    }

    #[test]
    fn zero_length_segment_shares_begin_without_losing_successor() {
        let mut f = fixture();
        let empty = segment(&f, 0, 0, Some(0));
        f.store.create_segment(empty).unwrap();
        let next = segment(&f, 1, 0, Some(1_000));
        f.store.create_segment(next).unwrap();
        assert_eq!(f.store.read_segment_at_chain_micros(500).map(|s| s.id), Some(SegmentId(1)));

        assert_eq!(f.store.delete_segments_before(SegmentId(1)), 1);
        assert_eq!(f.store.read_segment_at_chain_micros(500).map(|s| s.id), Some(SegmentId(1)));
    }

    #[test]
    fn deleting_successor_hands_begin_back_to_zero_length_segment() {
        let mut f = fixture();
        let empty = segment(&f, 0, 0, Some(0));
        f.store.create_segment(empty).unwrap();
        let next = segment(&f, 1, 0, Some(1_000));
        f.store.create_segment(next).unwrap();

        assert_eq!(f.store.delete_segments_after(SegmentId(0)), 1);
        assert_eq!(f.store.by_begin.get(&0), Some(&SegmentId(0)));
        // Zero-length segments span no instant.
        assert!(f.store.read_segment_at_chain_micros(0).is_none());
    }

    #[test]
    fn spanning_and_offset_ranges() {
        let f = with_three_segments();
        let ids: Vec<u32> = f
            .store
            .read_all_segments_spanning(500, 1_500)
            .iter()
            .map(|s| s.id.0)
            .collect();
        assert_eq!(ids, vec![0, 1]);
        assert_eq!(f.store.read_segments_from_to_offset(SegmentId(1), SegmentId(9)).len(), 2);
        assert!(f.store.read_segments_from_to_offset(SegmentId(2), SegmentId(1)).is_empty());
    }

    #[test]
    fn update_refuses_chain_change_and_illegal_state() {
        let mut f = with_three_segments();
        let mut moved = f.store.read_segment(SegmentId(0)).cloned().unwrap();
        moved.chain_id = ChainId::generate(&mut f.ids);
        assert!(matches!(
            f.store.update_segment(moved),
            Err(FabricationError::ChainMismatch { .. })
        ));
        assert!(f.store.update_segment_state(SegmentId(0), SegmentState::Crafted).is_err());
        assert!(f.store.update_segment_state(SegmentId(0), SegmentState::Crafting).is_ok());
    }

    #[test]
    fn sub_entities_require_crafting_segment() {
        let mut f = with_three_segments();
        let meta = SegmentMeta {
            id: SegmentMetaId::generate(&mut f.ids),
            segment_id: SegmentId(1),
            key: "k".to_string(),
            value: "v".to_string(),
        };
        assert!(matches!(
            f.store.put(meta.clone()),
            Err(FabricationError::SegmentNotWritable { state: SegmentState::Planned, .. })
        ));
        f.store.update_segment_state(SegmentId(1), SegmentState::Crafting).unwrap();
        let id = f.store.put(meta.clone()).unwrap();
        assert_eq!(f.store.read::<SegmentMeta>(SegmentId(1), id), Some(&meta));
        assert!(f.store.read_all::<SegmentMeta>(SegmentId(0)).is_empty());

        f.store.update_segment_state(SegmentId(1), SegmentState::Crafted).unwrap();
        assert!(f.store.delete::<SegmentMeta>(SegmentId(1), id).is_err());
    }

    #[test]
    fn choice_hash_is_sorted_ids() {
        let mut f = with_three_segments();
        f.store.update_segment_state(SegmentId(0), SegmentState::Crafting).unwrap();
        let mut expected = Vec::new();
        for t in [ProgramType::Main, ProgramType::Macro] {
            let choice = SegmentChoice {
                id: SegmentChoiceId::generate(&mut f.ids),
                segment_id: SegmentId(0),
                program_type: Some(t),
                ..Default::default()
            };
            expected.push(choice.id.uuid().to_string());
            f.store.put(choice).unwrap();
        }
        expected.sort();
        assert_eq!(f.store.read_choice_hash(SegmentId(0)), expected.join("_"));
        assert!(f.store.read_choice(SegmentId(0), ProgramType::Macro).is_some());
        assert!(f.store.read_choice(SegmentId(0), ProgramType::Beat).is_none());
    }

    #[test]
    fn pruning_drops_partitions_and_index() {
        let mut f = with_three_segments();
        assert_eq!(f.store.delete_segments_before(SegmentId(1)), 1);
        assert!(f.store.read_segment_at_chain_micros(500).is_none());
        assert_eq!(f.store.delete_segments_after(SegmentId(1)), 1);
        assert_eq!(f.store.segment_count(), 1);
        assert_eq!(f.store.read_segment_last().map(|s| s.id), Some(SegmentId(1)));
        f.store.clear();
        assert_eq!(f.store.segment_count(), 0);
        assert!(f.store.chain().is_ok());
    }
}
