// Fixtures shared by this crate's unit tests: a one-chain segment store and
// a helper that plans the next segment, crafts it with a caller-supplied
// pass, and marks it crafted.

use crate::enums::{SegmentState, SegmentType};
use crate::fabricator::{Fabricator, FabricatorParams};
use crate::retrospective::Retrospective;
use crate::segment::{Chain, ChainId, Segment, SegmentId};
use crate::segment_store::SegmentStore;
use ostinato_content::ids::TemplateId;
use ostinato_content::{ContentStore, IdGenerator};

pub(crate) fn chain_store(template: TemplateId, config: &str) -> SegmentStore {
    let mut store = SegmentStore::new();
    store
        .put_chain(Chain {
            id: ChainId::generate(&mut IdGenerator::new(2)),
            template_id: template,
            config: config.to_string(),
            ..Default::default()
        })
        .unwrap();
    store
}

/// Create the next gap-free segment in `Crafting`, carrying the last
/// segment's delta forward.
pub(crate) fn plan_segment(store: &mut SegmentStore) -> SegmentId {
    let chain_id = store.chain().unwrap().id;
    let (id, begin, delta) = match store.read_segment_last() {
        Some(last) => (last.id.next(), last.end_at_chain_micros().unwrap(), last.delta),
        None => (SegmentId(0), 0, 0),
    };
    store
        .create_segment(Segment {
            id,
            chain_id,
            state: SegmentState::Crafting,
            begin_at_chain_micros: begin,
            delta,
            ..Default::default()
        })
        .unwrap();
    id
}

pub(crate) fn params(
    segment_id: SegmentId,
    seed: u64,
    type_override: Option<SegmentType>,
) -> FabricatorParams {
    FabricatorParams {
        segment_id,
        seed,
        output_frame_rate: 48_000.0,
        output_channels: 2,
        type_override,
    }
}

/// Plan, craft with `work`, and mark crafted.
pub(crate) fn craft_next(
    content: &ContentStore,
    store: &mut SegmentStore,
    type_override: Option<SegmentType>,
    work: impl FnOnce(&mut Fabricator<'_>),
) -> SegmentId {
    let id = plan_segment(store);
    let retrospective = Retrospective::load(store, id);
    let fab_params = params(id, 17, type_override);
    let mut fab = Fabricator::new(content, store, retrospective, fab_params).unwrap();
    work(&mut fab);
    drop(fab);
    store.update_segment_state(id, SegmentState::Crafted).unwrap();
    id
}
