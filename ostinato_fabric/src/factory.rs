// FabricatorFactory: the one place fabricators and retrospectives are built.
//
// The factory carries the run-wide inputs (a base seed and the output audio
// format) and hands each segment a `Fabricator` whose generator is seeded
// from (base seed, chain id, segment id). Re-fabricating a segment from the
// same content and history therefore repeats every draw.
//
// See also: `fabricator.rs`, `retrospective.rs`, `work.rs` (the caller).

use crate::enums::SegmentType;
use crate::error::FabricationError;
use crate::fabricator::{Fabricator, FabricatorParams};
use crate::retrospective::Retrospective;
use crate::segment::{ChainId, SegmentId};
use crate::segment_store::SegmentStore;
use ostinato_content::ContentStore;
use ostinato_prng::SeededRng;
use tracing::debug;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FabricatorFactory {
    pub seed: u64,
    pub output_frame_rate: f64,
    pub output_channels: u32,
}

impl Default for FabricatorFactory {
    fn default() -> Self {
        Self {
            seed: 0,
            output_frame_rate: 48_000.0,
            output_channels: 2,
        }
    }
}

impl FabricatorFactory {
    pub fn new(seed: u64) -> Self {
        Self { seed, ..Self::default() }
    }

    pub fn segment_seed(&self, chain_id: ChainId, segment_id: SegmentId) -> u64 {
        SeededRng::derive_seed(&[self.seed, chain_id.uuid().low_u64(), segment_id.0 as u64])
    }

    pub fn load_retrospective(&self, store: &SegmentStore, segment_id: SegmentId) -> Retrospective {
        Retrospective::load(store, segment_id)
    }

    /// A fabricator for `segment_id`, which must already exist in `store`.
    pub fn fabricator<'a>(
        &self,
        content: &'a ContentStore,
        store: &'a mut SegmentStore,
        segment_id: SegmentId,
        type_override: Option<SegmentType>,
    ) -> Result<Fabricator<'a>, FabricationError> {
        let chain_id = store.chain()?.id;
        let retrospective = self.load_retrospective(store, segment_id);
        let seed = self.segment_seed(chain_id, segment_id);
        debug!(segment_id = segment_id.0, seed, "building fabricator");
        Fabricator::new(
            content,
            store,
            retrospective,
            FabricatorParams {
                segment_id,
                seed,
                output_frame_rate: self.output_frame_rate,
                output_channels: self.output_channels,
                type_override,
            },
        )
    }
}
