// Ostinato fabric: turns content into segments, one segment at a time.
//
// A chain is a gap-free run of segments. Fabricating a segment means
// choosing programs and instruments for it (macro/main, beat, detail),
// laying their patterns over the segment's chords, and recording every
// decision as choices, arrangements and picks in the `SegmentStore`. A
// mixer downstream renders picks to audio; nothing here touches samples.
//
// Module overview:
// - `segment.rs`:       Chain, Segment and every per-segment entity.
// - `enums.rs`:         Chain and segment enums.
// - `segment_store.rs`: SegmentStore, the state machine, `SegmentEntity`.
// - `retrospective.rs`: Read-only window over the crafted history.
// - `marble_bag.rs`:    Phased weighted draws for every candidate choice.
// - `sticky_bun.rs`:    Stable atonal note placement across segments.
// - `fabricator.rs`:    Per-segment working state and content lookups.
// - `factory.rs`:       FabricatorFactory (seeding, retrospective loading).
// - `craft/`:           Craft passes: shared policies, macro/main, beat,
//                       detail.
// - `work.rs`:          CraftWork: the fabricate-next-segment step, rewrites.
// - `error.rs`:         FabricationError.
//
// **Critical constraint: determinism.** A segment fabricated twice from the
// same content, history and factory seed comes out identical. All draws
// use the fabricator's `SeededRng`; all iterated collections are ordered.

pub mod craft;
pub mod enums;
pub mod error;
pub mod fabricator;
pub mod factory;
pub mod marble_bag;
pub mod retrospective;
pub mod segment;
pub mod segment_store;
pub mod sticky_bun;
pub mod work;

#[cfg(test)]
mod test_support;

pub use craft::{BeatCraft, Craft, DetailCraft, MacroMainCraft};
pub use enums::{ChainState, ChainType, SegmentMessageType, SegmentState, SegmentType};
pub use error::FabricationError;
pub use fabricator::{Fabricator, FabricatorParams};
pub use factory::FabricatorFactory;
pub use marble_bag::MarbleBag;
pub use retrospective::Retrospective;
pub use segment_store::{SegmentEntity, SegmentStore};
pub use sticky_bun::StickyBun;
pub use work::{CraftWork, Rewrite};
