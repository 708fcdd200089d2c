// Ostinato content: the composed material a chain is fabricated from.
//
// Everything in this crate is read-only during fabrication. Content is
// authored (or loaded from JSON) into a `ContentStore`, optionally scoped
// to one template with `for_template`, and then handed to the fabricator
// by shared reference.
//
// Module overview:
// - `ids.rs`:     Uuid, IdGenerator, and the `entity_id!` typed-id macro.
// - `enums.rs`:   The `string_enum!` table and the content enums.
// - `model.rs`:   Project/Library/Template, the Program family, the
//                 Instrument family.
// - `meme.rs`:    Meme normalisation, MemeTaxonomy, MemeStack, MemeIsometry.
// - `config.rs`:  TemplateConfig, ProgramConfig, InstrumentConfig.
// - `store.rs`:   ContentStore, the `ContentEntity` repository trait and
//                 all relational queries.
// - `builder.rs`: ContentBuilder, the authoring API.
// - `demo.rs`:    The built-in demo library.
// - `error.rs`:   ContentError.
//
// **Critical constraint: determinism.** Ids come from seeded generators and
// every table is a `BTreeMap`. Loading the same content twice yields stores
// that iterate identically.

pub mod builder;
pub mod config;
pub mod demo;
pub mod enums;
pub mod error;
pub mod ids;
pub mod meme;
pub mod model;
pub mod store;

pub use builder::ContentBuilder;
pub use config::{InstrumentConfig, ProgramConfig, TemplateConfig};
pub use enums::{
    ContentBindingType, InstrumentMode, InstrumentState, InstrumentType, ProgramState, ProgramType,
};
pub use error::ContentError;
pub use ids::{IdGenerator, Uuid};
pub use meme::{MemeIsometry, MemeStack, MemeTaxonomy};
pub use store::{ContentEntity, ContentStore};
