//! Document state for replicated databases
//!
//! - `document`: the schema-validated JSON buffer, mutated only by patches
//! - `schema`: the per-type schema contract and the registry that owns them
//! - `update`: the `StateUpdate` event describing one committed mutation

pub mod document;
pub mod schema;
pub mod update;

pub use document::{Document, DocumentError, DocumentResult};
pub use schema::{Schema, SchemaError, SchemaRegistry, SchemaResult};
pub use update::StateUpdate;
