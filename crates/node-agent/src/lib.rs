//! Node agent
//!
//! The concrete node built on the `statemachine` crate: the `node` schema and
//! its transitions, driver interfaces for the systems a node manages, and the
//! reconciliation subscribers that keep those systems in line with the
//! committed document.
//!
//! - [`schema`]: `NodeState`, `NodeSchema`, `NodeTransition`
//! - [`drivers`]: package, process and proxy seams with in-memory implementations
//! - [`subscribers`]: one reconciliation subscriber per driver
//! - [`runtime`]: startup wiring shared by the binary and tests

pub mod drivers;
pub mod runtime;
pub mod schema;
pub mod subscribers;

pub use runtime::{Drivers, NodeRuntime, DEFAULT_DATABASE};
pub use schema::{NodeSchema, NodeState, NodeTransition, NodeTransitionKind, NODE_SCHEMA};
