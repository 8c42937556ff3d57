//! Replicated node state machine
//!
//! This library keeps a single schema-validated JSON document per database
//! consistent across restarts and replicas, and fans committed changes out to
//! reconciliation workers that drive external systems toward that document.
//!
//! # Architecture
//!
//! ```text
//! caller ──propose_transitions──▶ StateMachineController ──dispatch──▶ Replicator
//!                                                                        │ commit
//!                                                                        ▼
//! subscribers ◀── EventBus ◀── (leader only) ◀── StateUpdate ◀── ConsensusAdapter::apply
//! ```
//!
//! - [`state`]: the [`Document`](state::Document), schemas, and [`StateUpdate`](state::StateUpdate)
//! - [`transition`]: the enrich / validate / patch protocol and the replicated wrapper
//! - [`replicator`]: the ordering abstraction and a durable single-node backend
//! - [`consensus`]: applies committed entries to the document
//! - [`controller`]: per-database orchestration and the restart watermark
//! - [`events`]: publish/subscribe fan-out
//! - [`reconcile`]: idempotent per-transition executors
//! - [`database`]: named databases on disk

pub mod config;
pub mod consensus;
pub mod controller;
pub mod database;
pub mod events;
pub mod reconcile;
pub mod replicator;
pub mod state;
pub mod transition;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{ConfigError, StateMachineConfig};
pub use consensus::ConsensusAdapter;
pub use controller::{ControllerError, ControllerResult, ControllerState, StateMachineController};
pub use database::{Database, DatabaseError, DatabaseManager, DatabaseResult, TransitionProposer};
pub use events::{EventBus, Publisher, Subscriber};
pub use reconcile::{
    IdempotentStateUpdateExecutor, ReconcileError, StateRestorer, StateUpdateSubscriber, TransitionKind,
};
pub use replicator::{LocalReplicator, LocalReplicatorFactory, Replicator, ReplicatorError, ReplicatorFactory};
pub use state::{Document, DocumentError, Schema, SchemaError, SchemaRegistry, StateUpdate};
pub use transition::{Transition, TransitionError, TransitionWrapper};
