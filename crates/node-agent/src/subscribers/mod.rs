//! Reconciliation subscribers for the node schema
//!
//! One subscriber per external subsystem:
//!
//! | Subscriber | Routes | Driver |
//! |---|---|---|
//! | `packages` | `start_installation` | [`PackageInstaller`](crate::drivers::PackageInstaller) |
//! | `processes` | `start_process`, `stop_process` | [`ProcessDriver`](crate::drivers::ProcessDriver) |
//! | `routes` | `register_route`, `remove_route` | [`ProxyRules`](crate::drivers::ProxyRules) |
//!
//! Executors decide from the committed `new_state` plus the driver's own view,
//! never from the transition alone, so a replayed or duplicated update is a
//! no-op.

pub mod packages;
pub mod processes;
pub mod routes;

use anyhow::Context;
use statemachine::StateUpdate;

use crate::schema::{NodeState, NodeTransition};

pub use packages::packages_subscriber;
pub use processes::processes_subscriber;
pub use routes::routes_subscriber;

/// Committed document carried by the update
pub(crate) fn node_state(update: &StateUpdate) -> anyhow::Result<NodeState> {
    update
        .new_state()
        .with_context(|| format!("decoding node state at index {}", update.index()))
}

/// The update's transition, re-decoded
pub(crate) fn transition(update: &StateUpdate) -> anyhow::Result<NodeTransition> {
    NodeTransition::from_update(update)
        .with_context(|| format!("decoding {} at index {}", update.transition_type(), update.index()))
}
