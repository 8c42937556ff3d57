//! Ordering backend abstraction
//!
//! A [`Replicator`] totally orders opaque payloads across replicas and feeds
//! every committed entry to a [`ReplicatedStateMachine`] in index order. The
//! state machine's effects reach the controller as `StateUpdate`s on the
//! channel returned by [`Replicator::take_update_channel`].
//!
//! [`LocalReplicator`] is a durable single-node backend: it is always its own
//! quorum, persists a JSON-lines log plus snapshots, and can be demoted to a
//! passive standby.

pub mod local;
pub mod log;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::state::StateUpdate;

pub use local::{LocalReplicator, LocalReplicatorFactory};
pub use log::{LogStore, SnapshotFile};

/// Error type for replicator operations
#[derive(Debug, thiserror::Error)]
pub enum ReplicatorError {
    #[error("Not the leader; submissions must go to the leader replica")]
    NotLeader,

    #[error("Log I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt log entry at line {line}: {reason}")]
    CorruptLog { line: usize, reason: String },

    #[error("Snapshot error: {0}")]
    Snapshot(String),

    #[error("Replicator has shut down")]
    Closed,
}

/// Result type for replicator operations
pub type ReplicatorResult<T> = Result<T, ReplicatorError>;

/// One committed log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub index: u64,
    #[serde(with = "log::base64_payload")]
    pub data: Vec<u8>,
}

/// What the state machine did with one entry. Apply cannot fail a commit,
/// so failures are only counted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub index: u64,
    pub applied: usize,
    pub failed: usize,
    /// Wrappers left unapplied after a failure earlier in the batch
    pub skipped: usize,
}

/// Backend-defined acknowledgement for a dispatched payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReceipt {
    pub index: u64,
}

/// Apply-callback side of an ordering backend
pub trait ReplicatedStateMachine: Send + Sync {
    /// Apply one committed entry. Called sequentially, in index order.
    fn apply(&self, entry: &LogEntry) -> ApplyOutcome;

    /// Serialize current state for log compaction
    fn snapshot(&self) -> ReplicatorResult<Vec<u8>>;

    /// Replace current state with a snapshot taken at `last_index`
    fn restore(&self, last_index: u64, snapshot: &[u8]) -> ReplicatorResult<()>;
}

/// Ordering service for one database
#[async_trait]
pub trait Replicator: Send + Sync {
    /// Submit a payload for ordering. Success means it was committed.
    async fn dispatch(&self, payload: Vec<u8>) -> ReplicatorResult<DispatchReceipt>;

    /// Delivery channel of locally applied commits. Yields the receiver once.
    fn take_update_channel(&self) -> Option<mpsc::UnboundedReceiver<StateUpdate>>;

    fn is_leader(&self) -> bool;

    /// Highest committed index known to this replica; 0 when the log is empty
    fn last_command_index(&self) -> ReplicatorResult<u64>;

    /// Stop accepting submissions and release backend resources
    async fn shutdown(&self) -> ReplicatorResult<()> {
        Ok(())
    }
}

/// Builds a replicator around a database's state machine.
pub trait ReplicatorFactory: Send + Sync {
    fn build(
        &self,
        database_id: &str,
        dir: &Path,
        fsm: Arc<dyn ReplicatedStateMachine>,
        updates: mpsc::UnboundedReceiver<StateUpdate>,
    ) -> ReplicatorResult<Arc<dyn Replicator>>;
}
