//! Durable single-node replicator
//!
//! The local node is its own quorum: an entry is committed once it is fsynced
//! to the log, and it is applied to the state machine before `dispatch`
//! returns. On open the latest snapshot is restored and the log tail replayed,
//! so `last_command_index` already reflects everything the previous process
//! incarnation committed.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use super::log::LogStore;
use super::{
    DispatchReceipt, LogEntry, ReplicatedStateMachine, Replicator, ReplicatorError,
    ReplicatorFactory, ReplicatorResult,
};
use crate::config::StateMachineConfig;
use crate::state::StateUpdate;

struct LogState {
    store: LogStore,
    since_snapshot: u64,
}

pub struct LocalReplicator {
    database_id: String,
    fsm: Arc<dyn ReplicatedStateMachine>,
    log: Mutex<Option<LogState>>,
    last_index: AtomicU64,
    leader: AtomicBool,
    snapshot_threshold: u64,
    updates: std::sync::Mutex<Option<mpsc::UnboundedReceiver<StateUpdate>>>,
}

impl LocalReplicator {
    /// Open the log under `dir`, restore the snapshot and replay the tail.
    pub fn open(
        database_id: impl Into<String>,
        dir: &Path,
        fsm: Arc<dyn ReplicatedStateMachine>,
        updates: mpsc::UnboundedReceiver<StateUpdate>,
        config: &StateMachineConfig,
    ) -> ReplicatorResult<Self> {
        let database_id = database_id.into();
        let store = LogStore::open(dir)?;

        let mut last_index = 0;
        if let Some(snapshot) = store.read_snapshot()? {
            fsm.restore(snapshot.last_index, &snapshot.state)?;
            last_index = snapshot.last_index;
        }

        let entries = store.read_entries_after(last_index)?;
        let replayed = entries.len() as u64;
        for entry in &entries {
            let outcome = fsm.apply(entry);
            if outcome.failed > 0 {
                warn!(
                    database_id = %database_id,
                    index = entry.index,
                    failed = outcome.failed,
                    "Replayed entry did not apply cleanly"
                );
            }
            last_index = entry.index;
        }

        info!(
            database_id = %database_id,
            last_index,
            replayed,
            standby = config.standby,
            "Local replicator opened"
        );

        Ok(Self {
            database_id,
            fsm,
            log: Mutex::new(Some(LogState {
                store,
                since_snapshot: replayed,
            })),
            last_index: AtomicU64::new(last_index),
            leader: AtomicBool::new(!config.standby),
            snapshot_threshold: config.snapshot_threshold,
            updates: std::sync::Mutex::new(Some(updates)),
        })
    }

    pub fn set_leader(&self, leader: bool) {
        let was = self.leader.swap(leader, Ordering::SeqCst);
        if was != leader {
            info!(database_id = %self.database_id, leader, "Leadership changed");
        }
    }

    fn maybe_snapshot(&self, state: &mut LogState, index: u64) -> ReplicatorResult<()> {
        if self.snapshot_threshold == 0 || state.since_snapshot < self.snapshot_threshold {
            return Ok(());
        }
        let bytes = self.fsm.snapshot()?;
        state.store.write_snapshot(index, &bytes)?;
        state.since_snapshot = 0;
        info!(database_id = %self.database_id, index, "Log compacted into snapshot");
        Ok(())
    }
}

#[async_trait]
impl Replicator for LocalReplicator {
    async fn dispatch(&self, payload: Vec<u8>) -> ReplicatorResult<DispatchReceipt> {
        if !self.is_leader() {
            return Err(ReplicatorError::NotLeader);
        }

        let mut guard = self.log.lock().await;
        let state = guard.as_mut().ok_or(ReplicatorError::Closed)?;

        let index = self.last_index.load(Ordering::SeqCst) + 1;
        let entry = LogEntry {
            index,
            data: payload,
        };
        state.store.append(&entry)?;
        self.last_index.store(index, Ordering::SeqCst);
        state.since_snapshot += 1;

        let outcome = self.fsm.apply(&entry);
        debug!(
            database_id = %self.database_id,
            index,
            applied = outcome.applied,
            failed = outcome.failed,
            "Entry committed"
        );

        if let Err(e) = self.maybe_snapshot(state, index) {
            // the entry is durable in the log; compaction retries next dispatch
            warn!(database_id = %self.database_id, index, error = %e, "Snapshot failed");
        }

        Ok(DispatchReceipt { index })
    }

    fn take_update_channel(&self) -> Option<mpsc::UnboundedReceiver<StateUpdate>> {
        self.updates
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
    }

    fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }

    fn last_command_index(&self) -> ReplicatorResult<u64> {
        Ok(self.last_index.load(Ordering::SeqCst))
    }

    async fn shutdown(&self) -> ReplicatorResult<()> {
        let mut guard = self.log.lock().await;
        if guard.take().is_some() {
            info!(database_id = %self.database_id, "Local replicator shut down");
        }
        Ok(())
    }
}

/// Factory building [`LocalReplicator`]s inside each database directory
#[derive(Debug, Clone, Default)]
pub struct LocalReplicatorFactory {
    config: StateMachineConfig,
}

impl LocalReplicatorFactory {
    pub fn new(config: StateMachineConfig) -> Self {
        Self { config }
    }
}

impl ReplicatorFactory for LocalReplicatorFactory {
    fn build(
        &self,
        database_id: &str,
        dir: &Path,
        fsm: Arc<dyn ReplicatedStateMachine>,
        updates: mpsc::UnboundedReceiver<StateUpdate>,
    ) -> ReplicatorResult<Arc<dyn Replicator>> {
        let replicator = LocalReplicator::open(database_id, dir, fsm, updates, &self.config)?;
        Ok(Arc::new(replicator))
    }
}
