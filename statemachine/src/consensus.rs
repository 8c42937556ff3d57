//! Consensus adapter
//!
//! Bridges the ordering backend's apply-callback to a [`Document`]. Every
//! committed entry is a JSON array of [`TransitionWrapper`]s; each wrapper's
//! patch is applied in commit order and produces one [`StateUpdate`] before the
//! next wrapper is touched.
//!
//! Wrappers of a batch were validated against a branch holding every earlier
//! wrapper, so the first wrapper that fails to apply ends the batch.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::replicator::{
    ApplyOutcome, LogEntry, ReplicatedStateMachine, ReplicatorError, ReplicatorResult,
};
use crate::state::{Document, DocumentError, StateUpdate};
use crate::transition::TransitionWrapper;

/// Why one committed wrapper could not be applied
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("Failed to encode wrapper: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Document error: {0}")]
    Document(#[from] DocumentError),
}

pub struct ConsensusAdapter {
    database_id: String,
    document: Arc<Document>,
    updates: mpsc::UnboundedSender<StateUpdate>,
    apply_lock: Mutex<()>,
}

impl ConsensusAdapter {
    /// Create the adapter and the receiving end of its update channel
    pub fn new(
        database_id: impl Into<String>,
        document: Arc<Document>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<StateUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let adapter = Self {
            database_id: database_id.into(),
            document,
            updates: tx,
            apply_lock: Mutex::new(()),
        };
        (Arc::new(adapter), rx)
    }

    pub fn database_id(&self) -> &str {
        &self.database_id
    }

    pub fn document(&self) -> &Arc<Document> {
        &self.document
    }

    fn emit(&self, update: StateUpdate) {
        if self.updates.send(update).is_err() {
            debug!(database_id = %self.database_id, "Update receiver dropped");
        }
    }

    fn apply_wrapper(
        &self,
        index: u64,
        position: usize,
        batch_len: usize,
        wrapper: TransitionWrapper,
    ) -> Result<(), ApplyError> {
        let patch = wrapper.patch_bytes().map_err(ApplyError::Encode)?;
        let transition = wrapper.transition_bytes().map_err(ApplyError::Encode)?;
        self.document.apply_patch(&patch)?;

        let new_state = self.document.bytes()?;
        self.emit(StateUpdate::new(
            index,
            position,
            batch_len,
            self.document.schema_type(),
            self.database_id.as_str(),
            new_state,
            transition,
            wrapper.transition_type,
        ));
        Ok(())
    }
}

impl ReplicatedStateMachine for ConsensusAdapter {
    fn apply(&self, entry: &LogEntry) -> ApplyOutcome {
        let _guard = self.apply_lock.lock().unwrap_or_else(|p| p.into_inner());
        let mut outcome = ApplyOutcome {
            index: entry.index,
            ..Default::default()
        };

        let wrappers = match TransitionWrapper::decode_batch(&entry.data) {
            Ok(wrappers) => wrappers,
            Err(e) => {
                error!(
                    database_id = %self.database_id,
                    index = entry.index,
                    error = %e,
                    "Committed entry is not a transition batch"
                );
                outcome.failed = 1;
                return outcome;
            }
        };

        let batch_len = wrappers.len();
        for (position, wrapper) in wrappers.into_iter().enumerate() {
            let transition_type = wrapper.transition_type.clone();
            if let Err(e) = self.apply_wrapper(entry.index, position, batch_len, wrapper) {
                outcome.failed = 1;
                outcome.skipped = batch_len - position - 1;
                error!(
                    database_id = %self.database_id,
                    index = entry.index,
                    position,
                    transition_type = %transition_type,
                    skipped = outcome.skipped,
                    error = %e,
                    "Failed to apply committed transition, abandoning rest of batch"
                );
                break;
            }
            outcome.applied += 1;
        }

        debug!(
            database_id = %self.database_id,
            index = entry.index,
            applied = outcome.applied,
            "Applied log entry"
        );
        outcome
    }

    fn snapshot(&self) -> ReplicatorResult<Vec<u8>> {
        let _guard = self.apply_lock.lock().unwrap_or_else(|p| p.into_inner());
        let bytes = self
            .document
            .bytes()
            .map_err(|e| ReplicatorError::Snapshot(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    fn restore(&self, last_index: u64, snapshot: &[u8]) -> ReplicatorResult<()> {
        let _guard = self.apply_lock.lock().unwrap_or_else(|p| p.into_inner());
        self.document
            .replace(snapshot.to_vec())
            .map_err(|e| ReplicatorError::Snapshot(e.to_string()))?;

        let state = self
            .document
            .bytes()
            .map_err(|e| ReplicatorError::Snapshot(e.to_string()))?;
        self.emit(StateUpdate::snapshot(
            last_index,
            self.document.schema_type(),
            self.database_id.as_str(),
            state,
        ));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{set_batch, KvSchema};
    use serde_json::{json, Value};

    fn new_adapter() -> (Arc<ConsensusAdapter>, mpsc::UnboundedReceiver<StateUpdate>) {
        let document = Arc::new(Document::empty(Arc::new(KvSchema)).unwrap());
        ConsensusAdapter::new("db-1", document)
    }

    #[test]
    fn test_apply_emits_one_update_per_wrapper_in_order() {
        let (adapter, mut rx) = new_adapter();
        let entry = LogEntry {
            index: 1,
            data: set_batch(&[("a", 1), ("b", 2)]),
        };

        let outcome = adapter.apply(&entry);
        assert_eq!(outcome.applied, 2);
        assert_eq!(outcome.failed, 0);

        let first = rx.try_recv().unwrap();
        let second = rx.try_recv().unwrap();
        assert_eq!((first.index(), first.position()), (1, 0));
        assert_eq!((second.index(), second.position()), (1, 1));
        assert!(!first.is_batch_tail());
        assert!(second.is_batch_tail());
        assert_eq!(first.database_id(), "db-1");
        assert_eq!(first.schema_type(), "kv");
        assert_eq!(first.transition_type(), "set_entry");

        // each update carries the document as of that wrapper
        let after_first: Value = first.new_state().unwrap();
        assert!(after_first["entries"].get("b").is_none());
        let after_second: Value = second.new_state().unwrap();
        assert_eq!(after_second["entries"], json!({ "a": 1, "b": 2 }));
    }

    #[test]
    fn test_undecodable_entry_is_counted_not_applied() {
        let (adapter, mut rx) = new_adapter();
        let outcome = adapter.apply(&LogEntry {
            index: 3,
            data: b"not json".to_vec(),
        });

        assert_eq!(outcome.failed, 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_failed_patch_abandons_rest_of_batch() {
        let (adapter, mut rx) = new_adapter();
        adapter.apply(&LogEntry {
            index: 1,
            data: set_batch(&[("a", 1)]),
        });
        let _ = rx.try_recv();

        // removing a missing key fails; the wrappers after it are not applied
        let bad = serde_json::to_vec(&json!([
            { "type": "remove_entry", "patch": [{ "op": "remove", "path": "/entries/zzz" }], "transition": {} },
            { "type": "set_entry", "patch": [{ "op": "add", "path": "/entries/b", "value": 2 }], "transition": {} }
        ]))
        .unwrap();
        let outcome = adapter.apply(&LogEntry { index: 2, data: bad });

        assert_eq!(outcome.applied, 0);
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.skipped, 1);
        assert!(rx.try_recv().is_err());
        assert_eq!(adapter.document().value().unwrap()["entries"], json!({ "a": 1 }));
    }

    #[test]
    fn test_failure_mid_batch_keeps_earlier_wrappers() {
        let (adapter, mut rx) = new_adapter();
        let batch = serde_json::to_vec(&json!([
            { "type": "set_entry", "patch": [{ "op": "add", "path": "/entries/a", "value": 1 }], "transition": {} },
            { "type": "remove_entry", "patch": [{ "op": "remove", "path": "/entries/zzz" }], "transition": {} },
            { "type": "set_entry", "patch": [{ "op": "add", "path": "/entries/c", "value": 3 }], "transition": {} }
        ]))
        .unwrap();
        let outcome = adapter.apply(&LogEntry { index: 1, data: batch });

        assert_eq!((outcome.applied, outcome.failed, outcome.skipped), (1, 1, 1));
        let update = rx.try_recv().unwrap();
        assert_eq!(update.position(), 0);
        assert!(!update.is_batch_tail());
        assert!(rx.try_recv().is_err());
        assert_eq!(adapter.document().value().unwrap()["entries"], json!({ "a": 1 }));
    }

    #[test]
    fn test_apply_error_keeps_document_source() {
        let (adapter, _rx) = new_adapter();
        let wrapper = TransitionWrapper {
            transition_type: "remove_entry".into(),
            patch: json!([{ "op": "remove", "path": "/entries/zzz" }]),
            transition: json!({}),
        };

        let err = adapter.apply_wrapper(1, 0, 1, wrapper).unwrap_err();
        assert!(matches!(err, ApplyError::Document(DocumentError::PatchFailed(_))));
        assert!(std::error::Error::source(&err).is_some());
    }

    #[test]
    fn test_snapshot_and_restore_round_trip_raw_bytes() {
        let (adapter, mut rx) = new_adapter();
        adapter.apply(&LogEntry {
            index: 1,
            data: set_batch(&[("a", 1)]),
        });
        let snapshot = adapter.snapshot().unwrap();
        let _ = rx.try_recv();

        let (other, mut other_rx) = new_adapter();
        other.restore(1, &snapshot).unwrap();

        assert_eq!(other.document().bytes().unwrap().to_vec(), snapshot);
        let update = other_rx.try_recv().unwrap();
        assert_eq!(update.index(), 1);
        assert_eq!(update.transition_type(), "");
    }
}
