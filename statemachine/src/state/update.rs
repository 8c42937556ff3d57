//! Committed-mutation events
//!
//! A `StateUpdate` is created by the consensus adapter when it applies a
//! committed wrapper, and flows unchanged (apart from the restore flag) through
//! the controller and the event bus to reconciliation subscribers.

use std::sync::Arc;

use serde::de::DeserializeOwned;

/// One committed mutation of one database.
#[derive(Debug, Clone)]
pub struct StateUpdate {
    index: u64,
    position: usize,
    batch_len: usize,
    schema_type: String,
    database_id: String,
    restore: bool,
    new_state: Arc<[u8]>,
    transition: Arc<[u8]>,
    transition_type: String,
}

impl StateUpdate {
    /// Update for the wrapper at `position` within the batch committed at `index`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        index: u64,
        position: usize,
        batch_len: usize,
        schema_type: impl Into<String>,
        database_id: impl Into<String>,
        new_state: Arc<[u8]>,
        transition: Vec<u8>,
        transition_type: impl Into<String>,
    ) -> Self {
        Self {
            index,
            position,
            batch_len,
            schema_type: schema_type.into(),
            database_id: database_id.into(),
            restore: false,
            new_state,
            transition: transition.into(),
            transition_type: transition_type.into(),
        }
    }

    /// Synthetic update emitted when a snapshot replaces the whole document.
    pub fn snapshot(
        index: u64,
        schema_type: impl Into<String>,
        database_id: impl Into<String>,
        new_state: Arc<[u8]>,
    ) -> Self {
        Self::new(
            index,
            0,
            1,
            schema_type,
            database_id,
            new_state,
            Vec::new(),
            String::new(),
        )
    }

    /// Log index of the committed entry
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Position of this wrapper within its committed batch
    pub fn position(&self) -> usize {
        self.position
    }

    /// Whether this is the last wrapper of its committed batch
    pub fn is_batch_tail(&self) -> bool {
        self.position + 1 >= self.batch_len
    }

    pub fn schema_type(&self) -> &str {
        &self.schema_type
    }

    pub fn database_id(&self) -> &str {
        &self.database_id
    }

    /// True for the single restore event a controller publishes after start.
    pub fn is_restore(&self) -> bool {
        self.restore
    }

    pub fn set_restore(&mut self) {
        self.restore = true;
    }

    /// Raw document bytes after this update was applied
    pub fn new_state_bytes(&self) -> &[u8] {
        &self.new_state
    }

    /// Document after this update, decoded into a schema's typed state
    pub fn new_state<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.new_state)
    }

    /// Raw serialized transition, re-decodable per known type
    pub fn transition(&self) -> &[u8] {
        &self.transition
    }

    /// Decode the raw transition into its concrete type
    pub fn decode_transition<T: DeserializeOwned>(&self) -> serde_json::Result<T> {
        serde_json::from_slice(&self.transition)
    }

    /// Wire discriminator; empty for snapshot updates
    pub fn transition_type(&self) -> &str {
        &self.transition_type
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_tail() {
        let state: Arc<[u8]> = Arc::from(b"{}".to_vec());
        let first = StateUpdate::new(4, 0, 2, "kv", "db", state.clone(), b"{}".to_vec(), "set");
        let last = StateUpdate::new(4, 1, 2, "kv", "db", state, b"{}".to_vec(), "set");

        assert!(!first.is_batch_tail());
        assert!(last.is_batch_tail());
    }

    #[test]
    fn test_set_restore_is_sticky() {
        let mut update = StateUpdate::snapshot(9, "kv", "db", Arc::from(b"{}".to_vec()));
        assert!(!update.is_restore());
        assert!(update.is_batch_tail());
        update.set_restore();
        assert!(update.is_restore());
        assert_eq!(update.transition_type(), "");
    }
}
