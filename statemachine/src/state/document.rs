//! Schema-validated JSON document
//!
//! The buffer is only ever replaced by a patched, re-validated copy, so every
//! reader observes a document that is valid against its schema.

use std::sync::{Arc, RwLock};

use serde::de::DeserializeOwned;
use serde_json::Value;

use super::schema::{Schema, SchemaError};

/// Error type for document operations
#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("Malformed patch: {0}")]
    MalformedPatch(#[source] serde_json::Error),

    #[error("Patch does not apply: {0}")]
    PatchFailed(#[from] json_patch::PatchError),

    #[error("Document is not valid JSON: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Failed to encode document: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Patched document rejected by schema: {0}")]
    Schema(#[from] SchemaError),

    #[error("Lock poisoned")]
    LockPoisoned,
}

/// Result type for document operations
pub type DocumentResult<T> = Result<T, DocumentError>;

/// One database's current state: a JSON buffer plus the schema it satisfies.
pub struct Document {
    schema: Arc<dyn Schema>,
    bytes: RwLock<Arc<[u8]>>,
}

impl Document {
    /// Wrap an existing buffer, rejecting it if the schema does not accept it
    pub fn new(schema: Arc<dyn Schema>, bytes: Vec<u8>) -> DocumentResult<Self> {
        schema.validate_state(&bytes)?;
        Ok(Self {
            schema,
            bytes: RwLock::new(bytes.into()),
        })
    }

    /// Start from the schema's empty state
    pub fn empty(schema: Arc<dyn Schema>) -> DocumentResult<Self> {
        let bytes = schema.empty_state()?;
        Self::new(schema, bytes)
    }

    pub fn schema(&self) -> &Arc<dyn Schema> {
        &self.schema
    }

    pub fn schema_type(&self) -> &str {
        self.schema.name()
    }

    /// Current buffer. The returned snapshot never changes underneath the caller.
    pub fn bytes(&self) -> DocumentResult<Arc<[u8]>> {
        let guard = self.bytes.read().map_err(|_| DocumentError::LockPoisoned)?;
        Ok(Arc::clone(&guard))
    }

    /// Current buffer parsed as JSON
    pub fn value(&self) -> DocumentResult<Value> {
        let bytes = self.bytes()?;
        serde_json::from_slice(&bytes).map_err(DocumentError::Decode)
    }

    /// Current buffer decoded into a schema's typed state
    pub fn state<T: DeserializeOwned>(&self) -> DocumentResult<T> {
        let bytes = self.bytes()?;
        serde_json::from_slice(&bytes).map_err(DocumentError::Decode)
    }

    /// Compute the buffer `patch` would produce without committing it.
    pub fn validate_patch(&self, patch: &[u8]) -> DocumentResult<Vec<u8>> {
        let current = self.bytes()?;
        self.patched(&current, patch)
    }

    /// Apply an RFC 6902 patch. On any failure the buffer is left unchanged.
    pub fn apply_patch(&self, patch: &[u8]) -> DocumentResult<()> {
        let mut guard = self.bytes.write().map_err(|_| DocumentError::LockPoisoned)?;
        let next = self.patched(&guard, patch)?;
        *guard = next.into();
        Ok(())
    }

    /// Swap in a whole buffer, as when the ordering backend restores a snapshot.
    pub fn replace(&self, bytes: Vec<u8>) -> DocumentResult<()> {
        self.schema.validate_state(&bytes)?;
        let mut guard = self.bytes.write().map_err(|_| DocumentError::LockPoisoned)?;
        *guard = bytes.into();
        Ok(())
    }

    /// Independent document for speculative branches
    pub fn copy(&self) -> DocumentResult<Document> {
        let bytes = self.bytes()?;
        Ok(Document {
            schema: Arc::clone(&self.schema),
            bytes: RwLock::new(Arc::from(bytes.to_vec())),
        })
    }

    fn patched(&self, current: &[u8], patch: &[u8]) -> DocumentResult<Vec<u8>> {
        let ops: json_patch::Patch =
            serde_json::from_slice(patch).map_err(DocumentError::MalformedPatch)?;
        let mut doc: Value = serde_json::from_slice(current).map_err(DocumentError::Decode)?;
        json_patch::patch(&mut doc, &ops.0)?;

        let next = serde_json::to_vec(&doc).map_err(DocumentError::Encode)?;
        self.schema.validate_state(&next)?;
        Ok(next)
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("schema", &self.schema.name())
            .finish_non_exhaustive()
    }
}
