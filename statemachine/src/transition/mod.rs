//! Transition protocol
//!
//! A transition is a command against a document. It is evaluated in three
//! phases against one old-state snapshot:
//!
//! ```text
//! enrich(old)   : derive ids, timestamps, lookups into the enriched sub-field
//! validate(old) : business rules; no mutation on failure
//! patch(old)    : the literal RFC 6902 diff implied by the validated intent
//! ```
//!
//! Once enriched, `validate` and `patch` are pure functions of the transition
//! and the old state, so the replicated [`TransitionWrapper`] never needs a new
//! id or timestamp to be re-derived on another replica.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Error type for transition phases
#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    #[error("{0}")]
    Validation(String),

    #[error("Enrichment failed: {0}")]
    Enrichment(String),

    #[error("Referenced entity not found: {0}")]
    NotFound(String),

    #[error("Old state does not match schema: {0}")]
    StateDecode(#[source] serde_json::Error),

    #[error("Failed to encode transition: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to decode transition: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Unknown transition type: {0}")]
    UnknownType(String),
}

impl TransitionError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

/// Result type for transition phases
pub type TransitionResult<T> = Result<T, TransitionError>;

/// A structured intent to mutate a document.
pub trait Transition: Send + Sync {
    /// Wire discriminator stored in the wrapper's `type` field
    fn transition_type(&self) -> &str;

    /// Fill server-derived fields. Runs once per proposal.
    fn enrich(&mut self, _old: &Value) -> TransitionResult<()> {
        Ok(())
    }

    /// Check business rules against the old state
    fn validate(&self, old: &Value) -> TransitionResult<()>;

    /// Produce the patch expressing this transition's effect
    fn patch(&self, old: &Value) -> TransitionResult<json_patch::Patch>;

    /// Serialized transition, enriched fields included
    fn to_json(&self) -> TransitionResult<Value>;
}

/// The unit the ordering backend replicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionWrapper {
    #[serde(rename = "type")]
    pub transition_type: String,
    pub patch: Value,
    pub transition: Value,
}

impl TransitionWrapper {
    /// Run enrich → validate → patch for one transition and wrap the result
    pub fn build(transition: &mut dyn Transition, old: &Value) -> TransitionResult<Self> {
        transition.enrich(old)?;
        transition.validate(old)?;
        let patch = transition.patch(old)?;

        Ok(Self {
            transition_type: transition.transition_type().to_string(),
            patch: serde_json::to_value(&patch).map_err(TransitionError::Encode)?,
            transition: transition.to_json()?,
        })
    }

    pub fn patch_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&self.patch)
    }

    pub fn transition_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(&self.transition)
    }

    /// Encode a batch as one log-entry payload
    pub fn encode_batch(batch: &[TransitionWrapper]) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(batch)
    }

    /// Decode one log-entry payload
    pub fn decode_batch(payload: &[u8]) -> serde_json::Result<Vec<TransitionWrapper>> {
        serde_json::from_slice(payload)
    }
}
