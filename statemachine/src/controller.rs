//! State machine controller
//!
//! One controller per database. It turns proposed transitions into a
//! replicated batch, and turns the replicator's committed updates into
//! published events, but only on the leader replica.
//!
//! ## Restart watermark
//!
//! At construction the controller records `restart_index`, the last index the
//! replicator had committed. Updates below it were already reconciled by an
//! earlier incarnation and are not published again. The update completing the
//! entry at `restart_index` is published once, flagged as a restore, so
//! subscribers reconcile the whole document instead of replaying history.
//!
//! ```text
//! Initializing ──start_listening──▶ Listening ──cancel / stop_listening──▶ Stopped
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::events::{EventBusError, Publisher};
use crate::replicator::{Replicator, ReplicatorError};
use crate::state::{Document, DocumentError, StateUpdate};
use crate::transition::{Transition, TransitionError, TransitionWrapper};

/// Error type for controller operations
#[derive(Debug, thiserror::Error)]
pub enum ControllerError {
    #[error("Controller is not listening (state: {0})")]
    NotListening(ControllerState),

    #[error("Controller already started")]
    AlreadyStarted,

    #[error("Transition {transition_type} rejected: {source}")]
    Transition {
        transition_type: String,
        #[source]
        source: TransitionError,
    },

    #[error("Transition {transition_type} produced an invalid document: {source}")]
    Document {
        transition_type: String,
        #[source]
        source: DocumentError,
    },

    #[error("Document error: {0}")]
    State(#[from] DocumentError),

    #[error("Replicator error: {0}")]
    Replicator(#[from] ReplicatorError),

    #[error("Failed to encode transition batch: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Event bus error: {0}")]
    EventBus(#[from] EventBusError),
}

impl ControllerError {
    /// The proposal was rejected by a transition phase and never dispatched.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Transition { .. } | Self::Document { .. })
    }
}

/// Result type for controller operations
pub type ControllerResult<T> = Result<T, ControllerError>;

/// Lifecycle of a controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Initializing,
    Listening,
    Stopped,
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Listening => write!(f, "listening"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

/// What the listening loop does with one committed update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Drop,
    Skip,
    Restore,
    Publish,
}

pub struct StateMachineController {
    database_id: String,
    document: Arc<Document>,
    replicator: Arc<dyn Replicator>,
    publisher: Publisher<StateUpdate>,
    restart_index: u64,
    restored: AtomicBool,
    state: StdMutex<ControllerState>,
    propose_lock: Mutex<()>,
    cancel: CancellationToken,
}

impl StateMachineController {
    /// Bind a document to its replicator and record the restart watermark.
    pub fn new(
        database_id: impl Into<String>,
        document: Arc<Document>,
        replicator: Arc<dyn Replicator>,
    ) -> ControllerResult<Self> {
        let database_id = database_id.into();
        let restart_index = replicator.last_command_index()?;
        debug!(database_id = %database_id, restart_index, "Controller created");

        Ok(Self {
            publisher: Publisher::new(database_id.clone()),
            database_id,
            document,
            replicator,
            restart_index,
            restored: AtomicBool::new(false),
            state: StdMutex::new(ControllerState::Initializing),
            propose_lock: Mutex::new(()),
            cancel: CancellationToken::new(),
        })
    }

    /// Create a shared reference to this controller
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn database_id(&self) -> &str {
        &self.database_id
    }

    pub fn schema_type(&self) -> &str {
        self.document.schema_type()
    }

    pub fn restart_index(&self) -> u64 {
        self.restart_index
    }

    pub fn state(&self) -> ControllerState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// The committed document
    pub fn document(&self) -> &Arc<Document> {
        &self.document
    }

    pub fn replicator(&self) -> &Arc<dyn Replicator> {
        &self.replicator
    }

    /// Publisher to attach to an event bus
    pub fn publisher(&self) -> &Publisher<StateUpdate> {
        &self.publisher
    }

    /// Committed document decoded into a schema's typed state
    pub fn current_state<T: serde::de::DeserializeOwned>(&self) -> ControllerResult<T> {
        Ok(self.document.state()?)
    }

    /// Validate transitions locally and dispatch them as one batch.
    ///
    /// Returns the hypothetical document after the batch. The matching
    /// `StateUpdate`s are published later by the listening loop.
    pub async fn propose_transitions(
        &self,
        mut transitions: Vec<Box<dyn Transition>>,
    ) -> ControllerResult<Document> {
        let state = self.state();
        if state != ControllerState::Listening {
            return Err(ControllerError::NotListening(state));
        }

        let _serialized = self.propose_lock.lock().await;
        let branch = self.document.copy()?;
        let mut wrappers = Vec::with_capacity(transitions.len());

        for transition in transitions.iter_mut() {
            let transition_type = transition.transition_type().to_string();
            let old = branch.value()?;

            let wrapper = TransitionWrapper::build(transition.as_mut(), &old).map_err(|source| {
                ControllerError::Transition {
                    transition_type: transition_type.clone(),
                    source,
                }
            })?;
            let patch = wrapper.patch_bytes().map_err(ControllerError::Encode)?;
            branch
                .apply_patch(&patch)
                .map_err(|source| ControllerError::Document {
                    transition_type,
                    source,
                })?;
            wrappers.push(wrapper);
        }

        if wrappers.is_empty() {
            return Ok(branch);
        }

        let payload = TransitionWrapper::encode_batch(&wrappers).map_err(ControllerError::Encode)?;
        let receipt = self.replicator.dispatch(payload).await?;
        debug!(
            database_id = %self.database_id,
            index = receipt.index,
            transitions = wrappers.len(),
            "Proposal dispatched"
        );

        Ok(branch)
    }

    /// Start consuming committed updates on a new task.
    pub fn start_listening(
        self: &Arc<Self>,
        cancel: CancellationToken,
    ) -> ControllerResult<JoinHandle<()>> {
        let updates = {
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            if *state != ControllerState::Initializing {
                return Err(ControllerError::AlreadyStarted);
            }
            let updates = self
                .replicator
                .take_update_channel()
                .ok_or(ControllerError::AlreadyStarted)?;
            *state = ControllerState::Listening;
            updates
        };

        info!(
            database_id = %self.database_id,
            restart_index = self.restart_index,
            "Controller listening"
        );

        let controller = Arc::clone(self);
        Ok(tokio::spawn(async move {
            controller.listen(updates, cancel).await;
        }))
    }

    /// Stop the listening loop. In-flight subscriber work is not awaited.
    pub fn stop_listening(&self) {
        self.cancel.cancel();
        self.set_state(ControllerState::Stopped);
    }

    async fn listen(&self, mut updates: mpsc::UnboundedReceiver<StateUpdate>, cancel: CancellationToken) {
        loop {
            let update = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = self.cancel.cancelled() => break,
                update = updates.recv() => match update {
                    Some(update) => update,
                    None => break,
                },
            };

            if let Err(e) = self.handle_update(update).await {
                error!(database_id = %self.database_id, error = %e, "Failed to publish update");
                if matches!(e, ControllerError::EventBus(EventBusError::ChannelClosed)) {
                    break;
                }
            }
        }

        self.set_state(ControllerState::Stopped);
        info!(database_id = %self.database_id, "Controller stopped listening");
    }

    async fn handle_update(&self, mut update: StateUpdate) -> ControllerResult<()> {
        let disposition = self.disposition(&update);
        match disposition {
            Disposition::Drop | Disposition::Skip => {
                debug!(
                    database_id = %self.database_id,
                    index = update.index(),
                    ?disposition,
                    "Update not published"
                );
                return Ok(());
            }
            Disposition::Restore => {
                update.set_restore();
                info!(
                    database_id = %self.database_id,
                    index = update.index(),
                    "Publishing restore update"
                );
            }
            Disposition::Publish => {}
        }

        self.publisher.publish_event(update).await?;
        Ok(())
    }

    fn disposition(&self, update: &StateUpdate) -> Disposition {
        if !self.replicator.is_leader() {
            return Disposition::Drop;
        }

        let index = update.index();
        if index < self.restart_index {
            return Disposition::Skip;
        }
        if index == self.restart_index {
            // the batch tail carries the full document for this entry
            if !update.is_batch_tail() {
                return Disposition::Skip;
            }
            if self.restored.swap(true, Ordering::SeqCst) {
                warn!(database_id = %self.database_id, index, "Duplicate restore index ignored");
                return Disposition::Skip;
            }
            return Disposition::Restore;
        }
        Disposition::Publish
    }

    fn set_state(&self, next: ControllerState) {
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = next;
    }
}
