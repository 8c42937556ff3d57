//! Named, schema-typed databases
//!
//! Each database lives in its own directory under the data root:
//!
//! ```text
//! <data_root>/<id>/
//!   schema_type    schema name, written first
//!   name           database name, written last; its presence marks a complete database
//!   log.jsonl      replicator log
//!   snapshot.json  replicator snapshot
//! ```
//!
//! Databases are never deleted.

pub mod layout;
pub mod manager;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::controller::{ControllerError, ControllerResult, StateMachineController};
use crate::events::EventBusError;
use crate::replicator::ReplicatorError;
use crate::state::{Document, DocumentError, SchemaError};
use crate::transition::Transition;

pub use manager::DatabaseManager;

/// Error type for database management
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Database named {0} already exists")]
    DuplicateName(String),

    #[error("Database not found: {0}")]
    NotFound(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Schema error: {0}")]
    Schema(#[from] SchemaError),

    #[error("Document error: {0}")]
    Document(#[from] DocumentError),

    #[error("Replicator error: {0}")]
    Replicator(#[from] ReplicatorError),

    #[error("Controller error: {0}")]
    Controller(#[from] ControllerError),

    #[error("Event bus error: {0}")]
    EventBus(#[from] EventBusError),

    #[error("Database manager has shut down")]
    ManagerGone,
}

impl DatabaseError {
    pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Result type for database management
pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Proposes transitions to a database by id.
///
/// Reconciliation post-hooks hold one of these to chain follow-up
/// transitions without owning the database manager.
#[async_trait]
pub trait TransitionProposer: Send + Sync {
    async fn propose(
        &self,
        database_id: &str,
        transitions: Vec<Box<dyn Transition>>,
    ) -> DatabaseResult<Document>;
}

/// Client handle to one open database
pub struct Database {
    id: String,
    name: String,
    path: PathBuf,
    controller: Arc<StateMachineController>,
    cancel: CancellationToken,
}

impl Database {
    pub(crate) fn new(
        id: String,
        name: String,
        path: PathBuf,
        controller: Arc<StateMachineController>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            name,
            path,
            controller,
            cancel,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema_type(&self) -> &str {
        self.controller.schema_type()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn controller(&self) -> &Arc<StateMachineController> {
        &self.controller
    }

    /// Committed document
    pub fn document(&self) -> &Arc<Document> {
        self.controller.document()
    }

    pub fn current_state<T: serde::de::DeserializeOwned>(&self) -> ControllerResult<T> {
        self.controller.current_state()
    }

    pub async fn propose_transitions(
        &self,
        transitions: Vec<Box<dyn Transition>>,
    ) -> ControllerResult<Document> {
        self.controller.propose_transitions(transitions).await
    }

    /// Start publishing committed updates. Called once the database is
    /// reachable through its manager, so post-hooks can propose back to it.
    pub(crate) fn start_listening(&self) -> DatabaseResult<()> {
        let _listener = self.controller.start_listening(self.cancel.clone())?;
        Ok(())
    }

    /// Stop listening and close the replicator
    pub async fn shutdown(&self) -> DatabaseResult<()> {
        self.cancel.cancel();
        self.controller.stop_listening();
        self.controller.replicator().shutdown().await?;
        info!(database_id = %self.id, name = %self.name, "Database closed");
        Ok(())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("schema_type", &self.schema_type())
            .field("path", &self.path)
            .finish()
    }
}
