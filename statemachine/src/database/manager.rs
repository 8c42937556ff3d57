//! Database manager
//!
//! Creates databases, reopens them after a restart, and keeps the id → database
//! table for the process. Every open database has its controller publishing
//! onto the shared event bus and listening for commits.

use std::collections::HashMap;
use std::sync::{Arc, RwLock, Weak};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::layout::{self, Markers};
use super::{Database, DatabaseError, DatabaseResult, TransitionProposer};
use crate::config::StateMachineConfig;
use crate::consensus::ConsensusAdapter;
use crate::controller::StateMachineController;
use crate::events::SharedEventBus;
use crate::replicator::{LocalReplicatorFactory, ReplicatorFactory};
use crate::state::{Document, SchemaRegistry, StateUpdate};
use crate::transition::Transition;

pub struct DatabaseManager {
    config: StateMachineConfig,
    registry: Arc<SchemaRegistry>,
    bus: SharedEventBus<StateUpdate>,
    factory: Arc<dyn ReplicatorFactory>,
    databases: RwLock<HashMap<String, Arc<Database>>>,
    lifecycle: Mutex<()>,
    cancel: CancellationToken,
}

impl DatabaseManager {
    pub fn new(
        config: StateMachineConfig,
        registry: Arc<SchemaRegistry>,
        bus: SharedEventBus<StateUpdate>,
        factory: Arc<dyn ReplicatorFactory>,
    ) -> Self {
        Self {
            config,
            registry,
            bus,
            factory,
            databases: RwLock::new(HashMap::new()),
            lifecycle: Mutex::new(()),
            cancel: CancellationToken::new(),
        }
    }

    /// Manager backed by [`LocalReplicatorFactory`]
    pub fn local(
        config: StateMachineConfig,
        registry: Arc<SchemaRegistry>,
        bus: SharedEventBus<StateUpdate>,
    ) -> Self {
        let factory = Arc::new(LocalReplicatorFactory::new(config.clone()));
        Self::new(config, registry, bus, factory)
    }

    /// Create a shared reference to this manager
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn config(&self) -> &StateMachineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SchemaRegistry> {
        &self.registry
    }

    /// Proposer that does not keep the manager alive
    pub fn proposer(self: &Arc<Self>) -> Arc<dyn TransitionProposer> {
        Arc::new(ProposerHandle {
            manager: Arc::downgrade(self),
        })
    }

    /// Create a database and commit its initial transitions.
    ///
    /// The database is registered before it starts listening, so post-hooks
    /// triggered by the initial transitions can already find it. If opening
    /// fails or the initial proposal is rejected, the database is unregistered
    /// and its directory removed, so the name stays available.
    pub async fn create_database(
        &self,
        name: &str,
        schema_type: &str,
        initial_transitions: Vec<Box<dyn Transition>>,
    ) -> DatabaseResult<Arc<Database>> {
        let _lifecycle = self.lifecycle.lock().await;

        if layout::scan(&self.config.data_root)?
            .iter()
            .any(|m| m.name == name)
        {
            return Err(DatabaseError::DuplicateName(name.to_string()));
        }
        self.registry.get(schema_type)?;

        let id = Uuid::new_v4().to_string();
        let path = self.config.data_root.join(&id);
        if let Err(e) = layout::write_markers(&path, name, schema_type) {
            remove_database_dir(&path);
            return Err(e);
        }

        let markers = Markers {
            id: id.clone(),
            name: name.to_string(),
            schema_type: schema_type.to_string(),
            path: path.clone(),
        };
        let database = match self.open(&markers) {
            Ok(database) => database,
            Err(e) => {
                warn!(database_id = %id, name, error = %e, "Failed to open new database");
                remove_database_dir(&path);
                return Err(e);
            }
        };

        let committed = match database.start_listening() {
            Ok(()) => database
                .propose_transitions(initial_transitions)
                .await
                .map_err(DatabaseError::from),
            Err(e) => Err(e),
        };
        if let Err(e) = committed {
            warn!(database_id = %id, name, error = %e, "Initial transitions rejected");
            self.remove(&id);
            if let Err(close) = database.shutdown().await {
                warn!(database_id = %id, error = %close, "Failed to close rejected database");
            }
            remove_database_dir(&path);
            return Err(e);
        }

        info!(database_id = %id, name, schema_type, "Database created");
        Ok(database)
    }

    /// Reopen every database found under the data root.
    ///
    /// Databases already open in this process are left untouched. A database
    /// that fails to open is logged and skipped so the others still start.
    pub async fn restart_dbs(&self) -> DatabaseResult<Vec<Arc<Database>>> {
        let _lifecycle = self.lifecycle.lock().await;

        let mut restarted = Vec::new();
        for markers in layout::scan(&self.config.data_root)? {
            if self.get_database(&markers.id).is_some() {
                continue;
            }
            let database = match self.open(&markers) {
                Ok(database) => database,
                Err(e) => {
                    error!(
                        database_id = %markers.id,
                        name = %markers.name,
                        error = %e,
                        "Failed to reopen database, skipping"
                    );
                    continue;
                }
            };
            if let Err(e) = database.start_listening() {
                error!(database_id = %markers.id, error = %e, "Failed to start listening");
                self.remove(&markers.id);
                continue;
            }
            info!(
                database_id = %markers.id,
                name = %markers.name,
                restart_index = database.controller().restart_index(),
                "Database restarted"
            );
            restarted.push(database);
        }

        Ok(restarted)
    }

    /// Linear scan by name
    pub fn get_database_client_by_name(&self, name: &str) -> Option<Arc<Database>> {
        self.databases
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .find(|db| db.name() == name)
            .cloned()
    }

    pub fn get_database(&self, id: &str) -> Option<Arc<Database>> {
        self.databases
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(id)
            .cloned()
    }

    /// Open databases, sorted by name
    pub fn list_databases(&self) -> Vec<Arc<Database>> {
        let mut databases: Vec<_> = self
            .databases
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect();
        databases.sort_by(|a, b| a.name().cmp(b.name()));
        databases
    }

    /// Close every open database
    pub async fn shutdown(&self) -> DatabaseResult<()> {
        self.cancel.cancel();
        let databases: Vec<_> = self
            .databases
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .drain()
            .map(|(_, db)| db)
            .collect();

        for database in databases {
            database.shutdown().await?;
        }
        info!("Database manager shut down");
        Ok(())
    }

    fn insert(&self, database: Arc<Database>) {
        self.databases
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .insert(database.id().to_string(), database);
    }

    fn remove(&self, id: &str) {
        self.databases
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(id);
    }

    /// Build document, adapter, replicator and controller and register the
    /// database. The caller starts listening.
    fn open(&self, markers: &Markers) -> DatabaseResult<Arc<Database>> {
        let schema = self.registry.get(&markers.schema_type)?;
        let document = Arc::new(Document::empty(schema)?);

        let (adapter, updates) = ConsensusAdapter::new(markers.id.clone(), Arc::clone(&document));
        let replicator = self
            .factory
            .build(&markers.id, &markers.path, adapter, updates)?;

        let controller =
            StateMachineController::new(markers.id.clone(), document, replicator)?.shared();
        self.bus.add_publisher(controller.publisher())?;

        let database = Arc::new(Database::new(
            markers.id.clone(),
            markers.name.clone(),
            markers.path.clone(),
            controller,
            self.cancel.child_token(),
        ));
        self.insert(Arc::clone(&database));
        Ok(database)
    }
}

fn remove_database_dir(path: &std::path::Path) {
    if let Err(e) = std::fs::remove_dir_all(path) {
        warn!(path = %path.display(), error = %e, "Failed to remove database directory");
    }
}

#[async_trait]
impl TransitionProposer for DatabaseManager {
    async fn propose(
        &self,
        database_id: &str,
        transitions: Vec<Box<dyn Transition>>,
    ) -> DatabaseResult<Document> {
        let database = self
            .get_database(database_id)
            .ok_or_else(|| DatabaseError::NotFound(database_id.to_string()))?;
        Ok(database.propose_transitions(transitions).await?)
    }
}

struct ProposerHandle {
    manager: Weak<DatabaseManager>,
}

#[async_trait]
impl TransitionProposer for ProposerHandle {
    async fn propose(
        &self,
        database_id: &str,
        transitions: Vec<Box<dyn Transition>>,
    ) -> DatabaseResult<Document> {
        let manager = self.manager.upgrade().ok_or(DatabaseError::ManagerGone)?;
        manager.propose(database_id, transitions).await
    }
}
