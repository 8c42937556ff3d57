//! Node runtime wiring
//!
//! Startup order matters: subscribers are registered and the bus is running
//! before any database is reopened, so the restore event each restarted
//! database publishes reaches every subsystem.

use std::sync::Arc;

use anyhow::Context;
use statemachine::{
    Database, DatabaseManager, EventBus, SchemaRegistry, StateMachineConfig, StateUpdate,
};
use statemachine::events::SharedEventBus;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::drivers::{
    MemoryPackageInstaller, MemoryProcessDriver, MemoryProxyRules, PackageInstaller, ProcessDriver,
    ProxyRules,
};
use crate::schema::{NodeSchema, NODE_SCHEMA};
use crate::subscribers::{packages_subscriber, processes_subscriber, routes_subscriber};

/// Name of the database every node runs
pub const DEFAULT_DATABASE: &str = "node";

/// External systems the subscribers drive
#[derive(Clone)]
pub struct Drivers {
    pub packages: Arc<dyn PackageInstaller>,
    pub processes: Arc<dyn ProcessDriver>,
    pub proxy: Arc<dyn ProxyRules>,
}

impl Drivers {
    pub fn in_memory() -> Self {
        Self {
            packages: Arc::new(MemoryPackageInstaller::new()),
            processes: Arc::new(MemoryProcessDriver::new()),
            proxy: Arc::new(MemoryProxyRules::new()),
        }
    }
}

pub fn schema_registry() -> anyhow::Result<SchemaRegistry> {
    Ok(SchemaRegistry::new().with(Arc::new(NodeSchema))?)
}

pub struct NodeRuntime {
    manager: Arc<DatabaseManager>,
    bus: SharedEventBus<StateUpdate>,
    bus_task: JoinHandle<statemachine::events::EventBusResult<()>>,
    cancel: CancellationToken,
}

impl NodeRuntime {
    /// Wire subscribers, start the bus and reopen existing databases.
    pub async fn start(config: StateMachineConfig, drivers: Drivers) -> anyhow::Result<Self> {
        let registry = schema_registry()?.shared();
        let bus = EventBus::<StateUpdate>::new().shared();
        let manager = DatabaseManager::local(config, registry, Arc::clone(&bus)).shared();

        bus.subscribe(Arc::new(packages_subscriber(drivers.packages, manager.proposer())));
        bus.subscribe(Arc::new(processes_subscriber(drivers.processes)));
        bus.subscribe(Arc::new(routes_subscriber(drivers.proxy)));

        let cancel = CancellationToken::new();
        let bus_task = bus.spawn(cancel.clone());

        let restarted = manager
            .restart_dbs()
            .await
            .context("restarting databases")?;
        info!(
            databases = restarted.len(),
            subscribers = bus.subscriber_count(),
            "Node runtime started"
        );

        Ok(Self {
            manager,
            bus,
            bus_task,
            cancel,
        })
    }

    pub fn manager(&self) -> &Arc<DatabaseManager> {
        &self.manager
    }

    pub fn bus(&self) -> &SharedEventBus<StateUpdate> {
        &self.bus
    }

    /// The default database, created and initialized with `users` if missing.
    pub async fn ensure_default_database(&self, users: Vec<String>) -> anyhow::Result<Arc<Database>> {
        if let Some(db) = self.manager.get_database_client_by_name(DEFAULT_DATABASE) {
            return Ok(db);
        }

        let args = serde_json::to_vec(&serde_json::json!({ "users": users }))?;
        let init = self
            .manager
            .registry()
            .get(NODE_SCHEMA)?
            .initialization_transition(&args)?;
        let db = self
            .manager
            .create_database(DEFAULT_DATABASE, NODE_SCHEMA, vec![init])
            .await
            .context("creating default database")?;
        info!(database_id = %db.id(), "Default database created");
        Ok(db)
    }

    pub async fn shutdown(self) -> anyhow::Result<()> {
        self.manager.shutdown().await?;
        self.cancel.cancel();
        self.bus_task.await.context("joining event bus")??;
        info!("Node runtime stopped");
        Ok(())
    }
}
