//! External systems the node reconciles against
//!
//! Each trait is the narrow surface a subscriber needs: an idempotence probe,
//! the effect itself, and an inventory used by restore passes. The in-memory
//! implementations keep state in process and are what the daemon runs with
//! until real drivers are plugged in.

pub mod memory;

use async_trait::async_trait;

use crate::schema::{App, Process, Route};

pub use memory::{MemoryPackageInstaller, MemoryProcessDriver, MemoryProxyRules};

/// Installs application packages
#[async_trait]
pub trait PackageInstaller: Send + Sync {
    async fn is_installed(&self, app_id: &str) -> anyhow::Result<bool>;

    async fn install(&self, app: &App) -> anyhow::Result<()>;

    async fn uninstall(&self, app_id: &str) -> anyhow::Result<()>;

    /// Ids of every installed app
    async fn installed(&self) -> anyhow::Result<Vec<String>>;
}

/// Runs application processes
#[async_trait]
pub trait ProcessDriver: Send + Sync {
    async fn is_running(&self, process_id: &str) -> anyhow::Result<bool>;

    async fn start(&self, process: &Process, app: &App) -> anyhow::Result<()>;

    async fn stop(&self, process_id: &str) -> anyhow::Result<()>;

    /// Ids of every running process
    async fn running(&self) -> anyhow::Result<Vec<String>>;
}

/// Reverse-proxy routing table
#[async_trait]
pub trait ProxyRules: Send + Sync {
    /// App id the domain currently routes to
    async fn target(&self, domain: &str) -> anyhow::Result<Option<String>>;

    async fn upsert(&self, route: &Route) -> anyhow::Result<()>;

    async fn remove(&self, domain: &str) -> anyhow::Result<()>;

    async fn domains(&self) -> anyhow::Result<Vec<String>>;
}
