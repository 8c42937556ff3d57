//! In-process drivers

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::info;

use super::{PackageInstaller, ProcessDriver, ProxyRules};
use crate::schema::{App, AppDriver, Process, Route};

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

/// Records installed packages by app id
#[derive(Debug, Default)]
pub struct MemoryPackageInstaller {
    packages: Mutex<BTreeMap<String, String>>,
    installs: AtomicUsize,
}

impl MemoryPackageInstaller {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `install` calls that did work
    pub fn install_count(&self) -> usize {
        self.installs.load(Ordering::SeqCst)
    }

    pub fn package(&self, app_id: &str) -> Option<String> {
        lock(&self.packages).get(app_id).cloned()
    }
}

#[async_trait]
impl PackageInstaller for MemoryPackageInstaller {
    async fn is_installed(&self, app_id: &str) -> anyhow::Result<bool> {
        Ok(lock(&self.packages).contains_key(app_id))
    }

    async fn install(&self, app: &App) -> anyhow::Result<()> {
        let previous = lock(&self.packages).insert(app.id.clone(), app.package.clone());
        if previous.is_none() {
            self.installs.fetch_add(1, Ordering::SeqCst);
            info!(app_id = %app.id, package = %app.package, "Package installed");
        }
        Ok(())
    }

    async fn uninstall(&self, app_id: &str) -> anyhow::Result<()> {
        if lock(&self.packages).remove(app_id).is_some() {
            info!(app_id, "Package removed");
        }
        Ok(())
    }

    async fn installed(&self) -> anyhow::Result<Vec<String>> {
        Ok(lock(&self.packages).keys().cloned().collect())
    }
}

/// A process the memory driver believes is running
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningProcess {
    pub app_id: String,
    pub driver: AppDriver,
}

#[derive(Debug, Default)]
pub struct MemoryProcessDriver {
    running: Mutex<BTreeMap<String, RunningProcess>>,
    starts: AtomicUsize,
}

impl MemoryProcessDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_count(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn process(&self, process_id: &str) -> Option<RunningProcess> {
        lock(&self.running).get(process_id).cloned()
    }
}

#[async_trait]
impl ProcessDriver for MemoryProcessDriver {
    async fn is_running(&self, process_id: &str) -> anyhow::Result<bool> {
        Ok(lock(&self.running).contains_key(process_id))
    }

    async fn start(&self, process: &Process, app: &App) -> anyhow::Result<()> {
        let previous = lock(&self.running).insert(
            process.id.clone(),
            RunningProcess {
                app_id: app.id.clone(),
                driver: process.driver,
            },
        );
        if previous.is_none() {
            self.starts.fetch_add(1, Ordering::SeqCst);
            info!(process_id = %process.id, app = %app.name, driver = ?process.driver, "Process started");
        }
        Ok(())
    }

    async fn stop(&self, process_id: &str) -> anyhow::Result<()> {
        if lock(&self.running).remove(process_id).is_some() {
            info!(process_id, "Process stopped");
        }
        Ok(())
    }

    async fn running(&self) -> anyhow::Result<Vec<String>> {
        Ok(lock(&self.running).keys().cloned().collect())
    }
}

/// Domain → app id table
#[derive(Debug, Default)]
pub struct MemoryProxyRules {
    rules: Mutex<BTreeMap<String, String>>,
}

impl MemoryProxyRules {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProxyRules for MemoryProxyRules {
    async fn target(&self, domain: &str) -> anyhow::Result<Option<String>> {
        Ok(lock(&self.rules).get(domain).cloned())
    }

    async fn upsert(&self, route: &Route) -> anyhow::Result<()> {
        lock(&self.rules).insert(route.domain.clone(), route.app_id.clone());
        info!(domain = %route.domain, app_id = %route.app_id, "Proxy rule set");
        Ok(())
    }

    async fn remove(&self, domain: &str) -> anyhow::Result<()> {
        if lock(&self.rules).remove(domain).is_some() {
            info!(domain, "Proxy rule removed");
        }
        Ok(())
    }

    async fn domains(&self) -> anyhow::Result<Vec<String>> {
        Ok(lock(&self.rules).keys().cloned().collect())
    }
}
