//! Node document types

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Schema version written by `initialize_node`. An empty document is version 0.
pub const CURRENT_SCHEMA_VERSION: u64 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct User {
    pub id: String,
    pub username: String,
    pub created_at: DateTime<Utc>,
}

/// Runtime that hosts an application's processes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AppDriver {
    Container,
    Web,
}

impl AppDriver {
    /// `container:` packages run in a container runtime; anything else is served as a web app
    pub fn for_package(package: &str) -> Self {
        if package.starts_with("container:") {
            Self::Container
        } else {
            Self::Web
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallStatus {
    Installing,
    Installed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct App {
    pub id: String,
    pub name: String,
    pub package: String,
    /// Username of the owning user
    pub owner: String,
    pub driver: AppDriver,
    pub status: InstallStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Process {
    pub id: String,
    pub app_id: String,
    pub driver: AppDriver,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Route {
    pub domain: String,
    pub app_id: String,
}

/// The node document. Maps are keyed by username, app id, process id and
/// domain respectively.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeState {
    pub schema_version: u64,
    #[serde(default)]
    pub users: BTreeMap<String, User>,
    #[serde(default)]
    pub apps: BTreeMap<String, App>,
    #[serde(default)]
    pub processes: BTreeMap<String, Process>,
    #[serde(default)]
    pub routes: BTreeMap<String, Route>,
}

impl NodeState {
    pub fn is_initialized(&self) -> bool {
        self.schema_version > 0
    }

    pub fn app_by_name(&self, name: &str) -> Option<&App> {
        self.apps.values().find(|app| app.name == name)
    }

    pub fn process_for_app(&self, app_id: &str) -> Option<&Process> {
        self.processes.values().find(|p| p.app_id == app_id)
    }

    /// Referential and keying rules every committed document satisfies
    pub fn check(&self) -> Result<(), String> {
        if !self.is_initialized() {
            if self.users.is_empty()
                && self.apps.is_empty()
                && self.processes.is_empty()
                && self.routes.is_empty()
            {
                return Ok(());
            }
            return Err("uninitialized node must be empty".to_string());
        }

        for (key, user) in &self.users {
            if key != &user.username {
                return Err(format!("user key {key} does not match username {}", user.username));
            }
        }
        for (key, app) in &self.apps {
            if key != &app.id {
                return Err(format!("app key {key} does not match id {}", app.id));
            }
            if !self.users.contains_key(&app.owner) {
                return Err(format!("app {} is owned by unknown user {}", app.id, app.owner));
            }
        }
        for (key, process) in &self.processes {
            if key != &process.id {
                return Err(format!("process key {key} does not match id {}", process.id));
            }
            if !self.apps.contains_key(&process.app_id) {
                return Err(format!(
                    "process {} references unknown app {}",
                    process.id, process.app_id
                ));
            }
        }
        for (key, route) in &self.routes {
            if key != &route.domain {
                return Err(format!("route key {key} does not match domain {}", route.domain));
            }
            if !self.apps.contains_key(&route.app_id) {
                return Err(format!(
                    "route {} references unknown app {}",
                    route.domain, route.app_id
                ));
            }
        }
        Ok(())
    }
}
