//! Node transitions
//!
//! [`NodeTransition`] is the tagged union of every command the node schema
//! accepts; the wire `type` string is its discriminator. Each variant wraps a
//! command struct whose serialized form is the wrapper's `transition` field,
//! including the `enriched` sub-field filled once at proposal time.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use statemachine::reconcile::TransitionKind;
use statemachine::transition::{Transition, TransitionError, TransitionResult};
use statemachine::StateUpdate;
use uuid::Uuid;

use super::state::{App, AppDriver, InstallStatus, NodeState, Process, Route, User, CURRENT_SCHEMA_VERSION};

/// Routing key for node transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeTransitionKind {
    InitializeNode,
    AddUser,
    StartInstallation,
    FinishInstallation,
    StartProcess,
    StopProcess,
    RegisterRoute,
    RemoveRoute,
}

impl NodeTransitionKind {
    pub const ALL: [Self; 8] = [
        Self::InitializeNode,
        Self::AddUser,
        Self::StartInstallation,
        Self::FinishInstallation,
        Self::StartProcess,
        Self::StopProcess,
        Self::RegisterRoute,
        Self::RemoveRoute,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::InitializeNode => "initialize_node",
            Self::AddUser => "add_user",
            Self::StartInstallation => "start_installation",
            Self::FinishInstallation => "finish_installation",
            Self::StartProcess => "start_process",
            Self::StopProcess => "stop_process",
            Self::RegisterRoute => "register_route",
            Self::RemoveRoute => "remove_route",
        }
    }
}

impl TransitionKind for NodeTransitionKind {
    fn parse(transition_type: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.as_str() == transition_type)
    }
}

impl std::fmt::Display for NodeTransitionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-command rules, evaluated against the decoded old state
trait Command {
    fn enrich(&mut self, _state: &NodeState) -> TransitionResult<()> {
        Ok(())
    }

    fn validate(&self, state: &NodeState) -> TransitionResult<()>;

    /// Mutate a copy of the old state into the new state
    fn apply(&self, state: &mut NodeState) -> TransitionResult<()>;
}

fn require_initialized(state: &NodeState) -> TransitionResult<()> {
    if !state.is_initialized() {
        return Err(TransitionError::validation("node is not initialized"));
    }
    Ok(())
}

fn check_username(username: &str) -> TransitionResult<()> {
    let valid = !username.is_empty()
        && username
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if !valid {
        return Err(TransitionError::validation(format!("invalid username: {username:?}")));
    }
    Ok(())
}

fn not_enriched(transition_type: &str) -> TransitionError {
    TransitionError::Enrichment(format!("{transition_type} was not enriched"))
}

// ---------------------------------------------------------------------------
// Users
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializeNodeEnriched {
    pub users: Vec<User>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InitializeNode {
    pub users: Vec<String>,
    #[serde(default)]
    pub enriched: InitializeNodeEnriched,
}

impl Command for InitializeNode {
    fn enrich(&mut self, _state: &NodeState) -> TransitionResult<()> {
        let now = Utc::now();
        self.enriched.users = self
            .users
            .iter()
            .map(|username| User {
                id: Uuid::new_v4().to_string(),
                username: username.clone(),
                created_at: now,
            })
            .collect();
        Ok(())
    }

    fn validate(&self, state: &NodeState) -> TransitionResult<()> {
        if state.is_initialized() {
            return Err(TransitionError::validation("node is already initialized"));
        }
        for (i, username) in self.users.iter().enumerate() {
            check_username(username)?;
            if self.users[..i].contains(username) {
                return Err(TransitionError::validation(format!(
                    "username already exists: {username}"
                )));
            }
        }
        let enriched: Vec<&str> = self.enriched.users.iter().map(|u| u.username.as_str()).collect();
        if enriched != self.users.iter().map(String::as_str).collect::<Vec<_>>() {
            return Err(not_enriched(NodeTransitionKind::InitializeNode.as_str()));
        }
        Ok(())
    }

    fn apply(&self, state: &mut NodeState) -> TransitionResult<()> {
        state.schema_version = CURRENT_SCHEMA_VERSION;
        for user in &self.enriched.users {
            state.users.insert(user.username.clone(), user.clone());
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddUserEnriched {
    pub id: String,
    pub created_at: Option<chrono::DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddUser {
    pub username: String,
    #[serde(default)]
    pub enriched: AddUserEnriched,
}

impl Command for AddUser {
    fn enrich(&mut self, _state: &NodeState) -> TransitionResult<()> {
        self.enriched = AddUserEnriched {
            id: Uuid::new_v4().to_string(),
            created_at: Some(Utc::now()),
        };
        Ok(())
    }

    fn validate(&self, state: &NodeState) -> TransitionResult<()> {
        require_initialized(state)?;
        check_username(&self.username)?;
        if state.users.contains_key(&self.username) {
            return Err(TransitionError::validation(format!(
                "username already exists: {}",
                self.username
            )));
        }
        if self.enriched.id.is_empty() || self.enriched.created_at.is_none() {
            return Err(not_enriched(NodeTransitionKind::AddUser.as_str()));
        }
        Ok(())
    }

    fn apply(&self, state: &mut NodeState) -> TransitionResult<()> {
        let created_at = self
            .enriched
            .created_at
            .ok_or_else(|| not_enriched(NodeTransitionKind::AddUser.as_str()))?;
        state.users.insert(
            self.username.clone(),
            User {
                id: self.enriched.id.clone(),
                username: self.username.clone(),
                created_at,
            },
        );
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Applications
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartInstallationEnriched {
    pub app_id: String,
    pub driver: Option<AppDriver>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartInstallation {
    pub app_name: String,
    pub package: String,
    pub owner: String,
    #[serde(default)]
    pub enriched: StartInstallationEnriched,
}

impl Command for StartInstallation {
    fn enrich(&mut self, _state: &NodeState) -> TransitionResult<()> {
        self.enriched = StartInstallationEnriched {
            app_id: Uuid::new_v4().to_string(),
            driver: Some(AppDriver::for_package(&self.package)),
        };
        Ok(())
    }

    fn validate(&self, state: &NodeState) -> TransitionResult<()> {
        require_initialized(state)?;
        if self.app_name.is_empty() || self.package.is_empty() {
            return Err(TransitionError::validation("app name and package are required"));
        }
        if !state.users.contains_key(&self.owner) {
            return Err(TransitionError::NotFound(format!("user {}", self.owner)));
        }
        if state.app_by_name(&self.app_name).is_some() {
            return Err(TransitionError::validation(format!(
                "app name already exists: {}",
                self.app_name
            )));
        }
        if self.enriched.app_id.is_empty() || self.enriched.driver.is_none() {
            return Err(not_enriched(NodeTransitionKind::StartInstallation.as_str()));
        }
        Ok(())
    }

    fn apply(&self, state: &mut NodeState) -> TransitionResult<()> {
        let driver = self
            .enriched
            .driver
            .ok_or_else(|| not_enriched(NodeTransitionKind::StartInstallation.as_str()))?;
        state.apps.insert(
            self.enriched.app_id.clone(),
            App {
                id: self.enriched.app_id.clone(),
                name: self.app_name.clone(),
                package: self.package.clone(),
                owner: self.owner.clone(),
                driver,
                status: InstallStatus::Installing,
            },
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinishInstallation {
    pub app_id: String,
}

impl Command for FinishInstallation {
    fn validate(&self, state: &NodeState) -> TransitionResult<()> {
        let app = state
            .apps
            .get(&self.app_id)
            .ok_or_else(|| TransitionError::NotFound(format!("app {}", self.app_id)))?;
        if app.status != InstallStatus::Installing {
            return Err(TransitionError::validation(format!(
                "app {} is already installed",
                self.app_id
            )));
        }
        Ok(())
    }

    fn apply(&self, state: &mut NodeState) -> TransitionResult<()> {
        let app = state
            .apps
            .get_mut(&self.app_id)
            .ok_or_else(|| TransitionError::NotFound(format!("app {}", self.app_id)))?;
        app.status = InstallStatus::Installed;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Processes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartProcessEnriched {
    pub process_id: String,
    pub driver: Option<AppDriver>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartProcess {
    pub app_id: String,
    #[serde(default)]
    pub enriched: StartProcessEnriched,
}

impl Command for StartProcess {
    /// The driver comes from the app's installation record.
    fn enrich(&mut self, state: &NodeState) -> TransitionResult<()> {
        let app = state
            .apps
            .get(&self.app_id)
            .ok_or_else(|| TransitionError::NotFound(format!("app {}", self.app_id)))?;
        self.enriched = StartProcessEnriched {
            process_id: Uuid::new_v4().to_string(),
            driver: Some(app.driver),
        };
        Ok(())
    }

    fn validate(&self, state: &NodeState) -> TransitionResult<()> {
        let app = state
            .apps
            .get(&self.app_id)
            .ok_or_else(|| TransitionError::NotFound(format!("app {}", self.app_id)))?;
        if app.status != InstallStatus::Installed {
            return Err(TransitionError::validation(format!(
                "app {} is not installed",
                self.app_id
            )));
        }
        if state.process_for_app(&self.app_id).is_some() {
            return Err(TransitionError::validation(format!(
                "app {} already has a running process",
                self.app_id
            )));
        }
        if self.enriched.process_id.is_empty() || self.enriched.driver.is_none() {
            return Err(not_enriched(NodeTransitionKind::StartProcess.as_str()));
        }
        Ok(())
    }

    fn apply(&self, state: &mut NodeState) -> TransitionResult<()> {
        let driver = self
            .enriched
            .driver
            .ok_or_else(|| not_enriched(NodeTransitionKind::StartProcess.as_str()))?;
        state.processes.insert(
            self.enriched.process_id.clone(),
            Process {
                id: self.enriched.process_id.clone(),
                app_id: self.app_id.clone(),
                driver,
            },
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopProcess {
    pub process_id: String,
}

impl Command for StopProcess {
    fn validate(&self, state: &NodeState) -> TransitionResult<()> {
        if !state.processes.contains_key(&self.process_id) {
            return Err(TransitionError::NotFound(format!("process {}", self.process_id)));
        }
        Ok(())
    }

    fn apply(&self, state: &mut NodeState) -> TransitionResult<()> {
        state.processes.remove(&self.process_id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRoute {
    pub domain: String,
    pub app_id: String,
}

impl Command for RegisterRoute {
    fn validate(&self, state: &NodeState) -> TransitionResult<()> {
        require_initialized(state)?;
        if self.domain.is_empty() || self.domain.contains(char::is_whitespace) {
            return Err(TransitionError::validation(format!("invalid domain: {:?}", self.domain)));
        }
        if state.routes.contains_key(&self.domain) {
            return Err(TransitionError::validation(format!(
                "route already exists: {}",
                self.domain
            )));
        }
        if !state.apps.contains_key(&self.app_id) {
            return Err(TransitionError::NotFound(format!("app {}", self.app_id)));
        }
        Ok(())
    }

    fn apply(&self, state: &mut NodeState) -> TransitionResult<()> {
        state.routes.insert(
            self.domain.clone(),
            Route {
                domain: self.domain.clone(),
                app_id: self.app_id.clone(),
            },
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveRoute {
    pub domain: String,
}

impl Command for RemoveRoute {
    fn validate(&self, state: &NodeState) -> TransitionResult<()> {
        if !state.routes.contains_key(&self.domain) {
            return Err(TransitionError::NotFound(format!("route {}", self.domain)));
        }
        Ok(())
    }

    fn apply(&self, state: &mut NodeState) -> TransitionResult<()> {
        state.routes.remove(&self.domain);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tagged union
// ---------------------------------------------------------------------------

/// Every node command. Serializes as the inner command, without a tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum NodeTransition {
    InitializeNode(InitializeNode),
    AddUser(AddUser),
    StartInstallation(StartInstallation),
    FinishInstallation(FinishInstallation),
    StartProcess(StartProcess),
    StopProcess(StopProcess),
    RegisterRoute(RegisterRoute),
    RemoveRoute(RemoveRoute),
}

impl NodeTransition {
    pub fn initialize_node(users: Vec<String>) -> Self {
        Self::InitializeNode(InitializeNode {
            users,
            enriched: InitializeNodeEnriched::default(),
        })
    }

    pub fn add_user(username: impl Into<String>) -> Self {
        Self::AddUser(AddUser {
            username: username.into(),
            enriched: AddUserEnriched::default(),
        })
    }

    pub fn start_installation(
        app_name: impl Into<String>,
        package: impl Into<String>,
        owner: impl Into<String>,
    ) -> Self {
        Self::StartInstallation(StartInstallation {
            app_name: app_name.into(),
            package: package.into(),
            owner: owner.into(),
            enriched: StartInstallationEnriched::default(),
        })
    }

    pub fn finish_installation(app_id: impl Into<String>) -> Self {
        Self::FinishInstallation(FinishInstallation {
            app_id: app_id.into(),
        })
    }

    pub fn start_process(app_id: impl Into<String>) -> Self {
        Self::StartProcess(StartProcess {
            app_id: app_id.into(),
            enriched: StartProcessEnriched::default(),
        })
    }

    pub fn stop_process(process_id: impl Into<String>) -> Self {
        Self::StopProcess(StopProcess {
            process_id: process_id.into(),
        })
    }

    pub fn register_route(domain: impl Into<String>, app_id: impl Into<String>) -> Self {
        Self::RegisterRoute(RegisterRoute {
            domain: domain.into(),
            app_id: app_id.into(),
        })
    }

    pub fn remove_route(domain: impl Into<String>) -> Self {
        Self::RemoveRoute(RemoveRoute {
            domain: domain.into(),
        })
    }

    pub fn boxed(self) -> Box<dyn Transition> {
        Box::new(self)
    }

    pub fn kind(&self) -> NodeTransitionKind {
        match self {
            Self::InitializeNode(_) => NodeTransitionKind::InitializeNode,
            Self::AddUser(_) => NodeTransitionKind::AddUser,
            Self::StartInstallation(_) => NodeTransitionKind::StartInstallation,
            Self::FinishInstallation(_) => NodeTransitionKind::FinishInstallation,
            Self::StartProcess(_) => NodeTransitionKind::StartProcess,
            Self::StopProcess(_) => NodeTransitionKind::StopProcess,
            Self::RegisterRoute(_) => NodeTransitionKind::RegisterRoute,
            Self::RemoveRoute(_) => NodeTransitionKind::RemoveRoute,
        }
    }

    /// Re-decode a committed transition from its wire type and bytes
    pub fn decode(transition_type: &str, bytes: &[u8]) -> TransitionResult<Self> {
        let kind = NodeTransitionKind::parse(transition_type)
            .ok_or_else(|| TransitionError::UnknownType(transition_type.to_string()))?;

        fn from<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> TransitionResult<T> {
            serde_json::from_slice(bytes).map_err(TransitionError::Decode)
        }

        Ok(match kind {
            NodeTransitionKind::InitializeNode => Self::InitializeNode(from(bytes)?),
            NodeTransitionKind::AddUser => Self::AddUser(from(bytes)?),
            NodeTransitionKind::StartInstallation => Self::StartInstallation(from(bytes)?),
            NodeTransitionKind::FinishInstallation => Self::FinishInstallation(from(bytes)?),
            NodeTransitionKind::StartProcess => Self::StartProcess(from(bytes)?),
            NodeTransitionKind::StopProcess => Self::StopProcess(from(bytes)?),
            NodeTransitionKind::RegisterRoute => Self::RegisterRoute(from(bytes)?),
            NodeTransitionKind::RemoveRoute => Self::RemoveRoute(from(bytes)?),
        })
    }

    pub fn from_update(update: &StateUpdate) -> TransitionResult<Self> {
        Self::decode(update.transition_type(), update.transition())
    }

    fn command(&self) -> &dyn Command {
        match self {
            Self::InitializeNode(c) => c,
            Self::AddUser(c) => c,
            Self::StartInstallation(c) => c,
            Self::FinishInstallation(c) => c,
            Self::StartProcess(c) => c,
            Self::StopProcess(c) => c,
            Self::RegisterRoute(c) => c,
            Self::RemoveRoute(c) => c,
        }
    }

    fn command_mut(&mut self) -> &mut dyn Command {
        match self {
            Self::InitializeNode(c) => c,
            Self::AddUser(c) => c,
            Self::StartInstallation(c) => c,
            Self::FinishInstallation(c) => c,
            Self::StartProcess(c) => c,
            Self::StopProcess(c) => c,
            Self::RegisterRoute(c) => c,
            Self::RemoveRoute(c) => c,
        }
    }
}

fn decode_state(old: &Value) -> TransitionResult<NodeState> {
    serde_json::from_value(old.clone()).map_err(TransitionError::StateDecode)
}

impl Transition for NodeTransition {
    fn transition_type(&self) -> &str {
        self.kind().as_str()
    }

    fn enrich(&mut self, old: &Value) -> TransitionResult<()> {
        let state = decode_state(old)?;
        self.command_mut().enrich(&state)
    }

    fn validate(&self, old: &Value) -> TransitionResult<()> {
        self.command().validate(&decode_state(old)?)
    }

    fn patch(&self, old: &Value) -> TransitionResult<json_patch::Patch> {
        let mut state = decode_state(old)?;
        self.command().apply(&mut state)?;
        let new = serde_json::to_value(&state).map_err(TransitionError::Encode)?;
        Ok(json_patch::diff(old, &new))
    }

    fn to_json(&self) -> TransitionResult<Value> {
        serde_json::to_value(self).map_err(TransitionError::Encode)
    }
}
