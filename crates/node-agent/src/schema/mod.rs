//! The `node` schema: users, applications, processes and routes

pub mod state;
pub mod transitions;

use serde::Deserialize;
use statemachine::state::{Schema, SchemaError, SchemaResult};
use statemachine::Transition;

pub use state::{App, AppDriver, InstallStatus, NodeState, Process, Route, User, CURRENT_SCHEMA_VERSION};
pub use transitions::{NodeTransition, NodeTransitionKind};

/// Schema type name persisted in each node database's marker
pub const NODE_SCHEMA: &str = "node";

#[derive(Debug, Default, Clone, Copy)]
pub struct NodeSchema;

/// Fields read before full decoding so version errors are reported as such
#[derive(Deserialize)]
struct VersionProbe {
    schema_version: u64,
}

/// Arguments of the initialization transition
#[derive(Debug, Default, Deserialize)]
struct InitArgs {
    #[serde(default)]
    users: Vec<String>,
}

impl Schema for NodeSchema {
    fn name(&self) -> &str {
        NODE_SCHEMA
    }

    fn empty_state(&self) -> SchemaResult<Vec<u8>> {
        serde_json::to_vec(&NodeState::default()).map_err(|e| SchemaError::InvalidState(e.to_string()))
    }

    fn validate_state(&self, state: &[u8]) -> SchemaResult<()> {
        let probe: VersionProbe =
            serde_json::from_slice(state).map_err(|e| SchemaError::InvalidState(e.to_string()))?;
        if probe.schema_version > CURRENT_SCHEMA_VERSION {
            return Err(SchemaError::UnsupportedVersion {
                found: probe.schema_version,
                current: CURRENT_SCHEMA_VERSION,
            });
        }

        let node: NodeState =
            serde_json::from_slice(state).map_err(|e| SchemaError::InvalidState(e.to_string()))?;
        node.check().map_err(SchemaError::InvalidState)
    }

    fn initialization_transition(&self, args: &[u8]) -> SchemaResult<Box<dyn Transition>> {
        let args: InitArgs = if args.is_empty() {
            InitArgs::default()
        } else {
            serde_json::from_slice(args).map_err(|e| SchemaError::InvalidInitialization(e.to_string()))?
        };
        Ok(Box::new(NodeTransition::initialize_node(args.users)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn validate(value: serde_json::Value) -> SchemaResult<()> {
        NodeSchema.validate_state(&serde_json::to_vec(&value).unwrap())
    }

    #[test]
    fn test_empty_state_is_valid_and_uninitialized() {
        let bytes = NodeSchema.empty_state().unwrap();
        NodeSchema.validate_state(&bytes).unwrap();

        let state: NodeState = serde_json::from_slice(&bytes).unwrap();
        assert!(!state.is_initialized());
    }

    #[test]
    fn test_rejects_future_version() {
        assert!(matches!(
            validate(json!({ "schema_version": 2 })),
            Err(SchemaError::UnsupportedVersion { found: 2, current: 1 })
        ));
    }

    #[test]
    fn test_rejects_dangling_references() {
        let app = json!({
            "id": "app-1", "name": "blog", "package": "ghost",
            "owner": "bob", "driver": "web", "status": "installed"
        });
        let err = validate(json!({ "schema_version": 1, "apps": { "app-1": app } })).unwrap_err();
        assert!(err.to_string().contains("unknown user bob"));

        let err = validate(json!({
            "schema_version": 1,
            "routes": { "blog.example": { "domain": "blog.example", "app_id": "app-9" } }
        }))
        .unwrap_err();
        assert!(err.to_string().contains("unknown app app-9"));
    }

    #[test]
    fn test_rejects_unknown_fields_and_content_before_initialization() {
        assert!(validate(json!({ "schema_version": 1, "extra": true })).is_err());

        let user = json!({ "id": "u1", "username": "alice", "created_at": "2024-01-01T00:00:00Z" });
        assert!(validate(json!({ "schema_version": 0, "users": { "alice": user } })).is_err());
    }

    #[test]
    fn test_initialization_transition_from_args() {
        let transition = NodeSchema
            .initialization_transition(br#"{"users":["alice"]}"#)
            .unwrap();
        assert_eq!(transition.transition_type(), "initialize_node");

        assert!(NodeSchema.initialization_transition(b"").is_ok());
        assert!(matches!(
            NodeSchema.initialization_transition(b"not json"),
            Err(SchemaError::InvalidInitialization(_))
        ));
    }
}
