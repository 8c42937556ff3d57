//! Schema contract and registry
//!
//! A schema is an immutable description of one document type. The registry is
//! built once at process start and handed to the database manager, so schema
//! lookup never goes through global state.

use std::collections::HashMap;
use std::sync::Arc;

use crate::transition::Transition;

/// Error type for schema operations
#[derive(Debug, thiserror::Error)]
pub enum SchemaError {
    #[error("Unknown schema type: {0}")]
    UnknownSchema(String),

    #[error("Schema already registered: {0}")]
    DuplicateSchema(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Unsupported schema version {found} (current is {current})")]
    UnsupportedVersion { found: u64, current: u64 },

    #[error("Invalid initialization arguments: {0}")]
    InvalidInitialization(String),
}

/// Result type for schema operations
pub type SchemaResult<T> = Result<T, SchemaError>;

/// Contract every document type implements.
pub trait Schema: Send + Sync + 'static {
    /// Schema type name, persisted in each database's `schema_type` marker.
    fn name(&self) -> &str;

    /// Serialized empty document a new database starts from.
    fn empty_state(&self) -> SchemaResult<Vec<u8>>;

    /// Checks that `state` is a valid document of this schema and version.
    fn validate_state(&self, state: &[u8]) -> SchemaResult<()>;

    /// Builds the first transition a database receives from caller-supplied fields.
    fn initialization_transition(&self, args: &[u8]) -> SchemaResult<Box<dyn Transition>>;
}

/// Map from schema type name to its schema.
#[derive(Default, Clone)]
pub struct SchemaRegistry {
    schemas: HashMap<String, Arc<dyn Schema>>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schema under its own name
    pub fn register(&mut self, schema: Arc<dyn Schema>) -> SchemaResult<()> {
        let name = schema.name().to_string();
        if self.schemas.contains_key(&name) {
            return Err(SchemaError::DuplicateSchema(name));
        }
        self.schemas.insert(name, schema);
        Ok(())
    }

    /// Builder-style registration for startup wiring
    pub fn with(mut self, schema: Arc<dyn Schema>) -> SchemaResult<Self> {
        self.register(schema)?;
        Ok(self)
    }

    pub fn get(&self, name: &str) -> SchemaResult<Arc<dyn Schema>> {
        self.schemas
            .get(name)
            .cloned()
            .ok_or_else(|| SchemaError::UnknownSchema(name.to_string()))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.schemas.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::KvSchema;

    #[test]
    fn test_registry_lookup() {
        let registry = SchemaRegistry::new()
            .with(Arc::new(KvSchema))
            .unwrap();

        assert_eq!(registry.get("kv").unwrap().name(), "kv");
        assert!(matches!(
            registry.get("missing"),
            Err(SchemaError::UnknownSchema(name)) if name == "missing"
        ));
        assert_eq!(registry.names(), vec!["kv"]);
    }

    #[test]
    fn test_registry_rejects_duplicates() {
        let mut registry = SchemaRegistry::new();
        registry.register(Arc::new(KvSchema)).unwrap();
        assert!(matches!(
            registry.register(Arc::new(KvSchema)),
            Err(SchemaError::DuplicateSchema(_))
        ));
    }
}
