//! Minimal key/value schema used by unit tests

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::state::{Schema, SchemaError, SchemaResult};
use crate::transition::{Transition, TransitionError, TransitionResult};

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct KvState {
    pub entries: BTreeMap<String, i64>,
}

fn decode(old: &Value) -> TransitionResult<KvState> {
    serde_json::from_value(old.clone()).map_err(TransitionError::StateDecode)
}

fn diff(old: &Value, new: &KvState) -> TransitionResult<json_patch::Patch> {
    let new = serde_json::to_value(new).map_err(TransitionError::Encode)?;
    Ok(json_patch::diff(old, &new))
}

pub struct KvSchema;

impl Schema for KvSchema {
    fn name(&self) -> &str {
        "kv"
    }

    fn empty_state(&self) -> SchemaResult<Vec<u8>> {
        Ok(br#"{"entries":{}}"#.to_vec())
    }

    fn validate_state(&self, state: &[u8]) -> SchemaResult<()> {
        serde_json::from_slice::<KvState>(state)
            .map(|_| ())
            .map_err(|e| SchemaError::InvalidState(e.to_string()))
    }

    fn initialization_transition(&self, args: &[u8]) -> SchemaResult<Box<dyn Transition>> {
        let entries: BTreeMap<String, i64> = serde_json::from_slice(args)
            .map_err(|e| SchemaError::InvalidInitialization(e.to_string()))?;
        Ok(Box::new(InitKv { entries }))
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct InitKv {
    pub entries: BTreeMap<String, i64>,
}

impl Transition for InitKv {
    fn transition_type(&self) -> &str {
        "init_kv"
    }

    fn validate(&self, _old: &Value) -> TransitionResult<()> {
        Ok(())
    }

    fn patch(&self, old: &Value) -> TransitionResult<json_patch::Patch> {
        let state = KvState {
            entries: self.entries.clone(),
        };
        diff(old, &state)
    }

    fn to_json(&self) -> TransitionResult<Value> {
        serde_json::to_value(self).map_err(TransitionError::Encode)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct SetEntryEnriched {
    pub sequence: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SetEntry {
    pub key: String,
    pub value: i64,
    #[serde(default)]
    pub enriched: SetEntryEnriched,
}

impl SetEntry {
    pub fn new(key: &str, value: i64) -> Self {
        Self {
            key: key.to_string(),
            value,
            enriched: SetEntryEnriched::default(),
        }
    }

    pub fn boxed(key: &str, value: i64) -> Box<dyn Transition> {
        Box::new(Self::new(key, value))
    }
}

impl Transition for SetEntry {
    fn transition_type(&self) -> &str {
        "set_entry"
    }

    fn enrich(&mut self, old: &Value) -> TransitionResult<()> {
        let state = decode(old)?;
        self.enriched.sequence = state.entries.len() as u64 + 1;
        Ok(())
    }

    fn validate(&self, old: &Value) -> TransitionResult<()> {
        let state = decode(old)?;
        if state.entries.contains_key(&self.key) {
            return Err(TransitionError::validation(format!(
                "key {} already exists",
                self.key
            )));
        }
        Ok(())
    }

    fn patch(&self, old: &Value) -> TransitionResult<json_patch::Patch> {
        let mut state = decode(old)?;
        state.entries.insert(self.key.clone(), self.value);
        diff(old, &state)
    }

    fn to_json(&self) -> TransitionResult<Value> {
        serde_json::to_value(self).map_err(TransitionError::Encode)
    }
}

/// Wrapper batch payload setting each key, built without the protocol phases.
pub fn set_batch(keys: &[(&str, i64)]) -> Vec<u8> {
    let wrappers: Vec<Value> = keys
        .iter()
        .map(|(key, value)| {
            json!({
                "type": "set_entry",
                "patch": [{ "op": "add", "path": format!("/entries/{key}"), "value": value }],
                "transition": { "key": key, "value": value },
            })
        })
        .collect();
    serde_json::to_vec(&wrappers).unwrap()
}
