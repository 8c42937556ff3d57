//! Process lifecycle

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use statemachine::{IdempotentStateUpdateExecutor, StateRestorer, StateUpdate, StateUpdateSubscriber};
use tracing::info;

use super::{node_state, transition};
use crate::drivers::ProcessDriver;
use crate::schema::{NodeState, NodeTransition, NodeTransitionKind, NODE_SCHEMA};

pub fn processes_subscriber(driver: Arc<dyn ProcessDriver>) -> StateUpdateSubscriber<NodeTransitionKind> {
    StateUpdateSubscriber::new(
        "processes",
        NODE_SCHEMA,
        Arc::new(ProcessesRestorer {
            driver: Arc::clone(&driver),
        }),
    )
    .route(
        NodeTransitionKind::StartProcess,
        Arc::new(StartProcessExecutor {
            driver: Arc::clone(&driver),
        }),
    )
    .route(NodeTransitionKind::StopProcess, Arc::new(StopProcessExecutor { driver }))
}

fn process_id(update: &StateUpdate) -> anyhow::Result<String> {
    match transition(update)? {
        NodeTransition::StartProcess(start) => Ok(start.enriched.process_id),
        NodeTransition::StopProcess(stop) => Ok(stop.process_id),
        other => anyhow::bail!("unexpected transition {}", other.kind()),
    }
}

async fn start(driver: &dyn ProcessDriver, state: &NodeState, process_id: &str) -> anyhow::Result<()> {
    let process = state
        .processes
        .get(process_id)
        .with_context(|| format!("process {process_id} missing from committed state"))?;
    let app = state
        .apps
        .get(&process.app_id)
        .with_context(|| format!("app {} missing from committed state", process.app_id))?;
    driver.start(process, app).await
}

pub struct StartProcessExecutor {
    driver: Arc<dyn ProcessDriver>,
}

#[async_trait]
impl IdempotentStateUpdateExecutor for StartProcessExecutor {
    /// A later stop may already have removed the process from the document.
    async fn should_execute(&self, update: &StateUpdate) -> anyhow::Result<bool> {
        let process_id = process_id(update)?;
        let wanted = node_state(update)?.processes.contains_key(&process_id);
        Ok(wanted && !self.driver.is_running(&process_id).await?)
    }

    async fn execute(&self, update: &StateUpdate) -> anyhow::Result<()> {
        let process_id = process_id(update)?;
        start(self.driver.as_ref(), &node_state(update)?, &process_id).await
    }
}

pub struct StopProcessExecutor {
    driver: Arc<dyn ProcessDriver>,
}

#[async_trait]
impl IdempotentStateUpdateExecutor for StopProcessExecutor {
    async fn should_execute(&self, update: &StateUpdate) -> anyhow::Result<bool> {
        let process_id = process_id(update)?;
        let wanted = node_state(update)?.processes.contains_key(&process_id);
        Ok(!wanted && self.driver.is_running(&process_id).await?)
    }

    async fn execute(&self, update: &StateUpdate) -> anyhow::Result<()> {
        self.driver.stop(&process_id(update)?).await
    }
}

/// Stops processes the snapshot does not list and starts the ones it does.
pub struct ProcessesRestorer {
    driver: Arc<dyn ProcessDriver>,
}

#[async_trait]
impl StateRestorer for ProcessesRestorer {
    async fn restore(&self, update: &StateUpdate) -> anyhow::Result<()> {
        let state = node_state(update)?;

        let mut stopped = 0;
        for process_id in self.driver.running().await? {
            if !state.processes.contains_key(&process_id) {
                self.driver.stop(&process_id).await?;
                stopped += 1;
            }
        }

        let mut started = 0;
        for process_id in state.processes.keys() {
            if !self.driver.is_running(process_id).await? {
                start(self.driver.as_ref(), &state, process_id).await?;
                started += 1;
            }
        }

        info!(
            database_id = update.database_id(),
            started, stopped, "Processes reconciled"
        );
        Ok(())
    }
}
