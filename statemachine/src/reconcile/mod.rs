//! Idempotent reconciliation
//!
//! A [`StateUpdateSubscriber`] drives one external subsystem toward the
//! committed document. It owns a [`StateRestorer`] for restore events and a
//! routing table from transition kind to [`IdempotentStateUpdateExecutor`].
//!
//! For a normal update the executor's `should_execute` decides whether the
//! side effect is still missing; `execute` only runs when it is, and
//! `post_hook` always runs. Restore events bypass the table and hand the
//! whole snapshot to the restorer.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::events::Subscriber;
use crate::state::StateUpdate;

/// Error type for reconciliation
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error("Restore of database {database_id} at index {index} failed")]
    Restore {
        database_id: String,
        index: u64,
        #[source]
        source: anyhow::Error,
    },

    #[error("should_execute failed for {transition_type}")]
    ShouldExecute {
        transition_type: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("execute failed for {transition_type}")]
    Execute {
        transition_type: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("post_hook failed for {transition_type}")]
    PostHook {
        transition_type: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Result type for reconciliation
pub type ReconcileResult<T> = Result<T, ReconcileError>;

/// Routing key parsed from a wire transition type
pub trait TransitionKind: Copy + Eq + Hash + Debug + Send + Sync + 'static {
    fn parse(transition_type: &str) -> Option<Self>;
}

/// Reconciles a whole snapshot after a restart.
#[async_trait]
pub trait StateRestorer: Send + Sync {
    async fn restore(&self, update: &StateUpdate) -> anyhow::Result<()>;
}

/// Side effect for one transition kind. Must be safe to run more than once.
#[async_trait]
pub trait IdempotentStateUpdateExecutor: Send + Sync {
    /// Whether the side effect is still missing. Reading external state is
    /// allowed; mutating it is not.
    async fn should_execute(&self, update: &StateUpdate) -> anyhow::Result<bool>;

    async fn execute(&self, update: &StateUpdate) -> anyhow::Result<()>;

    /// Runs after `execute`, or in its place when it was skipped.
    async fn post_hook(&self, _update: &StateUpdate) -> anyhow::Result<()> {
        Ok(())
    }
}

pub struct StateUpdateSubscriber<K: TransitionKind> {
    name: String,
    schema_name: String,
    restorer: Arc<dyn StateRestorer>,
    executors: HashMap<K, Arc<dyn IdempotentStateUpdateExecutor>>,
}

impl<K: TransitionKind> StateUpdateSubscriber<K> {
    pub fn new(
        name: impl Into<String>,
        schema_name: impl Into<String>,
        restorer: Arc<dyn StateRestorer>,
    ) -> Self {
        Self {
            name: name.into(),
            schema_name: schema_name.into(),
            restorer,
            executors: HashMap::new(),
        }
    }

    /// Route `kind` to `executor`, replacing any previous route
    pub fn route(mut self, kind: K, executor: Arc<dyn IdempotentStateUpdateExecutor>) -> Self {
        self.executors.insert(kind, executor);
        self
    }

    pub fn schema_name(&self) -> &str {
        &self.schema_name
    }

    pub fn routes(&self) -> impl Iterator<Item = &K> {
        self.executors.keys()
    }

    /// Reconcile one update.
    pub async fn dispatch(&self, update: &StateUpdate) -> ReconcileResult<()> {
        if update.schema_type() != self.schema_name {
            return Ok(());
        }

        if update.is_restore() {
            info!(
                subscriber = %self.name,
                database_id = update.database_id(),
                index = update.index(),
                "Restoring from snapshot"
            );
            return self
                .restorer
                .restore(update)
                .await
                .map_err(|source| ReconcileError::Restore {
                    database_id: update.database_id().to_string(),
                    index: update.index(),
                    source,
                });
        }

        let transition_type = update.transition_type();
        let Some(executor) = K::parse(transition_type).and_then(|kind| self.executors.get(&kind))
        else {
            return Ok(());
        };

        let needed = executor
            .should_execute(update)
            .await
            .map_err(|source| ReconcileError::ShouldExecute {
                transition_type: transition_type.to_string(),
                source,
            })?;

        if needed {
            executor
                .execute(update)
                .await
                .map_err(|source| ReconcileError::Execute {
                    transition_type: transition_type.to_string(),
                    source,
                })?;
            debug!(
                subscriber = %self.name,
                index = update.index(),
                transition_type,
                "Executed"
            );
        } else {
            info!(
                subscriber = %self.name,
                index = update.index(),
                transition_type,
                "Already reconciled, skipping execute"
            );
        }

        executor
            .post_hook(update)
            .await
            .map_err(|source| ReconcileError::PostHook {
                transition_type: transition_type.to_string(),
                source,
            })
    }
}

#[async_trait]
impl<K: TransitionKind> Subscriber<StateUpdate> for StateUpdateSubscriber<K> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn consume_event(&self, event: Arc<StateUpdate>) -> anyhow::Result<()> {
        self.dispatch(&event).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::mock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Kind {
        SetEntry,
    }

    impl TransitionKind for Kind {
        fn parse(transition_type: &str) -> Option<Self> {
            match transition_type {
                "set_entry" => Some(Self::SetEntry),
                _ => None,
            }
        }
    }

    mock! {
        Executor {}

        #[async_trait]
        impl IdempotentStateUpdateExecutor for Executor {
            async fn should_execute(&self, update: &StateUpdate) -> anyhow::Result<bool>;
            async fn execute(&self, update: &StateUpdate) -> anyhow::Result<()>;
            async fn post_hook(&self, update: &StateUpdate) -> anyhow::Result<()>;
        }
    }

    #[derive(Default)]
    struct CountingRestorer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl StateRestorer for CountingRestorer {
        async fn restore(&self, _update: &StateUpdate) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn update(schema_type: &str, transition_type: &str) -> StateUpdate {
        StateUpdate::new(
            4,
            0,
            1,
            schema_type,
            "db-1",
            Arc::from(br#"{"entries":{"a":1}}"#.to_vec()),
            br#"{"key":"a","value":1}"#.to_vec(),
            transition_type,
        )
    }

    fn subscriber(
        executor: MockExecutor,
    ) -> (StateUpdateSubscriber<Kind>, Arc<CountingRestorer>) {
        let restorer = Arc::new(CountingRestorer::default());
        let subscriber = StateUpdateSubscriber::new("kv", "kv", restorer.clone())
            .route(Kind::SetEntry, Arc::new(executor));
        (subscriber, restorer)
    }

    #[tokio::test]
    async fn test_already_reconciled_skips_execute_but_runs_post_hook() {
        let mut executor = MockExecutor::new();
        executor.expect_should_execute().times(1).returning(|_| Ok(false));
        executor.expect_execute().times(0);
        executor.expect_post_hook().times(1).returning(|_| Ok(()));

        let (subscriber, restorer) = subscriber(executor);
        subscriber.dispatch(&update("kv", "set_entry")).await.unwrap();
        assert_eq!(restorer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_effect_runs_execute_then_post_hook() {
        let mut seq = mockall::Sequence::new();
        let mut executor = MockExecutor::new();
        executor
            .expect_should_execute()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(true));
        executor
            .expect_execute()
            .withf(|u: &StateUpdate| u.index() == 4)
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        executor
            .expect_post_hook()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let (subscriber, _) = subscriber(executor);
        subscriber.dispatch(&update("kv", "set_entry")).await.unwrap();
    }

    #[tokio::test]
    async fn test_restore_goes_to_restorer_only() {
        let mut executor = MockExecutor::new();
        executor.expect_should_execute().times(0);
        executor.expect_post_hook().times(0);

        let (subscriber, restorer) = subscriber(executor);
        let mut restore = update("kv", "set_entry");
        restore.set_restore();
        subscriber.dispatch(&restore).await.unwrap();

        assert_eq!(restorer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_foreign_schema_and_unrouted_type_are_ignored() {
        let mut executor = MockExecutor::new();
        executor.expect_should_execute().times(0);

        let (subscriber, restorer) = subscriber(executor);
        subscriber.dispatch(&update("other", "set_entry")).await.unwrap();
        subscriber.dispatch(&update("kv", "remove_entry")).await.unwrap();

        let mut foreign_restore = update("other", "");
        foreign_restore.set_restore();
        subscriber.dispatch(&foreign_restore).await.unwrap();
        assert_eq!(restorer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_execute_error_carries_transition_type_and_skips_post_hook() {
        let mut executor = MockExecutor::new();
        executor.expect_should_execute().returning(|_| Ok(true));
        executor
            .expect_execute()
            .returning(|_| Err(anyhow::anyhow!("driver unavailable")));
        executor.expect_post_hook().times(0);

        let (subscriber, _) = subscriber(executor);
        let err = subscriber
            .dispatch(&update("kv", "set_entry"))
            .await
            .unwrap_err();

        assert!(matches!(&err, ReconcileError::Execute { transition_type, .. } if transition_type == "set_entry"));
        let chain = format!("{:#}", anyhow::Error::from(err));
        assert!(chain.contains("driver unavailable"));
    }
}
