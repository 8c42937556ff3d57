//! Package installation

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use statemachine::database::DatabaseError;
use statemachine::{
    IdempotentStateUpdateExecutor, StateRestorer, StateUpdate, StateUpdateSubscriber,
    TransitionProposer,
};
use tracing::{debug, info};

use super::{node_state, transition};
use crate::drivers::PackageInstaller;
use crate::schema::{InstallStatus, NodeTransition, NodeTransitionKind, NODE_SCHEMA};

pub fn packages_subscriber(
    installer: Arc<dyn PackageInstaller>,
    proposer: Arc<dyn TransitionProposer>,
) -> StateUpdateSubscriber<NodeTransitionKind> {
    let restorer = Arc::new(PackagesRestorer {
        installer: Arc::clone(&installer),
        proposer: Arc::clone(&proposer),
    });
    StateUpdateSubscriber::new("packages", NODE_SCHEMA, restorer).route(
        NodeTransitionKind::StartInstallation,
        Arc::new(StartInstallationExecutor {
            installer,
            proposer,
        }),
    )
}

/// Propose `finish_installation`; losing a race to another finisher is fine.
async fn finish_installation(
    proposer: &dyn TransitionProposer,
    database_id: &str,
    app_id: &str,
) -> anyhow::Result<()> {
    match proposer
        .propose(database_id, vec![NodeTransition::finish_installation(app_id).boxed()])
        .await
    {
        Ok(_) => {
            info!(database_id, app_id, "Installation finished");
            Ok(())
        }
        Err(DatabaseError::Controller(e)) if e.is_rejection() => {
            debug!(database_id, app_id, reason = %e, "Installation already finished");
            Ok(())
        }
        Err(e) => Err(e).context("proposing finish_installation"),
    }
}

fn app_id(update: &StateUpdate) -> anyhow::Result<String> {
    match transition(update)? {
        NodeTransition::StartInstallation(install) => Ok(install.enriched.app_id),
        other => anyhow::bail!("unexpected transition {}", other.kind()),
    }
}

pub struct StartInstallationExecutor {
    installer: Arc<dyn PackageInstaller>,
    proposer: Arc<dyn TransitionProposer>,
}

#[async_trait]
impl IdempotentStateUpdateExecutor for StartInstallationExecutor {
    async fn should_execute(&self, update: &StateUpdate) -> anyhow::Result<bool> {
        let app_id = app_id(update)?;
        Ok(!self.installer.is_installed(&app_id).await?)
    }

    async fn execute(&self, update: &StateUpdate) -> anyhow::Result<()> {
        let app_id = app_id(update)?;
        let state = node_state(update)?;
        let app = state
            .apps
            .get(&app_id)
            .with_context(|| format!("app {app_id} missing from committed state"))?;
        self.installer.install(app).await
    }

    /// Chain `finish_installation` once the package is present.
    async fn post_hook(&self, update: &StateUpdate) -> anyhow::Result<()> {
        let app_id = app_id(update)?;
        let state = node_state(update)?;
        let installing = state
            .apps
            .get(&app_id)
            .is_some_and(|app| app.status == InstallStatus::Installing);
        if !installing {
            return Ok(());
        }
        finish_installation(self.proposer.as_ref(), update.database_id(), &app_id).await
    }
}

/// Installs every app in the snapshot, removes packages it no longer lists,
/// and finishes installations interrupted by the restart.
pub struct PackagesRestorer {
    installer: Arc<dyn PackageInstaller>,
    proposer: Arc<dyn TransitionProposer>,
}

#[async_trait]
impl StateRestorer for PackagesRestorer {
    async fn restore(&self, update: &StateUpdate) -> anyhow::Result<()> {
        let state = node_state(update)?;

        for app_id in self.installer.installed().await? {
            if !state.apps.contains_key(&app_id) {
                self.installer.uninstall(&app_id).await?;
            }
        }

        for app in state.apps.values() {
            if !self.installer.is_installed(&app.id).await? {
                self.installer
                    .install(app)
                    .await
                    .with_context(|| format!("installing {}", app.name))?;
            }
            if app.status == InstallStatus::Installing {
                finish_installation(self.proposer.as_ref(), update.database_id(), &app.id).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::MemoryPackageInstaller;
    use crate::schema::NodeSchema;
    use crate::subscribers::fixtures::Node;
    use statemachine::database::DatabaseResult;
    use statemachine::{ControllerError, Document, Transition, TransitionError};
    use std::sync::Mutex;

    /// Records proposals instead of committing them
    #[derive(Default)]
    struct RecordingProposer {
        proposed: Mutex<Vec<(String, String)>>,
        reject: bool,
    }

    #[async_trait]
    impl TransitionProposer for RecordingProposer {
        async fn propose(
            &self,
            database_id: &str,
            transitions: Vec<Box<dyn Transition>>,
        ) -> DatabaseResult<Document> {
            let mut types = Vec::new();
            for t in &transitions {
                types.push((database_id.to_string(), t.transition_type().to_string()));
            }
            self.proposed.lock().unwrap().extend(types);

            if self.reject {
                return Err(DatabaseError::Controller(ControllerError::Transition {
                    transition_type: "finish_installation".into(),
                    source: TransitionError::validation("already installed"),
                }));
            }
            Ok(Document::empty(Arc::new(NodeSchema))?)
        }
    }

    fn installing(node: &mut Node) -> StateUpdate {
        node.commit(NodeTransition::start_installation("blog", "ghost", "alice"))
    }

    #[tokio::test]
    async fn test_install_then_finish_is_proposed() {
        let mut node = Node::new();
        let update = installing(&mut node);
        let installer = Arc::new(MemoryPackageInstaller::new());
        let proposer = Arc::new(RecordingProposer::default());
        let subscriber = packages_subscriber(installer.clone(), proposer.clone());

        subscriber.dispatch(&update).await.unwrap();

        assert_eq!(installer.install_count(), 1);
        assert_eq!(
            proposer.proposed.lock().unwrap().as_slice(),
            &[("db-1".to_string(), "finish_installation".to_string())]
        );
    }

    #[tokio::test]
    async fn test_rejected_finish_is_not_an_error() {
        let mut node = Node::new();
        let update = installing(&mut node);
        let proposer = Arc::new(RecordingProposer {
            reject: true,
            ..Default::default()
        });
        let subscriber = packages_subscriber(Arc::new(MemoryPackageInstaller::new()), proposer);

        subscriber.dispatch(&update).await.unwrap();
    }

    #[tokio::test]
    async fn test_finished_installation_proposes_nothing() {
        let mut node = Node::new();
        let update = installing(&mut node);
        let app_id = node.state().app_by_name("blog").unwrap().id.clone();
        let finished = node.commit(NodeTransition::finish_installation(&app_id));

        let proposer = Arc::new(RecordingProposer::default());
        let executor = StartInstallationExecutor {
            installer: Arc::new(MemoryPackageInstaller::new()),
            proposer: proposer.clone(),
        };
        // the start_installation transition, seen against the later document
        let replayed = StateUpdate::new(
            finished.index(),
            0,
            1,
            "node",
            "db-1",
            finished.new_state_bytes().into(),
            update.transition().to_vec(),
            "start_installation",
        );
        executor.post_hook(&replayed).await.unwrap();
        assert!(proposer.proposed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_already_installed_package_is_not_reinstalled() {
        let mut node = Node::new();
        let update = installing(&mut node);
        let installer = Arc::new(MemoryPackageInstaller::new());
        let app = node.state().app_by_name("blog").unwrap().clone();
        installer.install(&app).await.unwrap();

        let executor = StartInstallationExecutor {
            installer: installer.clone(),
            proposer: Arc::new(RecordingProposer::default()),
        };
        assert!(!executor.should_execute(&update).await.unwrap());
        assert_eq!(installer.install_count(), 1);
    }

    #[tokio::test]
    async fn test_restore_installs_missing_and_removes_unknown() {
        let mut node = Node::new();
        installing(&mut node);
        let installer = Arc::new(MemoryPackageInstaller::new());
        let stray = crate::schema::App {
            id: "stray".into(),
            ..node.state().app_by_name("blog").unwrap().clone()
        };
        installer.install(&stray).await.unwrap();

        let proposer = Arc::new(RecordingProposer::default());
        let restorer = PackagesRestorer {
            installer: installer.clone(),
            proposer: proposer.clone(),
        };
        restorer.restore(&node.restore()).await.unwrap();

        let app_id = node.state().app_by_name("blog").unwrap().id.clone();
        assert_eq!(installer.installed().await.unwrap(), vec![app_id]);
        // interrupted installation is finished
        assert_eq!(proposer.proposed.lock().unwrap().len(), 1);
    }
}
