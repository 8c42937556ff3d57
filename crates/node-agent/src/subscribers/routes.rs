//! Reverse-proxy rules

use std::sync::Arc;

use async_trait::async_trait;
use statemachine::{IdempotentStateUpdateExecutor, StateRestorer, StateUpdate, StateUpdateSubscriber};

use super::{node_state, transition};
use crate::drivers::ProxyRules;
use crate::schema::{NodeTransition, NodeTransitionKind, NODE_SCHEMA};

pub fn routes_subscriber(proxy: Arc<dyn ProxyRules>) -> StateUpdateSubscriber<NodeTransitionKind> {
    StateUpdateSubscriber::new(
        "routes",
        NODE_SCHEMA,
        Arc::new(RoutesRestorer {
            proxy: Arc::clone(&proxy),
        }),
    )
    .route(
        NodeTransitionKind::RegisterRoute,
        Arc::new(RegisterRouteExecutor {
            proxy: Arc::clone(&proxy),
        }),
    )
    .route(NodeTransitionKind::RemoveRoute, Arc::new(RemoveRouteExecutor { proxy }))
}

fn domain(update: &StateUpdate) -> anyhow::Result<String> {
    match transition(update)? {
        NodeTransition::RegisterRoute(route) => Ok(route.domain),
        NodeTransition::RemoveRoute(route) => Ok(route.domain),
        other => anyhow::bail!("unexpected transition {}", other.kind()),
    }
}

pub struct RegisterRouteExecutor {
    proxy: Arc<dyn ProxyRules>,
}

#[async_trait]
impl IdempotentStateUpdateExecutor for RegisterRouteExecutor {
    async fn should_execute(&self, update: &StateUpdate) -> anyhow::Result<bool> {
        let domain = domain(update)?;
        let Some(route) = node_state(update)?.routes.remove(&domain) else {
            return Ok(false);
        };
        Ok(self.proxy.target(&domain).await?.as_deref() != Some(route.app_id.as_str()))
    }

    async fn execute(&self, update: &StateUpdate) -> anyhow::Result<()> {
        let domain = domain(update)?;
        let state = node_state(update)?;
        let Some(route) = state.routes.get(&domain) else {
            anyhow::bail!("route {domain} missing from committed state");
        };
        self.proxy.upsert(route).await
    }
}

pub struct RemoveRouteExecutor {
    proxy: Arc<dyn ProxyRules>,
}

#[async_trait]
impl IdempotentStateUpdateExecutor for RemoveRouteExecutor {
    async fn should_execute(&self, update: &StateUpdate) -> anyhow::Result<bool> {
        let domain = domain(update)?;
        let wanted = node_state(update)?.routes.contains_key(&domain);
        Ok(!wanted && self.proxy.target(&domain).await?.is_some())
    }

    async fn execute(&self, update: &StateUpdate) -> anyhow::Result<()> {
        self.proxy.remove(&domain(update)?).await
    }
}

/// Makes the proxy table equal to the snapshot's routes.
pub struct RoutesRestorer {
    proxy: Arc<dyn ProxyRules>,
}

#[async_trait]
impl StateRestorer for RoutesRestorer {
    async fn restore(&self, update: &StateUpdate) -> anyhow::Result<()> {
        let state = node_state(update)?;

        for domain in self.proxy.domains().await? {
            if !state.routes.contains_key(&domain) {
                self.proxy.remove(&domain).await?;
            }
        }
        for route in state.routes.values() {
            if self.proxy.target(&route.domain).await?.as_deref() != Some(route.app_id.as_str()) {
                self.proxy.upsert(route).await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::MemoryProxyRules;
    use crate::schema::Route;
    use crate::subscribers::fixtures::Node;

    fn app(node: &mut Node) -> String {
        node.commit(NodeTransition::start_installation("blog", "ghost", "alice"));
        node.state().app_by_name("blog").unwrap().id.clone()
    }

    #[tokio::test]
    async fn test_register_and_remove() {
        let mut node = Node::new();
        let app_id = app(&mut node);
        let proxy = Arc::new(MemoryProxyRules::new());
        let subscriber = routes_subscriber(proxy.clone());

        let registered = node.commit(NodeTransition::register_route("blog.example", &app_id));
        subscriber.dispatch(&registered).await.unwrap();
        assert_eq!(proxy.target("blog.example").await.unwrap(), Some(app_id));

        let removed = node.commit(NodeTransition::remove_route("blog.example"));
        subscriber.dispatch(&removed).await.unwrap();
        assert!(proxy.domains().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_matching_rule_is_left_alone() {
        let mut node = Node::new();
        let app_id = app(&mut node);
        let proxy = Arc::new(MemoryProxyRules::new());
        proxy
            .upsert(&Route {
                domain: "blog.example".into(),
                app_id: app_id.clone(),
            })
            .await
            .unwrap();

        let registered = node.commit(NodeTransition::register_route("blog.example", &app_id));
        let executor = RegisterRouteExecutor { proxy };
        assert!(!executor.should_execute(&registered).await.unwrap());
    }

    #[tokio::test]
    async fn test_restore_replaces_table() {
        let mut node = Node::new();
        let app_id = app(&mut node);
        node.commit(NodeTransition::register_route("blog.example", &app_id));

        let proxy = Arc::new(MemoryProxyRules::new());
        proxy
            .upsert(&Route {
                domain: "stale.example".into(),
                app_id: "gone".into(),
            })
            .await
            .unwrap();

        routes_subscriber(proxy.clone())
            .dispatch(&node.restore())
            .await
            .unwrap();
        assert_eq!(proxy.domains().await.unwrap(), vec!["blog.example".to_string()]);
    }
}
