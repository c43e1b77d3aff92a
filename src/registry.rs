use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

use crate::broker::{BrokerConnection, QueueHandle};
use crate::error::{PluginError, Result};
use crate::routing::RoutingTable;

/// Live queue handles keyed by name.
///
/// Filled once while the plugin sets up and read-only afterwards, so it is
/// shared behind an `Arc` without any locking.
pub struct QueueRegistry {
    queues: BTreeMap<String, Arc<dyn QueueHandle>>,
}

impl QueueRegistry {
    /// Declare every distinct name in `routing` on `connection`.
    ///
    /// Declarations run one after another; the first failure aborts the
    /// whole build and nothing is kept.
    pub async fn declare_all(
        connection: &dyn BrokerConnection,
        routing: &RoutingTable,
        per_call: Duration,
    ) -> Result<Self> {
        let mut queues = BTreeMap::new();

        for name in routing.queue_names() {
            let handle = timeout(per_call, connection.declare_queue(&name))
                .await
                .map_err(|_| PluginError::Timeout {
                    operation: format!("declaring queue '{name}'"),
                    after: per_call,
                })??;

            tracing::debug!(queue = %name, roles = ?routing.roles_of(&name), "Queue declared");
            queues.insert(name, handle);
        }

        Ok(Self { queues })
    }

    #[cfg(test)]
    fn from_handles(handles: impl IntoIterator<Item = Arc<dyn QueueHandle>>) -> Self {
        let queues = handles
            .into_iter()
            .map(|handle| (handle.name().to_string(), handle))
            .collect();
        Self { queues }
    }

    /// Look up a declared queue. Asking for a name that was never declared is
    /// a wiring bug and is reported as such.
    pub fn get(&self, name: &str) -> Result<Arc<dyn QueueHandle>> {
        match self.queues.get(name) {
            Some(handle) => Ok(handle.clone()),
            None => {
                tracing::error!(queue = %name, "Lookup of a queue that was never declared");
                Err(PluginError::UnknownQueue(name.to_string()))
            }
        }
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.queues.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, MemoryBroker};

    fn names(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_overlapping_names_declared_once() {
        let broker = MemoryBroker::new();
        let conn = broker.connect("memory://test").await.unwrap();
        let routing = RoutingTable::new(
            names(&["in"]),
            vec![],
            names(&["logs", "audit"]),
            names(&["audit", "exceptions"]),
        );

        let registry = QueueRegistry::declare_all(conn.as_ref(), &routing, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(registry.len(), 4);
        for name in ["in", "logs", "audit", "exceptions"] {
            assert_eq!(broker.declare_count(name), 1, "{name}");
            assert_eq!(registry.get(name).unwrap().name(), name);
        }
    }

    #[tokio::test]
    async fn test_unknown_queue_lookup_fails() {
        let registry = QueueRegistry::from_handles(Vec::new());
        assert!(registry.is_empty());
        assert!(matches!(
            registry.get("nowhere"),
            Err(PluginError::UnknownQueue(name)) if name == "nowhere"
        ));
    }

    #[tokio::test]
    async fn test_declare_failure_aborts() {
        let broker = MemoryBroker::new();
        broker.fail_declare("audit");
        let conn = broker.connect("memory://test").await.unwrap();
        let routing = RoutingTable::new(names(&["in"]), vec![], names(&["audit"]), vec![]);

        let result =
            QueueRegistry::declare_all(conn.as_ref(), &routing, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(PluginError::Broker(_))));
        assert_eq!(broker.declare_count("logs"), 0);
    }
}
