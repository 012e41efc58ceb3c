//! Queue catalog reader.

use std::sync::Arc;

use uuid::Uuid;

use super::ConnectionRegistry;
use crate::error::{Error, Result};
use crate::types::Queue;

/// Lists queues through a connection's transport. Nothing is cached.
pub struct QueueCatalog {
    registry: Arc<ConnectionRegistry>,
}

impl QueueCatalog {
    pub fn new(registry: Arc<ConnectionRegistry>) -> Self {
        Self { registry }
    }

    /// Queues of a connection, sorted by name.
    pub async fn list_queues(&self, connection_id: Uuid) -> Result<Vec<Queue>> {
        let transport = self.registry.transport(connection_id).await?;
        match transport.list_queues().await {
            Ok(mut queues) => {
                queues.sort_by(|a, b| a.name.cmp(&b.name));
                Ok(queues)
            }
            Err(e) => {
                let err = Error::from(e);
                self.registry.record_failure(connection_id, &err).await;
                Err(err)
            }
        }
    }

    /// Approximate depth of one queue.
    pub async fn queue_depth(&self, connection_id: Uuid, queue: &str) -> Result<Option<u64>> {
        let transport = self.registry.transport(connection_id).await?;
        match transport.queue_depth(queue).await {
            Ok(depth) => Ok(depth),
            Err(e) => {
                let err = Error::from(e);
                self.registry.record_failure(connection_id, &err).await;
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::DefaultConnector;
    use crate::types::{BrokerKind, RegisterConnectionRequest};
    use std::time::Duration;

    #[tokio::test]
    async fn test_list_queues_sorted() {
        let connector = Arc::new(DefaultConnector::default());
        let broker = connector.memory_broker("catalog");
        broker.seed_with_ids("zeta", &["a"]);
        broker.seed_with_ids("alpha", &["b", "c"]);

        let registry = Arc::new(ConnectionRegistry::new(connector, Duration::from_secs(1)));
        let info = registry
            .register(RegisterConnectionRequest {
                name: "catalog".to_string(),
                broker_kind: BrokerKind::Memory,
                endpoint: "memory://catalog;memory://catalog".to_string(),
            })
            .await
            .unwrap();

        let catalog = QueueCatalog::new(registry);
        let queues = catalog.list_queues(info.id).await.unwrap();
        assert_eq!(queues, vec![Queue::new("alpha", 2), Queue::new("zeta", 1)]);
        assert_eq!(catalog.queue_depth(info.id, "alpha").await.unwrap(), Some(2));
    }
}
