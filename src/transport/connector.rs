//! Factory turning a broker kind and endpoint into a live transport.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{InMemoryTransport, RabbitTransport, Transport};
use crate::error::BrokerError;
use crate::types::{BrokerKind, EndpointSpec};
use crate::{DEFAULT_CONNECT_TIMEOUT_SECS, DEFAULT_RECEIPT_TIMEOUT_SECS};

/// Opens transports for the connection registry.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(
        &self,
        kind: BrokerKind,
        endpoint: &EndpointSpec,
    ) -> Result<Arc<dyn Transport>, BrokerError>;
}

/// Connector for every built-in broker kind.
///
/// In-memory brokers are keyed by the host of the realtime URL, so two
/// connections to `memory://dev;memory://dev` share one broker.
pub struct DefaultConnector {
    connect_timeout: Duration,
    receipt_timeout: Duration,
    memory_brokers: Mutex<HashMap<String, Arc<InMemoryTransport>>>,
}

impl Default for DefaultConnector {
    fn default() -> Self {
        Self::new(
            Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            Duration::from_secs(DEFAULT_RECEIPT_TIMEOUT_SECS),
        )
    }
}

impl DefaultConnector {
    pub fn new(connect_timeout: Duration, receipt_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            receipt_timeout,
            memory_brokers: Mutex::new(HashMap::new()),
        }
    }

    /// The named in-memory broker, created on first use.
    pub fn memory_broker(&self, name: &str) -> Arc<InMemoryTransport> {
        self.memory_brokers
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone()
    }
}

fn memory_name(endpoint: &EndpointSpec) -> String {
    let url = endpoint.realtime_url();
    url.host_str()
        .map(String::from)
        .unwrap_or_else(|| url.path().trim_matches('/').to_string())
}

#[async_trait]
impl Connector for DefaultConnector {
    async fn connect(
        &self,
        kind: BrokerKind,
        endpoint: &EndpointSpec,
    ) -> Result<Arc<dyn Transport>, BrokerError> {
        match kind {
            BrokerKind::RabbitMq => {
                let transport: Arc<dyn Transport> = Arc::new(
                    RabbitTransport::connect(endpoint, self.connect_timeout, self.receipt_timeout)
                        .await?,
                );
                Ok(transport)
            }
            BrokerKind::Memory => {
                let broker: Arc<dyn Transport> = self.memory_broker(&memory_name(endpoint));
                Ok(broker)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_brokers_are_shared_by_name() {
        let connector = DefaultConnector::default();
        let endpoint: EndpointSpec = "memory://dev;memory://dev".parse().unwrap();

        let broker = connector.memory_broker("dev");
        broker.seed_with_ids("orders", &["a"]);

        let transport = connector
            .connect(BrokerKind::Memory, &endpoint)
            .await
            .unwrap();
        assert_eq!(transport.queue_depth("orders").await.unwrap(), Some(1));
    }
}
