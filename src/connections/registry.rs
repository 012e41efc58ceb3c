//! Registry of active broker connections.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{BrokerError, Error, Result};
use crate::transport::{Connector, Transport};
use crate::types::{Connection, ConnectionInfo, EndpointSpec, Liveness, RegisterConnectionRequest};

struct ConnectionEntry {
    connection: Connection,
    /// `None` while the connection is being established
    transport: Option<Arc<dyn Transport>>,
}

/// Owns every connection and its transport handle.
///
/// The registry is the only writer of [`Liveness`]. Other components hold
/// it by `Arc` and ask for transports by connection id.
pub struct ConnectionRegistry {
    connector: Arc<dyn Connector>,
    connect_timeout: Duration,
    entries: RwLock<HashMap<Uuid, ConnectionEntry>>,
}

impl ConnectionRegistry {
    pub fn new(connector: Arc<dyn Connector>, connect_timeout: Duration) -> Self {
        Self {
            connector,
            connect_timeout,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Parse the endpoint, open a transport and store the connection.
    pub async fn register(&self, request: RegisterConnectionRequest) -> Result<ConnectionInfo> {
        let endpoint: EndpointSpec = request.endpoint.parse()?;
        let id = Uuid::new_v4();
        let connection = Connection {
            id,
            name: request.name,
            broker_kind: request.broker_kind,
            endpoint,
            liveness: Liveness::Connecting,
            created_at: Utc::now(),
        };

        info!(
            connection_id = %id,
            name = %connection.name,
            kind = %connection.broker_kind,
            endpoint = %connection.endpoint,
            "Registering connection"
        );

        let kind = connection.broker_kind;
        let endpoint = connection.endpoint.clone();
        self.entries.write().await.insert(
            id,
            ConnectionEntry {
                connection,
                transport: None,
            },
        );

        let connected =
            tokio::time::timeout(self.connect_timeout, self.connector.connect(kind, &endpoint))
                .await
                .unwrap_or(Err(BrokerError::ConnectionTimeout(self.connect_timeout)));

        let mut entries = self.entries.write().await;
        match connected {
            Ok(transport) => {
                let entry = entries
                    .get_mut(&id)
                    .ok_or(Error::UnknownConnection(id))?;
                entry.transport = Some(transport);
                entry.connection.liveness = Liveness::Up;
                info!(connection_id = %id, "Connection up");
                Ok(entry.connection.to_info())
            }
            Err(e) => {
                entries.remove(&id);
                warn!(connection_id = %id, error = %e, "Connection failed");
                Err(e.into())
            }
        }
    }

    /// Remove a connection and close its transport.
    pub async fn remove(&self, id: Uuid) -> Result<()> {
        let entry = self
            .entries
            .write()
            .await
            .remove(&id)
            .ok_or(Error::UnknownConnection(id))?;

        if let Some(transport) = entry.transport {
            transport.close().await;
        }
        info!(connection_id = %id, "Connection removed");
        Ok(())
    }

    /// Transport for an established connection.
    pub async fn transport(&self, id: Uuid) -> Result<Arc<dyn Transport>> {
        let entries = self.entries.read().await;
        let entry = entries.get(&id).ok_or(Error::UnknownConnection(id))?;
        entry.transport.clone().ok_or_else(|| {
            Error::InvalidRequest(format!("connection {id} is still being established"))
        })
    }

    pub async fn connection(&self, id: Uuid) -> Result<ConnectionInfo> {
        self.entries
            .read()
            .await
            .get(&id)
            .map(|entry| entry.connection.to_info())
            .ok_or(Error::UnknownConnection(id))
    }

    /// All connections, oldest first.
    pub async fn list(&self) -> Vec<ConnectionInfo> {
        let mut infos: Vec<ConnectionInfo> = self
            .entries
            .read()
            .await
            .values()
            .map(|entry| entry.connection.to_info())
            .collect();
        infos.sort_by_key(|info| info.created_at);
        infos
    }

    /// Probe the broker and update liveness.
    pub async fn refresh_liveness(&self, id: Uuid) -> Result<Liveness> {
        let transport = self.transport(id).await?;
        let liveness = match tokio::time::timeout(self.connect_timeout, transport.ping()).await {
            Ok(Ok(())) => Liveness::Up,
            Ok(Err(e)) => {
                warn!(connection_id = %id, error = %e, "Liveness probe failed");
                Liveness::Down
            }
            Err(_) => {
                warn!(connection_id = %id, "Liveness probe timed out");
                Liveness::Down
            }
        };
        self.set_liveness(id, liveness).await;
        Ok(liveness)
    }

    /// Mark the connection down if `error` says it is gone.
    pub async fn record_failure(&self, id: Uuid, error: &Error) {
        if error.is_connection_fatal() {
            warn!(connection_id = %id, error = %error, "Marking connection down");
            self.set_liveness(id, Liveness::Down).await;
        }
    }

    async fn set_liveness(&self, id: Uuid, liveness: Liveness) {
        if let Some(entry) = self.entries.write().await.get_mut(&id) {
            entry.connection.liveness = liveness;
        }
    }

    /// Close every transport.
    pub async fn close_all(&self) {
        let entries: Vec<ConnectionEntry> =
            self.entries.write().await.drain().map(|(_, e)| e).collect();
        for entry in entries {
            if let Some(transport) = entry.transport {
                transport.close().await;
            }
        }
    }
}
