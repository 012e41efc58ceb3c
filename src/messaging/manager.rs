//! Per-connection message API.
//!
//! [`MessageManager`] is the composition point for presentation layers: it
//! resolves connection ids through the registry and serializes every
//! operation on a `(connection, queue)` pair, which the engine requires but
//! does not enforce.
//!
//! Moves lock the source queue only. The target is appended to without its
//! lock, so an operation draining the target at the same time may pick up
//! moved messages and republish them with the rest; nothing is lost, but a
//! concurrent export or purge of the target can include or remove them.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::engine::MutationEngine;
use crate::batch::BulkCoordinator;
use crate::connections::{ConnectionRegistry, QueueCatalog};
use crate::error::{Error, Result};
use crate::types::{
    BulkResult, ConnectionInfo, EncodedBody, Headers, ManagerConfig, Message, MessageBody,
    PurgeResult, Queue, RegisterConnectionRequest,
};

type QueueKey = (Uuid, String);

/// Message operations addressed by connection id.
pub struct MessageManager {
    registry: Arc<ConnectionRegistry>,
    catalog: QueueCatalog,
    config: ManagerConfig,
    locks: Mutex<HashMap<QueueKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl MessageManager {
    pub fn new(registry: Arc<ConnectionRegistry>, config: ManagerConfig) -> Self {
        Self {
            catalog: QueueCatalog::new(registry.clone()),
            registry,
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub async fn register_connection(
        &self,
        request: RegisterConnectionRequest,
    ) -> Result<ConnectionInfo> {
        self.registry.register(request).await
    }

    pub async fn list_queues(&self, connection_id: Uuid) -> Result<Vec<Queue>> {
        self.catalog.list_queues(connection_id).await
    }

    /// Up to `limit` messages from the head of `queue`, left in place.
    pub async fn get_messages(
        &self,
        connection_id: Uuid,
        queue: &str,
        limit: usize,
    ) -> Result<Vec<Message>> {
        let queue_name = queue.to_string();
        self.serialized(connection_id, queue, move |engine| async move {
            engine.peek(&queue_name, limit).await
        })
        .await
    }

    pub async fn send_message(
        &self,
        connection_id: Uuid,
        queue: &str,
        body: Vec<u8>,
        headers: Headers,
    ) -> Result<()> {
        let engine = self.engine(connection_id).await?;
        let result = engine.send(queue, body, headers).await;
        self.observe(connection_id, result).await
    }

    pub async fn delete_message(&self, connection_id: Uuid, queue: &str, id: &str) -> Result<()> {
        let (queue_name, id) = (queue.to_string(), id.to_string());
        self.serialized(connection_id, queue, move |engine| async move {
            engine.delete_one(&queue_name, &id).await
        })
        .await
    }

    /// Move one message. Only `source_queue` is locked.
    pub async fn move_message(
        &self,
        connection_id: Uuid,
        source_queue: &str,
        target_queue: &str,
        id: &str,
    ) -> Result<()> {
        let (source, target, id) = (
            source_queue.to_string(),
            target_queue.to_string(),
            id.to_string(),
        );
        self.serialized(connection_id, source_queue, move |engine| async move {
            engine.move_one(&source, &target, &id).await
        })
        .await
    }

    pub async fn bulk_delete_messages(
        &self,
        connection_id: Uuid,
        queue: &str,
        ids: Vec<String>,
    ) -> Result<BulkResult> {
        let queue_name = queue.to_string();
        let bulk = self.config.bulk.clone();
        self.serialized(connection_id, queue, move |engine| async move {
            BulkCoordinator::new(Arc::new(engine), bulk)
                .bulk_delete(&queue_name, &ids)
                .await
        })
        .await
    }

    /// Bulk move. Only `source_queue` is locked, as in [`Self::move_message`].
    pub async fn bulk_move_messages(
        &self,
        connection_id: Uuid,
        source_queue: &str,
        target_queue: &str,
        ids: Vec<String>,
    ) -> Result<BulkResult> {
        let (source, target) = (source_queue.to_string(), target_queue.to_string());
        let bulk = self.config.bulk.clone();
        self.serialized(connection_id, source_queue, move |engine| async move {
            BulkCoordinator::new(Arc::new(engine), bulk)
                .bulk_move(&source, &target, &ids)
                .await
        })
        .await
    }

    pub async fn purge_queue(&self, connection_id: Uuid, queue: &str) -> Result<PurgeResult> {
        let queue_name = queue.to_string();
        self.serialized(connection_id, queue, move |engine| async move {
            engine.purge(&queue_name).await
        })
        .await
    }

    pub async fn import_messages(
        &self,
        connection_id: Uuid,
        queue: &str,
        bodies: Vec<EncodedBody>,
    ) -> Result<BulkResult> {
        let engine = self.engine(connection_id).await?;
        Ok(engine.import_encoded(queue, &bodies).await)
    }

    /// Bodies of the messages in `ids`, or of every message when empty.
    pub async fn export_messages(
        &self,
        connection_id: Uuid,
        queue: &str,
        ids: Vec<String>,
    ) -> Result<Vec<MessageBody>> {
        let queue_name = queue.to_string();
        let messages = self
            .serialized(connection_id, queue, move |engine| async move {
                engine.export_messages(&queue_name, &ids).await
            })
            .await?;
        Ok(messages.into_iter().map(|m| m.body).collect())
    }

    async fn engine(&self, connection_id: Uuid) -> Result<MutationEngine> {
        let transport = self.registry.transport(connection_id).await?;
        Ok(MutationEngine::new(transport, self.config.engine.clone()))
    }

    fn queue_lock(&self, connection_id: Uuid, queue: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        locks
            .entry((connection_id, queue.to_string()))
            .or_default()
            .clone()
    }

    /// Run `op` while holding the queue's lock. The lock travels with the
    /// spawned task, so it is held until the operation settles even if the
    /// caller goes away.
    async fn serialized<T, F, Fut>(&self, connection_id: Uuid, queue: &str, op: F) -> Result<T>
    where
        F: FnOnce(MutationEngine) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let engine = self.engine(connection_id).await?;
        let lock = self.queue_lock(connection_id, queue);
        let queue_name = queue.to_string();

        let handle = tokio::spawn(async move {
            let _guard = lock.lock_owned().await;
            debug!(connection_id = %connection_id, queue = %queue_name, "Queue lock acquired");
            op(engine).await
        });

        let result = match handle.await {
            Ok(result) => result,
            Err(e) => Err(Error::Interrupted(e.to_string())),
        };
        self.observe(connection_id, result).await
    }

    async fn observe<T>(&self, connection_id: Uuid, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            self.registry.record_failure(connection_id, e).await;
        }
        result
    }
}
