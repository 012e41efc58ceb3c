//! In-process broker.
//!
//! Queues are FIFO deques guarded by a single lock. Drain, browse and
//! publish follow the same contract as a networked broker, which makes this
//! transport usable both for local development and as a test double.

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use super::{carried_properties, strip_reserved, Capabilities, PublishRequest, Transport};
use crate::error::BrokerError;
use crate::types::{BrokerKind, Queue, RawMessage};

/// In-memory broker holding named queues.
#[derive(Debug, Default)]
pub struct InMemoryTransport {
    queues: Mutex<HashMap<String, VecDeque<RawMessage>>>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty queue if it does not exist yet.
    pub fn declare_queue(&self, queue: &str) {
        self.queues.lock().entry(queue.to_string()).or_default();
    }

    /// Append raw messages without going through `publish`.
    pub fn seed(&self, queue: &str, messages: impl IntoIterator<Item = RawMessage>) {
        let mut queues = self.queues.lock();
        queues
            .entry(queue.to_string())
            .or_default()
            .extend(messages);
    }

    /// Append messages carrying a provider id; the body is `body-<id>`.
    pub fn seed_with_ids<S: AsRef<str>>(&self, queue: &str, ids: &[S]) {
        self.seed(
            queue,
            ids.iter().map(|id| {
                let id = id.as_ref();
                RawMessage::new(format!("body-{id}")).with_property("message_id", id)
            }),
        );
    }

    /// Current content of `queue`, head first.
    pub fn snapshot(&self, queue: &str) -> Vec<RawMessage> {
        self.queues
            .lock()
            .get(queue)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Provider ids currently in `queue`, head first.
    pub fn ids(&self, queue: &str) -> Vec<String> {
        self.snapshot(queue)
            .iter()
            .filter_map(|m| m.properties.get("message_id")?.as_str().map(String::from))
            .collect()
    }

    /// Bodies currently in `queue`, head first.
    pub fn bodies(&self, queue: &str) -> Vec<Vec<u8>> {
        self.snapshot(queue).into_iter().map(|m| m.body).collect()
    }

    pub fn depth(&self, queue: &str) -> usize {
        self.queues.lock().get(queue).map_or(0, VecDeque::len)
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Memory
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            browse: true,
            confirmed_publish: true,
        }
    }

    async fn drain(&self, queue: &str, max: usize) -> Result<Vec<RawMessage>, BrokerError> {
        let mut queues = self.queues.lock();
        let entries = queues
            .get_mut(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;

        let take = max.min(entries.len());
        let drained: Vec<RawMessage> = entries.drain(..take).collect();

        debug!(queue = %queue, count = drained.len(), "Drained messages");
        Ok(drained)
    }

    async fn publish(&self, queue: &str, request: &PublishRequest) -> Result<(), BrokerError> {
        let mut message = RawMessage::new(request.body.clone());
        message.headers = strip_reserved(&request.headers);
        message.properties = carried_properties(&request.properties);
        if let Some(id) = &request.message_id {
            message = message.with_property("message_id", id.as_str());
        }
        if let Some(content_type) = &request.content_type {
            message = message.with_property("content_type", content_type.as_str());
        }

        self.queues
            .lock()
            .entry(queue.to_string())
            .or_default()
            .push_back(message);
        Ok(())
    }

    async fn list_queues(&self) -> Result<Vec<Queue>, BrokerError> {
        let queues = self.queues.lock();
        Ok(queues
            .iter()
            .map(|(name, entries)| Queue::new(name, entries.len() as u64))
            .collect())
    }

    async fn browse(&self, queue: &str, max: usize) -> Result<Vec<RawMessage>, BrokerError> {
        let queues = self.queues.lock();
        let entries = queues
            .get(queue)
            .ok_or_else(|| BrokerError::QueueNotFound(queue.to_string()))?;
        Ok(entries.iter().take(max).cloned().collect())
    }

    async fn queue_depth(&self, queue: &str) -> Result<Option<u64>, BrokerError> {
        Ok(self.queues.lock().get(queue).map(|q| q.len() as u64))
    }

    async fn ping(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}
