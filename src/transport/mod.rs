//! Broker transports.
//!
//! A transport exposes the two channels every supported broker has: a
//! destructive administrative read and a publish with optional receipt.
//! Everything else the core does is composed on top of these.

pub mod connector;
pub mod memory;
pub mod rabbit;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::BrokerError;
use crate::types::{BrokerKind, Headers, Message, Queue, RawMessage};

/// Provider properties keyed by the provider's own names.
pub type Properties = serde_json::Map<String, serde_json::Value>;

pub use connector::{Connector, DefaultConnector};
pub use memory::InMemoryTransport;
pub use rabbit::RabbitTransport;

/// Headers owned by the transport. They are stripped before republish and
/// regenerated from [`PublishRequest`] fields.
pub const RESERVED_HEADERS: &[&str] = &[
    "content-length",
    "content-type",
    "message-id",
    "receipt",
    "destination",
    "subscription",
];

/// Properties describing one delivery rather than the message. They are
/// never carried over on republish.
pub const DELIVERY_PROPERTIES: &[&str] = &[
    "routing_key",
    "exchange",
    "redelivered",
    "delivery_tag",
    "message_count",
];

/// Whether a header name is reserved by the transport.
pub fn is_reserved_header(name: &str) -> bool {
    RESERVED_HEADERS
        .iter()
        .any(|reserved| reserved.eq_ignore_ascii_case(name))
}

/// Copy of `headers` without transport-reserved entries.
pub fn strip_reserved(headers: &Headers) -> Headers {
    headers
        .iter()
        .filter(|(name, _)| !is_reserved_header(name))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Provider properties of a drained message that travel with it on
/// republish.
pub fn carried_properties(properties: &Properties) -> Properties {
    properties
        .iter()
        .filter(|(name, _)| !DELIVERY_PROPERTIES.contains(&name.as_str()))
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect()
}

/// Optional features a broker may offer beyond drain and publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Non-destructive read
    pub browse: bool,
    /// Publish waits for a broker receipt
    pub confirmed_publish: bool,
}

/// A message to append to a queue.
#[derive(Debug, Clone)]
pub struct PublishRequest {
    pub body: Vec<u8>,
    /// Application headers; reserved names are ignored
    pub headers: Headers,
    /// Provider properties (timestamp, priority, expiration, ...) to carry
    /// over; `message_id` and `content_type` below take precedence
    pub properties: Properties,
    /// Provider message id to carry over
    pub message_id: Option<String>,
    pub content_type: Option<String>,
    /// Wait for a broker receipt before returning
    pub confirm: bool,
    /// Correlation token for the receipt handshake
    pub receipt: Uuid,
}

impl PublishRequest {
    /// A new message with the given body.
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            headers: Headers::new(),
            properties: Properties::new(),
            message_id: None,
            content_type: None,
            confirm: false,
            receipt: Uuid::new_v4(),
        }
    }

    /// Republish request for a drained message.
    ///
    /// Body bytes and provider properties are kept exactly, reserved
    /// headers are dropped and the provider id is carried over so the
    /// message keeps its identity.
    pub fn republish(message: &Message) -> Self {
        Self {
            body: message.body.as_bytes().to_vec(),
            headers: strip_reserved(&message.headers),
            properties: carried_properties(&message.raw_properties),
            message_id: message.provider_id.then(|| message.id.clone()),
            content_type: message.content_type().map(String::from),
            confirm: false,
            receipt: Uuid::new_v4(),
        }
    }

    pub fn with_confirm(mut self, confirm: bool) -> Self {
        self.confirm = confirm;
        self
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = strip_reserved(&headers);
        self
    }

    /// Same message with a fresh receipt token, for a retry.
    pub fn retry(&self) -> Self {
        Self {
            receipt: Uuid::new_v4(),
            ..self.clone()
        }
    }
}

/// One broker's drain/publish/list primitives.
///
/// Connection-level failures are returned as-is and never retried here.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> BrokerKind;

    fn capabilities(&self) -> Capabilities {
        Capabilities::default()
    }

    /// Destructively remove up to `max` messages from the head of `queue`
    /// in a single administrative call.
    async fn drain(&self, queue: &str, max: usize) -> Result<Vec<RawMessage>, BrokerError>;

    /// Append a message to `queue`. With `request.confirm` set this returns
    /// only after the broker receipt, or `ReceiptTimeout`.
    async fn publish(&self, queue: &str, request: &PublishRequest) -> Result<(), BrokerError>;

    async fn list_queues(&self) -> Result<Vec<Queue>, BrokerError>;

    /// Read up to `max` messages without removing them.
    async fn browse(&self, _queue: &str, _max: usize) -> Result<Vec<RawMessage>, BrokerError> {
        Err(BrokerError::Unsupported("browse"))
    }

    /// Approximate depth of `queue`, if the broker reports one.
    async fn queue_depth(&self, queue: &str) -> Result<Option<u64>, BrokerError> {
        let queues = self.list_queues().await?;
        Ok(queues
            .into_iter()
            .find(|q| q.name == queue)
            .map(|q| q.approximate_depth))
    }

    /// Cheap round trip proving the connection works.
    async fn ping(&self) -> Result<(), BrokerError> {
        self.list_queues().await.map(|_| ())
    }

    /// Release the connection handle.
    async fn close(&self) {}
}
