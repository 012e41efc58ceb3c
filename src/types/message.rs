//! Message type definitions.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Application headers carried by a message.
pub type Headers = BTreeMap<String, serde_json::Value>;

/// A message as handed over by a transport, before normalization.
///
/// `properties` holds the provider's own field names (`message_id`,
/// `timestamp`, `sequenceNumber`, ...); the projection maps them onto
/// [`Message`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawMessage {
    pub body: Vec<u8>,
    pub properties: serde_json::Map<String, serde_json::Value>,
    pub headers: Headers,
    pub redelivered: bool,
}

impl RawMessage {
    /// Create a raw message with the given body and no metadata.
    pub fn new(body: impl Into<Vec<u8>>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    /// Set a provider property.
    pub fn with_property(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.properties.insert(key.to_string(), value.into());
        self
    }

    /// Set an application header.
    pub fn with_header(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.headers.insert(key.to_string(), value.into());
        self
    }
}

/// Message payload: UTF-8 text or opaque bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    Text(String),
    Binary(Vec<u8>),
}

impl MessageBody {
    /// Classify raw bytes without altering them.
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        match String::from_utf8(bytes) {
            Ok(text) => MessageBody::Text(text),
            Err(e) => MessageBody::Binary(e.into_bytes()),
        }
    }

    /// Exact bytes as received from the broker.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            MessageBody::Text(text) => text.as_bytes(),
            MessageBody::Binary(bytes) => bytes,
        }
    }

    pub fn into_bytes(self) -> Vec<u8> {
        match self {
            MessageBody::Text(text) => text.into_bytes(),
            MessageBody::Binary(bytes) => bytes,
        }
    }

    pub fn len(&self) -> usize {
        self.as_bytes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Parse the payload as JSON, if it is JSON.
    pub fn json(&self) -> Option<serde_json::Value> {
        match self {
            MessageBody::Text(text) => serde_json::from_str(text).ok(),
            MessageBody::Binary(_) => None,
        }
    }
}

/// A normalized message.
///
/// Messages are never edited in place; an edit is a delete followed by a
/// send of a new message.
#[derive(Debug, Clone)]
pub struct Message {
    /// Provider id when present, otherwise derived from content and position
    pub id: String,

    /// Whether `id` came from the broker
    pub provider_id: bool,

    /// Provider sequence number, or the position within the read
    pub sequence_hint: i64,

    /// Label / subject / routing key
    pub label: Option<String>,

    /// Size of the body in bytes
    pub size_bytes: usize,

    /// When the broker admitted the message (now, if unknown)
    pub enqueued_at: DateTime<Utc>,

    /// How many times the broker has delivered the message
    pub delivery_count: u32,

    pub redelivered: bool,

    /// Provider properties as received
    pub raw_properties: serde_json::Map<String, serde_json::Value>,

    /// Application headers as received
    pub headers: Headers,

    pub body: MessageBody,
}

impl Message {
    /// Content type recorded by the producer, if any.
    pub fn content_type(&self) -> Option<&str> {
        ["content_type", "contentType", "content-type"]
            .iter()
            .find_map(|key| self.raw_properties.get(*key).and_then(|v| v.as_str()))
    }
}

/// Serializable view of a message for presentation layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageView {
    pub id: String,
    pub sequence_hint: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    pub size_bytes: usize,
    pub enqueued_at: DateTime<Utc>,
    pub delivery_count: u32,
    pub redelivered: bool,
    pub properties: serde_json::Map<String, serde_json::Value>,
    pub headers: Headers,
    pub body: EncodedBody,
}

/// Body encoded for JSON transport, mirroring the management API convention.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedBody {
    /// `string` or `base64`
    pub encoding: String,
    pub payload: String,
}

impl EncodedBody {
    pub fn encode(body: &MessageBody) -> Self {
        use base64::Engine;

        match body {
            MessageBody::Text(text) => Self {
                encoding: "string".to_string(),
                payload: text.clone(),
            },
            MessageBody::Binary(bytes) => Self {
                encoding: "base64".to_string(),
                payload: base64::engine::general_purpose::STANDARD.encode(bytes),
            },
        }
    }

    /// Decode back to raw bytes.
    pub fn decode(&self) -> Result<Vec<u8>, String> {
        use base64::Engine;

        match self.encoding.as_str() {
            "string" | "" => Ok(self.payload.clone().into_bytes()),
            "base64" => base64::engine::general_purpose::STANDARD
                .decode(&self.payload)
                .map_err(|e| format!("invalid base64 payload: {e}")),
            other => Err(format!("unknown payload encoding '{other}'")),
        }
    }
}

impl From<&Message> for MessageView {
    fn from(message: &Message) -> Self {
        Self {
            id: message.id.clone(),
            sequence_hint: message.sequence_hint,
            label: message.label.clone(),
            size_bytes: message.size_bytes,
            enqueued_at: message.enqueued_at,
            delivery_count: message.delivery_count,
            redelivered: message.redelivered,
            properties: message.raw_properties.clone(),
            headers: message.headers.clone(),
            body: EncodedBody::encode(&message.body),
        }
    }
}
