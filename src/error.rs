//! Error taxonomy for transports and message operations.

use std::time::Duration;

use uuid::Uuid;

use crate::transport::Properties;
use crate::types::{EncodedBody, FailedChunk, Headers, MessageBody};

/// Errors raised by a broker transport.
///
/// Connection-level variants are fatal to the transport instance and are
/// never retried inside the transport; retry policy belongs to the engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("connection timed out after {0:?}")]
    ConnectionTimeout(Duration),

    #[error("connection rejected: {0}")]
    ConnectionRejected(String),

    #[error("broker unreachable: {0}")]
    Unreachable(String),

    /// The broker did not acknowledge a confirmed publish in time. The
    /// message may or may not have been admitted.
    #[error("no receipt for publish to {queue} (receipt {receipt})")]
    ReceiptTimeout { queue: String, receipt: Uuid },

    #[error("publish to {queue} rejected: {reason}")]
    PublishRejected { queue: String, reason: String },

    #[error("queue not found: {0}")]
    QueueNotFound(String),

    #[error("operation not supported by this broker: {0}")]
    Unsupported(&'static str),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transport error: {0}")]
    Transport(String),
}

impl BrokerError {
    /// Whether the error invalidates the connection itself.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(
            self,
            BrokerError::ConnectionTimeout(_)
                | BrokerError::ConnectionRejected(_)
                | BrokerError::Unreachable(_)
        )
    }

    /// Whether the outcome of the failed call is unknown.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, BrokerError::ReceiptTimeout { .. })
    }

    /// Whether repeating the call may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            BrokerError::ReceiptTimeout { .. } | BrokerError::Transport(_) | BrokerError::Protocol(_)
        )
    }
}

impl From<reqwest::Error> for BrokerError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() {
            BrokerError::Unreachable(err.to_string())
        } else if err.is_decode() {
            BrokerError::Protocol(err.to_string())
        } else {
            BrokerError::Transport(err.to_string())
        }
    }
}

impl From<lapin::Error> for BrokerError {
    fn from(err: lapin::Error) -> Self {
        match err {
            lapin::Error::IOError(e) => BrokerError::Unreachable(e.to_string()),
            lapin::Error::ProtocolError(e) => BrokerError::ConnectionRejected(e.to_string()),
            other => BrokerError::Transport(other.to_string()),
        }
    }
}

/// A drained message that could not be put back anywhere.
///
/// Serializes with everything needed to publish it again by hand: the body
/// as an [`EncodedBody`], the application headers and the provider
/// properties.
#[derive(Debug, Clone, serde::Serialize)]
pub struct LostMessage {
    pub id: String,
    #[serde(serialize_with = "encoded_body")]
    pub body: Vec<u8>,
    pub headers: Headers,
    pub properties: Properties,
    pub error: String,
}

fn encoded_body<S: serde::Serializer>(body: &[u8], serializer: S) -> std::result::Result<S::Ok, S::Error> {
    use serde::Serialize;

    EncodedBody::encode(&MessageBody::from_bytes(body.to_vec())).serialize(serializer)
}

/// Errors surfaced by the message management core.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("message {id} not found in queue {queue}")]
    NotFound { queue: String, id: String },

    #[error("{count} messages in queue {queue} share id {id}")]
    AmbiguousId {
        queue: String,
        id: String,
        count: usize,
    },

    #[error("{failed} of {} messages failed in {} chunk(s)", succeeded + failed, chunks.len())]
    PartialFailure {
        succeeded: usize,
        failed: usize,
        chunks: Vec<FailedChunk>,
    },

    /// Messages were drained but could not be restored. Never retried.
    #[error("{} message(s) drained from {queue} could not be restored", lost.len())]
    DataLossRisk {
        queue: String,
        lost: Vec<LostMessage>,
    },

    #[error("unknown connection: {0}")]
    UnknownConnection(Uuid),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("operation interrupted: {0}")]
    Interrupted(String),
}

impl Error {
    /// Whether the coordinator may run the same chunk again.
    ///
    /// Only errors raised while every drained message is known to be back in
    /// the source queue qualify.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Broker(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// Whether the error indicates the connection is gone.
    pub fn is_connection_fatal(&self) -> bool {
        matches!(self, Error::Broker(e) if e.is_connection_fatal())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
