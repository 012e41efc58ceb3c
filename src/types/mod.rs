//! Core types for the message management core.

mod config;
mod connection;
mod message;
mod queue;

pub use config::{BulkConfig, DuplicatePolicy, EngineConfig, ManagerConfig, ServiceConfig};
pub use connection::{
    BrokerKind, Connection, ConnectionInfo, Credentials, EndpointSpec, Liveness,
    RegisterConnectionRequest,
};
pub use message::{EncodedBody, Headers, Message, MessageBody, MessageView, RawMessage};
pub use queue::{BulkResult, FailedChunk, ItemFailure, PurgeResult, Queue};
