//! Queuekeeper Library
//!
//! Broker-agnostic message management: peek, send, delete, move, purge,
//! bulk import and export on queues whose brokers only offer a destructive
//! read and a publish. Mutations drain, classify and republish so that no
//! message is ever dropped.

pub mod api;
pub mod batch;
pub mod connections;
pub mod error;
pub mod messaging;
pub mod transport;
pub mod types;

pub use batch::BulkCoordinator;
pub use connections::{ConnectionRegistry, QueueCatalog};
pub use error::{BrokerError, Error, LostMessage, Result};
pub use messaging::{MessageManager, MutationEngine};
pub use transport::{Capabilities, InMemoryTransport, PublishRequest, Transport};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::batch::BulkCoordinator;
    pub use crate::error::*;
    pub use crate::messaging::*;
    pub use crate::transport::{Capabilities, PublishRequest, Transport};
    pub use crate::types::*;
}

/// Maximum messages pulled by one drain call
pub const DEFAULT_DRAIN_BATCH_SIZE: usize = 1000;

/// Maximum ids per bulk chunk
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Connection establishment timeout in seconds
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Publish confirmation timeout in seconds
pub const DEFAULT_RECEIPT_TIMEOUT_SECS: u64 = 5;
