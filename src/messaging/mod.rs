//! # Message Operations
//!
//! Drain/classify/republish mutations and the per-connection API on top
//! of them.
//!
//! ## Modules
//! - `projection`: raw broker message to [`Message`](crate::types::Message)
//! - `retry`: bounded exponential backoff
//! - `engine`: delete, move, purge, import and export
//! - `manager`: connection-addressed facade with per-queue serialization

pub mod engine;
pub mod manager;
pub mod projection;
pub mod retry;

pub use engine::{MutationEngine, MutationOutcome, Phase, TargetFailure};
pub use manager::MessageManager;
pub use projection::normalize;
pub use retry::RetryPolicy;
