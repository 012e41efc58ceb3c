//! Connection registry and queue catalog.

mod catalog;
mod registry;

pub use catalog::QueueCatalog;
pub use registry::ConnectionRegistry;
