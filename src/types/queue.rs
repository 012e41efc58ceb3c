//! Queue and operation result types.

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Read-only projection of a broker queue. Never cached beyond one read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Queue {
    pub id: String,
    pub name: String,
    pub approximate_depth: u64,
}

impl Queue {
    pub fn new(name: &str, approximate_depth: u64) -> Self {
        Self {
            id: name.to_string(),
            name: name.to_string(),
            approximate_depth,
        }
    }
}

/// A chunk that exhausted its retries. Its messages are still in the
/// source queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedChunk {
    pub index: usize,
    pub ids: Vec<String>,
    pub error: String,
}

/// A single item of a bulk request that failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemFailure {
    pub index: usize,
    pub error: String,
}

/// Aggregate outcome of a bulk operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkResult {
    pub success_count: usize,
    pub fail_count: usize,
    /// Requested ids that were not present in the queue
    pub not_found_count: usize,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub failed_chunks: Vec<FailedChunk>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub failures: Vec<ItemFailure>,
}

impl BulkResult {
    /// Record one successful item.
    pub fn add_success(&mut self) {
        self.success_count += 1;
    }

    /// Record one failed item.
    pub fn add_failure(&mut self, index: usize, error: String) {
        self.fail_count += 1;
        self.failures.push(ItemFailure { index, error });
    }

    /// Record a chunk that failed as a whole.
    pub fn add_failed_chunk(&mut self, chunk: FailedChunk) {
        self.fail_count += chunk.ids.len();
        self.failed_chunks.push(chunk);
    }

    /// Whether every requested item succeeded.
    pub fn is_complete_success(&self) -> bool {
        self.fail_count == 0 && self.not_found_count == 0
    }

    /// Turn a result with failures into `Error::PartialFailure`.
    pub fn ensure_complete(self) -> Result<Self, Error> {
        if self.fail_count == 0 {
            Ok(self)
        } else {
            Err(Error::PartialFailure {
                succeeded: self.success_count,
                failed: self.fail_count,
                chunks: self.failed_chunks,
            })
        }
    }
}

/// Outcome of a purge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeResult {
    pub removed_count: usize,
}
