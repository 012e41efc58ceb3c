//! Bulk operation coordinator.
//!
//! Large id sets are split into bounded chunks that run one after another
//! against the same queue. Each chunk is an independent engine call with
//! its own retries, so a failing chunk leaves the others untouched.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::messaging::engine::{MutationEngine, MutationOutcome};
use crate::messaging::retry::RetryPolicy;
use crate::types::{BulkConfig, BulkResult, FailedChunk};

/// Bulk operation applied to every chunk.
#[derive(Debug, Clone)]
enum BulkOp {
    Delete,
    Move(String),
}

/// Runs bulk delete and bulk move in sequential, retried chunks.
pub struct BulkCoordinator {
    engine: Arc<MutationEngine>,
    config: BulkConfig,
}

impl BulkCoordinator {
    /// Create a new coordinator.
    pub fn new(engine: Arc<MutationEngine>, config: BulkConfig) -> Self {
        Self { engine, config }
    }

    pub fn config(&self) -> &BulkConfig {
        &self.config
    }

    /// Split `ids` into ordered chunks of at most `size`, dropping repeats.
    pub fn chunk_ids(ids: &[String], size: usize) -> Vec<Vec<String>> {
        let mut seen = HashSet::new();
        let unique: Vec<String> = ids
            .iter()
            .filter(|id| seen.insert(id.as_str()))
            .cloned()
            .collect();
        unique
            .chunks(size.max(1))
            .map(|chunk| chunk.to_vec())
            .collect()
    }

    /// Delete every message in `ids` from `queue`.
    pub async fn bulk_delete(&self, queue: &str, ids: &[String]) -> Result<BulkResult> {
        self.run(queue, ids, BulkOp::Delete).await
    }

    /// Move every message in `ids` from `queue` to `target_queue`.
    pub async fn bulk_move(
        &self,
        queue: &str,
        target_queue: &str,
        ids: &[String],
    ) -> Result<BulkResult> {
        self.run(queue, ids, BulkOp::Move(target_queue.to_string()))
            .await
    }

    async fn run(&self, queue: &str, ids: &[String], op: BulkOp) -> Result<BulkResult> {
        let chunks = Self::chunk_ids(ids, self.config.chunk_size);
        let total_chunks = chunks.len();
        let mut result = BulkResult::default();

        info!(queue = %queue, op = ?op, ids = ids.len(), chunks = total_chunks, "Starting bulk operation");

        let mut chunks = chunks.into_iter().enumerate();
        while let Some((index, chunk)) = chunks.next() {
            match self.run_chunk(queue, index, chunk, &op, &mut result).await {
                ChunkStatus::Succeeded => {
                    if index + 1 < total_chunks && self.config.chunk_pause_ms > 0 {
                        tokio::time::sleep(Duration::from_millis(self.config.chunk_pause_ms)).await;
                    }
                }
                ChunkStatus::Failed => {}
                ChunkStatus::Fatal(e) => {
                    if let Error::DataLossRisk { .. } = e {
                        return Err(e);
                    }
                    let reason = e.to_string();
                    for (index, chunk) in chunks.by_ref() {
                        result.add_failed_chunk(FailedChunk {
                            index,
                            ids: chunk,
                            error: reason.clone(),
                        });
                    }
                    warn!(queue = %queue, error = %reason, "Connection lost, remaining chunks skipped");
                }
            }
        }

        info!(
            queue = %queue,
            succeeded = result.success_count,
            failed = result.fail_count,
            not_found = result.not_found_count,
            failed_chunks = result.failed_chunks.len(),
            "Bulk operation complete"
        );
        Ok(result)
    }

    async fn run_chunk(
        &self,
        queue: &str,
        index: usize,
        chunk: Vec<String>,
        op: &BulkOp,
        result: &mut BulkResult,
    ) -> ChunkStatus {
        let policy = RetryPolicy::new(self.config.max_retries, self.config.retry_base_delay_ms);
        let mut pending = chunk;
        let mut last_error = String::new();

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = policy.delay(attempt - 1);
                warn!(
                    queue = %queue,
                    chunk = index,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %last_error,
                    "Retrying chunk"
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }

            match self.apply(queue, &pending, op).await {
                Ok(outcome) => {
                    result.success_count += outcome.affected.len();
                    result.not_found_count += outcome.not_found.len();
                    debug!(
                        queue = %queue,
                        chunk = index,
                        affected = outcome.affected.len(),
                        not_found = outcome.not_found.len(),
                        failed = outcome.failed.len(),
                        "Chunk settled"
                    );

                    if outcome.failed.is_empty() {
                        return ChunkStatus::Succeeded;
                    }
                    let retryable = outcome.failed.iter().all(|f| f.error.is_retryable());
                    last_error = outcome.failed[0].error.to_string();
                    pending = outcome.failed.into_iter().map(|f| f.id).collect();
                    if !retryable {
                        break;
                    }
                }
                Err(e @ Error::DataLossRisk { .. }) => return ChunkStatus::Fatal(e),
                Err(e) if e.is_connection_fatal() => {
                    result.add_failed_chunk(FailedChunk {
                        index,
                        ids: pending,
                        error: e.to_string(),
                    });
                    return ChunkStatus::Fatal(e);
                }
                Err(e) if e.is_retryable() => last_error = e.to_string(),
                Err(e) => {
                    last_error = e.to_string();
                    break;
                }
            }
        }

        warn!(queue = %queue, chunk = index, ids = pending.len(), error = %last_error, "Chunk failed");
        result.add_failed_chunk(FailedChunk {
            index,
            ids: pending,
            error: last_error,
        });
        ChunkStatus::Failed
    }

    async fn apply(&self, queue: &str, ids: &[String], op: &BulkOp) -> Result<MutationOutcome> {
        match op {
            BulkOp::Delete => self.engine.delete_many(queue, ids).await,
            BulkOp::Move(target) => self.engine.move_many(queue, target, ids).await,
        }
    }
}

enum ChunkStatus {
    Succeeded,
    Failed,
    Fatal(Error),
}
