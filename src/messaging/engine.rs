//! Message mutation engine.
//!
//! Brokers offer no delete-by-id or move primitive, so every targeted
//! mutation is a drain of the queue head, a classification of each drained
//! message as target or keep, and a republish of the keeps to the source
//! queue. Targets are discarded (delete) or published to the destination
//! (move) only after every keep is back.
//!
//! Each pass runs in its own spawned task: once a drain has happened the
//! pass settles even if the caller stops waiting. The engine does not
//! serialize callers; two operations draining the same queue at once will
//! misclassify each other's messages.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use futures::stream::{self, StreamExt};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::projection::normalize;
use super::retry::RetryPolicy;
use crate::error::{BrokerError, Error, LostMessage, Result};
use crate::transport::{carried_properties, PublishRequest, Transport};
use crate::types::{
    BulkResult, DuplicatePolicy, EncodedBody, EngineConfig, Headers, Message, PurgeResult,
};

/// Lifecycle of one drain/classify/republish pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Draining,
    Classifying,
    Republishing,
    Completed,
    Aborted,
}

/// A target that could not reach its destination and was put back into
/// the source queue.
#[derive(Debug, Clone)]
pub struct TargetFailure {
    pub id: String,
    pub error: BrokerError,
}

/// Result of a targeted mutation.
#[derive(Debug, Clone, Default)]
pub struct MutationOutcome {
    /// Target ids deleted or moved
    pub affected: Vec<String>,
    /// Requested ids absent from every examined message
    pub not_found: Vec<String>,
    /// Targets restored to the source after their move failed
    pub failed: Vec<TargetFailure>,
    /// Messages drained and settled
    pub examined: usize,
}

impl MutationOutcome {
    fn into_single(self, queue: &str, id: &str) -> Result<()> {
        if let Some(failure) = self.failed.into_iter().next() {
            return Err(failure.error.into());
        }
        if !self.not_found.is_empty() {
            return Err(Error::NotFound {
                queue: queue.to_string(),
                id: id.to_string(),
            });
        }
        Ok(())
    }
}

/// What happens to target messages.
#[derive(Debug, Clone)]
enum Disposition {
    Discard,
    MoveTo(String),
}

#[derive(Debug, Clone, Copy)]
struct Settings {
    confirm: bool,
    concurrency: usize,
    retry: RetryPolicy,
}

/// Tracks which requested ids are still missing across passes.
struct Classifier {
    queue: String,
    policy: DuplicatePolicy,
    pending: HashSet<String>,
    found: HashSet<String>,
}

#[derive(Debug, Default)]
struct Classified {
    targets: Vec<usize>,
    keep: Vec<usize>,
    ambiguous: Option<(String, usize)>,
}

impl Classifier {
    fn new(queue: &str, ids: &[String], policy: DuplicatePolicy) -> Self {
        Self {
            queue: queue.to_string(),
            policy,
            pending: ids.iter().cloned().collect(),
            found: HashSet::new(),
        }
    }

    fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    fn classify(&mut self, messages: &[Message]) -> Classified {
        let mut classified = Classified::default();

        if self.policy == DuplicatePolicy::Abort {
            if let Some((id, count)) = self.first_duplicate(messages) {
                warn!(queue = %self.queue, id = %id, count, "Ambiguous message id, requeueing all");
                classified.keep = (0..messages.len()).collect();
                classified.ambiguous = Some((id, count));
                return classified;
            }
        }

        for (index, message) in messages.iter().enumerate() {
            if self.pending.remove(&message.id) {
                self.found.insert(message.id.clone());
                classified.targets.push(index);
            } else if self.found.contains(&message.id) {
                warn!(queue = %self.queue, id = %message.id, policy = ?self.policy, "Duplicate message id");
                match self.policy {
                    DuplicatePolicy::AllMatches => classified.targets.push(index),
                    _ => classified.keep.push(index),
                }
            } else {
                classified.keep.push(index);
            }
        }
        classified
    }

    fn first_duplicate(&self, messages: &[Message]) -> Option<(String, usize)> {
        let mut seen: HashMap<&str, usize> = HashMap::new();
        for message in messages {
            if self.pending.contains(&message.id) {
                *seen.entry(message.id.as_str()).or_default() += 1;
            }
        }
        seen.into_iter()
            .find(|(_, count)| *count > 1)
            .map(|(id, count)| (id.to_string(), count))
    }
}

struct PassReport {
    messages: Arc<Vec<Message>>,
    affected: Vec<String>,
    failed: Vec<TargetFailure>,
    ambiguous: Option<(String, usize)>,
}

/// Delete, move, purge, import and export on top of a [`Transport`].
pub struct MutationEngine {
    transport: Arc<dyn Transport>,
    config: EngineConfig,
}

impl MutationEngine {
    pub fn new(transport: Arc<dyn Transport>, config: EngineConfig) -> Self {
        Self { transport, config }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    fn settings(&self) -> Settings {
        Settings {
            confirm: self.transport.capabilities().confirmed_publish,
            concurrency: self.config.publish_concurrency.max(1),
            retry: RetryPolicy::new(self.config.receipt_retries, self.config.receipt_retry_base_ms),
        }
    }

    /// Remove the message `id` from `queue`.
    pub async fn delete_one(&self, queue: &str, id: &str) -> Result<()> {
        let outcome = self
            .mutate(queue, &[id.to_string()], Disposition::Discard)
            .await?;
        outcome.into_single(queue, id)
    }

    /// Move the message `id` from `queue` to `target_queue`.
    pub async fn move_one(&self, queue: &str, target_queue: &str, id: &str) -> Result<()> {
        let outcome = self
            .mutate(
                queue,
                &[id.to_string()],
                Disposition::MoveTo(target_queue.to_string()),
            )
            .await?;
        outcome.into_single(queue, id)
    }

    /// Remove every message whose id is in `ids`. One chunk; callers with
    /// large id sets go through the bulk coordinator.
    pub async fn delete_many(&self, queue: &str, ids: &[String]) -> Result<MutationOutcome> {
        self.mutate(queue, ids, Disposition::Discard).await
    }

    /// Move every message whose id is in `ids` to `target_queue`.
    pub async fn move_many(
        &self,
        queue: &str,
        target_queue: &str,
        ids: &[String],
    ) -> Result<MutationOutcome> {
        self.mutate(queue, ids, Disposition::MoveTo(target_queue.to_string()))
            .await
    }

    /// Drain and discard until the queue is empty.
    pub async fn purge(&self, queue: &str) -> Result<PurgeResult> {
        let mut removed_count = 0;
        for iteration in 0..self.config.purge_max_iterations {
            let drained = self
                .transport
                .drain(queue, self.config.drain_batch_size)
                .await?;
            if drained.is_empty() {
                info!(queue = %queue, removed_count, iterations = iteration, "Queue purged");
                return Ok(PurgeResult { removed_count });
            }
            removed_count += drained.len();
            debug!(queue = %queue, removed_count, "Purge batch discarded");
        }

        warn!(
            queue = %queue,
            removed_count,
            cap = self.config.purge_max_iterations,
            "Purge stopped at iteration cap"
        );
        Ok(PurgeResult { removed_count })
    }

    /// Publish a new message.
    pub async fn send(&self, queue: &str, body: Vec<u8>, headers: Headers) -> Result<()> {
        let settings = self.settings();
        let request = PublishRequest::new(body)
            .with_headers(headers)
            .with_confirm(settings.confirm);
        publish_with_receipt(&*self.transport, queue, request, &settings.retry).await?;
        Ok(())
    }

    /// Publish each body; failures are reported per body.
    pub async fn import_messages(&self, queue: &str, bodies: Vec<Vec<u8>>) -> BulkResult {
        self.import_items(queue, bodies.into_iter().map(Ok).collect())
            .await
    }

    /// Decode and publish each body; undecodable bodies count as failures.
    pub async fn import_encoded(&self, queue: &str, bodies: &[EncodedBody]) -> BulkResult {
        self.import_items(queue, bodies.iter().map(EncodedBody::decode).collect())
            .await
    }

    async fn import_items(
        &self,
        queue: &str,
        items: Vec<std::result::Result<Vec<u8>, String>>,
    ) -> BulkResult {
        let settings = self.settings();
        let max_bytes = self.config.max_message_bytes;
        let transport = &*self.transport;

        let outcomes: Vec<(usize, std::result::Result<(), String>)> =
            stream::iter(items.into_iter().enumerate())
                .map(|(index, item)| async move {
                    let body = match item {
                        Ok(body) if body.len() > max_bytes => {
                            return (
                                index,
                                Err(format!("body of {} bytes exceeds {max_bytes}", body.len())),
                            )
                        }
                        Ok(body) => body,
                        Err(e) => return (index, Err(e)),
                    };
                    let request = PublishRequest::new(body).with_confirm(settings.confirm);
                    let result = publish_with_receipt(transport, queue, request, &settings.retry)
                        .await
                        .map_err(|e| e.to_string());
                    (index, result)
                })
                .buffered(settings.concurrency)
                .collect()
                .await;

        let mut result = BulkResult::default();
        for (index, outcome) in outcomes {
            match outcome {
                Ok(()) => result.add_success(),
                Err(e) => {
                    warn!(queue = %queue, index, error = %e, "Import of body failed");
                    result.add_failure(index, e);
                }
            }
        }
        info!(
            queue = %queue,
            succeeded = result.success_count,
            failed = result.fail_count,
            "Import finished"
        );
        result
    }

    /// Read up to `limit` messages without consuming them.
    ///
    /// Uses the broker's browse when available, otherwise drains and
    /// requeues everything read.
    pub async fn peek(&self, queue: &str, limit: usize) -> Result<Vec<Message>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        if self.transport.capabilities().browse {
            let raw = self.transport.browse(queue, limit).await?;
            return Ok(raw
                .iter()
                .enumerate()
                .map(|(position, r)| normalize(r, position as u64))
                .collect());
        }
        let limit = limit.min(self.budget(queue).await?);
        self.scan(queue, limit).await
    }

    /// Messages whose id is in `ids`; all messages when `ids` is empty.
    /// Never removes anything from the queue.
    pub async fn export_messages(&self, queue: &str, ids: &[String]) -> Result<Vec<Message>> {
        let budget = self.budget(queue).await?;
        let messages = if self.transport.capabilities().browse {
            let raw = self.transport.browse(queue, budget).await?;
            raw.iter()
                .enumerate()
                .map(|(position, r)| normalize(r, position as u64))
                .collect()
        } else {
            self.scan(queue, budget).await?
        };

        let wanted: HashSet<&str> = ids.iter().map(String::as_str).collect();
        Ok(messages
            .into_iter()
            .filter(|m| wanted.is_empty() || wanted.contains(m.id.as_str()))
            .collect())
    }

    /// How many messages an operation examines at most.
    async fn budget(&self, queue: &str) -> Result<usize> {
        let batch = self.config.drain_batch_size.max(1);
        Ok(match self.transport.queue_depth(queue).await? {
            Some(depth) => (depth as usize).max(batch),
            None => batch,
        })
    }

    /// Drain-and-requeue read of up to `limit` messages.
    async fn scan(&self, queue: &str, limit: usize) -> Result<Vec<Message>> {
        let mut collected = Vec::new();
        let mut classifier = Classifier::new(queue, &[], self.config.duplicate_policy);

        while collected.len() < limit {
            let max = self.config.drain_batch_size.max(1).min(limit - collected.len());
            let (returned, report) = self
                .run_pass(queue, max, collected.len() as u64, classifier, Disposition::Discard)
                .await?;
            classifier = returned;

            let drained = report.messages.len();
            collected.extend(report.messages.iter().cloned());
            if drained < max {
                break;
            }
        }
        Ok(collected)
    }

    async fn mutate(
        &self,
        queue: &str,
        ids: &[String],
        disposition: Disposition,
    ) -> Result<MutationOutcome> {
        let mut outcome = MutationOutcome::default();
        if ids.is_empty() {
            return Ok(outcome);
        }
        if let Disposition::MoveTo(target) = &disposition {
            if target == queue {
                return Err(Error::InvalidRequest(
                    "source and target queue are the same".to_string(),
                ));
            }
        }

        let budget = self.budget(queue).await?;
        let mut classifier = Classifier::new(queue, ids, self.config.duplicate_policy);

        while classifier.has_pending() && outcome.examined < budget {
            let max = self
                .config
                .drain_batch_size
                .max(1)
                .min(budget - outcome.examined);
            let (returned, report) = self
                .run_pass(
                    queue,
                    max,
                    outcome.examined as u64,
                    classifier,
                    disposition.clone(),
                )
                .await?;
            classifier = returned;

            let drained = report.messages.len();
            outcome.examined += drained;
            outcome.affected.extend(report.affected);
            outcome.failed.extend(report.failed);

            if let Some((id, count)) = report.ambiguous {
                return Err(Error::AmbiguousId {
                    queue: queue.to_string(),
                    id,
                    count,
                });
            }
            if drained < max {
                break;
            }
        }

        outcome.not_found = classifier.pending.into_iter().collect();
        outcome.not_found.sort();
        info!(
            queue = %queue,
            phase = ?Phase::Completed,
            affected = outcome.affected.len(),
            not_found = outcome.not_found.len(),
            failed = outcome.failed.len(),
            examined = outcome.examined,
            "Mutation finished"
        );
        Ok(outcome)
    }

    /// Drain one batch, classify it and settle it in a detached task.
    async fn run_pass(
        &self,
        queue: &str,
        max: usize,
        position: u64,
        mut classifier: Classifier,
        disposition: Disposition,
    ) -> Result<(Classifier, PassReport)> {
        let transport = self.transport.clone();
        let settings = self.settings();
        let source = queue.to_string();
        let drained_slot: Arc<Mutex<Option<Arc<Vec<Message>>>>> = Arc::new(Mutex::new(None));
        let slot = drained_slot.clone();

        let handle = tokio::spawn(async move {
            debug!(queue = %source, phase = ?Phase::Draining, max, "Draining");
            let raw = transport.drain(&source, max).await?;
            let messages: Arc<Vec<Message>> = Arc::new(
                raw.iter()
                    .enumerate()
                    .map(|(offset, r)| normalize(r, position + offset as u64))
                    .collect(),
            );
            *slot.lock() = Some(messages.clone());

            debug!(queue = %source, phase = ?Phase::Classifying, drained = messages.len(), "Classifying");
            let classified = classifier.classify(&messages);
            let (affected, failed) = settle(
                &*transport,
                &source,
                &messages,
                &classified,
                &disposition,
                &settings,
            )
            .await?;

            Ok::<_, Error>((
                classifier,
                PassReport {
                    messages,
                    affected,
                    failed,
                    ambiguous: classified.ambiguous,
                },
            ))
        });

        match handle.await {
            Ok(result) => result,
            Err(join_error) => {
                let drained = drained_slot.lock().take();
                match drained {
                    Some(messages) => {
                        self.restore_after_interrupt(queue, &messages, &join_error.to_string())
                            .await
                    }
                    None => Err(Error::Interrupted(format!(
                        "pass on {queue} stopped before drain completed: {join_error}"
                    ))),
                }
            }
        }
    }

    /// Put every message of an interrupted pass back into the source.
    /// Some may already have been republished, so this can duplicate.
    async fn restore_after_interrupt(
        &self,
        queue: &str,
        messages: &[Message],
        reason: &str,
    ) -> Result<(Classifier, PassReport)> {
        error!(
            queue = %queue,
            phase = ?Phase::Aborted,
            count = messages.len(),
            reason = %reason,
            "Settlement interrupted, restoring drained messages"
        );
        let settings = self.settings();
        let all: Vec<usize> = (0..messages.len()).collect();
        let failures = publish_all(&*self.transport, queue, messages, &all, &settings).await;
        if !failures.is_empty() {
            return Err(data_loss(queue, lost_messages(messages, failures)));
        }
        Err(Error::Interrupted(format!(
            "settlement on {queue} interrupted ({reason}); {} drained messages restored to source, duplicates possible",
            messages.len()
        )))
    }
}

/// Republish keeps, then deliver targets. Returns affected ids and the
/// targets that were restored to the source instead of moved.
async fn settle(
    transport: &dyn Transport,
    queue: &str,
    messages: &[Message],
    classified: &Classified,
    disposition: &Disposition,
    settings: &Settings,
) -> Result<(Vec<String>, Vec<TargetFailure>)> {
    debug!(
        queue = %queue,
        phase = ?Phase::Republishing,
        keep = classified.keep.len(),
        targets = classified.targets.len(),
        "Republishing"
    );

    let keep_failures = publish_all(transport, queue, messages, &classified.keep, settings).await;
    if !keep_failures.is_empty() {
        let mut lost = lost_messages(messages, keep_failures);
        if let Disposition::MoveTo(_) = disposition {
            let restore_failures =
                publish_all(transport, queue, messages, &classified.targets, settings).await;
            lost.extend(lost_messages(messages, restore_failures));
        }
        return Err(data_loss(queue, lost));
    }

    let destination = match disposition {
        Disposition::Discard => {
            return Ok((ids_of(messages, &classified.targets), Vec::new()))
        }
        Disposition::MoveTo(destination) => destination,
    };

    let move_failures =
        publish_all(transport, destination, messages, &classified.targets, settings).await;
    if move_failures.is_empty() {
        return Ok((ids_of(messages, &classified.targets), Vec::new()));
    }

    let failed_indices: Vec<usize> = move_failures.iter().map(|(i, _)| *i).collect();
    warn!(
        queue = %queue,
        destination = %destination,
        count = failed_indices.len(),
        "Move failed for some targets, restoring them to source"
    );
    let restore_failures = publish_all(transport, queue, messages, &failed_indices, settings).await;
    if !restore_failures.is_empty() {
        return Err(data_loss(queue, lost_messages(messages, restore_failures)));
    }

    let failed: Vec<TargetFailure> = move_failures
        .into_iter()
        .map(|(i, error)| TargetFailure {
            id: messages[i].id.clone(),
            error,
        })
        .collect();
    let moved: Vec<usize> = classified
        .targets
        .iter()
        .copied()
        .filter(|i| !failed_indices.contains(i))
        .collect();
    let affected = ids_of(messages, &moved);
    Ok((affected, failed))
}

/// Republish `indices` of `messages` to `queue` concurrently and wait for
/// all of them. Returns the ones that failed.
async fn publish_all(
    transport: &dyn Transport,
    queue: &str,
    messages: &[Message],
    indices: &[usize],
    settings: &Settings,
) -> Vec<(usize, BrokerError)> {
    stream::iter(indices.iter().copied())
        .map(|index| async move {
            let request = PublishRequest::republish(&messages[index]).with_confirm(settings.confirm);
            let result = publish_with_receipt(transport, queue, request, &settings.retry).await;
            (index, result)
        })
        .buffer_unordered(settings.concurrency)
        .filter_map(|(index, result)| async move { result.err().map(|e| (index, e)) })
        .collect()
        .await
}

/// Publish with bounded retries; every attempt carries a fresh receipt.
async fn publish_with_receipt(
    transport: &dyn Transport,
    queue: &str,
    request: PublishRequest,
    retry: &RetryPolicy,
) -> std::result::Result<(), BrokerError> {
    retry
        .run(
            "publish",
            |attempt| {
                let request = if attempt == 0 {
                    request.clone()
                } else {
                    request.retry()
                };
                async move { transport.publish(queue, &request).await }
            },
            BrokerError::is_retryable,
        )
        .await
}

fn ids_of(messages: &[Message], indices: &[usize]) -> Vec<String> {
    indices.iter().map(|&i| messages[i].id.clone()).collect()
}

fn lost_messages(messages: &[Message], failures: Vec<(usize, BrokerError)>) -> Vec<LostMessage> {
    failures
        .into_iter()
        .map(|(i, error)| LostMessage {
            id: messages[i].id.clone(),
            body: messages[i].body.as_bytes().to_vec(),
            headers: messages[i].headers.clone(),
            properties: carried_properties(&messages[i].raw_properties),
            error: error.to_string(),
        })
        .collect()
}

fn data_loss(queue: &str, lost: Vec<LostMessage>) -> Error {
    let ids: Vec<&str> = lost.iter().map(|m| m.id.as_str()).collect();
    error!(
        queue = %queue,
        phase = ?Phase::Aborted,
        count = lost.len(),
        ids = ?ids,
        "Drained messages could not be restored"
    );
    Error::DataLossRisk {
        queue: queue.to_string(),
        lost,
    }
}
