//! Fault-injecting transport around the in-memory broker.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use queuekeeper::error::BrokerError;
use queuekeeper::transport::{Capabilities, Connector, InMemoryTransport, PublishRequest, Transport};
use queuekeeper::types::{BrokerKind, EndpointSpec, Queue, RawMessage};

/// Publish fault for one queue.
struct PublishFault {
    remaining: usize,
    error: BrokerError,
    /// Admit the message before failing, like a receipt lost in transit
    admit: bool,
}

struct DrainGate {
    drained: oneshot::Sender<()>,
    release: oneshot::Receiver<()>,
}

pub struct FaultyTransport {
    pub inner: Arc<InMemoryTransport>,
    browse: bool,
    drain_calls: AtomicUsize,
    failing_drains: Mutex<HashSet<usize>>,
    publish_faults: Mutex<HashMap<String, PublishFault>>,
    panic_on_publish: Mutex<HashSet<String>>,
    drain_gate: Mutex<Option<DrainGate>>,
    receipts: Mutex<Vec<uuid::Uuid>>,
}

impl FaultyTransport {
    pub fn new(inner: Arc<InMemoryTransport>) -> Self {
        Self {
            inner,
            browse: true,
            drain_calls: AtomicUsize::new(0),
            failing_drains: Mutex::new(HashSet::new()),
            publish_faults: Mutex::new(HashMap::new()),
            panic_on_publish: Mutex::new(HashSet::new()),
            drain_gate: Mutex::new(None),
            receipts: Mutex::new(Vec::new()),
        }
    }

    /// Hide the broker's browse capability.
    pub fn without_browse(mut self) -> Self {
        self.browse = false;
        self
    }

    /// Fail the drain calls with these 1-based numbers.
    pub fn fail_drain_calls(&self, calls: impl IntoIterator<Item = usize>) {
        self.failing_drains.lock().extend(calls);
    }

    /// Fail the next `times` publishes to `queue` with `error`.
    pub fn fail_publishes(&self, queue: &str, times: usize, error: BrokerError) {
        self.publish_faults.lock().insert(
            queue.to_string(),
            PublishFault {
                remaining: times,
                error,
                admit: false,
            },
        );
    }

    /// Admit the next `times` publishes to `queue` but report a receipt
    /// timeout for them.
    pub fn lose_receipts(&self, queue: &str, times: usize) {
        self.publish_faults.lock().insert(
            queue.to_string(),
            PublishFault {
                remaining: times,
                error: BrokerError::ReceiptTimeout {
                    queue: queue.to_string(),
                    receipt: uuid::Uuid::nil(),
                },
                admit: true,
            },
        );
    }

    /// Panic inside any publish to `queue`, simulating a crash.
    pub fn panic_on_publish_to(&self, queue: &str) {
        self.panic_on_publish.lock().insert(queue.to_string());
    }

    /// Hold the first drain after it removed messages until `release`
    /// fires; `drained` fires when that point is reached.
    pub fn gate_first_drain(&self, drained: oneshot::Sender<()>, release: oneshot::Receiver<()>) {
        *self.drain_gate.lock() = Some(DrainGate { drained, release });
    }

    pub fn drain_call_count(&self) -> usize {
        self.drain_calls.load(Ordering::SeqCst)
    }

    /// Receipt tokens of every publish attempt, in call order.
    pub fn receipts(&self) -> Vec<uuid::Uuid> {
        self.receipts.lock().clone()
    }
}

#[async_trait]
impl Transport for FaultyTransport {
    fn kind(&self) -> BrokerKind {
        BrokerKind::Memory
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities {
            browse: self.browse,
            confirmed_publish: true,
        }
    }

    async fn drain(&self, queue: &str, max: usize) -> Result<Vec<RawMessage>, BrokerError> {
        let call = self.drain_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing_drains.lock().contains(&call) {
            return Err(BrokerError::Transport(format!("injected drain failure #{call}")));
        }

        let drained = self.inner.drain(queue, max).await?;

        let gate = self.drain_gate.lock().take();
        if let Some(gate) = gate {
            let _ = gate.drained.send(());
            let _ = gate.release.await;
        }
        Ok(drained)
    }

    async fn publish(&self, queue: &str, request: &PublishRequest) -> Result<(), BrokerError> {
        self.receipts.lock().push(request.receipt);

        if self.panic_on_publish.lock().contains(queue) {
            panic!("simulated crash while publishing to {queue}");
        }

        let fault = {
            let mut faults = self.publish_faults.lock();
            match faults.get_mut(queue) {
                Some(fault) if fault.remaining > 0 => {
                    fault.remaining -= 1;
                    Some((fault.error.clone(), fault.admit))
                }
                _ => None,
            }
        };

        match fault {
            Some((error, true)) => {
                self.inner.publish(queue, request).await?;
                Err(error)
            }
            Some((error, false)) => Err(error),
            None => self.inner.publish(queue, request).await,
        }
    }

    async fn list_queues(&self) -> Result<Vec<Queue>, BrokerError> {
        self.inner.list_queues().await
    }

    async fn browse(&self, queue: &str, max: usize) -> Result<Vec<RawMessage>, BrokerError> {
        if !self.browse {
            return Err(BrokerError::Unsupported("browse"));
        }
        self.inner.browse(queue, max).await
    }

    async fn queue_depth(&self, queue: &str) -> Result<Option<u64>, BrokerError> {
        self.inner.queue_depth(queue).await
    }
}

/// Connector handing out one prepared transport.
pub struct StaticConnector(pub Arc<dyn Transport>);

#[async_trait]
impl Connector for StaticConnector {
    async fn connect(
        &self,
        _kind: BrokerKind,
        _endpoint: &EndpointSpec,
    ) -> Result<Arc<dyn Transport>, BrokerError> {
        Ok(self.0.clone())
    }
}

pub fn ids(prefix: &str, n: usize) -> Vec<String> {
    (0..n).map(|i| format!("{prefix}-{i}")).collect()
}

pub fn sorted(mut values: Vec<String>) -> Vec<String> {
    values.sort();
    values
}
