//! In-process queue adapter.
//!
//! Backs `messaging.type = memory`: development mode and the test suites.
//! Per-queue FIFO, attempt tracking, delayed redelivery and a `<queue>.dead`
//! sibling match the broker variants' observable behavior, so the runtime
//! is exercised identically against all three.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{
    dead_letter_queue, Delivery, DeliveryHandler, EnqueueOptions, QueueAdapter, QueueError,
    QueueMetrics, Resolution, ResolutionSink,
};
use crate::messages::HEADER_DEAD_LETTER_REASON;
use crate::messages::HEADER_IDEMPOTENCY_KEY;
use maestro_kernel::dedup::DedupStore;

const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
struct StoredMessage {
    payload: Vec<u8>,
    attempts: u32,
    headers: HashMap<String, String>,
}

#[derive(Default)]
struct QueueState {
    /// Buffered messages awaiting a consumer.
    pending: VecDeque<StoredMessage>,
    /// Live consumer feed, if any.
    consumer: Option<mpsc::UnboundedSender<StoredMessage>>,
    /// Enqueued minus terminally resolved.
    depth: i64,
}

struct Inner {
    dedup: Arc<dyn DedupStore>,
    metrics: QueueMetrics,
    max_attempts: u32,
    default_retry_delay: Duration,
    closed: AtomicBool,
    queues: Mutex<HashMap<String, QueueState>>,
}

impl Inner {
    /// Hand a message to the queue's consumer, or buffer it.
    fn deliver(&self, queue: &str, message: StoredMessage) {
        let mut queues = self.queues.lock();
        let state = queues.entry(queue.to_string()).or_default();
        if let Some(consumer) = &state.consumer {
            if consumer.send(message.clone()).is_ok() {
                return;
            }
            state.consumer = None;
        }
        state.pending.push_back(message);
    }

    fn adjust_depth(&self, queue: &str, delta: i64) {
        let mut queues = self.queues.lock();
        let state = queues.entry(queue.to_string()).or_default();
        state.depth = (state.depth + delta).max(0);
        self.metrics.set_depth(queue, state.depth as u64);
    }
}

struct MemorySink {
    inner: Weak<Inner>,
    queue: String,
    message: StoredMessage,
}

#[async_trait]
impl ResolutionSink for MemorySink {
    async fn resolve(&self, resolution: Resolution) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        match resolution {
            Resolution::Ack => {
                inner.metrics.record_ack(&self.queue);
                inner.adjust_depth(&self.queue, -1);
            }
            Resolution::Retry { delay } => {
                inner.metrics.record_retry(&self.queue);
                let mut message = self.message.clone();
                message.attempts += 1;
                message.headers.insert(
                    crate::messages::HEADER_ATTEMPTS.to_string(),
                    message.attempts.to_string(),
                );
                let delay = delay.unwrap_or(inner.default_retry_delay);
                let queue = self.queue.clone();
                let weak = Arc::downgrade(&inner);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(inner) = weak.upgrade() {
                        inner.deliver(&queue, message);
                    }
                });
            }
            Resolution::DeadLetter { reason } => {
                inner.metrics.record_dead_letter(&self.queue);
                inner.adjust_depth(&self.queue, -1);

                // The poisoned delivery's own reservation must not outlive it.
                if let Some(key) = self.message.headers.get(HEADER_IDEMPOTENCY_KEY) {
                    inner.dedup.release(key).await;
                }

                let mut message = self.message.clone();
                message
                    .headers
                    .insert(HEADER_DEAD_LETTER_REASON.to_string(), reason.clone());
                let dead = dead_letter_queue(&self.queue);
                warn!(queue = %self.queue, %reason, "dead-lettering message");
                inner.adjust_depth(&dead, 1);
                inner.deliver(&dead, message);
            }
        }
    }
}

/// In-memory [`QueueAdapter`].
pub struct MemoryQueue {
    inner: Arc<Inner>,
}

impl MemoryQueue {
    /// Adapter with the given dedup backend and metrics.
    pub fn new(dedup: Arc<dyn DedupStore>, metrics: QueueMetrics, max_attempts: u32) -> Self {
        Self {
            inner: Arc::new(Inner {
                dedup,
                metrics,
                max_attempts: max_attempts.max(1),
                default_retry_delay: DEFAULT_RETRY_DELAY,
                closed: AtomicBool::new(false),
                queues: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Dead-lettered messages of `queue`, oldest first (operator hook and
    /// test inspection).
    pub fn dead_letters(&self, queue: &str) -> Vec<(Vec<u8>, HashMap<String, String>)> {
        let queues = self.inner.queues.lock();
        queues
            .get(&dead_letter_queue(queue))
            .map(|state| {
                state
                    .pending
                    .iter()
                    .map(|m| (m.payload.clone(), m.headers.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl QueueAdapter for MemoryQueue {
    async fn connect(&self) -> Result<(), QueueError> {
        self.inner.closed.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.inner.closed.store(true, Ordering::SeqCst);
        let mut queues = self.inner.queues.lock();
        for state in queues.values_mut() {
            state.consumer = None;
        }
        Ok(())
    }

    async fn enqueue(
        &self,
        queue: &str,
        payload: &[u8],
        opts: EnqueueOptions,
    ) -> Result<(), QueueError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }

        if let Some(key) = opts.idempotency_key.as_deref() {
            if !opts.skip_dedup && !self.inner.dedup.try_reserve(key).await {
                debug!(queue, key, "duplicate enqueue dropped");
                return Err(QueueError::Duplicate);
            }
        }

        let attempts = opts
            .headers
            .get(crate::messages::HEADER_ATTEMPTS)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let message = StoredMessage {
            payload: payload.to_vec(),
            attempts,
            headers: opts.headers,
        };

        self.inner.metrics.record_enqueue(queue);
        self.inner.adjust_depth(queue, 1);

        match opts.delay {
            Some(delay) if !delay.is_zero() => {
                let weak = Arc::downgrade(&self.inner);
                let queue = queue.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    if let Some(inner) = weak.upgrade() {
                        inner.deliver(&queue, message);
                    }
                });
            }
            _ => self.inner.deliver(queue, message),
        }
        Ok(())
    }

    async fn consume(&self, queue: &str, handler: DeliveryHandler) -> Result<(), QueueError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }

        let (tx, mut rx) = mpsc::unbounded_channel();
        {
            let mut queues = self.inner.queues.lock();
            let state = queues.entry(queue.to_string()).or_default();
            for message in state.pending.drain(..) {
                let _ = tx.send(message);
            }
            state.consumer = Some(tx);
        }

        let inner = Arc::downgrade(&self.inner);
        let queue = queue.to_string();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                let Some(strong) = inner.upgrade() else { break };
                let sink = Arc::new(MemorySink {
                    inner: Arc::downgrade(&strong),
                    queue: queue.clone(),
                    message: message.clone(),
                });
                let delivery = Delivery::new(
                    message.payload.clone(),
                    message.attempts,
                    message.headers.clone(),
                    sink.clone(),
                );
                let probe = delivery.probe();
                let handler = handler.clone();
                let max_attempts = strong.max_attempts;
                let attempts = message.attempts;
                // One task per delivery.
                tokio::spawn(async move {
                    let result = handler(delivery).await;
                    if probe.is_resolved() {
                        return;
                    }
                    match result {
                        Ok(()) => sink.resolve(Resolution::Ack).await,
                        Err(err) => {
                            if attempts + 1 >= max_attempts {
                                sink.resolve(Resolution::DeadLetter {
                                    reason: format!("handler error: {err}"),
                                })
                                .await;
                            } else {
                                sink.resolve(Resolution::Retry { delay: None }).await;
                            }
                        }
                    }
                });
            }
        });
        Ok(())
    }

    async fn queue_depth(&self, queue: &str) -> u64 {
        let queues = self.inner.queues.lock();
        let depth = queues.get(queue).map(|s| s.depth.max(0) as u64).unwrap_or(0);
        self.inner.metrics.set_depth(queue, depth);
        depth
    }
}
