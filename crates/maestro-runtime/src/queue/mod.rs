//! Broker-polymorphic queue adapter.
//!
//! [`QueueAdapter`] is the single seam between the plan runtime and the
//! message broker. Three variants exist: the in-process
//! [`memory::MemoryQueue`] (dev mode and tests), the AMQP
//! [`amqp::AmqpQueue`] (`amqp` feature) and the log-based
//! [`kafka::KafkaQueue`] (`kafka` feature).
//!
//! Delivery contract: the handler receives a [`Delivery`] and must resolve
//! it with exactly one of `ack`, `retry` or `dead_letter`; further calls
//! are no-ops. A handler that returns an error without resolving is
//! retried with the adapter's default delay until the attempt cap, then
//! dead-lettered.
//!
//! Idempotency keys: `enqueue` reserves the key through the configured
//! [`DedupStore`] unless `skip_dedup` is set. A reservation made by a
//! failed publish is released before the error is returned, and
//! dead-lettering a delivery releases its own key so poison messages can
//! never wedge the slot. Acknowledgement does **not** release the key —
//! the consumer that owns the step lifecycle decides when the logical
//! operation is finished.

pub mod memory;
pub mod metrics;

#[cfg(feature = "amqp")]
pub mod amqp;
#[cfg(feature = "kafka")]
pub mod kafka;

pub use memory::MemoryQueue;
pub use metrics::QueueMetrics;

use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Queue adapter errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum QueueError {
    /// The broker refused or lost the publish. Any key reserved for it has
    /// been released.
    #[error("publish failed: {0}")]
    PublishFailed(String),

    /// The idempotency key is already reserved; the message was silently
    /// dropped.
    #[error("duplicate message")]
    Duplicate,

    /// The adapter is closed or disconnected; no new enqueues are accepted.
    #[error("queue adapter closed")]
    Closed,

    /// Consumer registration failed.
    #[error("consume failed: {0}")]
    Consume(String),
}

/// Options for [`QueueAdapter::enqueue`].
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Key deduplicating deliveries of the same logical message.
    pub idempotency_key: Option<String>,
    /// Broker headers (trace id, attempts, ...).
    pub headers: HashMap<String, String>,
    /// Bypass dedup reservation — used for retries and crash-recovery
    /// republishes whose key is already held.
    pub skip_dedup: bool,
    /// Delay before the message becomes consumable.
    pub delay: Option<Duration>,
}

/// Terminal resolution applied to a delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Ack,
    Retry { delay: Option<Duration> },
    DeadLetter { reason: String },
}

/// Adapter-side completion hook for one delivery.
#[async_trait]
pub trait ResolutionSink: Send + Sync {
    async fn resolve(&self, resolution: Resolution);
}

/// One broker delivery handed to a consumer.
///
/// Exactly one terminal resolution is applied per delivery; later calls
/// are no-ops.
pub struct Delivery {
    /// Raw message payload.
    pub payload: Vec<u8>,
    /// Delivery attempts so far (0 for the first delivery).
    pub attempts: u32,
    /// Broker headers.
    pub headers: HashMap<String, String>,
    resolved: Arc<AtomicBool>,
    sink: Arc<dyn ResolutionSink>,
}

impl Delivery {
    /// Build a delivery around an adapter resolution sink.
    pub fn new(
        payload: Vec<u8>,
        attempts: u32,
        headers: HashMap<String, String>,
        sink: Arc<dyn ResolutionSink>,
    ) -> Self {
        Self {
            payload,
            attempts,
            headers,
            resolved: Arc::new(AtomicBool::new(false)),
            sink,
        }
    }

    /// Whether a terminal resolution has been applied.
    pub fn is_resolved(&self) -> bool {
        self.resolved.load(Ordering::SeqCst)
    }

    /// A cheap handle observing this delivery's resolution state after the
    /// delivery itself has been moved into a handler.
    pub fn probe(&self) -> DeliveryProbe {
        DeliveryProbe(Arc::clone(&self.resolved))
    }

    async fn resolve(&self, resolution: Resolution) {
        if self.resolved.swap(true, Ordering::SeqCst) {
            return;
        }
        self.sink.resolve(resolution).await;
    }

    /// Acknowledge successful processing.
    pub async fn ack(&self) {
        self.resolve(Resolution::Ack).await;
    }

    /// Redeliver later, optionally after `delay`.
    pub async fn retry(&self, delay: Option<Duration>) {
        self.resolve(Resolution::Retry { delay }).await;
    }

    /// Route to the dead-letter queue with a reason.
    pub async fn dead_letter(&self, reason: impl Into<String>) {
        self.resolve(Resolution::DeadLetter {
            reason: reason.into(),
        })
        .await;
    }
}

/// Observer for a moved [`Delivery`]'s resolution state.
#[derive(Clone)]
pub struct DeliveryProbe(Arc<AtomicBool>);

impl DeliveryProbe {
    /// Whether the observed delivery has been terminally resolved.
    pub fn is_resolved(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Error type a consumer handler may return. Unresolved deliveries whose
/// handler errored are retried by the adapter.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Boxed async delivery handler.
pub type DeliveryHandler = Arc<
    dyn Fn(Delivery) -> Pin<Box<dyn Future<Output = Result<(), HandlerError>> + Send>>
        + Send
        + Sync,
>;

/// Uniform interface over a message broker.
#[async_trait]
pub trait QueueAdapter: Send + Sync {
    /// Establish broker channels. Idempotent.
    async fn connect(&self) -> Result<(), QueueError>;

    /// Tear down broker channels; in-flight handlers are drained up to the
    /// adapter's grace period.
    async fn close(&self) -> Result<(), QueueError>;

    /// Publish `payload` on `queue`.
    async fn enqueue(
        &self,
        queue: &str,
        payload: &[u8],
        opts: EnqueueOptions,
    ) -> Result<(), QueueError>;

    /// Register `handler` as a consumer of `queue`. Each delivery runs as
    /// its own task.
    async fn consume(&self, queue: &str, handler: DeliveryHandler) -> Result<(), QueueError>;

    /// Current queue depth. On any adapter error this returns 0 and resets
    /// the depth/lag gauges for the queue, so autoscalers treat an
    /// unreachable broker as drained.
    async fn queue_depth(&self, queue: &str) -> u64;
}

/// Name of the dead-letter sibling of `queue`.
pub fn dead_letter_queue(queue: &str) -> String {
    format!("{queue}.dead")
}
