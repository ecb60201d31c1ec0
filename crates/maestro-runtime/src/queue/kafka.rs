//! Log-based queue adapter (Kafka via rdkafka).
//!
//! Consumer groups with per-partition ordering; deliveries on one
//! partition are processed in order and committed on resolution. Retry
//! republishes to the same topic with `x-attempts` incremented (after the
//! requested delay); dead letters are produced to the `<queue>.dead`
//! sibling topic with the original headers plus `dead_letter_reason`.
//!
//! Depth is Σ over partitions of `max(high_watermark − committed, 0)`. A
//! missing committed offset (−1) contributes 0, and a consumer racing
//! ahead of the fetched watermark clamps to 0 — the gauge is never
//! negative. Per-partition lag is exported with
//! `{queue, partition, transport, tenant}` labels.

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Message, Offset, TopicPartitionList};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, warn};

use super::{
    dead_letter_queue, Delivery, DeliveryHandler, EnqueueOptions, QueueAdapter, QueueError,
    QueueMetrics, Resolution, ResolutionSink,
};
use crate::messages::{HEADER_ATTEMPTS, HEADER_DEAD_LETTER_REASON, HEADER_IDEMPOTENCY_KEY};
use maestro_kernel::config::LogBasedSettings;
use maestro_kernel::dedup::DedupStore;

const METADATA_TIMEOUT: Duration = Duration::from_secs(5);
const PRODUCE_TIMEOUT: Duration = Duration::from_secs(10);

fn owned_headers(headers: &HashMap<String, String>) -> OwnedHeaders {
    let mut owned = OwnedHeaders::new();
    for (key, value) in headers {
        owned = owned.insert(Header {
            key,
            value: Some(value.as_bytes()),
        });
    }
    owned
}

fn header_map(message: &impl Message) -> HashMap<String, String> {
    let mut map = HashMap::new();
    if let Some(headers) = message.headers() {
        for header in headers.iter() {
            if let Some(value) = header.value {
                map.insert(
                    header.key.to_string(),
                    String::from_utf8_lossy(value).into_owned(),
                );
            }
        }
    }
    map
}

/// Log-based implementation of [`QueueAdapter`].
pub struct KafkaQueue {
    settings: LogBasedSettings,
    dedup: Arc<dyn DedupStore>,
    metrics: QueueMetrics,
    max_attempts: u32,
    producer: Arc<Mutex<Option<FutureProducer>>>,
}

impl KafkaQueue {
    /// Build an adapter; call [`connect`](QueueAdapter::connect) before use.
    pub fn new(
        settings: LogBasedSettings,
        dedup: Arc<dyn DedupStore>,
        metrics: QueueMetrics,
        max_attempts: u32,
    ) -> Self {
        Self {
            settings,
            dedup,
            metrics,
            max_attempts: max_attempts.max(1),
            producer: Arc::new(Mutex::new(None)),
        }
    }

    fn build_producer(&self) -> Result<FutureProducer, QueueError> {
        ClientConfig::new()
            .set("bootstrap.servers", &self.settings.brokers)
            .set("message.timeout.ms", "10000")
            .create()
            .map_err(|e| QueueError::PublishFailed(format!("kafka producer: {e}")))
    }

    fn build_consumer(&self) -> Result<StreamConsumer, QueueError> {
        ClientConfig::new()
            .set("bootstrap.servers", &self.settings.brokers)
            .set("group.id", &self.settings.group_id)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .create()
            .map_err(|e| QueueError::Consume(format!("kafka consumer: {e}")))
    }

    async fn produce(
        producer: &FutureProducer,
        topic: &str,
        key: Option<&str>,
        payload: &[u8],
        headers: &HashMap<String, String>,
    ) -> Result<(), QueueError> {
        let mut record = FutureRecord::to(topic)
            .payload(payload)
            .headers(owned_headers(headers));
        if let Some(key) = key {
            record = record.key(key);
        }
        producer
            .send(record, PRODUCE_TIMEOUT)
            .await
            .map_err(|(err, _)| QueueError::PublishFailed(format!("produce {topic}: {err}")))?;
        Ok(())
    }
}

struct KafkaSink {
    producer: FutureProducer,
    queue: String,
    payload: Vec<u8>,
    headers: HashMap<String, String>,
    attempts: u32,
    dedup: Arc<dyn DedupStore>,
    metrics: QueueMetrics,
}

#[async_trait]
impl ResolutionSink for KafkaSink {
    async fn resolve(&self, resolution: Resolution) {
        match resolution {
            Resolution::Ack => {
                self.metrics.record_ack(&self.queue);
            }
            Resolution::Retry { delay } => {
                self.metrics.record_retry(&self.queue);
                if let Some(delay) = delay.filter(|d| !d.is_zero()) {
                    tokio::time::sleep(delay).await;
                }
                let mut headers = self.headers.clone();
                headers.insert(
                    HEADER_ATTEMPTS.to_string(),
                    (self.attempts + 1).to_string(),
                );
                let key = headers.get(HEADER_IDEMPOTENCY_KEY).cloned();
                if let Err(err) = KafkaQueue::produce(
                    &self.producer,
                    &self.queue,
                    key.as_deref(),
                    &self.payload,
                    &headers,
                )
                .await
                {
                    error!(queue = %self.queue, %err, "kafka retry republish failed");
                }
            }
            Resolution::DeadLetter { reason } => {
                self.metrics.record_dead_letter(&self.queue);
                if let Some(key) = self.headers.get(HEADER_IDEMPOTENCY_KEY) {
                    self.dedup.release(key).await;
                }
                let mut headers = self.headers.clone();
                headers.insert(HEADER_DEAD_LETTER_REASON.to_string(), reason.clone());
                warn!(queue = %self.queue, %reason, "dead-lettering message");
                if let Err(err) = KafkaQueue::produce(
                    &self.producer,
                    &dead_letter_queue(&self.queue),
                    None,
                    &self.payload,
                    &headers,
                )
                .await
                {
                    error!(queue = %self.queue, %err, "kafka dead-letter produce failed");
                }
            }
        }
    }
}

#[async_trait]
impl QueueAdapter for KafkaQueue {
    async fn connect(&self) -> Result<(), QueueError> {
        let mut guard = self.producer.lock().await;
        if guard.is_none() {
            *guard = Some(self.build_producer()?);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.producer.lock().await.take();
        Ok(())
    }

    async fn enqueue(
        &self,
        queue: &str,
        payload: &[u8],
        opts: EnqueueOptions,
    ) -> Result<(), QueueError> {
        let producer = self
            .producer
            .lock()
            .await
            .clone()
            .ok_or(QueueError::Closed)?;

        let reserved = match opts.idempotency_key.as_deref() {
            Some(key) if !opts.skip_dedup => {
                if !self.dedup.try_reserve(key).await {
                    return Err(QueueError::Duplicate);
                }
                Some(key.to_string())
            }
            _ => None,
        };

        if let Some(delay) = opts.delay.filter(|d| !d.is_zero()) {
            tokio::time::sleep(delay).await;
        }

        let key = opts.idempotency_key.clone();
        match Self::produce(&producer, queue, key.as_deref(), payload, &opts.headers).await {
            Ok(()) => {
                self.metrics.record_enqueue(queue);
                Ok(())
            }
            Err(err) => {
                if let Some(key) = reserved {
                    self.dedup.release(&key).await;
                }
                Err(err)
            }
        }
    }

    async fn consume(&self, queue: &str, handler: DeliveryHandler) -> Result<(), QueueError> {
        let producer = self
            .producer
            .lock()
            .await
            .clone()
            .ok_or(QueueError::Closed)?;
        let consumer = self.build_consumer()?;
        consumer
            .subscribe(&[queue])
            .map_err(|e| QueueError::Consume(format!("subscribe {queue}: {e}")))?;

        let queue = queue.to_string();
        let dedup = Arc::clone(&self.dedup);
        let metrics = self.metrics.clone();
        let max_attempts = self.max_attempts;
        tokio::spawn(async move {
            loop {
                let message = match consumer.recv().await {
                    Ok(m) => m,
                    Err(err) => {
                        warn!(queue = %queue, %err, "kafka consumer error");
                        continue;
                    }
                };
                let payload = message.payload().unwrap_or_default().to_vec();
                let headers = header_map(&message);
                let attempts = headers
                    .get(HEADER_ATTEMPTS)
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);

                let sink = Arc::new(KafkaSink {
                    producer: producer.clone(),
                    queue: queue.clone(),
                    payload: payload.clone(),
                    headers: headers.clone(),
                    attempts,
                    dedup: Arc::clone(&dedup),
                    metrics: metrics.clone(),
                });
                let delivery = Delivery::new(payload, attempts, headers, sink.clone());
                let probe = delivery.probe();

                // Deliveries on one partition are processed in order, so the
                // handler is awaited before the offset is committed.
                let result = handler(delivery).await;
                if !probe.is_resolved() {
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
                }
                if let Err(err) = consumer.commit_message(&message, CommitMode::Async) {
                    warn!(queue = %queue, %err, "kafka commit failed");
                }
            }
        });
        Ok(())
    }

    async fn queue_depth(&self, queue: &str) -> u64 {
        let consumer = match self.build_consumer() {
            Ok(c) => c,
            Err(err) => {
                warn!(queue, %err, "kafka depth probe failed, reporting drained");
                self.metrics.reset_queue(queue);
                return 0;
            }
        };

        let metadata = match consumer.fetch_metadata(Some(queue), METADATA_TIMEOUT) {
            Ok(m) => m,
            Err(err) => {
                warn!(queue, %err, "kafka metadata fetch failed, reporting drained");
                self.metrics.reset_queue(queue);
                return 0;
            }
        };
        let Some(topic) = metadata.topics().iter().find(|t| t.name() == queue) else {
            self.metrics.reset_queue(queue);
            return 0;
        };

        let mut assignment = TopicPartitionList::new();
        for partition in topic.partitions() {
            assignment.add_partition(queue, partition.id());
        }
        let committed = match consumer.committed_offsets(assignment, METADATA_TIMEOUT) {
            Ok(list) => list,
            Err(err) => {
                warn!(queue, %err, "kafka committed-offset fetch failed, reporting drained");
                self.metrics.reset_queue(queue);
                return 0;
            }
        };

        let mut total = 0u64;
        for partition in topic.partitions() {
            let (_, high) =
                match consumer.fetch_watermarks(queue, partition.id(), METADATA_TIMEOUT) {
                    Ok(w) => w,
                    Err(err) => {
                        warn!(
                            queue,
                            partition = partition.id(),
                            %err,
                            "kafka watermark fetch failed, reporting drained"
                        );
                        self.metrics.reset_queue(queue);
                        return 0;
                    }
                };
            let committed_offset = committed
                .find_partition(queue, partition.id())
                .map(|p| p.offset())
                .unwrap_or(Offset::Invalid);
            // No committed offset means lag 0; a consumer that raced ahead
            // of the fetched watermark clamps to 0, never negative.
            let lag = match committed_offset {
                Offset::Offset(o) => (high - o).max(0) as u64,
                _ => 0,
            };
            self.metrics.set_partition_lag(queue, partition.id(), lag);
            total = total.saturating_add(lag);
        }
        self.metrics.set_depth(queue, total);
        self.metrics.set_lag(queue, total);
        total
    }
}
