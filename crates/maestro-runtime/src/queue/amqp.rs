//! AMQP queue adapter (lapin).
//!
//! Durable queues, per-channel prefetch (default 1) and manual
//! acknowledgement. Retry republishes the payload to the same queue with
//! `x-attempts` incremented; when a delay is requested the message takes a
//! TTL hop through a `<queue>.retry` holding queue whose dead-letter
//! routing points back at the work queue. Dead letters land in the sibling
//! `<queue>.dead` with their original headers plus `dead_letter_reason`.
//!
//! On broker disconnect the adapter refuses new enqueues (`Closed`) and
//! reconnects in the background with exponential backoff. Ordering is
//! per-queue FIFO modulo retry delays.

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    message::Delivery as LapinDelivery,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use super::{
    dead_letter_queue, Delivery, DeliveryHandler, EnqueueOptions, QueueAdapter, QueueError,
    QueueMetrics, Resolution, ResolutionSink,
};
use crate::backoff::BackoffPolicy;
use crate::messages::{HEADER_ATTEMPTS, HEADER_DEAD_LETTER_REASON, HEADER_IDEMPOTENCY_KEY};
use maestro_kernel::config::AmqpSettings;
use maestro_kernel::dedup::DedupStore;

fn to_field_table(headers: &HashMap<String, String>) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(
            ShortString::from(key.as_str()),
            AMQPValue::LongString(value.as_str().into()),
        );
    }
    table
}

fn from_field_table(table: Option<&FieldTable>) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    if let Some(table) = table {
        for (key, value) in table.inner() {
            if let AMQPValue::LongString(s) = value {
                headers.insert(key.to_string(), s.to_string());
            }
        }
    }
    headers
}

/// AMQP implementation of [`QueueAdapter`].
pub struct AmqpQueue {
    settings: AmqpSettings,
    dedup: Arc<dyn DedupStore>,
    metrics: QueueMetrics,
    max_attempts: u32,
    channel: Arc<Mutex<Option<Channel>>>,
    reconnect_backoff: BackoffPolicy,
}

impl AmqpQueue {
    /// Build an adapter; call [`connect`](QueueAdapter::connect) before use.
    pub fn new(
        settings: AmqpSettings,
        dedup: Arc<dyn DedupStore>,
        metrics: QueueMetrics,
        max_attempts: u32,
    ) -> Self {
        Self {
            settings,
            dedup,
            metrics,
            max_attempts: max_attempts.max(1),
            channel: Arc::new(Mutex::new(None)),
            reconnect_backoff: BackoffPolicy::new(500, 30_000, true),
        }
    }

    async fn open_channel(&self) -> Result<Channel, QueueError> {
        let connection = Connection::connect(&self.settings.url, ConnectionProperties::default())
            .await
            .map_err(|e| QueueError::PublishFailed(format!("amqp connect: {e}")))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| QueueError::PublishFailed(format!("amqp channel: {e}")))?;
        channel
            .basic_qos(self.settings.prefetch, BasicQosOptions::default())
            .await
            .map_err(|e| QueueError::PublishFailed(format!("amqp qos: {e}")))?;
        Ok(channel)
    }

    async fn current_channel(&self) -> Result<Channel, QueueError> {
        self.channel.lock().await.clone().ok_or(QueueError::Closed)
    }

    /// Drop the broken channel and reconnect in the background. Enqueues
    /// fail with `Closed` until the reconnect succeeds.
    fn begin_reconnect(&self) {
        let slot = Arc::clone(&self.channel);
        let url = self.settings.url.clone();
        let prefetch = self.settings.prefetch;
        let backoff = self.reconnect_backoff.clone();
        tokio::spawn(async move {
            {
                let mut guard = slot.lock().await;
                *guard = None;
            }
            for attempt in 0u32.. {
                tokio::time::sleep(backoff.delay_for(attempt)).await;
                match Connection::connect(&url, ConnectionProperties::default()).await {
                    Ok(connection) => match connection.create_channel().await {
                        Ok(channel) => {
                            if channel
                                .basic_qos(prefetch, BasicQosOptions::default())
                                .await
                                .is_ok()
                            {
                                info!(attempt, "amqp reconnected");
                                *slot.lock().await = Some(channel);
                                return;
                            }
                        }
                        Err(err) => warn!(attempt, %err, "amqp channel reopen failed"),
                    },
                    Err(err) => warn!(attempt, %err, "amqp reconnect failed"),
                }
            }
        });
    }

    async fn declare_durable(channel: &Channel, queue: &str) -> Result<(), QueueError> {
        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::PublishFailed(format!("queue declare {queue}: {e}")))?;
        Ok(())
    }

    /// Declare the TTL holding queue whose dead-letter routing feeds back
    /// into `queue`.
    async fn declare_retry_hop(channel: &Channel, queue: &str) -> Result<String, QueueError> {
        let retry_queue = format!("{queue}.retry");
        let mut args = FieldTable::default();
        args.insert(
            ShortString::from("x-dead-letter-exchange"),
            AMQPValue::LongString("".into()),
        );
        args.insert(
            ShortString::from("x-dead-letter-routing-key"),
            AMQPValue::LongString(queue.into()),
        );
        channel
            .queue_declare(
                &retry_queue,
                QueueDeclareOptions {
                    durable: true,
                    ..Default::default()
                },
                args,
            )
            .await
            .map_err(|e| QueueError::PublishFailed(format!("retry declare {retry_queue}: {e}")))?;
        Ok(retry_queue)
    }

    async fn publish(
        channel: &Channel,
        queue: &str,
        payload: &[u8],
        headers: &HashMap<String, String>,
        delay: Option<Duration>,
    ) -> Result<(), QueueError> {
        Self::declare_durable(channel, queue).await?;

        let mut properties = BasicProperties::default()
            .with_headers(to_field_table(headers))
            .with_delivery_mode(2); // persistent

        let routing_key = match delay {
            Some(delay) if !delay.is_zero() => {
                let retry_queue = Self::declare_retry_hop(channel, queue).await?;
                properties =
                    properties.with_expiration(delay.as_millis().to_string().as_str().into());
                retry_queue
            }
            _ => queue.to_string(),
        };

        channel
            .basic_publish(
                "",
                &routing_key,
                BasicPublishOptions::default(),
                payload,
                properties,
            )
            .await
            .map_err(|e| QueueError::PublishFailed(format!("publish {queue}: {e}")))?
            .await
            .map_err(|e| QueueError::PublishFailed(format!("publish confirm {queue}: {e}")))?;
        Ok(())
    }
}

struct AmqpSink {
    channel: Channel,
    queue: String,
    payload: Vec<u8>,
    headers: HashMap<String, String>,
    attempts: u32,
    acker: lapin::acker::Acker,
    dedup: Arc<dyn DedupStore>,
    metrics: QueueMetrics,
}

#[async_trait]
impl ResolutionSink for AmqpSink {
    async fn resolve(&self, resolution: Resolution) {
        match resolution {
            Resolution::Ack => {
                self.metrics.record_ack(&self.queue);
                if let Err(err) = self.acker.ack(BasicAckOptions::default()).await {
                    error!(queue = %self.queue, %err, "amqp ack failed");
                }
            }
            Resolution::Retry { delay } => {
                self.metrics.record_retry(&self.queue);
                let mut headers = self.headers.clone();
                headers.insert(
                    HEADER_ATTEMPTS.to_string(),
                    (self.attempts + 1).to_string(),
                );
                if let Err(err) = AmqpQueue::publish(
                    &self.channel,
                    &self.queue,
                    &self.payload,
                    &headers,
                    delay,
                )
                .await
                {
                    error!(queue = %self.queue, %err, "amqp retry republish failed");
                }
                if let Err(err) = self.acker.ack(BasicAckOptions::default()).await {
                    error!(queue = %self.queue, %err, "amqp ack after retry failed");
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
                if let Err(err) = AmqpQueue::publish(
                    &self.channel,
                    &dead_letter_queue(&self.queue),
                    &self.payload,
                    &headers,
                    None,
                )
                .await
                {
                    error!(queue = %self.queue, %err, "amqp dead-letter publish failed");
                }
                if let Err(err) = self.acker.ack(BasicAckOptions::default()).await {
                    error!(queue = %self.queue, %err, "amqp ack after dead-letter failed");
                }
            }
        }
    }
}

#[async_trait]
impl QueueAdapter for AmqpQueue {
    async fn connect(&self) -> Result<(), QueueError> {
        let mut guard = self.channel.lock().await;
        if guard.is_none() {
            *guard = Some(self.open_channel().await?);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), QueueError> {
        let mut guard = self.channel.lock().await;
        if let Some(channel) = guard.take() {
            let _ = channel.close(200, "shutdown").await;
        }
        Ok(())
    }

    async fn enqueue(
        &self,
        queue: &str,
        payload: &[u8],
        opts: EnqueueOptions,
    ) -> Result<(), QueueError> {
        let channel = self.current_channel().await?;

        let reserved = match opts.idempotency_key.as_deref() {
            Some(key) if !opts.skip_dedup => {
                if !self.dedup.try_reserve(key).await {
                    return Err(QueueError::Duplicate);
                }
                Some(key.to_string())
            }
            _ => None,
        };

        match Self::publish(&channel, queue, payload, &opts.headers, opts.delay).await {
            Ok(()) => {
                self.metrics.record_enqueue(queue);
                Ok(())
            }
            Err(err) => {
                // A key reserved for a message the broker never accepted
                // must not stay reserved.
                if let Some(key) = reserved {
                    self.dedup.release(&key).await;
                }
                self.begin_reconnect();
                Err(err)
            }
        }
    }

    async fn consume(&self, queue: &str, handler: DeliveryHandler) -> Result<(), QueueError> {
        let channel = self.current_channel().await?;
        Self::declare_durable(&channel, queue).await?;

        let consumer = channel
            .basic_consume(
                queue,
                &format!("maestro-{queue}"),
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::Consume(format!("consume {queue}: {e}")))?;

        let queue = queue.to_string();
        let dedup = Arc::clone(&self.dedup);
        let metrics = self.metrics.clone();
        let max_attempts = self.max_attempts;
        tokio::spawn(async move {
            let mut consumer = consumer;
            while let Some(delivery) = consumer.next().await {
                let delivery: LapinDelivery = match delivery {
                    Ok(d) => d,
                    Err(err) => {
                        warn!(queue = %queue, %err, "amqp consumer stream error");
                        break;
                    }
                };
                let headers = from_field_table(delivery.properties.headers().as_ref());
                let attempts = headers
                    .get(HEADER_ATTEMPTS)
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0);

                let sink = Arc::new(AmqpSink {
                    channel: channel.clone(),
                    queue: queue.clone(),
                    payload: delivery.data.clone(),
                    headers: headers.clone(),
                    attempts,
                    acker: delivery.acker,
                    dedup: Arc::clone(&dedup),
                    metrics: metrics.clone(),
                });
                let wrapped = Delivery::new(delivery.data, attempts, headers, sink.clone());
                let probe = wrapped.probe();
                let handler = handler.clone();
                // One task per delivery.
                tokio::spawn(async move {
                    let result = handler(wrapped).await;
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
        let Ok(channel) = self.current_channel().await else {
            self.metrics.reset_queue(queue);
            return 0;
        };
        match channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
        {
            Ok(state) => {
                let depth = u64::from(state.message_count());
                self.metrics.set_depth(queue, depth);
                depth
            }
            Err(err) => {
                warn!(queue, %err, "amqp depth probe failed, reporting drained");
                self.metrics.reset_queue(queue);
                0
            }
        }
    }
}
