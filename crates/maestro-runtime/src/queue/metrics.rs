//! Prometheus metrics shared by all queue adapter variants.
//!
//! Counters: `enqueue`, `ack`, `retry`, `dead_letter`. Gauges: `depth` and
//! `lag`, labelled `{queue, transport, tenant}`; for the AMQP variant
//! `lag == depth`, so a single autoscaler can target either. Per-partition
//! lag is a separate gauge with an added `partition` label.

use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry};

/// Metric handles for one adapter instance.
#[derive(Clone)]
pub struct QueueMetrics {
    transport: String,
    tenant: String,
    enqueue: IntCounterVec,
    ack: IntCounterVec,
    retry: IntCounterVec,
    dead_letter: IntCounterVec,
    depth: IntGaugeVec,
    lag: IntGaugeVec,
    partition_lag: IntGaugeVec,
}

impl QueueMetrics {
    /// Register the metric families in `registry`.
    ///
    /// Registration conflicts are returned as-is; callers register one
    /// metrics set per registry.
    pub fn register(
        registry: &Registry,
        transport: impl Into<String>,
        tenant: impl Into<String>,
    ) -> prometheus::Result<Self> {
        let labels = &["queue", "transport", "tenant"];
        let enqueue = IntCounterVec::new(
            Opts::new("maestro_queue_enqueue_total", "Messages published"),
            labels,
        )?;
        let ack = IntCounterVec::new(
            Opts::new("maestro_queue_ack_total", "Deliveries acknowledged"),
            labels,
        )?;
        let retry = IntCounterVec::new(
            Opts::new("maestro_queue_retry_total", "Deliveries republished for retry"),
            labels,
        )?;
        let dead_letter = IntCounterVec::new(
            Opts::new("maestro_queue_dead_letter_total", "Deliveries dead-lettered"),
            labels,
        )?;
        let depth = IntGaugeVec::new(
            Opts::new("maestro_queue_depth", "Messages waiting in the queue"),
            labels,
        )?;
        let lag = IntGaugeVec::new(
            Opts::new("maestro_queue_lag", "Consumer lag behind the queue head"),
            labels,
        )?;
        let partition_lag = IntGaugeVec::new(
            Opts::new(
                "maestro_queue_partition_lag",
                "Per-partition consumer lag (log-based transports)",
            ),
            &["queue", "partition", "transport", "tenant"],
        )?;

        registry.register(Box::new(enqueue.clone()))?;
        registry.register(Box::new(ack.clone()))?;
        registry.register(Box::new(retry.clone()))?;
        registry.register(Box::new(dead_letter.clone()))?;
        registry.register(Box::new(depth.clone()))?;
        registry.register(Box::new(lag.clone()))?;
        registry.register(Box::new(partition_lag.clone()))?;

        Ok(Self {
            transport: transport.into(),
            tenant: tenant.into(),
            enqueue,
            ack,
            retry,
            dead_letter,
            depth,
            lag,
            partition_lag,
        })
    }

    /// Unregistered metrics for tests and default construction.
    pub fn unregistered(transport: impl Into<String>, tenant: impl Into<String>) -> Self {
        Self::register(&Registry::new(), transport, tenant)
            .expect("fresh registry cannot conflict")
    }

    fn label_values<'a>(&'a self, queue: &'a str) -> [&'a str; 3] {
        [queue, &self.transport, &self.tenant]
    }

    pub fn record_enqueue(&self, queue: &str) {
        self.enqueue.with_label_values(&self.label_values(queue)).inc();
    }

    pub fn record_ack(&self, queue: &str) {
        self.ack.with_label_values(&self.label_values(queue)).inc();
    }

    pub fn record_retry(&self, queue: &str) {
        self.retry.with_label_values(&self.label_values(queue)).inc();
    }

    pub fn record_dead_letter(&self, queue: &str) {
        self.dead_letter
            .with_label_values(&self.label_values(queue))
            .inc();
    }

    /// Set depth and lag together (AMQP and memory variants, where they
    /// coincide).
    pub fn set_depth(&self, queue: &str, depth: u64) {
        let clamped = depth.min(i64::MAX as u64) as i64;
        self.depth
            .with_label_values(&self.label_values(queue))
            .set(clamped);
        self.lag
            .with_label_values(&self.label_values(queue))
            .set(clamped);
    }

    /// Set lag independently of depth (log-based variant).
    pub fn set_lag(&self, queue: &str, lag: u64) {
        self.lag
            .with_label_values(&self.label_values(queue))
            .set(lag.min(i64::MAX as u64) as i64);
    }

    /// Set one partition's lag.
    pub fn set_partition_lag(&self, queue: &str, partition: i32, lag: u64) {
        let partition = partition.to_string();
        self.partition_lag
            .with_label_values(&[queue, &partition, &self.transport, &self.tenant])
            .set(lag.min(i64::MAX as u64) as i64);
    }

    /// Zero the depth and lag gauges for `queue` — called when the broker
    /// is unreachable so autoscalers see a drained queue.
    pub fn reset_queue(&self, queue: &str) {
        self.set_depth(queue, 0);
        self.set_lag(queue, 0);
    }

    /// Current depth gauge value (test hook).
    pub fn depth_value(&self, queue: &str) -> i64 {
        self.depth.with_label_values(&self.label_values(queue)).get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_and_gauges_track_per_queue() {
        let metrics = QueueMetrics::unregistered("memory", "default");
        metrics.record_enqueue("plan.steps");
        metrics.record_enqueue("plan.steps");
        metrics.record_ack("plan.steps");
        metrics.set_depth("plan.steps", 5);
        metrics.set_depth("plan.completions", 1);

        assert_eq!(metrics.depth_value("plan.steps"), 5);
        assert_eq!(metrics.depth_value("plan.completions"), 1);

        metrics.reset_queue("plan.steps");
        assert_eq!(metrics.depth_value("plan.steps"), 0);
    }

    #[test]
    fn registration_in_shared_registry_exports_families() {
        let registry = Registry::new();
        let metrics = QueueMetrics::register(&registry, "memory", "default").unwrap();
        metrics.record_enqueue("plan.steps");
        let families = registry.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "maestro_queue_enqueue_total"));
    }
}
