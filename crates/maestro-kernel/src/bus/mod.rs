//! In-process fan-out of plan-step events.
//!
//! The [`PlanEventBus`] delivers every published event to two places: a
//! bounded per-plan replay history (what a late subscriber or the JSON
//! history endpoint sees) and the bounded buffer of every live subscriber of
//! that plan. Publication happens inside a single critical section, so
//! events are totally ordered per plan and every subscriber observes the
//! same order.
//!
//! A subscriber that cannot drain its buffer fast enough is dropped with
//! cause [`CloseCause::SlowConsumer`] rather than allowed to block
//! publication — the SSE streamer maps that drop to a connection close.

pub mod metrics;

pub use metrics::{BusMetrics, MetricsSnapshot};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::debug;

use crate::plan::{PlanStep, PlanStepState};

/// Default bound of the per-plan replay history ring.
pub const DEFAULT_HISTORY_LIMIT: usize = 256;

/// Default per-subscriber buffer size.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 64;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// Step payload carried inside a [`PlanStepEvent`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepEventBody {
    pub id: String,
    pub action: String,
    pub tool: String,
    pub state: PlanStepState,
    pub capability: String,
    #[serde(default)]
    pub capability_label: String,
    #[serde(default)]
    pub labels: Vec<String>,
    pub timeout_seconds: u64,
    pub approval_required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

/// A plan-step lifecycle event as seen by subscribers and the SSE stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStepEvent {
    /// Event kind discriminator; always `plan.step`.
    pub event: String,
    pub trace_id: String,
    pub plan_id: String,
    pub step: StepEventBody,
}

impl PlanStepEvent {
    /// Event kind for plan-step events.
    pub const KIND: &'static str = "plan.step";

    /// Build an event from a step and its new state. Labels are cloned so
    /// the event never aliases the caller's step.
    pub fn for_step(
        plan_id: impl Into<String>,
        trace_id: impl Into<String>,
        step: &PlanStep,
        state: PlanStepState,
        summary: Option<String>,
        output: Option<Value>,
    ) -> Self {
        Self {
            event: Self::KIND.to_string(),
            trace_id: trace_id.into(),
            plan_id: plan_id.into(),
            step: StepEventBody {
                id: step.id.clone(),
                action: step.action.clone(),
                tool: step.tool.clone(),
                state,
                capability: step.capability.clone(),
                capability_label: step.capability_label.clone(),
                labels: step.labels.clone(),
                timeout_seconds: step.timeout_seconds,
                approval_required: step.approval_required,
                summary,
                output,
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

/// Why a subscription stopped receiving events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseCause {
    /// The subscriber's buffer overflowed; it was disconnected so it could
    /// not block publication.
    SlowConsumer,
    /// The subscription handle was dropped or explicitly unsubscribed.
    Unsubscribed,
}

struct SubscriberSlot {
    id: u64,
    tx: mpsc::Sender<PlanStepEvent>,
    cause: Arc<OnceLock<CloseCause>>,
}

/// A live subscription to one plan's events.
///
/// Implements [`tokio_stream::Stream`]; dropping the handle unsubscribes.
pub struct Subscription {
    id: u64,
    plan_id: String,
    rx: mpsc::Receiver<PlanStepEvent>,
    cause: Arc<OnceLock<CloseCause>>,
    bus: PlanEventBus,
}

impl Subscription {
    /// Receive the next event in publication order. Returns `None` once the
    /// subscription is closed (unsubscribed or dropped as a slow consumer).
    pub async fn recv(&mut self) -> Option<PlanStepEvent> {
        self.rx.recv().await
    }

    /// The cause of closure, once closed.
    pub fn close_cause(&self) -> Option<CloseCause> {
        self.cause.get().copied()
    }

    /// The plan this subscription follows.
    pub fn plan_id(&self) -> &str {
        &self.plan_id
    }
}

impl tokio_stream::Stream for Subscription {
    type Item = PlanStepEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.cause.set(CloseCause::Unsubscribed);
        self.bus.remove_subscriber(&self.plan_id, self.id);
    }
}

// ---------------------------------------------------------------------------
// The bus
// ---------------------------------------------------------------------------

/// Bus construction parameters.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Per-plan replay history bound. Oldest events are evicted first.
    pub history_limit: usize,
    /// Per-subscriber buffer size before the slow-consumer drop kicks in.
    pub subscriber_buffer: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            history_limit: DEFAULT_HISTORY_LIMIT,
            subscriber_buffer: DEFAULT_SUBSCRIBER_BUFFER,
        }
    }
}

#[derive(Default)]
struct BusState {
    history: HashMap<String, VecDeque<PlanStepEvent>>,
    subscribers: HashMap<String, Vec<SubscriberSlot>>,
}

/// In-process publish/subscribe hub for plan-step events.
///
/// Cheap to clone; clones share state. Publish and subscribe are safe to
/// call from any task concurrently — the publish critical section is a sync
/// mutex and `try_send` never blocks.
#[derive(Clone)]
pub struct PlanEventBus {
    state: Arc<Mutex<BusState>>,
    config: Arc<BusConfig>,
    bus_metrics: Arc<BusMetrics>,
    next_id: Arc<AtomicU64>,
}

impl PlanEventBus {
    /// Create a bus with default configuration.
    pub fn new() -> Self {
        Self::with_config(BusConfig::default())
    }

    /// Create a bus with the given configuration.
    pub fn with_config(config: BusConfig) -> Self {
        Self {
            state: Arc::new(Mutex::new(BusState::default())),
            config: Arc::new(config),
            bus_metrics: Arc::new(BusMetrics::new()),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Returns a reference to the live bus metrics.
    pub fn metrics(&self) -> &BusMetrics {
        &self.bus_metrics
    }

    /// Publish an event: append it to the plan's history ring and fan it out
    /// to every live subscriber of that plan.
    ///
    /// Slow subscribers (full buffer) are disconnected here rather than
    /// awaited; publication never blocks on a consumer.
    pub fn publish(&self, event: PlanStepEvent) {
        let mut state = self.state.lock();
        self.bus_metrics.record_publish();

        let ring = state.history.entry(event.plan_id.clone()).or_default();
        ring.push_back(event.clone());
        while ring.len() > self.config.history_limit {
            ring.pop_front();
            self.bus_metrics.record_history_eviction();
        }

        let Some(slots) = state.subscribers.get_mut(&event.plan_id) else {
            return;
        };
        slots.retain(|slot| match slot.tx.try_send(event.clone()) {
            Ok(()) => {
                self.bus_metrics.record_delivery();
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                let _ = slot.cause.set(CloseCause::SlowConsumer);
                self.bus_metrics.record_drop();
                self.bus_metrics.record_subscriber_drop();
                debug!(
                    plan_id = %event.plan_id,
                    subscriber = slot.id,
                    "dropping slow event subscriber"
                );
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        if slots.is_empty() {
            state.subscribers.remove(&event.plan_id);
        }
    }

    /// Subscribe to one plan's events in publication order.
    pub fn subscribe(&self, plan_id: impl Into<String>) -> Subscription {
        let plan_id = plan_id.into();
        let (tx, rx) = mpsc::channel(self.config.subscriber_buffer);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cause = Arc::new(OnceLock::new());

        let mut state = self.state.lock();
        state
            .subscribers
            .entry(plan_id.clone())
            .or_default()
            .push(SubscriberSlot {
                id,
                tx,
                cause: Arc::clone(&cause),
            });

        Subscription {
            id,
            plan_id,
            rx,
            cause,
            bus: self.clone(),
        }
    }

    /// Subscribe and snapshot the history in one critical section.
    ///
    /// The SSE streamer replays the snapshot then forwards the live
    /// subscription; doing both under the publish lock means no event is
    /// lost or duplicated across the handoff.
    pub fn subscribe_with_history(
        &self,
        plan_id: impl Into<String>,
    ) -> (Vec<PlanStepEvent>, Subscription) {
        let plan_id = plan_id.into();
        let (tx, rx) = mpsc::channel(self.config.subscriber_buffer);
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cause = Arc::new(OnceLock::new());

        let mut state = self.state.lock();
        let history = state
            .history
            .get(&plan_id)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default();
        state
            .subscribers
            .entry(plan_id.clone())
            .or_default()
            .push(SubscriberSlot {
                id,
                tx,
                cause: Arc::clone(&cause),
            });
        drop(state);

        (
            history,
            Subscription {
                id,
                plan_id,
                rx,
                cause,
                bus: self.clone(),
            },
        )
    }

    /// Ordered snapshot of the plan's surviving history.
    pub fn history(&self, plan_id: &str) -> Vec<PlanStepEvent> {
        let state = self.state.lock();
        state
            .history
            .get(plan_id)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Most recent event for one step, if any survives in the history ring.
    ///
    /// Used by the approval gate to check step state without persistence I/O.
    pub fn latest_step_event(&self, plan_id: &str, step_id: &str) -> Option<PlanStepEvent> {
        let state = self.state.lock();
        state
            .history
            .get(plan_id)?
            .iter()
            .rev()
            .find(|e| e.step.id == step_id)
            .cloned()
    }

    /// Drop the plan's replay history (retention and tests).
    pub fn clear_plan_history(&self, plan_id: &str) {
        self.state.lock().history.remove(plan_id);
    }

    /// Number of live subscribers across all plans.
    pub fn subscriber_count(&self) -> usize {
        self.state.lock().subscribers.values().map(Vec::len).sum()
    }

    fn remove_subscriber(&self, plan_id: &str, id: u64) {
        let mut state = self.state.lock();
        if let Some(slots) = state.subscribers.get_mut(plan_id) {
            slots.retain(|slot| slot.id != id);
            if slots.is_empty() {
                state.subscribers.remove(plan_id);
            }
        }
    }
}

impl Default for PlanEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::PlanStep;
    use tokio::time::{timeout, Duration};

    fn event(plan: &str, step: &str, state: PlanStepState) -> PlanStepEvent {
        let s = PlanStep::new(step, "do the thing", "shell");
        PlanStepEvent::for_step(plan, "trace-1", &s, state, None, None)
    }

    #[tokio::test]
    async fn subscriber_sees_events_in_publication_order() {
        let bus = PlanEventBus::new();
        let mut sub = bus.subscribe("plan-a");

        bus.publish(event("plan-a", "s1", PlanStepState::Queued));
        bus.publish(event("plan-a", "s1", PlanStepState::Running));
        bus.publish(event("plan-a", "s1", PlanStepState::Completed));

        assert_eq!(sub.recv().await.unwrap().step.state, PlanStepState::Queued);
        assert_eq!(sub.recv().await.unwrap().step.state, PlanStepState::Running);
        assert_eq!(
            sub.recv().await.unwrap().step.state,
            PlanStepState::Completed
        );
    }

    #[tokio::test]
    async fn events_are_isolated_per_plan() {
        let bus = PlanEventBus::new();
        let mut sub = bus.subscribe("plan-a");

        bus.publish(event("plan-b", "s1", PlanStepState::Queued));
        bus.publish(event("plan-a", "s1", PlanStepState::Running));

        let got = sub.recv().await.unwrap();
        assert_eq!(got.plan_id, "plan-a");
        assert_eq!(got.step.state, PlanStepState::Running);
    }

    #[tokio::test]
    async fn history_ring_is_bounded_and_keeps_newest() {
        let bus = PlanEventBus::with_config(BusConfig {
            history_limit: 3,
            subscriber_buffer: 8,
        });
        for i in 0..10 {
            bus.publish(event("plan-a", &format!("s{i}"), PlanStepState::Queued));
        }
        let history = bus.history("plan-a");
        assert_eq!(history.len(), 3);
        let ids: Vec<_> = history.iter().map(|e| e.step.id.as_str()).collect();
        assert_eq!(ids, vec!["s7", "s8", "s9"]);
        assert_eq!(bus.metrics().history_evicted(), 7);
    }

    #[tokio::test]
    async fn slow_consumer_is_dropped_and_others_keep_receiving() {
        let bus = PlanEventBus::with_config(BusConfig {
            history_limit: 32,
            subscriber_buffer: 2,
        });
        let slow = bus.subscribe("plan-a");
        let mut healthy = bus.subscribe("plan-a");

        // Fill the slow subscriber's 2-slot buffer, then overflow it. The
        // healthy subscriber drains as we go.
        for i in 0..5 {
            bus.publish(event("plan-a", &format!("s{i}"), PlanStepState::Queued));
            let got = timeout(Duration::from_secs(1), healthy.recv())
                .await
                .expect("healthy subscriber should keep receiving")
                .unwrap();
            assert_eq!(got.step.id, format!("s{i}"));
        }

        assert_eq!(slow.close_cause(), Some(CloseCause::SlowConsumer));
        assert_eq!(bus.subscriber_count(), 1);
        assert!(bus.metrics().subscribers_dropped() >= 1);
    }

    #[tokio::test]
    async fn latest_step_event_returns_most_recent() {
        let bus = PlanEventBus::new();
        bus.publish(event("plan-a", "s1", PlanStepState::Queued));
        bus.publish(event("plan-a", "s2", PlanStepState::Queued));
        bus.publish(event("plan-a", "s1", PlanStepState::Running));

        let latest = bus.latest_step_event("plan-a", "s1").unwrap();
        assert_eq!(latest.step.state, PlanStepState::Running);
        assert!(bus.latest_step_event("plan-a", "nope").is_none());
    }

    #[tokio::test]
    async fn drop_unsubscribes() {
        let bus = PlanEventBus::new();
        let sub = bus.subscribe("plan-a");
        assert_eq!(bus.subscriber_count(), 1);
        drop(sub);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn clear_plan_history_empties_replay() {
        let bus = PlanEventBus::new();
        bus.publish(event("plan-a", "s1", PlanStepState::Queued));
        assert_eq!(bus.history("plan-a").len(), 1);
        bus.clear_plan_history("plan-a");
        assert!(bus.history("plan-a").is_empty());
    }
}
