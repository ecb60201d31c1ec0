//! The plan queue runtime.
//!
//! Wires the queue adapter, plan state store, dedup service and event bus
//! into the per-step state machine:
//!
//! ```text
//!            approval_required && not granted
//! queued ──────────────────────────────────────► waiting_approval
//!   │                                                 │
//!   │ approval not required                           │ resolve(approve)
//!   │                                                 ▼
//!   └─────────────────────────────► running
//!                                       │ tool success      → completed
//!                                       │ transient failure → queued (backoff)
//!                                       │ attempts exhausted→ dead_lettered
//!                                       │ permanent failure → failed
//!                                       │ resolve(reject)   → rejected
//! ```
//!
//! Locking discipline: the per-plan lock covers persist+enqueue sequences
//! only. Tool invocation never runs under it.

use chrono::Utc;
use futures::StreamExt;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::backoff::BackoffPolicy;
use crate::error::{RuntimeError, RuntimeResult};
use crate::messages::{StepCompletionMessage, StepTaskMessage};
use crate::queue::{Delivery, EnqueueOptions, QueueAdapter, QueueError};
use crate::tool::{ToolAgent, ToolError, ToolEvent, ToolEventState, ToolInvocation};
use maestro_kernel::bus::{PlanEventBus, PlanStepEvent};
use maestro_kernel::dedup::DedupStore;
use maestro_kernel::plan::{Plan, PlanStep, PlanStepState};
use maestro_kernel::policy::CapabilityPolicy;
use maestro_kernel::store::{
    PersistedPlanMetadata, PersistedStep, PlanStateStore, StateUpdate, StepMetadata,
    StepRecordParams,
};

/// Default step topic.
pub const STEP_QUEUE: &str = "plan.steps";
/// Default completions topic.
pub const COMPLETION_QUEUE: &str = "plan.completions";

/// Summary attached to steps held for approval.
const AWAITING_APPROVAL: &str = "Awaiting approval";
/// Summary attached to steps cancelled by an upstream rejection.
const UPSTREAM_REJECTED: &str = "cancelled: upstream rejected";

/// Operator decision on a held step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalDecision {
    Approve,
    Reject,
}

/// Runtime tuning knobs.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    pub step_queue: String,
    pub completion_queue: String,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            step_queue: STEP_QUEUE.to_string(),
            completion_queue: COMPLETION_QUEUE.to_string(),
            max_attempts: 5,
            backoff: BackoffPolicy::default(),
        }
    }
}

struct RuntimeInner {
    queue: Arc<dyn QueueAdapter>,
    store: Arc<dyn PlanStateStore>,
    dedup: Arc<dyn DedupStore>,
    bus: PlanEventBus,
    policy: Arc<dyn CapabilityPolicy>,
    tool: Arc<dyn ToolAgent>,
    options: RuntimeOptions,
}

/// The orchestrator: submits plans, consumes step and completion
/// deliveries, and resolves approvals. Cheap to clone.
#[derive(Clone)]
pub struct PlanRuntime {
    inner: Arc<RuntimeInner>,
}

impl PlanRuntime {
    pub fn new(
        queue: Arc<dyn QueueAdapter>,
        store: Arc<dyn PlanStateStore>,
        dedup: Arc<dyn DedupStore>,
        bus: PlanEventBus,
        policy: Arc<dyn CapabilityPolicy>,
        tool: Arc<dyn ToolAgent>,
        options: RuntimeOptions,
    ) -> Self {
        Self {
            inner: Arc::new(RuntimeInner {
                queue,
                store,
                dedup,
                bus,
                policy,
                tool,
                options,
            }),
        }
    }

    /// The event bus this runtime publishes through.
    pub fn bus(&self) -> &PlanEventBus {
        &self.inner.bus
    }

    /// The plan state store backing this runtime.
    pub fn store(&self) -> &Arc<dyn PlanStateStore> {
        &self.inner.store
    }

    /// Register the step worker and the completion consumer.
    pub async fn start(&self) -> RuntimeResult<()> {
        let inner = Arc::clone(&self.inner);
        self.inner
            .queue
            .consume(
                &self.inner.options.step_queue,
                Arc::new(move |delivery| {
                    let inner = Arc::clone(&inner);
                    Box::pin(async move {
                        inner.handle_step_delivery(delivery).await.map_err(Into::into)
                    })
                }),
            )
            .await?;

        let inner = Arc::clone(&self.inner);
        self.inner
            .queue
            .consume(
                &self.inner.options.completion_queue,
                Arc::new(move |delivery| {
                    let inner = Arc::clone(&inner);
                    Box::pin(async move {
                        inner
                            .handle_completion_delivery(delivery)
                            .await
                            .map_err(Into::into)
                    })
                }),
            )
            .await?;
        Ok(())
    }

    /// Persist and enqueue a freshly created plan.
    ///
    /// Reserves every step's idempotency key, persists metadata and step
    /// rows, publishes the initial events, and releases the first
    /// executable step. On any failure past the reservation point the keys
    /// are released and the rows removed before the original error
    /// propagates.
    pub async fn submit(&self, plan: &Plan, request_id: Option<String>) -> RuntimeResult<()> {
        let inner = &self.inner;
        let plan_id = plan.id.as_str();
        let _guard = inner.store.lock_plan(plan_id).await;

        let mut reserved: Vec<String> = Vec::with_capacity(plan.steps.len());
        for step in &plan.steps {
            let key = Plan::idempotency_key(plan_id, &step.id);
            if !inner.dedup.try_reserve(&key).await {
                for key in &reserved {
                    inner.dedup.release(key).await;
                }
                return Err(RuntimeError::Duplicate(key));
            }
            reserved.push(key);
        }

        if let Err(err) = inner.persist_and_release(plan, request_id).await {
            // Roll back everything this submission reserved or wrote.
            for key in &reserved {
                inner.dedup.release(key).await;
            }
            for step in &plan.steps {
                let _ = inner.store.forget_step(plan_id, &step.id).await;
            }
            let _ = inner.store.forget_plan_metadata(plan_id).await;
            return Err(err);
        }
        Ok(())
    }

    /// Resolve a step held in `waiting_approval`.
    pub async fn resolve_approval(
        &self,
        plan_id: &str,
        step_id: &str,
        decision: ApprovalDecision,
        summary: Option<String>,
    ) -> RuntimeResult<()> {
        let inner = &self.inner;
        let _guard = inner.store.lock_plan(plan_id).await;

        let entry = inner
            .store
            .get_entry(plan_id, step_id)
            .await?
            .ok_or_else(|| RuntimeError::NotFound(format!("{plan_id}/{step_id}")))?;
        if entry.state != PlanStepState::WaitingApproval {
            return Err(RuntimeError::Conflict(
                "step is not awaiting approval".to_string(),
            ));
        }

        let granted = decision == ApprovalDecision::Approve;
        inner
            .store
            .record_approval(plan_id, step_id, &entry.step.capability, granted)
            .await?;

        match decision {
            ApprovalDecision::Approve => {
                inner
                    .store
                    .set_state(plan_id, step_id, PlanStepState::Queued, StateUpdate::default())
                    .await?;
                inner.publish_event(
                    plan_id,
                    &entry.trace_id,
                    &entry.step,
                    PlanStepState::Queued,
                    summary,
                    None,
                );
                // The key has been reserved since submit; bypass dedup.
                let message = StepTaskMessage {
                    plan_id: plan_id.to_string(),
                    step_id: step_id.to_string(),
                    step: entry.step.clone(),
                    attempt: entry.attempt,
                    trace_id: entry.trace_id.clone(),
                    request_id: None,
                    subject: entry.subject.clone(),
                };
                inner.enqueue_step(&message, true, None).await?;
            }
            ApprovalDecision::Reject => {
                inner
                    .store
                    .set_state(
                        plan_id,
                        step_id,
                        PlanStepState::Rejected,
                        StateUpdate::default(),
                    )
                    .await?;
                inner.publish_event(
                    plan_id,
                    &entry.trace_id,
                    &entry.step,
                    PlanStepState::Rejected,
                    summary,
                    None,
                );
                inner.dedup.release(&entry.idempotency_key).await;
                inner.reject_remaining(plan_id, &entry).await?;
            }
        }
        Ok(())
    }

    /// Rehydrate the active set after a restart.
    ///
    /// `queued`/`running` steps have their keys re-reserved and are
    /// re-enqueued with dedup bypassed; `waiting_approval` steps are left
    /// idle for their operator.
    pub async fn recover(&self) -> RuntimeResult<usize> {
        let inner = &self.inner;
        let active = inner.store.list_active_steps().await?;
        let mut requeued = 0usize;
        for (plan_id, entry) in active {
            inner.dedup.try_reserve(&entry.idempotency_key).await;
            match entry.state {
                PlanStepState::Queued | PlanStepState::Running => {
                    let message = StepTaskMessage {
                        plan_id: plan_id.clone(),
                        step_id: entry.step.id.clone(),
                        step: entry.step.clone(),
                        attempt: entry.attempt,
                        trace_id: entry.trace_id.clone(),
                        request_id: None,
                        subject: entry.subject.clone(),
                    };
                    inner.enqueue_step(&message, true, None).await?;
                    requeued += 1;
                }
                PlanStepState::WaitingApproval => {}
                _ => {}
            }
        }
        if requeued > 0 {
            info!(requeued, "re-enqueued active steps after restart");
        }
        Ok(requeued)
    }
}

impl RuntimeInner {
    fn publish_event(
        &self,
        plan_id: &str,
        trace_id: &str,
        step: &PlanStep,
        state: PlanStepState,
        summary: Option<String>,
        output: Option<serde_json::Value>,
    ) {
        self.bus.publish(PlanStepEvent::for_step(
            plan_id, trace_id, step, state, summary, output,
        ));
    }

    async fn enqueue_step(
        &self,
        message: &StepTaskMessage,
        skip_dedup: bool,
        delay: Option<Duration>,
    ) -> RuntimeResult<()> {
        let payload = message.to_bytes()?;
        let opts = EnqueueOptions {
            idempotency_key: Some(message.idempotency_key()),
            headers: message.headers(),
            skip_dedup,
            delay,
        };
        match self.queue.enqueue(&self.options.step_queue, &payload, opts).await {
            Ok(()) | Err(QueueError::Duplicate) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    /// Submit steps 2–4: metadata, step rows, initial events, first release.
    async fn persist_and_release(
        &self,
        plan: &Plan,
        request_id: Option<String>,
    ) -> RuntimeResult<()> {
        let plan_id = plan.id.as_str();
        let created_at = Utc::now();
        let owner = plan.owner.persisted();

        let metadata = PersistedPlanMetadata {
            trace_id: plan.trace_id.clone(),
            steps: plan
                .steps
                .iter()
                .map(|step| StepMetadata {
                    step: step.clone(),
                    created_at,
                    attempt: 0,
                    subject: Some(owner.clone()),
                })
                .collect(),
            next_step_index: 0,
            last_completed_index: None,
            updated_at: created_at,
        };
        self.store.remember_plan_metadata(plan_id, &metadata).await?;

        for (index, step) in plan.steps.iter().enumerate() {
            // Only the first step can be immediately held for approval;
            // later steps reach `waiting_approval` when their turn comes.
            let initial_state = if index == 0 && step.approval_required {
                PlanStepState::WaitingApproval
            } else {
                PlanStepState::Queued
            };
            self.store
                .remember_step(
                    plan_id,
                    step,
                    &plan.trace_id,
                    StepRecordParams {
                        initial_state,
                        idempotency_key: Plan::idempotency_key(plan_id, &step.id),
                        attempt: 0,
                        created_at,
                        approvals: BTreeMap::new(),
                        subject: Some(owner.clone()),
                    },
                )
                .await?;
            let summary =
                (initial_state == PlanStepState::WaitingApproval).then(|| AWAITING_APPROVAL.to_string());
            self.publish_event(plan_id, &plan.trace_id, step, initial_state, summary, None);
        }

        if let Some(first) = plan.steps.first() {
            if !first.approval_required {
                let message = StepTaskMessage {
                    plan_id: plan_id.to_string(),
                    step_id: first.id.clone(),
                    step: first.clone(),
                    attempt: 0,
                    trace_id: plan.trace_id.clone(),
                    request_id,
                    subject: Some(owner),
                };
                self.enqueue_step(&message, true, None).await?;
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Step worker
    // -----------------------------------------------------------------------

    async fn handle_step_delivery(&self, delivery: Delivery) -> RuntimeResult<()> {
        let message = match StepTaskMessage::parse(&delivery.payload) {
            Ok(message) => message,
            Err(err) => {
                // Poison messages are acked and logged; they must not loop.
                warn!(%err, "unparseable step message, acking");
                delivery.ack().await;
                return Ok(());
            }
        };

        let Some(entry) = self
            .store
            .get_entry(&message.plan_id, &message.step_id)
            .await?
        else {
            // Late delivery for a step that already terminated.
            debug!(plan_id = %message.plan_id, step_id = %message.step_id, "ignoring late step message");
            delivery.ack().await;
            return Ok(());
        };
        if !matches!(entry.state, PlanStepState::Queued | PlanStepState::Running) {
            delivery.ack().await;
            return Ok(());
        }

        let decision = self
            .policy
            .enforce_plan_step(&entry.step, entry.subject.as_ref());
        if !decision.allow {
            let reason = decision
                .deny
                .first()
                .map(|d| d.reason.clone())
                .unwrap_or_else(|| "denied".to_string());
            let summary = format!("capability denied: {reason}");
            self.publish_event(
                &message.plan_id,
                &entry.trace_id,
                &entry.step,
                PlanStepState::Failed,
                Some(summary),
                None,
            );
            self.store
                .set_state(
                    &message.plan_id,
                    &message.step_id,
                    PlanStepState::Failed,
                    StateUpdate::default(),
                )
                .await?;
            self.dedup.release(&entry.idempotency_key).await;
            delivery.ack().await;
            return Ok(());
        }

        self.store
            .set_state(
                &message.plan_id,
                &message.step_id,
                PlanStepState::Running,
                StateUpdate {
                    attempt: Some(delivery.attempts),
                    ..Default::default()
                },
            )
            .await?;
        self.publish_event(
            &message.plan_id,
            &entry.trace_id,
            &entry.step,
            PlanStepState::Running,
            None,
            None,
        );

        // Tool invocation runs outside every lock.
        let outcome = self.invoke_tool(&message, &entry).await;
        match outcome {
            Ok(terminal) => {
                let state = match terminal.state {
                    ToolEventState::Completed => PlanStepState::Completed,
                    _ => PlanStepState::Failed,
                };
                self.publish_completion(&message, &entry, state, terminal.summary, terminal.output)
                    .await?;
                delivery.ack().await;
            }
            Err(StepFailure::Permanent(reason)) => {
                self.publish_completion(
                    &message,
                    &entry,
                    PlanStepState::Failed,
                    Some(reason),
                    None,
                )
                .await?;
                delivery.ack().await;
            }
            Err(StepFailure::Transient(reason)) => {
                self.retry_or_dead_letter(&delivery, &message, &entry, reason)
                    .await?;
            }
        }
        Ok(())
    }

    async fn invoke_tool(
        &self,
        message: &StepTaskMessage,
        entry: &PersistedStep,
    ) -> Result<ToolEvent, StepFailure> {
        let invocation = ToolInvocation {
            plan_id: message.plan_id.clone(),
            step_id: message.step_id.clone(),
            tool: entry.step.tool.clone(),
            input: entry.step.input.clone(),
            timeout_seconds: entry.step.timeout_seconds,
            trace_id: entry.trace_id.clone(),
        };
        let timeout = Duration::from_secs(entry.step.timeout_seconds.max(1));

        let run = async {
            let mut stream = self.tool.execute(invocation).await.map_err(|err| match err {
                ToolError::Transient(reason) => StepFailure::Transient(reason),
                ToolError::Permanent(reason) => StepFailure::Permanent(reason),
            })?;
            while let Some(event) = stream.next().await {
                if event.state.is_terminal() {
                    return Ok(event);
                }
                // Forward tool progress to subscribers.
                self.publish_event(
                    &message.plan_id,
                    &entry.trace_id,
                    &entry.step,
                    PlanStepState::Running,
                    event.summary.clone(),
                    event.output.clone(),
                );
            }
            Err(StepFailure::Transient(
                "tool stream ended without a terminal event".to_string(),
            ))
        };

        match tokio::time::timeout(timeout, run).await {
            Ok(result) => result,
            Err(_) => Err(StepFailure::Transient("tool invocation timed out".to_string())),
        }
    }

    async fn publish_completion(
        &self,
        message: &StepTaskMessage,
        entry: &PersistedStep,
        state: PlanStepState,
        summary: Option<String>,
        output: Option<serde_json::Value>,
    ) -> RuntimeResult<()> {
        let completion = StepCompletionMessage {
            plan_id: message.plan_id.clone(),
            step_id: message.step_id.clone(),
            state,
            summary,
            output,
            attempt: message.attempt,
            request_id: message.request_id.clone(),
            trace_id: Some(entry.trace_id.clone()),
            occurred_at: Some(Utc::now()),
            approvals: entry.approvals.clone(),
        };
        let payload = completion.to_bytes()?;
        let opts = EnqueueOptions {
            idempotency_key: Some(completion.idempotency_key()),
            headers: completion.headers(),
            skip_dedup: false,
            delay: None,
        };
        match self
            .queue
            .enqueue(&self.options.completion_queue, &payload, opts)
            .await
        {
            Ok(()) | Err(QueueError::Duplicate) => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn retry_or_dead_letter(
        &self,
        delivery: &Delivery,
        message: &StepTaskMessage,
        entry: &PersistedStep,
        reason: String,
    ) -> RuntimeResult<()> {
        if delivery.attempts + 1 >= self.options.max_attempts {
            warn!(
                plan_id = %message.plan_id,
                step_id = %message.step_id,
                attempts = delivery.attempts,
                %reason,
                "step exhausted retries, dead-lettering"
            );
            self.publish_event(
                &message.plan_id,
                &entry.trace_id,
                &entry.step,
                PlanStepState::DeadLettered,
                Some(reason.clone()),
                None,
            );
            self.store
                .set_state(
                    &message.plan_id,
                    &message.step_id,
                    PlanStepState::DeadLettered,
                    StateUpdate::default(),
                )
                .await?;
            self.dedup.release(&entry.idempotency_key).await;
            delivery.dead_letter(reason).await;
        } else {
            self.store
                .set_state(
                    &message.plan_id,
                    &message.step_id,
                    PlanStepState::Queued,
                    StateUpdate {
                        attempt: Some(delivery.attempts + 1),
                        ..Default::default()
                    },
                )
                .await?;
            self.publish_event(
                &message.plan_id,
                &entry.trace_id,
                &entry.step,
                PlanStepState::Queued,
                Some(format!("retrying: {reason}")),
                None,
            );
            delivery
                .retry(Some(self.options.backoff.delay_for(delivery.attempts)))
                .await;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Completion consumer
    // -----------------------------------------------------------------------

    async fn handle_completion_delivery(&self, delivery: Delivery) -> RuntimeResult<()> {
        let message = match StepCompletionMessage::parse(&delivery.payload) {
            Ok(message) => message,
            Err(err) => {
                warn!(%err, "unparseable completion message, acking");
                delivery.ack().await;
                return Ok(());
            }
        };

        {
            let _guard = self.store.lock_plan(&message.plan_id).await;

            // Forged-completion defense, checked under the plan lock so a
            // racing duplicate cannot pass validation twice: the persisted
            // step must exist, be non-terminal, and still hold its
            // reservation.
            let entry = self
                .store
                .get_entry(&message.plan_id, &message.step_id)
                .await?;
            let valid = match &entry {
                Some(entry) => {
                    !entry.state.is_terminal()
                        && self.dedup.is_reserved(&entry.idempotency_key).await
                }
                None => false,
            };
            let Some(entry) = entry.filter(|_| valid) else {
                warn!(
                    plan_id = %message.plan_id,
                    step_id = %message.step_id,
                    "dead-lettering forged completion message"
                );
                delivery.dead_letter("forged completion").await;
                return Ok(());
            };

            self.store
                .set_state(
                    &message.plan_id,
                    &message.step_id,
                    message.state,
                    StateUpdate {
                        summary: message.summary.clone(),
                        output: message.output.clone(),
                        attempt: Some(message.attempt),
                    },
                )
                .await?;
            self.publish_event(
                &message.plan_id,
                &entry.trace_id,
                &entry.step,
                message.state,
                message.summary.clone(),
                message.output.clone(),
            );

            if message.state.is_terminal() {
                self.dedup.release(&entry.idempotency_key).await;
            }
            if message.state == PlanStepState::Completed {
                self.advance_after_completion(&message.plan_id, &message.step_id)
                    .await?;
            }
        }

        delivery.ack().await;
        // The completion's own reservation ends with its acknowledgement.
        self.dedup.release(&message.idempotency_key()).await;
        Ok(())
    }

    /// Move the plan cursor past the completed step, then release the next
    /// executable one. Caller holds the plan lock.
    async fn advance_after_completion(&self, plan_id: &str, step_id: &str) -> RuntimeResult<()> {
        let Some(mut metadata) = self.store.get_plan_metadata(plan_id).await? else {
            return Ok(());
        };
        if let Some(index) = metadata.steps.iter().position(|m| m.step.id == step_id) {
            metadata.last_completed_index = Some(index);
            metadata.next_step_index = metadata.next_step_index.max(index + 1);
        }
        self.release_next(plan_id, &mut metadata).await?;
        self.store.remember_plan_metadata(plan_id, &metadata).await?;
        Ok(())
    }

    /// Release the first `queued` step at the cursor: enqueue it, or hold
    /// it in `waiting_approval` when it requires an operator. Caller holds
    /// the plan lock.
    async fn release_next(
        &self,
        plan_id: &str,
        metadata: &mut PersistedPlanMetadata,
    ) -> RuntimeResult<()> {
        while metadata.next_step_index < metadata.steps.len() {
            let meta = &metadata.steps[metadata.next_step_index];
            let Some(entry) = self.store.get_entry(plan_id, &meta.step.id).await? else {
                // Already terminal; skip past it.
                metadata.next_step_index += 1;
                continue;
            };
            match entry.state {
                PlanStepState::Queued => {
                    let approved = entry
                        .approvals
                        .get(&entry.step.capability)
                        .copied()
                        .unwrap_or(false);
                    if entry.step.approval_required && !approved {
                        self.store
                            .set_state(
                                plan_id,
                                &entry.step.id,
                                PlanStepState::WaitingApproval,
                                StateUpdate {
                                    summary: Some(AWAITING_APPROVAL.to_string()),
                                    ..Default::default()
                                },
                            )
                            .await?;
                        self.publish_event(
                            plan_id,
                            &entry.trace_id,
                            &entry.step,
                            PlanStepState::WaitingApproval,
                            Some(AWAITING_APPROVAL.to_string()),
                            None,
                        );
                    } else {
                        let message = StepTaskMessage {
                            plan_id: plan_id.to_string(),
                            step_id: entry.step.id.clone(),
                            step: entry.step.clone(),
                            attempt: entry.attempt,
                            trace_id: entry.trace_id.clone(),
                            request_id: None,
                            subject: entry.subject.clone(),
                        };
                        self.enqueue_step(&message, true, None).await?;
                    }
                    break;
                }
                // In flight or held; nothing to release.
                _ => break,
            }
        }
        Ok(())
    }

    /// A rejection short-circuits the remainder of the plan. Caller holds
    /// the plan lock.
    async fn reject_remaining(
        &self,
        plan_id: &str,
        rejected: &PersistedStep,
    ) -> RuntimeResult<()> {
        let Some(mut metadata) = self.store.get_plan_metadata(plan_id).await? else {
            return Ok(());
        };
        let start = metadata
            .steps
            .iter()
            .position(|m| m.step.id == rejected.step.id)
            .map(|i| i + 1)
            .unwrap_or(metadata.steps.len());
        for meta in metadata.steps.iter().skip(start) {
            let Some(entry) = self.store.get_entry(plan_id, &meta.step.id).await? else {
                continue;
            };
            if entry.state.is_terminal() {
                continue;
            }
            self.store
                .set_state(
                    plan_id,
                    &entry.step.id,
                    PlanStepState::Rejected,
                    StateUpdate::default(),
                )
                .await?;
            self.publish_event(
                plan_id,
                &entry.trace_id,
                &entry.step,
                PlanStepState::Rejected,
                Some(UPSTREAM_REJECTED.to_string()),
                None,
            );
            self.dedup.release(&entry.idempotency_key).await;
        }
        metadata.next_step_index = metadata.steps.len();
        self.store.remember_plan_metadata(plan_id, &metadata).await?;
        Ok(())
    }
}

/// Worker-side classification of a failed tool invocation.
enum StepFailure {
    Transient(String),
    Permanent(String),
}

#[cfg(test)]
mod tests;
