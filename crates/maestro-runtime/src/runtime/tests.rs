use super::*;
use crate::queue::{MemoryQueue, QueueMetrics};
use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use maestro_kernel::bus::Subscription;
use maestro_kernel::dedup::MemoryDedup;
use maestro_kernel::policy::RulePolicy;
use maestro_kernel::store::FileStateStore;
use maestro_kernel::subject::Subject;
use maestro_kernel::PlanId;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::time::{timeout, Duration};

/// Scriptable tool agent: behavior keyed by the step's tool name.
struct ScriptedTool {
    transient_failures: AtomicU32,
}

impl ScriptedTool {
    fn new() -> Self {
        Self {
            transient_failures: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl ToolAgent for ScriptedTool {
    async fn execute(
        &self,
        invocation: ToolInvocation,
    ) -> Result<BoxStream<'static, ToolEvent>, ToolError> {
        match invocation.tool.as_str() {
            "ok" => Ok(Box::pin(stream::iter(vec![
                ToolEvent::running("working"),
                ToolEvent::completed("done", Some(serde_json::json!({"ok": true}))),
            ]))),
            "fail" => Ok(Box::pin(stream::iter(vec![ToolEvent::failed(
                "tool reported failure",
            )]))),
            "flaky-once" => {
                if self.transient_failures.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ToolError::Transient("connection reset".into()))
                } else {
                    Ok(Box::pin(stream::iter(vec![ToolEvent::completed(
                        "done after retry",
                        None,
                    )])))
                }
            }
            "always-down" => Err(ToolError::Transient("agent unreachable".into())),
            // Emits no terminal event; the step stays running until its
            // timeout.
            "hang" => Ok(Box::pin(stream::pending())),
            "invalid" => Err(ToolError::Permanent("unknown tool".into())),
            other => Err(ToolError::Permanent(format!("unscripted tool {other}"))),
        }
    }
}

struct Harness {
    runtime: PlanRuntime,
    queue: Arc<MemoryQueue>,
    dedup: Arc<MemoryDedup>,
    _dir: tempfile::TempDir,
}

async fn harness(max_attempts: u32) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let dedup = Arc::new(MemoryDedup::new());
    let queue = Arc::new(MemoryQueue::new(
        dedup.clone(),
        QueueMetrics::unregistered("memory", "default"),
        max_attempts,
    ));
    let store = Arc::new(FileStateStore::new(dir.path().join("state.json")));
    let runtime = PlanRuntime::new(
        queue.clone(),
        store,
        dedup.clone(),
        PlanEventBus::new(),
        Arc::new(RulePolicy::development()),
        Arc::new(ScriptedTool::new()),
        RuntimeOptions {
            max_attempts,
            backoff: BackoffPolicy::new(10, 50, false),
            ..Default::default()
        },
    );
    runtime.start().await.unwrap();
    Harness {
        runtime,
        queue,
        dedup,
        _dir: dir,
    }
}

fn plan_with_tools(tools: &[(&str, &str, bool)]) -> Plan {
    Plan {
        id: PlanId::generate(),
        goal: "launch feature".to_string(),
        steps: tools
            .iter()
            .map(|(id, tool, approval)| {
                PlanStep::new(*id, format!("run {tool}"), *tool)
                    .with_approval_required(*approval)
            })
            .collect(),
        owner: Subject::anonymous("sess-owner"),
        created_at: Utc::now(),
        trace_id: "trace-test".to_string(),
    }
}

async fn next_state(
    sub: &mut Subscription,
    step_id: &str,
    state: PlanStepState,
) -> PlanStepEvent {
    timeout(Duration::from_secs(5), async {
        loop {
            let event = sub.recv().await.expect("subscription closed early");
            if event.step.id == step_id && event.step.state == state {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {step_id} -> {state}"))
}

#[tokio::test]
async fn happy_path_runs_steps_in_order_and_purges_state() {
    let h = harness(3).await;
    let plan = plan_with_tools(&[("s1", "ok", false), ("s2", "ok", false)]);
    let mut sub = h.runtime.bus().subscribe(plan.id.as_str());

    h.runtime.submit(&plan, Some("req-1".into())).await.unwrap();

    next_state(&mut sub, "s1", PlanStepState::Queued).await;
    next_state(&mut sub, "s1", PlanStepState::Running).await;
    let done = next_state(&mut sub, "s1", PlanStepState::Completed).await;
    assert_eq!(done.step.summary.as_deref(), Some("done"));
    next_state(&mut sub, "s2", PlanStepState::Running).await;
    next_state(&mut sub, "s2", PlanStepState::Completed).await;

    // Terminal purge: no active rows, every reservation released.
    timeout(Duration::from_secs(2), async {
        loop {
            let active = h.runtime.store().list_active_steps().await.unwrap();
            if active.is_empty() && h.dedup.is_empty() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("active set and dedup should drain");

    // History preserved the same ordered sequence the subscriber saw.
    let history = h.runtime.bus().history(plan.id.as_str());
    let completed: Vec<_> = history
        .iter()
        .filter(|e| e.step.state == PlanStepState::Completed)
        .map(|e| e.step.id.as_str())
        .collect();
    assert_eq!(completed, vec!["s1", "s2"]);

    let metadata = h
        .runtime
        .store()
        .get_plan_metadata(plan.id.as_str())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(metadata.next_step_index, 2);
    assert_eq!(metadata.last_completed_index, Some(1));
}

#[tokio::test]
async fn forged_completion_is_dead_lettered_and_invisible() {
    let h = harness(3).await;
    let mut sub = h.runtime.bus().subscribe("plan-abc12345");

    let forged = StepCompletionMessage {
        plan_id: "plan-abc12345".into(),
        step_id: "ghost-step".into(),
        state: PlanStepState::Completed,
        summary: Some("forged".into()),
        output: None,
        attempt: 0,
        request_id: None,
        trace_id: None,
        occurred_at: None,
        approvals: BTreeMap::new(),
    };
    h.queue
        .enqueue(
            COMPLETION_QUEUE,
            &forged.to_bytes().unwrap(),
            EnqueueOptions {
                idempotency_key: Some(forged.idempotency_key()),
                headers: forged.headers(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    timeout(Duration::from_secs(2), async {
        while h.queue.dead_letters(COMPLETION_QUEUE).is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("forged completion should be dead-lettered");

    assert_eq!(h.queue.queue_depth(COMPLETION_QUEUE).await, 0);
    // No event became visible to the subscriber.
    assert!(
        timeout(Duration::from_millis(200), sub.recv()).await.is_err(),
        "no event should be published for a forged completion"
    );
}

#[tokio::test]
async fn duplicate_completion_for_terminated_step_is_dead_lettered() {
    let h = harness(3).await;
    let plan = plan_with_tools(&[("s1", "ok", false)]);
    let mut sub = h.runtime.bus().subscribe(plan.id.as_str());
    h.runtime.submit(&plan, None).await.unwrap();
    next_state(&mut sub, "s1", PlanStepState::Completed).await;

    // The step row is gone; a second completion is indistinguishable from
    // a forgery and must be dead-lettered.
    let duplicate = StepCompletionMessage {
        plan_id: plan.id.as_str().to_string(),
        step_id: "s1".into(),
        state: PlanStepState::Completed,
        summary: None,
        output: None,
        attempt: 0,
        request_id: None,
        trace_id: None,
        occurred_at: None,
        approvals: BTreeMap::new(),
    };
    h.queue
        .enqueue(
            COMPLETION_QUEUE,
            &duplicate.to_bytes().unwrap(),
            EnqueueOptions {
                idempotency_key: Some(duplicate.idempotency_key()),
                headers: duplicate.headers(),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    timeout(Duration::from_secs(2), async {
        while h.queue.dead_letters(COMPLETION_QUEUE).is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("duplicate completion should be dead-lettered");
}

#[tokio::test]
async fn approval_holds_then_approve_releases() {
    let h = harness(3).await;
    let plan = plan_with_tools(&[("gate", "ok", true), ("after", "ok", false)]);
    let mut sub = h.runtime.bus().subscribe(plan.id.as_str());
    h.runtime.submit(&plan, None).await.unwrap();

    let held = next_state(&mut sub, "gate", PlanStepState::WaitingApproval).await;
    assert_eq!(held.step.summary.as_deref(), Some("Awaiting approval"));

    // Nothing runs while held.
    assert!(
        timeout(Duration::from_millis(200), async {
            loop {
                let e = sub.recv().await.unwrap();
                if e.step.state == PlanStepState::Running {
                    return e;
                }
            }
        })
        .await
        .is_err(),
        "held step must not run before approval"
    );

    h.runtime
        .resolve_approval(
            plan.id.as_str(),
            "gate",
            ApprovalDecision::Approve,
            Some("Approved: looks safe".into()),
        )
        .await
        .unwrap();

    let queued = next_state(&mut sub, "gate", PlanStepState::Queued).await;
    assert_eq!(queued.step.summary.as_deref(), Some("Approved: looks safe"));
    next_state(&mut sub, "gate", PlanStepState::Completed).await;
    next_state(&mut sub, "after", PlanStepState::Completed).await;
}

#[tokio::test]
async fn rejection_cascades_to_downstream_steps() {
    let h = harness(3).await;
    let plan = plan_with_tools(&[("gate", "ok", true), ("s2", "ok", false), ("s3", "ok", false)]);
    let mut sub = h.runtime.bus().subscribe(plan.id.as_str());
    h.runtime.submit(&plan, None).await.unwrap();
    next_state(&mut sub, "gate", PlanStepState::WaitingApproval).await;

    h.runtime
        .resolve_approval(
            plan.id.as_str(),
            "gate",
            ApprovalDecision::Reject,
            Some("Rejected: too risky".into()),
        )
        .await
        .unwrap();

    let rejected = next_state(&mut sub, "gate", PlanStepState::Rejected).await;
    assert_eq!(rejected.step.summary.as_deref(), Some("Rejected: too risky"));
    let s2 = next_state(&mut sub, "s2", PlanStepState::Rejected).await;
    assert_eq!(s2.step.summary.as_deref(), Some("cancelled: upstream rejected"));
    next_state(&mut sub, "s3", PlanStepState::Rejected).await;

    assert!(h.runtime.store().list_active_steps().await.unwrap().is_empty());
    assert!(h.dedup.is_empty());
}

#[tokio::test]
async fn approval_on_non_pending_step_conflicts() {
    let h = harness(3).await;
    let plan = plan_with_tools(&[("s1", "ok", false)]);
    let mut sub = h.runtime.bus().subscribe(plan.id.as_str());
    h.runtime.submit(&plan, None).await.unwrap();
    next_state(&mut sub, "s1", PlanStepState::Completed).await;

    // Terminal step: row gone.
    let err = h
        .runtime
        .resolve_approval(plan.id.as_str(), "s1", ApprovalDecision::Approve, None)
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::NotFound(_)));

    let plan2 = plan_with_tools(&[("slow-gate", "hang", false)]);
    h.runtime.submit(&plan2, None).await.unwrap();
    // Queued/running (not waiting_approval) step: conflict.
    let err = h
        .runtime
        .resolve_approval(plan2.id.as_str(), "slow-gate", ApprovalDecision::Approve, None)
        .await
        .unwrap_err();
    assert!(matches!(err, RuntimeError::Conflict(_)));
}

#[tokio::test]
async fn transient_failure_retries_with_backoff_then_completes() {
    let h = harness(3).await;
    let plan = plan_with_tools(&[("s1", "flaky-once", false)]);
    let mut sub = h.runtime.bus().subscribe(plan.id.as_str());
    h.runtime.submit(&plan, None).await.unwrap();

    // First attempt fails transiently and goes back to queued.
    let retried = timeout(Duration::from_secs(5), async {
        loop {
            let e = sub.recv().await.unwrap();
            if e.step.state == PlanStepState::Queued
                && e.step.summary.as_deref().is_some_and(|s| s.starts_with("retrying:"))
            {
                return e;
            }
        }
    })
    .await
    .expect("expected a retry event");
    assert!(retried.step.summary.unwrap().contains("connection reset"));

    next_state(&mut sub, "s1", PlanStepState::Completed).await;
}

#[tokio::test]
async fn exhausted_retries_dead_letter_the_step() {
    let h = harness(2).await;
    let plan = plan_with_tools(&[("s1", "always-down", false)]);
    let mut sub = h.runtime.bus().subscribe(plan.id.as_str());
    h.runtime.submit(&plan, None).await.unwrap();

    let dead = next_state(&mut sub, "s1", PlanStepState::DeadLettered).await;
    assert!(dead.step.summary.unwrap().contains("agent unreachable"));

    timeout(Duration::from_secs(2), async {
        while h.queue.dead_letters(STEP_QUEUE).is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("step message should land in the dead-letter queue");

    assert!(h.runtime.store().list_active_steps().await.unwrap().is_empty());
    assert!(!h.dedup.is_reserved(&format!("{}:s1", plan.id)).await);
}

#[tokio::test]
async fn permanent_tool_failure_completes_as_failed() {
    let h = harness(3).await;
    let plan = plan_with_tools(&[("s1", "invalid", false)]);
    let mut sub = h.runtime.bus().subscribe(plan.id.as_str());
    h.runtime.submit(&plan, None).await.unwrap();

    let failed = next_state(&mut sub, "s1", PlanStepState::Failed).await;
    assert!(failed.step.summary.unwrap().contains("unknown tool"));
    // Failed is terminal: the row is purged.
    timeout(Duration::from_secs(2), async {
        while !h.runtime.store().list_active_steps().await.unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn tool_reported_failure_flows_through_completion() {
    let h = harness(3).await;
    let plan = plan_with_tools(&[("s1", "fail", false)]);
    let mut sub = h.runtime.bus().subscribe(plan.id.as_str());
    h.runtime.submit(&plan, None).await.unwrap();

    let failed = next_state(&mut sub, "s1", PlanStepState::Failed).await;
    assert_eq!(failed.step.summary.as_deref(), Some("tool reported failure"));
}

#[tokio::test]
async fn duplicate_submission_is_rejected_and_leaks_nothing() {
    let h = harness(3).await;
    let plan = plan_with_tools(&[("s1", "hang", false)]);
    h.runtime.submit(&plan, None).await.unwrap();

    let err = h.runtime.submit(&plan, None).await.unwrap_err();
    assert!(matches!(err, RuntimeError::Duplicate(_)));
    // The original reservation must survive the failed duplicate.
    assert!(h.dedup.is_reserved(&format!("{}:s1", plan.id)).await);
}

#[tokio::test]
async fn recovery_reenqueues_active_steps() {
    // Build a store with persisted state, then a fresh runtime over it —
    // the moral equivalent of a crash between persist and enqueue.
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(FileStateStore::new(dir.path().join("state.json")));
    let plan = plan_with_tools(&[("s1", "ok", false), ("held", "ok", true)]);
    let plan_id = plan.id.as_str();
    store
        .remember_step(
            plan_id,
            &plan.steps[0],
            "trace-test",
            StepRecordParams {
                initial_state: PlanStepState::Queued,
                idempotency_key: format!("{plan_id}:s1"),
                attempt: 1,
                created_at: Utc::now(),
                approvals: BTreeMap::new(),
                subject: None,
            },
        )
        .await
        .unwrap();
    store
        .remember_step(
            plan_id,
            &plan.steps[1],
            "trace-test",
            StepRecordParams {
                initial_state: PlanStepState::WaitingApproval,
                idempotency_key: format!("{plan_id}:held"),
                attempt: 0,
                created_at: Utc::now(),
                approvals: BTreeMap::new(),
                subject: None,
            },
        )
        .await
        .unwrap();

    let dedup = Arc::new(MemoryDedup::new());
    let queue = Arc::new(MemoryQueue::new(
        dedup.clone(),
        QueueMetrics::unregistered("memory", "default"),
        3,
    ));
    let runtime = PlanRuntime::new(
        queue.clone(),
        store.clone(),
        dedup.clone(),
        PlanEventBus::new(),
        Arc::new(RulePolicy::development()),
        Arc::new(ScriptedTool::new()),
        RuntimeOptions::default(),
    );
    let mut sub = runtime.bus().subscribe(plan_id);
    runtime.start().await.unwrap();

    let requeued = runtime.recover().await.unwrap();
    assert_eq!(requeued, 1);
    // Keys re-reserved for both rows.
    assert!(dedup.is_reserved(&format!("{plan_id}:s1")).await);
    assert!(dedup.is_reserved(&format!("{plan_id}:held")).await);

    // The queued step runs to completion; the held one stays idle.
    next_state(&mut sub, "s1", PlanStepState::Completed).await;
    let entry = store.get_entry(plan_id, "held").await.unwrap().unwrap();
    assert_eq!(entry.state, PlanStepState::WaitingApproval);
}
