//! Durable plan-state persistence.
//!
//! The runtime records every in-flight step as a [`PersistedStep`] row keyed
//! by `(plan_id, step_id)` and every plan's progression as a
//! [`PersistedPlanMetadata`] row keyed by `plan_id`. Rows for steps that
//! reach a terminal state are deleted; plan metadata survives until its
//! retention window lapses.
//!
//! Two backends implement [`PlanStateStore`]: a local JSON file
//! ([`file::FileStateStore`]) and PostgreSQL
//! ([`postgres::PostgresStateStore`], behind the `postgres` feature).
//! Mutations on the same plan are serialized by the per-plan lock exposed
//! through [`PlanStateStore::lock_plan`]; readers may observe the pre- or
//! post-write value but never a torn row.

pub mod file;
#[cfg(feature = "postgres")]
pub mod postgres;

pub use file::FileStateStore;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use crate::plan::{PlanStep, PlanStepState};
use crate::subject::Subject;

/// Persistence errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

// ---------------------------------------------------------------------------
// Rows
// ---------------------------------------------------------------------------

/// One in-flight step, keyed by `(plan_id, step_id)`.
///
/// The row is deleted on transition to a terminal state; at most one
/// non-terminal row ever exists per key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedStep {
    /// Row identity (stable across updates of the same step).
    pub id: Uuid,
    pub trace_id: String,
    /// Full step definition as submitted.
    pub step: PlanStep,
    pub state: PlanStepState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    /// Delivery attempts so far.
    pub attempt: u32,
    pub idempotency_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Capability → granted decisions recorded by the approval gate.
    #[serde(default)]
    pub approvals: BTreeMap<String, bool>,
    /// Owner identity snapshot (deep-cloned, never aliased).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Subject>,
}

/// Per-step entry inside [`PersistedPlanMetadata`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepMetadata {
    pub step: PlanStep,
    pub created_at: DateTime<Utc>,
    pub attempt: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<Subject>,
}

/// Plan progression row, keyed by `plan_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedPlanMetadata {
    pub trace_id: String,
    /// Ordered step metadata, in plan order.
    pub steps: Vec<StepMetadata>,
    /// Index of the next step eligible for release.
    pub next_step_index: usize,
    /// Index of the last step that reached `completed`, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_completed_index: Option<usize>,
    pub updated_at: DateTime<Utc>,
}

/// Parameters for [`PlanStateStore::remember_step`].
#[derive(Debug, Clone)]
pub struct StepRecordParams {
    pub initial_state: PlanStepState,
    pub idempotency_key: String,
    pub attempt: u32,
    pub created_at: DateTime<Utc>,
    pub approvals: BTreeMap<String, bool>,
    pub subject: Option<Subject>,
}

/// Optional fields applied by [`PlanStateStore::set_state`].
#[derive(Debug, Clone, Default)]
pub struct StateUpdate {
    pub summary: Option<String>,
    pub output: Option<Value>,
    pub attempt: Option<u32>,
}

// ---------------------------------------------------------------------------
// Per-plan locks
// ---------------------------------------------------------------------------

/// Registry of per-plan async mutexes.
///
/// The runtime holds a plan's lock for persist+enqueue sequences only; tool
/// invocation must never happen under it.
#[derive(Clone, Default)]
pub struct PlanLocks {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl PlanLocks {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquire the lock for `plan_id`, creating it on first use.
    pub async fn lock(&self, plan_id: &str) -> OwnedMutexGuard<()> {
        let mutex = self
            .locks
            .entry(plan_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        mutex.lock_owned().await
    }
}

// ---------------------------------------------------------------------------
// The store trait
// ---------------------------------------------------------------------------

/// Durable key-value persistence of per-step and per-plan state.
#[async_trait]
pub trait PlanStateStore: Send + Sync {
    /// Upsert a step row.
    async fn remember_step(
        &self,
        plan_id: &str,
        step: &PlanStep,
        trace_id: &str,
        params: StepRecordParams,
    ) -> StoreResult<()>;

    /// Transition a step. A terminal `state` deletes the row.
    async fn set_state(
        &self,
        plan_id: &str,
        step_id: &str,
        state: PlanStepState,
        update: StateUpdate,
    ) -> StoreResult<()>;

    /// Record an operator decision for one capability of a step.
    async fn record_approval(
        &self,
        plan_id: &str,
        step_id: &str,
        capability: &str,
        granted: bool,
    ) -> StoreResult<()>;

    /// Delete a step row unconditionally.
    async fn forget_step(&self, plan_id: &str, step_id: &str) -> StoreResult<()>;

    /// Upsert the plan metadata row.
    async fn remember_plan_metadata(
        &self,
        plan_id: &str,
        metadata: &PersistedPlanMetadata,
    ) -> StoreResult<()>;

    /// Fetch the plan metadata row.
    async fn get_plan_metadata(&self, plan_id: &str) -> StoreResult<Option<PersistedPlanMetadata>>;

    /// All plan metadata rows, keyed by plan id.
    async fn list_plan_metadata(&self) -> StoreResult<Vec<(String, PersistedPlanMetadata)>>;

    /// Delete the plan metadata row.
    async fn forget_plan_metadata(&self, plan_id: &str) -> StoreResult<()>;

    /// All non-terminal step rows, as `(plan_id, row)` pairs. Used by crash
    /// recovery to rehydrate the active set.
    async fn list_active_steps(&self) -> StoreResult<Vec<(String, PersistedStep)>>;

    /// Fetch a step row.
    async fn get_entry(&self, plan_id: &str, step_id: &str) -> StoreResult<Option<PersistedStep>>;

    /// Fetch just the step definition of a row.
    async fn get_step(&self, plan_id: &str, step_id: &str) -> StoreResult<Option<PlanStep>> {
        Ok(self.get_entry(plan_id, step_id).await?.map(|e| e.step))
    }

    /// Drop all rows (tests and dev tooling).
    async fn clear(&self) -> StoreResult<()>;

    /// Acquire the per-plan serialization lock.
    async fn lock_plan(&self, plan_id: &str) -> OwnedMutexGuard<()>;
}

/// Computes the cutoff instant for a retention window, if one is configured.
pub(crate) fn retention_cutoff(retention_ms: Option<u64>) -> Option<DateTime<Utc>> {
    let ms = retention_ms.filter(|ms| *ms > 0)?;
    let window = Duration::milliseconds(ms.min(i64::MAX as u64) as i64);
    Some(Utc::now() - window)
}
