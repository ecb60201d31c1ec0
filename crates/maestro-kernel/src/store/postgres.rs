//! PostgreSQL plan-state backend.
//!
//! Schema (created by [`PostgresStateStore::migrate`]):
//!
//! ```sql
//! plan_state(plan_id, step_id, id uuid, trace_id, step jsonb, state,
//!            summary, output jsonb, updated_at, attempt, idempotency_key,
//!            created_at, approvals jsonb, subject jsonb,
//!            PRIMARY KEY (plan_id, step_id))
//! plan_state_metadata(plan_id PRIMARY KEY, trace_id, metadata jsonb,
//!                     updated_at)
//! ```
//!
//! `updated_at` is indexed for retention scans; every mutating call
//! opportunistically deletes rows past the configured window.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgPool;
use sqlx::types::Json;
use sqlx::Row;
use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use super::{
    retention_cutoff, PersistedPlanMetadata, PersistedStep, PlanLocks, PlanStateStore,
    StateUpdate, StepRecordParams, StoreError, StoreResult,
};
use crate::plan::{PlanStep, PlanStepState};
use crate::subject::Subject;

fn backend_err(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}

fn state_from_str(raw: &str) -> StoreResult<PlanStepState> {
    serde_json::from_value(serde_json::Value::String(raw.to_string()))
        .map_err(|_| StoreError::Backend(format!("unknown step state in database: {raw}")))
}

/// PostgreSQL implementation of [`PlanStateStore`].
pub struct PostgresStateStore {
    pool: PgPool,
    locks: PlanLocks,
    retention_ms: Option<u64>,
}

impl PostgresStateStore {
    /// Wrap an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            locks: PlanLocks::new(),
            retention_ms: None,
        }
    }

    /// Purge rows older than `retention_ms` on every mutating call.
    /// `0` disables retention.
    #[must_use]
    pub fn with_retention_ms(mut self, retention_ms: u64) -> Self {
        self.retention_ms = (retention_ms > 0).then_some(retention_ms);
        self
    }

    /// Create the schema if it does not exist.
    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS plan_state (
                plan_id         TEXT        NOT NULL,
                step_id         TEXT        NOT NULL,
                id              UUID        NOT NULL,
                trace_id        TEXT        NOT NULL,
                step            JSONB       NOT NULL,
                state           TEXT        NOT NULL,
                summary         TEXT,
                output          JSONB,
                updated_at      TIMESTAMPTZ NOT NULL,
                attempt         INTEGER     NOT NULL DEFAULT 0,
                idempotency_key TEXT        NOT NULL,
                created_at      TIMESTAMPTZ NOT NULL,
                approvals       JSONB       NOT NULL DEFAULT '{}'::jsonb,
                subject         JSONB,
                PRIMARY KEY (plan_id, step_id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS plan_state_metadata (
                plan_id    TEXT        PRIMARY KEY,
                trace_id   TEXT        NOT NULL,
                metadata   JSONB       NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS plan_state_updated_at_idx ON plan_state (updated_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS plan_state_metadata_updated_at_idx \
             ON plan_state_metadata (updated_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(())
    }

    async fn purge_expired(&self) -> StoreResult<()> {
        let Some(cutoff) = retention_cutoff(self.retention_ms) else {
            return Ok(());
        };
        sqlx::query("DELETE FROM plan_state WHERE updated_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        sqlx::query("DELETE FROM plan_state_metadata WHERE updated_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    fn entry_from_row(row: &sqlx::postgres::PgRow) -> StoreResult<PersistedStep> {
        let Json(step): Json<PlanStep> = row.try_get("step").map_err(backend_err)?;
        let state: String = row.try_get("state").map_err(backend_err)?;
        let output: Option<Json<serde_json::Value>> =
            row.try_get("output").map_err(backend_err)?;
        let approvals: Json<std::collections::BTreeMap<String, bool>> =
            row.try_get("approvals").map_err(backend_err)?;
        let subject: Option<Json<Subject>> = row.try_get("subject").map_err(backend_err)?;
        Ok(PersistedStep {
            id: row.try_get::<Uuid, _>("id").map_err(backend_err)?,
            trace_id: row.try_get("trace_id").map_err(backend_err)?,
            step,
            state: state_from_str(&state)?,
            summary: row.try_get("summary").map_err(backend_err)?,
            output: output.map(|Json(v)| v),
            attempt: row.try_get::<i32, _>("attempt").map_err(backend_err)? as u32,
            idempotency_key: row.try_get("idempotency_key").map_err(backend_err)?,
            created_at: row
                .try_get::<DateTime<Utc>, _>("created_at")
                .map_err(backend_err)?,
            updated_at: row
                .try_get::<DateTime<Utc>, _>("updated_at")
                .map_err(backend_err)?,
            approvals: approvals.0,
            subject: subject.map(|Json(s)| s),
        })
    }
}

#[async_trait]
impl PlanStateStore for PostgresStateStore {
    async fn remember_step(
        &self,
        plan_id: &str,
        step: &PlanStep,
        trace_id: &str,
        params: StepRecordParams,
    ) -> StoreResult<()> {
        self.purge_expired().await?;
        let subject = params.subject.map(|s| s.persisted());
        sqlx::query(
            r#"
            INSERT INTO plan_state
                (plan_id, step_id, id, trace_id, step, state, summary, output,
                 updated_at, attempt, idempotency_key, created_at, approvals, subject)
            VALUES ($1, $2, $3, $4, $5, $6, NULL, NULL, $7, $8, $9, $10, $11, $12)
            ON CONFLICT (plan_id, step_id) DO UPDATE SET
                trace_id = EXCLUDED.trace_id,
                step = EXCLUDED.step,
                state = EXCLUDED.state,
                updated_at = EXCLUDED.updated_at,
                attempt = EXCLUDED.attempt,
                idempotency_key = EXCLUDED.idempotency_key,
                approvals = EXCLUDED.approvals,
                subject = EXCLUDED.subject
            "#,
        )
        .bind(plan_id)
        .bind(&step.id)
        .bind(Uuid::new_v4())
        .bind(trace_id)
        .bind(Json(step))
        .bind(params.initial_state.as_str())
        .bind(Utc::now())
        .bind(params.attempt as i32)
        .bind(&params.idempotency_key)
        .bind(params.created_at)
        .bind(Json(&params.approvals))
        .bind(subject.map(Json))
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(())
    }

    async fn set_state(
        &self,
        plan_id: &str,
        step_id: &str,
        state: PlanStepState,
        update: StateUpdate,
    ) -> StoreResult<()> {
        self.purge_expired().await?;
        if state.is_terminal() {
            sqlx::query("DELETE FROM plan_state WHERE plan_id = $1 AND step_id = $2")
                .bind(plan_id)
                .bind(step_id)
                .execute(&self.pool)
                .await
                .map_err(backend_err)?;
            return Ok(());
        }
        sqlx::query(
            r#"
            UPDATE plan_state SET
                state = $3,
                summary = COALESCE($4, summary),
                output = COALESCE($5, output),
                attempt = COALESCE($6, attempt),
                updated_at = $7
            WHERE plan_id = $1 AND step_id = $2
            "#,
        )
        .bind(plan_id)
        .bind(step_id)
        .bind(state.as_str())
        .bind(update.summary)
        .bind(update.output.map(Json))
        .bind(update.attempt.map(|a| a as i32))
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(())
    }

    async fn record_approval(
        &self,
        plan_id: &str,
        step_id: &str,
        capability: &str,
        granted: bool,
    ) -> StoreResult<()> {
        self.purge_expired().await?;
        sqlx::query(
            r#"
            UPDATE plan_state SET
                approvals = approvals || jsonb_build_object($3::text, $4::boolean),
                updated_at = $5
            WHERE plan_id = $1 AND step_id = $2
            "#,
        )
        .bind(plan_id)
        .bind(step_id)
        .bind(capability)
        .bind(granted)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(())
    }

    async fn forget_step(&self, plan_id: &str, step_id: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM plan_state WHERE plan_id = $1 AND step_id = $2")
            .bind(plan_id)
            .bind(step_id)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn remember_plan_metadata(
        &self,
        plan_id: &str,
        metadata: &PersistedPlanMetadata,
    ) -> StoreResult<()> {
        self.purge_expired().await?;
        let mut metadata = metadata.clone();
        metadata.updated_at = Utc::now();
        for step in &mut metadata.steps {
            step.subject = step.subject.take().map(|s| s.persisted());
        }
        sqlx::query(
            r#"
            INSERT INTO plan_state_metadata (plan_id, trace_id, metadata, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (plan_id) DO UPDATE SET
                trace_id = EXCLUDED.trace_id,
                metadata = EXCLUDED.metadata,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(plan_id)
        .bind(&metadata.trace_id)
        .bind(Json(&metadata))
        .bind(metadata.updated_at)
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(())
    }

    async fn get_plan_metadata(&self, plan_id: &str) -> StoreResult<Option<PersistedPlanMetadata>> {
        let row = sqlx::query("SELECT metadata FROM plan_state_metadata WHERE plan_id = $1")
            .bind(plan_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;
        row.map(|row| {
            let Json(metadata): Json<PersistedPlanMetadata> =
                row.try_get("metadata").map_err(backend_err)?;
            Ok(metadata)
        })
        .transpose()
    }

    async fn list_plan_metadata(&self) -> StoreResult<Vec<(String, PersistedPlanMetadata)>> {
        let rows = sqlx::query("SELECT plan_id, metadata FROM plan_state_metadata")
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;
        rows.into_iter()
            .map(|row| {
                let plan_id: String = row.try_get("plan_id").map_err(backend_err)?;
                let Json(metadata): Json<PersistedPlanMetadata> =
                    row.try_get("metadata").map_err(backend_err)?;
                Ok((plan_id, metadata))
            })
            .collect()
    }

    async fn forget_plan_metadata(&self, plan_id: &str) -> StoreResult<()> {
        sqlx::query("DELETE FROM plan_state_metadata WHERE plan_id = $1")
            .bind(plan_id)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn list_active_steps(&self) -> StoreResult<Vec<(String, PersistedStep)>> {
        let rows = sqlx::query(
            "SELECT * FROM plan_state WHERE state IN ('queued', 'running', 'waiting_approval')",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(backend_err)?;
        rows.iter()
            .map(|row| {
                let plan_id: String = row.try_get("plan_id").map_err(backend_err)?;
                Ok((plan_id, Self::entry_from_row(row)?))
            })
            .collect()
    }

    async fn get_entry(&self, plan_id: &str, step_id: &str) -> StoreResult<Option<PersistedStep>> {
        let row = sqlx::query("SELECT * FROM plan_state WHERE plan_id = $1 AND step_id = $2")
            .bind(plan_id)
            .bind(step_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(backend_err)?;
        row.as_ref().map(Self::entry_from_row).transpose()
    }

    async fn clear(&self) -> StoreResult<()> {
        sqlx::query("DELETE FROM plan_state")
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        sqlx::query("DELETE FROM plan_state_metadata")
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    async fn lock_plan(&self, plan_id: &str) -> OwnedMutexGuard<()> {
        self.locks.lock(plan_id).await
    }
}
