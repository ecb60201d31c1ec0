//! Local-file plan-state backend.
//!
//! State is one JSON document `{version: 1, steps: [...], plans: [...]}` at
//! the configured path. Every persist writes a sibling `.<uuid>.tmp` file
//! with mode `0600` and renames it over the target, so a crash mid-write
//! leaves the previous document intact. The document is loaded lazily on
//! first access and all mutations run under a single async mutex, so
//! concurrent writers cannot interleave.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::warn;
use uuid::Uuid;

use super::{
    retention_cutoff, PersistedPlanMetadata, PersistedStep, PlanLocks, PlanStateStore,
    StateUpdate, StepRecordParams, StoreResult,
};
use crate::plan::{PlanStep, PlanStepState};

const DOCUMENT_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StepRow {
    plan_id: String,
    step_id: String,
    entry: PersistedStep,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PlanRow {
    plan_id: String,
    metadata: PersistedPlanMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Document {
    version: u32,
    steps: Vec<StepRow>,
    plans: Vec<PlanRow>,
}

impl Document {
    fn empty() -> Self {
        Self {
            version: DOCUMENT_VERSION,
            steps: Vec::new(),
            plans: Vec::new(),
        }
    }
}

/// JSON-file implementation of [`PlanStateStore`].
pub struct FileStateStore {
    path: PathBuf,
    /// Lazily loaded document; the mutex is the write-serialization point.
    doc: Mutex<Option<Document>>,
    locks: PlanLocks,
    retention_ms: Option<u64>,
}

impl FileStateStore {
    /// Store state at `path`. The parent directory must exist.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            doc: Mutex::new(None),
            locks: PlanLocks::new(),
            retention_ms: None,
        }
    }

    /// Purge rows whose `updated_at` is older than `retention_ms` on every
    /// mutating call. `0` disables retention.
    #[must_use]
    pub fn with_retention_ms(mut self, retention_ms: u64) -> Self {
        self.retention_ms = (retention_ms > 0).then_some(retention_ms);
        self
    }

    async fn load_into(&self, slot: &mut Option<Document>) -> StoreResult<()> {
        if slot.is_some() {
            return Ok(());
        }
        let doc = match tokio::fs::read(&self.path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Document::empty(),
            Err(err) => return Err(err.into()),
        };
        *slot = Some(doc);
        Ok(())
    }

    /// Write the document atomically: temp file in the same directory, mode
    /// `0600`, then rename. The temp file is removed on every failure path.
    async fn persist(&self, doc: &Document) -> StoreResult<()> {
        let bytes = serde_json::to_vec_pretty(doc)?;
        let tmp = self
            .path
            .with_file_name(format!(".{}.tmp", Uuid::new_v4()));

        if let Err(err) = write_private(&tmp, &bytes).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(err.into());
        }
        if let Err(err) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(err.into());
        }
        Ok(())
    }

    fn purge_expired(&self, doc: &mut Document) {
        let Some(cutoff) = retention_cutoff(self.retention_ms) else {
            return;
        };
        let steps_before = doc.steps.len();
        doc.steps.retain(|row| row.entry.updated_at >= cutoff);
        let plans_before = doc.plans.len();
        doc.plans.retain(|row| row.metadata.updated_at >= cutoff);
        let purged = (steps_before - doc.steps.len()) + (plans_before - doc.plans.len());
        if purged > 0 {
            warn!(purged, "purged plan-state rows past retention window");
        }
    }

    /// Run `mutate` against the loaded document and persist the result.
    async fn mutate<F>(&self, mutate: F) -> StoreResult<()>
    where
        F: FnOnce(&mut Document),
    {
        let mut slot = self.doc.lock().await;
        self.load_into(&mut slot).await?;
        let doc = slot.as_mut().expect("document loaded above");
        mutate(doc);
        self.purge_expired(doc);
        self.persist(doc).await
    }

    /// Run `read` against the loaded document.
    async fn read<F, T>(&self, read: F) -> StoreResult<T>
    where
        F: FnOnce(&Document) -> T,
    {
        let mut slot = self.doc.lock().await;
        self.load_into(&mut slot).await?;
        Ok(read(slot.as_ref().expect("document loaded above")))
    }
}

async fn write_private(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(())
}

#[async_trait]
impl PlanStateStore for FileStateStore {
    async fn remember_step(
        &self,
        plan_id: &str,
        step: &PlanStep,
        trace_id: &str,
        params: StepRecordParams,
    ) -> StoreResult<()> {
        let plan_id = plan_id.to_string();
        let step = step.clone();
        let trace_id = trace_id.to_string();
        self.mutate(move |doc| {
            let now = Utc::now();
            let existing = doc
                .steps
                .iter_mut()
                .find(|row| row.plan_id == plan_id && row.step_id == step.id);
            let entry = PersistedStep {
                id: existing
                    .as_ref()
                    .map(|row| row.entry.id)
                    .unwrap_or_else(Uuid::new_v4),
                trace_id,
                step: step.clone(),
                state: params.initial_state,
                summary: None,
                output: None,
                attempt: params.attempt,
                idempotency_key: params.idempotency_key,
                created_at: params.created_at,
                updated_at: now,
                approvals: params.approvals,
                subject: params.subject.map(|s| s.persisted()),
            };
            match existing {
                Some(row) => row.entry = entry,
                None => doc.steps.push(StepRow {
                    plan_id,
                    step_id: step.id.clone(),
                    entry,
                }),
            }
        })
        .await
    }

    async fn set_state(
        &self,
        plan_id: &str,
        step_id: &str,
        state: PlanStepState,
        update: StateUpdate,
    ) -> StoreResult<()> {
        let plan_id = plan_id.to_string();
        let step_id = step_id.to_string();
        self.mutate(move |doc| {
            if state.is_terminal() {
                doc.steps
                    .retain(|row| !(row.plan_id == plan_id && row.step_id == step_id));
                return;
            }
            if let Some(row) = doc
                .steps
                .iter_mut()
                .find(|row| row.plan_id == plan_id && row.step_id == step_id)
            {
                row.entry.state = state;
                if update.summary.is_some() {
                    row.entry.summary = update.summary;
                }
                if update.output.is_some() {
                    row.entry.output = update.output;
                }
                if let Some(attempt) = update.attempt {
                    row.entry.attempt = attempt;
                }
                row.entry.updated_at = Utc::now();
            }
        })
        .await
    }

    async fn record_approval(
        &self,
        plan_id: &str,
        step_id: &str,
        capability: &str,
        granted: bool,
    ) -> StoreResult<()> {
        let plan_id = plan_id.to_string();
        let step_id = step_id.to_string();
        let capability = capability.to_string();
        self.mutate(move |doc| {
            if let Some(row) = doc
                .steps
                .iter_mut()
                .find(|row| row.plan_id == plan_id && row.step_id == step_id)
            {
                row.entry.approvals.insert(capability, granted);
                row.entry.updated_at = Utc::now();
            }
        })
        .await
    }

    async fn forget_step(&self, plan_id: &str, step_id: &str) -> StoreResult<()> {
        let plan_id = plan_id.to_string();
        let step_id = step_id.to_string();
        self.mutate(move |doc| {
            doc.steps
                .retain(|row| !(row.plan_id == plan_id && row.step_id == step_id));
        })
        .await
    }

    async fn remember_plan_metadata(
        &self,
        plan_id: &str,
        metadata: &PersistedPlanMetadata,
    ) -> StoreResult<()> {
        let plan_id = plan_id.to_string();
        let mut metadata = metadata.clone();
        metadata.updated_at = Utc::now();
        for step in &mut metadata.steps {
            step.subject = step.subject.take().map(|s| s.persisted());
        }
        self.mutate(move |doc| {
            match doc.plans.iter_mut().find(|row| row.plan_id == plan_id) {
                Some(row) => row.metadata = metadata,
                None => doc.plans.push(PlanRow { plan_id, metadata }),
            }
        })
        .await
    }

    async fn get_plan_metadata(&self, plan_id: &str) -> StoreResult<Option<PersistedPlanMetadata>> {
        let plan_id = plan_id.to_string();
        self.read(move |doc| {
            doc.plans
                .iter()
                .find(|row| row.plan_id == plan_id)
                .map(|row| row.metadata.clone())
        })
        .await
    }

    async fn list_plan_metadata(&self) -> StoreResult<Vec<(String, PersistedPlanMetadata)>> {
        self.read(|doc| {
            doc.plans
                .iter()
                .map(|row| (row.plan_id.clone(), row.metadata.clone()))
                .collect()
        })
        .await
    }

    async fn forget_plan_metadata(&self, plan_id: &str) -> StoreResult<()> {
        let plan_id = plan_id.to_string();
        self.mutate(move |doc| {
            doc.plans.retain(|row| row.plan_id != plan_id);
        })
        .await
    }

    async fn list_active_steps(&self) -> StoreResult<Vec<(String, PersistedStep)>> {
        self.read(|doc| {
            doc.steps
                .iter()
                .filter(|row| !row.entry.state.is_terminal())
                .map(|row| (row.plan_id.clone(), row.entry.clone()))
                .collect()
        })
        .await
    }

    async fn get_entry(&self, plan_id: &str, step_id: &str) -> StoreResult<Option<PersistedStep>> {
        let plan_id = plan_id.to_string();
        let step_id = step_id.to_string();
        self.read(move |doc| {
            doc.steps
                .iter()
                .find(|row| row.plan_id == plan_id && row.step_id == step_id)
                .map(|row| row.entry.clone())
        })
        .await
    }

    async fn clear(&self) -> StoreResult<()> {
        self.mutate(|doc| {
            doc.steps.clear();
            doc.plans.clear();
        })
        .await
    }

    async fn lock_plan(&self, plan_id: &str) -> OwnedMutexGuard<()> {
        self.locks.lock(plan_id).await
    }
}
