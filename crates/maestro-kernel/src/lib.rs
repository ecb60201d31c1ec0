//! Maestro kernel — the domain core of the plan orchestrator.
//!
//! This crate carries everything the runtime and gateway share: the plan and
//! step domain model, the authenticated [`Subject`](subject::Subject) and its
//! matching rules, the in-process [`PlanEventBus`](bus::PlanEventBus), the
//! idempotency-key [`DedupStore`](dedup::DedupStore), the durable
//! [`PlanStateStore`](store::PlanStateStore), the capability
//! [`policy`](policy) enforcer, and typed [`config`](config) loading.
//!
//! Nothing in here touches a socket or a broker; transports live in
//! `maestro-runtime` and the HTTP surface in `maestro-gateway`.

pub mod audit;
pub mod bus;
pub mod config;
pub mod dedup;
pub mod error;
pub mod plan;
pub mod policy;
pub mod session;
pub mod store;
pub mod subject;

pub use bus::{BusMetrics, PlanEventBus, PlanStepEvent};
pub use dedup::{DedupStore, MemoryDedup};
pub use error::{KernelError, KernelResult};
pub use plan::{Plan, PlanId, PlanStep, PlanStepState};
pub use policy::{CapabilityPolicy, Decision, DenyReason, RulePolicy};
pub use session::{SessionRecord, SessionStore};
pub use store::{PersistedPlanMetadata, PersistedStep, PlanStateStore};
pub use subject::{subjects_match, Subject};
