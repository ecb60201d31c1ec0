//! Shared application state injected into every handler.

use prometheus::Registry;
use std::sync::Arc;
use std::time::Instant;

use crate::backend::{ChatRouter, GoalPlanner};
use crate::middleware::RateLimitManager;
use crate::sse::SseQuota;
use maestro_kernel::config::MaestroConfig;
use maestro_kernel::policy::CapabilityPolicy;
use maestro_kernel::session::SessionStore;
use maestro_runtime::queue::QueueAdapter;
use maestro_runtime::PlanRuntime;

/// State shared across all request handlers.
pub struct AppState {
    /// The plan queue runtime (submits, approvals, event bus access).
    pub runtime: PlanRuntime,
    /// Broker adapter, used directly for readiness and depth probes.
    pub queue: Arc<dyn QueueAdapter>,
    /// Session records keyed by session id.
    pub sessions: Arc<SessionStore>,
    /// Capability policy enforcer.
    pub policy: Arc<dyn CapabilityPolicy>,
    /// Per-endpoint rate limiting.
    pub rate_limiter: Arc<RateLimitManager>,
    /// Concurrent SSE stream quotas.
    pub sse_quota: Arc<SseQuota>,
    /// Goal-to-steps planner seam.
    pub planner: Arc<dyn GoalPlanner>,
    /// Chat-routing provider seam.
    pub chat: Arc<dyn ChatRouter>,
    /// Prometheus registry backing `GET /metrics`.
    pub registry: Registry,
    /// Loaded configuration.
    pub config: Arc<MaestroConfig>,
    /// Process start, for readiness uptime reporting.
    pub started_at: Instant,
}

impl AppState {
    /// Whether requests must carry an authenticated session.
    pub fn oidc_enabled(&self) -> bool {
        self.config.auth.oidc.enabled
    }
}
