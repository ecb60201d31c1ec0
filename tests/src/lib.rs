//! Test harness: a fully wired gateway over in-memory backends.

use axum::body::Body;
use axum::http::{header, Request, Response};
use axum::Router;
use prometheus::Registry;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tower::ServiceExt;

use maestro_gateway::backend::{SingleStepPlanner, UnroutedChat};
use maestro_gateway::middleware::{MemoryRateLimitBackend, RateLimitManager};
use maestro_gateway::sse::SseQuota;
use maestro_gateway::{build_router, AppState};
use maestro_kernel::bus::{BusConfig, PlanEventBus};
use maestro_kernel::config::MaestroConfig;
use maestro_kernel::dedup::MemoryDedup;
use maestro_kernel::policy::RulePolicy;
use maestro_kernel::session::{SessionRecord, SessionStore};
use maestro_kernel::store::FileStateStore;
use maestro_runtime::queue::{MemoryQueue, QueueMetrics};
use maestro_runtime::tool::EchoToolAgent;
use maestro_runtime::{BackoffPolicy, PlanRuntime, RuntimeOptions};

/// A wired gateway plus handles the scenarios poke at directly.
pub struct TestApp {
    pub router: Router,
    pub state: Arc<AppState>,
    pub queue: Arc<MemoryQueue>,
    pub dedup: Arc<MemoryDedup>,
    _dir: tempfile::TempDir,
}

/// Build a gateway over memory backends, applying `configure` to the
/// default configuration first.
pub async fn test_app(configure: impl FnOnce(&mut MaestroConfig)) -> TestApp {
    let mut cfg = MaestroConfig::default();
    configure(&mut cfg);
    let cfg = Arc::new(cfg);

    let dir = tempfile::tempdir().unwrap();
    let dedup = Arc::new(MemoryDedup::new());
    let registry = Registry::new();
    let metrics = QueueMetrics::register(&registry, "memory", "default").unwrap();
    let queue = Arc::new(MemoryQueue::new(
        dedup.clone(),
        metrics,
        cfg.runtime.max_attempts,
    ));
    let store = Arc::new(FileStateStore::new(dir.path().join("state.json")));
    let bus = PlanEventBus::with_config(BusConfig {
        history_limit: cfg.runtime.event_history_limit,
        subscriber_buffer: cfg.runtime.subscriber_buffer,
    });
    let policy = Arc::new(RulePolicy::development());

    let runtime = PlanRuntime::new(
        queue.clone(),
        store,
        dedup.clone(),
        bus,
        policy.clone(),
        Arc::new(EchoToolAgent),
        RuntimeOptions {
            max_attempts: cfg.runtime.max_attempts,
            backoff: BackoffPolicy::new(10, 100, false),
            ..Default::default()
        },
    );
    runtime.start().await.unwrap();

    let state = Arc::new(AppState {
        runtime,
        queue: queue.clone(),
        sessions: Arc::new(SessionStore::new(cfg.auth.oidc.session.ttl_seconds)),
        policy,
        rate_limiter: Arc::new(RateLimitManager::new(
            Arc::new(MemoryRateLimitBackend::new()),
            cfg.server.rate_limits.clone(),
        )),
        sse_quota: Arc::new(SseQuota::new(&cfg.server.sse_quotas)),
        planner: Arc::new(SingleStepPlanner),
        chat: Arc::new(UnroutedChat),
        registry,
        config: cfg,
        started_at: Instant::now(),
    });

    TestApp {
        router: build_router(state.clone()),
        state,
        queue,
        dedup,
        _dir: dir,
    }
}

impl TestApp {
    /// Register a session and return its bearer id.
    pub fn session(&self, user: &str, tenant: &str, email: Option<&str>) -> String {
        let record = SessionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            subject: user.to_string(),
            email: email.map(String::from),
            name: None,
            tenant_id: Some(tenant.to_string()),
            roles: BTreeSet::new(),
            scopes: BTreeSet::new(),
            claims: Value::Null,
            expires_at: chrono::Utc::now() + chrono::Duration::hours(1),
        };
        let id = record.id.clone();
        self.state.sessions.insert(record);
        id
    }

    /// Issue one request against a clone of the router.
    pub async fn request(&self, request: Request<Body>) -> Response<Body> {
        self.router.clone().oneshot(request).await.unwrap()
    }
}

/// POST with a JSON body and optional bearer session.
pub fn post_json(path: &str, body: &Value, bearer: Option<&str>) -> Request<Body> {
    let mut builder = Request::post(path).header(header::CONTENT_TYPE, "application/json");
    if let Some(bearer) = bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {bearer}"));
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

/// GET with optional bearer session and Accept header.
pub fn get(path: &str, bearer: Option<&str>, accept: Option<&str>) -> Request<Body> {
    let mut builder = Request::get(path);
    if let Some(bearer) = bearer {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {bearer}"));
    }
    if let Some(accept) = accept {
        builder = builder.header(header::ACCEPT, accept);
    }
    builder.body(Body::empty()).unwrap()
}

/// Read a complete (non-streaming) response body as JSON.
pub async fn body_json(response: Response<Body>) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&bytes).unwrap()
}
