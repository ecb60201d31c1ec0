//! Maestro gateway — entry point.
//!
//! Loads configuration (path from `MAESTRO_CONFIG` or the first CLI
//! argument, defaults when absent), wires the queue adapter, state store,
//! dedup service, event bus and runtime, recovers the active step set,
//! and serves HTTP until shutdown. Exits `0` on graceful shutdown and
//! non-zero on fatal configuration errors.

use prometheus::Registry;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use maestro_gateway::backend::{SingleStepPlanner, UnroutedChat};
use maestro_gateway::middleware::{MemoryRateLimitBackend, RateLimitManager};
use maestro_gateway::sse::SseQuota;
use maestro_gateway::{serve, AppState};
use maestro_kernel::bus::{BusConfig, PlanEventBus};
use maestro_kernel::config::{
    self, KvProvider, MaestroConfig, MessagingKind, PlanStateBackend, RunMode,
};
use maestro_kernel::dedup::{DedupStore, MemoryDedup};
use maestro_kernel::policy::{CapabilityPolicy, RulePolicy};
use maestro_kernel::session::SessionStore;
use maestro_kernel::store::{FileStateStore, PlanStateStore};
use maestro_runtime::queue::{MemoryQueue, QueueAdapter, QueueMetrics};
use maestro_runtime::{BackoffPolicy, PlanRuntime, RuntimeOptions};

fn load_config() -> Result<MaestroConfig, config::ConfigError> {
    let path = std::env::var("MAESTRO_CONFIG")
        .ok()
        .or_else(|| std::env::args().nth(1));
    match path {
        Some(path) => config::load(&path),
        None => {
            let defaults = MaestroConfig::default();
            defaults.validate()?;
            Ok(defaults)
        }
    }
}

fn build_queue(
    cfg: &MaestroConfig,
    dedup: Arc<dyn DedupStore>,
    metrics: QueueMetrics,
) -> Result<Arc<dyn QueueAdapter>, config::ConfigError> {
    match cfg.messaging.kind {
        MessagingKind::Memory => Ok(Arc::new(MemoryQueue::new(
            dedup,
            metrics,
            cfg.runtime.max_attempts,
        ))),
        #[cfg(feature = "amqp")]
        MessagingKind::Amqp => Ok(Arc::new(maestro_runtime::queue::amqp::AmqpQueue::new(
            cfg.messaging.amqp.clone(),
            dedup,
            metrics,
            cfg.runtime.max_attempts,
        ))),
        #[cfg(not(feature = "amqp"))]
        MessagingKind::Amqp => Err(config::ConfigError::Invalid(
            "messaging.type = amqp requires a build with the `amqp` feature".to_string(),
        )),
        #[cfg(feature = "kafka")]
        MessagingKind::LogBased => Ok(Arc::new(maestro_runtime::queue::kafka::KafkaQueue::new(
            cfg.messaging.log_based.clone(),
            dedup,
            metrics,
            cfg.runtime.max_attempts,
        ))),
        #[cfg(not(feature = "kafka"))]
        MessagingKind::LogBased => Err(config::ConfigError::Invalid(
            "messaging.type = log_based requires a build with the `kafka` feature".to_string(),
        )),
    }
}

async fn build_store(cfg: &MaestroConfig) -> anyhow::Result<Arc<dyn PlanStateStore>> {
    match cfg.plan_state.backend {
        PlanStateBackend::File => Ok(Arc::new(
            FileStateStore::new(&cfg.plan_state.path)
                .with_retention_ms(cfg.plan_state.retention_ms),
        )),
        #[cfg(feature = "postgres")]
        PlanStateBackend::Postgres => {
            let pool = sqlx::postgres::PgPool::connect(&cfg.plan_state.path).await?;
            let store = maestro_kernel::store::postgres::PostgresStateStore::new(pool)
                .with_retention_ms(cfg.plan_state.retention_ms);
            store.migrate().await?;
            Ok(Arc::new(store))
        }
        #[cfg(not(feature = "postgres"))]
        PlanStateBackend::Postgres => Err(config::ConfigError::Invalid(
            "plan_state.backend = postgres requires a build with the `postgres` feature"
                .to_string(),
        )
        .into()),
    }
}

async fn run() -> anyhow::Result<()> {
    let cfg = load_config()?;
    let cfg = Arc::new(cfg);

    if cfg.dedupe.provider == KvProvider::SharedKv {
        return Err(config::ConfigError::Invalid(
            "dedupe.provider = shared_kv requires an injected backend".to_string(),
        )
        .into());
    }
    if cfg.server.rate_limits.backend.provider == KvProvider::SharedKv {
        return Err(config::ConfigError::Invalid(
            "server.rate_limits.backend.provider = shared_kv requires an injected backend"
                .to_string(),
        )
        .into());
    }

    let registry = Registry::new();
    let tenant = cfg.messaging.log_based.tenant_label.clone();
    let transport = match cfg.messaging.kind {
        MessagingKind::Amqp => "amqp",
        MessagingKind::LogBased => "kafka",
        MessagingKind::Memory => "memory",
    };
    let metrics = QueueMetrics::register(&registry, transport, tenant)?;

    let dedup: Arc<MemoryDedup> = if cfg.dedupe.ttl_ms > 0 {
        Arc::new(MemoryDedup::with_ttl(std::time::Duration::from_millis(
            cfg.dedupe.ttl_ms,
        )))
    } else {
        Arc::new(MemoryDedup::new())
    };
    dedup.spawn_sweeper(std::time::Duration::from_secs(60));

    let queue = build_queue(&cfg, dedup.clone(), metrics)?;
    queue
        .connect()
        .await
        .map_err(|err| anyhow::anyhow!("broker connect failed: {err}"))?;

    let store = build_store(&cfg).await?;
    let bus = PlanEventBus::with_config(BusConfig {
        history_limit: cfg.runtime.event_history_limit,
        subscriber_buffer: cfg.runtime.subscriber_buffer,
    });
    let policy: Arc<dyn CapabilityPolicy> = match cfg.run_mode {
        RunMode::Enterprise => Arc::new(RulePolicy::enterprise()),
        RunMode::Development => Arc::new(RulePolicy::development()),
    };

    let runtime = PlanRuntime::new(
        queue.clone(),
        store,
        dedup,
        bus,
        policy.clone(),
        Arc::new(maestro_runtime::tool::EchoToolAgent),
        RuntimeOptions {
            max_attempts: cfg.runtime.max_attempts,
            backoff: BackoffPolicy::from_settings(&cfg.runtime.backoff),
            ..Default::default()
        },
    );
    runtime.start().await?;
    let requeued = runtime.recover().await?;
    if requeued > 0 {
        info!(requeued, "recovered in-flight steps");
    }

    let state = Arc::new(AppState {
        runtime,
        queue,
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

    serve(state).await
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(%err, "fatal error");
            ExitCode::FAILURE
        }
    }
}
