//! Sliding-window rate limiting.
//!
//! Buckets are keyed per endpoint × caller. The caller identity is
//! `subject_id | agent_name | ip`, first available; the manager evaluates
//! the identity bucket then the ip bucket, and the first denying bucket
//! wins with a `retryAfterMs` hint. The backend is a seam: the in-memory
//! implementation keeps true sliding windows of accept timestamps, and a
//! shared-KV backend can be injected for multi-node deployments.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

use crate::error::ApiError;
use maestro_kernel::config::{RateLimitRule, RateLimitSettings};

/// Outcome of one bucket evaluation.
#[derive(Debug, Clone, Copy)]
pub struct RateOutcome {
    pub allowed: bool,
    pub retry_after_ms: u64,
}

/// Pluggable rate-limit counter storage.
pub trait RateLimitBackend: Send + Sync {
    /// Record a hit against `key` under `rule` and report the verdict.
    fn hit(&self, key: &str, rule: RateLimitRule) -> RateOutcome;
}

/// In-memory sliding-window backend.
///
/// Keeps the accept timestamps per key; a request is allowed while fewer
/// than `max_requests` accepts fall inside the trailing window. Denials
/// are not recorded, so a caller that backs off recovers exactly when the
/// oldest accept leaves the window.
#[derive(Default)]
pub struct MemoryRateLimitBackend {
    windows: DashMap<String, VecDeque<Instant>>,
}

impl MemoryRateLimitBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop windows with no recent activity. Call periodically from a
    /// background task to bound memory.
    pub fn gc(&self, max_idle: Duration) {
        let now = Instant::now();
        self.windows.retain(|_, window| {
            window
                .back()
                .map(|last| now.duration_since(*last) < max_idle)
                .unwrap_or(false)
        });
    }
}

impl RateLimitBackend for MemoryRateLimitBackend {
    fn hit(&self, key: &str, rule: RateLimitRule) -> RateOutcome {
        let now = Instant::now();
        let window = Duration::from_millis(rule.window_ms);
        let mut entry = self.windows.entry(key.to_string()).or_default();

        while let Some(oldest) = entry.front() {
            if now.duration_since(*oldest) >= window {
                entry.pop_front();
            } else {
                break;
            }
        }

        if entry.len() < rule.max_requests as usize {
            entry.push_back(now);
            RateOutcome {
                allowed: true,
                retry_after_ms: 0,
            }
        } else {
            let retry_after = entry
                .front()
                .map(|oldest| window.saturating_sub(now.duration_since(*oldest)))
                .unwrap_or(window);
            RateOutcome {
                allowed: false,
                retry_after_ms: retry_after.as_millis() as u64,
            }
        }
    }
}

/// Endpoint family a request is billed against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointBucket {
    Plan,
    Chat,
    Auth,
    RemoteFs,
}

impl EndpointBucket {
    fn as_str(self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Chat => "chat",
            Self::Auth => "auth",
            Self::RemoteFs => "remote_fs",
        }
    }

    fn rule(self, settings: &RateLimitSettings) -> RateLimitRule {
        match self {
            Self::Plan => settings.plan,
            Self::Chat => settings.chat,
            Self::Auth => settings.auth,
            Self::RemoteFs => settings.remote_fs,
        }
    }
}

/// Evaluates the `[identity, ip]` bucket pair for an endpoint.
pub struct RateLimitManager {
    backend: Arc<dyn RateLimitBackend>,
    settings: RateLimitSettings,
}

impl RateLimitManager {
    pub fn new(backend: Arc<dyn RateLimitBackend>, settings: RateLimitSettings) -> Self {
        Self { backend, settings }
    }

    /// Gate one request. `identity` is the caller's subject or agent name
    /// when known; `ip` is always present.
    pub fn check(
        &self,
        bucket: EndpointBucket,
        identity: Option<&str>,
        ip: &str,
    ) -> Result<(), ApiError> {
        let rule = bucket.rule(&self.settings);

        // Identity falls back to the ip; avoid double-billing that case.
        let identity = identity.filter(|id| *id != ip);

        if let Some(identity) = identity {
            let key = format!("{}:id:{identity}", bucket.as_str());
            let outcome = self.backend.hit(&key, rule);
            if !outcome.allowed {
                warn!(bucket = bucket.as_str(), "identity rate limit exceeded");
                return Err(ApiError::TooManyRequests {
                    retry_after_ms: Some(outcome.retry_after_ms),
                });
            }
        }

        let key = format!("{}:ip:{ip}", bucket.as_str());
        let outcome = self.backend.hit(&key, rule);
        if !outcome.allowed {
            warn!(bucket = bucket.as_str(), "ip rate limit exceeded");
            return Err(ApiError::TooManyRequests {
                retry_after_ms: Some(outcome.retry_after_ms),
            });
        }
        Ok(())
    }
}
