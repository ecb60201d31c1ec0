//! Idempotency-key reservation for broker deliveries.
//!
//! A key (`<plan_id>:<step_id>`, completions prefixed `complete:`) is
//! reserved from the moment the queue adapter accepts a message until the
//! message is acknowledged or dead-lettered. Retry republishes reuse the
//! same key with dedup bypassed, so a reservation tracks the *logical* step,
//! not an individual delivery.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

/// Cluster- or process-wide set of in-flight idempotency keys.
///
/// Implementations must make `try_reserve` atomic: no caller may ever
/// observe a partially reserved key.
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Reserve `key`. Returns `false` if it is already held.
    async fn try_reserve(&self, key: &str) -> bool;

    /// Release `key`. Releasing an unreserved key is a no-op.
    async fn release(&self, key: &str);

    /// Whether `key` is currently reserved.
    async fn is_reserved(&self, key: &str) -> bool;
}

/// Process-local dedup backend.
///
/// Entries optionally expire after `ttl` as a safety net against leaked
/// reservations (a crashed worker that never acked). Expiry is enforced
/// both opportunistically on access and by [`sweep`](Self::sweep).
pub struct MemoryDedup {
    keys: DashMap<String, Option<Instant>>,
    ttl: Option<Duration>,
}

impl MemoryDedup {
    /// Backend with no expiry; reservations live until released.
    pub fn new() -> Self {
        Self {
            keys: DashMap::new(),
            ttl: None,
        }
    }

    /// Backend whose reservations lapse after `ttl`.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            keys: DashMap::new(),
            ttl: Some(ttl),
        }
    }

    /// Remove expired reservations. Returns the number removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let before = self.keys.len();
        self.keys
            .retain(|_, expiry| expiry.map(|at| at > now).unwrap_or(true));
        before.saturating_sub(self.keys.len())
    }

    /// Spawn a background task sweeping expired reservations every
    /// `interval`. The task exits when the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tick.tick().await;
                let Some(store) = weak.upgrade() else { break };
                let removed = store.sweep();
                if removed > 0 {
                    trace!(removed, "swept expired dedup reservations");
                }
            }
        })
    }

    fn expired(&self, expiry: &Option<Instant>) -> bool {
        expiry.map(|at| at <= Instant::now()).unwrap_or(false)
    }

    /// Number of live reservations (test hook).
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Whether no reservations are held.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl Default for MemoryDedup {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DedupStore for MemoryDedup {
    async fn try_reserve(&self, key: &str) -> bool {
        let expiry = self.ttl.map(|ttl| Instant::now() + ttl);
        match self.keys.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if self.expired(occupied.get()) {
                    occupied.insert(expiry);
                    true
                } else {
                    false
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(expiry);
                true
            }
        }
    }

    async fn release(&self, key: &str) {
        self.keys.remove(key);
    }

    async fn is_reserved(&self, key: &str) -> bool {
        match self.keys.get(key) {
            Some(entry) => !self.expired(entry.value()),
            None => false,
        }
    }
}
