//! SSE concurrency quotas.
//!
//! [`SseQuota::acquire`] admits a stream only while both the per-IP and
//! per-subject counters stay under their caps; both checks and both
//! increments happen under one lock, so the caps hold exactly under
//! concurrency. The returned guard releases on drop and is idempotent —
//! every teardown path of a stream can call it safely.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use maestro_kernel::config::SseQuotaSettings;

#[derive(Default)]
struct Counts {
    ips: HashMap<String, u32>,
    subjects: HashMap<String, u32>,
}

/// Concurrent-stream quota manager.
pub struct SseQuota {
    counts: Mutex<Counts>,
    per_ip: u32,
    per_subject: u32,
}

impl SseQuota {
    pub fn new(settings: &SseQuotaSettings) -> Self {
        Self {
            counts: Mutex::new(Counts::default()),
            per_ip: settings.per_ip.max(1),
            per_subject: settings.per_subject.max(1),
        }
    }

    /// Admit a stream for `(ip, subject)`. Returns `None` when either cap
    /// is exhausted.
    pub fn acquire(self: &Arc<Self>, ip: &str, subject: Option<&str>) -> Option<SseQuotaGuard> {
        let mut counts = self.counts.lock();

        let ip_count = counts.ips.get(ip).copied().unwrap_or(0);
        if ip_count >= self.per_ip {
            return None;
        }
        if let Some(subject) = subject {
            let subject_count = counts.subjects.get(subject).copied().unwrap_or(0);
            if subject_count >= self.per_subject {
                return None;
            }
            *counts.subjects.entry(subject.to_string()).or_insert(0) += 1;
        }
        *counts.ips.entry(ip.to_string()).or_insert(0) += 1;

        Some(SseQuotaGuard {
            quota: Arc::clone(self),
            ip: ip.to_string(),
            subject: subject.map(String::from),
            released: AtomicBool::new(false),
        })
    }

    fn release(&self, ip: &str, subject: Option<&str>) {
        let mut counts = self.counts.lock();
        if let Some(count) = counts.ips.get_mut(ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.ips.remove(ip);
            }
        }
        if let Some(subject) = subject {
            if let Some(count) = counts.subjects.get_mut(subject) {
                *count = count.saturating_sub(1);
                if *count == 0 {
                    counts.subjects.remove(subject);
                }
            }
        }
    }

    /// Current stream count for an ip (test hook).
    pub fn ip_count(&self, ip: &str) -> u32 {
        self.counts.lock().ips.get(ip).copied().unwrap_or(0)
    }

    /// Current stream count for a subject (test hook).
    pub fn subject_count(&self, subject: &str) -> u32 {
        self.counts
            .lock()
            .subjects
            .get(subject)
            .copied()
            .unwrap_or(0)
    }
}

/// Held for the lifetime of one admitted stream. Releasing twice is a
/// no-op; dropping releases.
pub struct SseQuotaGuard {
    quota: Arc<SseQuota>,
    ip: String,
    subject: Option<String>,
    released: AtomicBool,
}

impl SseQuotaGuard {
    /// Release the quota slots now instead of at drop.
    pub fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.quota.release(&self.ip, self.subject.as_deref());
    }
}

impl Drop for SseQuotaGuard {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn quota(per_ip: u32, per_subject: u32) -> Arc<SseQuota> {
        Arc::new(SseQuota::new(&SseQuotaSettings { per_ip, per_subject }))
    }

    #[test]
    fn per_ip_cap_is_exact() {
        let quota = quota(2, 10);
        let a = quota.acquire("ip1", None).unwrap();
        let _b = quota.acquire("ip1", None).unwrap();
        assert!(quota.acquire("ip1", None).is_none());
        // A different ip is unaffected.
        assert!(quota.acquire("ip2", None).is_some());

        drop(a);
        assert!(quota.acquire("ip1", None).is_some());
    }

    #[test]
    fn per_subject_cap_spans_ips() {
        let quota = quota(10, 1);
        let _a = quota.acquire("ip1", Some("user-1")).unwrap();
        assert!(quota.acquire("ip2", Some("user-1")).is_none());
        assert!(quota.acquire("ip2", Some("user-2")).is_some());
    }

    #[test]
    fn denied_acquire_leaks_nothing() {
        let quota = quota(1, 1);
        let _a = quota.acquire("ip1", Some("user-1")).unwrap();
        // Denied on subject: the ip counter must not have been bumped.
        assert!(quota.acquire("ip2", Some("user-1")).is_none());
        assert_eq!(quota.ip_count("ip2"), 0);
    }

    #[test]
    fn release_is_idempotent() {
        let quota = quota(1, 1);
        let guard = quota.acquire("ip1", Some("user-1")).unwrap();
        guard.release();
        guard.release();
        drop(guard);
        assert_eq!(quota.ip_count("ip1"), 0);
        assert_eq!(quota.subject_count("user-1"), 0);
        assert!(quota.acquire("ip1", Some("user-1")).is_some());
    }

    #[test]
    fn concurrent_acquires_never_exceed_caps() {
        let quota = quota(4, 8);
        let mut handles = Vec::new();
        for _ in 0..16 {
            let quota = Arc::clone(&quota);
            // Guards are sent back so they outlive the racing threads.
            handles.push(std::thread::spawn(move || quota.acquire("ip1", Some("user-1"))));
        }
        let guards: Vec<_> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(guards.len(), 4);
        assert_eq!(quota.ip_count("ip1"), 4);
        drop(guards);
        assert_eq!(quota.ip_count("ip1"), 0);
    }
}
