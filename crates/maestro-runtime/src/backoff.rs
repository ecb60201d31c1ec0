//! Retry backoff policy.
//!
//! The curve is exponential with an optional jitter, capped at a configured
//! maximum. The parameters are configuration, not constants — operators
//! tune the retry envelope per deployment.

use rand::Rng;
use std::time::Duration;

use maestro_kernel::config::BackoffSettings;

/// Exponential backoff with optional jitter.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    base_ms: u64,
    max_ms: u64,
    jitter: bool,
}

impl BackoffPolicy {
    /// Build a policy from its raw parameters.
    pub fn new(base_ms: u64, max_ms: u64, jitter: bool) -> Self {
        Self {
            base_ms: base_ms.max(1),
            max_ms: max_ms.max(1),
            jitter,
        }
    }

    /// Build a policy from configuration.
    pub fn from_settings(settings: &BackoffSettings) -> Self {
        Self::new(settings.base_ms, settings.max_ms, settings.jitter)
    }

    /// Delay before retrying the given attempt (0-indexed).
    ///
    /// With jitter enabled the delay is uniform in \[75%, 100%\] of the
    /// capped exponential value, avoiding correlated retries.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = 1u64
            .checked_shl(attempt)
            .and_then(|s| self.base_ms.checked_mul(s))
            .unwrap_or(self.max_ms);
        let capped = exp.min(self.max_ms);
        let ms = if self.jitter {
            let min_delay = capped.saturating_mul(3) / 4;
            rand::thread_rng().gen_range(min_delay..=capped)
        } else {
            capped
        };
        Duration::from_millis(ms)
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::from_settings(&BackoffSettings::default())
    }
}
