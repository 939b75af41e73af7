use rand::Rng;
use std::time::Duration;

use crate::config::{ProviderConfig, RetryConfig};

/// Backoff and timeout policy for provider calls
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Total calls per batch, including the first
    pub max_attempts: u32,
    /// Bound on a single call, separate from the backoff
    pub call_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(retry: &RetryConfig, provider: &ProviderConfig) -> Self {
        Self {
            initial_backoff: Duration::from_millis(retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(retry.max_backoff_ms),
            max_attempts: retry.max_attempts.max(1),
            call_timeout: provider.timeout(),
        }
    }

    /// Delay before the call following failed call number `attempt` (1-based).
    /// Exponential, capped, with up to 10% jitter.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff);

        let jitter_ms = (base.as_millis() / 10) as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
        } else {
            Duration::ZERO
        };

        (base + jitter).min(self.max_backoff)
    }

    /// Upper bound on one settle: every call times out and every backoff hits the cap
    pub fn worst_case(&self) -> Duration {
        let calls = self.max_attempts.max(1);
        self.call_timeout.saturating_mul(calls) + self.max_backoff.saturating_mul(calls - 1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default(), &ProviderConfig::default())
    }
}
