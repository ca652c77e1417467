use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Bounded retry schedule for a flow's steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries after the first attempt; a step is dispatched at most `max_retries + 1` times.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Double the delay on every further retry.
    #[serde(default = "default_exponential")]
    pub exponential_backoff: bool,
    /// Upper bound for any single delay.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}
fn default_base_delay_ms() -> u64 {
    1_000
}
fn default_exponential() -> bool {
    true
}
fn default_max_delay_ms() -> u64 {
    60_000
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            exponential_backoff: default_exponential(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn new(max_retries: u32, base_delay: Duration, exponential_backoff: bool) -> Self {
        Self {
            max_retries,
            base_delay_ms: u64::try_from(base_delay.as_millis()).unwrap_or(u64::MAX),
            exponential_backoff,
            max_delay_ms: default_max_delay_ms(),
        }
    }

    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Whether another attempt is allowed after `failed_attempts` failures.
    pub fn allows_retry(&self, failed_attempts: u32) -> bool {
        failed_attempts <= self.max_retries
    }

    /// Delay before retry number `retry` (0 for the first retry).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = if self.exponential_backoff {
            2u64.checked_pow(retry).unwrap_or(u64::MAX)
        } else {
            1
        };
        let ms = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(ms)
    }
}
