use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_RETRY_BASE_MS: u64 = 1_000;
pub const DEFAULT_RETRY_MAX_MS: u64 = 600_000;
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
/// Reconnect policy shared by both transports. `max_attempts == 0` retries forever.
pub struct RetryPolicy {
    pub base_ms: u64,
    pub max_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_ms: DEFAULT_RETRY_BASE_MS,
            max_ms: DEFAULT_RETRY_MAX_MS,
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// One scheduled reconnect: how long to wait and what the next backoff will be.
pub struct ReconnectSchedule {
    pub delay: Duration,
    pub attempt: u32,
    pub next_backoff_ms: u64,
}

#[derive(Debug, Clone)]
/// Exponential backoff state; reset on every successful ready transition.
pub struct ReconnectBackoff {
    policy: RetryPolicy,
    backoff_ms: u64,
    attempts: u32,
}

impl ReconnectBackoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            backoff_ms: policy.base_ms,
            attempts: 0,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub fn reset(&mut self) {
        self.backoff_ms = self.policy.base_ms;
        self.attempts = 0;
    }

    /// Advances the schedule, or returns `None` once a positive attempt cap is reached.
    pub fn next_delay(&mut self) -> Option<ReconnectSchedule> {
        if self.policy.max_attempts > 0 && self.attempts >= self.policy.max_attempts {
            return None;
        }
        let delay_ms = self.backoff_ms.min(self.policy.max_ms);
        let next_backoff_ms = self.backoff_ms.saturating_mul(2).min(self.policy.max_ms);
        self.attempts = self.attempts.saturating_add(1);
        self.backoff_ms = next_backoff_ms;
        Some(ReconnectSchedule {
            delay: Duration::from_millis(delay_ms),
            attempt: self.attempts,
            next_backoff_ms,
        })
    }
}
