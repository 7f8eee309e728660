//! Reusable retry-with-backoff policy.

use std::future::Future;
use std::time::Duration;

use conductor_core::config::SpawnConfig;
use rand::RngExt;
use tracing::debug;

/// Exponential backoff with bounded random jitter.
///
/// Attempt `n` (1-based) waits `base_delay * 2^(n-1)` plus a random amount in
/// `[0, jitter_cap]` before the next try. The first attempt runs immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub jitter_cap: Duration,
}

/// Exponent ceiling so the shift below cannot overflow.
const MAX_BACKOFF_SHIFT: u32 = 16;

impl RetryPolicy {
    pub const fn new(max_attempts: u32, base_delay: Duration, jitter_cap: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            jitter_cap,
        }
    }

    /// Single attempt, no waiting.
    pub const fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    pub const fn from_config(config: &SpawnConfig) -> Self {
        Self::new(
            config.retry_max_attempts,
            Duration::from_millis(config.retry_base_delay_ms),
            Duration::from_millis(config.retry_jitter_cap_ms),
        )
    }

    /// Deterministic part of the delay after `attempt` failed.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(MAX_BACKOFF_SHIFT);
        self.base_delay.saturating_mul(1_u32 << shift)
    }

    /// Backoff plus random jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let cap = u64::try_from(self.jitter_cap.as_millis()).unwrap_or(u64::MAX);
        let jitter = if cap == 0 {
            0
        } else {
            rand::rng().random_range(0..=cap)
        };
        self.backoff(attempt)
            .saturating_add(Duration::from_millis(jitter))
    }

    /// Run `op` until it succeeds or `max_attempts` is reached.
    ///
    /// `op` receives the 1-based attempt number. The last error is returned.
    pub async fn retry<T, E, F, Fut>(&self, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(err) if attempt >= attempts => return Err(err),
                Err(_) => {
                    let delay = self.delay_for(attempt);
                    debug!(attempt, delay_ms = delay.as_millis(), "Retrying after backoff");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SpawnConfig::default())
    }
}
