//! Retry delays for transient replay failures.

use rand::Rng;
use std::time::Duration;

/// Exponential backoff with optional jitter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_ms: u64,
    pub max_ms: u64,
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn new(base_ms: u64, max_ms: u64, jitter: bool) -> Self {
        Self {
            base_ms,
            max_ms,
            jitter,
        }
    }

    /// Delay without jitter: `min(max, base * 2^(retry_count - 1))`.
    pub fn base_delay_ms(&self, retry_count: u32) -> u64 {
        let exponent = retry_count.saturating_sub(1);
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        self.base_ms.saturating_mul(factor).min(self.max_ms)
    }

    /// Delay before retry number `retry_count` (1-based), with up to 20%
    /// random jitter added on top when enabled.
    pub fn delay(&self, retry_count: u32) -> Duration {
        let base = self.base_delay_ms(retry_count);
        let jitter = if self.jitter && base >= 5 {
            rand::thread_rng().gen_range(0..=base / 5)
        } else {
            0
        };
        Duration::from_millis(base.saturating_add(jitter))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(1_000, 60_000, true)
    }
}
