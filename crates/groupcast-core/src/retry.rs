//! Backoff schedule shared by publish retries and topic resubscription.
//!
//! Pure arithmetic: callers own the sleep loop and pass in their own random
//! sample, which keeps the schedule deterministic under test.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff with symmetric jitter.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    /// Retries allowed after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry, in ms. Doubles per attempt.
    pub base_delay_ms: u64,
    /// Ceiling applied before jitter, in ms.
    pub max_delay_ms: u64,
    /// Fractional spread around the delay, `0.0..=1.0`.
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 50,
            max_delay_ms: 5_000,
            jitter_factor: 0.2,
        }
    }
}

impl RetryConfig {
    /// Delay before retry `attempt` (zero-based).
    ///
    /// `random` is a sample from `[0.0, 1.0)`; `0.5` yields the exact
    /// un-jittered delay.
    #[must_use]
    #[allow(
        clippy::cast_precision_loss,
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss
    )]
    pub fn delay_for(&self, attempt: u32, random: f64) -> Duration {
        let shift = attempt.min(31);
        let ms = self
            .base_delay_ms
            .checked_shl(shift)
            .filter(|ms| ms >> shift == self.base_delay_ms)
            .unwrap_or(u64::MAX)
            .min(self.max_delay_ms);
        let spread = self.jitter_factor.clamp(0.0, 1.0) * (2.0 * random - 1.0);
        Duration::from_millis(((ms as f64) * (1.0 + spread)).round().max(0.0) as u64)
    }

    /// Whether another retry is allowed after `attempt` retries.
    #[must_use]
    pub fn allows(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}
