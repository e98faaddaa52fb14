//! Backoff with jitter for re-delivering failed reconcile keys.
//!
//! Reconcilers never retry internally. When a pass fails, the work queue
//! asks this module how long to wait before handing the key back.

use std::time::Duration;

use rand::Rng;

/// Configuration for re-delivery of failed keys.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based), without jitter
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }

    /// Delay before retry number `attempt`, with 0.5x to 1.5x jitter so that
    /// keys failing together do not come back together. Never above `max_delay`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        let secs = self.base_delay(attempt).as_secs_f64() * jitter;
        Duration::from_secs_f64(secs.min(self.max_delay.as_secs_f64()))
    }
}
