//! Capped exponential backoff with optional jitter.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::config::humantime_serde;

/// Backoff schedule shared by ledger resubscription and webhook retries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Backoff {
    /// Delay before the first retry
    #[serde(with = "humantime_serde")]
    pub initial: Duration,
    /// Ceiling for exponential growth
    #[serde(with = "humantime_serde")]
    pub max: Duration,
    /// Growth factor per retry
    pub multiplier: f64,
    /// Random spread of `±jitter_fraction * delay` (0.0 = deterministic)
    pub jitter_fraction: f64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(500),
            max: Duration::from_secs(30),
            multiplier: 2.0,
            jitter_fraction: 0.0,
        }
    }
}

impl Backoff {
    /// Delay before the `retry`-th retry (1-based).
    pub fn delay(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(63) as i32;
        let base_ms = self.initial.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = base_ms.min(self.max.as_millis() as f64);

        let jittered = if self.jitter_fraction > 0.0 {
            let spread = capped * self.jitter_fraction;
            capped + rand::thread_rng().gen_range(-spread..=spread)
        } else {
            capped
        };

        Duration::from_millis(jittered.max(0.0) as u64)
    }
}
