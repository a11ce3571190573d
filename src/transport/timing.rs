//! Ping estimation and the intervals derived from it.

use std::time::Duration;

use crate::core::constants::{
    BUNDLE_LIFETIME_PING_MULTIPLIER, MIN_BUNDLE_LIFETIME, MIN_RESEND_INTERVAL, PING_SMOOTHING,
};

/// Smoothed round-trip time.
///
/// Samples are folded in with an exponentially weighted moving average:
/// `ping = 0.2 * sample + 0.8 * ping`. The first sample seeds the average.
#[derive(Debug, Clone, Copy, Default)]
pub struct PingEstimator {
    /// Smoothed ping in milliseconds.
    ping_ms: f64,
    /// Whether the first sample has arrived.
    initialized: bool,
}

impl PingEstimator {
    /// Create an estimator with no samples.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in a new round-trip sample.
    pub fn update(&mut self, sample: Duration) {
        let sample_ms = sample.as_secs_f64() * 1000.0;
        if self.initialized {
            self.ping_ms = PING_SMOOTHING * sample_ms + (1.0 - PING_SMOOTHING) * self.ping_ms;
        } else {
            self.ping_ms = sample_ms;
            self.initialized = true;
        }
    }

    /// Current smoothed ping.
    pub fn ping(&self) -> Duration {
        Duration::from_secs_f64(self.ping_ms / 1000.0)
    }

    /// Current smoothed ping in milliseconds.
    pub fn ping_ms(&self) -> f64 {
        self.ping_ms
    }

    /// Check if at least one sample has been folded in.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Age after which an unacknowledged reliable segment is resent.
    pub fn resend_interval(&self, multiplier: f32) -> Duration {
        self.ping()
            .mul_f64(f64::from(multiplier.max(0.0)))
            .max(MIN_RESEND_INTERVAL)
    }

    /// Age after which an unacknowledged bundle is counted as lost.
    pub fn bundle_lifetime(&self) -> Duration {
        self.ping()
            .mul_f64(BUNDLE_LIFETIME_PING_MULTIPLIER)
            .max(MIN_BUNDLE_LIFETIME)
    }
}
