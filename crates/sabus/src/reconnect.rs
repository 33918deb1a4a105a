//! Reconnect backoff.

use std::time::Duration;

/// Capped exponential backoff between connection attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first retry
    pub initial: Duration,
    /// Upper bound for any single delay
    pub max: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(32),
        }
    }
}

impl ReconnectPolicy {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self { initial, max }
    }

    pub fn from_config(mqtt: &saconf::MqttConfig) -> Self {
        Self::new(
            Duration::from_millis(mqtt.reconnect_initial_ms),
            Duration::from_millis(mqtt.reconnect_max_ms),
        )
    }

    /// Delay before retry number `attempt`.
    ///
    /// attempt 0: none (first connect)
    /// attempt 1: initial
    /// attempt n: min(initial * 2^(n-1), max)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
        let delay = self.initial.saturating_mul(multiplier);
        std::cmp::min(delay, self.max)
    }
}
