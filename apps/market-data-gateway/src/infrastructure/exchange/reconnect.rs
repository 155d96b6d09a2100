//! Reconnection Policy
//!
//! Exponential backoff with jitter for stream reconnection. Delays never
//! decrease between consecutive attempts and never exceed the cap. The attempt
//! counter only resets once a connection has stayed up for the stability
//! window.

use std::time::Duration;

use rand::Rng;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// Base delay before the first reconnection attempt.
    pub base_delay: Duration,
    /// Overall delay cap, applied after jitter.
    pub max_delay: Duration,
    /// Jitter factor as a fraction (0.1 = ±10%).
    pub jitter_factor: f64,
    /// Attempts before giving up (0 = unlimited).
    pub max_attempts: u32,
    /// Uptime after which a connection counts as stable.
    pub stability_window: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
            jitter_factor: 0.1,
            max_attempts: 10,
            stability_window: Duration::from_secs(30),
        }
    }
}

impl ReconnectConfig {
    /// Create configuration from `StreamSettings`.
    #[must_use]
    pub const fn from_stream_settings(settings: &crate::StreamSettings) -> Self {
        Self {
            base_delay: settings.reconnect_base,
            max_delay: settings.reconnect_max,
            jitter_factor: 0.1,
            max_attempts: settings.reconnect_max_attempts,
            stability_window: settings.stability_window,
        }
    }
}

/// Reconnection policy implementing exponential backoff with jitter.
///
/// # Example
///
/// ```rust
/// use market_data_gateway::infrastructure::exchange::reconnect::{ReconnectConfig, ReconnectPolicy};
///
/// let mut policy = ReconnectPolicy::new(ReconnectConfig::default());
/// let first = policy.next_delay().unwrap();
/// let second = policy.next_delay().unwrap();
/// assert!(second >= first);
/// ```
#[derive(Debug)]
pub struct ReconnectPolicy {
    config: ReconnectConfig,
    attempt_count: u32,
    last_delay: Duration,
}

impl ReconnectPolicy {
    /// Create a new reconnection policy.
    #[must_use]
    pub const fn new(config: ReconnectConfig) -> Self {
        Self {
            config,
            attempt_count: 0,
            last_delay: Duration::ZERO,
        }
    }

    /// Delay before the next attempt.
    ///
    /// Returns `None` once max attempts have been used.
    #[must_use]
    pub fn next_delay(&mut self) -> Option<Duration> {
        if !self.should_retry() {
            return None;
        }

        let exponent = self.attempt_count.min(31);
        let raw = self
            .config
            .base_delay
            .saturating_mul(1_u32 << exponent)
            .min(self.config.max_delay);

        self.attempt_count += 1;

        let delay = self
            .apply_jitter(raw)
            .max(self.last_delay)
            .min(self.config.max_delay);
        self.last_delay = delay;
        Some(delay)
    }

    /// Reset after a connection has been held for `uptime`.
    ///
    /// Returns true if the connection was stable and the counter reset.
    pub fn reset_if_stable(&mut self, uptime: Duration) -> bool {
        if uptime >= self.config.stability_window {
            self.reset();
            true
        } else {
            false
        }
    }

    /// Unconditional reset.
    pub const fn reset(&mut self) {
        self.attempt_count = 0;
        self.last_delay = Duration::ZERO;
    }

    /// Attempts made since the last reset.
    #[must_use]
    pub const fn attempt_count(&self) -> u32 {
        self.attempt_count
    }

    /// Check if reconnection should continue.
    #[must_use]
    pub const fn should_retry(&self) -> bool {
        self.config.max_attempts == 0 || self.attempt_count < self.config.max_attempts
    }

    fn apply_jitter(&self, duration: Duration) -> Duration {
        if self.config.jitter_factor <= 0.0 {
            return duration;
        }
        let factor = rand::rng()
            .random_range((1.0 - self.config.jitter_factor)..=(1.0 + self.config.jitter_factor));
        duration.mul_f64(factor.max(0.0))
    }
}
