//! Token bucket rate limiter for outbound calls.
//!
//! Bounds connection attempts and batch API requests to the exchange's
//! published rules. Waiting callers are delayed, never dropped.
//!
//! # Semantics
//!
//! - The bucket starts full at `capacity` tokens
//! - Tokens refill continuously at `refill_per_sec`
//! - `acquire()` takes one token, sleeping until one is available
//! - The mutex is only held while computing, never across a sleep

use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::infrastructure::metrics;

/// Longest single wait reported for an empty bucket.
const MAX_WAIT: Duration = Duration::from_secs(60);

/// Rate limiter configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Burst size.
    pub capacity: u32,
    /// Steady refill rate in tokens per second.
    pub refill_per_sec: f64,
}

impl RateLimitConfig {
    /// Exchange rule for stream connection attempts (5/s).
    #[must_use]
    pub const fn connect() -> Self {
        Self {
            capacity: 5,
            refill_per_sec: 5.0,
        }
    }

    /// Exchange rule for REST calls (10/s).
    #[must_use]
    pub const fn rest() -> Self {
        Self {
            capacity: 10,
            refill_per_sec: 10.0,
        }
    }
}

/// Snapshot of bucket state.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitBudget {
    /// Burst size.
    pub capacity: u32,
    /// Tokens per second.
    pub refill_rate: f64,
    /// Tokens available now.
    pub available: f64,
    /// Last refill instant.
    pub last_refill_at: Instant,
}

/// Returned by [`RateLimiter::try_acquire`] when no token is available.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("rate limit exceeded for {limiter}, retry after {retry_after:?}")]
pub struct RateLimitExceeded {
    /// Limiter name.
    pub limiter: String,
    /// Time until a token is available.
    pub retry_after: Duration,
}

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Mutex-guarded token bucket.
#[derive(Debug)]
pub struct RateLimiter {
    name: String,
    capacity: f64,
    refill_per_sec: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// Create a full bucket.
    #[must_use]
    pub fn new(name: impl Into<String>, config: RateLimitConfig) -> Self {
        let capacity = f64::from(config.capacity.max(1));
        Self {
            name: name.into(),
            capacity,
            refill_per_sec: config.refill_per_sec.max(f64::MIN_POSITIVE),
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Limiter name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn refill(&self, bucket: &mut Bucket, now: Instant) {
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens = elapsed
            .as_secs_f64()
            .mul_add(self.refill_per_sec, bucket.tokens)
            .min(self.capacity);
        bucket.last_refill = now;
    }

    /// Take a token, or report how long until one is available.
    fn take(&self) -> Result<(), Duration> {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, Instant::now());
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            drop(bucket);
            Ok(())
        } else {
            let deficit = 1.0 - bucket.tokens;
            drop(bucket);
            let wait = Duration::try_from_secs_f64(deficit / self.refill_per_sec)
                .map_or(MAX_WAIT, |wait| wait.min(MAX_WAIT));
            Err(wait)
        }
    }

    /// Wait for and consume one token.
    pub async fn acquire(&self) {
        let started = Instant::now();
        loop {
            match self.take() {
                Ok(()) => break,
                Err(wait) => {
                    tracing::trace!(limiter = %self.name, wait_ms = wait.as_millis(), "Rate limited");
                    tokio::time::sleep(wait).await;
                }
            }
        }
        let waited = started.elapsed();
        if !waited.is_zero() {
            metrics::record_rate_limit_wait(&self.name, waited);
        }
    }

    /// Consume one token without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`RateLimitExceeded`] when the bucket is empty.
    pub fn try_acquire(&self) -> Result<(), RateLimitExceeded> {
        self.take().map_err(|retry_after| RateLimitExceeded {
            limiter: self.name.clone(),
            retry_after,
        })
    }

    /// Current bucket state.
    #[must_use]
    pub fn budget(&self) -> RateLimitBudget {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket, Instant::now());
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let capacity = self.capacity as u32;
        RateLimitBudget {
            capacity,
            refill_rate: self.refill_per_sec,
            available: bucket.tokens,
            last_refill_at: bucket.last_refill,
        }
    }
}
