//! Heartbeat Manager
//!
//! Monitors stream health through periodic pings. Each unanswered ping counts
//! as one miss; any inbound frame clears the count. Reaching the failure
//! threshold asks the connection to reconnect.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Configuration for heartbeat behavior.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between pings.
    pub ping_interval: Duration,
    /// Time a ping may go unanswered before it counts as missed.
    pub pong_timeout: Duration,
    /// Consecutive misses that force a reconnect.
    pub failure_threshold: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            failure_threshold: 3,
        }
    }
}

impl HeartbeatConfig {
    /// Create configuration from `StreamSettings`.
    #[must_use]
    pub const fn from_stream_settings(settings: &crate::StreamSettings) -> Self {
        Self {
            ping_interval: settings.heartbeat_interval,
            pong_timeout: settings.heartbeat_timeout,
            failure_threshold: settings.heartbeat_failure_threshold,
        }
    }
}

/// Events emitted by the heartbeat manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Send a ping now.
    SendPing,
    /// A ping went unanswered.
    Missed {
        /// Misses in a row, including this one.
        consecutive: u32,
    },
    /// Threshold reached; the connection should be restarted.
    Timeout {
        /// Misses in a row.
        consecutive: u32,
    },
}

/// State shared between the heartbeat manager and the read loop.
#[derive(Debug)]
pub struct HeartbeatState {
    ping_sent_at: RwLock<Instant>,
    waiting_for_pong: AtomicBool,
    consecutive_misses: AtomicU32,
}

impl Default for HeartbeatState {
    fn default() -> Self {
        Self::new()
    }
}

impl HeartbeatState {
    /// Create new heartbeat state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ping_sent_at: RwLock::new(Instant::now()),
            waiting_for_pong: AtomicBool::new(false),
            consecutive_misses: AtomicU32::new(0),
        }
    }

    /// Record a pong or any other inbound frame.
    pub fn record_alive(&self) {
        self.waiting_for_pong.store(false, Ordering::SeqCst);
        self.consecutive_misses.store(0, Ordering::SeqCst);
    }

    /// Mark that a ping went out.
    pub fn mark_ping_sent(&self) {
        *self.ping_sent_at.write() = Instant::now();
        self.waiting_for_pong.store(true, Ordering::SeqCst);
    }

    /// Count one miss and return the consecutive total.
    pub fn record_miss(&self) -> u32 {
        self.waiting_for_pong.store(false, Ordering::SeqCst);
        self.consecutive_misses.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Check if a pong is outstanding.
    #[must_use]
    pub fn is_waiting_for_pong(&self) -> bool {
        self.waiting_for_pong.load(Ordering::SeqCst)
    }

    /// Time since the last ping went out.
    #[must_use]
    pub fn time_since_ping(&self) -> Duration {
        self.ping_sent_at.read().elapsed()
    }

    /// Misses in a row.
    #[must_use]
    pub fn consecutive_misses(&self) -> u32 {
        self.consecutive_misses.load(Ordering::SeqCst)
    }
}

/// Heartbeat manager that monitors connection health.
pub struct HeartbeatManager {
    config: HeartbeatConfig,
    state: Arc<HeartbeatState>,
    event_tx: mpsc::Sender<HeartbeatEvent>,
    cancel: CancellationToken,
}

impl HeartbeatManager {
    /// Create a new heartbeat manager.
    #[must_use]
    pub const fn new(
        config: HeartbeatConfig,
        state: Arc<HeartbeatState>,
        event_tx: mpsc::Sender<HeartbeatEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            state,
            event_tx,
            cancel,
        }
    }

    /// Run until cancelled or the threshold is reached.
    pub async fn run(self) {
        let start = Instant::now() + self.config.ping_interval;
        let mut interval = tokio::time::interval_at(start, self.config.ping_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let check_every = self.config.pong_timeout.min(self.config.ping_interval);
        let mut deadline_check = tokio::time::interval(check_every);
        deadline_check.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("Heartbeat manager cancelled");
                    break;
                }
                _ = deadline_check.tick() => {
                    if self.check_deadline().await.is_err() {
                        break;
                    }
                }
                _ = interval.tick() => {
                    if self.event_tx.send(HeartbeatEvent::SendPing).await.is_err() {
                        tracing::debug!("Event channel closed, stopping heartbeat");
                        break;
                    }
                }
            }
        }
    }

    /// Returns `Err(())` once the threshold is reached.
    async fn check_deadline(&self) -> Result<(), ()> {
        if !self.state.is_waiting_for_pong() || self.state.time_since_ping() < self.config.pong_timeout
        {
            return Ok(());
        }

        let consecutive = self.state.record_miss();
        tracing::warn!(
            consecutive,
            threshold = self.config.failure_threshold,
            "Heartbeat pong missed"
        );

        if consecutive >= self.config.failure_threshold {
            let _ = self.event_tx.send(HeartbeatEvent::Timeout { consecutive }).await;
            return Err(());
        }
        if self.event_tx.send(HeartbeatEvent::Missed { consecutive }).await.is_err() {
            return Err(());
        }
        Ok(())
    }
}
