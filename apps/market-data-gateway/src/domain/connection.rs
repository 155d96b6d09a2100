//! Connection state and lifecycle events.
//!
//! Owned by the connection worker; everyone else only observes.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

/// Stream connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    /// No connection and none in progress.
    #[default]
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    /// Transport up, subscriptions replayed.
    Connected,
    /// Waiting to retry after a lost connection.
    Reconnecting,
    /// Reconnect attempts exhausted.
    Failed,
}

impl ConnectionState {
    /// Gauge value.
    #[must_use]
    pub const fn code(self) -> u8 {
        match self {
            Self::Disconnected => 0,
            Self::Connecting => 1,
            Self::Connected => 2,
            Self::Reconnecting => 3,
            Self::Failed => 4,
        }
    }

    /// Label.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Reconnecting => "RECONNECTING",
            Self::Failed => "FAILED",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Events emitted by the connection worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// Transport is up and every live ticket has been re-sent.
    Connected,
    /// Transport went away.
    Disconnected {
        /// What ended the session.
        reason: String,
    },
    /// A heartbeat ping went unanswered.
    HeartbeatMissed {
        /// Misses in a row.
        consecutive: u32,
    },
    /// A reconnect is scheduled.
    Reconnecting {
        /// Attempt number, starting at 1.
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
    },
    /// Reconnect attempts exhausted.
    Failed {
        /// Attempts made.
        attempts: u32,
    },
}
