//! Connection Lifecycle
//!
//! One worker task owns the stream socket. Everything else talks to it
//! through a [`ConnectionHandle`]: commands over mpsc, state over watch,
//! lifecycle events over broadcast.
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected ─► Connecting ─► Connected ─┬─► Reconnecting ─► Connected ...
//!                                          └─► Failed (attempts exhausted)
//! Failed ─► Connecting (restart command)
//! ```
//!
//! On every (re)connect the worker re-sends every live ticket before it reads
//! a single inbound frame, so handlers never observe a connected but
//! unsubscribed stream.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, HeartbeatState};
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::application::ports::{ConnectionError, FrameSink, FrameStream, StreamTransport, WireFrame};
use crate::application::services::MessageRouter;
use crate::domain::connection::{ConnectionEvent, ConnectionState};
use crate::domain::subscription::{SubscriptionManager, WireMessage};
use crate::infrastructure::metrics;
use crate::resilience::rate_limiter::RateLimiter;

const COMMAND_CAPACITY: usize = 256;
const EVENT_CAPACITY: usize = 64;

// =============================================================================
// Configuration
// =============================================================================

/// Connection worker configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// WebSocket endpoint.
    pub url: String,
    /// Bound on a single connect attempt.
    pub connect_timeout: Duration,
    /// Bound on a single outbound frame.
    pub send_timeout: Duration,
    /// Backoff policy.
    pub reconnect: ReconnectConfig,
    /// Ping policy.
    pub heartbeat: HeartbeatConfig,
}

impl ConnectionConfig {
    /// Create configuration from `StreamSettings`.
    #[must_use]
    pub fn from_stream_settings(settings: &crate::StreamSettings) -> Self {
        Self {
            url: settings.url.clone(),
            connect_timeout: settings.connect_timeout,
            send_timeout: settings.heartbeat_timeout,
            reconnect: ReconnectConfig::from_stream_settings(settings),
            heartbeat: HeartbeatConfig::from_stream_settings(settings),
        }
    }
}

// =============================================================================
// Handle
// =============================================================================

/// Commands accepted by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionCommand {
    /// Send a subscription message now (dropped while not connected; the
    /// ticket is replayed on the next connect).
    Publish(WireMessage),
    /// Leave `Failed` and start connecting again.
    Restart,
    /// Close the socket and stop the worker.
    Shutdown,
}

/// Cloneable access to a running connection worker.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    commands: mpsc::Sender<ConnectionCommand>,
    state: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionHandle {
    /// Queue a subscription message.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::Closed` if the worker has stopped.
    pub async fn publish(&self, message: WireMessage) -> Result<(), ConnectionError> {
        self.commands
            .send(ConnectionCommand::Publish(message))
            .await
            .map_err(|_| ConnectionError::Closed("connection worker stopped".to_string()))
    }

    /// Ask a failed worker to start over.
    ///
    /// # Errors
    ///
    /// Returns `ConnectionError::Closed` if the worker has stopped.
    pub async fn restart(&self) -> Result<(), ConnectionError> {
        self.commands
            .send(ConnectionCommand::Restart)
            .await
            .map_err(|_| ConnectionError::Closed("connection worker stopped".to_string()))
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Watch state changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Receive lifecycle events.
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    /// Wait until the state equals `target`, up to `timeout`.
    pub async fn wait_for_state(&self, target: ConnectionState, timeout: Duration) -> bool {
        let mut rx = self.state.clone();
        tokio::time::timeout(timeout, rx.wait_for(|s| *s == target))
            .await
            .is_ok_and(|r| r.is_ok())
    }

    /// Ask the worker to close the socket and stop.
    pub async fn disconnect_gracefully(&self) {
        if self.commands.send(ConnectionCommand::Shutdown).await.is_err() {
            tracing::debug!("Connection worker already stopped");
        }
    }
}

// =============================================================================
// Worker
// =============================================================================

enum SessionEnd {
    Shutdown,
    Lost(String),
}

enum Resume {
    Connect,
    Stop,
}

/// The actor that owns the socket.
pub struct ConnectionWorker {
    config: ConnectionConfig,
    transport: Arc<dyn StreamTransport>,
    subscriptions: Arc<SubscriptionManager>,
    router: Arc<MessageRouter>,
    limiter: Arc<RateLimiter>,
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<ConnectionEvent>,
    commands: mpsc::Receiver<ConnectionCommand>,
    cancel: CancellationToken,
}

impl ConnectionWorker {
    /// Build a worker and its handle. Call [`Self::run`] (or
    /// [`spawn_connection`]) to start it.
    #[must_use]
    pub fn new(
        config: ConnectionConfig,
        transport: Arc<dyn StreamTransport>,
        subscriptions: Arc<SubscriptionManager>,
        router: Arc<MessageRouter>,
        limiter: Arc<RateLimiter>,
        cancel: CancellationToken,
    ) -> (Self, ConnectionHandle) {
        let (commands_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let (state_tx, state) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let handle = ConnectionHandle {
            commands: commands_tx,
            state,
            events: events.clone(),
        };
        let worker = Self {
            config,
            transport,
            subscriptions,
            router,
            limiter,
            state_tx,
            events,
            commands,
            cancel,
        };
        (worker, handle)
    }

    /// Run the connect / session / backoff loop until shutdown.
    pub async fn run(mut self) {
        let mut policy = ReconnectPolicy::new(self.config.reconnect.clone());
        self.set_state(ConnectionState::Connecting);

        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            match self.connect().await {
                Ok((sink, stream)) => {
                    let started = Instant::now();
                    match self.session(sink, stream).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Lost(reason) => {
                            tracing::warn!(reason = %reason, url = %self.config.url, "Stream connection lost");
                            self.emit(ConnectionEvent::Disconnected { reason });
                            if policy.reset_if_stable(started.elapsed()) {
                                tracing::debug!("Connection was stable; backoff reset");
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, url = %self.config.url, "Stream connect failed");
                }
            }

            if let Some(delay) = policy.next_delay() {
                let attempt = policy.attempt_count();
                tracing::info!(attempt, delay_ms = delay.as_millis(), "Reconnecting to stream");
                self.set_state(ConnectionState::Reconnecting);
                self.emit(ConnectionEvent::Reconnecting { attempt, delay });
                metrics::record_reconnect();
                if !self.backoff(delay).await {
                    break;
                }
            } else {
                let attempts = policy.attempt_count();
                tracing::error!(attempts, "Reconnect attempts exhausted; stream failed");
                self.set_state(ConnectionState::Failed);
                self.emit(ConnectionEvent::Failed { attempts });
                match self.park_failed().await {
                    Resume::Connect => {
                        tracing::info!("Restarting failed stream connection");
                        policy.reset();
                        self.set_state(ConnectionState::Connecting);
                    }
                    Resume::Stop => return,
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
        tracing::info!("Connection worker stopped");
    }

    async fn connect(&self) -> Result<(FrameSink, FrameStream), ConnectionError> {
        self.limiter.acquire().await;
        tracing::info!(url = %self.config.url, "Connecting to stream");
        tokio::time::timeout(self.config.connect_timeout, self.transport.connect(&self.config.url))
            .await
            .map_err(|_| ConnectionError::Timeout {
                operation: "connect",
                after: self.config.connect_timeout,
            })?
    }

    async fn session(&mut self, mut sink: FrameSink, mut stream: FrameStream) -> SessionEnd {
        let replay = self.subscriptions.all_replay_messages();
        let tickets = replay.len();
        for message in replay {
            if let Err(e) = self.send(&mut sink, WireFrame::Text(message.into_string())).await {
                return SessionEnd::Lost(e.to_string());
            }
        }
        self.set_state(ConnectionState::Connected);
        self.emit(ConnectionEvent::Connected);
        tracing::info!(tickets, "Stream connected; subscriptions replayed");

        let heartbeat_state = Arc::new(HeartbeatState::new());
        let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel::<HeartbeatEvent>(16);
        let heartbeat_cancel = self.cancel.child_token();
        let _heartbeat_guard = heartbeat_cancel.clone().drop_guard();
        tokio::spawn(
            HeartbeatManager::new(
                self.config.heartbeat.clone(),
                Arc::clone(&heartbeat_state),
                heartbeat_tx,
                heartbeat_cancel,
            )
            .run(),
        );

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    self.close(&mut sink).await;
                    return SessionEnd::Shutdown;
                }
                command = self.commands.recv() => match command {
                    Some(ConnectionCommand::Publish(message)) => {
                        if let Err(e) = self.send(&mut sink, WireFrame::Text(message.into_string())).await {
                            return SessionEnd::Lost(e.to_string());
                        }
                    }
                    Some(ConnectionCommand::Restart) => {}
                    Some(ConnectionCommand::Shutdown) | None => {
                        self.close(&mut sink).await;
                        return SessionEnd::Shutdown;
                    }
                },
                Some(event) = heartbeat_rx.recv() => match event {
                    HeartbeatEvent::SendPing => {
                        heartbeat_state.mark_ping_sent();
                        match self.send(&mut sink, WireFrame::Ping(Vec::new())).await {
                            Ok(()) => {}
                            Err(ConnectionError::Timeout { .. }) => {
                                let consecutive = heartbeat_state.record_miss();
                                metrics::record_heartbeat_missed();
                                self.emit(ConnectionEvent::HeartbeatMissed { consecutive });
                                if consecutive >= self.config.heartbeat.failure_threshold {
                                    return SessionEnd::Lost(
                                        ConnectionError::HeartbeatTimeout { consecutive }.to_string(),
                                    );
                                }
                            }
                            Err(e) => return SessionEnd::Lost(e.to_string()),
                        }
                    }
                    HeartbeatEvent::Missed { consecutive } => {
                        metrics::record_heartbeat_missed();
                        self.emit(ConnectionEvent::HeartbeatMissed { consecutive });
                    }
                    HeartbeatEvent::Timeout { consecutive } => {
                        metrics::record_heartbeat_missed();
                        return SessionEnd::Lost(ConnectionError::HeartbeatTimeout { consecutive }.to_string());
                    }
                },
                frame = stream.next() => match frame {
                    Some(Ok(WireFrame::Text(text))) => {
                        heartbeat_state.record_alive();
                        metrics::record_frame_received("text");
                        self.router.on_frame(text.as_bytes());
                    }
                    Some(Ok(WireFrame::Binary(bytes))) => {
                        heartbeat_state.record_alive();
                        metrics::record_frame_received("binary");
                        self.router.on_frame(&bytes);
                    }
                    Some(Ok(WireFrame::Ping(payload))) => {
                        heartbeat_state.record_alive();
                        if let Err(e) = self.send(&mut sink, WireFrame::Pong(payload)).await {
                            return SessionEnd::Lost(e.to_string());
                        }
                    }
                    Some(Ok(WireFrame::Pong(_))) => heartbeat_state.record_alive(),
                    Some(Ok(WireFrame::Close(reason))) => {
                        return SessionEnd::Lost(format!(
                            "server closed: {}",
                            reason.unwrap_or_else(|| "no reason".to_string())
                        ));
                    }
                    Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                    None => return SessionEnd::Lost("stream ended".to_string()),
                },
            }
        }
    }

    /// Wait out a backoff delay. Returns false when the worker should stop.
    async fn backoff(&mut self, delay: Duration) -> bool {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return false,
                () = &mut sleep => return true,
                command = self.commands.recv() => match command {
                    Some(ConnectionCommand::Publish(_) | ConnectionCommand::Restart) => {}
                    Some(ConnectionCommand::Shutdown) | None => return false,
                },
            }
        }
    }

    async fn park_failed(&mut self) -> Resume {
        loop {
            tokio::select! {
                () = self.cancel.cancelled() => return Resume::Stop,
                command = self.commands.recv() => match command {
                    Some(ConnectionCommand::Restart) => return Resume::Connect,
                    Some(ConnectionCommand::Publish(_)) => {}
                    Some(ConnectionCommand::Shutdown) | None => return Resume::Stop,
                },
            }
        }
    }

    async fn send(&self, sink: &mut FrameSink, frame: WireFrame) -> Result<(), ConnectionError> {
        tokio::time::timeout(self.config.send_timeout, sink.send(frame))
            .await
            .map_err(|_| ConnectionError::Timeout {
                operation: "send",
                after: self.config.send_timeout,
            })?
    }

    async fn close(&self, sink: &mut FrameSink) {
        if let Err(e) = self.send(sink, WireFrame::Close(None)).await {
            tracing::debug!(error = %e, "Close frame not delivered");
        }
    }

    fn set_state(&self, state: ConnectionState) {
        metrics::set_connection_state(state.code());
        self.state_tx.send_replace(state);
    }

    fn emit(&self, event: ConnectionEvent) {
        // No receivers is fine.
        let _ = self.events.send(event);
    }
}

/// Build and spawn a connection worker.
#[must_use]
pub fn spawn_connection(
    config: ConnectionConfig,
    transport: Arc<dyn StreamTransport>,
    subscriptions: Arc<SubscriptionManager>,
    router: Arc<MessageRouter>,
    limiter: Arc<RateLimiter>,
    cancel: CancellationToken,
) -> (ConnectionHandle, JoinHandle<()>) {
    let (worker, handle) =
        ConnectionWorker::new(config, transport, subscriptions, router, limiter, cancel);
    (handle, tokio::spawn(worker.run()))
}
