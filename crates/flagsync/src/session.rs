//! Streaming session: connect, apply messages, reconnect.
//!
//! ```text
//! Disconnected -> Connecting -> Streaming -> Reconnecting -> Connecting ...
//!                      |            |
//!                      +------------+--> Closed (shutdown or terminal failure)
//! ```
//!
//! The session is the only writer of the repository. Each message is applied
//! before the next one is read, so per-key order on the wire is the order of
//! repository changes.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use flagsync_core::StreamMessage;
use futures_util::StreamExt;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, error, info, trace, warn};

use crate::FlagsError;
use crate::config::ClientConfig;
use crate::connector::Connector;
use crate::readiness::ReadinessGate;
use crate::repository::FeatureRepository;

/// Connection state of a streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    /// Not started yet.
    Disconnected = 0,
    /// Opening a connection.
    Connecting = 1,
    /// Connected and applying messages.
    Streaming = 2,
    /// Waiting out the backoff delay before the next attempt.
    Reconnecting = 3,
    /// Stopped for good.
    Closed = 4,
}

impl From<u8> for SessionState {
    fn from(v: u8) -> Self {
        match v {
            0 => SessionState::Disconnected,
            1 => SessionState::Connecting,
            2 => SessionState::Streaming,
            3 => SessionState::Reconnecting,
            4 => SessionState::Closed,
            _ => SessionState::Disconnected,
        }
    }
}

/// Point-in-time copy of the session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub reconnect_attempts: u64,
    pub messages_received: u64,
    pub messages_dropped: u64,
}

/// Owns the connection lifecycle and feeds the repository.
pub struct StreamingSession {
    connector: Arc<dyn Connector>,
    server_address: String,
    api_key: String,
    repository: Arc<FeatureRepository>,
    readiness: Arc<ReadinessGate>,
    backoff: ExponentialBackoff,
    idle_timeout: Duration,
    state: AtomicU8,
    state_tx: watch::Sender<SessionState>,
    reconnect_attempts: AtomicU64,
    messages_received: AtomicU64,
    messages_dropped: AtomicU64,
    terminal_error: Mutex<Option<String>>,
}

impl StreamingSession {
    pub fn new(
        config: &ClientConfig,
        connector: Arc<dyn Connector>,
        repository: Arc<FeatureRepository>,
        readiness: Arc<ReadinessGate>,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Disconnected);
        Self {
            connector,
            server_address: config.server_address.clone(),
            api_key: config.api_key.clone(),
            repository,
            readiness,
            backoff: config.backoff(),
            idle_timeout: config.idle_timeout,
            state: AtomicU8::new(SessionState::Disconnected as u8),
            state_tx,
            reconnect_attempts: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            terminal_error: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        SessionState::from(self.state.load(Ordering::SeqCst))
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    fn set_state(&self, state: SessionState) {
        let previous = SessionState::from(self.state.swap(state as u8, Ordering::SeqCst));
        if previous != state {
            trace!(from = ?previous, to = ?state, "session state change");
            self.state_tx.send_replace(state);
        }
    }

    pub fn stats(&self) -> SessionStats {
        SessionStats {
            reconnect_attempts: self.reconnect_attempts.load(Ordering::SeqCst),
            messages_received: self.messages_received.load(Ordering::SeqCst),
            messages_dropped: self.messages_dropped.load(Ordering::SeqCst),
        }
    }

    /// Reason the server gave for a terminal failure, if one happened.
    pub fn terminal_error(&self) -> Option<String> {
        self.terminal_error.lock().clone()
    }

    /// Run the session until shutdown or a terminal failure.
    ///
    /// Transport failures reconnect with exponential backoff, forever.
    /// Returns `Err(TerminalServer)` if the server refused the client.
    pub async fn run(&self, mut shutdown_rx: watch::Receiver<bool>) -> Result<(), FlagsError> {
        let mut backoff = self.backoff.clone();

        loop {
            if *shutdown_rx.borrow() {
                return self.close("shutdown requested").await;
            }

            self.set_state(SessionState::Connecting);
            info!(server = %self.server_address, "connecting to feature service");

            match self.connect_and_process(&mut shutdown_rx, &mut backoff).await {
                Ok(()) => {
                    return self.close("shutdown requested").await;
                }
                Err(FlagsError::TerminalServer(reason)) => {
                    error!(reason = %reason, "feature service refused client, not retrying");
                    *self.terminal_error.lock() = Some(reason.clone());
                    self.readiness.mark_failed();
                    self.close("terminal server failure").await?;
                    return Err(FlagsError::TerminalServer(reason));
                }
                Err(e) => {
                    error!(error = %e, "feature stream connection error, reconnecting");
                    self.set_state(SessionState::Reconnecting);
                    self.reconnect_attempts.fetch_add(1, Ordering::SeqCst);

                    // Always Some since max_elapsed_time is None
                    let wait = backoff.next_backoff().unwrap_or(self.backoff.max_interval);
                    debug!(delay_ms = wait.as_millis() as u64, "waiting before reconnect");

                    tokio::select! {
                        _ = shutdown_requested(&mut shutdown_rx) => {
                            return self.close("shutdown during backoff").await;
                        }
                        _ = tokio::time::sleep(wait) => {}
                    }
                }
            }
        }
    }

    async fn close(&self, reason: &str) -> Result<(), FlagsError> {
        info!(reason = %reason, "feature stream closed");
        self.set_state(SessionState::Closed);
        self.connector.close().await;
        Ok(())
    }

    /// Connect and apply messages until shutdown (`Ok`) or an error.
    async fn connect_and_process(
        &self,
        shutdown_rx: &mut watch::Receiver<bool>,
        backoff: &mut ExponentialBackoff,
    ) -> Result<(), FlagsError> {
        let mut stream = tokio::select! {
            biased;

            _ = shutdown_requested(shutdown_rx) => return Ok(()),
            result = self.connector.connect(&self.server_address, &self.api_key) => result?,
        };

        info!("feature stream connected");
        backoff.reset();
        self.set_state(SessionState::Streaming);

        loop {
            tokio::select! {
                biased;

                _ = shutdown_requested(shutdown_rx) => {
                    info!("feature stream received shutdown signal");
                    return Ok(());
                }

                result = tokio::time::timeout(self.idle_timeout, stream.next()) => {
                    match result {
                        Ok(Some(Ok(message))) => {
                            self.messages_received.fetch_add(1, Ordering::SeqCst);
                            self.apply(message)?;
                        }
                        Ok(Some(Err(FlagsError::Protocol(e)))) => {
                            self.messages_received.fetch_add(1, Ordering::SeqCst);
                            self.messages_dropped.fetch_add(1, Ordering::SeqCst);
                            warn!(error = %e, "dropping malformed message");
                        }
                        Ok(Some(Err(e))) => return Err(e),
                        Ok(None) => {
                            return Err(FlagsError::Connection("stream ended".to_string()));
                        }
                        Err(_) => {
                            warn!(
                                idle_secs = self.idle_timeout.as_secs_f64(),
                                "no message within idle timeout, connection presumed dead"
                            );
                            return Err(FlagsError::Connection("idle timeout".to_string()));
                        }
                    }
                }
            }
        }
    }

    /// Apply one message to the repository and open the readiness gate if
    /// it was accepted.
    ///
    /// `Bye` and `Failure` are returned as errors for the run loop to act on.
    pub fn apply(&self, message: StreamMessage) -> Result<(), FlagsError> {
        let accepted = match message {
            StreamMessage::FullSync(records) => {
                debug!(features = records.len(), "received full sync");
                self.repository.apply_full_sync(records);
                true
            }
            StreamMessage::Upsert(record) => self.repository.apply_update(record),
            StreamMessage::Delete { key } => self.repository.apply_delete(&key),
            StreamMessage::Heartbeat => {
                trace!("heartbeat");
                false
            }
            StreamMessage::Bye => {
                info!("feature service closed the stream");
                return Err(FlagsError::Connection("server said bye".to_string()));
            }
            StreamMessage::Failure { reason } => {
                return Err(FlagsError::TerminalServer(reason));
            }
        };

        if accepted {
            self.readiness.mark_ready();
        }
        Ok(())
    }
}

/// Resolves once shutdown is requested or the shutdown sender is gone.
async fn shutdown_requested(shutdown_rx: &mut watch::Receiver<bool>) {
    let _ = shutdown_rx.wait_for(|stop| *stop).await;
}
