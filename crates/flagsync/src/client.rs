//! Feature client facade.
//!
//! Owns the streaming session, the repository replica and the notifier
//! dispatcher. Reads never touch the network: they evaluate against the
//! current snapshot and keep working after the connection drops or the
//! client is closed.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use flagsync_core::{EvaluationContext, FeatureRecord, resolve_value};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::FlagsError;
use crate::analytics::{AnalyticsCollector, AnalyticsDispatcher, AnalyticsEvent, AnalyticsReport};
use crate::config::{ClientConfig, Transport};
use crate::connector::Connector;
use crate::notifier::NotifierRegistry;
use crate::readiness::{ReadinessGate, ReadinessState};
use crate::repository::FeatureRepository;
use crate::session::{SessionState, SessionStats, StreamingSession};
use crate::sse::SseConnector;
use crate::typed::{read_boolean, read_number, read_raw_json, read_string};
use crate::websocket::WebSocketConnector;

/// Callback for a terminal connection failure.
pub type ConnectionErrorCallback = Box<dyn FnOnce(&FlagsError) + Send>;

/// How long `close` waits for background tasks before aborting them.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

#[derive(Default)]
struct ConnectionErrors {
    reason: Option<String>,
    observers: Vec<ConnectionErrorCallback>,
}

/// Feature flag client.
///
/// ```no_run
/// # async fn example() -> Result<(), flagsync::FlagsError> {
/// use std::time::Duration;
/// use flagsync::{ClientConfig, EvaluationContext, FeatureClient};
///
/// let config = ClientConfig::builder("https://flags.example.com", "api-key")
///     .wait_for_data(Duration::from_secs(5))
///     .build()?;
/// let client = FeatureClient::connect(config).await?;
///
/// let ctx = EvaluationContext::new().with_identity_key("user-1").with_country("nz");
/// if client.get_boolean("new_checkout", Some(&ctx))? {
///     // ...
/// }
/// client.close().await;
/// # Ok(())
/// # }
/// ```
pub struct FeatureClient {
    config: ClientConfig,
    repository: Arc<FeatureRepository>,
    notifiers: Arc<NotifierRegistry>,
    readiness: Arc<ReadinessGate>,
    session: Arc<StreamingSession>,
    analytics: AnalyticsDispatcher,
    connection_errors: Arc<Mutex<ConnectionErrors>>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl FeatureClient {
    /// Connect using the connector for the configured transport.
    pub async fn connect(config: ClientConfig) -> Result<Self, FlagsError> {
        let connector: Arc<dyn Connector> = match config.transport {
            Transport::Sse => Arc::new(SseConnector::new()),
            Transport::WebSocket => Arc::new(WebSocketConnector::new()),
        };
        Self::with_connector(config, connector).await
    }

    /// Connect through a caller-supplied connector.
    ///
    /// With `wait_for_data` configured this returns only once data has
    /// arrived, failing with `Timeout` after `wait_timeout`.
    pub async fn with_connector(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, FlagsError> {
        config.validate()?;

        let repository = FeatureRepository::new();
        let notifiers = NotifierRegistry::new();
        let readiness = Arc::new(ReadinessGate::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let dispatcher = notifiers.spawn_dispatcher(repository.subscribe(), shutdown_rx.clone());

        let session = Arc::new(StreamingSession::new(
            &config,
            connector,
            Arc::clone(&repository),
            Arc::clone(&readiness),
        ));
        let connection_errors = Arc::new(Mutex::new(ConnectionErrors::default()));

        let session_task = {
            let session = Arc::clone(&session);
            let connection_errors = Arc::clone(&connection_errors);
            tokio::spawn(async move {
                match session.run(shutdown_rx).await {
                    Ok(()) => debug!("session task finished"),
                    Err(e) => {
                        error!(error = %e, "feature stream closed by server");
                        let reason = match &e {
                            FlagsError::TerminalServer(reason) => reason.clone(),
                            other => other.to_string(),
                        };
                        let observers = {
                            let mut errors = connection_errors.lock();
                            errors.reason = Some(reason);
                            std::mem::take(&mut errors.observers)
                        };
                        for observer in observers {
                            observer(&e);
                        }
                    }
                }
            })
        };

        info!(
            server = %config.server_address,
            transport = ?config.transport,
            "feature client started"
        );

        let client = Self {
            config,
            repository,
            notifiers,
            readiness,
            session,
            analytics: AnalyticsDispatcher::new(),
            connection_errors,
            shutdown_tx,
            tasks: Mutex::new(vec![dispatcher, session_task]),
        };

        if client.config.wait_for_data
            && let Err(e) = client.wait_for_data(client.config.wait_timeout).await
        {
            client.close().await;
            return Err(e);
        }

        Ok(client)
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Wait until the first data has been applied.
    ///
    /// Fails with `Timeout` after `timeout`, `Shutdown` if the client is
    /// closed meanwhile and `TerminalServer` if the server refused the
    /// client before sending data.
    pub async fn wait_for_data(&self, timeout: Duration) -> Result<(), FlagsError> {
        let mut ready_rx = self.readiness.subscribe();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let wait = async {
            loop {
                let state = *ready_rx.borrow_and_update();
                match state {
                    ReadinessState::Ready => return Ok(()),
                    ReadinessState::Failed => {
                        let reason = self
                            .session
                            .terminal_error()
                            .unwrap_or_else(|| "connection failed".to_string());
                        return Err(FlagsError::TerminalServer(reason));
                    }
                    ReadinessState::NotReady => {}
                }
                if *shutdown_rx.borrow_and_update() {
                    return Err(FlagsError::Shutdown);
                }

                tokio::select! {
                    changed = ready_rx.changed() => {
                        if changed.is_err() {
                            return Err(FlagsError::Shutdown);
                        }
                    }
                    changed = shutdown_rx.changed() => {
                        if changed.is_err() {
                            return Err(FlagsError::Shutdown);
                        }
                    }
                }
            }
        };

        match tokio::time::timeout(timeout, wait).await {
            Ok(result) => result,
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "timed out waiting for feature data");
                Err(FlagsError::Timeout(timeout))
            }
        }
    }

    /// Whether data has arrived.
    pub fn is_ready(&self) -> bool {
        self.readiness.is_ready()
    }

    /// Register a callback for when data first arrives. Runs immediately if
    /// it already has.
    pub fn readiness_listener(&self, listener: impl FnOnce() + Send + 'static) {
        self.readiness.add_listener(listener);
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    pub fn session_stats(&self) -> SessionStats {
        self.session.stats()
    }

    /// The terminal connection failure, if one happened.
    pub fn connection_error(&self) -> Option<FlagsError> {
        self.connection_errors
            .lock()
            .reason
            .clone()
            .map(FlagsError::TerminalServer)
    }

    /// Register a callback for a terminal connection failure.
    ///
    /// Runs at most once. If the failure already happened it runs
    /// immediately.
    pub fn on_connection_error(&self, callback: impl FnOnce(&FlagsError) + Send + 'static) {
        let mut errors = self.connection_errors.lock();
        if let Some(reason) = errors.reason.clone() {
            drop(errors);
            callback(&FlagsError::TerminalServer(reason));
        } else {
            errors.observers.push(Box::new(callback));
        }
    }

    /// Get the full record for a key.
    pub fn get_feature(&self, key: &str) -> Result<Arc<FeatureRecord>, FlagsError> {
        self.repository.get(key)
    }

    /// All known records, sorted by key.
    pub fn features(&self) -> Vec<Arc<FeatureRecord>> {
        self.repository.snapshot()
    }

    fn resolve<T>(
        &self,
        key: &str,
        context: Option<&EvaluationContext>,
        read: fn(&FeatureRecord, &Value) -> Result<T, FlagsError>,
    ) -> Result<T, FlagsError> {
        let record = self.repository.get(key)?;
        let context = context.or(self.config.default_context.as_ref());
        let value = resolve_value(&record, context);
        read(&record, value)
    }

    /// Read a boolean feature.
    ///
    /// Strategies are evaluated against `context`, or the configured default
    /// context when none is given. Without either the base value is used.
    pub fn get_boolean(&self, key: &str, context: Option<&EvaluationContext>) -> Result<bool, FlagsError> {
        self.resolve(key, context, read_boolean)
    }

    /// Read a number feature.
    pub fn get_number(&self, key: &str, context: Option<&EvaluationContext>) -> Result<f64, FlagsError> {
        self.resolve(key, context, read_number)
    }

    /// Read a string feature.
    pub fn get_string(&self, key: &str, context: Option<&EvaluationContext>) -> Result<String, FlagsError> {
        self.resolve(key, context, read_string)
    }

    /// Read a JSON feature as its raw JSON text.
    pub fn get_raw_json(&self, key: &str, context: Option<&EvaluationContext>) -> Result<String, FlagsError> {
        self.resolve(key, context, read_raw_json)
    }

    pub fn add_notifier_feature(
        &self,
        key: impl Into<String>,
        callback: impl Fn(Option<&FeatureRecord>) + Send + Sync + 'static,
    ) {
        self.notifiers.add_feature(key, callback);
    }

    pub fn add_notifier_boolean(&self, key: impl Into<String>, callback: impl Fn(bool) + Send + Sync + 'static) {
        self.notifiers.add_boolean(key, callback);
    }

    pub fn add_notifier_number(&self, key: impl Into<String>, callback: impl Fn(f64) + Send + Sync + 'static) {
        self.notifiers.add_number(key, callback);
    }

    pub fn add_notifier_string(&self, key: impl Into<String>, callback: impl Fn(String) + Send + Sync + 'static) {
        self.notifiers.add_string(key, callback);
    }

    pub fn add_notifier_json(&self, key: impl Into<String>, callback: impl Fn(String) + Send + Sync + 'static) {
        self.notifiers.add_json(key, callback);
    }

    /// Remove every notifier for a key.
    pub fn delete_notifier(&self, key: &str) -> Result<(), FlagsError> {
        self.notifiers.delete(key).map(|_| ())
    }

    pub fn add_analytics_collector(&self, collector: Arc<dyn AnalyticsCollector>) {
        self.analytics.add(collector);
    }

    /// Log an action against every known feature.
    ///
    /// Values are resolved with the default context when one is configured.
    pub async fn log_analytics_event(
        &self,
        action: &str,
        tags: BTreeMap<String, String>,
    ) -> AnalyticsReport {
        let timestamp = Utc::now();
        let context = self.config.default_context.as_ref();
        let events: Vec<_> = self
            .repository
            .snapshot()
            .iter()
            .map(|record| AnalyticsEvent {
                action: action.to_string(),
                feature_key: record.key.clone(),
                feature_type: record.feature_type,
                value: resolve_value(record, context).clone(),
                version: record.version,
                timestamp,
            })
            .collect();

        debug!(action = %action, events = events.len(), collectors = self.analytics.len(), "logging analytics event");
        self.analytics.dispatch(action, &tags, &events).await
    }

    /// Stop the session and the notifier dispatcher.
    ///
    /// Cancels any pending reconnect wait, wakes `wait_for_data` callers
    /// with `Shutdown` and drops registered callbacks. The last snapshot
    /// stays readable.
    pub async fn close(&self) {
        if self.shutdown_tx.send_replace(true) {
            return;
        }
        info!("closing feature client");

        self.notifiers.clear();
        self.readiness.clear_listeners();
        self.connection_errors.lock().observers.clear();

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for mut task in tasks {
            if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
                warn!("background task did not stop in time, aborting");
                task.abort();
            }
        }
    }
}

impl Drop for FeatureClient {
    fn drop(&mut self) {
        self.shutdown_tx.send_replace(true);
    }
}
