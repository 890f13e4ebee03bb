//! Client configuration.

use std::fmt;
use std::time::Duration;

use backoff::ExponentialBackoff;
use flagsync_core::EvaluationContext;

use crate::FlagsError;

/// Default deadline for waiting on the first data.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_secs(10);
/// Default first reconnect delay.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);
/// Default reconnect delay cap.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(60);
/// Default silence after which a connection is considered dead.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Push transport used to reach the feature service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Transport {
    /// Server-sent events over HTTP.
    #[default]
    Sse,
    /// JSON envelopes over a WebSocket.
    WebSocket,
}

/// Configuration for a [`crate::FeatureClient`].
#[derive(Clone)]
pub struct ClientConfig {
    /// Base address of the feature service, without a trailing slash.
    pub server_address: String,
    /// API key identifying the environment.
    pub api_key: String,
    pub transport: Transport,
    /// Block construction until data arrives.
    pub wait_for_data: bool,
    pub wait_timeout: Duration,
    /// Context used by typed reads that do not pass one.
    pub default_context: Option<EvaluationContext>,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub backoff_multiplier: f64,
    /// Randomization factor applied to every delay (0.0-1.0).
    pub backoff_jitter: f64,
    pub idle_timeout: Duration,
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("server_address", &self.server_address)
            .field("api_key", &"<redacted>")
            .field("transport", &self.transport)
            .field("wait_for_data", &self.wait_for_data)
            .field("wait_timeout", &self.wait_timeout)
            .field("default_context", &self.default_context)
            .field("initial_backoff", &self.initial_backoff)
            .field("max_backoff", &self.max_backoff)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("backoff_jitter", &self.backoff_jitter)
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}

impl ClientConfig {
    /// Create a configuration with defaults for everything but the address
    /// and key.
    pub fn new(server_address: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            server_address: server_address.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            transport: Transport::default(),
            wait_for_data: false,
            wait_timeout: DEFAULT_WAIT_TIMEOUT,
            default_context: None,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            backoff_multiplier: 2.0,
            backoff_jitter: 0.5,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
        }
    }

    /// Start building a configuration.
    pub fn builder(
        server_address: impl Into<String>,
        api_key: impl Into<String>,
    ) -> ClientConfigBuilder {
        ClientConfigBuilder {
            config: Self::new(server_address, api_key),
        }
    }

    /// Check the configuration for values the client cannot work with.
    pub fn validate(&self) -> Result<(), FlagsError> {
        let scheme_ok = ["http://", "https://", "ws://", "wss://"]
            .iter()
            .any(|scheme| self.server_address.starts_with(scheme));
        if !scheme_ok {
            return Err(FlagsError::InvalidConfig(format!(
                "server address must be an http(s) or ws(s) URL: {}",
                self.server_address
            )));
        }
        if self.api_key.trim().is_empty() {
            return Err(FlagsError::InvalidConfig("api key is empty".to_string()));
        }
        if self.wait_timeout.is_zero() {
            return Err(FlagsError::InvalidConfig("wait timeout must be positive".to_string()));
        }
        if self.idle_timeout.is_zero() {
            return Err(FlagsError::InvalidConfig("idle timeout must be positive".to_string()));
        }
        if self.initial_backoff.is_zero() || self.initial_backoff > self.max_backoff {
            return Err(FlagsError::InvalidConfig(format!(
                "initial backoff {:?} must be positive and at most the max backoff {:?}",
                self.initial_backoff, self.max_backoff
            )));
        }
        if self.backoff_multiplier.is_nan() || self.backoff_multiplier < 1.0 {
            return Err(FlagsError::InvalidConfig(format!(
                "backoff multiplier must be at least 1.0, got {}",
                self.backoff_multiplier
            )));
        }
        if !(0.0..=1.0).contains(&self.backoff_jitter) {
            return Err(FlagsError::InvalidConfig(format!(
                "backoff jitter must be within 0.0..=1.0, got {}",
                self.backoff_jitter
            )));
        }
        Ok(())
    }

    /// Reconnect backoff policy. Retries forever.
    pub fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: self.initial_backoff,
            current_interval: self.initial_backoff,
            max_interval: self.max_backoff,
            multiplier: self.backoff_multiplier,
            randomization_factor: self.backoff_jitter,
            max_elapsed_time: None,
            ..Default::default()
        }
    }
}

/// Consuming builder for [`ClientConfig`].
#[derive(Debug, Clone)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn transport(mut self, transport: Transport) -> Self {
        self.config.transport = transport;
        self
    }

    /// Wait for the first data during construction, up to `timeout`.
    pub fn wait_for_data(mut self, timeout: Duration) -> Self {
        self.config.wait_for_data = true;
        self.config.wait_timeout = timeout;
        self
    }

    pub fn default_context(mut self, context: EvaluationContext) -> Self {
        self.config.default_context = Some(context);
        self
    }

    /// Set the reconnect delay bounds.
    pub fn backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.config.initial_backoff = initial;
        self.config.max_backoff = max;
        self
    }

    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.config.backoff_multiplier = multiplier;
        self
    }

    pub fn backoff_jitter(mut self, jitter: f64) -> Self {
        self.config.backoff_jitter = jitter;
        self
    }

    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.config.idle_timeout = timeout;
        self
    }

    /// Validate and build the configuration.
    pub fn build(self) -> Result<ClientConfig, FlagsError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Convert a configured address to its WebSocket form.
pub fn websocket_base(server_address: &str) -> String {
    server_address
        .replace("https://", "wss://")
        .replace("http://", "ws://")
}

/// Convert a configured address to its HTTP form.
pub fn http_base(server_address: &str) -> String {
    server_address
        .replace("wss://", "https://")
        .replace("ws://", "http://")
}
