//! Streaming feature flag client.
//!
//! Keeps a local replica of a feature service's flags current over a push
//! connection and evaluates rollout strategies locally.
//!
//! ## Features
//!
//! - **Session**: connect, apply, reconnect with exponential backoff
//! - **Repository**: versioned replica with change detection
//! - **Notifiers**: per-key typed callbacks, dispatched off the read path
//! - **Readiness**: one-shot gate opened by the first applied update
//! - **Connectors**: server-sent events (default) and WebSocket
//! - **Analytics**: fan-out of logged actions to pluggable collectors

pub mod analytics;
mod client;
pub mod config;
pub mod connector;
mod error;
pub mod notifier;
pub mod readiness;
pub mod repository;
pub mod session;
pub mod sse;
mod typed;
pub mod websocket;

pub use analytics::{AnalyticsCollector, AnalyticsEvent, AnalyticsReport, LoggingCollector};
pub use client::{ConnectionErrorCallback, FeatureClient};
pub use config::{ClientConfig, ClientConfigBuilder, Transport};
pub use connector::{Connector, MessageStream};
pub use error::FlagsError;
pub use readiness::ReadinessState;
pub use repository::{ChangeKind, FeatureChange, FeatureRepository};
pub use session::{SessionState, SessionStats};
pub use sse::SseConnector;
pub use websocket::WebSocketConnector;

pub use flagsync_core::{
    AttributeValue, EvaluationContext, FeatureRecord, FeatureType, FieldType, Operator,
    ProtocolError, RolloutStrategy, Rule, StreamMessage,
};
