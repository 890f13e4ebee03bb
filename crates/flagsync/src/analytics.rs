//! Analytics event fan-out to pluggable collectors.
//!
//! Logging an analytics event builds one [`AnalyticsEvent`] per known
//! feature and hands the batch to every registered [`AnalyticsCollector`].
//! A failing collector never stops delivery to the others; the outcome of
//! each is returned in an [`AnalyticsReport`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flagsync_core::FeatureType;
use futures_util::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::FlagsError;

/// Snapshot of one feature at the time an action was logged.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalyticsEvent {
    /// Action name supplied by the caller.
    pub action: String,
    pub feature_key: String,
    pub feature_type: FeatureType,
    /// Value served for the feature at the time of the action.
    pub value: Value,
    pub version: u64,
    pub timestamp: DateTime<Utc>,
}

/// A sink for analytics events.
///
/// Implementations should return quickly; queue expensive work.
#[async_trait]
pub trait AnalyticsCollector: Send + Sync {
    /// Name used in logs and reports.
    fn name(&self) -> &str;

    /// Record a logged action.
    async fn record(
        &self,
        action: &str,
        tags: &BTreeMap<String, String>,
        events: &[AnalyticsEvent],
    ) -> Result<(), FlagsError>;
}

/// Collector that writes every event to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingCollector;

#[async_trait]
impl AnalyticsCollector for LoggingCollector {
    fn name(&self) -> &str {
        "logging"
    }

    async fn record(
        &self,
        action: &str,
        tags: &BTreeMap<String, String>,
        events: &[AnalyticsEvent],
    ) -> Result<(), FlagsError> {
        for event in events {
            info!(
                action = %action,
                feature = %event.feature_key,
                feature_type = %event.feature_type,
                value = %event.value,
                version = event.version,
                tags = ?tags,
                "analytics event"
            );
        }
        Ok(())
    }
}

/// Outcome of one collector.
#[derive(Debug)]
pub struct CollectorOutcome {
    pub collector: String,
    pub result: Result<(), FlagsError>,
}

/// Per-collector outcomes of one logged action.
#[derive(Debug, Default)]
pub struct AnalyticsReport {
    pub outcomes: Vec<CollectorOutcome>,
}

impl AnalyticsReport {
    /// Whether every collector succeeded.
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.result.is_ok())
    }

    /// Names of collectors that failed.
    pub fn failed(&self) -> Vec<&str> {
        self.outcomes
            .iter()
            .filter(|o| o.result.is_err())
            .map(|o| o.collector.as_str())
            .collect()
    }
}

/// Registry of collectors.
#[derive(Default)]
pub struct AnalyticsDispatcher {
    collectors: RwLock<Vec<Arc<dyn AnalyticsCollector>>>,
}

impl AnalyticsDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, collector: Arc<dyn AnalyticsCollector>) {
        debug!(collector = %collector.name(), "registered analytics collector");
        self.collectors.write().push(collector);
    }

    pub fn len(&self) -> usize {
        self.collectors.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.collectors.read().is_empty()
    }

    /// Deliver a batch to every collector concurrently.
    pub async fn dispatch(
        &self,
        action: &str,
        tags: &BTreeMap<String, String>,
        events: &[AnalyticsEvent],
    ) -> AnalyticsReport {
        let collectors: Vec<_> = self.collectors.read().clone();

        let results = join_all(
            collectors
                .iter()
                .map(|collector| collector.record(action, tags, events)),
        )
        .await;

        let outcomes = collectors
            .iter()
            .zip(results)
            .map(|(collector, result)| {
                if let Err(ref e) = result {
                    warn!(collector = %collector.name(), error = %e, "analytics collector failed");
                }
                CollectorOutcome {
                    collector: collector.name().to_string(),
                    result,
                }
            })
            .collect();

        AnalyticsReport { outcomes }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    struct Recording {
        name: &'static str,
        fail: bool,
        seen: Mutex<Vec<(String, usize)>>,
    }

    impl Recording {
        fn new(name: &'static str, fail: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                fail,
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl AnalyticsCollector for Recording {
        fn name(&self) -> &str {
            self.name
        }

        async fn record(
            &self,
            action: &str,
            _tags: &BTreeMap<String, String>,
            events: &[AnalyticsEvent],
        ) -> Result<(), FlagsError> {
            self.seen.lock().push((action.to_string(), events.len()));
            if self.fail {
                Err(FlagsError::Analytics("sink unavailable".into()))
            } else {
                Ok(())
            }
        }
    }

    fn event(key: &str) -> AnalyticsEvent {
        AnalyticsEvent {
            action: "checkout".into(),
            feature_key: key.into(),
            feature_type: FeatureType::Boolean,
            value: Value::Bool(true),
            version: 1,
            timestamp: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let dispatcher = AnalyticsDispatcher::new();
        let failing = Recording::new("failing", true);
        let healthy = Recording::new("healthy", false);
        dispatcher.add(failing.clone());
        dispatcher.add(healthy.clone());

        let report = dispatcher
            .dispatch("checkout", &BTreeMap::new(), &[event("a"), event("b")])
            .await;

        assert!(!report.is_success());
        assert_eq!(report.failed(), vec!["failing"]);
        assert_eq!(*healthy.seen.lock(), vec![("checkout".to_string(), 2)]);
        assert_eq!(failing.seen.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_no_collectors() {
        let dispatcher = AnalyticsDispatcher::new();
        assert!(dispatcher.is_empty());
        let report = dispatcher.dispatch("x", &BTreeMap::new(), &[]).await;
        assert!(report.is_success());
        assert!(report.outcomes.is_empty());
    }

    #[tokio::test]
    async fn test_logging_collector_succeeds() {
        let tags = BTreeMap::from([("user".to_string(), "u1".to_string())]);
        LoggingCollector
            .record("view", &tags, &[event("a")])
            .await
            .unwrap();
    }

    #[test]
    fn test_event_serializes() {
        let json = serde_json::to_value(event("a")).unwrap();
        assert_eq!(json["feature_key"], "a");
        assert_eq!(json["feature_type"], "BOOLEAN");
    }
}
