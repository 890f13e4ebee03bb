//! Per-key change callbacks.
//!
//! The dispatcher task reads repository change events and hands each one to
//! a worker task owned by its key. One worker per key keeps a key's
//! callbacks in application order while a slow callback only delays its own
//! key.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use flagsync_core::FeatureRecord;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

use crate::FlagsError;
use crate::repository::FeatureChange;
use crate::typed::{read_boolean, read_number, read_raw_json, read_string};

/// Callback receiving the full record, or `None` when the key was deleted.
pub type FeatureCallback = Arc<dyn Fn(Option<&FeatureRecord>) + Send + Sync>;
pub type BooleanCallback = Arc<dyn Fn(bool) + Send + Sync>;
pub type NumberCallback = Arc<dyn Fn(f64) + Send + Sync>;
pub type StringCallback = Arc<dyn Fn(String) + Send + Sync>;
/// Callback receiving the raw JSON text of a JSON feature.
pub type JsonCallback = Arc<dyn Fn(String) + Send + Sync>;

/// A registered callback and the value type it expects.
#[derive(Clone)]
pub enum Notifier {
    Feature(FeatureCallback),
    Boolean(BooleanCallback),
    Number(NumberCallback),
    String(StringCallback),
    Json(JsonCallback),
}

impl Notifier {
    fn type_name(&self) -> &'static str {
        match self {
            Notifier::Feature(_) => "feature",
            Notifier::Boolean(_) => "boolean",
            Notifier::Number(_) => "number",
            Notifier::String(_) => "string",
            Notifier::Json(_) => "json",
        }
    }

    /// Invoke the callback for a change. Typed callbacks skip deletions and
    /// values that do not read as their type.
    fn notify(&self, change: &FeatureChange) {
        if let Notifier::Feature(callback) = self {
            callback(change.record());
            return;
        }

        let Some(record) = change.record() else {
            trace!(key = %change.key, notifier = self.type_name(), "skipping deletion for typed notifier");
            return;
        };

        let delivered = match self {
            Notifier::Feature(_) => Ok(()),
            Notifier::Boolean(callback) => read_boolean(record, &record.value).map(|v| callback(v)),
            Notifier::Number(callback) => read_number(record, &record.value).map(|v| callback(v)),
            Notifier::String(callback) => read_string(record, &record.value).map(|v| callback(v)),
            Notifier::Json(callback) => read_raw_json(record, &record.value).map(|v| callback(v)),
        };

        if let Err(e) = delivered {
            debug!(key = %change.key, notifier = self.type_name(), error = %e, "notifier skipped");
        }
    }
}

/// Registry of callbacks by feature key.
#[derive(Default)]
pub struct NotifierRegistry {
    notifiers: DashMap<String, Vec<Notifier>>,
}

impl NotifierRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a callback. Keys that do not exist yet are valid.
    pub fn add(&self, key: impl Into<String>, notifier: Notifier) {
        let key = key.into();
        debug!(key = %key, notifier = notifier.type_name(), "registered notifier");
        self.notifiers.entry(key).or_default().push(notifier);
    }

    pub fn add_feature(
        &self,
        key: impl Into<String>,
        callback: impl Fn(Option<&FeatureRecord>) + Send + Sync + 'static,
    ) {
        self.add(key, Notifier::Feature(Arc::new(callback)));
    }

    pub fn add_boolean(&self, key: impl Into<String>, callback: impl Fn(bool) + Send + Sync + 'static) {
        self.add(key, Notifier::Boolean(Arc::new(callback)));
    }

    pub fn add_number(&self, key: impl Into<String>, callback: impl Fn(f64) + Send + Sync + 'static) {
        self.add(key, Notifier::Number(Arc::new(callback)));
    }

    pub fn add_string(&self, key: impl Into<String>, callback: impl Fn(String) + Send + Sync + 'static) {
        self.add(key, Notifier::String(Arc::new(callback)));
    }

    pub fn add_json(&self, key: impl Into<String>, callback: impl Fn(String) + Send + Sync + 'static) {
        self.add(key, Notifier::Json(Arc::new(callback)));
    }

    /// Remove every callback for a key, returning how many were removed.
    pub fn delete(&self, key: &str) -> Result<usize, FlagsError> {
        match self.notifiers.remove(key) {
            Some((_, removed)) if !removed.is_empty() => {
                debug!(key = %key, count = removed.len(), "removed notifiers");
                Ok(removed.len())
            }
            _ => Err(FlagsError::NotifierNotFound(key.to_string())),
        }
    }

    pub fn has_notifiers(&self, key: &str) -> bool {
        self.notifiers.get(key).is_some_and(|n| !n.is_empty())
    }

    /// Number of registered callbacks for a key.
    pub fn count(&self, key: &str) -> usize {
        self.notifiers.get(key).map_or(0, |n| n.len())
    }

    /// Drop every registered callback.
    pub fn clear(&self) {
        self.notifiers.clear();
    }

    /// Run every callback registered for the change's key.
    ///
    /// Callbacks are copied out first so they run without holding the map
    /// shard, letting a callback register or delete notifiers itself.
    pub fn dispatch(&self, change: &FeatureChange) {
        let notifiers = match self.notifiers.get(&change.key) {
            Some(entry) => entry.value().clone(),
            None => return,
        };
        for notifier in &notifiers {
            notifier.notify(change);
        }
    }

    /// Spawn the dispatcher task.
    ///
    /// Runs until shutdown is signalled or the change channel closes.
    pub fn spawn_dispatcher(
        self: &Arc<Self>,
        mut changes: mpsc::UnboundedReceiver<FeatureChange>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut workers: HashMap<String, mpsc::UnboundedSender<FeatureChange>> = HashMap::new();

            loop {
                tokio::select! {
                    biased;

                    changed = shutdown_rx.changed() => {
                        if changed.is_err() || *shutdown_rx.borrow() {
                            info!("notifier dispatcher shutting down");
                            break;
                        }
                    }

                    change = changes.recv() => {
                        let Some(change) = change else {
                            debug!("change channel closed, notifier dispatcher exiting");
                            break;
                        };
                        registry.forward(&mut workers, change);
                    }
                }
            }
        })
    }

    /// Hand a change to its key's worker.
    ///
    /// Workers for keys whose notifiers were deleted are dropped, which ends
    /// the worker once its queue drains.
    fn forward(
        self: &Arc<Self>,
        workers: &mut HashMap<String, mpsc::UnboundedSender<FeatureChange>>,
        change: FeatureChange,
    ) {
        workers.retain(|key, _| {
            let keep = self.has_notifiers(key);
            if !keep {
                trace!(key = %key, "dropping notifier worker");
            }
            keep
        });
        if self.has_notifiers(&change.key) {
            self.route(workers, change);
        }
    }

    fn route(
        self: &Arc<Self>,
        workers: &mut HashMap<String, mpsc::UnboundedSender<FeatureChange>>,
        change: FeatureChange,
    ) {
        let change = match workers.get(&change.key) {
            Some(tx) => match tx.send(change) {
                Ok(()) => return,
                // Worker died (a callback panicked); replace it
                Err(mpsc::error::SendError(change)) => change,
            },
            None => change,
        };

        let (tx, mut rx) = mpsc::unbounded_channel::<FeatureChange>();
        let registry = Arc::clone(self);
        let key = change.key.clone();
        trace!(key = %key, "spawning notifier worker");
        tokio::spawn(async move {
            while let Some(change) = rx.recv().await {
                registry.dispatch(&change);
            }
        });

        if tx.send(change).is_ok() {
            workers.insert(key, tx);
        }
    }
}
