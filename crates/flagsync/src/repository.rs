//! In-memory replica of the feature service's records.
//!
//! The repository is written by the streaming session only and read by any
//! number of callers. Every write happens under a single write lock, so a
//! reader sees either the state before or after an update, never a mix.

use std::collections::HashMap;
use std::sync::Arc;

use flagsync_core::FeatureRecord;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::FlagsError;

/// What happened to a key.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeKind {
    /// The key now holds this record.
    Upserted(Arc<FeatureRecord>),
    /// The key was removed.
    Deleted,
}

/// A change event for a single key.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureChange {
    pub key: String,
    pub kind: ChangeKind,
}

impl FeatureChange {
    fn upserted(record: Arc<FeatureRecord>) -> Self {
        Self {
            key: record.key.clone(),
            kind: ChangeKind::Upserted(record),
        }
    }

    fn deleted(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind: ChangeKind::Deleted,
        }
    }

    /// The new record, or `None` for a deletion.
    pub fn record(&self) -> Option<&FeatureRecord> {
        match &self.kind {
            ChangeKind::Upserted(record) => Some(record),
            ChangeKind::Deleted => None,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self.kind, ChangeKind::Deleted)
    }
}

/// Thread-safe feature store with change detection.
pub struct FeatureRepository {
    features: RwLock<HashMap<String, Arc<FeatureRecord>>>,
    /// Lossless change subscribers. Closed receivers are pruned on send.
    subscribers: Mutex<Vec<mpsc::UnboundedSender<FeatureChange>>>,
}

impl FeatureRepository {
    /// Create a new empty repository.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            features: RwLock::new(HashMap::new()),
            subscribers: Mutex::new(Vec::new()),
        })
    }

    /// Subscribe to change events.
    ///
    /// Events arrive in the order updates were applied, after the store
    /// reflects them.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<FeatureChange> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    fn emit(&self, change: FeatureChange) {
        trace!(key = %change.key, delete = change.is_delete(), "emitting feature change");
        self.subscribers
            .lock()
            .retain(|tx| tx.send(change.clone()).is_ok());
    }

    /// Get the current record for a key.
    pub fn get(&self, key: &str) -> Result<Arc<FeatureRecord>, FlagsError> {
        self.features
            .read()
            .get(key)
            .cloned()
            .ok_or_else(|| FlagsError::NotFound(key.to_string()))
    }

    /// Whether a key is present.
    pub fn contains(&self, key: &str) -> bool {
        self.features.read().contains_key(key)
    }

    /// Insert or replace a record if its version is newer than the stored one.
    ///
    /// Returns whether the update was accepted. An accepted update emits a
    /// change event only if the definition actually changed.
    pub fn apply_update(&self, record: FeatureRecord) -> bool {
        let mut features = self.features.write();

        let changed = match features.get(&record.key) {
            Some(current) if record.version <= current.version => {
                trace!(
                    key = %record.key,
                    version = record.version,
                    stored = current.version,
                    "discarding stale feature update"
                );
                return false;
            }
            Some(current) => current.differs_from(&record),
            None => true,
        };

        debug!(key = %record.key, version = record.version, changed, "applied feature update");
        let record = Arc::new(record);
        features.insert(record.key.clone(), Arc::clone(&record));

        if changed {
            self.emit(FeatureChange::upserted(record));
        }
        true
    }

    /// Remove a key. Returns whether anything was removed.
    pub fn apply_delete(&self, key: &str) -> bool {
        let mut features = self.features.write();
        if features.remove(key).is_none() {
            trace!(key = %key, "delete for unknown feature ignored");
            return false;
        }

        debug!(key = %key, "deleted feature");
        self.emit(FeatureChange::deleted(key));
        true
    }

    /// Replace the entire store.
    ///
    /// A stored record newer than the sync's entry for the same key is kept,
    /// so versions never go backwards. Keys absent from the sync are removed.
    ///
    /// Emits one event per key whose value, version or strategies changed,
    /// plus a deletion per key the sync dropped. Returns the number of events
    /// emitted.
    pub fn apply_full_sync(&self, records: Vec<FeatureRecord>) -> usize {
        let mut incoming: HashMap<String, Arc<FeatureRecord>> = HashMap::with_capacity(records.len());
        for record in records {
            // Duplicate keys in one sync: the highest version wins
            match incoming.get(&record.key) {
                Some(existing) if existing.version > record.version => {}
                _ => {
                    incoming.insert(record.key.clone(), Arc::new(record));
                }
            }
        }

        let mut features = self.features.write();
        for (key, record) in incoming.iter_mut() {
            if let Some(stored) = features.get(key)
                && stored.version > record.version
            {
                trace!(
                    key = %key,
                    version = record.version,
                    stored = stored.version,
                    "full sync entry older than stored record, keeping stored"
                );
                *record = Arc::clone(stored);
            }
        }
        let previous = std::mem::replace(&mut *features, incoming);

        let mut changes = Vec::new();
        let mut upserts: Vec<&Arc<FeatureRecord>> = features
            .values()
            .filter(|record| match previous.get(&record.key) {
                Some(old) => old.version != record.version || old.differs_from(record),
                None => true,
            })
            .collect();
        upserts.sort_by(|a, b| a.key.cmp(&b.key));
        changes.extend(upserts.into_iter().map(|r| FeatureChange::upserted(Arc::clone(r))));

        let mut removed: Vec<&String> = previous.keys().filter(|k| !features.contains_key(*k)).collect();
        removed.sort();
        changes.extend(removed.into_iter().map(|k| FeatureChange::deleted(k.as_str())));

        debug!(
            features = features.len(),
            changes = changes.len(),
            "applied full sync"
        );

        let count = changes.len();
        for change in changes {
            self.emit(change);
        }
        count
    }

    /// All records, sorted by key.
    pub fn snapshot(&self) -> Vec<Arc<FeatureRecord>> {
        let mut records: Vec<_> = self.features.read().values().cloned().collect();
        records.sort_by(|a, b| a.key.cmp(&b.key));
        records
    }

    /// All keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.features.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.features.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.read().is_empty()
    }
}
