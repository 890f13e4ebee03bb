//! Stateful property testing for the feature replica.
//!
//! Drives the repository and readiness gate with arbitrary sequences of
//! stream messages and checks them against a reference model that tracks:
//!
//! - Stored version and value per key (stale updates discarded, full
//!   syncs never lower a stored version)
//! - Number of change events each message should emit
//! - Readiness (opens on the first accepted message, never closes)

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{StreamExt, stream};
use proptest::prelude::*;
use proptest_state_machine::{ReferenceStateMachine, StateMachineTest, prop_state_machine};
use tokio::sync::mpsc;

use flagsync::readiness::ReadinessGate;
use flagsync::session::StreamingSession;
use flagsync::{
    ClientConfig, Connector, FeatureChange, FeatureRecord, FeatureRepository, FeatureType,
    FlagsError, MessageStream, StreamMessage,
};

const KEYS: [&str; 4] = ["alpha", "beta", "gamma", "delta"];

fn record(key: usize, version: u64, value: bool) -> FeatureRecord {
    FeatureRecord::new(KEYS[key], FeatureType::Boolean, value, version)
}

/// Operations the stream can deliver.
#[derive(Debug, Clone)]
pub enum ReplicaOperation {
    Upsert { key: usize, version: u64, value: bool },
    Delete { key: usize },
    FullSync { records: Vec<(usize, u64, bool)> },
    Heartbeat,
}

impl ReplicaOperation {
    fn message(&self) -> StreamMessage {
        match self {
            ReplicaOperation::Upsert { key, version, value } => {
                StreamMessage::Upsert(record(*key, *version, *value))
            }
            ReplicaOperation::Delete { key } => StreamMessage::Delete {
                key: KEYS[*key].to_string(),
            },
            ReplicaOperation::FullSync { records } => StreamMessage::FullSync(
                records
                    .iter()
                    .map(|(key, version, value)| record(*key, *version, *value))
                    .collect(),
            ),
            ReplicaOperation::Heartbeat => StreamMessage::Heartbeat,
        }
    }
}

/// Reference model of the replica.
#[derive(Clone, Debug, Default)]
pub struct ReplicaModel {
    /// key -> (version, value)
    pub features: BTreeMap<String, (u64, bool)>,
    pub ready: bool,
    /// Events the last operation should have emitted.
    pub last_events: usize,
}

impl ReferenceStateMachine for ReplicaModel {
    type State = Self;
    type Transition = ReplicaOperation;

    fn init_state() -> BoxedStrategy<Self::State> {
        Just(Self::default()).boxed()
    }

    fn transitions(_state: &Self::State) -> BoxedStrategy<Self::Transition> {
        let entry = (0..KEYS.len(), 0u64..8, any::<bool>());
        prop_oneof![
            4 => entry.clone().prop_map(|(key, version, value)| ReplicaOperation::Upsert { key, version, value }),
            2 => (0..KEYS.len()).prop_map(|key| ReplicaOperation::Delete { key }),
            1 => prop::collection::vec(entry, 0..6).prop_map(|records| ReplicaOperation::FullSync { records }),
            1 => Just(ReplicaOperation::Heartbeat),
        ]
        .boxed()
    }

    fn apply(mut state: Self::State, transition: &Self::Transition) -> Self::State {
        state.last_events = 0;
        match transition {
            ReplicaOperation::Upsert { key, version, value } => {
                let key = KEYS[*key].to_string();
                let accepted = match state.features.get(&key) {
                    Some((stored, _)) => version > stored,
                    None => true,
                };
                if accepted {
                    let changed = match state.features.get(&key) {
                        Some((_, old)) => old != value,
                        None => true,
                    };
                    if changed {
                        state.last_events = 1;
                    }
                    state.features.insert(key, (*version, *value));
                    state.ready = true;
                }
            }
            ReplicaOperation::Delete { key } => {
                if state.features.remove(KEYS[*key]).is_some() {
                    state.last_events = 1;
                    state.ready = true;
                }
            }
            ReplicaOperation::FullSync { records } => {
                let mut incoming: BTreeMap<String, (u64, bool)> = BTreeMap::new();
                for (key, version, value) in records {
                    let key = KEYS[*key].to_string();
                    match incoming.get(&key) {
                        Some((existing, _)) if existing > version => {}
                        _ => {
                            incoming.insert(key, (*version, *value));
                        }
                    }
                }
                for (key, entry) in incoming.iter_mut() {
                    if let Some(stored) = state.features.get(key)
                        && stored.0 > entry.0
                    {
                        *entry = *stored;
                    }
                }
                let upserts = incoming
                    .iter()
                    .filter(|(key, entry)| state.features.get(*key) != Some(entry))
                    .count();
                let removals = state
                    .features
                    .keys()
                    .filter(|key| !incoming.contains_key(*key))
                    .count();
                state.last_events = upserts + removals;
                state.features = incoming;
                state.ready = true;
            }
            ReplicaOperation::Heartbeat => {}
        }
        state
    }
}

/// Connector for a session that is only driven through `apply`.
struct IdleConnector;

#[async_trait]
impl Connector for IdleConnector {
    async fn connect(&self, _server: &str, _api_key: &str) -> Result<MessageStream, FlagsError> {
        Ok(stream::pending().boxed())
    }
}

/// Real session, repository, gate and change subscription.
pub struct ReplicaHarness {
    session: StreamingSession,
    repository: Arc<FeatureRepository>,
    readiness: Arc<ReadinessGate>,
    changes: mpsc::UnboundedReceiver<FeatureChange>,
}

impl ReplicaHarness {
    fn new() -> Self {
        let repository = FeatureRepository::new();
        let changes = repository.subscribe();
        let readiness = Arc::new(ReadinessGate::new());
        let session = StreamingSession::new(
            &ClientConfig::new("http://flags.test", "test-key"),
            Arc::new(IdleConnector),
            Arc::clone(&repository),
            Arc::clone(&readiness),
        );
        Self {
            session,
            repository,
            readiness,
            changes,
        }
    }

    fn apply_message(&self, message: StreamMessage) {
        self.session
            .apply(message)
            .expect("data messages never end the session");
    }

    fn drain_events(&mut self) -> usize {
        let mut count = 0;
        while self.changes.try_recv().is_ok() {
            count += 1;
        }
        count
    }

    fn verify_invariants(&self, model: &ReplicaModel) {
        let actual: BTreeMap<String, (u64, bool)> = self
            .repository
            .snapshot()
            .iter()
            .map(|r| (r.key.clone(), (r.version, r.value.as_bool().unwrap_or_default())))
            .collect();
        assert_eq!(actual, model.features, "replica diverged from model");
        assert_eq!(
            self.readiness.is_ready(),
            model.ready,
            "readiness mismatch"
        );
    }
}

impl StateMachineTest for ReplicaHarness {
    type SystemUnderTest = Self;
    type Reference = ReplicaModel;

    fn init_test(
        _ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) -> Self::SystemUnderTest {
        Self::new()
    }

    fn apply(
        mut state: Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
        transition: <Self::Reference as ReferenceStateMachine>::Transition,
    ) -> Self::SystemUnderTest {
        state.apply_message(transition.message());
        let events = state.drain_events();
        assert_eq!(
            events, ref_state.last_events,
            "event count mismatch for {:?}",
            transition
        );
        state.verify_invariants(ref_state);
        state
    }

    fn check_invariants(
        state: &Self::SystemUnderTest,
        ref_state: &<Self::Reference as ReferenceStateMachine>::State,
    ) {
        state.verify_invariants(ref_state);
    }
}

prop_state_machine! {
    #![proptest_config(ProptestConfig {
        cases: 100,
        max_shrink_iters: 10000,
        ..ProptestConfig::default()
    })]

    #[test]
    fn replica_state_machine_test(sequential 1..40 => ReplicaHarness);
}

#[test]
fn test_stale_update_after_full_sync_is_discarded() {
    let repository = FeatureRepository::new();
    repository.apply_full_sync(vec![record(0, 5, true)]);
    assert!(!repository.apply_update(record(0, 3, false)));
    assert_eq!(repository.get("alpha").unwrap().version, 5);
}

#[test]
fn test_full_sync_never_lowers_version() {
    let repository = FeatureRepository::new();
    repository.apply_update(record(0, 5, true));
    repository.apply_full_sync(vec![record(0, 2, false)]);
    assert_eq!(repository.get("alpha").unwrap().version, 5);
    assert!(!repository.apply_update(record(0, 3, false)));
    assert_eq!(repository.get("alpha").unwrap().version, 5);
}
