//! One-shot readiness latch.

use std::panic::{AssertUnwindSafe, catch_unwind};

use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Readiness of the client's replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadinessState {
    /// No data has been applied yet.
    NotReady,
    /// At least one update has been applied. Irreversible.
    Ready,
    /// The session closed on a terminal error before any data arrived.
    Failed,
}

/// Callback run once when the gate opens.
pub type ReadinessCallback = Box<dyn FnOnce() + Send>;

/// Latch that opens exactly once, on the first applied update.
pub struct ReadinessGate {
    state_tx: watch::Sender<ReadinessState>,
    listeners: Mutex<Vec<ReadinessCallback>>,
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}

impl ReadinessGate {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(ReadinessState::NotReady);
        Self {
            state_tx,
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> ReadinessState {
        *self.state_tx.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.state() == ReadinessState::Ready
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ReadinessState> {
        self.state_tx.subscribe()
    }

    /// Open the gate. Returns true only for the call that performed the
    /// transition.
    ///
    /// Pending listeners run on a blocking task when called inside a tokio
    /// runtime, so the caller never waits on them. Outside a runtime they
    /// run before this returns. A panicking listener is logged and does not
    /// stop the others.
    pub fn mark_ready(&self) -> bool {
        let pending = {
            let mut listeners = self.listeners.lock();
            if self.state() != ReadinessState::NotReady {
                return false;
            }
            self.state_tx.send_replace(ReadinessState::Ready);
            std::mem::take(&mut *listeners)
        };

        info!(listeners = pending.len(), "feature data ready");
        if pending.is_empty() {
            return true;
        }
        match Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(move || run_listeners(pending));
            }
            Err(_) => run_listeners(pending),
        }
        true
    }

    /// Record that the gate can never open. Pending listeners are released
    /// without being run.
    pub fn mark_failed(&self) -> bool {
        let mut listeners = self.listeners.lock();
        if self.state() != ReadinessState::NotReady {
            return false;
        }
        self.state_tx.send_replace(ReadinessState::Failed);
        debug!(released = listeners.len(), "readiness failed");
        listeners.clear();
        true
    }

    /// Register a listener.
    ///
    /// If the gate is already open the listener runs immediately on the
    /// calling thread.
    pub fn add_listener(&self, listener: impl FnOnce() + Send + 'static) {
        let mut listeners = self.listeners.lock();
        if self.state() == ReadinessState::Ready {
            drop(listeners);
            listener();
        } else {
            listeners.push(Box::new(listener));
        }
    }

    /// Drop every pending listener.
    pub fn clear_listeners(&self) {
        self.listeners.lock().clear();
    }
}

fn run_listeners(listeners: Vec<ReadinessCallback>) {
    for listener in listeners {
        if catch_unwind(AssertUnwindSafe(listener)).is_err() {
            warn!("readiness listener panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    fn counter() -> (Arc<AtomicUsize>, impl Fn() -> Box<dyn FnOnce() + Send>) {
        let count = Arc::new(AtomicUsize::new(0));
        let make = {
            let count = Arc::clone(&count);
            move || {
                let count = Arc::clone(&count);
                Box::new(move || {
                    count.fetch_add(1, Ordering::SeqCst);
                }) as Box<dyn FnOnce() + Send>
            }
        };
        (count, make)
    }

    #[test]
    fn test_fires_once() {
        let gate = ReadinessGate::new();
        let (count, make) = counter();
        gate.add_listener(make());
        gate.add_listener(make());

        assert!(gate.mark_ready());
        assert!(!gate.mark_ready());
        assert_eq!(count.load(Ordering::SeqCst), 2);
        assert!(gate.is_ready());
    }

    #[test]
    fn test_panicking_listener_does_not_stop_others() {
        let gate = ReadinessGate::new();
        let (count, make) = counter();
        gate.add_listener(|| panic!("listener failure"));
        gate.add_listener(make());

        assert!(gate.mark_ready());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_listeners_run_off_caller_task() {
        let gate = ReadinessGate::new();
        let (count, make) = counter();
        gate.add_listener(|| std::thread::sleep(Duration::from_millis(500)));
        gate.add_listener(make());

        let started = Instant::now();
        assert!(gate.mark_ready());
        assert!(started.elapsed() < Duration::from_millis(250));

        tokio::time::timeout(Duration::from_secs(5), async {
            while count.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_listener_after_ready_runs_inline() {
        let gate = ReadinessGate::new();
        gate.mark_ready();

        let (count, make) = counter();
        gate.add_listener(make());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_failed_releases_listeners() {
        let gate = ReadinessGate::new();
        let (count, make) = counter();
        gate.add_listener(make());

        assert!(gate.mark_failed());
        assert!(!gate.mark_ready());
        assert_eq!(gate.state(), ReadinessState::Failed);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failed_after_ready_is_ignored() {
        let gate = ReadinessGate::new();
        gate.mark_ready();
        assert!(!gate.mark_failed());
        assert_eq!(gate.state(), ReadinessState::Ready);
    }

    #[tokio::test]
    async fn test_subscribe_sees_transition() {
        let gate = ReadinessGate::new();
        let mut rx = gate.subscribe();
        gate.mark_ready();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), ReadinessState::Ready);
    }
}
