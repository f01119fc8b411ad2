//! Hub lifecycle with in-flight request tracking.
//!
//! The state lives in an `ArcSwap` so readers never lock. In-flight work
//! holds an [`InFlightGuard`]; the last guard to drop wakes anyone waiting
//! for the drain.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::{watch, Notify};

/// State machine: Starting -> Ready -> Draining -> Stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubState {
    /// Built, not yet accepting requests.
    Starting,
    Ready,
    /// Refusing new requests while in-flight ones finish.
    Draining,
    Stopped,
}

#[derive(Debug)]
struct InFlight {
    count: AtomicU64,
    drained: Notify,
}

#[derive(Debug)]
pub struct HubLifecycle {
    state: ArcSwap<HubState>,
    shutdown_signal: watch::Sender<bool>,
    in_flight: Arc<InFlight>,
}

impl HubLifecycle {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            state: ArcSwap::from_pointee(HubState::Starting),
            shutdown_signal: tx,
            in_flight: Arc::new(InFlight {
                count: AtomicU64::new(0),
                drained: Notify::new(),
            }),
        }
    }

    #[must_use]
    pub fn state(&self) -> HubState {
        **self.state.load()
    }

    /// `Starting -> Ready`. Returns `false` from any other state.
    pub fn set_ready(&self) -> bool {
        self.transit(|current| current == HubState::Starting, HubState::Ready)
    }

    /// Swaps in `next` if `allowed` holds for the current state.
    fn transit(&self, allowed: impl Fn(HubState) -> bool, next: HubState) -> bool {
        let mut moved = false;
        self.state.rcu(|current| {
            moved = allowed(**current);
            if moved {
                Arc::new(next)
            } else {
                Arc::clone(current)
            }
        });
        moved
    }

    /// Moves to `Draining` and signals shutdown receivers. Returns `false`
    /// if the hub was already draining or stopped.
    pub fn begin_drain(&self) -> bool {
        let began = self.transit(
            |current| matches!(current, HubState::Starting | HubState::Ready),
            HubState::Draining,
        );
        if began {
            // Receivers may have been dropped.
            let _ = self.shutdown_signal.send(true);
        }
        began
    }

    pub fn mark_stopped(&self) {
        self.state.store(Arc::new(HubState::Stopped));
        let _ = self.shutdown_signal.send(true);
    }

    /// Flips to `true` once draining begins.
    #[must_use]
    pub fn shutdown_receiver(&self) -> watch::Receiver<bool> {
        self.shutdown_signal.subscribe()
    }

    /// Registers one in-flight request. `None` unless the hub is `Ready`.
    #[must_use]
    pub fn try_enter(&self) -> Option<InFlightGuard> {
        // Count first, so a drain that starts right after the check still
        // waits for this guard.
        let guard = InFlightGuard::new(Arc::clone(&self.in_flight));
        (self.state() == HubState::Ready).then_some(guard)
    }

    #[must_use]
    pub fn in_flight_count(&self) -> u64 {
        self.in_flight.count.load(Ordering::Acquire)
    }

    /// Waits up to `timeout` for every guard to drop. Returns whether the
    /// hub drained in time.
    pub async fn wait_for_drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.in_flight.drained.notified();
            if self.in_flight_count() == 0 {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.in_flight_count() == 0;
            }
        }
    }
}

impl Default for HubLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrements the in-flight count on drop, also while unwinding.
#[derive(Debug)]
pub struct InFlightGuard {
    in_flight: Arc<InFlight>,
}

impl InFlightGuard {
    fn new(in_flight: Arc<InFlight>) -> Self {
        in_flight.count.fetch_add(1, Ordering::AcqRel);
        Self { in_flight }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        if self.in_flight.count.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.in_flight.drained.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_in_starting_and_refuses_work() {
        let lifecycle = HubLifecycle::new();
        assert_eq!(lifecycle.state(), HubState::Starting);
        assert!(lifecycle.try_enter().is_none());
        assert_eq!(lifecycle.in_flight_count(), 0);
    }

    #[test]
    fn ready_then_draining() {
        let lifecycle = HubLifecycle::new();
        assert!(lifecycle.set_ready());
        assert!(!lifecycle.set_ready());
        assert_eq!(lifecycle.state(), HubState::Ready);

        assert!(lifecycle.begin_drain());
        assert!(!lifecycle.begin_drain());
        assert_eq!(lifecycle.state(), HubState::Draining);
        assert!(!lifecycle.set_ready());
        assert_eq!(lifecycle.state(), HubState::Draining);
        assert!(lifecycle.try_enter().is_none());
    }

    #[test]
    fn guards_track_in_flight() {
        let lifecycle = HubLifecycle::new();
        lifecycle.set_ready();
        let a = lifecycle.try_enter().unwrap();
        let b = lifecycle.try_enter().unwrap();
        assert_eq!(lifecycle.in_flight_count(), 2);
        drop(a);
        assert_eq!(lifecycle.in_flight_count(), 1);
        drop(b);
        assert_eq!(lifecycle.in_flight_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_receiver_notified() {
        let lifecycle = HubLifecycle::new();
        let mut rx = lifecycle.shutdown_receiver();
        assert!(!*rx.borrow());
        lifecycle.begin_drain();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test(start_paused = true)]
    async fn drain_waits_for_last_guard() {
        let lifecycle = HubLifecycle::new();
        lifecycle.set_ready();
        let guard = lifecycle.try_enter().unwrap();
        lifecycle.begin_drain();

        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(guard);
        });
        assert!(lifecycle.wait_for_drain(Duration::from_secs(2)).await);
        release.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn drain_times_out_with_held_guard() {
        let lifecycle = HubLifecycle::new();
        lifecycle.set_ready();
        let _guard = lifecycle.try_enter().unwrap();
        lifecycle.begin_drain();
        assert!(!lifecycle.wait_for_drain(Duration::from_millis(50)).await);
        assert_eq!(lifecycle.state(), HubState::Draining);
    }
}
