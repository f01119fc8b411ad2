//! One-shot barriers.
//!
//! A barrier opens at most once, releasing every waiter. A
//! [`StatefulBarrier`] additionally carries the value it was opened with.
//! The opening is decided by `OnceLock::set`, so concurrent openers race on
//! a single atomic slot and every opener after the first is a no-op.

use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::Notify;

struct Shared<T> {
    value: OnceLock<T>,
    notify: Notify,
}

/// One-shot future carrying a value of type `T`.
///
/// Cloning yields another handle to the same barrier; producer and
/// consumers keep it alive jointly.
pub struct StatefulBarrier<T> {
    shared: Arc<Shared<T>>,
}

/// A barrier without a payload.
pub type Barrier = StatefulBarrier<()>;

impl<T> StatefulBarrier<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                value: OnceLock::new(),
                notify: Notify::new(),
            }),
        }
    }

    /// Stores `value` and opens the barrier.
    ///
    /// Returns `true` only for the call that actually opened it; later calls
    /// drop their value and leave the stored one untouched.
    pub fn open_with(&self, value: T) -> bool {
        if self.shared.value.set(value).is_ok() {
            self.shared.notify.notify_waiters();
            true
        } else {
            false
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.shared.value.get().is_some()
    }

    /// The stored value, if already open.
    #[must_use]
    pub fn try_get(&self) -> Option<&T> {
        self.shared.value.get()
    }

    /// Waits until the barrier opens.
    pub async fn wait(&self) {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            // Register before checking so an open between check and await is not missed.
            notified.as_mut().enable();
            if self.is_open() {
                return;
            }
            notified.await;
        }
    }

    /// Waits until the barrier opens, then returns the stored value.
    pub async fn get(&self) -> &T {
        loop {
            if let Some(value) = self.shared.value.get() {
                return value;
            }
            self.wait().await;
        }
    }

    /// Waits at most `timeout`. Returns whether the barrier is open.
    pub async fn wait_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.wait()).await.is_ok()
    }

    /// Number of live handles to this barrier.
    #[must_use]
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.shared)
    }
}

impl Barrier {
    /// Opens the barrier. Idempotent.
    pub fn open(&self) -> bool {
        self.open_with(())
    }
}

impl<T> Clone for StatefulBarrier<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> Default for StatefulBarrier<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for StatefulBarrier<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatefulBarrier")
            .field("open", &self.is_open())
            .finish()
    }
}

/// Runs `fut` and opens `barrier` with its output.
pub(crate) async fn complete_with<T, F>(barrier: StatefulBarrier<T>, fut: F)
where
    F: Future<Output = T>,
{
    barrier.open_with(fut.await);
}
