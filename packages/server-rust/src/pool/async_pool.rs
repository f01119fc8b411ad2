//! Bounded worker pool.
//!
//! `AsyncPool` runs a fixed number of worker tasks pulling jobs from one
//! bounded mpsc channel. Submitting work returns a barrier that opens when
//! the job finishes. A full queue makes `schedule` wait for room instead of
//! dropping work.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;

use arc_swap::ArcSwap;
use futures_util::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::barrier::{complete_with, Barrier, StatefulBarrier};
use crate::service::config::PoolConfig;

pub const MIN_WORKER_SIZE: usize = 2;
pub const MAX_WORKER_SIZE: usize = 1024;
pub const MIN_QUEUE_CAPACITY: usize = 16;
pub const MAX_QUEUE_CAPACITY: usize = 2048;

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Pool lifecycle.
///
/// State machine: Idle -> Running -> Terminating -> Terminated. Never moves
/// backwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PoolStatus {
    /// Constructed, no workers spawned yet.
    Idle,
    /// Workers are accepting jobs.
    Running,
    /// Queue closed, workers draining.
    Terminating,
    /// All workers exited.
    Terminated,
}

/// Errors returned when submitting work.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("pool {id} has been stopped")]
    Terminated { id: String },
}

struct Lifecycle {
    tx: Option<mpsc::Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

/// Fixed-size worker pool with a bounded job queue.
///
/// The pool starts lazily on the first `schedule` unless it has been
/// stopped; once stopped it never restarts.
pub struct AsyncPool {
    id: Arc<str>,
    worker_size: usize,
    queue_capacity: usize,
    status: ArcSwap<PoolStatus>,
    lifecycle: parking_lot::Mutex<Lifecycle>,
}

impl AsyncPool {
    /// Creates an idle pool. Sizes are clamped to
    /// `[MIN_WORKER_SIZE, MAX_WORKER_SIZE]` and
    /// `[MIN_QUEUE_CAPACITY, MAX_QUEUE_CAPACITY]`.
    #[must_use]
    pub fn new(id: impl Into<String>, worker_size: usize, queue_capacity: usize) -> Self {
        Self {
            id: Arc::from(id.into()),
            worker_size: worker_size.clamp(MIN_WORKER_SIZE, MAX_WORKER_SIZE),
            queue_capacity: queue_capacity.clamp(MIN_QUEUE_CAPACITY, MAX_QUEUE_CAPACITY),
            status: ArcSwap::from_pointee(PoolStatus::Idle),
            lifecycle: parking_lot::Mutex::new(Lifecycle {
                tx: None,
                workers: Vec::new(),
            }),
        }
    }

    #[must_use]
    pub fn from_config(id: impl Into<String>, config: &PoolConfig) -> Self {
        Self::new(id, config.worker_size, config.queue_capacity)
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn worker_size(&self) -> usize {
        self.worker_size
    }

    #[must_use]
    pub fn queue_capacity(&self) -> usize {
        self.queue_capacity
    }

    #[must_use]
    pub fn status(&self) -> PoolStatus {
        **self.status.load()
    }

    /// Spawns the workers. A no-op on a running pool.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Terminated` if the pool has been stopped.
    pub fn start(&self) -> Result<(), PoolError> {
        let mut lifecycle = self.lifecycle.lock();
        self.start_locked(&mut lifecycle).map(|_| ())
    }

    fn start_locked(&self, lifecycle: &mut Lifecycle) -> Result<mpsc::Sender<Job>, PoolError> {
        match self.status() {
            PoolStatus::Running => {
                if let Some(tx) = &lifecycle.tx {
                    return Ok(tx.clone());
                }
                Err(self.terminated())
            }
            PoolStatus::Terminating | PoolStatus::Terminated => Err(self.terminated()),
            PoolStatus::Idle => {
                let (tx, rx) = mpsc::channel::<Job>(self.queue_capacity);
                let rx = Arc::new(tokio::sync::Mutex::new(rx));
                lifecycle.workers = (0..self.worker_size)
                    .map(|index| tokio::spawn(worker_loop(Arc::clone(&self.id), index, Arc::clone(&rx))))
                    .collect();
                lifecycle.tx = Some(tx.clone());
                self.status.store(Arc::new(PoolStatus::Running));
                debug!(
                    pool = %self.id,
                    workers = self.worker_size,
                    queue_capacity = self.queue_capacity,
                    "async pool started"
                );
                Ok(tx)
            }
        }
    }

    fn terminated(&self) -> PoolError {
        PoolError::Terminated {
            id: self.id.to_string(),
        }
    }

    fn sender(&self) -> Result<mpsc::Sender<Job>, PoolError> {
        let mut lifecycle = self.lifecycle.lock();
        self.start_locked(&mut lifecycle)
    }

    /// Enqueues `work`, returning a barrier that opens once it has run.
    ///
    /// Waits while the queue is full.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Terminated` if the pool has been stopped.
    pub async fn schedule<F>(&self, work: F) -> Result<Barrier, PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.schedule_computable(work).await
    }

    /// Enqueues `work`, returning a barrier carrying its output.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::Terminated` if the pool has been stopped.
    pub async fn schedule_computable<T, F>(&self, work: F) -> Result<StatefulBarrier<T>, PoolError>
    where
        T: Send + Sync + 'static,
        F: Future<Output = T> + Send + 'static,
    {
        let tx = self.sender()?;
        let barrier = StatefulBarrier::new();
        let job: Job = Box::pin(complete_with(barrier.clone(), work));
        tx.send(job).await.map_err(|_| self.terminated())?;
        Ok(barrier)
    }

    /// Closes the queue, waits for the workers to drain it and marks the
    /// pool terminated. Later calls return immediately.
    pub async fn stop(&self) {
        let workers = {
            let mut lifecycle = self.lifecycle.lock();
            if self.status() >= PoolStatus::Terminating {
                return;
            }
            self.status.store(Arc::new(PoolStatus::Terminating));
            lifecycle.tx = None;
            std::mem::take(&mut lifecycle.workers)
        };

        for worker in workers {
            if let Err(e) = worker.await {
                error!(pool = %self.id, error = %e, "worker exited abnormally");
            }
        }

        self.status.store(Arc::new(PoolStatus::Terminated));
        debug!(pool = %self.id, "async pool terminated");
    }
}

impl std::fmt::Debug for AsyncPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncPool")
            .field("id", &self.id)
            .field("worker_size", &self.worker_size)
            .field("queue_capacity", &self.queue_capacity)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

async fn worker_loop(
    pool_id: Arc<str>,
    index: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
) {
    loop {
        let job = rx.lock().await.recv().await;
        let Some(job) = job else {
            break;
        };
        // A panicking job leaves its barrier closed; the worker keeps serving.
        if AssertUnwindSafe(job).catch_unwind().await.is_err() {
            error!(pool = %pool_id, worker = index, "scheduled job panicked");
        }
    }
    debug!(pool = %pool_id, worker = index, "worker exiting");
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[test]
    fn sizes_are_clamped() {
        let pool = AsyncPool::new("p", 0, 1_000_000);
        assert_eq!(pool.worker_size(), 2);
        assert_eq!(pool.queue_capacity(), 2048);

        let pool = AsyncPool::new("p", 5_000, 1);
        assert_eq!(pool.worker_size(), 1024);
        assert_eq!(pool.queue_capacity(), 16);

        let pool = AsyncPool::new("p", 8, 64);
        assert_eq!(pool.worker_size(), 8);
        assert_eq!(pool.queue_capacity(), 64);
    }

    #[tokio::test]
    async fn lazy_start_and_monotonic_status() {
        let pool = AsyncPool::new("p", 2, 16);
        assert_eq!(pool.status(), PoolStatus::Idle);

        let done = pool.schedule(async {}).await.unwrap();
        assert_eq!(pool.status(), PoolStatus::Running);
        done.wait().await;

        pool.stop().await;
        assert_eq!(pool.status(), PoolStatus::Terminated);

        // Never restarts.
        assert!(pool.start().is_err());
        assert_eq!(pool.status(), PoolStatus::Terminated);
    }

    #[tokio::test]
    async fn schedule_after_stop_is_rejected() {
        let pool = AsyncPool::new("p", 2, 16);
        pool.start().unwrap();
        pool.stop().await;
        let err = pool.schedule(async {}).await.unwrap_err();
        assert_eq!(err, PoolError::Terminated { id: "p".into() });
    }

    #[tokio::test]
    async fn stop_on_idle_pool_terminates() {
        let pool = AsyncPool::new("p", 2, 16);
        pool.stop().await;
        assert_eq!(pool.status(), PoolStatus::Terminated);
        assert!(pool.schedule(async {}).await.is_err());
    }

    #[tokio::test]
    async fn computable_barrier_carries_output() {
        let pool = AsyncPool::new("p", 2, 16);
        let answer = pool.schedule_computable(async { 6 * 7 }).await.unwrap();
        assert_eq!(*answer.get().await, 42);
        pool.stop().await;
    }

    #[tokio::test]
    async fn stop_drains_queued_work() {
        let pool = AsyncPool::new("p", 2, 32);
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..20 {
            let c = Arc::clone(&counter);
            pool.schedule(async move {
                tokio::task::yield_now().await;
                c.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();
        }
        pool.stop().await;
        assert_eq!(counter.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn full_queue_applies_backpressure() {
        let pool = AsyncPool::new("p", 2, 16);
        let gate = Barrier::new();

        // Two jobs occupy the workers, sixteen fill the queue.
        for _ in 0..18 {
            let g = gate.clone();
            pool.schedule(async move { g.wait().await }).await.unwrap();
        }

        let blocked = tokio::time::timeout(Duration::from_millis(50), pool.schedule(async {})).await;
        assert!(blocked.is_err(), "schedule should wait while the queue is full");

        gate.open();
        let done = pool.schedule(async {}).await.unwrap();
        done.wait().await;
        pool.stop().await;
    }

    #[tokio::test]
    async fn panicking_job_does_not_kill_worker() {
        let pool = AsyncPool::new("p", 2, 16);
        let first = pool.schedule(async { panic!("boom") }).await.unwrap();
        let second = pool.schedule(async { panic!("boom") }).await.unwrap();
        let ok = pool.schedule_computable(async { "alive" }).await.unwrap();
        assert_eq!(*ok.get().await, "alive");
        assert!(!first.is_open());
        assert!(!second.is_open());
        pool.stop().await;
    }
}
