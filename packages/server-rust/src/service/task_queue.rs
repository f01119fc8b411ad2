//! Per-service admission and execution of requests.
//!
//! A queue admits each request id at most once, runs admitted requests on
//! the shared [`AsyncPool`] and hands them to the attached [`Executor`].
//! Requests run concurrently across pool workers, so completion order is not
//! admission order; the guarantee is that each admitted request is executed
//! at most once and always leaves the queue in a terminal state.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use parking_lot::RwLock;
use tracing::{debug, error, warn};

use super::request::{RequestError, RequestStatus, ServiceRequest};
use crate::pool::{AsyncPool, Barrier, PoolError};

/// Runs a request that the queue moved to `Processing`.
///
/// Implementations finish the request with `resolve`; a request still
/// processing when `execute` returns is killed by the queue.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, request: Arc<ServiceRequest>);
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("request {0} is not admitted")]
    NotAdmitted(String),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error("{} request(s) could not be ended", .0.len())]
    Aggregate(Vec<RequestError>),
}

type Admitted = Arc<RwLock<HashMap<String, Arc<ServiceRequest>>>>;
type ExecutorSlot = Arc<RwLock<Option<Arc<dyn Executor>>>>;

pub struct ServiceTaskQueue {
    service_id: Arc<str>,
    admitted: Admitted,
    executor: ExecutorSlot,
    pool: Arc<AsyncPool>,
}

impl ServiceTaskQueue {
    #[must_use]
    pub fn new(service_id: impl Into<String>, pool: Arc<AsyncPool>, executor: Arc<dyn Executor>) -> Self {
        Self {
            service_id: Arc::from(service_id.into()),
            admitted: Arc::new(RwLock::new(HashMap::new())),
            executor: Arc::new(RwLock::new(Some(executor))),
            pool,
        }
    }

    #[must_use]
    pub fn service_id(&self) -> &str {
        &self.service_id
    }

    /// Admits `request` and submits it to the pool.
    ///
    /// Returns `Ok(None)` when a request with the same id is already
    /// admitted; otherwise a barrier that opens once the request has left
    /// the queue.
    ///
    /// # Errors
    ///
    /// Returns the pool's error if it refuses the work; the request is then
    /// killed and forgotten.
    pub async fn schedule(&self, request: Arc<ServiceRequest>) -> Result<Option<Barrier>, PoolError> {
        {
            let mut admitted = self.admitted.write();
            if admitted.contains_key(request.id()) {
                debug!(service = %self.service_id, request = %request.id(), "duplicate admission ignored");
                return Ok(None);
            }
            admitted.insert(request.id().to_string(), Arc::clone(&request));
        }

        let job = run_admitted(
            Arc::clone(&self.service_id),
            Arc::clone(&self.admitted),
            Arc::clone(&self.executor),
            Arc::clone(&request),
        );
        match self.pool.schedule(job).await {
            Ok(done) => Ok(Some(done)),
            Err(e) => {
                self.admitted.write().remove(request.id());
                let _ = request.kill();
                warn!(service = %self.service_id, request = %request.id(), error = %e, "pool refused request");
                Err(e)
            }
        }
    }

    #[must_use]
    pub fn has(&self, id: &str) -> bool {
        self.admitted.read().contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.admitted.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.admitted.read().is_empty()
    }

    fn admitted(&self, id: &str) -> Result<Arc<ServiceRequest>, QueueError> {
        self.admitted
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| QueueError::NotAdmitted(id.to_string()))
    }

    /// Cancels an admitted request.
    ///
    /// # Errors
    ///
    /// `NotAdmitted` for unknown ids, or the request's own error if it has
    /// already ended.
    pub fn cancel(&self, id: &str) -> Result<(), QueueError> {
        Ok(self.admitted(id)?.cancel()?)
    }

    /// Kills an admitted request.
    ///
    /// # Errors
    ///
    /// `NotAdmitted` for unknown ids, or the request's own error if it has
    /// already ended.
    pub fn kill(&self, id: &str) -> Result<(), QueueError> {
        Ok(self.admitted(id)?.kill()?)
    }

    /// Kills every admitted request, continuing past individual failures.
    ///
    /// # Errors
    ///
    /// `Aggregate` with every failure encountered.
    pub fn kill_all(&self) -> Result<(), QueueError> {
        self.end_all(ServiceRequest::kill)
    }

    /// Cancels every admitted request, continuing past individual failures.
    ///
    /// # Errors
    ///
    /// `Aggregate` with every failure encountered.
    pub fn cancel_all(&self) -> Result<(), QueueError> {
        self.end_all(ServiceRequest::cancel)
    }

    fn end_all(&self, end: fn(&ServiceRequest) -> Result<(), RequestError>) -> Result<(), QueueError> {
        let snapshot: Vec<Arc<ServiceRequest>> = self.admitted.read().values().cloned().collect();
        let failures: Vec<RequestError> = snapshot.iter().filter_map(|r| end(r).err()).collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(QueueError::Aggregate(failures))
        }
    }

    /// Detaches the executor. Requests reaching a worker afterwards are
    /// killed.
    pub fn stop(&self) -> Option<Arc<dyn Executor>> {
        self.executor.write().take()
    }

    /// Attaches `executor`, returning the one it replaces.
    pub fn set_executor(&self, executor: Arc<dyn Executor>) -> Option<Arc<dyn Executor>> {
        self.executor.write().replace(executor)
    }

    #[must_use]
    pub fn has_executor(&self) -> bool {
        self.executor.read().is_some()
    }
}

impl std::fmt::Debug for ServiceTaskQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceTaskQueue")
            .field("service_id", &self.service_id)
            .field("admitted", &self.len())
            .field("has_executor", &self.has_executor())
            .finish_non_exhaustive()
    }
}

async fn run_admitted(
    service_id: Arc<str>,
    admitted: Admitted,
    executor: ExecutorSlot,
    request: Arc<ServiceRequest>,
) {
    // Requests ended while waiting have already released their caller.
    if !request.is_terminal() {
        let executor = executor.read().clone();
        match executor {
            None => {
                let _ = request.kill();
                debug!(service = %service_id, request = %request.id(), "queue stopped, request killed");
            }
            Some(executor) => {
                if request.transit_status(RequestStatus::Processing).is_ok() {
                    let run = AssertUnwindSafe(executor.execute(Arc::clone(&request)));
                    if run.catch_unwind().await.is_err() {
                        error!(service = %service_id, request = %request.id(), "executor panicked");
                    }
                    if request.status() == RequestStatus::Processing {
                        warn!(service = %service_id, request = %request.id(), "executor left request unresolved");
                        let _ = request.kill();
                    }
                }
            }
        }
    }
    admitted.write().remove(request.id());
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use relayhub_core::{Message, MessageType};

    use super::*;

    struct Echo {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Executor for Echo {
        async fn execute(&self, request: Arc<ServiceRequest>) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let reply = Message::response(request.message(), request.message().payload().to_vec());
            let _ = request.resolve(reply);
        }
    }

    struct Forgetful;

    #[async_trait]
    impl Executor for Forgetful {
        async fn execute(&self, _request: Arc<ServiceRequest>) {}
    }

    struct Panicking;

    #[async_trait]
    impl Executor for Panicking {
        async fn execute(&self, _request: Arc<ServiceRequest>) {
            panic!("handler bug");
        }
    }

    fn echo() -> Arc<Echo> {
        Arc::new(Echo {
            calls: AtomicUsize::new(0),
        })
    }

    fn request(payload: &[u8]) -> Arc<ServiceRequest> {
        Arc::new(ServiceRequest::new(Message::request(
            MessageType::Get,
            "/service/s/echo",
            payload.to_vec(),
        )))
    }

    fn pool() -> Arc<AsyncPool> {
        Arc::new(AsyncPool::new("test", 2, 16))
    }

    /// Occupies both workers of `pool` until the returned gate opens.
    async fn block_workers(pool: &AsyncPool) -> Barrier {
        let gate = Barrier::new();
        let started = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let gate = gate.clone();
            let started = Arc::clone(&started);
            pool.schedule(async move {
                started.fetch_add(1, Ordering::SeqCst);
                gate.wait().await;
            })
            .await
            .unwrap();
        }
        while started.load(Ordering::SeqCst) < 2 {
            tokio::task::yield_now().await;
        }
        gate
    }

    #[tokio::test]
    async fn executes_once_and_resolves() {
        let exec = echo();
        let queue = ServiceTaskQueue::new("s", pool(), exec.clone());
        let req = request(b"hi");

        let done = queue.schedule(Arc::clone(&req)).await.unwrap().unwrap();
        done.wait().await;

        assert_eq!(req.status(), RequestStatus::Finished);
        assert_eq!(req.response().await.unwrap().payload(), b"hi");
        assert_eq!(exec.calls.load(Ordering::SeqCst), 1);
        assert!(!queue.has(req.id()));
    }

    #[tokio::test]
    async fn duplicate_admission_is_ignored() {
        let pool = pool();
        let exec = echo();
        let queue = ServiceTaskQueue::new("s", Arc::clone(&pool), exec.clone());
        let gate = block_workers(&pool).await;

        let req = request(b"once");
        let done = queue.schedule(Arc::clone(&req)).await.unwrap().unwrap();
        assert!(queue.schedule(Arc::clone(&req)).await.unwrap().is_none());
        assert_eq!(queue.len(), 1);

        gate.open();
        done.wait().await;
        assert_eq!(exec.calls.load(Ordering::SeqCst), 1);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn cancelled_before_run_is_dropped() {
        let pool = pool();
        let exec = echo();
        let queue = ServiceTaskQueue::new("s", Arc::clone(&pool), exec.clone());
        let gate = block_workers(&pool).await;

        let req = request(b"x");
        let done = queue.schedule(Arc::clone(&req)).await.unwrap().unwrap();
        queue.cancel(req.id()).unwrap();
        assert_eq!(req.response().await, None);

        gate.open();
        done.wait().await;
        assert_eq!(req.status(), RequestStatus::Cancelled);
        assert_eq!(exec.calls.load(Ordering::SeqCst), 0);
        assert!(!queue.has(req.id()));
    }

    #[tokio::test]
    async fn stopped_queue_kills_requests() {
        let queue = ServiceTaskQueue::new("s", pool(), echo());
        assert!(queue.stop().is_some());
        assert!(!queue.has_executor());

        let req = request(b"x");
        queue.schedule(Arc::clone(&req)).await.unwrap().unwrap().wait().await;
        assert_eq!(req.status(), RequestStatus::Dead);

        queue.set_executor(echo());
        let req = request(b"y");
        queue.schedule(Arc::clone(&req)).await.unwrap().unwrap().wait().await;
        assert_eq!(req.status(), RequestStatus::Finished);
    }

    #[tokio::test]
    async fn unresolved_or_panicking_executor_kills_request() {
        for exec in [Arc::new(Forgetful) as Arc<dyn Executor>, Arc::new(Panicking)] {
            let queue = ServiceTaskQueue::new("s", pool(), exec);
            let req = request(b"x");
            queue.schedule(Arc::clone(&req)).await.unwrap().unwrap().wait().await;
            assert_eq!(req.status(), RequestStatus::Dead);
            assert!(queue.is_empty());
        }
    }

    #[tokio::test]
    async fn refused_by_stopped_pool() {
        let pool = pool();
        pool.stop().await;
        let queue = ServiceTaskQueue::new("s", pool, echo());
        let req = request(b"x");
        assert!(queue.schedule(Arc::clone(&req)).await.is_err());
        assert_eq!(req.status(), RequestStatus::Dead);
        assert!(!queue.has(req.id()));
    }

    #[tokio::test]
    async fn kill_all_aggregates_failures() {
        let pool = pool();
        let queue = ServiceTaskQueue::new("s", Arc::clone(&pool), echo());
        let gate = block_workers(&pool).await;

        let a = request(b"a");
        let b = request(b"b");
        let c = request(b"c");
        let mut barriers = Vec::new();
        for r in [&a, &b, &c] {
            barriers.push(queue.schedule(Arc::clone(r)).await.unwrap().unwrap());
        }
        a.cancel().unwrap();

        match queue.kill_all() {
            Err(QueueError::Aggregate(failures)) => {
                assert_eq!(failures.len(), 1);
                assert!(matches!(failures[0], RequestError::AlreadyTerminal { .. }));
            }
            other => panic!("expected aggregate error, got {other:?}"),
        }
        assert_eq!(b.status(), RequestStatus::Dead);
        assert_eq!(c.status(), RequestStatus::Dead);

        gate.open();
        for barrier in barriers {
            barrier.wait().await;
        }
        assert!(queue.is_empty());
        assert!(matches!(queue.kill("gone"), Err(QueueError::NotAdmitted(_))));
    }

    #[tokio::test]
    async fn cancel_all_on_idle_queue_is_ok() {
        let queue = ServiceTaskQueue::new("s", pool(), echo());
        assert!(queue.cancel_all().is_ok());
    }
}
