//! Client-side connection pool.
//!
//! Keeps up to `size` live connections to the hub. Two bounded queues drive
//! it: `ready` holds connections available to callers, and the production
//! queue carries one signal per connection the background producer should
//! dial. Callers take connections with [`ConnectionPool::get`] and hand
//! them back with [`ConnectionPool::put`]; dead connections are dropped and
//! replaced.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::config::ConnectionPoolConfig;
use super::connection::Connection;

/// Dials new connections for a [`ConnectionPool`].
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self) -> anyhow::Result<Arc<dyn Connection>>;
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionPoolError {
    #[error("connection pool is closed")]
    Closed,
    #[error("connection pool already started")]
    AlreadyStarted,
    #[error("dial failed after {attempts} attempts: {reason}")]
    Dial { attempts: u32, reason: String },
}

/// Called when the producer gives up dialing, right before the pool closes.
pub type ErrorCallback = Arc<dyn Fn(&ConnectionPoolError) + Send + Sync>;

type Ready = Arc<dyn Connection>;

pub struct ConnectionPool {
    config: ConnectionPoolConfig,
    factory: Arc<dyn ConnectionFactory>,
    on_error: Option<ErrorCallback>,
    ready_tx: mpsc::Sender<Ready>,
    ready_rx: tokio::sync::Mutex<mpsc::Receiver<Ready>>,
    produce_tx: mpsc::Sender<()>,
    /// Taken by the producer loop on start.
    produce_rx: parking_lot::Mutex<Option<mpsc::Receiver<()>>>,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl ConnectionPool {
    #[must_use]
    pub fn new(config: ConnectionPoolConfig, factory: Arc<dyn ConnectionFactory>) -> Arc<Self> {
        Self::build(config, factory, None)
    }

    #[must_use]
    pub fn with_error_callback(
        config: ConnectionPoolConfig,
        factory: Arc<dyn ConnectionFactory>,
        on_error: ErrorCallback,
    ) -> Arc<Self> {
        Self::build(config, factory, Some(on_error))
    }

    fn build(
        mut config: ConnectionPoolConfig,
        factory: Arc<dyn ConnectionFactory>,
        on_error: Option<ErrorCallback>,
    ) -> Arc<Self> {
        config.size = config.size.max(1);
        config.dial_attempts = config.dial_attempts.max(1);
        let (ready_tx, ready_rx) = mpsc::channel(config.size);
        let (produce_tx, produce_rx) = mpsc::channel(config.size);
        Arc::new(Self {
            config,
            factory,
            on_error,
            ready_tx,
            ready_rx: tokio::sync::Mutex::new(ready_rx),
            produce_tx,
            produce_rx: parking_lot::Mutex::new(Some(produce_rx)),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        })
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.config.size
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Connections waiting in the ready queue.
    #[must_use]
    pub fn ready_count(&self) -> usize {
        self.ready_tx.max_capacity() - self.ready_tx.capacity()
    }

    /// Dials the first connection, then starts the producer and asks it for
    /// the remaining `size - 1`.
    ///
    /// # Errors
    ///
    /// `Dial` when the first connection cannot be made; the pool may be
    /// started again. `Closed` and `AlreadyStarted` as named.
    pub async fn start(self: &Arc<Self>) -> Result<(), ConnectionPoolError> {
        if self.is_closed() {
            return Err(ConnectionPoolError::Closed);
        }
        let signals = self
            .produce_rx
            .lock()
            .take()
            .ok_or(ConnectionPoolError::AlreadyStarted)?;

        let first = match self.dial().await {
            Ok(conn) => conn,
            Err(e) => {
                *self.produce_rx.lock() = Some(signals);
                return Err(e);
            }
        };
        self.offer(first).await;

        tokio::spawn(produce_loop(Arc::downgrade(self), signals, self.cancel.clone()));
        for _ in 1..self.config.size {
            self.signal_production();
        }
        info!(size = self.config.size, "connection pool started");
        Ok(())
    }

    /// Takes the next live connection, waiting for one if none is ready.
    ///
    /// # Errors
    ///
    /// `Closed` once the pool is closed.
    pub async fn get(&self) -> Result<Arc<dyn Connection>, ConnectionPoolError> {
        loop {
            if self.is_closed() {
                return Err(ConnectionPoolError::Closed);
            }
            let next = {
                let mut ready = self.ready_rx.lock().await;
                tokio::select! {
                    () = self.cancel.cancelled() => None,
                    conn = ready.recv() => conn,
                }
            };
            let Some(conn) = next else {
                return Err(ConnectionPoolError::Closed);
            };
            if conn.is_live() {
                return Ok(conn);
            }
            debug!(address = conn.address(), "discarding dead pooled connection");
            self.signal_production();
        }
    }

    /// Returns a connection taken with [`get`](Self::get).
    pub async fn put(&self, conn: Arc<dyn Connection>) {
        if self.is_closed() {
            let _ = conn.close().await;
            return;
        }
        if !conn.is_live() {
            debug!(address = conn.address(), "returned connection is dead");
            self.signal_production();
            return;
        }
        self.offer(conn).await;
    }

    /// Closes the pool once: stops the producer and closes every pooled
    /// connection. Later calls are no-ops.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();

        if let Some(mut signals) = self.produce_rx.lock().take() {
            while signals.try_recv().is_ok() {}
        }
        let pooled: Vec<Ready> = {
            let mut ready = self.ready_rx.lock().await;
            std::iter::from_fn(|| ready.try_recv().ok()).collect()
        };
        for conn in &pooled {
            let _ = conn.close().await;
        }
        info!(closed_connections = pooled.len(), "connection pool closed");
    }

    fn signal_production(&self) {
        // A full queue already holds enough signals.
        let _ = self.produce_tx.try_send(());
    }

    async fn offer(&self, conn: Ready) {
        if self.is_closed() {
            let _ = conn.close().await;
            return;
        }
        if let Err(e) = self.ready_tx.try_send(conn) {
            let conn = match e {
                mpsc::error::TrySendError::Full(c) | mpsc::error::TrySendError::Closed(c) => c,
            };
            debug!(address = conn.address(), "ready queue full, closing surplus connection");
            let _ = conn.close().await;
        }
    }

    async fn dial(&self) -> Result<Ready, ConnectionPoolError> {
        let attempts = self.config.dial_attempts;
        let mut last = String::new();
        for attempt in 1..=attempts {
            match self.factory.connect().await {
                Ok(conn) => {
                    debug!(address = conn.address(), attempt, "dialed connection");
                    return Ok(conn);
                }
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "dial failed");
                    last = format!("{e:#}");
                }
            }
            if attempt < attempts {
                tokio::time::sleep(backoff(self.config.dial_backoff, attempt)).await;
            }
        }
        Err(ConnectionPoolError::Dial { attempts, reason: last })
    }
}

/// Linear backoff with up to 50% random jitter.
fn backoff(base: Duration, attempt: u32) -> Duration {
    let delay = base.saturating_mul(attempt);
    let jitter_ms = u64::try_from(delay.as_millis() / 2).unwrap_or(u64::MAX);
    delay + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
}

async fn produce_loop(pool: Weak<ConnectionPool>, mut signals: mpsc::Receiver<()>, cancel: CancellationToken) {
    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            signal = signals.recv() => {
                if signal.is_none() {
                    break;
                }
            }
        }
        let Some(pool) = pool.upgrade() else { break };
        let dialed = tokio::select! {
            () = cancel.cancelled() => break,
            dialed = pool.dial() => dialed,
        };
        match dialed {
            Ok(conn) => pool.offer(conn).await,
            Err(e) => {
                error!(error = %e, "connection producer gave up");
                if let Some(on_error) = &pool.on_error {
                    on_error(&e);
                }
                pool.close().await;
                break;
            }
        }
    }
    while signals.try_recv().is_ok() {}
    debug!("connection producer stopped");
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("size", &self.config.size)
            .field("ready", &self.ready_count())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
