//! Connection contract, the channel-backed connection and the registry of
//! live connections.
//!
//! The byte-level transport lives outside the hub: it owns the read loop,
//! decodes frames and hands responses to [`ChannelConnection::deliver`],
//! while draining the outbound channel onto the wire.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use relayhub_core::{Message, Observable, TransportKind};
use tokio::sync::mpsc;
use tracing::debug;

use super::config::ConnectionConfig;
use crate::pool::StatefulBarrier;

/// Errors surfaced by a connection.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// No response arrived in time.
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    /// The connection has been closed.
    #[error("connection closed")]
    Disconnected,
    /// The outbound channel is full (non-blocking sends only).
    #[error("outbound channel full")]
    Full,
    /// A request with the same id is already awaiting its response.
    #[error("request {0} already in flight")]
    DuplicateRequest(String),
    /// Transport-specific failure.
    #[error("transport failure: {0}")]
    Other(String),
}

/// A persistent, message-level connection.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Remote address; unique among registered connections.
    fn address(&self) -> &str;

    fn transport(&self) -> TransportKind {
        TransportKind::Async
    }

    fn is_live(&self) -> bool;

    /// Sends without waiting for a reply.
    async fn send(&self, message: Message) -> Result<(), TransportError>;

    /// Sends and waits for the response sharing the message id, using the
    /// connection's default timeout.
    async fn request(&self, message: Message) -> Result<Message, TransportError>;

    /// Sends and waits at most `timeout` for the response.
    async fn request_with_timeout(
        &self,
        message: Message,
        timeout: Duration,
    ) -> Result<Message, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

pub(crate) fn duration_ms(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Frame handed to the transport's write loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    Frame(Message),
    /// A close frame with an optional reason.
    Close(Option<String>),
}

type Pending = StatefulBarrier<Result<Message, TransportError>>;

/// Connection backed by a bounded outbound channel.
///
/// Requests register a barrier under their message id. The response
/// delivered by the read loop and a timer both try to open that barrier;
/// whichever is first decides the outcome and the other is ignored.
pub struct ChannelConnection {
    address: String,
    transport: TransportKind,
    tx: mpsc::Sender<OutboundMessage>,
    pending: DashMap<String, Pending>,
    closed: AtomicBool,
    config: ConnectionConfig,
    connected_at: Instant,
}

impl ChannelConnection {
    /// Creates an async connection, returning it with the receiver the
    /// write loop drains.
    #[must_use]
    pub fn new(
        address: impl Into<String>,
        config: &ConnectionConfig,
    ) -> (Arc<Self>, mpsc::Receiver<OutboundMessage>) {
        Self::with_transport(address, TransportKind::Async, config)
    }

    #[must_use]
    pub fn with_transport(
        address: impl Into<String>,
        transport: TransportKind,
        config: &ConnectionConfig,
    ) -> (Arc<Self>, mpsc::Receiver<OutboundMessage>) {
        let (tx, rx) = mpsc::channel(config.outbound_channel_capacity);
        let conn = Arc::new(Self {
            address: address.into(),
            transport,
            tx,
            pending: DashMap::new(),
            closed: AtomicBool::new(false),
            config: config.clone(),
            connected_at: Instant::now(),
        });
        (conn, rx)
    }

    /// Hands an inbound response to the request awaiting it.
    ///
    /// Returns `false` when nothing is waiting for this id, e.g. because the
    /// request already timed out.
    pub fn deliver(&self, message: Message) -> bool {
        match self.pending.get(message.id()) {
            Some(entry) => entry.value().open_with(Ok(message)),
            None => false,
        }
    }

    /// Attempts to enqueue a frame without waiting.
    #[must_use]
    pub fn try_send(&self, message: Message) -> bool {
        !self.closed.load(Ordering::Acquire) && self.tx.try_send(OutboundMessage::Frame(message)).is_ok()
    }

    /// Requests currently awaiting a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    #[must_use]
    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }
}

#[async_trait]
impl Connection for ChannelConnection {
    fn address(&self) -> &str {
        &self.address
    }

    fn transport(&self) -> TransportKind {
        self.transport
    }

    fn is_live(&self) -> bool {
        !self.closed.load(Ordering::Acquire) && !self.tx.is_closed()
    }

    async fn send(&self, message: Message) -> Result<(), TransportError> {
        if !self.is_live() {
            return Err(TransportError::Disconnected);
        }
        match tokio::time::timeout(self.config.send_timeout, self.tx.send(OutboundMessage::Frame(message))).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(TransportError::Disconnected),
            Err(_) => Err(TransportError::Timeout {
                timeout_ms: duration_ms(self.config.send_timeout),
            }),
        }
    }

    async fn request(&self, message: Message) -> Result<Message, TransportError> {
        self.request_with_timeout(message, self.config.request_timeout).await
    }

    async fn request_with_timeout(
        &self,
        message: Message,
        timeout: Duration,
    ) -> Result<Message, TransportError> {
        let id = message.id().to_string();
        let barrier = Pending::new();
        match self.pending.entry(id.clone()) {
            Entry::Occupied(_) => return Err(TransportError::DuplicateRequest(id)),
            Entry::Vacant(slot) => {
                slot.insert(barrier.clone());
            }
        }

        let timer = {
            let barrier = barrier.clone();
            tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                barrier.open_with(Err(TransportError::Timeout {
                    timeout_ms: duration_ms(timeout),
                }));
            })
        };

        if let Err(e) = self.send(message).await {
            barrier.open_with(Err(e));
        }

        let result = barrier.get().await.clone();
        timer.abort();
        self.pending.remove(&id);
        result
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        for entry in &self.pending {
            entry.value().open_with(Err(TransportError::Disconnected));
        }
        // The write loop may already be gone; a missing close frame is fine.
        let _ = self.tx.try_send(OutboundMessage::Close(None));
        debug!(address = %self.address, "connection closed");
        Ok(())
    }
}

impl std::fmt::Debug for ChannelConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelConnection")
            .field("address", &self.address)
            .field("transport", &self.transport)
            .field("live", &self.is_live())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// ConnectionRegistry
// ---------------------------------------------------------------------------

/// Change notification emitted by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Registered {
        address: String,
        owner: Option<String>,
    },
    /// The connection left the registry, closed by the hub or reported gone
    /// by the transport.
    Closed {
        address: String,
        owner: Option<String>,
    },
}

impl ConnectionEvent {
    #[must_use]
    pub fn address(&self) -> &str {
        match self {
            Self::Registered { address, .. } | Self::Closed { address, .. } => address,
        }
    }

    #[must_use]
    pub fn owner(&self) -> Option<&str> {
        match self {
            Self::Registered { owner, .. } | Self::Closed { owner, .. } => owner.as_deref(),
        }
    }
}

struct RegisteredConnection {
    connection: Arc<dyn Connection>,
    owner: Option<String>,
    registered_at: Instant,
}

/// Thread-safe registry of live connections, keyed by address.
///
/// A connection may be owned by a client (a provider of relayed services).
/// Every registration and removal is published on [`events`](Self::events).
pub struct ConnectionRegistry {
    connections: DashMap<String, RegisteredConnection>,
    events: Observable<ConnectionEvent>,
}

impl ConnectionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            events: Observable::new(),
        }
    }

    /// Registers `connection`, replacing any previous one at the same
    /// address (which is returned, not closed).
    pub fn register(
        &self,
        owner: Option<&str>,
        connection: Arc<dyn Connection>,
    ) -> Option<Arc<dyn Connection>> {
        let address = connection.address().to_string();
        let previous = self.connections.insert(
            address.clone(),
            RegisteredConnection {
                connection,
                owner: owner.map(str::to_string),
                registered_at: Instant::now(),
            },
        );
        self.events.emit(&ConnectionEvent::Registered {
            address,
            owner: owner.map(str::to_string),
        });
        previous.map(|p| p.connection)
    }

    #[must_use]
    pub fn get(&self, address: &str) -> Option<Arc<dyn Connection>> {
        self.connections
            .get(address)
            .map(|entry| Arc::clone(&entry.value().connection))
    }

    #[must_use]
    pub fn owner_of(&self, address: &str) -> Option<String> {
        self.connections
            .get(address)
            .and_then(|entry| entry.value().owner.clone())
    }

    /// When the connection at `address` was registered.
    #[must_use]
    pub fn registered_at(&self, address: &str) -> Option<Instant> {
        self.connections.get(address).map(|entry| entry.value().registered_at)
    }

    /// Connections owned by `owner`, oldest registration first.
    #[must_use]
    pub fn connections_of(&self, owner: &str) -> Vec<Arc<dyn Connection>> {
        let mut owned: Vec<(Instant, Arc<dyn Connection>)> = self
            .connections
            .iter()
            .filter(|entry| entry.value().owner.as_deref() == Some(owner))
            .map(|entry| (entry.value().registered_at, Arc::clone(&entry.value().connection)))
            .collect();
        owned.sort_by_key(|(at, _)| *at);
        owned.into_iter().map(|(_, conn)| conn).collect()
    }

    /// Removes and closes the connection, then emits `Closed`.
    pub async fn close(&self, address: &str) -> bool {
        let Some((_, entry)) = self.connections.remove(address) else {
            return false;
        };
        // Closing an already-dead connection is best effort.
        let _ = entry.connection.close().await;
        self.events.emit(&ConnectionEvent::Closed {
            address: address.to_string(),
            owner: entry.owner,
        });
        true
    }

    /// Removes a connection the transport reports as gone, then emits
    /// `Closed`.
    pub fn report_gone(&self, address: &str) -> bool {
        let Some((_, entry)) = self.connections.remove(address) else {
            return false;
        };
        self.events.emit(&ConnectionEvent::Closed {
            address: address.to_string(),
            owner: entry.owner,
        });
        true
    }

    #[must_use]
    pub fn events(&self) -> &Observable<ConnectionEvent> {
        &self.events
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Removes and returns all connections. Used during shutdown.
    pub fn drain_all(&self) -> Vec<Arc<dyn Connection>> {
        let keys: Vec<String> = self.connections.iter().map(|entry| entry.key().clone()).collect();

        let mut drained = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some((_, entry)) = self.connections.remove(&key) {
                drained.push(entry.connection);
            }
        }
        drained
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
