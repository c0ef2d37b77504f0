//! In-memory transport for the duplex RPC protocol.
//!
//! Connections route messages between two endpoints within the same process,
//! which makes them the transport of choice for tests. [`pair`] creates a
//! connected pair directly; [`MemoryNetwork`] adds named listeners so a
//! [`Server`](proven_duplex_rpc::Server) can accept from a
//! [`MemoryConnector`].

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::fmt::Debug;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use proven_duplex_rpc::{Connection, Connector, Listener, Transport, TransportError, TransportEvent};
use tokio::sync::mpsc;
use tracing::{debug, info, trace};
use uuid::Uuid;

/// Shared by both halves of one in-memory connection.
#[derive(Debug)]
struct Link {
    id: Uuid,
    closed: AtomicBool,
    a_events: mpsc::UnboundedSender<TransportEvent>,
    b_events: mpsc::UnboundedSender<TransportEvent>,
}

impl Link {
    /// Close both halves once. Each side sees exactly one close event.
    fn close(&self, reason: Option<String>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        debug!("Closing memory connection {}", self.id);

        let _ = self.a_events.send(TransportEvent::Close(reason.clone()));
        let _ = self.b_events.send(TransportEvent::Close(reason));
    }
}

/// One half of an in-memory connection.
pub struct MemoryTransport {
    link: Arc<Link>,
    peer: mpsc::UnboundedSender<TransportEvent>,
}

impl MemoryTransport {
    /// Id shared by both halves of the connection.
    #[must_use]
    pub fn link_id(&self) -> Uuid {
        self.link.id
    }

    /// Whether the connection has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.link.closed.load(Ordering::SeqCst)
    }
}

impl Debug for MemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTransport")
            .field("id", &self.link.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Transport for MemoryTransport {
    fn send(&self, data: Bytes) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }

        trace!("Memory connection {} sending {} bytes", self.link.id, data.len());

        self.peer
            .send(TransportEvent::Message(data))
            .map_err(|_| TransportError::ConnectionClosed)
    }

    fn close(&self) {
        self.link.close(None);
    }
}

impl Drop for MemoryTransport {
    fn drop(&mut self) {
        self.link.close(Some("peer dropped".to_string()));
    }
}

/// Create a connected pair of in-memory connections.
///
/// Both halves are already open: each event stream starts with
/// [`TransportEvent::Open`].
#[must_use]
pub fn pair() -> (Connection, Connection) {
    let (a_tx, a_rx) = mpsc::unbounded_channel();
    let (b_tx, b_rx) = mpsc::unbounded_channel();

    let _ = a_tx.send(TransportEvent::Open);
    let _ = b_tx.send(TransportEvent::Open);

    let link = Arc::new(Link {
        id: Uuid::new_v4(),
        closed: AtomicBool::new(false),
        a_events: a_tx.clone(),
        b_events: b_tx.clone(),
    });

    let a = MemoryTransport {
        link: Arc::clone(&link),
        peer: b_tx,
    };
    let b = MemoryTransport { link, peer: a_tx };

    (
        Connection::new(Arc::new(a), a_rx),
        Connection::new(Arc::new(b), b_rx),
    )
}

type Registry = Arc<DashMap<String, flume::Sender<Connection>>>;

/// A namespace of named in-memory listeners.
///
/// Cheap to clone; clones share the same listeners.
#[derive(Debug, Clone, Default)]
pub struct MemoryNetwork {
    listeners: Registry,
}

impl MemoryNetwork {
    /// Create an empty network.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start listening under `name`.
    ///
    /// # Errors
    ///
    /// Returns an error if a live listener already uses `name`.
    pub fn listen(&self, name: impl Into<String>) -> Result<MemoryListener, TransportError> {
        let name = name.into();
        let (incoming_tx, incoming_rx) = flume::unbounded();

        match self.listeners.entry(name.clone()) {
            Entry::Occupied(mut entry) => {
                if !entry.get().is_disconnected() {
                    return Err(TransportError::Other(format!(
                        "{name} already has a listener"
                    )));
                }
                entry.insert(incoming_tx.clone());
            }
            Entry::Vacant(entry) => {
                entry.insert(incoming_tx.clone());
            }
        }

        info!("Memory listener created for {}", name);

        Ok(MemoryListener {
            name,
            listeners: Arc::clone(&self.listeners),
            registered: incoming_tx,
            incoming: incoming_rx,
        })
    }

    /// A connector that dials listeners on this network.
    #[must_use]
    pub fn connector(&self) -> MemoryConnector {
        MemoryConnector::new(self.clone())
    }

    /// Whether a live listener uses `name`.
    #[must_use]
    pub fn is_listening(&self, name: &str) -> bool {
        self.listeners
            .get(name)
            .is_some_and(|sender| !sender.is_disconnected())
    }
}

/// Accepts in-memory connections made to one name.
///
/// Dropping the listener frees the name.
pub struct MemoryListener {
    name: String,
    listeners: Registry,
    registered: flume::Sender<Connection>,
    incoming: flume::Receiver<Connection>,
}

impl MemoryListener {
    /// The name this listener accepts on.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Debug for MemoryListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryListener")
            .field("name", &self.name)
            .field("queued", &self.incoming.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Listener for MemoryListener {
    async fn accept(&self) -> Result<Connection, TransportError> {
        let connection = self
            .incoming
            .recv_async()
            .await
            .map_err(|_| TransportError::ConnectionClosed)?;

        info!("Memory listener accepted connection for {}", self.name);

        Ok(connection)
    }
}

impl Drop for MemoryListener {
    fn drop(&mut self) {
        debug!("Closing memory listener for {}", self.name);
        self.listeners
            .remove_if(&self.name, |_, sender| sender.same_channel(&self.registered));
    }
}

/// Dials named listeners on a [`MemoryNetwork`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    network: MemoryNetwork,
}

impl MemoryConnector {
    /// Create a connector for `network`.
    #[must_use]
    pub const fn new(network: MemoryNetwork) -> Self {
        Self { network }
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, target: &str) -> Result<Connection, TransportError> {
        debug!("Connecting to memory listener {}", target);

        let listener = self
            .network
            .listeners
            .get(target)
            .map(|sender| sender.value().clone())
            .ok_or_else(|| TransportError::ConnectionFailed(format!("No listener for {target}")))?;

        let (client, server) = pair();

        listener
            .send_async(server)
            .await
            .map_err(|_| TransportError::ConnectionFailed("Listener closed".to_string()))?;

        info!("Memory connection established to {}", target);

        Ok(client)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn next(connection: &mut Connection) -> TransportEvent {
        connection.events.recv().await.unwrap()
    }

    #[tokio::test]
    async fn test_pair_starts_open_and_delivers_in_order() {
        let _ = tracing_subscriber::fmt::try_init();

        let (mut a, mut b) = pair();
        assert_eq!(next(&mut a).await, TransportEvent::Open);
        assert_eq!(next(&mut b).await, TransportEvent::Open);

        a.transport.send(Bytes::from("one")).unwrap();
        a.transport.send(Bytes::from("two")).unwrap();

        assert_eq!(next(&mut b).await, TransportEvent::Message(Bytes::from("one")));
        assert_eq!(next(&mut b).await, TransportEvent::Message(Bytes::from("two")));
    }

    #[tokio::test]
    async fn test_close_reaches_both_sides_once() {
        let (mut a, mut b) = pair();
        let _ = next(&mut a).await;
        let _ = next(&mut b).await;

        a.transport.close();
        b.transport.close();

        assert_eq!(next(&mut a).await, TransportEvent::Close(None));
        assert_eq!(next(&mut b).await, TransportEvent::Close(None));
        assert!(a.events.try_recv().is_err());
        assert!(b.events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (a, _b) = pair();
        a.transport.close();

        assert_eq!(
            a.transport.send(Bytes::from("late")),
            Err(TransportError::ConnectionClosed)
        );
    }

    #[tokio::test]
    async fn test_dropping_one_half_closes_the_other() {
        let (a, mut b) = pair();
        let _ = next(&mut b).await;

        drop(a);

        assert_eq!(
            next(&mut b).await,
            TransportEvent::Close(Some("peer dropped".to_string()))
        );
    }

    #[tokio::test]
    async fn test_listen_and_connect() {
        let _ = tracing_subscriber::fmt::try_init();

        let network = MemoryNetwork::new();
        let listener = network.listen("server").unwrap();
        let connector = network.connector();

        let mut client = connector.connect("server").await.unwrap();
        let mut server = listener.accept().await.unwrap();
        let _ = next(&mut client).await;
        let _ = next(&mut server).await;

        client.transport.send(Bytes::from("Hello, Memory!")).unwrap();
        assert_eq!(
            next(&mut server).await,
            TransportEvent::Message(Bytes::from("Hello, Memory!"))
        );

        server.transport.send(Bytes::from("Hello back!")).unwrap();
        assert_eq!(
            next(&mut client).await,
            TransportEvent::Message(Bytes::from("Hello back!"))
        );
    }

    #[tokio::test]
    async fn test_name_already_listening() {
        let network = MemoryNetwork::new();

        let _first = network.listen("server").unwrap();

        assert!(network.listen("server").is_err());
    }

    #[tokio::test]
    async fn test_dropped_listener_frees_name() {
        let network = MemoryNetwork::new();

        let first = network.listen("server").unwrap();
        drop(first);

        assert!(!network.is_listening("server"));
        let _second = network.listen("server").unwrap();
        assert!(network.is_listening("server"));
    }

    #[tokio::test]
    async fn test_connect_without_listener_fails() {
        let network = MemoryNetwork::new();

        let err = network.connector().connect("nobody").await.unwrap_err();

        assert!(matches!(err, TransportError::ConnectionFailed(_)));
    }
}
