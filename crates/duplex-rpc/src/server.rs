//! Server registry: one endpoint per accepted connection.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::ServerConfig;
use crate::endpoint::{ConnectionId, Endpoint, EndpointEvent};
use crate::error::{Error, Result};
use crate::events::{BusEvent, EventBus, EventKind, SubscriptionToken};
use crate::handler::{MethodTable, RequestHandler};
use crate::id_allocator::IdAllocator;
use crate::protocol::{Codec, JsonCodec};
use crate::transport::{Connection, Listener, TransportError};

/// Pause after an I/O accept failure so a persistent fault does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Events emitted by a [`Server`].
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// A connection was accepted and is open.
    Open(Arc<Endpoint>),
    /// A connection closed and its id was released.
    Close(ConnectionId),
    /// A server-level error (accept failures, refused connections, callbacks).
    Error(Error),
    /// A connection raised an error on its own error channel.
    ConnectionError {
        /// The connection that raised it.
        connection_id: ConnectionId,
        /// What it raised.
        error: Error,
    },
}

impl BusEvent for ServerEvent {
    fn kind(&self) -> EventKind {
        match self {
            Self::Open(_) => EventKind::Open,
            Self::Close(_) => EventKind::Close,
            Self::Error(_) => EventKind::Error,
            Self::ConnectionError { .. } => EventKind::ConnectionError,
        }
    }
}

struct ConnectionTable {
    connection_ids: IdAllocator,
    endpoints: HashMap<ConnectionId, Arc<Endpoint>>,
}

struct ServerInner {
    config: ServerConfig,
    codec: Arc<dyn Codec>,
    connections: Mutex<ConnectionTable>,
    methods: MethodTable,
    events: EventBus<ServerEvent>,
}

/// Manages every accepted connection and the methods they share.
///
/// Cloning is cheap; clones share the same registry.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    /// Create a server using the JSON codec.
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        Self::with_codec(config, Arc::new(JsonCodec))
    }

    /// Create a server whose connections use `codec`.
    #[must_use]
    pub fn with_codec(config: ServerConfig, codec: Arc<dyn Codec>) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                config,
                codec,
                connections: Mutex::new(ConnectionTable {
                    connection_ids: IdAllocator::new(),
                    endpoints: HashMap::new(),
                }),
                methods: MethodTable::new(),
                events: EventBus::new(),
            }),
        }
    }

    /// Register a method for every connection, current and future.
    pub fn register_request_method(&self, name: impl Into<String>, handler: impl RequestHandler) {
        self.inner.methods.insert(name, Arc::new(handler));
    }

    /// Remove a server-wide method.
    pub fn unregister_request_method(&self, name: &str) -> bool {
        self.inner.methods.remove(name)
    }

    /// Subscribe to server events.
    pub fn on<F>(&self, kind: EventKind, callback: F) -> SubscriptionToken
    where
        F: Fn(&ServerEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.inner.events.on(kind, callback)
    }

    /// Remove a subscription.
    pub fn off(&self, token: SubscriptionToken) -> bool {
        self.inner.events.off(token)
    }

    /// Take ownership of a newly accepted connection.
    ///
    /// Emits [`ServerEvent::Open`] before the connection's first message is
    /// processed, then spawns its driver on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConnectionLimit`] (and closes the connection) if the
    /// server is full.
    #[instrument(skip(self, connection))]
    pub fn accept(&self, connection: Connection) -> Result<Arc<Endpoint>> {
        let Connection { transport, events } = connection;

        let endpoint = {
            let mut table = self.inner.connections.lock();

            if table.endpoints.len() >= self.inner.config.max_connections {
                drop(table);
                transport.close();
                let error = Error::ConnectionLimit(self.inner.config.max_connections);
                self.inner.raise(error.clone());
                return Err(error);
            }

            let connection_id = table.connection_ids.allocate();
            let endpoint = Arc::new(
                Endpoint::new(transport, self.inner.config.endpoint.clone())
                    .with_codec(Arc::clone(&self.inner.codec))
                    .with_connection(connection_id, self.inner.methods.clone()),
            );
            watch(&self.inner, &endpoint, connection_id);
            table.endpoints.insert(connection_id, Arc::clone(&endpoint));
            endpoint
        };

        info!(connection_id = ?endpoint.connection_id(), "accepted connection");

        endpoint.on_open();
        self.inner.emit(&ServerEvent::Open(Arc::clone(&endpoint)));
        tokio::spawn(Arc::clone(&endpoint).run(events));

        Ok(endpoint)
    }

    /// Accept connections from `listener` until it shuts down.
    ///
    /// Accept failures are raised as [`ServerEvent::Error`]; after an I/O
    /// failure the loop pauses briefly before accepting again.
    #[instrument(skip(self, listener))]
    pub async fn serve(&self, listener: impl Listener) {
        info!("serving connections");

        loop {
            match listener.accept().await {
                Ok(connection) => {
                    // Refusals were already raised on the error channel.
                    let _ = self.accept(connection);
                }
                Err(TransportError::ConnectionClosed) => {
                    info!("listener closed");
                    return;
                }
                Err(e) => {
                    let backoff = matches!(e, TransportError::Io(_));
                    self.inner.raise(Error::Transport(e));
                    if backoff {
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
        }
    }

    /// The live connection with `id`.
    #[must_use]
    pub fn connection(&self, id: ConnectionId) -> Option<Arc<Endpoint>> {
        self.inner.connections.lock().endpoints.get(&id).cloned()
    }

    /// Every live connection, ordered by id.
    #[must_use]
    pub fn connections(&self) -> Vec<Arc<Endpoint>> {
        let table = self.inner.connections.lock();
        let mut endpoints: Vec<_> = table.endpoints.iter().collect();
        endpoints.sort_by_key(|(id, _)| **id);
        endpoints.into_iter().map(|(_, e)| Arc::clone(e)).collect()
    }

    /// Ids of every live connection, ascending.
    #[must_use]
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<_> = self
            .inner
            .connections
            .lock()
            .endpoints
            .keys()
            .copied()
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Number of live connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.inner.connections.lock().endpoints.len()
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new(ServerConfig::default())
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("connections", &self.connection_ids())
            .field("methods", &self.inner.methods)
            .finish_non_exhaustive()
    }
}

/// Subscribe the registry to one endpoint's lifecycle.
fn watch(inner: &Arc<ServerInner>, endpoint: &Endpoint, connection_id: ConnectionId) {
    let registry = Arc::downgrade(inner);
    endpoint.on(EventKind::Close, move |_| {
        if let Some(inner) = registry.upgrade() {
            inner.release(connection_id);
        }
        Ok(())
    });

    let registry: Weak<ServerInner> = Arc::downgrade(inner);
    endpoint.on(EventKind::Error, move |event| {
        if let (Some(inner), EndpointEvent::Error(error)) = (registry.upgrade(), event) {
            inner.connection_error(connection_id, error);
        }
        Ok(())
    });
}

impl ServerInner {
    fn release(&self, connection_id: ConnectionId) {
        let released = {
            let mut table = self.connections.lock();
            let removed = table.endpoints.remove(&connection_id).is_some();
            if removed {
                table.connection_ids.free(connection_id);
            }
            removed
        };

        if released {
            info!(connection_id, "released connection");
            self.emit(&ServerEvent::Close(connection_id));
        }
    }

    fn connection_error(&self, connection_id: ConnectionId, error: &Error) {
        let close = self.config.close_on_transport_error && matches!(error, Error::Transport(_));

        self.emit(&ServerEvent::ConnectionError {
            connection_id,
            error: error.clone(),
        });

        if close {
            let endpoint = self.connections.lock().endpoints.get(&connection_id).cloned();
            if let Some(endpoint) = endpoint {
                debug!(connection_id, "closing connection after transport error");
                endpoint.close();
            }
        }
    }

    fn emit(&self, event: &ServerEvent) {
        for failure in self.events.emit(event) {
            self.raise(Error::Callback(failure.to_string()));
        }
    }

    fn raise(&self, error: Error) {
        warn!("{error}");

        for failure in self.events.emit(&ServerEvent::Error(error)) {
            warn!("error callback failed: {failure}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mock::RecordingTransport;
    use crate::transport::{Transport, TransportEvent};
    use bytes::Bytes;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn connection() -> (
        Connection,
        Arc<RecordingTransport>,
        mpsc::UnboundedSender<TransportEvent>,
    ) {
        let transport = Arc::new(RecordingTransport::default());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connection = Connection::new(Arc::clone(&transport) as Arc<dyn Transport>, events_rx);
        (connection, transport, events_tx)
    }

    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_connection_ids_reused_after_close() {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let server = Server::default();

        let (a, _, a_events) = connection();
        let (b, _, _b_events) = connection();

        let a = server.accept(a).unwrap();
        let b = server.accept(b).unwrap();
        assert_eq!(a.connection_id(), Some(0));
        assert_eq!(b.connection_id(), Some(1));
        assert_eq!(server.connection_ids(), vec![0, 1]);

        a_events.send(TransportEvent::Close(None)).unwrap();
        settle().await;
        assert_eq!(server.connection_ids(), vec![1]);

        let (c, _, _c_events) = connection();
        let c = server.accept(c).unwrap();
        assert_eq!(c.connection_id(), Some(0));
        assert_eq!(server.connection_count(), 2);
    }

    #[tokio::test]
    async fn test_close_releases_once() {
        let server = Server::default();
        let closes = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&closes);
        server.on(EventKind::Close, move |event| {
            if let ServerEvent::Close(id) = event {
                sink.lock().push(*id);
            }
            Ok(())
        });

        let (conn, _, events) = connection();
        let endpoint = server.accept(conn).unwrap();

        events
            .send(TransportEvent::Error(TransportError::Io("reset".to_string())))
            .unwrap();
        events.send(TransportEvent::Close(None)).unwrap();
        settle().await;
        endpoint.on_close(None);

        assert_eq!(*closes.lock(), vec![0]);
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_methods_registered_later_reach_open_connections() {
        let server = Server::default();
        let (conn, transport, events) = connection();
        server.accept(conn).unwrap();

        server.register_request_method(
            "ping",
            |_endpoint: Arc<Endpoint>, _data: serde_json::Value| async {
                Ok::<_, anyhow::Error>(json!("pong"))
            },
        );

        events
            .send(TransportEvent::Message(Bytes::from(
                json!({"type": "request", "id": 0, "name": "ping"}).to_string(),
            )))
            .unwrap();
        settle().await;

        assert_eq!(
            transport.sent_json(),
            vec![json!({"type": "response", "id": 0, "name": "ping", "status": "resolve", "data": "pong"})]
        );
    }

    #[tokio::test]
    async fn test_unregistered_method_is_unknown() {
        let server = Server::default();
        let forwarded = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&forwarded);
        server.on(EventKind::ConnectionError, move |event| {
            if let ServerEvent::ConnectionError { error, .. } = event {
                sink.lock().push(error.to_string());
            }
            Ok(())
        });
        server.register_request_method(
            "ping",
            |_endpoint: Arc<Endpoint>, _data: serde_json::Value| async {
                Ok::<_, anyhow::Error>(json!("pong"))
            },
        );

        let (conn, transport, events) = connection();
        server.accept(conn).unwrap();

        assert!(server.unregister_request_method("ping"));
        assert!(!server.unregister_request_method("ping"));

        events
            .send(TransportEvent::Message(Bytes::from(
                json!({"type": "request", "id": 0, "name": "ping"}).to_string(),
            )))
            .unwrap();
        settle().await;

        assert_eq!(
            *forwarded.lock(),
            vec!["No request handler registered for method `ping`".to_string()]
        );
        assert!(transport.sent_json().is_empty());
    }

    /// Fails every accept with an I/O error, then shuts down.
    struct FailingListener {
        remaining: Mutex<usize>,
    }

    #[async_trait::async_trait]
    impl Listener for FailingListener {
        async fn accept(&self) -> std::result::Result<Connection, TransportError> {
            let mut remaining = self.remaining.lock();
            if *remaining == 0 {
                return Err(TransportError::ConnectionClosed);
            }
            *remaining -= 1;
            Err(TransportError::Io("too many open files".to_string()))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_serve_backs_off_after_io_errors() {
        let server = Server::default();
        let errors = Arc::new(Mutex::new(0usize));

        let sink = Arc::clone(&errors);
        server.on(EventKind::Error, move |event| {
            if let ServerEvent::Error(Error::Transport(TransportError::Io(_))) = event {
                *sink.lock() += 1;
            }
            Ok(())
        });

        let started = tokio::time::Instant::now();
        server
            .serve(FailingListener {
                remaining: Mutex::new(5),
            })
            .await;

        assert_eq!(*errors.lock(), 5);
        assert!(started.elapsed() >= ACCEPT_BACKOFF * 5);
    }

    #[tokio::test]
    async fn test_connection_errors_forwarded() {
        let server = Server::default();
        let forwarded = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&forwarded);
        server.on(EventKind::ConnectionError, move |event| {
            if let ServerEvent::ConnectionError {
                connection_id,
                error,
            } = event
            {
                sink.lock().push((*connection_id, error.to_string()));
            }
            Ok(())
        });

        let (conn, transport, events) = connection();
        server.accept(conn).unwrap();

        events
            .send(TransportEvent::Message(Bytes::from_static(b"{\"type\":123}")))
            .unwrap();
        settle().await;

        assert_eq!(
            *forwarded.lock(),
            vec![(0, "Invalid message: Invalid message type".to_string())]
        );
        assert!(!transport.closed.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(server.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_close_on_transport_error() {
        let server = Server::new(ServerConfig::default().close_on_transport_error(true));
        let (conn, transport, events) = connection();
        server.accept(conn).unwrap();

        events
            .send(TransportEvent::Error(TransportError::Io("reset".to_string())))
            .unwrap();
        settle().await;

        assert!(transport.closed.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let server = Server::new(ServerConfig::default().max_connections(1));

        let (first, _, _first_events) = connection();
        let (second, second_transport, _second_events) = connection();

        server.accept(first).unwrap();
        assert!(matches!(
            server.accept(second),
            Err(Error::ConnectionLimit(1))
        ));
        assert!(second_transport.closed.load(std::sync::atomic::Ordering::SeqCst));
        assert_eq!(server.connection_count(), 1);
    }
}
