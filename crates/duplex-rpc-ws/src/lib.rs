//! WebSocket transport for the duplex RPC protocol.
//!
//! Each message is one WebSocket frame: envelopes go out as text frames and
//! both text and binary frames are accepted inbound. Sends never wait on the
//! socket; they are queued to a per-connection writer task and fail at once
//! when the connection is gone.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use std::fmt::Debug;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use proven_duplex_rpc::{Connection, Connector, Listener, Transport, TransportError, TransportEvent};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;
use tokio_tungstenite::{WebSocketStream, accept_hdr_async_with_config, connect_async_with_config};
use tracing::{debug, info, trace, warn};
use url::Url;

/// Pause after a failed TCP accept before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// WebSocket settings shared by connectors and listeners.
#[derive(Debug, Clone)]
pub struct WsConfig {
    /// Largest accepted inbound message in bytes.
    pub max_message_size: usize,
    /// How long a listener waits for a client to finish the handshake.
    pub handshake_timeout: Duration,
    /// Subprotocols offered by a connector, in preference order, or
    /// accepted by a listener. Empty means none are negotiated.
    pub protocols: Vec<String>,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            max_message_size: 16 * 1024 * 1024,
            handshake_timeout: Duration::from_secs(10),
            protocols: Vec::new(),
        }
    }
}

impl WsConfig {
    /// Set the inbound message size limit.
    #[must_use]
    pub const fn max_message_size(mut self, max: usize) -> Self {
        self.max_message_size = max;
        self
    }

    /// Set the listener handshake timeout.
    #[must_use]
    pub const fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the subprotocols sent as `Sec-WebSocket-Protocol`.
    #[must_use]
    pub fn protocols<I, P>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<String>,
    {
        self.protocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    /// The first subprotocol offered in `request` that this config accepts.
    fn select_protocol(&self, request: &Request) -> Option<HeaderValue> {
        let offered = request.headers().get(SEC_WEBSOCKET_PROTOCOL)?.to_str().ok()?;

        offered
            .split(',')
            .map(str::trim)
            .find(|offer| self.protocols.iter().any(|accepted| accepted == offer))
            .and_then(|chosen| HeaderValue::from_str(chosen).ok())
    }

    fn socket_config(&self) -> WebSocketConfig {
        WebSocketConfig::default()
            .max_message_size(Some(self.max_message_size))
            .max_frame_size(Some(self.max_message_size))
    }
}

/// Outbound half of a WebSocket connection.
pub struct WsTransport {
    peer: String,
    outbound: mpsc::UnboundedSender<Message>,
    closed: Arc<AtomicBool>,
}

impl WsTransport {
    /// Address of the other side.
    #[must_use]
    pub fn peer(&self) -> &str {
        &self.peer
    }
}

impl Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport")
            .field("peer", &self.peer)
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

impl Transport for WsTransport {
    fn send(&self, data: Bytes) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        let message = match String::from_utf8(data.to_vec()) {
            Ok(text) => Message::text(text),
            Err(_) => Message::binary(data),
        };

        self.outbound
            .send(message)
            .map_err(|_| TransportError::ConnectionClosed)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        debug!("Closing WebSocket connection to {}", self.peer);
        let _ = self.outbound.send(Message::Close(None));
    }
}

impl Drop for WsTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Split an established socket into a [`Connection`] driven by a reader
/// and a writer task.
fn spawn_connection<S>(socket: WebSocketStream<S>, peer: String) -> Connection
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let closed = Arc::new(AtomicBool::new(false));

    let _ = events_tx.send(TransportEvent::Open);

    let writer_events = events_tx.clone();
    let writer_peer = peer.clone();
    let writer = tokio::spawn(async move {
        while let Some(message) = outbound_rx.recv().await {
            let closing = matches!(message, Message::Close(_));

            if let Err(e) = sink.send(message).await {
                warn!("WebSocket write to {} failed: {}", writer_peer, e);
                let _ = writer_events.send(TransportEvent::Error(TransportError::Io(e.to_string())));
                break;
            }

            if closing {
                break;
            }
        }
    });

    let reader_closed = Arc::clone(&closed);
    let reader_peer = peer.clone();
    tokio::spawn(async move {
        let mut reason = None;
        let mut close_seen = false;

        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => {
                    trace!("WebSocket {} received {} bytes", reader_peer, text.len());
                    let _ = events_tx.send(TransportEvent::Message(Bytes::copy_from_slice(
                        text.as_bytes(),
                    )));
                }
                Ok(Message::Binary(data)) => {
                    trace!("WebSocket {} received {} bytes", reader_peer, data.len());
                    let _ = events_tx.send(TransportEvent::Message(data));
                }
                Ok(Message::Close(frame)) => {
                    close_seen = true;
                    reason = frame
                        .map(|frame| frame.reason.as_str().to_owned())
                        .filter(|reason| !reason.is_empty());
                }
                // Ping and pong are answered by tungstenite.
                Ok(_) => {}
                Err(e) => {
                    if !close_seen {
                        let _ = events_tx.send(TransportEvent::Error(TransportError::Io(e.to_string())));
                    }
                    break;
                }
            }
        }

        reader_closed.store(true, Ordering::SeqCst);
        writer.abort();

        info!("WebSocket connection to {} closed", reader_peer);
        let _ = events_tx.send(TransportEvent::Close(reason));
    });

    Connection::new(
        Arc::new(WsTransport {
            peer,
            outbound: outbound_tx,
            closed,
        }),
        events_rx,
    )
}

/// Opens WebSocket connections to `ws://` or `wss://` URLs.
#[derive(Debug, Clone, Default)]
pub struct WsConnector {
    config: WsConfig,
}

impl WsConnector {
    /// Create a connector with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a connector with custom settings.
    #[must_use]
    pub const fn with_config(config: WsConfig) -> Self {
        Self { config }
    }
}

/// Parse and check a WebSocket URL.
///
/// # Errors
///
/// Returns [`TransportError::InvalidAddress`] unless `target` is a `ws` or
/// `wss` URL.
pub fn parse_url(target: &str) -> Result<Url, TransportError> {
    let url = Url::parse(target)
        .map_err(|e| TransportError::InvalidAddress(format!("Invalid URL: {e}")))?;

    match url.scheme() {
        "ws" | "wss" => Ok(url),
        scheme => Err(TransportError::InvalidAddress(format!(
            "Unsupported scheme {scheme}"
        ))),
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, target: &str) -> Result<Connection, TransportError> {
        let url = parse_url(target)?;

        debug!("Connecting to WebSocket at {}", url);

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::InvalidAddress(format!("Invalid URL: {e}")))?;

        if !self.config.protocols.is_empty() {
            let offered = HeaderValue::from_str(&self.config.protocols.join(", "))
                .map_err(|e| TransportError::InvalidAddress(format!("Invalid subprotocol: {e}")))?;
            request.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, offered);
        }

        let (socket, _) =
            connect_async_with_config(request, Some(self.config.socket_config()), false)
                .await
                .map_err(|e| {
                    TransportError::ConnectionFailed(format!("WebSocket connect failed: {e}"))
                })?;

        info!("WebSocket connection established to {}", url);

        Ok(spawn_connection(socket, url.to_string()))
    }
}

/// Accepts WebSocket connections on a TCP socket.
///
/// A background task accepts TCP connections and runs each handshake in its
/// own task, so a slow or silent client never holds up the others. Finished
/// connections queue up for [`Listener::accept`]. Dropping the listener stops
/// accepting.
#[derive(Debug)]
pub struct WsListener {
    local_addr: SocketAddr,
    ready: flume::Receiver<Connection>,
    acceptor: JoinHandle<()>,
}

impl WsListener {
    /// Bind with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] if the address cannot be bound.
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self, TransportError> {
        Self::bind_with_config(addr, WsConfig::default()).await
    }

    /// Bind with custom settings.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Io`] if the address cannot be bound.
    pub async fn bind_with_config(
        addr: impl ToSocketAddrs,
        config: WsConfig,
    ) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| TransportError::Io(e.to_string()))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| TransportError::Io(e.to_string()))?;

        info!("WebSocket listener bound to {}", local_addr);

        let (ready_tx, ready) = flume::unbounded();
        let acceptor = tokio::spawn(accept_loop(listener, Arc::new(config), ready_tx));

        Ok(Self {
            local_addr,
            ready,
            acceptor,
        })
    }

    /// The bound address.
    #[must_use]
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

async fn accept_loop(
    listener: TcpListener,
    config: Arc<WsConfig>,
    ready: flume::Sender<Connection>,
) {
    loop {
        let (tcp, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("WebSocket listener accept failed: {}", e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
                continue;
            }
        };

        debug!("TCP connection from {}, starting handshake", peer);

        let config = Arc::clone(&config);
        let ready = ready.clone();
        tokio::spawn(async move {
            let selector = Arc::clone(&config);
            let callback = move |request: &Request, mut response: Response| {
                if let Some(chosen) = selector.select_protocol(request) {
                    response.headers_mut().insert(SEC_WEBSOCKET_PROTOCOL, chosen);
                }
                Ok::<_, ErrorResponse>(response)
            };

            let handshake =
                accept_hdr_async_with_config(tcp, callback, Some(config.socket_config()));

            match tokio::time::timeout(config.handshake_timeout, handshake).await {
                Ok(Ok(socket)) => {
                    info!("WebSocket listener accepted connection from {}", peer);
                    if ready.send(spawn_connection(socket, peer.to_string())).is_err() {
                        debug!("WebSocket listener gone, dropping connection from {}", peer);
                    }
                }
                Ok(Err(e)) => warn!("WebSocket handshake with {} failed: {}", peer, e),
                Err(_) => warn!("WebSocket handshake with {} timed out", peer),
            }
        });
    }
}

#[async_trait]
impl Listener for WsListener {
    async fn accept(&self) -> Result<Connection, TransportError> {
        self.ready
            .recv_async()
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }
}

impl Drop for WsListener {
    fn drop(&mut self) {
        debug!("Closing WebSocket listener on {}", self.local_addr);
        self.acceptor.abort();
    }
}
