//! Protocol endpoint: the per-connection correlation engine.
//!
//! One [`Endpoint`] is bound to one connection. It allocates request ids,
//! tracks pending requests until their responses arrive, dispatches inbound
//! requests to registered handlers, and reports everything else through its
//! event bus. Client and server sides use the same type.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace, warn};

use crate::config::EndpointConfig;
use crate::error::{CodecError, Error, Result, ValidationError};
use crate::events::{BusEvent, EventBus, EventKind, SubscriptionToken};
use crate::handler::{MethodTable, RequestHandler};
use crate::id_allocator::IdAllocator;
use crate::protocol::{Codec, Envelope, JsonCodec, RequestId, Status};
use crate::transport::{Transport, TransportError, TransportEvent};

/// Server-assigned identifier of one connection.
pub type ConnectionId = u64;

/// Lifecycle of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    /// Constructed, transport not yet open.
    Idle,
    /// Requests may be sent.
    Open,
    /// Terminal.
    Closed,
}

/// Events emitted by an endpoint.
#[derive(Debug, Clone)]
pub enum EndpointEvent {
    /// The connection opened.
    Open,
    /// The connection closed.
    Close(Option<String>),
    /// A protocol, transport, or callback error.
    Error(Error),
    /// A valid request or response arrived (raw bytes).
    Message(Bytes),
    /// Bytes were handed to the transport.
    Send(Bytes),
}

impl BusEvent for EndpointEvent {
    fn kind(&self) -> EventKind {
        match self {
            Self::Open => EventKind::Open,
            Self::Close(_) => EventKind::Close,
            Self::Error(_) => EventKind::Error,
            Self::Message(_) => EventKind::Message,
            Self::Send(_) => EventKind::Send,
        }
    }
}

type Completion = oneshot::Sender<Result<Value>>;

struct Correlation {
    state: EndpointState,
    request_ids: IdAllocator,
    pending: HashMap<u64, Completion>,
}

/// The eventual outcome of one outbound request.
///
/// Resolves to the response data, [`Error::Rejected`] with the reject data,
/// or [`Error::ConnectionClosed`] if the connection closes first. There is
/// no timeout; wrap it in `tokio::time::timeout` if one is needed.
#[derive(Debug)]
#[must_use = "the response is lost if the pending request is dropped"]
pub struct PendingResponse {
    id: RequestId,
    receiver: oneshot::Receiver<Result<Value>>,
}

impl PendingResponse {
    /// Id the request was sent with.
    #[must_use]
    pub const fn id(&self) -> RequestId {
        self.id
    }
}

impl Future for PendingResponse {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::ConnectionClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Correlation engine bound to one connection.
pub struct Endpoint {
    connection_id: Option<ConnectionId>,
    transport: Arc<dyn Transport>,
    codec: Arc<dyn Codec>,
    config: EndpointConfig,
    correlation: Mutex<Correlation>,
    methods: MethodTable,
    shared_methods: Option<MethodTable>,
    events: EventBus<EndpointEvent>,
    session: Mutex<HashMap<String, Value>>,
}

impl Endpoint {
    /// Create an idle endpoint over `transport` using the JSON codec.
    pub fn new(transport: Arc<dyn Transport>, config: EndpointConfig) -> Self {
        Self {
            connection_id: None,
            transport,
            codec: Arc::new(JsonCodec),
            config,
            correlation: Mutex::new(Correlation {
                state: EndpointState::Idle,
                request_ids: IdAllocator::new(),
                pending: HashMap::new(),
            }),
            methods: MethodTable::new(),
            shared_methods: None,
            events: EventBus::new(),
            session: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the codec.
    #[must_use]
    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Start with a pre-populated local method table.
    #[must_use]
    pub(crate) fn with_methods(mut self, methods: MethodTable) -> Self {
        self.methods = methods;
        self
    }

    /// Bind a server-side connection id and the server's shared method table.
    #[must_use]
    pub(crate) fn with_connection(
        mut self,
        connection_id: ConnectionId,
        shared_methods: MethodTable,
    ) -> Self {
        self.connection_id = Some(connection_id);
        self.shared_methods = Some(shared_methods);
        self
    }

    /// Server-assigned connection id, `None` on the client side.
    #[must_use]
    pub const fn connection_id(&self) -> Option<ConnectionId> {
        self.connection_id
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> EndpointState {
        self.correlation.lock().state
    }

    /// Whether requests can be sent.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == EndpointState::Open
    }

    /// Number of requests awaiting a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.correlation.lock().pending.len()
    }

    /// Send a request and return a handle to its eventual response.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotConnected`] unless the endpoint is open (the error is
    /// also raised on the error channel), or the transport's error if the send
    /// itself failed. Either way no response is awaited.
    pub fn send_request(&self, name: &str, data: Value) -> Result<PendingResponse> {
        let (slot, id, receiver) = {
            let mut correlation = self.correlation.lock();

            if correlation.state != EndpointState::Open {
                drop(correlation);
                self.raise(Error::NotConnected);
                return Err(Error::NotConnected);
            }

            let slot = correlation.request_ids.allocate();
            let Ok(id) = RequestId::try_from(slot) else {
                correlation.request_ids.free(slot);
                return Err(CodecError::SerializationFailed(
                    "request id space exhausted".to_string(),
                )
                .into());
            };

            let (completion, receiver) = oneshot::channel();
            correlation.pending.insert(slot, completion);
            (slot, id, receiver)
        };

        let bytes = match self.codec.encode(&Envelope::request(id, name, data)) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.abandon(slot);
                return Err(e.into());
            }
        };

        // The transport may report a close synchronously, so no lock is held here.
        if let Err(e) = self.transport.send(bytes.clone()) {
            self.abandon(slot);
            debug!(id, name, "request send failed: {e}");
            return Err(e.into());
        }

        debug!(connection_id = ?self.connection_id, id, name, "sent request");
        self.emit(EndpointEvent::Send(bytes));

        Ok(PendingResponse { id, receiver })
    }

    /// Forget a request that never made it onto the wire.
    fn abandon(&self, slot: u64) {
        let mut correlation = self.correlation.lock();
        if correlation.pending.remove(&slot).is_some() {
            correlation.request_ids.free(slot);
        }
    }

    /// Send a request and wait for its response.
    ///
    /// # Errors
    ///
    /// See [`Endpoint::send_request`] and [`PendingResponse`].
    pub async fn request(&self, name: &str, data: Value) -> Result<Value> {
        self.send_request(name, data)?.await
    }

    /// Send a typed request and decode a typed response.
    ///
    /// # Errors
    ///
    /// Fails like [`Endpoint::request`], or with [`Error::Codec`] if either
    /// side does not convert.
    pub async fn call<Req, Resp>(&self, name: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        let data = serde_json::to_value(request)
            .map_err(|e| CodecError::SerializationFailed(e.to_string()))?;
        let response = self.request(name, data).await?;
        serde_json::from_value(response)
            .map_err(|e| CodecError::DeserializationFailed(e.to_string()).into())
    }

    /// Register or replace the handler for `name` on this connection.
    pub fn register_request_handler(&self, name: impl Into<String>, handler: impl RequestHandler) {
        self.methods.insert(name, Arc::new(handler));
    }

    /// Remove a handler registered on this connection.
    pub fn unregister_request_handler(&self, name: &str) -> bool {
        self.methods.remove(name)
    }

    /// Subscribe to endpoint events.
    pub fn on<F>(&self, kind: EventKind, callback: F) -> SubscriptionToken
    where
        F: Fn(&EndpointEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.events.on(kind, callback)
    }

    /// Remove a subscription.
    pub fn off(&self, token: SubscriptionToken) -> bool {
        self.events.off(token)
    }

    /// Ask the transport to close the connection.
    pub fn close(&self) {
        debug!(connection_id = ?self.connection_id, "closing connection");
        self.transport.close();
    }

    /// Store a per-connection session value.
    pub fn set_session_value(&self, key: impl Into<String>, value: Value) -> Option<Value> {
        self.session.lock().insert(key.into(), value)
    }

    /// Read a per-connection session value.
    #[must_use]
    pub fn session_value(&self, key: &str) -> Option<Value> {
        self.session.lock().get(key).cloned()
    }

    /// Remove a per-connection session value.
    pub fn remove_session_value(&self, key: &str) -> Option<Value> {
        self.session.lock().remove(key)
    }

    /// Feed one transport event to the endpoint.
    pub fn handle_event(self: &Arc<Self>, event: TransportEvent) {
        match event {
            TransportEvent::Open => self.on_open(),
            TransportEvent::Message(bytes) => self.on_message(bytes),
            TransportEvent::Close(reason) => self.on_close(reason),
            TransportEvent::Error(err) => self.on_transport_error(err),
        }
    }

    /// Process a connection's events in order until it closes.
    ///
    /// The end of the event stream counts as a close.
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event);

            if self.state() == EndpointState::Closed {
                break;
            }
        }

        self.on_close(None);
    }

    /// The transport reported open.
    pub fn on_open(&self) {
        {
            let mut correlation = self.correlation.lock();
            if correlation.state != EndpointState::Idle {
                return;
            }
            correlation.state = EndpointState::Open;
        }

        info!(connection_id = ?self.connection_id, "connection open");
        self.emit(EndpointEvent::Open);
    }

    /// The transport delivered a message.
    pub fn on_message(self: &Arc<Self>, bytes: Bytes) {
        trace!(
            connection_id = ?self.connection_id,
            "received: {}",
            preview(&bytes, self.config.log_preview_len)
        );

        let envelope = match self.codec.decode(&bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                self.raise(e.into());
                return;
            }
        };

        match envelope {
            Envelope::Response {
                id,
                name,
                status,
                data,
            } => {
                self.emit(EndpointEvent::Message(bytes));
                self.complete(id, &name, status, data);
            }
            Envelope::Request { id, name, data } => {
                self.emit(EndpointEvent::Message(bytes));
                self.dispatch(id, name, data);
            }
            Envelope::Other { kind, .. } => {
                self.raise(ValidationError::UnrecognizedKind(kind).into());
            }
        }
    }

    /// The transport closed. Rejects everything still pending, exactly once.
    pub fn on_close(&self, reason: Option<String>) {
        let pending: Vec<(u64, Completion)> = {
            let mut correlation = self.correlation.lock();
            if correlation.state == EndpointState::Closed {
                return;
            }
            correlation.state = EndpointState::Closed;

            let pending: Vec<_> = correlation.pending.drain().collect();
            for (slot, _) in &pending {
                correlation.request_ids.free(*slot);
            }
            pending
        };

        info!(
            connection_id = ?self.connection_id,
            rejected = pending.len(),
            "connection closed"
        );

        for (_, completion) in pending {
            let _ = completion.send(Err(Error::ConnectionClosed));
        }

        self.emit(EndpointEvent::Close(reason));
    }

    /// The transport reported an error. Does not close the connection.
    pub fn on_transport_error(&self, err: TransportError) {
        self.raise(Error::Transport(err));
    }

    fn complete(&self, id: RequestId, name: &str, status: Status, data: Value) {
        let completion = {
            // Negative ids were never issued here.
            let slot = u64::try_from(id).ok();
            let mut correlation = self.correlation.lock();
            let completion = slot.and_then(|slot| correlation.pending.remove(&slot));
            if let (Some(slot), Some(_)) = (slot, &completion) {
                correlation.request_ids.free(slot);
            }
            completion
        };

        let Some(completion) = completion else {
            self.raise(Error::UnmatchedResponse(id));
            return;
        };

        debug!(connection_id = ?self.connection_id, id, name, status = status.as_str(), "response matched");

        let outcome = match status {
            Status::Resolve => Ok(data),
            Status::Reject => Err(Error::Rejected(data)),
        };

        if completion.send(outcome).is_err() {
            debug!(id, name, "response arrived after the caller stopped waiting");
        }
    }

    fn dispatch(self: &Arc<Self>, id: RequestId, name: String, data: Value) {
        let Some(handler) = self.lookup(&name) else {
            self.raise(Error::UnknownMethod(name));
            return;
        };

        debug!(connection_id = ?self.connection_id, id, name = %name, "dispatching request");

        let endpoint = Arc::clone(self);
        tokio::spawn(async move {
            let (status, data) = match handler.handle(Arc::clone(&endpoint), data).await {
                Ok(result) => (Status::Resolve, result),
                Err(err) => (Status::Reject, Value::String(err.to_string())),
            };

            endpoint.send_response(id, &name, status, data);
        });
    }

    fn lookup(&self, name: &str) -> Option<Arc<dyn RequestHandler>> {
        self.methods
            .get(name)
            .or_else(|| self.shared_methods.as_ref().and_then(|shared| shared.get(name)))
    }

    fn send_response(&self, id: RequestId, name: &str, status: Status, data: Value) {
        if !self.is_open() {
            self.raise(Error::NotConnected);
            return;
        }

        let bytes = match self.codec.encode(&Envelope::response(id, name, status, data)) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.raise(e.into());
                return;
            }
        };

        match self.transport.send(bytes.clone()) {
            Ok(()) => {
                debug!(connection_id = ?self.connection_id, id, name, status = status.as_str(), "sent response");
                self.emit(EndpointEvent::Send(bytes));
            }
            Err(e) => self.raise(e.into()),
        }
    }

    fn emit(&self, event: EndpointEvent) {
        for failure in self.events.emit(&event) {
            self.raise(Error::Callback(failure.to_string()));
        }
    }

    /// Report an error on the error channel. Failures of error callbacks are
    /// only logged.
    fn raise(&self, error: Error) {
        warn!(connection_id = ?self.connection_id, "{error}");

        for failure in self.events.emit(&EndpointEvent::Error(error)) {
            warn!(connection_id = ?self.connection_id, "error callback failed: {failure}");
        }
    }
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("connection_id", &self.connection_id)
            .field("state", &self.state())
            .field("pending", &self.pending_count())
            .field("methods", &self.methods)
            .finish_non_exhaustive()
    }
}

fn preview(bytes: &[u8], limit: usize) -> std::borrow::Cow<'_, str> {
    String::from_utf8_lossy(&bytes[..bytes.len().min(limit)])
}
