//! Client facade over a single outbound connection.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument};

use crate::config::ClientConfig;
use crate::endpoint::{Endpoint, EndpointEvent, PendingResponse};
use crate::error::{Error, Result};
use crate::events::{Callback, EventKind, SubscriptionToken};
use crate::handler::{MethodTable, RequestHandler};
use crate::protocol::{Codec, JsonCodec};
use crate::transport::{Connection, Connector};

/// Builder for creating clients.
///
/// Handlers and subscriptions added here are in place before the connection
/// opens, so they observe its very first events.
pub struct ClientBuilder {
    config: ClientConfig,
    codec: Arc<dyn Codec>,
    methods: MethodTable,
    subscriptions: Vec<(EventKind, Callback<EndpointEvent>)>,
}

impl ClientBuilder {
    /// Create a new client builder.
    #[must_use]
    pub fn new() -> Self {
        Self {
            config: ClientConfig::default(),
            codec: Arc::new(JsonCodec),
            methods: MethodTable::new(),
            subscriptions: Vec::new(),
        }
    }

    /// Set the client configuration.
    #[must_use]
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Use a codec other than JSON.
    #[must_use]
    pub fn codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    /// Register a method the server may call on this client.
    #[must_use]
    pub fn request_handler(self, name: impl Into<String>, handler: impl RequestHandler) -> Self {
        self.methods.insert(name, Arc::new(handler));
        self
    }

    /// Subscribe to an endpoint event.
    #[must_use]
    pub fn on<F>(mut self, kind: EventKind, callback: F) -> Self
    where
        F: Fn(&EndpointEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.subscriptions.push((kind, Arc::new(callback)));
        self
    }

    /// Open a connection to `target` and wait until it is open.
    ///
    /// # Errors
    ///
    /// Returns the connector's error as [`Error::Transport`], or
    /// [`Error::ConnectFailed`] if the connection reports an error or closes
    /// before it opens.
    #[instrument(skip(self, connector))]
    pub async fn connect<C>(self, connector: &C, target: &str) -> Result<Client>
    where
        C: Connector + ?Sized,
    {
        let Connection { transport, events } = connector.connect(target).await?;

        let endpoint = Arc::new(
            Endpoint::new(transport, self.config.endpoint)
                .with_codec(self.codec)
                .with_methods(self.methods),
        );
        for (kind, callback) in self.subscriptions {
            endpoint.on(kind, move |event| callback(event));
        }

        let (opened_tx, opened_rx) = oneshot::channel();
        let opened = Arc::new(Mutex::new(Some(opened_tx)));
        let watchers: Vec<SubscriptionToken> = [EventKind::Open, EventKind::Close, EventKind::Error]
            .into_iter()
            .map(|kind| {
                let opened = Arc::clone(&opened);
                endpoint.on(kind, move |event| {
                    let outcome = match event {
                        EndpointEvent::Open => Ok(()),
                        EndpointEvent::Close(reason) => Err(Error::ConnectFailed(
                            reason
                                .clone()
                                .unwrap_or_else(|| "connection closed".to_string()),
                        )),
                        EndpointEvent::Error(error) => Err(Error::ConnectFailed(error.to_string())),
                        EndpointEvent::Message(_) | EndpointEvent::Send(_) => return Ok(()),
                    };
                    if let Some(opened) = opened.lock().take() {
                        let _ = opened.send(outcome);
                    }
                    Ok(())
                })
            })
            .collect();

        let driver = tokio::spawn(Arc::clone(&endpoint).run(events));
        let outcome = opened_rx.await.unwrap_or(Err(Error::ConnectionClosed));

        for token in watchers {
            endpoint.off(token);
        }

        match outcome {
            Ok(()) => {
                info!(target, "client connected");
                Ok(Client {
                    endpoint,
                    driver: Some(driver),
                })
            }
            Err(e) => {
                debug!(target, "connect failed: {e}");
                endpoint.close();
                driver.abort();
                Err(e)
            }
        }
    }
}

impl Default for ClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("config", &self.config)
            .field("methods", &self.methods)
            .field("subscriptions", &self.subscriptions.len())
            .finish_non_exhaustive()
    }
}

/// A connected client: one endpoint on one outbound connection.
///
/// Dropping the client closes the connection.
pub struct Client {
    endpoint: Arc<Endpoint>,
    driver: Option<JoinHandle<()>>,
}

impl Client {
    /// Create a new client builder.
    #[must_use]
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// Connect with default settings.
    ///
    /// # Errors
    ///
    /// See [`ClientBuilder::connect`].
    pub async fn connect<C>(connector: &C, target: &str) -> Result<Self>
    where
        C: Connector + ?Sized,
    {
        ClientBuilder::new().connect(connector, target).await
    }

    /// The underlying endpoint.
    #[must_use]
    pub const fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    /// Whether the connection is still open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.endpoint.is_open()
    }

    /// See [`Endpoint::send_request`].
    ///
    /// # Errors
    ///
    /// Fails immediately if the connection is not open or the send fails.
    pub fn send_request(&self, name: &str, data: Value) -> Result<PendingResponse> {
        self.endpoint.send_request(name, data)
    }

    /// See [`Endpoint::request`].
    ///
    /// # Errors
    ///
    /// Fails if the request cannot be sent, is rejected, or the connection closes.
    pub async fn request(&self, name: &str, data: Value) -> Result<Value> {
        self.endpoint.request(name, data).await
    }

    /// See [`Endpoint::call`].
    ///
    /// # Errors
    ///
    /// Fails like [`Client::request`], or if conversion fails.
    pub async fn call<Req, Resp>(&self, name: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize + ?Sized,
        Resp: DeserializeOwned,
    {
        self.endpoint.call(name, request).await
    }

    /// Register or replace a method the server may call.
    pub fn register_request_handler(&self, name: impl Into<String>, handler: impl RequestHandler) {
        self.endpoint.register_request_handler(name, handler);
    }

    /// Subscribe to connection events.
    pub fn on<F>(&self, kind: EventKind, callback: F) -> SubscriptionToken
    where
        F: Fn(&EndpointEvent) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.endpoint.on(kind, callback)
    }

    /// Remove a subscription.
    pub fn off(&self, token: SubscriptionToken) -> bool {
        self.endpoint.off(token)
    }

    /// Close the connection.
    pub fn close(&self) {
        self.endpoint.close();
    }

    /// Wait until the connection has closed and every pending request was settled.
    pub async fn closed(&mut self) {
        if let Some(driver) = self.driver.take() {
            let _ = driver.await;
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.endpoint.close();
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}
