//! Configuration for endpoints, servers, and clients.

/// Configuration shared by every endpoint.
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    /// How many bytes of each inbound message are included in debug logs.
    pub log_preview_len: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            log_preview_len: 256,
        }
    }
}

impl EndpointConfig {
    /// Set the debug log preview length.
    #[must_use]
    pub const fn log_preview_len(mut self, len: usize) -> Self {
        self.log_preview_len = len;
        self
    }
}

/// Configuration for the server registry.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Applied to every accepted connection.
    pub endpoint: EndpointConfig,
    /// Maximum concurrent connections.
    pub max_connections: usize,
    /// Close a connection as soon as its transport reports an error.
    pub close_on_transport_error: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            endpoint: EndpointConfig::default(),
            max_connections: 1024,
            close_on_transport_error: false,
        }
    }
}

impl ServerConfig {
    /// Set the endpoint configuration.
    #[must_use]
    pub fn endpoint(mut self, endpoint: EndpointConfig) -> Self {
        self.endpoint = endpoint;
        self
    }

    /// Set the connection limit.
    #[must_use]
    pub const fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Close connections whose transport reports an error.
    #[must_use]
    pub const fn close_on_transport_error(mut self, close: bool) -> Self {
        self.close_on_transport_error = close;
        self
    }
}

/// Configuration for the client.
#[derive(Debug, Clone, Default)]
pub struct ClientConfig {
    /// Applied to the client's endpoint.
    pub endpoint: EndpointConfig,
}
