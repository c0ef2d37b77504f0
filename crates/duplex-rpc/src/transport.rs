//! Transport capability consumed by endpoints.
//!
//! A transport moves opaque message bytes over one duplex connection. Outbound
//! sends are synchronous so a not-ready socket is reported to the caller at
//! once; inbound activity arrives as an ordered stream of [`TransportEvent`]s.
//! Concrete transports live in their own crates.

use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::mpsc;

/// Errors reported by a transport.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The connection is closed or not ready for writes.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Establishing the connection failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The target could not be parsed.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// The underlying socket failed.
    #[error("I/O error: {0}")]
    Io(String),

    /// Anything else.
    #[error("Transport error: {0}")]
    Other(String),
}

/// Inbound notifications from a connection, delivered in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection is ready for sends.
    Open,
    /// A complete message arrived.
    Message(Bytes),
    /// The connection closed, with an optional reason.
    Close(Option<String>),
    /// The connection reported an error. Closing is signalled separately.
    Error(TransportError),
}

/// Outbound half of a connection.
pub trait Transport: Debug + Send + Sync + 'static {
    /// Hand one message to the connection.
    ///
    /// # Errors
    ///
    /// Returns an error immediately if the connection cannot accept writes.
    fn send(&self, data: Bytes) -> Result<(), TransportError>;

    /// Ask the connection to close. The close itself is reported as a
    /// [`TransportEvent::Close`].
    fn close(&self);
}

/// A live connection: the send capability plus its inbound event stream.
#[derive(Debug)]
pub struct Connection {
    /// Outbound half.
    pub transport: Arc<dyn Transport>,
    /// Inbound events.
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

impl Connection {
    /// Bundle a transport with its event stream.
    pub fn new(
        transport: Arc<dyn Transport>,
        events: mpsc::UnboundedReceiver<TransportEvent>,
    ) -> Self {
        Self { transport, events }
    }
}

/// Opens outbound connections.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Connect to `target`.
    async fn connect(&self, target: &str) -> Result<Connection, TransportError>;
}

/// Accepts inbound connections.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    /// Wait for the next connection. [`TransportError::ConnectionClosed`]
    /// means the listener is shut down.
    async fn accept(&self) -> Result<Connection, TransportError>;
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Transport that records every send and can be made to fail.
    #[derive(Debug, Default)]
    pub struct RecordingTransport {
        pub sent: Mutex<Vec<Bytes>>,
        pub fail_sends: AtomicBool,
        pub closed: AtomicBool,
    }

    impl RecordingTransport {
        pub fn sent_json(&self) -> Vec<serde_json::Value> {
            self.sent
                .lock()
                .iter()
                .map(|bytes| serde_json::from_slice(bytes).unwrap())
                .collect()
        }

        pub fn set_failing(&self, failing: bool) {
            self.fail_sends.store(failing, Ordering::SeqCst);
        }
    }

    impl Transport for RecordingTransport {
        fn send(&self, data: Bytes) -> Result<(), TransportError> {
            if self.fail_sends.load(Ordering::SeqCst) {
                return Err(TransportError::ConnectionClosed);
            }
            self.sent.lock().push(data);
            Ok(())
        }

        fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }
}
