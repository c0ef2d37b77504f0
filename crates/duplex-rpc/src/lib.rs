//! Bidirectional request/response RPC over any message-oriented duplex
//! connection.
//!
//! Either side of a connection may send named requests to the other and
//! receive correlated responses. Messages are JSON envelopes of type
//! `request` or `response`; each request carries an id that is unique among
//! the sender's outstanding requests and is reused once answered.
//!
//! # Features
//!
//! - **Symmetric**: Clients and servers share one [`Endpoint`] engine
//! - **Server Registry**: Methods registered once reach every connection
//! - **Event Bus**: Subscribe to open, close, error, message, and send events
//! - **Pluggable Transports**: Anything implementing [`Transport`]
//!
//! # Example
//!
//! ```no_run
//! use proven_duplex_rpc::{Client, Connector, Endpoint, Value};
//! use std::sync::Arc;
//!
//! async fn example(connector: &impl Connector) -> Result<(), Box<dyn std::error::Error>> {
//!     let client = Client::builder()
//!         .request_handler("ping", |_endpoint: Arc<Endpoint>, _data: Value| async {
//!             Ok::<_, anyhow::Error>(Value::from("pong"))
//!         })
//!         .connect(connector, "ws://127.0.0.1:9000")
//!         .await?;
//!
//!     let sum = client.request("sum", serde_json::json!([1, 2])).await?;
//!     assert_eq!(sum, Value::from(3));
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod client;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod handler;
pub mod id_allocator;
pub mod protocol;
pub mod server;
pub mod transport;

// Re-export commonly used types
pub use client::{Client, ClientBuilder};
pub use config::{ClientConfig, EndpointConfig, ServerConfig};
pub use endpoint::{ConnectionId, Endpoint, EndpointEvent, EndpointState, PendingResponse};
pub use error::{CodecError, Error, Result, ValidationError};
pub use events::{BusEvent, Callback, EventBus, EventKind, SubscriptionToken};
pub use handler::{MethodTable, RequestHandler};
pub use id_allocator::IdAllocator;
pub use protocol::{Codec, Envelope, JsonCodec, RequestId, Status};
pub use server::{Server, ServerEvent};
pub use transport::{Connection, Connector, Listener, Transport, TransportError, TransportEvent};

// Re-export dependencies that are part of our public API
pub use bytes::Bytes;
pub use serde_json::Value;
