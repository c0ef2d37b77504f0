//! Error types for the duplex RPC protocol.

use serde_json::Value;
use thiserror::Error;

use crate::protocol::RequestId;
use crate::transport::TransportError;

/// Result type alias for RPC operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for RPC operations.
///
/// Every variant is cheap to clone so errors can travel through the event bus.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// An inbound message failed validation and was discarded.
    #[error("Invalid message: {0}")]
    Validation(#[from] ValidationError),

    /// A request was attempted while the endpoint was not open.
    #[error("Not connected")]
    NotConnected,

    /// A response arrived for an id with no pending request.
    #[error("No pending request matches response id {0}")]
    UnmatchedResponse(RequestId),

    /// A request arrived for a method nobody registered.
    #[error("No request handler registered for method `{0}`")]
    UnknownMethod(String),

    /// The connection closed before a response arrived.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The peer answered with a reject status.
    #[error("Request rejected: {0}")]
    Rejected(Value),

    /// The transport failed.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Payload conversion failed.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// An event callback returned an error.
    #[error("Event callback failed: {0}")]
    Callback(String),

    /// The connection reported an error or closed before it opened.
    #[error("Failed to connect: {0}")]
    ConnectFailed(String),

    /// The server refused a connection because it is full.
    #[error("Connection limit of {0} reached")]
    ConnectionLimit(usize),
}

/// Structural problems with an inbound envelope.
///
/// Checks run in declaration order and the first failure wins.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// The bytes are not a JSON document.
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// The `type` field is absent.
    #[error("Missing message type")]
    MissingType,

    /// The `type` field is not a string.
    #[error("Invalid message type")]
    InvalidType,

    /// A request or response has no `id`.
    #[error("Missing message id")]
    MissingId,

    /// The `id` field is not a non-negative integer.
    #[error("Invalid message id")]
    InvalidId,

    /// The `name` field is absent.
    #[error("Missing message name")]
    MissingName,

    /// The `name` field is not a string.
    #[error("Invalid message name")]
    InvalidName,

    /// A response carries no recognised `status`.
    #[error("Invalid response status")]
    InvalidStatus,

    /// The `type` is a string but neither `request` nor `response`.
    #[error("Unrecognized message kind: {0}")]
    UnrecognizedKind(String),
}

/// Codec-related errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CodecError {
    /// Serialization failed.
    #[error("Failed to serialize: {0}")]
    SerializationFailed(String),

    /// Deserialization failed.
    #[error("Failed to deserialize: {0}")]
    DeserializationFailed(String),
}
