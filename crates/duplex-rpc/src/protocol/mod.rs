//! Protocol layer for the duplex RPC framework.
//!
//! This module contains the wire envelope and its codec:
//! - Envelope shapes and response status
//! - The pluggable `Codec` trait and the JSON implementation

pub mod codec;
pub mod envelope;

pub use codec::{Codec, JsonCodec};
pub use envelope::{Envelope, RequestId, Status};
