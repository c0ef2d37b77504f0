//! Wire envelope types.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Request identifier as it appears on the wire.
///
/// Ids this side issues are never negative; peers may use any integer.
pub type RequestId = i64;

/// Which continuation a response selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    /// The request succeeded and `data` is its result.
    Resolve,
    /// The request failed and `data` describes the failure.
    Reject,
}

impl Status {
    /// Wire form of the status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Resolve => "resolve",
            Self::Reject => "reject",
        }
    }

    pub(crate) fn parse(value: &str) -> Option<Self> {
        match value {
            "resolve" => Some(Self::Resolve),
            "reject" => Some(Self::Reject),
            _ => None,
        }
    }
}

/// One unit of wire communication.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// Outbound or inbound call.
    Request {
        /// Correlation id chosen by the sender.
        id: RequestId,
        /// Method name.
        name: String,
        /// Opaque payload.
        data: Value,
    },
    /// Answer to a request.
    Response {
        /// Id of the request being answered.
        id: RequestId,
        /// Echo of the request's method name.
        name: String,
        /// Resolve or reject.
        status: Status,
        /// Result or failure payload.
        data: Value,
    },
    /// Structurally valid message with an unknown `type`.
    Other {
        /// The raw `type` value.
        kind: String,
        /// The `name` field.
        name: String,
    },
}

impl Envelope {
    /// Builds a request envelope.
    pub fn request(id: RequestId, name: impl Into<String>, data: Value) -> Self {
        Self::Request {
            id,
            name: name.into(),
            data,
        }
    }

    /// Builds a response envelope.
    pub fn response(id: RequestId, name: impl Into<String>, status: Status, data: Value) -> Self {
        Self::Response {
            id,
            name: name.into(),
            status,
            data,
        }
    }
}
