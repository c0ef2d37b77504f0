//! Envelope codec: validation and JSON serialization.

use bytes::Bytes;
use serde::Serialize;
use serde_json::{Map, Value};

use super::envelope::{Envelope, RequestId, Status};
use crate::error::{CodecError, ValidationError};

/// Converts envelopes to and from wire bytes.
pub trait Codec: Send + Sync + 'static {
    /// Encode an envelope into wire bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the payload cannot be serialized.
    fn encode(&self, envelope: &Envelope) -> Result<Bytes, CodecError>;

    /// Validate and decode wire bytes into an envelope.
    ///
    /// # Errors
    ///
    /// Returns the first failing validation check.
    fn decode(&self, bytes: &[u8]) -> Result<Envelope, ValidationError>;
}

/// JSON codec matching the `{type, id, name, data, status}` wire shape.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

#[derive(Serialize)]
struct WireEnvelope<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<RequestId>,
    name: &'a str,
    data: &'a Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    status: Option<Status>,
}

impl Codec for JsonCodec {
    fn encode(&self, envelope: &Envelope) -> Result<Bytes, CodecError> {
        let wire = match envelope {
            Envelope::Request { id, name, data } => WireEnvelope {
                kind: "request",
                id: Some(*id),
                name,
                data,
                status: None,
            },
            Envelope::Response {
                id,
                name,
                status,
                data,
            } => WireEnvelope {
                kind: "response",
                id: Some(*id),
                name,
                data,
                status: Some(*status),
            },
            Envelope::Other { kind, name } => WireEnvelope {
                kind,
                id: None,
                name,
                data: &Value::Null,
                status: None,
            },
        };

        serde_json::to_vec(&wire)
            .map(Bytes::from)
            .map_err(|e| CodecError::SerializationFailed(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Envelope, ValidationError> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| ValidationError::MalformedPayload(e.to_string()))?;

        // A document that is not an object cannot carry a `type` field.
        let Value::Object(mut object) = value else {
            return Err(ValidationError::MissingType);
        };

        let kind = match object.remove("type") {
            None => return Err(ValidationError::MissingType),
            Some(Value::String(kind)) => kind,
            Some(_) => return Err(ValidationError::InvalidType),
        };

        let correlated = kind == "request" || kind == "response";
        let id = if correlated {
            Some(parse_id(&object)?)
        } else {
            None
        };

        let name = match object.remove("name") {
            None => return Err(ValidationError::MissingName),
            Some(Value::String(name)) => name,
            Some(_) => return Err(ValidationError::InvalidName),
        };

        let data = object.remove("data").unwrap_or(Value::Null);

        match (kind.as_str(), id) {
            ("request", Some(id)) => Ok(Envelope::Request { id, name, data }),
            ("response", Some(id)) => {
                let status = object
                    .get("status")
                    .and_then(Value::as_str)
                    .and_then(Status::parse)
                    .ok_or(ValidationError::InvalidStatus)?;
                Ok(Envelope::Response {
                    id,
                    name,
                    status,
                    data,
                })
            }
            _ => Ok(Envelope::Other { kind, name }),
        }
    }
}

/// Accepts any JSON integer in the `i64` range, including integral floats
/// such as `2.0`.
fn parse_id(object: &Map<String, Value>) -> Result<RequestId, ValidationError> {
    let Some(Value::Number(id)) = object.get("id") else {
        return match object.get("id") {
            None => Err(ValidationError::MissingId),
            Some(_) => Err(ValidationError::InvalidId),
        };
    };

    if let Some(id) = id.as_i64() {
        return Ok(id);
    }

    match id.as_f64() {
        #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
        Some(f) if f.fract() == 0.0 && f >= i64::MIN as f64 && f < i64::MAX as f64 => {
            Ok(f as i64)
        }
        _ => Err(ValidationError::InvalidId),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(raw: &str) -> Result<Envelope, ValidationError> {
        JsonCodec.decode(raw.as_bytes())
    }

    #[test]
    fn test_decode_request() {
        let envelope = decode(r#"{"type":"request","id":3,"name":"echo","data":{"x":1}}"#).unwrap();
        assert_eq!(envelope, Envelope::request(3, "echo", json!({"x": 1})));
    }

    #[test]
    fn test_decode_response_without_data() {
        let envelope = decode(r#"{"type":"response","id":0,"name":"ping","status":"reject"}"#).unwrap();
        assert_eq!(
            envelope,
            Envelope::response(0, "ping", Status::Reject, Value::Null)
        );
    }

    #[test]
    fn test_validation_order() {
        let cases = [
            ("not json", None),
            ("[1, 2]", Some(ValidationError::MissingType)),
            (r#"{"name":"x"}"#, Some(ValidationError::MissingType)),
            (r#"{"type":123}"#, Some(ValidationError::InvalidType)),
            (r#"{"type":"request","name":"x"}"#, Some(ValidationError::MissingId)),
            (r#"{"type":"response","id":"7","name":"x"}"#, Some(ValidationError::InvalidId)),
            (r#"{"type":"request","id":1.5,"name":"x"}"#, Some(ValidationError::InvalidId)),
            (r#"{"type":"request","id":null,"name":"x"}"#, Some(ValidationError::InvalidId)),
            (
                r#"{"type":"request","id":18446744073709551615,"name":"x"}"#,
                Some(ValidationError::InvalidId),
            ),
            (r#"{"type":"request","id":1}"#, Some(ValidationError::MissingName)),
            (r#"{"type":"request","id":1,"name":false}"#, Some(ValidationError::InvalidName)),
            (r#"{"type":"response","id":1,"name":"x"}"#, Some(ValidationError::InvalidStatus)),
            (
                r#"{"type":"response","id":1,"name":"x","status":"maybe"}"#,
                Some(ValidationError::InvalidStatus),
            ),
        ];

        for (raw, expected) in cases {
            let err = decode(raw).unwrap_err();
            match expected {
                Some(expected) => assert_eq!(err, expected, "input: {raw}"),
                None => assert!(
                    matches!(err, ValidationError::MalformedPayload(_)),
                    "input: {raw}"
                ),
            }
        }
    }

    #[test]
    fn test_any_integer_id_is_accepted() {
        let negative = decode(r#"{"type":"request","id":-1,"name":"echo"}"#).unwrap();
        assert_eq!(negative, Envelope::request(-1, "echo", Value::Null));

        let integral_float = decode(r#"{"type":"request","id":2.0,"name":"echo"}"#).unwrap();
        assert_eq!(integral_float, Envelope::request(2, "echo", Value::Null));

        let response =
            decode(r#"{"type":"response","id":-7,"name":"echo","status":"resolve"}"#).unwrap();
        assert_eq!(
            response,
            Envelope::response(-7, "echo", Status::Resolve, Value::Null)
        );
    }

    #[test]
    fn test_missing_id_checked_before_name() {
        assert_eq!(
            decode(r#"{"type":"request"}"#).unwrap_err(),
            ValidationError::MissingId
        );
    }

    #[test]
    fn test_unknown_kind_skips_id_check() {
        let envelope = decode(r#"{"type":"event","name":"tick"}"#).unwrap();
        assert_eq!(
            envelope,
            Envelope::Other {
                kind: "event".to_string(),
                name: "tick".to_string()
            }
        );
    }

    #[test]
    fn test_encode_wire_shape() {
        let bytes = JsonCodec
            .encode(&Envelope::response(4, "sum", Status::Resolve, json!(10)))
            .unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            value,
            json!({"type": "response", "id": 4, "name": "sum", "data": 10, "status": "resolve"})
        );

        let bytes = JsonCodec
            .encode(&Envelope::request(0, "sum", json!([1, 2])))
            .unwrap();
        let value: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            value,
            json!({"type": "request", "id": 0, "name": "sum", "data": [1, 2]})
        );
    }
}
