//! Self-describing byte codec for handler arguments, return values, and
//! exception records. JSON keeps the format stable across client/server
//! pairs without a shared schema registry.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type Value = serde_json::Value;
pub type Kwargs = serde_json::Map<String, Value>;

#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload encode error: {0}")]
    Encode(String),
    #[error("payload decode error: {0}")]
    Decode(String),
}

/// Argument tuple for one handler invocation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArgsPayload {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default)]
    pub kwargs: Kwargs,
}

/// Wire form of a user exception. Encoding is best-effort at the call
/// site; `repr` is always populated even when `detail` is not.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExceptionPayload {
    pub repr: String,
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub detail: Option<Value>,
}

pub fn encode_value(value: &Value) -> Result<Vec<u8>, PayloadError> {
    to_bytes(value)
}

pub fn decode_value(bytes: &[u8]) -> Result<Value, PayloadError> {
    from_bytes(bytes)
}

pub fn encode_args(payload: &ArgsPayload) -> Result<Vec<u8>, PayloadError> {
    to_bytes(payload)
}

pub fn decode_args(bytes: &[u8]) -> Result<ArgsPayload, PayloadError> {
    from_bytes(bytes)
}

pub fn encode_exception(
    payload: &ExceptionPayload,
) -> Result<Vec<u8>, PayloadError> {
    to_bytes(payload)
}

pub fn decode_exception(
    bytes: &[u8],
) -> Result<ExceptionPayload, PayloadError> {
    from_bytes(bytes)
}

pub(crate) fn to_bytes<T: Serialize>(
    value: &T,
) -> Result<Vec<u8>, PayloadError> {
    serde_json::to_vec(value).map_err(|err| PayloadError::Encode(err.to_string()))
}

pub(crate) fn from_bytes<T: DeserializeOwned>(
    bytes: &[u8],
) -> Result<T, PayloadError> {
    serde_json::from_slice(bytes)
        .map_err(|err| PayloadError::Decode(err.to_string()))
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn value_round_trip() {
        let values = [
            json!(null),
            json!(42),
            json!(-1.5),
            json!("text"),
            json!([1, [2, "three"], {"k": true}]),
            json!({"nested": {"deep": [null, 0.25]}}),
        ];
        for value in values {
            let bytes = encode_value(&value).unwrap();
            assert_eq!(decode_value(&bytes).unwrap(), value);
        }
    }

    #[test]
    fn args_round_trip() {
        let mut kwargs = Kwargs::new();
        kwargs.insert("retries".to_string(), json!(3));
        let payload = ArgsPayload { args: vec![json!([1, 2, 3])], kwargs };

        let bytes = encode_args(&payload).unwrap();
        let back = decode_args(&bytes).unwrap();
        assert_eq!(back.args, vec![json!([1, 2, 3])]);
        assert_eq!(back.kwargs.get("retries"), Some(&json!(3)));
    }

    #[test]
    fn empty_args_decode_to_defaults() {
        let back = decode_args(b"{}").unwrap();
        assert!(back.args.is_empty());
        assert!(back.kwargs.is_empty());
    }

    #[test]
    fn exception_repr_survives_round_trip() {
        let payload = ExceptionPayload {
            repr: "ValueError(\"nope\")".to_string(),
            kind: Some("ValueError".to_string()),
            detail: None,
        };
        let bytes = encode_exception(&payload).unwrap();
        assert_eq!(decode_exception(&bytes).unwrap().repr, payload.repr);
    }
}
