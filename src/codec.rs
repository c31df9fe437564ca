// Copyright 2026 Joyent, Inc.

//! Payload (de)serialization.
//!
//! The transport moves opaque entity bytes; a [`PayloadCodec`] turns them
//! into `serde_json::Value` at the boundary.  Typed conversion happens at
//! the public API edge with `serde_json::{to_value, from_value}`, keeping
//! the trait object-safe.

use serde_json::Value;

use crate::errors::RpcError;

pub trait PayloadCodec: Send + Sync {
    /// Label stamped into the dataFormat field of REQUEST records.
    fn format(&self) -> &'static str;

    fn encode(&self, value: &Value) -> Result<Vec<u8>, RpcError>;

    fn decode(&self, bytes: &[u8]) -> Result<Value, RpcError>;
}

/// The default codec.  JSON is the one format every peer speaks.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl PayloadCodec for JsonCodec {
    fn format(&self) -> &'static str {
        "json"
    }

    fn encode(&self, value: &Value) -> Result<Vec<u8>, RpcError> {
        serde_json::to_vec(value).map_err(|e| RpcError::Payload(e.to_string()))
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, RpcError> {
        serde_json::from_slice(bytes).map_err(|e| RpcError::Payload(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_roundtrip() {
        let codec = JsonCodec;
        let value = json!({"bucket": "manta", "count": 3});
        let bytes = codec.encode(&value).unwrap();
        assert_eq!(codec.decode(&bytes).unwrap(), value);
    }

    #[test]
    fn garbage_is_a_payload_error() {
        let codec = JsonCodec;
        match codec.decode(b"\x00not json") {
            Err(RpcError::Payload(_)) => (),
            other => panic!("expected payload error, got {:?}", other),
        }
    }
}
