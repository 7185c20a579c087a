//! Body codec
//!
//! The serializer is injectable: the adapter only requires something that can
//! turn a structured body into the string that rides in the QSVC/TSVC message
//! body and back. JSON is the default wire format.

use serde_json::Value;

use crate::error::Result;

/// Encodes and decodes message bodies
pub trait Codec: Send + Sync {
    fn encode(&self, body: &Value) -> Result<String>;
    fn decode(&self, raw: &str) -> Result<Value>;
}

/// Default JSON codec
#[derive(Debug, Default, Clone)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, body: &Value) -> Result<String> {
        Ok(serde_json::to_string(body)?)
    }

    fn decode(&self, raw: &str) -> Result<Value> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_round_trip() {
        let codec = JsonCodec;
        let body = json!({"name": "John", "count": 3, "nested": {"ok": true}});

        let raw = codec.encode(&body).unwrap();
        let decoded = codec.decode(&raw).unwrap();
        assert_eq!(decoded, body);
    }

    #[test]
    fn test_decode_rejects_invalid_payload() {
        let codec = JsonCodec;
        assert!(codec.decode("{not json").is_err());
    }
}
