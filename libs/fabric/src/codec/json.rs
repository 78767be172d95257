use serde::{Deserialize, Serialize};

use crate::codec::Codec;
use crate::error::{Error, Result};

/// UTF-8 JSON codec used for application payloads on the wire
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>> {
        serde_json::to_vec(value).map_err(|e| Error::Codec(e.to_string()))
    }

    fn decode<T: for<'de> Deserialize<'de>>(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| Error::Codec(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};

    use super::*;

    #[test]
    fn decode_reports_malformed_input() {
        let err = JsonCodec.decode::<Value>(b"{not json").unwrap_err();
        assert!(matches!(err, Error::Codec(_)));
    }

    #[test]
    fn encodes_compact_json() {
        let bytes = JsonCodec.encode(&json!({ "a": 1 })).unwrap();
        assert_eq!(bytes, br#"{"a":1}"#);
    }
}
