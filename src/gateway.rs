//! Gateway re-encapsulation wire format.
//!
//! A gateway-proxy connection does not own a transport of its own: every
//! outbound packet is wrapped in a JSON envelope carrying the origin
//! connection id, the frame kind, the payload and a unix-nanosecond
//! timestamp, terminated by a single `0xFF` byte, and forwarded through the
//! upstream connection. The format is stable wire-level contract:
//!
//! ```text
//! {"C":"<conn id>","WT":<frame>,"D":"<base64 payload>","T":<nanos>} 0xFF
//! ```

use serde::{Deserialize, Serialize};

use crate::error::ServerError;

/// Terminator byte appended after the JSON envelope, exactly once per frame.
pub const FRAME_TERMINATOR: u8 = 0xFF;

/// The JSON envelope wrapped around re-encapsulated packets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayFrame {
    /// Origin connection id.
    #[serde(rename = "C")]
    pub conn_id: String,
    /// Transport frame kind of the wrapped packet.
    #[serde(rename = "WT")]
    pub frame: i32,
    /// Wrapped payload, base64 on the wire.
    #[serde(rename = "D", with = "base64_bytes")]
    pub data: Vec<u8>,
    /// Unix-nanosecond timestamp taken when the frame was wrapped.
    #[serde(rename = "T")]
    pub timestamp: i64,
}

/// Serializes a frame to its wire form: JSON followed by the terminator.
pub fn encode(frame: &GatewayFrame) -> Result<Vec<u8>, ServerError> {
    let mut buf = serde_json::to_vec(frame)
        .map_err(|e| ServerError::Internal(format!("gateway frame encode: {e}")))?;
    buf.push(FRAME_TERMINATOR);
    Ok(buf)
}

/// Parses a wire frame produced by [`encode`], validating the terminator.
pub fn decode(buf: &[u8]) -> Result<GatewayFrame, ServerError> {
    match buf.split_last() {
        Some((&FRAME_TERMINATOR, body)) => serde_json::from_slice(body)
            .map_err(|e| ServerError::Internal(format!("gateway frame decode: {e}"))),
        _ => Err(ServerError::Internal(
            "gateway frame missing terminator".to_string(),
        )),
    }
}

mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_is_bit_exact() {
        let frame = GatewayFrame {
            conn_id: "c-17".to_string(),
            frame: 2,
            data: vec![0x01, 0x02],
            timestamp: 1_700_000_000_000_000_000,
        };
        let wire = encode(&frame).expect("encode");
        assert_eq!(*wire.last().unwrap(), FRAME_TERMINATOR);
        assert_eq!(
            wire.iter().filter(|&&b| b == FRAME_TERMINATOR).count(),
            1,
            "terminator appears exactly once"
        );

        let parsed = decode(&wire).expect("decode");
        assert_eq!(parsed, frame);
    }

    #[test]
    fn payload_is_base64_on_the_wire() {
        let frame = GatewayFrame {
            conn_id: "c-17".to_string(),
            frame: 2,
            data: vec![0x01, 0x02],
            timestamp: 7,
        };
        let wire = encode(&frame).expect("encode");
        let text = std::str::from_utf8(&wire[..wire.len() - 1]).expect("json is utf-8");
        assert!(text.contains("\"C\":\"c-17\""), "got {text}");
        assert!(text.contains("\"WT\":2"), "got {text}");
        assert!(text.contains("\"D\":\"AQI=\""), "got {text}");
        assert!(text.contains("\"T\":7"), "got {text}");
    }

    #[test]
    fn missing_terminator_is_rejected() {
        let frame = GatewayFrame {
            conn_id: "x".into(),
            frame: 0,
            data: vec![],
            timestamp: 0,
        };
        let mut wire = encode(&frame).expect("encode");
        wire.pop();
        assert!(decode(&wire).is_err());
    }
}
