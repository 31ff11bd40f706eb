// Packet body
//
// One field holds any of five concrete shapes. The tag is never written to
// the wire: the framing's flag bits plus the expected command determine how
// the receiver interprets the bytes.

use crate::error::{NetError, Result};
use crate::protocol::WireMessage;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::Bytes;
use std::sync::Arc;

#[derive(Clone, Debug, Default)]
pub enum Body {
    #[default]
    Empty,
    /// Numeric error code; only valid together with the Error flag.
    Errno(u32),
    Text(String),
    Bytes(Bytes),
    /// Typed message, serialized lazily when the packet hits a codec.
    Message(Arc<dyn WireMessage>),
}

impl Body {
    pub fn is_empty(&self) -> bool {
        matches!(self, Body::Empty)
    }

    /// Serialize to wire bytes. Cloning `Bytes` is cheap; messages encode.
    pub fn encode(&self) -> Result<Bytes> {
        match self {
            Body::Empty => Ok(Bytes::new()),
            Body::Errno(ec) => Ok(Bytes::copy_from_slice(&ec.to_le_bytes())),
            Body::Text(s) => Ok(Bytes::copy_from_slice(s.as_bytes())),
            Body::Bytes(b) => Ok(b.clone()),
            Body::Message(msg) => Ok(Bytes::from(msg.encode()?)),
        }
    }

    /// JSON rendering for the WebSocket text transport.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        match self {
            Body::Empty => Ok(serde_json::Value::Null),
            Body::Errno(ec) => Ok(serde_json::Value::from(*ec)),
            Body::Text(s) => Ok(serde_json::Value::from(s.as_str())),
            Body::Bytes(b) => Ok(serde_json::Value::from(BASE64.encode(b))),
            Body::Message(msg) => msg.to_json(),
        }
    }

    /// Inverse of `to_json` as far as the tag survives: numbers come back as
    /// errnos, strings as text, structured values as their JSON bytes.
    pub fn from_json(value: serde_json::Value) -> Body {
        match value {
            serde_json::Value::Null => Body::Empty,
            serde_json::Value::Number(n) => match n.as_u64() {
                Some(v) if v <= u64::from(u32::MAX) => Body::Errno(v as u32),
                _ => Body::Text(n.to_string()),
            },
            serde_json::Value::String(s) => Body::Text(s),
            other => match serde_json::to_vec(&other) {
                Ok(data) => Body::Bytes(Bytes::from(data)),
                Err(_) => Body::Empty,
            },
        }
    }

    /// Interpret as a typed message; requires raw bytes.
    pub fn decode_message<M: serde::de::DeserializeOwned + Default>(&self) -> Result<M> {
        match self {
            Body::Empty => Ok(M::default()),
            Body::Bytes(b) => crate::protocol::decode_message(b),
            other => Err(NetError::Serialization(format!(
                "cannot decode message out of {other:?}"
            ))),
        }
    }
}

impl From<Bytes> for Body {
    fn from(b: Bytes) -> Self {
        if b.is_empty() {
            Body::Empty
        } else {
            Body::Bytes(b)
        }
    }
}

impl From<Vec<u8>> for Body {
    fn from(b: Vec<u8>) -> Self {
        Body::from(Bytes::from(b))
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Body::Text(s)
    }
}

impl From<&str> for Body {
    fn from(s: &str) -> Self {
        Body::Text(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::KeepAliveReq;

    #[test]
    fn encodes_each_variant() {
        assert!(Body::Empty.encode().unwrap().is_empty());
        assert_eq!(Body::Errno(0x0102).encode().unwrap().as_ref(), &[2, 1, 0, 0]);
        assert_eq!(Body::from("hi").encode().unwrap().as_ref(), b"hi");
        let raw = Body::from(vec![9u8, 8, 7]);
        assert_eq!(raw.encode().unwrap().as_ref(), &[9, 8, 7]);
    }

    #[test]
    fn message_encodes_and_decodes() {
        let body = Body::Message(Arc::new(KeepAliveReq { time: 99 }));
        let wire = body.encode().unwrap();
        let back: KeepAliveReq = Body::Bytes(wire).decode_message().unwrap();
        assert_eq!(back.time, 99);
    }

    #[test]
    fn decode_message_on_empty_yields_default() {
        let msg: KeepAliveReq = Body::Empty.decode_message().unwrap();
        assert_eq!(msg.time, 0);
    }

    #[test]
    fn decode_message_on_text_fails() {
        let res: crate::error::Result<KeepAliveReq> = Body::from("oops").decode_message();
        assert!(res.is_err());
    }

    #[test]
    fn json_round_trip_keeps_shape() {
        assert!(matches!(
            Body::from_json(Body::Empty.to_json().unwrap()),
            Body::Empty
        ));
        assert!(matches!(
            Body::from_json(Body::Errno(7).to_json().unwrap()),
            Body::Errno(7)
        ));
        assert!(matches!(
            Body::from_json(Body::from("x").to_json().unwrap()),
            Body::Text(ref s) if s == "x"
        ));
    }
}
