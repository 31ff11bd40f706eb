// Application-layer message
//
// A packet carries a command, a sequence number, flag bits, a destination
// node and an opaque body. Packets received from the wire keep a handle to
// the endpoint they arrived on so replies can go straight back without a
// global lookup; the endpoint never points back at packets.

use super::body::Body;
use super::node::NodeId;
use crate::error::{NetError, Result};
use crate::protocol::WireMessage;
use std::fmt;
use std::sync::Arc;

pub const PACKET_FLAG_COMPRESSED: u16 = 0x0001;
pub const PACKET_FLAG_ENCRYPTED: u16 = 0x0002;
pub const PACKET_FLAG_ERROR: u16 = 0x0100;
pub const PACKET_FLAG_RPC: u16 = 0x0400;
pub const PACKET_FLAG_JSON_TEXT: u16 = 0x0800;
/// Flags below 0x0100 belong to the transport and are not echoed in acks.
pub const PACKET_FLAG_BITS_MASK: u16 = 0xFF00;

/// The send-side capability a packet keeps for replying.
pub trait MessageEndpoint: Send + Sync {
    fn node(&self) -> NodeId;
    fn remote_addr(&self) -> String;
    fn send_packet(&self, pkt: Packet) -> Result<()>;
}

#[derive(Clone, Default)]
pub struct Packet {
    pub command: u32,
    pub seq: u32,
    pub flag: u16,
    pub node: NodeId,
    pub body: Body,
    pub endpoint: Option<Arc<dyn MessageEndpoint>>,
}

impl Packet {
    pub fn new(node: NodeId, command: u32, flag: u16, seq: u32, body: Body) -> Self {
        Self {
            command,
            seq,
            flag,
            node,
            body,
            endpoint: None,
        }
    }

    /// A bare packet carrying only a command.
    pub fn with_command(command: u32) -> Self {
        Self {
            command,
            ..Default::default()
        }
    }

    pub fn has_flag(&self, flag: u16) -> bool {
        self.flag & flag != 0
    }

    /// Error code of an error-flagged packet, zero otherwise.
    pub fn errno(&self) -> u32 {
        if !self.has_flag(PACKET_FLAG_ERROR) {
            return 0;
        }
        match &self.body {
            Body::Errno(ec) => *ec,
            Body::Bytes(b) if b.len() >= 4 => {
                u32::from_le_bytes([b[0], b[1], b[2], b[3]])
            }
            _ => 0,
        }
    }

    pub fn set_errno(&mut self, ec: u32) {
        self.flag |= PACKET_FLAG_ERROR;
        self.body = Body::Errno(ec);
    }

    /// Serialize the body once and leave the packet empty so it is cheap to
    /// hand off.
    pub fn encode_body(&mut self) -> Result<bytes::Bytes> {
        let data = self.body.encode()?;
        self.body = Body::Empty;
        Ok(data)
    }

    /// Interpret the body as a typed message, consuming it.
    pub fn decode_msg<M: serde::de::DeserializeOwned + Default>(&mut self) -> Result<M> {
        let msg = self.body.decode_message();
        self.body = Body::Empty;
        msg
    }

    /// Interpret the body as text, consuming it.
    pub fn decode_as_string(&mut self) -> String {
        let s = match &self.body {
            Body::Empty => String::new(),
            Body::Errno(ec) => ec.to_string(),
            Body::Text(s) => s.clone(),
            Body::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
            Body::Message(msg) => format!("{msg:?}"),
        };
        self.body = Body::Empty;
        s
    }

    /// Send a typed ack back on the originating endpoint. The ack keeps the
    /// request's sequence number; its command comes from the message type.
    pub fn reply<M: WireMessage + 'static>(&self, ack: M) -> Result<()> {
        let command = ack.command();
        self.reply_any(command, Body::Message(Arc::new(ack)))
    }

    /// Reply with an explicit command and body.
    pub fn reply_any(&self, command: u32, body: Body) -> Result<()> {
        let endpoint = self
            .endpoint
            .as_ref()
            .ok_or(NetError::PacketContextEmpty)?;
        let flags = self.flag & PACKET_FLAG_BITS_MASK;
        let pkt = Packet::new(endpoint.node(), command, flags, self.seq, body);
        endpoint.send_packet(pkt)
    }

    /// Reply carrying only an errno.
    pub fn refuse(&self, command: u32, errno: u32) -> Result<()> {
        let endpoint = self
            .endpoint
            .as_ref()
            .ok_or(NetError::PacketContextEmpty)?;
        let flags = (self.flag & PACKET_FLAG_BITS_MASK) | PACKET_FLAG_ERROR;
        let pkt = Packet::new(endpoint.node(), command, flags, self.seq, Body::Errno(errno));
        endpoint.send_packet(pkt)
    }

    /// JSON rendering used by the WebSocket text transport.
    pub fn to_json_value(&self) -> Result<serde_json::Value> {
        Ok(serde_json::json!({
            "cmd": self.command,
            "seq": self.seq,
            "flg": self.flag,
            "node": self.node.0,
            "body": self.body.to_json()?,
        }))
    }

    pub fn from_json_value(value: serde_json::Value) -> Result<Packet> {
        let cmd = value["cmd"]
            .as_u64()
            .ok_or_else(|| NetError::Serialization("packet json missing cmd".into()))?;
        let seq = value["seq"].as_u64().unwrap_or(0);
        let flag = value["flg"].as_u64().unwrap_or(0);
        let node = value["node"].as_u64().unwrap_or(0);
        let body = match value.get("body") {
            Some(v) => Body::from_json(v.clone()),
            None => Body::Empty,
        };
        Ok(Packet {
            command: cmd as u32,
            seq: seq as u32,
            flag: flag as u16,
            node: NodeId(node as u32),
            body,
            endpoint: None,
        })
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} c:{} seq:{} 0x{:x} {:?}",
            self.node, self.command, self.seq, self.flag, self.body
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ClientPongAck;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct CaptureEndpoint {
        sent: Mutex<Vec<Packet>>,
        node: NodeId,
    }

    impl MessageEndpoint for CaptureEndpoint {
        fn node(&self) -> NodeId {
            self.node
        }

        fn remote_addr(&self) -> String {
            "test".to_string()
        }

        fn send_packet(&self, pkt: Packet) -> Result<()> {
            self.sent.lock().push(pkt);
            Ok(())
        }
    }

    #[test]
    fn errno_round_trip() {
        let mut pkt = Packet::with_command(5);
        assert_eq!(pkt.errno(), 0);
        pkt.set_errno(205);
        assert_eq!(pkt.errno(), 205);
        assert!(pkt.has_flag(PACKET_FLAG_ERROR));
    }

    #[test]
    fn errno_reads_raw_bytes() {
        let mut pkt = Packet::with_command(5);
        pkt.flag |= PACKET_FLAG_ERROR;
        pkt.body = Body::from(vec![205, 0, 0, 0]);
        assert_eq!(pkt.errno(), 205);
    }

    #[test]
    fn reply_requires_endpoint() {
        let pkt = Packet::with_command(10);
        let err = pkt.reply(ClientPongAck { time: 1 }).unwrap_err();
        assert!(matches!(err, NetError::PacketContextEmpty));
    }

    #[test]
    fn reply_keeps_seq_and_masks_flags() {
        let endpoint = Arc::new(CaptureEndpoint {
            node: NodeId::backend(1, 2),
            ..Default::default()
        });
        let mut pkt = Packet::new(NodeId::ZERO, 150, 0x0801 | PACKET_FLAG_RPC, 7, Body::Empty);
        pkt.endpoint = Some(endpoint.clone());
        pkt.reply(ClientPongAck { time: 3 }).unwrap();

        let sent = endpoint.sent.lock();
        assert_eq!(sent.len(), 1);
        let ack = &sent[0];
        assert_eq!(ack.seq, 7);
        assert_eq!(ack.command, crate::protocol::MSG_CLIENT_PONG_ACK);
        assert_eq!(ack.flag, (0x0801 | PACKET_FLAG_RPC) & PACKET_FLAG_BITS_MASK);
        assert_eq!(ack.node, NodeId::backend(1, 2));
        assert!(!ack.has_flag(PACKET_FLAG_ERROR));
    }

    #[test]
    fn refuse_carries_errno() {
        let endpoint = Arc::new(CaptureEndpoint::default());
        let mut pkt = Packet::new(NodeId::ZERO, 150, 0, 9, Body::Empty);
        pkt.endpoint = Some(endpoint.clone());
        pkt.refuse(41, 205).unwrap();
        let sent = endpoint.sent.lock();
        assert_eq!(sent[0].errno(), 205);
        assert_eq!(sent[0].seq, 9);
    }

    #[test]
    fn decode_as_string_consumes_the_body() {
        let mut pkt = Packet::new(NodeId::ZERO, 1, 0, 0, Body::from("chat line"));
        assert_eq!(pkt.decode_as_string(), "chat line");
        assert!(pkt.body.is_empty());

        let mut raw = Packet::new(NodeId::ZERO, 1, 0, 0, Body::from(b"bytes".to_vec()));
        assert_eq!(raw.decode_as_string(), "bytes");
    }

    #[test]
    fn clone_shares_body_bytes() {
        let body = Body::from(vec![1u8, 2, 3]);
        let pkt = Packet::new(NodeId::ZERO, 1, 0, 0, body);
        let copy = pkt.clone();
        match (&pkt.body, &copy.body) {
            (Body::Bytes(a), Body::Bytes(b)) => assert_eq!(a.as_ptr(), b.as_ptr()),
            _ => panic!("expected byte bodies"),
        }
    }

    #[test]
    fn json_round_trip() {
        let pkt = Packet::new(NodeId(5), 150, PACKET_FLAG_JSON_TEXT, 2, Body::from("hello"));
        let back = Packet::from_json_value(pkt.to_json_value().unwrap()).unwrap();
        assert_eq!(back.command, 150);
        assert_eq!(back.seq, 2);
        assert_eq!(back.flag, PACKET_FLAG_JSON_TEXT);
        assert_eq!(back.node, NodeId(5));
        assert!(matches!(back.body, Body::Text(ref s) if s == "hello"));
    }
}
