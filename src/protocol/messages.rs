// Internal protocol message bodies.
//
// Encoded with bincode on the binary framings; discovery records use JSON.

use super::{wire_message, WireMessage};
use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Peer registration request, signed with the shared access key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterReq {
    pub node: u32,
    pub access_token: String,
}

/// Registration reply; an errno-flagged packet carries the rejection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterAck {
    pub node: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepAliveReq {
    pub time: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeepAliveAck {
    pub time: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum InstanceState {
    #[default]
    Up,
    Down,
}

/// Broadcast when a backend joins or leaves the mesh.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceStateNtf {
    pub state: InstanceState,
    pub peers: Vec<u32>,
}

/// A backend declares the inclusive client command range it handles.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeReq {
    pub msg_start: i32,
    pub msg_end: i32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeAck {}

/// A client packet in transit between gateway and backend, both directions.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardClientMsg {
    pub session: u32,
    pub user_id: i64,
    pub msg_id: u32,
    pub msg_data: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientPingReq {
    pub time: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientPongAck {
    pub time: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KickClientReq {
    pub sessions: Vec<u32>,
    pub reason: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KickClientAck {
    pub count: u32,
}

/// Gateway tells subscribed backends that a client session went away.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientLostNtf {
    pub user_id: i64,
    pub session: u32,
}

/// Gateway tells a client why it is being disconnected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientDisconnectNtf {
    pub reason: u32,
}

/// Discovery record, JSON-encoded under the service key prefix.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub node: u32,
    #[serde(default)]
    pub interface: String,
}

wire_message!(RegisterReq, super::MSG_REGISTER_REQ);
wire_message!(RegisterAck, super::MSG_REGISTER_ACK);
wire_message!(KeepAliveReq, super::MSG_KEEP_ALIVE_REQ);
wire_message!(KeepAliveAck, super::MSG_KEEP_ALIVE_ACK);
wire_message!(InstanceStateNtf, super::MSG_INSTANCE_STATE_NTF);
wire_message!(SubscribeReq, super::MSG_SUBSCRIBE_REQ);
wire_message!(SubscribeAck, super::MSG_SUBSCRIBE_ACK);
wire_message!(ForwardClientMsg, super::MSG_FORWARD_CLIENT_ACK);
wire_message!(ClientPingReq, super::MSG_CLIENT_PING_REQ);
wire_message!(ClientPongAck, super::MSG_CLIENT_PONG_ACK);
wire_message!(KickClientReq, super::MSG_KICK_CLIENT_REQ);
wire_message!(KickClientAck, super::MSG_KICK_CLIENT_ACK);
wire_message!(ClientLostNtf, super::MSG_CLIENT_LOST_NTF);
wire_message!(ClientDisconnectNtf, super::MSG_CLIENT_DISCONNECT_NTF);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::decode_message;

    #[test]
    fn forward_msg_round_trip() {
        let msg = ForwardClientMsg {
            session: 0x8000_0001,
            user_id: 42,
            msg_id: 150,
            msg_data: b"hello".to_vec(),
        };
        let back: ForwardClientMsg = decode_message(&msg.encode().unwrap()).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn node_info_json_round_trip() {
        let info = NodeInfo {
            node: 0x0005_0001,
            interface: "10.0.0.5:9100".to_string(),
        };
        let data = serde_json::to_string(&info).unwrap();
        let back: NodeInfo = serde_json::from_str(&data).unwrap();
        assert_eq!(back, info);
    }

    #[test]
    fn node_info_tolerates_missing_interface() {
        let back: NodeInfo = serde_json::from_str(r#"{"node":7}"#).unwrap();
        assert_eq!(back.node, 7);
        assert!(back.interface.is_empty());
    }

    #[test]
    fn state_ntf_json_has_named_state() {
        let ntf = InstanceStateNtf {
            state: InstanceState::Down,
            peers: vec![1, 2],
        };
        let v = ntf.to_json().unwrap();
        assert_eq!(v["state"], "Down");
    }
}
