// Internal protocol surface
//
// Message-id constants, errno constants and the WireMessage trait that
// every internal protocol message implements. Real message names must
// match on both ends of a connection; ids below 100 are reserved for the
// mesh itself, the client command space starts at 100.

pub mod messages;

use crate::error::Result;

pub use messages::{
    ClientDisconnectNtf, ClientLostNtf, ClientPingReq, ClientPongAck, ForwardClientMsg,
    InstanceState, InstanceStateNtf, KeepAliveAck, KeepAliveReq, KickClientAck, KickClientReq,
    NodeInfo, RegisterAck, RegisterReq, SubscribeAck, SubscribeReq,
};

// ============================================================================
// Message ids
// ============================================================================

pub const MSG_KEEP_ALIVE_REQ: u32 = 11;
pub const MSG_KEEP_ALIVE_ACK: u32 = 12;
pub const MSG_INSTANCE_STATE_NTF: u32 = 13;
pub const MSG_REGISTER_REQ: u32 = 14;
pub const MSG_REGISTER_ACK: u32 = 15;
pub const MSG_SUBSCRIBE_REQ: u32 = 23;
pub const MSG_SUBSCRIBE_ACK: u32 = 24;
/// Gateway wraps a client packet for a subscribed backend.
pub const MSG_FORWARD_CLIENT_REQ: u32 = 31;
/// Backend hands a response back for a client session.
pub const MSG_FORWARD_CLIENT_ACK: u32 = 32;
pub const MSG_KICK_CLIENT_REQ: u32 = 33;
pub const MSG_KICK_CLIENT_ACK: u32 = 34;
pub const MSG_CLIENT_LOST_NTF: u32 = 35;
pub const MSG_CLIENT_DISCONNECT_NTF: u32 = 36;
/// Gateway-side login reply, only used to refuse a login with an errno.
pub const MSG_LOGIN_ACK: u32 = 41;

/// Inclusive command range clients are allowed to send.
pub const MSG_CLIENT_START_ID: u32 = 100;
pub const MSG_CLIENT_END_ID: u32 = 65535;

pub const MSG_CLIENT_PING_REQ: u32 = 101;
pub const MSG_CLIENT_PONG_ACK: u32 = 102;

// ============================================================================
// Errno values
// ============================================================================

pub const ERR_BAD_REQUEST: u32 = 101;
pub const ERR_INVALID_ARGUMENT: u32 = 102;
pub const ERR_OPERATION_NOT_SUPPORTED: u32 = 103;
pub const ERR_OPERATION_TOO_OFTEN: u32 = 104;
pub const ERR_REQUEST_TIMEOUT: u32 = 105;
pub const ERR_DATA_CODEC_FAILURE: u32 = 106;
pub const ERR_PROTOCOL_INCOMPATIBLE: u32 = 107;
pub const ERR_RPC_TIMEOUT: u32 = 108;
pub const ERR_DUPLICATE_REGISTRATION: u32 = 201;
pub const ERR_REGISTRATION_DENIED: u32 = 202;
pub const ERR_SERVER_INTERNAL_ERROR: u32 = 203;
pub const ERR_SERVER_MAINTENANCE: u32 = 204;
pub const ERR_SERVICE_NOT_AVAILABLE: u32 = 205;
pub const ERR_SERVICE_BUSY: u32 = 206;
pub const ERR_SESSION_NOT_FOUND: u32 = 208;

// ============================================================================
// Service-type constants
// ============================================================================

pub const SERVICE_GATEWAY: u8 = 0x01;
/// Multicast selector: every service type.
pub const SERVICE_ALL: u8 = 0xFF;
/// Multicast selector: every instance of a service type.
pub const INSTANCE_ALL: u16 = 0xFFFF;

// ============================================================================
// WireMessage
// ============================================================================

/// A typed internal protocol message that knows its own command id and how
/// to put itself on the wire.
pub trait WireMessage: Send + Sync + std::fmt::Debug {
    /// Command id carried by packets holding this message.
    fn command(&self) -> u32;

    /// Binary wire encoding of the message.
    fn encode(&self) -> Result<Vec<u8>>;

    /// JSON rendering, used by the WebSocket text transport.
    fn to_json(&self) -> Result<serde_json::Value>;
}

/// Decode a binary wire encoding produced by [`WireMessage::encode`].
pub fn decode_message<M: serde::de::DeserializeOwned>(data: &[u8]) -> Result<M> {
    let (msg, _) = bincode::serde::decode_from_slice(data, bincode::config::standard())?;
    Ok(msg)
}

macro_rules! wire_message {
    ($ty:ident, $id:expr) => {
        impl WireMessage for $ty {
            fn command(&self) -> u32 {
                $id
            }

            fn encode(&self) -> Result<Vec<u8>> {
                Ok(bincode::serde::encode_to_vec(
                    self,
                    bincode::config::standard(),
                )?)
            }

            fn to_json(&self) -> Result<serde_json::Value> {
                Ok(serde_json::to_value(self)?)
            }
        }
    };
}

pub(crate) use wire_message;
