// The typed message value and node addressing.

pub mod body;
pub mod node;
#[allow(clippy::module_inception)]
pub mod packet;

pub use body::Body;
pub use node::{NodeId, NodeIdSet, MAX_SESSION_ID};
pub use packet::{
    MessageEndpoint, Packet, PACKET_FLAG_BITS_MASK, PACKET_FLAG_COMPRESSED, PACKET_FLAG_ENCRYPTED,
    PACKET_FLAG_ERROR, PACKET_FLAG_JSON_TEXT, PACKET_FLAG_RPC,
};
