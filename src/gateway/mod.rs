// Gateway: terminates client TCP and WebSocket connections, forwards the
// login handoff to a subscribed backend, and relays state changes between
// backends. Built on the same node core as a plain cluster backend.

mod backend;
mod client;
mod handler;
mod router;
mod service;
mod session;
mod ws;

pub use router::GatewayRoutePolicy;
pub use service::Gateway;
pub use session::{node_to_session, session_to_node, SessionUserData};
