// Packet routing: the policy-chain router, the next-hop table and the
// cross-service message subscriptions.

pub mod router;
pub mod subscribe;
pub mod table;

pub use router::{BasicRoutePolicy, RoutePolicy, Router};
pub use subscribe::MessageSubscriber;
pub use table::{RoutingTable, RoutingTableEntry};
