// Policy-chain router
//
// The router answers two questions: is this packet for the local service
// (loopback), and if not, which endpoint carries it toward its destination.
// Policies are consulted in registration order; the first to claim a packet
// wins. Multicast policies clone the packet per target themselves.

use super::subscribe::MessageSubscriber;
use super::table::RoutingTable;
use crate::error::{NetError, Result};
use crate::packet::{MessageEndpoint, NodeId, Packet};
use crate::protocol::{INSTANCE_ALL, SERVICE_ALL};
use crate::transport::{Endpoint, EndpointMap};
use parking_lot::RwLock;
use std::sync::Arc;

pub trait RoutePolicy: Send + Sync {
    /// Does this policy claim the packet for local dispatch?
    fn is_loopback(&self, router: &Router, pkt: &Packet) -> bool;

    /// Fan the packet out to multiple endpoints; true claims the packet
    /// and terminates the chain.
    fn multicast(&self, router: &Router, pkt: &Packet) -> bool;

    /// Resolve a single forwarding target. On success the packet's node is
    /// rewritten to the origin so the recipient knows who to answer.
    fn lookup(&self, router: &Router, pkt: &mut Packet) -> Option<Arc<dyn Endpoint>>;
}

pub struct Router {
    node: NodeId,
    policies: RwLock<Vec<Arc<dyn RoutePolicy>>>,
    table: RoutingTable,
    subscriber: MessageSubscriber,
}

impl Router {
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            policies: RwLock::new(Vec::new()),
            table: RoutingTable::new(),
            subscriber: MessageSubscriber::new(),
        }
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn table(&self) -> &RoutingTable {
        &self.table
    }

    pub fn subscriber(&self) -> &MessageSubscriber {
        &self.subscriber
    }

    pub fn add_policy(&self, policy: Arc<dyn RoutePolicy>) {
        self.policies.write().push(policy);
    }

    /// A packet without an endpoint is an internal enqueue and always local.
    /// A packet addressed to this node is local. Otherwise the policies
    /// decide; none claiming it means forward.
    pub fn is_loopback(&self, pkt: &Packet) -> bool {
        if pkt.endpoint.is_none() {
            return true;
        }
        if pkt.node == self.node {
            return true;
        }
        let policies = self.policies.read();
        policies.iter().any(|p| p.is_loopback(self, pkt))
    }

    /// Forward the packet along the policy chain.
    pub fn route(&self, mut pkt: Packet) -> Result<()> {
        let policies: Vec<_> = self.policies.read().clone();
        for policy in policies {
            if policy.multicast(self, &pkt) {
                return Ok(());
            }
            if let Some(endpoint) = policy.lookup(self, &mut pkt) {
                return endpoint.send_packet(pkt);
            }
        }
        Err(NetError::DestinationNotReachable)
    }
}

/// Default backend policy: anything addressed to node zero is local; known
/// peers are found through the routing table, with two multicast selectors
/// scoped by deployment group.
pub struct BasicRoutePolicy {
    endpoints: Arc<EndpointMap>,
}

impl BasicRoutePolicy {
    pub fn new(endpoints: Arc<EndpointMap>) -> Arc<Self> {
        Arc::new(Self { endpoints })
    }

    fn origin(router: &Router, pkt: &Packet) -> NodeId {
        pkt.endpoint
            .as_ref()
            .map(|e| e.node())
            .unwrap_or_else(|| router.node())
    }

    fn clone_to(&self, pkt: &Packet, from: NodeId, dest: NodeId) {
        if let Some(endpoint) = self.endpoints.get(dest) {
            let mut copy = pkt.clone();
            copy.node = from;
            copy.endpoint = Some(Arc::clone(&endpoint) as Arc<dyn MessageEndpoint>);
            if let Err(err) = endpoint.send_packet(copy) {
                tracing::error!("multicast {} to {}: {}", pkt.command, dest, err);
            }
        }
    }
}

impl RoutePolicy for BasicRoutePolicy {
    fn is_loopback(&self, _router: &Router, pkt: &Packet) -> bool {
        pkt.node == NodeId::ZERO
    }

    fn multicast(&self, router: &Router, pkt: &Packet) -> bool {
        let dest = pkt.node;
        if !dest.is_backend() {
            return false;
        }
        if dest.service() == SERVICE_ALL {
            // Every registered peer in the destination group.
            let from = Self::origin(router, pkt);
            for entry in router.table().entries() {
                if entry.src.group() == dest.group() {
                    self.clone_to(pkt, from, entry.dest);
                }
            }
            return true;
        }
        if dest.instance() == INSTANCE_ALL {
            // Every instance of one service in the destination group.
            let from = Self::origin(router, pkt);
            for entry in router.table().entries() {
                if entry.src.service() == dest.service() && entry.src.group() == dest.group() {
                    self.clone_to(pkt, from, entry.dest);
                }
            }
            return true;
        }
        false
    }

    fn lookup(&self, router: &Router, pkt: &mut Packet) -> Option<Arc<dyn Endpoint>> {
        let dest = router.table().get_entry(pkt.node);
        let endpoint = self.endpoints.get(dest)?;
        pkt.node = Self::origin(router, pkt);
        pkt.endpoint = Some(Arc::clone(&endpoint) as Arc<dyn MessageEndpoint>);
        Some(endpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::FakeEndpoint;

    fn router_with_basic(endpoints: &Arc<EndpointMap>) -> Router {
        let router = Router::new(NodeId::backend(9, 1));
        router.add_policy(BasicRoutePolicy::new(Arc::clone(endpoints)));
        router
    }

    #[test]
    fn internal_packets_are_loopback() {
        let endpoints = Arc::new(EndpointMap::new());
        let router = router_with_basic(&endpoints);
        let pkt = Packet::with_command(1);
        assert!(router.is_loopback(&pkt));
    }

    #[test]
    fn packets_for_own_node_are_loopback() {
        let endpoints = Arc::new(EndpointMap::new());
        let router = router_with_basic(&endpoints);
        let origin = FakeEndpoint::with_node(NodeId::backend(5, 1));
        let mut pkt = Packet::with_command(1);
        pkt.node = router.node();
        pkt.endpoint = Some(origin);
        assert!(router.is_loopback(&pkt));
    }

    #[test]
    fn addressed_packets_are_forwarded() {
        let endpoints = Arc::new(EndpointMap::new());
        let router = router_with_basic(&endpoints);
        let origin = FakeEndpoint::with_node(NodeId::backend(5, 1));
        let mut pkt = Packet::with_command(1);
        pkt.node = NodeId::backend(6, 1);
        pkt.endpoint = Some(origin);
        assert!(!router.is_loopback(&pkt));
    }

    #[test]
    fn route_through_table() {
        let endpoints = Arc::new(EndpointMap::new());
        let router = router_with_basic(&endpoints);
        let target_node = NodeId::backend(6, 1);
        let target = FakeEndpoint::with_node(target_node);
        endpoints.add(target_node, target.clone());
        router.table().add_entry(target_node, target_node);

        let origin_node = NodeId::backend(5, 1);
        let mut pkt = Packet::with_command(42);
        pkt.node = target_node;
        pkt.endpoint = Some(FakeEndpoint::with_node(origin_node));

        router.route(pkt).unwrap();
        let sent = target.take_sent();
        assert_eq!(sent.len(), 1);
        // Node rewritten to the origin so the target knows who to answer.
        assert_eq!(sent[0].node, origin_node);
    }

    #[test]
    fn unroutable_packet_is_an_error() {
        let endpoints = Arc::new(EndpointMap::new());
        let router = router_with_basic(&endpoints);
        let mut pkt = Packet::with_command(42);
        pkt.node = NodeId::backend(6, 1);
        pkt.endpoint = Some(FakeEndpoint::with_node(NodeId::backend(5, 1)));
        let err = router.route(pkt).unwrap_err();
        assert!(matches!(err, NetError::DestinationNotReachable));
    }

    #[test]
    fn service_all_multicast_scopes_by_group() {
        let endpoints = Arc::new(EndpointMap::new());
        let router = router_with_basic(&endpoints);
        let a = NodeId::backend(5, 1);
        let b = NodeId::backend(6, 1);
        let ea = FakeEndpoint::with_node(a);
        let eb = FakeEndpoint::with_node(b);
        endpoints.add(a, ea.clone());
        endpoints.add(b, eb.clone());
        router.table().add_entry(a, a);
        router.table().add_entry(b, b);

        let mut pkt = Packet::with_command(13);
        pkt.node = NodeId((u32::from(SERVICE_ALL)) << 16);
        pkt.endpoint = Some(FakeEndpoint::with_node(NodeId::backend(9, 9)));
        router.route(pkt).unwrap();

        assert_eq!(ea.sent_count(), 1);
        assert_eq!(eb.sent_count(), 1);
    }

    #[test]
    fn instance_all_multicast_scopes_by_service() {
        let endpoints = Arc::new(EndpointMap::new());
        let router = router_with_basic(&endpoints);
        let a = NodeId::backend(5, 1);
        let b = NodeId::backend(5, 2);
        let c = NodeId::backend(6, 1);
        let mut fakes = std::collections::HashMap::new();
        for node in [a, b, c] {
            let fake = FakeEndpoint::with_node(node);
            fakes.insert(node, fake.clone());
            endpoints.add(node, fake);
            router.table().add_entry(node, node);
        }

        let mut dest = NodeId::backend(5, 0);
        dest.set_instance(INSTANCE_ALL);
        let mut pkt = Packet::with_command(13);
        pkt.node = dest;
        pkt.endpoint = Some(FakeEndpoint::with_node(NodeId::backend(9, 9)));
        router.route(pkt).unwrap();

        assert_eq!(fakes[&a].sent_count(), 1);
        assert_eq!(fakes[&b].sent_count(), 1);
        assert_eq!(fakes[&c].sent_count(), 0);
    }
}
