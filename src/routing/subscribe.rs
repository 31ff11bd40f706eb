// Message-range subscriptions
//
// A backend declares an inclusive command range it wants delivered across
// service boundaries; the gateway forwards a client command only when some
// backend subscribed a range containing it. Ranges may overlap and a node
// never appears twice within a matching range.

use crate::packet::{NodeId, NodeIdSet};
use parking_lot::RwLock;

#[derive(Debug, Clone)]
struct MessageSubscription {
    start: i32,
    end: i32,
    nodes: NodeIdSet,
}

impl MessageSubscription {
    fn matches(&self, id: i32) -> bool {
        self.start <= id && id <= self.end
    }

    /// True when this subscription lies within the queried range.
    fn within(&self, start: i32, end: i32) -> bool {
        start <= self.start && self.end <= end
    }
}

#[derive(Default)]
pub struct MessageSubscriber {
    subs: RwLock<Vec<MessageSubscription>>,
}

impl MessageSubscriber {
    pub fn new() -> Self {
        Self::default()
    }

    /// Nodes subscribed to a single message id.
    pub fn nodes_of(&self, msg_id: i32) -> NodeIdSet {
        let subs = self.subs.read();
        let mut nodes = NodeIdSet::new();
        for sub in subs.iter() {
            if sub.matches(msg_id) {
                nodes.extend_from(&sub.nodes);
            }
        }
        nodes
    }

    /// Nodes whose subscribed range lies within `[start, end]`.
    pub fn nodes_in_range(&self, start: i32, end: i32) -> NodeIdSet {
        let subs = self.subs.read();
        let mut nodes = NodeIdSet::new();
        for sub in subs.iter() {
            if sub.within(start, end) {
                nodes.extend_from(&sub.nodes);
            }
        }
        nodes
    }

    pub fn has_range(&self, start: i32, end: i32) -> bool {
        !self.nodes_in_range(start, end).is_empty()
    }

    /// Subscribe `node` to `[start, end]`. A node already present in a
    /// subscription within that range is not duplicated.
    pub fn add_range(&self, start: i32, end: i32, node: NodeId) {
        let mut subs = self.subs.write();
        for sub in subs.iter() {
            if sub.within(start, end) && sub.nodes.contains(node) {
                return;
            }
        }
        let mut nodes = NodeIdSet::new();
        nodes.insert(node);
        subs.push(MessageSubscription { start, end, nodes });
    }

    pub fn add_single(&self, msg_id: i32, node: NodeId) {
        self.add_range(msg_id, msg_id, node);
    }

    /// Drop every subscription `node` holds; empty ranges disappear.
    pub fn remove_node(&self, node: NodeId) {
        let mut subs = self.subs.write();
        for sub in subs.iter_mut() {
            sub.nodes.remove(node);
        }
        subs.retain(|sub| !sub.nodes.is_empty());
    }

    pub fn len(&self) -> usize {
        self.subs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.subs.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscribe_then_query_returns_node_once() {
        let subs = MessageSubscriber::new();
        let node = NodeId::backend(5, 1);
        subs.add_range(101, 199, node);
        subs.add_range(101, 199, node); // duplicate insert is a no-op

        let nodes = subs.nodes_in_range(101, 199);
        assert_eq!(nodes.len(), 1);
        assert!(nodes.contains(node));
    }

    #[test]
    fn containment_matching() {
        let subs = MessageSubscriber::new();
        let node = NodeId::backend(5, 1);
        subs.add_range(101, 199, node);

        // Query range containing the subscription matches.
        assert!(subs.has_range(100, 65535));
        // Narrower query range does not.
        assert!(!subs.has_range(120, 130));
        // Single-id match falls inside the subscribed range.
        assert!(subs.nodes_of(150).contains(node));
        assert!(subs.nodes_of(200).is_empty());
    }

    #[test]
    fn overlapping_ranges_accumulate() {
        let subs = MessageSubscriber::new();
        let a = NodeId::backend(5, 1);
        let b = NodeId::backend(5, 2);
        subs.add_range(100, 200, a);
        subs.add_range(150, 180, b);

        let nodes = subs.nodes_of(160);
        assert_eq!(nodes.len(), 2);
        assert!(nodes.contains(a));
        assert!(nodes.contains(b));
    }

    #[test]
    fn remove_node_clears_empty_ranges() {
        let subs = MessageSubscriber::new();
        let a = NodeId::backend(5, 1);
        let b = NodeId::backend(5, 2);
        subs.add_range(1, 10, a);
        subs.add_range(1, 10, b);
        subs.add_single(35, a);
        assert_eq!(subs.len(), 3);

        subs.remove_node(a);
        assert_eq!(subs.len(), 2);
        assert!(subs.nodes_of(35).is_empty());
        assert!(subs.nodes_of(5).contains(b));
    }
}
