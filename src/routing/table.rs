// Routing table: source node to next-hop node. An entry says "packets for
// `src` are delivered by sending them to `dest`".

use crate::packet::NodeId;
use parking_lot::RwLock;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoutingTableEntry {
    pub src: NodeId,
    pub dest: NodeId,
}

#[derive(Default)]
pub struct RoutingTable {
    entries: RwLock<HashMap<NodeId, NodeId>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next hop for `key`, or the zero node when unknown.
    pub fn get_entry(&self, key: NodeId) -> NodeId {
        self.entries.read().get(&key).copied().unwrap_or(NodeId::ZERO)
    }

    pub fn add_entry(&self, src: NodeId, dest: NodeId) {
        self.entries.write().insert(src, dest);
    }

    pub fn delete_entry(&self, src: NodeId) {
        self.entries.write().remove(&src);
    }

    /// Remove every entry whose next hop is `dest`.
    pub fn delete_dest_entry(&self, dest: NodeId) {
        self.entries.write().retain(|_, d| *d != dest);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    pub fn entries(&self) -> Vec<RoutingTableEntry> {
        self.entries
            .read()
            .iter()
            .map(|(src, dest)| RoutingTableEntry {
                src: *src,
                dest: *dest,
            })
            .collect()
    }
}
