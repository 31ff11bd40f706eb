// Discovered peer records, bucketed by service type.

use crate::packet::NodeId;
use crate::protocol::NodeInfo;
use parking_lot::RwLock;

const NUM_SERVICES: usize = 256;

/// 256-slot map from service type to the peers of that type. A node id
/// appears at most once in the whole map.
pub struct NodeInfoMap {
    slots: RwLock<Vec<Vec<NodeInfo>>>,
}

impl Default for NodeInfoMap {
    fn default() -> Self {
        Self {
            slots: RwLock::new(vec![Vec::new(); NUM_SERVICES]),
        }
    }
}

impl NodeInfoMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// All peers of one service type.
    pub fn get_nodes(&self, service: u8) -> Vec<NodeInfo> {
        self.slots.read()[service as usize].clone()
    }

    /// Peers of one service type within a deployment group.
    pub fn get_nodes_in_group(&self, service: u8, group: u8) -> Vec<NodeInfo> {
        self.slots.read()[service as usize]
            .iter()
            .filter(|info| NodeId(info.node).group() == group)
            .cloned()
            .collect()
    }

    /// Insert or refresh one peer record.
    pub fn add_node(&self, info: NodeInfo) {
        let node = NodeId(info.node);
        let mut slots = self.slots.write();
        let slot = &mut slots[node.service() as usize];
        for existing in slot.iter_mut() {
            if existing.node == info.node {
                *existing = info;
                return;
            }
        }
        slot.push(info);
    }

    pub fn delete_node(&self, node: NodeId) {
        let mut slots = self.slots.write();
        slots[node.service() as usize].retain(|info| info.node != node.0);
    }

    pub fn delete_service(&self, service: u8) {
        self.slots.write()[service as usize].clear();
    }

    pub fn clear(&self) {
        for slot in self.slots.write().iter_mut() {
            slot.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.slots.read().iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
