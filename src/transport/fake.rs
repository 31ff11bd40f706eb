// In-memory endpoint that records what it is asked to send. Backs unit
// tests of routing and gateway orchestration; never touches a socket.

use super::Endpoint;
use crate::error::{NetError, Result};
use crate::packet::{MessageEndpoint, NodeId, Packet};
use crate::runtime::Stats;
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

pub struct FakeEndpoint {
    node: AtomicU32,
    closing: AtomicBool,
    sent: Mutex<Vec<Packet>>,
    stats: Arc<Stats>,
    user_data: RwLock<Option<Arc<dyn Any + Send + Sync>>>,
}

impl FakeEndpoint {
    pub fn new() -> Arc<Self> {
        Self::with_node(NodeId::ZERO)
    }

    pub fn with_node(node: NodeId) -> Arc<Self> {
        Arc::new(Self {
            node: AtomicU32::new(node.0),
            closing: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
            stats: Arc::new(Stats::new(super::NUM_ENDPOINT_STATS)),
            user_data: RwLock::new(None),
        })
    }

    /// Packets sent so far, draining the record.
    pub fn take_sent(&self) -> Vec<Packet> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

impl MessageEndpoint for FakeEndpoint {
    fn node(&self) -> NodeId {
        NodeId(self.node.load(Ordering::Relaxed))
    }

    fn remote_addr(&self) -> String {
        "fake".to_string()
    }

    fn send_packet(&self, pkt: Packet) -> Result<()> {
        if self.is_closing() {
            return Err(NetError::ConnIsClosing);
        }
        self.sent.lock().push(pkt);
        Ok(())
    }
}

#[async_trait]
impl Endpoint for FakeEndpoint {
    fn set_node(&self, node: NodeId) {
        self.node.store(node.0, Ordering::Relaxed);
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    fn start(&self, _write: bool, _read: bool) {}

    async fn close(&self) {
        self.closing.store(true, Ordering::Release);
    }

    fn force_close(&self, _err: NetError) {
        self.closing.store(true, Ordering::Release);
    }

    fn stats(&self) -> Arc<Stats> {
        Arc::clone(&self.stats)
    }

    fn set_user_data(&self, data: Arc<dyn Any + Send + Sync>) {
        *self.user_data.write() = Some(data);
    }

    fn user_data(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.user_data.read().clone()
    }
}
