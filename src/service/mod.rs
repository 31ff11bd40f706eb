// Service abstraction
//
// A service is the application-visible unit hosted by a node process. The
// dispatch context owns its queues and router; the service supplies the
// executor and the packet handlers.

pub mod context;

pub use context::{PacketFilter, ServiceContext};

use crate::error::Result;
use crate::packet::{NodeId, Packet};
use crate::runtime::Runner;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

#[async_trait]
pub trait Service: Send + Sync {
    /// Service-type id, the high byte of backend node ids.
    fn id(&self) -> u8;

    fn name(&self) -> &'static str;

    fn node(&self) -> NodeId;

    fn set_node(&self, node: NodeId);

    /// Wire the service into its context. Called once before startup.
    async fn init(self: Arc<Self>, ctx: Arc<ServiceContext>) -> Result<()>;

    /// Bring up listeners, workers and discovery.
    async fn startup(self: Arc<Self>) -> Result<()>;

    async fn shutdown(&self);

    /// Hand a unit of work to the service executor. Blocks when the
    /// executor queue is full.
    async fn execute(&self, runner: Arc<dyn Runner>) -> Result<()>;

    /// Run the handler chain for one packet on an executor worker.
    fn dispatch(&self, pkt: Packet) -> Result<()>;
}

struct PacketRunner {
    service: Arc<dyn Service>,
    pkt: Mutex<Option<Packet>>,
}

impl Runner for PacketRunner {
    fn run(&self) -> Result<()> {
        match self.pkt.lock().take() {
            Some(pkt) => self.service.dispatch(pkt),
            None => Ok(()),
        }
    }
}

/// Wrap a packet for execution on the service executor; the service's
/// dispatch runs exactly once.
pub fn packet_runner(service: Arc<dyn Service>, pkt: Packet) -> Arc<dyn Runner> {
    Arc::new(PacketRunner {
        service,
        pkt: Mutex::new(Some(pkt)),
    })
}
