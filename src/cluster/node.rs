// Shared node plumbing: the executor, the handler chain and the service
// context hookup. Backend and gateway both build on this.

use crate::codec::FrameCodec;
use crate::config::Environ;
use crate::error::Result;
use crate::packet::{NodeId, Packet};
use crate::runtime::{Clock, Executor};
use crate::service::ServiceContext;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, OnceLock};

pub type PacketHandler = Arc<dyn Fn(&mut Packet) -> Result<()> + Send + Sync>;

pub struct NodeCore {
    node: AtomicU32,
    codec: FrameCodec,
    executor: Arc<Executor>,
    handlers: RwLock<Vec<PacketHandler>>,
    ctx: OnceLock<Arc<ServiceContext>>,
}

impl NodeCore {
    pub fn new(env: &Environ, clock: Clock) -> Self {
        Self {
            node: AtomicU32::new(0),
            codec: FrameCodec::Server,
            executor: Arc::new(Executor::new(
                env.executor_capacity,
                env.executor_concurrency,
                clock,
            )),
            handlers: RwLock::new(Vec::new()),
            ctx: OnceLock::new(),
        }
    }

    pub fn node(&self) -> NodeId {
        NodeId(self.node.load(Ordering::Relaxed))
    }

    pub fn set_node(&self, node: NodeId) {
        self.node.store(node.0, Ordering::Relaxed);
    }

    pub fn codec(&self) -> FrameCodec {
        self.codec
    }

    pub fn executor(&self) -> &Arc<Executor> {
        &self.executor
    }

    pub fn attach(&self, ctx: Arc<ServiceContext>) -> Result<()> {
        self.ctx.set(ctx).map_err(|_| {
            crate::error::NetError::InvalidState("node already attached to a context".to_string())
        })
    }

    pub fn context(&self) -> &Arc<ServiceContext> {
        self.ctx.get().expect("node not attached to a context")
    }

    pub fn env(&self) -> Arc<Environ> {
        Arc::clone(self.context().env())
    }

    /// Register a packet handler, optionally ahead of the existing chain.
    pub fn add_handler(&self, prepend: bool, handler: PacketHandler) {
        let mut handlers = self.handlers.write();
        if prepend {
            handlers.insert(0, handler);
        } else {
            handlers.push(handler);
        }
    }

    /// Run the handler chain; every handler sees the packet, the last
    /// error wins.
    pub fn dispatch(&self, pkt: &mut Packet) -> Result<()> {
        let handlers: Vec<_> = self.handlers.read().clone();
        let mut result = Ok(());
        for handler in handlers {
            if let Err(err) = handler(pkt) {
                tracing::error!("dispatch message {}: {}", pkt.command, err);
                result = Err(err);
            }
        }
        result
    }

    pub fn send_packet(&self, pkt: Packet) -> Result<()> {
        self.context().send_message(pkt)
    }

    pub fn startup(&self) {
        self.executor.start();
    }

    pub async fn shutdown(&self) {
        self.executor.shutdown().await;
        tracing::info!("executor shutdown succeed");
    }
}
