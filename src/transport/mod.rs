// Connection endpoints
//
// An endpoint owns at most one reader task and one writer task. The reader
// decodes frames and pushes them onto the service inbound queue, blocking
// when the dispatcher falls behind. The writer drains a bounded outbound
// queue; senders never block, they get an overflow error instead. Close is
// a compare-and-set: exactly one caller wins and runs the finalizer.

pub mod fake;
pub mod listener;
pub mod rpc;
pub mod tcp;
pub mod ws;

use crate::error::NetError;
use crate::packet::{MessageEndpoint, NodeId};
use crate::runtime::Stats;
use async_trait::async_trait;
use parking_lot::RwLock;
use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;

pub use fake::FakeEndpoint;
pub use rpc::{RpcFactory, RpcReply};
pub use tcp::TcpEndpoint;
pub use ws::{WsEndpoint, WsReader};

// Per-endpoint stat slots.
pub const STAT_PACKETS_RECV: usize = 0;
pub const STAT_BYTES_RECV: usize = 1;
pub const STAT_PACKETS_SENT: usize = 2;
pub const STAT_BYTES_SENT: usize = 3;
pub const NUM_ENDPOINT_STATS: usize = 4;

/// One record on the shared transport error channel. Records are published
/// with a non-blocking send and dropped when the channel is full; the
/// endpoint's closed state is the authoritative signal.
pub struct TransportEvent {
    pub error: NetError,
    pub endpoint: Arc<dyn Endpoint>,
}

pub type EventSender = mpsc::Sender<TransportEvent>;
pub type EventReceiver = mpsc::Receiver<TransportEvent>;

/// Full endpoint surface; `MessageEndpoint` is the slice packets keep.
#[async_trait]
pub trait Endpoint: MessageEndpoint {
    fn set_node(&self, node: NodeId);

    fn is_closing(&self) -> bool;

    /// Start the selected pump tasks.
    fn start(&self, write: bool, read: bool);

    /// Graceful close: stop both pumps, flush what is queued, publish one
    /// error record. Idempotent.
    async fn close(&self);

    /// Same effect as `close`, but the finalizer runs detached so the
    /// caller is never blocked.
    fn force_close(&self, err: NetError);

    fn stats(&self) -> Arc<Stats>;

    fn set_user_data(&self, data: Arc<dyn Any + Send + Sync>);

    fn user_data(&self) -> Option<Arc<dyn Any + Send + Sync>>;
}

/// Concurrency-safe map from node id to endpoint.
#[derive(Default)]
pub struct EndpointMap {
    inner: RwLock<HashMap<NodeId, Arc<dyn Endpoint>>>,
}

impl EndpointMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, node: NodeId) -> Option<Arc<dyn Endpoint>> {
        self.inner.read().get(&node).cloned()
    }

    pub fn add(&self, node: NodeId, endpoint: Arc<dyn Endpoint>) {
        self.inner.write().insert(node, endpoint);
    }

    pub fn delete(&self, node: NodeId) -> bool {
        self.inner.write().remove(&node).is_some()
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.inner.read().contains_key(&node)
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().is_empty()
    }

    pub fn reset(&self) {
        self.inner.write().clear();
    }

    pub fn list(&self) -> Vec<Arc<dyn Endpoint>> {
        self.inner.read().values().cloned().collect()
    }
}

/// Publish a transport error without blocking; drop it when nobody listens
/// fast enough.
pub(crate) fn publish_event(events: &Option<EventSender>, error: NetError, endpoint: Arc<dyn Endpoint>) {
    if let Some(tx) = events {
        let _ = tx.try_send(TransportEvent { error, endpoint });
    }
}
