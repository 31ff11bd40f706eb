// RPC factory
//
// Correlates request and response packets by sequence number. Replies come
// back through the normal inbound path; a filter installed on the dispatch
// context intercepts them before ordinary dispatch, and a 50 ms sweeper
// times out whatever never answers. Handlers always run on the executor,
// never on the dispatcher, and see timeouts exactly like real replies.

use crate::error::{NetError, Result};
use crate::packet::{Body, NodeId, Packet, PACKET_FLAG_RPC};
use crate::protocol::ERR_RPC_TIMEOUT;
use crate::runtime::{Executor, Runner};
use crate::service::ServiceContext;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

/// Deadline sweep period.
const SWEEP_INTERVAL: Duration = Duration::from_millis(50);
/// First sequence number handed out.
const FIRST_SEQ: u32 = 2000;

/// The completed half of an RPC exchange.
#[derive(Debug)]
pub struct RpcReply {
    pub command: u32,
    pub errno: u32,
    pub body: Body,
}

impl RpcReply {
    pub fn succeeded(&self) -> bool {
        self.errno == 0
    }

    pub fn decode_msg<M: serde::de::DeserializeOwned + Default>(&self) -> Result<M> {
        self.body.decode_message()
    }
}

pub type RpcHandler = Arc<dyn Fn(RpcReply) -> Result<()> + Send + Sync>;

struct RpcCall {
    reply: u32,
    deadline_ms: i64,
    handler: Option<RpcHandler>,
    done_tx: Option<oneshot::Sender<RpcReply>>,
}

struct RpcState {
    pending: HashMap<u32, RpcCall>,
    /// Reply commands currently expected.
    registry: HashMap<u32, bool>,
    seq: u32,
}

pub struct RpcFactory {
    me: Weak<RpcFactory>,
    state: Mutex<RpcState>,
    ttl_ms: i64,
    ctx: Arc<ServiceContext>,
    executor: Arc<Executor>,
    done_tx: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Runs one RPC handler exactly once on an executor worker.
struct RpcRunner {
    handler: RpcHandler,
    reply: Mutex<Option<RpcReply>>,
}

impl Runner for RpcRunner {
    fn run(&self) -> Result<()> {
        match self.reply.lock().take() {
            Some(reply) => (self.handler)(reply),
            None => Ok(()),
        }
    }
}

impl RpcFactory {
    pub fn new(ctx: Arc<ServiceContext>, executor: Arc<Executor>) -> Arc<Self> {
        let ttl_ms = (ctx.env().net_rpc_timeout as i64).max(1) * 1000;
        let (done_tx, _) = watch::channel(false);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            state: Mutex::new(RpcState {
                pending: HashMap::new(),
                registry: HashMap::new(),
                seq: FIRST_SEQ,
            }),
            ttl_ms,
            ctx,
            executor,
            done_tx,
            handle: Mutex::new(None),
        })
    }

    /// Install the reply filter and start the deadline sweeper.
    pub fn start(&self) {
        let weak = self.me.clone();
        self.ctx.set_filter(Some(Box::new(move |pkt| {
            match weak.upgrade() {
                Some(rpc) => rpc.filter_packet(pkt),
                None => false,
            }
        })));

        let Some(rpc) = self.me.upgrade() else {
            return;
        };
        let mut done = self.done_tx.subscribe();
        let handle = tokio::spawn(async move {
            tracing::debug!("rpc factory start serving");
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => rpc.sweep_expired(),
                    _ = done.changed() => break,
                }
            }
            tracing::debug!("rpc factory stop serving");
        });
        *self.handle.lock() = Some(handle);
    }

    pub async fn shutdown(&self) {
        tracing::debug!("start shutdown rpc factory");
        let _ = self.done_tx.send(true);
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    /// Fire an asynchronous call; `handler` runs on the executor with the
    /// reply or with `ERR_RPC_TIMEOUT`. Returns the sequence number used.
    ///
    /// A call replying with its own request command would deadlock against
    /// itself, so that is a programming error, not a runtime one.
    pub fn call_async(
        &self,
        node: NodeId,
        request: u32,
        reply: u32,
        body: Body,
        handler: RpcHandler,
    ) -> u32 {
        assert_ne!(request, reply, "rpc request must differ from its reply");
        self.make_call(node, request, reply, body, Some(handler), None)
    }

    /// Synchronous call: wait for the reply or the deadline.
    pub async fn call(&self, node: NodeId, request: u32, reply: u32, body: Body) -> Result<RpcReply> {
        assert_ne!(request, reply, "rpc request must differ from its reply");
        let (tx, rx) = oneshot::channel();
        self.make_call(node, request, reply, body, None, Some(tx));
        rx.await
            .map_err(|_| NetError::InvalidState("rpc factory dropped".to_string()))
    }

    fn make_call(
        &self,
        node: NodeId,
        request: u32,
        reply: u32,
        body: Body,
        handler: Option<RpcHandler>,
        done_tx: Option<oneshot::Sender<RpcReply>>,
    ) -> u32 {
        let seq = {
            let mut state = self.state.lock();
            let seq = state.seq;
            state.seq = state.seq.wrapping_add(1);
            state.registry.insert(reply, true);
            state.pending.insert(
                seq,
                RpcCall {
                    reply,
                    deadline_ms: self.ctx.clock().now_ms() + self.ttl_ms,
                    handler,
                    done_tx,
                },
            );
            seq
        };
        let pkt = Packet::new(node, request, PACKET_FLAG_RPC, seq, body);
        if let Err(err) = self.ctx.send_message(pkt) {
            // Leave the call pending: the sweeper reports it as a timeout
            // through the same path a lost packet would take.
            tracing::warn!("rpc request {request} not sent: {err}");
        }
        seq
    }

    /// Inbound filter: replies to pending calls are consumed here.
    fn filter_packet(&self, pkt: &mut Packet) -> bool {
        let call = {
            let mut state = self.state.lock();
            if !state.registry.get(&pkt.command).copied().unwrap_or(false) {
                return false;
            }
            state.registry.insert(pkt.command, false);
            match state.pending.remove(&pkt.seq) {
                Some(call) => call,
                None => {
                    tracing::error!("unexpected rpc reply: {pkt:?}");
                    return true;
                }
            }
        };
        let reply = RpcReply {
            command: pkt.command,
            errno: pkt.errno(),
            body: std::mem::take(&mut pkt.body),
        };
        self.complete(call, reply);
        true
    }

    fn sweep_expired(&self) {
        let now = self.ctx.clock().now_ms();
        let expired: Vec<RpcCall> = {
            let mut state = self.state.lock();
            let seqs: Vec<u32> = state
                .pending
                .iter()
                .filter(|(_, call)| now > call.deadline_ms)
                .map(|(seq, _)| *seq)
                .collect();
            seqs.into_iter()
                .filter_map(|seq| state.pending.remove(&seq))
                .collect()
        };
        for call in expired {
            let reply = RpcReply {
                command: call.reply,
                errno: ERR_RPC_TIMEOUT,
                body: Body::Empty,
            };
            self.complete(call, reply);
        }
    }

    fn complete(&self, mut call: RpcCall, reply: RpcReply) {
        if let Some(handler) = call.handler.take() {
            self.executor.spawn_execute(Arc::new(RpcRunner {
                handler,
                reply: Mutex::new(Some(reply)),
            }));
            return;
        }
        if let Some(tx) = call.done_tx.take() {
            let _ = tx.send(reply);
        }
    }

}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Environ;
    use crate::runtime::Clock;
    use crate::service::Service;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    struct NullService {
        executor: Arc<Executor>,
    }

    #[async_trait]
    impl Service for NullService {
        fn id(&self) -> u8 {
            9
        }

        fn name(&self) -> &'static str {
            "null"
        }

        fn node(&self) -> NodeId {
            NodeId::backend(9, 1)
        }

        fn set_node(&self, _node: NodeId) {}

        async fn init(self: Arc<Self>, _ctx: Arc<ServiceContext>) -> Result<()> {
            Ok(())
        }

        async fn startup(self: Arc<Self>) -> Result<()> {
            Ok(())
        }

        async fn shutdown(&self) {
            self.executor.shutdown().await;
        }

        async fn execute(&self, runner: Arc<dyn Runner>) -> Result<()> {
            self.executor.execute(runner).await
        }

        fn dispatch(&self, _pkt: Packet) -> Result<()> {
            Ok(())
        }
    }

    async fn rpc_fixture(rpc_timeout_secs: u64) -> (Arc<ServiceContext>, Arc<RpcFactory>) {
        let mut env = Environ::default();
        env.context_inbound_size = 64;
        env.context_outbound_size = 64;
        env.executor_capacity = 64;
        env.net_rpc_timeout = rpc_timeout_secs;
        let env = Arc::new(env);
        let ctx = ServiceContext::new(env, Clock::system());
        let executor = Arc::new(Executor::new(64, 1, Clock::system()));
        executor.start();
        let service = Arc::new(NullService {
            executor: Arc::clone(&executor),
        });
        ctx.start(service as Arc<dyn Service>).await.unwrap();
        let rpc = RpcFactory::new(Arc::clone(&ctx), executor);
        rpc.start();
        (ctx, rpc)
    }

    #[tokio::test]
    async fn timeout_reaches_handler_on_executor() {
        let (ctx, rpc) = rpc_fixture(0).await; // ttl clamps to 1s minimum
        let fired = Arc::new(AtomicU32::new(0));
        let flag = fired.clone();
        let started = Instant::now();
        rpc.call_async(
            NodeId::backend(6, 1), // unreachable
            1001,
            1002,
            Body::Empty,
            Arc::new(move |reply: RpcReply| {
                assert_eq!(reply.errno, ERR_RPC_TIMEOUT);
                assert!(reply.body.is_empty());
                flag.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        while fired.load(Ordering::SeqCst) == 0 {
            assert!(started.elapsed() < Duration::from_secs(3), "handler never ran");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(rpc.pending_count(), 0);
        rpc.shutdown().await;
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn reply_is_filtered_and_completes_sync_call() {
        let (ctx, rpc) = rpc_fixture(60).await;

        let call = {
            let rpc = Arc::clone(&rpc);
            tokio::spawn(async move { rpc.call(NodeId::backend(6, 1), 1001, 1002, Body::Empty).await })
        };

        // Wait for the pending entry, then feed the reply through the filter
        // the way the dispatcher would.
        let rpc2 = Arc::clone(&rpc);
        let mut seq = None;
        for _ in 0..100 {
            {
                let state = rpc2.state.lock();
                if let Some(s) = state.pending.keys().next().copied() {
                    seq = Some(s);
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let seq = seq.expect("no pending call");
        let mut reply_pkt = Packet::new(NodeId::ZERO, 1002, 0, seq, Body::from("pong"));
        assert!(rpc2.filter_packet(&mut reply_pkt));

        let reply = call.await.unwrap().unwrap();
        assert_eq!(reply.command, 1002);
        assert!(reply.succeeded());
        assert_eq!(rpc2.pending_count(), 0);

        // A second packet with the same command passes through untouched.
        let mut other = Packet::new(NodeId::ZERO, 1002, 0, 1, Body::Empty);
        assert!(!rpc2.filter_packet(&mut other));

        rpc.shutdown().await;
        ctx.shutdown().await;
    }

    #[tokio::test]
    #[should_panic(expected = "rpc request must differ from its reply")]
    async fn same_request_and_reply_panics() {
        let (_ctx, rpc) = rpc_fixture(60).await;
        rpc.call_async(NodeId::ZERO, 7, 7, Body::Empty, Arc::new(|_| Ok(())));
    }
}
