// Service dispatch context
//
// Owns the inbound and outbound packet queues and the router that decides
// loopback against forward. Endpoint readers feed the inbound queue from
// many tasks; one dispatcher drains it. The outbound queue carries locally
// produced packets toward remote nodes.
//
// Shutdown order: finalizers, then Service::shutdown, then the done signal,
// then join the dispatchers, then the queues are dropped.

use super::{packet_runner, Service};
use crate::config::Environ;
use crate::error::{NetError, Result};
use crate::packet::{NodeId, Packet};
use crate::routing::Router;
use crate::runtime::Clock;
use parking_lot::{Mutex, RwLock};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Inbound packet filter; returning true consumes the packet before normal
/// dispatch. The RPC factory installs one to intercept replies.
pub type PacketFilter = Box<dyn Fn(&mut Packet) -> bool + Send + Sync>;

pub struct ServiceContext {
    me: Weak<ServiceContext>,
    env: Arc<Environ>,
    clock: Clock,
    inbound_tx: mpsc::Sender<Packet>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Packet>>>,
    outbound_tx: mpsc::Sender<Packet>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Packet>>>,
    router: OnceLock<Arc<Router>>,
    service: OnceLock<Arc<dyn Service>>,
    filter: RwLock<Option<PacketFilter>>,
    finalizers: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
    closing: AtomicBool,
    done_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ServiceContext {
    pub fn new(env: Arc<Environ>, clock: Clock) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = mpsc::channel(env.context_inbound_size.max(1));
        let (outbound_tx, outbound_rx) = mpsc::channel(env.context_outbound_size.max(1));
        let (done_tx, _) = watch::channel(false);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            env,
            clock,
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            router: OnceLock::new(),
            service: OnceLock::new(),
            filter: RwLock::new(None),
            finalizers: Mutex::new(Vec::new()),
            closing: AtomicBool::new(false),
            done_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Install the service, start the dispatchers and run the service's
    /// init and startup phases.
    pub async fn start(&self, service: Arc<dyn Service>) -> Result<()> {
        let me = self
            .me
            .upgrade()
            .ok_or_else(|| NetError::InvalidState("context dropped".to_string()))?;
        let router = Arc::new(Router::new(service.node()));
        self.router
            .set(router)
            .map_err(|_| NetError::InvalidState("context started twice".to_string()))?;
        self.service
            .set(Arc::clone(&service))
            .map_err(|_| NetError::InvalidState("context started twice".to_string()))?;

        self.spawn_dispatchers();

        tracing::info!("start initialize {} service", service.name());
        Arc::clone(&service).init(me).await?;
        tracing::info!("start run {} service {}", service.name(), service.node());
        Arc::clone(&service).startup().await?;
        Ok(())
    }

    pub fn env(&self) -> &Arc<Environ> {
        &self.env
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    pub fn router(&self) -> &Arc<Router> {
        self.router.get().expect("context not started")
    }

    pub fn service(&self) -> Arc<dyn Service> {
        Arc::clone(self.service.get().expect("context not started"))
    }

    /// Sender endpoint readers push decoded packets into.
    pub fn inbound_sender(&self) -> mpsc::Sender<Packet> {
        self.inbound_tx.clone()
    }

    /// Queue a locally produced packet for routing. Non-blocking; a full
    /// queue is an overflow error.
    pub fn send_message(&self, pkt: Packet) -> Result<()> {
        match self.outbound_tx.try_send(pkt) {
            Ok(()) => {
                let capacity = self.outbound_tx.max_capacity();
                let pending = capacity - self.outbound_tx.capacity();
                if pending * 3 >= capacity * 2 {
                    tracing::warn!("outbound message queue is 2/3 full ({pending}/{capacity})");
                }
                Ok(())
            }
            Err(_) => Err(NetError::OutboundQueueOverflow),
        }
    }

    /// Install an inbound packet filter, returning the previous one.
    pub fn set_filter(&self, filter: Option<PacketFilter>) -> Option<PacketFilter> {
        std::mem::replace(&mut *self.filter.write(), filter)
    }

    pub fn add_finalizer(&self, f: Box<dyn FnOnce() + Send>) {
        self.finalizers.lock().push(f);
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    fn spawn_dispatchers(&self) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let inbound = self.inbound_rx.lock().take().expect("inbound queue taken");
        let outbound = self.outbound_rx.lock().take().expect("outbound queue taken");
        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(Arc::clone(&me).serve(0, inbound, false)));
        tasks.push(tokio::spawn(me.serve(1, outbound, true)));
    }

    async fn serve(self: Arc<Self>, idx: usize, mut queue: mpsc::Receiver<Packet>, outgoing: bool) {
        tracing::debug!("message dispatcher #{idx} start serving");
        let mut done = self.done_tx.subscribe();
        loop {
            tokio::select! {
                pkt = queue.recv() => match pkt {
                    Some(pkt) => self.dispatch_one(pkt, outgoing).await,
                    None => break,
                },
                _ = done.changed() => break,
            }
        }
        tracing::debug!("message dispatcher #{idx} stopped");
    }

    async fn dispatch_one(&self, mut pkt: Packet, outgoing: bool) {
        let router = self.router();
        // Locally produced packets carry no endpoint, which the loopback
        // test reads as "local". For the outbound queue the destination
        // node decides instead, otherwise nothing could ever leave.
        let local = if outgoing {
            pkt.node == NodeId::ZERO || pkt.node == router.node()
        } else {
            router.is_loopback(&pkt)
        };
        if local {
            if self.filter_packet(&mut pkt) {
                return;
            }
            let service = self.service();
            let runner = packet_runner(Arc::clone(&service), pkt);
            if let Err(err) = service.execute(runner).await {
                tracing::error!("dispatch packet: {err}");
            }
        } else if let Err(err) = router.route(pkt) {
            tracing::error!("route packet: {err}");
        }
    }

    /// Filter and dispatch run on different tasks; a panicking filter must
    /// not take the dispatcher down.
    fn filter_packet(&self, pkt: &mut Packet) -> bool {
        let guard = self.filter.read();
        let Some(filter) = guard.as_ref() else {
            return false;
        };
        match catch_unwind(AssertUnwindSafe(|| filter(pkt))) {
            Ok(consumed) => consumed,
            Err(_) => {
                tracing::error!("packet filter panicked on message {}", pkt.command);
                false
            }
        }
    }

    pub async fn shutdown(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        let finalizers: Vec<_> = self.finalizers.lock().drain(..).collect();
        let count = finalizers.len();
        for f in finalizers {
            if catch_unwind(AssertUnwindSafe(f)).is_err() {
                tracing::error!("finalizer panicked");
            }
        }
        if count > 0 {
            tracing::info!("{count} finalizers executed");
        }

        if let Some(service) = self.service.get() {
            tracing::info!("start shutdown {} service", service.name());
            service.shutdown().await;
            tracing::info!("{} service shutdown succeed", service.name());
        }

        let _ = self.done_tx.send(true);
        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!("service context shutdown succeed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Body;
    use crate::runtime::{Executor, Runner};
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct EchoService {
        node: NodeId,
        executor: Arc<Executor>,
        dispatched: Arc<AtomicUsize>,
    }

    impl EchoService {
        fn new(env: &Arc<Environ>) -> Arc<Self> {
            let executor = Arc::new(Executor::new(
                env.executor_capacity,
                env.executor_concurrency,
                Clock::system(),
            ));
            executor.start();
            Arc::new(Self {
                node: NodeId::backend(7, 1),
                executor,
                dispatched: Arc::new(AtomicUsize::new(0)),
            })
        }
    }

    #[async_trait]
    impl Service for EchoService {
        fn id(&self) -> u8 {
            7
        }

        fn name(&self) -> &'static str {
            "echo"
        }

        fn node(&self) -> NodeId {
            self.node
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
            self.dispatched.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn small_env() -> Arc<Environ> {
        let mut env = Environ::default();
        env.context_inbound_size = 64;
        env.context_outbound_size = 64;
        env.executor_capacity = 64;
        env.executor_concurrency = 1;
        Arc::new(env)
    }

    #[tokio::test]
    async fn inbound_packets_reach_dispatch() {
        let env = small_env();
        let ctx = ServiceContext::new(env.clone(), Clock::system());
        let service = EchoService::new(&env);
        ctx.start(service.clone() as Arc<dyn Service>).await.unwrap();

        let inbound = ctx.inbound_sender();
        inbound
            .send(Packet::new(NodeId::ZERO, 150, 0, 1, Body::from("x")))
            .await
            .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(service.dispatched.load(Ordering::SeqCst), 1);
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn filter_consumes_packets() {
        let env = small_env();
        let ctx = ServiceContext::new(env.clone(), Clock::system());
        let service = EchoService::new(&env);
        ctx.start(service.clone() as Arc<dyn Service>).await.unwrap();

        let seen = Arc::new(AtomicUsize::new(0));
        let counter = seen.clone();
        ctx.set_filter(Some(Box::new(move |pkt| {
            counter.fetch_add(1, Ordering::SeqCst);
            pkt.command == 99 // consume this command
        })));

        let inbound = ctx.inbound_sender();
        inbound.send(Packet::with_command(99)).await.unwrap();
        inbound.send(Packet::with_command(150)).await.unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(service.dispatched.load(Ordering::SeqCst), 1);
        ctx.shutdown().await;
    }

    #[tokio::test]
    async fn send_message_overflows_rather_than_blocking() {
        let mut env = Environ::default();
        env.context_outbound_size = 2;
        env.context_inbound_size = 2;
        let ctx = ServiceContext::new(Arc::new(env), Clock::system());
        // Not started: nothing drains the outbound queue.
        assert!(ctx.send_message(Packet::with_command(1)).is_ok());
        assert!(ctx.send_message(Packet::with_command(2)).is_ok());
        let err = ctx.send_message(Packet::with_command(3)).unwrap_err();
        assert!(matches!(err, NetError::OutboundQueueOverflow));
    }
}
