// Cluster backend node
//
// Listens for peer registrations, auto-dials declared dependencies as
// discovery announces them, heartbeats every established peer link, and
// drops endpoints that surface transport errors. Registration is
// authenticated with the signed access token; a mismatch or a duplicate
// node id is refused with an errno and never touches the endpoint map.

use super::discovery::{EtcdDiscovery, ServiceSink};
use super::info::NodeInfoMap;
use super::node::NodeCore;
use super::token::sign_access_token;
use crate::config::Environ;
use crate::error::{NetError, Result};
use crate::packet::{Body, MessageEndpoint, NodeId, Packet};
use crate::protocol::{
    InstanceStateNtf, KeepAliveAck, KeepAliveReq, RegisterAck, RegisterReq,
    ERR_DUPLICATE_REGISTRATION, ERR_REGISTRATION_DENIED, MSG_INSTANCE_STATE_NTF,
    MSG_KEEP_ALIVE_ACK, MSG_KEEP_ALIVE_REQ, MSG_REGISTER_ACK,
};
use crate::routing::BasicRoutePolicy;
use crate::runtime::{Clock, Runner, Stats};
use crate::service::{Service, ServiceContext};
use crate::transport::listener::{
    configure_socket, dial_tcp, listen_tcp, proto_packet, read_proto_message, request_message,
    send_packet_to, DIAL_TIMEOUT, HANDSHAKE_READ_TIMEOUT,
};
use crate::transport::tcp::EndpointOptions;
use crate::transport::{
    Endpoint, EndpointMap, EventReceiver, TcpEndpoint, TransportEvent, NUM_ENDPOINT_STATS,
};
use crate::transport::RpcFactory;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

pub struct Backend {
    me: Weak<Backend>,
    service_id: u8,
    service_name: &'static str,
    core: NodeCore,
    dependency: Vec<u8>,
    endpoints: Arc<EndpointMap>,
    dep_nodes: NodeInfoMap,
    rpc: OnceLock<Arc<RpcFactory>>,
    discovery: OnceLock<Arc<EtcdDiscovery>>,
    events_tx: mpsc::Sender<TransportEvent>,
    events_rx: Mutex<Option<EventReceiver>>,
    stats: Arc<Stats>,
    closing: AtomicBool,
    done_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Backend {
    pub fn new(
        service_id: u8,
        service_name: &'static str,
        env: &Environ,
        clock: Clock,
        dependency: Vec<u8>,
    ) -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::channel(16);
        let (done_tx, _) = watch::channel(false);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            service_id,
            service_name,
            core: NodeCore::new(env, clock),
            dependency,
            endpoints: Arc::new(EndpointMap::new()),
            dep_nodes: NodeInfoMap::new(),
            rpc: OnceLock::new(),
            discovery: OnceLock::new(),
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            stats: Arc::new(Stats::new(NUM_ENDPOINT_STATS)),
            closing: AtomicBool::new(false),
            done_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    fn arc(&self) -> Option<Arc<Backend>> {
        self.me.upgrade()
    }

    pub fn core(&self) -> &NodeCore {
        &self.core
    }

    pub fn endpoints(&self) -> &Arc<EndpointMap> {
        &self.endpoints
    }

    pub fn rpc(&self) -> &Arc<RpcFactory> {
        self.rpc.get().expect("backend not initialized")
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    fn peer_endpoint_options(&self, env: &Environ) -> EndpointOptions {
        EndpointOptions {
            codec: self.core.codec(),
            outbound_capacity: env.endpoint_outbound_size,
            read_timeout: Duration::from_secs(env.net_peer_read_timeout.max(1)),
        }
    }

    fn is_my_dependency(&self, node: NodeId) -> bool {
        if node == self.core.node() {
            return false;
        }
        self.dependency.contains(&node.service())
    }

    // ------------------------------------------------------------------
    // Peer listen side
    // ------------------------------------------------------------------

    /// Bind the peer listener and start the accept loop.
    pub async fn listen_on(&self, addr: &str) -> Result<SocketAddr> {
        let listener = listen_tcp(addr).await?;
        let local = listener.local_addr()?;
        tracing::info!("listen peers at {local}");
        let me = self
            .arc()
            .ok_or_else(|| NetError::InvalidState("backend dropped".to_string()))?;
        self.tasks
            .lock()
            .push(tokio::spawn(me.serve_accept(listener)));
        Ok(local)
    }

    async fn serve_accept(self: Arc<Self>, listener: TcpListener) {
        let mut done = self.done_tx.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        tracing::info!("peer {addr} connected");
                        let me = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(err) = me.handle_peer_accept(stream).await {
                                tracing::error!("peer registration: {err}");
                            }
                        });
                    }
                    Err(err) => {
                        tracing::error!("accept error: {err}");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
                _ = done.changed() => break,
            }
        }
    }

    /// Token check and duplicate check; an errno describes the refusal.
    fn check_register(&self, req: &RegisterReq) -> std::result::Result<NodeId, u32> {
        let env = self.core.env();
        let node = NodeId(req.node);
        let token = sign_access_token(node, &env.game_id, &env.access_key);
        if req.access_token != token {
            tracing::error!("node {node} register token mismatch");
            return Err(ERR_REGISTRATION_DENIED);
        }
        if self.endpoints.contains(node) {
            tracing::error!("duplicate registration of node {node}");
            return Err(ERR_DUPLICATE_REGISTRATION);
        }
        Ok(node)
    }

    async fn handle_peer_accept(self: Arc<Self>, mut stream: TcpStream) -> Result<()> {
        configure_socket(&stream)?;
        let codec = self.core.codec();
        let (req_pkt, req): (Packet, RegisterReq) =
            read_proto_message(&mut stream, codec, HANDSHAKE_READ_TIMEOUT).await?;

        let own = self.core.node();
        let mut ack = Packet::new(
            own,
            MSG_REGISTER_ACK,
            0,
            req_pkt.seq,
            Body::Message(Arc::new(RegisterAck { node: own.0 })),
        );
        let node = match self.check_register(&req) {
            Ok(node) => node,
            Err(errno) => {
                ack.set_errno(errno);
                send_packet_to(&mut stream, codec, ack).await?;
                return Err(NetError::RegistrationDenied(format!(
                    "node {} refused with errno {errno}",
                    NodeId(req.node)
                )));
            }
        };
        send_packet_to(&mut stream, codec, ack).await?;

        let ctx = self.core.context();
        let endpoint = TcpEndpoint::new(
            node,
            stream,
            self.peer_endpoint_options(&self.core.env()),
            Some(ctx.inbound_sender()),
            Some(self.events_tx.clone()),
            Some(Arc::clone(&self.stats)),
        );
        endpoint.start(true, true);
        self.endpoints.add(node, endpoint);
        ctx.router().table().add_entry(node, node);
        tracing::info!("node {node} registered");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Dependency dial side
    // ------------------------------------------------------------------

    async fn establish_to(self: Arc<Self>, node: NodeId, addr: String) -> Result<()> {
        if self.endpoints.contains(node) {
            tracing::warn!("node {node} already established");
            return Ok(());
        }
        tracing::info!("start connect node {node}({addr})");
        let mut stream = dial_tcp(&addr, DIAL_TIMEOUT).await?;

        let env = self.core.env();
        let own = self.core.node();
        let token = sign_access_token(own, &env.game_id, &env.access_key);
        let request = proto_packet(
            own,
            RegisterReq {
                node: own.0,
                access_token: token,
            },
        );
        let codec = self.core.codec();
        let (_ack_pkt, ack): (Packet, RegisterAck) =
            request_message(&mut stream, codec, request, HANDSHAKE_READ_TIMEOUT).await?;

        let peer = NodeId(ack.node);
        let ctx = self.core.context();
        let endpoint = TcpEndpoint::new(
            peer,
            stream,
            self.peer_endpoint_options(&env),
            Some(ctx.inbound_sender()),
            Some(self.events_tx.clone()),
            Some(Arc::clone(&self.stats)),
        );
        endpoint.start(true, true);
        self.endpoints.add(peer, Arc::clone(&endpoint) as Arc<dyn Endpoint>);
        ctx.router().table().add_entry(peer, peer);

        let me = Arc::clone(&self);
        self.tasks
            .lock()
            .push(tokio::spawn(me.serve_ping(endpoint as Arc<dyn Endpoint>)));
        tracing::info!("register to node {peer} succeed");
        Ok(())
    }

    fn send_ping(&self, endpoint: &Arc<dyn Endpoint>) {
        let msg = KeepAliveReq {
            time: self.core.context().clock().unix_secs(),
        };
        let pkt = proto_packet(endpoint.node(), msg);
        if let Err(err) = endpoint.send_packet(pkt) {
            tracing::error!("send ping to {}: {}", endpoint.node(), err);
        }
    }

    async fn serve_ping(self: Arc<Self>, endpoint: Arc<dyn Endpoint>) {
        tracing::debug!("start serve pinger for {}", endpoint.node());
        let env = self.core.env();
        // The interval's immediate first tick doubles as the initial ping.
        let mut ticker = tokio::time::interval(Duration::from_secs(env.net_peer_ping_interval.max(1)));
        let mut done = self.done_tx.subscribe();
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if endpoint.is_closing() || self.is_closing() {
                        break;
                    }
                    self.send_ping(&endpoint);
                }
                _ = done.changed() => break,
            }
        }
        tracing::debug!("pinger of {} stop serving", endpoint.node());
    }

    // ------------------------------------------------------------------
    // Transport error serving
    // ------------------------------------------------------------------

    async fn serve_events(self: Arc<Self>, mut events: EventReceiver) {
        let mut done = self.done_tx.subscribe();
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.drop_endpoint(event),
                    None => break,
                },
                _ = done.changed() => break,
            }
        }
    }

    fn drop_endpoint(&self, event: TransportEvent) {
        let node = event.endpoint.node();
        tracing::error!("peer {node} lost: {}", event.error);
        event.endpoint.force_close(NetError::ConnForceClose);
        self.endpoints.delete(node);
        self.dep_nodes.delete_node(node);
        self.core.context().router().table().delete_entry(node);
    }

    // ------------------------------------------------------------------
    // Message handling
    // ------------------------------------------------------------------

    fn handle_message(&self, pkt: &mut Packet) -> Result<()> {
        match pkt.command {
            MSG_KEEP_ALIVE_REQ => self.handle_ping(pkt),
            MSG_KEEP_ALIVE_ACK => self.handle_pong(pkt),
            MSG_INSTANCE_STATE_NTF => self.handle_instance_state(pkt),
            _ => Ok(()),
        }
    }

    fn handle_ping(&self, pkt: &mut Packet) -> Result<()> {
        let req: KeepAliveReq = pkt.decode_msg()?;
        let from = pkt.endpoint.as_ref().map(|e| e.node()).unwrap_or_default();
        tracing::debug!("recv ping {} from {}", req.time, from);
        pkt.reply(KeepAliveAck {
            time: self.core.context().clock().unix_secs(),
        })
    }

    fn handle_pong(&self, pkt: &mut Packet) -> Result<()> {
        let ack: KeepAliveAck = pkt.decode_msg()?;
        let from = pkt.endpoint.as_ref().map(|e| e.node()).unwrap_or_default();
        tracing::debug!("recv pong {} from {}", ack.time, from);
        Ok(())
    }

    fn handle_instance_state(&self, pkt: &mut Packet) -> Result<()> {
        let ntf: InstanceStateNtf = pkt.decode_msg()?;
        tracing::debug!("instance state {:?}: {:?}", ntf.state, ntf.peers);
        Ok(())
    }
}

#[async_trait]
impl Service for Backend {
    fn id(&self) -> u8 {
        self.service_id
    }

    fn name(&self) -> &'static str {
        self.service_name
    }

    fn node(&self) -> NodeId {
        self.core.node()
    }

    fn set_node(&self, node: NodeId) {
        self.core.set_node(node);
    }

    async fn init(self: Arc<Self>, ctx: Arc<ServiceContext>) -> Result<()> {
        self.core.attach(Arc::clone(&ctx))?;
        ctx.router()
            .add_policy(BasicRoutePolicy::new(Arc::clone(&self.endpoints)));

        let rpc = RpcFactory::new(Arc::clone(&ctx), Arc::clone(self.core.executor()));
        self.rpc
            .set(rpc)
            .map_err(|_| NetError::InvalidState("backend initialized twice".to_string()))?;

        let sink: Weak<dyn ServiceSink> = self.me.clone();
        let discovery = EtcdDiscovery::new(ctx.env(), sink);
        self.discovery
            .set(discovery)
            .map_err(|_| NetError::InvalidState("backend initialized twice".to_string()))?;

        let weak = self.me.clone();
        self.core.add_handler(
            true,
            Arc::new(move |pkt| match weak.upgrade() {
                Some(backend) => backend.handle_message(pkt),
                None => Ok(()),
            }),
        );
        Ok(())
    }

    async fn startup(self: Arc<Self>) -> Result<()> {
        self.core.startup();
        self.rpc().start();

        let env = self.core.env();
        if let Some(iface) = env.interfaces.first() {
            self.listen_on(iface.bind_addr()).await?;
        }

        let events = self
            .events_rx
            .lock()
            .take()
            .ok_or_else(|| NetError::InvalidState("backend started twice".to_string()))?;
        let me = Arc::clone(&self);
        self.tasks.lock().push(tokio::spawn(me.serve_events(events)));

        if env.etcd_addr.is_empty() {
            tracing::warn!("no coordination store configured, discovery disabled");
        } else if let Some(discovery) = self.discovery.get() {
            discovery.start().await?;
        }
        Ok(())
    }

    async fn shutdown(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(discovery) = self.discovery.get() {
            discovery.close().await;
        }
        let _ = self.done_tx.send(true);
        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        for endpoint in self.endpoints.list() {
            endpoint.force_close(NetError::ConnForceClose);
        }
        self.endpoints.reset();
        self.dep_nodes.clear();
        if let Some(rpc) = self.rpc.get() {
            rpc.shutdown().await;
        }
        self.core.shutdown().await;
    }

    async fn execute(&self, runner: Arc<dyn Runner>) -> Result<()> {
        self.core.executor().execute(runner).await
    }

    fn dispatch(&self, mut pkt: Packet) -> Result<()> {
        self.core.dispatch(&mut pkt)
    }
}

impl ServiceSink for Backend {
    fn node_info(&self) -> crate::protocol::NodeInfo {
        let env = self.core.env();
        let interface = env
            .interfaces
            .first()
            .map(|iface| iface.advertise.clone())
            .unwrap_or_default();
        crate::protocol::NodeInfo {
            node: self.core.node().0,
            interface,
        }
    }

    fn add_dependency(&self, info: &crate::protocol::NodeInfo) {
        let node = NodeId(info.node);
        tracing::debug!("dependency node alive: {node}, {}", info.interface);
        if !self.is_my_dependency(node) {
            return;
        }
        self.dep_nodes.add_node(info.clone());
        if self.endpoints.contains(node) || info.interface.is_empty() {
            return;
        }
        if let Some(me) = self.arc() {
            let addr = info.interface.clone();
            tokio::spawn(async move {
                if let Err(err) = me.establish_to(node, addr).await {
                    tracing::error!("establish to node {node}: {err}");
                }
            });
        }
    }

    fn del_dependency(&self, lost_all: bool, node: NodeId) {
        tracing::debug!("dependency node lost: {lost_all}, {node}");
        if lost_all {
            self.dep_nodes.clear();
            return;
        }
        if self.is_my_dependency(node) {
            self.dep_nodes.delete_node(node);
        }
    }
}
