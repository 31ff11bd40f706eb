// Gateway service
//
// The first configured interface listens for backend registrations; every
// further interface terminates clients, over TCP or WebSocket depending on
// the address scheme.

use super::router::GatewayRoutePolicy;
use super::session::session_user_data;
use crate::cluster::{EtcdDiscovery, NodeCore, ServiceSink};
use crate::config::{Environ, NetInterface};
use crate::error::{NetError, Result};
use crate::packet::{Body, MessageEndpoint, NodeId, Packet};
use crate::protocol::{
    ClientDisconnectNtf, ClientLostNtf, InstanceState, InstanceStateNtf, WireMessage,
    ERR_SERVER_MAINTENANCE, MSG_CLIENT_LOST_NTF, SERVICE_GATEWAY,
};
use crate::routing::BasicRoutePolicy;
use crate::runtime::{Clock, Runner, Stats};
use crate::service::{Service, ServiceContext};
use crate::transport::listener::listen_tcp;
use crate::transport::{Endpoint, EndpointMap, NUM_ENDPOINT_STATS};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub struct Gateway {
    pub(super) me: Weak<Gateway>,
    pub(super) core: NodeCore,
    pub(super) discovery: OnceLock<Arc<EtcdDiscovery>>,
    pub(super) server_iface: RwLock<Option<NetInterface>>,
    pub(super) backend_listener: Mutex<Option<TcpListener>>,
    pub(super) client_listeners: Mutex<Vec<TcpListener>>,
    pub(super) ws_listeners: Mutex<Vec<TcpListener>>,
    pub(super) backend_listen_addr: RwLock<Option<std::net::SocketAddr>>,
    pub(super) client_listen_addrs: RwLock<Vec<std::net::SocketAddr>>,
    pub(super) ws_listen_addrs: RwLock<Vec<std::net::SocketAddr>>,
    pub(super) backends: Arc<EndpointMap>,
    pub(super) sessions: Arc<EndpointMap>,
    pub(super) c_stats: Arc<Stats>,
    pub(super) s_stats: Arc<Stats>,
    pub(super) next_sid: Mutex<u32>,
    pub(super) pcu: AtomicU32,
    pub(super) closing: AtomicBool,
    pub(super) done_tx: watch::Sender<bool>,
    pub(super) tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Gateway {
    pub fn new(env: &Environ, clock: Clock) -> Arc<Self> {
        let (done_tx, _) = watch::channel(false);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            core: NodeCore::new(env, clock),
            discovery: OnceLock::new(),
            server_iface: RwLock::new(None),
            backend_listener: Mutex::new(None),
            client_listeners: Mutex::new(Vec::new()),
            ws_listeners: Mutex::new(Vec::new()),
            backend_listen_addr: RwLock::new(None),
            client_listen_addrs: RwLock::new(Vec::new()),
            ws_listen_addrs: RwLock::new(Vec::new()),
            backends: Arc::new(EndpointMap::new()),
            sessions: Arc::new(EndpointMap::new()),
            c_stats: Arc::new(Stats::new(NUM_ENDPOINT_STATS)),
            s_stats: Arc::new(Stats::new(NUM_ENDPOINT_STATS)),
            next_sid: Mutex::new(1000),
            pcu: AtomicU32::new(0),
            closing: AtomicBool::new(false),
            done_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn core(&self) -> &NodeCore {
        &self.core
    }

    pub fn backends(&self) -> &Arc<EndpointMap> {
        &self.backends
    }

    pub fn sessions(&self) -> &Arc<EndpointMap> {
        &self.sessions
    }

    /// Where backends register, once initialized.
    pub fn backend_listen_addr(&self) -> Option<std::net::SocketAddr> {
        *self.backend_listen_addr.read()
    }

    /// Where TCP clients connect, once initialized.
    pub fn client_listen_addrs(&self) -> Vec<std::net::SocketAddr> {
        self.client_listen_addrs.read().clone()
    }

    /// Where WebSocket clients connect, once initialized.
    pub fn ws_listen_addrs(&self) -> Vec<std::net::SocketAddr> {
        self.ws_listen_addrs.read().clone()
    }

    pub(super) fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Loopback test first, then the policy chain; the dispatch context is
    /// bypassed because the gateway's read loops feed packets directly.
    pub(super) fn dispatch_packet(&self, pkt: Packet) {
        let router = self.core.context().router();
        if router.is_loopback(&pkt) {
            if let Err(err) = self.handle_message(pkt) {
                tracing::error!("dispatch message: {err}");
            }
        } else if let Err(err) = router.route(pkt) {
            tracing::error!("route message: {err}");
        }
    }

    /// One packet to every connected backend except `except`.
    pub(super) fn broadcast_to_backends<M: WireMessage + Clone + 'static>(
        &self,
        command: u32,
        notify: &M,
        except: NodeId,
    ) {
        for endpoint in self.backends.list() {
            if endpoint.node() == except {
                continue;
            }
            let pkt = Packet::new(
                self.core.node(),
                command,
                0,
                0,
                Body::Message(Arc::new(notify.clone())),
            );
            if let Err(err) = endpoint.send_packet(pkt) {
                tracing::error!("broadcast {} to {}: {}", command, endpoint.node(), err);
            }
        }
    }

    /// Seed a freshly registered backend with the set of peers already up.
    pub(super) fn send_backend_set(&self, endpoint: &Arc<dyn Endpoint>) {
        let peers: Vec<u32> = self
            .backends
            .list()
            .into_iter()
            .map(|e| e.node().0)
            .filter(|n| *n != endpoint.node().0)
            .collect();
        if peers.is_empty() {
            return;
        }
        let notify = InstanceStateNtf {
            state: InstanceState::Up,
            peers,
        };
        let command = notify.command();
        let pkt = Packet::new(self.core.node(), command, 0, 0, Body::Message(Arc::new(notify)));
        if let Err(err) = endpoint.send_packet(pkt) {
            tracing::error!("seed backend {}: {}", endpoint.node(), err);
        }
    }

    /// Tell every backend that subscribed to the client-lost key that this
    /// session went away.
    pub(super) fn propagate_client_lost(&self, session: &Arc<dyn Endpoint>) {
        let userid = session_user_data(session).map(|ud| ud.userid()).unwrap_or(0);
        let router = self.core.context().router();
        let subscribed = router
            .subscriber()
            .nodes_of(MSG_CLIENT_LOST_NTF as i32);
        for node in subscribed.iter() {
            let Some(endpoint) = self.backends.get(node) else {
                continue;
            };
            let notify = ClientLostNtf {
                user_id: userid,
                session: session.node().0,
            };
            let pkt = Packet::new(
                self.core.node(),
                MSG_CLIENT_LOST_NTF,
                0,
                0,
                Body::Message(Arc::new(notify)),
            );
            if let Err(err) = endpoint.send_packet(pkt) {
                tracing::error!("client lost notify to {node}: {err}");
            }
        }
    }

    /// Drop a client session from the map and tear its connection down.
    pub(super) fn close_session(&self, session: &Arc<dyn Endpoint>) {
        self.sessions.delete(session.node());
        session.force_close(NetError::ConnForceClose);
        self.propagate_client_lost(session);
    }

    /// Disconnect a session with a reason, optionally telling backends.
    pub(super) fn kick(&self, session: &Arc<dyn Endpoint>, reason: u32, propagate: bool) {
        let notify = ClientDisconnectNtf { reason };
        let command = notify.command();
        let pkt = Packet::new(
            self.core.node(),
            command,
            0,
            0,
            Body::Message(Arc::new(notify)),
        );
        if let Err(err) = session.send_packet(pkt) {
            tracing::error!("kick session {}: {}", session.node(), err);
        }
        self.sessions.delete(session.node());
        session.force_close(NetError::ConnForceClose);
        if propagate {
            self.propagate_client_lost(session);
        }
    }

    /// A backend link went down: unregister it everywhere and tell the rest.
    pub(super) fn close_backend(&self, endpoint: &Arc<dyn Endpoint>) {
        let node = endpoint.node();
        self.backends.delete(node);
        let router = self.core.context().router();
        router.table().delete_entry(node);
        router.subscriber().remove_node(node);
        let notify = InstanceStateNtf {
            state: InstanceState::Down,
            peers: vec![node.0],
        };
        self.broadcast_to_backends(notify.command(), &notify, node);
        endpoint.force_close(NetError::ConnForceClose);
    }

    /// Maintenance disconnect of every session, without propagation: the
    /// backends are about to go away too.
    pub(super) fn disconnect_all(&self) {
        for session in self.sessions.list() {
            self.kick(&session, ERR_SERVER_MAINTENANCE, false);
        }
    }
}

#[async_trait]
impl Service for Gateway {
    fn id(&self) -> u8 {
        SERVICE_GATEWAY
    }

    fn name(&self) -> &'static str {
        "gate"
    }

    fn node(&self) -> NodeId {
        self.core.node()
    }

    fn set_node(&self, node: NodeId) {
        self.core.set_node(node);
    }

    async fn init(self: Arc<Self>, ctx: Arc<ServiceContext>) -> Result<()> {
        self.core.attach(Arc::clone(&ctx))?;
        let router = ctx.router();
        router.add_policy(GatewayRoutePolicy::new(
            Arc::clone(&self.backends),
            Arc::clone(&self.sessions),
        ));
        router.add_policy(BasicRoutePolicy::new(Arc::clone(&self.backends)));

        let sink: Weak<dyn ServiceSink> = self.me.clone();
        let discovery = EtcdDiscovery::new(ctx.env(), sink);
        self.discovery
            .set(discovery)
            .map_err(|_| NetError::InvalidState("gateway initialized twice".to_string()))?;

        // The first interface faces backends, the rest face clients.
        let env = ctx.env();
        if env.interfaces.len() < 2 {
            tracing::error!("invalid interfaces {:?} specified", env.interfaces);
            return Err(NetError::Configuration(
                "gateway needs one backend and at least one client interface".to_string(),
            ));
        }
        let server_iface = env.interfaces[0].clone();
        let listener = listen_tcp(server_iface.bind_addr()).await?;
        let local = listener.local_addr()?;
        tracing::info!("listen backends at {local}");
        *self.backend_listener.lock() = Some(listener);
        *self.backend_listen_addr.write() = Some(local);
        *self.server_iface.write() = Some(server_iface);

        for iface in &env.interfaces[1..] {
            let listener = listen_tcp(iface.bind_addr()).await?;
            let local = listener.local_addr()?;
            if iface.is_websocket() {
                tracing::info!("listen websocket clients at {local}");
                self.ws_listen_addrs.write().push(local);
                self.ws_listeners.lock().push(listener);
            } else {
                tracing::info!("listen clients at {local}");
                self.client_listen_addrs.write().push(local);
                self.client_listeners.lock().push(listener);
            }
        }
        Ok(())
    }

    async fn startup(self: Arc<Self>) -> Result<()> {
        self.core.startup();

        let mut tasks = Vec::new();
        if let Some(listener) = self.backend_listener.lock().take() {
            tasks.push(tokio::spawn(Arc::clone(&self).serve_backend(listener)));
        }
        for listener in self.client_listeners.lock().drain(..) {
            tasks.push(tokio::spawn(Arc::clone(&self).serve_client_session(listener)));
        }
        for listener in self.ws_listeners.lock().drain(..) {
            tasks.push(tokio::spawn(Arc::clone(&self).serve_ws_session(listener)));
        }
        self.tasks.lock().extend(tasks);

        let env = self.core.env();
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
        self.disconnect_all();
        if let Some(discovery) = self.discovery.get() {
            discovery.close().await;
        }
        let _ = self.done_tx.send(true);
        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        for endpoint in self.backends.list() {
            endpoint.force_close(NetError::ConnForceClose);
        }
        self.backends.reset();
        self.sessions.reset();
        self.core.shutdown().await;
    }

    async fn execute(&self, runner: Arc<dyn Runner>) -> Result<()> {
        self.core.executor().execute(runner).await
    }

    fn dispatch(&self, pkt: Packet) -> Result<()> {
        self.handle_message(pkt)
    }
}

impl ServiceSink for Gateway {
    fn node_info(&self) -> crate::protocol::NodeInfo {
        let interface = self
            .server_iface
            .read()
            .as_ref()
            .map(|iface| iface.advertise.clone())
            .unwrap_or_default();
        crate::protocol::NodeInfo {
            node: self.core.node().0,
            interface,
        }
    }

    fn add_dependency(&self, _info: &crate::protocol::NodeInfo) {
        // Backends dial the gateway, never the other way around.
    }

    fn del_dependency(&self, _lost_all: bool, _node: NodeId) {}
}
