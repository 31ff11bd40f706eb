// Backend-to-backend mesh over real sockets
//
// Node A listens; node B learns about A through a discovery callback and
// auto-dials it with a signed registration. Heartbeats start flowing, the
// routing tables pick up the link, and a dropped connection is scrubbed
// from every index on the listening side.

use meshgate::cluster::{Backend, ServiceSink};
use meshgate::config::Environ;
use meshgate::packet::NodeId;
use meshgate::protocol::NodeInfo;
use meshgate::runtime::Clock;
use meshgate::service::{Service, ServiceContext};
use meshgate::transport::Endpoint;
use std::sync::Arc;
use std::time::Duration;

async fn start_backend(
    service_id: u8,
    name: &'static str,
    index: u16,
    deps: Vec<u8>,
) -> (Arc<ServiceContext>, Arc<Backend>) {
    let mut env = Environ::default();
    env.game_id = "game7".to_string();
    env.access_key = "topsecret".to_string();
    env.etcd_addr = String::new();
    env.executor_capacity = 256;
    env.context_inbound_size = 256;
    env.context_outbound_size = 256;
    env.net_peer_ping_interval = 1;
    let env = Arc::new(env);
    let ctx = ServiceContext::new(Arc::clone(&env), Clock::system());
    let backend = Backend::new(service_id, name, &env, Clock::system(), deps);
    backend.set_node(NodeId::backend(service_id, index));
    ctx.start(Arc::clone(&backend) as Arc<dyn Service>)
        .await
        .unwrap();
    (ctx, backend)
}

async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..300 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn dependency_dial_register_and_drop() {
    let (ctx_a, node_a) = start_backend(0x06, "world", 1, vec![]).await;
    let addr = node_a.listen_on("127.0.0.1:0").await.unwrap();

    let (ctx_b, node_b) = start_backend(0x05, "game", 1, vec![0x06]).await;

    // Discovery announces A; B dials and registers.
    node_b.add_dependency(&NodeInfo {
        node: node_a.node().0,
        interface: addr.to_string(),
    });

    wait_until("B to connect to A", || {
        node_b.endpoints().contains(node_a.node())
    })
    .await;
    wait_until("A to accept B", || {
        node_a.endpoints().contains(node_b.node())
    })
    .await;
    assert_eq!(
        ctx_b.router().table().get_entry(node_a.node()),
        node_a.node()
    );
    assert_eq!(
        ctx_a.router().table().get_entry(node_b.node()),
        node_b.node()
    );

    // The dial side heartbeats immediately; the ack bumps its counters.
    let b_link = node_b.endpoints().get(node_a.node()).unwrap();
    wait_until("heartbeat ack to arrive", || {
        b_link.stats().get(meshgate::transport::STAT_PACKETS_RECV) >= 1
    })
    .await;

    // Re-announcing an established dependency changes nothing.
    node_b.add_dependency(&NodeInfo {
        node: node_a.node().0,
        interface: addr.to_string(),
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(node_b.endpoints().len(), 1);

    // B goes away; A scrubs the link from its indices.
    node_b.shutdown().await;
    wait_until("A to drop B", || !node_a.endpoints().contains(node_b.node())).await;
    wait_until("A to forget B's route", || {
        ctx_a.router().table().get_entry(node_b.node()) == NodeId::ZERO
    })
    .await;

    node_a.shutdown().await;
}

#[tokio::test]
async fn undeclared_dependencies_are_ignored() {
    let (_ctx_a, node_a) = start_backend(0x06, "world", 2, vec![]).await;
    let addr = node_a.listen_on("127.0.0.1:0").await.unwrap();

    // B declares no dependencies at all.
    let (_ctx_b, node_b) = start_backend(0x05, "game", 2, vec![]).await;
    node_b.add_dependency(&NodeInfo {
        node: node_a.node().0,
        interface: addr.to_string(),
    });

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(node_b.endpoints().is_empty());
    assert!(node_a.endpoints().is_empty());

    node_b.shutdown().await;
    node_a.shutdown().await;
}
