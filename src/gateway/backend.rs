// Backend termination on the gateway
//
// Backends register over the first configured interface with the same
// signed token the cluster uses peer-to-peer. A successful registration is
// announced to every other backend and the newcomer is seeded with the
// current backend set.

use super::Gateway;
use crate::cluster::sign_access_token;
use crate::codec::FrameCodec;
use crate::error::{NetError, Result};
use crate::packet::{Body, MessageEndpoint, NodeId, Packet};
use crate::protocol::{
    InstanceState, InstanceStateNtf, RegisterAck, RegisterReq, ERR_DUPLICATE_REGISTRATION,
    ERR_REGISTRATION_DENIED, MSG_REGISTER_ACK,
};
use crate::protocol::WireMessage;
use crate::transport::listener::{
    configure_socket, read_proto_message, send_packet_to, HANDSHAKE_READ_TIMEOUT,
};
use crate::transport::tcp::EndpointOptions;
use crate::transport::{Endpoint, TcpEndpoint, STAT_BYTES_RECV, STAT_PACKETS_RECV};
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

impl Gateway {
    pub(super) async fn serve_backend(self: Arc<Self>, listener: TcpListener) {
        let addr = listener.local_addr().ok();
        tracing::info!("serve backends at {addr:?}");
        let mut done = self.done_tx.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::info!("backend {peer} connected");
                        let me = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(err) = me.handle_backend_conn(stream).await {
                                tracing::error!("backend handshake: {err}");
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
        tracing::info!("stop serving backends at {addr:?}");
    }

    async fn handle_backend_conn(self: Arc<Self>, mut stream: TcpStream) -> Result<()> {
        configure_socket(&stream)?;
        let codec = FrameCodec::Server;
        let (req_pkt, req): (Packet, RegisterReq) =
            read_proto_message(&mut stream, codec, HANDSHAKE_READ_TIMEOUT).await?;

        let own = self.core.node();
        let env = self.core.env();
        let node = NodeId(req.node);
        let mut ack = Packet::new(
            own,
            MSG_REGISTER_ACK,
            0,
            req_pkt.seq,
            Body::Message(Arc::new(RegisterAck { node: own.0 })),
        );

        let token = sign_access_token(node, &env.game_id, &env.access_key);
        if req.access_token != token {
            tracing::error!("backend {node} register token mismatch");
            ack.set_errno(ERR_REGISTRATION_DENIED);
            send_packet_to(&mut stream, codec, ack).await?;
            return Err(NetError::RegistrationDenied(node.to_string()));
        }
        if self.backends.contains(node) {
            tracing::error!("duplicate registration of backend {node}");
            ack.set_errno(ERR_DUPLICATE_REGISTRATION);
            send_packet_to(&mut stream, codec, ack).await?;
            return Err(NetError::DuplicateRegistration(node.to_string()));
        }
        send_packet_to(&mut stream, codec, ack).await?;

        let read_timeout = Duration::from_secs(env.net_peer_read_timeout.max(1));
        let endpoint = TcpEndpoint::new(
            node,
            stream,
            EndpointOptions {
                codec,
                outbound_capacity: env.endpoint_outbound_size,
                read_timeout,
            },
            None,
            None,
            Some(Arc::clone(&self.s_stats)),
        );
        endpoint.start(true, false);
        let backend: Arc<dyn Endpoint> = Arc::clone(&endpoint) as Arc<dyn Endpoint>;
        self.backends.add(node, Arc::clone(&backend));
        let router = self.core.context().router();
        router.table().add_entry(node, node);
        tracing::info!("backend {node} registered");

        self.send_backend_set(&backend);
        let notify = InstanceStateNtf {
            state: InstanceState::Up,
            peers: vec![node.0],
        };
        self.broadcast_to_backends(notify.command(), &notify, node);

        let Some(mut reader) = endpoint.take_read_half() else {
            return Ok(());
        };
        self.serve_backend_packets(&backend, &mut reader, read_timeout)
            .await;
        tracing::info!("backend {node} disconnected");
        self.close_backend(&backend);
        Ok(())
    }

    async fn serve_backend_packets(
        &self,
        backend: &Arc<dyn Endpoint>,
        reader: &mut tokio::net::tcp::OwnedReadHalf,
        read_timeout: Duration,
    ) {
        let node = backend.node();
        let mut done = self.done_tx.subscribe();
        while !self.is_closing() {
            tokio::select! {
                res = tokio::time::timeout(
                    read_timeout,
                    FrameCodec::Server.decode(reader, None),
                ) => {
                    let (mut pkt, nbytes) = match res {
                        Ok(Ok(decoded)) => decoded,
                        Ok(Err(NetError::Io(err))) if err.kind() == ErrorKind::UnexpectedEof => {
                            return;
                        }
                        Ok(Err(err)) => {
                            tracing::error!("backend {node} read packet: {err}");
                            return;
                        }
                        Err(_) => {
                            tracing::error!("backend {node} read timed out");
                            return;
                        }
                    };
                    self.s_stats.add(STAT_PACKETS_RECV, 1);
                    self.s_stats.add(STAT_BYTES_RECV, nbytes as i64);
                    pkt.endpoint = Some(Arc::clone(backend) as Arc<dyn MessageEndpoint>);
                    self.dispatch_packet(pkt);
                }
                _ = done.changed() => return,
            }
        }
    }
}
