// Client TCP termination and the login handoff
//
// A freshly accepted client gets a session id and must lead with its login
// packet. The gateway wraps the raw login bytes into a ForwardClientMsg
// addressed to the first backend subscribed to the client command range;
// with nobody subscribed the client is refused and dropped. After the
// handoff the session read loop feeds the dispatcher until the connection
// or the deadline dies.

use super::session::{node_to_session, SessionUserData};
use super::Gateway;
use crate::codec::FrameCodec;
use crate::error::{NetError, Result};
use crate::packet::{Body, MessageEndpoint, NodeId, Packet};
use crate::protocol::{
    ForwardClientMsg, ERR_SERVICE_NOT_AVAILABLE, MSG_CLIENT_END_ID, MSG_CLIENT_START_ID,
    MSG_FORWARD_CLIENT_REQ, MSG_LOGIN_ACK,
};
use crate::transport::tcp::EndpointOptions;
use crate::transport::{Endpoint, TcpEndpoint, STAT_BYTES_RECV, STAT_PACKETS_RECV};
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};

impl Gateway {
    pub(super) async fn serve_client_session(self: Arc<Self>, listener: TcpListener) {
        let addr = listener.local_addr().ok();
        tracing::info!("serve clients at {addr:?}");
        let mut done = self.done_tx.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let node = self.next_session();
                        self.track_pcu();
                        let me = Arc::clone(&self);
                        tokio::spawn(me.handle_client_conn(stream, node));
                    }
                    Err(err) => {
                        tracing::error!("accept error: {err}");
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                },
                _ = done.changed() => break,
            }
        }
        tracing::info!("stop serving clients at {addr:?}");
    }

    async fn handle_client_conn(self: Arc<Self>, stream: TcpStream, node: NodeId) {
        let sid = node_to_session(node);
        let peer = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_default();
        tracing::info!("TCP client #{sid} connected, {peer}");

        let env = self.core.env();
        let read_timeout = Duration::from_secs(env.net_session_read_timeout.max(1));
        let endpoint = TcpEndpoint::new(
            node,
            stream,
            EndpointOptions {
                codec: FrameCodec::Client,
                outbound_capacity: env.endpoint_outbound_size,
                read_timeout,
            },
            None,
            None,
            Some(Arc::clone(&self.c_stats)),
        );
        endpoint.start(true, false);
        let Some(mut reader) = endpoint.take_read_half() else {
            endpoint.force_close(NetError::ConnForceClose);
            return;
        };
        let session: Arc<dyn Endpoint> = Arc::clone(&endpoint) as Arc<dyn Endpoint>;

        // Step 1 of the handshake: the login packet, under a deadline.
        let first = tokio::time::timeout(
            read_timeout,
            FrameCodec::Client.decode(&mut reader, None),
        )
        .await;
        let mut login = match first {
            Ok(Ok((pkt, _))) => pkt,
            Ok(Err(err)) => {
                tracing::error!("session {sid} read login: {err}");
                endpoint.force_close(err);
                return;
            }
            Err(_) => {
                tracing::error!("session {sid} login timed out");
                endpoint.force_close(NetError::Timeout("client login".to_string()));
                return;
            }
        };
        login.endpoint = Some(Arc::clone(&endpoint) as Arc<dyn MessageEndpoint>);

        if let Err(err) = self.forward_client_login(&session, &mut login) {
            tracing::error!("handle login of session {sid}: {err}");
            endpoint.force_close(err);
            return;
        }
        session.set_user_data(Arc::new(SessionUserData::default()));
        self.sessions.add(node, Arc::clone(&session));

        self.serve_session_packets(&session, &mut reader, read_timeout).await;
        tracing::info!("client #{sid}({peer}) disconnected");
        self.close_session(&session);
    }

    async fn serve_session_packets(
        &self,
        session: &Arc<dyn Endpoint>,
        reader: &mut tokio::net::tcp::OwnedReadHalf,
        read_timeout: Duration,
    ) {
        let sid = node_to_session(session.node());
        let mut done = self.done_tx.subscribe();
        while !self.is_closing() {
            tokio::select! {
                res = tokio::time::timeout(
                    read_timeout,
                    FrameCodec::Client.decode(reader, None),
                ) => {
                    let (mut pkt, nbytes) = match res {
                        Ok(Ok(decoded)) => decoded,
                        Ok(Err(NetError::Io(err))) if err.kind() == ErrorKind::UnexpectedEof => {
                            return;
                        }
                        Ok(Err(err)) => {
                            tracing::error!("session {sid} read packet: {err}");
                            return;
                        }
                        Err(_) => {
                            tracing::error!("session {sid} read timed out");
                            return;
                        }
                    };
                    self.c_stats.add(STAT_PACKETS_RECV, 1);
                    self.c_stats.add(STAT_BYTES_RECV, nbytes as i64);
                    if pkt.command < MSG_CLIENT_START_ID || pkt.command > MSG_CLIENT_END_ID {
                        tracing::error!("session {sid} illegal packet [{pkt:?}]");
                        return;
                    }
                    pkt.endpoint = Some(Arc::clone(session) as Arc<dyn MessageEndpoint>);
                    self.dispatch_packet(pkt);
                }
                _ = done.changed() => return,
            }
        }
    }

    /// Steps 2 and 3 of the handshake: pick the subscribed backend and hand
    /// the raw login bytes over, keeping the client's sequence number.
    pub(super) fn forward_client_login(
        &self,
        session: &Arc<dyn Endpoint>,
        login: &mut Packet,
    ) -> Result<()> {
        let router = self.core.context().router();
        let subscribed = router
            .subscriber()
            .nodes_in_range(MSG_CLIENT_START_ID as i32, MSG_CLIENT_END_ID as i32);

        let refuse = |errno: u32| {
            let mut resp = Packet::new(session.node(), MSG_LOGIN_ACK, 0, login.seq, Body::Empty);
            resp.set_errno(errno);
            if let Err(err) = session.send_packet(resp) {
                tracing::error!("refuse login of {}: {}", session.node(), err);
            }
        };

        let Some(target) = subscribed.iter().next() else {
            tracing::error!("no service can handle login");
            refuse(ERR_SERVICE_NOT_AVAILABLE);
            return Err(NetError::Errno {
                command: login.command,
                errno: ERR_SERVICE_NOT_AVAILABLE,
            });
        };
        let Some(backend) = self.backends.get(target) else {
            tracing::error!("backend {target} not reachable");
            refuse(ERR_SERVICE_NOT_AVAILABLE);
            return Err(NetError::Errno {
                command: login.command,
                errno: ERR_SERVICE_NOT_AVAILABLE,
            });
        };

        let msg_data = login.encode_body()?;
        let forward = ForwardClientMsg {
            session: session.node().0,
            user_id: 0,
            msg_id: login.command,
            msg_data: msg_data.to_vec(),
        };
        let pkt = Packet::new(
            target,
            MSG_FORWARD_CLIENT_REQ,
            0,
            login.seq,
            Body::Message(Arc::new(forward)),
        );
        backend.send_packet(pkt)
    }
}
