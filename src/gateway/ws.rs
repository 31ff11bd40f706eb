// WebSocket client termination
//
// Same session lifecycle as TCP clients: allocate a session id, expect the
// login first, then feed the dispatcher. One codec frame per binary
// message, one JSON packet per text message.

use super::session::{node_to_session, SessionUserData};
use super::Gateway;
use crate::codec::FrameCodec;
use crate::error::NetError;
use crate::packet::MessageEndpoint;
use crate::protocol::{MSG_CLIENT_END_ID, MSG_CLIENT_START_ID};
use crate::transport::tcp::EndpointOptions;
use crate::transport::ws::WS_MAX_PAYLOAD;
use crate::transport::{Endpoint, WsEndpoint, WsReader};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

impl Gateway {
    pub(super) async fn serve_ws_session(self: Arc<Self>, listener: TcpListener) {
        let addr = listener.local_addr().ok();
        tracing::info!("serve websocket clients at {addr:?}");
        let mut done = self.done_tx.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let me = Arc::clone(&self);
                        tokio::spawn(me.handle_ws_conn(stream));
                    }
                    Err(err) => {
                        tracing::error!("accept error: {err}");
                        tokio::time::sleep(Duration::from_millis(200)).await;
                    }
                },
                _ = done.changed() => break,
            }
        }
        tracing::info!("stop serving websocket clients at {addr:?}");
    }

    async fn handle_ws_conn(self: Arc<Self>, stream: TcpStream) {
        let config = WebSocketConfig::default().max_message_size(Some(WS_MAX_PAYLOAD));
        let ws = match tokio_tungstenite::accept_async_with_config(stream, Some(config)).await {
            Ok(ws) => ws,
            Err(err) => {
                tracing::error!("websocket upgrade: {err}");
                return;
            }
        };

        let node = self.next_session();
        self.track_pcu();
        let sid = node_to_session(node);

        let env = self.core.env();
        let read_timeout = Duration::from_secs(env.net_session_read_timeout.max(1));
        let (endpoint, mut reader) = WsEndpoint::new(
            node,
            ws,
            EndpointOptions {
                codec: FrameCodec::Server,
                outbound_capacity: env.endpoint_outbound_size,
                read_timeout,
            },
            None,
            Some(Arc::clone(&self.c_stats)),
        );
        tracing::info!("websocket client #{sid} connected, {}", endpoint.remote_addr());
        endpoint.start(true, false);
        let session: Arc<dyn Endpoint> = Arc::clone(&endpoint) as Arc<dyn Endpoint>;

        let mut login = match reader.read_packet(&self.c_stats).await {
            Ok(pkt) => pkt,
            Err(err) => {
                tracing::error!("session {sid} read login: {err}");
                endpoint.force_close(err);
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

        self.serve_ws_packets(&session, &mut reader).await;
        tracing::info!("websocket client #{sid} disconnected");
        self.close_session(&session);
    }

    async fn serve_ws_packets(&self, session: &Arc<dyn Endpoint>, reader: &mut WsReader) {
        let sid = node_to_session(session.node());
        let mut done = self.done_tx.subscribe();
        while !self.is_closing() {
            tokio::select! {
                res = reader.read_packet(&self.c_stats) => {
                    let mut pkt = match res {
                        Ok(pkt) => pkt,
                        Err(NetError::WebSocket(_)) | Err(NetError::Io(_)) => return,
                        Err(err) => {
                            tracing::error!("session {sid} read packet: {err}");
                            return;
                        }
                    };
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
}
