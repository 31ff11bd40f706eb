// WebSocket endpoint
//
// Same lifecycle as the TCP endpoint with two wire modes: binary messages
// carry one codec-framed packet each, text messages carry one JSON packet
// each (selected per packet by the JSONText flag). The writer pump owns
// the sink; reads happen on a WsReader the accepting task keeps, because
// the session handshake wants the stream before any pump exists.

use super::{publish_event, Endpoint, EventSender, NUM_ENDPOINT_STATS, STAT_BYTES_RECV, STAT_BYTES_SENT, STAT_PACKETS_RECV, STAT_PACKETS_SENT};
use super::tcp::EndpointOptions;
use crate::error::{NetError, Result};
use crate::packet::{MessageEndpoint, NodeId, Packet, PACKET_FLAG_JSON_TEXT};
use crate::runtime::Stats;
use bytes::BytesMut;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

/// Largest inbound WebSocket message the gateway accepts.
pub const WS_MAX_PAYLOAD: usize = 16 * 1024;

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsStream = SplitStream<WebSocketStream<TcpStream>>;

pub struct WsEndpoint {
    me: Weak<WsEndpoint>,
    node: AtomicU32,
    addr: String,
    codec: crate::codec::FrameCodec,
    closing: AtomicBool,
    outbound_tx: mpsc::Sender<Packet>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Packet>>>,
    sink: Mutex<Option<WsSink>>,
    events: Option<EventSender>,
    stats: Arc<Stats>,
    done_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    user_data: RwLock<Option<Arc<dyn Any + Send + Sync>>>,
}

/// Read side of a WebSocket session, kept by the accepting task.
pub struct WsReader {
    stream: WsStream,
    codec: crate::codec::FrameCodec,
    read_timeout: Duration,
}

impl WsEndpoint {
    pub fn new(
        node: NodeId,
        ws: WebSocketStream<TcpStream>,
        opts: EndpointOptions,
        events: Option<EventSender>,
        stats: Option<Arc<Stats>>,
    ) -> (Arc<Self>, WsReader) {
        let addr = ws
            .get_ref()
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let (sink, stream) = ws.split();
        let (outbound_tx, outbound_rx) = mpsc::channel(opts.outbound_capacity.max(1));
        let (done_tx, _) = watch::channel(false);
        let endpoint = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            node: AtomicU32::new(node.0),
            addr,
            codec: opts.codec,
            closing: AtomicBool::new(false),
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            sink: Mutex::new(Some(sink)),
            events,
            stats: stats.unwrap_or_else(|| Arc::new(Stats::new(NUM_ENDPOINT_STATS))),
            done_tx,
            tasks: Mutex::new(Vec::new()),
            user_data: RwLock::new(None),
        });
        let reader = WsReader {
            stream,
            codec: opts.codec,
            read_timeout: opts.read_timeout,
        };
        (endpoint, reader)
    }

    fn arc(&self) -> Option<Arc<WsEndpoint>> {
        self.me.upgrade()
    }

    async fn write_ws_packet(&self, sink: &mut WsSink, mut pkt: Packet) -> Result<()> {
        let message = if pkt.has_flag(PACKET_FLAG_JSON_TEXT) {
            let text = serde_json::to_string(&pkt.to_json_value()?)?;
            self.stats.add(STAT_BYTES_SENT, text.len() as i64);
            Message::text(text)
        } else {
            let mut buf = BytesMut::new();
            let n = self.codec.encode(&mut pkt, &mut buf, None)?;
            self.stats.add(STAT_BYTES_SENT, n as i64);
            Message::binary(buf.freeze())
        };
        if let Err(err) = sink.send(message).await {
            tracing::error!("send message {} to {}: {}", pkt.command, self.addr, err);
            return Err(err.into());
        }
        self.stats.add(STAT_PACKETS_SENT, 1);
        Ok(())
    }

    async fn write_pump(self: Arc<Self>, mut rx: mpsc::Receiver<Packet>, mut sink: WsSink) {
        tracing::debug!("node {} ws writer started at {}", self.node(), self.addr);
        let mut done = self.done_tx.subscribe();
        loop {
            tokio::select! {
                pkt = rx.recv() => match pkt {
                    Some(pkt) => {
                        let _ = self.write_ws_packet(&mut sink, pkt).await;
                    }
                    None => break,
                },
                _ = done.changed() => break,
            }
        }
        rx.close();
        while let Ok(pkt) = rx.try_recv() {
            if self.write_ws_packet(&mut sink, pkt).await.is_err() {
                break;
            }
        }
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.close().await;
        tracing::debug!("node {} ws writer stopped", self.node());
    }

    async fn finalize(&self, err: NetError) {
        let _ = self.done_tx.send(true);
        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        let sink = self.sink.lock().take();
        if let Some(mut sink) = sink {
            let _ = sink.close().await;
        }
        if let Some(me) = self.arc() {
            publish_event(&self.events, err, me as Arc<dyn Endpoint>);
        }
    }
}

impl MessageEndpoint for WsEndpoint {
    fn node(&self) -> NodeId {
        NodeId(self.node.load(Ordering::Relaxed))
    }

    fn remote_addr(&self) -> String {
        self.addr.clone()
    }

    fn send_packet(&self, pkt: Packet) -> Result<()> {
        if self.is_closing() {
            return Err(NetError::ConnIsClosing);
        }
        match self.outbound_tx.try_send(pkt) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(pkt)) => {
                tracing::error!(
                    "ws message {} to node {} dropped: outbound queue overflow",
                    pkt.command,
                    self.node()
                );
                Err(NetError::ConnOutboundOverflow)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(NetError::ConnIsClosing),
        }
    }
}

#[async_trait::async_trait]
impl Endpoint for WsEndpoint {
    fn set_node(&self, node: NodeId) {
        self.node.store(node.0, Ordering::Relaxed);
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    fn start(&self, write: bool, _read: bool) {
        // The read side lives on the WsReader held by the accepting task.
        if !write {
            return;
        }
        let me = match self.arc() {
            Some(me) => me,
            None => return,
        };
        let rx = self.outbound_rx.lock().take();
        let sink = self.sink.lock().take();
        match (rx, sink) {
            (Some(rx), Some(sink)) => {
                self.tasks.lock().push(tokio::spawn(me.write_pump(rx, sink)));
            }
            _ => tracing::error!("node {} ws writer already started", self.node()),
        }
    }

    async fn close(&self) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        self.finalize(NetError::ConnForceClose).await;
    }

    fn force_close(&self, err: NetError) {
        if self.closing.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(me) = self.arc() {
            tokio::spawn(async move { me.finalize(err).await });
        }
    }

    fn stats(&self) -> Arc<Stats> {
        Arc::clone(&self.stats)
    }

    fn set_user_data(&self, data: Arc<dyn Any + Send + Sync>) {
        *self.user_data.write() = Some(data);
    }

    fn user_data(&self) -> Option<Arc<dyn Any + Send + Sync>> {
        self.user_data.read().clone()
    }
}

impl WsReader {
    /// Read one packet. Ping and pong frames are logged and skipped without
    /// restarting the read deadline.
    pub async fn read_packet(&mut self, stats: &Stats) -> Result<Packet> {
        let deadline = tokio::time::Instant::now() + self.read_timeout;
        loop {
            let msg = match tokio::time::timeout_at(deadline, self.stream.next()).await {
                Ok(Some(Ok(msg))) => msg,
                Ok(Some(Err(err))) => return Err(err.into()),
                Ok(None) => return Err(NetError::WebSocket("stream closed".to_string())),
                Err(_) => return Err(NetError::Timeout("websocket read".to_string())),
            };
            match msg {
                Message::Text(text) => {
                    if text.len() > WS_MAX_PAYLOAD {
                        return Err(NetError::PayloadOverflow {
                            command: 0,
                            size: text.len(),
                            limit: WS_MAX_PAYLOAD,
                        });
                    }
                    stats.add(STAT_PACKETS_RECV, 1);
                    stats.add(STAT_BYTES_RECV, text.len() as i64);
                    let value: serde_json::Value = serde_json::from_str(text.as_str())?;
                    let mut pkt = Packet::from_json_value(value)?;
                    pkt.flag |= PACKET_FLAG_JSON_TEXT;
                    return Ok(pkt);
                }
                Message::Binary(data) => {
                    if data.len() > WS_MAX_PAYLOAD {
                        return Err(NetError::PayloadOverflow {
                            command: 0,
                            size: data.len(),
                            limit: WS_MAX_PAYLOAD,
                        });
                    }
                    stats.add(STAT_PACKETS_RECV, 1);
                    stats.add(STAT_BYTES_RECV, data.len() as i64);
                    let (pkt, _) = self.codec.decode(&mut data.as_ref(), None).await?;
                    return Ok(pkt);
                }
                Message::Ping(data) => {
                    tracing::debug!("ping frame, {} bytes", data.len());
                }
                Message::Pong(_) => {}
                Message::Close(_) => {
                    return Err(NetError::WebSocket("closed by peer".to_string()));
                }
                Message::Frame(_) => {
                    return Err(NetError::WebSocket("unexpected raw frame".to_string()));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FrameCodec;
    use crate::packet::Body;
    use tokio::net::TcpListener;
    use tokio_tungstenite::{accept_async, client_async};

    async fn ws_pair() -> (WebSocketStream<TcpStream>, WebSocketStream<TcpStream>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            let (ws, _) = client_async(format!("ws://{addr}/"), stream).await.unwrap();
            ws
        });
        let (stream, _) = listener.accept().await.unwrap();
        let server = accept_async(stream).await.unwrap();
        let client = connect.await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn binary_packet_round_trip() {
        let (client_ws, server_ws) = ws_pair().await;
        let (client_ep, _client_rd) = WsEndpoint::new(
            NodeId::session(0, 1),
            client_ws,
            EndpointOptions::default(),
            None,
            None,
        );
        client_ep.start(true, false);

        let (server_ep, mut server_rd) = WsEndpoint::new(
            NodeId::session(0, 2),
            server_ws,
            EndpointOptions::default(),
            None,
            None,
        );

        client_ep
            .send_packet(Packet::new(NodeId::ZERO, 150, 0, 5, Body::from("ws")))
            .unwrap();

        let pkt = tokio::time::timeout(
            Duration::from_secs(2),
            server_rd.read_packet(&server_ep.stats()),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(pkt.command, 150);
        assert_eq!(pkt.seq, 5);
        assert!(matches!(pkt.body, Body::Bytes(ref b) if b.as_ref() == b"ws"));
        assert_eq!(server_ep.stats().get(STAT_PACKETS_RECV), 1);

        client_ep.close().await;
        server_ep.close().await;
    }

    #[tokio::test]
    async fn json_text_round_trip() {
        let (client_ws, server_ws) = ws_pair().await;
        let (client_ep, _client_rd) = WsEndpoint::new(
            NodeId::session(0, 1),
            client_ws,
            EndpointOptions::default(),
            None,
            None,
        );
        client_ep.start(true, false);

        let (server_ep, mut server_rd) = WsEndpoint::new(
            NodeId::session(0, 2),
            server_ws,
            EndpointOptions::default(),
            None,
            None,
        );

        let pkt = Packet::new(NodeId::ZERO, 150, PACKET_FLAG_JSON_TEXT, 8, Body::from("hola"));
        client_ep.send_packet(pkt).unwrap();

        let got = tokio::time::timeout(
            Duration::from_secs(2),
            server_rd.read_packet(&server_ep.stats()),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(got.command, 150);
        assert_eq!(got.seq, 8);
        assert!(got.has_flag(PACKET_FLAG_JSON_TEXT));
        assert!(matches!(got.body, Body::Text(ref s) if s == "hola"));

        client_ep.close().await;
        server_ep.close().await;
    }

    #[tokio::test]
    async fn overflow_applies_to_ws_endpoints() {
        let (client_ws, _server_ws) = ws_pair().await;
        let opts = EndpointOptions {
            codec: FrameCodec::Server,
            outbound_capacity: 2,
            read_timeout: Duration::from_secs(100),
        };
        let (ep, _rd) = WsEndpoint::new(NodeId::session(0, 1), client_ws, opts, None, None);
        assert!(ep.send_packet(Packet::with_command(1)).is_ok());
        assert!(ep.send_packet(Packet::with_command(2)).is_ok());
        let err = ep.send_packet(Packet::with_command(3)).unwrap_err();
        assert!(matches!(err, NetError::ConnOutboundOverflow));
        ep.close().await;
    }
}
