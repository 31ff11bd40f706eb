// TCP endpoint
//
// One reader task and one writer task per connection, started selectively
// with `start`. The reader blocks on the service inbound queue on purpose:
// a slow dispatcher throttles fast peers. The writer drains the bounded
// outbound queue and best-effort flushes whatever is still enqueued when
// the connection goes down.

use super::{publish_event, Endpoint, EventSender, NUM_ENDPOINT_STATS, STAT_BYTES_RECV, STAT_BYTES_SENT, STAT_PACKETS_RECV, STAT_PACKETS_SENT};
use crate::codec::{BlockCryptor, FrameCodec};
use crate::error::{NetError, Result};
use crate::packet::{MessageEndpoint, NodeId, Packet};
use crate::runtime::Stats;
use bytes::BytesMut;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Construction knobs shared by TCP and WebSocket endpoints.
#[derive(Clone, Copy, Debug)]
pub struct EndpointOptions {
    pub codec: FrameCodec,
    pub outbound_capacity: usize,
    pub read_timeout: Duration,
}

impl Default for EndpointOptions {
    fn default() -> Self {
        Self {
            codec: FrameCodec::Server,
            outbound_capacity: 1000,
            read_timeout: Duration::from_secs(100),
        }
    }
}

pub struct TcpEndpoint {
    me: Weak<TcpEndpoint>,
    node: AtomicU32,
    addr: String,
    codec: FrameCodec,
    read_timeout: Duration,
    closing: AtomicBool,
    inbound: Option<mpsc::Sender<Packet>>,
    outbound_tx: mpsc::Sender<Packet>,
    outbound_rx: Mutex<Option<mpsc::Receiver<Packet>>>,
    read_half: Mutex<Option<OwnedReadHalf>>,
    write_half: Mutex<Option<OwnedWriteHalf>>,
    events: Option<EventSender>,
    stats: Arc<Stats>,
    encryptor: RwLock<Option<Arc<dyn BlockCryptor>>>,
    decryptor: RwLock<Option<Arc<dyn BlockCryptor>>>,
    done_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    user_data: RwLock<Option<Arc<dyn Any + Send + Sync>>>,
}

impl TcpEndpoint {
    pub fn new(
        node: NodeId,
        stream: TcpStream,
        opts: EndpointOptions,
        inbound: Option<mpsc::Sender<Packet>>,
        events: Option<EventSender>,
        stats: Option<Arc<Stats>>,
    ) -> Arc<Self> {
        let addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let (read_half, write_half) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::channel(opts.outbound_capacity.max(1));
        let (done_tx, _) = watch::channel(false);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            node: AtomicU32::new(node.0),
            addr,
            codec: opts.codec,
            read_timeout: opts.read_timeout,
            closing: AtomicBool::new(false),
            inbound,
            outbound_tx,
            outbound_rx: Mutex::new(Some(outbound_rx)),
            read_half: Mutex::new(Some(read_half)),
            write_half: Mutex::new(Some(write_half)),
            events,
            stats: stats.unwrap_or_else(|| Arc::new(Stats::new(NUM_ENDPOINT_STATS))),
            encryptor: RwLock::new(None),
            decryptor: RwLock::new(None),
            done_tx,
            tasks: Mutex::new(Vec::new()),
            user_data: RwLock::new(None),
        })
    }

    /// Install wire encryption for this connection.
    pub fn set_encryption(
        &self,
        encryptor: Option<Arc<dyn BlockCryptor>>,
        decryptor: Option<Arc<dyn BlockCryptor>>,
    ) {
        *self.encryptor.write() = encryptor;
        *self.decryptor.write() = decryptor;
    }

    /// Hand the read half to a caller that runs its own read loop (the
    /// gateway does this for client sessions and backend links).
    pub fn take_read_half(&self) -> Option<OwnedReadHalf> {
        self.read_half.lock().take()
    }

    fn arc(&self) -> Option<Arc<TcpEndpoint>> {
        self.me.upgrade()
    }

    async fn write_packet(
        &self,
        writer: &mut OwnedWriteHalf,
        pkt: &mut Packet,
    ) -> Result<()> {
        let encryptor = self.encryptor.read().clone();
        let mut buf = BytesMut::new();
        let n = match self.codec.encode(pkt, &mut buf, encryptor.as_deref()) {
            Ok(n) => n,
            Err(err) => {
                tracing::error!("encode message {}: {}", pkt.command, err);
                return Err(err);
            }
        };
        if let Err(err) = writer.write_all(&buf).await {
            tracing::error!("write message {}: {}", pkt.command, err);
            return Err(err.into());
        }
        self.stats.add(STAT_PACKETS_SENT, 1);
        self.stats.add(STAT_BYTES_SENT, n as i64);
        Ok(())
    }

    async fn write_pump(self: Arc<Self>, mut rx: mpsc::Receiver<Packet>, mut writer: OwnedWriteHalf) {
        tracing::debug!("node {} writer started at {}", self.node(), self.addr);
        let mut done = self.done_tx.subscribe();
        loop {
            tokio::select! {
                pkt = rx.recv() => match pkt {
                    Some(mut pkt) => {
                        let _ = self.write_packet(&mut writer, &mut pkt).await;
                    }
                    None => break,
                },
                _ = done.changed() => break,
            }
        }
        // Best-effort flush of whatever is still enqueued.
        rx.close();
        while let Ok(mut pkt) = rx.try_recv() {
            if self.write_packet(&mut writer, &mut pkt).await.is_err() {
                break;
            }
        }
        let _ = writer.shutdown().await;
        tracing::debug!("node {} writer stopped", self.node());
    }

    async fn read_pump(self: Arc<Self>, mut reader: OwnedReadHalf, inbound: mpsc::Sender<Packet>) {
        tracing::debug!("node {} reader started at {}", self.node(), self.addr);
        let mut done = self.done_tx.subscribe();
        loop {
            let decrypted = self.decryptor.read().clone();
            tokio::select! {
                res = tokio::time::timeout(
                    self.read_timeout,
                    self.codec.decode(&mut reader, decrypted.as_deref()),
                ) => {
                    let err = match res {
                        Ok(Ok((mut pkt, nbytes))) => {
                            self.stats.add(STAT_PACKETS_RECV, 1);
                            self.stats.add(STAT_BYTES_RECV, nbytes as i64);
                            if let Some(me) = self.arc() {
                                pkt.endpoint = Some(me as Arc<dyn MessageEndpoint>);
                            }
                            // Blocking on purpose: inbound backpressure.
                            if inbound.send(pkt).await.is_err() {
                                break;
                            }
                            continue;
                        }
                        Ok(Err(err)) => err,
                        Err(_) => NetError::Timeout(format!("read from node {}", self.node())),
                    };
                    match &err {
                        NetError::Io(io) if io.kind() == ErrorKind::UnexpectedEof => {
                            tracing::debug!("node {} reached EOF", self.node());
                        }
                        other => {
                            tracing::error!("read message from node {}: {}", self.node(), other);
                        }
                    }
                    self.force_close(err);
                    return;
                }
                _ = done.changed() => break,
            }
        }
        tracing::debug!("node {} reader stopped", self.node());
    }

    async fn finalize(&self, err: NetError) {
        let _ = self.done_tx.send(true);
        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        // Release the halves of a connection whose pumps never started.
        drop(self.read_half.lock().take());
        let writer = self.write_half.lock().take();
        if let Some(mut writer) = writer {
            let _ = writer.shutdown().await;
        }
        if let Some(me) = self.arc() {
            publish_event(&self.events, err, me as Arc<dyn Endpoint>);
        }
    }
}

impl MessageEndpoint for TcpEndpoint {
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
                    "message {} to node {} dropped: outbound queue overflow",
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
impl Endpoint for TcpEndpoint {
    fn set_node(&self, node: NodeId) {
        self.node.store(node.0, Ordering::Relaxed);
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    fn start(&self, write: bool, read: bool) {
        let me = match self.arc() {
            Some(me) => me,
            None => return,
        };
        let mut tasks = self.tasks.lock();
        if write {
            let rx = self.outbound_rx.lock().take();
            let writer = self.write_half.lock().take();
            match (rx, writer) {
                (Some(rx), Some(writer)) => {
                    tasks.push(tokio::spawn(Arc::clone(&me).write_pump(rx, writer)));
                }
                _ => tracing::error!("node {} writer already started", self.node()),
            }
        }
        if read {
            let reader = self.read_half.lock().take();
            match (reader, self.inbound.clone()) {
                (Some(reader), Some(inbound)) => {
                    tasks.push(tokio::spawn(Arc::clone(&me).read_pump(reader, inbound)));
                }
                (None, _) => tracing::error!("node {} reader already started", self.node()),
                (_, None) => tracing::error!("node {} has no inbound queue", self.node()),
            }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Body;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn packets_travel_between_endpoints() {
        let (client, server) = pair().await;
        let (inbound_tx, mut inbound_rx) = mpsc::channel(16);

        let sender = TcpEndpoint::new(
            NodeId::backend(1, 1),
            client,
            EndpointOptions::default(),
            None,
            None,
            None,
        );
        sender.start(true, false);

        let receiver = TcpEndpoint::new(
            NodeId::backend(1, 2),
            server,
            EndpointOptions::default(),
            Some(inbound_tx),
            None,
            None,
        );
        receiver.start(false, true);

        let pkt = Packet::new(NodeId::ZERO, 77, 0, 3, Body::from("payload"));
        sender.send_packet(pkt).unwrap();

        let got = tokio::time::timeout(Duration::from_secs(2), inbound_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.command, 77);
        assert_eq!(got.seq, 3);
        assert!(matches!(got.body, Body::Bytes(ref b) if b.as_ref() == b"payload"));
        assert!(got.endpoint.is_some());
        assert_eq!(receiver.stats().get(STAT_PACKETS_RECV), 1);

        sender.close().await;
        receiver.close().await;
    }

    #[tokio::test]
    async fn overflow_is_bounded_and_exact() {
        let (client, _server) = pair().await;
        let opts = EndpointOptions {
            outbound_capacity: 4,
            ..Default::default()
        };
        // Writer never started: the queue fills and stays full.
        let ep = TcpEndpoint::new(NodeId::backend(1, 1), client, opts, None, None, None);

        let mut ok = 0;
        let mut overflow = 0;
        for i in 0..5 {
            match ep.send_packet(Packet::with_command(i)) {
                Ok(()) => ok += 1,
                Err(NetError::ConnOutboundOverflow) => overflow += 1,
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(ok, 4);
        assert_eq!(overflow, 1);
        ep.close().await;
    }

    #[tokio::test]
    async fn close_publishes_exactly_one_event() {
        let (client, _server) = pair().await;
        let (events_tx, mut events_rx) = mpsc::channel(4);
        let ep = TcpEndpoint::new(
            NodeId::backend(2, 1),
            client,
            EndpointOptions::default(),
            None,
            Some(events_tx),
            None,
        );
        ep.start(true, false);

        ep.close().await;
        ep.close().await; // loser of the CAS is a no-op
        ep.force_close(NetError::ConnForceClose);

        let event = events_rx.recv().await.unwrap();
        assert_eq!(event.endpoint.node(), NodeId::backend(2, 1));
        assert!(
            tokio::time::timeout(Duration::from_millis(100), events_rx.recv())
                .await
                .is_err(),
            "more than one event published"
        );

        let err = ep.send_packet(Packet::with_command(1)).unwrap_err();
        assert!(matches!(err, NetError::ConnIsClosing));
    }

    #[tokio::test]
    async fn peer_disconnect_force_closes_reader() {
        let (client, server) = pair().await;
        let (inbound_tx, _inbound_rx) = mpsc::channel(16);
        let (events_tx, mut events_rx) = mpsc::channel(4);
        let ep = TcpEndpoint::new(
            NodeId::backend(3, 1),
            server,
            EndpointOptions::default(),
            Some(inbound_tx),
            Some(events_tx),
            None,
        );
        ep.start(true, true);

        drop(client); // peer goes away, reader hits EOF

        let event = tokio::time::timeout(Duration::from_secs(2), events_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(event.endpoint.is_closing());
    }

    #[tokio::test]
    async fn queued_packets_flush_on_close() {
        let (client, server) = pair().await;
        let ep = TcpEndpoint::new(
            NodeId::backend(1, 1),
            client,
            EndpointOptions::default(),
            None,
            None,
            None,
        );
        // Queue before the writer starts, then start and close right away.
        ep.send_packet(Packet::new(NodeId::ZERO, 9, 0, 1, Body::from("bye"))).unwrap();
        ep.start(true, false);
        ep.close().await;

        let (mut rd, _wr) = server.into_split();
        let (pkt, _) = FrameCodec::Server.decode(&mut rd, None).await.unwrap();
        assert_eq!(pkt.command, 9);
    }
}
