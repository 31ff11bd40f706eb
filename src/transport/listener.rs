// TCP listen/dial helpers and deadline-bounded single-packet handshakes.
//
// Registration runs on a raw stream before any endpoint pumps exist: read
// one request, answer it, and only then wrap the stream in an endpoint.

use crate::codec::FrameCodec;
use crate::error::{NetError, Result};
use crate::packet::Packet;
use crate::protocol::WireMessage;
use bytes::BytesMut;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};

/// Dial timeout toward a declared dependency.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(7);
/// How long a registration request may take to arrive.
pub const HANDSHAKE_READ_TIMEOUT: Duration = Duration::from_secs(60);

pub async fn listen_tcp(addr: &str) -> Result<TcpListener> {
    Ok(TcpListener::bind(addr).await?)
}

pub async fn dial_tcp(addr: &str, timeout: Duration) -> Result<TcpStream> {
    let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
        .await
        .map_err(|_| NetError::Timeout(format!("dial {addr}")))??;
    configure_socket(&stream)?;
    Ok(stream)
}

/// TCP_NODELAY plus keepalive on peer links.
pub fn configure_socket(stream: &TcpStream) -> Result<()> {
    stream.set_nodelay(true)?;
    let sock = socket2::SockRef::from(stream);
    let keepalive = socket2::TcpKeepalive::new()
        .with_time(Duration::from_secs(60))
        .with_interval(Duration::from_secs(60));
    sock.set_tcp_keepalive(&keepalive)?;
    Ok(())
}

/// Read one packet off a raw stream with a deadline.
pub async fn read_packet_from(
    stream: &mut TcpStream,
    codec: FrameCodec,
    timeout: Duration,
) -> Result<Packet> {
    let (pkt, _) = tokio::time::timeout(timeout, codec.decode(stream, None))
        .await
        .map_err(|_| NetError::Timeout("handshake read".to_string()))??;
    Ok(pkt)
}

/// Read one packet and interpret its body; an errno-flagged packet becomes
/// an error.
pub async fn read_proto_message<M>(
    stream: &mut TcpStream,
    codec: FrameCodec,
    timeout: Duration,
) -> Result<(Packet, M)>
where
    M: serde::de::DeserializeOwned + Default,
{
    let mut pkt = read_packet_from(stream, codec, timeout).await?;
    let errno = pkt.errno();
    if errno > 0 {
        return Err(NetError::Errno {
            command: pkt.command,
            errno,
        });
    }
    let msg = pkt.decode_msg()?;
    Ok((pkt, msg))
}

/// Encode and write one packet on a raw stream.
pub async fn send_packet_to(
    stream: &mut TcpStream,
    codec: FrameCodec,
    mut pkt: Packet,
) -> Result<()> {
    let mut buf = BytesMut::new();
    codec.encode(&mut pkt, &mut buf, None)?;
    stream.write_all(&buf).await?;
    Ok(())
}

/// Send a request message and wait for its typed response.
pub async fn request_message<M>(
    stream: &mut TcpStream,
    codec: FrameCodec,
    request: Packet,
    timeout: Duration,
) -> Result<(Packet, M)>
where
    M: serde::de::DeserializeOwned + Default,
{
    send_packet_to(stream, codec, request).await?;
    read_proto_message(stream, codec, timeout).await
}

/// Build a request packet around a typed message.
pub fn proto_packet<M: WireMessage + 'static>(node: crate::packet::NodeId, msg: M) -> Packet {
    let command = msg.command();
    Packet::new(
        node,
        command,
        0,
        0,
        crate::packet::Body::Message(std::sync::Arc::new(msg)),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::NodeId;
    use crate::protocol::{KeepAliveAck, KeepAliveReq, MSG_KEEP_ALIVE_ACK};

    #[tokio::test]
    async fn handshake_round_trip_over_tcp() {
        let listener = listen_tcp("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (pkt, req): (Packet, KeepAliveReq) =
                read_proto_message(&mut stream, FrameCodec::Server, Duration::from_secs(2))
                    .await
                    .unwrap();
            assert_eq!(req.time, 1234);
            let mut ack = proto_packet(NodeId::backend(1, 1), KeepAliveAck { time: 5678 });
            ack.seq = pkt.seq;
            send_packet_to(&mut stream, FrameCodec::Server, ack)
                .await
                .unwrap();
        });

        let mut client = dial_tcp(&addr.to_string(), DIAL_TIMEOUT).await.unwrap();
        let mut req = proto_packet(NodeId::ZERO, KeepAliveReq { time: 1234 });
        req.seq = 42;
        let (pkt, ack): (Packet, KeepAliveAck) =
            request_message(&mut client, FrameCodec::Server, req, Duration::from_secs(2))
                .await
                .unwrap();
        assert_eq!(pkt.command, MSG_KEEP_ALIVE_ACK);
        assert_eq!(pkt.seq, 42);
        assert_eq!(ack.time, 5678);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn errno_reply_surfaces_as_error() {
        let listener = listen_tcp("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let _ = read_packet_from(&mut stream, FrameCodec::Server, Duration::from_secs(2)).await;
            let mut refuse = Packet::with_command(15);
            refuse.set_errno(202);
            let _ = send_packet_to(&mut stream, FrameCodec::Server, refuse).await;
        });

        let mut client = dial_tcp(&addr.to_string(), DIAL_TIMEOUT).await.unwrap();
        let req = proto_packet(NodeId::ZERO, KeepAliveReq { time: 0 });
        let err = request_message::<KeepAliveAck>(
            &mut client,
            FrameCodec::Server,
            req,
            Duration::from_secs(2),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, NetError::Errno { errno: 202, .. }));
    }
}
