// Server framing: 18-byte header, bodies up to 8 MiB, with deflate applied
// above the compression threshold.

use super::{checksum, finish_body, prepare_payload, BlockCryptor, COMPRESS_THRESHOLD};
use crate::error::{NetError, Result};
use crate::packet::Packet;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const SERVER_HEADER_SIZE: usize = 18;
pub const MAX_SERVER_PAYLOAD_SIZE: usize = 8 * 1024 * 1024;

pub(super) fn encode(
    pkt: &mut Packet,
    out: &mut BytesMut,
    encryptor: Option<&dyn BlockCryptor>,
) -> Result<usize> {
    let payload = prepare_payload(pkt, Some(COMPRESS_THRESHOLD), encryptor)?;
    if payload.len() >= MAX_SERVER_PAYLOAD_SIZE {
        return Err(NetError::PayloadOverflow {
            command: pkt.command,
            size: payload.len(),
            limit: MAX_SERVER_PAYLOAD_SIZE,
        });
    }

    let mut head = [0u8; SERVER_HEADER_SIZE];
    head[0..4].copy_from_slice(&(payload.len() as u32).to_le_bytes());
    head[4..6].copy_from_slice(&pkt.flag.to_le_bytes());
    head[6..10].copy_from_slice(&pkt.seq.to_le_bytes());
    head[10..14].copy_from_slice(&pkt.command.to_le_bytes());
    let crc = checksum(&head[..SERVER_HEADER_SIZE - 4], &payload);
    head[14..18].copy_from_slice(&crc.to_le_bytes());

    out.extend_from_slice(&head);
    out.extend_from_slice(&payload);
    Ok(SERVER_HEADER_SIZE + payload.len())
}

pub(super) async fn decode<R: AsyncRead + Unpin>(
    r: &mut R,
    decryptor: Option<&dyn BlockCryptor>,
) -> Result<(Packet, usize)> {
    let mut head = [0u8; SERVER_HEADER_SIZE];
    r.read_exact(&mut head).await?;

    let body_len = u32::from_le_bytes([head[0], head[1], head[2], head[3]]) as usize;
    let mut pkt = Packet::default();
    pkt.flag = u16::from_le_bytes([head[4], head[5]]);
    pkt.seq = u32::from_le_bytes([head[6], head[7], head[8], head[9]]);
    pkt.command = u32::from_le_bytes([head[10], head[11], head[12], head[13]]);
    let expect = u32::from_le_bytes([head[14], head[15], head[16], head[17]]);

    if body_len > MAX_SERVER_PAYLOAD_SIZE {
        return Err(NetError::PayloadOverflow {
            command: pkt.command,
            size: body_len,
            limit: MAX_SERVER_PAYLOAD_SIZE,
        });
    }

    if body_len == 0 {
        let actual = checksum(&head[..SERVER_HEADER_SIZE - 4], &[]);
        if actual != expect {
            return Err(NetError::ChecksumMismatch {
                command: pkt.command,
                expect,
                actual,
            });
        }
        return Ok((pkt, SERVER_HEADER_SIZE));
    }

    let mut payload = vec![0u8; body_len];
    r.read_exact(&mut payload).await?;
    let actual = checksum(&head[..SERVER_HEADER_SIZE - 4], &payload);
    if actual != expect {
        return Err(NetError::ChecksumMismatch {
            command: pkt.command,
            expect,
            actual,
        });
    }
    finish_body(&mut pkt, payload.into(), decryptor)?;
    Ok((pkt, SERVER_HEADER_SIZE + body_len))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{Body, NodeId, PACKET_FLAG_COMPRESSED};
    use crate::protocol::{RegisterReq, WireMessage};
    use std::sync::Arc;

    fn encode_to_vec(pkt: &mut Packet) -> Vec<u8> {
        let mut out = BytesMut::new();
        encode(pkt, &mut out, None).unwrap();
        out.to_vec()
    }

    #[tokio::test]
    async fn round_trip_message_body() {
        let req = RegisterReq {
            node: 0x0005_0001,
            access_token: "deadbeef".into(),
        };
        let raw = req.encode().unwrap();
        let mut pkt = Packet::new(
            NodeId::ZERO,
            crate::protocol::MSG_REGISTER_REQ,
            0,
            1,
            Body::Message(Arc::new(req.clone())),
        );
        let wire = encode_to_vec(&mut pkt);
        assert!(pkt.body.is_empty()); // consumed by encode

        let (mut back, n) = decode(&mut &wire[..], None).await.unwrap();
        assert_eq!(n, SERVER_HEADER_SIZE + raw.len());
        let decoded: RegisterReq = back.decode_msg().unwrap();
        assert_eq!(decoded, req);
    }

    #[tokio::test]
    async fn large_body_is_compressed_on_the_wire() {
        let body = vec![7u8; COMPRESS_THRESHOLD * 4];
        let mut pkt = Packet::new(NodeId::ZERO, 900, 0, 5, Body::from(body.clone()));
        let wire = encode_to_vec(&mut pkt);
        assert!(pkt.flag & PACKET_FLAG_COMPRESSED != 0);
        assert!(wire.len() < body.len() / 2, "compression had no effect");

        let (back, _) = decode(&mut &wire[..], None).await.unwrap();
        assert_eq!(back.flag & PACKET_FLAG_COMPRESSED, 0);
        assert!(matches!(back.body, Body::Bytes(ref b) if b.as_ref() == &body[..]));
    }

    #[tokio::test]
    async fn tamper_is_rejected() {
        let mut pkt = Packet::new(NodeId::ZERO, 13, 0, 2, Body::from("peers"));
        let mut wire = encode_to_vec(&mut pkt);
        wire[SERVER_HEADER_SIZE] ^= 0x01;
        let err = decode(&mut &wire[..], None).await.unwrap_err();
        assert!(matches!(err, NetError::ChecksumMismatch { .. }));
    }

    #[tokio::test]
    async fn declared_overflow_is_rejected() {
        let mut head = [0u8; SERVER_HEADER_SIZE];
        head[0..4].copy_from_slice(&((MAX_SERVER_PAYLOAD_SIZE as u32) + 1).to_le_bytes());
        let err = decode(&mut &head[..], None).await.unwrap_err();
        assert!(matches!(err, NetError::PayloadOverflow { .. }));
    }

    #[tokio::test]
    async fn truncated_stream_is_an_io_error() {
        let mut pkt = Packet::new(NodeId::ZERO, 13, 0, 2, Body::from("peers"));
        let wire = encode_to_vec(&mut pkt);
        let err = decode(&mut &wire[..wire.len() - 2], None).await.unwrap_err();
        assert!(matches!(err, NetError::Io(_)));
    }
}
