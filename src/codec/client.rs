// Client framing: 16-byte header, bodies capped at 8 KiB inbound and
// 60 KiB outbound. No compression; phone clients decode on the main thread.

use super::{checksum, finish_body, prepare_payload, BlockCryptor};
use crate::error::{NetError, Result};
use crate::packet::Packet;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const CLIENT_HEADER_SIZE: usize = 16;
pub const MAX_CLIENT_RECV_SIZE: usize = 8 * 1024;
pub const MAX_CLIENT_SEND_SIZE: usize = 60 * 1024;

pub(super) fn encode(
    pkt: &mut Packet,
    out: &mut BytesMut,
    encryptor: Option<&dyn BlockCryptor>,
) -> Result<usize> {
    let payload = prepare_payload(pkt, None, encryptor)?;
    if payload.len() > MAX_CLIENT_SEND_SIZE {
        return Err(NetError::PayloadOverflow {
            command: pkt.command,
            size: payload.len(),
            limit: MAX_CLIENT_SEND_SIZE,
        });
    }

    let mut head = [0u8; CLIENT_HEADER_SIZE];
    head[0..2].copy_from_slice(&(payload.len() as u16).to_le_bytes());
    head[2..4].copy_from_slice(&pkt.flag.to_le_bytes());
    head[4..8].copy_from_slice(&pkt.seq.to_le_bytes());
    head[8..12].copy_from_slice(&pkt.command.to_le_bytes());
    let crc = checksum(&head[..CLIENT_HEADER_SIZE - 4], &payload);
    head[12..16].copy_from_slice(&crc.to_le_bytes());

    out.extend_from_slice(&head);
    out.extend_from_slice(&payload);
    Ok(CLIENT_HEADER_SIZE + payload.len())
}

pub(super) async fn decode<R: AsyncRead + Unpin>(
    r: &mut R,
    decryptor: Option<&dyn BlockCryptor>,
) -> Result<(Packet, usize)> {
    let mut head = [0u8; CLIENT_HEADER_SIZE];
    r.read_exact(&mut head).await?;

    let body_len = u16::from_le_bytes([head[0], head[1]]) as usize;
    let mut pkt = Packet::default();
    pkt.flag = u16::from_le_bytes([head[2], head[3]]);
    pkt.seq = u32::from_le_bytes([head[4], head[5], head[6], head[7]]);
    pkt.command = u32::from_le_bytes([head[8], head[9], head[10], head[11]]);
    let expect = u32::from_le_bytes([head[12], head[13], head[14], head[15]]);

    if body_len > MAX_CLIENT_RECV_SIZE {
        return Err(NetError::PayloadOverflow {
            command: pkt.command,
            size: body_len,
            limit: MAX_CLIENT_RECV_SIZE,
        });
    }

    if body_len == 0 {
        let actual = checksum(&head[..CLIENT_HEADER_SIZE - 4], &[]);
        if actual != expect {
            return Err(NetError::ChecksumMismatch {
                command: pkt.command,
                expect,
                actual,
            });
        }
        return Ok((pkt, CLIENT_HEADER_SIZE));
    }

    let mut payload = vec![0u8; body_len];
    r.read_exact(&mut payload).await?;
    let actual = checksum(&head[..CLIENT_HEADER_SIZE - 4], &payload);
    if actual != expect {
        return Err(NetError::ChecksumMismatch {
            command: pkt.command,
            expect,
            actual,
        });
    }
    finish_body(&mut pkt, payload.into(), decryptor)?;
    Ok((pkt, CLIENT_HEADER_SIZE + body_len))
}
