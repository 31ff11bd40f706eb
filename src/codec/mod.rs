// Protocol codec family
//
// Two length-prefixed framings share one CRC and body pipeline. The client
// framing keeps a 16-byte header and tight body limits because it faces the
// public internet; the server framing spends two more header bytes to move
// bodies up to 8 MiB between peers.
//
//  client header                      server header
//  --------------------------------   --------------------------------
//  | len | flag | seq | cmd | crc |   | len | flag | seq | cmd | crc |
//  |  2  |  2   |  4  |  4  |  4  |   |  4  |  2   |  4  |  4  |  4  |
//  --------------------------------   --------------------------------
//
// All integers little-endian; CRC32 (IEEE) covers the header minus its own
// four bytes, followed by the body exactly as it appears on the wire.

pub mod client;
pub mod compress;
pub mod server;

use crate::error::{NetError, Result};
use crate::packet::{Body, Packet, PACKET_FLAG_COMPRESSED, PACKET_FLAG_ENCRYPTED, PACKET_FLAG_ERROR};
use bytes::{Bytes, BytesMut};
use tokio::io::AsyncRead;

pub use client::{CLIENT_HEADER_SIZE, MAX_CLIENT_RECV_SIZE, MAX_CLIENT_SEND_SIZE};
pub use server::{MAX_SERVER_PAYLOAD_SIZE, SERVER_HEADER_SIZE};

/// Bodies above this size are deflated on the server framing.
pub const COMPRESS_THRESHOLD: usize = 4 * 1024;

/// Block cipher hook. Concrete ciphers live outside the runtime core; the
/// codec only needs the two directions.
pub trait BlockCryptor: Send + Sync {
    fn encrypt(&self, data: &[u8]) -> Vec<u8>;
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameCodec {
    Client,
    Server,
}

impl FrameCodec {
    pub fn header_size(&self) -> usize {
        match self {
            FrameCodec::Client => CLIENT_HEADER_SIZE,
            FrameCodec::Server => SERVER_HEADER_SIZE,
        }
    }

    /// Serialize `pkt` into `out`; returns the number of bytes written.
    /// The packet body is consumed.
    pub fn encode(
        &self,
        pkt: &mut Packet,
        out: &mut BytesMut,
        encryptor: Option<&dyn BlockCryptor>,
    ) -> Result<usize> {
        match self {
            FrameCodec::Client => client::encode(pkt, out, encryptor),
            FrameCodec::Server => server::encode(pkt, out, encryptor),
        }
    }

    /// Read one packet off `r`; returns the packet and the bytes consumed.
    pub async fn decode<R: AsyncRead + Unpin>(
        &self,
        r: &mut R,
        decryptor: Option<&dyn BlockCryptor>,
    ) -> Result<(Packet, usize)> {
        match self {
            FrameCodec::Client => client::decode(r, decryptor).await,
            FrameCodec::Server => server::decode(r, decryptor).await,
        }
    }
}

/// Serialize, optionally compress, optionally encrypt. Flag bits follow the
/// transformations actually applied.
pub(crate) fn prepare_payload(
    pkt: &mut Packet,
    compress_threshold: Option<usize>,
    encryptor: Option<&dyn BlockCryptor>,
) -> Result<Bytes> {
    let mut payload = pkt.encode_body()?;
    if let Some(threshold) = compress_threshold {
        if payload.len() > threshold {
            payload = Bytes::from(compress::compress_bytes(&payload)?);
            pkt.flag |= PACKET_FLAG_COMPRESSED;
        }
    }
    if let Some(cryptor) = encryptor {
        if !payload.is_empty() {
            payload = Bytes::from(cryptor.encrypt(&payload));
            pkt.flag |= PACKET_FLAG_ENCRYPTED;
        }
    }
    Ok(payload)
}

/// Undo the wire transformations and attach the body to the packet.
pub(crate) fn finish_body(
    pkt: &mut Packet,
    payload: Bytes,
    decryptor: Option<&dyn BlockCryptor>,
) -> Result<()> {
    let mut payload = payload;
    if pkt.flag & PACKET_FLAG_ENCRYPTED != 0 {
        let cryptor = decryptor.ok_or(NetError::MissingDecryptor(pkt.command))?;
        payload = Bytes::from(cryptor.decrypt(&payload)?);
        pkt.flag &= !PACKET_FLAG_ENCRYPTED;
    }
    if pkt.flag & PACKET_FLAG_COMPRESSED != 0 {
        payload = Bytes::from(compress::decompress_bytes(&payload)?);
        pkt.flag &= !PACKET_FLAG_COMPRESSED;
    }
    if pkt.flag & PACKET_FLAG_ERROR != 0 && payload.len() >= 4 {
        let ec = u32::from_le_bytes([payload[0], payload[1], payload[2], payload[3]]);
        pkt.body = Body::Errno(ec);
    } else {
        pkt.body = Body::from(payload);
    }
    Ok(())
}

pub(crate) fn checksum(header_prefix: &[u8], payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(header_prefix);
    if !payload.is_empty() {
        hasher.update(payload);
    }
    hasher.finalize()
}
