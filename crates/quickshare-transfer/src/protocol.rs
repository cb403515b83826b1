/// Per-chunk TCP data stream format.
///
/// ```text
/// sender   → receiver  header   [0..4]   magic "QSCH"
///                               [4..8]   chunk index (u32 BE)
///                               [8..16]  byte offset (u64 BE)
///                               [16..24] byte length (u64 BE)
/// sender   → receiver  payload  `length` raw bytes, written in 64 KiB blocks
/// sender   → receiver  trailer  [0..4]   chunk index (u32 BE)
///                               [4..36]  SHA-256 of the payload
/// receiver → sender    verdict  1 byte: 0x01 OK, 0x02 RETRY, 0x03 REJECT
/// ```
///
/// One connection carries exactly one chunk attempt.

use std::io;

use bytes::{Buf, BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use quickshare_types::Chunk;

/// Block size for streaming a chunk's payload and for file hashing.
pub const BLOCK_SIZE: usize = 64 * 1024;

pub const MAGIC: &[u8; 4] = b"QSCH";

/// Header size in bytes.
pub const HEADER_LEN: usize = 24;

/// Trailer size in bytes.
pub const TRAILER_LEN: usize = 36;

/// Receiver's answer to one chunk attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Verdict {
    /// Hash matched, bytes are on disk.
    Ok = 0x01,
    /// Hash mismatch; send the chunk again.
    Retry = 0x02,
    /// Header or trailer did not match the accepted offer.
    Reject = 0x03,
}

impl Verdict {
    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            0x01 => Some(Self::Ok),
            0x02 => Some(Self::Retry),
            0x03 => Some(Self::Reject),
            _ => None,
        }
    }
}

/// Encode a chunk header.
pub fn encode_header(chunk: &Chunk) -> [u8; HEADER_LEN] {
    let mut buf = BytesMut::with_capacity(HEADER_LEN);
    buf.put_slice(MAGIC);
    buf.put_u32(chunk.index);
    buf.put_u64(chunk.byte_offset);
    buf.put_u64(chunk.byte_length);
    let mut out = [0u8; HEADER_LEN];
    out.copy_from_slice(&buf);
    out
}

/// Decode a chunk header. Returns None on a bad magic.
pub fn decode_header(data: &[u8; HEADER_LEN]) -> Option<Chunk> {
    if &data[0..4] != MAGIC {
        return None;
    }
    let mut buf = &data[4..];
    Some(Chunk {
        index: buf.get_u32(),
        byte_offset: buf.get_u64(),
        byte_length: buf.get_u64(),
    })
}

pub fn encode_trailer(chunk_index: u32, sha256: &[u8; 32]) -> [u8; TRAILER_LEN] {
    let mut out = [0u8; TRAILER_LEN];
    out[0..4].copy_from_slice(&chunk_index.to_be_bytes());
    out[4..].copy_from_slice(sha256);
    out
}

pub fn decode_trailer(data: &[u8; TRAILER_LEN]) -> (u32, [u8; 32]) {
    let mut buf = &data[..];
    let index = buf.get_u32();
    let mut sha256 = [0u8; 32];
    buf.copy_to_slice(&mut sha256);
    (index, sha256)
}

pub async fn write_header<W: AsyncWrite + Unpin>(w: &mut W, chunk: &Chunk) -> io::Result<()> {
    w.write_all(&encode_header(chunk)).await
}

pub async fn read_header<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Chunk> {
    let mut buf = [0u8; HEADER_LEN];
    r.read_exact(&mut buf).await?;
    decode_header(&buf).ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "bad chunk header magic"))
}

pub async fn write_trailer<W: AsyncWrite + Unpin>(w: &mut W, chunk_index: u32, sha256: &[u8; 32]) -> io::Result<()> {
    w.write_all(&encode_trailer(chunk_index, sha256)).await?;
    w.flush().await
}

pub async fn read_trailer<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<(u32, [u8; 32])> {
    let mut buf = [0u8; TRAILER_LEN];
    r.read_exact(&mut buf).await?;
    Ok(decode_trailer(&buf))
}

pub async fn write_verdict<W: AsyncWrite + Unpin>(w: &mut W, verdict: Verdict) -> io::Result<()> {
    w.write_all(&[verdict as u8]).await?;
    w.flush().await
}

pub async fn read_verdict<R: AsyncRead + Unpin>(r: &mut R) -> io::Result<Verdict> {
    let b = r.read_u8().await?;
    Verdict::from_byte(b)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, format!("unknown verdict byte {b:#04x}")))
}
