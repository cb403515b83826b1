use std::fmt;
use std::net::SocketAddr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A node seen on the local network.
///
/// `address` is the socket the node's control channel listens on: the source
/// IP of its announcement combined with the advertised control port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub id: Uuid,
    pub name: String,
    pub address: SocketAddr,
    pub control_port: u16,
    pub last_seen: DateTime<Utc>,
}

impl Peer {
    /// Control-channel endpoint for this peer.
    pub fn control_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address.ip(), self.control_port)
    }
}

/// A contiguous byte range of the file, transferred independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Chunk {
    pub index: u32,
    pub byte_offset: u64,
    pub byte_length: u64,
}

impl Chunk {
    /// One past the last byte of this chunk.
    #[inline]
    pub fn end(&self) -> u64 {
        self.byte_offset + self.byte_length
    }
}

/// Why a chunk attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkErrorKind {
    /// Every connection attempt to the data endpoint failed.
    ConnectionFailed,
    /// Read/write failure after block-level retries.
    Io,
    /// The receiver's hash did not match the trailer.
    Integrity,
    /// The peer answered with something outside the data protocol.
    ProtocolViolation,
    /// No verdict arrived in time.
    Timeout,
}

impl fmt::Display for ChunkErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ConnectionFailed => "connection_failed",
            Self::Io => "io",
            Self::Integrity => "integrity",
            Self::ProtocolViolation => "protocol_violation",
            Self::Timeout => "timeout",
        };
        f.write_str(s)
    }
}

/// Outcome of one attempt at moving one chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkResult {
    pub index: u32,
    /// 1-based attempt number this result belongs to.
    pub attempt: u32,
    pub bytes_written: u64,
    /// Hex SHA-256 of the bytes read for this attempt (empty if none were).
    pub sha256: String,
    pub success: bool,
    pub error_kind: Option<ChunkErrorKind>,
    pub error: Option<String>,
}

impl ChunkResult {
    pub fn ok(index: u32, attempt: u32, bytes_written: u64, sha256: String) -> Self {
        Self {
            index,
            attempt,
            bytes_written,
            sha256,
            success: true,
            error_kind: None,
            error: None,
        }
    }

    pub fn failed(
        index: u32,
        attempt: u32,
        bytes_written: u64,
        kind: ChunkErrorKind,
        error: impl Into<String>,
    ) -> Self {
        Self {
            index,
            attempt,
            bytes_written,
            sha256: String::new(),
            success: false,
            error_kind: Some(kind),
            error: Some(error.into()),
        }
    }
}
