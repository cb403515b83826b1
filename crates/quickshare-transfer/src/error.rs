use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use quickshare_types::ChunkErrorKind;

#[derive(Debug, Error)]
pub enum FileError {
    #[error("insufficient space for {path}: need {needed} bytes, {available} available")]
    InsufficientSpace {
        path: PathBuf,
        needed: u64,
        available: u64,
    },
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl FileError {
    pub(crate) fn io(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }
}

#[derive(Debug, Error)]
pub enum ControlError {
    #[error("cannot connect to {addr} after {attempts} attempts: {source}")]
    ConnectionFailed {
        addr: SocketAddr,
        attempts: u32,
        #[source]
        source: io::Error,
    },
    #[error("control channel timed out after {0:?}")]
    Timeout(Duration),
    #[error("offer rejected: {0}")]
    Rejected(String),
    #[error("control protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("control channel I/O: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("chunk {index} failed verification: expected {expected}, got {actual}")]
    ChunkIntegrity {
        index: u32,
        expected: String,
        actual: String,
    },
    #[error("chunk {index} failed after {attempts} attempts ({cause}): {message}")]
    ChunkRetriesExhausted {
        index: u32,
        attempts: u32,
        cause: ChunkErrorKind,
        message: String,
    },
    #[error("file hash mismatch after transfer: expected {expected}, got {actual}")]
    FinalizationIntegrity { expected: String, actual: String },
    #[error("no chunk activity for {0:?}")]
    Stalled(Duration),
    #[error("transfer cancelled")]
    Cancelled,
    #[error("invalid partition: {0}")]
    InvalidPartition(String),
    #[error(transparent)]
    File(#[from] FileError),
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error("transfer I/O: {0}")]
    Io(#[from] io::Error),
}
