use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::logging::{TracingLogger, TransferLogger};
use crate::sender::BlockTap;

/// Default chunk size: 1 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 1024 * 1024;

/// Parallel chunk workers on the sender.
pub const DEFAULT_MAX_WORKERS: usize = 4;

/// Data listeners a receiver binds per accepted offer.
pub const DEFAULT_DATA_STREAMS: usize = 4;

/// Sender-side tuning. Shared by every worker of a transfer.
#[derive(Clone)]
pub struct TransferConfig {
    pub max_workers: usize,
    /// Connection attempts per chunk connection and per control connection.
    pub connect_attempts: u32,
    /// First retry delay; doubles on every further attempt.
    pub connect_backoff: Duration,
    pub connect_timeout: Duration,
    /// Extra attempts for a single block on a transient I/O error.
    pub block_retries: u32,
    pub block_backoff: Duration,
    /// Chunk-level retries after the first attempt.
    pub max_chunk_retries: u32,
    /// Per read/write on the data path.
    pub io_timeout: Duration,
    /// Wait for the receiver's verdict after the trailer.
    pub verdict_timeout: Duration,
    /// Round trip of offer and decision.
    pub control_timeout: Duration,
    pub logger: Arc<dyn TransferLogger>,
    pub block_tap: Option<Arc<dyn BlockTap>>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_workers: DEFAULT_MAX_WORKERS,
            connect_attempts: 3,
            connect_backoff: Duration::from_millis(100),
            connect_timeout: Duration::from_secs(5),
            block_retries: 2,
            block_backoff: Duration::from_millis(20),
            max_chunk_retries: 3,
            io_timeout: Duration::from_secs(10),
            verdict_timeout: Duration::from_secs(30),
            control_timeout: Duration::from_secs(10),
            logger: Arc::new(TracingLogger),
            block_tap: None,
        }
    }
}

/// Receiver policy and tuning.
#[derive(Clone)]
pub struct ReceiverConfig {
    /// Directory completed files land in. Created on first offer.
    pub out_dir: PathBuf,
    /// Address data listeners bind (port 0, one per stream).
    pub bind_ip: IpAddr,
    pub data_streams: usize,
    /// Offers above this size are rejected.
    pub max_file_size: Option<u64>,
    /// Verification failures tolerated per chunk before the session fails.
    pub max_chunk_retries: u32,
    /// Session fails with `Stalled` after this long without chunk activity.
    pub idle_timeout: Duration,
    pub io_timeout: Duration,
    pub logger: Arc<dyn TransferLogger>,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            out_dir: PathBuf::from("received"),
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            data_streams: DEFAULT_DATA_STREAMS,
            max_file_size: None,
            max_chunk_retries: 3,
            idle_timeout: Duration::from_secs(30),
            io_timeout: Duration::from_secs(10),
            logger: Arc::new(TracingLogger),
        }
    }
}
