/// QuickShare transfer engine: parallel chunked file transfer over TCP.
///
/// Provides:
/// - A control channel negotiating one offer per connection
/// - A bounded pool of chunk workers, one TCP connection per chunk attempt
/// - Per-chunk SHA-256 verdicts with chunk-level retry
/// - Full-file SHA-256 verification after every chunk landed
/// - Preallocated destinations written at disjoint offsets

pub mod chunk;
pub mod config;
pub mod control;
pub mod error;
pub mod fileutils;
pub mod logging;
pub mod net;
pub mod progress;
pub mod protocol;
pub mod receiver;
pub mod sender;

// Re-export key types for convenience.
pub use chunk::{ChunkLedger, MAX_CHUNK_COUNT, MIN_CHUNK_SIZE, checked_chunk_count, chunk_count, partition};
pub use config::{DEFAULT_CHUNK_SIZE, DEFAULT_DATA_STREAMS, DEFAULT_MAX_WORKERS, ReceiverConfig, TransferConfig};
pub use control::{read_message, send_offer, serve, write_message};
pub use error::{ControlError, FileError, TransferError};
pub use logging::{NullLogger, TracingLogger, TransferEvent, TransferLog, TransferLogger};
pub use progress::{ProgressReceiver, ProgressSink, TransferProgress};
pub use protocol::{BLOCK_SIZE, Verdict};
pub use receiver::{check_offer, serve_recv};
pub use sender::{BlockTap, SendJob, SendReport, prepare_offer, run_sender};
