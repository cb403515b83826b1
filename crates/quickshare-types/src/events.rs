use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Where a transfer is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", content = "data", rename_all = "snake_case")]
pub enum ProgressPhase {
    /// Offer accepted, destination preallocated (receiver) or workers starting (sender).
    Started,
    /// Bytes are moving.
    Transferring,
    /// Every chunk verified; the receiver is hashing the whole file.
    Verifying,
    /// Receiver: the full-file hash matched. Sender: every chunk was acknowledged.
    Completed { file_sha256: String },
    /// Transfer aborted.
    Failed { reason: String },
}

impl ProgressPhase {
    /// True for `Completed` and `Failed`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }
}

/// Snapshot of a transfer's aggregate counters.
///
/// Emitted after every block and on every phase change. Consumers own
/// rendering, rate limiting and ETA computation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub transfer_id: Uuid,
    pub file_name: String,
    pub phase: ProgressPhase,
    pub chunks_done: u32,
    pub chunk_count: u32,
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub timestamp: DateTime<Utc>,
}

impl ProgressEvent {
    /// Progress as a fraction 0.0 - 1.0. An empty file counts as done.
    pub fn fraction(&self) -> f64 {
        if self.bytes_total == 0 {
            return if self.chunks_done >= self.chunk_count { 1.0 } else { 0.0 };
        }
        (self.bytes_done as f64 / self.bytes_total as f64).min(1.0)
    }
}
