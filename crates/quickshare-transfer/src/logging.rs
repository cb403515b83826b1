/// Structured transfer logging.
///
/// Sender and receiver report lifecycle and per-chunk events through a
/// [`TransferLogger`] so embedders can route them somewhere other than
/// `tracing` or silence them in tests.

use std::fmt;

use uuid::Uuid;

/// Structured log entry for a transfer operation.
#[derive(Debug, Clone)]
pub struct TransferLog {
    pub component: &'static str,
    pub transfer_id: Uuid,
    pub event: TransferEvent,
}

/// Transfer events that can be logged.
#[derive(Debug, Clone)]
pub enum TransferEvent {
    /// Sender: offer written to the control channel
    OfferSent {
        peer: String,
        file_name: String,
        file_size: u64,
        chunk_count: u32,
    },
    /// Receiver: offer read from the control channel
    OfferReceived {
        from: String,
        file_name: String,
        file_size: u64,
    },
    /// Either side: offer accepted with these data ports
    OfferAccepted { data_ports: Vec<u16> },
    /// Either side: offer rejected
    OfferRejected { reason: String },
    /// Receiver: destination preallocated, data listeners bound
    SessionStarted { path: String, chunk_count: u32 },
    /// Sender: worker connected for a chunk attempt
    ChunkStarted {
        chunk_idx: u32,
        attempt: u32,
        target: String,
    },
    /// Transient block I/O error, block retried
    BlockRetry {
        chunk_idx: u32,
        attempt: u32,
        reason: String,
    },
    /// Sender: OK verdict received. Receiver: hash matched and bytes flushed.
    ChunkVerified {
        chunk_idx: u32,
        bytes: u64,
        duration_ms: u64,
    },
    /// Chunk attempt failed
    ChunkFailed {
        chunk_idx: u32,
        attempt: u32,
        kind: String,
        reason: String,
    },
    /// Sender: failed chunk put back on the queue
    ChunkRequeued { chunk_idx: u32, next_attempt: u32 },
    /// Receiver: hashing the assembled file
    Verifying { path: String },
    /// Transfer complete
    TransferComplete {
        total_bytes: u64,
        duration_ms: u64,
        retries: u64,
    },
    /// Error occurred
    Error { message: String },
}

impl fmt::Display for TransferEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OfferSent { peer, file_name, file_size, chunk_count } => {
                write!(f, "offer_sent peer={} file={} size={} chunks={}", peer, file_name, file_size, chunk_count)
            }
            Self::OfferReceived { from, file_name, file_size } => {
                write!(f, "offer_received from={} file={} size={}", from, file_name, file_size)
            }
            Self::OfferAccepted { data_ports } => {
                write!(f, "offer_accepted data_ports={:?}", data_ports)
            }
            Self::OfferRejected { reason } => {
                write!(f, "offer_rejected reason={}", reason)
            }
            Self::SessionStarted { path, chunk_count } => {
                write!(f, "session_started path={} chunks={}", path, chunk_count)
            }
            Self::ChunkStarted { chunk_idx, attempt, target } => {
                write!(f, "chunk_started idx={} attempt={} target={}", chunk_idx, attempt, target)
            }
            Self::BlockRetry { chunk_idx, attempt, reason } => {
                write!(f, "block_retry idx={} attempt={} reason={}", chunk_idx, attempt, reason)
            }
            Self::ChunkVerified { chunk_idx, bytes, duration_ms } => {
                write!(f, "chunk_verified idx={} bytes={} duration_ms={}", chunk_idx, bytes, duration_ms)
            }
            Self::ChunkFailed { chunk_idx, attempt, kind, reason } => {
                write!(f, "chunk_failed idx={} attempt={} kind={} reason={}", chunk_idx, attempt, kind, reason)
            }
            Self::ChunkRequeued { chunk_idx, next_attempt } => {
                write!(f, "chunk_requeued idx={} next_attempt={}", chunk_idx, next_attempt)
            }
            Self::Verifying { path } => {
                write!(f, "verifying path={}", path)
            }
            Self::TransferComplete { total_bytes, duration_ms, retries } => {
                write!(f, "transfer_complete bytes={} duration_ms={} retries={}", total_bytes, duration_ms, retries)
            }
            Self::Error { message } => {
                write!(f, "error: {}", message)
            }
        }
    }
}

/// Trait for transfer logging. Implementations can forward logs elsewhere,
/// write to tracing, or discard them.
pub trait TransferLogger: Send + Sync {
    fn log(&self, entry: TransferLog);
}

/// Logger that uses the `tracing` crate.
pub struct TracingLogger;

impl TransferLogger for TracingLogger {
    fn log(&self, entry: TransferLog) {
        // Use info for key lifecycle events, debug for per-chunk spam
        match &entry.event {
            TransferEvent::OfferSent { .. }
            | TransferEvent::OfferReceived { .. }
            | TransferEvent::OfferAccepted { .. }
            | TransferEvent::OfferRejected { .. }
            | TransferEvent::SessionStarted { .. }
            | TransferEvent::Verifying { .. }
            | TransferEvent::TransferComplete { .. } => {
                tracing::info!(
                    component = entry.component,
                    transfer_id = %entry.transfer_id,
                    "{}",
                    entry.event,
                );
            }
            TransferEvent::ChunkFailed { .. } | TransferEvent::Error { .. } => {
                tracing::warn!(
                    component = entry.component,
                    transfer_id = %entry.transfer_id,
                    "{}",
                    entry.event,
                );
            }
            _ => {
                tracing::debug!(
                    component = entry.component,
                    transfer_id = %entry.transfer_id,
                    "{}",
                    entry.event,
                );
            }
        }
    }
}

/// No-op logger that discards all log entries.
pub struct NullLogger;

impl TransferLogger for NullLogger {
    fn log(&self, _entry: TransferLog) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_render_as_key_value() {
        let event = TransferEvent::ChunkFailed {
            chunk_idx: 2,
            attempt: 1,
            kind: "integrity".into(),
            reason: "retry verdict".into(),
        };
        assert_eq!(event.to_string(), "chunk_failed idx=2 attempt=1 kind=integrity reason=retry verdict");
    }
}
