use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use chrono::Utc;
use futures_util::Stream;
use tokio::sync::mpsc;
use uuid::Uuid;

use quickshare_types::{ProgressEvent, ProgressPhase};

/// Where a transfer pushes its [`ProgressEvent`]s. Never blocks the data path.
#[derive(Debug, Clone, Default)]
pub struct ProgressSink {
    tx: Option<mpsc::UnboundedSender<ProgressEvent>>,
}

impl ProgressSink {
    pub fn channel() -> (Self, ProgressReceiver) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, ProgressReceiver { rx })
    }

    /// A sink that drops every event.
    pub fn discard() -> Self {
        Self { tx: None }
    }

    pub fn send(&self, event: ProgressEvent) {
        if let Some(tx) = &self.tx {
            // Receiver gone means nobody is watching.
            let _ = tx.send(event);
        }
    }
}

/// Consumer end of a [`ProgressSink`].
pub struct ProgressReceiver {
    rx: mpsc::UnboundedReceiver<ProgressEvent>,
}

impl ProgressReceiver {
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        self.rx.try_recv().ok()
    }

    pub fn into_stream(self) -> impl Stream<Item = ProgressEvent> + Send + 'static {
        futures_util::stream::unfold(self.rx, |mut rx| async move { rx.recv().await.map(|ev| (ev, rx)) })
    }
}

/// Aggregate counters of one transfer, shared by all of its workers.
pub struct TransferProgress {
    pub transfer_id: Uuid,
    pub file_name: String,
    pub bytes_total: u64,
    pub chunk_count: u32,
    bytes_done: AtomicU64,
    chunks_done: AtomicU32,
    retries: AtomicU64,
    sink: ProgressSink,
}

impl TransferProgress {
    pub fn new(
        transfer_id: Uuid,
        file_name: impl Into<String>,
        bytes_total: u64,
        chunk_count: u32,
        sink: ProgressSink,
    ) -> Self {
        Self {
            transfer_id,
            file_name: file_name.into(),
            bytes_total,
            chunk_count,
            bytes_done: AtomicU64::new(0),
            chunks_done: AtomicU32::new(0),
            retries: AtomicU64::new(0),
            sink,
        }
    }

    pub fn add_bytes(&self, n: u64) {
        self.bytes_done.fetch_add(n, Ordering::Relaxed);
    }

    /// Take back the bytes of a failed attempt.
    pub fn sub_bytes(&self, n: u64) {
        let _ = self
            .bytes_done
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(n)));
    }

    pub fn chunk_done(&self) {
        self.chunks_done.fetch_add(1, Ordering::Relaxed);
    }

    pub fn retried(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_done(&self) -> u64 {
        self.bytes_done.load(Ordering::Relaxed)
    }

    pub fn chunks_done(&self) -> u32 {
        self.chunks_done.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self, phase: ProgressPhase) -> ProgressEvent {
        ProgressEvent {
            transfer_id: self.transfer_id,
            file_name: self.file_name.clone(),
            phase,
            chunks_done: self.chunks_done(),
            chunk_count: self.chunk_count,
            bytes_done: self.bytes_done(),
            bytes_total: self.bytes_total,
            timestamp: Utc::now(),
        }
    }

    pub fn emit(&self, phase: ProgressPhase) {
        self.sink.send(self.snapshot(phase));
    }
}
