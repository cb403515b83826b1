/// Receiver: answers offers on the control channel and assembles files.
///
/// ```text
/// control offer --> policy --> preallocate --> bind N data listeners --> accept(ports)
///                                                    |
///   per connection: header -> blocks -> write_at -> trailer -> hash check -> verdict
///                                                    |
///                         ledger complete --> full-file SHA-256 --> Completed / Failed
/// ```

use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use quickshare_types::{Chunk, ChunkErrorKind, HASH_ALGORITHM_SHA256, ProgressPhase, TransferAccept, TransferOffer};

use crate::chunk::{self, ChunkLedger};
use crate::config::ReceiverConfig;
use crate::control;
use crate::error::TransferError;
use crate::fileutils;
use crate::logging::{TransferEvent, TransferLog};
use crate::net::{tune_stream, with_timeout};
use crate::progress::{ProgressSink, TransferProgress};
use crate::protocol::{BLOCK_SIZE, Verdict, read_header, read_trailer, write_verdict};

struct ReceiverContext {
    config: ReceiverConfig,
    sink: ProgressSink,
    cancel: CancellationToken,
    /// Serializes destination naming and preallocation across offers.
    claim: Mutex<()>,
}

/// Serve offers on `listener` until `cancel` fires.
///
/// Each accepted offer becomes a session with its own data listeners;
/// sessions report through `sink` and end in `Completed` or `Failed`.
pub async fn serve_recv(listener: TcpListener, config: ReceiverConfig, sink: ProgressSink, cancel: CancellationToken) {
    let read_timeout = config.io_timeout;
    let ctx = Arc::new(ReceiverContext { config, sink, cancel: cancel.clone(), claim: Mutex::new(()) });
    control::serve(
        listener,
        move |offer, from| {
            let ctx = ctx.clone();
            async move { decide(ctx, offer, from).await }
        },
        read_timeout,
        cancel,
    )
    .await;
}

/// Policy checks that need no I/O.
pub fn check_offer(offer: &TransferOffer, config: &ReceiverConfig) -> Result<(), String> {
    if !offer.hash_algorithm.eq_ignore_ascii_case(HASH_ALGORITHM_SHA256) {
        return Err(format!("unsupported hash algorithm {}", offer.hash_algorithm));
    }
    if offer.chunk_size == 0 {
        return Err("chunk size must be positive".into());
    }
    let expected = chunk::checked_chunk_count(offer.file_size, offer.chunk_size).map_err(|e| e.to_string())?;
    if expected != offer.chunk_count {
        return Err(format!(
            "chunk count {} does not match {} bytes at {} bytes per chunk",
            offer.chunk_count, offer.file_size, offer.chunk_size
        ));
    }
    if let Some(max) = config.max_file_size {
        if offer.file_size > max {
            return Err(format!("file of {} bytes exceeds the {} byte limit", offer.file_size, max));
        }
    }
    if !matches!(hex::decode(&offer.file_sha256), Ok(h) if h.len() == 32) {
        return Err("malformed file hash".into());
    }
    Ok(())
}

async fn decide(ctx: Arc<ReceiverContext>, offer: TransferOffer, from: SocketAddr) -> TransferAccept {
    let log = |event| {
        ctx.config.logger.log(TransferLog { component: "receiver", transfer_id: offer.transfer_id, event });
    };
    log(TransferEvent::OfferReceived {
        from: from.to_string(),
        file_name: offer.file_name.clone(),
        file_size: offer.file_size,
    });

    match open_session(&ctx, &offer).await {
        Ok((dest, listeners)) => {
            let ports: Vec<u16> = listeners
                .iter()
                .filter_map(|l| l.local_addr().ok())
                .map(|a| a.port())
                .collect();
            log(TransferEvent::OfferAccepted { data_ports: ports.clone() });
            let session = Arc::new(Session::new(&ctx, offer.clone(), dest));
            tokio::spawn(run_session(ctx.clone(), session, listeners));
            TransferAccept::accept(ports)
        }
        Err(reason) => {
            log(TransferEvent::OfferRejected { reason: reason.clone() });
            TransferAccept::reject(reason)
        }
    }
}

async fn open_session(ctx: &ReceiverContext, offer: &TransferOffer) -> Result<(PathBuf, Vec<TcpListener>), String> {
    check_offer(offer, &ctx.config)?;

    let _claim = ctx.claim.lock().await;
    let out_dir = &ctx.config.out_dir;
    fileutils::ensure_dir(out_dir).await.map_err(|e| e.to_string())?;
    let name = fileutils::sanitize_file_name(&offer.file_name);
    let dest = fileutils::unique_destination(out_dir, &name).await.map_err(|e| e.to_string())?;
    fileutils::preallocate(&dest, offer.file_size).await.map_err(|e| e.to_string())?;

    let mut listeners = Vec::with_capacity(ctx.config.data_streams.max(1));
    for _ in 0..ctx.config.data_streams.max(1) {
        match TcpListener::bind((ctx.config.bind_ip, 0)).await {
            Ok(l) => listeners.push(l),
            Err(e) => {
                // Nothing will ever fill it.
                let _ = tokio::fs::remove_file(&dest).await;
                return Err(format!("cannot bind data listener: {e}"));
            }
        }
    }
    Ok((dest, listeners))
}

struct Session {
    offer: TransferOffer,
    chunks: Vec<Chunk>,
    dest: PathBuf,
    ledger: ChunkLedger,
    progress: TransferProgress,
    config: ReceiverConfig,
    wake: Notify,
    /// (chunk index, failures) of the chunk that exhausted its retries.
    fatal: OnceLock<(u32, u32)>,
    started: Instant,
    last_activity_ms: AtomicU64,
}

impl Session {
    fn new(ctx: &ReceiverContext, offer: TransferOffer, dest: PathBuf) -> Self {
        // check_offer already validated the partition.
        let chunks = chunk::partition(offer.file_size, offer.chunk_size).unwrap_or_default();
        let file_name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| offer.file_name.clone());
        Self {
            progress: TransferProgress::new(offer.transfer_id, file_name, offer.file_size, offer.chunk_count, ctx.sink.clone()),
            ledger: ChunkLedger::new(chunks.len() as u32),
            chunks,
            offer,
            dest,
            config: ctx.config.clone(),
            wake: Notify::new(),
            fatal: OnceLock::new(),
            started: Instant::now(),
            last_activity_ms: AtomicU64::new(0),
        }
    }

    fn log(&self, event: TransferEvent) {
        self.config.logger.log(TransferLog { component: "receiver", transfer_id: self.offer.transfer_id, event });
    }

    fn touch(&self) {
        self.last_activity_ms.store(self.started.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let now = self.started.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_activity_ms.load(Ordering::Relaxed)))
    }

    /// Resolve once every chunk is verified, or fail.
    async fn wait_for_chunks(&self, cancel: &CancellationToken) -> Result<(), TransferError> {
        let idle_timeout = self.config.idle_timeout;
        let tick = (idle_timeout / 4).clamp(Duration::from_millis(10), Duration::from_secs(1));
        loop {
            if let Some(&(index, attempts)) = self.fatal.get() {
                return Err(TransferError::ChunkRetriesExhausted {
                    index,
                    attempts,
                    cause: ChunkErrorKind::Integrity,
                    message: "chunk failed verification on every attempt".into(),
                });
            }
            if self.ledger.is_complete() {
                return Ok(());
            }
            if self.idle_for() >= idle_timeout {
                return Err(TransferError::Stalled(idle_timeout));
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(TransferError::Cancelled),
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(tick) => {}
            }
        }
    }

    async fn finalize(&self) -> Result<String, TransferError> {
        self.progress.emit(ProgressPhase::Verifying);
        self.log(TransferEvent::Verifying { path: self.dest.display().to_string() });
        let actual = fileutils::file_sha256(&self.dest).await?;
        if !actual.eq_ignore_ascii_case(&self.offer.file_sha256) {
            return Err(TransferError::FinalizationIntegrity { expected: self.offer.file_sha256.clone(), actual });
        }
        Ok(actual)
    }

    /// Handle one chunk attempt on a data connection.
    async fn receive_chunk(&self, mut stream: TcpStream) -> io::Result<()> {
        tune_stream(&stream)?;
        let io_timeout = self.config.io_timeout;

        let header = match with_timeout(io_timeout, "chunk header", read_header(&mut stream)).await {
            Ok(h) => h,
            Err(e) => {
                if e.kind() == io::ErrorKind::InvalidData {
                    let _ = write_verdict(&mut stream, Verdict::Reject).await;
                }
                return Err(e);
            }
        };
        if self.chunks.get(header.index as usize) != Some(&header) {
            let _ = write_verdict(&mut stream, Verdict::Reject).await;
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("header {:?} does not match the accepted partition", header),
            ));
        }
        self.touch();

        // A verified chunk is never overwritten; a resend is only checked.
        let mut file = if self.ledger.is_done(header.index) {
            None
        } else {
            Some(fileutils::open_for_write(&self.dest).await.map_err(io::Error::other)?)
        };

        let started = Instant::now();
        let mut counted = 0u64;
        let received = self.receive_payload(&mut stream, &header, file.as_mut(), &mut counted).await;
        let (digest, trailer) = match received {
            Ok(digest) => match with_timeout(io_timeout, "chunk trailer", read_trailer(&mut stream)).await {
                Ok(trailer) => (digest, trailer),
                Err(e) => {
                    self.progress.sub_bytes(counted);
                    return Err(e);
                }
            },
            Err(e) => {
                self.progress.sub_bytes(counted);
                return Err(e);
            }
        };

        let (trailer_index, trailer_hash) = trailer;
        if trailer_index != header.index {
            self.progress.sub_bytes(counted);
            write_verdict(&mut stream, Verdict::Reject).await?;
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("trailer for chunk {} on stream for chunk {}", trailer_index, header.index),
            ));
        }

        if digest != trailer_hash {
            self.progress.sub_bytes(counted);
            let err = TransferError::ChunkIntegrity {
                index: header.index,
                expected: hex::encode(trailer_hash),
                actual: hex::encode(digest),
            };
            let failures = self.ledger.record_failure(header.index);
            self.log(TransferEvent::ChunkFailed {
                chunk_idx: header.index,
                attempt: failures,
                kind: ChunkErrorKind::Integrity.to_string(),
                reason: err.to_string(),
            });
            self.progress.retried();
            if failures > self.config.max_chunk_retries {
                let _ = self.fatal.set((header.index, failures));
                self.wake.notify_one();
            }
            return write_verdict(&mut stream, Verdict::Retry).await;
        }

        if let Some(file) = file.as_mut() {
            file.flush().await?;
        }
        if self.ledger.mark_done(header.index) {
            self.progress.chunk_done();
            self.progress.emit(ProgressPhase::Transferring);
            self.log(TransferEvent::ChunkVerified {
                chunk_idx: header.index,
                bytes: header.byte_length,
                duration_ms: started.elapsed().as_millis() as u64,
            });
            self.wake.notify_one();
        } else {
            // Raced with another copy of the same chunk.
            self.progress.sub_bytes(counted);
        }
        write_verdict(&mut stream, Verdict::Ok).await
    }

    async fn receive_payload(
        &self,
        stream: &mut TcpStream,
        header: &Chunk,
        mut file: Option<&mut File>,
        counted: &mut u64,
    ) -> io::Result<[u8; 32]> {
        let io_timeout = self.config.io_timeout;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; BLOCK_SIZE];
        let mut received = 0u64;
        while received < header.byte_length {
            let n = (header.byte_length - received).min(BLOCK_SIZE as u64) as usize;
            with_timeout(io_timeout, "chunk block", stream.read_exact(&mut buf[..n])).await?;
            hasher.update(&buf[..n]);
            if let Some(file) = file.as_deref_mut() {
                fileutils::write_at(file, header.byte_offset + received, &buf[..n]).await?;
                *counted += n as u64;
                self.progress.add_bytes(n as u64);
                self.progress.emit(ProgressPhase::Transferring);
            }
            received += n as u64;
            self.touch();
        }
        Ok(hasher.finalize().into())
    }
}

async fn run_session(ctx: Arc<ReceiverContext>, session: Arc<Session>, listeners: Vec<TcpListener>) {
    let accept_cancel = ctx.cancel.child_token();
    for listener in listeners {
        tokio::spawn(accept_chunks(listener, session.clone(), accept_cancel.clone(), ctx.cancel.clone()));
    }

    session.touch();
    session.log(TransferEvent::SessionStarted {
        path: session.dest.display().to_string(),
        chunk_count: session.ledger.chunk_count(),
    });
    session.progress.emit(ProgressPhase::Started);

    let outcome = session.wait_for_chunks(&ctx.cancel).await;
    accept_cancel.cancel();
    let outcome = match outcome {
        Ok(()) => session.finalize().await,
        Err(e) => Err(e),
    };

    match outcome {
        Ok(file_sha256) => {
            session.log(TransferEvent::TransferComplete {
                total_bytes: session.progress.bytes_done(),
                duration_ms: session.started.elapsed().as_millis() as u64,
                retries: session.progress.retries(),
            });
            session.progress.emit(ProgressPhase::Completed { file_sha256 });
        }
        Err(e) => {
            session.log(TransferEvent::Error { message: e.to_string() });
            session.progress.emit(ProgressPhase::Failed { reason: e.to_string() });
        }
    }
}

async fn accept_chunks(
    listener: TcpListener,
    session: Arc<Session>,
    accept_cancel: CancellationToken,
    cancel: CancellationToken,
) {
    loop {
        let accepted = tokio::select! {
            _ = accept_cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                let session = session.clone();
                let cancel = cancel.clone();
                // Not tied to accept_cancel: the last verdict must still go out.
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancel.cancelled() => {}
                        result = session.receive_chunk(stream) => {
                            if let Err(e) = result {
                                debug!("Chunk connection from {} ended: {}", peer, e);
                            }
                        }
                    }
                });
            }
            Err(e) => warn!("Data accept error: {}", e),
        }
    }
}
