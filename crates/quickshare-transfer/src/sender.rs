/// Parallel chunked TCP sender.
///
/// ```text
/// [dispatcher] --spawn--> [worker 0] --TCP--> data_ports[0 % n]
///      ^                  [worker 1] --TCP--> data_ports[1 % n]
///      |                  ...   (at most max_workers hold a permit)
///      +---- ChunkResult: OK -> done, failed -> requeue until retries run out
/// ```
///
/// Each worker owns its file handle and its connection; the only shared
/// state is the atomic progress counters.

use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use quickshare_types::{
    Chunk, ChunkErrorKind, ChunkResult, HASH_ALGORITHM_SHA256, ProgressPhase, TransferAccept, TransferOffer,
};

use crate::chunk;
use crate::config::TransferConfig;
use crate::error::{ControlError, FileError, TransferError};
use crate::fileutils::{self, FALLBACK_FILE_NAME};
use crate::logging::{TransferEvent, TransferLog};
use crate::net::{connect_with_backoff, is_transient, tune_stream, with_timeout};
use crate::progress::{ProgressSink, TransferProgress};
use crate::protocol::{BLOCK_SIZE, Verdict, read_verdict, write_header, write_trailer};

/// Sees every outgoing block after it was hashed and before it is written.
///
/// Changing the bytes makes the receiver's hash disagree with the trailer.
pub trait BlockTap: Send + Sync {
    fn tap(&self, chunk_index: u32, attempt: u32, block: &mut [u8]);
}

/// An accepted offer and where to send its chunks.
#[derive(Debug, Clone)]
pub struct SendJob {
    pub offer: TransferOffer,
    pub source: PathBuf,
    pub data_addrs: Vec<SocketAddr>,
}

impl SendJob {
    /// Data endpoints are the accepted ports on the receiver's address.
    pub fn new(offer: TransferOffer, source: impl Into<PathBuf>, peer_ip: IpAddr, accept: &TransferAccept) -> Self {
        Self {
            offer,
            source: source.into(),
            data_addrs: accept.data_ports.iter().map(|&p| SocketAddr::new(peer_ip, p)).collect(),
        }
    }
}

/// Result of a completed send operation.
#[derive(Debug, Clone)]
pub struct SendReport {
    pub transfer_id: Uuid,
    pub bytes_sent: u64,
    /// Every attempt in completion order, failed ones included.
    pub chunk_results: Vec<ChunkResult>,
    pub retries: u64,
    pub duration: Duration,
}

impl SendReport {
    pub fn successful(&self) -> impl Iterator<Item = &ChunkResult> {
        self.chunk_results.iter().filter(|r| r.success)
    }
}

/// Stat and hash `path` and describe it as an offer.
pub async fn prepare_offer(path: &Path, chunk_size: u64) -> Result<TransferOffer, TransferError> {
    let meta = fs::metadata(path).await.map_err(FileError::io(path))?;
    if !meta.is_file() {
        return Err(FileError::Io {
            path: path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidInput, "not a regular file"),
        }
        .into());
    }

    let file_size = meta.len();
    let chunk_count = chunk::checked_chunk_count(file_size, chunk_size)?;
    let file_sha256 = fileutils::file_sha256(path).await?;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| FALLBACK_FILE_NAME.to_string());

    Ok(TransferOffer {
        transfer_id: Uuid::new_v4(),
        file_name,
        file_size,
        chunk_size,
        chunk_count,
        hash_algorithm: HASH_ALGORITHM_SHA256.to_string(),
        file_sha256,
    })
}

struct WorkerContext {
    transfer_id: Uuid,
    source: PathBuf,
    data_addrs: Vec<SocketAddr>,
    config: TransferConfig,
    progress: TransferProgress,
}

impl WorkerContext {
    fn log(&self, event: TransferEvent) {
        self.config.logger.log(TransferLog { component: "sender", transfer_id: self.transfer_id, event });
    }

    fn fail(&self, err: TransferError) -> TransferError {
        self.log(TransferEvent::Error { message: err.to_string() });
        self.progress.emit(ProgressPhase::Failed { reason: err.to_string() });
        err
    }
}

struct ChunkFailure {
    kind: ChunkErrorKind,
    message: String,
}

impl ChunkFailure {
    fn new(kind: ChunkErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    fn io(err: io::Error) -> Self {
        let kind = match err.kind() {
            io::ErrorKind::TimedOut => ChunkErrorKind::Timeout,
            _ => ChunkErrorKind::Io,
        };
        Self::new(kind, err.to_string())
    }
}

/// Send every chunk of `job`, retrying failed chunks.
///
/// Returns once the receiver acknowledged every chunk. Cancelling aborts
/// all workers; bytes already sent stay on the receiver's disk.
///
/// The sender's `Completed` event means every chunk got an OK verdict. The
/// receiver hashes the whole file afterwards and reports that outcome only
/// on its own event stream.
pub async fn run_sender(
    job: SendJob,
    config: &TransferConfig,
    sink: ProgressSink,
    cancel: CancellationToken,
) -> Result<SendReport, TransferError> {
    if job.data_addrs.is_empty() {
        return Err(ControlError::ProtocolViolation("no data endpoints to send to".into()).into());
    }
    chunk::checked_chunk_count(job.offer.file_size, job.offer.chunk_size)?;
    let chunks = chunk::partition(job.offer.file_size, job.offer.chunk_size)?;
    if chunks.len() as u32 != job.offer.chunk_count {
        return Err(TransferError::InvalidPartition(format!(
            "offer says {} chunks, partition has {}",
            job.offer.chunk_count,
            chunks.len()
        )));
    }

    let started = Instant::now();
    let ctx = Arc::new(WorkerContext {
        transfer_id: job.offer.transfer_id,
        source: job.source,
        data_addrs: job.data_addrs,
        config: config.clone(),
        progress: TransferProgress::new(
            job.offer.transfer_id,
            job.offer.file_name.clone(),
            job.offer.file_size,
            job.offer.chunk_count,
            sink,
        ),
    });
    let semaphore = Arc::new(Semaphore::new(config.max_workers.max(1)));
    ctx.progress.emit(ProgressPhase::Started);

    let mut queue: VecDeque<(Chunk, u32)> = chunks.into_iter().map(|c| (c, 1)).collect();
    let mut workers = JoinSet::new();
    let mut results = Vec::with_capacity(job.offer.chunk_count as usize);
    loop {
        // A permit is released when its worker returns, before join_next yields it.
        while let Some(&(chunk, attempt)) = queue.front() {
            let Ok(permit) = semaphore.clone().try_acquire_owned() else { break };
            queue.pop_front();
            spawn_worker(&mut workers, &ctx, permit, chunk, attempt);
        }

        let joined = tokio::select! {
            _ = cancel.cancelled() => {
                workers.abort_all();
                return Err(ctx.fail(TransferError::Cancelled));
            }
            joined = workers.join_next() => joined,
        };
        let Some(joined) = joined else { break };
        let (chunk, result) = match joined {
            Ok(done) => done,
            Err(e) => {
                workers.abort_all();
                return Err(ctx.fail(TransferError::Io(io::Error::other(format!("chunk worker died: {e}")))));
            }
        };

        if result.success {
            ctx.progress.chunk_done();
            ctx.progress.emit(ProgressPhase::Transferring);
            results.push(result);
            continue;
        }

        let kind = result.error_kind.unwrap_or(ChunkErrorKind::Io);
        let message = result.error.clone().unwrap_or_default();
        ctx.log(TransferEvent::ChunkFailed {
            chunk_idx: chunk.index,
            attempt: result.attempt,
            kind: kind.to_string(),
            reason: message.clone(),
        });

        if result.attempt > config.max_chunk_retries {
            workers.abort_all();
            let attempts = result.attempt;
            results.push(result);
            return Err(ctx.fail(TransferError::ChunkRetriesExhausted {
                index: chunk.index,
                attempts,
                cause: kind,
                message,
            }));
        }

        let next_attempt = result.attempt + 1;
        results.push(result);
        ctx.progress.retried();
        ctx.log(TransferEvent::ChunkRequeued { chunk_idx: chunk.index, next_attempt });
        queue.push_back((chunk, next_attempt));
    }

    let duration = started.elapsed();
    let bytes_sent = ctx.progress.bytes_done();
    ctx.log(TransferEvent::TransferComplete {
        total_bytes: bytes_sent,
        duration_ms: duration.as_millis() as u64,
        retries: ctx.progress.retries(),
    });
    ctx.progress.emit(ProgressPhase::Completed { file_sha256: job.offer.file_sha256.clone() });

    Ok(SendReport {
        transfer_id: ctx.transfer_id,
        bytes_sent,
        chunk_results: results,
        retries: ctx.progress.retries(),
        duration,
    })
}

fn spawn_worker(
    workers: &mut JoinSet<(Chunk, ChunkResult)>,
    ctx: &Arc<WorkerContext>,
    permit: OwnedSemaphorePermit,
    chunk: Chunk,
    attempt: u32,
) {
    let ctx = ctx.clone();
    workers.spawn(async move {
        let result = send_chunk(&ctx, chunk, attempt).await;
        drop(permit);
        (chunk, result)
    });
}

async fn send_chunk(ctx: &WorkerContext, chunk: Chunk, attempt: u32) -> ChunkResult {
    let started = Instant::now();
    let mut sent = 0u64;
    match transmit_chunk(ctx, chunk, attempt, &mut sent).await {
        Ok(sha256) => {
            ctx.log(TransferEvent::ChunkVerified {
                chunk_idx: chunk.index,
                bytes: sent,
                duration_ms: started.elapsed().as_millis() as u64,
            });
            ChunkResult::ok(chunk.index, attempt, sent, sha256)
        }
        Err(failure) => {
            ctx.progress.sub_bytes(sent);
            ChunkResult::failed(chunk.index, attempt, sent, failure.kind, failure.message)
        }
    }
}

async fn transmit_chunk(ctx: &WorkerContext, chunk: Chunk, attempt: u32, sent: &mut u64) -> Result<String, ChunkFailure> {
    let cfg = &ctx.config;
    let addr = ctx.data_addrs[chunk.index as usize % ctx.data_addrs.len()];

    let mut stream = connect_with_backoff(addr, cfg.connect_attempts, cfg.connect_backoff, cfg.connect_timeout)
        .await
        .map_err(|e| ChunkFailure::new(ChunkErrorKind::ConnectionFailed, format!("{addr}: {e}")))?;
    tune_stream(&stream).map_err(ChunkFailure::io)?;
    ctx.log(TransferEvent::ChunkStarted { chunk_idx: chunk.index, attempt, target: addr.to_string() });

    let mut file = File::open(&ctx.source).await.map_err(ChunkFailure::io)?;
    with_timeout(cfg.io_timeout, "chunk header write", write_header(&mut stream, &chunk))
        .await
        .map_err(ChunkFailure::io)?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; BLOCK_SIZE];
    let mut offset = chunk.byte_offset;
    let end = chunk.end();
    while offset < end {
        let len = (end - offset).min(BLOCK_SIZE as u64) as usize;
        let block = &mut buf[..len];
        read_block(ctx, &mut file, chunk.index, attempt, offset, block).await?;
        hasher.update(&*block);
        if let Some(tap) = &cfg.block_tap {
            tap.tap(chunk.index, attempt, block);
        }
        write_block(ctx, &mut stream, chunk.index, attempt, block).await?;

        offset += len as u64;
        *sent += len as u64;
        ctx.progress.add_bytes(len as u64);
        ctx.progress.emit(ProgressPhase::Transferring);
    }

    let digest: [u8; 32] = hasher.finalize().into();
    with_timeout(cfg.io_timeout, "chunk trailer write", write_trailer(&mut stream, chunk.index, &digest))
        .await
        .map_err(ChunkFailure::io)?;

    let verdict = tokio::time::timeout(cfg.verdict_timeout, read_verdict(&mut stream))
        .await
        .map_err(|_| ChunkFailure::new(ChunkErrorKind::Timeout, format!("no verdict within {:?}", cfg.verdict_timeout)))?
        .map_err(|e| match e.kind() {
            io::ErrorKind::InvalidData => ChunkFailure::new(ChunkErrorKind::ProtocolViolation, e.to_string()),
            _ => ChunkFailure::io(e),
        })?;

    match verdict {
        Verdict::Ok => Ok(hex::encode(digest)),
        Verdict::Retry => Err(ChunkFailure::new(ChunkErrorKind::Integrity, "receiver hash mismatch")),
        Verdict::Reject => Err(ChunkFailure::new(ChunkErrorKind::ProtocolViolation, "receiver rejected the chunk")),
    }
}

async fn read_block(
    ctx: &WorkerContext,
    file: &mut File,
    chunk_idx: u32,
    attempt: u32,
    offset: u64,
    block: &mut [u8],
) -> Result<(), ChunkFailure> {
    let cfg = &ctx.config;
    let mut tries = 0;
    loop {
        let read = with_timeout(cfg.io_timeout, "source read", fileutils::read_at(file, offset, block)).await;
        match read {
            Ok(n) if n == block.len() => return Ok(()),
            Ok(n) => {
                return Err(ChunkFailure::new(
                    ChunkErrorKind::Io,
                    format!("source ended at byte {} inside chunk {}", offset + n as u64, chunk_idx),
                ));
            }
            Err(e) if is_transient(&e) && tries < cfg.block_retries => {
                tries += 1;
                ctx.log(TransferEvent::BlockRetry { chunk_idx, attempt, reason: e.to_string() });
                tokio::time::sleep(cfg.block_backoff * tries).await;
            }
            Err(e) => return Err(ChunkFailure::io(e)),
        }
    }
}

/// Write `block`, retrying only the bytes the socket has not taken yet.
///
/// A single `write` either hands bytes to the socket or, when its timeout
/// fires, none, so the tail offset is exact across retries.
async fn write_block(
    ctx: &WorkerContext,
    stream: &mut TcpStream,
    chunk_idx: u32,
    attempt: u32,
    block: &[u8],
) -> Result<(), ChunkFailure> {
    let cfg = &ctx.config;
    let mut written = 0;
    let mut tries = 0;
    while written < block.len() {
        match with_timeout(cfg.io_timeout, "block write", stream.write(&block[written..])).await {
            Ok(0) => return Err(ChunkFailure::io(io::Error::from(io::ErrorKind::WriteZero))),
            Ok(n) => {
                written += n;
                tries = 0;
            }
            Err(e) if is_transient(&e) && tries < cfg.block_retries => {
                tries += 1;
                ctx.log(TransferEvent::BlockRetry { chunk_idx, attempt, reason: e.to_string() });
                tokio::time::sleep(cfg.block_backoff * tries).await;
            }
            Err(e) => return Err(ChunkFailure::io(e)),
        }
    }
    Ok(())
}
