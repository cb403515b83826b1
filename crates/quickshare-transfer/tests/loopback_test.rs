/// Integration test: send a file to localhost and verify it arrives intact.
///
/// Each test starts a receiver on an ephemeral loopback port, pushes a file
/// with a known byte pattern through the control and data channels, and
/// compares the output byte-for-byte.

use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use quickshare_transfer::protocol::{read_header, read_trailer, read_verdict, write_header, write_trailer, write_verdict};
use quickshare_transfer::{
    BlockTap, ControlError, ProgressReceiver, ProgressSink, ReceiverConfig, SendJob, SendReport, TransferConfig,
    TransferError, TransferEvent, TransferLog, TransferLogger, Verdict, fileutils, partition, prepare_offer, run_sender,
    send_offer, serve_recv,
};
use quickshare_types::{ChunkErrorKind, ProgressEvent, ProgressPhase, TransferAccept};
use uuid::Uuid;

const MIB: u64 = 1024 * 1024;

struct Receiver {
    addr: SocketAddr,
    out_dir: PathBuf,
    events: ProgressReceiver,
    cancel: CancellationToken,
}

impl Drop for Receiver {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn start_receiver(out_dir: &Path, tweak: impl FnOnce(&mut ReceiverConfig)) -> Receiver {
    let _ = tracing_subscriber::fmt().with_env_filter("quickshare_transfer=debug").try_init();

    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut config = ReceiverConfig {
        out_dir: out_dir.to_path_buf(),
        bind_ip: Ipv4Addr::LOCALHOST.into(),
        ..Default::default()
    };
    tweak(&mut config);

    let (sink, events) = ProgressSink::channel();
    let cancel = CancellationToken::new();
    tokio::spawn(serve_recv(listener, config, sink, cancel.clone()));
    Receiver { addr, out_dir: out_dir.to_path_buf(), events, cancel }
}

fn sender_config() -> TransferConfig {
    TransferConfig {
        connect_backoff: Duration::from_millis(10),
        ..Default::default()
    }
}

fn write_pattern(path: &Path, size: u64) -> Vec<u8> {
    let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect(); // prime modulus for good distribution
    std::fs::write(path, &data).unwrap();
    data
}

async fn send_file(
    to: SocketAddr,
    path: &Path,
    chunk_size: u64,
    config: &TransferConfig,
) -> (Uuid, Result<SendReport, TransferError>) {
    let offer = prepare_offer(path, chunk_size).await.unwrap();
    let transfer_id = offer.transfer_id;
    let accept = match send_offer(to, &offer, config).await {
        Ok(a) if a.accepted => a,
        Ok(a) => return (transfer_id, Err(ControlError::Rejected(a.reason.unwrap_or_default()).into())),
        Err(e) => return (transfer_id, Err(e.into())),
    };
    let job = SendJob::new(offer, path, to.ip(), &accept);
    (transfer_id, run_sender(job, config, ProgressSink::discard(), CancellationToken::new()).await)
}

/// Next terminal event for `transfer_id` on the receiver.
async fn wait_terminal(events: &mut ProgressReceiver, transfer_id: Uuid) -> ProgressEvent {
    tokio::time::timeout(Duration::from_secs(20), async {
        loop {
            let event = events.recv().await.expect("receiver event stream closed");
            if event.transfer_id == transfer_id && event.phase.is_terminal() {
                return event;
            }
        }
    })
    .await
    .expect("no terminal event from receiver")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn eight_mib_in_one_mib_chunks() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("input.bin");
    let data = write_pattern(&input, 8 * MIB);
    let mut rx = start_receiver(&dir.path().join("out"), |_| {}).await;

    let (id, report) = send_file(rx.addr, &input, MIB, &sender_config()).await;
    let report = report.unwrap();

    let ok: Vec<_> = report.successful().collect();
    assert_eq!(ok.len(), 8);
    assert_eq!(report.chunk_results.len(), 8);
    assert_eq!(report.bytes_sent, 8 * MIB);
    assert_eq!(report.retries, 0);

    let done = wait_terminal(&mut rx.events, id).await;
    let expected = hex::encode(Sha256::digest(&data));
    assert_eq!(done.phase, ProgressPhase::Completed { file_sha256: expected });
    assert_eq!(done.bytes_done, 8 * MIB);
    assert_eq!(done.chunks_done, 8);

    let output = rx.out_dir.join(&done.file_name);
    assert_eq!(std::fs::read(&output).unwrap(), data);

    // Each chunk hash recomputed from the written bytes matches what was sent.
    for result in ok {
        let hash = fileutils::chunk_sha256(&output, result.index as u64 * MIB, MIB).await.unwrap();
        assert_eq!(hash, result.sha256, "chunk {}", result.index);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_chunk_and_eight_chunks_agree() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("same.bin");
    let data = write_pattern(&input, 2 * MIB + 123);
    let mut rx = start_receiver(&dir.path().join("out"), |_| {}).await;

    let (id_one, report) = send_file(rx.addr, &input, 4 * MIB, &sender_config()).await;
    assert_eq!(report.unwrap().chunk_results.len(), 1);
    let first = wait_terminal(&mut rx.events, id_one).await;

    let (id_many, report) = send_file(rx.addr, &input, 270 * 1024, &sender_config()).await;
    assert_eq!(report.unwrap().chunk_results.len(), 8);
    let second = wait_terminal(&mut rx.events, id_many).await;

    assert_eq!(first.file_name, "same.bin");
    assert_eq!(second.file_name, "same_1.bin");
    let a = std::fs::read(rx.out_dir.join(&first.file_name)).unwrap();
    let b = std::fs::read(rx.out_dir.join(&second.file_name)).unwrap();
    assert_eq!(a, data);
    assert_eq!(a, b);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn chunks_arriving_in_reverse_order() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("reverse.bin");
    let chunk_size = 64 * 1024;
    let data = write_pattern(&input, 5 * chunk_size + 999);
    let mut rx = start_receiver(&dir.path().join("out"), |c| c.data_streams = 2).await;

    let offer = prepare_offer(&input, chunk_size).await.unwrap();
    let accept = send_offer(rx.addr, &offer, &sender_config()).await.unwrap();
    assert!(accept.accepted);
    assert_eq!(accept.data_ports.len(), 2);

    let chunks = partition(offer.file_size, offer.chunk_size).unwrap();
    for chunk in chunks.iter().rev() {
        let port = accept.data_ports[chunk.index as usize % accept.data_ports.len()];
        let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
        let bytes = &data[chunk.byte_offset as usize..chunk.end() as usize];
        write_header(&mut stream, chunk).await.unwrap();
        stream.write_all(bytes).await.unwrap();
        let digest: [u8; 32] = Sha256::digest(bytes).into();
        write_trailer(&mut stream, chunk.index, &digest).await.unwrap();
        assert_eq!(read_verdict(&mut stream).await.unwrap(), Verdict::Ok);
    }

    let done = wait_terminal(&mut rx.events, offer.transfer_id).await;
    assert!(matches!(done.phase, ProgressPhase::Completed { .. }));
    assert_eq!(std::fs::read(rx.out_dir.join(&done.file_name)).unwrap(), data);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn mismatched_trailer_gets_retry_verdict() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("retry.bin");
    let data = write_pattern(&input, 1000);
    let rx = start_receiver(&dir.path().join("out"), |_| {}).await;

    let offer = prepare_offer(&input, 1000).await.unwrap();
    let accept = send_offer(rx.addr, &offer, &sender_config()).await.unwrap();
    let chunk = partition(offer.file_size, offer.chunk_size).unwrap()[0];

    let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, accept.data_ports[0])).await.unwrap();
    write_header(&mut stream, &chunk).await.unwrap();
    stream.write_all(&data).await.unwrap();
    write_trailer(&mut stream, 0, &[0u8; 32]).await.unwrap();
    assert_eq!(read_verdict(&mut stream).await.unwrap(), Verdict::Retry);
}

/// Flips the first byte of one chunk's first block on the chosen attempts.
struct Corrupt {
    chunk_index: u32,
    every_attempt: bool,
    fired: AtomicBool,
    hits: AtomicU32,
}

impl Corrupt {
    fn new(chunk_index: u32, every_attempt: bool) -> Arc<Self> {
        Arc::new(Self { chunk_index, every_attempt, fired: AtomicBool::new(false), hits: AtomicU32::new(0) })
    }
}

impl BlockTap for Corrupt {
    fn tap(&self, chunk_index: u32, _attempt: u32, block: &mut [u8]) {
        if chunk_index != self.chunk_index || block.is_empty() {
            return;
        }
        if self.every_attempt || !self.fired.swap(true, Ordering::SeqCst) {
            block[0] ^= 0xff;
            self.hits.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_corrupted_block_retries_only_that_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("flaky.bin");
    let chunk_size = 256 * 1024;
    let data = write_pattern(&input, 8 * chunk_size);
    let mut rx = start_receiver(&dir.path().join("out"), |_| {}).await;

    let tap = Corrupt::new(3, false);
    let config = TransferConfig { block_tap: Some(tap.clone() as Arc<dyn BlockTap>), ..sender_config() };
    let (id, report) = send_file(rx.addr, &input, chunk_size, &config).await;
    let report = report.unwrap();

    let failed: Vec<_> = report.chunk_results.iter().filter(|r| !r.success).collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].index, 3);
    assert_eq!(failed[0].error_kind, Some(ChunkErrorKind::Integrity));
    assert_eq!(report.retries, 1);
    assert_eq!(report.successful().count(), 8);
    assert!(report.successful().all(|r| r.attempt == if r.index == 3 { 2 } else { 1 }));
    assert_eq!(tap.hits.load(Ordering::SeqCst), 1);
    assert_eq!(report.bytes_sent, 8 * chunk_size);

    let done = wait_terminal(&mut rx.events, id).await;
    assert!(matches!(done.phase, ProgressPhase::Completed { .. }));
    assert_eq!(std::fs::read(rx.out_dir.join(&done.file_name)).unwrap(), data);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn persistent_corruption_exhausts_retries() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("broken.bin");
    let chunk_size = 128 * 1024;
    write_pattern(&input, 4 * chunk_size);
    let mut rx = start_receiver(&dir.path().join("out"), |_| {}).await;

    let config = TransferConfig { block_tap: Some(Corrupt::new(2, true) as Arc<dyn BlockTap>), ..sender_config() };
    let (id, report) = send_file(rx.addr, &input, chunk_size, &config).await;

    match report {
        Err(TransferError::ChunkRetriesExhausted { index, attempts, cause, .. }) => {
            assert_eq!(index, 2);
            assert_eq!(attempts, config.max_chunk_retries + 1);
            assert_eq!(cause, ChunkErrorKind::Integrity);
        }
        other => panic!("expected retries exhausted, got {other:?}"),
    }

    let failed = wait_terminal(&mut rx.events, id).await;
    assert!(matches!(failed.phase, ProgressPhase::Failed { .. }));
}

#[tokio::test]
async fn oversized_offer_is_rejected_before_touching_disk() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("big.bin");
    write_pattern(&input, 4096);
    let out_dir = dir.path().join("out");
    let rx = start_receiver(&out_dir, |c| c.max_file_size = Some(1024)).await;

    let (_, report) = send_file(rx.addr, &input, MIB, &sender_config()).await;
    match report {
        Err(TransferError::Control(ControlError::Rejected(reason))) => assert!(reason.contains("limit"), "{reason}"),
        other => panic!("expected rejection, got {other:?}"),
    }
    assert!(!out_dir.join("big.bin").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn empty_file_transfers_as_one_chunk() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("empty.txt");
    write_pattern(&input, 0);
    let mut rx = start_receiver(&dir.path().join("out"), |_| {}).await;

    let (id, report) = send_file(rx.addr, &input, MIB, &sender_config()).await;
    let report = report.unwrap();
    assert_eq!(report.chunk_results.len(), 1);
    assert_eq!(report.bytes_sent, 0);

    let done = wait_terminal(&mut rx.events, id).await;
    assert_eq!(
        done.phase,
        ProgressPhase::Completed { file_sha256: hex::encode(Sha256::digest(b"")) }
    );
    assert_eq!(std::fs::metadata(rx.out_dir.join("empty.txt")).unwrap().len(), 0);
}

#[tokio::test]
async fn silent_sender_stalls_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("idle.bin");
    write_pattern(&input, 10_000);
    let mut rx = start_receiver(&dir.path().join("out"), |c| c.idle_timeout = Duration::from_millis(200)).await;

    let offer = prepare_offer(&input, MIB).await.unwrap();
    let accept = send_offer(rx.addr, &offer, &sender_config()).await.unwrap();
    assert!(accept.accepted);

    let failed = wait_terminal(&mut rx.events, offer.transfer_id).await;
    match failed.phase {
        ProgressPhase::Failed { reason } => assert!(reason.contains("no chunk activity"), "{reason}"),
        other => panic!("expected stall, got {other:?}"),
    }
    // Preallocated file is left in place.
    assert_eq!(std::fs::metadata(rx.out_dir.join("idle.bin")).unwrap().len(), 10_000);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn full_file_hash_mismatch_fails_the_session() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("tampered.bin");
    write_pattern(&input, 3 * 256 * 1024);
    let mut rx = start_receiver(&dir.path().join("out"), |_| {}).await;

    // Chunks are sent intact; only the advertised whole-file hash is wrong.
    let mut offer = prepare_offer(&input, 256 * 1024).await.unwrap();
    offer.file_sha256 = "00".repeat(32);
    let accept = send_offer(rx.addr, &offer, &sender_config()).await.unwrap();
    assert!(accept.accepted);
    let job = SendJob::new(offer.clone(), &input, rx.addr.ip(), &accept);
    let (sink, mut sent) = ProgressSink::channel();
    let report = run_sender(job, &sender_config(), sink, CancellationToken::new()).await.unwrap();
    assert_eq!(report.successful().count(), 3);

    let failed = wait_terminal(&mut rx.events, offer.transfer_id).await;
    match failed.phase {
        ProgressPhase::Failed { reason } => assert!(reason.contains("file hash mismatch"), "{reason}"),
        other => panic!("expected finalization failure, got {other:?}"),
    }

    // The sender only knows every chunk was acknowledged.
    let mut last = None;
    while let Some(event) = sent.try_recv() {
        last = Some(event.phase);
    }
    assert_eq!(last, Some(ProgressPhase::Completed { file_sha256: "00".repeat(32) }));
}

/// Accepts data connections, reads nothing and never answers.
async fn silent_data_endpoint() -> (SocketAddr, Arc<AtomicU32>) {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicU32::new(0));
    let counter = accepted.clone();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            held.push(stream);
        }
    });
    (addr, accepted)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancelling_the_sender_stops_all_workers() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("cancel.bin");
    write_pattern(&input, 8 * 64 * 1024);
    let (addr, accepted) = silent_data_endpoint().await;

    let offer = prepare_offer(&input, 64 * 1024).await.unwrap();
    let job = SendJob::new(offer, &input, addr.ip(), &TransferAccept::accept(vec![addr.port()]));
    let config = TransferConfig { max_workers: 2, ..sender_config() };
    let (sink, mut events) = ProgressSink::channel();
    let cancel = CancellationToken::new();
    let task = tokio::spawn({
        let cancel = cancel.clone();
        async move { run_sender(job, &config, sink, cancel).await }
    });

    // Both workers are parked waiting for a verdict.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 2);
    cancel.cancel();

    let result = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap();
    assert!(matches!(result, Err(TransferError::Cancelled)), "{result:?}");

    // Nothing new is dispatched after cancellation.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(accepted.load(Ordering::SeqCst), 2);

    let mut last = None;
    while let Some(event) = events.try_recv() {
        last = Some(event.phase);
    }
    assert!(matches!(last, Some(ProgressPhase::Failed { .. })), "{last:?}");
}

#[tokio::test]
async fn silent_control_peer_times_out() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("ping.txt");
    write_pattern(&input, 100);
    let (addr, _) = silent_data_endpoint().await;

    let offer = prepare_offer(&input, MIB).await.unwrap();
    let config = TransferConfig { control_timeout: Duration::from_millis(200), ..sender_config() };
    let started = tokio::time::Instant::now();
    match send_offer(addr, &offer, &config).await {
        Err(ControlError::Timeout(after)) => assert_eq!(after, Duration::from_millis(200)),
        other => panic!("expected timeout, got {other:?}"),
    }
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[derive(Default)]
struct RetryCounter {
    block_retries: AtomicU32,
}

impl TransferLogger for RetryCounter {
    fn log(&self, entry: TransferLog) {
        if matches!(entry.event, TransferEvent::BlockRetry { .. }) {
            self.block_retries.fetch_add(1, Ordering::SeqCst);
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn timed_out_block_writes_resume_without_duplicating_bytes() {
    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("slow.bin");
    let size = 48 * MIB;
    let data = write_pattern(&input, size);
    let expected: [u8; 32] = Sha256::digest(&data).into();

    // Reads a trickle long enough to make socket writes time out, then drains.
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
    let addr = listener.local_addr().unwrap();
    let slow_reader = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let chunk = read_header(&mut stream).await.unwrap();
        let mut payload = vec![0u8; chunk.byte_length as usize];
        let mut got = 0;
        for _ in 0..20 {
            let n = 3000.min(payload.len() - got);
            stream.read_exact(&mut payload[got..got + n]).await.unwrap();
            got += n;
            tokio::time::sleep(Duration::from_millis(130)).await;
        }
        stream.read_exact(&mut payload[got..]).await.unwrap();
        let (_, trailer) = read_trailer(&mut stream).await.unwrap();
        let actual: [u8; 32] = Sha256::digest(&payload).into();
        let verdict = if actual == trailer { Verdict::Ok } else { Verdict::Retry };
        write_verdict(&mut stream, verdict).await.unwrap();
        actual
    });

    let counter = Arc::new(RetryCounter::default());
    let config = TransferConfig {
        io_timeout: Duration::from_millis(100),
        block_retries: 1000,
        block_backoff: Duration::from_millis(1),
        max_chunk_retries: 0,
        logger: counter.clone() as Arc<dyn TransferLogger>,
        ..sender_config()
    };
    let offer = prepare_offer(&input, size).await.unwrap();
    let job = SendJob::new(offer, &input, addr.ip(), &TransferAccept::accept(vec![addr.port()]));
    let report = run_sender(job, &config, ProgressSink::discard(), CancellationToken::new()).await;

    let received = slow_reader.await.unwrap();
    assert_eq!(received, expected);
    let report = report.unwrap();
    assert_eq!(report.bytes_sent, size);
    assert!(counter.block_retries.load(Ordering::SeqCst) > 0);
}
