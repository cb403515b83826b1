use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use quickshare_discovery::{DiscoveryConfig, DiscoveryError};
use quickshare_transfer::{
    ControlError, ProgressReceiver, ProgressSink, ReceiverConfig, SendJob, SendReport, TransferConfig, TransferError,
    prepare_offer, run_sender, send_offer, serve_recv,
};
use quickshare_types::Peer;

/// Listen for announcements for `wait` and return the peers heard.
pub async fn discover(config: &DiscoveryConfig, wait: Duration) -> Result<Vec<Peer>, DiscoveryError> {
    quickshare_discovery::discover(config, wait).await
}

/// A running outbound transfer.
pub struct SendHandle {
    pub transfer_id: Uuid,
    pub events: ProgressReceiver,
    pub cancel: CancellationToken,
    pub task: JoinHandle<Result<SendReport, TransferError>>,
}

impl SendHandle {
    /// Wait for the transfer to finish.
    pub async fn wait(self) -> Result<SendReport, TransferError> {
        self.task
            .await
            .map_err(|e| TransferError::Io(io::Error::other(format!("send task failed: {e}"))))?
    }
}

/// Offer `path` to `peer` and, once accepted, start sending in the background.
///
/// The handshake runs before this returns: a rejected offer is
/// `ControlError::Rejected`.
pub async fn send(
    config: &TransferConfig,
    path: &Path,
    peer: &Peer,
    chunk_size: u64,
) -> Result<SendHandle, TransferError> {
    let offer = prepare_offer(path, chunk_size).await?;
    let accept = send_offer(peer.control_addr(), &offer, config).await?;
    if !accept.accepted {
        let reason = accept.reason.unwrap_or_else(|| "no reason given".into());
        return Err(ControlError::Rejected(reason).into());
    }
    info!(
        "Sending {} ({} bytes, {} chunks) to {} over {} streams",
        offer.file_name,
        offer.file_size,
        offer.chunk_count,
        peer.name,
        accept.data_ports.len()
    );

    let transfer_id = offer.transfer_id;
    let job = SendJob::new(offer, path, peer.address.ip(), &accept);
    let (sink, events) = ProgressSink::channel();
    let cancel = CancellationToken::new();
    let config = config.clone();
    let task = tokio::spawn({
        let cancel = cancel.clone();
        async move { run_sender(job, &config, sink, cancel).await }
    });

    Ok(SendHandle { transfer_id, events, cancel, task })
}

/// A running receiver.
pub struct ReceiveHandle {
    pub local_addr: SocketAddr,
    pub events: ProgressReceiver,
    pub cancel: CancellationToken,
    pub task: JoinHandle<()>,
}

impl ReceiveHandle {
    /// Stop accepting offers and wait for the control loop to exit.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Accept offers on `port` (0 for ephemeral) into `out_dir` with default policy.
pub async fn receive(port: u16, out_dir: impl Into<PathBuf>) -> Result<ReceiveHandle, TransferError> {
    let config = ReceiverConfig { out_dir: out_dir.into(), ..Default::default() };
    receive_with(config, port).await
}

/// Accept offers on `port` with an explicit receiver configuration.
pub async fn receive_with(config: ReceiverConfig, port: u16) -> Result<ReceiveHandle, TransferError> {
    let listener = TcpListener::bind((config.bind_ip, port))
        .await
        .map_err(|e| ControlError::Io(io::Error::new(e.kind(), format!("cannot bind control port {port}: {e}"))))?;
    let local_addr = listener.local_addr().map_err(ControlError::Io)?;
    info!("Receiving into {} on {}", config.out_dir.display(), local_addr);

    let (sink, events) = ProgressSink::channel();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(serve_recv(listener, config, sink, cancel.clone()));
    Ok(ReceiveHandle { local_addr, events, cancel, task })
}
