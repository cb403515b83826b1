use std::collections::HashMap;

use futures_util::StreamExt;
use tracing::{debug, info, warn};

use quickshare_discovery::{DiscoveryManager, NodeIdentity, local_ip};
use quickshare_node::{NodeConfig, receive_with};
use quickshare_types::{ProgressEvent, ProgressPhase};
use uuid::Uuid;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "quickshare_node=debug,quickshare_transfer=info,quickshare_discovery=info".into()
            }),
        )
        .init();

    let config = NodeConfig::from_env()?;
    info!("QuickShare node '{}' on {}", config.name, local_ip());

    let receiver = receive_with(config.receiver_config(), config.control_port).await?;
    let control_port = receiver.local_addr.port();
    info!("Control channel listening on {}", receiver.local_addr);

    let mut discovery = DiscoveryManager::new(config.discovery.clone());
    let identity = NodeIdentity::new(config.name.clone(), control_port);
    info!("Node id {}", identity.node_id);
    if let Err(e) = discovery.start(identity) {
        // Still reachable by address; only discovery is lost.
        warn!("Discovery unavailable: {}", e);
    }

    let quickshare_node::ReceiveHandle { events, cancel, task, .. } = receiver;
    let reporter = tokio::spawn(async move {
        let mut events = Box::pin(events.into_stream());
        let mut latest: HashMap<Uuid, ProgressEvent> = HashMap::new();
        while let Some(event) = events.next().await {
            report(latest.get(&event.transfer_id), &event);
            if event.phase.is_terminal() {
                latest.remove(&event.transfer_id);
            } else {
                latest.insert(event.transfer_id, event);
            }
        }
    });

    shutdown_signal().await;

    cancel.cancel();
    discovery.shutdown().await;
    let _ = task.await;
    reporter.abort();
    info!("Stopped");
    Ok(())
}

fn report(last: Option<&ProgressEvent>, event: &ProgressEvent) {
    let phase_changed = last.is_none_or(|l| l.phase != event.phase);
    if phase_changed {
        match &event.phase {
            ProgressPhase::Started => info!(
                "Receiving {} ({} bytes, {} chunks)",
                event.file_name, event.bytes_total, event.chunk_count
            ),
            ProgressPhase::Transferring => {}
            ProgressPhase::Verifying => info!("Verifying {}", event.file_name),
            ProgressPhase::Completed { file_sha256 } => {
                info!("Received {} sha256={}", event.file_name, file_sha256)
            }
            ProgressPhase::Failed { reason } => warn!("Transfer of {} failed: {}", event.file_name, reason),
        }
    }
    let chunk_advanced = last.is_some_and(|l| l.chunks_done < event.chunks_done);
    if chunk_advanced {
        debug!(
            "{}: {}/{} chunks ({:.0}%)",
            event.file_name,
            event.chunks_done,
            event.chunk_count,
            event.fraction() * 100.0
        );
    }
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
