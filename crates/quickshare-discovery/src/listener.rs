use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use chrono::Utc;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use quickshare_types::{DiscoveryAnnouncement, Peer};

use crate::config::DiscoveryConfig;
use crate::error::DiscoveryError;
use crate::registry::PeerRegistry;

const MAX_DATAGRAM: usize = 2048;

/// Bind the announcement port with address reuse so several nodes on one
/// host can share it.
pub fn bind_listener(config: &DiscoveryConfig) -> Result<UdpSocket, DiscoveryError> {
    let addr = config.listen_addr();
    let socket = create_listen_socket(addr).map_err(|source| DiscoveryError::Bind { addr, source })?;
    Ok(UdpSocket::from_std(socket)?)
}

/// Receive announcements into `registry` until cancelled or `duration` elapses.
///
/// Announcements carrying `self_id` are ignored. Stale peers are evicted
/// once per announce interval.
pub async fn run_listener(
    socket: UdpSocket,
    config: &DiscoveryConfig,
    registry: &PeerRegistry,
    self_id: Option<Uuid>,
    duration: Option<Duration>,
    cancel: CancellationToken,
) {
    let local = socket.local_addr().ok();
    info!("Discovery listener on {:?}", local);

    let deadline = duration.map(|d| Instant::now() + d);
    let wait_deadline = async {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(wait_deadline);

    let mut sweep = tokio::time::interval(config.announce_interval);
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = &mut wait_deadline => break,
            _ = sweep.tick() => sweep_stale(registry, config),
            received = socket.recv_from(&mut buf) => match received {
                Ok((len, src)) => {
                    handle_datagram(&buf[..len], src, registry, self_id);
                    sweep_stale(registry, config);
                }
                Err(e) => warn!("Discovery receive failed: {}", e),
            },
        }
    }

    debug!("Discovery listener on {:?} stopped", local);
}

/// Bind and run the receive loop. Only the bind can fail.
pub async fn listen(
    config: &DiscoveryConfig,
    registry: &PeerRegistry,
    self_id: Option<Uuid>,
    duration: Option<Duration>,
    cancel: CancellationToken,
) -> Result<(), DiscoveryError> {
    let socket = bind_listener(config)?;
    run_listener(socket, config, registry, self_id, duration, cancel).await;
    Ok(())
}

fn sweep_stale(registry: &PeerRegistry, config: &DiscoveryConfig) {
    for peer in registry.evict_stale(config.staleness()) {
        info!("Peer {} ({}) went silent, evicted", peer.name, peer.id);
    }
}

fn handle_datagram(payload: &[u8], src: SocketAddr, registry: &PeerRegistry, self_id: Option<Uuid>) {
    let announcement: DiscoveryAnnouncement = match serde_json::from_slice(payload) {
        Ok(a) => a,
        Err(e) => {
            debug!("Dropping malformed datagram from {}: {}", src, e);
            return;
        }
    };

    if announcement.control_port == 0 {
        debug!("Dropping announcement from {} with control_port 0", src);
        return;
    }
    if self_id == Some(announcement.node_id) {
        return;
    }

    let peer = Peer {
        id: announcement.node_id,
        name: announcement.advertised_name,
        address: SocketAddr::new(src.ip(), announcement.control_port),
        control_port: announcement.control_port,
        last_seen: Utc::now(),
    };

    let (name, id, address) = (peer.name.clone(), peer.id, peer.address);
    if registry.upsert(peer) {
        info!("Discovered peer {} ({}) at {}", name, id, address);
    } else {
        debug!("Refreshed peer {} ({})", name, id);
    }
}

fn create_listen_socket(addr: SocketAddr) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}
