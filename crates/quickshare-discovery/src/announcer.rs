use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use chrono::Utc;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use quickshare_types::DiscoveryAnnouncement;

use crate::config::DiscoveryConfig;
use crate::error::DiscoveryError;

/// What a node says about itself in each announcement.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    pub node_id: Uuid,
    pub name: String,
    pub control_port: u16,
}

impl NodeIdentity {
    pub fn new(name: impl Into<String>, control_port: u16) -> Self {
        Self {
            node_id: Uuid::new_v4(),
            name: name.into(),
            control_port,
        }
    }

    fn announcement(&self) -> DiscoveryAnnouncement {
        DiscoveryAnnouncement {
            node_id: self.node_id,
            control_port: self.control_port,
            advertised_name: self.name.clone(),
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}

/// Bind an ephemeral UDP socket allowed to send to the broadcast address.
pub fn bind_announcer(config: &DiscoveryConfig) -> Result<UdpSocket, DiscoveryError> {
    let unspecified = match config.broadcast_ip {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    let addr = SocketAddr::new(unspecified, 0);
    let socket = create_broadcast_socket(addr).map_err(|source| DiscoveryError::Bind { addr, source })?;
    Ok(UdpSocket::from_std(socket)?)
}

/// Broadcast `identity` every `config.announce_interval` until cancelled.
///
/// Send failures are logged and retried on the next tick.
pub async fn run_announcer(
    socket: UdpSocket,
    config: &DiscoveryConfig,
    identity: &NodeIdentity,
    cancel: CancellationToken,
) {
    let target = config.broadcast_target();
    info!(
        "Announcing {} ({}) control_port={} to {} every {:?}",
        identity.name, identity.node_id, identity.control_port, target, config.announce_interval
    );

    loop {
        match serde_json::to_vec(&identity.announcement()) {
            Ok(payload) => match socket.send_to(&payload, target).await {
                Ok(_) => debug!("Announcement sent to {}", target),
                Err(e) => warn!("Discovery send to {} failed: {}", target, e),
            },
            Err(e) => warn!("Cannot encode announcement: {}", e),
        }

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(config.announce_interval) => {}
        }
    }

    debug!("Announcer for {} stopped", identity.node_id);
}

/// Bind and run the announce loop. Only the bind can fail.
pub async fn announce(
    config: &DiscoveryConfig,
    identity: &NodeIdentity,
    cancel: CancellationToken,
) -> Result<(), DiscoveryError> {
    let socket = bind_announcer(config)?;
    run_announcer(socket, config, identity, cancel).await;
    Ok(())
}

fn create_broadcast_socket(addr: SocketAddr) -> io::Result<std::net::UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    if addr.is_ipv4() {
        socket.set_broadcast(true)?;
    }
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}
