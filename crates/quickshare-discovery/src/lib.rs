//! QuickShare LAN discovery.
//!
//! Nodes broadcast a small JSON announcement on a well-known UDP port at a
//! fixed interval. Listeners fold announcements into a shared
//! [`PeerRegistry`] and evict peers that stop announcing.
//!
//! - [`announcer`]: broadcast loop, sleeps between datagrams
//! - [`listener`]: receive loop, upserts peers, drops malformed datagrams
//! - [`manager`]: both loops sharing one registry and one cancellation token

pub mod announcer;
pub mod config;
pub mod error;
pub mod listener;
pub mod manager;
pub mod registry;

use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

pub use announcer::{NodeIdentity, announce, bind_announcer, run_announcer};
pub use config::{DEFAULT_DISCOVERY_PORT, DiscoveryConfig};
pub use error::DiscoveryError;
pub use listener::{bind_listener, listen, run_listener};
pub use manager::DiscoveryManager;
pub use registry::PeerRegistry;

use quickshare_types::Peer;

/// Listen for `wait` and return whatever peers were heard, sorted by name.
pub async fn discover(config: &DiscoveryConfig, wait: Duration) -> Result<Vec<Peer>, DiscoveryError> {
    let registry = PeerRegistry::new();
    listen(config, &registry, None, Some(wait), CancellationToken::new()).await?;
    Ok(registry.snapshot())
}

/// Best-effort LAN address of this machine.
///
/// Connecting a UDP socket sends nothing; it only makes the OS pick the
/// outbound interface. Falls back to loopback.
pub fn local_ip() -> IpAddr {
    let probe = || -> std::io::Result<IpAddr> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80))?;
        Ok(socket.local_addr()?.ip())
    };
    probe().unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}
