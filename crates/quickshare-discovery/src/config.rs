use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

/// Well-known UDP port for announcements.
pub const DEFAULT_DISCOVERY_PORT: u16 = 37020;

/// Default gap between two announcements.
pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1);

/// A peer is evicted after this many announce intervals of silence.
pub const DEFAULT_STALE_AFTER_INTERVALS: u32 = 3;

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// UDP port announcements are sent to and received on.
    pub port: u16,
    /// Local address the listener binds.
    pub bind_ip: IpAddr,
    /// Destination address for announcements (limited broadcast by default).
    pub broadcast_ip: IpAddr,
    pub announce_interval: Duration,
    pub stale_after_intervals: u32,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_DISCOVERY_PORT,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            broadcast_ip: IpAddr::V4(Ipv4Addr::BROADCAST),
            announce_interval: DEFAULT_ANNOUNCE_INTERVAL,
            stale_after_intervals: DEFAULT_STALE_AFTER_INTERVALS,
        }
    }
}

impl DiscoveryConfig {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_ip, self.port)
    }

    pub fn broadcast_target(&self) -> SocketAddr {
        SocketAddr::new(self.broadcast_ip, self.port)
    }

    /// How long a peer may stay silent before it is evicted.
    pub fn staleness(&self) -> Duration {
        self.announce_interval * self.stale_after_intervals.max(1)
    }
}
