use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Discovery failures. Only binding is fatal; send/receive errors are logged
/// by the loops and retried on the next cycle.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("cannot bind discovery socket on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("discovery socket error: {0}")]
    Socket(#[from] io::Error),
}
