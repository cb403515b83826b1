use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;
use tracing::debug;

/// Socket buffer size for data connections (4 MB).
pub const SOCKET_BUF_SIZE: usize = 4 * 1024 * 1024;

/// Connect with up to `attempts` tries, sleeping `backoff`, `2*backoff`, ...
/// between them. Returns the last error once every attempt failed.
pub async fn connect_with_backoff(
    addr: SocketAddr,
    attempts: u32,
    backoff: Duration,
    timeout: Duration,
) -> io::Result<TcpStream> {
    let attempts = attempts.max(1);
    let mut delay = backoff;
    let mut last_err = io::Error::new(io::ErrorKind::NotConnected, "no connection attempt made");

    for attempt in 1..=attempts {
        match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => return Ok(stream),
            Ok(Err(e)) => last_err = e,
            Err(_) => last_err = io::Error::new(io::ErrorKind::TimedOut, format!("connect to {addr} timed out")),
        }
        debug!("Connect to {} failed (attempt {}/{}): {}", addr, attempt, attempts, last_err);
        if attempt < attempts {
            tokio::time::sleep(delay).await;
            delay = delay.saturating_mul(2);
        }
    }
    Err(last_err)
}

/// Socket options for throughput. Buffer sizes are best-effort.
pub fn tune_stream(stream: &TcpStream) -> io::Result<()> {
    let sock_ref = socket2::SockRef::from(stream);
    sock_ref.set_nodelay(true)?;
    let _ = sock_ref.set_send_buffer_size(SOCKET_BUF_SIZE);
    let _ = sock_ref.set_recv_buffer_size(SOCKET_BUF_SIZE);
    Ok(())
}

/// Error kinds worth retrying at block level.
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

/// Run `fut` under `timeout`, mapping expiry to `ErrorKind::TimedOut`.
pub async fn with_timeout<T>(
    timeout: Duration,
    what: &str,
    fut: impl std::future::Future<Output = io::Result<T>>,
) -> io::Result<T> {
    match tokio::time::timeout(timeout, fut).await {
        Ok(r) => r,
        Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, format!("{what} timed out after {timeout:?}"))),
    }
}
