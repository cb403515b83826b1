//! Control channel: one offer and one decision per TCP connection.
//!
//! Frames are a 4-byte big-endian length followed by a JSON
//! [`ControlMessage`].

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use quickshare_types::{ControlMessage, TransferAccept, TransferOffer};

use crate::config::TransferConfig;
use crate::error::ControlError;
use crate::logging::{TransferEvent, TransferLog};
use crate::net::connect_with_backoff;

/// Upper bound for one control frame.
pub const MAX_CONTROL_FRAME: usize = 64 * 1024;

pub async fn write_message<W: AsyncWrite + Unpin>(w: &mut W, msg: &ControlMessage) -> Result<(), ControlError> {
    let payload = serde_json::to_vec(msg).map_err(|e| ControlError::ProtocolViolation(e.to_string()))?;
    if payload.len() > MAX_CONTROL_FRAME {
        return Err(ControlError::ProtocolViolation(format!(
            "control frame of {} bytes exceeds {}",
            payload.len(),
            MAX_CONTROL_FRAME
        )));
    }
    w.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    w.write_all(&payload).await?;
    w.flush().await?;
    Ok(())
}

pub async fn read_message<R: AsyncRead + Unpin>(r: &mut R) -> Result<ControlMessage, ControlError> {
    let len = r.read_u32().await? as usize;
    if len == 0 || len > MAX_CONTROL_FRAME {
        return Err(ControlError::ProtocolViolation(format!("invalid control frame length {len}")));
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload).await?;
    serde_json::from_slice(&payload).map_err(|e| ControlError::ProtocolViolation(e.to_string()))
}

/// Offer a file to `addr` and wait for its decision.
///
/// A rejection is returned as a `TransferAccept` with `accepted == false`;
/// an acceptance without data ports is a protocol violation.
pub async fn send_offer(
    addr: SocketAddr,
    offer: &TransferOffer,
    config: &TransferConfig,
) -> Result<TransferAccept, ControlError> {
    let mut stream = connect_with_backoff(addr, config.connect_attempts, config.connect_backoff, config.connect_timeout)
        .await
        .map_err(|source| ControlError::ConnectionFailed {
            addr,
            attempts: config.connect_attempts.max(1),
            source,
        })?;

    config.logger.log(TransferLog {
        component: "control",
        transfer_id: offer.transfer_id,
        event: TransferEvent::OfferSent {
            peer: addr.to_string(),
            file_name: offer.file_name.clone(),
            file_size: offer.file_size,
            chunk_count: offer.chunk_count,
        },
    });

    let reply = tokio::time::timeout(config.control_timeout, async {
        write_message(&mut stream, &ControlMessage::Offer(offer.clone())).await?;
        read_message(&mut stream).await
    })
    .await
    .map_err(|_| ControlError::Timeout(config.control_timeout))??;

    let decision = match reply {
        ControlMessage::Decision(decision) => decision,
        ControlMessage::Offer(_) => {
            return Err(ControlError::ProtocolViolation("expected a decision, got an offer".into()));
        }
    };

    if decision.accepted && decision.data_ports.is_empty() {
        return Err(ControlError::ProtocolViolation("accept carried no data ports".into()));
    }

    let event = if decision.accepted {
        TransferEvent::OfferAccepted { data_ports: decision.data_ports.clone() }
    } else {
        TransferEvent::OfferRejected { reason: decision.reason.clone().unwrap_or_default() }
    };
    config.logger.log(TransferLog { component: "control", transfer_id: offer.transfer_id, event });

    Ok(decision)
}

/// Accept control connections until cancelled, answering each offer with
/// `handler`'s decision. Every connection runs in its own task.
pub async fn serve<H, Fut>(listener: TcpListener, handler: H, read_timeout: Duration, cancel: CancellationToken)
where
    H: Fn(TransferOffer, SocketAddr) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TransferAccept> + Send + 'static,
{
    let handler = Arc::new(handler);
    if let Ok(addr) = listener.local_addr() {
        info!("Control channel listening on {}", addr);
    }

    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                debug!("Control connection from {}", peer);
                let handler = handler.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, peer, handler.as_ref(), read_timeout).await {
                        warn!("Control connection from {} failed: {}", peer, e);
                    }
                });
            }
            Err(e) => {
                error!("Control accept error: {}", e);
            }
        }
    }

    debug!("Control channel stopped");
}

async fn handle_connection<H, Fut>(
    mut stream: TcpStream,
    peer: SocketAddr,
    handler: &H,
    read_timeout: Duration,
) -> Result<(), ControlError>
where
    H: Fn(TransferOffer, SocketAddr) -> Fut,
    Fut: Future<Output = TransferAccept>,
{
    let msg = tokio::time::timeout(read_timeout, read_message(&mut stream))
        .await
        .map_err(|_| ControlError::Timeout(read_timeout))?;

    let decision = match msg {
        Ok(ControlMessage::Offer(offer)) => handler(offer, peer).await,
        Ok(ControlMessage::Decision(_)) => TransferAccept::reject("expected an offer"),
        Err(ControlError::ProtocolViolation(reason)) => {
            // Best effort: the peer may not speak the protocol at all.
            let _ = write_message(&mut stream, &ControlMessage::Decision(TransferAccept::reject(reason.clone()))).await;
            return Err(ControlError::ProtocolViolation(reason));
        }
        Err(e) => return Err(e),
    };

    write_message(&mut stream, &ControlMessage::Decision(decision)).await?;
    stream.shutdown().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use uuid::Uuid;

    use crate::logging::NullLogger;

    fn offer() -> TransferOffer {
        TransferOffer {
            transfer_id: Uuid::new_v4(),
            file_name: "report.pdf".into(),
            file_size: 42,
            chunk_size: 1024,
            chunk_count: 1,
            hash_algorithm: "sha256".into(),
            file_sha256: "00".into(),
        }
    }

    fn quiet_config() -> TransferConfig {
        TransferConfig {
            logger: Arc::new(NullLogger),
            connect_backoff: Duration::from_millis(10),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn zero_length_frame_is_a_violation() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&0u32.to_be_bytes()).await.unwrap();
        assert!(matches!(read_message(&mut b).await, Err(ControlError::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn oversized_frame_is_a_violation() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&((MAX_CONTROL_FRAME as u32) + 1).to_be_bytes()).await.unwrap();
        assert!(matches!(read_message(&mut b).await, Err(ControlError::ProtocolViolation(_))));
    }

    #[tokio::test]
    async fn offer_round_trip_through_serve() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve(
            listener,
            |offer: TransferOffer, _peer| async move {
                if offer.file_size > 10 {
                    TransferAccept::accept(vec![40000])
                } else {
                    TransferAccept::reject("too small")
                }
            },
            Duration::from_secs(2),
            cancel.clone(),
        ));

        let decision = send_offer(addr, &offer(), &quiet_config()).await.unwrap();
        assert!(decision.accepted);
        assert_eq!(decision.data_ports, vec![40000]);

        let small = TransferOffer { file_size: 1, ..offer() };
        let decision = send_offer(addr, &small, &quiet_config()).await.unwrap();
        assert!(!decision.accepted);
        assert_eq!(decision.reason.as_deref(), Some("too small"));

        cancel.cancel();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn accept_without_ports_is_a_violation() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        let cancel = CancellationToken::new();
        let server = tokio::spawn(serve(
            listener,
            |_offer, _peer| async { TransferAccept::accept(Vec::new()) },
            Duration::from_secs(2),
            cancel.clone(),
        ));

        let err = send_offer(addr, &offer(), &quiet_config()).await.unwrap_err();
        assert!(matches!(err, ControlError::ProtocolViolation(_)));

        cancel.cancel();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_peer_is_connection_failed() {
        let port = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap().local_addr().unwrap().port();
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        let err = send_offer(addr, &offer(), &quiet_config()).await.unwrap_err();
        assert!(matches!(err, ControlError::ConnectionFailed { attempts: 3, .. }));
    }
}
