use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The only full-file hash algorithm nodes speak.
pub const HASH_ALGORITHM_SHA256: &str = "sha256";

/// UDP discovery datagram payload (JSON).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryAnnouncement {
    pub node_id: Uuid,
    pub control_port: u16,
    pub advertised_name: String,
    /// Unix time in milliseconds when the datagram was built.
    pub timestamp: i64,
}

/// Sender's proposal for a single file transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferOffer {
    pub transfer_id: Uuid,
    pub file_name: String,
    pub file_size: u64,
    pub chunk_size: u64,
    pub chunk_count: u32,
    pub hash_algorithm: String,
    /// Hex SHA-256 of the whole source file.
    pub file_sha256: String,
}

/// Receiver's answer to an offer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferAccept {
    pub accepted: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_ports: Vec<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl TransferAccept {
    pub fn accept(data_ports: Vec<u16>) -> Self {
        Self { accepted: true, data_ports, reason: None }
    }

    pub fn reject(reason: impl Into<String>) -> Self {
        Self { accepted: false, data_ports: Vec::new(), reason: Some(reason.into()) }
    }
}

/// Messages carried on the control channel, one request and one response per
/// connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Sender → receiver
    Offer(TransferOffer),
    /// Receiver → sender
    Decision(TransferAccept),
}
