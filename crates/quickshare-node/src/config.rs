use std::fmt::Display;
use std::net::IpAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use quickshare_discovery::{DEFAULT_DISCOVERY_PORT, DiscoveryConfig};
use quickshare_transfer::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_WORKERS, ReceiverConfig, TransferConfig};

/// Default TCP port for the control channel.
pub const DEFAULT_CONTROL_PORT: u16 = 60000;

/// Node settings, read from `QUICKSHARE_*` environment variables.
#[derive(Clone)]
pub struct NodeConfig {
    /// Name advertised to peers.
    pub name: String,
    pub control_port: u16,
    pub out_dir: PathBuf,
    pub chunk_size: u64,
    pub max_file_size: Option<u64>,
    pub discovery: DiscoveryConfig,
    pub transfer: TransferConfig,
}

impl NodeConfig {
    /// Load from the process environment. Call `dotenvy::dotenv()` first to
    /// pick up a `.env` file.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from any key/value source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let name = lookup("QUICKSHARE_NAME")
            .or_else(|| lookup("HOSTNAME"))
            .or_else(|| lookup("COMPUTERNAME"))
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| "quickshare-node".into());

        let mut discovery = DiscoveryConfig {
            port: parse_or(&lookup, "QUICKSHARE_DISCOVERY_PORT", DEFAULT_DISCOVERY_PORT)?,
            ..Default::default()
        };
        if let Some(raw) = lookup("QUICKSHARE_BROADCAST_ADDR") {
            discovery.broadcast_ip = raw
                .parse::<IpAddr>()
                .with_context(|| format!("QUICKSHARE_BROADCAST_ADDR is not an IP address: {raw}"))?;
        }
        if let Some(ms) = parse_opt::<u64>(&lookup, "QUICKSHARE_ANNOUNCE_INTERVAL_MS")? {
            discovery.announce_interval = Duration::from_millis(ms.max(1));
        }

        let chunk_size = parse_or(&lookup, "QUICKSHARE_CHUNK_SIZE", DEFAULT_CHUNK_SIZE)?;
        if chunk_size == 0 {
            anyhow::bail!("QUICKSHARE_CHUNK_SIZE must be positive");
        }

        let transfer = TransferConfig {
            max_workers: parse_or(&lookup, "QUICKSHARE_MAX_WORKERS", DEFAULT_MAX_WORKERS)?.max(1),
            ..Default::default()
        };

        Ok(Self {
            name,
            control_port: parse_or(&lookup, "QUICKSHARE_CONTROL_PORT", DEFAULT_CONTROL_PORT)?,
            out_dir: lookup("QUICKSHARE_OUT_DIR").unwrap_or_else(|| "received".into()).into(),
            chunk_size,
            max_file_size: parse_opt(&lookup, "QUICKSHARE_MAX_FILE_SIZE")?,
            discovery,
            transfer,
        })
    }

    pub fn receiver_config(&self) -> ReceiverConfig {
        ReceiverConfig {
            out_dir: self.out_dir.clone(),
            max_file_size: self.max_file_size,
            ..Default::default()
        }
    }
}

fn parse_opt<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| anyhow::anyhow!("{key}={raw}: {e}")),
        None => Ok(None),
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
{
    Ok(parse_opt(lookup, key)?.unwrap_or(default))
}
