use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use quickshare_types::Peer;

use crate::announcer::{NodeIdentity, bind_announcer, run_announcer};
use crate::config::DiscoveryConfig;
use crate::error::DiscoveryError;
use crate::listener::{bind_listener, run_listener};
use crate::registry::PeerRegistry;

/// Runs the listener and announcer as background tasks over one registry.
///
/// Sockets are bound before the tasks are spawned so bind errors surface
/// to the caller.
pub struct DiscoveryManager {
    config: DiscoveryConfig,
    registry: PeerRegistry,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
}

impl DiscoveryManager {
    pub fn new(config: DiscoveryConfig) -> Self {
        Self {
            config,
            registry: PeerRegistry::new(),
            cancel: CancellationToken::new(),
            tasks: JoinSet::new(),
        }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub fn registry(&self) -> PeerRegistry {
        self.registry.clone()
    }

    pub fn start_listener(&mut self, self_id: Option<Uuid>) -> Result<(), DiscoveryError> {
        let socket = bind_listener(&self.config)?;
        let config = self.config.clone();
        let registry = self.registry.clone();
        let cancel = self.cancel.child_token();
        self.tasks.spawn(async move {
            run_listener(socket, &config, &registry, self_id, None, cancel).await;
        });
        Ok(())
    }

    pub fn start_announcer(&mut self, identity: NodeIdentity) -> Result<(), DiscoveryError> {
        let socket = bind_announcer(&self.config)?;
        let config = self.config.clone();
        let cancel = self.cancel.child_token();
        self.tasks.spawn(async move {
            run_announcer(socket, &config, &identity, cancel).await;
        });
        Ok(())
    }

    /// Listen for others and announce `identity`, skipping our own datagrams.
    pub fn start(&mut self, identity: NodeIdentity) -> Result<(), DiscoveryError> {
        self.start_listener(Some(identity.node_id))?;
        self.start_announcer(identity)
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.registry.snapshot()
    }

    /// Stop both loops and wait for them to exit.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        while self.tasks.join_next().await.is_some() {}
        info!("Discovery stopped");
    }
}

impl Drop for DiscoveryManager {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
