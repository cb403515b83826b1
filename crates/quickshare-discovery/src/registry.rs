use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use quickshare_types::Peer;

/// Live peer set, written by the listener and read by anyone holding a clone.
#[derive(Debug, Clone, Default)]
pub struct PeerRegistry {
    peers: Arc<DashMap<Uuid, Peer>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a peer. Returns true if the peer was not known.
    pub fn upsert(&self, peer: Peer) -> bool {
        self.peers.insert(peer.id, peer).is_none()
    }

    pub fn get(&self, id: &Uuid) -> Option<Peer> {
        self.peers.get(id).map(|entry| entry.value().clone())
    }

    pub fn remove(&self, id: &Uuid) -> Option<Peer> {
        self.peers.remove(id).map(|(_, peer)| peer)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Plain copy of the current peers, sorted by name then id.
    pub fn snapshot(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.iter().map(|entry| entry.value().clone()).collect();
        peers.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
        peers
    }

    /// Evict peers silent for longer than `max_age`.
    pub fn evict_stale(&self, max_age: Duration) -> Vec<Peer> {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        self.evict_older_than(Utc::now() - max_age)
    }

    /// Evict peers whose last announcement predates `cutoff`.
    pub fn evict_older_than(&self, cutoff: DateTime<Utc>) -> Vec<Peer> {
        let stale: Vec<Uuid> = self
            .peers
            .iter()
            .filter(|entry| entry.value().last_seen < cutoff)
            .map(|entry| *entry.key())
            .collect();

        // Re-check under the shard lock: the peer may have re-announced since.
        stale
            .into_iter()
            .filter_map(|id| self.peers.remove_if(&id, |_, p| p.last_seen < cutoff))
            .map(|(_, peer)| peer)
            .collect()
    }
}
