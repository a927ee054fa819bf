//! Peer table
//!
//! Tracks every device heard on the mesh: nickname, signal strength,
//! key bundle and when it was last seen. Peers unseen for too long are
//! pruned by the maintenance loop.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

use crate::protocol::PeerId;

/// A device on the mesh
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: PeerId,
    pub nickname: String,
    pub last_seen: Instant,
    pub rssi: Option<i16>,
    pub public_key_data: Option<Vec<u8>>,
}

/// Serializable snapshot of a peer for delegates and diagnostics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: String,
    pub nickname: String,
    pub last_seen_secs: u64,
    pub rssi: Option<i16>,
    pub has_keys: bool,
}

/// Multi-reader peer registry
pub struct PeerTable {
    peers: RwLock<HashMap<PeerId, Peer>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self {
            peers: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or refresh a peer, returning `true` on first sight
    pub async fn add_or_update(
        &self,
        id: PeerId,
        nickname: &str,
        bundle: Option<&[u8]>,
    ) -> bool {
        let mut peers = self.peers.write().await;
        match peers.get_mut(&id) {
            Some(peer) => {
                peer.nickname = nickname.to_string();
                peer.last_seen = Instant::now();
                if let Some(bundle) = bundle {
                    peer.public_key_data = Some(bundle.to_vec());
                }
                false
            }
            None => {
                peers.insert(
                    id,
                    Peer {
                        id,
                        nickname: nickname.to_string(),
                        last_seen: Instant::now(),
                        rssi: None,
                        public_key_data: bundle.map(|b| b.to_vec()),
                    },
                );
                true
            }
        }
    }

    /// Refresh only the last-seen clock
    pub async fn touch(&self, id: &PeerId) {
        if let Some(peer) = self.peers.write().await.get_mut(id) {
            peer.last_seen = Instant::now();
        }
    }

    /// Record the link strength of the most recent reception
    pub async fn update_rssi(&self, id: &PeerId, rssi: i16) {
        if let Some(peer) = self.peers.write().await.get_mut(id) {
            peer.rssi = Some(rssi);
            peer.last_seen = Instant::now();
        }
    }

    /// Look up a peer by id
    pub async fn get(&self, id: &PeerId) -> Option<Peer> {
        self.peers.read().await.get(id).cloned()
    }

    /// Linear scan for a nickname; the table stays small in practice
    pub async fn find_by_nickname(&self, nickname: &str) -> Option<PeerId> {
        self.peers
            .read()
            .await
            .values()
            .find(|peer| peer.nickname == nickname)
            .map(|peer| peer.id)
    }

    /// Remove a peer, returning whether it existed
    pub async fn remove(&self, id: &PeerId) -> bool {
        self.peers.write().await.remove(id).is_some()
    }

    /// Drop peers unseen for longer than `max_age`, returning their ids
    pub async fn prune_stale(&self, max_age: Duration) -> Vec<PeerId> {
        let mut peers = self.peers.write().await;
        let now = Instant::now();
        let stale: Vec<PeerId> = peers
            .values()
            .filter(|peer| now.duration_since(peer.last_seen) > max_age)
            .map(|peer| peer.id)
            .collect();
        for id in &stale {
            peers.remove(id);
        }
        stale
    }

    /// Number of known peers
    pub async fn count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// Snapshot of every peer for diagnostics
    pub async fn snapshot(&self) -> Vec<PeerInfo> {
        self.peers
            .read()
            .await
            .values()
            .map(|peer| PeerInfo {
                id: peer.id.to_string(),
                nickname: peer.nickname.clone(),
                last_seen_secs: peer.last_seen.elapsed().as_secs(),
                rssi: peer.rssi,
                has_keys: peer.public_key_data.is_some(),
            })
            .collect()
    }

    /// Drop every peer
    pub async fn clear(&self) {
        self.peers.write().await.clear();
    }
}

impl Default for PeerTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_first_sight() {
        let table = PeerTable::new();
        let id = PeerId([1; 8]);
        assert!(table.add_or_update(id, "alice", None).await);
        assert!(!table.add_or_update(id, "alice", None).await);
        assert_eq!(table.count().await, 1);
    }

    #[tokio::test]
    async fn test_nickname_update_and_lookup() {
        let table = PeerTable::new();
        let id = PeerId([1; 8]);
        table.add_or_update(id, "alice", None).await;
        table.add_or_update(id, "alice2", None).await;

        assert_eq!(table.find_by_nickname("alice2").await, Some(id));
        assert_eq!(table.find_by_nickname("alice").await, None);
        assert_eq!(table.get(&id).await.unwrap().nickname, "alice2");
    }

    #[tokio::test]
    async fn test_bundle_retained() {
        let table = PeerTable::new();
        let id = PeerId([1; 8]);
        table.add_or_update(id, "alice", Some(&[7u8; 96])).await;
        // An announce without a bundle must not erase the stored keys.
        table.add_or_update(id, "alice", None).await;
        assert!(table.get(&id).await.unwrap().public_key_data.is_some());
    }

    #[tokio::test]
    async fn test_prune_stale() {
        let table = PeerTable::new();
        let fresh = PeerId([1; 8]);
        let stale = PeerId([2; 8]);
        table.add_or_update(stale, "old", None).await;
        {
            let mut peers = table.peers.write().await;
            peers.get_mut(&stale).unwrap().last_seen =
                Instant::now() - Duration::from_secs(11 * 60);
        }
        table.add_or_update(fresh, "new", None).await;

        let lost = table.prune_stale(Duration::from_secs(10 * 60)).await;
        assert_eq!(lost, vec![stale]);
        assert_eq!(table.count().await, 1);
        assert!(table.get(&fresh).await.is_some());
    }

    #[tokio::test]
    async fn test_rssi() {
        let table = PeerTable::new();
        let id = PeerId([1; 8]);
        table.add_or_update(id, "alice", None).await;
        table.update_rssi(&id, -63).await;
        assert_eq!(table.get(&id).await.unwrap().rssi, Some(-63));

        let snapshot = table.snapshot().await;
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].rssi, Some(-63));
    }
}
