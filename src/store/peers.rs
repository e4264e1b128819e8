//! Peer directory
//!
//! Peers are never pruned. Unclaimed peers (no owner yet) are tracked but
//! hidden from listings and dropped on reload.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info};

use super::PEERS_PATH;
use crate::error::{GraphError, Result};
use crate::model::{Cid, Guid, IndexChange, Peer, PeerId};
use crate::substrate::{load_json, save_json, Substrate};

pub struct PeerRepository {
    substrate: Arc<dyn Substrate>,
    peers: RwLock<HashMap<PeerId, Peer>>,
    changes: broadcast::Sender<IndexChange>,
}

impl PeerRepository {
    pub fn new(substrate: Arc<dyn Substrate>, changes: broadcast::Sender<IndexChange>) -> Self {
        Self {
            substrate,
            peers: RwLock::new(HashMap::new()),
            changes,
        }
    }

    /// Overwrite a peer's record with its latest announcement.
    pub async fn record_announcement(
        &self,
        peer_id: &str,
        owner_guid: &str,
        cids: BTreeSet<Cid>,
    ) -> Result<Peer> {
        let peer = Peer {
            id: peer_id.to_string(),
            owner_guid: owner_guid.to_string(),
            cids,
            timestamp: Utc::now(),
        };
        {
            let mut peers = self.peers.write().await;
            peers.insert(peer.id.clone(), peer.clone());
        }
        self.persist().await?;
        debug!(peer = %peer_id, owner = %owner_guid, cids = peer.cids.len(), "Recorded peer");
        let _ = self.changes.send(IndexChange::Peers);
        Ok(peer)
    }

    /// Claim the local peer for `owner_guid`.
    pub async fn claim_local(
        &self,
        peer_id: &str,
        owner_guid: &Guid,
        cids: BTreeSet<Cid>,
    ) -> Result<Peer> {
        let peer = self.record_announcement(peer_id, owner_guid, cids).await?;
        info!(peer = %peer_id, owner = %owner_guid, "Claimed local peer");
        Ok(peer)
    }

    /// Add peers seen on the network but not yet known, unclaimed.
    /// Returns how many were new.
    pub async fn add_discovered(&self, ids: impl IntoIterator<Item = PeerId>) -> Result<usize> {
        let added = {
            let mut peers = self.peers.write().await;
            let mut added = 0;
            for id in ids {
                if !peers.contains_key(&id) {
                    peers.insert(id.clone(), Peer::unclaimed(id));
                    added += 1;
                }
            }
            added
        };
        self.persist().await?;
        Ok(added)
    }

    pub async fn get(&self, peer_id: &str) -> Result<Peer> {
        self.peers
            .read()
            .await
            .get(peer_id)
            .cloned()
            .ok_or_else(|| GraphError::not_found("peer", peer_id))
    }

    /// Claimed peers, most recently seen first.
    pub async fn claimed_peers(&self) -> Vec<Peer> {
        let mut claimed: Vec<Peer> = self
            .peers
            .read()
            .await
            .values()
            .filter(|p| p.is_claimed())
            .cloned()
            .collect();
        claimed.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));
        claimed
    }

    /// Every tracked peer, claimed or not.
    pub async fn all(&self) -> Vec<Peer> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn persist(&self) -> Result<()> {
        let all: BTreeMap<PeerId, Peer> = self
            .peers
            .read()
            .await
            .iter()
            .map(|(id, p)| (id.clone(), p.clone()))
            .collect();
        save_json(self.substrate.as_ref(), PEERS_PATH, &all).await?;
        Ok(())
    }

    /// Reload the peer index, dropping unclaimed entries.
    pub async fn restore(&self) -> Result<usize> {
        let saved: HashMap<PeerId, Peer> = load_json(self.substrate.as_ref(), PEERS_PATH)
            .await?
            .unwrap_or_default();
        let total = saved.len();
        let claimed: HashMap<PeerId, Peer> =
            saved.into_iter().filter(|(_, p)| p.is_claimed()).collect();
        let count = claimed.len();
        *self.peers.write().await = claimed;
        info!(count, dropped = total - count, "Restored peer index");
        Ok(count)
    }
}
