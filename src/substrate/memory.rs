//! In-process substrate
//!
//! Several [`MemorySubstrate`] nodes attached to one [`MemoryNetwork`] behave
//! like a small content-addressed swarm: each node pins its own blobs, `get`
//! falls back to blobs pinned by other members, and pubsub fans out to every
//! subscriber on the network (including the publisher).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use super::{Substrate, SUBSCRIPTION_BUFFER};
use crate::error::SubstrateError;
use crate::model::{Cid, PeerId};

/// Compute the content address used by the in-memory substrate.
pub fn compute_cid(data: &[u8]) -> Cid {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("sha256-{}", hex::encode(hasher.finalize()))
}

#[derive(Default)]
struct NodeState {
    blobs: DashMap<Cid, Vec<u8>>,
    files: DashMap<String, Vec<u8>>,
    offline: AtomicBool,
}

/// Shared medium connecting in-memory nodes.
#[derive(Default)]
pub struct MemoryNetwork {
    nodes: DashMap<PeerId, Arc<NodeState>>,
    topics: DashMap<String, broadcast::Sender<Vec<u8>>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn topic(&self, topic: &str) -> broadcast::Sender<Vec<u8>> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(SUBSCRIPTION_BUFFER).0)
            .clone()
    }

    /// Peer IDs of every attached node.
    pub fn members(&self) -> Vec<PeerId> {
        self.nodes.iter().map(|n| n.key().clone()).collect()
    }
}

/// One node's view of a [`MemoryNetwork`].
#[derive(Clone)]
pub struct MemorySubstrate {
    network: Arc<MemoryNetwork>,
    peer_id: PeerId,
    state: Arc<NodeState>,
}

impl MemorySubstrate {
    /// Attach a node to `network`. Re-attaching an existing peer ID reuses
    /// its pinned blobs and files, like restarting a node on the same repo.
    pub fn new(network: Arc<MemoryNetwork>, peer_id: impl Into<PeerId>) -> Self {
        let peer_id = peer_id.into();
        let state = network
            .nodes
            .entry(peer_id.clone())
            .or_insert_with(|| Arc::new(NodeState::default()))
            .clone();
        Self {
            network,
            peer_id,
            state,
        }
    }

    /// A node alone on its own network.
    pub fn standalone(peer_id: impl Into<PeerId>) -> Self {
        Self::new(MemoryNetwork::new(), peer_id)
    }

    /// Simulate an unreachable substrate: writes, reads and pubsub fail.
    pub fn set_offline(&self, offline: bool) {
        self.state.offline.store(offline, Ordering::SeqCst);
    }

    fn check_online(&self) -> Result<(), SubstrateError> {
        if self.state.offline.load(Ordering::SeqCst) {
            return Err(SubstrateError::Unavailable(format!(
                "memory node {} is offline",
                self.peer_id
            )));
        }
        Ok(())
    }

    /// Whether this node pins `cid` locally.
    pub fn is_pinned(&self, cid: &str) -> bool {
        self.state.blobs.contains_key(cid)
    }
}

#[async_trait::async_trait]
impl Substrate for MemorySubstrate {
    async fn add(&self, data: &[u8]) -> Result<Cid, SubstrateError> {
        self.check_online()?;
        let cid = compute_cid(data);
        self.state.blobs.insert(cid.clone(), data.to_vec());
        Ok(cid)
    }

    async fn get(&self, cid: &str) -> Result<Vec<u8>, SubstrateError> {
        self.check_online()?;
        if let Some(blob) = self.state.blobs.get(cid) {
            return Ok(blob.value().clone());
        }
        for node in self.network.nodes.iter() {
            if node.offline.load(Ordering::SeqCst) {
                continue;
            }
            if let Some(blob) = node.blobs.get(cid) {
                return Ok(blob.value().clone());
            }
        }
        Err(SubstrateError::NotFound(cid.to_string()))
    }

    async fn remove(&self, cid: &str) -> Result<(), SubstrateError> {
        self.check_online()?;
        self.state.blobs.remove(cid);
        Ok(())
    }

    async fn publish(&self, topic: &str, data: &[u8]) -> Result<(), SubstrateError> {
        self.check_online()?;
        // No subscribers is not an error.
        let _ = self.network.topic(topic).send(data.to_vec());
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Vec<u8>>, SubstrateError> {
        self.check_online()?;
        let mut source = self.network.topic(topic).subscribe();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let topic = topic.to_string();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = source.recv() => match msg {
                        Ok(data) => {
                            if tx.send(data).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(topic = %topic, skipped, "Subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = tx.closed() => break,
                }
            }
        });

        Ok(rx)
    }

    async fn connect(&self, peer_addr: &str) -> Result<(), SubstrateError> {
        self.check_online()?;
        if self.network.nodes.contains_key(peer_addr) {
            Ok(())
        } else {
            Err(SubstrateError::Unavailable(format!(
                "no such memory peer: {}",
                peer_addr
            )))
        }
    }

    async fn list_peers(&self) -> Result<Vec<PeerId>, SubstrateError> {
        self.check_online()?;
        Ok(self
            .network
            .members()
            .into_iter()
            .filter(|id| *id != self.peer_id)
            .collect())
    }

    async fn load(&self, path: &str) -> Result<Option<Vec<u8>>, SubstrateError> {
        self.check_online()?;
        Ok(self.state.files.get(path).map(|f| f.value().clone()))
    }

    async fn save(&self, path: &str, data: &[u8]) -> Result<(), SubstrateError> {
        self.check_online()?;
        self.state.files.insert(path.to_string(), data.to_vec());
        Ok(())
    }

    async fn local_id(&self) -> Result<PeerId, SubstrateError> {
        self.check_online()?;
        Ok(self.peer_id.clone())
    }
}
