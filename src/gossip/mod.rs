//! Gossip synchronizer
//!
//! Four long-lived tasks share one [`GossipSynchronizer`]:
//!
//! - publisher: announces this node's state every publish interval, and
//!   immediately when [`request_publish`](GossipSynchronizer::request_publish)
//!   is called
//! - discovery: adds newly seen substrate peers, unclaimed
//! - receiver: drains the topic subscription into [`handle_message`](GossipSynchronizer::handle_message),
//!   resubscribing if the subscription closes
//! - resolver: fetches pending CIDs, each bounded by the fetch timeout
//!
//! Every task races its current unit of work against the shutdown channel.
//! Errors are logged and the task carries on at its next tick.

pub mod message;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::engine::RelationshipEngine;
use crate::error::Result;
use crate::model::{Concept, PeerId};
use crate::store::{ConceptRepository, PeerRepository, RelationshipRepository};
use crate::substrate::Substrate;

pub use message::PeerMessage;

/// Gossip timing and topic.
#[derive(Debug, Clone)]
pub struct GossipSettings {
    pub topic: String,
    pub publish_interval: Duration,
    pub discovery_interval: Duration,
    /// Upper bound on fetching one pending CID.
    pub fetch_timeout: Duration,
    /// Delay before retrying a closed or failed subscription.
    pub resubscribe_interval: Duration,
}

impl Default for GossipSettings {
    fn default() -> Self {
        Self {
            topic: "concept-list".to_string(),
            publish_interval: Duration::from_secs(60),
            discovery_interval: Duration::from_secs(300),
            fetch_timeout: Duration::from_secs(30),
            resubscribe_interval: Duration::from_secs(5),
        }
    }
}

/// What merging one message changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MergeSummary {
    /// Message came from this node and was skipped.
    pub own_message: bool,
    pub relationships: usize,
    pub pending: usize,
    pub deleted: usize,
}

pub struct GossipSynchronizer {
    substrate: Arc<dyn Substrate>,
    concepts: Arc<ConceptRepository>,
    relationships: Arc<RelationshipRepository>,
    peers: Arc<PeerRepository>,
    engine: Arc<RelationshipEngine>,
    local_peer: PeerId,
    settings: GossipSettings,
    publish_now: Notify,
    resolve_now: Notify,
}

impl GossipSynchronizer {
    pub fn new(
        substrate: Arc<dyn Substrate>,
        concepts: Arc<ConceptRepository>,
        relationships: Arc<RelationshipRepository>,
        peers: Arc<PeerRepository>,
        engine: Arc<RelationshipEngine>,
        local_peer: PeerId,
        settings: GossipSettings,
    ) -> Self {
        Self {
            substrate,
            concepts,
            relationships,
            peers,
            engine,
            local_peer,
            settings,
            publish_now: Notify::new(),
            resolve_now: Notify::new(),
        }
    }

    pub fn topic(&self) -> &str {
        &self.settings.topic
    }

    /// Wake the publisher outside its timer.
    pub fn request_publish(&self) {
        self.publish_now.notify_one();
    }

    /// Wake the resolver to retry pending CIDs.
    pub fn request_resolve(&self) {
        self.resolve_now.notify_one();
    }

    // =========================================================================
    // Outbound
    // =========================================================================

    /// Publish this node's state once. Returns false if the local peer is
    /// not claimed yet.
    pub async fn publish_once(&self) -> Result<bool> {
        let owner_guid = match self.peers.get(&self.local_peer).await {
            Ok(peer) if peer.is_claimed() => peer.owner_guid,
            _ => {
                warn!(peer = %self.local_peer, "Local peer unclaimed, skipping publish");
                return Ok(false);
            }
        };

        let cids = self.concepts.all_cids().await;
        let message = PeerMessage {
            peer_id: self.local_peer.clone(),
            owner_guid: owner_guid.clone(),
            cids: cids.clone(),
            relationships: self.relationships.snapshot().await,
            tombstones: self.concepts.tombstones().await,
        };
        let bytes = message.encode()?;
        self.substrate.publish(&self.settings.topic, &bytes).await?;

        self.peers
            .record_announcement(&self.local_peer, &owner_guid, cids)
            .await?;
        info!(
            topic = %self.settings.topic,
            cids = message.cids.len(),
            relationships = message.relationships.len(),
            tombstones = message.tombstones.len(),
            "Published concept list"
        );
        Ok(true)
    }

    /// Record substrate peers not seen before, then schedule a retry of
    /// pending CIDs.
    pub async fn discover_once(&self) -> Result<usize> {
        let seen: Vec<PeerId> = self
            .substrate
            .list_peers()
            .await?
            .into_iter()
            .filter(|id| *id != self.local_peer)
            .collect();
        let added = self.peers.add_discovered(seen).await?;
        if added > 0 {
            info!(added, "Discovered new peers");
        }
        self.request_resolve();
        Ok(added)
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    /// Merge one gossip message. Pending CIDs are left to the resolver.
    pub async fn handle_message(&self, bytes: &[u8]) -> Result<MergeSummary> {
        let message = PeerMessage::decode(bytes)?;
        if message.peer_id == self.local_peer {
            return Ok(MergeSummary {
                own_message: true,
                ..Default::default()
            });
        }

        let mut summary = MergeSummary::default();
        self.peers
            .record_announcement(&message.peer_id, &message.owner_guid, message.cids.clone())
            .await?;

        summary.relationships = self.engine.merge_remote(message.relationships).await?;

        let mut unknown = Vec::new();
        for cid in &message.cids {
            if !self.concepts.has_cid(cid).await {
                unknown.push(cid.clone());
            }
        }
        summary.pending = self.concepts.mark_pending(unknown).await;
        if summary.pending > 0 {
            info!(peer = %message.peer_id, pending = summary.pending, "Peer advertises unknown CIDs");
        }

        for tombstone in message.tombstones {
            let guid = tombstone.guid.clone();
            if self.concepts.apply_tombstone(tombstone).await? {
                self.engine.detach(&guid).await?;
                summary.deleted += 1;
            }
        }

        if !self.concepts.pending().await.is_empty() {
            self.request_resolve();
        }

        info!(
            peer = %message.peer_id,
            relationships = summary.relationships,
            pending = summary.pending,
            deleted = summary.deleted,
            "Merged peer announcement"
        );
        Ok(summary)
    }

    /// Fetch and adopt pending CIDs. CIDs that cannot be fetched within the
    /// fetch timeout stay pending. CIDs whose content is not a concept are
    /// dropped. Returns the number adopted.
    pub async fn resolve_pending(&self) -> usize {
        let mut adopted = 0;
        for cid in self.concepts.pending().await {
            if self.concepts.has_cid(&cid).await {
                self.concepts.clear_pending(&cid).await;
                continue;
            }

            let fetch = self.substrate.get(&cid);
            let bytes = match tokio::time::timeout(self.settings.fetch_timeout, fetch).await {
                Ok(Ok(bytes)) => bytes,
                Ok(Err(e)) => {
                    debug!(cid = %cid, error = %e, "Pending CID not retrievable yet");
                    continue;
                }
                Err(_) => {
                    debug!(cid = %cid, timeout = ?self.settings.fetch_timeout, "Timed out fetching pending CID");
                    continue;
                }
            };
            let concept = match Concept::from_content(&cid, &bytes) {
                Ok(concept) => concept,
                Err(e) => {
                    warn!(cid = %cid, error = %e, "Dropping pending CID that is not a concept");
                    self.concepts.clear_pending(&cid).await;
                    continue;
                }
            };

            match self.concepts.adopt(concept).await {
                Ok(outcome) => {
                    self.concepts.clear_pending(&cid).await;
                    if outcome.is_adopted() {
                        adopted += 1;
                    } else {
                        debug!(cid = %cid, ?outcome, "Discarded pending concept");
                    }
                }
                Err(e) => warn!(cid = %cid, error = %e, "Failed to adopt pending concept"),
            }
        }
        adopted
    }

    // =========================================================================
    // Tasks
    // =========================================================================

    /// Subscribe to the topic and spawn the publisher, discovery, receiver
    /// and resolver tasks.
    pub async fn spawn(
        self: &Arc<Self>,
        shutdown: &broadcast::Sender<()>,
    ) -> Result<Vec<JoinHandle<()>>> {
        let inbound = self.substrate.subscribe(&self.settings.topic).await?;
        info!(topic = %self.settings.topic, "Subscribed to gossip topic");

        Ok(vec![
            tokio::spawn(self.clone().run_publisher(shutdown.subscribe())),
            tokio::spawn(self.clone().run_discovery(shutdown.subscribe())),
            tokio::spawn(self.clone().run_receiver(inbound, shutdown.subscribe())),
            tokio::spawn(self.clone().run_resolver(shutdown.subscribe())),
        ])
    }

    async fn run_publisher(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut timer = tokio::time::interval(self.settings.publish_interval);
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = timer.tick() => {}
                _ = self.publish_now.notified() => {}
            }
            tokio::select! {
                _ = shutdown.recv() => break,
                result = self.publish_once() => {
                    if let Err(e) = result {
                        error!(error = %e, "Publish failed");
                    }
                }
            }
        }
        debug!("Publisher stopped");
    }

    async fn run_discovery(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut timer = tokio::time::interval(self.settings.discovery_interval);
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = timer.tick() => {}
            }
            tokio::select! {
                _ = shutdown.recv() => break,
                result = self.discover_once() => {
                    if let Err(e) = result {
                        error!(error = %e, "Peer discovery failed");
                    }
                }
            }
        }
        debug!("Discovery stopped");
    }

    async fn run_receiver(
        self: Arc<Self>,
        mut inbound: mpsc::Receiver<Vec<u8>>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            let next = tokio::select! {
                _ = shutdown.recv() => break,
                msg = inbound.recv() => msg,
            };
            let Some(bytes) = next else {
                warn!(topic = %self.settings.topic, "Gossip subscription closed, resubscribing");
                match self.resubscribe(&mut shutdown).await {
                    Some(queue) => {
                        inbound = queue;
                        continue;
                    }
                    None => break,
                }
            };
            tokio::select! {
                _ = shutdown.recv() => break,
                result = self.handle_message(&bytes) => {
                    if let Err(e) = result {
                        warn!(error = %e, "Dropping gossip message");
                    }
                }
            }
        }
        debug!("Receiver stopped");
    }

    /// Retry the topic subscription every resubscribe interval until it
    /// succeeds. `None` if shutdown fired first.
    async fn resubscribe(
        &self,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Option<mpsc::Receiver<Vec<u8>>> {
        loop {
            tokio::select! {
                _ = shutdown.recv() => return None,
                _ = tokio::time::sleep(self.settings.resubscribe_interval) => {}
            }
            let attempt = tokio::select! {
                _ = shutdown.recv() => return None,
                attempt = self.substrate.subscribe(&self.settings.topic) => attempt,
            };
            match attempt {
                Ok(queue) => {
                    info!(topic = %self.settings.topic, "Resubscribed to gossip topic");
                    return Some(queue);
                }
                Err(e) => warn!(topic = %self.settings.topic, error = %e, "Resubscribe failed"),
            }
        }
    }

    async fn run_resolver(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = self.resolve_now.notified() => {}
            }
            tokio::select! {
                _ = shutdown.recv() => break,
                adopted = self.resolve_pending() => {
                    if adopted > 0 {
                        info!(adopted, "Adopted pending concepts");
                    }
                }
            }
        }
        debug!("Resolver stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SubstrateError;
    use crate::model::{Cid, Relationship};
    use crate::substrate::{MemoryNetwork, MemorySubstrate};
    use std::collections::{BTreeSet, HashMap};

    /// Memory substrate whose reads never complete.
    struct StalledReads(MemorySubstrate);

    #[async_trait::async_trait]
    impl Substrate for StalledReads {
        async fn add(&self, data: &[u8]) -> std::result::Result<Cid, SubstrateError> {
            self.0.add(data).await
        }
        async fn get(&self, _cid: &str) -> std::result::Result<Vec<u8>, SubstrateError> {
            std::future::pending().await
        }
        async fn remove(&self, cid: &str) -> std::result::Result<(), SubstrateError> {
            self.0.remove(cid).await
        }
        async fn publish(&self, topic: &str, data: &[u8]) -> std::result::Result<(), SubstrateError> {
            self.0.publish(topic, data).await
        }
        async fn subscribe(
            &self,
            topic: &str,
        ) -> std::result::Result<mpsc::Receiver<Vec<u8>>, SubstrateError> {
            self.0.subscribe(topic).await
        }
        async fn connect(&self, peer_addr: &str) -> std::result::Result<(), SubstrateError> {
            self.0.connect(peer_addr).await
        }
        async fn list_peers(&self) -> std::result::Result<Vec<PeerId>, SubstrateError> {
            self.0.list_peers().await
        }
        async fn load(&self, path: &str) -> std::result::Result<Option<Vec<u8>>, SubstrateError> {
            self.0.load(path).await
        }
        async fn save(&self, path: &str, data: &[u8]) -> std::result::Result<(), SubstrateError> {
            self.0.save(path, data).await
        }
        async fn local_id(&self) -> std::result::Result<PeerId, SubstrateError> {
            self.0.local_id().await
        }
    }

    struct Fixture {
        gossip: GossipSynchronizer,
        concepts: Arc<ConceptRepository>,
        relationships: Arc<RelationshipRepository>,
        peers: Arc<PeerRepository>,
    }

    fn fixture(substrate: MemorySubstrate, peer: &str) -> Fixture {
        fixture_with(Arc::new(substrate), peer, GossipSettings::default())
    }

    fn fixture_with(substrate: Arc<dyn Substrate>, peer: &str, settings: GossipSettings) -> Fixture {
        let (tx, _) = broadcast::channel(16);
        let concepts = Arc::new(ConceptRepository::new(substrate.clone(), tx.clone()));
        let relationships = Arc::new(RelationshipRepository::new(substrate.clone()));
        let peers = Arc::new(PeerRepository::new(substrate.clone(), tx));
        let engine = Arc::new(RelationshipEngine::new(
            concepts.clone(),
            relationships.clone(),
        ));
        let gossip = GossipSynchronizer::new(
            substrate,
            concepts.clone(),
            relationships.clone(),
            peers.clone(),
            engine,
            peer.to_string(),
            settings,
        );
        Fixture {
            gossip,
            concepts,
            relationships,
            peers,
        }
    }

    fn message(peer: &str) -> PeerMessage {
        PeerMessage {
            peer_id: peer.into(),
            owner_guid: format!("owner-of-{}", peer),
            cids: BTreeSet::new(),
            relationships: HashMap::new(),
            tombstones: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_unclaimed_node_does_not_publish() {
        let f = fixture(MemorySubstrate::standalone("local"), "local");
        assert!(!f.gossip.publish_once().await.unwrap());

        f.peers
            .claim_local("local", &"owner".to_string(), BTreeSet::new())
            .await
            .unwrap();
        assert!(f.gossip.publish_once().await.unwrap());
    }

    #[tokio::test]
    async fn test_own_messages_ignored() {
        let f = fixture(MemorySubstrate::standalone("local"), "local");
        let summary = f
            .gossip
            .handle_message(&message("local").encode().unwrap())
            .await
            .unwrap();
        assert!(summary.own_message);
        assert!(f.peers.all().await.is_empty());
    }

    #[tokio::test]
    async fn test_merge_records_peer_and_new_relationships_only() {
        let f = fixture(MemorySubstrate::standalone("local"), "local");
        let mut local = Relationship::new("a", "t", "b");
        local.volume = 9.0;
        f.relationships.upsert(local.clone()).await.unwrap();

        let mut msg = message("remote");
        let mut remote_copy = local.clone();
        remote_copy.volume = 0.1;
        let fresh = Relationship::new("c", "t", "d");
        msg.relationships.insert(remote_copy.id.clone(), remote_copy);
        msg.relationships.insert(fresh.id.clone(), fresh.clone());

        let summary = f
            .gossip
            .handle_message(&msg.encode().unwrap())
            .await
            .unwrap();
        assert_eq!(summary.relationships, 1);
        assert_eq!(f.relationships.get(&local.id).await.unwrap().volume, 9.0);
        assert!(f.relationships.get(&fresh.id).await.is_ok());

        let peer = f.peers.get("remote").await.unwrap();
        assert_eq!(peer.owner_guid, "owner-of-remote");
    }

    #[tokio::test]
    async fn test_unknown_cids_resolved_through_substrate() {
        let network = MemoryNetwork::new();
        let remote = fixture(MemorySubstrate::new(network.clone(), "remote"), "remote");
        let local = fixture(MemorySubstrate::new(network, "local"), "local");

        let tree = remote
            .concepts
            .add_or_update(Concept::named("Tree", "A plant", "Category"))
            .await
            .unwrap();

        let mut msg = message("remote");
        msg.cids.insert(tree.cid.clone());
        msg.cids.insert("sha256-missing".into());

        let summary = local
            .gossip
            .handle_message(&msg.encode().unwrap())
            .await
            .unwrap();
        assert_eq!(summary.pending, 2);
        assert!(!local.concepts.contains(&tree.guid).await);

        assert_eq!(local.gossip.resolve_pending().await, 1);
        assert_eq!(local.concepts.get(&tree.guid).await.unwrap(), tree);
        assert_eq!(local.concepts.pending().await, vec!["sha256-missing".to_string()]);
    }

    #[tokio::test]
    async fn test_undecodable_pending_cid_is_dropped() {
        let network = MemoryNetwork::new();
        let remote = MemorySubstrate::new(network.clone(), "remote");
        let local = fixture(MemorySubstrate::new(network, "local"), "local");
        let junk = remote.add(b"not a concept").await.unwrap();

        let mut msg = message("remote");
        msg.cids.insert(junk);
        local
            .gossip
            .handle_message(&msg.encode().unwrap())
            .await
            .unwrap();

        assert_eq!(local.gossip.resolve_pending().await, 0);
        assert!(local.concepts.pending().await.is_empty());
    }

    #[tokio::test]
    async fn test_stalled_fetch_times_out_and_stays_pending() {
        let settings = GossipSettings {
            fetch_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let substrate = StalledReads(MemorySubstrate::standalone("local"));
        let f = fixture_with(Arc::new(substrate), "local", settings);

        let mut msg = message("remote");
        msg.cids.insert("sha256-gone".into());
        let summary = f
            .gossip
            .handle_message(&msg.encode().unwrap())
            .await
            .unwrap();
        assert_eq!(summary.pending, 1);

        let adopted = tokio::time::timeout(Duration::from_secs(2), f.gossip.resolve_pending())
            .await
            .expect("fetch was not bounded");
        assert_eq!(adopted, 0);
        assert_eq!(f.concepts.pending().await, vec!["sha256-gone".to_string()]);
    }

    #[tokio::test]
    async fn test_garbage_message_is_rejected() {
        let f = fixture(MemorySubstrate::standalone("local"), "local");
        assert!(f.gossip.handle_message(b"{{{").await.is_err());
        assert!(f.peers.all().await.is_empty());
    }

    #[tokio::test]
    async fn test_discovery_adds_unclaimed_peers() {
        let network = MemoryNetwork::new();
        let local = fixture(MemorySubstrate::new(network.clone(), "local"), "local");
        let _other = MemorySubstrate::new(network, "other");

        assert_eq!(local.gossip.discover_once().await.unwrap(), 1);
        assert!(local.peers.claimed_peers().await.is_empty());
        assert!(!local.peers.get("other").await.unwrap().is_claimed());
    }
}
