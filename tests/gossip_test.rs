//! Two nodes gossiping over one in-memory network

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ccn_node::gossip::{GossipSettings, PeerMessage};
use ccn_node::model::{Cid, PeerId};
use ccn_node::node::NewConcept;
use ccn_node::substrate::{MemoryNetwork, MemorySubstrate, Substrate};
use ccn_node::{Node, NodeSettings, SubstrateError};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const TOPIC: &str = "concept-list-test";

/// Memory substrate that can stall every read and hand out an already
/// closed first subscription.
struct FlakySubstrate {
    inner: MemorySubstrate,
    stall_reads: bool,
    close_next_subscription: AtomicBool,
}

impl FlakySubstrate {
    fn new(inner: MemorySubstrate, stall_reads: bool, close_first_subscription: bool) -> Self {
        Self {
            inner,
            stall_reads,
            close_next_subscription: AtomicBool::new(close_first_subscription),
        }
    }
}

#[async_trait::async_trait]
impl Substrate for FlakySubstrate {
    async fn add(&self, data: &[u8]) -> Result<Cid, SubstrateError> {
        self.inner.add(data).await
    }

    async fn get(&self, cid: &str) -> Result<Vec<u8>, SubstrateError> {
        if self.stall_reads {
            std::future::pending::<()>().await;
        }
        self.inner.get(cid).await
    }

    async fn remove(&self, cid: &str) -> Result<(), SubstrateError> {
        self.inner.remove(cid).await
    }

    async fn publish(&self, topic: &str, data: &[u8]) -> Result<(), SubstrateError> {
        self.inner.publish(topic, data).await
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Vec<u8>>, SubstrateError> {
        if self.close_next_subscription.swap(false, Ordering::SeqCst) {
            let (_, closed) = mpsc::channel(1);
            return Ok(closed);
        }
        self.inner.subscribe(topic).await
    }

    async fn connect(&self, peer_addr: &str) -> Result<(), SubstrateError> {
        self.inner.connect(peer_addr).await
    }

    async fn list_peers(&self) -> Result<Vec<PeerId>, SubstrateError> {
        self.inner.list_peers().await
    }

    async fn load(&self, path: &str) -> Result<Option<Vec<u8>>, SubstrateError> {
        self.inner.load(path).await
    }

    async fn save(&self, path: &str, data: &[u8]) -> Result<(), SubstrateError> {
        self.inner.save(path, data).await
    }

    async fn local_id(&self) -> Result<PeerId, SubstrateError> {
        self.inner.local_id().await
    }
}

fn settings() -> NodeSettings {
    NodeSettings {
        gossip: GossipSettings {
            topic: TOPIC.to_string(),
            publish_interval: Duration::from_millis(200),
            discovery_interval: Duration::from_millis(200),
            resubscribe_interval: Duration::from_millis(50),
            ..Default::default()
        },
        ..Default::default()
    }
}

async fn start(network: &Arc<MemoryNetwork>, peer: &str) -> (Arc<Node>, Vec<JoinHandle<()>>) {
    let substrate = Arc::new(MemorySubstrate::new(network.clone(), peer));
    let node = Node::start(substrate, settings()).await.unwrap();
    let tasks = node.spawn_tasks().await.unwrap();
    (node, tasks)
}

fn announcement(peer: &str, cids: &[&str]) -> Vec<u8> {
    PeerMessage {
        peer_id: peer.to_string(),
        owner_guid: format!("owner-of-{}", peer),
        cids: cids.iter().map(|c| c.to_string()).collect::<BTreeSet<_>>(),
        relationships: HashMap::new(),
        tombstones: Vec::new(),
    }
    .encode()
    .unwrap()
}

async fn has_claimed_peer(node: &Node, peer: &str) -> bool {
    node.peers().await.iter().any(|p| p.id == peer)
}

async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..100 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

fn draft(name: &str) -> NewConcept {
    NewConcept {
        name: name.to_string(),
        kind: "Idea".to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_concept_created_on_one_node_reaches_the_other() {
    let network = MemoryNetwork::new();
    let (a, _) = start(&network, "node-a").await;
    let (b, _) = start(&network, "node-b").await;

    let idea = a.create_concept(draft("Gravity")).await.unwrap();

    let guid = idea.guid.clone();
    let b2 = b.clone();
    assert!(
        eventually(|| {
            let b = b2.clone();
            let guid = guid.clone();
            async move { b.get_concept(&guid).await.is_ok() }
        })
        .await
    );
    assert_eq!(b.get_concept(&idea.guid).await.unwrap().name, "Gravity");
}

#[tokio::test]
async fn test_peers_see_each_other_claimed() {
    let network = MemoryNetwork::new();
    let (a, _) = start(&network, "node-a").await;
    let (b, _) = start(&network, "node-b").await;
    a.create_concept(draft("Ping")).await.unwrap();

    let owner_a = a.owner_guid().to_string();
    let b2 = b.clone();
    assert!(
        eventually(|| {
            let b = b2.clone();
            let owner_a = owner_a.clone();
            async move {
                b.peers()
                    .await
                    .iter()
                    .any(|p| p.id == "node-a" && p.owner_guid == owner_a)
            }
        })
        .await
    );
}

#[tokio::test]
async fn test_relationships_propagate() {
    let network = MemoryNetwork::new();
    let (a, _) = start(&network, "node-a").await;
    let (b, _) = start(&network, "node-b").await;

    let sun = a.create_concept(draft("Sun")).await.unwrap();
    let earth = a.create_concept(draft("Earth")).await.unwrap();
    let rel = a
        .create_relationship(&sun.guid, &earth.guid, "orbited-by")
        .await
        .unwrap();
    a.gossip().request_publish();

    let id = rel.id.clone();
    let b2 = b.clone();
    assert!(
        eventually(|| {
            let b = b2.clone();
            let id = id.clone();
            async move { b.get_relationship(&id).await.is_ok() }
        })
        .await
    );
    let merged = b.get_relationship(&rel.id).await.unwrap();
    assert_eq!(merged.source_id, sun.guid);
    assert_eq!(merged.target_id, earth.guid);
}

#[tokio::test]
async fn test_deletion_propagates_and_does_not_resurrect() {
    let network = MemoryNetwork::new();
    let (a, _) = start(&network, "node-a").await;
    let (b, _) = start(&network, "node-b").await;

    let idea = a.create_concept(draft("Phlogiston")).await.unwrap();
    let guid = idea.guid.clone();

    let b2 = b.clone();
    let g = guid.clone();
    assert!(
        eventually(|| {
            let b = b2.clone();
            let g = g.clone();
            async move { b.get_concept(&g).await.is_ok() }
        })
        .await
    );

    a.delete_concept(&guid).await.unwrap();

    let b2 = b.clone();
    let g = guid.clone();
    assert!(
        eventually(|| {
            let b = b2.clone();
            let g = g.clone();
            async move { b.get_concept(&g).await.is_err() }
        })
        .await
    );

    // Several more rounds of gossip must not bring it back on either side.
    tokio::time::sleep(Duration::from_millis(600)).await;
    assert!(a.get_concept(&guid).await.is_err());
    assert!(b.get_concept(&guid).await.is_err());
}

#[tokio::test]
async fn test_shutdown_stops_background_tasks() {
    let network = MemoryNetwork::new();
    let (a, tasks) = start(&network, "node-a").await;

    a.shutdown();
    for task in tasks {
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("task did not stop")
            .unwrap();
    }
}

#[tokio::test]
async fn test_unfetchable_cid_does_not_block_merging_or_shutdown() {
    let network = MemoryNetwork::new();
    let substrate = FlakySubstrate::new(
        MemorySubstrate::new(network.clone(), "node-a"),
        true,
        false,
    );
    let node = Node::start(Arc::new(substrate), settings()).await.unwrap();
    let tasks = node.spawn_tasks().await.unwrap();

    let remote = MemorySubstrate::new(network.clone(), "remote");
    let third = MemorySubstrate::new(network, "third");
    remote
        .publish(TOPIC, &announcement("remote", &["sha256-gone"]))
        .await
        .unwrap();
    third
        .publish(TOPIC, &announcement("third", &[]))
        .await
        .unwrap();

    let n = node.clone();
    assert!(
        eventually(|| {
            let n = n.clone();
            async move { has_claimed_peer(&n, "third").await }
        })
        .await
    );

    node.shutdown();
    for task in tasks {
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("task did not stop")
            .unwrap();
    }
}

#[tokio::test]
async fn test_receiver_resubscribes_after_subscription_closes() {
    let network = MemoryNetwork::new();
    let substrate = FlakySubstrate::new(
        MemorySubstrate::new(network.clone(), "node-a"),
        false,
        true,
    );
    let node = Node::start(Arc::new(substrate), settings()).await.unwrap();
    let _tasks = node.spawn_tasks().await.unwrap();

    let remote = Arc::new(MemorySubstrate::new(network, "remote"));
    let n = node.clone();
    assert!(
        eventually(|| {
            let n = n.clone();
            let remote = remote.clone();
            async move {
                remote
                    .publish(TOPIC, &announcement("remote", &[]))
                    .await
                    .unwrap();
                has_claimed_peer(&n, "remote").await
            }
        })
        .await
    );
}
