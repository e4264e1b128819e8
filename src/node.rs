//! Node wiring
//!
//! Startup sequence:
//! 1. Resolve the local peer ID (fatal on failure)
//! 2. Connect to bootstrap peers (failures logged)
//! 3. Restore the concept, relationship and peer indices
//! 4. Load or generate the owner GUID and ensure the owner concept exists
//! 5. Claim the local peer
//! 6. Load the seed structure, if configured (failures logged)
//!
//! Background tasks are started separately with [`Node::spawn_tasks`].

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::engine::RelationshipEngine;
use crate::error::{GraphError, Result};
use crate::gossip::{GossipSettings, GossipSynchronizer};
use crate::identity::random_guid;
use crate::loader::{BootstrapReport, StructureLoader, StructureSource};
use crate::model::{
    Concept, ConceptFilter, Guid, IndexChange, Peer, PeerId, Relationship, OWNER_TYPE,
};
use crate::store::{
    ConceptRepository, PeerRepository, RelationshipRepository, CHANGE_BUFFER, OWNER_PATH,
};
use crate::substrate::{load_json, save_json, Substrate};

/// Startup options.
#[derive(Debug, Clone, Default)]
pub struct NodeSettings {
    pub gossip: GossipSettings,
    pub bootstrap_peers: Vec<String>,
    pub structure: Option<StructureSource>,
}

/// Fields of a concept created through the API.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewConcept {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub content: String,
}

/// Editable fields of the owner concept.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OwnerUpdate {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OwnerRecord {
    owner_guid: Guid,
}

pub struct Node {
    peer_id: PeerId,
    owner_guid: Guid,
    concepts: Arc<ConceptRepository>,
    relationships: Arc<RelationshipRepository>,
    peers: Arc<PeerRepository>,
    engine: Arc<RelationshipEngine>,
    loader: StructureLoader,
    gossip: Arc<GossipSynchronizer>,
    changes: broadcast::Sender<IndexChange>,
    shutdown: broadcast::Sender<()>,
}

impl Node {
    /// Run the startup sequence. Background tasks are not started.
    pub async fn start(substrate: Arc<dyn Substrate>, settings: NodeSettings) -> Result<Arc<Self>> {
        let peer_id = substrate.local_id().await?;
        info!(peer = %peer_id, "Starting node");

        for addr in &settings.bootstrap_peers {
            match substrate.connect(addr).await {
                Ok(()) => info!(peer = %addr, "Connected to bootstrap peer"),
                Err(e) => warn!(peer = %addr, error = %e, "Failed to connect to bootstrap peer"),
            }
        }

        let (changes, _) = broadcast::channel(CHANGE_BUFFER);
        let (shutdown, _) = broadcast::channel(1);

        let concepts = Arc::new(ConceptRepository::new(substrate.clone(), changes.clone()));
        let relationships = Arc::new(RelationshipRepository::new(substrate.clone()));
        let peers = Arc::new(PeerRepository::new(substrate.clone(), changes.clone()));
        let engine = Arc::new(RelationshipEngine::new(
            concepts.clone(),
            relationships.clone(),
        ));
        let loader = StructureLoader::new(concepts.clone(), engine.clone());
        let gossip = Arc::new(GossipSynchronizer::new(
            substrate.clone(),
            concepts.clone(),
            relationships.clone(),
            peers.clone(),
            engine.clone(),
            peer_id.clone(),
            settings.gossip.clone(),
        ));

        concepts.restore().await?;
        relationships.restore().await?;
        peers.restore().await?;

        let owner_guid = Self::load_or_create_owner(substrate.as_ref()).await?;
        if !concepts.contains(&owner_guid).await {
            concepts
                .add_or_update(Concept::new(owner_guid.clone(), "Owner", "", OWNER_TYPE))
                .await?;
        }
        peers
            .claim_local(&peer_id, &owner_guid, concepts.all_cids().await)
            .await?;

        let node = Arc::new(Self {
            peer_id,
            owner_guid,
            concepts,
            relationships,
            peers,
            engine,
            loader,
            gossip,
            changes,
            shutdown,
        });

        if let Some(source) = &settings.structure {
            if let Err(e) = node.bootstrap(source).await {
                error!(error = %e, "Failed to load concept structure");
            }
        }

        Ok(node)
    }

    async fn load_or_create_owner(substrate: &dyn Substrate) -> Result<Guid> {
        if let Some(record) = load_json::<OwnerRecord>(substrate, OWNER_PATH).await? {
            info!(owner = %record.owner_guid, "Loaded owner identity");
            return Ok(record.owner_guid);
        }
        let record = OwnerRecord {
            owner_guid: random_guid(),
        };
        save_json(substrate, OWNER_PATH, &record).await?;
        info!(owner = %record.owner_guid, "Generated owner identity");
        Ok(record.owner_guid)
    }

    /// Start the gossip publisher, discovery and receiver tasks.
    pub async fn spawn_tasks(&self) -> Result<Vec<JoinHandle<()>>> {
        self.gossip.spawn(&self.shutdown).await
    }

    /// Signal every background task to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }

    pub fn subscribe_changes(&self) -> broadcast::Receiver<IndexChange> {
        self.changes.subscribe()
    }

    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn owner_guid(&self) -> &str {
        &self.owner_guid
    }

    pub fn gossip(&self) -> &Arc<GossipSynchronizer> {
        &self.gossip
    }

    // =========================================================================
    // Concepts
    // =========================================================================

    /// Create a concept with a fresh random GUID and announce it.
    pub async fn create_concept(&self, draft: NewConcept) -> Result<Concept> {
        if draft.name.trim().is_empty() {
            return Err(GraphError::MalformedInput("concept name is required".into()));
        }
        let concept = Concept::new(random_guid(), draft.name, draft.description, draft.kind)
            .with_content(draft.content);
        let stored = self.concepts.add_or_update(concept).await?;
        self.gossip.request_publish();
        Ok(stored)
    }

    pub async fn get_concept(&self, guid: &str) -> Result<Concept> {
        self.concepts.get(guid).await
    }

    pub async fn delete_concept(&self, guid: &str) -> Result<Concept> {
        let removed = self.concepts.delete(guid).await?;
        if let Err(e) = self.engine.detach(guid).await {
            warn!(guid = %guid, error = %e, "Failed to unlink deleted concept");
        }
        self.gossip.request_publish();
        Ok(removed)
    }

    pub async fn query_concepts(&self, filter: &ConceptFilter) -> Vec<Concept> {
        self.concepts.query(filter).await
    }

    pub async fn concepts_snapshot(&self) -> Vec<Concept> {
        self.concepts.snapshot().await
    }

    pub async fn bootstrap(&self, source: &StructureSource) -> Result<BootstrapReport> {
        let report = self.loader.bootstrap_from(source).await?;
        self.gossip.request_publish();
        Ok(report)
    }

    // =========================================================================
    // Owner and peers
    // =========================================================================

    pub async fn owner(&self) -> Result<Concept> {
        self.concepts.get(&self.owner_guid).await
    }

    /// Update the owner concept. The owner GUID never changes.
    pub async fn set_owner(&self, update: OwnerUpdate) -> Result<Concept> {
        let mut owner = self.owner().await?;
        if !update.name.trim().is_empty() {
            owner.name = update.name;
        }
        owner.description = update.description;
        owner.content = update.content;
        owner.timestamp = Utc::now();
        let stored = self.concepts.add_or_update(owner).await?;
        info!(owner = %self.owner_guid, name = %stored.name, "Updated owner");
        self.gossip.request_publish();
        Ok(stored)
    }

    /// Claimed peers, most recent first.
    pub async fn peers(&self) -> Vec<Peer> {
        self.peers.claimed_peers().await
    }

    // =========================================================================
    // Relationships
    // =========================================================================

    pub async fn create_relationship(
        &self,
        source: &str,
        target: &str,
        kind: &str,
    ) -> Result<Relationship> {
        self.engine.create_relationship(source, target, kind).await
    }

    pub async fn get_relationship(&self, id: &str) -> Result<Relationship> {
        self.engine.get(id).await
    }

    pub async fn relationships(&self) -> Vec<Relationship> {
        self.engine.list().await
    }

    pub async fn relationships_by_type(&self, type_guid: &str) -> Vec<Relationship> {
        self.engine.by_type(type_guid).await
    }

    pub async fn relationship_types(&self) -> Vec<Concept> {
        self.engine.relationship_types().await
    }

    pub async fn interact(&self, id: &str, interaction_type: &str) -> Result<Relationship> {
        self.engine.interact(id, interaction_type).await
    }

    pub async fn deepen(&self, id: &str, interaction_type: &str) -> Result<Relationship> {
        self.engine.deepen(id, interaction_type).await
    }

    pub async fn relationship_count(&self) -> usize {
        self.relationships.len().await
    }
}
