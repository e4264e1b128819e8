//! Concept repository
//!
//! Owns the concept map and the GUID→CID index (one lock), the tombstone set
//! and the pending-CID set (one lock each).

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use super::{GUID2CID_PATH, TOMBSTONES_PATH};
use crate::error::{GraphError, Result, SubstrateError};
use crate::model::{Cid, Concept, ConceptFilter, Guid, IndexChange, Tombstone};
use crate::substrate::{load_json, save_json, Substrate};

#[derive(Default)]
struct ConceptIndex {
    concepts: HashMap<Guid, Concept>,
    cids: HashMap<Guid, Cid>,
}

/// Outcome of offering a remote concept to the repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adoption {
    /// Unknown GUID, now stored.
    Added,
    /// Known GUID replaced by a strictly newer copy.
    Replaced,
    /// Local copy is as new or newer.
    Stale,
    /// Deleted at or after the copy's timestamp.
    Tombstoned,
}

impl Adoption {
    pub fn is_adopted(self) -> bool {
        matches!(self, Adoption::Added | Adoption::Replaced)
    }
}

pub struct ConceptRepository {
    substrate: Arc<dyn Substrate>,
    index: RwLock<ConceptIndex>,
    tombstones: RwLock<HashMap<Guid, Tombstone>>,
    pending: RwLock<BTreeSet<Cid>>,
    changes: broadcast::Sender<IndexChange>,
}

impl ConceptRepository {
    pub fn new(substrate: Arc<dyn Substrate>, changes: broadcast::Sender<IndexChange>) -> Self {
        Self {
            substrate,
            index: RwLock::new(ConceptIndex::default()),
            tombstones: RwLock::new(HashMap::new()),
            pending: RwLock::new(BTreeSet::new()),
            changes,
        }
    }

    fn notify(&self) {
        // No live-feed subscribers is fine.
        let _ = self.changes.send(IndexChange::Concepts);
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Store a concept, recompute its CID and persist the GUID→CID index.
    ///
    /// The in-memory entry is written before the substrate call, so it is
    /// present even if persisting fails.
    pub async fn add_or_update(&self, concept: Concept) -> Result<Concept> {
        let guid = concept.guid.clone();
        {
            let mut index = self.index.write().await;
            index.concepts.insert(guid.clone(), concept);
        }
        self.clear_tombstone(&guid).await?;

        let stored = self.commit(&guid).await?;
        info!(guid = %guid, cid = %stored.cid, name = %stored.name, "Stored concept");
        self.notify();
        Ok(stored)
    }

    /// Append an edge ID to a concept's adjacency list and re-persist it.
    /// Linking is a content change, so the timestamp advances too.
    /// Returns false if the edge was already listed.
    pub async fn link(&self, guid: &str, relationship_id: &str) -> Result<bool> {
        {
            let mut index = self.index.write().await;
            let concept = index
                .concepts
                .get_mut(guid)
                .ok_or_else(|| GraphError::not_found("concept", guid))?;
            if !concept.link(relationship_id) {
                return Ok(false);
            }
            concept.timestamp = Utc::now();
        }
        self.commit(guid).await?;
        debug!(guid = %guid, relationship = %relationship_id, "Linked edge");
        self.notify();
        Ok(true)
    }

    /// Drop an edge ID from a concept's adjacency list and re-persist it.
    /// Returns false if the edge was not listed.
    pub async fn unlink(&self, guid: &str, relationship_id: &str) -> Result<bool> {
        {
            let mut index = self.index.write().await;
            let concept = index
                .concepts
                .get_mut(guid)
                .ok_or_else(|| GraphError::not_found("concept", guid))?;
            let before = concept.relationships.len();
            concept.relationships.retain(|id| id != relationship_id);
            if concept.relationships.len() == before {
                return Ok(false);
            }
            concept.timestamp = Utc::now();
        }
        self.commit(guid).await?;
        debug!(guid = %guid, relationship = %relationship_id, "Unlinked edge");
        self.notify();
        Ok(true)
    }

    /// Hash the current content through the substrate and record the CID.
    async fn commit(&self, guid: &str) -> Result<Concept> {
        let bytes = {
            let index = self.index.read().await;
            index
                .concepts
                .get(guid)
                .ok_or_else(|| GraphError::not_found("concept", guid))?
                .content_bytes()?
        };

        let cid = self.substrate.add(&bytes).await?;

        let (stored, cids) = {
            let mut index = self.index.write().await;
            let ConceptIndex { concepts, cids } = &mut *index;
            let concept = concepts
                .get_mut(guid)
                .ok_or_else(|| GraphError::not_found("concept", guid))?;
            // A concurrent writer may have changed the content meanwhile;
            // its own commit records the newer CID.
            if concept.content_bytes()? == bytes {
                concept.cid = cid.clone();
                cids.insert(guid.to_string(), cid);
            }
            (concept.clone(), sorted(cids))
        };

        save_json(self.substrate.as_ref(), GUID2CID_PATH, &cids).await?;
        Ok(stored)
    }

    /// Remove a concept, unpin its content and record a tombstone.
    pub async fn delete(&self, guid: &str) -> Result<Concept> {
        let (removed, cids) = {
            let mut index = self.index.write().await;
            let removed = index
                .concepts
                .remove(guid)
                .ok_or_else(|| GraphError::not_found("concept", guid))?;
            index.cids.remove(guid);
            (removed, sorted(&index.cids))
        };

        self.unpin(&removed.cid).await;
        save_json(self.substrate.as_ref(), GUID2CID_PATH, &cids).await?;

        let tombstone = Tombstone {
            guid: guid.to_string(),
            deleted_at: Utc::now(),
        };
        {
            let mut tombstones = self.tombstones.write().await;
            tombstones.insert(guid.to_string(), tombstone);
        }
        self.persist_tombstones().await?;

        info!(guid = %guid, name = %removed.name, "Deleted concept");
        self.notify();
        Ok(removed)
    }

    async fn unpin(&self, cid: &str) {
        if cid.is_empty() {
            return;
        }
        match self.substrate.remove(cid).await {
            Ok(()) => debug!(cid = %cid, "Removed content"),
            Err(SubstrateError::Unsupported(op)) => {
                warn!(cid = %cid, op, "Substrate does not support removal")
            }
            Err(e) => warn!(cid = %cid, error = %e, "Failed to remove content"),
        }
    }

    /// Offer a concept fetched from the network. Adopted when the GUID is
    /// unknown or the copy is strictly newer, unless tombstoned at or after
    /// its timestamp.
    pub async fn adopt(&self, concept: Concept) -> Result<Adoption> {
        if let Some(tombstone) = self.tombstone(&concept.guid).await {
            if tombstone.deleted_at >= concept.timestamp {
                return Ok(Adoption::Tombstoned);
            }
        }

        let (outcome, cids) = {
            let mut index = self.index.write().await;
            let outcome = match index.concepts.get(&concept.guid) {
                None => Adoption::Added,
                Some(local) if concept.timestamp > local.timestamp => Adoption::Replaced,
                Some(_) => return Ok(Adoption::Stale),
            };
            index
                .cids
                .insert(concept.guid.clone(), concept.cid.clone());
            index.concepts.insert(concept.guid.clone(), concept.clone());
            (outcome, sorted(&index.cids))
        };

        save_json(self.substrate.as_ref(), GUID2CID_PATH, &cids).await?;
        info!(guid = %concept.guid, cid = %concept.cid, ?outcome, "Adopted remote concept");
        self.notify();
        Ok(outcome)
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn get(&self, guid: &str) -> Result<Concept> {
        let index = self.index.read().await;
        index
            .concepts
            .get(guid)
            .cloned()
            .ok_or_else(|| GraphError::not_found("concept", guid))
    }

    pub async fn contains(&self, guid: &str) -> bool {
        self.index.read().await.concepts.contains_key(guid)
    }

    /// Concepts matching every set field of `filter`.
    pub async fn query(&self, filter: &ConceptFilter) -> Vec<Concept> {
        let index = self.index.read().await;
        index
            .concepts
            .values()
            .filter(|c| filter.matches(c))
            .cloned()
            .collect()
    }

    /// Content addresses this node advertises.
    pub async fn all_cids(&self) -> BTreeSet<Cid> {
        self.index.read().await.cids.values().cloned().collect()
    }

    pub async fn has_cid(&self, cid: &str) -> bool {
        self.index.read().await.cids.values().any(|c| c == cid)
    }

    pub async fn snapshot(&self) -> Vec<Concept> {
        self.index.read().await.concepts.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.index.read().await.concepts.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    // =========================================================================
    // Tombstones
    // =========================================================================

    pub async fn tombstone(&self, guid: &str) -> Option<Tombstone> {
        self.tombstones.read().await.get(guid).cloned()
    }

    pub async fn tombstones(&self) -> Vec<Tombstone> {
        let mut all: Vec<Tombstone> = self.tombstones.read().await.values().cloned().collect();
        all.sort_by(|a, b| a.guid.cmp(&b.guid));
        all
    }

    async fn clear_tombstone(&self, guid: &str) -> Result<()> {
        let cleared = self.tombstones.write().await.remove(guid).is_some();
        if cleared {
            debug!(guid = %guid, "Cleared tombstone");
            self.persist_tombstones().await?;
        }
        Ok(())
    }

    /// Apply a tombstone received from a peer. Returns true if a local
    /// concept was deleted.
    pub async fn apply_tombstone(&self, remote: Tombstone) -> Result<bool> {
        let recorded = {
            let mut tombstones = self.tombstones.write().await;
            match tombstones.get(&remote.guid) {
                Some(local) if local.deleted_at >= remote.deleted_at => false,
                _ => {
                    tombstones.insert(remote.guid.clone(), remote.clone());
                    true
                }
            }
        };
        if recorded {
            self.persist_tombstones().await?;
        }

        let removed = {
            let mut index = self.index.write().await;
            let outdated = index
                .concepts
                .get(&remote.guid)
                .is_some_and(|c| c.timestamp <= remote.deleted_at);
            if outdated {
                index.cids.remove(&remote.guid);
                index
                    .concepts
                    .remove(&remote.guid)
                    .map(|c| (c, sorted(&index.cids)))
            } else {
                None
            }
        };

        match removed {
            Some((concept, cids)) => {
                self.unpin(&concept.cid).await;
                save_json(self.substrate.as_ref(), GUID2CID_PATH, &cids).await?;
                info!(guid = %remote.guid, name = %concept.name, "Deleted concept from remote tombstone");
                self.notify();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn persist_tombstones(&self) -> Result<()> {
        let all = self.tombstones().await;
        save_json(self.substrate.as_ref(), TOMBSTONES_PATH, &all).await?;
        Ok(())
    }

    // =========================================================================
    // Pending CIDs
    // =========================================================================

    /// Record advertised CIDs with no local concept. Returns how many were new.
    pub async fn mark_pending(&self, cids: impl IntoIterator<Item = Cid>) -> usize {
        let mut pending = self.pending.write().await;
        cids.into_iter().filter(|cid| pending.insert(cid.clone())).count()
    }

    pub async fn pending(&self) -> Vec<Cid> {
        self.pending.read().await.iter().cloned().collect()
    }

    pub async fn clear_pending(&self, cid: &str) {
        self.pending.write().await.remove(cid);
    }

    // =========================================================================
    // Startup
    // =========================================================================

    /// Rebuild the index from the persisted GUID→CID document and the
    /// tombstone set. Returns the number of concepts restored.
    pub async fn restore(&self) -> Result<usize> {
        if let Some(saved) =
            load_json::<Vec<Tombstone>>(self.substrate.as_ref(), TOMBSTONES_PATH).await?
        {
            let mut tombstones = self.tombstones.write().await;
            tombstones.extend(saved.into_iter().map(|t| (t.guid.clone(), t)));
        }

        let Some(saved) =
            load_json::<HashMap<Guid, Cid>>(self.substrate.as_ref(), GUID2CID_PATH).await?
        else {
            return Ok(0);
        };

        let mut restored = Vec::with_capacity(saved.len());
        for (guid, cid) in saved {
            let concept = match self.substrate.get(&cid).await {
                Ok(bytes) => Concept::from_content(&cid, &bytes),
                Err(e) => Err(e.into()),
            };
            match concept {
                Ok(concept) if concept.guid == guid => restored.push(concept),
                Ok(concept) => warn!(
                    guid = %guid,
                    cid = %cid,
                    found = %concept.guid,
                    "Persisted CID holds a different concept; skipping"
                ),
                Err(e) => warn!(guid = %guid, cid = %cid, error = %e, "Skipping unreadable concept"),
            }
        }

        let count = restored.len();
        {
            let mut index = self.index.write().await;
            for concept in restored {
                index.cids.insert(concept.guid.clone(), concept.cid.clone());
                index.concepts.insert(concept.guid.clone(), concept);
            }
        }
        info!(count, "Restored concept index");
        Ok(count)
    }
}

fn sorted(cids: &HashMap<Guid, Cid>) -> BTreeMap<Guid, Cid> {
    cids.iter().map(|(g, c)| (g.clone(), c.clone())).collect()
}
