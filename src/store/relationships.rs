//! Relationship repository

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use super::RELATIONSHIPS_PATH;
use crate::error::{GraphError, Result};
use crate::model::{Guid, Relationship};
use crate::substrate::{load_json, save_json, Substrate};

pub struct RelationshipRepository {
    substrate: Arc<dyn Substrate>,
    relationships: RwLock<HashMap<Guid, Relationship>>,
}

impl RelationshipRepository {
    pub fn new(substrate: Arc<dyn Substrate>) -> Self {
        Self {
            substrate,
            relationships: RwLock::new(HashMap::new()),
        }
    }

    /// Insert or overwrite by ID, then persist.
    pub async fn upsert(&self, relationship: Relationship) -> Result<Relationship> {
        {
            let mut relationships = self.relationships.write().await;
            relationships.insert(relationship.id.clone(), relationship.clone());
        }
        self.persist().await?;
        Ok(relationship)
    }

    /// Apply `change` to a copy of the relationship and keep it only if the
    /// change succeeds.
    pub async fn update<F>(&self, id: &str, change: F) -> Result<Relationship>
    where
        F: FnOnce(&mut Relationship) -> Result<()>,
    {
        let updated = {
            let mut relationships = self.relationships.write().await;
            let current = relationships
                .get_mut(id)
                .ok_or_else(|| GraphError::not_found("relationship", id))?;
            let mut next = current.clone();
            change(&mut next)?;
            *current = next.clone();
            next
        };
        self.persist().await?;
        Ok(updated)
    }

    /// Insert the relationships whose IDs are not known yet. Known IDs are
    /// left untouched. Returns the inserted relationships.
    pub async fn merge_missing(
        &self,
        incoming: HashMap<Guid, Relationship>,
    ) -> Result<Vec<Relationship>> {
        let inserted: Vec<Relationship> = {
            let mut relationships = self.relationships.write().await;
            incoming
                .into_iter()
                .filter_map(|(id, rel)| {
                    if relationships.contains_key(&id) {
                        return None;
                    }
                    relationships.insert(id, rel.clone());
                    Some(rel)
                })
                .collect()
        };

        if !inserted.is_empty() {
            self.persist().await?;
            debug!(count = inserted.len(), "Merged remote relationships");
        }
        Ok(inserted)
    }

    pub async fn get(&self, id: &str) -> Result<Relationship> {
        self.relationships
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| GraphError::not_found("relationship", id))
    }

    pub async fn list(&self) -> Vec<Relationship> {
        self.relationships.read().await.values().cloned().collect()
    }

    /// Relationships whose type is the given relationship-type GUID.
    pub async fn by_type(&self, type_guid: &str) -> Vec<Relationship> {
        self.relationships
            .read()
            .await
            .values()
            .filter(|r| r.kind == type_guid)
            .cloned()
            .collect()
    }

    /// The full index keyed by ID, as gossiped.
    pub async fn snapshot(&self) -> HashMap<Guid, Relationship> {
        self.relationships.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.relationships.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn persist(&self) -> Result<()> {
        let all: BTreeMap<Guid, Relationship> = self
            .relationships
            .read()
            .await
            .iter()
            .map(|(id, r)| (id.clone(), r.clone()))
            .collect();
        save_json(self.substrate.as_ref(), RELATIONSHIPS_PATH, &all).await?;
        Ok(())
    }

    pub async fn restore(&self) -> Result<usize> {
        let saved: HashMap<Guid, Relationship> =
            load_json(self.substrate.as_ref(), RELATIONSHIPS_PATH)
                .await?
                .unwrap_or_default();
        let count = saved.len();
        *self.relationships.write().await = saved;
        info!(count, "Restored relationship index");
        Ok(count)
    }
}
