//! Relationship engine
//!
//! Edge lifecycle and the interaction growth model. Edges are upserted by
//! deterministic ID and recorded in both endpoints' adjacency lists.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::error::{GraphError, Result};
use crate::model::{Concept, ConceptFilter, Guid, Relationship, RELATIONSHIP_TYPE};
use crate::store::{ConceptRepository, RelationshipRepository};

/// Frequency appended by a music interaction.
pub const MUSIC_FREQUENCY: f64 = 440.0;

/// Interaction behaviors, selected by the interaction-type concept's name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InteractionKind {
    Music,
    Meditation,
    FlowState,
    Other,
}

impl InteractionKind {
    pub fn from_name(name: &str) -> Self {
        match name {
            "Music" => InteractionKind::Music,
            "Meditation" => InteractionKind::Meditation,
            "FlowState" => InteractionKind::FlowState,
            _ => InteractionKind::Other,
        }
    }

    fn apply(self, rel: &mut Relationship) {
        match self {
            InteractionKind::Music => {
                rel.frequency_spec.push(MUSIC_FREQUENCY);
                rel.amplitude *= 1.05;
            }
            InteractionKind::Meditation => {
                rel.energy_flow *= 1.1;
                rel.volume *= 0.95;
            }
            InteractionKind::FlowState => {
                rel.energy_flow *= 1.2;
                rel.amplitude *= 1.1;
                rel.volume *= 1.05;
            }
            InteractionKind::Other => {
                rel.energy_flow *= 1.05;
            }
        }
    }
}

/// Advance a relationship by one interaction.
pub fn record_interaction(rel: &mut Relationship, kind: InteractionKind, now: DateTime<Utc>) {
    rel.interactions += 1;
    rel.depth = rel.interactions.ilog2() + 1;
    rel.last_interaction = now;
    kind.apply(rel);
    rel.timestamp = now;
}

pub struct RelationshipEngine {
    concepts: Arc<ConceptRepository>,
    relationships: Arc<RelationshipRepository>,
}

impl RelationshipEngine {
    pub fn new(concepts: Arc<ConceptRepository>, relationships: Arc<RelationshipRepository>) -> Self {
        Self {
            concepts,
            relationships,
        }
    }

    /// Create or reset the `(source, kind, target)` edge.
    ///
    /// Both endpoints must exist. The relationship type is not checked.
    pub async fn create_relationship(
        &self,
        source: &str,
        target: &str,
        kind: &str,
    ) -> Result<Relationship> {
        if !self.concepts.contains(source).await {
            return Err(GraphError::unresolved("source concept", source));
        }
        if !self.concepts.contains(target).await {
            return Err(GraphError::unresolved("target concept", target));
        }

        let relationship = self
            .relationships
            .upsert(Relationship::new(source, kind, target))
            .await?;
        self.concepts.link(source, &relationship.id).await?;
        self.concepts.link(target, &relationship.id).await?;

        info!(
            id = %relationship.id,
            source = %source,
            target = %target,
            kind = %kind,
            "Created relationship"
        );
        Ok(relationship)
    }

    /// Apply one interaction of the type named by `interaction_type`.
    pub async fn interact(&self, id: &str, interaction_type: &str) -> Result<Relationship> {
        let type_concept = match self.concepts.get(interaction_type).await {
            Ok(concept) => concept,
            Err(_) => {
                warn!(
                    relationship = %id,
                    interaction_type = %interaction_type,
                    "Rejecting interaction with unknown type"
                );
                return Err(GraphError::unresolved("interaction type", interaction_type));
            }
        };
        let kind = InteractionKind::from_name(&type_concept.name);

        let updated = self
            .relationships
            .update(id, |rel| {
                record_interaction(rel, kind, Utc::now());
                Ok(())
            })
            .await?;

        info!(
            relationship = %id,
            interaction = %type_concept.name,
            interactions = updated.interactions,
            depth = updated.depth,
            "Recorded interaction"
        );
        Ok(updated)
    }

    /// Same as [`interact`](Self::interact).
    pub async fn deepen(&self, id: &str, interaction_type: &str) -> Result<Relationship> {
        self.interact(id, interaction_type).await
    }

    /// Merge relationships announced by a peer. Known IDs are kept as they
    /// are; new ones are linked into any local endpoint concepts.
    pub async fn merge_remote(&self, incoming: HashMap<Guid, Relationship>) -> Result<usize> {
        let inserted = self.relationships.merge_missing(incoming).await?;
        for rel in &inserted {
            for endpoint in [&rel.source_id, &rel.target_id] {
                if self.concepts.contains(endpoint).await {
                    self.concepts.link(endpoint, &rel.id).await?;
                }
            }
        }
        Ok(inserted.len())
    }

    /// Remove a deleted concept's edges from its neighbours' adjacency
    /// lists. Relationship records are kept. Returns the number of
    /// neighbours unlinked.
    pub async fn detach(&self, deleted: &str) -> Result<usize> {
        let mut unlinked = 0;
        for rel in self.relationships.list().await {
            let neighbour = if rel.source_id == deleted {
                &rel.target_id
            } else if rel.target_id == deleted {
                &rel.source_id
            } else {
                continue;
            };
            if neighbour == deleted || !self.concepts.contains(neighbour).await {
                continue;
            }
            if self.concepts.unlink(neighbour, &rel.id).await? {
                unlinked += 1;
            }
        }
        if unlinked > 0 {
            info!(concept = %deleted, unlinked, "Detached deleted concept");
        }
        Ok(unlinked)
    }

    /// Create (or refresh) a relationship-type concept.
    pub async fn ensure_relationship_type(&self, name: &str, description: &str) -> Result<Concept> {
        let mut concept = Concept::named(name, description, RELATIONSHIP_TYPE);
        if let Ok(existing) = self.concepts.get(&concept.guid).await {
            if existing.kind == RELATIONSHIP_TYPE
                && (description.is_empty() || existing.description == description)
            {
                return Ok(existing);
            }
            concept.relationships = existing.relationships;
        }
        self.concepts.add_or_update(concept).await
    }

    pub async fn get(&self, id: &str) -> Result<Relationship> {
        self.relationships.get(id).await
    }

    pub async fn list(&self) -> Vec<Relationship> {
        self.relationships.list().await
    }

    pub async fn by_type(&self, type_guid: &str) -> Vec<Relationship> {
        self.relationships.by_type(type_guid).await
    }

    /// Concepts that name a relationship type.
    pub async fn relationship_types(&self) -> Vec<Concept> {
        self.concepts
            .query(&ConceptFilter {
                kind: Some(RELATIONSHIP_TYPE.to_string()),
                ..Default::default()
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::generate_guid;
    use crate::model::IS_A;
    use crate::substrate::MemorySubstrate;
    use tokio::sync::broadcast;

    async fn engine() -> (RelationshipEngine, Arc<ConceptRepository>) {
        let substrate = Arc::new(MemorySubstrate::standalone("peer-a"));
        let (tx, _) = broadcast::channel(16);
        let concepts = Arc::new(ConceptRepository::new(substrate.clone(), tx));
        let relationships = Arc::new(RelationshipRepository::new(substrate));
        for name in ["Dog", "Cat", "Music", "Meditation", "FlowState", "Play"] {
            concepts
                .add_or_update(Concept::named(name, "", "Test"))
                .await
                .unwrap();
        }
        (
            RelationshipEngine::new(concepts.clone(), relationships),
            concepts,
        )
    }

    #[tokio::test]
    async fn test_create_is_upsert() {
        let (engine, _) = engine().await;
        let (dog, cat, t) = (generate_guid("Dog"), generate_guid("Cat"), generate_guid(IS_A));

        let first = engine.create_relationship(&dog, &cat, &t).await.unwrap();
        engine
            .interact(&first.id, &generate_guid("Play"))
            .await
            .unwrap();
        let second = engine.create_relationship(&dog, &cat, &t).await.unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.interactions, 0);
        assert_eq!(engine.list().await.len(), 1);
        assert_eq!(second.source_id, dog);
        assert_eq!(second.target_id, cat);
    }

    #[tokio::test]
    async fn test_create_links_both_endpoints_once() {
        let (engine, concepts) = engine().await;
        let (dog, cat) = (generate_guid("Dog"), generate_guid("Cat"));
        let rel = engine.create_relationship(&dog, &cat, "t").await.unwrap();
        engine.create_relationship(&dog, &cat, "t").await.unwrap();

        assert_eq!(concepts.get(&dog).await.unwrap().relationships, vec![rel.id.clone()]);
        assert_eq!(concepts.get(&cat).await.unwrap().relationships, vec![rel.id]);
    }

    #[tokio::test]
    async fn test_create_requires_endpoints() {
        let (engine, _) = engine().await;
        let result = engine
            .create_relationship(&generate_guid("Dog"), "missing", "t")
            .await;
        assert!(matches!(result, Err(GraphError::UnresolvedReference { .. })));
        assert!(engine.list().await.is_empty());
    }

    #[tokio::test]
    async fn test_depth_follows_log2() {
        let (engine, _) = engine().await;
        let rel = engine
            .create_relationship(&generate_guid("Dog"), &generate_guid("Cat"), "t")
            .await
            .unwrap();
        let play = generate_guid("Play");

        let mut depths = Vec::new();
        for _ in 0..8 {
            depths.push(engine.interact(&rel.id, &play).await.unwrap().depth);
        }
        assert_eq!(depths, vec![1, 2, 2, 3, 3, 3, 3, 4]);
        assert_eq!(engine.get(&rel.id).await.unwrap().interactions, 8);
    }

    #[tokio::test]
    async fn test_music_interaction() {
        let (engine, _) = engine().await;
        let rel = engine
            .create_relationship(&generate_guid("Dog"), &generate_guid("Cat"), "t")
            .await
            .unwrap();
        let after = engine
            .interact(&rel.id, &generate_guid("Music"))
            .await
            .unwrap();

        assert_eq!(after.frequency_spec, vec![1.0, MUSIC_FREQUENCY]);
        assert!((after.amplitude - 1.05).abs() < 1e-9);
        assert_eq!(after.energy_flow, 1.0);
        assert_eq!(after.volume, 1.0);
    }

    #[tokio::test]
    async fn test_meditation_and_flow_state() {
        let (engine, _) = engine().await;
        let rel = engine
            .create_relationship(&generate_guid("Dog"), &generate_guid("Cat"), "t")
            .await
            .unwrap();

        let m = engine
            .deepen(&rel.id, &generate_guid("Meditation"))
            .await
            .unwrap();
        assert!((m.energy_flow - 1.1).abs() < 1e-9);
        assert!((m.volume - 0.95).abs() < 1e-9);

        let f = engine
            .deepen(&rel.id, &generate_guid("FlowState"))
            .await
            .unwrap();
        assert!((f.energy_flow - 1.1 * 1.2).abs() < 1e-9);
        assert!((f.amplitude - 1.1).abs() < 1e-9);
        assert!((f.volume - 0.95 * 1.05).abs() < 1e-9);

        let other = engine
            .deepen(&rel.id, &generate_guid("Play"))
            .await
            .unwrap();
        assert!((other.energy_flow - 1.1 * 1.2 * 1.05).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_unknown_interaction_type_changes_nothing() {
        let (engine, _) = engine().await;
        let rel = engine
            .create_relationship(&generate_guid("Dog"), &generate_guid("Cat"), "t")
            .await
            .unwrap();

        let result = engine.interact(&rel.id, "no-such-type").await;
        assert!(matches!(result, Err(GraphError::UnresolvedReference { .. })));
        assert_eq!(engine.get(&rel.id).await.unwrap(), rel);
    }

    #[tokio::test]
    async fn test_interact_unknown_relationship() {
        let (engine, _) = engine().await;
        assert!(matches!(
            engine.interact("missing", &generate_guid("Music")).await,
            Err(GraphError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_merge_remote_links_known_endpoints() {
        let (engine, concepts) = engine().await;
        let dog = generate_guid("Dog");
        let remote = Relationship::new(&dog, "t", "not-here");

        let mut incoming = HashMap::new();
        incoming.insert(remote.id.clone(), remote.clone());
        assert_eq!(engine.merge_remote(incoming.clone()).await.unwrap(), 1);
        assert_eq!(engine.merge_remote(incoming).await.unwrap(), 0);

        assert_eq!(concepts.get(&dog).await.unwrap().relationships, vec![remote.id]);
    }

    #[tokio::test]
    async fn test_detach_unlinks_neighbours_of_deleted_concept() {
        let (engine, concepts) = engine().await;
        let (dog, cat, play) = (generate_guid("Dog"), generate_guid("Cat"), generate_guid("Play"));
        let chases = engine.create_relationship(&dog, &cat, "chases").await.unwrap();
        let plays = engine.create_relationship(&play, &cat, "with").await.unwrap();

        concepts.delete(&dog).await.unwrap();
        assert_eq!(engine.detach(&dog).await.unwrap(), 1);

        assert_eq!(concepts.get(&cat).await.unwrap().relationships, vec![plays.id]);
        assert!(engine.get(&chases.id).await.is_ok());
        assert_eq!(engine.detach(&dog).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_relationship_types() {
        let (engine, _) = engine().await;
        engine.ensure_relationship_type(IS_A, "Hierarchy").await.unwrap();
        engine.ensure_relationship_type(IS_A, "").await.unwrap();
        engine.ensure_relationship_type("Eats", "").await.unwrap();

        let types = engine.relationship_types().await;
        assert_eq!(types.len(), 2);
        assert!(types.iter().all(|c| c.kind == RELATIONSHIP_TYPE));
    }
}
