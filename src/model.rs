//! Graph entities: concepts, relationships, peers
//!
//! Relationship types and concept categories are ordinary concepts; typing is
//! by convention on the `type` field.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};
use crate::identity;

/// Stable logical identity of a concept, relationship or owner.
pub type Guid = String;

/// Content address of a serialized concept.
pub type Cid = String;

/// Network identity of a peer.
pub type PeerId = String;

/// `type` of concepts that name a relationship type.
pub const RELATIONSHIP_TYPE: &str = "RelationshipType";

/// `type` of the local operator's concept.
pub const OWNER_TYPE: &str = "Owner";

/// Name of the hierarchy relationship type.
pub const IS_A: &str = "Is A";

/// A typed node in the knowledge graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Concept {
    pub guid: Guid,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(rename = "type", default)]
    pub kind: String,
    #[serde(default)]
    pub content: String,
    /// Last content address; empty until first persisted.
    #[serde(default)]
    pub cid: Cid,
    pub timestamp: DateTime<Utc>,
    /// IDs of edges this concept is source or target of.
    #[serde(default)]
    pub relationships: Vec<Guid>,
}

/// The hashed form of a concept. Everything but the CID.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ConceptContent<'a> {
    guid: &'a str,
    name: &'a str,
    description: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
    content: &'a str,
    timestamp: &'a DateTime<Utc>,
    relationships: &'a [Guid],
}

impl Concept {
    pub fn new(
        guid: impl Into<Guid>,
        name: impl Into<String>,
        description: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        Self {
            guid: guid.into(),
            name: name.into(),
            description: description.into(),
            kind: kind.into(),
            content: String::new(),
            cid: String::new(),
            timestamp: Utc::now(),
            relationships: Vec::new(),
        }
    }

    /// Concept whose GUID derives from its name.
    pub fn named(
        name: impl Into<String>,
        description: impl Into<String>,
        kind: impl Into<String>,
    ) -> Self {
        let name = name.into();
        Self::new(identity::generate_guid(&name), name, description, kind)
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    /// Bytes submitted to the substrate to derive the CID.
    pub fn content_bytes(&self) -> Result<Vec<u8>> {
        let view = ConceptContent {
            guid: &self.guid,
            name: &self.name,
            description: &self.description,
            kind: &self.kind,
            content: &self.content,
            timestamp: &self.timestamp,
            relationships: &self.relationships,
        };
        Ok(serde_json::to_vec(&view)?)
    }

    /// Decode a concept fetched from the substrate under `cid`.
    pub fn from_content(cid: &str, bytes: &[u8]) -> Result<Self> {
        let mut concept: Concept = serde_json::from_slice(bytes)?;
        concept.cid = cid.to_string();
        Ok(concept)
    }

    /// Record an edge ID; returns false if already present.
    pub fn link(&mut self, relationship_id: &str) -> bool {
        if self.relationships.iter().any(|r| r == relationship_id) {
            return false;
        }
        self.relationships.push(relationship_id.to_string());
        true
    }
}

/// A typed, directed edge with interaction state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Relationship {
    pub id: Guid,
    pub source_id: Guid,
    pub target_id: Guid,
    /// GUID of the relationship-type concept.
    #[serde(rename = "type")]
    pub kind: Guid,
    pub energy_flow: f64,
    pub frequency_spec: Vec<f64>,
    pub amplitude: f64,
    pub volume: f64,
    pub depth: u32,
    pub interactions: u64,
    pub last_interaction: DateTime<Utc>,
    pub timestamp: DateTime<Utc>,
}

impl Relationship {
    /// Fresh edge with initial interaction state.
    pub fn new(source: &str, kind: &str, target: &str) -> Self {
        let now = Utc::now();
        Self {
            id: identity::relationship_id(source, kind, target),
            source_id: source.to_string(),
            target_id: target.to_string(),
            kind: kind.to_string(),
            energy_flow: 1.0,
            frequency_spec: vec![1.0],
            amplitude: 1.0,
            volume: 1.0,
            depth: 1,
            interactions: 0,
            last_interaction: now,
            timestamp: now,
        }
    }
}

/// A known peer and what it advertises.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Peer {
    pub id: PeerId,
    /// Empty until the peer is claimed by an owner.
    #[serde(default)]
    pub owner_guid: Guid,
    #[serde(default)]
    pub cids: BTreeSet<Cid>,
    pub timestamp: DateTime<Utc>,
}

impl Peer {
    /// Peer seen on the network but not yet announced.
    pub fn unclaimed(id: impl Into<PeerId>) -> Self {
        Self {
            id: id.into(),
            owner_guid: String::new(),
            cids: BTreeSet::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn is_claimed(&self) -> bool {
        !self.owner_guid.is_empty()
    }
}

/// Marker for a locally deleted concept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tombstone {
    pub guid: Guid,
    pub deleted_at: DateTime<Utc>,
}

/// Conjunctive concept query. Empty fields match everything.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConceptFilter {
    #[serde(default)]
    pub cid: Option<Cid>,
    #[serde(default)]
    pub guid: Option<Guid>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub timestamp_after: Option<DateTime<Utc>>,
}

fn set(field: &Option<String>) -> Option<&str> {
    field.as_deref().filter(|s| !s.is_empty())
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

impl ConceptFilter {
    pub fn is_empty(&self) -> bool {
        set(&self.cid).is_none()
            && set(&self.guid).is_none()
            && set(&self.name).is_none()
            && set(&self.description).is_none()
            && set(&self.kind).is_none()
            && self.timestamp_after.is_none()
    }

    pub fn matches(&self, concept: &Concept) -> bool {
        if let Some(cid) = set(&self.cid) {
            if concept.cid != cid {
                return false;
            }
        }
        if let Some(guid) = set(&self.guid) {
            if concept.guid != guid {
                return false;
            }
        }
        if let Some(name) = set(&self.name) {
            if !contains_ignore_case(&concept.name, name) {
                return false;
            }
        }
        if let Some(description) = set(&self.description) {
            if !contains_ignore_case(&concept.description, description) {
                return false;
            }
        }
        if let Some(kind) = set(&self.kind) {
            if concept.kind != kind {
                return false;
            }
        }
        if let Some(after) = self.timestamp_after {
            if concept.timestamp <= after {
                return false;
            }
        }
        true
    }

    /// Parse an RFC 3339 `timestamp` query parameter.
    pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| GraphError::MalformedInput(format!("invalid timestamp {:?}: {}", raw, e)))
    }
}

/// Which index changed; drives the live feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexChange {
    Concepts,
    Peers,
}
