//! Gossip wire format

use std::collections::{BTreeSet, HashMap};

use serde::{Deserialize, Serialize};

use crate::error::{GraphError, Result};
use crate::model::{Cid, Guid, PeerId, Relationship, Tombstone};

/// A peer's advertised state, published on the gossip topic as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerMessage {
    pub peer_id: PeerId,
    pub owner_guid: Guid,
    #[serde(default)]
    pub cids: BTreeSet<Cid>,
    #[serde(default)]
    pub relationships: HashMap<Guid, Relationship>,
    /// Absent in messages from older peers.
    #[serde(default)]
    pub tombstones: Vec<Tombstone>,
}

impl PeerMessage {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| GraphError::MalformedInput(format!("undecodable gossip message: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_keys_are_camel_case() {
        let message = PeerMessage {
            peer_id: "peer".into(),
            owner_guid: "owner".into(),
            cids: BTreeSet::from(["cid-1".to_string()]),
            relationships: HashMap::new(),
            tombstones: Vec::new(),
        };
        let json: serde_json::Value = serde_json::from_slice(&message.encode().unwrap()).unwrap();
        assert_eq!(json["peerId"], "peer");
        assert_eq!(json["ownerGuid"], "owner");
        assert_eq!(json["cids"][0], "cid-1");
    }

    #[test]
    fn test_tombstones_optional() {
        let raw = br#"{"peerId":"p","ownerGuid":"o","cids":[],"relationships":{}}"#;
        let message = PeerMessage::decode(raw).unwrap();
        assert!(message.tombstones.is_empty());
    }

    #[test]
    fn test_garbage_is_malformed() {
        assert!(matches!(
            PeerMessage::decode(b"not json"),
            Err(GraphError::MalformedInput(_))
        ));
    }

    #[test]
    fn test_relationships_keep_camel_case_fields() {
        let rel = Relationship::new("a", "t", "b");
        let mut relationships = HashMap::new();
        relationships.insert(rel.id.clone(), rel.clone());
        let message = PeerMessage {
            peer_id: "p".into(),
            owner_guid: "o".into(),
            cids: BTreeSet::new(),
            relationships,
            tombstones: Vec::new(),
        };
        let json: serde_json::Value = serde_json::from_slice(&message.encode().unwrap()).unwrap();
        assert_eq!(json["relationships"][&rel.id]["sourceId"], "a");
        assert_eq!(json["relationships"][&rel.id]["energyFlow"], 1.0);
    }
}
