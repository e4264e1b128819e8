//! Graph store
//!
//! Three owned repositories, each behind its own `tokio::sync::RwLock`:
//!
//! - [`ConceptRepository`] - concepts, the GUID→CID index, tombstones and
//!   pending CIDs
//! - [`RelationshipRepository`] - edges keyed by deterministic ID
//! - [`PeerRepository`] - known peers and what they advertise
//!
//! Every document is persisted whole through the substrate after each
//! mutation. Index locks are never held across substrate I/O.

pub mod concepts;
pub mod peers;
pub mod relationships;

pub use concepts::ConceptRepository;
pub use peers::PeerRepository;
pub use relationships::RelationshipRepository;

/// GUID→CID index.
pub const GUID2CID_PATH: &str = "/ccn/guid2cid.json";

/// Peer index.
pub const PEERS_PATH: &str = "/ccn/peers.json";

/// Relationship index.
pub const RELATIONSHIPS_PATH: &str = "/ccn/relationships.json";

/// Owner-GUID record.
pub const OWNER_PATH: &str = "/ccn/owner.json";

/// Tombstone set.
pub const TOMBSTONES_PATH: &str = "/ccn/tombstones.json";

/// Capacity of the index-change channel feeding the live feeds.
pub const CHANGE_BUFFER: usize = 64;
