//! ccn-node: peer-replicated concept graph over content-addressed storage
//!
//! Concepts (typed nodes) and relationships (typed, directed edges with
//! interaction state) are persisted through a content-addressed
//! [`Substrate`](substrate::Substrate) and converge across peers by gossip.
//!
//! ## Modules
//!
//! - [`identity`] - deterministic name → GUID hashing
//! - [`model`] - concepts, relationships, peers, filters
//! - [`store`] - concept, relationship and peer repositories
//! - [`engine`] - edge lifecycle and interaction growth
//! - [`loader`] - YAML structure bootstrap
//! - [`gossip`] - periodic publish, discovery and merge
//! - [`node`] - startup sequence and the operations the API calls
//! - [`api`] - axum HTTP/WebSocket layer

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod gossip;
pub mod identity;
pub mod loader;
pub mod model;
pub mod node;
pub mod store;
pub mod substrate;

pub use config::Config;
pub use error::{GraphError, Result, SubstrateError};
pub use model::{Concept, ConceptFilter, Peer, Relationship};
pub use node::{Node, NodeSettings};
