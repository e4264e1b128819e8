//! Storage/transport substrate
//!
//! The node never talks to the network directly. Content addressing,
//! structured persistence, pubsub and peer listing all go through the
//! [`Substrate`] capability trait.
//!
//! - [`IpfsSubstrate`] - Kubo HTTP RPC (production)
//! - [`MemorySubstrate`] - in-process network (tests, demos)

pub mod ipfs;
pub mod memory;

use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::mpsc;

use crate::error::SubstrateError;
use crate::model::{Cid, PeerId};

pub use ipfs::IpfsSubstrate;
pub use memory::{MemoryNetwork, MemorySubstrate};

/// Capacity of each subscription's inbound queue.
pub const SUBSCRIPTION_BUFFER: usize = 256;

/// Content-addressed storage plus pubsub, shared by all node tasks.
#[async_trait::async_trait]
pub trait Substrate: Send + Sync {
    /// Store bytes, returning their content address.
    async fn add(&self, data: &[u8]) -> Result<Cid, SubstrateError>;

    /// Fetch bytes by content address.
    async fn get(&self, cid: &str) -> Result<Vec<u8>, SubstrateError>;

    /// Drop content. May return [`SubstrateError::Unsupported`].
    async fn remove(&self, cid: &str) -> Result<(), SubstrateError>;

    /// Publish a message on a topic.
    async fn publish(&self, topic: &str, data: &[u8]) -> Result<(), SubstrateError>;

    /// Subscribe to a topic. The queue closes when the subscription ends.
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Vec<u8>>, SubstrateError>;

    /// Connect to a peer by address.
    async fn connect(&self, peer_addr: &str) -> Result<(), SubstrateError>;

    /// Currently connected peers.
    async fn list_peers(&self) -> Result<Vec<PeerId>, SubstrateError>;

    /// Read a document stored under a logical path. `None` if absent.
    async fn load(&self, path: &str) -> Result<Option<Vec<u8>>, SubstrateError>;

    /// Overwrite the document at a logical path.
    async fn save(&self, path: &str, data: &[u8]) -> Result<(), SubstrateError>;

    /// This node's network identity.
    async fn local_id(&self) -> Result<PeerId, SubstrateError>;
}

/// Load and decode a JSON document. Undecodable documents are an error.
pub async fn load_json<T: DeserializeOwned>(
    substrate: &dyn Substrate,
    path: &str,
) -> Result<Option<T>, SubstrateError> {
    match substrate.load(path).await? {
        Some(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| SubstrateError::Protocol(format!("decoding {}: {}", path, e))),
        None => Ok(None),
    }
}

/// Encode a value as JSON and overwrite the document at `path`.
pub async fn save_json<T: Serialize + ?Sized>(
    substrate: &dyn Substrate,
    path: &str,
    value: &T,
) -> Result<(), SubstrateError> {
    let bytes = serde_json::to_vec(value)
        .map_err(|e| SubstrateError::Protocol(format!("encoding {}: {}", path, e)))?;
    substrate.save(path, &bytes).await
}
