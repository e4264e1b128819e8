//! Node configuration

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::gossip::GossipSettings;
use crate::substrate::ipfs::DEFAULT_API_URL;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub gossip: GossipConfig,
    #[serde(default)]
    pub substrate: SubstrateConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub bootstrap: BootstrapConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Peer ID used when running on the in-memory substrate
    #[serde(default = "default_memory_peer_id")]
    pub memory_peer_id: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            memory_peer_id: default_memory_peer_id(),
        }
    }
}

fn default_memory_peer_id() -> String {
    "ccn-local".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GossipConfig {
    /// Pubsub topic for concept-list announcements
    #[serde(default = "default_topic")]
    pub topic: String,

    /// Seconds between announcements
    #[serde(default = "default_publish_interval")]
    pub publish_interval_secs: u64,

    /// Seconds between peer discovery sweeps
    #[serde(default = "default_discovery_interval")]
    pub discovery_interval_secs: u64,

    /// Seconds allowed for fetching one advertised CID
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,

    /// Seconds between attempts to resubscribe a closed topic
    #[serde(default = "default_resubscribe")]
    pub resubscribe_secs: u64,
}

impl Default for GossipConfig {
    fn default() -> Self {
        Self {
            topic: default_topic(),
            publish_interval_secs: default_publish_interval(),
            discovery_interval_secs: default_discovery_interval(),
            fetch_timeout_secs: default_fetch_timeout(),
            resubscribe_secs: default_resubscribe(),
        }
    }
}

impl GossipConfig {
    pub fn settings(&self) -> GossipSettings {
        GossipSettings {
            topic: self.topic.clone(),
            publish_interval: Duration::from_secs(self.publish_interval_secs.max(1)),
            discovery_interval: Duration::from_secs(self.discovery_interval_secs.max(1)),
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs.max(1)),
            resubscribe_interval: Duration::from_secs(self.resubscribe_secs.max(1)),
        }
    }
}

fn default_topic() -> String {
    "concept-list".to_string()
}
fn default_publish_interval() -> u64 {
    60
}
fn default_discovery_interval() -> u64 {
    300
}
fn default_fetch_timeout() -> u64 {
    30
}
fn default_resubscribe() -> u64 {
    5
}

/// Which substrate adapter to run on
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubstrateKind {
    #[default]
    Ipfs,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubstrateConfig {
    #[serde(default)]
    pub kind: SubstrateKind,

    /// Kubo RPC endpoint
    #[serde(default = "default_api_url")]
    pub api_url: String,

    /// Peer addresses to connect to at startup
    #[serde(default)]
    pub bootstrap_peers: Vec<String>,
}

impl Default for SubstrateConfig {
    fn default() -> Self {
        Self {
            kind: SubstrateKind::default(),
            api_url: default_api_url(),
            bootstrap_peers: vec![],
        }
    }
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// HTTP API port
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    /// Live-feed resync interval in seconds
    #[serde(default = "default_heartbeat")]
    pub heartbeat_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            heartbeat_secs: default_heartbeat(),
        }
    }
}

fn default_http_port() -> u16 {
    9090
}
fn default_heartbeat() -> u64 {
    5
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BootstrapConfig {
    /// YAML concept structure loaded at startup
    #[serde(default)]
    pub structure_file: Option<PathBuf>,
}

impl Config {
    /// Load config from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Load config, falling back to defaults if the file does not exist
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), std::io::Error> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, content)
    }
}
