//! Kubo (go-ipfs) HTTP RPC substrate
//!
//! Talks to a local IPFS daemon's `/api/v0` endpoint. Pubsub requires the
//! daemon to run with `--enable-pubsub-experiment`.
//!
//! | Capability | RPC call |
//! |------------|----------|
//! | add | `add?pin=true` |
//! | get | `cat` |
//! | remove | `pin/rm` |
//! | publish / subscribe | `pubsub/pub`, `pubsub/sub` (multibase topics) |
//! | connect / list_peers | `swarm/connect`, `swarm/peers` |
//! | load / save | MFS `files/read`, `files/write` |
//! | local_id | `id` |

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine as _;
use futures::StreamExt;
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Response};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{Substrate, SUBSCRIPTION_BUFFER};
use crate::error::SubstrateError;
use crate::model::{Cid, PeerId};

/// Default Kubo RPC address.
pub const DEFAULT_API_URL: &str = "http://127.0.0.1:5001";

#[derive(Deserialize)]
struct AddResponse {
    #[serde(rename = "Hash")]
    hash: String,
}

#[derive(Deserialize)]
struct IdResponse {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Deserialize)]
struct SwarmPeer {
    #[serde(rename = "Peer")]
    peer: String,
}

#[derive(Deserialize)]
struct SwarmPeersResponse {
    #[serde(rename = "Peers", default)]
    peers: Option<Vec<SwarmPeer>>,
}

#[derive(Deserialize)]
struct PubsubMessage {
    data: String,
}

#[derive(Deserialize)]
struct RpcError {
    #[serde(rename = "Message", default)]
    message: String,
}

/// Substrate backed by a Kubo RPC endpoint.
#[derive(Clone)]
pub struct IpfsSubstrate {
    client: Client,
    base_url: String,
}

impl IpfsSubstrate {
    pub fn new(api_url: impl Into<String>) -> Self {
        let base_url = api_url.into().trim_end_matches('/').to_string();
        info!(api = %base_url, "Using IPFS RPC substrate");
        Self {
            client: Client::new(),
            base_url,
        }
    }

    fn endpoint(&self, command: &str) -> String {
        format!("{}/api/v0/{}", self.base_url, command)
    }

    async fn call(
        &self,
        command: &str,
        query: &[(&str, &str)],
        body: Option<Vec<u8>>,
    ) -> Result<Response, SubstrateError> {
        let mut request = self.client.post(self.endpoint(command)).query(query);
        if let Some(bytes) = body {
            request = request.multipart(Form::new().part("file", Part::bytes(bytes)));
        }
        let response = request.send().await.map_err(|e| {
            if e.is_connect() {
                SubstrateError::Unavailable(format!("{}: {}", self.base_url, e))
            } else {
                SubstrateError::Http(e)
            }
        })?;

        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<RpcError>(&text)
            .map(|e| e.message)
            .unwrap_or(text);
        Err(SubstrateError::Protocol(format!(
            "{} returned {}: {}",
            command, status, message
        )))
    }
}

/// Multibase (base64url, `u` prefix) encoding Kubo expects for topics.
pub fn encode_topic(topic: &str) -> String {
    format!("u{}", URL_SAFE_NO_PAD.encode(topic.as_bytes()))
}

/// Decode a pubsub `data` field. Older daemons send plain base64.
pub fn decode_payload(data: &str) -> Result<Vec<u8>, SubstrateError> {
    let decoded = match data.strip_prefix('u') {
        Some(rest) => URL_SAFE_NO_PAD.decode(rest),
        None => STANDARD.decode(data),
    };
    decoded.map_err(|e| SubstrateError::Protocol(format!("bad pubsub payload: {}", e)))
}

fn is_missing_file(err: &SubstrateError) -> bool {
    matches!(err, SubstrateError::Protocol(msg) if msg.contains("does not exist"))
}

#[async_trait::async_trait]
impl Substrate for IpfsSubstrate {
    async fn add(&self, data: &[u8]) -> Result<Cid, SubstrateError> {
        let response = self
            .call("add", &[("pin", "true")], Some(data.to_vec()))
            .await?;
        let added: AddResponse = response.json().await?;
        debug!(cid = %added.hash, bytes = data.len(), "Added content");
        Ok(added.hash)
    }

    async fn get(&self, cid: &str) -> Result<Vec<u8>, SubstrateError> {
        let response = self.call("cat", &[("arg", cid)], None).await?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn remove(&self, cid: &str) -> Result<(), SubstrateError> {
        self.call("pin/rm", &[("arg", cid)], None).await?;
        Ok(())
    }

    async fn publish(&self, topic: &str, data: &[u8]) -> Result<(), SubstrateError> {
        let topic = encode_topic(topic);
        self.call("pubsub/pub", &[("arg", topic.as_str())], Some(data.to_vec()))
            .await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<Vec<u8>>, SubstrateError> {
        let encoded = encode_topic(topic);
        let response = self
            .call("pubsub/sub", &[("arg", encoded.as_str())], None)
            .await?;
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER);
        let topic = topic.to_string();

        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buffer: Vec<u8> = Vec::new();

            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        warn!(topic = %topic, error = %e, "Pubsub stream failed");
                        break;
                    }
                };
                buffer.extend_from_slice(&chunk);

                // Messages are newline-delimited JSON.
                while let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=pos).collect();
                    if line.iter().all(|b| b.is_ascii_whitespace()) {
                        continue;
                    }
                    let payload = serde_json::from_slice::<PubsubMessage>(&line)
                        .map_err(|e| SubstrateError::Protocol(e.to_string()))
                        .and_then(|msg| decode_payload(&msg.data));
                    match payload {
                        Ok(data) => {
                            if tx.send(data).await.is_err() {
                                return;
                            }
                        }
                        Err(e) => warn!(topic = %topic, error = %e, "Dropping pubsub frame"),
                    }
                }
            }
            debug!(topic = %topic, "Pubsub subscription ended");
        });

        Ok(rx)
    }

    async fn connect(&self, peer_addr: &str) -> Result<(), SubstrateError> {
        self.call("swarm/connect", &[("arg", peer_addr)], None)
            .await?;
        Ok(())
    }

    async fn list_peers(&self) -> Result<Vec<PeerId>, SubstrateError> {
        let response = self.call("swarm/peers", &[], None).await?;
        let peers: SwarmPeersResponse = response.json().await?;
        Ok(peers
            .peers
            .unwrap_or_default()
            .into_iter()
            .map(|p| p.peer)
            .collect())
    }

    async fn load(&self, path: &str) -> Result<Option<Vec<u8>>, SubstrateError> {
        match self.call("files/read", &[("arg", path)], None).await {
            Ok(response) => Ok(Some(response.bytes().await?.to_vec())),
            Err(e) if is_missing_file(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn save(&self, path: &str, data: &[u8]) -> Result<(), SubstrateError> {
        self.call(
            "files/write",
            &[
                ("arg", path),
                ("create", "true"),
                ("parents", "true"),
                ("truncate", "true"),
            ],
            Some(data.to_vec()),
        )
        .await?;
        Ok(())
    }

    async fn local_id(&self) -> Result<PeerId, SubstrateError> {
        let response = self.call("id", &[], None).await?;
        let id: IdResponse = response.json().await?;
        Ok(id.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_topic_is_multibase() {
        assert_eq!(encode_topic("concept-list"), "uY29uY2VwdC1saXN0");
    }

    #[test]
    fn test_decode_payload_both_encodings() {
        assert_eq!(decode_payload("uaGVsbG8").unwrap(), b"hello");
        assert_eq!(decode_payload("aGVsbG8=").unwrap(), b"hello");
        assert!(decode_payload("u!!!").is_err());
    }

    #[test]
    fn test_missing_file_detection() {
        let err = SubstrateError::Protocol(
            "files/read returned 500 Internal Server Error: file does not exist".into(),
        );
        assert!(is_missing_file(&err));
        assert!(!is_missing_file(&SubstrateError::Unsupported("x")));
    }

    #[test]
    fn test_endpoint_trims_slash() {
        let ipfs = IpfsSubstrate::new("http://localhost:5001/");
        assert_eq!(ipfs.endpoint("id"), "http://localhost:5001/api/v0/id");
    }
}
