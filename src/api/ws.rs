//! Live feeds
//!
//! `GET /ws` streams the concept index, `GET /ws/peers` the claimed peers.
//! Each connection gets a full JSON snapshot on connect, after every change
//! to its index, and once per heartbeat.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error};

use super::SharedState;
use crate::model::IndexChange;

/// GET /ws
pub async fn concepts_feed(State(state): State<SharedState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| run_feed(socket, state, IndexChange::Concepts))
}

/// GET /ws/peers
pub async fn peers_feed(State(state): State<SharedState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| run_feed(socket, state, IndexChange::Peers))
}

async fn snapshot(state: &SharedState, feed: IndexChange) -> serde_json::Result<String> {
    match feed {
        IndexChange::Concepts => serde_json::to_string(&state.node.concepts_snapshot().await),
        IndexChange::Peers => serde_json::to_string(&state.node.peers().await),
    }
}

async fn run_feed(mut socket: WebSocket, state: SharedState, feed: IndexChange) {
    let mut changes = state.node.subscribe_changes();
    let mut shutdown = state.node.shutdown_signal();
    // First tick fires immediately and sends the initial snapshot.
    let mut heartbeat = tokio::time::interval(state.heartbeat);
    debug!(?feed, "Live feed connected");

    loop {
        let push = tokio::select! {
            _ = heartbeat.tick() => true,
            change = changes.recv() => match change {
                Ok(changed) => changed == feed,
                Err(RecvError::Lagged(skipped)) => {
                    debug!(?feed, skipped, "Live feed lagged, resyncing");
                    true
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    debug!(?feed, error = %e, "Live feed socket error");
                    break;
                }
                Some(Ok(_)) => false,
            },
            _ = shutdown.recv() => break,
        };

        if !push {
            continue;
        }
        match snapshot(&state, feed).await {
            Ok(json) => {
                if socket.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            Err(e) => error!(?feed, error = %e, "Failed to encode live feed snapshot"),
        }
    }
    debug!(?feed, "Live feed disconnected");
}
