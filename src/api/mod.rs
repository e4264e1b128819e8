//! HTTP/WebSocket request layer
//!
//! Thin axum dispatch onto [`Node`] operations. No graph logic lives here.

pub mod routes;
pub mod ws;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post, put},
    Router,
};
use serde_json::json;
use tower_http::cors::CorsLayer;
use tracing::error;

use crate::error::GraphError;
use crate::node::Node;

/// State shared across handlers
pub struct ApiState {
    pub node: Arc<Node>,
    /// Live-feed resync interval.
    pub heartbeat: Duration,
}

pub type SharedState = Arc<ApiState>;

/// Graph error rendered as `{"error": "..."}`.
#[derive(Debug)]
pub struct ApiError(pub GraphError);

impl From<GraphError> for ApiError {
    fn from(err: GraphError) -> Self {
        ApiError(err)
    }
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match &self.0 {
            GraphError::NotFound { .. } => StatusCode::NOT_FOUND,
            e if e.is_client_error() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        }
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

/// Create the API router
pub fn create_router(state: SharedState) -> Router {
    Router::new()
        .route("/health", get(routes::health))
        .route("/concept", post(routes::create_concept))
        .route(
            "/concept/:guid",
            get(routes::get_concept).delete(routes::delete_concept),
        )
        .route("/concepts", get(routes::query_concepts))
        .route("/owner", get(routes::get_owner).post(routes::set_owner))
        .route("/peers", get(routes::list_peers))
        .route("/relationship", post(routes::create_relationship))
        .route("/relationship/:id", get(routes::get_relationship))
        .route("/relationship/:id/deepen", put(routes::deepen))
        .route("/relationships", get(routes::list_relationships))
        .route("/relationship-types", get(routes::relationship_types))
        .route("/relationship-type/:kind", get(routes::relationships_by_type))
        .route("/interact/:id", get(routes::interact))
        .route("/ws", get(ws::concepts_feed))
        .route("/ws/peers", get(ws::peers_feed))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            ApiError(GraphError::not_found("concept", "x")).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError(GraphError::MalformedInput("bad".into())).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError(GraphError::unresolved("interaction type", "x")).status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError(GraphError::bootstrap(
                "creating concept Dog",
                GraphError::MalformedInput("x".into())
            ))
            .status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
