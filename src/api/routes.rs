//! HTTP handlers

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde::{Deserialize, Serialize};

use super::{ApiError, ApiResult, SharedState};
use crate::error::GraphError;
use crate::model::{Concept, ConceptFilter, Peer, Relationship};
use crate::node::{NewConcept, OwnerUpdate};

/// Health check endpoint
pub async fn health() -> impl IntoResponse {
    "OK"
}

// === Concepts ===

/// POST /concept
pub async fn create_concept(
    State(state): State<SharedState>,
    Json(draft): Json<NewConcept>,
) -> Result<(StatusCode, Json<Concept>), ApiError> {
    let concept = state.node.create_concept(draft).await?;
    Ok((StatusCode::CREATED, Json(concept)))
}

/// GET /concept/:guid
pub async fn get_concept(
    State(state): State<SharedState>,
    Path(guid): Path<String>,
) -> ApiResult<Concept> {
    Ok(Json(state.node.get_concept(&guid).await?))
}

/// DELETE /concept/:guid
pub async fn delete_concept(
    State(state): State<SharedState>,
    Path(guid): Path<String>,
) -> ApiResult<Concept> {
    Ok(Json(state.node.delete_concept(&guid).await?))
}

/// Query string of GET /concepts. `timestamp` is RFC 3339.
#[derive(Debug, Default, Deserialize)]
pub struct ConceptQuery {
    pub cid: Option<String>,
    pub guid: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub timestamp: Option<String>,
}

impl TryFrom<ConceptQuery> for ConceptFilter {
    type Error = GraphError;

    fn try_from(query: ConceptQuery) -> Result<Self, Self::Error> {
        let timestamp_after = match query.timestamp.as_deref() {
            Some(raw) if !raw.is_empty() => Some(ConceptFilter::parse_timestamp(raw)?),
            _ => None,
        };
        Ok(ConceptFilter {
            cid: query.cid,
            guid: query.guid,
            name: query.name,
            description: query.description,
            kind: query.kind,
            timestamp_after,
        })
    }
}

/// GET /concepts
pub async fn query_concepts(
    State(state): State<SharedState>,
    Query(query): Query<ConceptQuery>,
) -> ApiResult<Vec<Concept>> {
    let filter = ConceptFilter::try_from(query)?;
    Ok(Json(state.node.query_concepts(&filter).await))
}

// === Owner and peers ===

/// GET /owner
pub async fn get_owner(State(state): State<SharedState>) -> ApiResult<Concept> {
    Ok(Json(state.node.owner().await?))
}

/// POST /owner
pub async fn set_owner(
    State(state): State<SharedState>,
    Json(update): Json<OwnerUpdate>,
) -> ApiResult<Concept> {
    Ok(Json(state.node.set_owner(update).await?))
}

/// GET /peers
pub async fn list_peers(State(state): State<SharedState>) -> Json<Vec<Peer>> {
    Json(state.node.peers().await)
}

// === Relationships ===

/// POST /relationship
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRelationshipRequest {
    #[serde(alias = "source")]
    pub source_id: String,
    #[serde(alias = "target")]
    pub target_id: String,
    #[serde(rename = "type")]
    pub kind: String,
}

pub async fn create_relationship(
    State(state): State<SharedState>,
    Json(req): Json<CreateRelationshipRequest>,
) -> Result<(StatusCode, Json<Relationship>), ApiError> {
    let rel = state
        .node
        .create_relationship(&req.source_id, &req.target_id, &req.kind)
        .await?;
    Ok((StatusCode::CREATED, Json(rel)))
}

/// GET /relationship/:id
pub async fn get_relationship(
    State(state): State<SharedState>,
    Path(id): Path<String>,
) -> ApiResult<Relationship> {
    Ok(Json(state.node.get_relationship(&id).await?))
}

/// GET /relationships
pub async fn list_relationships(State(state): State<SharedState>) -> Json<Vec<Relationship>> {
    Json(state.node.relationships().await)
}

/// GET /relationship-types
pub async fn relationship_types(State(state): State<SharedState>) -> Json<Vec<Concept>> {
    Json(state.node.relationship_types().await)
}

/// GET /relationship-type/:kind
pub async fn relationships_by_type(
    State(state): State<SharedState>,
    Path(kind): Path<String>,
) -> Json<Vec<Relationship>> {
    Json(state.node.relationships_by_type(&kind).await)
}

/// Interaction-type GUID, from `?type=` or a `{"type": ...}` body.
#[derive(Debug, Serialize, Deserialize)]
pub struct InteractionRequest {
    #[serde(rename = "type")]
    pub kind: String,
}

/// PUT /relationship/:id/deepen
pub async fn deepen(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Json(req): Json<InteractionRequest>,
) -> ApiResult<Relationship> {
    Ok(Json(state.node.deepen(&id, &req.kind).await?))
}

/// GET /interact/:id?type=
pub async fn interact(
    State(state): State<SharedState>,
    Path(id): Path<String>,
    Query(req): Query<InteractionRequest>,
) -> ApiResult<Relationship> {
    Ok(Json(state.node.interact(&id, &req.kind).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_query_to_filter() {
        let query = ConceptQuery {
            name: Some("dog".into()),
            timestamp: Some("2024-05-01T00:00:00Z".into()),
            ..Default::default()
        };
        let filter = ConceptFilter::try_from(query).unwrap();
        assert_eq!(filter.name.as_deref(), Some("dog"));
        assert!(filter.timestamp_after.is_some());
    }

    #[test]
    fn test_bad_timestamp_rejected() {
        let query = ConceptQuery {
            timestamp: Some("last tuesday".into()),
            ..Default::default()
        };
        assert!(matches!(
            ConceptFilter::try_from(query),
            Err(GraphError::MalformedInput(_))
        ));
    }

    #[test]
    fn test_relationship_request_accepts_short_keys() {
        let req: CreateRelationshipRequest =
            serde_json::from_str(r#"{"source":"a","target":"b","type":"t"}"#).unwrap();
        assert_eq!(req.source_id, "a");
        assert_eq!(req.target_id, "b");
    }
}
