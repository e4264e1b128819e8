//! Error types for ccn-node

use thiserror::Error;

/// Errors raised by a storage/transport substrate adapter.
#[derive(Error, Debug)]
pub enum SubstrateError {
    #[error("Substrate unavailable: {0}")]
    Unavailable(String),

    #[error("Operation not supported by substrate: {0}")]
    Unsupported(&'static str),

    #[error("Content not found: {0}")]
    NotFound(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

/// Errors raised by graph operations.
///
/// The request layer maps `NotFound` to 404, `MalformedInput` and
/// `UnresolvedReference` to 400, everything else to 500.
#[derive(Error, Debug)]
pub enum GraphError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("Substrate unavailable: {0}")]
    Substrate(#[from] SubstrateError),

    #[error("Malformed input: {0}")]
    MalformedInput(String),

    #[error("Unresolved {kind} reference: {guid}")]
    UnresolvedReference { kind: &'static str, guid: String },

    #[error("Bootstrap failed while {stage}: {source}")]
    Bootstrap {
        stage: String,
        #[source]
        source: Box<GraphError>,
    },

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl GraphError {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        GraphError::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn unresolved(kind: &'static str, guid: impl Into<String>) -> Self {
        GraphError::UnresolvedReference {
            kind,
            guid: guid.into(),
        }
    }

    /// Wrap an error raised while loading a structure.
    pub fn bootstrap(stage: impl Into<String>, source: GraphError) -> Self {
        GraphError::Bootstrap {
            stage: stage.into(),
            source: Box::new(source),
        }
    }

    /// True for failures caused by bad caller input rather than the node.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            GraphError::MalformedInput(_)
                | GraphError::UnresolvedReference { .. }
                | GraphError::Yaml(_)
                | GraphError::Json(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, GraphError>;
