use kubestream_types::SourceKey;
use thiserror::Error;

/// Bad request parameters, reported before any source is queried
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("stdout or stderr is required")]
    SelectorRequired,

    #[error("minimum must be between 0 and {max}, got {value}")]
    MinimumOutOfRange { value: String, max: usize },

    #[error("invalid lastSeenId: {0}")]
    InvalidCursor(String),

    #[error("invalid filter: {0}")]
    InvalidRegex(#[from] regex::Error),

    #[error("invalid timestamp for {field}: {value}")]
    InvalidTimestamp { field: &'static str, value: String },

    #[error("{0} must be longer than zero")]
    ZeroInterval(&'static str),
}

/// Failures of the log source collaborator
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("source {0} not found")]
    NotFound(SourceKey),

    /// Source exists but is outside the permitted set
    #[error("source {0} is not accessible")]
    Forbidden(SourceKey),

    #[error("failed to query logs of {key}: {message}")]
    Query { key: SourceKey, message: String },

    #[error("failed to tail logs of {key}: {message}")]
    Tail { key: SourceKey, message: String },
}

impl SourceError {
    pub fn query(key: &SourceKey, err: impl std::fmt::Display) -> Self {
        Self::Query {
            key: key.clone(),
            message: err.to_string(),
        }
    }

    pub fn tail(key: &SourceKey, err: impl std::fmt::Display) -> Self {
        Self::Tail {
            key: key.clone(),
            message: err.to_string(),
        }
    }
}

/// Errors of the historical range search
#[derive(Debug, Error)]
pub enum SearchError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Source(#[from] SourceError),
}
