// Errors raised while loading, scoping or querying content.
//
// Most store lookups return `Option`/empty results for genuinely optional
// relationships. `ContentError::NotFound` is reserved for lookups whose
// callers assume the relationship always resolves (the instrument type of
// an audio or of a pattern event), where absence means malformed content.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ContentError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("invalid configuration for {subject}: {reason}")]
    Configuration { subject: String, reason: String },

    #[error("invalid {entity}: {reason}")]
    InvalidEntity { entity: &'static str, reason: String },

    #[error("content JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ContentError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        ContentError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}
