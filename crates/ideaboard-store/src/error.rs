//! Error types for the record store and the idea cache.

use thiserror::Error;

use crate::{IdeaId, RecordRefError};

/// Errors that can occur when talking to a record store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Authentication failed or no session is active.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Record not found.
    #[error("record not found: {collection}/{rkey}")]
    NotFound { collection: String, rkey: String },

    /// Invalid response from server.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Rate limited.
    #[error("rate limited{}", match (endpoint, retry_after_secs) {
        (Some(ep), Some(secs)) => format!(" on {} (retry after {}s)", ep, secs),
        (Some(ep), None) => format!(" on {}", ep),
        (None, Some(secs)) => format!(" (retry after {}s)", secs),
        (None, None) => String::new(),
    })]
    RateLimited {
        /// The endpoint that was rate limited (optional).
        endpoint: Option<String>,
        /// Seconds to wait before retrying (from Retry-After header, optional).
        retry_after_secs: Option<u64>,
    },

    /// XRPC error from server.
    #[error("XRPC error: {error} - {message}")]
    Xrpc { error: String, message: String },

    /// The store returned a record reference that could not be parsed.
    #[error(transparent)]
    InvalidRef(#[from] RecordRefError),

    /// The store could not be reached.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether the failure is a transport or upstream problem rather than a
    /// refusal of the request itself.
    pub fn is_transient(&self) -> bool {
        match self {
            StoreError::Http(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            StoreError::Xrpc { error, .. } => {
                error == "UpstreamFailure"
                    || error == "UpstreamTimeout"
                    || error == "InternalServerError"
                    || error == "ServiceUnavailable"
            }
            StoreError::RateLimited { .. } | StoreError::Unavailable(_) => true,
            _ => false,
        }
    }

    /// Whether the server reported an expired access token.
    pub fn is_expired_token(&self) -> bool {
        matches!(self, StoreError::Xrpc { error, .. } if error == "ExpiredToken")
    }
}

/// Errors returned by [`IdeaCache`](crate::IdeaCache) operations.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The store could not be reached; nothing changed remotely or locally.
    #[error("store unavailable: {0}")]
    Unavailable(#[source] StoreError),

    /// The store refused the request.
    #[error("store rejected the request: {0}")]
    Rejected(#[source] StoreError),

    /// No record in the last snapshot carries this idea id.
    #[error("no record for idea {id} in the current snapshot")]
    NotFound { id: IdeaId },

    /// The write was accepted but the follow-up refresh failed. The local
    /// snapshot is stale until the next successful fetch.
    #[error("write succeeded but refresh failed: {source}")]
    RefreshFailed { source: StoreError },
}

impl From<StoreError> for CacheError {
    fn from(err: StoreError) -> Self {
        if err.is_transient() {
            CacheError::Unavailable(err)
        } else {
            CacheError::Rejected(err)
        }
    }
}
