//! Weather-specific error types.

use stormwatch_core::NetworkError;
use thiserror::Error;

/// A stored value or HTTP body that does not have the expected shape.
///
/// Never shown to the user directly: a bad cache slot becomes a cache miss,
/// a bad response becomes a `FetchError::Schema`.
#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("malformed JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl SchemaError {
    pub fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Failure of a single forecast fetch.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Unexpected forecast response: {0}")]
    Schema(#[from] SchemaError),
}

impl FetchError {
    /// User-friendly error message for display.
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Network(e) => e.user_message(),
            Self::Schema(_) => "The weather service sent an unexpected response. Please retry.",
        }
    }

    /// Whether a manual retry has a chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Network(NetworkError::ServerError { status, .. }) => {
                *status >= 500 || *status == 429 || *status == 408
            }
            Self::Network(_) => true,
            Self::Schema(_) => false,
        }
    }
}
