//! Request-level error taxonomy.
//!
//! Failures scoped to one item of a batch (a partition query, a research
//! section) never become a [`RelayError`]; they are downgraded to a status
//! field on the aggregate. Only whole-request failures end up here.

use thiserror::Error;

use crate::provider::ProviderError;

#[derive(Debug, Error)]
pub enum RelayError {
    /// Malformed or missing request fields. Raised before any external call.
    #[error("{0}")]
    Validation(String),

    /// Caller role lacks permission, or a required identity is missing.
    #[error("{0}")]
    Access(String),

    /// An external call exceeded its deadline.
    #[error("{0}")]
    UpstreamTimeout(String),

    /// An external call failed for a provider-side reason.
    #[error("{0}")]
    Upstream(String),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl RelayError {
    pub fn validation(message: impl Into<String>) -> Self {
        RelayError::Validation(message.into())
    }

    pub fn access(message: impl Into<String>) -> Self {
        RelayError::Access(message.into())
    }

    /// Machine-readable code for the error body.
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::Validation(_) => "validation_error",
            RelayError::Access(_) => "access_denied",
            RelayError::UpstreamTimeout(_) => "upstream_timeout",
            RelayError::Upstream(_) => "upstream_error",
            RelayError::Internal(_) => "internal",
        }
    }
}

impl From<ProviderError> for RelayError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::Timeout => {
                RelayError::UpstreamTimeout("generation backend timed out".to_string())
            }
            other => RelayError::Upstream(other.to_string()),
        }
    }
}
