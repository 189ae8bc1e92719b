//! Credential error types.

use thiserror::Error;

/// Errors that can occur while refreshing a credential.
#[derive(Debug, Error)]
pub enum CredentialError {
    /// Refresh failed for a reason that may clear up on retry.
    #[error("Refresh failed: {0}")]
    RefreshFailed(String),

    /// Token endpoint asked us to slow down.
    #[error("Rate limited - try again later")]
    RateLimited,

    /// The grant itself was rejected - the principal must re-authorize.
    #[error("Re-authorization required: {0}")]
    ReauthorizationRequired(String),

    /// Token endpoint returned something we could not use.
    #[error("Malformed token response: {0}")]
    MalformedResponse(String),

    /// Network error.
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
}

impl CredentialError {
    /// Check if this error means the stored credential is dead and the
    /// principal has to go through authorization again.
    pub fn requires_reauthorization(&self) -> bool {
        matches!(self, Self::ReauthorizationRequired(_))
    }

    /// Check if this error is transient and the refresh may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::RateLimited | Self::RefreshFailed(_)
        )
    }
}
