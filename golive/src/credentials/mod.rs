//! Credential storage and refresh.
//!
//! Channel credentials are OAuth token pairs persisted per channel. The
//! service hands out access tokens that are guaranteed fresh for at least the
//! configured safety margin, refreshing through the token endpoint when they
//! are not.

pub mod error;
pub mod refresher;
pub mod service;

pub use error::CredentialError;
pub use refresher::{HttpTokenRefresher, RefreshedToken, TokenRefresher};
pub use service::{ChannelCredential, CredentialService, DEFAULT_REFRESH_MARGIN_MINUTES};
