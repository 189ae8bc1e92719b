//! Broadcast API client.
//!
//! Thin trait over the remote live-streaming service's broadcast surface.
//! Every call takes a bearer access token; token lifetime is the credential
//! service's problem, not the client's.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// A remote ingest endpoint the encoder pushes media to.
///
/// Ingests are reusable: once created for a stream they are persisted and
/// bound to each new broadcast, so repeated occurrences do not accumulate
/// remote resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ingest {
    pub id: String,
    /// Push address (e.g. an RTMP URL including stream key).
    pub address: String,
}

/// Metadata for a new broadcast.
#[derive(Debug, Clone)]
pub struct BroadcastMetadata {
    pub title: String,
    pub description: Option<String>,
    pub scheduled_start: DateTime<Utc>,
}

/// Remote broadcast lifecycle transitions the coordinator drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionTarget {
    Live,
    Complete,
}

impl TransitionTarget {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Live => "live",
            Self::Complete => "complete",
        }
    }
}

/// Errors from the broadcast service, grouped by how the coordinator reacts.
#[derive(Error, Debug)]
pub enum BroadcastError {
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("invalid broadcast state transition: {0}")]
    InvalidTransition(String),

    #[error("authorization revoked: {0}")]
    AuthRevoked(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("remote service error ({status}): {message}")]
    Remote { status: u16, message: String },
}

impl BroadcastError {
    /// Retryable failures: the request may succeed if repeated shortly.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RateLimited(_) | Self::Network(_) => true,
            Self::Remote { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// The stored credential is no longer honored by the remote service.
    pub fn is_auth_revoked(&self) -> bool {
        matches!(self, Self::AuthRevoked(_))
    }
}

/// External client for the remote broadcast service.
#[async_trait]
pub trait BroadcastClient: Send + Sync {
    /// Create a reusable ingest endpoint named after the stream.
    async fn create_ingest(&self, access_token: &str, title: &str)
    -> Result<Ingest, BroadcastError>;

    /// Create a broadcast, bind it to the ingest, and return its remote id.
    ///
    /// One operation on purpose: a broadcast that exists but is not bound to
    /// any ingest is exactly the kind of orphan the coordinator works to
    /// avoid, so the client never exposes the intermediate state.
    async fn create_and_bind_broadcast(
        &self,
        access_token: &str,
        ingest_id: &str,
        metadata: &BroadcastMetadata,
    ) -> Result<String, BroadcastError>;

    /// Transition a broadcast (live, complete).
    async fn transition_broadcast(
        &self,
        access_token: &str,
        broadcast_id: &str,
        target: TransitionTarget,
    ) -> Result<(), BroadcastError>;

    /// Delete a broadcast that never went live.
    async fn delete_broadcast(
        &self,
        access_token: &str,
        broadcast_id: &str,
    ) -> Result<(), BroadcastError>;
}
