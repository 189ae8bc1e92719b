//! Application-wide error types.

use thiserror::Error;

use crate::broadcast::BroadcastError;
use crate::credentials::CredentialError;
use crate::supervisor::SupervisorError;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    DatabaseSqlx(#[from] sqlx::Error),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid state transition: cannot transition from {from} to {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("Entity not found: {entity_type} with id {id}")]
    NotFound { entity_type: String, id: String },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),

    #[error("Broadcast API error: {0}")]
    Broadcast(#[from] BroadcastError),

    #[error("Stream process error: {0}")]
    Supervisor(#[from] SupervisorError),

    #[error("Stream process for {stream_id} did not become active after {attempts} health checks")]
    ProcessActivationTimeout { stream_id: String, attempts: u32 },

    #[error("Stream process for {stream_id} exited during startup")]
    ProcessExited { stream_id: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    pub fn not_found(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity_type: entity_type.into(),
            id: id.into(),
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    /// Whether retrying the failed operation could plausibly succeed.
    ///
    /// Drives the bounded-backoff retry in the lifecycle coordinator: only
    /// transient remote failures are retried, everything else fails the
    /// occurrence immediately.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Broadcast(e) => e.is_transient(),
            Self::Credential(e) => e.is_transient(),
            Self::Supervisor(e) => e.is_transient(),
            _ => false,
        }
    }

    /// Whether the failure invalidated the stored credential itself, meaning
    /// the principal has to re-authorize before anything else can proceed.
    pub fn requires_reauthorization(&self) -> bool {
        match self {
            Self::Broadcast(e) => e.is_auth_revoked(),
            Self::Credential(e) => e.requires_reauthorization(),
            _ => false,
        }
    }
}
