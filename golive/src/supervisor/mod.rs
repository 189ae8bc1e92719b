//! Stream process supervision.
//!
//! The coordinator does not spawn encoders itself; it drives an external
//! [`ProcessSupervisor`] that owns the actual processes (ffmpeg wrappers,
//! containers, hardware encoders). The contract is deliberately small:
//! start a process pushing to an ingest address, poll its health, stop it.

use async_trait::async_trait;
use thiserror::Error;

/// Opaque reference to a running stream process.
///
/// Handles live only in memory. After a crash the supervisor's processes are
/// assumed gone, and recovery cleans up database state without calling
/// [`ProcessSupervisor::stop`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    /// Supervisor-assigned process identifier.
    pub id: String,
    /// Stream this process belongs to.
    pub stream_id: String,
}

/// Observed state of a supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessHealth {
    /// Spawned but not yet delivering media to the ingest.
    Inactive,
    /// Delivering media; the broadcast can safely go live.
    Active,
    /// The process exited or was killed.
    Exited,
}

/// Errors from process supervision.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("failed to start stream process: {0}")]
    StartFailed(String),

    #[error("failed to stop stream process: {0}")]
    StopFailed(String),

    #[error("health check failed: {0}")]
    HealthCheck(String),

    #[error("unknown process handle: {0}")]
    UnknownHandle(String),
}

impl SupervisorError {
    /// Health probes can fail transiently (socket hiccup to the supervisor)
    /// without saying anything about the process itself.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::HealthCheck(_))
    }
}

/// External supervisor for stream processes.
#[async_trait]
pub trait ProcessSupervisor: Send + Sync {
    /// Start a process for `stream_id` pushing media to `ingest_address`.
    async fn start(
        &self,
        stream_id: &str,
        ingest_address: &str,
    ) -> Result<ProcessHandle, SupervisorError>;

    /// Report the current health of a process.
    async fn health(&self, handle: &ProcessHandle) -> Result<ProcessHealth, SupervisorError>;

    /// Stop a process. Stopping an already-exited process is not an error.
    async fn stop(&self, handle: &ProcessHandle) -> Result<(), SupervisorError>;
}
