//! Broadcast lifecycle coordination.
//!
//! The coordinator owns the state machine between "an occurrence was
//! triggered" and "the stream is offline again": process start, activation
//! polling, broadcast creation and binding, the live transition, and the
//! stop path shared by auto-stop, manual stops, and reconciliation.

pub mod backoff;
pub mod service;

pub use backoff::{retry_transient, BackoffConfig};
pub use service::{CoordinatorConfig, LifecycleCoordinator, StopCause};
