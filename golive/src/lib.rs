//! golive library crate.
//!
//! Scheduled go-live automation: schedule evaluation, broadcast lifecycle
//! coordination, and auto-stop for managed live streams.

pub mod broadcast;
pub mod config;
pub mod coordinator;
pub mod credentials;
pub mod database;
pub mod error;
pub mod logging;
pub mod monitor;
pub mod panic_hook;
pub mod scheduler;
pub mod services;
pub mod supervisor;

pub use error::{Error, Result};
