//! Auto-stop monitoring.
//!
//! A periodic sweep over stream rows that ends sessions the coordinator is
//! no longer driving forward: live streams past their scheduled end time,
//! live streams with no valid session behind them, and streams stuck in a
//! transitional status since a crashed run.

pub mod service;

pub use service::{AutoStopMonitor, MonitorConfig, StopSweepSummary};
