//! Schedule evaluation.
//!
//! The evaluator is a periodic sweep over pending schedules. Window math
//! lives in [`window`] as pure functions of a supplied `now`, so the due
//! rules are testable without a clock or a database.

pub mod service;
pub mod window;

pub use service::{EvaluationSummary, EvaluatorConfig, ScheduleEvaluator};
pub use window::{current_recurring_window, one_shot_due, OneShotDue, RecurringWindow};
