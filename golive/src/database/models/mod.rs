//! Database models for golive.
//!
//! These models map directly to the database schema. Status columns are stored
//! as lowercase strings and parsed back through the strum-derived enums.

pub mod credential;
pub mod schedule;
pub mod stream;

pub use credential::*;
pub use schedule::*;
pub use stream::*;
