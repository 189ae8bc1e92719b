//! Repository layer for database access.
//!
//! This module implements the Repository Pattern to abstract all database
//! interactions. Services are generic over these traits, which keeps the
//! coordinator and evaluator testable against in-memory SQLite.

pub mod credential;
pub mod schedule;
pub mod stream;

pub use credential::*;
pub use schedule::*;
pub use stream::*;
