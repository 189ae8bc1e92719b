//! Service wiring and lifecycle management.

pub mod container;

pub use container::{ContainerConfig, ServiceContainer};
