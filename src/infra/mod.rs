//! Infrastructure adapters and runtime bootstrap.

pub mod error;
pub mod persist;
pub mod telemetry;
