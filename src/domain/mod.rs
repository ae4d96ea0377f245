//! Domain layer types and invariants.

pub mod auth;
pub mod error;
pub mod tags;
