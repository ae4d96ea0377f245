//! Client-facing services: queries, mutations and the session.

pub mod backend;
pub mod client;
pub mod endpoints;
pub mod error;
pub mod mutation;
pub mod query;
pub mod session;
