use serde::Serialize;
use thiserror::Error;

use crate::infra::error::InfraError;

/// Errors surfaced by the cache.
///
/// Query failures are stored on their entry and shared by every subscriber, so
/// the type is cloneable and serializable like the rest of the cache state.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CacheError {
    /// Transport-level failure. Retrying is left to the caller.
    #[error("network failure: {message}")]
    Network { message: String },
    /// Malformed arguments; the request never reached the network.
    #[error("invalid arguments for `{endpoint}`: {message}")]
    Validation { endpoint: String, message: String },
    /// The server rejected a write against stale state.
    #[error("conflict: {message}")]
    Conflict { message: String },
    /// The server rejected the request for a reason other than a conflict.
    #[error("server rejected request ({code}): {message}")]
    Server { code: u16, message: String },
    /// A payload that cannot be represented as plain data reached the cache.
    #[error("non-serializable payload in `{context}`: {message}")]
    Serialization { context: String, message: String },
    #[error("unknown {kind} endpoint `{endpoint}`")]
    UnknownEndpoint {
        #[serde(rename = "endpoint_kind")]
        kind: String,
        endpoint: String,
    },
    #[error("cache entry `{key}` still has {subscribers} subscriber(s)")]
    EntryInUse { key: String, subscribers: usize },
    #[error("storage failure: {message}")]
    Storage { message: String },
    #[error("async runtime unavailable: {message}")]
    Runtime { message: String },
    /// Cached JSON did not match the Rust type requested by the caller.
    #[error("failed to decode `{context}`: {message}")]
    Decode { context: String, message: String },
}

impl CacheError {
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
        }
    }

    pub fn validation(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Validation {
            endpoint: endpoint.into(),
            message: message.into(),
        }
    }

    pub fn serialization(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Serialization {
            context: context.into(),
            message: message.into(),
        }
    }

    pub fn unknown_endpoint(kind: &'static str, endpoint: impl Into<String>) -> Self {
        Self::UnknownEndpoint {
            kind: kind.to_string(),
            endpoint: endpoint.into(),
        }
    }

    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }

    pub fn decode(context: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Decode {
            context: context.into(),
            message: message.into(),
        }
    }

    /// Whether re-issuing the same request may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}

impl From<InfraError> for CacheError {
    fn from(err: InfraError) -> Self {
        Self::storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_serialize_with_kind_tag() {
        let error = CacheError::network("connection reset");
        let value = serde_json::to_value(&error).expect("serializable");
        assert_eq!(value["kind"], "network");
        assert_eq!(value["message"], "connection reset");
    }

    #[test]
    fn unknown_endpoint_keeps_its_kind_apart_from_the_tag() {
        let error = CacheError::unknown_endpoint("mutation", "vehicles.archive");
        let value = serde_json::to_value(&error).expect("serializable");
        assert_eq!(value["kind"], "unknown_endpoint");
        assert_eq!(value["endpoint_kind"], "mutation");
        assert_eq!(value["endpoint"], "vehicles.archive");
    }

    #[test]
    fn only_network_failures_are_transient() {
        assert!(CacheError::network("timeout").is_transient());
        assert!(
            !CacheError::Conflict {
                message: "stale".into()
            }
            .is_transient()
        );
        assert!(!CacheError::validation("vehicle.get", "missing id").is_transient());
    }
}
