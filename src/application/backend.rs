//! Boundary to the remote data backend.

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::domain::auth::AuthState;

use super::error::CacheError;

/// Authorization context attached to every remote call. Read-only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestContext {
    pub access_token: Option<String>,
    pub user_id: Option<String>,
}

impl RequestContext {
    pub fn from_auth(auth: &AuthState) -> Self {
        Self {
            access_token: auth.access_token.clone(),
            user_id: auth.user.as_ref().map(|user| user.id.clone()),
        }
    }

    pub fn is_authenticated(&self) -> bool {
        self.access_token.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    #[error("network failure: {0}")]
    Network(String),
    /// The write was based on stale server state.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("rejected ({code}): {message}")]
    Rejected { code: u16, message: String },
}

impl From<RemoteError> for CacheError {
    fn from(err: RemoteError) -> Self {
        match err {
            RemoteError::Network(message) => Self::Network { message },
            RemoteError::Conflict(message) => Self::Conflict { message },
            RemoteError::Rejected { code, message } => Self::Server { code, message },
        }
    }
}

/// A remote backend reachable through named operations.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    async fn call(
        &self,
        operation: &str,
        args: Value,
        ctx: RequestContext,
    ) -> Result<Value, RemoteError>;
}
