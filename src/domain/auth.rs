//! Authentication slice.
//!
//! The only piece of global state that survives restarts. It is populated by
//! an external session-establishment flow and read by every remote call that
//! needs authorization context.

use serde::{Deserialize, Serialize};

use super::error::DomainError;

/// Identity of the signed-in user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Output of a credential exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user: User,
    pub access_token: String,
}

impl Credentials {
    /// Build credentials, rejecting blank user ids and tokens.
    pub fn new(user: User, access_token: impl Into<String>) -> Result<Self, DomainError> {
        let access_token = access_token.into();
        if user.id.trim().is_empty() {
            return Err(DomainError::validation("user id must not be empty"));
        }
        if access_token.trim().is_empty() {
            return Err(DomainError::validation("access token must not be empty"));
        }
        Ok(Self { user, access_token })
    }
}

/// Persisted auth slice.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthState {
    #[serde(default)]
    pub user: Option<User>,
    #[serde(default)]
    pub access_token: Option<String>,
}

impl AuthState {
    pub fn from_credentials(credentials: Credentials) -> Self {
        Self {
            user: Some(credentials.user),
            access_token: Some(credentials.access_token),
        }
    }

    /// A session is only usable when both the identity and the token are present.
    pub fn is_authenticated(&self) -> bool {
        self.user.is_some() && self.access_token.is_some()
    }
}

/// Session as seen by consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum Session {
    /// Persisted state has not been read yet; consumers must not assume either outcome.
    Unknown,
    Anonymous,
    Authenticated { user: User },
}
