//! Credentials slice and its persistence.

use tracing::{info, warn};

use crate::cache::{Action, Payload, PersistKind};
use crate::domain::auth::{AuthState, Credentials, Session};
use crate::infra::persist::{Persistor, RehydrateOutcome, Rehydration};

use super::client::CacheClient;
use super::error::CacheError;

impl CacheClient {
    /// Store credentials and persist them.
    pub async fn set_credentials(&self, credentials: Credentials) -> Result<(), CacheError> {
        let auth = AuthState::from_credentials(credentials);
        self.inner.dispatch(Action::SetCredentials { auth })?;
        self.persist_auth().await
    }

    /// Clear credentials and every cached result fetched with them.
    pub async fn logout(&self) -> Result<(), CacheError> {
        self.inner.dispatch(Action::ClearCredentials)?;
        self.inner.dispatch(Action::ResetApiState)?;
        info!("Logged out; api state reset");
        self.persist_auth().await
    }

    pub fn auth(&self) -> AuthState {
        self.inner.read(|state| state.auth().clone())
    }

    /// Session as seen by consumers. `Unknown` until a configured persistor
    /// has been rehydrated.
    pub fn session(&self) -> Session {
        self.inner.read(|state| {
            if self.inner.persistor.is_some() && !state.persistence().rehydrated {
                return Session::Unknown;
            }
            match &state.auth().user {
                Some(user) if state.auth().is_authenticated() => Session::Authenticated {
                    user: user.clone(),
                },
                _ => Session::Anonymous,
            }
        })
    }

    /// Load the persisted auth slice. Without a persistor the session is
    /// marked rehydrated as missing.
    pub async fn rehydrate(&self) -> Result<RehydrateOutcome, CacheError> {
        let rehydration = match &self.inner.persistor {
            Some(persistor) => persistor.rehydrate().await,
            None => Rehydration {
                auth: AuthState::default(),
                outcome: RehydrateOutcome::Missing,
            },
        };
        let outcome = rehydration.outcome.clone();
        let effects = self.inner.dispatch(Action::Rehydrate {
            auth: rehydration.auth,
            outcome: rehydration.outcome,
            storage: Payload::opaque::<Persistor>(),
        })?;
        if effects.auth_changed {
            self.persist_auth().await?;
        }
        Ok(outcome)
    }

    /// Wait for pending writes of the auth slice.
    pub async fn flush(&self) -> Result<(), CacheError> {
        let Some(persistor) = &self.inner.persistor else {
            return Ok(());
        };
        persistor.flush().await;
        self.inner.dispatch(Action::Persist {
            kind: PersistKind::Flush,
            storage: Payload::opaque::<Persistor>(),
        })?;
        Ok(())
    }

    /// Delete the persisted record. In-memory credentials are kept.
    pub async fn purge_persisted(&self) -> Result<(), CacheError> {
        let Some(persistor) = &self.inner.persistor else {
            return Ok(());
        };
        persistor.purge().await?;
        self.inner.dispatch(Action::Persist {
            kind: PersistKind::Purge,
            storage: Payload::opaque::<Persistor>(),
        })?;
        Ok(())
    }

    async fn persist_auth(&self) -> Result<(), CacheError> {
        let Some(persistor) = &self.inner.persistor else {
            return Ok(());
        };
        let inner = &self.inner;
        if let Err(err) = persistor.persist(|| inner.read(|state| state.auth().clone())).await {
            warn!(key = persistor.storage_key(), error = %err, "failed to persist auth state");
            return Err(err.into());
        }
        inner.dispatch(Action::Persist {
            kind: PersistKind::Persist,
            storage: Payload::opaque::<Persistor>(),
        })?;
        Ok(())
    }
}
