//! Subscription handle returned by [`CacheClient::query`](super::client::CacheClient::query).

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::sync::watch;

use crate::cache::{Action, CacheKey, QueryState};

use super::client::Inner;
use super::error::CacheError;

/// Releases one subscription when dropped.
struct Lease {
    inner: Arc<Inner>,
    key: CacheKey,
    grace: Duration,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.inner.release(&self.key, self.grace);
    }
}

/// One subscriber's view of a cache entry.
///
/// The entry stays cached while any handle for its key is alive; dropping the
/// last one starts the grace period before eviction.
pub struct QueryHandle {
    receiver: watch::Receiver<QueryState>,
    lease: Lease,
}

impl QueryHandle {
    pub(crate) fn new(
        inner: Arc<Inner>,
        key: CacheKey,
        receiver: watch::Receiver<QueryState>,
        grace: Duration,
    ) -> Self {
        Self {
            receiver,
            lease: Lease { inner, key, grace },
        }
    }

    pub fn key(&self) -> &CacheKey {
        &self.lease.key
    }

    /// Latest published state.
    pub fn state(&self) -> QueryState {
        self.receiver.borrow().clone()
    }

    /// Wait for the next state change. Returns `None` once the entry is gone.
    pub async fn changed(&mut self) -> Option<QueryState> {
        self.receiver.changed().await.ok()?;
        Some(self.receiver.borrow_and_update().clone())
    }

    /// Wait until the entry holds a result or an error with no fetch in flight.
    pub async fn settled(&mut self) -> QueryState {
        let settled = self
            .receiver
            .wait_for(|state| state.is_settled() && !state.is_fetching)
            .await
            .map(|state| state.clone())
            .ok();
        settled.unwrap_or_else(|| self.receiver.borrow().clone())
    }

    /// Force a fetch, joining one already in flight.
    pub fn refetch(&self) -> Result<(), CacheError> {
        self.lease.inner.dispatch(Action::Refetch {
            key: self.lease.key.clone(),
        })?;
        Ok(())
    }

    /// Decode the cached data into `T`.
    pub fn data_as<T>(&self) -> Result<Option<T>, CacheError>
    where
        T: DeserializeOwned,
    {
        let state = self.receiver.borrow();
        state
            .data
            .as_ref()
            .map(|data| {
                T::deserialize(data)
                    .map_err(|err| CacheError::decode(self.lease.key.as_str(), err.to_string()))
            })
            .transpose()
    }

    /// Unsubscribe now. Equivalent to dropping the handle.
    pub fn release(self) {
        drop(self);
    }
}

impl std::fmt::Debug for QueryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryHandle")
            .field("key", &self.lease.key)
            .field("state", &*self.receiver.borrow())
            .finish()
    }
}
