//! Mutation execution.
//!
//! A trigger stages its optimistic patches, awaits the remote write, and then
//! either commits (pessimistic patches, tag invalidation) or rolls back only
//! the patches it staged itself.

use std::sync::Arc;

use metrics::counter;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::watch;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::cache::{self, Action, ChangeSet, MutationId, MutationStatus};

use super::client::Inner;
use super::endpoints::MutationEndpoint;
use super::error::CacheError;

const METRIC_MUTATION_TOTAL: &str = "querysync_mutation_total";

/// Outcome of the most recent trigger of a [`MutationHandle`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MutationState {
    pub status: MutationStatus,
    pub data: Option<Value>,
    pub error: Option<CacheError>,
}

impl MutationState {
    fn idle() -> Self {
        Self {
            status: MutationStatus::Idle,
            data: None,
            error: None,
        }
    }

    pub fn is_loading(&self) -> bool {
        self.status == MutationStatus::Pending
    }
}

/// Trigger for one mutation endpoint. Clones share the same [`MutationState`].
#[derive(Clone)]
pub struct MutationHandle {
    inner: Arc<Inner>,
    endpoint: Arc<MutationEndpoint>,
    state: Arc<watch::Sender<MutationState>>,
}

impl MutationHandle {
    pub(crate) fn new(inner: Arc<Inner>, endpoint: Arc<MutationEndpoint>) -> Self {
        let (state, _) = watch::channel(MutationState::idle());
        Self {
            inner,
            endpoint,
            state: Arc::new(state),
        }
    }

    pub fn endpoint(&self) -> &str {
        self.endpoint.name()
    }

    pub fn state(&self) -> MutationState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<MutationState> {
        self.state.subscribe()
    }

    /// Forget the last outcome.
    pub fn reset(&self) {
        self.state.send_replace(MutationState::idle());
    }

    /// Run the mutation and return the server's result.
    ///
    /// # Errors
    /// Invalid arguments fail before anything is dispatched. Remote failures
    /// are returned after this trigger's optimistic patches are rolled back.
    pub async fn trigger<A>(&self, args: &A) -> Result<Value, CacheError>
    where
        A: Serialize + ?Sized,
    {
        let name = self.endpoint.name();
        let args = cache::to_plain_value(name, args)?;
        self.endpoint.check_args(&args)?;

        self.state.send_replace(MutationState {
            status: MutationStatus::Pending,
            data: None,
            error: None,
        });

        let mutation_id = Uuid::new_v4();
        let result = self.execute(mutation_id, &args).await;

        let (status, outcome) = match &result {
            Ok(_) => (MutationStatus::Fulfilled, "fulfilled"),
            Err(_) => (MutationStatus::Rejected, "rejected"),
        };
        counter!(METRIC_MUTATION_TOTAL, "endpoint" => name.to_string(), "outcome" => outcome)
            .increment(1);
        self.state.send_replace(MutationState {
            status,
            data: result.as_ref().ok().cloned(),
            error: result.as_ref().err().cloned(),
        });
        result
    }

    /// [`trigger`](Self::trigger), decoding the result into `T`.
    pub async fn trigger_as<A, T>(&self, args: &A) -> Result<T, CacheError>
    where
        A: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let value = self.trigger(args).await?;
        serde_json::from_value(value)
            .map_err(|err| CacheError::decode(self.endpoint.name(), err.to_string()))
    }

    async fn execute(&self, mutation_id: MutationId, args: &Value) -> Result<Value, CacheError> {
        self.inner.dispatch(Action::MutationStarted {
            mutation_id,
            endpoint: self.endpoint.name().to_string(),
        })?;
        let pending = PendingMutation::new(Arc::clone(&self.inner), mutation_id);

        self.stage_optimistic(mutation_id, args)?;

        let ctx = self.inner.request_context();
        let result = self
            .inner
            .backend
            .call(self.endpoint.operation_name(), args.clone(), ctx)
            .await;

        match result {
            Ok(data) => {
                self.commit(pending, args, &data)?;
                Ok(data)
            }
            Err(err) => {
                let err = CacheError::from(err);
                debug!(endpoint = self.endpoint.name(), %mutation_id, error = %err, "mutation failed");
                Err(err)
            }
        }
    }

    fn stage_optimistic(&self, mutation_id: MutationId, args: &Value) -> Result<(), CacheError> {
        for update in self.endpoint.optimistic_updates() {
            let key = cache::encode_value(&update.endpoint, &update.target_args(args))?;
            let patch_id = Uuid::new_v4();
            self.inner.dispatch_with(|state| {
                let before = state.entry(&key)?.data.as_ref()?;
                let mut draft = before.clone();
                update.apply(&mut draft, args);
                let changes = ChangeSet::diff(before, &draft);
                if changes.is_empty() {
                    return None;
                }
                Some(Action::PatchApplied {
                    mutation_id,
                    patch_id,
                    key,
                    changes,
                })
            })?;
        }
        Ok(())
    }

    fn commit(
        &self,
        pending: PendingMutation,
        args: &Value,
        result: &Value,
    ) -> Result<(), CacheError> {
        for update in self.endpoint.result_updates() {
            let key = cache::encode_value(&update.endpoint, &update.target_args(args))?;
            self.inner.dispatch_with(|state| {
                let before = state.entry(&key)?.data.as_ref()?;
                let mut draft = before.clone();
                update.apply(&mut draft, args, result);
                let changes = ChangeSet::diff(before, &draft);
                (!changes.is_empty()).then_some(Action::QueryDataPatched { key, changes })
            })?;
        }

        self.inner.dispatch(Action::MutationCommitted {
            mutation_id: pending.mutation_id,
        })?;
        pending.disarm();

        let tags = self.endpoint.tags_to_invalidate(args, result);
        if !tags.is_empty() {
            self.inner.dispatch(Action::InvalidateTags { tags })?;
        }
        Ok(())
    }
}

/// Rolls back a started mutation unless it was committed.
///
/// Dropping a `trigger` future mid-flight drops this guard too, so the
/// optimistic patches never outlive the mutation that staged them.
struct PendingMutation {
    inner: Arc<Inner>,
    mutation_id: MutationId,
    committed: bool,
}

impl PendingMutation {
    fn new(inner: Arc<Inner>, mutation_id: MutationId) -> Self {
        Self {
            inner,
            mutation_id,
            committed: false,
        }
    }

    fn disarm(mut self) {
        self.committed = true;
    }
}

impl Drop for PendingMutation {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mutation_id = self.mutation_id;
        if let Err(err) = self.inner.dispatch(Action::MutationRolledBack { mutation_id }) {
            warn!(%mutation_id, error = %err, "rollback dispatch failed");
        }
    }
}

impl std::fmt::Debug for MutationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationHandle")
            .field("endpoint", &self.endpoint.name())
            .field("state", &*self.state.borrow())
            .finish()
    }
}
