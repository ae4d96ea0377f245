//! Cache client.
//!
//! Owns the cache state behind one mutex and drives everything the reducer
//! asks for: spawning fetches, arming eviction timers and publishing entry
//! state to subscribers. The mutex is never held across an `.await`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use metrics::histogram;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cache::{
    self, Action, CacheConfig, CacheKey, CacheState, Dispatcher, Effects, EvictionTicket,
    FetchRequest, Middleware, Payload, QueryState, RequestId, mutex_lock,
};
use crate::config::Settings;
use crate::domain::tags::Tag;
use crate::infra::persist::Persistor;

use super::backend::{Backend, RequestContext};
use super::endpoints::ApiDefinition;
use super::error::CacheError;
use super::mutation::MutationHandle;
use super::query::QueryHandle;

const SOURCE: &str = "application::client";
const METRIC_FETCH_MS: &str = "querysync_fetch_ms";

/// State guarded by the client mutex.
struct Shared {
    state: CacheState,
    channels: HashMap<CacheKey, watch::Sender<QueryState>>,
    fetches: HashMap<CacheKey, (RequestId, AbortHandle)>,
}

pub(crate) struct Inner {
    shared: Mutex<Shared>,
    dispatcher: Dispatcher,
    pub(crate) api: ApiDefinition,
    pub(crate) backend: Arc<dyn Backend>,
    pub(crate) persistor: Option<Persistor>,
    pub(crate) config: CacheConfig,
    runtime: Handle,
}

impl Inner {
    pub(crate) fn dispatch(self: &Arc<Self>, action: Action) -> Result<Effects, CacheError> {
        self.dispatch_with(|_| Some(action))
    }

    /// Build an action from the current state and dispatch it atomically.
    ///
    /// `build` runs under the state lock; returning `None` dispatches nothing.
    pub(crate) fn dispatch_with<F>(self: &Arc<Self>, build: F) -> Result<Effects, CacheError>
    where
        F: FnOnce(&CacheState) -> Option<Action>,
    {
        let effects = {
            let mut guard = mutex_lock(&self.shared, SOURCE, "dispatch");
            let shared = &mut *guard;
            let Some(action) = build(&shared.state) else {
                return Ok(Effects::default());
            };
            self.dispatch_locked(shared, action)?
        };
        self.arm_timers(&effects.timers);
        Ok(effects)
    }

    /// Read from the current state.
    pub(crate) fn read<R>(&self, read: impl FnOnce(&CacheState) -> R) -> R {
        read(&mutex_lock(&self.shared, SOURCE, "read").state)
    }

    pub(crate) fn request_context(&self) -> RequestContext {
        self.read(|state| RequestContext::from_auth(state.auth()))
    }

    fn dispatch_locked(
        self: &Arc<Self>,
        shared: &mut Shared,
        action: Action,
    ) -> Result<Effects, CacheError> {
        let effects = self.dispatcher.dispatch(&mut shared.state, action)?;
        Ok(self.apply_locked(shared, effects))
    }

    /// Publish and schedule what a reduced action asked for.
    fn apply_locked(self: &Arc<Self>, shared: &mut Shared, effects: Effects) -> Effects {
        for key in &effects.evicted {
            shared.channels.remove(key);
            if let Some((_, fetch)) = shared.fetches.remove(key) {
                fetch.abort();
            }
        }

        for key in &effects.notify {
            if let Some(sender) = shared.channels.get(key) {
                sender.send_replace(shared.state.query_state(key));
            }
        }

        for request in &effects.fetches {
            let task = self
                .runtime
                .spawn(Arc::clone(self).run_fetch(request.clone()));
            let previous = shared.fetches.insert(
                request.key.clone(),
                (request.request_id, task.abort_handle()),
            );
            if let Some((superseded, fetch)) = previous {
                debug!(key = %request.key, request_id = %superseded, "aborting superseded fetch");
                fetch.abort();
            }
        }

        effects
    }

    fn arm_timers(self: &Arc<Self>, tickets: &[EvictionTicket]) {
        for ticket in tickets {
            let inner: Weak<Self> = Arc::downgrade(self);
            let ticket = ticket.clone();
            let deadline = Instant::now() + ticket.delay;
            self.runtime.spawn(async move {
                tokio::time::sleep_until(deadline).await;
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                let action = Action::EvictionTimerFired {
                    key: ticket.key,
                    epoch: ticket.epoch,
                };
                if let Err(err) = inner.dispatch(action) {
                    warn!(error = %err, "eviction timer dispatch failed");
                }
            });
        }
    }

    pub(crate) fn subscribe(
        self: &Arc<Self>,
        key: CacheKey,
        endpoint: &str,
        args: Value,
        ttl: Option<Duration>,
    ) -> Result<watch::Receiver<QueryState>, CacheError> {
        let (receiver, effects) = {
            let mut guard = mutex_lock(&self.shared, SOURCE, "subscribe");
            let shared = &mut *guard;
            let action = Action::Subscribe {
                key: key.clone(),
                endpoint: endpoint.to_string(),
                args,
                ttl,
            };
            let effects = self.dispatch_locked(shared, action)?;
            let receiver = match shared.channels.get(&key) {
                Some(sender) => sender.subscribe(),
                None => {
                    let (sender, receiver) = watch::channel(shared.state.query_state(&key));
                    shared.channels.insert(key, sender);
                    receiver
                }
            };
            (receiver, effects)
        };
        self.arm_timers(&effects.timers);
        Ok(receiver)
    }

    pub(crate) fn release(self: &Arc<Self>, key: &CacheKey, grace: Duration) {
        let action = Action::Unsubscribe {
            key: key.clone(),
            grace,
        };
        if let Err(err) = self.dispatch(action) {
            warn!(%key, error = %err, "unsubscribe dispatch failed");
        }
    }

    async fn run_fetch(self: Arc<Self>, request: FetchRequest) {
        let FetchRequest {
            key,
            request_id,
            endpoint,
            args,
        } = request;

        let action = match self.api.query_endpoint(&endpoint) {
            Ok(definition) => {
                let started = Instant::now();
                let result = self
                    .backend
                    .call(definition.operation_name(), args.clone(), self.request_context())
                    .await;
                histogram!(METRIC_FETCH_MS, "endpoint" => endpoint.clone())
                    .record(started.elapsed().as_secs_f64() * 1000.0);

                match result {
                    Ok(data) => {
                        let tags = definition.tags_for(&data, &args);
                        Action::QueryFulfilled {
                            key: key.clone(),
                            request_id,
                            data,
                            tags,
                        }
                    }
                    Err(err) => {
                        debug!(%key, %request_id, error = %err, "fetch failed");
                        Action::QueryRejected {
                            key: key.clone(),
                            request_id,
                            error: err.into(),
                        }
                    }
                }
            }
            Err(error) => Action::QueryRejected {
                key: key.clone(),
                request_id,
                error,
            },
        };

        let effects = {
            let mut guard = mutex_lock(&self.shared, SOURCE, "finish_fetch");
            let shared = &mut *guard;
            if shared
                .fetches
                .get(&key)
                .is_some_and(|(in_flight, _)| *in_flight == request_id)
            {
                shared.fetches.remove(&key);
            }
            match self.dispatch_locked(shared, action) {
                Ok(effects) => effects,
                Err(err) => {
                    warn!(%key, %request_id, error = %err, "fetch result rejected by middleware");
                    let closed = self
                        .dispatcher
                        .close_fetch(&mut shared.state, key.clone(), request_id, err);
                    self.apply_locked(shared, closed)
                }
            }
        };
        self.arm_timers(&effects.timers);
    }
}

/// Handle to a cache. Cheap to clone; clones share the same cache.
#[derive(Clone)]
pub struct CacheClient {
    pub(crate) inner: Arc<Inner>,
}

impl CacheClient {
    pub fn builder(api: ApiDefinition, backend: Arc<dyn Backend>) -> CacheClientBuilder {
        CacheClientBuilder {
            api,
            backend,
            config: CacheConfig::default(),
            persistor: None,
            middleware: Vec::new(),
        }
    }

    /// Subscribe to `endpoint(args)`, fetching when nothing fresh is cached.
    ///
    /// # Errors
    /// Fails without touching the cache when the endpoint is unknown or the
    /// arguments are not plain data or fail the endpoint's validator.
    pub fn query<A>(&self, endpoint: &str, args: &A) -> Result<QueryHandle, CacheError>
    where
        A: Serialize + ?Sized,
    {
        let definition = self.inner.api.query_endpoint(endpoint)?;
        let encoded = cache::encode(endpoint, args)?;
        definition.check_args(&encoded.args)?;

        let ttl = definition.ttl_or(self.inner.config.default_ttl);
        let grace = definition.grace_or(self.inner.config.keep_unused_for);
        let receiver = self
            .inner
            .subscribe(encoded.key.clone(), endpoint, encoded.args, ttl)?;
        Ok(QueryHandle::new(
            Arc::clone(&self.inner),
            encoded.key,
            receiver,
            grace,
        ))
    }

    /// Subscribe, wait for the result and decode it.
    pub async fn fetch<A, T>(&self, endpoint: &str, args: &A) -> Result<T, CacheError>
    where
        A: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let mut handle = self.query(endpoint, args)?;
        let state = handle.settled().await;
        if let (true, Some(error)) = (state.is_error(), state.error) {
            return Err(error);
        }
        handle
            .data_as::<T>()?
            .ok_or_else(|| CacheError::decode(endpoint, "query settled without data"))
    }

    pub fn mutation(&self, endpoint: &str) -> Result<MutationHandle, CacheError> {
        let definition = self.inner.api.mutation_endpoint(endpoint)?;
        Ok(MutationHandle::new(Arc::clone(&self.inner), definition))
    }

    /// Mark every entry providing `tags` stale and refetch the observed ones.
    pub fn invalidate_tags(&self, tags: impl IntoIterator<Item = Tag>) -> Result<(), CacheError> {
        let tags: Vec<Tag> = tags.into_iter().collect();
        if tags.is_empty() {
            return Ok(());
        }
        self.inner.dispatch(Action::InvalidateTags { tags })?;
        Ok(())
    }

    /// Drop every cached result. Observed queries refetch from scratch.
    pub fn reset_api_state(&self) -> Result<(), CacheError> {
        self.inner.dispatch(Action::ResetApiState)?;
        Ok(())
    }

    /// Dispatch an application-defined action through the middleware chain.
    pub fn dispatch(&self, action_type: impl Into<String>, payload: Payload) -> Result<(), CacheError> {
        self.inner.dispatch(Action::Custom {
            action_type: action_type.into(),
            payload,
        })?;
        Ok(())
    }

    /// Current state of `endpoint(args)` without subscribing.
    pub fn peek<A>(&self, endpoint: &str, args: &A) -> Result<QueryState, CacheError>
    where
        A: Serialize + ?Sized,
    {
        let encoded = cache::encode(endpoint, args)?;
        Ok(self.inner.read(|state| state.query_state(&encoded.key)))
    }

    /// Serialized cache state, for debugging.
    pub fn snapshot(&self) -> Result<Value, CacheError> {
        self.inner.read(|state| {
            serde_json::to_value(state)
                .map_err(|err| CacheError::serialization("snapshot", err.to_string()))
        })
    }

    pub fn entry_count(&self) -> usize {
        self.inner.read(CacheState::entry_count)
    }

    pub fn pending_mutations(&self) -> usize {
        self.inner.read(CacheState::pending_mutations)
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }
}

pub struct CacheClientBuilder {
    api: ApiDefinition,
    backend: Arc<dyn Backend>,
    config: CacheConfig,
    persistor: Option<Persistor>,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl CacheClientBuilder {
    pub fn config(mut self, config: CacheConfig) -> Self {
        self.config = config;
        self
    }

    /// Apply cache defaults and, when enabled, file persistence from settings.
    pub fn settings(mut self, settings: &Settings) -> Self {
        self.config = CacheConfig::from(&settings.cache);
        self.persistor = settings
            .persistence
            .enabled
            .then(|| Persistor::from_settings(&settings.persistence));
        self
    }

    pub fn persistor(mut self, persistor: Persistor) -> Self {
        self.persistor = Some(persistor);
        self
    }

    /// Append middleware after the built-in logger and serializability guard.
    pub fn middleware<M>(mut self, middleware: M) -> Self
    where
        M: Middleware + 'static,
    {
        self.middleware.push(Arc::new(middleware));
        self
    }

    /// # Errors
    /// Returns [`CacheError::Runtime`] when called outside a tokio runtime.
    pub fn build(self) -> Result<CacheClient, CacheError> {
        let runtime = Handle::try_current().map_err(|err| CacheError::Runtime {
            message: err.to_string(),
        })?;
        let dispatcher = Dispatcher::new(&self.config, self.middleware);
        let state = CacheState::new(&self.config);

        Ok(CacheClient {
            inner: Arc::new(Inner {
                shared: Mutex::new(Shared {
                    state,
                    channels: HashMap::new(),
                    fetches: HashMap::new(),
                }),
                dispatcher,
                api: self.api,
                backend: self.backend,
                persistor: self.persistor,
                config: self.config,
                runtime,
            }),
        })
    }
}
