//! Dispatch middleware.
//!
//! Actions pass through an ordered chain before reaching the reducer:
//! the action logger, the serializability guard, then any middleware
//! installed by the application. Each link decides whether to call
//! [`Next::run`]; returning early drops the action.

use std::collections::HashSet;
use std::sync::Arc;

use metrics::counter;
use tracing::{debug, warn};

use crate::application::error::CacheError;

use super::config::CacheConfig;
use super::entry::RequestId;
use super::events::{Action, Payload};
use super::keys::CacheKey;
use super::state::{CacheState, Effects};

const METRIC_ACTION_TOTAL: &str = "querysync_action_total";

/// A link in the dispatch chain.
pub trait Middleware: Send + Sync {
    fn name(&self) -> &'static str;

    fn handle(&self, action: Action, next: Next<'_>) -> Result<Effects, CacheError>;
}

/// Remainder of the chain after the current middleware.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    state: &'a mut CacheState,
}

impl<'a> Next<'a> {
    /// Read-only view of the state the action will be reduced into.
    pub fn state(&self) -> &CacheState {
        &*self.state
    }

    pub fn run(self, action: Action) -> Result<Effects, CacheError> {
        match self.chain.split_first() {
            Some((head, rest)) => head.handle(
                action,
                Next {
                    chain: rest,
                    state: self.state,
                },
            ),
            None => Ok(self.state.reduce(action)),
        }
    }
}

/// Ordered middleware chain ending in the reducer.
#[derive(Clone)]
pub struct Dispatcher {
    chain: Vec<Arc<dyn Middleware>>,
}

impl Dispatcher {
    /// Logger and guard configured from `config`, followed by `extra`.
    pub fn new(config: &CacheConfig, extra: Vec<Arc<dyn Middleware>>) -> Self {
        let mut chain: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(ActionLogger),
            Arc::new(SerializableGuard::from_config(config)),
        ];
        chain.extend(extra);
        Self { chain }
    }

    pub fn dispatch(&self, state: &mut CacheState, action: Action) -> Result<Effects, CacheError> {
        Next {
            chain: &self.chain,
            state,
        }
        .run(action)
    }

    /// Fail a fetch cycle without running the chain.
    ///
    /// Used when the chain refused the fetch's result, so the entry does not
    /// stay `Pending` on a request that will never complete.
    pub fn close_fetch(
        &self,
        state: &mut CacheState,
        key: CacheKey,
        request_id: RequestId,
        error: CacheError,
    ) -> Effects {
        let action = Action::QueryRejected {
            key,
            request_id,
            error,
        };
        counter!(METRIC_ACTION_TOTAL, "action" => action.action_type().to_string()).increment(1);
        state.reduce(action)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.chain.iter().map(|middleware| middleware.name()).collect()
    }
}

/// Records every action. Never alters or drops it.
pub struct ActionLogger;

impl Middleware for ActionLogger {
    fn name(&self) -> &'static str {
        "action_logger"
    }

    fn handle(&self, action: Action, next: Next<'_>) -> Result<Effects, CacheError> {
        let action_type = action.action_type().to_string();
        counter!(METRIC_ACTION_TOTAL, "action" => action_type.clone()).increment(1);
        debug!(action = %action, "dispatching");

        let result = next.run(action);
        match &result {
            Ok(effects) => debug!(
                action = %action_type,
                notified = effects.notify.len(),
                fetches = effects.fetches.len(),
                evicted = effects.evicted.len(),
                "dispatched"
            ),
            Err(err) => debug!(action = %action_type, error = %err, "dispatch rejected"),
        }
        result
    }
}

/// Rejects actions whose payload is not plain JSON data.
pub struct SerializableGuard {
    enabled: bool,
    ignored: HashSet<String>,
}

impl SerializableGuard {
    pub fn new(enabled: bool, ignored: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            enabled,
            ignored: ignored.into_iter().map(Into::into).collect(),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(config.serializable_check, config.allowed_opaque_actions())
    }

    fn check(&self, action: &Action) -> Result<(), CacheError> {
        if !self.enabled || self.ignored.contains(action.action_type()) {
            return Ok(());
        }
        match action.payload() {
            Some(Payload::Opaque { type_name }) => {
                warn!(
                    action = %action.action_type(),
                    type_name,
                    "rejecting non-serializable payload"
                );
                Err(CacheError::serialization(
                    action.action_type(),
                    format!("payload of type `{type_name}` is not plain data"),
                ))
            }
            _ => Ok(()),
        }
    }
}

impl Middleware for SerializableGuard {
    fn name(&self) -> &'static str {
        "serializable_guard"
    }

    fn handle(&self, action: Action, next: Next<'_>) -> Result<Effects, CacheError> {
        self.check(&action)?;
        next.run(action)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;
    use crate::cache::events::{PersistKind, REHYDRATE};

    struct Counting(Arc<AtomicUsize>);

    impl Middleware for Counting {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn handle(&self, action: Action, next: Next<'_>) -> Result<Effects, CacheError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            next.run(action)
        }
    }

    struct Blocking;

    impl Middleware for Blocking {
        fn name(&self) -> &'static str {
            "blocking"
        }

        fn handle(&self, action: Action, _next: Next<'_>) -> Result<Effects, CacheError> {
            Err(CacheError::validation(action.action_type(), "blocked"))
        }
    }

    fn custom(payload: Payload) -> Action {
        Action::Custom {
            action_type: "ui/select".to_string(),
            payload,
        }
    }

    #[test]
    fn chain_order_is_logger_guard_then_extras() {
        let config = CacheConfig::default();
        let extra: Vec<Arc<dyn Middleware>> = vec![Arc::new(Blocking)];
        let dispatcher = Dispatcher::new(&config, extra);
        assert_eq!(
            dispatcher.names(),
            vec!["action_logger", "serializable_guard", "blocking"]
        );
    }

    #[test]
    fn guard_rejects_opaque_payloads() {
        let config = CacheConfig::default();
        let dispatcher = Dispatcher::new(&config, Vec::new());
        let mut state = CacheState::new(&config);

        let err = dispatcher
            .dispatch(&mut state, custom(Payload::opaque::<std::fs::File>()))
            .expect_err("opaque payload rejected");
        assert!(matches!(err, CacheError::Serialization { .. }));

        dispatcher
            .dispatch(&mut state, custom(Payload::of(&json!({"id": 1}))))
            .expect("plain payload accepted");
    }

    #[test]
    fn guard_allows_persistence_actions() {
        let config = CacheConfig::default();
        let dispatcher = Dispatcher::new(&config, Vec::new());
        let mut state = CacheState::new(&config);

        let action = Action::Persist {
            kind: PersistKind::Purge,
            storage: Payload::opaque::<std::fs::File>(),
        };
        dispatcher.dispatch(&mut state, action).expect("allow-listed");
        assert!(config.allowed_opaque_actions().any(|action| action == REHYDRATE));
    }

    #[test]
    fn guard_can_be_disabled() {
        let config = CacheConfig {
            serializable_check: false,
            ..Default::default()
        };
        let dispatcher = Dispatcher::new(&config, Vec::new());
        let mut state = CacheState::new(&config);
        dispatcher
            .dispatch(&mut state, custom(Payload::opaque::<std::fs::File>()))
            .expect("guard disabled");
    }

    #[test]
    fn rejected_actions_never_reach_later_middleware() {
        let config = CacheConfig::default();
        let seen = Arc::new(AtomicUsize::new(0));
        let extra: Vec<Arc<dyn Middleware>> = vec![Arc::new(Counting(seen.clone()))];
        let dispatcher = Dispatcher::new(&config, extra);
        let mut state = CacheState::new(&config);

        let _ = dispatcher.dispatch(&mut state, custom(Payload::opaque::<std::fs::File>()));
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        dispatcher
            .dispatch(&mut state, Action::ResetApiState)
            .expect("plain action");
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
