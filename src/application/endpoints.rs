//! Endpoint definitions.
//!
//! An [`ApiDefinition`] names every query and mutation the client can run and
//! describes how each one interacts with the cache: which tags a query result
//! provides, which tags a mutation invalidates, and which cached queries a
//! mutation patches optimistically or from its result.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::domain::error::DomainError;
use crate::domain::tags::Tag;

use super::error::CacheError;

type ProvidesFn = dyn Fn(&Value, &Value) -> Vec<Tag> + Send + Sync;
type ValidatorFn = dyn Fn(&Value) -> Result<(), DomainError> + Send + Sync;
type TargetArgsFn = dyn Fn(&Value) -> Value + Send + Sync;
type OptimisticRecipeFn = dyn Fn(&mut Value, &Value) + Send + Sync;
type ResultRecipeFn = dyn Fn(&mut Value, &Value, &Value) + Send + Sync;

/// A read operation whose results are cached.
#[derive(Clone)]
pub struct QueryEndpoint {
    name: String,
    operation: String,
    provides: Option<Arc<ProvidesFn>>,
    ttl: Option<Duration>,
    keep_unused_for: Option<Duration>,
    validator: Option<Arc<ValidatorFn>>,
}

impl QueryEndpoint {
    /// Endpoint calling the remote operation of the same name.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            operation: name.clone(),
            name,
            provides: None,
            ttl: None,
            keep_unused_for: None,
            validator: None,
        }
    }

    pub fn operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = operation.into();
        self
    }

    /// Tags provided by a result, computed from `(result, args)`.
    pub fn provides<F>(mut self, provides: F) -> Self
    where
        F: Fn(&Value, &Value) -> Vec<Tag> + Send + Sync + 'static,
    {
        self.provides = Some(Arc::new(provides));
        self
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Grace period between the last unsubscribe and eviction.
    pub fn keep_unused_for(mut self, grace: Duration) -> Self {
        self.keep_unused_for = Some(grace);
        self
    }

    pub fn validate<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Value) -> Result<(), DomainError> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn operation_name(&self) -> &str {
        &self.operation
    }

    pub fn ttl_or(&self, default: Option<Duration>) -> Option<Duration> {
        self.ttl.or(default)
    }

    pub fn grace_or(&self, default: Duration) -> Duration {
        self.keep_unused_for.unwrap_or(default)
    }

    pub fn tags_for(&self, result: &Value, args: &Value) -> BTreeSet<Tag> {
        self.provides
            .as_ref()
            .map(|provides| provides(result, args).into_iter().collect())
            .unwrap_or_default()
    }

    pub fn check_args(&self, args: &Value) -> Result<(), CacheError> {
        run_validator(&self.name, self.validator.as_deref(), args)
    }
}

impl fmt::Debug for QueryEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryEndpoint")
            .field("name", &self.name)
            .field("operation", &self.operation)
            .field("ttl", &self.ttl)
            .field("keep_unused_for", &self.keep_unused_for)
            .finish_non_exhaustive()
    }
}

/// Optimistic write into a cached query, applied before the remote call.
#[derive(Clone)]
pub struct OptimisticUpdate {
    pub endpoint: String,
    target_args: Arc<TargetArgsFn>,
    recipe: Arc<OptimisticRecipeFn>,
}

impl OptimisticUpdate {
    /// `target_args` maps mutation args to the args of the cached query;
    /// `recipe` edits that query's data given the mutation args.
    pub fn new<A, R>(endpoint: impl Into<String>, target_args: A, recipe: R) -> Self
    where
        A: Fn(&Value) -> Value + Send + Sync + 'static,
        R: Fn(&mut Value, &Value) + Send + Sync + 'static,
    {
        Self {
            endpoint: endpoint.into(),
            target_args: Arc::new(target_args),
            recipe: Arc::new(recipe),
        }
    }

    pub fn target_args(&self, args: &Value) -> Value {
        (self.target_args)(args)
    }

    pub fn apply(&self, draft: &mut Value, args: &Value) {
        (self.recipe)(draft, args)
    }
}

/// Write into a cached query computed from the server's result.
#[derive(Clone)]
pub struct ResultUpdate {
    pub endpoint: String,
    target_args: Arc<TargetArgsFn>,
    recipe: Arc<ResultRecipeFn>,
}

impl ResultUpdate {
    pub fn new<A, R>(endpoint: impl Into<String>, target_args: A, recipe: R) -> Self
    where
        A: Fn(&Value) -> Value + Send + Sync + 'static,
        R: Fn(&mut Value, &Value, &Value) + Send + Sync + 'static,
    {
        Self {
            endpoint: endpoint.into(),
            target_args: Arc::new(target_args),
            recipe: Arc::new(recipe),
        }
    }

    pub fn target_args(&self, args: &Value) -> Value {
        (self.target_args)(args)
    }

    pub fn apply(&self, draft: &mut Value, args: &Value, result: &Value) {
        (self.recipe)(draft, args, result)
    }
}

/// A write operation.
#[derive(Clone)]
pub struct MutationEndpoint {
    name: String,
    operation: String,
    invalidates: Option<Arc<ProvidesFn>>,
    optimistic: Vec<OptimisticUpdate>,
    on_success: Vec<ResultUpdate>,
    validator: Option<Arc<ValidatorFn>>,
}

impl MutationEndpoint {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            operation: name.clone(),
            name,
            invalidates: None,
            optimistic: Vec::new(),
            on_success: Vec::new(),
            validator: None,
        }
    }

    pub fn operation(mut self, operation: impl Into<String>) -> Self {
        self.operation = operation.into();
        self
    }

    /// Tags invalidated after success, computed from `(args, result)`.
    pub fn invalidates<F>(mut self, invalidates: F) -> Self
    where
        F: Fn(&Value, &Value) -> Vec<Tag> + Send + Sync + 'static,
    {
        self.invalidates = Some(Arc::new(invalidates));
        self
    }

    pub fn optimistic(mut self, update: OptimisticUpdate) -> Self {
        self.optimistic.push(update);
        self
    }

    pub fn on_success(mut self, update: ResultUpdate) -> Self {
        self.on_success.push(update);
        self
    }

    pub fn validate<F>(mut self, validator: F) -> Self
    where
        F: Fn(&Value) -> Result<(), DomainError> + Send + Sync + 'static,
    {
        self.validator = Some(Arc::new(validator));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn operation_name(&self) -> &str {
        &self.operation
    }

    pub fn optimistic_updates(&self) -> &[OptimisticUpdate] {
        &self.optimistic
    }

    pub fn result_updates(&self) -> &[ResultUpdate] {
        &self.on_success
    }

    pub fn tags_to_invalidate(&self, args: &Value, result: &Value) -> Vec<Tag> {
        self.invalidates
            .as_ref()
            .map(|invalidates| invalidates(args, result))
            .unwrap_or_default()
    }

    pub fn check_args(&self, args: &Value) -> Result<(), CacheError> {
        run_validator(&self.name, self.validator.as_deref(), args)
    }
}

impl fmt::Debug for MutationEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationEndpoint")
            .field("name", &self.name)
            .field("operation", &self.operation)
            .field("optimistic", &self.optimistic.len())
            .field("on_success", &self.on_success.len())
            .finish_non_exhaustive()
    }
}

fn run_validator(
    endpoint: &str,
    validator: Option<&ValidatorFn>,
    args: &Value,
) -> Result<(), CacheError> {
    match validator {
        Some(validate) => {
            validate(args).map_err(|err| CacheError::validation(endpoint, err.to_string()))
        }
        None => Ok(()),
    }
}

/// Every endpoint known to a client.
#[derive(Debug, Clone, Default)]
pub struct ApiDefinition {
    queries: HashMap<String, Arc<QueryEndpoint>>,
    mutations: HashMap<String, Arc<MutationEndpoint>>,
}

impl ApiDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn query(mut self, endpoint: QueryEndpoint) -> Self {
        self.queries
            .insert(endpoint.name.clone(), Arc::new(endpoint));
        self
    }

    pub fn mutation(mut self, endpoint: MutationEndpoint) -> Self {
        self.mutations
            .insert(endpoint.name.clone(), Arc::new(endpoint));
        self
    }

    pub fn query_endpoint(&self, name: &str) -> Result<Arc<QueryEndpoint>, CacheError> {
        self.queries
            .get(name)
            .cloned()
            .ok_or_else(|| CacheError::unknown_endpoint("query", name))
    }

    pub fn mutation_endpoint(&self, name: &str) -> Result<Arc<MutationEndpoint>, CacheError> {
        self.mutations
            .get(name)
            .cloned()
            .ok_or_else(|| CacheError::unknown_endpoint("mutation", name))
    }
}
