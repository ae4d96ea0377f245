//! In-memory vehicle backend shared by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use querysync::domain::error::DomainError;
use querysync::{
    ApiDefinition, Backend, CacheClient, MutationEndpoint, OptimisticUpdate, QueryEndpoint,
    RemoteError, RequestContext, ResultUpdate, Tag,
};
use serde_json::{Value, json};

pub const LIST: &str = "vehicles.list";
pub const GET: &str = "vehicle.get";
pub const DELETE: &str = "vehicles.delete";
pub const RENAME: &str = "vehicle.rename";

#[derive(Default)]
struct Inner {
    vehicles: BTreeMap<u64, String>,
    calls: HashMap<String, usize>,
    failures: HashMap<(String, u64), RemoteError>,
    tokens: Vec<Option<String>>,
}

/// Fake backend holding vehicles by id. Every call sleeps for `latency`.
pub struct FakeBackend {
    inner: Mutex<Inner>,
    latency: Duration,
}

impl FakeBackend {
    pub fn new(latency: Duration) -> Arc<Self> {
        let vehicles = [(1, "Bus"), (2, "Tram"), (3, "Ferry")]
            .into_iter()
            .map(|(id, name)| (id, name.to_string()))
            .collect();
        Arc::new(Self {
            inner: Mutex::new(Inner {
                vehicles,
                ..Inner::default()
            }),
            latency,
        })
    }

    pub fn calls(&self, operation: &str) -> usize {
        self.lock().calls.get(operation).copied().unwrap_or(0)
    }

    /// Fail the next call of `operation` targeting vehicle `id`.
    pub fn fail_next(&self, operation: &str, id: u64, error: RemoteError) {
        self.lock().failures.insert((operation.to_string(), id), error);
    }

    /// Rename directly on the server, bypassing the cache.
    pub fn rename_on_server(&self, id: u64, name: &str) {
        self.lock().vehicles.insert(id, name.to_string());
    }

    /// Access tokens seen by every call, in order.
    pub fn tokens(&self) -> Vec<Option<String>> {
        self.lock().tokens.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("fake backend lock")
    }

    fn list(inner: &Inner) -> Value {
        Value::Array(
            inner
                .vehicles
                .iter()
                .map(|(id, name)| json!({ "id": id, "name": name }))
                .collect(),
        )
    }
}

fn id_of(args: &Value) -> Option<u64> {
    args.get("id").and_then(Value::as_u64)
}

#[async_trait]
impl Backend for FakeBackend {
    async fn call(
        &self,
        operation: &str,
        args: Value,
        ctx: RequestContext,
    ) -> Result<Value, RemoteError> {
        {
            let mut inner = self.lock();
            *inner.calls.entry(operation.to_string()).or_default() += 1;
            inner.tokens.push(ctx.access_token.clone());
        }

        tokio::time::sleep(self.latency).await;

        let mut inner = self.lock();
        if let Some(id) = id_of(&args)
            && let Some(error) = inner.failures.remove(&(operation.to_string(), id))
        {
            return Err(error);
        }

        match operation {
            LIST => Ok(Self::list(&inner)),
            GET => {
                let id = id_of(&args).unwrap_or_default();
                inner
                    .vehicles
                    .get(&id)
                    .map(|name| json!({ "id": id, "name": name }))
                    .ok_or(RemoteError::Rejected {
                        code: 404,
                        message: format!("vehicle {id} not found"),
                    })
            }
            DELETE => {
                let id = id_of(&args).unwrap_or_default();
                inner.vehicles.remove(&id);
                Ok(json!({ "deleted": id }))
            }
            RENAME => {
                let id = id_of(&args).unwrap_or_default();
                let name = args["name"].as_str().unwrap_or_default().to_string();
                inner.vehicles.insert(id, name.clone());
                Ok(json!({ "id": id, "name": name }))
            }
            other => Err(RemoteError::Rejected {
                code: 400,
                message: format!("unknown operation {other}"),
            }),
        }
    }
}

fn vehicle_tags(result: &Value) -> Vec<Tag> {
    let mut tags = vec![Tag::list("vehicle")];
    if let Some(items) = result.as_array() {
        tags.extend(
            items
                .iter()
                .filter_map(id_of)
                .map(|id| Tag::id("vehicle", id)),
        );
    }
    tags
}

fn require_id(args: &Value) -> Result<(), DomainError> {
    match id_of(args) {
        Some(_) => Ok(()),
        None => Err(DomainError::validation("`id` must be a non-negative integer")),
    }
}

/// Endpoints over the fake backend. `grace` applies to both queries.
pub fn api(grace: Duration) -> ApiDefinition {
    ApiDefinition::new()
        .query(
            QueryEndpoint::new(LIST)
                .provides(|result, _| vehicle_tags(result))
                .keep_unused_for(grace),
        )
        .query(
            QueryEndpoint::new(GET)
                .provides(|_, args| id_of(args).map(|id| Tag::id("vehicle", id)).into_iter().collect())
                .keep_unused_for(grace)
                .validate(require_id),
        )
        .mutation(
            MutationEndpoint::new(DELETE)
                .validate(require_id)
                .optimistic(OptimisticUpdate::new(
                    LIST,
                    |_| Value::Null,
                    |draft, args| {
                        if let Some(items) = draft.as_array_mut() {
                            items.retain(|item| id_of(item) != id_of(args));
                        }
                    },
                ))
                .invalidates(|args, _| {
                    let mut tags = vec![Tag::list("vehicle")];
                    tags.extend(id_of(args).map(|id| Tag::id("vehicle", id)));
                    tags
                }),
        )
        .mutation(
            MutationEndpoint::new(RENAME)
                .validate(require_id)
                .optimistic(OptimisticUpdate::new(
                    LIST,
                    |_| Value::Null,
                    |draft, args| {
                        let Some(items) = draft.as_array_mut() else {
                            return;
                        };
                        for item in items.iter_mut().filter(|item| id_of(item) == id_of(args)) {
                            item["name"] = args["name"].clone();
                        }
                    },
                ))
                .on_success(ResultUpdate::new(
                    GET,
                    |args| json!({ "id": args["id"] }),
                    |draft, _, result| *draft = result.clone(),
                )),
        )
}

pub fn client(backend: &Arc<FakeBackend>, grace: Duration) -> CacheClient {
    CacheClient::builder(api(grace), Arc::clone(backend) as Arc<dyn Backend>)
        .build()
        .expect("client builds inside a runtime")
}

/// Let spawned fetches and timers run.
pub async fn settle() {
    for _ in 0..8 {
        tokio::task::yield_now().await;
    }
}

pub fn ids(data: &Value) -> Vec<u64> {
    data.as_array()
        .map(|items| items.iter().filter_map(id_of).collect())
        .unwrap_or_default()
}
