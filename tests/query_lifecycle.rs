mod support;

use std::sync::Arc;
use std::time::Duration;

use querysync::cache::{CacheConfig, QueryStatus};
use querysync::{Backend, CacheClient, CacheError, RemoteError, Tag};
use serde::Deserialize;
use serde_json::json;
use support::{DELETE, FakeBackend, GET, LIST, ids, settle};

const LATENCY: Duration = Duration::from_millis(50);
const GRACE: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize, PartialEq)]
struct Vehicle {
    id: u64,
    name: String,
}

#[tokio::test(start_paused = true)]
async fn same_tick_subscribers_share_one_fetch() {
    let backend = FakeBackend::new(LATENCY);
    let client = support::client(&backend, GRACE);

    let mut first = client.query(GET, &json!({ "id": 1 })).expect("first query");
    let mut second = client.query(GET, &json!({ "id": 1 })).expect("second query");
    assert!(first.state().is_loading);

    let first_state = first.settled().await;
    let second_state = second.settled().await;

    assert_eq!(backend.calls(GET), 1);
    assert_eq!(first_state.data, Some(json!({ "id": 1, "name": "Bus" })));
    assert_eq!(first_state.data, second_state.data);
    assert_eq!(first.key(), second.key());
}

#[tokio::test(start_paused = true)]
async fn argument_order_does_not_split_the_cache() {
    let backend = FakeBackend::new(LATENCY);
    let client = support::client(&backend, GRACE);

    let a = client
        .query(GET, &json!({ "id": 1, "include": ["owner", "route"] }))
        .expect("query");
    let b = client
        .query(GET, &json!({ "include": ["owner", "route"], "id": 1 }))
        .expect("query");
    let c = client
        .query(GET, &json!({ "include": ["route", "owner"], "id": 1 }))
        .expect("query");

    assert_eq!(a.key(), b.key());
    assert_ne!(a.key(), c.key());
    assert_eq!(client.entry_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn concurrent_fetches_decode_the_same_value() {
    let backend = FakeBackend::new(LATENCY);
    let client = support::client(&backend, GRACE);

    let first = json!({ "id": 2 });
    let second = json!({ "id": 2 });
    let (a, b) = tokio::join!(
        client.fetch::<_, Vehicle>(GET, &first),
        client.fetch::<_, Vehicle>(GET, &second),
    );

    let expected = Vehicle {
        id: 2,
        name: "Tram".to_string(),
    };
    assert_eq!(a.expect("first fetch"), expected);
    assert_eq!(b.expect("second fetch"), expected);
    assert_eq!(backend.calls(GET), 1);
}

#[tokio::test(start_paused = true)]
async fn resubscribe_within_grace_reuses_the_entry() {
    let backend = FakeBackend::new(LATENCY);
    let client = support::client(&backend, GRACE);

    let mut handle = client.query(LIST, &()).expect("query");
    let data = handle.settled().await.data;
    handle.release();

    tokio::time::advance(Duration::from_secs(10)).await;
    settle().await;

    let again = client.query(LIST, &()).expect("query");
    let state = again.state();
    assert_eq!(state.status, QueryStatus::Fulfilled);
    assert!(!state.is_fetching);
    assert_eq!(state.data, data);
    assert_eq!(backend.calls(LIST), 1);
    drop(again);

    // The first grace timer is superseded; only the second one evicts.
    tokio::time::advance(Duration::from_secs(25)).await;
    settle().await;
    assert_eq!(client.entry_count(), 1);

    tokio::time::advance(Duration::from_secs(6)).await;
    settle().await;
    assert_eq!(client.entry_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn grace_period_counts_from_the_last_release() {
    let backend = FakeBackend::new(LATENCY);
    let client = support::client(&backend, GRACE);

    let mut handle = client.query(LIST, &()).expect("query");
    handle.settled().await;
    handle.release();

    tokio::time::advance(GRACE + Duration::from_millis(1)).await;
    settle().await;
    assert_eq!(client.entry_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn zero_grace_evicts_and_drops_the_in_flight_result() {
    let backend = FakeBackend::new(LATENCY);
    let client = support::client(&backend, Duration::ZERO);

    let handle = client.query(LIST, &()).expect("query");
    assert!(handle.state().is_fetching);
    drop(handle);
    assert_eq!(client.entry_count(), 0);

    tokio::time::advance(LATENCY * 4).await;
    settle().await;

    assert_eq!(client.entry_count(), 0);
    let state = client.peek(LIST, &()).expect("peek");
    assert_eq!(state.status, QueryStatus::Uninitialized);
    assert!(state.data.is_none());
}

#[tokio::test(start_paused = true)]
async fn deleting_a_vehicle_refetches_the_list_without_it() {
    let backend = FakeBackend::new(LATENCY);
    let client = support::client(&backend, GRACE);

    let mut list = client.query(LIST, &()).expect("query");
    let before = list.settled().await;
    assert_eq!(ids(before.data.as_ref().expect("list data")), vec![1, 2, 3]);

    let delete = client.mutation(DELETE).expect("mutation");
    delete
        .trigger(&json!({ "id": 2 }))
        .await
        .expect("delete succeeds");

    let after = list.settled().await;
    assert_eq!(ids(after.data.as_ref().expect("list data")), vec![1, 3]);
    assert_eq!(backend.calls(LIST), 2);
    assert!(!after.is_stale);
}

#[tokio::test(start_paused = true)]
async fn repeated_invalidation_refetches_once() {
    let backend = FakeBackend::new(LATENCY);
    let client = support::client(&backend, GRACE);

    let mut list = client.query(LIST, &()).expect("query");
    list.settled().await;

    client
        .invalidate_tags([Tag::list("vehicle")])
        .expect("invalidate");
    client
        .invalidate_tags([Tag::list("vehicle")])
        .expect("invalidate");

    let revalidating = list.state();
    assert!(revalidating.is_fetching);
    assert!(!revalidating.is_loading);
    assert!(revalidating.data.is_some());

    list.settled().await;
    assert_eq!(backend.calls(LIST), 2);
}

#[tokio::test(start_paused = true)]
async fn kind_wide_tag_invalidates_every_vehicle_entry() {
    let backend = FakeBackend::new(LATENCY);
    let client = support::client(&backend, GRACE);

    let mut list = client.query(LIST, &()).expect("query");
    let mut one = client.query(GET, &json!({ "id": 1 })).expect("query");
    list.settled().await;
    one.settled().await;

    client.invalidate_tags([Tag::kind("vehicle")]).expect("invalidate");
    list.settled().await;
    one.settled().await;

    assert_eq!(backend.calls(LIST), 2);
    assert_eq!(backend.calls(GET), 2);
}

#[tokio::test(start_paused = true)]
async fn unobserved_stale_entry_refetches_on_next_subscribe() {
    let backend = FakeBackend::new(LATENCY);
    let client = support::client(&backend, GRACE);

    let mut list = client.query(LIST, &()).expect("query");
    list.settled().await;
    drop(list);

    backend.rename_on_server(1, "Coach");
    client
        .invalidate_tags([Tag::id("vehicle", 1)])
        .expect("invalidate");
    settle().await;
    assert_eq!(backend.calls(LIST), 1);

    let mut list = client.query(LIST, &()).expect("query");
    let state = list.settled().await;
    assert_eq!(backend.calls(LIST), 2);
    assert_eq!(state.data.expect("data")[0]["name"], "Coach");
}

#[tokio::test(start_paused = true)]
async fn failed_refetch_keeps_last_known_good_data() {
    let backend = FakeBackend::new(LATENCY);
    let client = support::client(&backend, GRACE);

    let mut handle = client.query(GET, &json!({ "id": 1 })).expect("query");
    let good = handle.settled().await.data;

    backend.fail_next(GET, 1, RemoteError::Network("connection reset".into()));
    handle.refetch().expect("refetch");
    let state = handle.settled().await;

    assert_eq!(state.status, QueryStatus::Rejected);
    assert_eq!(state.data, good);
    assert!(matches!(state.error, Some(CacheError::Network { .. })));

    // A new subscriber retries the failed entry.
    let mut retry = client.query(GET, &json!({ "id": 1 })).expect("query");
    let state = retry.settled().await;
    assert_eq!(state.status, QueryStatus::Fulfilled);
    assert!(state.error.is_none());
    assert_eq!(backend.calls(GET), 3);
}

#[tokio::test(start_paused = true)]
async fn expired_entries_refetch_on_subscribe() {
    let backend = FakeBackend::new(LATENCY);
    let client = CacheClient::builder(
        support::api(GRACE),
        Arc::clone(&backend) as Arc<dyn Backend>,
    )
    .config(CacheConfig {
        default_ttl: Some(Duration::from_secs(5)),
        ..CacheConfig::default()
    })
    .build()
    .expect("client");

    let mut handle = client.query(LIST, &()).expect("query");
    handle.settled().await;
    drop(handle);

    tokio::time::advance(Duration::from_secs(2)).await;
    let fresh = client.query(LIST, &()).expect("query");
    assert!(!fresh.state().is_fetching);
    drop(fresh);

    tokio::time::advance(Duration::from_secs(4)).await;
    let mut expired = client.query(LIST, &()).expect("query");
    let state = expired.state();
    assert!(state.is_fetching);
    assert!(state.data.is_some());
    expired.settled().await;
    assert_eq!(backend.calls(LIST), 2);
}

#[tokio::test(start_paused = true)]
async fn invalid_arguments_never_reach_the_backend() {
    let backend = FakeBackend::new(LATENCY);
    let client = support::client(&backend, GRACE);

    let err = client
        .query(GET, &json!({ "id": "five" }))
        .expect_err("validation fails");
    assert!(matches!(err, CacheError::Validation { .. }));

    let err = client
        .query("vehicles.search", &())
        .expect_err("unknown endpoint");
    assert!(matches!(err, CacheError::UnknownEndpoint { .. }));

    settle().await;
    assert_eq!(backend.calls(GET), 0);
    assert_eq!(client.entry_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn reset_refetches_observed_and_drops_unobserved_entries() {
    let backend = FakeBackend::new(LATENCY);
    let client = support::client(&backend, GRACE);

    let mut list = client.query(LIST, &()).expect("query");
    let mut one = client.query(GET, &json!({ "id": 1 })).expect("query");
    list.settled().await;
    one.settled().await;
    drop(one);

    client.reset_api_state().expect("reset");
    assert_eq!(client.entry_count(), 1);
    assert!(list.state().is_loading);

    let state = list.settled().await;
    assert!(state.is_success());
    assert_eq!(backend.calls(LIST), 2);
}

#[tokio::test(start_paused = true)]
async fn snapshot_serializes_entries() {
    let backend = FakeBackend::new(LATENCY);
    let client = support::client(&backend, GRACE);

    let mut list = client.query(LIST, &()).expect("query");
    list.settled().await;

    let snapshot = client.snapshot().expect("snapshot");
    let rendered = snapshot.to_string();
    assert!(rendered.contains("vehicles.list"));
    assert!(rendered.contains("fulfilled"));
}
