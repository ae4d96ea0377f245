mod support;

use std::time::Duration;

use querysync::cache::MutationStatus;
use querysync::{CacheError, RemoteError};
use serde::Deserialize;
use serde_json::{Value, json};
use support::{DELETE, FakeBackend, GET, LIST, RENAME, ids, settle};

const LATENCY: Duration = Duration::from_millis(50);
const GRACE: Duration = Duration::from_secs(60);

fn names(data: &Value) -> Vec<String> {
    data.as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item["name"].as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

#[tokio::test(start_paused = true)]
async fn failed_delete_restores_the_list_exactly() {
    let backend = FakeBackend::new(LATENCY);
    let client = support::client(&backend, GRACE);

    let mut list = client.query(LIST, &()).expect("query");
    let before = list.settled().await.data;

    backend.fail_next(DELETE, 2, RemoteError::Network("timeout".into()));
    let delete = client.mutation(DELETE).expect("mutation");
    let pending = {
        let delete = delete.clone();
        tokio::spawn(async move { delete.trigger(&json!({ "id": 2 })).await })
    };

    let patched = list.changed().await.expect("optimistic patch published");
    assert_eq!(ids(patched.data.as_ref().expect("data")), vec![1, 3]);
    assert!(delete.state().is_loading());

    let err = pending
        .await
        .expect("task joins")
        .expect_err("delete fails");
    assert!(err.is_transient());

    assert_eq!(list.state().data, before);
    assert_eq!(backend.calls(LIST), 1);
    assert_eq!(client.pending_mutations(), 0);

    let state = delete.state();
    assert_eq!(state.status, MutationStatus::Rejected);
    assert_eq!(state.error, Some(err));
}

#[tokio::test(start_paused = true)]
async fn interleaved_rollback_keeps_the_other_mutations_patch() {
    let backend = FakeBackend::new(LATENCY);
    let client = support::client(&backend, GRACE);

    let mut list = client.query(LIST, &()).expect("query");
    list.settled().await;

    backend.fail_next(RENAME, 2, RemoteError::Conflict("stale version".into()));
    let rename = client.mutation(RENAME).expect("mutation");
    let to_coach = json!({ "id": 1, "name": "Coach" });
    let to_metro = json!({ "id": 2, "name": "Metro" });
    let (coach, metro) = tokio::join!(rename.trigger(&to_coach), rename.trigger(&to_metro));

    coach.expect("first rename succeeds");
    let err = metro.expect_err("second rename conflicts");
    assert!(err.is_conflict());

    let data = list.state().data.expect("list data");
    assert_eq!(names(&data), vec!["Coach", "Tram", "Ferry"]);
    assert_eq!(client.pending_mutations(), 0);
}

#[tokio::test(start_paused = true)]
async fn abandoned_trigger_rolls_back_its_patch() {
    let backend = FakeBackend::new(LATENCY);
    let client = support::client(&backend, GRACE);

    let mut list = client.query(LIST, &()).expect("query");
    let before = list.settled().await.data;

    let delete = client.mutation(DELETE).expect("mutation");
    let args = json!({ "id": 2 });
    let outcome = tokio::time::timeout(Duration::from_millis(10), delete.trigger(&args)).await;
    assert!(outcome.is_err(), "trigger outlived the timeout");

    assert_eq!(list.state().data, before);
    assert_eq!(client.pending_mutations(), 0);

    tokio::time::sleep(Duration::from_secs(1)).await;
    settle().await;
    assert_eq!(list.state().data, before);
}

#[tokio::test(start_paused = true)]
async fn successful_rename_patches_the_detail_entry_from_the_result() {
    let backend = FakeBackend::new(LATENCY);
    let client = support::client(&backend, GRACE);

    let mut detail = client.query(GET, &json!({ "id": 3 })).expect("query");
    detail.settled().await;

    let rename = client.mutation(RENAME).expect("mutation");
    let result = rename
        .trigger(&json!({ "id": 3, "name": "Hovercraft" }))
        .await
        .expect("rename succeeds");

    assert_eq!(result, json!({ "id": 3, "name": "Hovercraft" }));
    assert_eq!(detail.state().data, Some(result));
    assert_eq!(backend.calls(GET), 1);
    assert_eq!(rename.state().status, MutationStatus::Fulfilled);
}

#[tokio::test(start_paused = true)]
async fn mutation_without_cached_target_still_commits() {
    let backend = FakeBackend::new(LATENCY);
    let client = support::client(&backend, GRACE);

    let delete = client.mutation(DELETE).expect("mutation");
    delete
        .trigger(&json!({ "id": 1 }))
        .await
        .expect("delete succeeds");

    settle().await;
    assert_eq!(client.entry_count(), 0);
    assert_eq!(backend.calls(LIST), 0);
}

#[tokio::test(start_paused = true)]
async fn invalid_mutation_arguments_never_reach_the_backend() {
    let backend = FakeBackend::new(LATENCY);
    let client = support::client(&backend, GRACE);

    let delete = client.mutation(DELETE).expect("mutation");
    let err = delete
        .trigger(&json!({ "name": "Bus" }))
        .await
        .expect_err("validation fails");

    assert!(matches!(err, CacheError::Validation { .. }));
    assert_eq!(backend.calls(DELETE), 0);
    assert_eq!(client.pending_mutations(), 0);
    assert_eq!(delete.state().status, MutationStatus::Idle);
    assert!(matches!(
        client.mutation("vehicles.archive"),
        Err(CacheError::UnknownEndpoint { .. })
    ));
}

#[derive(Debug, Deserialize)]
struct Deleted {
    deleted: u64,
}

#[tokio::test(start_paused = true)]
async fn trigger_as_decodes_the_result() {
    let backend = FakeBackend::new(LATENCY);
    let client = support::client(&backend, GRACE);

    let delete = client.mutation(DELETE).expect("mutation");
    let deleted: Deleted = delete
        .trigger_as(&json!({ "id": 3 }))
        .await
        .expect("delete succeeds");
    assert_eq!(deleted.deleted, 3);

    let err = delete
        .trigger_as::<_, Vec<String>>(&json!({ "id": 1 }))
        .await
        .expect_err("shape mismatch");
    assert!(matches!(err, CacheError::Decode { .. }));

    delete.reset();
    assert_eq!(delete.state().status, MutationStatus::Idle);
}
