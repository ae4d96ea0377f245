mod support;

use std::collections::HashSet;
use std::time::Duration;

use metrics_util::debugging::DebuggingRecorder;
use querysync::{RemoteError, Tag};
use serde_json::json;
use support::{DELETE, FakeBackend, GET, LIST, RENAME};

#[tokio::test(start_paused = true)]
async fn cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");
    querysync::infra::telemetry::describe_metrics();

    let backend = FakeBackend::new(Duration::from_millis(10));
    let client = support::client(&backend, Duration::from_secs(1));

    // miss + dedup
    let mut first = client.query(LIST, &()).expect("query");
    let second = client.query(LIST, &()).expect("query");
    first.settled().await;
    // hit
    let third = client.query(LIST, &()).expect("query");

    client
        .invalidate_tags([Tag::list("vehicle")])
        .expect("invalidate");
    first.settled().await;

    backend.fail_next(RENAME, 1, RemoteError::Conflict("stale".into()));
    let rename = client.mutation(RENAME).expect("mutation");
    let _ = rename.trigger(&json!({ "id": 1, "name": "Coach" })).await;
    client
        .mutation(DELETE)
        .expect("mutation")
        .trigger(&json!({ "id": 3 }))
        .await
        .expect("delete succeeds");

    let mut detail = client.query(GET, &json!({ "id": 1 })).expect("query");
    detail.settled().await;

    drop((first, second, third, detail));
    tokio::time::advance(Duration::from_secs(2)).await;
    support::settle().await;

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "querysync_query_hit_total",
        "querysync_query_miss_total",
        "querysync_fetch_total",
        "querysync_fetch_dedup_total",
        "querysync_evict_total",
        "querysync_invalidate_total",
        "querysync_mutation_total",
        "querysync_mutation_rollback_total",
        "querysync_action_total",
        "querysync_fetch_ms",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
