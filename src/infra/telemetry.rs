use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

/// Register descriptions for every metric the cache emits.
pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "querysync_query_hit_total",
            Unit::Count,
            "Subscriptions served from fresh cached data."
        );
        describe_counter!(
            "querysync_query_miss_total",
            Unit::Count,
            "Subscriptions that required a fetch."
        );
        describe_counter!(
            "querysync_fetch_total",
            Unit::Count,
            "Remote fetches started."
        );
        describe_counter!(
            "querysync_fetch_dedup_total",
            Unit::Count,
            "Fetch requests joined to an in-flight fetch for the same key."
        );
        describe_counter!(
            "querysync_evict_total",
            Unit::Count,
            "Cache entries evicted after their grace period or by idle capacity."
        );
        describe_counter!(
            "querysync_invalidate_total",
            Unit::Count,
            "Cache entries marked stale by tag invalidation."
        );
        describe_counter!(
            "querysync_mutation_total",
            Unit::Count,
            "Mutations triggered, labelled by outcome."
        );
        describe_counter!(
            "querysync_mutation_rollback_total",
            Unit::Count,
            "Mutations whose optimistic patches were rolled back."
        );
        describe_counter!(
            "querysync_action_total",
            Unit::Count,
            "Actions dispatched through the middleware chain."
        );
        describe_histogram!(
            "querysync_fetch_ms",
            Unit::Milliseconds,
            "Remote fetch latency in milliseconds."
        );
    });
}
