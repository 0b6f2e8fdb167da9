// src/ingest/mod.rs
pub mod atom;
pub mod classify;
pub mod detail;
pub mod fetch;
pub mod quota;
pub mod scheduler;
pub mod store;
pub mod throttle;
pub mod types;

use metrics::{describe_counter, describe_gauge, describe_histogram};
use once_cell::sync::OnceCell;

/// One-time metrics registration (so series show up on /metrics).
pub fn ensure_metrics_described() {
    static ONCE: OnceCell<()> = OnceCell::new();
    ONCE.get_or_init(|| {
        describe_counter!("ingest_events_total", "Entries parsed from feeds.");
        describe_counter!(
            "ingest_fetch_bytes_total",
            "Bytes downloaded and charged to the daily quota."
        );
        describe_counter!(
            "ingest_quota_rejections_total",
            "Fetches skipped or discarded because of the daily quota."
        );
        describe_counter!(
            "ingest_not_modified_total",
            "Conditional fetches answered with 304."
        );
        describe_counter!(
            "ingest_transport_errors_total",
            "Fetches that failed at the transport level or with a bad status."
        );
        describe_counter!(
            "ingest_parse_failures_total",
            "Payloads that were not a readable Atom feed."
        );
        describe_counter!(
            "ingest_detail_fetches_total",
            "Detail documents requested by the classifier."
        );
        describe_counter!(
            "ingest_unclassified_total",
            "Entries dropped because no prefecture could be assigned."
        );
        describe_counter!(
            "ingest_rows_inserted_total",
            "Entry rows newly inserted."
        );
        describe_counter!("ingest_throttled_total", "Sources skipped by the throttle.");
        describe_counter!("ingest_runs_total", "Completed scheduler passes.");
        describe_histogram!("ingest_parse_ms", "Feed parse time in milliseconds.");
        describe_gauge!(
            "ingest_quota_used_bytes",
            "Bytes consumed in the current quota window."
        );
        describe_gauge!(
            "ingest_pipeline_last_run_ts",
            "Unix ts when the last pass finished."
        );
    });
}
