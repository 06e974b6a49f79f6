//! Metric names and recording helpers.
//!
//! Recording goes through the `metrics` facade; without an installed recorder
//! every call is a no-op.

use metrics::{counter, describe_counter, describe_histogram, histogram};

// ============================================================================
// Build Metrics
// ============================================================================

/// Builds started.
pub const BUILDS_STARTED: &str = "vista_builds_started_total";

/// Builds finished, labelled by outcome (`published`, `failed`, `cancelled`).
pub const BUILDS_FINISHED: &str = "vista_builds_finished_total";

/// Build duration histogram.
pub const BUILD_DURATION: &str = "vista_build_duration_seconds";

/// Partitions per build histogram.
pub const BUILD_PARTITIONS: &str = "vista_build_partitions";

/// Rows written per build.
pub const BUILD_ROWS: &str = "vista_build_rows_total";

/// Publish attempts retried after a concurrent publish.
pub const PUBLISH_RETRIES: &str = "vista_publish_retries_total";

// ============================================================================
// Query Metrics
// ============================================================================

/// Map tasks run.
pub const MAP_TASKS_RUN: &str = "vista_map_tasks_run_total";

/// Map tasks skipped by early fulfillment or cancellation.
pub const MAP_TASKS_SKIPPED: &str = "vista_map_tasks_skipped_total";

/// Duplicate partial results replaced by the reduce task.
pub const REDUCE_DUPLICATES: &str = "vista_reduce_duplicates_total";

// ============================================================================
// Lifecycle Metrics
// ============================================================================

/// Build requests joined to an in-flight build.
pub const SINGLE_FLIGHT_HITS: &str = "vista_single_flight_hits_total";

/// Artifacts merged by the sharing pass.
pub const SHARES_APPLIED: &str = "vista_shares_applied_total";

/// Definitions evicted from the in-process cache.
pub const DEFINITIONS_EVICTED: &str = "vista_definitions_evicted_total";

/// Objects deleted by generation GC.
pub const GC_OBJECTS_DELETED: &str = "vista_gc_objects_deleted_total";

/// Registers all metric descriptions.
///
/// Call once at startup after installing a recorder.
pub fn register_metrics() {
    describe_counter!(BUILDS_STARTED, "Total builds started");
    describe_counter!(BUILDS_FINISHED, "Total builds finished, by outcome");
    describe_histogram!(BUILD_DURATION, "Build duration in seconds");
    describe_histogram!(BUILD_PARTITIONS, "Partitions per build");
    describe_counter!(BUILD_ROWS, "Rows written by builds");
    describe_counter!(PUBLISH_RETRIES, "Publish attempts retried after a race");
    describe_counter!(MAP_TASKS_RUN, "Map tasks executed");
    describe_counter!(MAP_TASKS_SKIPPED, "Map tasks skipped");
    describe_counter!(REDUCE_DUPLICATES, "Duplicate partial results replaced");
    describe_counter!(SINGLE_FLIGHT_HITS, "Build requests joined to an in-flight build");
    describe_counter!(SHARES_APPLIED, "Artifacts merged by sharing");
    describe_counter!(DEFINITIONS_EVICTED, "Definitions evicted from the cache");
    describe_counter!(GC_OBJECTS_DELETED, "Objects deleted by generation GC");
}

/// Records a build start.
pub fn record_build_started(mode: &str, partitions: usize) {
    counter!(BUILDS_STARTED, "mode" => mode.to_string()).increment(1);
    #[allow(clippy::cast_precision_loss)]
    histogram!(BUILD_PARTITIONS).record(partitions as f64);
}

/// Records a build end.
pub fn record_build_finished(outcome: &str, rows: u64, duration_secs: f64) {
    let labels = [("outcome", outcome.to_string())];
    counter!(BUILDS_FINISHED, &labels).increment(1);
    counter!(BUILD_ROWS).increment(rows);
    histogram!(BUILD_DURATION, &labels).record(duration_secs);
}

/// Records a publish retry.
pub fn record_publish_retry() {
    counter!(PUBLISH_RETRIES).increment(1);
}

/// Records map task activity for one read.
pub fn record_map_tasks(run: u64, skipped: u64) {
    counter!(MAP_TASKS_RUN).increment(run);
    counter!(MAP_TASKS_SKIPPED).increment(skipped);
}

/// Records a duplicate partial result.
pub fn record_reduce_duplicate() {
    counter!(REDUCE_DUPLICATES).increment(1);
}

/// Records a build request joined to an in-flight build.
pub fn record_single_flight_hit() {
    counter!(SINGLE_FLIGHT_HITS).increment(1);
}

/// Records an applied share.
pub fn record_share_applied() {
    counter!(SHARES_APPLIED).increment(1);
}

/// Records a definition evicted from the cache.
pub fn record_definition_evicted() {
    counter!(DEFINITIONS_EVICTED).increment(1);
}

/// Records GC deletions.
pub fn record_gc_deleted(kind: &str, objects: u64) {
    counter!(GC_OBJECTS_DELETED, "kind" => kind.to_string()).increment(objects);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recording_without_recorder_is_a_noop() {
        register_metrics();
        record_build_started("partitioned", 4);
        record_build_finished("published", 10, 0.5);
        record_map_tasks(3, 1);
        record_gc_deleted("block", 2);
    }
}
