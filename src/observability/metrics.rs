//! # Metrics Collection
//!
//! Snapshot timing histograms and version-change counters.

use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use std::time::Duration;

pub const NEW_SNAPSHOT_SECONDS: &str = "snapshot_factory_new_snapshot_seconds";
pub const SNAPSHOT_FOR_GROUP_SECONDS: &str = "snapshot_factory_snapshot_for_group_seconds";
pub const VERSION_CHANGES_TOTAL: &str = "snapshot_versions_changed_total";
pub const GLOBAL_SNAPSHOT_FAILURES_TOTAL: &str = "snapshot_factory_global_failures_total";

/// Records snapshot metrics
#[derive(Debug, Clone, Default)]
pub struct SnapshotMetrics;

impl SnapshotMetrics {
    pub fn new() -> Self {
        Self
    }

    /// Attach descriptions to the metric names for whichever recorder is installed
    pub fn register(&self) {
        describe_histogram!(
            NEW_SNAPSHOT_SECONDS,
            Unit::Seconds,
            "Time spent building the global snapshot"
        );
        describe_histogram!(
            SNAPSHOT_FOR_GROUP_SECONDS,
            Unit::Seconds,
            "Time spent specializing the global snapshot for one group"
        );
        describe_counter!(
            VERSION_CHANGES_TOTAL,
            Unit::Count,
            "Fresh versions minted per resource type"
        );
        describe_counter!(
            GLOBAL_SNAPSHOT_FAILURES_TOTAL,
            Unit::Count,
            "Rejected global snapshot builds"
        );
    }

    pub fn record_new_snapshot(&self, elapsed: Duration) {
        histogram!(NEW_SNAPSHOT_SECONDS).record(elapsed.as_secs_f64());
    }

    pub fn record_snapshot_for_group(&self, elapsed: Duration) {
        histogram!(SNAPSHOT_FOR_GROUP_SECONDS).record(elapsed.as_secs_f64());
    }

    /// `resource_type` is one of clusters, endpoints, listeners, routes
    pub fn record_version_change(&self, resource_type: &'static str) {
        counter!(VERSION_CHANGES_TOTAL, "resource_type" => resource_type).increment(1);
    }

    pub fn record_global_snapshot_failure(&self) {
        counter!(GLOBAL_SNAPSHOT_FAILURES_TOTAL).increment(1);
    }
}
