//! # Observability Infrastructure
//!
//! Structured logging setup and the snapshot metrics recorded through the
//! `metrics` facade. No exporter is installed here; embedding processes pick
//! their own recorder.

pub mod logging;
pub mod metrics;

pub use logging::init_logging;
pub use metrics::SnapshotMetrics;
