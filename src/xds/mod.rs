//! # xDS Snapshot Synthesis
//!
//! Everything between discovery state and the per-group Envoy resource
//! bundles:
//!
//! - [`cluster_config`]: sticky per-service cluster settings
//! - [`global_snapshot`]: resources shared by every group
//! - [`route_spec`]: which upstreams a group reaches and how
//! - [`resources`]: Envoy resource builders
//! - [`snapshot_factory`]: per-group specialization
//! - [`versions`]: per-group resource versioning
//! - [`updater`]: async driver fanning rebuilds out to a sink

pub mod cluster_config;
pub mod global_snapshot;
pub mod resources;
pub mod route_spec;
pub mod snapshot_factory;
pub mod state;
pub mod updater;
pub mod versions;

pub use cluster_config::{resolve_cluster_configurations, ClusterConfiguration};
pub use global_snapshot::GlobalSnapshot;
pub use route_spec::{DomainRoutesGrouper, RouteSpecification};
pub use snapshot_factory::{ResourceBundle, ResourceFactories, SnapshotFactory};
pub use state::StateHolder;
pub use updater::{SnapshotSink, SnapshotUpdater};
pub use versions::{SnapshotVersions, Version};
