//! # Flowmesh
//!
//! Snapshot synthesis core of an Envoy service-mesh control plane. Given the
//! discovered service instances of every datacenter and the declared
//! dependencies of each proxy group, flowmesh produces the clusters,
//! endpoints, routes and listeners each group of proxies should run with.
//!
//! ## Pipeline
//!
//! ```text
//! MultiClusterState ─┬→ cluster configurations ─→ GlobalSnapshot ─┐
//!                    └──────────────────────────────────────────→ │
//! Group ─────────────────────────────────→ SnapshotFactory::snapshot_for_group
//!                                                   ↓
//!                                 ResourceBundle + per-type versions
//! ```
//!
//! The xDS transport itself is out of scope: bundles are handed to a
//! [`SnapshotSink`] supplied by the embedding control plane.
//!
//! ## Example
//!
//! ```rust,no_run
//! use flowmesh::{Config, Group, MultiClusterState, ServicesGroup, SnapshotFactory};
//! use flowmesh::domain::CommunicationMode;
//!
//! fn main() -> flowmesh::Result<()> {
//!     let config = Config::from_env()?;
//!     let factory = SnapshotFactory::with_defaults(config.snapshot);
//!
//!     let state = MultiClusterState::empty();
//!     let configurations = factory.cluster_configurations(&state, &Default::default());
//!     let global = factory.build_global_snapshot(&state, configurations, CommunicationMode::Ads)?;
//!
//!     let group: Group = ServicesGroup::new("frontend").into();
//!     let bundle = factory.snapshot_for_group(&group, &global);
//!     println!("routes version {}", bundle.version.routes);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod domain;
pub mod errors;
pub mod observability;
pub mod xds;

pub use config::{Config, LoggingConfig, SnapshotProperties};
pub use domain::{
    AllServicesGroup, Group, MultiClusterState, ProxyGroup, ServicesGroup, ServicesState,
};
pub use errors::{Error, Result};
pub use observability::{init_logging, SnapshotMetrics};
pub use xds::{
    GlobalSnapshot, ResourceBundle, SnapshotFactory, SnapshotSink, SnapshotUpdater, Version,
};

/// Crate version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
