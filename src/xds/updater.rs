//! # Snapshot Updater
//!
//! Async driver around [`SnapshotFactory`]. Every published
//! [`MultiClusterState`] triggers a cluster configuration refresh and a global
//! snapshot rebuild, after which every registered group is specialized on the
//! blocking pool and handed to a [`SnapshotSink`].
//!
//! A rejected rebuild is logged and leaves the previously published snapshot
//! in place.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::domain::{CommunicationMode, Group, MultiClusterState};
use crate::errors::{Error, Result};
use crate::xds::cluster_config::ClusterConfiguration;
use crate::xds::global_snapshot::GlobalSnapshot;
use crate::xds::snapshot_factory::{ResourceBundle, SnapshotFactory};
use crate::xds::state::StateHolder;

/// Receives specialized bundles, e.g. an xDS snapshot cache
#[async_trait]
pub trait SnapshotSink: Send + Sync {
    async fn publish(&self, group: &Group, bundle: ResourceBundle);
}

pub struct SnapshotUpdater {
    factory: Arc<SnapshotFactory>,
    sink: Arc<dyn SnapshotSink>,
    mode: CommunicationMode,
    groups: StateHolder<Vec<Group>>,
    state: StateHolder<MultiClusterState>,
    cluster_configurations: StateHolder<BTreeMap<String, ClusterConfiguration>>,
    global: StateHolder<GlobalSnapshot>,
}

impl SnapshotUpdater {
    pub fn new(factory: Arc<SnapshotFactory>, sink: Arc<dyn SnapshotSink>) -> Self {
        Self {
            factory,
            sink,
            mode: CommunicationMode::Ads,
            groups: StateHolder::default(),
            state: StateHolder::new(MultiClusterState::empty()),
            cluster_configurations: StateHolder::default(),
            global: StateHolder::default(),
        }
    }

    /// Mode the shared EDS clusters are built for
    pub fn with_communication_mode(mut self, mode: CommunicationMode) -> Self {
        self.mode = mode;
        self
    }

    /// Replace the set of connected groups, dropping version history of the rest
    pub fn set_groups(&self, groups: Vec<Group>) {
        self.factory.versions().retain_groups(groups.iter());
        debug!(groups = groups.len(), "Updated connected groups");
        self.groups.publish(groups);
    }

    pub fn groups(&self) -> Arc<Vec<Group>> {
        self.groups.current()
    }

    pub fn global_snapshot(&self) -> Arc<GlobalSnapshot> {
        self.global.current()
    }

    pub fn multi_cluster_state(&self) -> Arc<MultiClusterState> {
        self.state.current()
    }

    pub fn cluster_configurations(&self) -> Arc<BTreeMap<String, ClusterConfiguration>> {
        self.cluster_configurations.current()
    }

    /// Rebuild from `state` and push every group's bundle to the sink.
    ///
    /// Returns the number of groups updated.
    pub async fn apply(&self, state: MultiClusterState) -> Result<usize> {
        let previous = self.cluster_configurations.current();
        let configurations = self.factory.cluster_configurations(&state, &previous);

        let global = self.factory.build_global_snapshot(&state, configurations.clone(), self.mode)?;

        self.state.publish(state);
        self.cluster_configurations.publish(configurations);
        let global = Arc::new(global);
        self.global.publish_arc(global.clone());

        self.update_groups(global).await
    }

    /// Specialize the current global snapshot for every registered group
    pub async fn update_groups(&self, global: Arc<GlobalSnapshot>) -> Result<usize> {
        let groups = self.groups.current();

        let tasks = groups.iter().cloned().map(|group| {
            let factory = self.factory.clone();
            let global = global.clone();
            tokio::task::spawn_blocking(move || {
                let bundle = factory.snapshot_for_group(&group, &global);
                (group, bundle)
            })
        });

        let mut updated = 0;
        for joined in join_all(tasks).await {
            let (group, bundle) =
                joined.map_err(|e| Error::internal(format!("Group specialization panicked: {}", e)))?;
            self.sink.publish(&group, bundle).await;
            updated += 1;
        }

        debug!(groups = updated, "Published group snapshots");
        Ok(updated)
    }

    /// Rebuild on every state published to `updates` until the sender is dropped
    pub async fn run(self: Arc<Self>, mut updates: watch::Receiver<MultiClusterState>) {
        info!("Snapshot updater started");
        loop {
            let state = updates.borrow_and_update().clone();
            if let Err(e) = self.apply(state).await {
                error!(error = %e, "Snapshot update failed, keeping previous snapshot");
            }
            if updates.changed().await.is_err() {
                break;
            }
        }
        info!("Snapshot updater stopped");
    }
}
