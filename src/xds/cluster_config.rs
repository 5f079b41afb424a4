//! Per-service cluster feature flags derived from discovery state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::SnapshotProperties;
use crate::domain::{MultiClusterState, ServiceInstance};

/// Derived settings of one service's cluster
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClusterConfiguration {
    pub service_name: String,
    pub http2_enabled: bool,
    /// Every instance accepts mTLS, so the secured cluster variant may be used
    #[serde(default)]
    pub mtls_enabled: bool,
}

impl ClusterConfiguration {
    pub fn new(service_name: impl Into<String>, http2_enabled: bool) -> Self {
        Self { service_name: service_name.into(), http2_enabled, mtls_enabled: false }
    }

    pub fn with_mtls(mut self, mtls_enabled: bool) -> Self {
        self.mtls_enabled = mtls_enabled;
        self
    }
}

/// Resolve the sorted configuration map for the current discovery state.
///
/// Flags hold only when every instance in every datacenter carries the tag.
/// A service whose instance set is currently empty keeps its previous flags.
pub fn resolve_cluster_configurations(
    state: &MultiClusterState,
    previous: &BTreeMap<String, ClusterConfiguration>,
    properties: &SnapshotProperties,
) -> BTreeMap<String, ClusterConfiguration> {
    let http2 = &properties.egress.http2;
    let tls = &properties.incoming_permissions.tls_authentication;

    let mut current: BTreeMap<String, ClusterConfiguration> = BTreeMap::new();
    for service_name in state.service_names() {
        let instances: Vec<&ServiceInstance> = state
            .instances_of(service_name)
            .flat_map(|(_, service)| service.instances.iter())
            .collect();
        let prev = previous.get(service_name);

        let http2_enabled = http2.enabled
            && feature_enabled(&instances, prev.map(|c| c.http2_enabled), &http2.tag_name);
        let mtls_enabled = tls.enabled
            && feature_enabled(&instances, prev.map(|c| c.mtls_enabled), &tls.mtls_enabled_tag);

        current.insert(
            service_name.to_string(),
            ClusterConfiguration {
                service_name: service_name.to_string(),
                http2_enabled,
                mtls_enabled,
            },
        );
    }

    if properties.egress.never_remove_clusters {
        for (name, configuration) in previous {
            if !current.contains_key(name) {
                debug!(service = %name, "Keeping cluster configuration of removed service");
                current.insert(name.clone(), configuration.clone());
            }
        }
    }

    current
}

fn feature_enabled(instances: &[&ServiceInstance], previous: Option<bool>, tag: &str) -> bool {
    if instances.is_empty() {
        return previous.unwrap_or(false);
    }
    instances.iter().all(|instance| instance.has_tag(tag))
}
