//! Service registry snapshots, one `ClusterState` per datacenter.
//!
//! Everything here is immutable once built. A discovery update produces a new
//! [`MultiClusterState`] which replaces the previous one wholesale.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub type ServiceName = String;

/// A single registered instance of a service
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub id: String,
    pub address: String,
    pub port: u16,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub canary: bool,
    #[serde(default)]
    pub weight: Option<u32>,
}

impl ServiceInstance {
    pub fn new(id: impl Into<String>, address: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            port,
            tags: BTreeSet::new(),
            canary: false,
            weight: None,
        }
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_canary(mut self, canary: bool) -> Self {
        self.canary = canary;
        self
    }

    pub fn with_weight(mut self, weight: u32) -> Self {
        self.weight = Some(weight);
        self
    }

    pub fn has_tag(&self, tag: &str) -> bool {
        self.tags.contains(tag)
    }
}

/// All instances of one service in one datacenter
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceInstances {
    pub service_name: ServiceName,
    #[serde(default)]
    pub instances: BTreeSet<ServiceInstance>,
}

impl ServiceInstances {
    pub fn new<I>(service_name: impl Into<ServiceName>, instances: I) -> Self
    where
        I: IntoIterator<Item = ServiceInstance>,
    {
        Self { service_name: service_name.into(), instances: instances.into_iter().collect() }
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }
}

/// Service name to instances, sorted by name
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServicesState {
    #[serde(default)]
    pub service_name_to_instances: BTreeMap<ServiceName, ServiceInstances>,
}

impl ServicesState {
    pub fn new<I>(services: I) -> Self
    where
        I: IntoIterator<Item = ServiceInstances>,
    {
        Self {
            service_name_to_instances: services
                .into_iter()
                .map(|instances| (instances.service_name.clone(), instances))
                .collect(),
        }
    }

    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.service_name_to_instances.keys().map(String::as_str)
    }

    pub fn get(&self, service_name: &str) -> Option<&ServiceInstances> {
        self.service_name_to_instances.get(service_name)
    }

    pub fn len(&self) -> usize {
        self.service_name_to_instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.service_name_to_instances.is_empty()
    }
}

/// Whether a datacenter is the one the control plane runs in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Locality {
    Local,
    Remote,
}

/// One datacenter's registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterState {
    pub services_state: ServicesState,
    pub locality: Locality,
    /// Datacenter (zone) name
    pub cluster: String,
}

impl ClusterState {
    pub fn new(services_state: ServicesState, locality: Locality, cluster: impl Into<String>) -> Self {
        Self { services_state, locality, cluster: cluster.into() }
    }
}

/// Every known datacenter, in discovery order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MultiClusterState(Vec<ClusterState>);

impl MultiClusterState {
    pub fn new(clusters: Vec<ClusterState>) -> Self {
        Self(clusters)
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ClusterState> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Names of services registered in any datacenter
    pub fn service_names(&self) -> BTreeSet<&str> {
        self.0.iter().flat_map(|state| state.services_state.service_names()).collect()
    }

    /// Per-datacenter instance sets of one service
    pub fn instances_of<'a>(
        &'a self,
        service_name: &'a str,
    ) -> impl Iterator<Item = (&'a ClusterState, &'a ServiceInstances)> + 'a {
        self.0
            .iter()
            .filter_map(move |state| state.services_state.get(service_name).map(|i| (state, i)))
    }
}

impl<'a> IntoIterator for &'a MultiClusterState {
    type Item = &'a ClusterState;
    type IntoIter = std::slice::Iter<'a, ClusterState>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}
