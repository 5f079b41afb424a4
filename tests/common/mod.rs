//! Shared fixtures for the integration suites
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::time::Duration;

use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use flowmesh::domain::{
    AllServicesGroup, ClusterState, CommunicationMode, DependencySettings, Group, ListenersConfig,
    Locality, MultiClusterState, Outgoing, ProxySettings, ServiceDependency, ServiceInstance,
    ServiceInstances, ServicesGroup, ServicesState, TimeoutPolicy,
};
use flowmesh::xds::resources::clusters::upstream_http_options;
use flowmesh::xds::{ClusterConfiguration, GlobalSnapshot};
use flowmesh::{SnapshotFactory, SnapshotProperties};

pub const INGRESS_HOST: &str = "ingress-host";
pub const INGRESS_PORT: u16 = 3380;
pub const EGRESS_HOST: &str = "egress-host";
pub const EGRESS_PORT: u16 = 3380;
pub const DEFAULT_IDLE_TIMEOUT: u64 = 100;
pub const RATE_LIMIT_SERVICE: &str = "rl_service";

pub fn properties() -> SnapshotProperties {
    let mut properties = SnapshotProperties::default();
    properties.egress.common_http.connection_idle_timeout_seconds = DEFAULT_IDLE_TIMEOUT;
    properties.rate_limit.service_name = RATE_LIMIT_SERVICE.to_string();
    properties
}

pub fn factory(properties: SnapshotProperties) -> SnapshotFactory {
    SnapshotFactory::with_defaults(properties)
}

pub fn listeners_config() -> ListenersConfig {
    ListenersConfig {
        ingress_host: INGRESS_HOST.to_string(),
        ingress_port: INGRESS_PORT,
        egress_host: EGRESS_HOST.to_string(),
        egress_port: EGRESS_PORT,
        ..Default::default()
    }
}

pub fn instance(id: &str, address: &str) -> ServiceInstance {
    ServiceInstance::new(id, address, 8080)
}

/// One local datacenter holding the given services, one instance each
pub fn state(services: &[&str]) -> MultiClusterState {
    MultiClusterState::new(vec![ClusterState::new(
        ServicesState::new(services.iter().enumerate().map(|(i, service)| {
            ServiceInstances::new(*service, [instance(&format!("{}-{}", service, i), &format!("10.0.0.{}", i + 1))])
        })),
        Locality::Local,
        "dc1",
    )])
}

pub fn global(factory: &SnapshotFactory, state: &MultiClusterState) -> GlobalSnapshot {
    let configurations = factory.cluster_configurations(state, &BTreeMap::new());
    factory
        .build_global_snapshot(state, configurations, CommunicationMode::Ads)
        .expect("global snapshot")
}

pub fn global_with(
    factory: &SnapshotFactory,
    state: &MultiClusterState,
    configurations: BTreeMap<String, ClusterConfiguration>,
) -> GlobalSnapshot {
    factory
        .build_global_snapshot(state, configurations, CommunicationMode::Ads)
        .expect("global snapshot")
}

pub fn outgoing(services: &[&str]) -> Outgoing {
    Outgoing {
        service_dependencies: services.iter().map(|s| ServiceDependency::new(*s)).collect(),
        ..Default::default()
    }
}

pub fn services_group(outgoing: Outgoing) -> Group {
    ServicesGroup::new("frontend")
        .with_proxy_settings(ProxySettings { outgoing, ..Default::default() })
        .with_listeners_config(listeners_config())
        .into()
}

pub fn all_services_group(outgoing: Outgoing) -> Group {
    AllServicesGroup::new("frontend")
        .with_proxy_settings(ProxySettings { outgoing, ..Default::default() })
        .with_listeners_config(listeners_config())
        .into()
}

pub fn connection_idle(seconds: u64) -> DependencySettings {
    DependencySettings::default().with_timeout_policy(TimeoutPolicy {
        connection_idle_timeout: Some(Duration::from_secs(seconds)),
        ..Default::default()
    })
}

pub fn idle_seconds(cluster: &Cluster) -> Option<i64> {
    upstream_http_options(cluster)
        .and_then(|options| options.common_http_protocol_options)
        .and_then(|common| common.idle_timeout)
        .map(|timeout| timeout.seconds)
}

pub fn cluster<'a>(clusters: &'a [Cluster], name: &str) -> &'a Cluster {
    clusters
        .iter()
        .find(|c| c.name == name)
        .unwrap_or_else(|| panic!("missing cluster {}", name))
}
