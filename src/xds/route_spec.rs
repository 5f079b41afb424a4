//! # Route Specifications
//!
//! A route specification links a destination cluster to the domains routed to
//! it and the settings governing that route. Service specifications come from
//! three layers, merged by [`merge_route_specifications`] with a fixed
//! precedence:
//!
//! 1. explicit service dependencies
//! 2. services matched by a tag dependency
//! 3. every remaining known service (all-services groups only), using the
//!    group's default settings
//!
//! A service present in a higher layer is never overridden by a lower one.

use std::collections::BTreeMap;

use crate::config::{SnapshotProperties, ZoneWeights};
use crate::domain::{DependencySettings, Group, ProxyGroup};
use crate::xds::global_snapshot::GlobalSnapshot;

pub const DEFAULT_HTTP_PORT: u16 = 80;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteSpecification {
    pub cluster_name: String,
    pub route_domains: Vec<String>,
    pub settings: DependencySettings,
    /// Primary/secondary split for traffic-split services
    pub cluster_weights: Option<ZoneWeights>,
}

impl RouteSpecification {
    pub fn new(
        cluster_name: impl Into<String>,
        route_domains: Vec<String>,
        settings: DependencySettings,
    ) -> Self {
        Self { cluster_name: cluster_name.into(), route_domains, settings, cluster_weights: None }
    }

    pub fn with_weights(mut self, weights: ZoneWeights) -> Self {
        self.cluster_weights = Some(weights);
        self
    }
}

/// Bucket of domain dependencies sharing one listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DomainRoutesGrouper {
    pub port: u16,
    pub use_ssl: bool,
}

/// Name of the cluster carrying the secondary share of a traffic-split service
pub fn secondary_cluster_name(cluster_name: &str) -> String {
    format!("{}-secondary", cluster_name)
}

/// Merge service specifications, keeping the highest-precedence entry per cluster.
///
/// Layers are given highest precedence first. Output is sorted by cluster name.
pub fn merge_route_specifications<E, T, W>(explicit: E, tagged: T, wildcard: W) -> Vec<RouteSpecification>
where
    E: IntoIterator<Item = RouteSpecification>,
    T: IntoIterator<Item = RouteSpecification>,
    W: IntoIterator<Item = RouteSpecification>,
{
    let mut merged: BTreeMap<String, RouteSpecification> = BTreeMap::new();
    for spec in explicit.into_iter().chain(tagged).chain(wildcard) {
        merged.entry(spec.cluster_name.clone()).or_insert(spec);
    }
    merged.into_values().collect()
}

/// Service specifications of a group, after precedence resolution
pub fn service_route_specifications(
    group: &Group,
    global: &GlobalSnapshot,
    properties: &SnapshotProperties,
) -> Vec<RouteSpecification> {
    let outgoing = &group.proxy_settings().outgoing;

    let explicit: Vec<RouteSpecification> = outgoing
        .service_dependencies
        .iter()
        .map(|dep| service_route_specification(&dep.service, dep.settings.clone(), properties))
        .collect();

    let tagged: Vec<RouteSpecification> = global
        .tags_for_dependency(outgoing)
        .into_iter()
        .map(|(service, dep)| service_route_specification(service, dep.settings.clone(), properties))
        .collect();

    let wildcard: Vec<RouteSpecification> = match group {
        Group::Services(_) => Vec::new(),
        Group::AllServices(_) => global
            .all_services_names
            .iter()
            .map(|service| {
                service_route_specification(
                    service,
                    outgoing.default_service_settings.clone(),
                    properties,
                )
            })
            .collect(),
    };

    merge_route_specifications(explicit, tagged, wildcard)
}

fn service_route_specification(
    service: &str,
    settings: DependencySettings,
    properties: &SnapshotProperties,
) -> RouteSpecification {
    let mut route_domains = Vec::with_capacity(1 + properties.egress.domains.len());
    route_domains.push(service.to_string());
    route_domains.extend(properties.egress.domains.iter().map(|suffix| format!("{}{}", service, suffix)));

    let spec = RouteSpecification::new(service, route_domains, settings);
    match properties.load_balancing.traffic_splitting.service_by_weights.get(service) {
        Some(weights) => spec.with_weights(*weights),
        None => spec,
    }
}

/// Domain dependencies bucketed by (port, ssl)
pub fn domain_route_specifications(group: &Group) -> BTreeMap<DomainRoutesGrouper, Vec<RouteSpecification>> {
    let mut buckets: BTreeMap<DomainRoutesGrouper, Vec<RouteSpecification>> = BTreeMap::new();
    for dep in &group.proxy_settings().outgoing.domain_dependencies {
        let key = DomainRoutesGrouper { port: dep.port(), use_ssl: dep.use_ssl() };
        buckets.entry(key).or_default().push(RouteSpecification::new(
            dep.cluster_name(),
            vec![dep.route_domain()],
            dep.settings.clone(),
        ));
    }
    buckets
}

/// Specification routing pattern domains to the dynamic forward proxy.
///
/// `None` when the group declares no domain patterns.
pub fn domain_pattern_route_specification(
    group: &Group,
    properties: &SnapshotProperties,
) -> Option<RouteSpecification> {
    let outgoing = &group.proxy_settings().outgoing;
    if outgoing.domain_pattern_dependencies.is_empty() {
        return None;
    }

    Some(RouteSpecification::new(
        properties.dynamic_forward_proxy.cluster_name.clone(),
        outgoing.domain_pattern_dependencies.iter().map(|dep| dep.domain_pattern.clone()).collect(),
        outgoing.default_service_settings.clone(),
    ))
}
