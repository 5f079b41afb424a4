//! # Snapshot Factory
//!
//! Turns discovery state into Envoy resources in two stages:
//!
//! 1. [`SnapshotFactory::build_global_snapshot`] builds the resources every
//!    group shares, once per state change.
//! 2. [`SnapshotFactory::snapshot_for_group`] narrows the global snapshot to
//!    what one group depends on and versions the result.
//!
//! Resource construction is delegated to the builder traits in
//! [`crate::xds::resources`]; this module only decides which resources a
//! group gets.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::endpoint::v3::ClusterLoadAssignment;
use envoy_types::pb::envoy::config::listener::v3::Listener;
use envoy_types::pb::envoy::config::route::v3::RouteConfiguration;
use tracing::{debug, warn};

use crate::config::SnapshotProperties;
use crate::domain::{CommunicationMode, Group, MultiClusterState, ProxyGroup};
use crate::errors::Result;
use crate::observability::SnapshotMetrics;
use crate::snapshot_span;
use crate::xds::cluster_config::{resolve_cluster_configurations, ClusterConfiguration};
use crate::xds::global_snapshot::GlobalSnapshot;
use crate::xds::resources::{
    ClustersFactory, EgressRoutesFactory, EndpointsFactory, EnvoyClustersFactory,
    EnvoyEgressRoutesFactory, EnvoyEndpointsFactory, EnvoyIngressRoutesFactory,
    EnvoyListenersFactory, IngressRoutesFactory, ListenersFactory,
};
use crate::xds::route_spec::{
    domain_pattern_route_specification, domain_route_specifications, service_route_specifications,
    DomainRoutesGrouper, RouteSpecification, DEFAULT_HTTP_PORT,
};
use crate::xds::versions::{SnapshotVersions, Version};

/// Versioned resources for one group
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceBundle {
    pub clusters: Vec<Cluster>,
    pub endpoints: Vec<ClusterLoadAssignment>,
    pub routes: Vec<RouteConfiguration>,
    pub listeners: Vec<Listener>,
    pub version: Version,
}

/// Resource builders used by a [`SnapshotFactory`]
#[derive(Clone)]
pub struct ResourceFactories {
    pub clusters: Arc<dyn ClustersFactory>,
    pub endpoints: Arc<dyn EndpointsFactory>,
    pub ingress_routes: Arc<dyn IngressRoutesFactory>,
    pub egress_routes: Arc<dyn EgressRoutesFactory>,
    pub listeners: Arc<dyn ListenersFactory>,
}

impl ResourceFactories {
    /// Default Envoy builders sharing one set of properties
    pub fn envoy(properties: Arc<SnapshotProperties>) -> Self {
        Self {
            clusters: Arc::new(EnvoyClustersFactory::new(properties.clone())),
            endpoints: Arc::new(EnvoyEndpointsFactory::new(properties.clone())),
            ingress_routes: Arc::new(EnvoyIngressRoutesFactory::new(properties.clone())),
            egress_routes: Arc::new(EnvoyEgressRoutesFactory::new(properties.clone())),
            listeners: Arc::new(EnvoyListenersFactory::new(properties)),
        }
    }
}

pub struct SnapshotFactory {
    properties: Arc<SnapshotProperties>,
    factories: ResourceFactories,
    versions: SnapshotVersions,
    metrics: SnapshotMetrics,
}

impl SnapshotFactory {
    pub fn new(properties: Arc<SnapshotProperties>, factories: ResourceFactories) -> Self {
        let metrics = SnapshotMetrics::new();
        metrics.register();
        Self {
            properties,
            factories,
            versions: SnapshotVersions::with_metrics(metrics.clone()),
            metrics,
        }
    }

    /// Factory backed by the default Envoy builders
    pub fn with_defaults(properties: SnapshotProperties) -> Self {
        let properties = Arc::new(properties);
        Self::new(properties.clone(), ResourceFactories::envoy(properties))
    }

    pub fn properties(&self) -> &SnapshotProperties {
        &self.properties
    }

    pub fn versions(&self) -> &SnapshotVersions {
        &self.versions
    }

    /// Build the resources shared by every group.
    ///
    /// Fails when the builders produce two resources of one kind under the
    /// same name.
    pub fn build_global_snapshot(
        &self,
        state: &MultiClusterState,
        configurations: BTreeMap<String, ClusterConfiguration>,
        mode: CommunicationMode,
    ) -> Result<GlobalSnapshot> {
        let span = snapshot_span!("global_snapshot", services = configurations.len());
        let _guard = span.enter();
        let started = Instant::now();

        let clusters = self.factories.clusters.clusters_for_services(&configurations, mode);
        let secured_clusters = self.factories.clusters.secured_clusters(&clusters);
        let service_names: Vec<String> = clusters.iter().map(|c| c.name.clone()).collect();
        let endpoints = self.factories.endpoints.load_assignments_for(&service_names, state);

        let snapshot = GlobalSnapshot::build(
            configurations,
            clusters,
            secured_clusters,
            endpoints,
            &self.properties,
        )
        .inspect_err(|e| {
            warn!(error = %e, "Rejected global snapshot");
            self.metrics.record_global_snapshot_failure();
        })?;

        self.metrics.record_new_snapshot(started.elapsed());
        Ok(snapshot)
    }

    /// Cluster configuration map for the current state, see
    /// [`resolve_cluster_configurations`]
    pub fn cluster_configurations(
        &self,
        state: &MultiClusterState,
        previous: &BTreeMap<String, ClusterConfiguration>,
    ) -> BTreeMap<String, ClusterConfiguration> {
        resolve_cluster_configurations(state, previous, &self.properties)
    }

    /// Specialize the global snapshot for one group
    pub fn snapshot_for_group(&self, group: &Group, global: &GlobalSnapshot) -> ResourceBundle {
        let span = snapshot_span!("snapshot_for_group", service = %group.service_name());
        let _guard = span.enter();
        let started = Instant::now();

        let bundle = self.new_snapshot_for_group(group, global);

        self.metrics.record_snapshot_for_group(started.elapsed());
        bundle
    }

    fn new_snapshot_for_group(&self, group: &Group, global: &GlobalSnapshot) -> ResourceBundle {
        let domain_specs = domain_route_specifications(group);
        let service_specs = service_route_specifications(group, global, &self.properties);
        let pattern_spec = domain_pattern_route_specification(group, &self.properties);

        let mut seen: HashSet<&RouteSpecification> = service_specs.iter().collect();
        let unique_domain_specs: Vec<&RouteSpecification> = domain_specs
            .values()
            .flatten()
            .filter(|spec| seen.insert(*spec))
            .collect();

        let mut egress_specs: Vec<RouteSpecification> = service_specs.clone();
        egress_specs.extend(unique_domain_specs.iter().map(|spec| (*spec).clone()));
        egress_specs.extend(pattern_spec.iter().cloned());

        let clusters = self.factories.clusters.clusters_for_group(group, global);
        let routes = self.routes(group, &service_specs, pattern_spec.as_ref(), &domain_specs, &egress_specs);

        let listeners = if self.properties.dynamic_listeners.enabled {
            self.factories.listeners.listeners_for(group, global)
        } else {
            Vec::new()
        };

        let endpoint_specs: Vec<&RouteSpecification> =
            service_specs.iter().chain(unique_domain_specs.iter().copied()).collect();
        let endpoints = self.endpoints(group, global, &endpoint_specs, &service_specs);

        let version = self.versions.version(group, &clusters, &endpoints, &listeners, &routes);

        debug!(
            service = %group.service_name(),
            clusters = clusters.len(),
            endpoints = endpoints.len(),
            routes = routes.len(),
            listeners = listeners.len(),
            "Built group snapshot"
        );

        ResourceBundle { clusters, endpoints, routes, listeners, version }
    }

    fn routes(
        &self,
        group: &Group,
        service_specs: &[RouteSpecification],
        pattern_spec: Option<&RouteSpecification>,
        domain_specs: &BTreeMap<DomainRoutesGrouper, Vec<RouteSpecification>>,
        egress_specs: &[RouteSpecification],
    ) -> Vec<RouteConfiguration> {
        let service_name = group.service_name();
        let listeners_config = group.listeners_config();
        let add_header = listeners_config
            .map(|config| config.add_upstream_external_address_header)
            .unwrap_or(false);
        let egress = &self.factories.egress_routes;

        let mut routes = vec![self.factories.ingress_routes.secured_ingress_route_config(
            service_name,
            group.proxy_settings(),
            group,
        )];

        if listeners_config.map(|config| config.use_transparent_proxy).unwrap_or(false) {
            routes.push(egress.egress_route_config(service_name, &[], add_header, None));

            let http_bucket = DomainRoutesGrouper { port: DEFAULT_HTTP_PORT, use_ssl: false };
            let mut port_80_specs = service_specs.to_vec();
            port_80_specs.extend(pattern_spec.cloned());
            port_80_specs.extend(domain_specs.get(&http_bucket).into_iter().flatten().cloned());
            let http_route_name = DEFAULT_HTTP_PORT.to_string();
            routes.push(egress.egress_route_config(
                service_name,
                &port_80_specs,
                add_header,
                Some(http_route_name.as_str()),
            ));

            // TLS buckets are served by TCP proxy listeners
            for (grouper, specs) in domain_specs {
                if grouper.port != DEFAULT_HTTP_PORT && !grouper.use_ssl {
                    routes.push(egress.domain_route_config(specs, &grouper.port.to_string()));
                }
            }
        } else {
            routes.push(egress.egress_route_config(service_name, egress_specs, add_header, None));
        }

        routes
    }

    fn endpoints(
        &self,
        group: &Group,
        global: &GlobalSnapshot,
        specs: &[&RouteSpecification],
        service_specs: &[RouteSpecification],
    ) -> Vec<ClusterLoadAssignment> {
        let auto_service_tag = self.properties.routing.service_tags.auto_service_tag_enabled;
        let mut included: HashSet<&str> = HashSet::new();
        let mut endpoints = Vec::new();

        for spec in specs {
            if !included.insert(spec.cluster_name.as_str()) {
                continue;
            }
            let Some(assignment) = global.endpoints.get(&spec.cluster_name) else {
                continue;
            };
            let assignment = if auto_service_tag {
                self.factories
                    .endpoints
                    .filter_endpoints(assignment, &spec.settings.routing_policy)
                    .into_owned()
            } else {
                assignment.clone()
            };
            endpoints.push(assignment);
        }

        endpoints.extend(
            self.factories.endpoints.secondary_cluster_endpoints(&global.endpoints, service_specs),
        );

        if !group.proxy_settings().incoming.rate_limit_endpoints.is_empty() {
            let rate_limit_service = self.properties.rate_limit.service_name.as_str();
            if included.insert(rate_limit_service) {
                match global.endpoints.get(rate_limit_service) {
                    Some(assignment) => endpoints.push(assignment.clone()),
                    None => debug!(
                        service = %group.service_name(),
                        rate_limit_service,
                        "Rate limit service has no endpoints"
                    ),
                }
            }
        }

        endpoints
    }
}
