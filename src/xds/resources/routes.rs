//! Default ingress and egress route builders.

use std::sync::Arc;

use envoy_types::pb::envoy::config::core::v3::{HeaderValue, HeaderValueOption};
use envoy_types::pb::envoy::config::route::v3::{
    route::Action, route_action::ClusterSpecifier, route_action::HostRewriteSpecifier,
    route_match::PathSpecifier, weighted_cluster::ClusterWeight, InternalRedirectPolicy, Route,
    RouteAction, RouteConfiguration, RouteMatch, VirtualHost, WeightedCluster,
};
use envoy_types::pb::google::protobuf::{BoolValue, UInt32Value};
use tracing::trace;

use crate::config::{SnapshotProperties, ZoneWeights};
use crate::domain::{Group, IncomingEndpoint, PathMatchingType, ProxyGroup, ProxySettings};
use crate::xds::resources::{duration, EgressRoutesFactory, IngressRoutesFactory};
use crate::xds::route_spec::{secondary_cluster_name, RouteSpecification};

/// Route config served on the ingress listener
pub const INGRESS_ROUTES_NAME: &str = "ingress_secured_routes";
/// Route config served on the egress listener
pub const DEFAULT_ROUTES_NAME: &str = "default_routes";
pub const ORIGINAL_DESTINATION_ROUTE: &str = "original-destination-route";
const UPSTREAM_REMOTE_ADDRESS: &str = "%UPSTREAM_REMOTE_ADDRESS%";

#[derive(Debug, Clone)]
pub struct EnvoyIngressRoutesFactory {
    properties: Arc<SnapshotProperties>,
}

impl EnvoyIngressRoutesFactory {
    pub fn new(properties: Arc<SnapshotProperties>) -> Self {
        Self { properties }
    }

    fn local_route(&self, path_specifier: PathSpecifier, name: String) -> Route {
        let common = &self.properties.egress.common_http;

        #[allow(deprecated)]
        let action = RouteAction {
            cluster_specifier: Some(ClusterSpecifier::Cluster(
                self.properties.incoming_permissions.local_service_cluster.clone(),
            )),
            timeout: Some(duration(common.request_timeout())),
            idle_timeout: Some(duration(common.idle_timeout())),
            ..Default::default()
        };

        Route {
            name,
            r#match: Some(RouteMatch { path_specifier: Some(path_specifier), ..Default::default() }),
            action: Some(Action::Route(action)),
            ..Default::default()
        }
    }

    fn endpoint_route(&self, endpoint: &IncomingEndpoint) -> Route {
        let specifier = match endpoint.path_matching_type {
            PathMatchingType::Path => PathSpecifier::Path(endpoint.path.clone()),
            PathMatchingType::PathPrefix => PathSpecifier::Prefix(endpoint.path.clone()),
        };
        self.local_route(specifier, endpoint.path.clone())
    }
}

impl IngressRoutesFactory for EnvoyIngressRoutesFactory {
    fn secured_ingress_route_config(
        &self,
        service_name: &str,
        proxy_settings: &ProxySettings,
        group: &Group,
    ) -> RouteConfiguration {
        let incoming = &proxy_settings.incoming;
        let mut routes = Vec::new();

        // Explicit endpoints first so they shadow the catch-all
        if self.properties.incoming_permissions.enabled && incoming.permissions_enabled {
            routes.extend(incoming.endpoints.iter().map(|endpoint| self.endpoint_route(endpoint)));
        }
        routes.push(self.local_route(PathSpecifier::Prefix("/".to_string()), String::new()));

        trace!(
            service = %service_name,
            group = %group.discovery_service_name(),
            routes = routes.len(),
            "Built ingress routes"
        );

        RouteConfiguration {
            name: INGRESS_ROUTES_NAME.to_string(),
            virtual_hosts: vec![VirtualHost {
                name: "secured_local_service".to_string(),
                domains: vec!["*".to_string()],
                routes,
                ..Default::default()
            }],
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct EnvoyEgressRoutesFactory {
    properties: Arc<SnapshotProperties>,
}

impl EnvoyEgressRoutesFactory {
    pub fn new(properties: Arc<SnapshotProperties>) -> Self {
        Self { properties }
    }

    fn virtual_host(&self, spec: &RouteSpecification) -> VirtualHost {
        let common = &self.properties.egress.common_http;
        let timeouts = &spec.settings.timeout_policy;

        let cluster_specifier = match spec.cluster_weights {
            Some(weights) => weighted_clusters(&spec.cluster_name, weights),
            None => ClusterSpecifier::Cluster(spec.cluster_name.clone()),
        };

        #[allow(deprecated)]
        let action = RouteAction {
            cluster_specifier: Some(cluster_specifier),
            timeout: Some(duration(timeouts.request_timeout.unwrap_or_else(|| common.request_timeout()))),
            idle_timeout: Some(duration(timeouts.idle_timeout.unwrap_or_else(|| common.idle_timeout()))),
            host_rewrite_specifier: spec
                .settings
                .rewrite_host_header
                .then_some(HostRewriteSpecifier::AutoHostRewrite(BoolValue { value: true })),
            internal_redirect_policy: spec
                .settings
                .handle_internal_redirect
                .then(InternalRedirectPolicy::default),
            ..Default::default()
        };

        VirtualHost {
            name: spec.cluster_name.clone(),
            domains: spec.route_domains.clone(),
            routes: vec![prefix_route(Action::Route(action))],
            ..Default::default()
        }
    }

    fn virtual_hosts(&self, specifications: &[RouteSpecification]) -> Vec<VirtualHost> {
        specifications
            .iter()
            .filter(|spec| !spec.route_domains.is_empty())
            .map(|spec| self.virtual_host(spec))
            .collect()
    }

    fn original_destination_host(&self) -> VirtualHost {
        #[allow(deprecated)]
        let action = RouteAction {
            cluster_specifier: Some(ClusterSpecifier::Cluster(
                self.properties.egress.original_destination_cluster.clone(),
            )),
            idle_timeout: Some(duration(self.properties.egress.common_http.idle_timeout())),
            ..Default::default()
        };

        VirtualHost {
            name: ORIGINAL_DESTINATION_ROUTE.to_string(),
            domains: vec!["*".to_string()],
            routes: vec![prefix_route(Action::Route(action))],
            ..Default::default()
        }
    }
}

impl EgressRoutesFactory for EnvoyEgressRoutesFactory {
    fn egress_route_config(
        &self,
        service_name: &str,
        specifications: &[RouteSpecification],
        add_upstream_address_header: bool,
        route_name: Option<&str>,
    ) -> RouteConfiguration {
        let mut virtual_hosts = self.virtual_hosts(specifications);
        virtual_hosts.push(self.original_destination_host());

        let response_headers_to_add = if add_upstream_address_header {
            vec![HeaderValueOption {
                header: Some(HeaderValue {
                    key: self.properties.egress.upstream_address_header.clone(),
                    value: UPSTREAM_REMOTE_ADDRESS.to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }]
        } else {
            Vec::new()
        };

        trace!(
            service = %service_name,
            virtual_hosts = virtual_hosts.len(),
            "Built egress routes"
        );

        RouteConfiguration {
            name: route_name.unwrap_or(DEFAULT_ROUTES_NAME).to_string(),
            virtual_hosts,
            response_headers_to_add,
            ..Default::default()
        }
    }

    fn domain_route_config(&self, specifications: &[RouteSpecification], port: &str) -> RouteConfiguration {
        RouteConfiguration {
            name: port.to_string(),
            virtual_hosts: self.virtual_hosts(specifications),
            ..Default::default()
        }
    }
}

fn prefix_route(action: Action) -> Route {
    Route {
        r#match: Some(RouteMatch {
            path_specifier: Some(PathSpecifier::Prefix("/".to_string())),
            ..Default::default()
        }),
        action: Some(action),
        ..Default::default()
    }
}

fn weighted_clusters(cluster_name: &str, weights: ZoneWeights) -> ClusterSpecifier {
    ClusterSpecifier::WeightedClusters(WeightedCluster {
        clusters: vec![
            ClusterWeight {
                name: cluster_name.to_string(),
                weight: Some(UInt32Value { value: weights.main }),
                ..Default::default()
            },
            ClusterWeight {
                name: secondary_cluster_name(cluster_name),
                weight: Some(UInt32Value { value: weights.secondary }),
                ..Default::default()
            },
        ],
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DependencySettings, Incoming, ServicesGroup, TimeoutPolicy};
    use std::time::Duration;

    fn egress() -> EnvoyEgressRoutesFactory {
        EnvoyEgressRoutesFactory::new(Arc::new(SnapshotProperties::default()))
    }

    fn route_action(host: &VirtualHost) -> &RouteAction {
        match host.routes[0].action.as_ref() {
            Some(Action::Route(action)) => action,
            other => panic!("unexpected action: {:?}", other),
        }
    }

    fn spec(name: &str) -> RouteSpecification {
        RouteSpecification::new(name, vec![name.to_string()], DependencySettings::default())
    }

    #[test]
    fn egress_config_has_host_per_spec_and_original_destination_fallback() {
        let config = egress().egress_route_config(
            "frontend",
            &[spec("orders"), RouteSpecification::new("empty", Vec::new(), DependencySettings::default())],
            false,
            None,
        );

        assert_eq!(config.name, DEFAULT_ROUTES_NAME);
        let names: Vec<_> = config.virtual_hosts.iter().map(|h| h.name.as_str()).collect();
        assert_eq!(names, vec!["orders", ORIGINAL_DESTINATION_ROUTE]);
        assert_eq!(config.virtual_hosts[1].domains, vec!["*".to_string()]);
        assert_eq!(
            route_action(&config.virtual_hosts[1]).cluster_specifier,
            Some(ClusterSpecifier::Cluster("envoy-original-destination".to_string()))
        );
        assert!(config.response_headers_to_add.is_empty());
    }

    #[test]
    fn timeouts_fall_back_to_common_http_defaults() {
        let custom = RouteSpecification::new(
            "orders",
            vec!["orders".to_string()],
            DependencySettings::default().with_timeout_policy(TimeoutPolicy {
                request_timeout: Some(Duration::from_secs(3)),
                ..Default::default()
            }),
        );
        let config = egress().egress_route_config("frontend", &[custom], false, Some("80"));

        assert_eq!(config.name, "80");
        let action = route_action(&config.virtual_hosts[0]);
        assert_eq!(action.timeout.as_ref().map(|t| t.seconds), Some(3));
        assert_eq!(action.idle_timeout.as_ref().map(|t| t.seconds), Some(120));
    }

    #[test]
    fn weighted_specs_split_between_primary_and_secondary() {
        let weighted = spec("orders").with_weights(ZoneWeights { main: 70, secondary: 30 });
        let config = egress().egress_route_config("frontend", &[weighted], false, None);

        match &route_action(&config.virtual_hosts[0]).cluster_specifier {
            Some(ClusterSpecifier::WeightedClusters(split)) => {
                let weights: Vec<_> = split
                    .clusters
                    .iter()
                    .map(|c| (c.name.as_str(), c.weight.as_ref().map(|w| w.value)))
                    .collect();
                assert_eq!(weights, vec![("orders", Some(70)), ("orders-secondary", Some(30))]);
            }
            other => panic!("expected weighted clusters, got {:?}", other),
        }
    }

    #[test]
    fn upstream_address_header_is_optional() {
        let config = egress().egress_route_config("frontend", &[], true, None);
        let header = config.response_headers_to_add[0].header.as_ref().expect("header");
        assert_eq!(header.key, "x-envoy-upstream-remote-address");
        assert_eq!(header.value, UPSTREAM_REMOTE_ADDRESS);
    }

    #[test]
    fn domain_route_config_is_named_by_port_without_fallback() {
        let config = egress().domain_route_config(&[spec("api_example_com_8080")], "8080");
        assert_eq!(config.name, "8080");
        assert_eq!(config.virtual_hosts.len(), 1);
    }

    #[test]
    fn ingress_config_routes_to_local_service() {
        let factory = EnvoyIngressRoutesFactory::new(Arc::new(SnapshotProperties::default()));
        let group: Group = ServicesGroup::new("orders").into();
        let config = factory.secured_ingress_route_config("orders", group.proxy_settings(), &group);

        assert_eq!(config.name, INGRESS_ROUTES_NAME);
        let host = &config.virtual_hosts[0];
        assert_eq!(host.routes.len(), 1);
        assert_eq!(
            route_action(host).cluster_specifier,
            Some(ClusterSpecifier::Cluster("local_service".to_string()))
        );
    }

    #[test]
    fn ingress_config_lists_endpoints_when_permissions_enabled() {
        let mut properties = SnapshotProperties::default();
        properties.incoming_permissions.enabled = true;
        let factory = EnvoyIngressRoutesFactory::new(Arc::new(properties));

        let settings = ProxySettings {
            incoming: Incoming {
                endpoints: vec![IncomingEndpoint {
                    path: "/orders".to_string(),
                    path_matching_type: PathMatchingType::Path,
                    ..Default::default()
                }],
                permissions_enabled: true,
                ..Default::default()
            },
            ..Default::default()
        };
        let group: Group = ServicesGroup::new("orders").with_proxy_settings(settings.clone()).into();
        let config = factory.secured_ingress_route_config("orders", &settings, &group);

        let routes = &config.virtual_hosts[0].routes;
        assert_eq!(routes.len(), 2);
        assert_eq!(
            routes[0].r#match.as_ref().and_then(|m| m.path_specifier.clone()),
            Some(PathSpecifier::Path("/orders".to_string()))
        );
    }
}
