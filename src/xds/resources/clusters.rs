//! Default cluster builder.
//!
//! Service clusters are EDS-backed and shared through the global snapshot.
//! Per group, the shared cluster is swapped for its mTLS variant when the
//! service accepts secured traffic, and its HTTP protocol options are rebuilt
//! when the dependency overrides the connection idle timeout. Domain
//! dependencies get STRICT_DNS clusters, domain patterns the dynamic forward
//! proxy cluster.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use envoy_types::pb::envoy::config::cluster::v3::cluster::{
    ClusterDiscoveryType, CustomClusterType, DiscoveryType, DnsLookupFamily, EdsClusterConfig,
    LbPolicy,
};
use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::core::v3::{
    address::Address as AddressType, socket_address::PortSpecifier,
    transport_socket::ConfigType as TransportSocketConfigType, Address, Http1ProtocolOptions,
    Http2ProtocolOptions, HttpProtocolOptions as CommonHttpProtocolOptions, SocketAddress,
    TransportSocket,
};
use envoy_types::pb::envoy::config::endpoint::v3::{
    lb_endpoint::HostIdentifier, ClusterLoadAssignment, Endpoint, LbEndpoint, LocalityLbEndpoints,
};
use envoy_types::pb::envoy::extensions::clusters::dynamic_forward_proxy::v3::{
    cluster_config::ClusterImplementationSpecifier, ClusterConfig as DynamicForwardProxyConfig,
};
use envoy_types::pb::envoy::extensions::common::dynamic_forward_proxy::v3::DnsCacheConfig;
use envoy_types::pb::envoy::extensions::transport_sockets::tls::v3::{
    CommonTlsContext, UpstreamTlsContext,
};
use envoy_types::pb::envoy::extensions::upstreams::http::v3::http_protocol_options::explicit_http_config::ProtocolConfig;
use envoy_types::pb::envoy::extensions::upstreams::http::v3::{
    http_protocol_options::{ExplicitHttpConfig, UpstreamProtocolOptions},
    HttpProtocolOptions as UpstreamHttpProtocolOptions,
};
use envoy_types::pb::google::protobuf::{Any, UInt32Value};
use prost::Message;
use tracing::debug;

use crate::config::SnapshotProperties;
use crate::domain::{CommunicationMode, DomainDependency, Group, ProxyGroup};
use crate::xds::cluster_config::ClusterConfiguration;
use crate::xds::global_snapshot::GlobalSnapshot;
use crate::xds::resources::{any_from_message, config_source, duration, ClustersFactory};
use crate::xds::route_spec::{secondary_cluster_name, service_route_specifications};

pub const HTTP_PROTOCOL_OPTIONS_KEY: &str = "envoy.extensions.upstreams.http.v3.HttpProtocolOptions";
pub const HTTP_PROTOCOL_OPTIONS_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.upstreams.http.v3.HttpProtocolOptions";
const UPSTREAM_TLS_CONTEXT_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.transport_sockets.tls.v3.UpstreamTlsContext";
const DYNAMIC_FORWARD_PROXY_CONFIG_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.clusters.dynamic_forward_proxy.v3.ClusterConfig";
const DYNAMIC_FORWARD_PROXY_CLUSTER_TYPE: &str = "envoy.clusters.dynamic_forward_proxy";
const TLS_TRANSPORT_SOCKET: &str = "envoy.transport_sockets.tls";

#[derive(Debug, Clone)]
pub struct EnvoyClustersFactory {
    properties: Arc<SnapshotProperties>,
}

impl EnvoyClustersFactory {
    pub fn new(properties: Arc<SnapshotProperties>) -> Self {
        Self { properties }
    }

    fn lb_policy(&self) -> i32 {
        match self.properties.load_balancing.policy.to_uppercase().as_str() {
            "ROUND_ROBIN" => LbPolicy::RoundRobin as i32,
            "RANDOM" => LbPolicy::Random as i32,
            _ => LbPolicy::LeastRequest as i32,
        }
    }

    fn eds_cluster(&self, configuration: &ClusterConfiguration, mode: CommunicationMode) -> Cluster {
        let idle_timeout = self.properties.egress.common_http.connection_idle_timeout();

        Cluster {
            name: configuration.service_name.clone(),
            cluster_discovery_type: Some(ClusterDiscoveryType::Type(DiscoveryType::Eds as i32)),
            eds_cluster_config: Some(EdsClusterConfig {
                eds_config: Some(config_source(mode)),
                ..Default::default()
            }),
            connect_timeout: Some(duration(self.properties.eds_connection_timeout())),
            lb_policy: self.lb_policy(),
            typed_extension_protocol_options: http_protocol_options(
                Some(idle_timeout),
                configuration.http2_enabled,
            ),
            ..Default::default()
        }
    }

    fn secured(&self, cluster: &Cluster) -> Cluster {
        let sni = format!(
            "{}_{}",
            self.properties.incoming_permissions.tls_authentication.sni_prefix, cluster.name
        );
        Cluster { transport_socket: Some(upstream_tls(&sni)), ..cluster.clone() }
    }

    fn domain_cluster(&self, dependency: &DomainDependency) -> Cluster {
        let name = dependency.cluster_name();

        Cluster {
            name: name.clone(),
            cluster_discovery_type: Some(ClusterDiscoveryType::Type(DiscoveryType::StrictDns as i32)),
            connect_timeout: Some(duration(self.properties.eds_connection_timeout())),
            dns_lookup_family: DnsLookupFamily::V4Only as i32,
            lb_policy: LbPolicy::RoundRobin as i32,
            load_assignment: Some(ClusterLoadAssignment {
                cluster_name: name,
                endpoints: vec![LocalityLbEndpoints {
                    lb_endpoints: vec![LbEndpoint {
                        host_identifier: Some(HostIdentifier::Endpoint(Endpoint {
                            address: Some(Address {
                                address: Some(AddressType::SocketAddress(SocketAddress {
                                    address: dependency.host().to_string(),
                                    port_specifier: Some(PortSpecifier::PortValue(
                                        dependency.port().into(),
                                    )),
                                    ..Default::default()
                                })),
                            }),
                            ..Default::default()
                        })),
                        ..Default::default()
                    }],
                    ..Default::default()
                }],
                ..Default::default()
            }),
            transport_socket: dependency.use_ssl().then(|| upstream_tls(dependency.host())),
            ..Default::default()
        }
    }

    fn dynamic_forward_proxy_cluster(&self) -> Cluster {
        let dfp = &self.properties.dynamic_forward_proxy;
        let cluster_config = DynamicForwardProxyConfig {
            cluster_implementation_specifier: Some(ClusterImplementationSpecifier::DnsCacheConfig(
                dns_cache_config(&self.properties),
            )),
            ..Default::default()
        };

        Cluster {
            name: dfp.cluster_name.clone(),
            cluster_discovery_type: Some(ClusterDiscoveryType::ClusterType(CustomClusterType {
                name: DYNAMIC_FORWARD_PROXY_CLUSTER_TYPE.to_string(),
                typed_config: Some(any_from_message(
                    DYNAMIC_FORWARD_PROXY_CONFIG_TYPE_URL,
                    &cluster_config,
                )),
            })),
            connect_timeout: Some(duration(std::time::Duration::from_millis(
                dfp.connection_timeout_ms,
            ))),
            lb_policy: LbPolicy::ClusterProvided as i32,
            ..Default::default()
        }
    }

    /// Rebuild protocol options with the dependency's connection idle timeout
    fn with_idle_timeout(
        &self,
        cluster: &Cluster,
        idle_timeout: std::time::Duration,
        global: &GlobalSnapshot,
    ) -> Cluster {
        let http2 = global
            .cluster_configurations
            .get(&cluster.name)
            .map(|configuration| configuration.http2_enabled)
            .unwrap_or(false);

        let mut options = cluster.typed_extension_protocol_options.clone();
        options.extend(http_protocol_options(Some(idle_timeout), http2));
        Cluster { typed_extension_protocol_options: options, ..cluster.clone() }
    }

    fn tls_enabled(&self) -> bool {
        self.properties.incoming_permissions.tls_authentication.enabled
    }
}

impl ClustersFactory for EnvoyClustersFactory {
    fn clusters_for_services(
        &self,
        configurations: &BTreeMap<String, ClusterConfiguration>,
        mode: CommunicationMode,
    ) -> Vec<Cluster> {
        configurations.values().map(|configuration| self.eds_cluster(configuration, mode)).collect()
    }

    fn secured_clusters(&self, clusters: &[Cluster]) -> Vec<Cluster> {
        clusters.iter().map(|cluster| self.secured(cluster)).collect()
    }

    fn clusters_for_group(&self, group: &Group, global: &GlobalSnapshot) -> Vec<Cluster> {
        let specifications = service_route_specifications(group, global, &self.properties);
        let mut clusters = Vec::with_capacity(specifications.len());

        for spec in &specifications {
            let mtls = self.tls_enabled()
                && global
                    .cluster_configurations
                    .get(&spec.cluster_name)
                    .map(|configuration| configuration.mtls_enabled)
                    .unwrap_or(false);

            let source = if mtls {
                global.secured_clusters.get(&spec.cluster_name)
            } else {
                global.clusters.get(&spec.cluster_name)
            };

            let Some(cluster) = source else {
                debug!(
                    group = %group.service_name(),
                    cluster = %spec.cluster_name,
                    "Skipping dependency without a cluster"
                );
                continue;
            };

            let cluster = match spec.settings.timeout_policy.connection_idle_timeout {
                Some(idle_timeout) => self.with_idle_timeout(cluster, idle_timeout, global),
                None => cluster.clone(),
            };

            if spec.cluster_weights.is_some() {
                clusters.push(Cluster {
                    name: secondary_cluster_name(&cluster.name),
                    ..cluster.clone()
                });
            }
            clusters.push(cluster);
        }

        let outgoing = &group.proxy_settings().outgoing;
        let mut seen_domains = BTreeSet::new();
        for dependency in &outgoing.domain_dependencies {
            if seen_domains.insert(dependency.cluster_name()) {
                clusters.push(self.domain_cluster(dependency));
            }
        }

        if !outgoing.domain_pattern_dependencies.is_empty() {
            clusters.push(self.dynamic_forward_proxy_cluster());
        }

        clusters
    }
}

/// Upstream HTTP options keyed for `typed_extension_protocol_options`
pub fn http_protocol_options(
    idle_timeout: Option<std::time::Duration>,
    http2: bool,
) -> HashMap<String, Any> {
    let protocol_config = if http2 {
        ProtocolConfig::Http2ProtocolOptions(Http2ProtocolOptions::default())
    } else {
        ProtocolConfig::HttpProtocolOptions(Http1ProtocolOptions::default())
    };

    let options = UpstreamHttpProtocolOptions {
        common_http_protocol_options: idle_timeout.map(|timeout| CommonHttpProtocolOptions {
            idle_timeout: Some(duration(timeout)),
            ..Default::default()
        }),
        upstream_protocol_options: Some(UpstreamProtocolOptions::ExplicitHttpConfig(
            ExplicitHttpConfig { protocol_config: Some(protocol_config) },
        )),
        ..Default::default()
    };

    [(
        HTTP_PROTOCOL_OPTIONS_KEY.to_string(),
        any_from_message(HTTP_PROTOCOL_OPTIONS_TYPE_URL, &options),
    )]
    .into_iter()
    .collect()
}

/// Decoded upstream HTTP options of a cluster, if present and well formed
pub fn upstream_http_options(cluster: &Cluster) -> Option<UpstreamHttpProtocolOptions> {
    let any = cluster.typed_extension_protocol_options.get(HTTP_PROTOCOL_OPTIONS_KEY)?;
    UpstreamHttpProtocolOptions::decode(any.value.as_slice()).ok()
}

fn upstream_tls(sni: &str) -> TransportSocket {
    let context = UpstreamTlsContext {
        common_tls_context: Some(CommonTlsContext::default()),
        sni: sni.to_string(),
        ..Default::default()
    };

    TransportSocket {
        name: TLS_TRANSPORT_SOCKET.to_string(),
        config_type: Some(TransportSocketConfigType::TypedConfig(any_from_message(
            UPSTREAM_TLS_CONTEXT_TYPE_URL,
            &context,
        ))),
    }
}

fn dns_cache_config(properties: &SnapshotProperties) -> DnsCacheConfig {
    DnsCacheConfig {
        name: properties.dynamic_forward_proxy.cluster_name.clone(),
        dns_lookup_family: DnsLookupFamily::V4Only as i32,
        max_hosts: Some(UInt32Value { value: properties.dynamic_forward_proxy.max_cached_hosts }),
        ..Default::default()
    }
}
