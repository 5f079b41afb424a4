//! Default listener builder.
//!
//! Every group with a listener config gets an ingress and an egress listener,
//! both HTTP connection managers fetching routes over RDS. Transparent-proxy
//! groups also get one virtual listener per egress port. TLS domains on a port
//! pass through a TCP proxy selected by SNI; plain HTTP on the same port falls
//! through to a connection manager resolving routes by port name.

use std::collections::BTreeMap;
use std::sync::Arc;

use envoy_types::pb::envoy::config::core::v3::{
    address::Address as AddressType, socket_address::PortSpecifier, Address, HttpProtocolOptions,
    SocketAddress,
};
use envoy_types::pb::envoy::config::listener::v3::{
    filter::ConfigType as FilterConfigType, listener_filter::ConfigType as ListenerFilterConfigType,
    Filter, FilterChain, FilterChainMatch, Listener, ListenerFilter,
};
use envoy_types::pb::envoy::extensions::filters::http::router::v3::Router;
use envoy_types::pb::envoy::extensions::filters::listener::tls_inspector::v3::TlsInspector;
use envoy_types::pb::envoy::extensions::filters::network::http_connection_manager::v3::{
    http_connection_manager::{CodecType, RouteSpecifier},
    http_filter::ConfigType as HttpFilterConfigType,
    HttpConnectionManager, HttpFilter, Rds,
};
use envoy_types::pb::envoy::extensions::filters::network::tcp_proxy::v3::{
    tcp_proxy::ClusterSpecifier as TcpClusterSpecifier, TcpProxy,
};
use envoy_types::pb::google::protobuf::BoolValue;
use tracing::debug;

use crate::config::SnapshotProperties;
use crate::domain::{CommunicationMode, Group, ListenersConfig, ProxyGroup};
use crate::xds::global_snapshot::GlobalSnapshot;
use crate::xds::resources::routes::{DEFAULT_ROUTES_NAME, INGRESS_ROUTES_NAME};
use crate::xds::resources::{any_from_message, config_source, duration, ListenersFactory};
use crate::xds::route_spec::{domain_route_specifications, RouteSpecification, DEFAULT_HTTP_PORT};

pub const INGRESS_LISTENER_NAME: &str = "ingress_listener";
pub const EGRESS_LISTENER_NAME: &str = "egress_listener";
pub const HTTP_CONNECTION_MANAGER_FILTER: &str = "envoy.filters.network.http_connection_manager";
pub const TCP_PROXY_FILTER: &str = "envoy.filters.network.tcp_proxy";
const ROUTER_FILTER_NAME: &str = "envoy.filters.http.router";
const TLS_INSPECTOR_FILTER: &str = "envoy.filters.listener.tls_inspector";

const HCM_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.network.http_connection_manager.v3.HttpConnectionManager";
const ROUTER_TYPE_URL: &str = "type.googleapis.com/envoy.extensions.filters.http.router.v3.Router";
const TCP_PROXY_TYPE_URL: &str = "type.googleapis.com/envoy.extensions.filters.network.tcp_proxy.v3.TcpProxy";
const TLS_INSPECTOR_TYPE_URL: &str =
    "type.googleapis.com/envoy.extensions.filters.listener.tls_inspector.v3.TlsInspector";

#[derive(Debug, Clone)]
pub struct EnvoyListenersFactory {
    properties: Arc<SnapshotProperties>,
}

impl EnvoyListenersFactory {
    pub fn new(properties: Arc<SnapshotProperties>) -> Self {
        Self { properties }
    }

    fn ingress_listener(&self, config: &ListenersConfig, mode: CommunicationMode) -> Listener {
        let hcm = self.http_connection_manager(
            "ingress_http",
            INGRESS_ROUTES_NAME,
            mode,
            config.use_remote_address,
        );
        Listener {
            name: INGRESS_LISTENER_NAME.to_string(),
            address: Some(socket_address(&config.ingress_host, config.ingress_port)),
            filter_chains: vec![FilterChain { filters: vec![hcm], ..Default::default() }],
            ..Default::default()
        }
    }

    fn egress_listener(&self, config: &ListenersConfig, mode: CommunicationMode) -> Listener {
        let hcm = self.http_connection_manager("egress_http", DEFAULT_ROUTES_NAME, mode, false);
        Listener {
            name: EGRESS_LISTENER_NAME.to_string(),
            address: Some(socket_address(&config.egress_host, config.egress_port)),
            filter_chains: vec![FilterChain { filters: vec![hcm], ..Default::default() }],
            use_original_dst: config.use_transparent_proxy.then_some(BoolValue { value: true }),
            ..Default::default()
        }
    }

    /// Listener reached only through original-destination redirection
    fn virtual_listener(&self, config: &ListenersConfig, port: u16, chains: Vec<FilterChain>) -> Listener {
        Listener {
            name: virtual_listener_name(&config.egress_host, port),
            address: Some(socket_address(&config.egress_host, port)),
            filter_chains: chains,
            bind_to_port: Some(BoolValue { value: false }),
            ..Default::default()
        }
    }

    fn http_connection_manager(
        &self,
        stat_prefix: &str,
        route_config_name: &str,
        mode: CommunicationMode,
        use_remote_address: bool,
    ) -> Filter {
        let router = HttpFilter {
            name: ROUTER_FILTER_NAME.to_string(),
            config_type: Some(HttpFilterConfigType::TypedConfig(any_from_message(
                ROUTER_TYPE_URL,
                &Router::default(),
            ))),
            ..Default::default()
        };

        let hcm = HttpConnectionManager {
            stat_prefix: stat_prefix.to_string(),
            codec_type: CodecType::Auto as i32,
            route_specifier: Some(RouteSpecifier::Rds(Rds {
                route_config_name: route_config_name.to_string(),
                config_source: Some(config_source(mode)),
            })),
            http_filters: vec![router],
            use_remote_address: use_remote_address.then_some(BoolValue { value: true }),
            common_http_protocol_options: Some(HttpProtocolOptions {
                idle_timeout: Some(duration(self.properties.egress.common_http.connection_idle_timeout())),
                ..Default::default()
            }),
            ..Default::default()
        };

        Filter {
            name: HTTP_CONNECTION_MANAGER_FILTER.to_string(),
            config_type: Some(FilterConfigType::TypedConfig(any_from_message(HCM_TYPE_URL, &hcm))),
        }
    }

    fn transparent_listeners(&self, group: &Group, config: &ListenersConfig) -> Vec<Listener> {
        let mode = group.communication_mode();
        let buckets = domain_route_specifications(group);

        let mut ports: BTreeMap<u16, PortTraffic<'_>> = BTreeMap::new();
        ports.entry(DEFAULT_HTTP_PORT).or_default().http = true;
        for (grouper, specifications) in &buckets {
            let traffic = ports.entry(grouper.port).or_default();
            if grouper.use_ssl {
                traffic.tls.extend(specifications);
            } else {
                traffic.http = true;
            }
        }

        ports
            .into_iter()
            .map(|(port, traffic)| {
                let mut chains: Vec<FilterChain> = traffic.tls.iter().map(|spec| sni_chain(spec)).collect();
                if traffic.http {
                    let route_name = port.to_string();
                    chains.push(FilterChain {
                        filters: vec![self.http_connection_manager(
                            &format!("egress_http_{}", route_name),
                            &route_name,
                            mode,
                            false,
                        )],
                        ..Default::default()
                    });
                }

                let mut listener = self.virtual_listener(config, port, chains);
                if !traffic.tls.is_empty() {
                    listener.listener_filters = vec![tls_inspector()];
                }
                listener
            })
            .collect()
    }
}

/// Traffic sharing one transparent-proxy port
#[derive(Default)]
struct PortTraffic<'a> {
    http: bool,
    tls: Vec<&'a RouteSpecification>,
}

impl ListenersFactory for EnvoyListenersFactory {
    fn listeners_for(&self, group: &Group, _global: &GlobalSnapshot) -> Vec<Listener> {
        let Some(config) = group.listeners_config() else {
            debug!(group = %group.service_name(), "Group has no listener config");
            return Vec::new();
        };

        let mode = group.communication_mode();
        let mut listeners = vec![self.ingress_listener(config, mode), self.egress_listener(config, mode)];
        if config.use_transparent_proxy {
            listeners.extend(self.transparent_listeners(group, config));
        }
        listeners
    }
}

pub fn virtual_listener_name(host: &str, port: u16) -> String {
    format!("{}:{}", host, port)
}

fn strip_port(domain: &str) -> &str {
    domain.split(':').next().unwrap_or(domain)
}

fn socket_address(host: &str, port: u16) -> Address {
    Address {
        address: Some(AddressType::SocketAddress(SocketAddress {
            address: host.to_string(),
            port_specifier: Some(PortSpecifier::PortValue(port.into())),
            ..Default::default()
        })),
    }
}

fn sni_chain(spec: &RouteSpecification) -> FilterChain {
    FilterChain {
        filter_chain_match: Some(FilterChainMatch {
            server_names: spec.route_domains.iter().map(|domain| strip_port(domain).to_string()).collect(),
            ..Default::default()
        }),
        filters: vec![tcp_proxy(&spec.cluster_name)],
        ..Default::default()
    }
}

fn tcp_proxy(cluster_name: &str) -> Filter {
    let proxy = TcpProxy {
        stat_prefix: format!("egress_tcp_{}", cluster_name),
        cluster_specifier: Some(TcpClusterSpecifier::Cluster(cluster_name.to_string())),
        ..Default::default()
    };

    Filter {
        name: TCP_PROXY_FILTER.to_string(),
        config_type: Some(FilterConfigType::TypedConfig(any_from_message(TCP_PROXY_TYPE_URL, &proxy))),
    }
}

fn tls_inspector() -> ListenerFilter {
    ListenerFilter {
        name: TLS_INSPECTOR_FILTER.to_string(),
        config_type: Some(ListenerFilterConfigType::TypedConfig(any_from_message(
            TLS_INSPECTOR_TYPE_URL,
            &TlsInspector::default(),
        ))),
        ..Default::default()
    }
}
