//! # Resource Builders
//!
//! Narrow traits for the builders the snapshot core delegates to, plus the
//! default Envoy implementation of each. The core only ever talks to the
//! traits, so callers can swap in their own builders.

use std::borrow::Cow;
use std::collections::BTreeMap;

use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::core::v3::{
    config_source::ConfigSourceSpecifier, AggregatedConfigSource, ApiConfigSource, ApiVersion,
    ConfigSource, GrpcService,
};
use envoy_types::pb::envoy::config::core::v3::api_config_source::ApiType;
use envoy_types::pb::envoy::config::core::v3::grpc_service::{EnvoyGrpc, TargetSpecifier};
use envoy_types::pb::envoy::config::endpoint::v3::ClusterLoadAssignment;
use envoy_types::pb::envoy::config::listener::v3::Listener;
use envoy_types::pb::envoy::config::route::v3::RouteConfiguration;
use envoy_types::pb::google::protobuf::{Any, Duration};
use prost::Message;

use crate::domain::{CommunicationMode, Group, MultiClusterState, ProxySettings, RoutingPolicy};
use crate::xds::cluster_config::ClusterConfiguration;
use crate::xds::global_snapshot::GlobalSnapshot;
use crate::xds::route_spec::RouteSpecification;

pub mod clusters;
pub mod endpoints;
pub mod listeners;
pub mod routes;

pub use clusters::EnvoyClustersFactory;
pub use endpoints::EnvoyEndpointsFactory;
pub use listeners::EnvoyListenersFactory;
pub use routes::{EnvoyEgressRoutesFactory, EnvoyIngressRoutesFactory};

pub const CLUSTER_TYPE_URL: &str = "type.googleapis.com/envoy.config.cluster.v3.Cluster";
pub const ENDPOINT_TYPE_URL: &str =
    "type.googleapis.com/envoy.config.endpoint.v3.ClusterLoadAssignment";
pub const ROUTE_TYPE_URL: &str = "type.googleapis.com/envoy.config.route.v3.RouteConfiguration";
pub const LISTENER_TYPE_URL: &str = "type.googleapis.com/envoy.config.listener.v3.Listener";

/// Filter metadata namespace read by Envoy's load balancer
pub const ENVOY_LB_METADATA: &str = "envoy.lb";

/// Cluster name the xDS management server is reachable under, used for non-ADS config sources
pub const XDS_CLUSTER_NAME: &str = "envoy-control-xds";

/// Envoy resource addressable by name inside a snapshot
pub trait NamedResource: Message + Clone + PartialEq + Default {
    /// Human readable kind, used in error messages and metrics
    const KIND: &'static str;
    const TYPE_URL: &'static str;

    fn resource_name(&self) -> &str;

    fn to_any(&self) -> Any {
        Any { type_url: Self::TYPE_URL.to_string(), value: self.encode_to_vec() }
    }
}

impl NamedResource for Cluster {
    const KIND: &'static str = "cluster";
    const TYPE_URL: &'static str = CLUSTER_TYPE_URL;

    fn resource_name(&self) -> &str {
        &self.name
    }
}

impl NamedResource for ClusterLoadAssignment {
    const KIND: &'static str = "endpoint";
    const TYPE_URL: &'static str = ENDPOINT_TYPE_URL;

    fn resource_name(&self) -> &str {
        &self.cluster_name
    }
}

impl NamedResource for Listener {
    const KIND: &'static str = "listener";
    const TYPE_URL: &'static str = LISTENER_TYPE_URL;

    fn resource_name(&self) -> &str {
        &self.name
    }
}

impl NamedResource for RouteConfiguration {
    const KIND: &'static str = "route";
    const TYPE_URL: &'static str = ROUTE_TYPE_URL;

    fn resource_name(&self) -> &str {
        &self.name
    }
}

/// Builds cluster resources
pub trait ClustersFactory: Send + Sync {
    /// One EDS cluster per configured service, shared by every group
    fn clusters_for_services(
        &self,
        configurations: &BTreeMap<String, ClusterConfiguration>,
        mode: CommunicationMode,
    ) -> Vec<Cluster>;

    /// mTLS variants of the clusters whose services accept secured traffic
    fn secured_clusters(&self, clusters: &[Cluster]) -> Vec<Cluster>;

    /// Concrete cluster list for one group, drawn from the global snapshot
    fn clusters_for_group(&self, group: &Group, global: &GlobalSnapshot) -> Vec<Cluster>;
}

/// Builds and filters endpoint load assignments
pub trait EndpointsFactory: Send + Sync {
    fn load_assignments_for(
        &self,
        service_names: &[String],
        state: &MultiClusterState,
    ) -> Vec<ClusterLoadAssignment>;

    /// Narrow an assignment to the endpoints a routing policy prefers.
    /// Returns the input untouched when nothing needs to change.
    fn filter_endpoints<'a>(
        &self,
        assignment: &'a ClusterLoadAssignment,
        policy: &RoutingPolicy,
    ) -> Cow<'a, ClusterLoadAssignment>;

    /// Secondary-zone assignments for weighted (traffic-split) specifications
    fn secondary_cluster_endpoints(
        &self,
        assignments: &BTreeMap<String, ClusterLoadAssignment>,
        specifications: &[RouteSpecification],
    ) -> Vec<ClusterLoadAssignment>;
}

pub trait IngressRoutesFactory: Send + Sync {
    fn secured_ingress_route_config(
        &self,
        service_name: &str,
        proxy_settings: &ProxySettings,
        group: &Group,
    ) -> RouteConfiguration;
}

pub trait EgressRoutesFactory: Send + Sync {
    /// `route_name` defaults to the shared egress route config name
    fn egress_route_config(
        &self,
        service_name: &str,
        specifications: &[RouteSpecification],
        add_upstream_address_header: bool,
        route_name: Option<&str>,
    ) -> RouteConfiguration;

    /// Route config for domain dependencies sharing a non-default port
    fn domain_route_config(&self, specifications: &[RouteSpecification], port: &str)
        -> RouteConfiguration;
}

pub trait ListenersFactory: Send + Sync {
    fn listeners_for(&self, group: &Group, global: &GlobalSnapshot) -> Vec<Listener>;
}

/// Pack a message into `Any` under `type_url`
pub fn any_from_message<M: Message>(type_url: &str, message: &M) -> Any {
    Any { type_url: type_url.to_string(), value: message.encode_to_vec() }
}

pub(crate) fn duration(value: std::time::Duration) -> Duration {
    Duration { seconds: value.as_secs() as i64, nanos: value.subsec_nanos() as i32 }
}

/// Where proxies fetch dynamic resources from
pub(crate) fn config_source(mode: CommunicationMode) -> ConfigSource {
    let specifier = match mode {
        CommunicationMode::Ads => ConfigSourceSpecifier::Ads(AggregatedConfigSource::default()),
        CommunicationMode::Xds => ConfigSourceSpecifier::ApiConfigSource(ApiConfigSource {
            api_type: ApiType::Grpc as i32,
            transport_api_version: ApiVersion::V3 as i32,
            grpc_services: vec![GrpcService {
                target_specifier: Some(TargetSpecifier::EnvoyGrpc(EnvoyGrpc {
                    cluster_name: XDS_CLUSTER_NAME.to_string(),
                    ..Default::default()
                })),
                ..Default::default()
            }],
            ..Default::default()
        }),
    };

    ConfigSource {
        config_source_specifier: Some(specifier),
        resource_api_version: ApiVersion::V3 as i32,
        ..Default::default()
    }
}
