//! Default endpoint builder: locality-aware load assignments, service-tag
//! filtering and traffic-split secondary assignments.

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::Arc;

use envoy_types::pb::envoy::config::core::v3::{
    address::Address as AddressType, socket_address::PortSpecifier, Address,
    Locality as EnvoyLocality, Metadata, SocketAddress,
};
use envoy_types::pb::envoy::config::endpoint::v3::{
    lb_endpoint::HostIdentifier, ClusterLoadAssignment, Endpoint, LbEndpoint, LocalityLbEndpoints,
};
use envoy_types::pb::google::protobuf::{value::Kind, ListValue, Struct, UInt32Value, Value};
use tracing::debug;

use crate::config::SnapshotProperties;
use crate::domain::{
    ClusterState, Locality, MultiClusterState, RoutingPolicy, ServiceInstance, ServiceInstances,
};
use crate::xds::resources::{EndpointsFactory, ENVOY_LB_METADATA};
use crate::xds::route_spec::{secondary_cluster_name, RouteSpecification};

#[derive(Debug, Clone)]
pub struct EnvoyEndpointsFactory {
    properties: Arc<SnapshotProperties>,
}

impl EnvoyEndpointsFactory {
    pub fn new(properties: Arc<SnapshotProperties>) -> Self {
        Self { properties }
    }

    fn priority(&self, state: &ClusterState) -> u32 {
        self.properties
            .load_balancing
            .priorities
            .zone_priorities
            .get(&self.properties.current_zone)
            .and_then(|zones| zones.get(&state.cluster))
            .copied()
            .unwrap_or(match state.locality {
                Locality::Local => 0,
                Locality::Remote => 1,
            })
    }

    fn lb_endpoint(&self, instance: &ServiceInstance) -> LbEndpoint {
        LbEndpoint {
            host_identifier: Some(HostIdentifier::Endpoint(Endpoint {
                address: Some(Address {
                    address: Some(AddressType::SocketAddress(SocketAddress {
                        address: instance.address.clone(),
                        port_specifier: Some(PortSpecifier::PortValue(instance.port.into())),
                        ..Default::default()
                    })),
                }),
                ..Default::default()
            })),
            metadata: Some(self.lb_metadata(instance)),
            load_balancing_weight: instance.weight.map(|value| UInt32Value { value }),
            ..Default::default()
        }
    }

    fn lb_metadata(&self, instance: &ServiceInstance) -> Metadata {
        let mut fields = BTreeMap::new();

        let service_tags = &self.properties.routing.service_tags;
        if service_tags.enabled {
            fields.insert(service_tags.metadata_key.clone(), string_list(instance.tags.iter()));
        }

        let canary = &self.properties.load_balancing.canary;
        if canary.enabled && instance.canary {
            fields.insert(
                canary.metadata_key.clone(),
                Value { kind: Some(Kind::StringValue(canary.header_value.clone())) },
            );
        } else {
            fields.insert(
                self.properties.load_balancing.regular_metadata_key.clone(),
                Value { kind: Some(Kind::BoolValue(true)) },
            );
        }

        Metadata {
            filter_metadata: [(ENVOY_LB_METADATA.to_string(), Struct { fields: fields.into_iter().collect() })]
                .into_iter()
                .collect(),
            ..Default::default()
        }
    }

    fn locality_lb_endpoints(
        &self,
        state: &ClusterState,
        instances: &ServiceInstances,
    ) -> LocalityLbEndpoints {
        LocalityLbEndpoints {
            locality: Some(EnvoyLocality { zone: state.cluster.clone(), ..Default::default() }),
            lb_endpoints: instances.instances.iter().map(|i| self.lb_endpoint(i)).collect(),
            priority: self.priority(state),
            ..Default::default()
        }
    }
}

impl EndpointsFactory for EnvoyEndpointsFactory {
    fn load_assignments_for(
        &self,
        service_names: &[String],
        state: &MultiClusterState,
    ) -> Vec<ClusterLoadAssignment> {
        service_names
            .iter()
            .map(|service_name| ClusterLoadAssignment {
                cluster_name: service_name.clone(),
                endpoints: state
                    .instances_of(service_name)
                    .map(|(cluster_state, instances)| {
                        self.locality_lb_endpoints(cluster_state, instances)
                    })
                    .collect(),
                ..Default::default()
            })
            .collect()
    }

    fn filter_endpoints<'a>(
        &self,
        assignment: &'a ClusterLoadAssignment,
        policy: &RoutingPolicy,
    ) -> Cow<'a, ClusterLoadAssignment> {
        if !policy.auto_service_tag {
            return Cow::Borrowed(assignment);
        }

        let key = &self.properties.routing.service_tags.metadata_key;
        let has_tag = |endpoint: &LbEndpoint, tag: &str| endpoint_tags(endpoint, key).contains(&tag);

        let preferred = policy.service_tag_preference.iter().find(|tag| {
            assignment
                .endpoints
                .iter()
                .flat_map(|locality| locality.lb_endpoints.iter())
                .any(|endpoint| has_tag(endpoint, tag.as_str()))
        });

        match preferred {
            Some(tag) => {
                let endpoints = assignment
                    .endpoints
                    .iter()
                    .filter_map(|locality| {
                        if !locality.lb_endpoints.is_empty()
                            && locality.lb_endpoints.iter().all(|e| has_tag(e, tag.as_str()))
                        {
                            return Some(locality.clone());
                        }
                        let kept: Vec<LbEndpoint> = locality
                            .lb_endpoints
                            .iter()
                            .filter(|e| has_tag(e, tag.as_str()))
                            .cloned()
                            .collect();
                        (!kept.is_empty())
                            .then(|| LocalityLbEndpoints { lb_endpoints: kept, ..locality.clone() })
                    })
                    .collect();

                Cow::Owned(ClusterLoadAssignment { endpoints, ..assignment.clone() })
            }
            None if policy.fallback_to_any_instance => Cow::Borrowed(assignment),
            None => {
                debug!(
                    cluster = %assignment.cluster_name,
                    preference = ?policy.service_tag_preference,
                    "No endpoint matches preferred service tags"
                );
                Cow::Owned(ClusterLoadAssignment {
                    cluster_name: assignment.cluster_name.clone(),
                    ..Default::default()
                })
            }
        }
    }

    fn secondary_cluster_endpoints(
        &self,
        assignments: &BTreeMap<String, ClusterLoadAssignment>,
        specifications: &[RouteSpecification],
    ) -> Vec<ClusterLoadAssignment> {
        let zone = &self.properties.load_balancing.traffic_splitting.zone_name;

        specifications
            .iter()
            .filter(|spec| spec.cluster_weights.is_some())
            .filter_map(|spec| {
                let assignment = assignments.get(&spec.cluster_name)?;
                let endpoints: Vec<LocalityLbEndpoints> = assignment
                    .endpoints
                    .iter()
                    .filter(|locality| {
                        locality.locality.as_ref().map(|l| &l.zone == zone).unwrap_or(false)
                    })
                    .cloned()
                    .collect();

                (!endpoints.is_empty()).then(|| ClusterLoadAssignment {
                    cluster_name: secondary_cluster_name(&spec.cluster_name),
                    endpoints,
                    ..assignment.clone()
                })
            })
            .collect()
    }
}

/// Tags stored under `key` in an endpoint's `envoy.lb` metadata
pub fn endpoint_tags<'a>(endpoint: &'a LbEndpoint, key: &str) -> Vec<&'a str> {
    let values = endpoint
        .metadata
        .as_ref()
        .and_then(|metadata| metadata.filter_metadata.get(ENVOY_LB_METADATA))
        .and_then(|lb| lb.fields.get(key))
        .and_then(|value| match &value.kind {
            Some(Kind::ListValue(list)) => Some(&list.values),
            _ => None,
        });

    values
        .into_iter()
        .flatten()
        .filter_map(|value| match &value.kind {
            Some(Kind::StringValue(tag)) => Some(tag.as_str()),
            _ => None,
        })
        .collect()
}

/// `envoy.lb` metadata holding only a tag list
pub fn tag_metadata<'a>(key: &str, tags: impl IntoIterator<Item = &'a str>) -> Metadata {
    let fields: BTreeMap<String, Value> =
        [(key.to_string(), string_list(tags))].into_iter().collect();
    Metadata {
        filter_metadata: [(ENVOY_LB_METADATA.to_string(), Struct { fields: fields.into_iter().collect() })]
            .into_iter()
            .collect(),
        ..Default::default()
    }
}

fn string_list<S: AsRef<str>>(values: impl IntoIterator<Item = S>) -> Value {
    Value {
        kind: Some(Kind::ListValue(ListValue {
            values: values
                .into_iter()
                .map(|v| Value { kind: Some(Kind::StringValue(v.as_ref().to_string())) })
                .collect(),
        })),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ZoneWeights;
    use crate::domain::{DependencySettings, ServicesState};

    fn factory(properties: SnapshotProperties) -> EnvoyEndpointsFactory {
        EnvoyEndpointsFactory::new(Arc::new(properties))
    }

    fn tagged_endpoint(address: &str, tags: &[&str]) -> LbEndpoint {
        LbEndpoint {
            host_identifier: Some(HostIdentifier::Endpoint(Endpoint {
                address: Some(Address {
                    address: Some(AddressType::SocketAddress(SocketAddress {
                        address: address.to_string(),
                        port_specifier: Some(PortSpecifier::PortValue(80)),
                        ..Default::default()
                    })),
                }),
                ..Default::default()
            })),
            metadata: Some(tag_metadata("tag", tags.iter().copied())),
            ..Default::default()
        }
    }

    fn locality(zone: &str, priority: u32, endpoints: Vec<LbEndpoint>) -> LocalityLbEndpoints {
        LocalityLbEndpoints {
            locality: Some(EnvoyLocality { zone: zone.to_string(), ..Default::default() }),
            lb_endpoints: endpoints,
            priority,
            ..Default::default()
        }
    }

    fn lorem_assignment() -> ClusterLoadAssignment {
        ClusterLoadAssignment {
            cluster_name: "lorem-service".to_string(),
            endpoints: vec![
                locality(
                    "west",
                    0,
                    vec![
                        tagged_endpoint("1.2.3.4", &["x64", "lorem"]),
                        tagged_endpoint("2.3.4.5", &["global"]),
                        tagged_endpoint("3.4.5.6", &["lorem"]),
                    ],
                ),
                locality("east", 1, vec![tagged_endpoint("4.5.6.7", &["lorem", "ipsum"])]),
                locality("south", 1, Vec::new()),
            ],
            ..Default::default()
        }
    }

    fn policy(preference: &[&str], fallback: bool) -> RoutingPolicy {
        RoutingPolicy {
            auto_service_tag: true,
            service_tag_preference: preference.iter().map(|s| s.to_string()).collect(),
            fallback_to_any_instance: fallback,
        }
    }

    fn single_service_state(zones: &[(&str, Locality)], service: &str) -> MultiClusterState {
        MultiClusterState::new(
            zones
                .iter()
                .map(|(zone, locality)| {
                    ClusterState::new(
                        ServicesState::new([ServiceInstances::new(
                            service,
                            [ServiceInstance::new("id", "127.0.0.3", 4444).with_tags(["envoy"])],
                        )]),
                        *locality,
                        *zone,
                    )
                })
                .collect(),
        )
    }

    fn priorities(assignment: &ClusterLoadAssignment) -> BTreeMap<String, u32> {
        assignment
            .endpoints
            .iter()
            .map(|l| (l.locality.as_ref().map(|l| l.zone.clone()).unwrap_or_default(), l.priority))
            .collect()
    }

    #[test]
    fn filtering_disabled_borrows_input() {
        let assignment = lorem_assignment();
        let filtered = factory(SnapshotProperties::default())
            .filter_endpoints(&assignment, &RoutingPolicy::default());
        assert!(matches!(filtered, Cow::Borrowed(_)));
    }

    #[test]
    fn filtering_keeps_matching_endpoints_and_drops_empty_localities() {
        let assignment = lorem_assignment();
        let filtered = factory(SnapshotProperties::default())
            .filter_endpoints(&assignment, &policy(&["lorem"], false));

        assert_eq!(filtered.endpoints.len(), 2);
        let west: Vec<&str> = filtered.endpoints[0]
            .lb_endpoints
            .iter()
            .map(|e| match &e.host_identifier {
                Some(HostIdentifier::Endpoint(endpoint)) => match endpoint.address.as_ref().and_then(|a| a.address.as_ref()) {
                    Some(AddressType::SocketAddress(socket)) => socket.address.as_str(),
                    _ => "",
                },
                _ => "",
            })
            .collect();
        assert_eq!(west, vec!["1.2.3.4", "3.4.5.6"]);
        assert_eq!(filtered.endpoints[1], assignment.endpoints[1]);
    }

    #[test]
    fn filtering_uses_first_matching_preference() {
        let assignment = lorem_assignment();
        let filtered = factory(SnapshotProperties::default())
            .filter_endpoints(&assignment, &policy(&["est", "ipsum"], false));

        assert_eq!(filtered.endpoints, vec![assignment.endpoints[1].clone()]);
    }

    #[test]
    fn unmatched_preference_falls_back_to_all_instances() {
        let assignment = lorem_assignment();
        let filtered = factory(SnapshotProperties::default())
            .filter_endpoints(&assignment, &policy(&["est"], true));
        assert!(matches!(filtered, Cow::Borrowed(_)));
    }

    #[test]
    fn unmatched_preference_without_fallback_yields_empty_assignment() {
        let assignment = lorem_assignment();
        let filtered = factory(SnapshotProperties::default())
            .filter_endpoints(&assignment, &policy(&["est"], false));

        assert_eq!(
            filtered.into_owned(),
            ClusterLoadAssignment { cluster_name: "lorem-service".to_string(), ..Default::default() }
        );
    }

    #[test]
    fn default_priorities_follow_locality() {
        let mut properties = SnapshotProperties::default();
        properties.current_zone = "DC2".to_string();
        let state = single_service_state(
            &[("DC1", Locality::Remote), ("DC2", Locality::Local), ("DC3", Locality::Remote)],
            "service-one",
        );

        let assignments = factory(properties).load_assignments_for(&["service-one".to_string()], &state);
        let expected: BTreeMap<String, u32> =
            [("DC1".to_string(), 1), ("DC2".to_string(), 0), ("DC3".to_string(), 1)].into_iter().collect();
        assert_eq!(priorities(&assignments[0]), expected);
    }

    #[test]
    fn configured_priorities_apply_per_current_zone() {
        let mut properties = SnapshotProperties::default();
        properties.current_zone = "DC2".to_string();
        properties.load_balancing.priorities.zone_priorities = [(
            "DC2".to_string(),
            [("DC1".to_string(), 1), ("DC2".to_string(), 2), ("DC3".to_string(), 3)].into_iter().collect(),
        )]
        .into_iter()
        .collect();
        let state = single_service_state(
            &[("DC1", Locality::Local), ("DC2", Locality::Remote), ("DC3", Locality::Remote)],
            "service-one",
        );

        let assignments = factory(properties).load_assignments_for(&["service-one".to_string()], &state);
        let expected: BTreeMap<String, u32> =
            [("DC1".to_string(), 1), ("DC2".to_string(), 2), ("DC3".to_string(), 3)].into_iter().collect();
        assert_eq!(priorities(&assignments[0]), expected);
    }

    #[test]
    fn partially_configured_priorities_fall_back_per_zone() {
        let mut properties = SnapshotProperties::default();
        properties.current_zone = "DC1".to_string();
        properties.load_balancing.priorities.zone_priorities =
            [("DC1".to_string(), [("DC3".to_string(), 2)].into_iter().collect())].into_iter().collect();
        let state = single_service_state(
            &[("DC1", Locality::Local), ("DC2", Locality::Remote), ("DC3", Locality::Remote)],
            "service-one",
        );

        let assignments = factory(properties).load_assignments_for(&["service-one".to_string()], &state);
        let expected: BTreeMap<String, u32> =
            [("DC1".to_string(), 0), ("DC2".to_string(), 1), ("DC3".to_string(), 2)].into_iter().collect();
        assert_eq!(priorities(&assignments[0]), expected);
    }

    #[test]
    fn endpoints_carry_tag_and_regular_metadata() {
        let state = single_service_state(&[("dc1", Locality::Local)], "service-one");
        let assignments = factory(SnapshotProperties::default())
            .load_assignments_for(&["service-one".to_string()], &state);

        let endpoint = &assignments[0].endpoints[0].lb_endpoints[0];
        assert_eq!(endpoint_tags(endpoint, "tag"), vec!["envoy"]);
        let lb = &endpoint.metadata.as_ref().expect("metadata").filter_metadata[ENVOY_LB_METADATA];
        assert_eq!(lb.fields.get("lb_regular"), Some(&Value { kind: Some(Kind::BoolValue(true)) }));
    }

    fn weighted(name: &str) -> RouteSpecification {
        RouteSpecification::new(name, Vec::new(), DependencySettings::default())
            .with_weights(ZoneWeights { main: 50, secondary: 50 })
    }

    fn split_properties(zone: &str) -> SnapshotProperties {
        let mut properties = SnapshotProperties::default();
        properties.current_zone = "DC1".to_string();
        properties.load_balancing.traffic_splitting.zone_name = zone.to_string();
        properties
    }

    fn split_assignments(factory: &EnvoyEndpointsFactory) -> BTreeMap<String, ClusterLoadAssignment> {
        let state = MultiClusterState::new(vec![
            ClusterState::new(
                ServicesState::new([
                    ServiceInstances::new("service-one", [ServiceInstance::new("a", "10.0.0.1", 80)]),
                    ServiceInstances::new("service-two", [ServiceInstance::new("b", "10.0.0.2", 80)]),
                ]),
                Locality::Local,
                "DC1",
            ),
            ClusterState::new(
                ServicesState::new([ServiceInstances::new(
                    "service-one",
                    [ServiceInstance::new("c", "10.0.1.1", 80)],
                )]),
                Locality::Remote,
                "DC2",
            ),
        ]);
        factory
            .load_assignments_for(&["service-one".to_string(), "service-two".to_string()], &state)
            .into_iter()
            .map(|a| (a.cluster_name.clone(), a))
            .collect()
    }

    #[test]
    fn secondary_endpoints_keep_only_split_zone() {
        let factory = factory(split_properties("DC1"));
        let assignments = split_assignments(&factory);

        let secondary = factory.secondary_cluster_endpoints(
            &assignments,
            &[weighted("service-one"), weighted("service-two")],
        );

        assert_eq!(secondary.len(), 2);
        assert!(secondary.iter().any(|a| a.cluster_name == "service-one-secondary"));
        assert!(secondary
            .iter()
            .flat_map(|a| a.endpoints.iter())
            .all(|l| l.locality.as_ref().map(|l| l.zone.as_str()) == Some("DC1")));
    }

    #[test]
    fn secondary_endpoints_skip_unweighted_and_unknown_clusters() {
        let factory = factory(split_properties("DC1"));
        let assignments = split_assignments(&factory);

        let unweighted = RouteSpecification::new("service-one", Vec::new(), DependencySettings::default());
        assert!(factory.secondary_cluster_endpoints(&assignments, &[unweighted]).is_empty());
        assert!(factory.secondary_cluster_endpoints(&assignments, &[weighted("other")]).is_empty());
    }

    #[test]
    fn secondary_endpoints_empty_when_no_zone_matches() {
        let factory = factory(split_properties("DC9"));
        let assignments = split_assignments(&factory);
        assert!(factory.secondary_cluster_endpoints(&assignments, &[weighted("service-one")]).is_empty());
    }
}
