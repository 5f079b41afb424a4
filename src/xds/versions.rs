//! # Snapshot Versions
//!
//! Per-group, per-resource-type version history. Versions are derived from
//! resource content only: equal content yields the same version string in
//! every process, so proxies are only pushed what actually changed.
//!
//! Protobuf maps encode in hash-map iteration order, so the digest walks
//! map-bearing fields with their keys sorted instead of hashing
//! `encode_to_vec` output directly.
//!
//! The history lives in a [`DashMap`] keyed by group: concurrent
//! specializations of different groups never contend on one lock.

use std::collections::HashSet;

use dashmap::DashMap;
use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::core::v3::Metadata;
use envoy_types::pb::envoy::config::endpoint::v3::ClusterLoadAssignment;
use envoy_types::pb::envoy::config::listener::v3::Listener;
use envoy_types::pb::envoy::config::route::v3::RouteConfiguration;
use envoy_types::pb::google::protobuf::{value::Kind, Struct, Value};
use prost::Message;
use sha2::{Digest, Sha256};
use tracing::trace;

use crate::domain::Group;
use crate::observability::SnapshotMetrics;
use crate::xds::resources::NamedResource;

/// Version strings of one emitted bundle
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Version {
    pub clusters: String,
    pub endpoints: String,
    pub listeners: String,
    pub routes: String,
}

#[derive(Debug, Clone)]
struct Tracked<R> {
    resources: Vec<R>,
    version: String,
}

#[derive(Debug, Default)]
struct GroupVersions {
    clusters: Option<Tracked<Cluster>>,
    endpoints: Option<Tracked<ClusterLoadAssignment>>,
    listeners: Option<Tracked<Listener>>,
    routes: Option<Tracked<RouteConfiguration>>,
}

#[derive(Debug, Default)]
pub struct SnapshotVersions {
    versions: DashMap<Group, GroupVersions>,
    metrics: SnapshotMetrics,
}

impl SnapshotVersions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metrics(metrics: SnapshotMetrics) -> Self {
        Self { versions: DashMap::new(), metrics }
    }

    /// Versions for the given resources of `group`, minting fresh ones only
    /// for the resource types whose content changed since the last call.
    pub fn version(
        &self,
        group: &Group,
        clusters: &[Cluster],
        endpoints: &[ClusterLoadAssignment],
        listeners: &[Listener],
        routes: &[RouteConfiguration],
    ) -> Version {
        let mut entry = self.versions.entry(group.clone()).or_default();
        let history = entry.value_mut();

        let clusters = self.track(&mut history.clusters, clusters, "clusters");
        let endpoints = self.track(&mut history.endpoints, endpoints, "endpoints");
        let listeners = self.track(&mut history.listeners, listeners, "listeners");
        let routes = self.track(&mut history.routes, routes, "routes");

        Version { clusters, endpoints, listeners, routes }
    }

    /// Forget groups that are no longer connected
    pub fn retain_groups<'a, I>(&self, groups: I)
    where
        I: IntoIterator<Item = &'a Group>,
    {
        let keep: HashSet<&Group> = groups.into_iter().collect();
        self.versions.retain(|group, _| keep.contains(group));
    }

    /// Number of groups with version history
    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    fn track<R: NamedResource + CanonicalDigest>(
        &self,
        slot: &mut Option<Tracked<R>>,
        resources: &[R],
        resource_type: &'static str,
    ) -> String {
        let sorted = sorted_by_name(resources);

        if let Some(previous) = slot.as_ref() {
            if previous.resources == sorted {
                return previous.version.clone();
            }
        }

        let version = digest(&sorted);
        trace!(resource_type, version = %version, "Minted resource version");
        self.metrics.record_version_change(resource_type);

        *slot = Some(Tracked { resources: sorted, version: version.clone() });
        version
    }
}

fn sorted_by_name<R: NamedResource>(resources: &[R]) -> Vec<R> {
    let mut sorted = resources.to_vec();
    sorted.sort_by(|a, b| a.resource_name().cmp(b.resource_name()));
    sorted
}

/// Content digest of name-sorted resources
fn digest<R: NamedResource + CanonicalDigest>(resources: &[R]) -> String {
    let mut hasher = Sha256::new();
    for resource in resources {
        write_bytes(&mut hasher, resource.resource_name().as_bytes());
        resource.digest_into(&mut hasher);
    }
    hex::encode(&hasher.finalize()[..8])
}

/// Hashes a resource independently of protobuf map iteration order
trait CanonicalDigest {
    fn digest_into(&self, hasher: &mut Sha256);
}

impl CanonicalDigest for Cluster {
    fn digest_into(&self, hasher: &mut Sha256) {
        let mut rest = self.clone();
        let options = std::mem::take(&mut rest.typed_extension_protocol_options);
        let metadata = rest.metadata.take();
        let assignment = rest.load_assignment.take();
        write_bytes(hasher, &rest.encode_to_vec());

        let mut options: Vec<_> = options.iter().collect();
        options.sort_by(|a, b| a.0.cmp(b.0));
        write_len(hasher, options.len());
        for (key, any) in options {
            write_bytes(hasher, key.as_bytes());
            write_bytes(hasher, &any.encode_to_vec());
        }
        write_metadata(hasher, metadata.as_ref());
        match assignment {
            Some(assignment) => {
                hasher.update([1]);
                assignment.digest_into(hasher);
            }
            None => hasher.update([0]),
        }
    }
}

impl CanonicalDigest for ClusterLoadAssignment {
    fn digest_into(&self, hasher: &mut Sha256) {
        let mut rest = self.clone();
        let named = std::mem::take(&mut rest.named_endpoints);
        let mut metadata = Vec::new();
        for locality in &mut rest.endpoints {
            metadata.push(locality.metadata.take());
            for endpoint in &mut locality.lb_endpoints {
                metadata.push(endpoint.metadata.take());
            }
        }
        write_bytes(hasher, &rest.encode_to_vec());

        for entry in &metadata {
            write_metadata(hasher, entry.as_ref());
        }
        let mut named: Vec<_> = named.iter().collect();
        named.sort_by(|a, b| a.0.cmp(b.0));
        write_len(hasher, named.len());
        for (key, endpoint) in named {
            write_bytes(hasher, key.as_bytes());
            write_bytes(hasher, &endpoint.encode_to_vec());
        }
    }
}

// Listeners and route configurations are built without map fields.
impl CanonicalDigest for Listener {
    fn digest_into(&self, hasher: &mut Sha256) {
        write_bytes(hasher, &self.encode_to_vec());
    }
}

impl CanonicalDigest for RouteConfiguration {
    fn digest_into(&self, hasher: &mut Sha256) {
        write_bytes(hasher, &self.encode_to_vec());
    }
}

fn write_len(hasher: &mut Sha256, len: usize) {
    hasher.update((len as u64).to_be_bytes());
}

fn write_bytes(hasher: &mut Sha256, bytes: &[u8]) {
    write_len(hasher, bytes.len());
    hasher.update(bytes);
}

fn write_metadata(hasher: &mut Sha256, metadata: Option<&Metadata>) {
    let Some(metadata) = metadata else {
        hasher.update([0]);
        return;
    };
    hasher.update([1]);

    let mut filters: Vec<_> = metadata.filter_metadata.iter().collect();
    filters.sort_by(|a, b| a.0.cmp(b.0));
    write_len(hasher, filters.len());
    for (key, value) in filters {
        write_bytes(hasher, key.as_bytes());
        write_struct(hasher, value);
    }

    let mut typed: Vec<_> = metadata.typed_filter_metadata.iter().collect();
    typed.sort_by(|a, b| a.0.cmp(b.0));
    write_len(hasher, typed.len());
    for (key, any) in typed {
        write_bytes(hasher, key.as_bytes());
        write_bytes(hasher, &any.encode_to_vec());
    }
}

fn write_struct(hasher: &mut Sha256, value: &Struct) {
    let mut fields: Vec<_> = value.fields.iter().collect();
    fields.sort_by(|a, b| a.0.cmp(b.0));
    write_len(hasher, fields.len());
    for (key, field) in fields {
        write_bytes(hasher, key.as_bytes());
        write_value(hasher, field);
    }
}

fn write_value(hasher: &mut Sha256, value: &Value) {
    match &value.kind {
        Some(Kind::StructValue(nested)) => {
            hasher.update([b's']);
            write_struct(hasher, nested);
        }
        Some(Kind::ListValue(list)) => {
            hasher.update([b'l']);
            write_len(hasher, list.values.len());
            for item in &list.values {
                write_value(hasher, item);
            }
        }
        _ => {
            hasher.update([b'v']);
            write_bytes(hasher, &value.encode_to_vec());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AllServicesGroup, ServicesGroup};
    use envoy_types::pb::envoy::config::endpoint::v3::{LbEndpoint, LocalityLbEndpoints};
    use envoy_types::pb::google::protobuf::Any;
    use std::collections::HashMap;

    fn cluster(name: &str) -> Cluster {
        Cluster { name: name.to_string(), ..Default::default() }
    }

    fn route(name: &str) -> RouteConfiguration {
        RouteConfiguration { name: name.to_string(), ..Default::default() }
    }

    fn group(name: &str) -> Group {
        ServicesGroup::new(name).into()
    }

    fn string(value: &str) -> Value {
        Value { kind: Some(Kind::StringValue(value.to_string())) }
    }

    /// Many metadata keys inserted in a rotated order into fresh hash maps
    fn assignment(rotation: usize) -> ClusterLoadAssignment {
        let mut keys: Vec<String> = (0..16).map(|i| format!("key-{}", i)).collect();
        let len = keys.len();
        keys.rotate_left(rotation % len);
        let fields: HashMap<String, Value> = keys.iter().map(|key| (key.clone(), string(key))).collect();
        let metadata = Metadata {
            filter_metadata: [
                ("envoy.lb".to_string(), Struct { fields }),
                ("other".to_string(), Struct::default()),
            ]
            .into_iter()
            .collect(),
            ..Default::default()
        };

        ClusterLoadAssignment {
            cluster_name: "orders".to_string(),
            endpoints: vec![LocalityLbEndpoints {
                lb_endpoints: vec![LbEndpoint { metadata: Some(metadata), ..Default::default() }],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn unchanged_resources_keep_their_version() {
        let versions = SnapshotVersions::new();
        let g = group("orders");

        let first = versions.version(&g, &[cluster("a"), cluster("b")], &[], &[], &[route("r")]);
        let second = versions.version(&g, &[cluster("b"), cluster("a")], &[], &[], &[route("r")]);

        assert_eq!(first, second);
    }

    #[test]
    fn categories_change_independently() {
        let versions = SnapshotVersions::new();
        let g = group("orders");

        let first = versions.version(&g, &[cluster("a")], &[], &[], &[route("r")]);
        let second = versions.version(&g, &[cluster("a"), cluster("b")], &[], &[], &[route("r")]);

        assert_ne!(first.clusters, second.clusters);
        assert_eq!(first.endpoints, second.endpoints);
        assert_eq!(first.listeners, second.listeners);
        assert_eq!(first.routes, second.routes);
    }

    #[test]
    fn returning_to_old_content_restores_its_version() {
        let versions = SnapshotVersions::new();
        let g = group("orders");

        let a = versions.version(&g, &[cluster("a")], &[], &[], &[]);
        let b = versions.version(&g, &[cluster("b")], &[], &[], &[]);
        let a_again = versions.version(&g, &[cluster("a")], &[], &[], &[]);

        assert_ne!(a.clusters, b.clusters);
        assert_eq!(a, a_again);
    }

    #[test]
    fn equal_content_gets_equal_versions_across_trackers() {
        let g = group("orders");
        let first = SnapshotVersions::new().version(&g, &[cluster("a")], &[assignment(0)], &[], &[route("r")]);
        let second = SnapshotVersions::new().version(&g, &[cluster("a")], &[assignment(0)], &[], &[route("r")]);

        assert_eq!(first, second);
    }

    #[test]
    fn digest_ignores_map_iteration_order() {
        let reference = digest(&[assignment(0)]);
        for seed in 1..32 {
            assert_eq!(digest(&[assignment(seed)]), reference);
        }

        let tagged = |tag: &str| {
            let mut a = assignment(0);
            let lb = a.endpoints[0].lb_endpoints[0].metadata.as_mut().expect("metadata");
            lb.filter_metadata
                .get_mut("envoy.lb")
                .expect("envoy.lb")
                .fields
                .insert("tag".to_string(), string(tag));
            a
        };
        assert_ne!(digest(&[tagged("blue")]), digest(&[tagged("green")]));
    }

    #[test]
    fn cluster_digest_ignores_map_iteration_order() {
        let with_options = |rotation: usize| {
            let mut keys: Vec<String> = (0..12).map(|i| format!("envoy.extensions.option_{}", i)).collect();
            keys.rotate_left(rotation);
            Cluster {
                name: "orders".to_string(),
                typed_extension_protocol_options: keys
                    .into_iter()
                    .map(|key| {
                        let any = Any { type_url: key.clone(), value: key.as_bytes().to_vec() };
                        (key, any)
                    })
                    .collect(),
                ..Default::default()
            }
        };

        let reference = digest(&[with_options(0)]);
        for rotation in 1..12 {
            assert_eq!(digest(&[with_options(rotation)]), reference);
        }
    }

    #[test]
    fn groups_are_tracked_separately() {
        let versions = SnapshotVersions::new();
        let services = group("orders");
        let all: Group = AllServicesGroup::new("orders").into();

        versions.version(&services, &[cluster("a")], &[], &[], &[]);
        versions.version(&all, &[cluster("a")], &[], &[], &[]);
        assert_eq!(versions.len(), 2);

        versions.retain_groups([&all]);
        assert_eq!(versions.len(), 1);
        versions.retain_groups(std::iter::empty());
        assert!(versions.is_empty());
    }
}
