//! # Global Snapshot
//!
//! Resources shared by every proxy group for one discovery epoch. Built once
//! per state change, then only read.

use std::collections::{BTreeMap, BTreeSet};

use envoy_types::pb::envoy::config::cluster::v3::Cluster;
use envoy_types::pb::envoy::config::endpoint::v3::ClusterLoadAssignment;
use tracing::debug;

use crate::config::SnapshotProperties;
use crate::domain::{Outgoing, TagDependency};
use crate::errors::{Error, Result};
use crate::xds::cluster_config::ClusterConfiguration;
use crate::xds::resources::endpoints::endpoint_tags;
use crate::xds::resources::NamedResource;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct GlobalSnapshot {
    pub clusters: BTreeMap<String, Cluster>,
    pub secured_clusters: BTreeMap<String, Cluster>,
    pub endpoints: BTreeMap<String, ClusterLoadAssignment>,
    pub cluster_configurations: BTreeMap<String, ClusterConfiguration>,
    /// Cluster names reachable through an all-services group
    pub all_services_names: BTreeSet<String>,
    /// Service name to the tags observed on its endpoints
    pub tags: BTreeMap<String, BTreeSet<String>>,
}

impl GlobalSnapshot {
    /// Index the resource lists by name.
    ///
    /// Fails with [`Error::DuplicateResource`] when a list holds two resources
    /// under one name.
    pub fn build(
        cluster_configurations: BTreeMap<String, ClusterConfiguration>,
        clusters: Vec<Cluster>,
        secured_clusters: Vec<Cluster>,
        endpoints: Vec<ClusterLoadAssignment>,
        properties: &SnapshotProperties,
    ) -> Result<Self> {
        let clusters = index_by_name(clusters)?;
        let secured_clusters = index_by_name(secured_clusters)?;
        let endpoints = index_by_name(endpoints)?;

        let blacklist = &properties.outgoing_permissions.all_services_dependencies;
        let all_services_names: BTreeSet<String> =
            clusters.keys().filter(|name| !blacklist.is_excluded(name)).cloned().collect();

        let tag_key = &properties.routing.service_tags.metadata_key;
        let tags: BTreeMap<String, BTreeSet<String>> = clusters
            .keys()
            .filter_map(|name| {
                let assignment = endpoints.get(name)?;
                let service_tags: BTreeSet<String> = assignment
                    .endpoints
                    .iter()
                    .flat_map(|locality| locality.lb_endpoints.iter())
                    .flat_map(|endpoint| endpoint_tags(endpoint, tag_key))
                    .map(str::to_string)
                    .collect();
                (!service_tags.is_empty()).then(|| (name.clone(), service_tags))
            })
            .collect();

        debug!(
            clusters = clusters.len(),
            secured_clusters = secured_clusters.len(),
            endpoints = endpoints.len(),
            all_services = all_services_names.len(),
            tagged_services = tags.len(),
            "Built global snapshot"
        );

        Ok(Self {
            clusters,
            secured_clusters,
            endpoints,
            cluster_configurations,
            all_services_names,
            tags,
        })
    }

    /// Services matched by each tag dependency, skipping explicit service dependencies
    pub fn tags_for_dependency<'a>(&'a self, outgoing: &'a Outgoing) -> Vec<(&'a str, &'a TagDependency)> {
        let explicit: BTreeSet<&str> = outgoing.service_names().collect();

        outgoing
            .tag_dependencies
            .iter()
            .flat_map(|dependency| {
                self.tags
                    .iter()
                    .filter(|(service, _)| !explicit.contains(service.as_str()))
                    .filter(|(_, tags)| tags.contains(&dependency.tag))
                    .map(move |(service, _)| (service.as_str(), dependency))
            })
            .collect()
    }
}

fn index_by_name<R: NamedResource>(resources: Vec<R>) -> Result<BTreeMap<String, R>> {
    let mut indexed = BTreeMap::new();
    for resource in resources {
        let name = resource.resource_name().to_string();
        if indexed.contains_key(&name) {
            return Err(Error::duplicate_resource(R::KIND, name));
        }
        indexed.insert(name, resource);
    }
    Ok(indexed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ServiceDependency;
    use crate::xds::resources::endpoints::tag_metadata;
    use envoy_types::pb::envoy::config::endpoint::v3::{LbEndpoint, LocalityLbEndpoints};

    fn cluster(name: &str) -> Cluster {
        Cluster { name: name.to_string(), ..Default::default() }
    }

    fn tagged_assignment(name: &str, tags: &[&str]) -> ClusterLoadAssignment {
        ClusterLoadAssignment {
            cluster_name: name.to_string(),
            endpoints: vec![LocalityLbEndpoints {
                lb_endpoints: vec![LbEndpoint {
                    metadata: Some(tag_metadata("tag", tags.iter().copied())),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            ..Default::default()
        }
    }

    #[test]
    fn duplicate_cluster_names_are_rejected() {
        let err = GlobalSnapshot::build(
            BTreeMap::new(),
            vec![cluster("payments"), cluster("payments")],
            Vec::new(),
            Vec::new(),
            &SnapshotProperties::default(),
        )
        .expect_err("duplicate clusters must fail");

        assert!(matches!(err, Error::DuplicateResource { kind: "cluster", ref name } if name == "payments"));
    }

    #[test]
    fn duplicate_endpoint_names_are_rejected() {
        let assignment = ClusterLoadAssignment { cluster_name: "a".to_string(), ..Default::default() };
        let result = GlobalSnapshot::build(
            BTreeMap::new(),
            vec![cluster("a")],
            Vec::new(),
            vec![assignment.clone(), assignment],
            &SnapshotProperties::default(),
        );
        assert!(matches!(result, Err(Error::DuplicateResource { kind: "endpoint", .. })));
    }

    #[test]
    fn all_services_names_exclude_blacklisted_prefixes() {
        let mut properties = SnapshotProperties::default();
        properties.outgoing_permissions.all_services_dependencies.not_included_by_prefix =
            vec!["mock-".to_string()];

        let snapshot = GlobalSnapshot::build(
            BTreeMap::new(),
            vec![cluster("mock-payments"), cluster("orders")],
            Vec::new(),
            Vec::new(),
            &properties,
        )
        .expect("valid snapshot");

        assert_eq!(snapshot.all_services_names, BTreeSet::from(["orders".to_string()]));
        assert!(snapshot.clusters.contains_key("mock-payments"));
    }

    #[test]
    fn tag_index_only_covers_services_with_clusters() {
        let snapshot = GlobalSnapshot::build(
            BTreeMap::new(),
            vec![cluster("orders")],
            Vec::new(),
            vec![tagged_assignment("orders", &["blue", "hot"]), tagged_assignment("ghost", &["blue"])],
            &SnapshotProperties::default(),
        )
        .expect("valid snapshot");

        assert_eq!(snapshot.tags.len(), 1);
        assert!(snapshot.tags["orders"].contains("hot"));
        assert!(!snapshot.tags.contains_key("ghost"));
    }

    #[test]
    fn tag_dependencies_skip_explicit_services() {
        let snapshot = GlobalSnapshot::build(
            BTreeMap::new(),
            vec![cluster("orders"), cluster("users")],
            Vec::new(),
            vec![tagged_assignment("orders", &["blue"]), tagged_assignment("users", &["blue"])],
            &SnapshotProperties::default(),
        )
        .expect("valid snapshot");

        let outgoing = Outgoing {
            service_dependencies: vec![ServiceDependency::new("orders")],
            tag_dependencies: vec![TagDependency::new("blue")],
            ..Default::default()
        };

        let matches: Vec<&str> =
            snapshot.tags_for_dependency(&outgoing).into_iter().map(|(s, _)| s).collect();
        assert_eq!(matches, vec!["users"]);
    }
}
