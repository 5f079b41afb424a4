mod common;

use std::time::Duration;

use common::*;
use flowmesh::domain::{CommunicationMode, Group, PathMatchingType, ProxyGroup};

const DECLARATIONS: &str = r#"
- kind: services
  service_name: frontend
  communication_mode: XDS
  proxy_settings:
    incoming:
      permissions_enabled: true
      endpoints:
        - path: /orders
          path_matching_type: path
          clients: [backoffice]
    outgoing:
      service_dependencies:
        - service: orders
          settings:
            timeout_policy:
              connection_idle_timeout:
                secs: 10
                nanos: 0
      domain_dependencies:
        - domain: https://api.example.com
  listeners_config:
    ingress_host: ingress-host
    ingress_port: 3380
    egress_host: egress-host
    egress_port: 3380
- kind: all_services
  service_name: gateway
"#;

fn declarations() -> Vec<Group> {
    serde_yaml::from_str(DECLARATIONS).expect("valid declarations")
}

#[test]
fn yaml_declarations_parse_into_groups() {
    let groups = declarations();
    assert_eq!(groups.len(), 2);

    let frontend = &groups[0];
    assert!(!frontend.is_all_services());
    assert_eq!(frontend.communication_mode(), CommunicationMode::Xds);
    let incoming = &frontend.proxy_settings().incoming;
    assert_eq!(incoming.endpoints[0].path_matching_type, PathMatchingType::Path);
    let outgoing = &frontend.proxy_settings().outgoing;
    assert_eq!(
        outgoing.service_dependencies[0].settings.timeout_policy.connection_idle_timeout,
        Some(Duration::from_secs(10))
    );
    assert_eq!(outgoing.domain_dependencies[0].port(), 443);
    assert_eq!(frontend.listeners_config().map(|c| c.ingress_port), Some(INGRESS_PORT));

    let gateway = &groups[1];
    assert!(gateway.is_all_services());
    assert!(gateway.listeners_config().is_none());
}

#[test]
fn declared_groups_specialize_against_discovery_state() {
    let groups = declarations();
    let factory = factory(properties());
    let global = global(&factory, &state(&["orders", "payments"]));

    let frontend = factory.snapshot_for_group(&groups[0], &global);
    let names: Vec<&str> = frontend.clusters.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, vec!["orders", "api_example_com_443"]);
    assert_eq!(idle_seconds(&frontend.clusters[0]), Some(10));

    let gateway = factory.snapshot_for_group(&groups[1], &global);
    assert_eq!(gateway.clusters.len(), 2);
    assert!(gateway.listeners.is_empty());
}

#[test]
fn invalid_domain_is_rejected_at_parse_time() {
    let yaml = "- kind: services\n  service_name: frontend\n  proxy_settings:\n    outgoing:\n      domain_dependencies:\n        - domain: ftp://files.example.com\n";
    assert!(serde_yaml::from_str::<Vec<Group>>(yaml).is_err());
}
