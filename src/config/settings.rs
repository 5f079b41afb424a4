//! # Snapshot Properties
//!
//! Process-wide, read-only settings consumed by the snapshot core and the
//! default resource builders. Every struct carries `#[serde(default)]` so a
//! partial file or a handful of environment overrides is enough to configure it.

use crate::errors::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use validator::{Validate, ValidationError};

/// Root of the snapshot configuration tree
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(default)]
pub struct SnapshotProperties {
    /// Zone (datacenter) the control plane runs in
    #[validate(length(min = 1, message = "Current zone cannot be empty"))]
    pub current_zone: String,

    /// Connect timeout for EDS clusters in milliseconds
    #[validate(range(min = 1, message = "EDS connect timeout must be positive"))]
    pub eds_connection_timeout_ms: u64,

    #[validate(nested)]
    pub egress: EgressProperties,

    #[validate(nested)]
    pub incoming_permissions: IncomingPermissionsProperties,

    #[validate(nested)]
    pub outgoing_permissions: OutgoingPermissionsProperties,

    #[validate(nested)]
    pub dynamic_forward_proxy: DynamicForwardProxyProperties,

    pub dynamic_listeners: DynamicListenersProperties,

    #[validate(nested)]
    pub rate_limit: RateLimitProperties,

    #[validate(nested)]
    pub load_balancing: LoadBalancingProperties,

    #[validate(nested)]
    pub routing: RoutingProperties,
}

impl Default for SnapshotProperties {
    fn default() -> Self {
        Self {
            current_zone: "dc1".to_string(),
            eds_connection_timeout_ms: 2000,
            egress: EgressProperties::default(),
            incoming_permissions: IncomingPermissionsProperties::default(),
            outgoing_permissions: OutgoingPermissionsProperties::default(),
            dynamic_forward_proxy: DynamicForwardProxyProperties::default(),
            dynamic_listeners: DynamicListenersProperties::default(),
            rate_limit: RateLimitProperties::default(),
            load_balancing: LoadBalancingProperties::default(),
            routing: RoutingProperties::default(),
        }
    }
}

impl SnapshotProperties {
    /// Validate the whole tree, including rules spanning several fields
    pub fn validate_all(&self) -> Result<()> {
        Validate::validate(self).map_err(Error::from)?;
        self.validate_custom()
    }

    fn validate_custom(&self) -> Result<()> {
        if self.egress.http2.enabled && self.egress.http2.tag_name.trim().is_empty() {
            return Err(Error::validation("HTTP/2 tag name cannot be empty when HTTP/2 is enabled"));
        }

        let tls = &self.incoming_permissions.tls_authentication;
        if tls.enabled && tls.mtls_enabled_tag.trim().is_empty() {
            return Err(Error::validation(
                "mTLS tag name cannot be empty when TLS authentication is enabled",
            ));
        }

        Ok(())
    }

    /// EDS connect timeout as Duration
    pub fn eds_connection_timeout(&self) -> Duration {
        Duration::from_millis(self.eds_connection_timeout_ms)
    }
}

/// Outgoing traffic settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(default)]
pub struct EgressProperties {
    pub http2: Http2Properties,

    /// Keep clusters of services that disappeared from discovery
    pub never_remove_clusters: bool,

    /// Domain suffixes appended to service names in route domains
    pub domains: Vec<String>,

    #[validate(nested)]
    pub common_http: CommonHttpProperties,

    /// Cluster receiving traffic that matches no declared dependency
    #[validate(length(min = 1, message = "Original destination cluster name cannot be empty"))]
    pub original_destination_cluster: String,

    /// Header carrying the upstream address back to the caller
    pub upstream_address_header: String,
}

impl Default for EgressProperties {
    fn default() -> Self {
        Self {
            http2: Http2Properties::default(),
            never_remove_clusters: true,
            domains: Vec::new(),
            common_http: CommonHttpProperties::default(),
            original_destination_cluster: "envoy-original-destination".to_string(),
            upstream_address_header: "x-envoy-upstream-remote-address".to_string(),
        }
    }
}

/// HTTP/2 upgrade settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Http2Properties {
    pub enabled: bool,
    /// Tag every instance of a service must carry to get an HTTP/2 cluster
    pub tag_name: String,
}

impl Default for Http2Properties {
    fn default() -> Self {
        Self { enabled: true, tag_name: "envoy".to_string() }
    }
}

/// Default HTTP timeouts applied when a dependency does not override them
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(default)]
pub struct CommonHttpProperties {
    #[validate(range(min = 1, message = "Idle timeout must be positive"))]
    pub idle_timeout_seconds: u64,

    #[validate(range(min = 1, message = "Connection idle timeout must be positive"))]
    pub connection_idle_timeout_seconds: u64,

    #[validate(range(min = 1, message = "Request timeout must be positive"))]
    pub request_timeout_seconds: u64,
}

impl Default for CommonHttpProperties {
    fn default() -> Self {
        Self {
            idle_timeout_seconds: 120,
            connection_idle_timeout_seconds: 120,
            request_timeout_seconds: 120,
        }
    }
}

impl CommonHttpProperties {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_seconds)
    }

    pub fn connection_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.connection_idle_timeout_seconds)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

/// Incoming traffic and mTLS settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(default)]
pub struct IncomingPermissionsProperties {
    pub enabled: bool,

    pub tls_authentication: TlsAuthenticationProperties,

    /// Cluster pointing at the local application behind the sidecar
    #[validate(length(min = 1, message = "Local service cluster name cannot be empty"))]
    pub local_service_cluster: String,
}

impl Default for IncomingPermissionsProperties {
    fn default() -> Self {
        Self {
            enabled: false,
            tls_authentication: TlsAuthenticationProperties::default(),
            local_service_cluster: "local_service".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TlsAuthenticationProperties {
    pub enabled: bool,
    /// Tag every instance of a service must carry to be reached over mTLS
    pub mtls_enabled_tag: String,
    /// Prefix of the SNI sent to secured upstreams
    pub sni_prefix: String,
}

impl Default for TlsAuthenticationProperties {
    fn default() -> Self {
        Self {
            enabled: false,
            mtls_enabled_tag: "mtls:enabled".to_string(),
            sni_prefix: "outbound".to_string(),
        }
    }
}

/// Settings of the implicit "all services" dependency
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(default)]
pub struct OutgoingPermissionsProperties {
    pub enabled: bool,

    #[validate(nested)]
    pub all_services_dependencies: AllServicesDependenciesProperties,
}

impl Default for OutgoingPermissionsProperties {
    fn default() -> Self {
        Self { enabled: true, all_services_dependencies: AllServicesDependenciesProperties::default() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(default)]
pub struct AllServicesDependenciesProperties {
    /// Dependency name standing for "every service"
    #[validate(length(min = 1, message = "All services identifier cannot be empty"))]
    pub identifier: String,

    /// Services whose name starts with any of these never join the implicit set
    pub not_included_by_prefix: Vec<String>,
}

impl Default for AllServicesDependenciesProperties {
    fn default() -> Self {
        Self { identifier: "*".to_string(), not_included_by_prefix: Vec::new() }
    }
}

impl AllServicesDependenciesProperties {
    pub fn is_excluded(&self, service_name: &str) -> bool {
        self.not_included_by_prefix.iter().any(|prefix| service_name.starts_with(prefix.as_str()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(default)]
pub struct DynamicForwardProxyProperties {
    #[validate(length(min = 1, message = "Dynamic forward proxy cluster name cannot be empty"))]
    pub cluster_name: String,

    #[validate(range(min = 1, message = "Max cached hosts must be positive"))]
    pub max_cached_hosts: u32,

    #[validate(range(min = 1, message = "Connect timeout must be positive"))]
    pub connection_timeout_ms: u64,
}

impl Default for DynamicForwardProxyProperties {
    fn default() -> Self {
        Self {
            cluster_name: "dynamic_forward_proxy_cluster".to_string(),
            max_cached_hosts: 1024,
            connection_timeout_ms: 1000,
        }
    }
}

/// Global switch for listener synthesis
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DynamicListenersProperties {
    pub enabled: bool,
}

impl Default for DynamicListenersProperties {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(default)]
pub struct RateLimitProperties {
    /// Name of the global rate-limit service cluster
    #[validate(length(min = 1, message = "Rate limit service name cannot be empty"))]
    pub service_name: String,
}

impl Default for RateLimitProperties {
    fn default() -> Self {
        Self { service_name: "ratelimit-grpc".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(default)]
pub struct LoadBalancingProperties {
    /// ROUND_ROBIN, LEAST_REQUEST or RANDOM
    #[validate(custom(function = "validate_lb_policy"))]
    pub policy: String,

    pub priorities: LoadBalancingPriorityProperties,

    #[validate(nested)]
    pub traffic_splitting: TrafficSplittingProperties,

    pub canary: CanaryProperties,

    /// Metadata key marking regular (non-canary) endpoints
    pub regular_metadata_key: String,
}

impl Default for LoadBalancingProperties {
    fn default() -> Self {
        Self {
            policy: "LEAST_REQUEST".to_string(),
            priorities: LoadBalancingPriorityProperties::default(),
            traffic_splitting: TrafficSplittingProperties::default(),
            canary: CanaryProperties::default(),
            regular_metadata_key: "lb_regular".to_string(),
        }
    }
}

fn validate_lb_policy(policy: &str) -> std::result::Result<(), ValidationError> {
    match policy.trim().to_uppercase().as_str() {
        "ROUND_ROBIN" | "LEAST_REQUEST" | "RANDOM" => Ok(()),
        _ => Err(ValidationError::new("unknown_lb_policy")),
    }
}

/// Priority of each zone as seen from a given current zone
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct LoadBalancingPriorityProperties {
    pub zone_priorities: BTreeMap<String, BTreeMap<String, u32>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default, PartialEq)]
#[serde(default)]
pub struct TrafficSplittingProperties {
    /// Zone whose endpoints form the secondary cluster
    pub zone_name: String,

    #[validate(custom(function = "validate_service_weights"))]
    pub service_by_weights: BTreeMap<String, ZoneWeights>,
}

/// Weights of the primary and secondary clusters of a traffic-split service
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(default)]
pub struct ZoneWeights {
    pub main: u32,
    pub secondary: u32,
}

fn validate_service_weights(
    weights: &BTreeMap<String, ZoneWeights>,
) -> std::result::Result<(), ValidationError> {
    if weights.values().any(|w| w.main == 0 && w.secondary == 0) {
        return Err(ValidationError::new("zero_traffic_split_weights"));
    }
    Ok(())
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CanaryProperties {
    pub enabled: bool,
    pub metadata_key: String,
    pub header_value: String,
}

impl Default for CanaryProperties {
    fn default() -> Self {
        Self { enabled: false, metadata_key: "canary".to_string(), header_value: "1".to_string() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default, PartialEq)]
#[serde(default)]
pub struct RoutingProperties {
    #[validate(nested)]
    pub service_tags: ServiceTagsProperties,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(default)]
pub struct ServiceTagsProperties {
    pub enabled: bool,

    /// Key of the tag list inside `envoy.lb` endpoint metadata
    #[validate(length(min = 1, message = "Service tag metadata key cannot be empty"))]
    pub metadata_key: String,

    pub auto_service_tag_enabled: bool,
}

impl Default for ServiceTagsProperties {
    fn default() -> Self {
        Self { enabled: true, metadata_key: "tag".to_string(), auto_service_tag_enabled: false }
    }
}

/// Logging output settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[validate(length(min = 1, message = "Log level cannot be empty"))]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string(), json: false }
    }
}
