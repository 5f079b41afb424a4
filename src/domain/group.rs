//! # Proxy Groups
//!
//! A group is the unit of configuration: every proxy in a group receives the
//! same resource bundle. Groups come in two flavours sharing [`ProxyGroup`]:
//!
//! - [`ServicesGroup`] reaches only its declared dependencies
//! - [`AllServicesGroup`] additionally reaches every known service through the
//!   group's default dependency settings
//!
//! Groups are hashable so they can key per-group version history.

use crate::errors::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use url::Url;

/// How the proxy talks to the control plane
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CommunicationMode {
    /// Aggregated discovery over a single stream
    #[default]
    Ads,
    /// One stream per resource type
    Xds,
}

/// Capabilities every group variant exposes
pub trait ProxyGroup {
    fn service_name(&self) -> &str;
    fn discovery_service_name(&self) -> &str;
    fn proxy_settings(&self) -> &ProxySettings;
    /// `None` disables listener synthesis for the group
    fn listeners_config(&self) -> Option<&ListenersConfig>;
    fn communication_mode(&self) -> CommunicationMode;
}

/// Group reaching exactly its declared dependencies
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServicesGroup {
    pub service_name: String,
    #[serde(default)]
    pub discovery_service_name: String,
    #[serde(default)]
    pub proxy_settings: ProxySettings,
    #[serde(default)]
    pub listeners_config: Option<ListenersConfig>,
    #[serde(default)]
    pub communication_mode: CommunicationMode,
}

impl ServicesGroup {
    /// Group whose discovery name equals its service name
    pub fn new(service_name: impl Into<String>) -> Self {
        let service_name = service_name.into();
        Self { discovery_service_name: service_name.clone(), service_name, ..Default::default() }
    }

    pub fn with_discovery_service_name(mut self, name: impl Into<String>) -> Self {
        self.discovery_service_name = name.into();
        self
    }

    pub fn with_proxy_settings(mut self, proxy_settings: ProxySettings) -> Self {
        self.proxy_settings = proxy_settings;
        self
    }

    pub fn with_listeners_config(mut self, listeners_config: ListenersConfig) -> Self {
        self.listeners_config = Some(listeners_config);
        self
    }

    pub fn with_communication_mode(mut self, mode: CommunicationMode) -> Self {
        self.communication_mode = mode;
        self
    }
}

impl ProxyGroup for ServicesGroup {
    fn service_name(&self) -> &str {
        &self.service_name
    }

    fn discovery_service_name(&self) -> &str {
        &self.discovery_service_name
    }

    fn proxy_settings(&self) -> &ProxySettings {
        &self.proxy_settings
    }

    fn listeners_config(&self) -> Option<&ListenersConfig> {
        self.listeners_config.as_ref()
    }

    fn communication_mode(&self) -> CommunicationMode {
        self.communication_mode
    }
}

/// Group reaching every known service not excluded by prefix
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AllServicesGroup {
    pub service_name: String,
    #[serde(default)]
    pub discovery_service_name: String,
    #[serde(default)]
    pub proxy_settings: ProxySettings,
    #[serde(default)]
    pub listeners_config: Option<ListenersConfig>,
    #[serde(default)]
    pub communication_mode: CommunicationMode,
}

impl AllServicesGroup {
    pub fn new(service_name: impl Into<String>) -> Self {
        let service_name = service_name.into();
        Self { discovery_service_name: service_name.clone(), service_name, ..Default::default() }
    }

    pub fn with_discovery_service_name(mut self, name: impl Into<String>) -> Self {
        self.discovery_service_name = name.into();
        self
    }

    pub fn with_proxy_settings(mut self, proxy_settings: ProxySettings) -> Self {
        self.proxy_settings = proxy_settings;
        self
    }

    pub fn with_listeners_config(mut self, listeners_config: ListenersConfig) -> Self {
        self.listeners_config = Some(listeners_config);
        self
    }

    pub fn with_communication_mode(mut self, mode: CommunicationMode) -> Self {
        self.communication_mode = mode;
        self
    }
}

impl ProxyGroup for AllServicesGroup {
    fn service_name(&self) -> &str {
        &self.service_name
    }

    fn discovery_service_name(&self) -> &str {
        &self.discovery_service_name
    }

    fn proxy_settings(&self) -> &ProxySettings {
        &self.proxy_settings
    }

    fn listeners_config(&self) -> Option<&ListenersConfig> {
        self.listeners_config.as_ref()
    }

    fn communication_mode(&self) -> CommunicationMode {
        self.communication_mode
    }
}

/// Tagged group identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Group {
    Services(ServicesGroup),
    AllServices(AllServicesGroup),
}

impl Group {
    pub fn is_all_services(&self) -> bool {
        matches!(self, Group::AllServices(_))
    }

    fn inner(&self) -> &dyn ProxyGroup {
        match self {
            Group::Services(group) => group,
            Group::AllServices(group) => group,
        }
    }
}

impl ProxyGroup for Group {
    fn service_name(&self) -> &str {
        self.inner().service_name()
    }

    fn discovery_service_name(&self) -> &str {
        self.inner().discovery_service_name()
    }

    fn proxy_settings(&self) -> &ProxySettings {
        self.inner().proxy_settings()
    }

    fn listeners_config(&self) -> Option<&ListenersConfig> {
        self.inner().listeners_config()
    }

    fn communication_mode(&self) -> CommunicationMode {
        self.inner().communication_mode()
    }
}

impl From<ServicesGroup> for Group {
    fn from(group: ServicesGroup) -> Self {
        Group::Services(group)
    }
}

impl From<AllServicesGroup> for Group {
    fn from(group: AllServicesGroup) -> Self {
        Group::AllServices(group)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxySettings {
    pub incoming: Incoming,
    pub outgoing: Outgoing,
}

impl ProxySettings {
    pub fn new(incoming: Incoming, outgoing: Outgoing) -> Self {
        Self { incoming, outgoing }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PathMatchingType {
    Path,
    #[default]
    PathPrefix,
}

/// Endpoint of the group's own service that callers may reach
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct IncomingEndpoint {
    pub path: String,
    pub path_matching_type: PathMatchingType,
    pub methods: Vec<String>,
    pub clients: Vec<String>,
}

/// Endpoint guarded by the global rate-limit service
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct IncomingRateLimitEndpoint {
    pub path: String,
    pub path_matching_type: PathMatchingType,
    pub methods: Vec<String>,
    pub clients: Vec<String>,
    /// e.g. `12/s`
    pub rate_limit: String,
}

impl IncomingRateLimitEndpoint {
    pub fn new(path: impl Into<String>, rate_limit: impl Into<String>) -> Self {
        Self { path: path.into(), rate_limit: rate_limit.into(), ..Default::default() }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Incoming {
    pub endpoints: Vec<IncomingEndpoint>,
    pub rate_limit_endpoints: Vec<IncomingRateLimitEndpoint>,
    pub permissions_enabled: bool,
}

/// Declared outgoing dependencies of a group
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct Outgoing {
    pub service_dependencies: Vec<ServiceDependency>,
    pub domain_dependencies: Vec<DomainDependency>,
    pub domain_pattern_dependencies: Vec<DomainPatternDependency>,
    pub tag_dependencies: Vec<TagDependency>,
    /// Settings for dependencies reached implicitly (wildcard, tags without overrides)
    pub default_service_settings: DependencySettings,
}

impl Outgoing {
    pub fn service_names(&self) -> impl Iterator<Item = &str> {
        self.service_dependencies.iter().map(|dep| dep.service.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ServiceDependency {
    pub service: String,
    #[serde(default)]
    pub settings: DependencySettings,
}

impl ServiceDependency {
    pub fn new(service: impl Into<String>) -> Self {
        Self { service: service.into(), settings: DependencySettings::default() }
    }

    pub fn with_settings(mut self, settings: DependencySettings) -> Self {
        self.settings = settings;
        self
    }
}

#[derive(Serialize, Deserialize)]
struct RawDomainDependency {
    domain: String,
    #[serde(default)]
    settings: DependencySettings,
}

/// Dependency on an external `http://` or `https://` domain
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawDomainDependency", into = "RawDomainDependency")]
pub struct DomainDependency {
    domain: String,
    host: String,
    port: u16,
    use_ssl: bool,
    pub settings: DependencySettings,
}

impl DomainDependency {
    pub fn new(domain: impl Into<String>, settings: DependencySettings) -> Result<Self> {
        let domain = domain.into();
        let url = Url::parse(&domain)
            .map_err(|e| Error::validation(format!("Invalid domain dependency '{}': {}", domain, e)))?;

        let use_ssl = match url.scheme() {
            "https" => true,
            "http" => false,
            other => {
                return Err(Error::validation(format!(
                    "Unsupported scheme '{}' in domain dependency '{}'",
                    other, domain
                )))
            }
        };

        let host = url
            .host_str()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| Error::validation(format!("Domain dependency '{}' has no host", domain)))?
            .to_string();
        let port = url.port_or_known_default().unwrap_or(if use_ssl { 443 } else { 80 });

        Ok(Self { domain, host, port, use_ssl, settings })
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn use_ssl(&self) -> bool {
        self.use_ssl
    }

    fn default_port(&self) -> u16 {
        if self.use_ssl {
            443
        } else {
            80
        }
    }

    /// `my.domain.com` on 443 becomes `my_domain_com_443`
    pub fn cluster_name(&self) -> String {
        format!("{}_{}", self.host.replace('.', "_"), self.port)
    }

    /// Host, with the port appended when it is not the scheme default
    pub fn route_domain(&self) -> String {
        if self.port == self.default_port() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl TryFrom<RawDomainDependency> for DomainDependency {
    type Error = Error;

    fn try_from(raw: RawDomainDependency) -> Result<Self> {
        DomainDependency::new(raw.domain, raw.settings)
    }
}

impl From<DomainDependency> for RawDomainDependency {
    fn from(dep: DomainDependency) -> Self {
        RawDomainDependency { domain: dep.domain, settings: dep.settings }
    }
}

/// Dependency on domains matching a wildcard pattern, served by the dynamic forward proxy
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DomainPatternDependency {
    pub domain_pattern: String,
    #[serde(default)]
    pub settings: DependencySettings,
}

impl DomainPatternDependency {
    pub fn new(domain_pattern: impl Into<String>) -> Self {
        Self { domain_pattern: domain_pattern.into(), settings: DependencySettings::default() }
    }
}

/// Dependency on every service carrying a tag
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TagDependency {
    pub tag: String,
    #[serde(default)]
    pub settings: DependencySettings,
}

impl TagDependency {
    pub fn new(tag: impl Into<String>) -> Self {
        Self { tag: tag.into(), settings: DependencySettings::default() }
    }

    pub fn with_settings(mut self, settings: DependencySettings) -> Self {
        self.settings = settings;
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct DependencySettings {
    pub handle_internal_redirect: bool,
    pub timeout_policy: TimeoutPolicy,
    pub rewrite_host_header: bool,
    pub routing_policy: RoutingPolicy,
}

impl DependencySettings {
    pub fn with_timeout_policy(mut self, timeout_policy: TimeoutPolicy) -> Self {
        self.timeout_policy = timeout_policy;
        self
    }

    pub fn with_routing_policy(mut self, routing_policy: RoutingPolicy) -> Self {
        self.routing_policy = routing_policy;
        self
    }
}

/// Unset values fall back to `egress.common_http` defaults
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutPolicy {
    pub idle_timeout: Option<Duration>,
    pub connection_idle_timeout: Option<Duration>,
    pub request_timeout: Option<Duration>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingPolicy {
    pub auto_service_tag: bool,
    /// Tried in order; the first tag matching any endpoint wins
    pub service_tag_preference: Vec<String>,
    pub fallback_to_any_instance: bool,
}

/// Listener layout requested by a group
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(default)]
pub struct ListenersConfig {
    pub ingress_host: String,
    pub ingress_port: u16,
    pub egress_host: String,
    pub egress_port: u16,
    pub use_remote_address: bool,
    pub use_transparent_proxy: bool,
    pub add_upstream_external_address_header: bool,
}

impl Default for ListenersConfig {
    fn default() -> Self {
        Self {
            ingress_host: "0.0.0.0".to_string(),
            ingress_port: 31000,
            egress_host: "0.0.0.0".to_string(),
            egress_port: 31001,
            use_remote_address: false,
            use_transparent_proxy: false,
            add_upstream_external_address_header: false,
        }
    }
}
