//! # Configuration Management
//!
//! Loads [`SnapshotProperties`] and [`LoggingConfig`] from defaults, an optional
//! file and `FLOWMESH_*` environment variables, in that order of precedence.

use crate::errors::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use validator::Validate;

pub mod settings;

pub use settings::{
    AllServicesDependenciesProperties, CanaryProperties, CommonHttpProperties,
    DynamicForwardProxyProperties, DynamicListenersProperties, EgressProperties, Http2Properties,
    IncomingPermissionsProperties, LoadBalancingPriorityProperties, LoadBalancingProperties,
    LoggingConfig, OutgoingPermissionsProperties, RateLimitProperties, RoutingProperties,
    ServiceTagsProperties, SnapshotProperties, TlsAuthenticationProperties,
    TrafficSplittingProperties, ZoneWeights,
};

/// Environment variable prefix, e.g. `FLOWMESH_SNAPSHOT__CURRENT_ZONE`
pub const ENV_PREFIX: &str = "FLOWMESH";

/// Keys whose environment values are comma-separated lists
const LIST_KEYS: &[&str] = &[
    "snapshot.egress.domains",
    "snapshot.outgoing_permissions.all_services_dependencies.not_included_by_prefix",
];

/// Complete process configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub snapshot: SnapshotProperties,
    pub logging: LoggingConfig,
}

impl Config {
    /// Layer defaults, the optional file and the environment, then validate
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Config::default())?);

        if let Some(path) = path {
            if !path.exists() {
                return Err(Error::config(format!(
                    "Configuration file not found: {}",
                    path.display()
                )));
            }
            builder = builder.add_source(config::File::from(path));
        }

        let mut environment = config::Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true)
            .list_separator(",");
        for key in LIST_KEYS {
            environment = environment.with_list_parse_key(key);
        }

        let loaded: Config = builder.add_source(environment).build()?.try_deserialize()?;
        loaded.validate()?;

        tracing::debug!(
            current_zone = %loaded.snapshot.current_zone,
            http2_enabled = loaded.snapshot.egress.http2.enabled,
            dynamic_listeners = loaded.snapshot.dynamic_listeners.enabled,
            "Loaded flowmesh configuration"
        );

        Ok(loaded)
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }

    pub fn validate(&self) -> Result<()> {
        self.snapshot.validate_all()?;
        Validate::validate(&self.logging).map_err(Error::from)
    }
}

impl SnapshotProperties {
    /// Load only the snapshot section; see [`Config::load`]
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Config::load(path).map(|config| config.snapshot)
    }

    pub fn from_env() -> Result<Self> {
        Self::load(None)
    }
}
