//! # Domain Model
//!
//! Discovery input (`services`) and proxy group declarations (`group`). Both
//! are plain immutable data; all synthesis logic lives under `xds`.

pub mod group;
pub mod services;

pub use group::{
    AllServicesGroup, CommunicationMode, DependencySettings, DomainDependency,
    DomainPatternDependency, Group, Incoming, IncomingEndpoint, IncomingRateLimitEndpoint,
    ListenersConfig, Outgoing, PathMatchingType, ProxyGroup, ProxySettings, RoutingPolicy,
    ServiceDependency, ServicesGroup, TagDependency, TimeoutPolicy,
};
pub use services::{
    ClusterState, Locality, MultiClusterState, ServiceInstance, ServiceInstances, ServiceName,
    ServicesState,
};
