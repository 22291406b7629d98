//! Cloud LB Operator - Service LoadBalancer reconciliation
//!
//! Turns an annotated Kubernetes Service of type LoadBalancer into cloud
//! resources and keeps them converged: a classic listener-based load
//! balancer, or a floating VIP interface bound to one backend VM.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                        LoadBalancerController                                │
//! │   Service ──▶ SpecBuilder ──▶ OwnershipGuard ──▶ BackendFactory              │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                          Backend Strategies                                  │
//! │  ┌──────────────────────────────────┐  ┌──────────────────────────────────┐  │
//! │  │     Classic (listeners)          │  │       VIP (floating NIC)         │  │
//! │  └──────────────────────────────────┘  └──────────────────────────────────┘  │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                             Reconcilers                                      │
//! │   Subnet │ SecurityGroup │ Rules │ Listeners │ ProxyProtocol │ Attributes   │
//! │   HealthCheck │ Membership │ PublicIp                                        │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                      Ports (CloudApi, NodeDirectory, NameResolver)           │
//! └─────────────────────────────────────────────────────────────────────────────┘
//!                 GarbageCollector runs on its own timer
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: Reconcilers, backend strategies, controller facade, GC
//! - [`spec`]: Annotation decoding and the typed load balancer spec
//! - [`domain`]: Ports, cloud entity types and the tag vocabulary
//! - [`error`]: Error types and requeue policy

pub mod controlplane;
pub mod domain;
pub mod error;
pub mod spec;

#[cfg(test)]
pub(crate) mod test_support;

// Re-export commonly used types
pub use controlplane::{
    BackendFactory, CachingResolver, ControllerConfig, GarbageCollector, GcReport, IngressView,
    LoadBalancerController, LoadBalancerStatusView, MemoryCloud, MemoryCloudConfig,
    StaticDirectory, SystemResolver, NOT_READY_BACKOFF,
};

pub use domain::ports::{
    CloudApi, CloudApiRef, Ingress, LoadBalancerBackend, LoadBalancerType, NameResolver,
    NameResolverRef, NodeDirectory, NodeDirectoryRef, Readiness,
};

pub use error::{Error, ErrorAction, Result};

pub use spec::{LoadBalancerSpec, SpecBuilder, SpecDefaults};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
