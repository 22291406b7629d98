//! Load Balancer Control Plane
//!
//! The reconciliation engine: per-resource reconcilers, the classic and VIP
//! backend strategies built on them, the controller facade that drives one
//! Service through every instance, and the security group collector.

pub mod attributes;
pub mod backends;
pub mod controller;
pub mod dns;
pub mod gc;
pub mod listeners;
pub mod membership;
pub mod ownership;
pub mod platform;
pub mod proxy_protocol;
pub mod public_ip;
pub mod rules;
pub mod security_group;
pub mod subnet;

pub use attributes::{AttributeReconciler, HealthCheckReconciler};
pub use backends::{BackendContext, BackendFactory, ClassicBackend, VipBackend, NOT_READY_BACKOFF};
pub use controller::*;
pub use dns::{CachingResolver, SystemResolver};
pub use gc::{GarbageCollector, GcReport};
pub use listeners::ListenerReconciler;
pub use membership::{BackendMembershipReconciler, SharedRng};
pub use ownership::OwnershipGuard;
pub use platform::{MemoryCloud, MemoryCloudConfig, StaticDirectory};
pub use proxy_protocol::ProxyProtocolReconciler;
pub use public_ip::PublicIpAllocator;
pub use rules::RuleReconciler;
pub use security_group::SecurityGroupManager;
pub use subnet::SubnetResolver;
