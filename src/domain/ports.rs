//! Domain Ports - Core trait definitions for the load balancer operator
//!
//! These traits define the boundaries between the reconciliation engine and
//! external systems: the cloud API, the node directory and name resolution.
//! The backend strategy contract shared by the classic and VIP flavors lives
//! here too.

use crate::domain::types::*;
use crate::error::Result;
use crate::spec::{InstanceSpec, LoadBalancerSpec};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Load Balancer Type
// =============================================================================

/// Discriminant selecting the backend strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadBalancerType {
    /// Classic multi-listener load balancer
    #[default]
    Lbu,
    /// Floating network interface bound to one VM
    Vip,
}

impl std::fmt::Display for LoadBalancerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadBalancerType::Lbu => write!(f, "lbu"),
            LoadBalancerType::Vip => write!(f, "vip"),
        }
    }
}

impl std::str::FromStr for LoadBalancerType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "lbu" | "elb" | "classic" => Ok(LoadBalancerType::Lbu),
            "vip" => Ok(LoadBalancerType::Vip),
            other => Err(format!("unknown load balancer type {:?}", other)),
        }
    }
}

// =============================================================================
// Ingress / Readiness
// =============================================================================

/// Address published for one load balancer instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ingress {
    pub hostname: Option<String>,
    pub public_ip: Option<String>,
}

/// Outcome of a reconcile that may need more time to converge
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness<T> {
    Ready(T),
    /// Resources exist but are not usable yet; call again later
    NotReady { retry_after: Duration, reason: String },
}

impl<T> Readiness<T> {
    pub fn not_ready(retry_after: Duration, reason: impl Into<String>) -> Self {
        Readiness::NotReady {
            retry_after,
            reason: reason.into(),
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Readiness::Ready(_))
    }

    pub fn ready(self) -> Option<T> {
        match self {
            Readiness::Ready(v) => Some(v),
            Readiness::NotReady { .. } => None,
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Readiness<U> {
        match self {
            Readiness::Ready(v) => Readiness::Ready(f(v)),
            Readiness::NotReady {
                retry_after,
                reason,
            } => Readiness::NotReady {
                retry_after,
                reason,
            },
        }
    }

    /// Requeue action for the controller runtime, if any
    pub fn requeue_action(&self) -> Option<kube::runtime::controller::Action> {
        match self {
            Readiness::Ready(_) => None,
            Readiness::NotReady { retry_after, .. } => {
                Some(kube::runtime::controller::Action::requeue(*retry_after))
            }
        }
    }
}

// =============================================================================
// Cloud API Port
// =============================================================================

/// Port for the cloud control API.
///
/// Reads return `Ok(None)`/empty when nothing matches. Creations of an
/// already existing resource fail with `Error::ResourceExists`.
#[async_trait]
pub trait CloudApi: Send + Sync {
    // Classic load balancers
    async fn read_load_balancer(&self, name: &str) -> Result<Option<LoadBalancer>>;
    async fn create_load_balancer(&self, request: CreateLoadBalancerRequest) -> Result<LoadBalancer>;
    async fn delete_load_balancer(&self, name: &str) -> Result<()>;
    async fn create_listeners(&self, name: &str, listeners: Vec<Listener>) -> Result<()>;
    async fn delete_listeners(&self, name: &str, load_balancer_ports: Vec<i32>) -> Result<()>;
    async fn set_listener_certificate(&self, name: &str, port: i32, certificate_id: &str) -> Result<()>;
    async fn register_vms(&self, name: &str, vm_ids: Vec<String>) -> Result<()>;
    async fn deregister_vms(&self, name: &str, vm_ids: Vec<String>) -> Result<()>;
    async fn configure_health_check(&self, name: &str, health_check: HealthCheck) -> Result<()>;
    async fn update_attributes(&self, name: &str, update: AttributeUpdate) -> Result<()>;
    async fn create_proxy_protocol_policy(&self, name: &str, policy_name: &str) -> Result<()>;
    async fn set_backend_policies(
        &self,
        name: &str,
        backend_port: i32,
        policy_names: Vec<String>,
    ) -> Result<()>;

    // Security groups
    async fn read_security_groups(&self, filter: &SecurityGroupFilter) -> Result<Vec<SecurityGroup>>;
    async fn create_security_group(
        &self,
        name: &str,
        description: &str,
        net_id: &str,
    ) -> Result<SecurityGroup>;
    async fn delete_security_group(&self, id: &str) -> Result<()>;
    async fn create_security_group_rule(&self, group_id: &str, rule: SecurityGroupRule) -> Result<()>;
    async fn delete_security_group_rule(&self, group_id: &str, rule: SecurityGroupRule) -> Result<()>;

    // Network layout
    async fn read_subnets(&self, filter: &SubnetFilter) -> Result<Vec<Subnet>>;
    async fn read_route_tables(&self, net_id: &str) -> Result<Vec<RouteTable>>;

    // Tags
    async fn create_tags(&self, resource_ids: Vec<String>, tags: Tags) -> Result<()>;
    /// Remove tag keys; absent keys are ignored
    async fn delete_tags(&self, resource_ids: Vec<String>, keys: Vec<String>) -> Result<()>;

    // Public IPs
    async fn read_public_ips(&self, filter: &PublicIpFilter) -> Result<Vec<PublicIp>>;
    async fn allocate_public_ip(&self, tags: Tags) -> Result<PublicIp>;
    async fn release_public_ip(&self, id: &str) -> Result<()>;
    async fn link_public_ip(&self, public_ip_id: &str, nic_id: &str) -> Result<()>;
    async fn unlink_public_ip(&self, public_ip_id: &str) -> Result<()>;

    // Network interfaces
    async fn read_network_interface_by_name(&self, name: &str) -> Result<Option<NetworkInterface>>;
    async fn create_network_interface(&self, request: CreateNicRequest) -> Result<NetworkInterface>;
    async fn delete_network_interface(&self, id: &str) -> Result<()>;
    async fn link_network_interface(&self, nic_id: &str, vm_id: &str) -> Result<()>;
    async fn unlink_network_interface(&self, nic_id: &str) -> Result<()>;
}

// =============================================================================
// Node Directory Port
// =============================================================================

/// Port answering "which VMs back these nodes"
#[async_trait]
pub trait NodeDirectory: Send + Sync {
    /// VM records for the given nodes; unknown nodes are skipped
    async fn vms_for_nodes(&self, nodes: &[NodeRef]) -> Result<Vec<Vm>>;
}

// =============================================================================
// Name Resolution Port
// =============================================================================

/// Port for hostname to address resolution
#[async_trait]
pub trait NameResolver: Send + Sync {
    async fn resolve(&self, host: &str) -> Result<Vec<IpAddr>>;
}

// =============================================================================
// Backend Strategy Port
// =============================================================================

/// Contract shared by the classic and VIP backends.
///
/// Every call works on one instance of a (possibly multi-instance) spec; the
/// controller loops over instances.
#[async_trait]
pub trait LoadBalancerBackend: Send + Sync {
    /// Which discriminant this backend serves
    fn kind(&self) -> LoadBalancerType;

    /// Tags of the live resource, or `None` if it does not exist
    async fn exists(&self, instance: &InstanceSpec<'_>) -> Result<Option<Tags>>;

    /// Current ingress of the live resource, or `None` if it does not exist
    async fn get(&self, spec: &LoadBalancerSpec, instance: &InstanceSpec<'_>) -> Result<Option<Ingress>>;

    /// Create the resource and run the full convergence pipeline
    async fn create(
        &self,
        spec: &LoadBalancerSpec,
        instance: &InstanceSpec<'_>,
        vms: &[Vm],
    ) -> Result<Readiness<Ingress>>;

    /// Converge an existing resource
    async fn update(
        &self,
        spec: &LoadBalancerSpec,
        instance: &InstanceSpec<'_>,
        vms: &[Vm],
    ) -> Result<Readiness<Ingress>>;

    /// Tear the resource down; a missing resource is not an error. The
    /// shared front-end group is left for the caller to release.
    async fn delete(&self, spec: &LoadBalancerSpec, instance: &InstanceSpec<'_>) -> Result<()>;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type CloudApiRef = Arc<dyn CloudApi>;
pub type NodeDirectoryRef = Arc<dyn NodeDirectory>;
pub type NameResolverRef = Arc<dyn NameResolver>;
pub type LoadBalancerBackendRef = Arc<dyn LoadBalancerBackend>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_balancer_type_parse() {
        assert_eq!("vip".parse::<LoadBalancerType>(), Ok(LoadBalancerType::Vip));
        assert_eq!("LBU".parse::<LoadBalancerType>(), Ok(LoadBalancerType::Lbu));
        assert!("nlb".parse::<LoadBalancerType>().is_err());
        assert_eq!(format!("{}", LoadBalancerType::Vip), "vip");
    }

    #[test]
    fn test_readiness_requeue() {
        let ready: Readiness<u8> = Readiness::Ready(1);
        assert!(ready.requeue_action().is_none());

        let waiting: Readiness<u8> = Readiness::not_ready(Duration::from_secs(30), "no dns");
        assert!(!waiting.is_ready());
        assert_eq!(
            waiting.requeue_action(),
            Some(kube::runtime::controller::Action::requeue(Duration::from_secs(30)))
        );
    }
}
