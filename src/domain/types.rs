//! Cloud entity types
//!
//! Request/response shapes exchanged with the cloud API and the node
//! directory. Only the fields the reconciliation engine reads or writes are
//! modelled.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Resource tags (key -> value)
pub type Tags = BTreeMap<String, String>;

// =============================================================================
// Security Groups
// =============================================================================

/// A single inbound rule on a security group.
///
/// A rule admits traffic either from CIDR ranges or from members of other
/// security groups (membership rule). Both lists may be populated on read.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroupRule {
    /// Protocol name (`tcp`, `udp`, or `-1` for all)
    pub protocol: String,
    pub from_port: i32,
    pub to_port: i32,
    /// Admitted CIDR ranges
    #[serde(default)]
    pub ip_ranges: Vec<String>,
    /// Admitted member security group ids
    #[serde(default)]
    pub member_groups: Vec<String>,
}

impl SecurityGroupRule {
    /// Build a single-port tcp rule carrying CIDR principals
    pub fn tcp_cidrs(port: i32, ip_ranges: Vec<String>) -> Self {
        Self {
            protocol: "tcp".to_string(),
            from_port: port,
            to_port: port,
            ip_ranges,
            member_groups: Vec::new(),
        }
    }

    /// Build a single-port tcp rule carrying member group principals
    pub fn tcp_members(port: i32, member_groups: Vec<String>) -> Self {
        Self {
            protocol: "tcp".to_string(),
            from_port: port,
            to_port: port,
            ip_ranges: Vec::new(),
            member_groups,
        }
    }

    /// Whether this rule covers exactly one port with the given protocol
    pub fn matches_port(&self, protocol: &str, port: i32) -> bool {
        self.protocol.eq_ignore_ascii_case(protocol) && self.from_port == port && self.to_port == port
    }
}

/// A cloud firewall object
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroup {
    pub id: String,
    pub name: String,
    pub net_id: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Tags,
    #[serde(default)]
    pub inbound_rules: Vec<SecurityGroupRule>,
}

/// Filter for security group reads; empty fields do not constrain
#[derive(Debug, Clone, Default)]
pub struct SecurityGroupFilter {
    pub ids: Vec<String>,
    pub names: Vec<String>,
    pub net_id: Option<String>,
    /// Groups must carry every one of these tag keys
    pub tag_keys: Vec<String>,
}

// =============================================================================
// Network Layout
// =============================================================================

/// A subnet inside a net (VPC)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    pub id: String,
    pub net_id: String,
    pub subregion: String,
    #[serde(default)]
    pub tags: Tags,
}

impl Subnet {
    /// Value of the `Name` tag, empty if missing
    pub fn name_tag(&self) -> &str {
        self.tags.get("Name").map(String::as_str).unwrap_or("")
    }
}

/// Filter for subnet reads; empty fields do not constrain
#[derive(Debug, Clone, Default)]
pub struct SubnetFilter {
    pub ids: Vec<String>,
    pub net_id: Option<String>,
    pub tag_keys: Vec<String>,
}

/// A single route in a route table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub destination: String,
    /// Internet gateway id when the route targets one
    #[serde(default)]
    pub gateway_id: Option<String>,
}

/// A route table and the subnets explicitly linked to it
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteTable {
    pub id: String,
    pub net_id: String,
    /// Main table of the net, used by subnets without an explicit link
    #[serde(default)]
    pub main: bool,
    #[serde(default)]
    pub subnet_ids: Vec<String>,
    #[serde(default)]
    pub routes: Vec<Route>,
}

impl RouteTable {
    /// Whether the table routes the default destination to an internet gateway
    pub fn has_internet_route(&self) -> bool {
        self.routes.iter().any(|r| {
            r.destination == "0.0.0.0/0"
                && r.gateway_id
                    .as_deref()
                    .map(|g| g.starts_with("igw-"))
                    .unwrap_or(false)
        })
    }
}

// =============================================================================
// Virtual Machines
// =============================================================================

/// VM lifecycle state as reported by the directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VmState {
    Pending,
    Running,
    Stopping,
    Stopped,
    ShuttingDown,
    Terminated,
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VmState::Pending => write!(f, "pending"),
            VmState::Running => write!(f, "running"),
            VmState::Stopping => write!(f, "stopping"),
            VmState::Stopped => write!(f, "stopped"),
            VmState::ShuttingDown => write!(f, "shutting-down"),
            VmState::Terminated => write!(f, "terminated"),
        }
    }
}

/// Reference to a security group attached to a VM
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroupRef {
    pub id: String,
    pub name: String,
}

/// A backend VM record (read-only to this crate)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vm {
    pub id: String,
    pub node_name: String,
    pub state: VmState,
    pub subregion: String,
    pub subnet_id: String,
    pub net_id: String,
    #[serde(default)]
    pub security_groups: Vec<SecurityGroupRef>,
}

impl Vm {
    pub fn is_running(&self) -> bool {
        self.state == VmState::Running
    }
}

/// A Kubernetes node as handed over by the controller runtime
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeRef {
    pub name: String,
    #[serde(default)]
    pub provider_id: Option<String>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl NodeRef {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// VM id carried by the provider id (`aws:///<zone>/<vm-id>` style)
    pub fn vm_id(&self) -> Option<&str> {
        self.provider_id
            .as_deref()
            .and_then(|p| p.rsplit('/').next())
            .filter(|id| !id.is_empty())
    }
}

// =============================================================================
// Classic Load Balancers
// =============================================================================

/// A listener on a classic load balancer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Listener {
    pub load_balancer_port: i32,
    pub load_balancer_protocol: String,
    pub backend_port: i32,
    pub backend_protocol: String,
    #[serde(default)]
    pub server_certificate_id: Option<String>,
}

impl Listener {
    /// Listener identity: ports plus case-insensitive protocols
    pub fn same_as(&self, other: &Listener) -> bool {
        self.load_balancer_port == other.load_balancer_port
            && self.backend_port == other.backend_port
            && self
                .load_balancer_protocol
                .eq_ignore_ascii_case(&other.load_balancer_protocol)
            && self
                .backend_protocol
                .eq_ignore_ascii_case(&other.backend_protocol)
    }
}

/// Policies attached to one backend port
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendPolicy {
    pub backend_port: i32,
    #[serde(default)]
    pub policy_names: Vec<String>,
}

/// Health check of a classic load balancer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub interval: i32,
    pub timeout: i32,
    pub healthy_threshold: i32,
    pub unhealthy_threshold: i32,
    pub port: i32,
    pub protocol: String,
    #[serde(default)]
    pub path: Option<String>,
}

/// Access log settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessLog {
    pub enabled: bool,
    pub emit_interval: i32,
    #[serde(default)]
    pub bucket_name: String,
    #[serde(default)]
    pub bucket_prefix: String,
}

/// Connection draining and idle settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSettings {
    pub draining_enabled: bool,
    pub draining_timeout: i32,
    pub idle_timeout: i32,
}

/// Load balancer attribute blocks
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerAttributes {
    #[serde(default)]
    pub access_log: Option<AccessLog>,
    #[serde(default)]
    pub connection: Option<ConnectionSettings>,
}

/// One attribute block to write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttributeUpdate {
    AccessLog(AccessLog),
    Connection(ConnectionSettings),
}

/// A classic load balancer as read from the cloud
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancer {
    pub name: String,
    #[serde(default)]
    pub dns_name: Option<String>,
    #[serde(default)]
    pub public_ip: Option<String>,
    pub internal: bool,
    #[serde(default)]
    pub subnets: Vec<String>,
    #[serde(default)]
    pub security_groups: Vec<String>,
    #[serde(default)]
    pub listeners: Vec<Listener>,
    #[serde(default)]
    pub backend_policies: Vec<BackendPolicy>,
    #[serde(default)]
    pub health_check: Option<HealthCheck>,
    #[serde(default)]
    pub attributes: LoadBalancerAttributes,
    #[serde(default)]
    pub backend_vm_ids: Vec<String>,
    #[serde(default)]
    pub tags: Tags,
}

/// Request to create a classic load balancer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateLoadBalancerRequest {
    pub name: String,
    pub internal: bool,
    pub subnets: Vec<String>,
    pub security_groups: Vec<String>,
    pub listeners: Vec<Listener>,
    pub public_ip_id: Option<String>,
    pub tags: Tags,
}

// =============================================================================
// VIP Resources
// =============================================================================

/// A floating network interface
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub id: String,
    pub subnet_id: String,
    pub subregion: String,
    #[serde(default)]
    pub private_ip: Option<String>,
    #[serde(default)]
    pub private_dns_name: Option<String>,
    #[serde(default)]
    pub public_ip: Option<String>,
    #[serde(default)]
    pub security_groups: Vec<String>,
    /// VM the interface is currently bound to
    #[serde(default)]
    pub linked_vm_id: Option<String>,
    #[serde(default)]
    pub tags: Tags,
}

/// Request to create a network interface
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateNicRequest {
    pub subnet_id: String,
    pub security_groups: Vec<String>,
    pub description: String,
    pub tags: Tags,
}

/// A public IP address
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicIp {
    pub id: String,
    pub address: String,
    #[serde(default)]
    pub linked_nic_id: Option<String>,
    /// Set when the address is attached to a classic load balancer
    #[serde(default)]
    pub linked_load_balancer: Option<String>,
    #[serde(default)]
    pub tags: Tags,
}

impl PublicIp {
    pub fn is_free(&self) -> bool {
        self.linked_nic_id.is_none() && self.linked_load_balancer.is_none()
    }
}

/// Filter for public IP reads
#[derive(Debug, Clone, Default)]
pub struct PublicIpFilter {
    pub ids: Vec<String>,
    /// Only addresses from this pool
    pub pool: Option<String>,
}
