//! Load balancer spec
//!
//! The typed, validated description of what a Service asks for, built once
//! per reconcile by [`SpecBuilder`] from the Service's ports and annotations.

pub mod annotations;
pub mod builder;
pub mod defaults;

pub use annotations::*;
pub use builder::*;
pub use defaults::*;

use crate::domain::ports::LoadBalancerType;
use crate::domain::types::{AccessLog, ConnectionSettings, HealthCheck, Tags};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Maximum load balancer name length accepted by the cloud
pub const MAX_NAME_LEN: usize = 32;

// =============================================================================
// Enumerations
// =============================================================================

/// Which addresses are published in the Service status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IngressAddress {
    #[default]
    Hostname,
    Ip,
    Both,
}

impl IngressAddress {
    pub fn wants_ip(&self) -> bool {
        matches!(self, IngressAddress::Ip | IngressAddress::Both)
    }

    pub fn wants_hostname(&self) -> bool {
        matches!(self, IngressAddress::Hostname | IngressAddress::Both)
    }
}

impl std::str::FromStr for IngressAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hostname" => Ok(IngressAddress::Hostname),
            "ip" => Ok(IngressAddress::Ip),
            "both" => Ok(IngressAddress::Both),
            other => Err(format!("expected hostname, ip or both, got {:?}", other)),
        }
    }
}

/// How kube-proxy treats the published IP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IpMode {
    #[serde(rename = "VIP")]
    Vip,
    Proxy,
}

impl std::fmt::Display for IpMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IpMode::Vip => write!(f, "VIP"),
            IpMode::Proxy => write!(f, "Proxy"),
        }
    }
}

impl std::str::FromStr for IpMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "vip" => Ok(IpMode::Vip),
            "proxy" => Ok(IpMode::Proxy),
            other => Err(format!("expected VIP or Proxy, got {:?}", other)),
        }
    }
}

/// Role used to pick the backend security group
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TargetRole {
    #[default]
    Worker,
    ControlPlane,
    Other(String),
}

impl TargetRole {
    pub fn as_str(&self) -> &str {
        match self {
            TargetRole::Worker => "worker",
            TargetRole::ControlPlane => "controlplane",
            TargetRole::Other(role) => role,
        }
    }
}

impl From<&str> for TargetRole {
    fn from(s: &str) -> Self {
        match s {
            "worker" => TargetRole::Worker,
            "controlplane" | "control-plane" => TargetRole::ControlPlane,
            other => TargetRole::Other(other.to_string()),
        }
    }
}

/// A set of ports selected by an annotation (`*` selects every port)
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PortSelector {
    #[default]
    None,
    All,
    Ports(BTreeSet<i32>),
}

impl PortSelector {
    pub fn contains(&self, port: i32) -> bool {
        match self {
            PortSelector::None => false,
            PortSelector::All => true,
            PortSelector::Ports(ports) => ports.contains(&port),
        }
    }
}

impl std::str::FromStr for PortSelector {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s.is_empty() {
            return Ok(PortSelector::None);
        }
        if s == "*" {
            return Ok(PortSelector::All);
        }
        let ports = s
            .split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| p.parse::<i32>().map_err(|_| format!("invalid port {:?}", p)))
            .collect::<Result<BTreeSet<_>, _>>()?;
        Ok(PortSelector::Ports(ports))
    }
}

// =============================================================================
// Spec Blocks
// =============================================================================

/// Desired health check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    pub interval: i32,
    pub timeout: i32,
    pub healthy_threshold: i32,
    pub unhealthy_threshold: i32,
    pub port: i32,
    /// Lowercase protocol: tcp, ssl, http or https
    pub protocol: String,
    pub path: Option<String>,
}

impl HealthCheckSpec {
    pub fn uses_path(&self) -> bool {
        matches!(self.protocol.as_str(), "http" | "https")
    }

    /// Cloud representation
    pub fn to_health_check(&self) -> HealthCheck {
        HealthCheck {
            interval: self.interval,
            timeout: self.timeout,
            healthy_threshold: self.healthy_threshold,
            unhealthy_threshold: self.unhealthy_threshold,
            port: self.port,
            protocol: self.protocol.to_ascii_uppercase(),
            path: if self.uses_path() {
                self.path.clone()
            } else {
                None
            },
        }
    }
}

/// Desired connection handling
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionSpec {
    pub draining: bool,
    pub draining_timeout: i32,
    pub idle_timeout: i32,
}

impl ConnectionSpec {
    pub fn to_settings(&self) -> ConnectionSettings {
        ConnectionSettings {
            draining_enabled: self.draining,
            draining_timeout: self.draining_timeout,
            idle_timeout: self.idle_timeout,
        }
    }
}

/// Desired access logging
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessLogSpec {
    pub enabled: bool,
    pub emit_interval: i32,
    pub bucket_name: String,
    pub bucket_prefix: String,
}

impl AccessLogSpec {
    pub fn to_access_log(&self) -> AccessLog {
        AccessLog {
            enabled: self.enabled,
            emit_interval: self.emit_interval,
            bucket_name: self.bucket_name.clone(),
            bucket_prefix: self.bucket_prefix.clone(),
        }
    }
}

/// Defaults applied to every listener
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerDefaults {
    /// Lowercase backend protocol: tcp, ssl, http or https
    pub backend_protocol: String,
    pub proxy_protocol_ports: PortSelector,
    pub ssl_certificate: Option<String>,
    pub ssl_ports: PortSelector,
}

/// One service port exposed through the load balancer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerSpec {
    pub port: i32,
    pub backend_port: i32,
}

// =============================================================================
// Load Balancer Spec
// =============================================================================

/// Normalized, validated desired state for one Service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerSpec {
    pub lb_type: LoadBalancerType,
    /// One name per instance
    pub names: Vec<String>,
    /// `<namespace>/<name>` of the Service
    pub service_name: String,
    pub internal: bool,
    pub instances: usize,
    pub subregions: Vec<String>,
    pub ip_pool: Option<String>,
    pub public_ip_ids: Vec<String>,
    pub subnet_ids: Vec<String>,
    pub security_groups: BTreeSet<String>,
    pub additional_security_groups: BTreeSet<String>,
    pub target_role: TargetRole,
    pub target_node_labels: BTreeMap<String, String>,
    pub tags: Tags,
    pub health_check: Option<HealthCheckSpec>,
    pub connection: ConnectionSpec,
    pub listener_defaults: ListenerDefaults,
    pub listeners: Vec<ListenerSpec>,
    /// Normalized CIDRs, sorted
    pub allow_from: BTreeSet<String>,
    pub access_log: AccessLogSpec,
    pub ingress_address: IngressAddress,
    pub ip_mode: Option<IpMode>,
}

/// Per-instance view of a spec
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InstanceSpec<'a> {
    pub index: usize,
    pub name: &'a str,
    pub subregion: Option<&'a str>,
    pub public_ip_id: Option<&'a str>,
    pub subnet_id: Option<&'a str>,
}

impl LoadBalancerSpec {
    /// View of instance `index`
    pub fn instance(&self, index: usize) -> InstanceSpec<'_> {
        InstanceSpec {
            index,
            name: &self.names[index],
            subregion: self.subregions.get(index).map(String::as_str),
            public_ip_id: self.public_ip_ids.get(index).map(String::as_str),
            subnet_id: self.subnet_ids.get(index).map(String::as_str),
        }
    }

    /// Views of every instance, in index order
    pub fn instance_specs(&self) -> impl Iterator<Item = InstanceSpec<'_>> {
        (0..self.instances).map(move |i| self.instance(i))
    }

    /// Whether the front-end security group is managed by the controller
    pub fn manages_security_group(&self) -> bool {
        self.security_groups.is_empty()
    }

    /// Backend ports in listener order, deduplicated
    pub fn backend_ports(&self) -> BTreeSet<i32> {
        self.listeners.iter().map(|l| l.backend_port).collect()
    }

    /// Front-end ports, deduplicated
    pub fn frontend_ports(&self) -> BTreeSet<i32> {
        self.listeners.iter().map(|l| l.port).collect()
    }

    /// Whether any listener's backend port carries proxy protocol
    pub fn wants_proxy_protocol(&self) -> bool {
        self.listeners
            .iter()
            .any(|l| self.listener_defaults.proxy_protocol_ports.contains(l.backend_port))
    }
}
