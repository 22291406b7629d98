//! Spec defaults
//!
//! An immutable defaults value built once at startup and handed to the
//! [`SpecBuilder`](super::SpecBuilder). Defaults fill every field the
//! Service leaves unset (or sets to zero).

use crate::domain::ports::LoadBalancerType;
use crate::domain::types::Tags;
use crate::spec::{AccessLogSpec, ConnectionSpec, IngressAddress, PortSelector, TargetRole};

/// Health check defaults
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckDefaults {
    pub interval: i32,
    pub timeout: i32,
    pub healthy_threshold: i32,
    pub unhealthy_threshold: i32,
    /// Path used by http/https checks when none is given
    pub path: String,
    /// Path used for the Service's own node health check
    pub node_health_path: String,
}

impl Default for HealthCheckDefaults {
    fn default() -> Self {
        Self {
            interval: 10,
            timeout: 5,
            healthy_threshold: 2,
            unhealthy_threshold: 2,
            path: "/".to_string(),
            node_health_path: "/healthz".to_string(),
        }
    }
}

/// Defaults applied while building a spec
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecDefaults {
    /// Cluster the controller runs for
    pub cluster_id: String,
    /// Operator-supplied tags added to every resource
    pub tags: Tags,
    pub lb_type: LoadBalancerType,
    pub backend_protocol: String,
    pub ssl_ports: PortSelector,
    pub proxy_protocol_ports: PortSelector,
    pub health_check: HealthCheckDefaults,
    pub connection: ConnectionSpec,
    pub access_log: AccessLogSpec,
    pub target_role: TargetRole,
    pub allow_from: Vec<String>,
    pub ingress_address: IngressAddress,
}

impl Default for SpecDefaults {
    fn default() -> Self {
        Self {
            cluster_id: String::new(),
            tags: Tags::new(),
            lb_type: LoadBalancerType::Lbu,
            backend_protocol: "tcp".to_string(),
            ssl_ports: PortSelector::All,
            proxy_protocol_ports: PortSelector::None,
            health_check: HealthCheckDefaults::default(),
            connection: ConnectionSpec {
                draining: false,
                draining_timeout: 0,
                idle_timeout: 60,
            },
            access_log: AccessLogSpec {
                enabled: false,
                emit_interval: 60,
                bucket_name: String::new(),
                bucket_prefix: String::new(),
            },
            target_role: TargetRole::Worker,
            allow_from: vec!["0.0.0.0/0".to_string()],
            ingress_address: IngressAddress::Hostname,
        }
    }
}

impl SpecDefaults {
    /// Defaults for a cluster
    pub fn for_cluster(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            ..Default::default()
        }
    }

    /// Add operator tags
    pub fn with_tags(mut self, tags: Tags) -> Self {
        self.tags.extend(tags);
        self
    }
}

/// Take `value` unless it is unset or zero
pub(crate) fn or_default<T: Default + PartialEq + Copy>(value: Option<T>, default: T) -> T {
    match value {
        Some(v) if v != T::default() => v,
        _ => default,
    }
}
