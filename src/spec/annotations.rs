//! Service annotation decoding
//!
//! Annotations are decoded through an explicit table mapping each key to a
//! parser that fills one field of [`RawAnnotations`]. Legacy keys are first
//! rewritten onto their current name. Unknown annotations are ignored.

use crate::domain::ports::LoadBalancerType;
use crate::error::{Error, Result};
use crate::spec::{IngressAddress, IpMode, PortSelector};
use std::collections::BTreeMap;
use tracing::debug;

/// Prefix shared by every annotation this controller reads
pub const ANNOTATION_PREFIX: &str = "service.beta.kubernetes.io/osc-load-balancer-";

/// Prefix of the legacy annotation keys still accepted
pub const LEGACY_ANNOTATION_PREFIX: &str = "service.beta.kubernetes.io/aws-load-balancer-";

/// Legacy key suffix -> current key suffix
pub const LEGACY_ALIASES: &[(&str, &str)] = &[
    ("name", "name"),
    ("internal", "internal"),
    ("subnets", "subnet-id"),
    ("security-groups", "security-group"),
    ("extra-security-groups", "extra-security-groups"),
    ("additional-resource-tags", "additional-resource-tags"),
    ("target-node-labels", "target-node-labels"),
    ("backend-protocol", "backend-protocol"),
    ("proxy-protocol", "proxy-protocol"),
    ("ssl-cert", "ssl-cert"),
    ("ssl-ports", "ssl-ports"),
    ("healthcheck-interval", "healthcheck-interval"),
    ("healthcheck-timeout", "healthcheck-timeout"),
    ("healthcheck-healthy-threshold", "healthcheck-healthy-threshold"),
    ("healthcheck-unhealthy-threshold", "healthcheck-unhealthy-threshold"),
    ("healthcheck-port", "healthcheck-port"),
    ("healthcheck-protocol", "healthcheck-protocol"),
    ("healthcheck-path", "healthcheck-path"),
    ("access-log-enabled", "access-log-enabled"),
    ("access-log-emit-interval", "access-log-emit-interval"),
    ("access-log-s3-bucket-name", "access-log-bucket-name"),
    ("access-log-s3-bucket-prefix", "access-log-bucket-prefix"),
    ("connection-draining-enabled", "connection-draining-enabled"),
    ("connection-draining-timeout", "connection-draining-timeout"),
    ("connection-idle-timeout", "connection-idle-timeout"),
];

// =============================================================================
// Raw Annotations
// =============================================================================

/// Decoded annotation values; `None` means "not set"
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawAnnotations {
    pub lb_type: Option<LoadBalancerType>,
    pub names: Option<Vec<String>>,
    pub internal: Option<bool>,
    pub instances: Option<usize>,
    pub subregions: Option<Vec<String>>,
    pub ip_pool: Option<String>,
    pub public_ip_ids: Option<Vec<String>>,
    pub subnet_ids: Option<Vec<String>>,
    pub security_groups: Option<Vec<String>>,
    pub extra_security_groups: Option<Vec<String>>,
    pub target_role: Option<String>,
    pub target_node_labels: Option<BTreeMap<String, String>>,
    pub additional_tags: Option<BTreeMap<String, String>>,
    pub ingress_address: Option<IngressAddress>,
    pub ip_mode: Option<IpMode>,
    pub backend_protocol: Option<String>,
    pub proxy_protocol: Option<PortSelector>,
    pub ssl_cert: Option<String>,
    pub ssl_ports: Option<PortSelector>,
    pub hc_interval: Option<i32>,
    pub hc_timeout: Option<i32>,
    pub hc_healthy_threshold: Option<i32>,
    pub hc_unhealthy_threshold: Option<i32>,
    pub hc_port: Option<i32>,
    pub hc_protocol: Option<String>,
    pub hc_path: Option<String>,
    pub access_log_enabled: Option<bool>,
    pub access_log_emit_interval: Option<i32>,
    pub access_log_bucket_name: Option<String>,
    pub access_log_bucket_prefix: Option<String>,
    pub draining_enabled: Option<bool>,
    pub draining_timeout: Option<i32>,
    pub idle_timeout: Option<i32>,
}

type Setter = fn(&mut RawAnnotations, &str) -> std::result::Result<(), String>;

/// Key suffix -> field setter
const ANNOTATION_TABLE: &[(&str, Setter)] = &[
    ("type", |r, v| Ok(r.lb_type = Some(v.parse()?))),
    ("name", |r, v| Ok(r.names = Some(parse_list(v)))),
    ("internal", |r, v| Ok(r.internal = Some(parse_bool(v)?))),
    ("instances", |r, v| Ok(r.instances = Some(parse_int(v)?))),
    ("subregions", |r, v| Ok(r.subregions = Some(parse_list(v)))),
    ("ip-pool", |r, v| Ok(r.ip_pool = non_empty(v))),
    ("ip-id", |r, v| Ok(r.public_ip_ids = Some(parse_list(v)))),
    ("subnet-id", |r, v| Ok(r.subnet_ids = Some(parse_list(v)))),
    ("security-group", |r, v| Ok(r.security_groups = Some(parse_list(v)))),
    ("extra-security-groups", |r, v| Ok(r.extra_security_groups = Some(parse_list(v)))),
    ("target-role", |r, v| Ok(r.target_role = non_empty(v))),
    ("target-node-labels", |r, v| Ok(r.target_node_labels = Some(parse_map(v)?))),
    ("additional-resource-tags", |r, v| Ok(r.additional_tags = Some(parse_map(v)?))),
    ("ingress-address", |r, v| Ok(r.ingress_address = Some(v.parse()?))),
    ("ingress-ipmode", |r, v| Ok(r.ip_mode = Some(v.parse()?))),
    ("backend-protocol", |r, v| Ok(r.backend_protocol = Some(parse_protocol(v)?))),
    ("proxy-protocol", |r, v| Ok(r.proxy_protocol = Some(v.parse()?))),
    ("ssl-cert", |r, v| Ok(r.ssl_cert = non_empty(v))),
    ("ssl-ports", |r, v| Ok(r.ssl_ports = Some(v.parse()?))),
    ("healthcheck-interval", |r, v| Ok(r.hc_interval = Some(parse_int(v)?))),
    ("healthcheck-timeout", |r, v| Ok(r.hc_timeout = Some(parse_int(v)?))),
    ("healthcheck-healthy-threshold", |r, v| Ok(r.hc_healthy_threshold = Some(parse_int(v)?))),
    ("healthcheck-unhealthy-threshold", |r, v| Ok(r.hc_unhealthy_threshold = Some(parse_int(v)?))),
    ("healthcheck-port", |r, v| Ok(r.hc_port = Some(parse_int(v)?))),
    ("healthcheck-protocol", |r, v| Ok(r.hc_protocol = Some(parse_protocol(v)?))),
    ("healthcheck-path", |r, v| Ok(r.hc_path = non_empty(v))),
    ("access-log-enabled", |r, v| Ok(r.access_log_enabled = Some(parse_bool(v)?))),
    ("access-log-emit-interval", |r, v| Ok(r.access_log_emit_interval = Some(parse_int(v)?))),
    ("access-log-bucket-name", |r, v| Ok(r.access_log_bucket_name = non_empty(v))),
    ("access-log-bucket-prefix", |r, v| Ok(r.access_log_bucket_prefix = non_empty(v))),
    ("connection-draining-enabled", |r, v| Ok(r.draining_enabled = Some(parse_bool(v)?))),
    ("connection-draining-timeout", |r, v| Ok(r.draining_timeout = Some(parse_int(v)?))),
    ("connection-idle-timeout", |r, v| Ok(r.idle_timeout = Some(parse_int(v)?))),
];

/// Rewrite legacy keys onto current ones; a current key always wins
pub fn apply_legacy_aliases(annotations: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    let mut out = annotations.clone();
    for (legacy, current) in LEGACY_ALIASES {
        let legacy_key = format!("{}{}", LEGACY_ANNOTATION_PREFIX, legacy);
        let current_key = format!("{}{}", ANNOTATION_PREFIX, current);
        if let Some(value) = annotations.get(&legacy_key) {
            if !out.contains_key(&current_key) {
                debug!(legacy = %legacy_key, current = %current_key, "Mapping legacy annotation");
                out.insert(current_key, value.clone());
            }
        }
    }
    out
}

/// Decode every known annotation
pub fn decode_annotations(annotations: &BTreeMap<String, String>) -> Result<RawAnnotations> {
    let annotations = apply_legacy_aliases(annotations);
    let mut raw = RawAnnotations::default();

    for (suffix, setter) in ANNOTATION_TABLE {
        let key = format!("{}{}", ANNOTATION_PREFIX, suffix);
        if let Some(value) = annotations.get(&key) {
            setter(&mut raw, value.trim()).map_err(|reason| Error::InvalidAnnotation {
                key: key.clone(),
                reason,
            })?;
        }
    }

    Ok(raw)
}

// =============================================================================
// Value Parsers
// =============================================================================

fn non_empty(v: &str) -> Option<String> {
    if v.is_empty() {
        None
    } else {
        Some(v.to_string())
    }
}

fn parse_list(v: &str) -> Vec<String> {
    v.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_bool(v: &str) -> std::result::Result<bool, String> {
    match v.to_ascii_lowercase().as_str() {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(format!("expected true or false, got {:?}", other)),
    }
}

fn parse_int<T: std::str::FromStr>(v: &str) -> std::result::Result<T, String> {
    v.parse::<T>()
        .map_err(|_| format!("expected an integer, got {:?}", v))
}

fn parse_map(v: &str) -> std::result::Result<BTreeMap<String, String>, String> {
    let mut map = BTreeMap::new();
    for pair in parse_list(v) {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| format!("expected key=value, got {:?}", pair))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(format!("empty key in {:?}", pair));
        }
        map.insert(key.to_string(), value.trim().to_string());
    }
    Ok(map)
}

fn parse_protocol(v: &str) -> std::result::Result<String, String> {
    let lower = v.to_ascii_lowercase();
    match lower.as_str() {
        "tcp" | "ssl" | "http" | "https" => Ok(lower),
        _ => Err(format!("expected tcp, ssl, http or https, got {:?}", v)),
    }
}
