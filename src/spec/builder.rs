//! Spec builder
//!
//! Turns a Service (ports, annotations, UID) into a validated
//! [`LoadBalancerSpec`]. Every validation happens here, before any cloud
//! call is issued.

use crate::domain::tags::ownership_tags;
use crate::error::{Error, Result};
use crate::spec::annotations::{decode_annotations, RawAnnotations};
use crate::spec::defaults::{or_default, SpecDefaults};
use crate::spec::*;
use ipnet::IpNet;
use k8s_openapi::api::core::v1::Service;
use std::collections::BTreeSet;
use tracing::debug;

/// Builds [`LoadBalancerSpec`]s against a fixed set of defaults
#[derive(Debug, Clone)]
pub struct SpecBuilder {
    defaults: SpecDefaults,
}

impl SpecBuilder {
    pub fn new(defaults: SpecDefaults) -> Self {
        Self { defaults }
    }

    pub fn defaults(&self) -> &SpecDefaults {
        &self.defaults
    }

    /// `<namespace>/<name>` of a Service
    pub fn service_name(service: &Service) -> String {
        format!(
            "{}/{}",
            service.metadata.namespace.as_deref().unwrap_or("default"),
            service.metadata.name.as_deref().unwrap_or_default()
        )
    }

    /// Build the desired state of a Service
    pub fn build(&self, service: &Service) -> Result<LoadBalancerSpec> {
        let service_name = Self::service_name(service);
        let svc = service
            .spec
            .as_ref()
            .ok_or_else(|| Error::InvalidService(format!("{} has no spec", service_name)))?;

        if let Some(affinity) = svc.session_affinity.as_deref() {
            if affinity != "None" {
                return Err(Error::InvalidService(format!(
                    "unsupported session affinity {:?}",
                    affinity
                )));
            }
        }

        let ports = svc.ports.as_deref().unwrap_or_default();
        if ports.is_empty() {
            return Err(Error::InvalidService(
                "load balancer requires at least one port".into(),
            ));
        }

        if svc.load_balancer_ip.as_deref().map_or(false, |ip| !ip.is_empty()) {
            return Err(Error::InvalidService(
                "spec.loadBalancerIP is not supported, use the ip-id annotation".into(),
            ));
        }

        let annotations = service.metadata.annotations.clone().unwrap_or_default();
        let raw = decode_annotations(&annotations)?;

        let mut listeners = Vec::new();
        for port in ports {
            let node_port = port.node_port.unwrap_or(0);
            if node_port == 0 {
                continue;
            }
            let protocol = port.protocol.as_deref().unwrap_or("TCP");
            if !protocol.eq_ignore_ascii_case("TCP") {
                debug!(service = %service_name, port = port.port, protocol, "Skipping non-TCP port");
                continue;
            }
            listeners.push(ListenerSpec {
                port: port.port,
                backend_port: node_port,
            });
        }

        let instances = raw.instances.unwrap_or(1);
        if instances == 0 {
            return Err(Error::InvalidAnnotation {
                key: format!("{}instances", ANNOTATION_PREFIX),
                reason: "must be at least 1".into(),
            });
        }

        let subregions = per_instance("subregions", raw.subregions.clone(), instances)?;
        let public_ip_ids = per_instance("ip-id", raw.public_ip_ids.clone(), instances)?;
        let subnet_ids = per_instance("subnet-id", raw.subnet_ids.clone(), instances)?;

        let uid = service.metadata.uid.as_deref().unwrap_or_default();
        let names = build_names(raw.names.as_deref(), uid, instances)?;

        let health_check = self.health_check(&raw, service, &listeners);

        let ingress_address = raw
            .ingress_address
            .unwrap_or(self.defaults.ingress_address);
        let ip_mode = match raw.ip_mode {
            Some(mode) => Some(mode),
            None if ingress_address.wants_ip() => Some(IpMode::Proxy),
            None => None,
        };

        let mut tags = self.defaults.tags.clone();
        tags.extend(raw.additional_tags.clone().unwrap_or_default());
        tags.extend(ownership_tags(&self.defaults.cluster_id, &service_name));

        let allow_from = allowed_cidrs(
            svc.load_balancer_source_ranges.as_deref(),
            &self.defaults.allow_from,
        )?;

        let listener_defaults = ListenerDefaults {
            backend_protocol: raw
                .backend_protocol
                .clone()
                .unwrap_or_else(|| self.defaults.backend_protocol.clone()),
            proxy_protocol_ports: raw
                .proxy_protocol
                .clone()
                .unwrap_or_else(|| self.defaults.proxy_protocol_ports.clone()),
            ssl_certificate: raw.ssl_cert.clone(),
            ssl_ports: raw
                .ssl_ports
                .clone()
                .unwrap_or_else(|| self.defaults.ssl_ports.clone()),
        };

        let connection = ConnectionSpec {
            draining: raw.draining_enabled.unwrap_or(self.defaults.connection.draining),
            draining_timeout: or_default(
                raw.draining_timeout,
                self.defaults.connection.draining_timeout,
            ),
            idle_timeout: or_default(raw.idle_timeout, self.defaults.connection.idle_timeout),
        };

        let access_log = AccessLogSpec {
            enabled: raw
                .access_log_enabled
                .unwrap_or(self.defaults.access_log.enabled),
            emit_interval: or_default(
                raw.access_log_emit_interval,
                self.defaults.access_log.emit_interval,
            ),
            bucket_name: raw
                .access_log_bucket_name
                .clone()
                .unwrap_or_else(|| self.defaults.access_log.bucket_name.clone()),
            bucket_prefix: raw
                .access_log_bucket_prefix
                .clone()
                .unwrap_or_else(|| self.defaults.access_log.bucket_prefix.clone()),
        };

        let spec = LoadBalancerSpec {
            lb_type: raw.lb_type.unwrap_or(self.defaults.lb_type),
            names,
            service_name,
            internal: raw.internal.unwrap_or(false),
            instances,
            subregions,
            ip_pool: raw.ip_pool.clone(),
            public_ip_ids,
            subnet_ids,
            security_groups: raw.security_groups.clone().unwrap_or_default().into_iter().collect(),
            additional_security_groups: raw
                .extra_security_groups
                .clone()
                .unwrap_or_default()
                .into_iter()
                .collect(),
            target_role: raw
                .target_role
                .as_deref()
                .map(TargetRole::from)
                .unwrap_or_else(|| self.defaults.target_role.clone()),
            target_node_labels: raw.target_node_labels.clone().unwrap_or_default(),
            tags,
            health_check,
            connection,
            listener_defaults,
            listeners,
            allow_from,
            access_log,
            ingress_address,
            ip_mode,
        };

        debug!(
            service = %spec.service_name,
            names = ?spec.names,
            listeners = spec.listeners.len(),
            "Built load balancer spec"
        );

        Ok(spec)
    }

    /// Health check, by priority: explicit port+protocol, explicit port,
    /// the Service's own node health check, first listener, none.
    fn health_check(
        &self,
        raw: &RawAnnotations,
        service: &Service,
        listeners: &[ListenerSpec],
    ) -> Option<HealthCheckSpec> {
        let defaults = &self.defaults.health_check;
        let svc = service.spec.as_ref();

        let local_health = svc.and_then(|s| {
            let local = s.external_traffic_policy.as_deref() == Some("Local");
            s.health_check_node_port.filter(|p| local && *p != 0)
        });

        let (port, protocol, path) = match (raw.hc_port, raw.hc_protocol.as_deref()) {
            (Some(port), Some(protocol)) => (port, protocol.to_string(), raw.hc_path.clone()),
            (Some(port), None) => {
                let protocol = if raw.hc_path.is_some() { "http" } else { "tcp" };
                (port, protocol.to_string(), raw.hc_path.clone())
            }
            (None, _) => {
                if let Some(port) = local_health {
                    let path = raw
                        .hc_path
                        .clone()
                        .unwrap_or_else(|| defaults.node_health_path.clone());
                    (port, "http".to_string(), Some(path))
                } else if let Some(first) = listeners.first() {
                    let protocol = raw.hc_protocol.clone().unwrap_or_else(|| "tcp".to_string());
                    (first.backend_port, protocol, raw.hc_path.clone())
                } else {
                    return None;
                }
            }
        };

        let path = match protocol.as_str() {
            "http" | "https" => Some(path.unwrap_or_else(|| defaults.path.clone())),
            _ => None,
        };

        Some(HealthCheckSpec {
            interval: or_default(raw.hc_interval, defaults.interval),
            timeout: or_default(raw.hc_timeout, defaults.timeout),
            healthy_threshold: or_default(raw.hc_healthy_threshold, defaults.healthy_threshold),
            unhealthy_threshold: or_default(
                raw.hc_unhealthy_threshold,
                defaults.unhealthy_threshold,
            ),
            port,
            protocol,
            path,
        })
    }
}

/// Per-instance arrays are either unset or exactly `instances` long
fn per_instance(key: &str, values: Option<Vec<String>>, instances: usize) -> Result<Vec<String>> {
    let values = values.unwrap_or_default();
    if values.is_empty() || values.len() == instances {
        Ok(values)
    } else {
        Err(Error::InvalidAnnotation {
            key: format!("{}{}", ANNOTATION_PREFIX, key),
            reason: format!("expected {} values, got {}", instances, values.len()),
        })
    }
}

/// Suffix for instance `index`: `-a`, `-b`, ... `-z`, `-aa`, ...
pub fn instance_suffix(index: usize) -> String {
    let mut letters = Vec::new();
    let mut n = index;
    loop {
        letters.push((b'a' + (n % 26) as u8) as char);
        if n < 26 {
            break;
        }
        n = n / 26 - 1;
    }
    letters.reverse();
    format!("-{}", letters.into_iter().collect::<String>())
}

fn truncate(name: &str, len: usize) -> String {
    name.chars().take(len).collect()
}

fn suffixed(base: &str, instances: usize) -> Vec<String> {
    if instances == 1 {
        return vec![truncate(base, MAX_NAME_LEN)];
    }
    (0..instances)
        .map(|i| {
            let suffix = instance_suffix(i);
            format!("{}{}", truncate(base, MAX_NAME_LEN - suffix.len()), suffix)
        })
        .collect()
}

/// Derive or validate instance names
fn build_names(explicit: Option<&[String]>, uid: &str, instances: usize) -> Result<Vec<String>> {
    let names = match explicit {
        None | Some([]) => {
            let base: String = uid.chars().filter(|c| *c != '-').collect();
            if base.is_empty() {
                return Err(Error::InvalidService(
                    "service has no UID to derive a load balancer name from".into(),
                ));
            }
            suffixed(&base, instances)
        }
        Some(given) => {
            for name in given {
                if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
                    return Err(Error::InvalidName {
                        name: name.clone(),
                        reason: "only [a-zA-Z0-9-] is allowed".into(),
                    });
                }
            }
            if given.len() == instances {
                given.iter().map(|n| truncate(n, MAX_NAME_LEN)).collect()
            } else if given.len() == 1 {
                suffixed(&given[0], instances)
            } else {
                return Err(Error::InvalidAnnotation {
                    key: format!("{}name", ANNOTATION_PREFIX),
                    reason: format!("expected 1 or {} names, got {}", instances, given.len()),
                });
            }
        }
    };

    let mut seen = BTreeSet::new();
    for name in &names {
        if !seen.insert(name.as_str()) {
            return Err(Error::InvalidName {
                name: name.clone(),
                reason: "duplicate name".into(),
            });
        }
    }

    Ok(names)
}

/// Normalize source ranges, falling back to the defaults
fn allowed_cidrs(ranges: Option<&[String]>, defaults: &[String]) -> Result<BTreeSet<String>> {
    let ranges = match ranges {
        Some(r) if !r.is_empty() => r,
        _ => defaults,
    };
    ranges
        .iter()
        .map(|r| {
            r.trim()
                .parse::<IpNet>()
                .map(|net| net.trunc().to_string())
                .map_err(|e| {
                    Error::InvalidService(format!("invalid loadBalancerSourceRanges {:?}: {}", r, e))
                })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use k8s_openapi::api::core::v1::{ServicePort, ServiceSpec};
    use kube::api::ObjectMeta;

    const UID: &str = "3f1c2a9e-5b7d-4e21-9a0c-6d8e2f4b1a07";

    fn port(port: i32, node_port: i32, protocol: &str) -> ServicePort {
        ServicePort {
            port,
            node_port: Some(node_port),
            protocol: Some(protocol.to_string()),
            ..Default::default()
        }
    }

    fn service(ports: Vec<ServicePort>, annotations: &[(&str, &str)]) -> Service {
        Service {
            metadata: ObjectMeta {
                name: Some("web".into()),
                namespace: Some("shop".into()),
                uid: Some(UID.into()),
                annotations: Some(
                    annotations
                        .iter()
                        .map(|(k, v)| (format!("{}{}", ANNOTATION_PREFIX, k), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("LoadBalancer".into()),
                ports: Some(ports),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn builder() -> SpecBuilder {
        SpecBuilder::new(SpecDefaults::for_cluster("foo"))
    }

    #[test]
    fn test_default_spec_for_single_tcp_port() {
        let spec = builder()
            .build(&service(vec![port(80, 30080, "TCP")], &[]))
            .unwrap();

        assert_eq!(spec.names, vec!["3f1c2a9e5b7d4e219a0c6d8e2f4b1a07".to_string()]);
        assert_eq!(spec.service_name, "shop/web");
        assert_eq!(spec.listeners, vec![ListenerSpec { port: 80, backend_port: 30080 }]);

        let hc = spec.health_check.unwrap();
        assert_eq!(hc.port, 30080);
        assert_eq!(hc.protocol, "tcp");
        assert_eq!(hc.path, None);

        assert_eq!(
            spec.tags.get("OscK8sClusterID/foo").map(String::as_str),
            Some("owned")
        );
        assert_eq!(spec.tags.get("OscK8sService").map(String::as_str), Some("shop/web"));
        assert_eq!(spec.ingress_address, IngressAddress::Hostname);
        assert_eq!(spec.ip_mode, None);
        assert!(spec.allow_from.contains("0.0.0.0/0"));
    }

    #[test]
    fn test_non_tcp_ports_are_skipped() {
        let spec = builder()
            .build(&service(
                vec![port(53, 30053, "UDP"), port(80, 30080, "TCP"), port(9, 0, "TCP")],
                &[],
            ))
            .unwrap();
        assert_eq!(spec.listeners.len(), 1);

        let spec = builder()
            .build(&service(vec![port(53, 30053, "UDP")], &[]))
            .unwrap();
        assert!(spec.listeners.is_empty());
        assert!(spec.health_check.is_none());
    }

    #[test]
    fn test_rejects_invalid_services() {
        let err = builder().build(&service(vec![], &[])).unwrap_err();
        assert_matches!(err, Error::InvalidService(_));

        let mut svc = service(vec![port(80, 30080, "TCP")], &[]);
        svc.spec.as_mut().unwrap().session_affinity = Some("ClientIP".into());
        assert_matches!(builder().build(&svc), Err(Error::InvalidService(_)));

        let mut svc = service(vec![port(80, 30080, "TCP")], &[]);
        svc.spec.as_mut().unwrap().load_balancer_ip = Some("203.0.113.9".into());
        assert_matches!(builder().build(&svc), Err(Error::InvalidService(_)));
    }

    #[test]
    fn test_name_derivation_is_deterministic() {
        let svc = service(vec![port(80, 30080, "TCP")], &[("instances", "2")]);
        let first = builder().build(&svc).unwrap();
        let second = builder().build(&svc).unwrap();
        assert_eq!(first.names, second.names);
        assert_eq!(first.names.len(), 2);
        assert!(first.names[0].ends_with("-a"));
        assert!(first.names[1].ends_with("-b"));
        assert!(first.names.iter().all(|n| n.len() <= MAX_NAME_LEN));
    }

    #[test]
    fn test_names_colliding_after_truncation_are_rejected() {
        let a = format!("{}x", "n".repeat(32));
        let b = format!("{}y", "n".repeat(32));
        let names = format!("{},{}", a, b);
        let svc = service(
            vec![port(80, 30080, "TCP")],
            &[("instances", "2"), ("name", names.as_str())],
        );
        assert_matches!(builder().build(&svc), Err(Error::InvalidName { .. }));
    }

    #[test]
    fn test_invalid_name_charset() {
        let svc = service(vec![port(80, 30080, "TCP")], &[("name", "web_lb")]);
        assert_matches!(builder().build(&svc), Err(Error::InvalidName { .. }));
    }

    #[test]
    fn test_partial_per_instance_arrays_are_rejected() {
        let svc = service(
            vec![port(80, 30080, "TCP")],
            &[("instances", "3"), ("subregions", "eu-west-2a,eu-west-2b")],
        );
        assert_matches!(builder().build(&svc), Err(Error::InvalidAnnotation { .. }));

        let svc = service(
            vec![port(80, 30080, "TCP")],
            &[("instances", "2"), ("subnet-id", "subnet-1,subnet-2")],
        );
        let spec = builder().build(&svc).unwrap();
        assert_eq!(spec.instance(1).subnet_id, Some("subnet-2"));
    }

    #[test]
    fn test_health_check_priority() {
        // explicit port + protocol
        let svc = service(
            vec![port(80, 30080, "TCP")],
            &[("healthcheck-port", "8080"), ("healthcheck-protocol", "https")],
        );
        let hc = builder().build(&svc).unwrap().health_check.unwrap();
        assert_eq!((hc.port, hc.protocol.as_str(), hc.path.as_deref()), (8080, "https", Some("/")));

        // explicit port, path implies http
        let svc = service(
            vec![port(80, 30080, "TCP")],
            &[("healthcheck-port", "8080"), ("healthcheck-path", "/ready")],
        );
        let hc = builder().build(&svc).unwrap().health_check.unwrap();
        assert_eq!((hc.port, hc.protocol.as_str()), (8080, "http"));
        assert_eq!(hc.path.as_deref(), Some("/ready"));

        // externalTrafficPolicy=Local health check node port
        let mut svc = service(vec![port(80, 30080, "TCP")], &[]);
        {
            let spec = svc.spec.as_mut().unwrap();
            spec.external_traffic_policy = Some("Local".into());
            spec.health_check_node_port = Some(32000);
        }
        let hc = builder().build(&svc).unwrap().health_check.unwrap();
        assert_eq!((hc.port, hc.protocol.as_str()), (32000, "http"));
        assert_eq!(hc.path.as_deref(), Some("/healthz"));
    }

    #[test]
    fn test_ingress_ip_defaults_ip_mode_to_proxy() {
        let svc = service(vec![port(80, 30080, "TCP")], &[("ingress-address", "ip")]);
        let spec = builder().build(&svc).unwrap();
        assert_eq!(spec.ip_mode, Some(IpMode::Proxy));

        let svc = service(
            vec![port(80, 30080, "TCP")],
            &[("ingress-address", "both"), ("ingress-ipmode", "VIP")],
        );
        assert_eq!(builder().build(&svc).unwrap().ip_mode, Some(IpMode::Vip));
    }

    #[test]
    fn test_source_ranges_are_normalized() {
        let mut svc = service(vec![port(80, 30080, "TCP")], &[]);
        svc.spec.as_mut().unwrap().load_balancer_source_ranges =
            Some(vec!["203.0.113.7/24".into(), "198.51.100.0/24".into()]);
        let spec = builder().build(&svc).unwrap();
        let cidrs: Vec<_> = spec.allow_from.iter().cloned().collect();
        assert_eq!(cidrs, vec!["198.51.100.0/24", "203.0.113.0/24"]);

        svc.spec.as_mut().unwrap().load_balancer_source_ranges = Some(vec!["nope".into()]);
        assert_matches!(builder().build(&svc), Err(Error::InvalidService(_)));
    }

    #[test]
    fn test_instance_suffix() {
        assert_eq!(instance_suffix(0), "-a");
        assert_eq!(instance_suffix(25), "-z");
        assert_eq!(instance_suffix(26), "-aa");
    }
}
