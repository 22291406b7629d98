//! Listener reconciler (classic load balancers)
//!
//! Diffs live listeners against the ones computed from the spec, then fixes
//! SSL certificates on listeners that survive the diff.

use crate::domain::ports::CloudApiRef;
use crate::domain::types::{LoadBalancer, Listener};
use crate::error::Result;
use crate::spec::LoadBalancerSpec;
use tracing::{debug, info};

/// Listeners the spec asks for
pub fn expected_listeners(spec: &LoadBalancerSpec) -> Vec<Listener> {
    let defaults = &spec.listener_defaults;
    let backend = defaults.backend_protocol.to_ascii_lowercase();

    spec.listeners
        .iter()
        .map(|l| {
            let certificate = defaults
                .ssl_certificate
                .as_ref()
                .filter(|_| defaults.ssl_ports.contains(l.port));

            let (frontend_protocol, backend_protocol) = match certificate {
                Some(_) if backend == "http" || backend == "https" => {
                    ("HTTPS", backend.to_ascii_uppercase())
                }
                Some(_) => ("SSL", "TCP".to_string()),
                None if backend == "http" => ("HTTP", "HTTP".to_string()),
                None if backend == "ssl" => ("TCP", "SSL".to_string()),
                None => ("TCP", "TCP".to_string()),
            };

            Listener {
                load_balancer_port: l.port,
                load_balancer_protocol: frontend_protocol.to_string(),
                backend_port: l.backend_port,
                backend_protocol,
                server_certificate_id: certificate.cloned(),
            }
        })
        .collect()
}

/// Listener changes needed to converge
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListenerPlan {
    pub delete: Vec<Listener>,
    pub create: Vec<Listener>,
}

/// Diff by listener identity (ports and case-insensitive protocols)
pub fn plan_listeners(existing: &[Listener], expected: &[Listener]) -> ListenerPlan {
    ListenerPlan {
        delete: existing
            .iter()
            .filter(|e| !expected.iter().any(|x| x.same_as(e)))
            .cloned()
            .collect(),
        create: expected
            .iter()
            .filter(|x| !existing.iter().any(|e| e.same_as(x)))
            .cloned()
            .collect(),
    }
}

/// Converges listeners and their certificates
pub struct ListenerReconciler {
    cloud: CloudApiRef,
}

impl ListenerReconciler {
    pub fn new(cloud: CloudApiRef) -> Self {
        Self { cloud }
    }

    /// Add and remove listeners; returns the number of calls made
    pub async fn reconcile(&self, spec: &LoadBalancerSpec, lb: &LoadBalancer) -> Result<usize> {
        let expected = expected_listeners(spec);
        let plan = plan_listeners(&lb.listeners, &expected);
        let mut calls = 0;

        if !plan.delete.is_empty() {
            for listener in &plan.delete {
                let bound = lb
                    .backend_policies
                    .iter()
                    .any(|p| p.backend_port == listener.backend_port && !p.policy_names.is_empty());
                if bound {
                    debug!(
                        lb = %lb.name,
                        backend_port = listener.backend_port,
                        "Clearing backend policies before listener deletion"
                    );
                    self.cloud
                        .set_backend_policies(&lb.name, listener.backend_port, Vec::new())
                        .await?;
                    calls += 1;
                }
            }

            let ports: Vec<i32> = plan.delete.iter().map(|l| l.load_balancer_port).collect();
            info!(lb = %lb.name, ports = ?ports, "Deleting listeners");
            self.cloud.delete_listeners(&lb.name, ports).await?;
            calls += 1;
        }

        if !plan.create.is_empty() {
            info!(
                lb = %lb.name,
                ports = ?plan.create.iter().map(|l| l.load_balancer_port).collect::<Vec<_>>(),
                "Creating listeners"
            );
            self.cloud.create_listeners(&lb.name, plan.create).await?;
            calls += 1;
        }

        Ok(calls)
    }

    /// Fix certificates on listeners that already match
    pub async fn reconcile_certificates(&self, spec: &LoadBalancerSpec, lb: &LoadBalancer) -> Result<usize> {
        let mut calls = 0;
        for wanted in expected_listeners(spec) {
            let certificate = match &wanted.server_certificate_id {
                Some(c) => c,
                None => continue,
            };
            let live = lb.listeners.iter().find(|l| l.same_as(&wanted));
            if let Some(live) = live {
                if live.server_certificate_id.as_ref() != Some(certificate) {
                    info!(lb = %lb.name, port = wanted.load_balancer_port, "Updating listener certificate");
                    self.cloud
                        .set_listener_certificate(&lb.name, wanted.load_balancer_port, certificate)
                        .await?;
                    calls += 1;
                }
            }
        }
        Ok(calls)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::platform::MemoryCloud;
    use crate::domain::ports::CloudApi;
    use crate::domain::types::CreateLoadBalancerRequest;
    use crate::spec::{ListenerSpec, PortSelector};
    use crate::test_support::spec_with_ports;
    use std::sync::Arc;

    fn listener(port: i32, backend: i32, fp: &str, bp: &str) -> Listener {
        Listener {
            load_balancer_port: port,
            load_balancer_protocol: fp.into(),
            backend_port: backend,
            backend_protocol: bp.into(),
            server_certificate_id: None,
        }
    }

    #[test]
    fn test_expected_plain_tcp() {
        let spec = spec_with_ports(&[(80, 30080)]);
        assert_eq!(
            expected_listeners(&spec),
            vec![listener(80, 30080, "TCP", "TCP")]
        );
    }

    #[test]
    fn test_expected_ssl_selection() {
        let mut spec = spec_with_ports(&[(80, 30080), (443, 30443)]);
        spec.listener_defaults.ssl_certificate = Some("cert-1".into());
        spec.listener_defaults.ssl_ports = PortSelector::Ports([443].into_iter().collect());

        let listeners = expected_listeners(&spec);
        assert_eq!(listeners[0].load_balancer_protocol, "TCP");
        assert_eq!(listeners[1].load_balancer_protocol, "SSL");
        assert_eq!(listeners[1].backend_protocol, "TCP");
        assert_eq!(listeners[1].server_certificate_id.as_deref(), Some("cert-1"));

        spec.listener_defaults.backend_protocol = "http".into();
        let listeners = expected_listeners(&spec);
        assert_eq!(listeners[0].load_balancer_protocol, "HTTP");
        assert_eq!(listeners[1].load_balancer_protocol, "HTTPS");
        assert_eq!(listeners[1].backend_protocol, "HTTP");
    }

    #[test]
    fn test_plan_is_case_insensitive() {
        let existing = vec![listener(80, 30080, "tcp", "tcp"), listener(8080, 30081, "TCP", "TCP")];
        let expected = vec![listener(80, 30080, "TCP", "TCP"), listener(443, 30443, "TCP", "TCP")];

        let plan = plan_listeners(&existing, &expected);
        assert_eq!(plan.delete, vec![listener(8080, 30081, "TCP", "TCP")]);
        assert_eq!(plan.create, vec![listener(443, 30443, "TCP", "TCP")]);
    }

    #[test]
    fn test_listener_count_matches_ports() {
        let spec = spec_with_ports(&[(80, 30080), (443, 30443), (8443, 31443)]);
        assert_eq!(expected_listeners(&spec).len(), spec.listeners.len());
        assert_eq!(spec.listeners[2], ListenerSpec { port: 8443, backend_port: 31443 });
    }

    async fn live(cloud: &Arc<MemoryCloud>, name: &str, listeners: Vec<Listener>) -> LoadBalancer {
        cloud
            .create_load_balancer(CreateLoadBalancerRequest {
                name: name.into(),
                listeners,
                ..Default::default()
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_policies_cleared_before_listener_deletion() {
        let cloud = Arc::new(MemoryCloud::new());
        let spec = spec_with_ports(&[(443, 30443)]);
        let name = spec.names[0].clone();
        live(&cloud, &name, vec![listener(80, 30080, "TCP", "TCP")]).await;
        cloud.create_proxy_protocol_policy(&name, "k8s-proxyprotocol-enabled").await.unwrap();
        cloud
            .set_backend_policies(&name, 30080, vec!["k8s-proxyprotocol-enabled".into()])
            .await
            .unwrap();
        let lb = cloud.read_load_balancer(&name).await.unwrap().unwrap();

        cloud.clear_mutations();
        let calls = ListenerReconciler::new(cloud.clone()).reconcile(&spec, &lb).await.unwrap();
        assert_eq!(calls, 3);
        assert_eq!(
            cloud.mutations(),
            vec![
                format!("SetBackendPolicies {}", name),
                format!("DeleteListeners {}", name),
                format!("CreateListeners {}", name),
            ]
        );

        let lb = cloud.read_load_balancer(&name).await.unwrap().unwrap();
        assert_eq!(lb.listeners, vec![listener(443, 30443, "TCP", "TCP")]);
        assert!(lb.backend_policies.is_empty());
    }

    #[tokio::test]
    async fn test_certificate_change_updates_once() {
        let cloud = Arc::new(MemoryCloud::new());
        let mut spec = spec_with_ports(&[(443, 30443)]);
        spec.listener_defaults.ssl_certificate = Some("cert-new".into());
        let name = spec.names[0].clone();
        let mut current = listener(443, 30443, "SSL", "TCP");
        current.server_certificate_id = Some("cert-old".into());
        live(&cloud, &name, vec![current]).await;

        let reconciler = ListenerReconciler::new(cloud.clone());
        let lb = cloud.read_load_balancer(&name).await.unwrap().unwrap();
        cloud.clear_mutations();
        assert_eq!(reconciler.reconcile(&spec, &lb).await.unwrap(), 0);
        assert_eq!(reconciler.reconcile_certificates(&spec, &lb).await.unwrap(), 1);
        assert_eq!(cloud.mutations(), vec![format!("SetListenerCertificate {}", name)]);

        let lb = cloud.read_load_balancer(&name).await.unwrap().unwrap();
        assert_eq!(lb.listeners[0].server_certificate_id.as_deref(), Some("cert-new"));
        cloud.clear_mutations();
        assert_eq!(reconciler.reconcile_certificates(&spec, &lb).await.unwrap(), 0);
        assert_eq!(cloud.mutation_count(), 0);
    }
}
