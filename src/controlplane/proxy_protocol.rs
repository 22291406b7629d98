//! Proxy protocol reconciler (classic load balancers)
//!
//! Runs after listeners are converged: it addresses backend ports, which
//! only exist once their listener does.

use crate::domain::ports::CloudApiRef;
use crate::domain::types::LoadBalancer;
use crate::error::Result;
use crate::spec::LoadBalancerSpec;
use tracing::{debug, info};

/// Name of the proxy protocol policy created on each load balancer
pub const PROXY_PROTOCOL_POLICY: &str = "k8s-proxyprotocol-enabled";

/// Attaches or detaches the proxy protocol policy per backend port
pub struct ProxyProtocolReconciler {
    cloud: CloudApiRef,
}

impl ProxyProtocolReconciler {
    pub fn new(cloud: CloudApiRef) -> Self {
        Self { cloud }
    }

    pub async fn reconcile(&self, spec: &LoadBalancerSpec, lb: &LoadBalancer) -> Result<usize> {
        let selector = &spec.listener_defaults.proxy_protocol_ports;
        let mut calls = 0;
        let mut policy_ready = false;

        for port in spec.backend_ports() {
            let wanted = selector.contains(port);
            let attached = lb.backend_policies.iter().any(|p| {
                p.backend_port == port && p.policy_names.iter().any(|n| n == PROXY_PROTOCOL_POLICY)
            });
            if wanted == attached {
                continue;
            }

            if wanted {
                if !policy_ready {
                    match self
                        .cloud
                        .create_proxy_protocol_policy(&lb.name, PROXY_PROTOCOL_POLICY)
                        .await
                    {
                        Ok(()) => calls += 1,
                        Err(e) if e.is_already_exists() => {
                            debug!(lb = %lb.name, "Proxy protocol policy already exists");
                        }
                        Err(e) => return Err(e),
                    }
                    policy_ready = true;
                }
                info!(lb = %lb.name, backend_port = port, "Enabling proxy protocol");
                self.cloud
                    .set_backend_policies(&lb.name, port, vec![PROXY_PROTOCOL_POLICY.to_string()])
                    .await?;
            } else {
                info!(lb = %lb.name, backend_port = port, "Disabling proxy protocol");
                self.cloud
                    .set_backend_policies(&lb.name, port, Vec::new())
                    .await?;
            }
            calls += 1;
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
    use crate::spec::PortSelector;
    use crate::test_support::spec_with_ports;
    use std::sync::Arc;

    async fn setup() -> (Arc<MemoryCloud>, ProxyProtocolReconciler) {
        let cloud = Arc::new(MemoryCloud::new());
        cloud
            .create_load_balancer(CreateLoadBalancerRequest {
                name: "lb".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let reconciler = ProxyProtocolReconciler::new(cloud.clone());
        (cloud, reconciler)
    }

    #[tokio::test]
    async fn test_enable_then_converged_then_disable() {
        let (cloud, reconciler) = setup().await;
        let mut spec = spec_with_ports(&[(80, 30080), (443, 30443)]);
        spec.listener_defaults.proxy_protocol_ports = PortSelector::Ports([30443].into_iter().collect());

        let lb = cloud.read_load_balancer("lb").await.unwrap().unwrap();
        assert_eq!(reconciler.reconcile(&spec, &lb).await.unwrap(), 2);

        let lb = cloud.read_load_balancer("lb").await.unwrap().unwrap();
        assert_eq!(lb.backend_policies.len(), 1);
        assert_eq!(lb.backend_policies[0].backend_port, 30443);
        assert_eq!(reconciler.reconcile(&spec, &lb).await.unwrap(), 0);

        spec.listener_defaults.proxy_protocol_ports = PortSelector::None;
        assert_eq!(reconciler.reconcile(&spec, &lb).await.unwrap(), 1);
        let lb = cloud.read_load_balancer("lb").await.unwrap().unwrap();
        assert!(lb.backend_policies.is_empty());
    }

    #[tokio::test]
    async fn test_existing_policy_is_tolerated() {
        let (cloud, reconciler) = setup().await;
        cloud
            .create_proxy_protocol_policy("lb", PROXY_PROTOCOL_POLICY)
            .await
            .unwrap();
        let mut spec = spec_with_ports(&[(80, 30080)]);
        spec.listener_defaults.proxy_protocol_ports = PortSelector::All;

        let lb = cloud.read_load_balancer("lb").await.unwrap().unwrap();
        assert_eq!(reconciler.reconcile(&spec, &lb).await.unwrap(), 1);
    }
}
