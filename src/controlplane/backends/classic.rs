//! Classic load balancer backend
//!
//! Create and update share one convergence pipeline:
//! subnet, front-end groups, base resource, listeners, proxy protocol,
//! certificates, attributes, health check, backend rules, membership.

use super::{ensure_frontend_groups, BackendContext};
use crate::controlplane::attributes::{AttributeReconciler, HealthCheckReconciler};
use crate::controlplane::listeners::{expected_listeners, ListenerReconciler};
use crate::controlplane::membership::BackendMembershipReconciler;
use crate::controlplane::proxy_protocol::ProxyProtocolReconciler;
use crate::controlplane::public_ip::PublicIpAllocator;
use crate::controlplane::rules::{uniform_rules, PrincipalKind, RuleReconciler};
use crate::controlplane::subnet::SubnetResolver;
use crate::domain::ports::{Ingress, LoadBalancerBackend, LoadBalancerType, Readiness};
use crate::domain::types::{CreateLoadBalancerRequest, LoadBalancer, Tags, Vm};
use crate::error::{Error, Result};
use crate::spec::{InstanceSpec, LoadBalancerSpec};
use async_trait::async_trait;
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// Backend for listener-based load balancers
pub struct ClassicBackend {
    ctx: BackendContext,
}

impl ClassicBackend {
    pub fn new(ctx: BackendContext) -> Self {
        Self { ctx }
    }

    async fn reload(&self, name: &str) -> Result<LoadBalancer> {
        self.ctx
            .cloud
            .read_load_balancer(name)
            .await?
            .ok_or_else(|| Error::ResourceNotFound {
                kind: "LoadBalancer".into(),
                name: name.to_string(),
            })
    }

    /// Read the load balancer, creating it when absent
    async fn create_or_read(
        &self,
        spec: &LoadBalancerSpec,
        instance: &InstanceSpec<'_>,
        subnet_id: &str,
        security_groups: Vec<String>,
    ) -> Result<LoadBalancer> {
        if let Some(lb) = self.ctx.cloud.read_load_balancer(instance.name).await? {
            return Ok(lb);
        }

        let public_ip_id = if spec.internal {
            None
        } else {
            PublicIpAllocator::new(self.ctx.cloud.clone(), self.ctx.rng.clone())
                .acquire(spec, instance, false)
                .await?
                .map(|ip| ip.id)
        };

        let request = CreateLoadBalancerRequest {
            name: instance.name.to_string(),
            internal: spec.internal,
            subnets: vec![subnet_id.to_string()],
            security_groups,
            listeners: expected_listeners(spec),
            public_ip_id,
            tags: spec.tags.clone(),
        };

        info!(lb = %instance.name, internal = spec.internal, "Creating load balancer");
        match self.ctx.cloud.create_load_balancer(request).await {
            Ok(lb) => Ok(lb),
            Err(e) if e.is_already_exists() => {
                warn!(lb = %instance.name, "Load balancer created concurrently, re-reading");
                self.reload(instance.name).await
            }
            Err(e) => Err(e),
        }
    }

    async fn converge(
        &self,
        spec: &LoadBalancerSpec,
        instance: &InstanceSpec<'_>,
        vms: &[Vm],
    ) -> Result<Readiness<Ingress>> {
        let cloud = &self.ctx.cloud;
        let net_id = vms.first().map(|vm| vm.net_id.as_str());

        let subnet = SubnetResolver::new(cloud.clone(), self.ctx.cluster_id.clone())
            .resolve(instance, spec.internal, net_id)
            .await?;
        let groups = ensure_frontend_groups(&self.ctx, spec, &subnet.net_id).await?;

        let mut lb = self
            .create_or_read(spec, instance, &subnet.id, groups.ids.clone())
            .await?;

        if ListenerReconciler::new(cloud.clone()).reconcile(spec, &lb).await? > 0 {
            lb = self.reload(&lb.name).await?;
        }
        if ProxyProtocolReconciler::new(cloud.clone()).reconcile(spec, &lb).await? > 0 {
            lb = self.reload(&lb.name).await?;
        }
        ListenerReconciler::new(cloud.clone())
            .reconcile_certificates(spec, &lb)
            .await?;
        AttributeReconciler::new(cloud.clone()).reconcile(spec, &lb).await?;
        HealthCheckReconciler::new(cloud.clone()).reconcile(spec, &lb).await?;

        if !vms.is_empty() {
            let target = self
                .ctx
                .security_groups()
                .select_target(vms, &spec.target_role)
                .await?;
            let mut ports = spec.backend_ports();
            if let Some(hc) = &spec.health_check {
                ports.insert(hc.port);
            }
            let principal: BTreeSet<String> = [groups.primary.clone()].into_iter().collect();
            RuleReconciler::new(cloud.clone())
                .reconcile(
                    &target,
                    &uniform_rules(ports, &principal),
                    PrincipalKind::Member,
                    Some(&principal),
                )
                .await?;
        }

        BackendMembershipReconciler::new(cloud.clone(), self.ctx.rng.clone())
            .reconcile_classic(&lb, vms)
            .await?;

        Ok(self.readiness(spec, &lb))
    }

    /// Ready once the DNS name and, for public instances, the IP are known
    fn readiness(&self, spec: &LoadBalancerSpec, lb: &LoadBalancer) -> Readiness<Ingress> {
        let hostname = lb.dns_name.clone().filter(|d| !d.is_empty());
        let public_ip = lb.public_ip.clone().filter(|ip| !ip.is_empty());

        if hostname.is_none() {
            return Readiness::not_ready(
                self.ctx.not_ready_backoff,
                format!("{} has no DNS name yet", lb.name),
            );
        }
        if !spec.internal && public_ip.is_none() {
            return Readiness::not_ready(
                self.ctx.not_ready_backoff,
                format!("{} has no public IP yet", lb.name),
            );
        }
        Readiness::Ready(Ingress {
            hostname,
            public_ip,
        })
    }
}

#[async_trait]
impl LoadBalancerBackend for ClassicBackend {
    fn kind(&self) -> LoadBalancerType {
        LoadBalancerType::Lbu
    }

    async fn exists(&self, instance: &InstanceSpec<'_>) -> Result<Option<Tags>> {
        Ok(self
            .ctx
            .cloud
            .read_load_balancer(instance.name)
            .await?
            .map(|lb| lb.tags))
    }

    async fn get(&self, _spec: &LoadBalancerSpec, instance: &InstanceSpec<'_>) -> Result<Option<Ingress>> {
        Ok(self
            .ctx
            .cloud
            .read_load_balancer(instance.name)
            .await?
            .map(|lb| Ingress {
                hostname: lb.dns_name,
                public_ip: lb.public_ip,
            }))
    }

    async fn create(
        &self,
        spec: &LoadBalancerSpec,
        instance: &InstanceSpec<'_>,
        vms: &[Vm],
    ) -> Result<Readiness<Ingress>> {
        self.converge(spec, instance, vms).await
    }

    async fn update(
        &self,
        spec: &LoadBalancerSpec,
        instance: &InstanceSpec<'_>,
        vms: &[Vm],
    ) -> Result<Readiness<Ingress>> {
        self.converge(spec, instance, vms).await
    }

    async fn delete(&self, _spec: &LoadBalancerSpec, instance: &InstanceSpec<'_>) -> Result<()> {
        match self.ctx.cloud.read_load_balancer(instance.name).await? {
            Some(_) => {
                info!(lb = %instance.name, "Deleting load balancer");
                self.ctx.cloud.delete_load_balancer(instance.name).await?;
            }
            None => debug!(lb = %instance.name, "Load balancer already gone"),
        }

        PublicIpAllocator::new(self.ctx.cloud.clone(), self.ctx.rng.clone())
            .release_managed(instance.name)
            .await?;
        Ok(())
    }
}
