//! VIP backend
//!
//! A floating network interface, optionally carrying a public IP, bound to
//! one backend VM at a time. Listeners, health checks and attributes do not
//! exist for this flavor.

use super::{ensure_frontend_groups, BackendContext};
use crate::controlplane::membership::BackendMembershipReconciler;
use crate::controlplane::public_ip::PublicIpAllocator;
use crate::controlplane::subnet::SubnetResolver;
use crate::domain::ports::{Ingress, LoadBalancerBackend, LoadBalancerType, Readiness};
use crate::domain::tags::NAME_TAG;
use crate::domain::types::{CreateNicRequest, NetworkInterface, Tags, Vm};
use crate::error::{Error, Result};
use crate::spec::{InstanceSpec, LoadBalancerSpec};
use async_trait::async_trait;
use tracing::{debug, info, warn};

/// Backend for floating-interface load balancers
pub struct VipBackend {
    ctx: BackendContext,
}

impl VipBackend {
    pub fn new(ctx: BackendContext) -> Self {
        Self { ctx }
    }

    fn allocator(&self) -> PublicIpAllocator {
        PublicIpAllocator::new(self.ctx.cloud.clone(), self.ctx.rng.clone())
    }

    async fn create_or_read(
        &self,
        spec: &LoadBalancerSpec,
        instance: &InstanceSpec<'_>,
        subnet_id: &str,
        security_groups: Vec<String>,
    ) -> Result<NetworkInterface> {
        let cloud = &self.ctx.cloud;
        if let Some(nic) = cloud.read_network_interface_by_name(instance.name).await? {
            return Ok(nic);
        }

        let mut tags = spec.tags.clone();
        tags.insert(NAME_TAG.to_string(), instance.name.to_string());
        let request = CreateNicRequest {
            subnet_id: subnet_id.to_string(),
            security_groups,
            description: format!("VIP for service {}", spec.service_name),
            tags: tags.clone(),
        };

        info!(vip = %instance.name, subnet = %subnet_id, "Creating VIP network interface");
        let nic = cloud.create_network_interface(request).await?;
        // tagging is a separate call on clouds that do not tag on create
        if nic.tags.get(NAME_TAG).map(String::as_str) != Some(instance.name) {
            cloud.create_tags(vec![nic.id.clone()], tags.clone()).await?;
            return Ok(NetworkInterface { tags, ..nic });
        }
        Ok(nic)
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
        let mut nic = self
            .create_or_read(spec, instance, &subnet.id, groups.ids)
            .await?;

        if !spec.internal && nic.public_ip.is_none() {
            let ip = self
                .allocator()
                .acquire(spec, instance, true)
                .await?
                .ok_or_else(|| Error::Internal(format!("no public IP for {}", instance.name)))?;
            info!(vip = %instance.name, ip = %ip.address, "Linking public IP to VIP");
            cloud.link_public_ip(&ip.id, &nic.id).await?;
            nic.public_ip = Some(ip.address);
        }

        BackendMembershipReconciler::new(cloud.clone(), self.ctx.rng.clone())
            .reconcile_vip(&nic, vms)
            .await?;

        Ok(self.readiness(spec, &nic))
    }

    /// Internal VIPs publish their private DNS name, public ones their IP
    fn readiness(&self, spec: &LoadBalancerSpec, nic: &NetworkInterface) -> Readiness<Ingress> {
        let ingress = ingress_of(spec, nic);
        if ingress.hostname.is_none() && ingress.public_ip.is_none() {
            return Readiness::not_ready(
                self.ctx.not_ready_backoff,
                format!("VIP {} has no address yet", nic.id),
            );
        }
        Readiness::Ready(ingress)
    }
}

fn ingress_of(spec: &LoadBalancerSpec, nic: &NetworkInterface) -> Ingress {
    if spec.internal {
        Ingress {
            hostname: nic.private_dns_name.clone().filter(|d| !d.is_empty()),
            public_ip: None,
        }
    } else {
        Ingress {
            hostname: None,
            public_ip: nic.public_ip.clone().filter(|ip| !ip.is_empty()),
        }
    }
}

#[async_trait]
impl LoadBalancerBackend for VipBackend {
    fn kind(&self) -> LoadBalancerType {
        LoadBalancerType::Vip
    }

    async fn exists(&self, instance: &InstanceSpec<'_>) -> Result<Option<Tags>> {
        Ok(self
            .ctx
            .cloud
            .read_network_interface_by_name(instance.name)
            .await?
            .map(|nic| nic.tags))
    }

    async fn get(&self, spec: &LoadBalancerSpec, instance: &InstanceSpec<'_>) -> Result<Option<Ingress>> {
        Ok(self
            .ctx
            .cloud
            .read_network_interface_by_name(instance.name)
            .await?
            .map(|nic| ingress_of(spec, &nic)))
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
        let cloud = &self.ctx.cloud;
        match cloud.read_network_interface_by_name(instance.name).await? {
            Some(nic) => {
                if let Some(vm) = &nic.linked_vm_id {
                    info!(vip = %instance.name, vm = %vm, "Unbinding VIP");
                    cloud.unlink_network_interface(&nic.id).await?;
                }
                info!(vip = %instance.name, nic = %nic.id, "Deleting VIP network interface");
                if let Err(e) = cloud.delete_network_interface(&nic.id).await {
                    warn!(vip = %instance.name, error = %e, "VIP deletion failed");
                    return Err(e);
                }
            }
            None => debug!(vip = %instance.name, "VIP already gone"),
        }

        self.allocator().release_managed(instance.name).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::backends::NOT_READY_BACKOFF;
    use crate::controlplane::membership::seeded_rng;
    use crate::controlplane::platform::MemoryCloud;
    use crate::domain::tags::MANAGED_IP_TAG;
    use crate::test_support::{backend_vms, seed_cluster, spec_with_ports};
    use std::sync::Arc;

    fn backend(cloud: &Arc<MemoryCloud>) -> VipBackend {
        VipBackend::new(BackendContext {
            cloud: cloud.clone(),
            cluster_id: "foo".into(),
            accepted_clusters: vec!["foo".into()],
            rng: seeded_rng(5),
            not_ready_backoff: NOT_READY_BACKOFF,
        })
    }

    fn vip_spec(internal: bool) -> LoadBalancerSpec {
        let mut spec = spec_with_ports(&[(80, 30080)]);
        spec.lb_type = LoadBalancerType::Vip;
        spec.internal = internal;
        spec
    }

    #[tokio::test]
    async fn test_public_vip_allocates_ip_and_binds() {
        let cloud = Arc::new(MemoryCloud::new());
        let fixture = seed_cluster(&cloud);
        let vms = backend_vms(&fixture);
        let spec = vip_spec(false);
        let backend = backend(&cloud);

        let ingress = backend
            .create(&spec, &spec.instance(0), &vms)
            .await
            .unwrap()
            .ready()
            .unwrap();
        assert!(ingress.hostname.is_none());
        let address = ingress.public_ip.unwrap();

        let nics = cloud.network_interfaces();
        assert_eq!(nics.len(), 1);
        assert_eq!(nics[0].public_ip.as_deref(), Some(address.as_str()));
        assert!(nics[0].linked_vm_id.is_some());
        assert!(cloud
            .public_ips()
            .iter()
            .any(|ip| ip.tags.get(MANAGED_IP_TAG) == Some(&spec.names[0])));

        cloud.clear_mutations();
        backend.update(&spec, &spec.instance(0), &vms).await.unwrap();
        assert_eq!(cloud.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_internal_vip_exposes_dns_name() {
        let cloud = Arc::new(MemoryCloud::new());
        let fixture = seed_cluster(&cloud);
        let spec = vip_spec(true);

        let ingress = backend(&cloud)
            .create(&spec, &spec.instance(0), &backend_vms(&fixture))
            .await
            .unwrap()
            .ready()
            .unwrap();
        assert!(ingress.hostname.unwrap().ends_with(".compute.internal"));
        assert!(ingress.public_ip.is_none());
        assert!(cloud.public_ips().is_empty());
    }

    #[tokio::test]
    async fn test_delete_releases_managed_ip() {
        let cloud = Arc::new(MemoryCloud::new());
        let fixture = seed_cluster(&cloud);
        let spec = vip_spec(false);
        let backend = backend(&cloud);
        backend
            .create(&spec, &spec.instance(0), &backend_vms(&fixture))
            .await
            .unwrap();

        backend.delete(&spec, &spec.instance(0)).await.unwrap();
        assert!(cloud.network_interfaces().is_empty());
        assert!(cloud.public_ips().is_empty());
        assert!(backend.exists(&spec.instance(0)).await.unwrap().is_none());
    }
}
