//! Public IP acquisition
//!
//! Address source by priority: an explicit id from the Service, a random
//! free address from a pool, a fresh allocation tagged as controller-managed.

use crate::controlplane::membership::SharedRng;
use crate::domain::ports::CloudApiRef;
use crate::domain::tags::MANAGED_IP_TAG;
use crate::domain::types::{PublicIp, PublicIpFilter, Tags};
use crate::error::{Error, Result};
use crate::spec::{InstanceSpec, LoadBalancerSpec};
use rand::seq::SliceRandom;
use tracing::{debug, info};

pub struct PublicIpAllocator {
    cloud: CloudApiRef,
    rng: SharedRng,
}

impl PublicIpAllocator {
    pub fn new(cloud: CloudApiRef, rng: SharedRng) -> Self {
        Self { cloud, rng }
    }

    /// Address for an instance.
    ///
    /// Returns `None` when neither an id nor a pool is configured and
    /// `allocate` is false (the cloud assigns one itself).
    pub async fn acquire(
        &self,
        spec: &LoadBalancerSpec,
        instance: &InstanceSpec<'_>,
        allocate: bool,
    ) -> Result<Option<PublicIp>> {
        if let Some(id) = instance.public_ip_id {
            let filter = PublicIpFilter {
                ids: vec![id.to_string()],
                ..Default::default()
            };
            let ip = self
                .cloud
                .read_public_ips(&filter)
                .await?
                .into_iter()
                .next()
                .ok_or_else(|| Error::ResourceNotFound {
                    kind: "PublicIp".into(),
                    name: id.to_string(),
                })?;
            debug!(lb = %instance.name, ip = %ip.address, "Using requested public IP");
            return Ok(Some(ip));
        }

        if let Some(pool) = &spec.ip_pool {
            let filter = PublicIpFilter {
                pool: Some(pool.clone()),
                ..Default::default()
            };
            let free: Vec<PublicIp> = self
                .cloud
                .read_public_ips(&filter)
                .await?
                .into_iter()
                .filter(PublicIp::is_free)
                .collect();
            let chosen = free
                .choose(&mut *self.rng.lock())
                .cloned()
                .ok_or_else(|| Error::PoolExhausted { pool: pool.clone() })?;
            info!(lb = %instance.name, pool = %pool, ip = %chosen.address, "Picked public IP from pool");
            return Ok(Some(chosen));
        }

        if !allocate {
            return Ok(None);
        }

        if let Some(held) = self.managed_ips(instance.name).await?.into_iter().next() {
            return Ok(Some(held));
        }

        let mut tags: Tags = spec.tags.clone();
        tags.insert(MANAGED_IP_TAG.to_string(), instance.name.to_string());
        let ip = self.cloud.allocate_public_ip(tags).await?;
        info!(lb = %instance.name, ip = %ip.address, "Allocated public IP");
        Ok(Some(ip))
    }

    /// Addresses this controller allocated for a load balancer name
    pub async fn managed_ips(&self, lb_name: &str) -> Result<Vec<PublicIp>> {
        Ok(self
            .cloud
            .read_public_ips(&PublicIpFilter::default())
            .await?
            .into_iter()
            .filter(|ip| ip.tags.get(MANAGED_IP_TAG).map(String::as_str) == Some(lb_name))
            .collect())
    }

    /// Release the addresses allocated for `lb_name`
    pub async fn release_managed(&self, lb_name: &str) -> Result<usize> {
        let ips = self.managed_ips(lb_name).await?;
        for ip in &ips {
            if ip.linked_nic_id.is_some() {
                self.cloud.unlink_public_ip(&ip.id).await?;
            }
            info!(lb = %lb_name, ip = %ip.address, "Releasing public IP");
            self.cloud.release_public_ip(&ip.id).await?;
        }
        Ok(ips.len())
    }
}
