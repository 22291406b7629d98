//! Subnet resolver
//!
//! Picks the subnet a load balancer instance lives in: explicit ids first,
//! then subnets tagged for the cluster by role, then a public/private
//! classification derived from route tables.

use crate::domain::ports::CloudApiRef;
use crate::domain::tags::{
    cluster_tag_key, role_tag_key, ROLE_INTERNAL_ELB, ROLE_INTERNAL_SERVICE, ROLE_LOADBALANCER,
    ROLE_PUBLIC_ELB, ROLE_SERVICE,
};
use crate::domain::types::{RouteTable, Subnet, SubnetFilter};
use crate::error::{Error, Result};
use crate::spec::InstanceSpec;
use tracing::debug;

/// Role priority for internet-facing load balancers
const PUBLIC_ROLES: &[&str] = &[ROLE_PUBLIC_ELB, ROLE_SERVICE, ROLE_LOADBALANCER];

/// Role priority for internal load balancers
const INTERNAL_ROLES: &[&str] = &[ROLE_INTERNAL_ELB, ROLE_INTERNAL_SERVICE, ROLE_LOADBALANCER];

/// Resolves the subnet of one load balancer instance
pub struct SubnetResolver {
    cloud: CloudApiRef,
    cluster_id: String,
}

impl SubnetResolver {
    pub fn new(cloud: CloudApiRef, cluster_id: impl Into<String>) -> Self {
        Self {
            cloud,
            cluster_id: cluster_id.into(),
        }
    }

    /// Resolve the subnet for `instance`.
    ///
    /// `net_id` narrows discovery to the net of the backend VMs when known.
    pub async fn resolve(
        &self,
        instance: &InstanceSpec<'_>,
        internal: bool,
        net_id: Option<&str>,
    ) -> Result<Subnet> {
        if let Some(subnet_id) = instance.subnet_id {
            let filter = SubnetFilter {
                ids: vec![subnet_id.to_string()],
                ..Default::default()
            };
            let mut subnets = self.cloud.read_subnets(&filter).await?;
            if subnets.len() != 1 {
                return Err(Error::NoSubnet(format!(
                    "expected subnet {}, found {}",
                    subnet_id,
                    subnets.len()
                )));
            }
            return Ok(subnets.remove(0));
        }

        let filter = SubnetFilter {
            net_id: net_id.map(str::to_string),
            tag_keys: vec![cluster_tag_key(&self.cluster_id)],
            ..Default::default()
        };
        let candidates = self.cloud.read_subnets(&filter).await?;
        if candidates.is_empty() {
            return Err(Error::NoSubnet(format!(
                "no subnet tagged for cluster {}",
                self.cluster_id
            )));
        }

        let roles = if internal { INTERNAL_ROLES } else { PUBLIC_ROLES };
        for role in roles {
            let key = role_tag_key(role);
            let tagged: Vec<&Subnet> = candidates
                .iter()
                .filter(|s| s.tags.contains_key(&key))
                .collect();
            if let Some(subnet) = pick(&tagged, instance.subregion) {
                debug!(subnet = %subnet.id, role, "Selected subnet by role tag");
                return Ok(subnet.clone());
            }
        }

        let mut net_ids: Vec<&str> = candidates.iter().map(|s| s.net_id.as_str()).collect();
        net_ids.sort_unstable();
        net_ids.dedup();
        let tables: Vec<RouteTable> =
            futures::future::try_join_all(net_ids.iter().map(|net| self.cloud.read_route_tables(net)))
                .await?
                .into_iter()
                .flatten()
                .collect();

        let classified: Vec<&Subnet> = candidates
            .iter()
            .filter(|s| is_public(s, &tables) == !internal)
            .collect();
        match pick(&classified, instance.subregion) {
            Some(subnet) => {
                debug!(subnet = %subnet.id, internal, "Selected subnet by route table");
                Ok(subnet.clone())
            }
            None => Err(Error::NoSubnet(format!(
                "no {} subnet for cluster {}",
                if internal { "private" } else { "public" },
                self.cluster_id
            ))),
        }
    }
}

/// Whether the subnet's route table sends the default route to an internet gateway
fn is_public(subnet: &Subnet, tables: &[RouteTable]) -> bool {
    let table = tables
        .iter()
        .find(|t| t.subnet_ids.iter().any(|id| id == &subnet.id))
        .or_else(|| tables.iter().find(|t| t.main && t.net_id == subnet.net_id));
    table.map(RouteTable::has_internet_route).unwrap_or(false)
}

/// Prefer the requested zone; several matches resolve to the smallest name
/// tag, no match keeps the first candidate found.
fn pick<'a>(candidates: &[&'a Subnet], zone: Option<&str>) -> Option<&'a Subnet> {
    let first = candidates.first().copied()?;
    let in_zone: Vec<&Subnet> = candidates
        .iter()
        .copied()
        .filter(|s| zone.map_or(true, |z| s.subregion == z))
        .collect();
    if in_zone.is_empty() {
        return Some(first);
    }
    in_zone.into_iter().min_by(|a, b| a.name_tag().cmp(b.name_tag()))
}
