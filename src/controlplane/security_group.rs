//! Security group manager
//!
//! Owns the front-end group of a load balancer and picks the backend group
//! that membership rules are written to.

use crate::domain::ports::CloudApiRef;
use crate::domain::tags::{
    cluster_tag_key, main_sg_tag_key, owning_clusters, role_count, role_tag_key, CLUSTER_OWNED,
    NAME_TAG, TO_DELETE_TAG,
};
use crate::domain::types::{SecurityGroup, SecurityGroupFilter, Tags, Vm};
use crate::error::{Error, Result};
use crate::spec::TargetRole;
use tracing::{debug, info, warn};

/// Name of the front-end group of a load balancer
pub fn frontend_group_name(first_name: &str) -> String {
    format!("k8s-elb-{}", first_name)
}

/// Manages front-end and backend security groups
pub struct SecurityGroupManager {
    cloud: CloudApiRef,
    cluster_id: String,
    accepted_clusters: Vec<String>,
}

impl SecurityGroupManager {
    pub fn new(cloud: CloudApiRef, cluster_id: impl Into<String>, accepted_clusters: Vec<String>) -> Self {
        Self {
            cloud,
            cluster_id: cluster_id.into(),
            accepted_clusters,
        }
    }

    /// Read a group by name, optionally inside one net
    pub async fn find_by_name(&self, name: &str, net_id: Option<&str>) -> Result<Option<SecurityGroup>> {
        let filter = SecurityGroupFilter {
            names: vec![name.to_string()],
            net_id: net_id.map(str::to_string),
            ..Default::default()
        };
        Ok(self.cloud.read_security_groups(&filter).await?.into_iter().next())
    }

    /// Ensure the front-end group exists and is owned by this cluster
    pub async fn ensure_frontend(&self, first_name: &str, net_id: &str, tags: &Tags) -> Result<SecurityGroup> {
        let name = frontend_group_name(first_name);

        let group = match self.find_by_name(&name, Some(net_id)).await? {
            Some(group) => group,
            None => {
                info!(sg_name = %name, net = %net_id, "Creating front-end security group");
                let description = format!("Security group for load balancer {}", first_name);
                match self.cloud.create_security_group(&name, &description, net_id).await {
                    Ok(group) => {
                        let mut group_tags = tags.clone();
                        group_tags.insert(NAME_TAG.to_string(), name.clone());
                        self.cloud
                            .create_tags(vec![group.id.clone()], group_tags.clone())
                            .await?;
                        SecurityGroup {
                            tags: group_tags,
                            ..group
                        }
                    }
                    Err(e) if e.is_already_exists() => {
                        warn!(sg_name = %name, "Security group created concurrently, re-reading");
                        self.find_by_name(&name, Some(net_id)).await?.ok_or_else(|| {
                            Error::NoSecurityGroup(format!(
                                "{} reported as existing but cannot be read",
                                name
                            ))
                        })?
                    }
                    Err(e) => return Err(e),
                }
            }
        };

        let group = self.claim(group).await?;
        self.unmark(group).await
    }

    /// Drop a pending deletion mark from a group that is in use again
    async fn unmark(&self, mut group: SecurityGroup) -> Result<SecurityGroup> {
        if group.tags.remove(TO_DELETE_TAG).is_some() {
            info!(sg = %group.id, "Security group reused, removing deletion mark");
            self.cloud
                .delete_tags(vec![group.id.clone()], vec![TO_DELETE_TAG.to_string()])
                .await?;
        }
        Ok(group)
    }

    /// Tag an untagged group for this cluster; refuse another cluster's group
    async fn claim(&self, mut group: SecurityGroup) -> Result<SecurityGroup> {
        let clusters = owning_clusters(&group.tags);
        if clusters.is_empty() {
            let key = cluster_tag_key(&self.cluster_id);
            info!(sg = %group.id, "Tagging security group with cluster ownership");
            let mut tags = Tags::new();
            tags.insert(key.clone(), CLUSTER_OWNED.to_string());
            self.cloud.create_tags(vec![group.id.clone()], tags).await?;
            group.tags.insert(key, CLUSTER_OWNED.to_string());
            return Ok(group);
        }

        if !clusters
            .iter()
            .any(|c| self.accepted_clusters.iter().any(|a| a == c))
        {
            return Err(Error::BelongsToAnotherCluster {
                name: group.name.clone(),
                cluster: clusters.join(","),
            });
        }

        Ok(group)
    }

    /// Read groups by id, failing if any is missing
    pub async fn read_groups(&self, ids: &[String]) -> Result<Vec<SecurityGroup>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let filter = SecurityGroupFilter {
            ids: ids.to_vec(),
            ..Default::default()
        };
        let groups = self.cloud.read_security_groups(&filter).await?;
        if let Some(missing) = ids.iter().find(|id| !groups.iter().any(|g| &g.id == *id)) {
            return Err(Error::NoSecurityGroup(format!("{} not found", missing)));
        }
        Ok(groups)
    }

    /// Pick the backend group among the groups of `vms`.
    ///
    /// Main group of the cluster first, then the group tagged with `role`
    /// carrying the fewest role tags, then the first group read.
    pub async fn select_target(&self, vms: &[Vm], role: &TargetRole) -> Result<SecurityGroup> {
        let mut ids: Vec<String> = Vec::new();
        for vm in vms {
            for sg in &vm.security_groups {
                if !ids.contains(&sg.id) {
                    ids.push(sg.id.clone());
                }
            }
        }
        if ids.is_empty() {
            return Err(Error::NoSecurityGroup(
                "backend VMs carry no security group".into(),
            ));
        }

        let filter = SecurityGroupFilter {
            ids: ids.clone(),
            ..Default::default()
        };
        let mut groups = self.cloud.read_security_groups(&filter).await?;
        // keep first-read order
        groups.sort_by_key(|g| ids.iter().position(|id| id == &g.id));

        let main_key = main_sg_tag_key(&self.cluster_id);
        if let Some(main) = groups.iter().find(|g| g.tags.contains_key(&main_key)) {
            debug!(sg = %main.id, "Selected main security group as target");
            return Ok(main.clone());
        }

        let role_key = role_tag_key(role.as_str());
        let by_role = groups
            .iter()
            .filter(|g| g.tags.contains_key(&role_key))
            .min_by_key(|g| role_count(&g.tags));
        if let Some(group) = by_role {
            debug!(sg = %group.id, role = role.as_str(), "Selected role security group as target");
            return Ok(group.clone());
        }

        groups
            .into_iter()
            .next()
            .ok_or_else(|| Error::NoSecurityGroup("backend security groups not readable".into()))
    }

    /// Mark a group for the garbage collector
    pub async fn mark_for_deletion(&self, group: &SecurityGroup) -> Result<()> {
        if group.tags.contains_key(TO_DELETE_TAG) {
            return Ok(());
        }
        info!(sg = %group.id, "Marking security group for deletion");
        let mut tags = Tags::new();
        tags.insert(TO_DELETE_TAG.to_string(), chrono::Utc::now().to_rfc3339());
        self.cloud.create_tags(vec![group.id.clone()], tags).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::platform::MemoryCloud;
    use crate::domain::tags::ownership_tags;
    use crate::domain::types::{SecurityGroupRef, VmState};
    use assert_matches::assert_matches;
    use std::sync::Arc;

    fn manager(cloud: &Arc<MemoryCloud>) -> SecurityGroupManager {
        SecurityGroupManager::new(cloud.clone(), "foo", vec!["foo".into()])
    }

    fn vm(id: &str, groups: &[&str]) -> Vm {
        Vm {
            id: id.into(),
            node_name: format!("node-{}", id),
            state: VmState::Running,
            subregion: "eu-west-2a".into(),
            subnet_id: "subnet-1".into(),
            net_id: "vpc-1".into(),
            security_groups: groups
                .iter()
                .map(|g| SecurityGroupRef {
                    id: g.to_string(),
                    name: g.to_string(),
                })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_ensure_frontend_creates_then_reuses() {
        let cloud = Arc::new(MemoryCloud::new());
        let mgr = manager(&cloud);
        let tags = ownership_tags("foo", "shop/web");

        let first = mgr.ensure_frontend("lb1", "vpc-1", &tags).await.unwrap();
        assert_eq!(first.name, "k8s-elb-lb1");
        assert_eq!(first.tags.get("OscK8sClusterID/foo").map(String::as_str), Some("owned"));

        let before = cloud.mutation_count();
        let second = mgr.ensure_frontend("lb1", "vpc-1", &tags).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(cloud.mutation_count(), before);
    }

    #[tokio::test]
    async fn test_ensure_frontend_claims_untagged_and_rejects_foreign() {
        let cloud = Arc::new(MemoryCloud::new());
        cloud.add_security_group("k8s-elb-lb1", "vpc-1", Tags::new());
        let group = manager(&cloud)
            .ensure_frontend("lb1", "vpc-1", &Tags::new())
            .await
            .unwrap();
        assert!(group.tags.contains_key("OscK8sClusterID/foo"));

        let cloud = Arc::new(MemoryCloud::new());
        cloud.add_security_group("k8s-elb-lb2", "vpc-1", ownership_tags("bar", "x/y"));
        assert_matches!(
            manager(&cloud).ensure_frontend("lb2", "vpc-1", &Tags::new()).await,
            Err(Error::BelongsToAnotherCluster { .. })
        );
    }

    #[tokio::test]
    async fn test_ensure_frontend_recovers_from_concurrent_create() {
        let cloud = Arc::new(MemoryCloud::new());
        cloud.add_security_group("k8s-elb-lb1", "vpc-1", ownership_tags("foo", "shop/web"));
        cloud.hide_security_groups_once();

        let group = manager(&cloud)
            .ensure_frontend("lb1", "vpc-1", &Tags::new())
            .await
            .unwrap();
        assert_eq!(group.name, "k8s-elb-lb1");
    }

    #[tokio::test]
    async fn test_ensure_frontend_unmarks_reused_group() {
        let cloud = Arc::new(MemoryCloud::new());
        let mgr = manager(&cloud);
        let tags = ownership_tags("foo", "shop/web");
        let group = mgr.ensure_frontend("lb1", "vpc-1", &tags).await.unwrap();
        mgr.mark_for_deletion(&group).await.unwrap();
        assert!(cloud.security_group(&group.id).unwrap().tags.contains_key(TO_DELETE_TAG));

        cloud.clear_mutations();
        let reused = mgr.ensure_frontend("lb1", "vpc-1", &tags).await.unwrap();
        assert_eq!(reused.id, group.id);
        assert!(!reused.tags.contains_key(TO_DELETE_TAG));
        assert!(!cloud.security_group(&group.id).unwrap().tags.contains_key(TO_DELETE_TAG));
        assert_eq!(cloud.mutations(), vec![format!("DeleteTags {}", group.id)]);
    }

    #[tokio::test]
    async fn test_select_target_prefers_main_then_most_specific_role() {
        let cloud = Arc::new(MemoryCloud::new());
        let mut shared = Tags::new();
        shared.insert(role_tag_key("worker"), String::new());
        shared.insert(role_tag_key("controlplane"), String::new());
        let shared = cloud.add_security_group("shared", "vpc-1", shared);
        let mut workers = Tags::new();
        workers.insert(role_tag_key("worker"), String::new());
        let workers = cloud.add_security_group("workers", "vpc-1", workers);
        let plain = cloud.add_security_group("plain", "vpc-1", Tags::new());

        let vms = vec![vm("i-1", &[&plain, &shared]), vm("i-2", &[&workers])];
        let target = manager(&cloud)
            .select_target(&vms, &TargetRole::Worker)
            .await
            .unwrap();
        assert_eq!(target.id, workers);

        let target = manager(&cloud)
            .select_target(&vms, &TargetRole::Other("ingress".into()))
            .await
            .unwrap();
        assert_eq!(target.id, plain);

        let mut main = Tags::new();
        main.insert(main_sg_tag_key("foo"), "True".into());
        let main = cloud.add_security_group("main", "vpc-1", main);
        let vms = vec![vm("i-1", &[&workers, &main])];
        let target = manager(&cloud)
            .select_target(&vms, &TargetRole::Worker)
            .await
            .unwrap();
        assert_eq!(target.id, main);
    }

    #[tokio::test]
    async fn test_select_target_without_groups_is_fatal() {
        let cloud = Arc::new(MemoryCloud::new());
        let err = manager(&cloud)
            .select_target(&[vm("i-1", &[])], &TargetRole::Worker)
            .await
            .unwrap_err();
        assert_matches!(err, Error::NoSecurityGroup(_));
        assert!(!err.is_retryable());
    }
}
