//! Security group garbage collector
//!
//! Front-end groups cannot be deleted together with their load balancer:
//! backend groups still reference them and the cloud releases the
//! attachment asynchronously. Deletion marks them with `OscK8sToDelete`;
//! this sweep removes the referencing rules and then the group itself.

use crate::domain::ports::CloudApiRef;
use crate::domain::tags::{cluster_tag_key, TO_DELETE_TAG};
use crate::domain::types::{SecurityGroup, SecurityGroupFilter, SecurityGroupRule};
use crate::error::Result;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outcome of one sweep
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GcReport {
    /// Ids of the groups deleted
    pub deleted: Vec<String>,
    /// Ids of the groups whose cleanup failed
    pub failed: Vec<String>,
}

pub struct GarbageCollector {
    cloud: CloudApiRef,
    cluster_id: String,
}

impl GarbageCollector {
    pub fn new(cloud: CloudApiRef, cluster_id: impl Into<String>) -> Self {
        Self {
            cloud,
            cluster_id: cluster_id.into(),
        }
    }

    /// Delete every marked group of the cluster. A failure only skips the
    /// group it happened on.
    pub async fn sweep(&self) -> Result<GcReport> {
        let filter = SecurityGroupFilter {
            tag_keys: vec![cluster_tag_key(&self.cluster_id)],
            ..Default::default()
        };
        let (marked, _kept): (Vec<SecurityGroup>, Vec<SecurityGroup>) = self
            .cloud
            .read_security_groups(&filter)
            .await?
            .into_iter()
            .partition(|g| g.tags.contains_key(TO_DELETE_TAG));

        let mut report = GcReport::default();
        if marked.is_empty() {
            debug!(cluster = %self.cluster_id, "No security group marked for deletion");
            return Ok(report);
        }

        for group in marked {
            match self.collect(&group).await {
                Ok(()) => {
                    info!(sg = %group.id, name = %group.name, "Deleted marked security group");
                    report.deleted.push(group.id);
                }
                Err(e) => {
                    warn!(sg = %group.id, error = %e, "Security group cleanup failed, retrying next sweep");
                    report.failed.push(group.id);
                }
            }
        }
        Ok(report)
    }

    /// Drop the membership rules naming `group`, then the group
    async fn collect(&self, group: &SecurityGroup) -> Result<()> {
        let all = self
            .cloud
            .read_security_groups(&SecurityGroupFilter::default())
            .await?;
        for other in all.iter().filter(|g| g.id != group.id) {
            for rule in other
                .inbound_rules
                .iter()
                .filter(|r| r.member_groups.contains(&group.id))
            {
                debug!(sg = %other.id, member = %group.id, port = rule.from_port, "Deleting rule referencing marked group");
                let principal = SecurityGroupRule {
                    protocol: rule.protocol.clone(),
                    from_port: rule.from_port,
                    to_port: rule.to_port,
                    ip_ranges: Vec::new(),
                    member_groups: vec![group.id.clone()],
                };
                self.cloud.delete_security_group_rule(&other.id, principal).await?;
            }
        }
        self.cloud.delete_security_group(&group.id).await
    }

    /// Sweep every `interval` until `shutdown` fires; `on_sweep` sees every
    /// successful report
    pub async fn run<F>(&self, interval: Duration, shutdown: CancellationToken, mut on_sweep: F)
    where
        F: FnMut(&GcReport) + Send,
    {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(cluster = %self.cluster_id, interval_secs = interval.as_secs(), "Security group collector started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Security group collector stopped");
                    return;
                }
                _ = ticker.tick() => {
                    match self.sweep().await {
                        Ok(report) => {
                            if !report.deleted.is_empty() || !report.failed.is_empty() {
                                info!(deleted = report.deleted.len(), failed = report.failed.len(), "Sweep finished");
                            }
                            on_sweep(&report);
                        }
                        Err(e) => warn!(error = %e, "Sweep failed"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controlplane::platform::MemoryCloud;
    use crate::domain::tags::{cluster_tag_key, CLUSTER_OWNED};
    use crate::domain::types::Tags;
    use std::sync::Arc;

    fn cluster_tags(marked: bool) -> Tags {
        let mut tags = Tags::new();
        tags.insert(cluster_tag_key("foo"), CLUSTER_OWNED.into());
        if marked {
            tags.insert(TO_DELETE_TAG.into(), "2026-01-01T00:00:00Z".into());
        }
        tags
    }

    #[tokio::test]
    async fn test_rules_are_deleted_before_group() {
        let cloud = Arc::new(MemoryCloud::new());
        let front = cloud.add_security_group("k8s-elb-a", "vpc-1", cluster_tags(true));
        let workers = cloud.add_security_group("workers", "vpc-1", cluster_tags(false));
        let masters = cloud.add_security_group("masters", "vpc-1", Tags::new());
        cloud.add_inbound_rule(&workers, SecurityGroupRule::tcp_members(30080, vec![front.clone()]));
        cloud.add_inbound_rule(&workers, SecurityGroupRule::tcp_members(30443, vec![front.clone()]));
        cloud.add_inbound_rule(&masters, SecurityGroupRule::tcp_members(30080, vec![front.clone()]));

        let report = GarbageCollector::new(cloud.clone(), "foo").sweep().await.unwrap();
        assert_eq!(report.deleted, vec![front.clone()]);
        assert!(report.failed.is_empty());

        let mutations = cloud.mutations();
        assert_eq!(mutations.len(), 4);
        assert_eq!(mutations.last().map(String::as_str), Some(format!("DeleteSecurityGroup {}", front).as_str()));
        assert!(mutations[..3].iter().all(|m| m.starts_with("DeleteSecurityGroupRule")));

        assert!(cloud.security_group(&front).is_none());
        assert!(cloud.security_group(&workers).unwrap().inbound_rules.is_empty());
        assert!(cloud.security_group(&masters).unwrap().inbound_rules.is_empty());
    }

    #[tokio::test]
    async fn test_unmarked_and_foreign_groups_are_kept() {
        let cloud = Arc::new(MemoryCloud::new());
        let kept = cloud.add_security_group("k8s-elb-b", "vpc-1", cluster_tags(false));
        let mut foreign_tags = Tags::new();
        foreign_tags.insert(cluster_tag_key("bar"), CLUSTER_OWNED.into());
        foreign_tags.insert(TO_DELETE_TAG.into(), "2026-01-01T00:00:00Z".into());
        let foreign = cloud.add_security_group("k8s-elb-c", "vpc-1", foreign_tags);

        let report = GarbageCollector::new(cloud.clone(), "foo").sweep().await.unwrap();
        assert_eq!(report, GcReport::default());
        assert!(cloud.security_group(&kept).is_some());
        assert!(cloud.security_group(&foreign).is_some());
        assert_eq!(cloud.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_marked_groups_referencing_each_other() {
        let cloud = Arc::new(MemoryCloud::new());
        let first = cloud.add_security_group("k8s-elb-d", "vpc-1", cluster_tags(true));
        let second = cloud.add_security_group("k8s-elb-e", "vpc-1", cluster_tags(true));
        // `second` keeps `first` busy until its rule is gone
        cloud.add_inbound_rule(&second, SecurityGroupRule::tcp_members(80, vec![first.clone()]));

        let report = GarbageCollector::new(cloud.clone(), "foo").sweep().await.unwrap();
        assert_eq!(report.deleted.len(), 2);
        assert!(cloud.security_group(&first).is_none());
        assert!(cloud.security_group(&second).is_none());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let cloud = Arc::new(MemoryCloud::new());
        let marked = cloud.add_security_group("k8s-elb-f", "vpc-1", cluster_tags(true));
        let token = CancellationToken::new();
        let gc = GarbageCollector::new(cloud.clone(), "foo");

        let stopper = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stopper.cancel();
        });
        let mut deleted = Vec::new();
        gc.run(Duration::from_millis(10), token, |report| {
            deleted.extend(report.deleted.iter().cloned())
        })
        .await;
        assert!(cloud.security_group(&marked).is_none());
        assert_eq!(deleted, vec![marked]);
    }
}
