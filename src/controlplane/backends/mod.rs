//! Load Balancer Backends
//!
//! Two strategies implement [`LoadBalancerBackend`]:
//! - Classic: listener-based load balancer fronting every backend VM
//! - VIP: floating network interface bound to one backend VM
//!
//! Both share the front-end security group handling defined here.

pub mod classic;
pub mod vip;

pub use classic::*;
pub use vip::*;

use crate::controlplane::membership::SharedRng;
use crate::controlplane::rules::{uniform_rules, PrincipalKind, RuleReconciler};
use crate::controlplane::security_group::{frontend_group_name, SecurityGroupManager};
use crate::domain::ports::{CloudApiRef, LoadBalancerBackendRef, LoadBalancerType};
use crate::error::Result;
use crate::spec::LoadBalancerSpec;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Backoff attached to not-ready results
pub const NOT_READY_BACKOFF: Duration = Duration::from_secs(30);

/// Collaborators shared by every backend
#[derive(Clone)]
pub struct BackendContext {
    pub cloud: CloudApiRef,
    pub cluster_id: String,
    /// Cluster ids treated as this cluster
    pub accepted_clusters: Vec<String>,
    pub rng: SharedRng,
    pub not_ready_backoff: Duration,
}

impl BackendContext {
    pub fn security_groups(&self) -> SecurityGroupManager {
        SecurityGroupManager::new(
            self.cloud.clone(),
            self.cluster_id.clone(),
            self.accepted_clusters.clone(),
        )
    }
}

/// Factory for backend strategies
pub struct BackendFactory;

impl BackendFactory {
    /// Create the backend serving a load balancer type
    pub fn create(kind: LoadBalancerType, ctx: BackendContext) -> LoadBalancerBackendRef {
        match kind {
            LoadBalancerType::Lbu => Arc::new(ClassicBackend::new(ctx)),
            LoadBalancerType::Vip => Arc::new(VipBackend::new(ctx)),
        }
    }

    /// Create the backend a spec asks for
    pub fn for_spec(spec: &LoadBalancerSpec, ctx: BackendContext) -> LoadBalancerBackendRef {
        Self::create(spec.lb_type, ctx)
    }
}

// =============================================================================
// Front-end Security Groups
// =============================================================================

/// Groups attached to the front end of an instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrontendGroups {
    /// Every group id to attach, primary first
    pub ids: Vec<String>,
    /// Group used as principal in backend membership rules
    pub primary: String,
}

/// Ensure the front-end groups of a spec inside `net_id`.
///
/// The managed group gets one CIDR rule per front-end port; user-supplied
/// groups are attached as they are.
pub(crate) async fn ensure_frontend_groups(
    ctx: &BackendContext,
    spec: &LoadBalancerSpec,
    net_id: &str,
) -> Result<FrontendGroups> {
    let manager = ctx.security_groups();

    let mut ids: Vec<String> = if spec.manages_security_group() {
        let group = manager.ensure_frontend(&spec.names[0], net_id, &spec.tags).await?;
        let desired = uniform_rules(spec.frontend_ports(), &spec.allow_from);
        RuleReconciler::new(ctx.cloud.clone())
            .reconcile(&group, &desired, PrincipalKind::Cidr, None)
            .await?;
        vec![group.id]
    } else {
        let user: Vec<String> = spec.security_groups.iter().cloned().collect();
        manager.read_groups(&user).await?;
        user
    };

    let extra: Vec<String> = spec
        .additional_security_groups
        .iter()
        .filter(|id| !ids.contains(*id))
        .cloned()
        .collect();
    manager.read_groups(&extra).await?;
    ids.extend(extra);

    debug!(groups = ?ids, "Front-end security groups ready");
    Ok(FrontendGroups {
        primary: ids[0].clone(),
        ids,
    })
}

/// Mark the managed front-end group for garbage collection. Callers must
/// have confirmed that no instance of the spec still exists.
pub(crate) async fn release_frontend_group(ctx: &BackendContext, spec: &LoadBalancerSpec) -> Result<()> {
    if !spec.manages_security_group() {
        return Ok(());
    }
    let manager = ctx.security_groups();
    match manager
        .find_by_name(&frontend_group_name(&spec.names[0]), None)
        .await?
    {
        Some(group) => manager.mark_for_deletion(&group).await,
        None => Ok(()),
    }
}
