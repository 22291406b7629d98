//! Load balancer controller
//!
//! Entry points called by the controller runtime for one Service at a time:
//! ensure, update, get and delete. Each call builds the spec, picks the
//! backend strategy and loops over every instance of the spec.

use crate::controlplane::backends::{
    release_frontend_group, BackendContext, BackendFactory, NOT_READY_BACKOFF,
};
use crate::controlplane::dns::CachingResolver;
use crate::controlplane::gc::GarbageCollector;
use crate::controlplane::membership::{entropy_rng, seeded_rng, SharedRng};
use crate::controlplane::ownership::OwnershipGuard;
use crate::domain::ports::*;
use crate::domain::types::{NodeRef, Vm};
use crate::error::{Error, Result};
use crate::spec::{IngressAddress, IpMode, LoadBalancerSpec, SpecBuilder, SpecDefaults};
use k8s_openapi::api::core::v1::{LoadBalancerIngress, LoadBalancerStatus, Node, Service};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

// =============================================================================
// Configuration
// =============================================================================

/// Controller configuration
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Cluster the controller runs for
    pub cluster_id: String,
    /// Older cluster ids whose resources are still ours
    pub legacy_cluster_ids: Vec<String>,
    pub defaults: SpecDefaults,
    pub not_ready_backoff: Duration,
    /// TTL of the name resolution cache
    pub resolver_ttl: Duration,
    pub gc_interval: Duration,
    /// Fixed seed for the random source; entropy when unset
    pub rng_seed: Option<u64>,
}

impl ControllerConfig {
    pub fn new(cluster_id: impl Into<String>) -> Self {
        let cluster_id = cluster_id.into();
        Self {
            defaults: SpecDefaults::for_cluster(cluster_id.clone()),
            cluster_id,
            legacy_cluster_ids: Vec::new(),
            not_ready_backoff: NOT_READY_BACKOFF,
            resolver_ttl: Duration::from_secs(30),
            gc_interval: Duration::from_secs(60),
            rng_seed: None,
        }
    }

    /// The cluster id followed by the legacy ids
    pub fn accepted_clusters(&self) -> Vec<String> {
        let mut ids = vec![self.cluster_id.clone()];
        ids.extend(self.legacy_cluster_ids.iter().cloned());
        ids
    }
}

// =============================================================================
// Status
// =============================================================================

/// One published address
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngressView {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_mode: Option<IpMode>,
}

/// Status published for a Service, one entry per instance
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerStatusView {
    pub ingress: Vec<IngressView>,
}

impl LoadBalancerStatusView {
    /// Kubernetes representation (without ipMode)
    pub fn to_k8s(&self) -> LoadBalancerStatus {
        LoadBalancerStatus {
            ingress: Some(
                self.ingress
                    .iter()
                    .map(|i| LoadBalancerIngress {
                        hostname: i.hostname.clone(),
                        ip: i.ip.clone(),
                        ..Default::default()
                    })
                    .collect(),
            ),
        }
    }

    /// Merge patch body for the Service status subresource
    pub fn status_patch(&self) -> Result<serde_json::Value> {
        Ok(serde_json::json!({
            "status": {
                "loadBalancer": {
                    "ingress": serde_json::to_value(&self.ingress)?,
                }
            }
        }))
    }
}

/// Node reference from a Kubernetes Node
pub fn node_ref(node: &Node) -> NodeRef {
    NodeRef {
        name: node.metadata.name.clone().unwrap_or_default(),
        provider_id: node.spec.as_ref().and_then(|s| s.provider_id.clone()),
        labels: node.metadata.labels.clone().unwrap_or_default(),
    }
}

// =============================================================================
// Controller
// =============================================================================

/// Reconciles Services of type LoadBalancer
pub struct LoadBalancerController {
    config: ControllerConfig,
    cloud: CloudApiRef,
    nodes: NodeDirectoryRef,
    resolver: NameResolverRef,
    builder: SpecBuilder,
    guard: OwnershipGuard,
    rng: SharedRng,
}

impl LoadBalancerController {
    pub fn new(
        config: ControllerConfig,
        cloud: CloudApiRef,
        nodes: NodeDirectoryRef,
        resolver: NameResolverRef,
    ) -> Self {
        let rng = match config.rng_seed {
            Some(seed) => seeded_rng(seed),
            None => entropy_rng(),
        };
        Self {
            builder: SpecBuilder::new(config.defaults.clone()),
            guard: OwnershipGuard::new(config.accepted_clusters()),
            resolver: Arc::new(CachingResolver::new(resolver, config.resolver_ttl)),
            config,
            cloud,
            nodes,
            rng,
        }
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    pub fn spec_builder(&self) -> &SpecBuilder {
        &self.builder
    }

    /// Collector sweeping groups marked by this controller's deletes
    pub fn garbage_collector(&self) -> GarbageCollector {
        GarbageCollector::new(self.cloud.clone(), self.config.cluster_id.clone())
    }

    fn context(&self) -> BackendContext {
        BackendContext {
            cloud: self.cloud.clone(),
            cluster_id: self.config.cluster_id.clone(),
            accepted_clusters: self.config.accepted_clusters(),
            rng: self.rng.clone(),
            not_ready_backoff: self.config.not_ready_backoff,
        }
    }

    fn backend(&self, spec: &LoadBalancerSpec) -> LoadBalancerBackendRef {
        BackendFactory::for_spec(spec, self.context())
    }

    /// Names of the cloud resources backing a Service
    pub fn load_balancer_names(&self, service: &Service) -> Result<Vec<String>> {
        Ok(self.builder.build(service)?.names)
    }

    /// Running VMs behind the nodes selected by the spec
    async fn backend_vms(&self, spec: &LoadBalancerSpec, nodes: &[NodeRef]) -> Result<Vec<Vm>> {
        let selected: Vec<NodeRef> = nodes
            .iter()
            .filter(|n| {
                spec.target_node_labels
                    .iter()
                    .all(|(k, v)| n.labels.get(k) == Some(v))
            })
            .cloned()
            .collect();
        let vms: Vec<Vm> = self
            .nodes
            .vms_for_nodes(&selected)
            .await?
            .into_iter()
            .filter(Vm::is_running)
            .collect();
        debug!(
            service = %spec.service_name,
            nodes = nodes.len(),
            selected = selected.len(),
            running = vms.len(),
            "Selected backend VMs"
        );
        Ok(vms)
    }

    /// Create or converge every instance of a Service
    pub async fn ensure_load_balancer(
        &self,
        service: &Service,
        nodes: &[NodeRef],
    ) -> Result<Readiness<LoadBalancerStatusView>> {
        self.reconcile(service, nodes, true).await
    }

    /// Converge instances that already exist; a missing one is an error
    pub async fn update_load_balancer(
        &self,
        service: &Service,
        nodes: &[NodeRef],
    ) -> Result<Readiness<LoadBalancerStatusView>> {
        self.reconcile(service, nodes, false).await
    }

    async fn reconcile(
        &self,
        service: &Service,
        nodes: &[NodeRef],
        create_missing: bool,
    ) -> Result<Readiness<LoadBalancerStatusView>> {
        let spec = self.builder.build(service)?;
        let vms = self.backend_vms(&spec, nodes).await?;
        let backend = self.backend(&spec);

        let mut view = LoadBalancerStatusView::default();
        let mut waiting = Vec::new();
        let mut errors = Vec::new();

        // every instance is attempted, a failure never stops the loop
        for instance in spec.instance_specs() {
            let outcome = match backend.exists(&instance).await {
                Ok(Some(tags)) => match self.guard.check(instance.name, &tags, &spec.service_name) {
                    Ok(()) => backend.update(&spec, &instance, &vms).await,
                    Err(e) => Err(e),
                },
                Ok(None) if create_missing => backend.create(&spec, &instance, &vms).await,
                Ok(None) => Err(Error::ResourceNotFound {
                    kind: backend.kind().to_string(),
                    name: instance.name.to_string(),
                }),
                Err(e) => Err(e),
            };

            let rendered = match outcome {
                Ok(Readiness::Ready(ingress)) => self.render(&spec, ingress).await,
                Ok(Readiness::NotReady { reason, .. }) => Ok(Err(reason)),
                Err(e) => Err(e),
            };

            match rendered {
                Ok(Ok(ingress)) => view.ingress.push(ingress),
                Ok(Err(reason)) => {
                    info!(service = %spec.service_name, lb = %instance.name, %reason, "Load balancer not ready");
                    waiting.push(reason);
                }
                Err(e) => {
                    warn!(service = %spec.service_name, lb = %instance.name, error = %e, "Load balancer reconcile failed");
                    errors.push(e);
                }
            }
        }

        if let Some(pos) = errors.iter().position(|e| !e.is_retryable()) {
            return Err(errors.swap_remove(pos));
        }
        if !errors.is_empty() && errors.len() == spec.instances {
            return Err(errors.swap_remove(0));
        }
        if view.ingress.len() < spec.instances {
            waiting.extend(errors.iter().map(|e| e.to_string()));
            return Ok(Readiness::not_ready(
                self.config.not_ready_backoff,
                format!(
                    "{}/{} instances ready: {}",
                    view.ingress.len(),
                    spec.instances,
                    waiting.join("; ")
                ),
            ));
        }

        info!(service = %spec.service_name, instances = spec.instances, "Load balancer ready");
        Ok(Readiness::Ready(view))
    }

    /// Pick the addresses to publish; `Err(reason)` when an IP is wanted
    /// but none is known yet
    async fn render(
        &self,
        spec: &LoadBalancerSpec,
        ingress: Ingress,
    ) -> Result<std::result::Result<IngressView, String>> {
        let hostname = ingress
            .hostname
            .clone()
            .filter(|_| spec.ingress_address.wants_hostname());
        let wants_ip = spec.ingress_address.wants_ip() || hostname.is_none();

        let ip = match (wants_ip, ingress.public_ip, ingress.hostname.as_deref()) {
            (false, _, _) => None,
            (true, Some(ip), _) => Some(ip),
            (true, None, Some(host)) => self.resolve_first(host).await?,
            (true, None, None) => None,
        };

        if spec.ingress_address == IngressAddress::Ip && ip.is_none() {
            return Ok(Err("no IP address published yet".to_string()));
        }
        if hostname.is_none() && ip.is_none() {
            return Ok(Err("no address published yet".to_string()));
        }

        Ok(Ok(IngressView {
            ip_mode: ip.as_ref().map(|_| spec.ip_mode.unwrap_or(IpMode::Vip)),
            hostname,
            ip,
        }))
    }

    async fn resolve_first(&self, host: &str) -> Result<Option<String>> {
        let ips = self.resolver.resolve(host).await?;
        Ok(ips
            .iter()
            .find(|ip| ip.is_ipv4())
            .or_else(|| ips.first())
            .map(IpAddr::to_string))
    }

    /// Published status of a Service, `None` when nothing exists
    pub async fn get_load_balancer(&self, service: &Service) -> Result<Option<LoadBalancerStatusView>> {
        let spec = self.builder.build(service)?;
        let backend = self.backend(&spec);

        let mut view = LoadBalancerStatusView::default();
        for instance in spec.instance_specs() {
            if let Some(ingress) = backend.get(&spec, &instance).await? {
                if let Ok(rendered) = self.render(&spec, ingress).await? {
                    view.ingress.push(rendered);
                }
            }
        }
        Ok((!view.ingress.is_empty()).then_some(view))
    }

    /// Delete every instance of a Service. Resources owned by another
    /// cluster or Service are left alone without error.
    pub async fn ensure_load_balancer_deleted(&self, service: &Service) -> Result<()> {
        let spec = self.builder.build(service)?;
        let backend = self.backend(&spec);
        let mut first_error = None;

        for instance in spec.instance_specs() {
            let result = match backend.exists(&instance).await {
                Ok(Some(tags)) => match self.guard.check(instance.name, &tags, &spec.service_name) {
                    Err(e) if e.is_ownership_conflict() => {
                        info!(lb = %instance.name, reason = %e, "Not deleting foreign load balancer");
                        continue;
                    }
                    Err(e) => Err(e),
                    Ok(()) => backend.delete(&spec, &instance).await,
                },
                Ok(None) => backend.delete(&spec, &instance).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                warn!(lb = %instance.name, error = %e, "Load balancer deletion failed");
                first_error.get_or_insert(e);
            }
        }

        // the front-end group is shared: mark it only once no instance is left
        let mut remaining = Vec::new();
        for instance in spec.instance_specs() {
            match backend.exists(&instance).await {
                Ok(None) => {}
                Ok(Some(_)) => remaining.push(instance.name.to_string()),
                Err(e) => {
                    first_error.get_or_insert(e);
                    remaining.push(instance.name.to_string());
                }
            }
        }
        if remaining.is_empty() {
            if let Err(e) = release_frontend_group(&self.context(), &spec).await {
                first_error.get_or_insert(e);
            }
        } else {
            debug!(service = %spec.service_name, remaining = ?remaining, "Instances remain, keeping front-end group");
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!(service = %spec.service_name, "Load balancer deleted");
                Ok(())
            }
        }
    }
}
