//! In-memory Cloud Adapter
//!
//! A process-local implementation of the cloud and node-directory ports.
//! It backs the standalone mode of the binary and every test in the crate:
//! each mutating call is appended to a log so tests can assert how many
//! calls a reconcile issued, and in which order.

use crate::domain::ports::{CloudApi, NodeDirectory};
use crate::domain::tags::{NAME_TAG, PUBLIC_IP_POOL_TAG};
use crate::domain::types::*;
use crate::error::{Error, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

// =============================================================================
// Configuration
// =============================================================================

/// Behavior knobs of the in-memory cloud
#[derive(Debug, Clone)]
pub struct MemoryCloudConfig {
    /// Region used in generated DNS names
    pub region: String,
    /// Give new load balancers and interfaces a DNS name right away
    pub assign_dns_names: bool,
    /// Give public load balancers an address when none is requested
    pub assign_public_ips: bool,
}

impl Default for MemoryCloudConfig {
    fn default() -> Self {
        Self {
            region: "eu-west-2".to_string(),
            assign_dns_names: true,
            assign_public_ips: true,
        }
    }
}

// =============================================================================
// State
// =============================================================================

#[derive(Debug, Default)]
struct CloudState {
    load_balancers: BTreeMap<String, LoadBalancer>,
    /// Policies created per load balancer
    policies: BTreeMap<String, BTreeSet<String>>,
    security_groups: Vec<SecurityGroup>,
    subnets: Vec<Subnet>,
    route_tables: Vec<RouteTable>,
    public_ips: Vec<PublicIp>,
    nics: Vec<NetworkInterface>,
    next_id: u64,
    /// Next name-filtered group read returns nothing
    hide_security_groups: bool,
}

impl CloudState {
    fn next_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}-{:08x}", prefix, self.next_id)
    }

    fn next_address(&mut self, first_octets: &str) -> String {
        self.next_id += 1;
        format!("{}.{}", first_octets, self.next_id % 250 + 1)
    }

    fn load_balancer_mut(&mut self, name: &str) -> Result<&mut LoadBalancer> {
        self.load_balancers
            .get_mut(name)
            .ok_or_else(|| not_found("LoadBalancer", name))
    }

    fn security_group_mut(&mut self, id: &str) -> Result<&mut SecurityGroup> {
        self.security_groups
            .iter_mut()
            .find(|g| g.id == id)
            .ok_or_else(|| not_found("SecurityGroup", id))
    }

    fn tags_mut(&mut self, id: &str) -> Option<&mut Tags> {
        if let Some(g) = self.security_groups.iter_mut().find(|g| g.id == id) {
            return Some(&mut g.tags);
        }
        if let Some(lb) = self.load_balancers.get_mut(id) {
            return Some(&mut lb.tags);
        }
        if let Some(nic) = self.nics.iter_mut().find(|n| n.id == id) {
            return Some(&mut nic.tags);
        }
        if let Some(ip) = self.public_ips.iter_mut().find(|ip| ip.id == id) {
            return Some(&mut ip.tags);
        }
        self.subnets.iter_mut().find(|s| s.id == id).map(|s| &mut s.tags)
    }

    fn public_ip_mut(&mut self, id: &str) -> Result<&mut PublicIp> {
        self.public_ips
            .iter_mut()
            .find(|ip| ip.id == id)
            .ok_or_else(|| not_found("PublicIp", id))
    }

    fn nic_mut(&mut self, id: &str) -> Result<&mut NetworkInterface> {
        self.nics
            .iter_mut()
            .find(|n| n.id == id)
            .ok_or_else(|| not_found("NetworkInterface", id))
    }
}

fn not_found(kind: &str, name: &str) -> Error {
    Error::ResourceNotFound {
        kind: kind.to_string(),
        name: name.to_string(),
    }
}

fn exists(kind: &str, name: &str) -> Error {
    Error::ResourceExists {
        kind: kind.to_string(),
        name: name.to_string(),
    }
}

// =============================================================================
// Memory Cloud
// =============================================================================

/// Cloud API held in process memory
pub struct MemoryCloud {
    config: MemoryCloudConfig,
    state: RwLock<CloudState>,
    /// Mutating calls, in issue order
    mutations: Mutex<Vec<String>>,
    /// Operations whose next call fails
    failures: Mutex<Vec<String>>,
}

impl Default for MemoryCloud {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCloud {
    pub fn new() -> Self {
        Self::with_config(MemoryCloudConfig::default())
    }

    pub fn with_config(config: MemoryCloudConfig) -> Self {
        Self {
            config,
            state: RwLock::new(CloudState::default()),
            mutations: Mutex::new(Vec::new()),
            failures: Mutex::new(Vec::new()),
        }
    }

    fn record(&self, operation: &str, target: &str) {
        debug!(operation, target, "Memory cloud mutation");
        self.mutations.lock().push(format!("{} {}", operation, target));
    }

    /// Mutating calls issued so far, as `"<Operation> <target>"`
    pub fn mutations(&self) -> Vec<String> {
        self.mutations.lock().clone()
    }

    pub fn mutation_count(&self) -> usize {
        self.mutations.lock().len()
    }

    pub fn clear_mutations(&self) {
        self.mutations.lock().clear();
    }

    /// Make the next call of `operation` fail with a retryable error
    pub fn fail_once(&self, operation: &str) {
        self.failures.lock().push(operation.to_string());
    }

    fn injected_failure(&self, operation: &str) -> Result<()> {
        let mut failures = self.failures.lock();
        match failures.iter().position(|f| f == operation) {
            Some(i) => {
                failures.remove(i);
                Err(Error::cloud(operation, "injected failure"))
            }
            None => Ok(()),
        }
    }

    // -------------------------------------------------------------------------
    // Seeding (not recorded as mutations)
    // -------------------------------------------------------------------------

    /// Seed a security group; returns its id
    pub fn add_security_group(&self, name: &str, net_id: &str, tags: Tags) -> String {
        let mut state = self.state.write();
        let id = state.next_id("sg");
        state.security_groups.push(SecurityGroup {
            id: id.clone(),
            name: name.to_string(),
            net_id: net_id.to_string(),
            description: String::new(),
            tags,
            inbound_rules: Vec::new(),
        });
        id
    }

    /// Seed an inbound rule on a group
    pub fn add_inbound_rule(&self, group_id: &str, rule: SecurityGroupRule) {
        let mut state = self.state.write();
        if let Ok(group) = state.security_group_mut(group_id) {
            group.inbound_rules.push(rule);
        }
    }

    pub fn add_subnet(&self, subnet: Subnet) {
        self.state.write().subnets.push(subnet);
    }

    pub fn add_route_table(&self, table: RouteTable) {
        self.state.write().route_tables.push(table);
    }

    /// Seed a public IP, optionally inside a pool; returns its id
    pub fn add_public_ip(&self, address: &str, pool: Option<&str>) -> String {
        let mut state = self.state.write();
        let id = state.next_id("eipalloc");
        let mut tags = Tags::new();
        if let Some(pool) = pool {
            tags.insert(PUBLIC_IP_POOL_TAG.to_string(), pool.to_string());
        }
        state.public_ips.push(PublicIp {
            id: id.clone(),
            address: address.to_string(),
            linked_nic_id: None,
            linked_load_balancer: None,
            tags,
        });
        id
    }

    /// Make the next name-filtered security group read come back empty
    pub fn hide_security_groups_once(&self) {
        self.state.write().hide_security_groups = true;
    }

    /// Simulate the cloud filling in an address after creation
    pub fn set_load_balancer_public_ip(&self, name: &str, address: &str) {
        if let Some(lb) = self.state.write().load_balancers.get_mut(name) {
            lb.public_ip = Some(address.to_string());
        }
    }

    // -------------------------------------------------------------------------
    // Inspection
    // -------------------------------------------------------------------------

    pub fn security_group(&self, id: &str) -> Option<SecurityGroup> {
        self.state
            .read()
            .security_groups
            .iter()
            .find(|g| g.id == id)
            .cloned()
    }

    pub fn public_ips(&self) -> Vec<PublicIp> {
        self.state.read().public_ips.clone()
    }

    pub fn network_interfaces(&self) -> Vec<NetworkInterface> {
        self.state.read().nics.clone()
    }
}

#[async_trait]
impl CloudApi for MemoryCloud {
    // -------------------------------------------------------------------------
    // Classic load balancers
    // -------------------------------------------------------------------------

    async fn read_load_balancer(&self, name: &str) -> Result<Option<LoadBalancer>> {
        Ok(self.state.read().load_balancers.get(name).cloned())
    }

    async fn create_load_balancer(&self, request: CreateLoadBalancerRequest) -> Result<LoadBalancer> {
        let mut state = self.state.write();
        if state.load_balancers.contains_key(&request.name) {
            return Err(exists("LoadBalancer", &request.name));
        }

        let public_ip = if request.internal {
            None
        } else if let Some(ip_id) = &request.public_ip_id {
            let name = request.name.clone();
            let ip = state.public_ip_mut(ip_id)?;
            if !ip.is_free() {
                return Err(Error::cloud(
                    "CreateLoadBalancer",
                    format!("public ip {} is already in use", ip_id),
                ));
            }
            ip.linked_load_balancer = Some(name);
            Some(ip.address.clone())
        } else if self.config.assign_public_ips {
            Some(state.next_address("192.0.2"))
        } else {
            None
        };

        let dns_name = self.config.assign_dns_names.then(|| {
            let scheme = if request.internal { "internal-" } else { "" };
            format!(
                "{}{}.{}.lbu.memory.internal",
                scheme, request.name, self.config.region
            )
        });

        let lb = LoadBalancer {
            name: request.name.clone(),
            dns_name,
            public_ip,
            internal: request.internal,
            subnets: request.subnets,
            security_groups: request.security_groups,
            listeners: request.listeners,
            backend_policies: Vec::new(),
            health_check: None,
            attributes: LoadBalancerAttributes {
                access_log: Some(AccessLog {
                    enabled: false,
                    emit_interval: 60,
                    bucket_name: String::new(),
                    bucket_prefix: String::new(),
                }),
                connection: Some(ConnectionSettings {
                    draining_enabled: false,
                    draining_timeout: 0,
                    idle_timeout: 60,
                }),
            },
            backend_vm_ids: Vec::new(),
            tags: request.tags,
        };
        state.load_balancers.insert(lb.name.clone(), lb.clone());
        drop(state);

        self.record("CreateLoadBalancer", &lb.name);
        Ok(lb)
    }

    async fn delete_load_balancer(&self, name: &str) -> Result<()> {
        self.injected_failure("DeleteLoadBalancer")?;
        let mut state = self.state.write();
        state
            .load_balancers
            .remove(name)
            .ok_or_else(|| not_found("LoadBalancer", name))?;
        state.policies.remove(name);
        for ip in state.public_ips.iter_mut() {
            if ip.linked_load_balancer.as_deref() == Some(name) {
                ip.linked_load_balancer = None;
            }
        }
        drop(state);

        self.record("DeleteLoadBalancer", name);
        Ok(())
    }

    async fn create_listeners(&self, name: &str, listeners: Vec<Listener>) -> Result<()> {
        let mut state = self.state.write();
        let lb = state.load_balancer_mut(name)?;
        if let Some(dup) = listeners.iter().find(|l| {
            lb.listeners
                .iter()
                .any(|e| e.load_balancer_port == l.load_balancer_port)
        }) {
            return Err(exists("Listener", &format!("{}:{}", name, dup.load_balancer_port)));
        }
        lb.listeners.extend(listeners);
        drop(state);

        self.record("CreateListeners", name);
        Ok(())
    }

    async fn delete_listeners(&self, name: &str, load_balancer_ports: Vec<i32>) -> Result<()> {
        let mut state = self.state.write();
        let lb = state.load_balancer_mut(name)?;
        for port in &load_balancer_ports {
            let backend_port = lb
                .listeners
                .iter()
                .find(|l| l.load_balancer_port == *port)
                .map(|l| l.backend_port);
            let bound = backend_port.map_or(false, |bp| {
                lb.backend_policies
                    .iter()
                    .any(|p| p.backend_port == bp && !p.policy_names.is_empty())
            });
            if bound {
                return Err(Error::cloud(
                    "DeleteListeners",
                    format!("listener {} still has backend policies", port),
                ));
            }
        }
        lb.listeners
            .retain(|l| !load_balancer_ports.contains(&l.load_balancer_port));
        drop(state);

        self.record("DeleteListeners", name);
        Ok(())
    }

    async fn set_listener_certificate(&self, name: &str, port: i32, certificate_id: &str) -> Result<()> {
        let mut state = self.state.write();
        let lb = state.load_balancer_mut(name)?;
        let listener = lb
            .listeners
            .iter_mut()
            .find(|l| l.load_balancer_port == port)
            .ok_or_else(|| not_found("Listener", &format!("{}:{}", name, port)))?;
        listener.server_certificate_id = Some(certificate_id.to_string());
        drop(state);

        self.record("SetListenerCertificate", name);
        Ok(())
    }

    async fn register_vms(&self, name: &str, vm_ids: Vec<String>) -> Result<()> {
        let mut state = self.state.write();
        let lb = state.load_balancer_mut(name)?;
        for id in vm_ids {
            if !lb.backend_vm_ids.contains(&id) {
                lb.backend_vm_ids.push(id);
            }
        }
        drop(state);

        self.record("RegisterVms", name);
        Ok(())
    }

    async fn deregister_vms(&self, name: &str, vm_ids: Vec<String>) -> Result<()> {
        let mut state = self.state.write();
        let lb = state.load_balancer_mut(name)?;
        lb.backend_vm_ids.retain(|id| !vm_ids.contains(id));
        drop(state);

        self.record("DeregisterVms", name);
        Ok(())
    }

    async fn configure_health_check(&self, name: &str, health_check: HealthCheck) -> Result<()> {
        let mut state = self.state.write();
        state.load_balancer_mut(name)?.health_check = Some(health_check);
        drop(state);

        self.record("ConfigureHealthCheck", name);
        Ok(())
    }

    async fn update_attributes(&self, name: &str, update: AttributeUpdate) -> Result<()> {
        let mut state = self.state.write();
        let lb = state.load_balancer_mut(name)?;
        match update {
            AttributeUpdate::AccessLog(log) => lb.attributes.access_log = Some(log),
            AttributeUpdate::Connection(conn) => lb.attributes.connection = Some(conn),
        }
        drop(state);

        self.record("UpdateAttributes", name);
        Ok(())
    }

    async fn create_proxy_protocol_policy(&self, name: &str, policy_name: &str) -> Result<()> {
        let mut state = self.state.write();
        state.load_balancer_mut(name)?;
        let created = state
            .policies
            .entry(name.to_string())
            .or_default()
            .insert(policy_name.to_string());
        drop(state);

        if !created {
            return Err(exists("Policy", policy_name));
        }
        self.record("CreateLoadBalancerPolicy", name);
        Ok(())
    }

    async fn set_backend_policies(
        &self,
        name: &str,
        backend_port: i32,
        policy_names: Vec<String>,
    ) -> Result<()> {
        let mut state = self.state.write();
        let known = state.policies.get(name).cloned().unwrap_or_default();
        if let Some(unknown) = policy_names.iter().find(|p| !known.contains(*p)) {
            return Err(not_found("Policy", unknown));
        }
        let lb = state.load_balancer_mut(name)?;
        lb.backend_policies.retain(|p| p.backend_port != backend_port);
        if !policy_names.is_empty() {
            lb.backend_policies.push(BackendPolicy {
                backend_port,
                policy_names,
            });
        }
        drop(state);

        self.record("SetBackendPolicies", name);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Security groups
    // -------------------------------------------------------------------------

    async fn read_security_groups(&self, filter: &SecurityGroupFilter) -> Result<Vec<SecurityGroup>> {
        let mut state = self.state.write();
        if state.hide_security_groups && !filter.names.is_empty() {
            state.hide_security_groups = false;
            return Ok(Vec::new());
        }
        Ok(state
            .security_groups
            .iter()
            .filter(|g| filter.ids.is_empty() || filter.ids.contains(&g.id))
            .filter(|g| filter.names.is_empty() || filter.names.contains(&g.name))
            .filter(|g| filter.net_id.as_ref().map_or(true, |n| &g.net_id == n))
            .filter(|g| filter.tag_keys.iter().all(|k| g.tags.contains_key(k)))
            .cloned()
            .collect())
    }

    async fn create_security_group(
        &self,
        name: &str,
        description: &str,
        net_id: &str,
    ) -> Result<SecurityGroup> {
        let mut state = self.state.write();
        if state
            .security_groups
            .iter()
            .any(|g| g.name == name && g.net_id == net_id)
        {
            return Err(exists("SecurityGroup", name));
        }
        let group = SecurityGroup {
            id: state.next_id("sg"),
            name: name.to_string(),
            net_id: net_id.to_string(),
            description: description.to_string(),
            tags: Tags::new(),
            inbound_rules: Vec::new(),
        };
        state.security_groups.push(group.clone());
        drop(state);

        self.record("CreateSecurityGroup", &group.id);
        Ok(group)
    }

    async fn delete_security_group(&self, id: &str) -> Result<()> {
        let mut state = self.state.write();
        if !state.security_groups.iter().any(|g| g.id == id) {
            return Err(not_found("SecurityGroup", id));
        }
        let holder = state
            .load_balancers
            .values()
            .find(|lb| lb.security_groups.iter().any(|g| g == id))
            .map(|lb| lb.name.clone())
            .or_else(|| {
                state
                    .nics
                    .iter()
                    .find(|n| n.security_groups.iter().any(|g| g == id))
                    .map(|n| n.id.clone())
            });
        if let Some(holder) = holder {
            return Err(Error::cloud(
                "DeleteSecurityGroup",
                format!("DependencyViolation: {} is in use by {}", id, holder),
            ));
        }
        if let Some(referrer) = state.security_groups.iter().find(|g| {
            g.inbound_rules
                .iter()
                .any(|r| r.member_groups.iter().any(|m| m == id))
        }) {
            return Err(Error::cloud(
                "DeleteSecurityGroup",
                format!("DependencyViolation: {} is referenced by {}", id, referrer.id),
            ));
        }
        state.security_groups.retain(|g| g.id != id);
        drop(state);

        self.record("DeleteSecurityGroup", id);
        Ok(())
    }

    async fn create_security_group_rule(&self, group_id: &str, rule: SecurityGroupRule) -> Result<()> {
        let mut state = self.state.write();
        let group = state.security_group_mut(group_id)?;
        let position = group
            .inbound_rules
            .iter()
            .position(|r| r.protocol == rule.protocol && r.from_port == rule.from_port && r.to_port == rule.to_port);
        match position {
            Some(i) => {
                let existing = &mut group.inbound_rules[i];
                let duplicate = rule.ip_ranges.iter().any(|p| existing.ip_ranges.contains(p))
                    || rule.member_groups.iter().any(|p| existing.member_groups.contains(p));
                if duplicate {
                    return Err(exists("SecurityGroupRule", group_id));
                }
                existing.ip_ranges.extend(rule.ip_ranges);
                existing.member_groups.extend(rule.member_groups);
            }
            None => group.inbound_rules.push(rule),
        }
        drop(state);

        self.record("CreateSecurityGroupRule", group_id);
        Ok(())
    }

    async fn delete_security_group_rule(&self, group_id: &str, rule: SecurityGroupRule) -> Result<()> {
        let mut state = self.state.write();
        let group = state.security_group_mut(group_id)?;
        let existing = group
            .inbound_rules
            .iter_mut()
            .find(|r| r.protocol == rule.protocol && r.from_port == rule.from_port && r.to_port == rule.to_port)
            .ok_or_else(|| not_found("SecurityGroupRule", group_id))?;
        existing.ip_ranges.retain(|p| !rule.ip_ranges.contains(p));
        existing.member_groups.retain(|p| !rule.member_groups.contains(p));
        group
            .inbound_rules
            .retain(|r| !r.ip_ranges.is_empty() || !r.member_groups.is_empty());
        drop(state);

        self.record("DeleteSecurityGroupRule", group_id);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Network layout
    // -------------------------------------------------------------------------

    async fn read_subnets(&self, filter: &SubnetFilter) -> Result<Vec<Subnet>> {
        Ok(self
            .state
            .read()
            .subnets
            .iter()
            .filter(|s| filter.ids.is_empty() || filter.ids.contains(&s.id))
            .filter(|s| filter.net_id.as_ref().map_or(true, |n| &s.net_id == n))
            .filter(|s| filter.tag_keys.iter().all(|k| s.tags.contains_key(k)))
            .cloned()
            .collect())
    }

    async fn read_route_tables(&self, net_id: &str) -> Result<Vec<RouteTable>> {
        Ok(self
            .state
            .read()
            .route_tables
            .iter()
            .filter(|t| t.net_id == net_id)
            .cloned()
            .collect())
    }

    // -------------------------------------------------------------------------
    // Tags
    // -------------------------------------------------------------------------

    async fn create_tags(&self, resource_ids: Vec<String>, tags: Tags) -> Result<()> {
        let mut state = self.state.write();
        for id in &resource_ids {
            state
                .tags_mut(id)
                .ok_or_else(|| not_found("Resource", id))?
                .extend(tags.clone());
        }
        drop(state);

        self.record("CreateTags", &resource_ids.join(","));
        Ok(())
    }

    async fn delete_tags(&self, resource_ids: Vec<String>, keys: Vec<String>) -> Result<()> {
        let mut state = self.state.write();
        for id in &resource_ids {
            let tags = state.tags_mut(id).ok_or_else(|| not_found("Resource", id))?;
            for key in &keys {
                tags.remove(key);
            }
        }
        drop(state);

        self.record("DeleteTags", &resource_ids.join(","));
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Public IPs
    // -------------------------------------------------------------------------

    async fn read_public_ips(&self, filter: &PublicIpFilter) -> Result<Vec<PublicIp>> {
        Ok(self
            .state
            .read()
            .public_ips
            .iter()
            .filter(|ip| filter.ids.is_empty() || filter.ids.contains(&ip.id))
            .filter(|ip| {
                filter
                    .pool
                    .as_ref()
                    .map_or(true, |p| ip.tags.get(PUBLIC_IP_POOL_TAG) == Some(p))
            })
            .cloned()
            .collect())
    }

    async fn allocate_public_ip(&self, tags: Tags) -> Result<PublicIp> {
        let mut state = self.state.write();
        let ip = PublicIp {
            id: state.next_id("eipalloc"),
            address: state.next_address("203.0.113"),
            linked_nic_id: None,
            linked_load_balancer: None,
            tags,
        };
        state.public_ips.push(ip.clone());
        drop(state);

        self.record("AllocatePublicIp", &ip.id);
        Ok(ip)
    }

    async fn release_public_ip(&self, id: &str) -> Result<()> {
        let mut state = self.state.write();
        if !state.public_ip_mut(id)?.is_free() {
            return Err(Error::cloud(
                "ReleasePublicIp",
                format!("{} is still associated", id),
            ));
        }
        state.public_ips.retain(|ip| ip.id != id);
        drop(state);

        self.record("ReleasePublicIp", id);
        Ok(())
    }

    async fn link_public_ip(&self, public_ip_id: &str, nic_id: &str) -> Result<()> {
        let mut state = self.state.write();
        let address = {
            let ip = state.public_ip_mut(public_ip_id)?;
            if !ip.is_free() && ip.linked_nic_id.as_deref() != Some(nic_id) {
                return Err(Error::cloud(
                    "LinkPublicIp",
                    format!("{} is already associated", public_ip_id),
                ));
            }
            ip.address.clone()
        };
        state.nic_mut(nic_id)?.public_ip = Some(address);
        state.public_ip_mut(public_ip_id)?.linked_nic_id = Some(nic_id.to_string());
        drop(state);

        self.record("LinkPublicIp", public_ip_id);
        Ok(())
    }

    async fn unlink_public_ip(&self, public_ip_id: &str) -> Result<()> {
        let mut state = self.state.write();
        let nic_id = state.public_ip_mut(public_ip_id)?.linked_nic_id.take();
        if let Some(nic_id) = nic_id {
            if let Ok(nic) = state.nic_mut(&nic_id) {
                nic.public_ip = None;
            }
        }
        drop(state);

        self.record("UnlinkPublicIp", public_ip_id);
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Network interfaces
    // -------------------------------------------------------------------------

    async fn read_network_interface_by_name(&self, name: &str) -> Result<Option<NetworkInterface>> {
        Ok(self
            .state
            .read()
            .nics
            .iter()
            .find(|n| n.tags.get(NAME_TAG).map(String::as_str) == Some(name))
            .cloned())
    }

    async fn create_network_interface(&self, request: CreateNicRequest) -> Result<NetworkInterface> {
        let mut state = self.state.write();
        let subregion = state
            .subnets
            .iter()
            .find(|s| s.id == request.subnet_id)
            .map(|s| s.subregion.clone())
            .ok_or_else(|| not_found("Subnet", &request.subnet_id))?;
        let private_ip = state.next_address("10.0.0");
        let private_dns_name = self.config.assign_dns_names.then(|| {
            format!(
                "ip-{}.{}.compute.internal",
                private_ip.replace('.', "-"),
                self.config.region
            )
        });
        let nic = NetworkInterface {
            id: state.next_id("eni"),
            subnet_id: request.subnet_id,
            subregion,
            private_ip: Some(private_ip),
            private_dns_name,
            public_ip: None,
            security_groups: request.security_groups,
            linked_vm_id: None,
            tags: request.tags,
        };
        state.nics.push(nic.clone());
        drop(state);

        self.record("CreateNic", &nic.id);
        Ok(nic)
    }

    async fn delete_network_interface(&self, id: &str) -> Result<()> {
        self.injected_failure("DeleteNic")?;
        let mut state = self.state.write();
        if state.nic_mut(id)?.linked_vm_id.is_some() {
            return Err(Error::cloud(
                "DeleteNic",
                format!("{} is still attached", id),
            ));
        }
        state.nics.retain(|n| n.id != id);
        for ip in state.public_ips.iter_mut() {
            if ip.linked_nic_id.as_deref() == Some(id) {
                ip.linked_nic_id = None;
            }
        }
        drop(state);

        self.record("DeleteNic", id);
        Ok(())
    }

    async fn link_network_interface(&self, nic_id: &str, vm_id: &str) -> Result<()> {
        let mut state = self.state.write();
        let nic = state.nic_mut(nic_id)?;
        if nic.linked_vm_id.is_some() {
            return Err(Error::cloud(
                "LinkNic",
                format!("{} is already attached", nic_id),
            ));
        }
        nic.linked_vm_id = Some(vm_id.to_string());
        drop(state);

        self.record("LinkNic", nic_id);
        Ok(())
    }

    async fn unlink_network_interface(&self, nic_id: &str) -> Result<()> {
        let mut state = self.state.write();
        state.nic_mut(nic_id)?.linked_vm_id = None;
        drop(state);

        self.record("UnlinkNic", nic_id);
        Ok(())
    }
}

// =============================================================================
// Static Node Directory
// =============================================================================

/// Node directory backed by a fixed VM list
#[derive(Default)]
pub struct StaticDirectory {
    vms: RwLock<Vec<Vm>>,
}

impl StaticDirectory {
    pub fn new(vms: Vec<Vm>) -> Self {
        Self {
            vms: RwLock::new(vms),
        }
    }

    pub fn add_vm(&self, vm: Vm) {
        self.vms.write().push(vm);
    }

    pub fn set_state(&self, vm_id: &str, state: VmState) {
        if let Some(vm) = self.vms.write().iter_mut().find(|v| v.id == vm_id) {
            vm.state = state;
        }
    }
}

#[async_trait]
impl NodeDirectory for StaticDirectory {
    async fn vms_for_nodes(&self, nodes: &[NodeRef]) -> Result<Vec<Vm>> {
        let vms = self.vms.read();
        Ok(nodes
            .iter()
            .filter_map(|node| {
                vms.iter().find(|vm| {
                    node.vm_id().map_or(false, |id| id == vm.id) || vm.node_name == node.name
                })
            })
            .cloned()
            .collect())
    }
}
