//! Backend membership reconciler
//!
//! Classic load balancers register every running backend VM. A VIP is bound
//! to exactly one of them, picked at random so that concurrent reconciles of
//! different Services spread over the candidates.

use crate::domain::ports::CloudApiRef;
use crate::domain::types::{LoadBalancer, NetworkInterface, Vm};
use crate::error::Result;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info};

/// Random source shared by the components that pick among candidates
pub type SharedRng = Arc<Mutex<StdRng>>;

/// Random source seeded from the OS
pub fn entropy_rng() -> SharedRng {
    Arc::new(Mutex::new(StdRng::from_entropy()))
}

/// Deterministic random source
pub fn seeded_rng(seed: u64) -> SharedRng {
    Arc::new(Mutex::new(StdRng::seed_from_u64(seed)))
}

/// Registration changes for a classic load balancer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipPlan {
    pub register: Vec<String>,
    pub deregister: Vec<String>,
}

pub fn plan_membership(current: &[String], desired: &BTreeSet<String>) -> MembershipPlan {
    let current: BTreeSet<&String> = current.iter().collect();
    MembershipPlan {
        register: desired
            .iter()
            .filter(|id| !current.contains(id))
            .cloned()
            .collect(),
        deregister: current
            .into_iter()
            .filter(|id| !desired.contains(*id))
            .cloned()
            .collect(),
    }
}

/// Ids of the VMs that may receive traffic
pub fn running_vm_ids(vms: &[Vm]) -> BTreeSet<String> {
    vms.iter()
        .filter(|vm| vm.is_running())
        .map(|vm| vm.id.clone())
        .collect()
}

pub struct BackendMembershipReconciler {
    cloud: CloudApiRef,
    rng: SharedRng,
}

impl BackendMembershipReconciler {
    pub fn new(cloud: CloudApiRef, rng: SharedRng) -> Self {
        Self { cloud, rng }
    }

    /// At most one register and one deregister call
    pub async fn reconcile_classic(&self, lb: &LoadBalancer, vms: &[Vm]) -> Result<usize> {
        let plan = plan_membership(&lb.backend_vm_ids, &running_vm_ids(vms));
        let mut calls = 0;

        if !plan.register.is_empty() {
            info!(lb = %lb.name, vms = ?plan.register, "Registering backend VMs");
            self.cloud.register_vms(&lb.name, plan.register).await?;
            calls += 1;
        }
        if !plan.deregister.is_empty() {
            info!(lb = %lb.name, vms = ?plan.deregister, "Deregistering backend VMs");
            self.cloud.deregister_vms(&lb.name, plan.deregister).await?;
            calls += 1;
        }
        Ok(calls)
    }

    /// Keep the interface on a running desired VM, moving it if needed
    pub async fn reconcile_vip(&self, nic: &NetworkInterface, vms: &[Vm]) -> Result<usize> {
        let desired: Vec<String> = running_vm_ids(vms).into_iter().collect();

        if let Some(bound) = &nic.linked_vm_id {
            if desired.contains(bound) {
                debug!(nic = %nic.id, vm = %bound, "VIP already bound to a running backend");
                return Ok(0);
            }
        }

        let mut calls = 0;
        if let Some(bound) = &nic.linked_vm_id {
            info!(nic = %nic.id, vm = %bound, "Unbinding VIP from unwanted VM");
            self.cloud.unlink_network_interface(&nic.id).await?;
            calls += 1;
        }

        let chosen = desired.choose(&mut *self.rng.lock()).cloned();
        match chosen {
            Some(vm_id) => {
                info!(nic = %nic.id, vm = %vm_id, "Binding VIP");
                self.cloud.link_network_interface(&nic.id, &vm_id).await?;
                calls += 1;
            }
            None => debug!(nic = %nic.id, "No running backend VM to bind the VIP to"),
        }
        Ok(calls)
    }
}
