//! Shared test fixtures

use crate::controlplane::platform::MemoryCloud;
use crate::domain::ports::{LoadBalancerType, NameResolver};
use crate::domain::tags::{cluster_tag_key, ownership_tags, role_tag_key, CLUSTER_OWNED, NAME_TAG};
use crate::domain::types::{SecurityGroupRef, Subnet, Tags, Vm, VmState};
use crate::error::Result;
use crate::spec::{
    AccessLogSpec, ConnectionSpec, HealthCheckSpec, IngressAddress, ListenerDefaults, ListenerSpec,
    LoadBalancerSpec, PortSelector, TargetRole, ANNOTATION_PREFIX,
};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use kube::api::ObjectMeta;
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;

pub const SERVICE_UID: &str = "3f1c2a9e-5b7d-4e21-9a0c-6d8e2f4b1a07";

/// Spec of `shop/web` on cluster `foo` with the given (port, node port) pairs
pub fn spec_with_ports(ports: &[(i32, i32)]) -> LoadBalancerSpec {
    let listeners: Vec<ListenerSpec> = ports
        .iter()
        .map(|&(port, backend_port)| ListenerSpec { port, backend_port })
        .collect();
    LoadBalancerSpec {
        lb_type: LoadBalancerType::Lbu,
        names: vec![SERVICE_UID.replace('-', "")],
        service_name: "shop/web".into(),
        internal: false,
        instances: 1,
        subregions: Vec::new(),
        ip_pool: None,
        public_ip_ids: Vec::new(),
        subnet_ids: Vec::new(),
        security_groups: BTreeSet::new(),
        additional_security_groups: BTreeSet::new(),
        target_role: TargetRole::Worker,
        target_node_labels: BTreeMap::new(),
        tags: ownership_tags("foo", "shop/web"),
        health_check: listeners.first().map(|l| HealthCheckSpec {
            interval: 10,
            timeout: 5,
            healthy_threshold: 2,
            unhealthy_threshold: 2,
            port: l.backend_port,
            protocol: "tcp".into(),
            path: None,
        }),
        connection: ConnectionSpec {
            draining: false,
            draining_timeout: 0,
            idle_timeout: 60,
        },
        listener_defaults: ListenerDefaults {
            backend_protocol: "tcp".into(),
            proxy_protocol_ports: PortSelector::None,
            ssl_certificate: None,
            ssl_ports: PortSelector::All,
        },
        listeners,
        allow_from: ["0.0.0.0/0".to_string()].into_iter().collect(),
        access_log: AccessLogSpec {
            enabled: false,
            emit_interval: 60,
            bucket_name: String::new(),
            bucket_prefix: String::new(),
        },
        ingress_address: IngressAddress::Hostname,
        ip_mode: None,
    }
}

/// Service `shop/web` with TCP ports and annotation suffixes
pub fn service(ports: &[(i32, i32)], annotations: &[(&str, &str)]) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some("web".into()),
            namespace: Some("shop".into()),
            uid: Some(SERVICE_UID.into()),
            annotations: Some(
                annotations
                    .iter()
                    .map(|(k, v)| (format!("{}{}", ANNOTATION_PREFIX, k), v.to_string()))
                    .collect(),
            ),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("LoadBalancer".into()),
            ports: Some(
                ports
                    .iter()
                    .map(|&(port, node_port)| ServicePort {
                        port,
                        node_port: Some(node_port),
                        protocol: Some("TCP".into()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Cloud layout seeded by [`seed_cluster`]
pub struct ClusterFixture {
    pub subnet_id: String,
    pub internal_subnet_id: String,
    pub worker_group: String,
    pub vms: Vec<Vm>,
}

/// Seed cluster `foo`: one public and one internal subnet in `vpc-1`, a
/// worker security group and two running VMs carrying it
pub fn seed_cluster(cloud: &MemoryCloud) -> ClusterFixture {
    let subnet = |id: &str, role: &str| {
        let mut tags = Tags::new();
        tags.insert(cluster_tag_key("foo"), CLUSTER_OWNED.into());
        tags.insert(role_tag_key(role), "1".into());
        tags.insert(NAME_TAG.into(), id.into());
        Subnet {
            id: id.into(),
            net_id: "vpc-1".into(),
            subregion: "eu-west-2a".into(),
            tags,
        }
    };
    cloud.add_subnet(subnet("subnet-pub", "public-elb"));
    cloud.add_subnet(subnet("subnet-int", "internal-elb"));

    let mut tags = Tags::new();
    tags.insert(cluster_tag_key("foo"), CLUSTER_OWNED.into());
    tags.insert(role_tag_key("worker"), "1".into());
    let worker_group = cloud.add_security_group("foo-workers", "vpc-1", tags);

    let vms = (1..=2)
        .map(|i| Vm {
            id: format!("i-{}", i),
            node_name: format!("node-{}", i),
            state: VmState::Running,
            subregion: "eu-west-2a".into(),
            subnet_id: "subnet-nodes".into(),
            net_id: "vpc-1".into(),
            security_groups: vec![SecurityGroupRef {
                id: worker_group.clone(),
                name: "foo-workers".into(),
            }],
        })
        .collect();

    ClusterFixture {
        subnet_id: "subnet-pub".into(),
        internal_subnet_id: "subnet-int".into(),
        worker_group,
        vms,
    }
}

pub fn backend_vms(fixture: &ClusterFixture) -> Vec<Vm> {
    fixture.vms.clone()
}

/// Resolver answering every name with one address
pub struct StaticResolver {
    ip: IpAddr,
}

impl StaticResolver {
    pub fn new(ip: &str) -> Self {
        Self {
            ip: ip.parse().unwrap(),
        }
    }
}

#[async_trait]
impl NameResolver for StaticResolver {
    async fn resolve(&self, _host: &str) -> Result<Vec<IpAddr>> {
        Ok(vec![self.ip])
    }
}
