//! Benchmarks for rule planning, spec building and a converged reconcile

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use cloud_lb_operator::controlplane::rules::{plan_rules, uniform_rules, PrincipalKind};
use cloud_lb_operator::domain::tags::{cluster_tag_key, role_tag_key};
use cloud_lb_operator::domain::types::{
    NodeRef, SecurityGroupRef, SecurityGroupRule, Subnet, Tags, Vm, VmState,
};
use cloud_lb_operator::spec::ANNOTATION_PREFIX;
use cloud_lb_operator::{
    ControllerConfig, LoadBalancerController, MemoryCloud, SpecBuilder, SpecDefaults,
    StaticDirectory, SystemResolver,
};
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use kube::api::ObjectMeta;
use std::collections::BTreeSet;
use std::sync::Arc;

fn service(ports: i32) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some("web".into()),
            namespace: Some("shop".into()),
            uid: Some("3f1c2a9e-5b7d-4e21-9a0c-6d8e2f4b1a07".into()),
            annotations: Some(
                [
                    ("proxy-protocol", "*"),
                    ("healthcheck-path", "/healthz"),
                    ("additional-resource-tags", "team=web,env=prod"),
                ]
                .iter()
                .map(|(k, v)| (format!("{}{}", ANNOTATION_PREFIX, k), v.to_string()))
                .collect(),
            ),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some("LoadBalancer".into()),
            ports: Some(
                (0..ports)
                    .map(|i| ServicePort {
                        port: 8000 + i,
                        node_port: Some(30000 + i),
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

fn bench_plan_rules(c: &mut Criterion) {
    let mut group = c.benchmark_group("rules");
    group.throughput(Throughput::Elements(200));

    let cidrs: BTreeSet<String> = (0..10).map(|i| format!("10.{}.0.0/16", i)).collect();
    let desired = uniform_rules(30000..30200, &cidrs);
    // half the ports present, with one stale principal each
    let existing: Vec<SecurityGroupRule> = (30000..30100)
        .map(|port| SecurityGroupRule::tcp_cidrs(port, vec!["10.0.0.0/16".into(), "192.0.2.0/24".into()]))
        .collect();

    group.bench_function("plan_200_ports", |b| {
        b.iter(|| plan_rules(black_box(&existing), black_box(&desired), PrincipalKind::Cidr, None))
    });

    group.finish();
}

fn bench_spec_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("spec");
    group.throughput(Throughput::Elements(1));

    let builder = SpecBuilder::new(SpecDefaults::for_cluster("foo"));
    let svc = service(20);

    group.bench_function("build_20_ports", |b| b.iter(|| builder.build(black_box(&svc))));

    group.finish();
}

fn bench_converged_reconcile(c: &mut Criterion) {
    let mut group = c.benchmark_group("controller");
    group.throughput(Throughput::Elements(1));

    let cloud = Arc::new(MemoryCloud::new());
    let mut subnet_tags = Tags::new();
    subnet_tags.insert(cluster_tag_key("foo"), "owned".into());
    subnet_tags.insert(role_tag_key("public-elb"), "1".into());
    cloud.add_subnet(Subnet {
        id: "subnet-pub".into(),
        net_id: "vpc-1".into(),
        subregion: "eu-west-2a".into(),
        tags: subnet_tags,
    });
    let mut worker_tags = Tags::new();
    worker_tags.insert(cluster_tag_key("foo"), "owned".into());
    worker_tags.insert(role_tag_key("worker"), "1".into());
    let workers = cloud.add_security_group("foo-workers", "vpc-1", worker_tags);

    let vms: Vec<Vm> = (0..10)
        .map(|i| Vm {
            id: format!("i-{}", i),
            node_name: format!("node-{}", i),
            state: VmState::Running,
            subregion: "eu-west-2a".into(),
            subnet_id: "subnet-nodes".into(),
            net_id: "vpc-1".into(),
            security_groups: vec![SecurityGroupRef {
                id: workers.clone(),
                name: "foo-workers".into(),
            }],
        })
        .collect();
    let nodes: Vec<NodeRef> = vms.iter().map(|vm| NodeRef::new(vm.node_name.clone())).collect();

    let mut config = ControllerConfig::new("foo");
    config.rng_seed = Some(1);
    let controller = LoadBalancerController::new(
        config,
        cloud.clone(),
        Arc::new(StaticDirectory::new(vms)),
        Arc::new(SystemResolver),
    );
    let svc = service(5);
    let _ = tokio_test::block_on(controller.ensure_load_balancer(&svc, &nodes));

    group.bench_function("ensure_converged", |b| {
        b.iter(|| tokio_test::block_on(controller.ensure_load_balancer(black_box(&svc), &nodes)))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_plan_rules,
    bench_spec_build,
    bench_converged_reconcile,
);
criterion_main!(benches);
