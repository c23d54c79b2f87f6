//! Benchmarks for config parsing, stack construction and synthesis.
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ecsforge::core::naming::logical_id;
use ecsforge::core::parser::parse_config;
use ecsforge::core::resolver::topo_order;
use ecsforge::core::synth::App;
use indexmap::IndexMap;
use std::collections::HashMap;
use std::path::Path;

const CONFIG: &str = r#"
version: "1.0"
name: dbcheck
source: { github_owner: acme, repo: dbcheck, token_secret: github-token }
image_tag_param: /dbcheck/image-tag
clusters:
  DevCluster: { cidr: 10.1.0.0/20, max_azs: 2 }
  ProdCluster: { cidr: 10.3.0.0/20, max_azs: 3 }
pipelines:
  DevPipelineStack:
    deploy_stack: DevAppStack
    images:
      app: { context: dbcheck }
      nginx: { context: nginx }
apps:
  DevAppStack:
    cluster: DevCluster
    containers:
      app:
        image: { pipeline: { stack: DevPipelineStack, image: app } }
        port: 3000
        environment: { MODE: dev }
      nginx:
        image: { pipeline: { stack: DevPipelineStack, image: nginx } }
        port: 80
"#;

fn bench_parse(c: &mut Criterion) {
    c.bench_function("parse_config", |b| {
        b.iter(|| black_box(parse_config(black_box(CONFIG)).unwrap()));
    });
}

fn bench_build_and_synth(c: &mut Criterion) {
    let config = parse_config(CONFIG).unwrap();
    c.bench_function("app_build", |b| {
        b.iter(|| black_box(App::build(&config, Path::new("."), "ecsforge.yaml").unwrap()));
    });

    let app = App::build(&config, Path::new("."), "ecsforge.yaml").unwrap();
    let mut group = c.benchmark_group("synth_stack");
    for name in ["DevCluster", "DevPipelineStack", "DevAppStack"] {
        group.bench_with_input(BenchmarkId::from_parameter(name), &name, |b, name| {
            b.iter(|| black_box(app.synth_stack(name, &HashMap::new()).unwrap()));
        });
    }
    group.finish();
}

fn bench_logical_id(c: &mut Criterion) {
    c.bench_function("logical_id", |b| {
        b.iter(|| {
            black_box(logical_id(black_box(&[
                "TaskDef",
                "app",
                "LogGroup",
                "Resource",
            ])))
        });
    });
}

fn bench_topo_sort(c: &mut Criterion) {
    let mut group = c.benchmark_group("topo_sort");
    for n in [10, 50, 100] {
        let deps: IndexMap<String, Vec<String>> = (0..n)
            .map(|i| {
                let needs = if i > 0 {
                    vec![format!("stack-{:04}", i - 1)]
                } else {
                    Vec::new()
                };
                (format!("stack-{:04}", i), needs)
            })
            .collect();
        group.bench_with_input(BenchmarkId::from_parameter(n), &deps, |b, deps| {
            b.iter(|| black_box(topo_order(deps).unwrap()));
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_parse,
    bench_build_and_synth,
    bench_logical_id,
    bench_topo_sort
);
criterion_main!(benches);
