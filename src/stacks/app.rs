//! App stack: a load-balanced, autoscaled Fargate service.

use super::cluster::ClusterImports;
use super::ImageCatalog;
use crate::core::error::SynthError;
use crate::core::stack::Stack;
use crate::core::template::CfnOutput;
use crate::core::types::{AppSpec, ForgeConfig, ImageSource};
use crate::resources::ecs::{
    scale_on_cpu, ContainerOptions, CpuScaling, FargateService, FargateTaskDefinition,
    ServiceNetwork,
};
use crate::resources::elb::LoadBalancer;
use crate::resources::image::{AssetImage, ContainerImage, RegistryImage, ASSETS_REPOSITORY};
use serde::Serialize;
use std::path::Path;
use std::rc::Rc;
use tracing::info;

const TASK_DEFINITION: &str = "TaskDef";
const SERVICE: &str = "Service";
const LOAD_BALANCER: &str = "LB";

/// A container image built from a local directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssetRecord {
    pub stack: String,
    pub container: String,
    pub directory: String,
    pub repository: String,
    pub tag: String,
}

#[derive(Debug)]
pub struct AppStack {
    pub stack: Stack,
    pub assets: Vec<AssetRecord>,
}

fn container_image(
    stack: &Stack,
    source: &ImageSource,
    catalog: &ImageCatalog,
    base_dir: &Path,
) -> Result<ContainerImage, SynthError> {
    Ok(match source {
        ImageSource::Registry { name, credentials } => ContainerImage::Registry(RegistryImage {
            name: name.clone(),
            credentials: credentials.clone(),
        }),
        ImageSource::Asset { directory } => ContainerImage::Asset(Rc::new(
            AssetImage::from_directory(stack, &base_dir.join(directory))?,
        )),
        ImageSource::Pipeline {
            stack: pipeline,
            image,
        } => ContainerImage::Pipeline(catalog.get(pipeline, image)?),
    })
}

pub fn build(
    name: &str,
    spec: &AppSpec,
    config: &ForgeConfig,
    catalog: &ImageCatalog,
    base_dir: &Path,
) -> Result<AppStack, SynthError> {
    let cluster_spec = config
        .clusters
        .get(&spec.cluster)
        .ok_or_else(|| SynthError::UnknownStack(spec.cluster.clone()))?;
    let imports = ClusterImports::new(&spec.cluster, cluster_spec);

    let mut stack = Stack::new(name, &config.env);
    if let Some(ref d) = config.description {
        stack.set_description(d.clone());
    }
    stack.add_dependency(&spec.cluster);

    let mut assets = Vec::new();
    let mut task =
        FargateTaskDefinition::new(&stack, TASK_DEFINITION, spec.cpu, spec.memory_mib);
    for (cname, container) in &spec.containers {
        let image = container_image(&stack, &container.image, catalog, base_dir)?;
        match (&container.image, &image) {
            (ImageSource::Pipeline { stack: pipeline, .. }, _) => stack.add_dependency(pipeline),
            (ImageSource::Asset { directory }, ContainerImage::Asset(asset)) => {
                assets.push(AssetRecord {
                    stack: name.to_string(),
                    container: cname.clone(),
                    directory: directory.clone(),
                    repository: ASSETS_REPOSITORY.to_string(),
                    tag: asset.tag().to_string(),
                })
            }
            _ => {}
        }
        task.add_container(
            &mut stack,
            cname,
            &image,
            ContainerOptions {
                port: container.port,
                log_prefix: Some(
                    container
                        .log_prefix
                        .clone()
                        .unwrap_or_else(|| cname.clone()),
                ),
                environment: container.environment.clone(),
                essential: container.essential,
            },
        )?;
    }

    let mut service = FargateService::new(
        &mut stack,
        SERVICE,
        imports.cluster_name.clone(),
        ServiceNetwork {
            vpc_id: imports.vpc_id.clone(),
            subnets: imports.private_subnets.clone(),
        },
        spec.min_capacity,
    )?;

    let mut load_balancer = None;
    if let Some((target, port)) = spec.target() {
        let lb = LoadBalancer::build(
            &mut stack,
            LOAD_BALANCER,
            imports.vpc_id.clone(),
            imports.public_subnets.clone(),
        )?;
        let listener = lb.add_listener(
            &mut stack,
            "HttpListener",
            spec.listener_port,
            "DefaultTarget",
            port,
        )?;
        listener.forward_to(&mut stack, SERVICE, &mut service, target)?;
        load_balancer = Some(lb);
    }

    let task_id = task.render(&mut stack)?;
    service.render(&mut stack, &task_id)?;
    scale_on_cpu(
        &mut stack,
        SERVICE,
        &service,
        &imports.cluster_name,
        CpuScaling {
            min_capacity: spec.min_capacity,
            max_capacity: spec.max_capacity,
            target_percent: spec.target_cpu_percent,
            cooldown_seconds: spec.scale_cooldown_seconds,
        },
    )?;

    if let Some(lb) = load_balancer {
        stack.add_output("LoadBalancerDNSNames", CfnOutput::new(lb.dns_name()))?;
    }

    info!(
        stack = name,
        cluster = %spec.cluster,
        containers = spec.containers.len(),
        parameters = stack.parameter_ids().len(),
        "built app stack"
    );
    Ok(AppStack { stack, assets })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parser::parse_config;
    use serde_json::json;
    use std::collections::HashMap;

    const CONFIG: &str = r#"
version: "1.0"
name: dbcheck
source: { github_owner: acme, repo: dbcheck, token_secret: github-token }
clusters:
  DevCluster: { cidr: 10.1.0.0/20 }
apps:
  DevAppStack:
    cluster: DevCluster
    containers:
      app:
        image: { asset: { directory: dbcheck } }
        port: 3000
        environment: { MODE: dev }
      nginx:
        image: { registry: { name: "nginx:1.25" } }
        port: 80
"#;

    fn build_app(dir: &Path) -> AppStack {
        std::fs::create_dir_all(dir.join("dbcheck")).unwrap();
        std::fs::write(dir.join("dbcheck/Dockerfile"), "FROM node:18").unwrap();
        let config = parse_config(CONFIG).unwrap();
        build(
            "DevAppStack",
            &config.apps["DevAppStack"],
            &config,
            &ImageCatalog::default(),
            dir,
        )
        .unwrap()
    }

    #[test]
    fn test_app_stack_shape() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_app(dir.path());
        assert_eq!(app.stack.dependencies(), ["DevCluster".to_string()]);
        assert_eq!(app.assets.len(), 1);
        assert_eq!(app.assets[0].container, "app");
        assert_eq!(app.assets[0].tag.len(), 64);

        let t = app.stack.synth(&HashMap::new()).unwrap();
        let count = |ty: &str| {
            t["Resources"]
                .as_object()
                .unwrap()
                .values()
                .filter(|r| r["Type"] == json!(ty))
                .count()
        };
        assert_eq!(count("AWS::ECS::TaskDefinition"), 1);
        assert_eq!(count("AWS::ECS::Service"), 1);
        assert_eq!(count("AWS::ElasticLoadBalancingV2::LoadBalancer"), 1);
        assert_eq!(count("AWS::ApplicationAutoScaling::ScalingPolicy"), 1);
        assert_eq!(count("AWS::Logs::LogGroup"), 2);
        assert!(t["Outputs"]["LoadBalancerDNSNames"]["Value"]["Fn::GetAtt"].is_array());
        assert!(t.get("Parameters").is_none());
    }

    #[test]
    fn test_first_port_container_is_target() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_app(dir.path());
        let t = app.stack.synth(&HashMap::new()).unwrap();
        let service = t["Resources"]
            .as_object()
            .unwrap()
            .values()
            .find(|r| r["Type"] == json!("AWS::ECS::Service"))
            .unwrap();
        assert_eq!(
            service["Properties"]["LoadBalancers"][0]["ContainerName"],
            json!("app")
        );
        assert_eq!(
            service["Properties"]["Cluster"],
            json!({"Fn::ImportValue": "DevCluster:ClusterName"})
        );
        assert_eq!(
            service["Properties"]["NetworkConfiguration"]["AwsvpcConfiguration"]["Subnets"],
            json!([
                {"Fn::ImportValue": "DevCluster:PrivateSubnet1Id"},
                {"Fn::ImportValue": "DevCluster:PrivateSubnet2Id"}
            ])
        );
    }

    #[test]
    fn test_missing_asset_directory() {
        let dir = tempfile::tempdir().unwrap();
        let config = parse_config(CONFIG).unwrap();
        let err = build(
            "DevAppStack",
            &config.apps["DevAppStack"],
            &config,
            &ImageCatalog::default(),
            dir.path(),
        )
        .unwrap_err();
        assert!(matches!(err, SynthError::Asset { .. }));
    }

    #[test]
    fn test_unknown_pipeline_image() {
        let dir = tempfile::tempdir().unwrap();
        let yaml = CONFIG.replace(
            "{ asset: { directory: dbcheck } }",
            "{ pipeline: { stack: DevPipelineStack, image: app } }",
        );
        let config = parse_config(&yaml).unwrap();
        let err = build(
            "DevAppStack",
            &config.apps["DevAppStack"],
            &config,
            &ImageCatalog::default(),
            dir.path(),
        )
        .unwrap_err();
        assert!(matches!(err, SynthError::UnknownImage { .. }));
    }
}
