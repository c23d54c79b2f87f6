//! YAML parsing and validation of `ecsforge.yaml`.
//!
//! Validation collects every structural problem rather than stopping at the
//! first one:
//! - Version must be "1.0"
//! - Stack names are unique across sections and CloudFormation-safe
//! - Cluster CIDRs can hold a public and a private subnet per AZ
//! - Cross references (clusters, pipelines, images, deploy stacks) exist
//! - Fargate cpu/memory pairs are supported
//! - Every pipeline image is bound by the stack its pipeline deploys

use super::cidr::{Ipv4Cidr, MAX_VPC_PREFIX};
use super::types::*;
use regex::Regex;
use std::collections::HashSet;
use std::path::Path;
use std::sync::OnceLock;

/// Validation error.
#[derive(Debug, Clone)]
pub struct ValidationError {
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

fn stack_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9-]{0,127}$").expect("valid regex"))
}

fn image_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z0-9]+(?:[._-][a-z0-9]+)*$").expect("valid regex"))
}

fn env_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").expect("valid regex"))
}

/// Parse an ecsforge.yaml file from disk.
pub fn parse_config_file(path: &Path) -> Result<ForgeConfig, String> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read {}: {}", path.display(), e))?;
    parse_config(&content)
}

/// Parse an ecsforge.yaml from a string.
pub fn parse_config(yaml: &str) -> Result<ForgeConfig, String> {
    serde_yaml_ng::from_str(yaml).map_err(|e| format!("YAML parse error: {}", e))
}

/// Validate a parsed config. Returns a list of errors (empty = valid).
pub fn validate_config(config: &ForgeConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();
    let mut err = |message: String| errors.push(ValidationError { message });

    if config.version != "1.0" {
        err(format!("version must be \"1.0\", got \"{}\"", config.version));
    }
    if config.name.trim().is_empty() {
        err("name must not be empty".to_string());
    }
    for (field, value) in [
        ("github_owner", &config.source.github_owner),
        ("repo", &config.source.repo),
        ("token_secret", &config.source.token_secret),
        ("branch", &config.source.branch),
    ] {
        if value.trim().is_empty() {
            err(format!("source.{} must not be empty", field));
        }
    }
    if !config.image_tag_param.starts_with('/') {
        err(format!(
            "image_tag_param '{}' must be an absolute SSM path",
            config.image_tag_param
        ));
    }

    // Stack names
    let mut seen = HashSet::new();
    for name in config.stack_names() {
        if !seen.insert(name) {
            err(format!("stack name '{}' is declared more than once", name));
        }
        if !stack_name_re().is_match(name) {
            err(format!(
                "stack name '{}' must start with a letter and contain only letters, digits, '-'",
                name
            ));
        }
    }

    for (name, cluster) in &config.clusters {
        validate_cluster(name, cluster, &mut err);
    }
    for (name, pipeline) in &config.pipelines {
        validate_pipeline(name, pipeline, config, &mut err);
    }
    for (name, app) in &config.apps {
        validate_app(name, app, config, &mut err);
    }

    errors
}

fn validate_cluster(name: &str, cluster: &ClusterSpec, err: &mut impl FnMut(String)) {
    if !(1..=6).contains(&cluster.max_azs) {
        err(format!(
            "cluster '{}' max_azs must be between 1 and 6, got {}",
            name, cluster.max_azs
        ));
        return;
    }
    match cluster.cidr.parse::<Ipv4Cidr>() {
        Ok(cidr) => {
            if cidr.prefix() < MAX_VPC_PREFIX {
                err(format!(
                    "cluster '{}' cidr {} is larger than /{}",
                    name, cidr, MAX_VPC_PREFIX
                ));
            } else if let Err(e) = cidr.split(usize::from(cluster.max_azs) * 2) {
                err(format!("cluster '{}': {}", name, e));
            }
        }
        Err(e) => err(format!("cluster '{}' has invalid cidr: {}", name, e)),
    }
}

fn validate_pipeline(
    name: &str,
    pipeline: &PipelineSpec,
    config: &ForgeConfig,
    err: &mut impl FnMut(String),
) {
    if pipeline.images.is_empty() {
        err(format!("pipeline '{}' builds no images", name));
    }
    for (image, build) in &pipeline.images {
        if !image_name_re().is_match(image) {
            err(format!(
                "pipeline '{}' image '{}' is not a valid repository name",
                name, image
            ));
        }
        if build.context.trim().is_empty() {
            err(format!("pipeline '{}' image '{}' has no context", name, image));
        }
    }

    let Some(app) = config.apps.get(&pipeline.deploy_stack) else {
        err(format!(
            "pipeline '{}' deploys unknown app stack '{}'",
            name, pipeline.deploy_stack
        ));
        return;
    };

    // An image the deploy stack never binds has no placeholder parameter,
    // so its parameter override key could never be materialized.
    for image in pipeline.images.keys() {
        let bound = app.containers.values().any(|c| {
            matches!(&c.image, ImageSource::Pipeline { stack, image: i } if stack == name && i == image)
        });
        if !bound {
            err(format!(
                "pipeline '{}' image '{}' is not used by deploy stack '{}'",
                name, image, pipeline.deploy_stack
            ));
        }
    }
}

fn validate_app(name: &str, app: &AppSpec, config: &ForgeConfig, err: &mut impl FnMut(String)) {
    if !config.clusters.contains_key(&app.cluster) {
        err(format!(
            "app '{}' references unknown cluster '{}'",
            name, app.cluster
        ));
    }
    if !fargate_size_supported(app.cpu, app.memory_mib) {
        err(format!(
            "app '{}' cpu {} with memory {} MiB is not a supported Fargate size",
            name, app.cpu, app.memory_mib
        ));
    }
    if app.min_capacity == 0 || app.min_capacity > app.max_capacity {
        err(format!(
            "app '{}' needs 1 <= min_capacity <= max_capacity, got {}..{}",
            name, app.min_capacity, app.max_capacity
        ));
    }
    if !(1..=100).contains(&app.target_cpu_percent) {
        err(format!(
            "app '{}' target_cpu_percent must be 1-100, got {}",
            name, app.target_cpu_percent
        ));
    }
    if app.containers.is_empty() {
        err(format!("app '{}' has no containers", name));
        return;
    }

    for (cname, container) in &app.containers {
        if !image_name_re().is_match(cname) {
            err(format!(
                "app '{}' container name '{}' must be lowercase alphanumeric",
                name, cname
            ));
        }
        for key in container.environment.keys() {
            if !env_name_re().is_match(key) {
                err(format!(
                    "app '{}' container '{}' has invalid environment name '{}'",
                    name, cname, key
                ));
            }
        }
        match &container.image {
            ImageSource::Pipeline { stack, image } => match config.pipelines.get(stack) {
                Some(p) if p.images.contains_key(image) => {}
                Some(_) => err(format!(
                    "app '{}' container '{}' uses unknown image '{}' of pipeline '{}'",
                    name, cname, image, stack
                )),
                None => err(format!(
                    "app '{}' container '{}' references unknown pipeline '{}'",
                    name, cname, stack
                )),
            },
            ImageSource::Registry { name: image, .. } => {
                if image.trim().is_empty() {
                    err(format!(
                        "app '{}' container '{}' has an empty registry image",
                        name, cname
                    ));
                }
            }
            ImageSource::Asset { directory } => {
                if directory.trim().is_empty() {
                    err(format!(
                        "app '{}' container '{}' has an empty asset directory",
                        name, cname
                    ));
                }
            }
        }
    }

    if app.target().is_none() {
        match app.target_container {
            Some(ref t) => err(format!(
                "app '{}' target container '{}' does not exist or exposes no port",
                name, t
            )),
            None => err(format!("app '{}' has no container exposing a port", name)),
        }
    }
}

/// Supported Fargate task sizes (CPU units → memory MiB).
pub fn fargate_size_supported(cpu: u32, memory_mib: u32) -> bool {
    match cpu {
        256 => matches!(memory_mib, 512 | 1024 | 2048),
        512 => (1024..=4096).contains(&memory_mib) && memory_mib % 1024 == 0,
        1024 => (2048..=8192).contains(&memory_mib) && memory_mib % 1024 == 0,
        2048 => (4096..=16384).contains(&memory_mib) && memory_mib % 1024 == 0,
        4096 => (8192..=30720).contains(&memory_mib) && memory_mib % 1024 == 0,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const VALID: &str = r#"
version: "1.0"
name: dbcheck
source: { github_owner: acme, repo: dbcheck, token_secret: github-token }
image_tag_param: /dbcheck/image-tag
clusters:
  DevCluster: { cidr: 10.1.0.0/20, max_azs: 2 }
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
      nginx:
        image: { pipeline: { stack: DevPipelineStack, image: nginx } }
        port: 80
"#;

    fn messages(yaml: &str) -> Vec<String> {
        let config = parse_config(yaml).unwrap();
        validate_config(&config)
            .into_iter()
            .map(|e| e.message)
            .collect()
    }

    fn assert_error(yaml: &str, needle: &str) {
        let msgs = messages(yaml);
        assert!(
            msgs.iter().any(|m| m.contains(needle)),
            "expected '{}' in {:?}",
            needle,
            msgs
        );
    }

    #[test]
    fn test_parse_valid() {
        let msgs = messages(VALID);
        assert!(msgs.is_empty(), "unexpected errors: {:?}", msgs);
    }

    #[test]
    fn test_bad_version() {
        assert_error(&VALID.replace("\"1.0\"", "\"2.0\""), "version");
    }

    #[test]
    fn test_empty_source_field() {
        assert_error(
            &VALID.replace("github_owner: acme", "github_owner: \"\""),
            "source.github_owner",
        );
    }

    #[test]
    fn test_relative_image_tag_param() {
        assert_error(
            &VALID.replace("/dbcheck/image-tag", "dbcheck-image-tag"),
            "absolute SSM path",
        );
    }

    #[test]
    fn test_duplicate_stack_name() {
        assert_error(
            &VALID.replace("DevCluster: {", "DevAppStack: {"),
            "declared more than once",
        );
    }

    #[test]
    fn test_invalid_stack_name() {
        assert_error(&VALID.replace("DevCluster", "9Cluster"), "must start with a letter");
    }

    #[test]
    fn test_cluster_cidr_invalid() {
        assert_error(&VALID.replace("10.1.0.0/20", "10.1.0.0"), "invalid cidr");
    }

    #[test]
    fn test_cluster_cidr_too_small() {
        assert_error(&VALID.replace("10.1.0.0/20", "10.1.0.0/27"), "cannot hold");
    }

    #[test]
    fn test_cluster_max_azs_range() {
        assert_error(&VALID.replace("max_azs: 2", "max_azs: 0"), "max_azs");
    }

    #[test]
    fn test_unknown_deploy_stack() {
        assert_error(
            &VALID.replace("deploy_stack: DevAppStack", "deploy_stack: Ghost"),
            "unknown app stack 'Ghost'",
        );
    }

    #[test]
    fn test_unbound_pipeline_image() {
        let yaml = VALID.replace(
            "      nginx: { context: nginx }\n",
            "      nginx: { context: nginx }\n      dbcheck: { context: dbcheck }\n",
        );
        assert_error(&yaml, "image 'dbcheck' is not used by deploy stack");
    }

    #[test]
    fn test_unknown_pipeline_reference() {
        assert_error(
            &VALID.replace("{ stack: DevPipelineStack, image: app }", "{ stack: Nope, image: app }"),
            "unknown pipeline 'Nope'",
        );
    }

    #[test]
    fn test_unknown_pipeline_image() {
        assert_error(
            &VALID.replace("{ stack: DevPipelineStack, image: app }", "{ stack: DevPipelineStack, image: web }"),
            "unknown image 'web'",
        );
    }

    #[test]
    fn test_unknown_cluster() {
        assert_error(&VALID.replace("cluster: DevCluster", "cluster: Prod"), "unknown cluster");
    }

    #[test]
    fn test_bad_fargate_size() {
        let yaml = VALID.replace("cluster: DevCluster\n", "cluster: DevCluster\n    cpu: 256\n    memory_mib: 4096\n");
        assert_error(&yaml, "not a supported Fargate size");
    }

    #[test]
    fn test_no_port_for_target() {
        let yaml = VALID
            .replace("        port: 3000\n", "")
            .replace("        port: 80\n", "");
        assert_error(&yaml, "no container exposing a port");
    }

    #[test]
    fn test_invalid_image_key() {
        assert_error(
            &VALID.replace("nginx: { context: nginx }", "Nginx: { context: nginx }"),
            "not a valid repository name",
        );
    }

    #[test]
    fn test_fargate_sizes() {
        assert!(fargate_size_supported(256, 512));
        assert!(fargate_size_supported(512, 3072));
        assert!(fargate_size_supported(4096, 30720));
        assert!(!fargate_size_supported(256, 4096));
        assert!(!fargate_size_supported(300, 512));
        assert!(!fargate_size_supported(1024, 2500));
    }

    #[test]
    fn test_parse_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ecsforge.yaml");
        std::fs::write(&path, VALID).unwrap();
        let config = parse_config_file(&path).unwrap();
        assert_eq!(config.name, "dbcheck");
    }

    #[test]
    fn test_parse_missing_file() {
        let err = parse_config_file(Path::new("/nonexistent/ecsforge.yaml")).unwrap_err();
        assert!(err.contains("failed to read"));
    }

    #[test]
    fn test_parse_invalid_yaml() {
        assert!(parse_config("not: [valid: yaml: {{").is_err());
    }
}
