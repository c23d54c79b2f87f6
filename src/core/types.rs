//! Configuration schema for `ecsforge.yaml`.
//!
//! Defines the clusters, build pipelines and Fargate applications to
//! synthesize. All types derive Serialize/Deserialize for YAML roundtripping;
//! maps are order-preserving so generated templates follow declaration order.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Top-level ecsforge.yaml
// ============================================================================

/// Root configuration. Immutable once parsed; passed by reference to every
/// stack builder that needs a setting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForgeConfig {
    /// Schema version (must be "1.0")
    pub version: String,

    /// Project name
    pub name: String,

    /// Optional description, copied into every template
    #[serde(default)]
    pub description: Option<String>,

    /// Target account/region (environment-agnostic when omitted)
    #[serde(default)]
    pub env: Environment,

    /// Source repository watched by the pipelines
    pub source: SourceConfig,

    /// SSM parameter the docker build writes the latest image tag to
    #[serde(default = "default_image_tag_param")]
    pub image_tag_param: String,

    /// VPC + ECS cluster stacks
    #[serde(default)]
    pub clusters: IndexMap<String, ClusterSpec>,

    /// Build/deploy pipeline stacks
    #[serde(default)]
    pub pipelines: IndexMap<String, PipelineSpec>,

    /// Fargate application stacks
    #[serde(default)]
    pub apps: IndexMap<String, AppSpec>,
}

fn default_image_tag_param() -> String {
    "/ecsforge/image-tag".to_string()
}

impl ForgeConfig {
    /// Total number of stacks declared.
    pub fn stack_count(&self) -> usize {
        self.clusters.len() + self.pipelines.len() + self.apps.len()
    }

    /// Every stack name, in section order (clusters, pipelines, apps).
    pub fn stack_names(&self) -> Vec<&str> {
        self.clusters
            .keys()
            .chain(self.pipelines.keys())
            .chain(self.apps.keys())
            .map(String::as_str)
            .collect()
    }
}

/// Deployment environment. `None` fields render as pseudo parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Environment {
    #[serde(default)]
    pub account: Option<String>,

    #[serde(default)]
    pub region: Option<String>,
}

/// GitHub source settings shared by all pipelines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Repository owner (user or organization)
    pub github_owner: String,

    /// Repository name
    pub repo: String,

    /// Secrets Manager secret holding the GitHub OAuth token
    pub token_secret: String,

    /// Branch to poll
    #[serde(default = "default_branch")]
    pub branch: String,
}

fn default_branch() -> String {
    "dev".to_string()
}

// ============================================================================
// Clusters
// ============================================================================

/// A VPC with an ECS cluster inside it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterSpec {
    /// IPv4 CIDR block of the VPC
    pub cidr: String,

    /// Number of availability zones to spread subnets over
    #[serde(default = "default_max_azs")]
    pub max_azs: u8,
}

fn default_max_azs() -> u8 {
    2
}

// ============================================================================
// Pipelines
// ============================================================================

/// A pipeline that builds images on every commit and deploys an app stack
/// with the new image tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSpec {
    /// App stack deployed by the pipeline's Deploy stage
    pub deploy_stack: String,

    /// Branch override (defaults to `source.branch`)
    #[serde(default)]
    pub branch: Option<String>,

    /// CodeBuild image used by both build projects
    #[serde(default = "default_build_image")]
    pub build_image: String,

    /// Images built and pushed by the pipeline, keyed by repository suffix
    pub images: IndexMap<String, ImageBuild>,
}

fn default_build_image() -> String {
    "aws/codebuild/standard:5.0".to_string()
}

impl PipelineSpec {
    pub fn branch<'a>(&'a self, source: &'a SourceConfig) -> &'a str {
        self.branch.as_deref().unwrap_or(&source.branch)
    }
}

/// Docker build settings for one pipeline image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageBuild {
    /// Build context directory, relative to the source repository root
    pub context: String,
}

// ============================================================================
// Apps
// ============================================================================

/// A load-balanced Fargate service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppSpec {
    /// Cluster stack the service runs in
    pub cluster: String,

    /// Task CPU units
    #[serde(default = "default_cpu")]
    pub cpu: u32,

    /// Task memory (MiB)
    #[serde(default = "default_memory")]
    pub memory_mib: u32,

    /// Autoscaling floor
    #[serde(default = "default_min_capacity")]
    pub min_capacity: u32,

    /// Autoscaling ceiling
    #[serde(default = "default_max_capacity")]
    pub max_capacity: u32,

    /// CPU utilization the scaling policy tracks
    #[serde(default = "default_target_cpu")]
    pub target_cpu_percent: u32,

    /// Scale-in and scale-out cooldown
    #[serde(default = "default_cooldown")]
    pub scale_cooldown_seconds: u32,

    /// Public HTTP listener port
    #[serde(default = "default_listener_port")]
    pub listener_port: u16,

    /// Container receiving load balancer traffic (defaults to the first
    /// container exposing a port)
    #[serde(default)]
    pub target_container: Option<String>,

    /// Containers in the task, in declaration order
    pub containers: IndexMap<String, ContainerSpec>,
}

fn default_cpu() -> u32 {
    256
}

fn default_memory() -> u32 {
    512
}

fn default_min_capacity() -> u32 {
    1
}

fn default_max_capacity() -> u32 {
    4
}

fn default_target_cpu() -> u32 {
    50
}

fn default_cooldown() -> u32 {
    60
}

fn default_listener_port() -> u16 {
    80
}

impl AppSpec {
    /// Name and port of the container behind the load balancer.
    pub fn target(&self) -> Option<(&str, u16)> {
        match self.target_container {
            Some(ref name) => self
                .containers
                .get(name)
                .and_then(|c| c.port)
                .map(|p| (name.as_str(), p)),
            None => self
                .containers
                .iter()
                .find_map(|(name, c)| c.port.map(|p| (name.as_str(), p))),
        }
    }
}

/// One container of a task definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSpec {
    /// Where the image comes from, written as a single-key map
    /// (`image: { pipeline: { stack: ..., image: ... } }`)
    #[serde(with = "serde_yaml_ng::with::singleton_map")]
    pub image: ImageSource,

    /// Container port to map
    #[serde(default)]
    pub port: Option<u16>,

    /// awslogs stream prefix (defaults to the container name)
    #[serde(default)]
    pub log_prefix: Option<String>,

    /// Plain environment variables
    #[serde(default)]
    pub environment: IndexMap<String, String>,

    /// Whether the task stops when this container stops
    #[serde(default = "default_true")]
    pub essential: bool,
}

fn default_true() -> bool {
    true
}

/// Image source of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageSource {
    /// Literal registry reference, e.g. `nginx:1.25`
    Registry {
        name: String,
        /// Secrets Manager ARN with private registry credentials
        #[serde(default)]
        credentials: Option<String>,
    },
    /// Local build context, tagged by its content hash
    Asset { directory: String },
    /// Image built by a pipeline; tag supplied at deployment
    Pipeline { stack: String, image: String },
}

impl fmt::Display for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Registry { name, .. } => write!(f, "registry {}", name),
            Self::Asset { directory } => write!(f, "asset {}", directory),
            Self::Pipeline { stack, image } => write!(f, "pipeline {}/{}", stack, image),
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
