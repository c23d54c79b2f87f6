//! ecsforge: ECS service infrastructure as code.
//!
//! Declares VPC-backed Fargate clusters, load-balanced services and the
//! CodePipeline that builds their images in one YAML file, and synthesizes
//! them into CloudFormation templates. Images built by a pipeline are
//! deferred: their tag is a placeholder parameter the pipeline fills in
//! when it deploys.

pub mod assets;
pub mod cli;
pub mod core;
pub mod resources;
pub mod stacks;
