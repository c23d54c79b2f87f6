//! Cluster stack: a VPC and the ECS cluster app stacks run in.
//!
//! Everything app stacks need is exported as `<stack>:<key>` and imported
//! on the other side with `Fn::ImportValue`, see [`ClusterImports`].

use crate::core::error::SynthError;
use crate::core::stack::Stack;
use crate::core::token::TokenString;
use crate::core::types::{ClusterSpec, ForgeConfig};
use crate::resources::ecs::Cluster;
use crate::resources::vpc::Vpc;
use tracing::info;

pub const VPC_ID: &str = "VpcId";
pub const CLUSTER_NAME: &str = "ClusterName";

pub fn public_subnet_key(index: usize) -> String {
    format!("PublicSubnet{}Id", index + 1)
}

pub fn private_subnet_key(index: usize) -> String {
    format!("PrivateSubnet{}Id", index + 1)
}

pub fn build(name: &str, spec: &ClusterSpec, config: &ForgeConfig) -> Result<Stack, SynthError> {
    let mut stack = Stack::new(name, &config.env);
    if let Some(ref d) = config.description {
        stack.set_description(d.clone());
    }

    let vpc = Vpc::build(&mut stack, "Vpc", &spec.cidr, spec.max_azs)?;
    let cluster = Cluster::build(&mut stack, "FargateCluster")?;

    stack.export(VPC_ID, vpc.vpc_id())?;
    for (i, subnet) in vpc.public_subnet_ids().into_iter().enumerate() {
        stack.export(&public_subnet_key(i), subnet)?;
    }
    for (i, subnet) in vpc.private_subnet_ids().into_iter().enumerate() {
        stack.export(&private_subnet_key(i), subnet)?;
    }
    stack.export(CLUSTER_NAME, cluster.cluster_name())?;

    info!(
        stack = name,
        cidr = %vpc.cidr(),
        azs = spec.max_azs,
        resources = stack.template().resources.len(),
        "built cluster stack"
    );
    Ok(stack)
}

/// The cluster stack's exports, as seen from an app stack.
#[derive(Debug, Clone)]
pub struct ClusterImports {
    pub vpc_id: TokenString,
    pub public_subnets: Vec<TokenString>,
    pub private_subnets: Vec<TokenString>,
    pub cluster_name: TokenString,
}

impl ClusterImports {
    pub fn new(cluster_stack: &str, spec: &ClusterSpec) -> Self {
        let import = |key: &str| TokenString::import_value(Stack::export_name(cluster_stack, key));
        let azs = usize::from(spec.max_azs);
        Self {
            vpc_id: import(VPC_ID),
            public_subnets: (0..azs).map(|i| import(&public_subnet_key(i))).collect(),
            private_subnets: (0..azs).map(|i| import(&private_subnet_key(i))).collect(),
            cluster_name: import(CLUSTER_NAME),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::parser::parse_config;
    use crate::core::token::ResolveContext;
    use serde_json::json;
    use std::collections::HashMap;

    const CONFIG: &str = r#"
version: "1.0"
name: dbcheck
description: dbcheck infrastructure
source: { github_owner: acme, repo: dbcheck, token_secret: github-token }
clusters:
  DevCluster: { cidr: 10.1.0.0/20, max_azs: 2 }
"#;

    #[test]
    fn test_cluster_stack_exports() {
        let config = parse_config(CONFIG).unwrap();
        let stack = build("DevCluster", &config.clusters["DevCluster"], &config).unwrap();
        let t = stack.synth(&HashMap::new()).unwrap();

        assert_eq!(t["Description"], json!("dbcheck infrastructure"));
        let outputs = t["Outputs"].as_object().unwrap();
        assert_eq!(outputs.len(), 6);
        assert_eq!(
            outputs["VpcId"]["Export"]["Name"],
            json!("DevCluster:VpcId")
        );
        assert_eq!(
            outputs["PrivateSubnet2Id"]["Export"]["Name"],
            json!("DevCluster:PrivateSubnet2Id")
        );
        assert!(outputs["ClusterName"]["Value"]["Ref"].is_string());
    }

    #[test]
    fn test_imports_match_exports() {
        let config = parse_config(CONFIG).unwrap();
        let imports = ClusterImports::new("DevCluster", &config.clusters["DevCluster"]);
        let ctx = ResolveContext::default();
        assert_eq!(imports.public_subnets.len(), 2);
        assert_eq!(
            imports.private_subnets[1].resolve(&ctx).unwrap(),
            json!({"Fn::ImportValue": "DevCluster:PrivateSubnet2Id"})
        );
        assert_eq!(
            imports.cluster_name.resolve(&ctx).unwrap(),
            json!({"Fn::ImportValue": "DevCluster:ClusterName"})
        );
    }

    #[test]
    fn test_bad_cidr_is_synth_error() {
        let config = parse_config(&CONFIG.replace("10.1.0.0/20", "10.1.0.0/27")).unwrap();
        assert!(matches!(
            build("DevCluster", &config.clusters["DevCluster"], &config).unwrap_err(),
            SynthError::Cidr { .. }
        ));
    }
}
