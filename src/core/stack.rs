//! A deployable unit: one template plus its environment and dependencies.

use super::error::SynthError;
use super::naming::logical_id;
use super::template::{CfnOutput, CfnParameter, CfnResource, Template};
use super::token::{ResolveContext, TokenString};
use super::types::Environment;
use serde_json::Value;
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct Stack {
    name: String,
    env: Environment,
    template: Template,
    dependencies: Vec<String>,
}

impl Stack {
    pub fn new(name: &str, env: &Environment) -> Self {
        Self {
            name: name.to_string(),
            env: env.clone(),
            template: Template::default(),
            dependencies: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn template(&self) -> &Template {
        &self.template
    }

    pub fn set_description(&mut self, description: impl Into<String>) {
        self.template.description = Some(description.into());
    }

    /// Add a resource at a construct path. Returns its logical id.
    pub fn add_resource(
        &mut self,
        path: &[&str],
        resource: CfnResource,
    ) -> Result<String, SynthError> {
        let id = self.claim(path)?;
        self.template.resources.insert(id.clone(), resource);
        Ok(id)
    }

    /// Add a parameter at a construct path. Returns its logical id.
    pub fn add_parameter(
        &mut self,
        path: &[&str],
        parameter: CfnParameter,
    ) -> Result<String, SynthError> {
        let id = self.claim(path)?;
        self.template.parameters.insert(id.clone(), parameter);
        Ok(id)
    }

    pub fn add_output(&mut self, id: &str, output: CfnOutput) -> Result<(), SynthError> {
        if self.template.outputs.contains_key(id) {
            return Err(SynthError::DuplicateLogicalId {
                stack: self.name.clone(),
                id: id.to_string(),
            });
        }
        self.template.outputs.insert(id.to_string(), output);
        Ok(())
    }

    /// Export a value for other stacks. Returns the export name.
    pub fn export(&mut self, key: &str, value: TokenString) -> Result<String, SynthError> {
        let name = Self::export_name(&self.name, key);
        self.add_output(key, CfnOutput::new(value).exported_as(name.clone()))?;
        Ok(name)
    }

    /// Export name other stacks import with `Fn::ImportValue`.
    pub fn export_name(stack: &str, key: &str) -> String {
        format!("{}:{}", stack, key)
    }

    pub fn add_dependency(&mut self, stack: &str) {
        if stack != self.name && !self.dependencies.iter().any(|d| d == stack) {
            self.dependencies.push(stack.to_string());
        }
    }

    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    pub fn parameter_ids(&self) -> Vec<String> {
        self.template.parameters.keys().cloned().collect()
    }

    pub fn account(&self) -> TokenString {
        match self.env.account {
            Some(ref a) => TokenString::literal(a.clone()),
            None => TokenString::reference("AWS::AccountId"),
        }
    }

    pub fn region(&self) -> TokenString {
        match self.env.region {
            Some(ref r) => TokenString::literal(r.clone()),
            None => TokenString::reference("AWS::Region"),
        }
    }

    pub fn partition(&self) -> TokenString {
        match self.env.region.as_deref() {
            Some(r) if r.starts_with("cn-") => TokenString::literal("aws-cn"),
            Some(r) if r.starts_with("us-gov-") => TokenString::literal("aws-us-gov"),
            Some(_) => TokenString::literal("aws"),
            None => TokenString::reference("AWS::Partition"),
        }
    }

    pub fn url_suffix(&self) -> TokenString {
        match self.env.region.as_deref() {
            Some(r) if r.starts_with("cn-") => TokenString::literal("amazonaws.com.cn"),
            Some(_) => TokenString::literal("amazonaws.com"),
            None => TokenString::reference("AWS::URLSuffix"),
        }
    }

    /// `arn:{partition}:{service}:{region}:{account}:{resource}`
    pub fn arn(&self, service: &str, resource: &str) -> TokenString {
        TokenString::literal("arn:")
            .push(self.partition())
            .push(format!(":{}:", service))
            .push(self.region())
            .push(":")
            .push(self.account())
            .push(format!(":{}", resource))
    }

    /// Materialize the template, substituting deployment parameter values.
    pub fn synth(&self, overrides: &HashMap<String, String>) -> Result<Value, SynthError> {
        for name in overrides.keys() {
            if !self.template.parameters.contains_key(name) {
                return Err(SynthError::UnknownParameter {
                    stack: self.name.clone(),
                    name: name.clone(),
                });
            }
        }
        let ctx = ResolveContext::default().with_parameters(overrides.clone());
        self.template.synth(&ctx)
    }

    fn claim(&self, path: &[&str]) -> Result<String, SynthError> {
        let id = logical_id(path);
        if self.template.contains(&id) {
            return Err(SynthError::DuplicateLogicalId {
                stack: self.name.clone(),
                id,
            });
        }
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::template::Prop;
    use serde_json::json;

    fn env() -> Environment {
        Environment {
            account: Some("123456789012".to_string()),
            region: Some("ap-southeast-2".to_string()),
        }
    }

    #[test]
    fn test_add_resource_returns_logical_id() {
        let mut s = Stack::new("DevCluster", &env());
        let id = s
            .add_resource(&["Vpc"], CfnResource::new("AWS::EC2::VPC", Prop::Null))
            .unwrap();
        assert_eq!(id, "Vpc");
        assert!(s.template().resources.contains_key("Vpc"));
    }

    #[test]
    fn test_duplicate_logical_id_rejected() {
        let mut s = Stack::new("S", &env());
        s.add_parameter(&["Tag"], CfnParameter::string()).unwrap();
        let err = s
            .add_resource(&["Tag"], CfnResource::new("AWS::S3::Bucket", Prop::Null))
            .unwrap_err();
        assert!(matches!(err, SynthError::DuplicateLogicalId { .. }));
    }

    #[test]
    fn test_export_names() {
        let mut s = Stack::new("DevCluster", &env());
        let name = s.export("VpcId", TokenString::reference("Vpc")).unwrap();
        assert_eq!(name, "DevCluster:VpcId");
        assert!(s.export("VpcId", TokenString::literal("x")).is_err());
    }

    #[test]
    fn test_dependencies_dedup_and_skip_self() {
        let mut s = Stack::new("App", &env());
        s.add_dependency("Cluster");
        s.add_dependency("Cluster");
        s.add_dependency("App");
        assert_eq!(s.dependencies(), ["Cluster".to_string()]);
    }

    #[test]
    fn test_env_literal_vs_pseudo() {
        let s = Stack::new("S", &env());
        assert_eq!(s.account().as_literal().as_deref(), Some("123456789012"));
        assert_eq!(s.url_suffix().as_literal().as_deref(), Some("amazonaws.com"));
        assert_eq!(
            s.arn("ecr", "repository/app").as_literal().as_deref(),
            Some("arn:aws:ecr:ap-southeast-2:123456789012:repository/app")
        );

        let agnostic = Stack::new("S", &Environment::default());
        let ctx = ResolveContext::default();
        assert_eq!(
            agnostic.region().resolve(&ctx).unwrap(),
            json!({"Ref": "AWS::Region"})
        );
        assert_eq!(
            agnostic.partition().resolve(&ctx).unwrap(),
            json!({"Ref": "AWS::Partition"})
        );
    }

    #[test]
    fn test_china_region_partition() {
        let s = Stack::new(
            "S",
            &Environment {
                account: None,
                region: Some("cn-north-1".to_string()),
            },
        );
        assert_eq!(s.partition().as_literal().as_deref(), Some("aws-cn"));
        assert_eq!(s.url_suffix().as_literal().as_deref(), Some("amazonaws.com.cn"));
    }

    #[test]
    fn test_synth_rejects_unknown_override() {
        let s = Stack::new("S", &env());
        let mut overrides = HashMap::new();
        overrides.insert("Nope".to_string(), "v".to_string());
        assert!(matches!(
            s.synth(&overrides).unwrap_err(),
            SynthError::UnknownParameter { .. }
        ));
    }
}
