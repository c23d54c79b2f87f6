//! ECR repositories.

use super::iam::{Grantable, PolicyStatement};
use crate::core::error::SynthError;
use crate::core::stack::Stack;
use crate::core::template::{CfnResource, Prop};
use crate::core::token::TokenString;
use std::cell::RefCell;
use tracing::debug;

const PULL_ACTIONS: &[&str] = &[
    "ecr:BatchCheckLayerAvailability",
    "ecr:GetDownloadUrlForLayer",
    "ecr:BatchGetImage",
];

const PUSH_ACTIONS: &[&str] = &[
    "ecr:PutImage",
    "ecr:InitiateLayerUpload",
    "ecr:UploadLayerPart",
    "ecr:CompleteLayerUpload",
];

/// A named image repository.
///
/// The URI and ARN are computed from the owning stack's environment, so a
/// repository declared in one stack can be referenced from another without
/// an export.
#[derive(Debug)]
pub struct Repository {
    name: String,
    uri: TokenString,
    arn: TokenString,
    grants: RefCell<Vec<String>>,
}

impl Repository {
    /// Reference a repository by name in the given stack's account/region.
    pub fn from_name(stack: &Stack, name: &str) -> Self {
        let uri = stack
            .account()
            .push(".dkr.ecr.")
            .push(stack.region())
            .push(".")
            .push(stack.url_suffix())
            .push(format!("/{}", name));
        Self {
            name: name.to_string(),
            uri,
            arn: stack.arn("ecr", &format!("repository/{}", name)),
            grants: RefCell::new(Vec::new()),
        }
    }

    /// Declare a new repository in the stack.
    pub fn declare(stack: &mut Stack, path: &str, name: &str) -> Result<Self, SynthError> {
        let repo = Self::from_name(stack, name);
        stack.add_resource(
            &[path, "Resource"],
            CfnResource::new(
                "AWS::ECR::Repository",
                Prop::map([("RepositoryName", Prop::from(name))]),
            ),
        )?;
        Ok(repo)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn arn(&self) -> TokenString {
        self.arn.clone()
    }

    /// `{account}.dkr.ecr.{region}.{suffix}/{name}`
    pub fn repository_uri(&self) -> TokenString {
        self.uri.clone()
    }

    /// `{account}.dkr.ecr.{region}.{suffix}/{name}:{tag}`. The tag may be a
    /// deferred token; it is not evaluated here.
    pub fn uri_for_tag(&self, tag: TokenString) -> TokenString {
        self.uri.clone().push(":").push(tag)
    }

    /// Allow the grantee to pull images.
    pub fn grant_pull(&self, grantee: &mut dyn Grantable) {
        debug!(
            repository = %self.name,
            principal = grantee.grant_principal(),
            "grant pull"
        );
        self.grants
            .borrow_mut()
            .push(grantee.grant_principal().to_string());
        grantee.add_to_principal_policy(PolicyStatement::allow(PULL_ACTIONS, vec![self.arn()]));
        grantee.add_to_principal_policy(PolicyStatement::allow(
            &["ecr:GetAuthorizationToken"],
            vec![TokenString::literal("*")],
        ));
    }

    /// Allow the grantee to pull and push images.
    pub fn grant_pull_push(&self, grantee: &mut dyn Grantable) {
        self.grant_pull(grantee);
        grantee.add_to_principal_policy(PolicyStatement::allow(PUSH_ACTIONS, vec![self.arn()]));
    }

    /// Principals granted access so far, one entry per grant.
    pub fn grantees(&self) -> Vec<String> {
        self.grants.borrow().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::token::ResolveContext;
    use crate::core::types::Environment;
    use crate::resources::iam::Role;
    use serde_json::json;

    fn stack() -> Stack {
        Stack::new(
            "Pipeline",
            &Environment {
                account: Some("123".to_string()),
                region: Some("region".to_string()),
            },
        )
    }

    #[test]
    fn test_uri_for_tag_literal_env() {
        let repo = Repository::from_name(&stack(), "app-repo");
        assert_eq!(
            repo.uri_for_tag("abc123".into()).as_literal().as_deref(),
            Some("123.dkr.ecr.region.amazonaws.com/app-repo:abc123")
        );
    }

    #[test]
    fn test_uri_for_tag_agnostic_env() {
        let s = Stack::new("S", &Environment::default());
        let repo = Repository::from_name(&s, "app");
        let v = repo
            .uri_for_tag(TokenString::reference("Tag"))
            .resolve(&ResolveContext::default())
            .unwrap();
        assert_eq!(
            v,
            json!({"Fn::Join": ["", [
                {"Ref": "AWS::AccountId"}, ".dkr.ecr.", {"Ref": "AWS::Region"}, ".",
                {"Ref": "AWS::URLSuffix"}, "/app:", {"Ref": "Tag"}
            ]]})
        );
    }

    #[test]
    fn test_declare_adds_resource() {
        let mut s = stack();
        let repo = Repository::declare(&mut s, "AppEcrRepo", "pipeline-app").unwrap();
        assert_eq!(repo.name(), "pipeline-app");
        assert_eq!(s.template().resources.len(), 1);
        let (_, r) = s.template().resources.first().unwrap();
        assert_eq!(r.resource_type, "AWS::ECR::Repository");
    }

    #[test]
    fn test_grant_pull_records_grantee() {
        let repo = Repository::from_name(&stack(), "app");
        let mut role = Role::new(&["TaskDef", "ExecutionRole"], "ecs-tasks.amazonaws.com");
        repo.grant_pull(&mut role);
        assert_eq!(repo.grantees(), vec![role.logical_id().to_string()]);
        assert_eq!(role.statements().len(), 2);
        assert_eq!(
            role.statements()[0].resources[0].as_literal().as_deref(),
            Some("arn:aws:ecr:region:123:repository/app")
        );
    }

    #[test]
    fn test_grant_pull_push_adds_push_actions() {
        let repo = Repository::from_name(&stack(), "app");
        let mut role = Role::new(&["Build", "Role"], "codebuild.amazonaws.com");
        repo.grant_pull_push(&mut role);
        assert_eq!(role.statements().len(), 3);
        assert!(role.statements()[2]
            .actions
            .contains(&"ecr:PutImage".to_string()));
    }
}
