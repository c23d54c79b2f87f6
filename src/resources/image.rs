//! Container image sources.
//!
//! Immediate images ([`RegistryImage`], [`AssetImage`]) know their full
//! reference when constructed. A [`PipelineImage`] does not: its tag is
//! produced by a build pipeline after synthesis, so binding it to a
//! container allocates a template parameter that the pipeline's deploy
//! action fills in through a parameter override keyed by
//! [`PipelineImage::param_names_for`].
//!
//! Lifecycle of a pipeline image: construct over a repository, bind once
//! per consumer, then materialize during synthesis. Materializing
//! [`PipelineImage::image_name`] or [`PipelineImage::param_name`] before any
//! bind fails with [`TokenError::Unbound`].

use super::ecr::Repository;
use super::iam::{Grantable, PolicyStatement};
use crate::assets::hasher;
use crate::core::error::{SynthError, TokenError};
use crate::core::stack::Stack;
use crate::core::template::{CfnParameter, Prop};
use crate::core::token::TokenString;
use serde::Serialize;
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use std::rc::Rc;
use tracing::debug;

/// Construct id of the placeholder parameter under its consumer.
pub const PLACEHOLDER_ID: &str = "PipelineParam";

/// Repository holding every asset image of an environment.
pub const ASSETS_REPOSITORY: &str = "ecsforge-container-assets";

/// Private registry credentials attached to a container definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryCredentials {
    /// Secrets Manager ARN with the registry username/password
    pub credentials_parameter: String,
}

impl RepositoryCredentials {
    pub fn to_prop(&self) -> Prop {
        Prop::map([(
            "CredentialsParameter",
            Prop::from(self.credentials_parameter.clone()),
        )])
    }
}

/// What a container definition receives from a bound image.
#[derive(Debug, Clone)]
pub struct ImageConfig {
    pub image_name: TokenString,
    pub repository_credentials: Option<RepositoryCredentials>,
}

/// A definition that can host an image (a container of a task definition).
pub trait ImageConsumer {
    fn stack_name(&self) -> &str;

    /// Construct path of the consumer inside its stack.
    fn consumer_path(&self) -> Vec<String>;

    /// Allocate a parameter scoped to the consumer. Returns its logical id.
    fn allocate_parameter(
        &mut self,
        id: &str,
        parameter: CfnParameter,
    ) -> Result<String, SynthError>;

    /// Identity that pulls the image when the task starts.
    fn execution_role(&mut self) -> &mut dyn Grantable;
}

/// One allocated placeholder parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Placeholder {
    pub stack: String,
    pub consumer: String,
    pub parameter: String,
    pub repository: String,
}

// ============================================================================
// Pipeline images
// ============================================================================

/// An image whose tag is supplied at deployment time.
#[derive(Debug)]
pub struct PipelineImage {
    repository: Rc<Repository>,
    bindings: Rc<RefCell<Vec<Placeholder>>>,
    image_name: TokenString,
}

impl PipelineImage {
    pub fn new(repository: Rc<Repository>) -> Self {
        let bindings: Rc<RefCell<Vec<Placeholder>>> = Rc::new(RefCell::new(Vec::new()));
        let current = Rc::clone(&bindings);
        let label = describe(repository.name());
        let tag = TokenString::lazy(move || {
            current
                .borrow()
                .last()
                .map(|b| TokenString::reference(b.parameter.clone()))
                .ok_or_else(|| TokenError::Unbound(label.clone()))
        });
        let image_name = repository.uri_for_tag(tag);
        Self {
            repository,
            bindings,
            image_name,
        }
    }

    pub fn repository(&self) -> &Repository {
        &self.repository
    }

    /// Repository URI tagged with the most recently allocated placeholder.
    pub fn image_name(&self) -> TokenString {
        self.image_name.clone()
    }

    /// Logical id of the most recently allocated placeholder.
    pub fn param_name(&self) -> TokenString {
        let current = Rc::clone(&self.bindings);
        let label = describe(self.repository.name());
        TokenString::lazy(move || {
            current
                .borrow()
                .last()
                .map(|b| TokenString::literal(b.parameter.clone()))
                .ok_or_else(|| TokenError::Unbound(label.clone()))
        })
    }

    /// Logical ids of every placeholder allocated in `stack`, in bind
    /// order. Read at synthesis time, after all consumers have bound.
    pub fn param_names_for(&self, stack: &str) -> Result<Vec<String>, TokenError> {
        let bindings = self.bindings.borrow();
        if bindings.is_empty() {
            return Err(TokenError::Unbound(describe(self.repository.name())));
        }
        let names: Vec<String> = bindings
            .iter()
            .filter(|b| b.stack == stack)
            .map(|b| b.parameter.clone())
            .collect();
        if names.is_empty() {
            return Err(TokenError::NotBoundInStack {
                image: describe(self.repository.name()),
                stack: stack.to_string(),
            });
        }
        Ok(names)
    }

    /// Attach the image to a consumer: grant the consumer's execution role
    /// pull access, allocate its placeholder parameter, and return an image
    /// config whose name stays deferred until synthesis.
    pub fn bind(&self, consumer: &mut dyn ImageConsumer) -> Result<ImageConfig, SynthError> {
        let stack = consumer.stack_name().to_string();
        let consumer_path = consumer.consumer_path().join("/");
        if self
            .bindings
            .borrow()
            .iter()
            .any(|b| b.stack == stack && b.consumer == consumer_path)
        {
            return Err(SynthError::AlreadyBound {
                image: describe(self.repository.name()),
                consumer: consumer_path,
                stack,
            });
        }

        self.repository.grant_pull(consumer.execution_role());
        let parameter = consumer.allocate_parameter(
            PLACEHOLDER_ID,
            CfnParameter::string()
                .with_description(format!("Image tag for {}", self.repository.name())),
        )?;

        debug!(
            repository = self.repository.name(),
            stack = %stack,
            consumer = %consumer_path,
            parameter = %parameter,
            "bound pipeline image"
        );

        let index = {
            let mut bindings = self.bindings.borrow_mut();
            bindings.push(Placeholder {
                stack,
                consumer: consumer_path,
                parameter,
                repository: self.repository.name().to_string(),
            });
            bindings.len() - 1
        };

        // Pinned to this binding, so a later bind elsewhere cannot retarget
        // a container that was already configured.
        let pinned = Rc::clone(&self.bindings);
        let label = describe(self.repository.name());
        let tag = TokenString::lazy(move || {
            pinned
                .borrow()
                .get(index)
                .map(|b| TokenString::reference(b.parameter.clone()))
                .ok_or_else(|| TokenError::Unbound(label.clone()))
        });

        Ok(ImageConfig {
            image_name: self.repository.uri_for_tag(tag),
            repository_credentials: self.repository_credentials(),
        })
    }

    /// Pipeline images live in ECR and authenticate through IAM.
    pub fn repository_credentials(&self) -> Option<RepositoryCredentials> {
        None
    }

    /// Every placeholder allocated so far, in bind order.
    pub fn placeholders(&self) -> Vec<Placeholder> {
        self.bindings.borrow().clone()
    }
}

fn describe(repository: &str) -> String {
    format!("pipeline image '{}'", repository)
}

// ============================================================================
// Immediate images
// ============================================================================

/// A literal registry reference such as `nginx:1.25`.
#[derive(Debug, Clone)]
pub struct RegistryImage {
    pub name: String,
    pub credentials: Option<String>,
}

impl RegistryImage {
    fn bind(&self, consumer: &mut dyn ImageConsumer) -> ImageConfig {
        if let Some(ref secret) = self.credentials {
            consumer
                .execution_role()
                .add_to_principal_policy(PolicyStatement::allow(
                    &[
                        "secretsmanager:GetSecretValue",
                        "secretsmanager:DescribeSecret",
                    ],
                    vec![TokenString::literal(secret.clone())],
                ));
        }
        ImageConfig {
            image_name: TokenString::literal(self.name.clone()),
            repository_credentials: self.repository_credentials(),
        }
    }

    pub fn repository_credentials(&self) -> Option<RepositoryCredentials> {
        self.credentials.as_ref().map(|c| RepositoryCredentials {
            credentials_parameter: c.clone(),
        })
    }
}

/// A local build context, tagged with the BLAKE3 digest of its contents.
#[derive(Debug)]
pub struct AssetImage {
    directory: PathBuf,
    tag: String,
    repository: Repository,
}

impl AssetImage {
    pub fn from_directory(stack: &Stack, directory: &Path) -> Result<Self, SynthError> {
        let hash = hasher::hash_directory(directory).map_err(|message| SynthError::Asset {
            path: directory.to_path_buf(),
            message,
        })?;
        Ok(Self {
            directory: directory.to_path_buf(),
            tag: hasher::hex_digest(&hash).to_string(),
            repository: Repository::from_name(stack, ASSETS_REPOSITORY),
        })
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn image_uri(&self) -> TokenString {
        self.repository.uri_for_tag(TokenString::literal(self.tag.clone()))
    }

    fn bind(&self, consumer: &mut dyn ImageConsumer) -> ImageConfig {
        self.repository.grant_pull(consumer.execution_role());
        ImageConfig {
            image_name: self.image_uri(),
            repository_credentials: None,
        }
    }
}

// ============================================================================
// Image sources
// ============================================================================

/// Image source of a container.
#[derive(Debug, Clone)]
pub enum ContainerImage {
    Registry(RegistryImage),
    Asset(Rc<AssetImage>),
    Pipeline(Rc<PipelineImage>),
}

impl ContainerImage {
    pub fn bind(&self, consumer: &mut dyn ImageConsumer) -> Result<ImageConfig, SynthError> {
        match self {
            Self::Registry(r) => Ok(r.bind(consumer)),
            Self::Asset(a) => Ok(a.bind(consumer)),
            Self::Pipeline(p) => p.bind(consumer),
        }
    }

    pub fn repository_credentials(&self) -> Option<RepositoryCredentials> {
        match self {
            Self::Registry(r) => r.repository_credentials(),
            Self::Asset(_) => None,
            Self::Pipeline(p) => p.repository_credentials(),
        }
    }

    /// Whether the tag is only known at deployment.
    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Pipeline(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::token::ResolveContext;
    use crate::core::types::Environment;
    use crate::resources::iam::Role;
    use serde_json::json;
    use std::collections::HashMap;

    struct TaskConsumer {
        stack: Stack,
        path: Vec<String>,
        role: Role,
        grants_at_allocation: Option<usize>,
    }

    impl TaskConsumer {
        fn new(stack: &str, task: &str, container: &str) -> Self {
            Self {
                stack: Stack::new(stack, &env()),
                path: vec![task.to_string(), container.to_string()],
                role: Role::new(&[task, "ExecutionRole"], "ecs-tasks.amazonaws.com"),
                grants_at_allocation: None,
            }
        }
    }

    impl ImageConsumer for TaskConsumer {
        fn stack_name(&self) -> &str {
            self.stack.name()
        }

        fn consumer_path(&self) -> Vec<String> {
            self.path.clone()
        }

        fn allocate_parameter(
            &mut self,
            id: &str,
            parameter: CfnParameter,
        ) -> Result<String, SynthError> {
            self.grants_at_allocation = Some(self.role.statements().len());
            let mut path: Vec<&str> = self.path.iter().map(String::as_str).collect();
            path.push(id);
            self.stack.add_parameter(&path, parameter)
        }

        fn execution_role(&mut self) -> &mut dyn Grantable {
            &mut self.role
        }
    }

    fn env() -> Environment {
        Environment {
            account: Some("123".to_string()),
            region: Some("region".to_string()),
        }
    }

    fn app_repo() -> Rc<Repository> {
        Rc::new(Repository::from_name(
            &Stack::new("DevPipelineStack", &env()),
            "app-repo",
        ))
    }

    fn ctx() -> ResolveContext {
        ResolveContext::default()
    }

    #[test]
    fn test_bind_then_materialize_symbolic_tag() {
        let image = PipelineImage::new(app_repo());
        let mut consumer = TaskConsumer::new("DevAppStack", "taskA", "app");
        let config = image.bind(&mut consumer).unwrap();
        let param = consumer.stack.parameter_ids()[0].clone();

        let expected = json!({"Fn::Join": ["", [
            "123.dkr.ecr.region.amazonaws.com/app-repo:", {"Ref": param}
        ]]});
        assert_eq!(image.image_name().resolve(&ctx()).unwrap(), expected);
        assert_eq!(config.image_name.resolve(&ctx()).unwrap(), expected);
    }

    #[test]
    fn test_end_to_end_supplied_tag() {
        let image = PipelineImage::new(app_repo());
        let mut consumer = TaskConsumer::new("DevAppStack", "taskA", "app");
        let config = image.bind(&mut consumer).unwrap();

        let param = image.param_name().resolve_literal(&ctx()).unwrap();
        let mut values = HashMap::new();
        values.insert(param, "abc123".to_string());
        let deployed = ResolveContext::default().with_parameters(values);

        assert_eq!(
            image.image_name().resolve(&deployed).unwrap(),
            json!("123.dkr.ecr.region.amazonaws.com/app-repo:abc123")
        );
        assert_eq!(
            config.image_name.resolve_literal(&deployed).unwrap(),
            "123.dkr.ecr.region.amazonaws.com/app-repo:abc123"
        );
    }

    #[test]
    fn test_param_name_matches_allocated_parameter() {
        let image = PipelineImage::new(app_repo());
        let mut consumer = TaskConsumer::new("DevAppStack", "taskA", "app");
        image.bind(&mut consumer).unwrap();

        let name = image.param_name();
        let first = name.resolve_literal(&ctx()).unwrap();
        let second = name.resolve_literal(&ctx()).unwrap();
        assert_eq!(first, second);
        assert_eq!(consumer.stack.parameter_ids(), vec![first.clone()]);
        assert!(first.starts_with("taskAappPipelineParam"));

        let declared = &consumer.stack.template().parameters[&first];
        assert_eq!(declared.param_type, "String");
        assert!(declared.default.is_none());
    }

    #[test]
    fn test_materialize_before_bind_fails() {
        let image = PipelineImage::new(app_repo());
        assert!(matches!(
            image.image_name().resolve(&ctx()).unwrap_err(),
            TokenError::Unbound(_)
        ));
        assert!(matches!(
            image.param_name().resolve(&ctx()).unwrap_err(),
            TokenError::Unbound(_)
        ));
        assert!(matches!(
            image.param_names_for("DevAppStack").unwrap_err(),
            TokenError::Unbound(_)
        ));
    }

    #[test]
    fn test_lazy_created_before_bind_resolves_after() {
        let image = PipelineImage::new(app_repo());
        let name = image.param_name();
        let mut consumer = TaskConsumer::new("DevAppStack", "taskA", "app");
        image.bind(&mut consumer).unwrap();
        assert_eq!(
            name.resolve_literal(&ctx()).unwrap(),
            consumer.stack.parameter_ids()[0]
        );
    }

    #[test]
    fn test_two_consumers_get_distinct_parameters() {
        let image = PipelineImage::new(app_repo());
        let mut a = TaskConsumer::new("DevAppStack", "taskA", "app");
        let mut b = TaskConsumer::new("DevAppStack", "taskB", "app");
        let config_a = image.bind(&mut a).unwrap();
        let id_a = image.param_name().resolve_literal(&ctx()).unwrap();
        image.bind(&mut b).unwrap();
        let id_b = image.param_name().resolve_literal(&ctx()).unwrap();

        assert_ne!(id_a, id_b);
        assert_eq!(image.placeholders().len(), 2);
        // The first container keeps its own placeholder
        assert_eq!(
            config_a.image_name.resolve(&ctx()).unwrap(),
            json!({"Fn::Join": ["", ["123.dkr.ecr.region.amazonaws.com/app-repo:", {"Ref": id_a}]]})
        );
    }

    #[test]
    fn test_grant_pull_once_per_bind() {
        let repo = app_repo();
        let image = PipelineImage::new(Rc::clone(&repo));
        let mut a = TaskConsumer::new("DevAppStack", "taskA", "app");
        let mut b = TaskConsumer::new("StagingAppStack", "taskA", "app");
        image.bind(&mut a).unwrap();
        assert_eq!(repo.grantees(), vec![a.role.logical_id().to_string()]);
        image.bind(&mut b).unwrap();
        assert_eq!(repo.grantees().len(), 2);
        assert!(a
            .role
            .statements()
            .iter()
            .any(|s| s.actions.contains(&"ecr:BatchGetImage".to_string())));
    }

    #[test]
    fn test_rebind_same_consumer_rejected() {
        let repo = app_repo();
        let image = PipelineImage::new(Rc::clone(&repo));
        let mut a = TaskConsumer::new("DevAppStack", "taskA", "app");
        image.bind(&mut a).unwrap();
        let err = image.bind(&mut a).unwrap_err();
        assert!(matches!(err, SynthError::AlreadyBound { .. }));
        assert_eq!(repo.grantees().len(), 1);
        assert_eq!(a.stack.parameter_ids().len(), 1);
    }

    #[test]
    fn test_param_names_for_stack() {
        let image = PipelineImage::new(app_repo());
        let mut dev = TaskConsumer::new("DevAppStack", "TaskDef", "app");
        let mut prod = TaskConsumer::new("ProdAppStack", "TaskDef", "web");
        image.bind(&mut dev).unwrap();
        image.bind(&mut prod).unwrap();

        assert_eq!(
            image.param_names_for("DevAppStack").unwrap(),
            dev.stack.parameter_ids()
        );
        assert_eq!(
            image.param_name().resolve_literal(&ctx()).unwrap(),
            prod.stack.parameter_ids()[0]
        );
        assert!(matches!(
            image.param_names_for("Other").unwrap_err(),
            TokenError::NotBoundInStack { .. }
        ));
    }

    #[test]
    fn test_param_names_for_stack_lists_every_consumer() {
        let image = PipelineImage::new(app_repo());
        let mut app = TaskConsumer::new("DevAppStack", "TaskDef", "app");
        let mut worker = TaskConsumer::new("DevAppStack", "TaskDef", "worker");
        image.bind(&mut app).unwrap();
        image.bind(&mut worker).unwrap();

        let names = image.param_names_for("DevAppStack").unwrap();
        assert_eq!(names.len(), 2);
        assert_eq!(names[0], app.stack.parameter_ids()[0]);
        assert_eq!(names[1], worker.stack.parameter_ids()[0]);
        assert!(names[0].starts_with("TaskDefappPipelineParam"));
        assert!(names[1].starts_with("TaskDefworkerPipelineParam"));
    }

    #[test]
    fn test_bind_grants_pull_before_allocating_parameter() {
        let image = PipelineImage::new(app_repo());
        let mut consumer = TaskConsumer::new("DevAppStack", "taskA", "app");
        image.bind(&mut consumer).unwrap();
        assert_eq!(consumer.grants_at_allocation, Some(2));
        assert_eq!(consumer.role.statements().len(), 2);
    }

    #[test]
    fn test_pipeline_image_has_no_credentials() {
        let image = ContainerImage::Pipeline(Rc::new(PipelineImage::new(app_repo())));
        assert!(image.repository_credentials().is_none());
        assert!(image.is_deferred());
    }

    #[test]
    fn test_registry_image_with_credentials() {
        let image = ContainerImage::Registry(RegistryImage {
            name: "ghcr.io/acme/app:1".to_string(),
            credentials: Some("arn:aws:secretsmanager:region:123:secret:ghcr".to_string()),
        });
        let mut consumer = TaskConsumer::new("S", "TaskDef", "app");
        let config = image.bind(&mut consumer).unwrap();
        assert_eq!(
            config.image_name.as_literal().as_deref(),
            Some("ghcr.io/acme/app:1")
        );
        assert_eq!(
            config.repository_credentials.unwrap().credentials_parameter,
            "arn:aws:secretsmanager:region:123:secret:ghcr"
        );
        assert_eq!(consumer.role.statements().len(), 1);
        assert!(consumer.stack.parameter_ids().is_empty());
        assert!(!image.is_deferred());
    }

    #[test]
    fn test_asset_image_tagged_by_content() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Dockerfile"), "FROM nginx").unwrap();
        let stack = Stack::new("S", &env());
        let asset = AssetImage::from_directory(&stack, dir.path()).unwrap();
        assert_eq!(asset.tag().len(), 64);

        let image = ContainerImage::Asset(Rc::new(asset));
        let mut consumer = TaskConsumer::new("S", "TaskDef", "nginx");
        let config = image.bind(&mut consumer).unwrap();
        let uri = config.image_name.as_literal().unwrap();
        assert!(uri.starts_with("123.dkr.ecr.region.amazonaws.com/ecsforge-container-assets:"));
        assert!(!consumer.role.statements().is_empty());
    }

    #[test]
    fn test_asset_image_missing_directory() {
        let stack = Stack::new("S", &env());
        let err = AssetImage::from_directory(&stack, Path::new("/nonexistent/ctx")).unwrap_err();
        assert!(matches!(err, SynthError::Asset { .. }));
    }
}
