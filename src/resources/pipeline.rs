//! CodeBuild projects and a CodePipeline with Source, Build and Deploy
//! stages.

use super::iam::{Grantable, PolicyStatement, Role};
use crate::core::error::SynthError;
use crate::core::naming::logical_id;
use crate::core::stack::Stack;
use crate::core::template::{CfnResource, Prop};
use crate::core::token::TokenString;
use tracing::debug;

/// Tag every pushed image gets: the commit the pipeline is building.
pub const SOURCE_VERSION: &str = "$CODEBUILD_RESOLVED_SOURCE_VERSION";

/// File the docker build writes the tag to, read back by the Deploy stage.
pub const IMAGE_TAG_FILE: &str = "imageTag.json";

/// Key of the tag inside [`IMAGE_TAG_FILE`].
pub const IMAGE_TAG_KEY: &str = "imageTag";

// ============================================================================
// Build specs
// ============================================================================

/// One image the docker project builds and pushes.
#[derive(Debug, Clone)]
pub struct DockerImageBuild {
    /// Environment variable holding the repository URI
    pub uri_variable: String,
    /// Build context, relative to the source root
    pub context: String,
}

/// Build spec that logs into ECR, builds and pushes every image tagged
/// with the source commit, writes the tag to [`IMAGE_TAG_FILE`] and to the
/// SSM parameter `tag_param`.
pub fn docker_build_spec(images: &[DockerImageBuild], tag_param: &str) -> Prop {
    let build = images.iter().map(|i| {
        Prop::from(format!(
            "docker build -t ${}:{} {}",
            i.uri_variable, SOURCE_VERSION, i.context
        ))
    });
    let mut post_build: Vec<Prop> = images
        .iter()
        .map(|i| Prop::from(format!("docker push ${}:{}", i.uri_variable, SOURCE_VERSION)))
        .collect();
    post_build.push(Prop::from(format!(
        "printf '{{ \"{}\": \"'{}'\" }}' > {}",
        IMAGE_TAG_KEY, SOURCE_VERSION, IMAGE_TAG_FILE
    )));
    post_build.push(Prop::from(format!(
        "aws ssm put-parameter --name \"{}\" --value {} --type String --overwrite",
        tag_param, SOURCE_VERSION
    )));

    Prop::map([
        ("version", Prop::from("0.2")),
        (
            "phases",
            Prop::map([
                (
                    "pre_build",
                    Prop::map([(
                        "commands",
                        Prop::from(
                            "$(aws ecr get-login --no-include-email --region $AWS_DEFAULT_REGION)",
                        ),
                    )]),
                ),
                ("build", Prop::map([("commands", Prop::list(build))])),
                ("post_build", Prop::map([("commands", Prop::List(post_build))])),
            ]),
        ),
        ("artifacts", Prop::map([("files", Prop::from(IMAGE_TAG_FILE))])),
    ])
}

/// Build spec that synthesizes `stack` from the checked-out configuration
/// and publishes its template.
pub fn synth_build_spec(config_file: &str, stack: &str) -> Prop {
    Prop::map([
        ("version", Prop::from("0.2")),
        (
            "phases",
            Prop::map([
                (
                    "install",
                    Prop::map([(
                        "commands",
                        Prop::list([Prop::from("cargo install --locked ecsforge")]),
                    )]),
                ),
                (
                    "build",
                    Prop::map([(
                        "commands",
                        Prop::list([
                            Prop::from(format!("ecsforge validate -f {}", config_file)),
                            Prop::from(format!(
                                "ecsforge synth -f {} --stack {} -o .",
                                config_file, stack
                            )),
                        ]),
                    )]),
                ),
            ]),
        ),
        (
            "artifacts",
            Prop::map([("files", Prop::from(template_file(stack)))]),
        ),
    ])
}

/// File name a stack's template is written to.
pub fn template_file(stack: &str) -> String {
    format!("{}.template.json", stack)
}

// ============================================================================
// CodeBuild
// ============================================================================

/// A CodeBuild project driven by a pipeline.
#[derive(Debug)]
pub struct PipelineProject {
    id: String,
    logical_id: String,
    build_image: String,
    privileged: bool,
    build_spec: Prop,
    environment: Vec<(String, TokenString)>,
    role: Role,
}

impl PipelineProject {
    pub fn new(id: &str, build_image: &str, privileged: bool, build_spec: Prop) -> Self {
        Self {
            id: id.to_string(),
            logical_id: logical_id(&[id, "Resource"]),
            build_image: build_image.to_string(),
            privileged,
            build_spec,
            environment: Vec::new(),
            role: Role::new(&[id, "Role"], "codebuild.amazonaws.com"),
        }
    }

    pub fn logical_id(&self) -> &str {
        &self.logical_id
    }

    pub fn project_name(&self) -> TokenString {
        TokenString::reference(self.logical_id.clone())
    }

    pub fn add_environment(&mut self, name: &str, value: TokenString) {
        self.environment.push((name.to_string(), value));
    }

    pub fn add_to_role_policy(&mut self, statement: PolicyStatement) {
        self.role.add_to_principal_policy(statement);
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn role_mut(&mut self) -> &mut Role {
        &mut self.role
    }

    pub fn render(&self, stack: &mut Stack) -> Result<String, SynthError> {
        let mut role = self.role.clone();
        let log_group = TokenString::literal("log-group:/aws/codebuild/")
            .push(self.project_name());
        role.add_to_principal_policy(PolicyStatement::allow(
            &["logs:CreateLogGroup", "logs:CreateLogStream", "logs:PutLogEvents"],
            vec![
                stack.arn("logs", "").push(log_group.clone()),
                stack.arn("logs", "").push(log_group).push(":*"),
            ],
        ));
        let role_id = role.render(stack)?;

        let environment = if self.environment.is_empty() {
            Prop::Null
        } else {
            Prop::list(self.environment.iter().map(|(name, value)| {
                Prop::map([
                    ("Name", Prop::from(name)),
                    ("Type", Prop::from("PLAINTEXT")),
                    ("Value", Prop::from(value.clone())),
                ])
            }))
        };

        stack.add_resource(
            &[self.id.as_str(), "Resource"],
            CfnResource::new(
                "AWS::CodeBuild::Project",
                Prop::map([
                    ("Artifacts", Prop::map([("Type", Prop::from("CODEPIPELINE"))])),
                    ("EncryptionKey", Prop::from("alias/aws/s3")),
                    (
                        "Environment",
                        Prop::map([
                            ("ComputeType", Prop::from("BUILD_GENERAL1_SMALL")),
                            ("EnvironmentVariables", environment),
                            ("Image", Prop::from(self.build_image.clone())),
                            ("ImagePullCredentialsType", Prop::from("CODEBUILD")),
                            ("PrivilegedMode", Prop::from(self.privileged)),
                            ("Type", Prop::from("LINUX_CONTAINER")),
                        ]),
                    ),
                    ("ServiceRole", Prop::get_att(role_id, "Arn")),
                    (
                        "Source",
                        Prop::map([
                            ("BuildSpec", Prop::Json(Box::new(self.build_spec.clone()))),
                            ("Type", Prop::from("CODEPIPELINE")),
                        ]),
                    ),
                ]),
            ),
        )
    }
}

impl Grantable for PipelineProject {
    fn grant_principal(&self) -> &str {
        self.role.grant_principal()
    }

    fn add_to_principal_policy(&mut self, statement: PolicyStatement) {
        self.role.add_to_principal_policy(statement);
    }
}

// ============================================================================
// CodePipeline
// ============================================================================

/// GitHub repository polled by the Source stage.
#[derive(Debug, Clone)]
pub struct GitHubSource {
    pub owner: String,
    pub repo: String,
    pub branch: String,
    /// Secrets Manager secret holding the OAuth token
    pub token_secret: String,
}

/// `{"Fn::GetParam": [artifact, file, key]}`, evaluated by CodePipeline
/// when the Deploy action runs.
pub fn get_param(artifact: &str, file: &str, key: &str) -> Prop {
    Prop::map([(
        "Fn::GetParam",
        Prop::list([Prop::from(artifact), Prop::from(file), Prop::from(key)]),
    )])
}

#[derive(Debug, Clone)]
pub struct Action {
    name: String,
    category: &'static str,
    owner: &'static str,
    provider: &'static str,
    configuration: Prop,
    inputs: Vec<String>,
    outputs: Vec<String>,
    run_order: u32,
}

impl Action {
    pub fn github(name: &str, source: &GitHubSource, output: &str) -> Self {
        Self {
            name: name.to_string(),
            category: "Source",
            owner: "ThirdParty",
            provider: "GitHub",
            configuration: Prop::map([
                ("Branch", Prop::from(source.branch.clone())),
                (
                    "OAuthToken",
                    Prop::from(format!(
                        "{{{{resolve:secretsmanager:{}:SecretString:::}}}}",
                        source.token_secret
                    )),
                ),
                ("Owner", Prop::from(source.owner.clone())),
                ("PollForSourceChanges", Prop::from(true)),
                ("Repo", Prop::from(source.repo.clone())),
            ]),
            inputs: Vec::new(),
            outputs: vec![output.to_string()],
            run_order: 1,
        }
    }

    pub fn codebuild(name: &str, project: &PipelineProject, input: &str, output: &str) -> Self {
        Self {
            name: name.to_string(),
            category: "Build",
            owner: "AWS",
            provider: "CodeBuild",
            configuration: Prop::map([("ProjectName", Prop::from(project.project_name()))]),
            inputs: vec![input.to_string()],
            outputs: vec![output.to_string()],
            run_order: 1,
        }
    }

    /// CloudFormation `CREATE_UPDATE` of `stack_name` from
    /// `template_artifact::template_file`. `overrides` may be deferred so its
    /// keys reflect every binding made before the pipeline stack is
    /// synthesized. `Prop::Null` omits `ParameterOverrides`.
    pub fn cloudformation_deploy(
        name: &str,
        stack_name: &str,
        template_artifact: &str,
        extra_inputs: &[&str],
        deploy_role: TokenString,
        overrides: Prop,
    ) -> Self {
        let mut inputs = vec![template_artifact.to_string()];
        inputs.extend(extra_inputs.iter().map(|i| i.to_string()));
        let overrides = match overrides {
            Prop::Null => Prop::Null,
            other => Prop::Json(Box::new(other)),
        };
        Self {
            name: name.to_string(),
            category: "Deploy",
            owner: "AWS",
            provider: "CloudFormation",
            configuration: Prop::map([
                ("ActionMode", Prop::from("CREATE_UPDATE")),
                ("Capabilities", Prop::from("CAPABILITY_NAMED_IAM")),
                ("ParameterOverrides", overrides),
                ("RoleArn", Prop::from(deploy_role)),
                ("StackName", Prop::from(stack_name)),
                (
                    "TemplatePath",
                    Prop::from(format!("{}::{}", template_artifact, template_file(stack_name))),
                ),
            ]),
            inputs,
            outputs: Vec::new(),
            run_order: 1,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn to_prop(&self) -> Prop {
        let artifacts = |names: &[String]| {
            if names.is_empty() {
                Prop::Null
            } else {
                Prop::list(names.iter().map(|n| Prop::map([("Name", Prop::from(n))])))
            }
        };
        Prop::map([
            (
                "ActionTypeId",
                Prop::map([
                    ("Category", Prop::from(self.category)),
                    ("Owner", Prop::from(self.owner)),
                    ("Provider", Prop::from(self.provider)),
                    ("Version", Prop::from("1")),
                ]),
            ),
            ("Configuration", self.configuration.clone()),
            ("InputArtifacts", artifacts(&self.inputs)),
            ("Name", Prop::from(self.name.clone())),
            ("OutputArtifacts", artifacts(&self.outputs)),
            ("RunOrder", Prop::from(self.run_order)),
        ])
    }
}

#[derive(Debug, Clone)]
pub struct Stage {
    pub name: String,
    pub actions: Vec<Action>,
}

/// A pipeline with its artifact bucket, service role and CloudFormation
/// deploy role.
#[derive(Debug)]
pub struct Pipeline {
    id: String,
    bucket: String,
    role: Role,
    deploy_role: Role,
    stages: Vec<Stage>,
}

impl Pipeline {
    /// Create the artifact bucket. Stages are added before rendering.
    pub fn new(stack: &mut Stack, id: &str) -> Result<Self, SynthError> {
        let bucket = stack.add_resource(
            &[id, "ArtifactsBucket", "Resource"],
            CfnResource::new(
                "AWS::S3::Bucket",
                Prop::map([
                    (
                        "BucketEncryption",
                        Prop::map([(
                            "ServerSideEncryptionConfiguration",
                            Prop::list([Prop::map([(
                                "ServerSideEncryptionByDefault",
                                Prop::map([("SSEAlgorithm", Prop::from("AES256"))]),
                            )])]),
                        )]),
                    ),
                    (
                        "PublicAccessBlockConfiguration",
                        Prop::map([
                            ("BlockPublicAcls", Prop::from(true)),
                            ("BlockPublicPolicy", Prop::from(true)),
                            ("IgnorePublicAcls", Prop::from(true)),
                            ("RestrictPublicBuckets", Prop::from(true)),
                        ]),
                    ),
                ]),
            ),
        )?;
        let mut deploy_role = Role::new(&[id, "DeployRole"], "cloudformation.amazonaws.com");
        deploy_role.add_managed_policy(
            TokenString::literal("arn:")
                .push(stack.partition())
                .push(":iam::aws:policy/AdministratorAccess"),
        );
        Ok(Self {
            id: id.to_string(),
            bucket,
            role: Role::new(&[id, "Role"], "codepipeline.amazonaws.com"),
            deploy_role,
            stages: Vec::new(),
        })
    }

    pub fn artifact_bucket_arn(&self) -> TokenString {
        TokenString::get_att(self.bucket.clone(), "Arn")
    }

    /// Role CloudFormation assumes for the Deploy stage.
    pub fn deploy_role_arn(&self) -> TokenString {
        self.deploy_role.arn()
    }

    /// Let a build project read sources from and write artifacts to the
    /// artifact bucket, and let the pipeline start it.
    pub fn grant_build(&mut self, project: &mut PipelineProject) {
        project.add_to_role_policy(self.bucket_statement());
        self.role.add_to_principal_policy(PolicyStatement::allow(
            &[
                "codebuild:BatchGetBuilds",
                "codebuild:StartBuild",
                "codebuild:StopBuild",
            ],
            vec![TokenString::get_att(project.logical_id().to_string(), "Arn")],
        ));
    }

    /// Let the pipeline run CloudFormation against `stack_name`.
    pub fn grant_deploy(&mut self, stack: &Stack, stack_name: &str) {
        self.role.add_to_principal_policy(PolicyStatement::allow(
            &[
                "cloudformation:CreateStack",
                "cloudformation:DescribeStack*",
                "cloudformation:GetStackPolicy",
                "cloudformation:GetTemplate*",
                "cloudformation:SetStackPolicy",
                "cloudformation:UpdateStack",
                "cloudformation:ValidateTemplate",
            ],
            vec![stack.arn("cloudformation", &format!("stack/{}/*", stack_name))],
        ));
        self.role.add_to_principal_policy(PolicyStatement::allow(
            &["iam:PassRole"],
            vec![self.deploy_role.arn()],
        ));
    }

    fn bucket_statement(&self) -> PolicyStatement {
        PolicyStatement::allow(
            &[
                "s3:DeleteObject*",
                "s3:GetBucket*",
                "s3:GetObject*",
                "s3:List*",
                "s3:PutObject*",
            ],
            vec![
                self.artifact_bucket_arn(),
                self.artifact_bucket_arn().push("/*"),
            ],
        )
    }

    pub fn add_stage(&mut self, name: &str, actions: Vec<Action>) {
        self.stages.push(Stage {
            name: name.to_string(),
            actions,
        });
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn render(&self, stack: &mut Stack) -> Result<String, SynthError> {
        let mut role = self.role.clone();
        role.add_to_principal_policy(self.bucket_statement());
        let role_id = role.render(stack)?;
        self.deploy_role.render(stack)?;

        let stages = Prop::list(self.stages.iter().map(|s| {
            Prop::map([
                ("Actions", Prop::list(s.actions.iter().map(Action::to_prop))),
                ("Name", Prop::from(s.name.clone())),
            ])
        }));
        let mut resource = CfnResource::new(
            "AWS::CodePipeline::Pipeline",
            Prop::map([
                (
                    "ArtifactStore",
                    Prop::map([
                        ("Location", Prop::reference(self.bucket.clone())),
                        ("Type", Prop::from("S3")),
                    ]),
                ),
                ("RestartExecutionOnUpdate", Prop::from(false)),
                ("RoleArn", Prop::get_att(role_id, "Arn")),
                ("Stages", stages),
            ]),
        );
        if let Some(policy) = role.default_policy_id() {
            resource = resource.depends_on(policy);
        }
        let id = stack.add_resource(&[self.id.as_str(), "Resource"], resource)?;
        debug!(
            stack = stack.name(),
            pipeline = %id,
            stages = self.stages.len(),
            "rendered pipeline"
        );
        Ok(id)
    }
}
