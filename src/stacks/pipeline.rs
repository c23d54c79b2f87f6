//! Pipeline stack: an ECR repository per image, the docker and synth build
//! projects, and a pipeline that deploys one app stack with the freshly
//! built tag.
//!
//! The Deploy stage overrides every placeholder parameter the images were
//! bound to in the deploy stack, one entry per consuming container. The
//! override map is deferred: the app stack binds the images after this
//! stack is built, so its entries only materialize when the template is
//! synthesized.

use crate::core::error::SynthError;
use crate::core::stack::Stack;
use crate::core::template::{CfnOutput, Prop};
use crate::core::token::TokenString;
use crate::core::types::{ForgeConfig, PipelineSpec};
use crate::resources::ecr::Repository;
use crate::resources::iam::PolicyStatement;
use crate::resources::image::PipelineImage;
use crate::resources::pipeline::{
    docker_build_spec, get_param, synth_build_spec, Action, DockerImageBuild, GitHubSource,
    Pipeline, PipelineProject, IMAGE_TAG_FILE, IMAGE_TAG_KEY,
};
use crate::stacks::ImageCatalog;
use std::rc::Rc;
use tracing::info;

pub const SOURCE_OUTPUT: &str = "SourceOutput";
pub const DOCKER_OUTPUT: &str = "DockerBuildOutput";
pub const SYNTH_OUTPUT: &str = "SynthOutput";

/// ECR repository name of a pipeline image.
pub fn repository_name(stack: &str, image: &str) -> String {
    format!("{}-{}", stack.to_lowercase(), image)
}

/// `app-server` → `AppServer`
fn pascal_case(s: &str) -> String {
    s.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|p| !p.is_empty())
        .map(|p| {
            let mut chars = p.chars();
            match chars.next() {
                Some(first) => first.to_ascii_uppercase().to_string() + chars.as_str(),
                None => String::new(),
            }
        })
        .collect()
}

/// `app-server` → `APP_SERVER_REPOSITORY_URI`
fn uri_variable(image: &str) -> String {
    let upper: String = image
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{}_REPOSITORY_URI", upper)
}

pub fn build(
    name: &str,
    spec: &PipelineSpec,
    config: &ForgeConfig,
    config_file: &str,
    catalog: &mut ImageCatalog,
) -> Result<Stack, SynthError> {
    let mut stack = Stack::new(name, &config.env);
    if let Some(ref d) = config.description {
        stack.set_description(d.clone());
    }

    let mut images: Vec<(String, Rc<PipelineImage>)> = Vec::new();
    for image in spec.images.keys() {
        let repo = Repository::declare(
            &mut stack,
            &format!("{}EcrRepo", pascal_case(image)),
            &repository_name(name, image),
        )?;
        let built = Rc::new(PipelineImage::new(Rc::new(repo)));
        catalog.register(name, image, Rc::clone(&built));
        images.push((image.clone(), built));
    }

    // Docker build: every image, tagged with the commit
    let builds: Vec<DockerImageBuild> = spec
        .images
        .iter()
        .map(|(image, build)| DockerImageBuild {
            uri_variable: uri_variable(image),
            context: build.context.clone(),
        })
        .collect();
    let mut docker = PipelineProject::new(
        "DockerCodeBuildProject",
        &spec.build_image,
        true,
        docker_build_spec(&builds, &config.image_tag_param),
    );
    for (image, built) in &images {
        docker.add_environment(&uri_variable(image), built.repository().repository_uri());
        built.repository().grant_pull_push(&mut docker);
    }
    docker.add_to_role_policy(PolicyStatement::allow(
        &["ssm:PutParameter"],
        vec![TokenString::literal("arn:")
            .push(stack.partition())
            .push(format!(
                ":ssm:*:*:parameter/{}",
                config.image_tag_param.trim_start_matches('/')
            ))],
    ));

    // Template synth of the deploy stack
    let mut synth = PipelineProject::new(
        "SynthBuildProject",
        &spec.build_image,
        false,
        synth_build_spec(config_file, &spec.deploy_stack),
    );
    synth.add_to_role_policy(PolicyStatement::allow(
        &["ec2:DescribeAvailabilityZones"],
        vec![TokenString::literal("*")],
    ));

    let mut pipeline = Pipeline::new(&mut stack, "Pipeline")?;
    pipeline.grant_build(&mut docker);
    pipeline.grant_build(&mut synth);
    pipeline.grant_deploy(&stack, &spec.deploy_stack);

    let source = GitHubSource {
        owner: config.source.github_owner.clone(),
        repo: config.source.repo.clone(),
        branch: spec.branch(&config.source).to_string(),
        token_secret: config.source.token_secret.clone(),
    };
    let overrides = if images.is_empty() {
        Prop::Null
    } else {
        let built: Vec<Rc<PipelineImage>> = images.iter().map(|(_, b)| Rc::clone(b)).collect();
        let deploy_stack = spec.deploy_stack.clone();
        Prop::deferred(move || {
            let mut entries = Vec::new();
            for image in &built {
                for parameter in image.param_names_for(&deploy_stack)? {
                    entries.push((
                        parameter,
                        get_param(DOCKER_OUTPUT, IMAGE_TAG_FILE, IMAGE_TAG_KEY),
                    ));
                }
            }
            Ok(Prop::map(entries))
        })
    };

    pipeline.add_stage("Source", vec![Action::github("GitHub", &source, SOURCE_OUTPUT)]);
    pipeline.add_stage(
        "Build",
        vec![
            Action::codebuild("DockerBuild", &docker, SOURCE_OUTPUT, DOCKER_OUTPUT),
            Action::codebuild("SynthBuild", &synth, SOURCE_OUTPUT, SYNTH_OUTPUT),
        ],
    );
    pipeline.add_stage(
        "Deploy",
        vec![Action::cloudformation_deploy(
            "CFN_Deploy",
            &spec.deploy_stack,
            SYNTH_OUTPUT,
            &[DOCKER_OUTPUT],
            pipeline.deploy_role_arn(),
            overrides,
        )],
    );

    docker.render(&mut stack)?;
    synth.render(&mut stack)?;
    pipeline.render(&mut stack)?;

    for (image, built) in &images {
        stack.add_output(
            &format!("{}RepositoryUri", pascal_case(image)),
            CfnOutput::new(built.repository().repository_uri()),
        )?;
    }

    info!(
        stack = name,
        images = images.len(),
        deploys = %spec.deploy_stack,
        "built pipeline stack"
    );
    Ok(stack)
}
