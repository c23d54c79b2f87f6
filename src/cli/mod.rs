//! CLI subcommands: init, validate, list, synth, params.

use crate::core::synth::{App, CONFIG_FILE};
use crate::core::{parser, resolver, types};
use clap::Subcommand;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new ecsforge project
    Init {
        /// Directory to initialize (default: current)
        #[arg(default_value = ".")]
        path: PathBuf,
    },

    /// Validate ecsforge.yaml without synthesizing
    Validate {
        /// Path to ecsforge.yaml
        #[arg(short, long, default_value = CONFIG_FILE)]
        file: PathBuf,
    },

    /// List stacks in deployment order
    List {
        /// Path to ecsforge.yaml
        #[arg(short, long, default_value = CONFIG_FILE)]
        file: PathBuf,
    },

    /// Synthesize CloudFormation templates and the assembly manifest
    Synth {
        /// Path to ecsforge.yaml
        #[arg(short, long, default_value = CONFIG_FILE)]
        file: PathBuf,

        /// Output directory
        #[arg(short, long, default_value = "ecsforge.out")]
        out: PathBuf,

        /// Synthesize only this stack (repeatable)
        #[arg(long = "stack")]
        stacks: Vec<String>,

        /// Parameter value as KEY=VALUE (repeatable)
        #[arg(long = "param")]
        params: Vec<String>,
    },

    /// Show placeholder parameters supplied at deployment time
    Params {
        /// Path to ecsforge.yaml
        #[arg(short, long, default_value = CONFIG_FILE)]
        file: PathBuf,

        /// Target specific stack
        #[arg(long)]
        stack: Option<String>,
    },
}

/// Dispatch a CLI command.
pub fn dispatch(cmd: Commands) -> Result<(), String> {
    match cmd {
        Commands::Init { path } => cmd_init(&path),
        Commands::Validate { file } => cmd_validate(&file),
        Commands::List { file } => cmd_list(&file),
        Commands::Synth {
            file,
            out,
            stacks,
            params,
        } => cmd_synth(&file, &out, &stacks, &params),
        Commands::Params { file, stack } => cmd_params(&file, stack.as_deref()),
    }
}

const STARTER: &str = r#"version: "1.0"
name: my-service
description: "Managed by ecsforge"

env: {}

source:
  github_owner: my-org
  repo: my-service
  token_secret: github-token

clusters:
  DevCluster:
    cidr: 10.1.0.0/20
    max_azs: 2

pipelines:
  DevPipelineStack:
    deploy_stack: DevAppStack
    images:
      app: { context: . }

apps:
  DevAppStack:
    cluster: DevCluster
    containers:
      app:
        image: { pipeline: { stack: DevPipelineStack, image: app } }
        port: 3000
"#;

fn cmd_init(path: &Path) -> Result<(), String> {
    let config_path = path.join(CONFIG_FILE);
    if config_path.exists() {
        return Err(format!("{} already exists", config_path.display()));
    }

    std::fs::create_dir_all(path)
        .map_err(|e| format!("cannot create {}: {}", path.display(), e))?;
    std::fs::write(&config_path, STARTER)
        .map_err(|e| format!("cannot write {}: {}", config_path.display(), e))?;

    println!("Initialized ecsforge project at {}", path.display());
    println!("  Created: {}", config_path.display());
    Ok(())
}

fn cmd_validate(file: &Path) -> Result<(), String> {
    let config = parser::parse_config_file(file)?;
    let errors = parser::validate_config(&config);

    if errors.is_empty() {
        println!(
            "OK: {} ({} clusters, {} pipelines, {} apps)",
            config.name,
            config.clusters.len(),
            config.pipelines.len(),
            config.apps.len()
        );
        Ok(())
    } else {
        for e in &errors {
            eprintln!("  ERROR: {}", e);
        }
        Err(format!("{} validation error(s)", errors.len()))
    }
}

/// Parse and validate a config file, returning errors if invalid.
fn parse_and_validate(file: &Path) -> Result<types::ForgeConfig, String> {
    let config = parser::parse_config_file(file)?;
    let errors = parser::validate_config(&config);
    if errors.is_empty() {
        return Ok(config);
    }
    for e in &errors {
        eprintln!("  ERROR: {}", e);
    }
    Err("validation failed".to_string())
}

/// Build every stack of a validated config. Asset directories resolve
/// relative to the config file.
fn build_app(file: &Path) -> Result<App, String> {
    let config = parse_and_validate(file)?;
    let base_dir = file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let config_file = file
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| CONFIG_FILE.to_string());
    App::build(&config, base_dir, &config_file).map_err(|e| e.to_string())
}

/// Split `KEY=VALUE`. The value may itself contain `=`.
fn parse_param(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((k, v)) if !k.is_empty() => Ok((k.to_string(), v.to_string())),
        _ => Err(format!("invalid parameter '{}': expected KEY=VALUE", s)),
    }
}

fn cmd_list(file: &Path) -> Result<(), String> {
    let config = parse_and_validate(file)?;
    for line in stack_order_lines(&config)? {
        println!("{}", line);
    }
    Ok(())
}

/// Header plus one numbered line per stack in deployment order.
fn stack_order_lines(config: &types::ForgeConfig) -> Result<Vec<String>, String> {
    let order = resolver::build_stack_order(config)?;
    let deps = resolver::stack_dependencies(config);

    let mut lines = vec![format!("{} ({} stacks)", config.name, order.len())];
    for (i, name) in order.iter().enumerate() {
        let kind = if config.clusters.contains_key(name) {
            "cluster"
        } else if config.pipelines.contains_key(name) {
            "pipeline"
        } else {
            "app"
        };
        let needs = deps.get(name).map(|d| d.join(", ")).unwrap_or_default();
        if needs.is_empty() {
            lines.push(format!("  {}. {} [{}]", i + 1, name, kind));
        } else {
            lines.push(format!("  {}. {} [{}] <- {}", i + 1, name, kind, needs));
        }
    }
    Ok(lines)
}

fn cmd_synth(file: &Path, out: &Path, stacks: &[String], params: &[String]) -> Result<(), String> {
    let overrides = params
        .iter()
        .map(|p| parse_param(p))
        .collect::<Result<HashMap<String, String>, String>>()?;
    let app = build_app(file)?;
    let manifest = app
        .write_assembly(out, stacks, &overrides)
        .map_err(|e| e.to_string())?;

    println!("Synthesized {} stack(s) to {}", manifest.stacks.len(), out.display());
    for (name, artifact) in &manifest.stacks {
        println!("  {} -> {}", name, artifact.template_file);
    }
    let pending: Vec<_> = manifest
        .placeholders
        .iter()
        .filter(|p| !overrides.contains_key(&p.parameter))
        .collect();
    if !pending.is_empty() {
        println!("Parameters supplied at deployment:");
        for p in pending {
            println!("  {}.{} ({})", p.stack, p.parameter, p.repository);
        }
    }
    Ok(())
}

fn cmd_params(file: &Path, stack: Option<&str>) -> Result<(), String> {
    let app = build_app(file)?;
    let lines = placeholder_lines(&app, stack)?;
    if lines.is_empty() {
        println!("No placeholder parameters.");
    }
    for line in lines {
        println!("{}", line);
    }
    Ok(())
}

/// One line per placeholder parameter, optionally limited to one stack.
fn placeholder_lines(app: &App, stack: Option<&str>) -> Result<Vec<String>, String> {
    if let Some(name) = stack {
        if app.stack(name).is_none() {
            return Err(format!("unknown stack '{}'", name));
        }
    }
    Ok(app
        .placeholders()
        .into_iter()
        .filter(|p| stack.map_or(true, |s| p.stack == s))
        .map(|p| {
            format!(
                "{}: {} (container {}, repository {})",
                p.stack, p.parameter, p.consumer, p.repository
            )
        })
        .collect())
}
