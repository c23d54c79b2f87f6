//! Build every stack of a configuration and write the cloud assembly.
//!
//! Stacks are built in dependency order (clusters and pipelines before the
//! apps that use them) and synthesized only after the whole graph exists,
//! so deferred tokens such as a pipeline's parameter override keys see
//! every binding made by later stacks.

use super::error::SynthError;
use super::resolver;
use super::stack::Stack;
use super::types::ForgeConfig;
use crate::assets::hasher;
use crate::resources::image::Placeholder;
use crate::resources::pipeline::template_file;
use crate::stacks::app::AssetRecord;
use crate::stacks::{self, ImageCatalog};
use indexmap::IndexMap;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const ASSEMBLY_VERSION: &str = "1.0";

/// Default configuration file name.
pub const CONFIG_FILE: &str = "ecsforge.yaml";

/// All stacks of one configuration.
#[derive(Debug)]
pub struct App {
    name: String,
    stacks: IndexMap<String, Stack>,
    catalog: ImageCatalog,
    assets: Vec<AssetRecord>,
}

/// Manifest entry of one synthesized stack.
#[derive(Debug, Clone, Serialize)]
pub struct StackArtifact {
    pub template_file: String,
    pub template_hash: String,
    pub dependencies: Vec<String>,
    pub parameters: Vec<String>,
}

/// `manifest.json` of an assembly.
#[derive(Debug, Clone, Serialize)]
pub struct Manifest {
    pub version: String,
    pub app: String,
    pub stacks: IndexMap<String, StackArtifact>,
    pub placeholders: Vec<Placeholder>,
    pub assets: Vec<AssetRecord>,
}

impl App {
    /// Build every stack. `base_dir` anchors asset directories;
    /// `config_file` is the path synth build projects pass to `ecsforge`.
    pub fn build(
        config: &ForgeConfig,
        base_dir: &Path,
        config_file: &str,
    ) -> Result<Self, SynthError> {
        let order = resolver::build_stack_order(config).map_err(SynthError::Dependency)?;
        let mut catalog = ImageCatalog::default();
        let mut stacks = IndexMap::new();
        let mut assets = Vec::new();

        for name in &order {
            let stack = if let Some(spec) = config.clusters.get(name) {
                stacks::cluster::build(name, spec, config)?
            } else if let Some(spec) = config.pipelines.get(name) {
                stacks::pipeline::build(name, spec, config, config_file, &mut catalog)?
            } else if let Some(spec) = config.apps.get(name) {
                let app = stacks::app::build(name, spec, config, &catalog, base_dir)?;
                assets.extend(app.assets);
                app.stack
            } else {
                return Err(SynthError::UnknownStack(name.clone()));
            };
            stacks.insert(name.clone(), stack);
        }

        info!(
            app = %config.name,
            stacks = stacks.len(),
            images = catalog.len(),
            "built app"
        );
        Ok(Self {
            name: config.name.clone(),
            stacks,
            catalog,
            assets,
        })
    }

    /// Stack names in deployment order.
    pub fn stack_names(&self) -> Vec<&str> {
        self.stacks.keys().map(String::as_str).collect()
    }

    pub fn stack(&self, name: &str) -> Option<&Stack> {
        self.stacks.get(name)
    }

    pub fn assets(&self) -> &[AssetRecord] {
        &self.assets
    }

    /// Every placeholder parameter allocated by a pipeline image bind.
    pub fn placeholders(&self) -> Vec<Placeholder> {
        self.catalog.placeholders()
    }

    /// Synthesize one stack with the given parameter values.
    pub fn synth_stack(
        &self,
        name: &str,
        overrides: &HashMap<String, String>,
    ) -> Result<Value, SynthError> {
        let stack = self
            .stacks
            .get(name)
            .ok_or_else(|| SynthError::UnknownStack(name.to_string()))?;
        stack.synth(overrides)
    }

    /// Synthesize `selected` stacks (all when empty) and write them with a
    /// manifest into `out_dir`. Every override key must name a parameter of
    /// a selected stack. Nothing is written unless every stack synthesizes.
    pub fn write_assembly(
        &self,
        out_dir: &Path,
        selected: &[String],
        overrides: &HashMap<String, String>,
    ) -> Result<Manifest, SynthError> {
        let names: Vec<&str> = if selected.is_empty() {
            self.stack_names()
        } else {
            for name in selected {
                if !self.stacks.contains_key(name) {
                    return Err(SynthError::UnknownStack(name.clone()));
                }
            }
            // Keep deployment order regardless of selection order
            self.stack_names()
                .into_iter()
                .filter(|n| selected.iter().any(|s| s == n))
                .collect()
        };

        let mut used: HashSet<&str> = HashSet::new();
        let mut rendered: Vec<(&str, String)> = Vec::new();
        let mut artifacts = IndexMap::new();
        for name in &names {
            let stack = &self.stacks[*name];
            let parameters = stack.parameter_ids();
            let values: HashMap<String, String> = overrides
                .iter()
                .filter(|(k, _)| parameters.contains(k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            used.extend(
                overrides
                    .keys()
                    .filter(|k| parameters.contains(k))
                    .map(String::as_str),
            );

            let template = stack.synth(&values)?;
            let body = serde_json::to_string_pretty(&template)?;
            artifacts.insert(
                name.to_string(),
                StackArtifact {
                    template_file: template_file(name),
                    template_hash: hasher::hash_string(&body),
                    dependencies: stack.dependencies().to_vec(),
                    parameters,
                },
            );
            rendered.push((*name, body));
        }

        let mut unknown: Vec<&String> = overrides
            .keys()
            .filter(|k| !used.contains(k.as_str()))
            .collect();
        unknown.sort();
        if let Some(name) = unknown.first() {
            return Err(SynthError::UnknownParameter {
                stack: names.join(","),
                name: name.to_string(),
            });
        }

        let placeholders: Vec<Placeholder> = self
            .placeholders()
            .into_iter()
            .filter(|p| names.contains(&p.stack.as_str()))
            .collect();
        let assets: Vec<AssetRecord> = self
            .assets
            .iter()
            .filter(|a| names.contains(&a.stack.as_str()))
            .cloned()
            .collect();
        let manifest = Manifest {
            version: ASSEMBLY_VERSION.to_string(),
            app: self.name.clone(),
            stacks: artifacts,
            placeholders,
            assets,
        };

        std::fs::create_dir_all(out_dir).map_err(|source| SynthError::Io {
            path: out_dir.to_path_buf(),
            source,
        })?;
        for (name, body) in &rendered {
            write_atomic(&out_dir.join(template_file(name)), body)?;
        }
        write_atomic(
            &out_dir.join(MANIFEST_FILE),
            &serde_json::to_string_pretty(&manifest)?,
        )?;

        info!(
            out = %out_dir.display(),
            stacks = rendered.len(),
            placeholders = manifest.placeholders.len(),
            "wrote assembly"
        );
        Ok(manifest)
    }
}

/// Write via a temp file in the same directory, then rename over the target.
fn write_atomic(path: &Path, content: &str) -> Result<(), SynthError> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let tmp: PathBuf = path.with_file_name(format!(".{}.tmp", file_name));
    std::fs::write(&tmp, content).map_err(|source| SynthError::Io {
        path: tmp.clone(),
        source,
    })?;
    std::fs::rename(&tmp, path).map_err(|source| SynthError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    debug!(path = %path.display(), bytes = content.len(), "wrote file");
    Ok(())
}
