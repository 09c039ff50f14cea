//! Bundle Assembler — turns a verifier definition into a shippable archive.
//!
//! ```text
//! VerifierDefinition ──analyze──► DependencyClosure ──extract──► ExtractedTree
//!          │                                                          │
//!          └──────────── requirements + entry module + manifest ◄─────┘
//!                                        │
//!                                   zip archive ──► Bundle (digest)
//! ```
//!
//! Assembly is deterministic; [`Bundler::bundle`] adds the content-addressed
//! single-flight cache on top.

pub mod archive;
pub mod cache;

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

pub use archive::read_archive;
pub use cache::{BundleCache, BundleKey};

use crate::analyzer::{DependencyAnalyzer, DependencyClosure};
use crate::config::BundlerConfig;
use crate::definition::{normalize_package_name, Requirement, VerifierDefinition, VerifierId};
use crate::error::{BundleError, BundleResult};
use crate::extractor::{CodeExtractor, ExtractedTree};
use crate::project::ProjectIndex;

const ENTRY_HEADER: &str = "# Auto-generated verifier module (tree-shaken)";
const MANIFEST_FILE: &str = "manifest.json";
const REQUIREMENTS_FILE: &str = "requirements.txt";

/// `manifest.json` contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleManifest {
    pub function_name: String,
    /// `verifier.<function>`
    pub entry: String,
    pub version: String,
    pub optimized: bool,
    pub tree_shaken: bool,
    pub verifier_id: VerifierId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generated_at: Option<DateTime<Utc>>,
}

/// An immutable, content-addressed bundle.
#[derive(Debug, Clone)]
pub struct Bundle {
    pub manifest: BundleManifest,
    /// `requirements.txt` lines
    pub requirements: Vec<String>,
    /// Normalized verifier function text
    pub function_source: String,
    /// Full text of the generated entry module
    pub entry_source: String,
    pub tree: ExtractedTree,
    archive: Vec<u8>,
    digest: String,
}

impl Bundle {
    pub fn verifier_id(&self) -> VerifierId {
        self.manifest.verifier_id
    }

    /// Zip archive bytes as sent to the remote.
    pub fn archive(&self) -> &[u8] {
        &self.archive
    }

    /// blake3 hex digest of the archive.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn short_digest(&self) -> &str {
        &self.digest[..12.min(self.digest.len())]
    }

    pub fn manifest_json(&self) -> BundleResult<String> {
        manifest_json(&self.manifest)
    }

    pub fn requirements_text(&self) -> String {
        requirements_text(&self.requirements)
    }
}

fn manifest_json(manifest: &BundleManifest) -> BundleResult<String> {
    serde_json::to_string_pretty(manifest)
        .map_err(|e| BundleError::Archive(format!("manifest serialization: {e}")))
}

fn requirements_text(requirements: &[String]) -> String {
    let mut text = requirements.join("\n");
    if !text.is_empty() {
        text.push('\n');
    }
    text
}

/// Assembles bundles against one project, caching by content.
pub struct Bundler {
    project: Arc<ProjectIndex>,
    config: BundlerConfig,
    cache: BundleCache,
}

impl Bundler {
    pub fn new(project: ProjectIndex, config: BundlerConfig) -> Self {
        Self::with_cache(Arc::new(project), config, BundleCache::new())
    }

    /// Share a project index and cache with other bundlers.
    pub fn with_cache(
        project: Arc<ProjectIndex>,
        config: BundlerConfig,
        cache: BundleCache,
    ) -> Self {
        Self {
            project,
            config,
            cache,
        }
    }

    pub fn project(&self) -> &ProjectIndex {
        &self.project
    }

    pub fn config(&self) -> &BundlerConfig {
        &self.config
    }

    pub fn cache(&self) -> &BundleCache {
        &self.cache
    }

    pub fn analyze(&self, definition: &VerifierDefinition) -> BundleResult<DependencyClosure> {
        DependencyAnalyzer::new(&self.project, &self.config).analyze(definition)
    }

    /// Cached bundle for `definition`; concurrent callers share one build.
    pub async fn bundle(&self, definition: &VerifierDefinition) -> BundleResult<Arc<Bundle>> {
        let key = BundleKey::for_definition(definition);
        if let Some(bundle) = self.cache.get(&key) {
            debug!(
                verifier = %definition.name(),
                bundle = %bundle.short_digest(),
                "Bundle cache hit"
            );
            return Ok(bundle);
        }
        self.cache
            .get_or_build(key, || self.assemble(definition))
            .await
    }

    /// Build a bundle without consulting the cache.
    pub fn assemble(&self, definition: &VerifierDefinition) -> BundleResult<Bundle> {
        let closure = self.analyze(definition)?;
        let tree = CodeExtractor::new(&self.project, &self.config).extract(&closure)?;
        let requirements = self.requirements_for(definition, &closure);
        let entry_source = self.entry_source(&closure);

        let manifest = BundleManifest {
            function_name: closure.function.name.clone(),
            entry: format!("{}.{}", self.config.entry_module, closure.function.name),
            version: self.config.format_version.clone(),
            optimized: true,
            tree_shaken: true,
            verifier_id: definition.id(),
            generated_at: self.config.embed_timestamp.then(Utc::now),
        };

        let manifest_text = manifest_json(&manifest)?;
        let requirements_text = requirements_text(&requirements);
        let entry_file = self.config.entry_file();

        let mut entries: BTreeMap<&str, &str> = tree.entries();
        entries.insert(entry_file.as_str(), entry_source.as_str());
        entries.insert(MANIFEST_FILE, manifest_text.as_str());
        entries.insert(REQUIREMENTS_FILE, requirements_text.as_str());
        let archive = archive::write_archive(entries)?;
        let digest = blake3::hash(&archive).to_hex().to_string();

        info!(
            verifier = %definition.name(),
            bundle = %&digest[..12],
            files = tree.files.len(),
            markers = tree.markers.len(),
            requirements = requirements.len(),
            bytes = archive.len(),
            "Assembled bundle"
        );

        Ok(Bundle {
            manifest,
            requirements,
            function_source: closure.function.text.clone(),
            entry_source,
            tree,
            archive,
            digest,
        })
    }

    /// Declared requirements verbatim, then detected packages not already
    /// declared, then the SDK package unless declared.
    fn requirements_for(
        &self,
        definition: &VerifierDefinition,
        closure: &DependencyClosure,
    ) -> Vec<String> {
        let mut lines = Vec::new();
        let mut seen_lines = HashSet::new();
        let mut declared = HashSet::new();
        for requirement in definition.requirements() {
            if requirement.as_str().is_empty() {
                continue;
            }
            declared.insert(requirement.normalized_name());
            if seen_lines.insert(requirement.as_str().to_string()) {
                lines.push(requirement.as_str().to_string());
            }
        }

        if self.config.include_detected_packages {
            let detected: BTreeSet<String> = closure
                .external_packages
                .iter()
                .filter(|pkg| **pkg != self.config.sdk_module)
                .map(|pkg| self.config.distribution_for(pkg))
                .collect();
            for dist in detected {
                if declared.insert(normalize_package_name(&dist)) {
                    lines.push(dist);
                }
            }
        }

        let sdk = Requirement::new(self.config.sdk_requirement.clone());
        if !sdk.as_str().is_empty() && !declared.contains(&sdk.normalized_name()) {
            lines.push(sdk.as_str().to_string());
        }
        lines
    }

    /// Header, future imports of the defining module, the import preamble,
    /// then the function.
    fn entry_source(&self, closure: &DependencyClosure) -> String {
        let mut out = format!("{ENTRY_HEADER}\n");
        let future = closure
            .entry_module
            .as_deref()
            .and_then(|m| self.project.module(m))
            .map(|m| m.future_imports.as_slice())
            .unwrap_or_default();
        for line in future {
            out.push_str(line);
            out.push('\n');
        }
        for binding in &closure.entry_bindings {
            out.push_str(&binding.render());
            out.push('\n');
        }
        out.push('\n');
        out.push_str(closure.function.text.trim_end());
        out.push('\n');
        out
    }
}
