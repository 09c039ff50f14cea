//! Code Extractor — renders a dependency closure as a minimal source tree.
//!
//! Each local module that contributes to the closure is re-emitted with
//! only the statements the closure names, in source order and
//! verbatim. Empty `__init__.py` markers make every directory level of the
//! tree importable.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::analyzer::{DependencyClosure, LocalItem};
use crate::config::BundlerConfig;
use crate::error::{BundleError, BundleResult};
use crate::project::{ImportBinding, ModuleIndex, ProjectIndex};

/// Bundle files the extracted tree must never shadow.
const RESERVED_FILES: &[&str] = &["manifest.json", "requirements.txt"];

/// Relative path → source text of the extracted local code.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractedTree {
    pub files: BTreeMap<String, String>,
    /// Empty package markers, disjoint from `files`
    pub markers: BTreeSet<String>,
}

impl ExtractedTree {
    /// No local code was extracted (markers aside).
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Every entry with its contents, markers as empty text, sorted by path.
    pub fn entries(&self) -> BTreeMap<&str, &str> {
        self.files
            .iter()
            .map(|(path, text)| (path.as_str(), text.as_str()))
            .chain(self.markers.iter().map(|path| (path.as_str(), "")))
            .collect()
    }
}

/// What one module contributes.
#[derive(Default)]
struct ModuleSelection {
    whole: bool,
    names: BTreeSet<String>,
    import_keys: BTreeSet<String>,
}

enum Chunk<'a> {
    Import(&'a ImportBinding),
    Statement(&'a str),
}

pub struct CodeExtractor<'p> {
    project: &'p ProjectIndex,
    config: &'p BundlerConfig,
}

impl<'p> CodeExtractor<'p> {
    pub fn new(project: &'p ProjectIndex, config: &'p BundlerConfig) -> Self {
        Self { project, config }
    }

    pub fn extract(&self, closure: &DependencyClosure) -> BundleResult<ExtractedTree> {
        let mut selections: BTreeMap<&str, ModuleSelection> = BTreeMap::new();
        for item in &closure.local {
            let selection = selections.entry(item.module()).or_default();
            match item {
                LocalItem::Definition { name, .. } => {
                    selection.names.insert(name.clone());
                }
                LocalItem::Import { key, .. } => {
                    selection.import_keys.insert(key.clone());
                }
                LocalItem::Module { .. } => selection.whole = true,
            }
        }

        let mut tree = ExtractedTree::default();
        let mut directories: BTreeSet<String> = BTreeSet::new();

        for (module, selection) in &selections {
            self.check_module_path(module)?;
            let Some(index) = self.project.module(module) else {
                // namespace package: a directory, nothing to render
                directories.insert(module.replace('.', "/"));
                collect_parents(module, &mut directories);
                continue;
            };

            let file = file_for(index);
            if file == self.config.entry_file() || RESERVED_FILES.contains(&file.as_str()) {
                return Err(BundleError::extraction(
                    module.to_string(),
                    format!("module file `{file}` collides with a reserved bundle file"),
                ));
            }

            let text = render_module(index, selection)?;
            debug!(module = %module, file = %file, bytes = text.len(), "Extracted module");
            collect_parents(module, &mut directories);
            if index.is_package {
                directories.insert(module.replace('.', "/"));
            }
            tree.files.insert(file, text);
        }

        tree.markers = directories
            .into_iter()
            .map(|dir| format!("{dir}/__init__.py"))
            .filter(|marker| !tree.files.contains_key(marker))
            .collect();

        Ok(tree)
    }

    fn check_module_path(&self, module: &str) -> BundleResult<()> {
        if let Some(segment) = module.split('.').find(|s| !is_identifier(s)) {
            return Err(BundleError::extraction(
                module.to_string(),
                format!("path segment `{segment}` is not a Python identifier"),
            ));
        }
        Ok(())
    }
}

/// Archive path of a module, mirroring the project layout.
fn file_for(index: &ModuleIndex) -> String {
    let base = index.path.replace('.', "/");
    if index.is_package {
        format!("{base}/__init__.py")
    } else {
        format!("{base}.py")
    }
}

/// Every proper ancestor directory of a dotted module path.
fn collect_parents(module: &str, directories: &mut BTreeSet<String>) {
    let parts: Vec<&str> = module.split('.').collect();
    for depth in 1..parts.len() {
        directories.insert(parts[..depth].join("/"));
    }
}

fn render_module(index: &ModuleIndex, selection: &ModuleSelection) -> BundleResult<String> {
    let mut chunks: Vec<(usize, usize, Chunk)> = Vec::new();
    let mut seen_statements = BTreeSet::new();

    for def in &index.definitions {
        let wanted = selection.whole || def.names.iter().any(|n| selection.names.contains(n));
        if !wanted || !seen_statements.insert(def.statement) {
            continue;
        }
        if def.has_error {
            return Err(BundleError::extraction(
                format!("{}:{}", index.path, def.names.join(",")),
                format!("syntax error in definition starting at line {}", def.start_line + 1),
            ));
        }
        chunks.push((def.statement, 0, Chunk::Statement(&def.text)));
    }

    for (position, binding) in index.imports.iter().enumerate() {
        let key = binding.bound_name();
        let wanted = selection.whole
            || (selection.import_keys.contains(&key)
                && (binding.is_wildcard() || index.import_of(&key) == Some(binding)));
        if wanted {
            chunks.push((binding.statement, position, Chunk::Import(binding)));
        }
    }
    chunks.sort_by_key(|(statement, position, _)| (*statement, *position));

    let mut out = String::new();
    for line in &index.future_imports {
        out.push_str(line);
        out.push('\n');
    }

    let mut rendered_imports = BTreeSet::new();
    let mut previous_was_import = !out.is_empty();
    for (_, _, chunk) in chunks {
        match chunk {
            Chunk::Import(binding) => {
                let line = binding.render();
                if !rendered_imports.insert(line.clone()) {
                    continue;
                }
                if !out.is_empty() && !previous_was_import {
                    out.push('\n');
                }
                out.push_str(&line);
                out.push('\n');
                previous_was_import = true;
            }
            Chunk::Statement(text) => {
                if !out.is_empty() {
                    out.push('\n');
                }
                out.push_str(text.trim_end());
                out.push('\n');
                previous_was_import = false;
            }
        }
    }
    Ok(out)
}

fn is_identifier(segment: &str) -> bool {
    let mut chars = segment.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_alphabetic())
        && chars.all(|c| c == '_' || c.is_alphanumeric())
}
