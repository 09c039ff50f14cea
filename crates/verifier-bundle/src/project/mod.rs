//! Project Index — the local Python project a verifier may depend on.
//!
//! Maps dotted module paths to their [`ModuleIndex`]. Built either from
//! in-memory sources (tests, callers that already hold the files) or by
//! walking a project directory on disk.

pub mod file_walker;
pub mod imports;
pub mod python;
pub mod scope;
pub mod stdlib;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

pub use file_walker::{find_project_root, FileWalker};
pub use imports::{ImportBinding, ImportForm};
pub use python::{parse_function, Definition, DefinitionKind, FunctionSource, ModuleIndex};
pub use scope::{NameRef, NameUses};

use crate::error::{BundleError, BundleResult};

/// Every module of the local project, keyed by dotted path.
#[derive(Debug, Clone, Default)]
pub struct ProjectIndex {
    root: Option<PathBuf>,
    modules: BTreeMap<String, ModuleIndex>,
    /// Directories that contain modules (regular or namespace packages)
    packages: BTreeSet<String>,
}

impl ProjectIndex {
    /// An index with no local modules: every non-stdlib import is external.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from `(relative path, source)` pairs.
    pub fn from_sources<I, P, S>(files: I) -> BundleResult<Self>
    where
        I: IntoIterator<Item = (P, S)>,
        P: AsRef<str>,
        S: AsRef<str>,
    {
        let mut index = Self::default();
        for (file, source) in files {
            index.insert(file.as_ref(), source.as_ref())?;
        }
        Ok(index)
    }

    /// Walk `root` and index every Python file below it.
    pub fn load(root: impl AsRef<Path>) -> BundleResult<Self> {
        let root = root.as_ref();
        if !root.is_dir() {
            return Err(BundleError::Project(format!(
                "project root {} is not a directory",
                root.display()
            )));
        }

        let walker = FileWalker::new(root);
        let mut index = Self {
            root: Some(root.to_path_buf()),
            ..Self::default()
        };

        for path in walker.python_files() {
            let Some(rel) = walker.relative(&path) else {
                warn!(path = %path.display(), "Skipping file with non UTF-8 path");
                continue;
            };
            let source = match std::fs::read_to_string(&path) {
                Ok(source) => source,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Skipping unreadable module");
                    continue;
                }
            };
            index.insert(&rel, &source)?;
        }

        debug!(
            root = %root.display(),
            modules = index.modules.len(),
            "Indexed local project"
        );
        Ok(index)
    }

    /// Locate the project containing `file` by its root markers and load it.
    pub fn discover(file: impl AsRef<Path>) -> BundleResult<Self> {
        Self::load(find_project_root(file.as_ref()))
    }

    fn insert(&mut self, file: &str, source: &str) -> BundleResult<()> {
        let Some((path, is_package)) = module_path_for_file(file) else {
            return Ok(());
        };
        let module = ModuleIndex::parse(&path, file, is_package, source)?;

        let parts: Vec<&str> = path.split('.').collect();
        let dirs = if is_package { parts.len() } else { parts.len() - 1 };
        for depth in 1..=dirs {
            self.packages.insert(parts[..depth].join("."));
        }
        self.modules.insert(path, module);
        Ok(())
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn module(&self, path: &str) -> Option<&ModuleIndex> {
        self.modules.get(path)
    }

    pub fn modules(&self) -> impl Iterator<Item = &ModuleIndex> {
        self.modules.values()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// A module file or a package directory exists at `path`.
    pub fn contains_module(&self, path: &str) -> bool {
        self.modules.contains_key(path) || self.packages.contains(path)
    }

    /// `path` is a directory without an `__init__.py`.
    pub fn is_namespace_package(&self, path: &str) -> bool {
        self.packages.contains(path) && !self.modules.contains_key(path)
    }

    /// Whether a top-level import name refers to this project.
    pub fn is_local_top_level(&self, top: &str) -> bool {
        self.contains_module(top)
    }
}

/// Dotted module path of a project-relative `.py` file, and whether the
/// file is a package `__init__.py`. The root `__init__.py` has no path.
pub fn module_path_for_file(file: &str) -> Option<(String, bool)> {
    let normalized = file.replace('\\', "/");
    let stem = normalized.strip_suffix(".py")?;
    let parts: Vec<&str> = stem.split('/').filter(|p| !p.is_empty() && *p != ".").collect();
    let (last, dirs) = parts.split_last()?;
    if *last == "__init__" {
        if dirs.is_empty() {
            return None;
        }
        Some((dirs.join("."), true))
    } else {
        Some((parts.join("."), false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_module_path_for_file() {
        assert_eq!(module_path_for_file("a/b.py"), Some(("a.b".to_string(), false)));
        assert_eq!(
            module_path_for_file("a/b/__init__.py"),
            Some(("a.b".to_string(), true))
        );
        assert_eq!(module_path_for_file("main.py"), Some(("main".to_string(), false)));
        assert_eq!(module_path_for_file("__init__.py"), None);
        assert_eq!(module_path_for_file("notes.txt"), None);
        assert_eq!(module_path_for_file("a\\c.py"), Some(("a.c".to_string(), false)));
    }

    #[test]
    fn test_from_sources_tracks_packages() {
        let project = ProjectIndex::from_sources([
            ("tasks/__init__.py", ""),
            ("tasks/scoring.py", "def score(x):\n    return x\n"),
            ("ns/inner/mod.py", "X = 1\n"),
        ])
        .unwrap();

        assert_eq!(project.len(), 3);
        assert!(project.module("tasks.scoring").unwrap().defines("score"));
        assert!(project.is_local_top_level("tasks"));
        assert!(project.is_local_top_level("ns"));
        assert!(project.is_namespace_package("ns.inner"));
        assert!(!project.is_namespace_package("tasks"));
        assert!(!project.is_local_top_level("numpy"));
    }

    #[test]
    fn test_load_from_disk() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("pyproject.toml"), "").unwrap();
        fs::create_dir_all(dir.path().join("lib")).unwrap();
        fs::write(dir.path().join("lib/__init__.py"), "from .core import run\n").unwrap();
        fs::write(dir.path().join("lib/core.py"), "def run():\n    return 1\n").unwrap();

        let project = ProjectIndex::discover(dir.path().join("lib/core.py")).unwrap();
        assert_eq!(project.root(), Some(dir.path()));
        assert!(project.module("lib").unwrap().import_of("run").is_some());
        assert!(project.module("lib.core").unwrap().defines("run"));
    }

    #[test]
    fn test_load_rejects_missing_root() {
        let err = ProjectIndex::load("/definitely/not/here").unwrap_err();
        assert!(matches!(err, BundleError::Project(_)));
    }
}
