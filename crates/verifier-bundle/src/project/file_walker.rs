//! File Walker — .gitignore-respecting discovery of a Python project's modules.

use ignore::WalkBuilder;
use std::path::{Path, PathBuf};

/// Files or directories whose presence marks a Python project root.
pub const ROOT_MARKERS: &[&str] = &[
    "pyproject.toml",
    "setup.py",
    "setup.cfg",
    ".git",
    ".hg",
    "requirements.txt",
    "Pipfile",
];

/// Directory names that never hold project modules.
const SKIPPED_DIRS: &[&str] = &["__pycache__", "site-packages", "node_modules", "venv"];

/// Walks a project tree for Python sources, respecting .gitignore rules.
pub struct FileWalker {
    root: PathBuf,
}

impl FileWalker {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Return all .py files under root, sorted, respecting .gitignore.
    pub fn python_files(&self) -> Vec<PathBuf> {
        let mut files = Vec::new();
        let walker = WalkBuilder::new(&self.root)
            .hidden(true) // skip .venv, .tox, ...
            .git_ignore(true)
            .filter_entry(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .map(|name| !SKIPPED_DIRS.contains(&name))
                    .unwrap_or(false)
            })
            .build();

        for entry in walker.flatten() {
            let path = entry.path();
            if path.is_file() && path.extension().and_then(|e| e.to_str()) == Some("py") {
                files.push(path.to_path_buf());
            }
        }

        files.sort();
        files
    }

    /// Path relative to the walk root with `/` separators.
    pub fn relative(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<&str> = rel
            .components()
            .map(|c| c.as_os_str().to_str())
            .collect::<Option<_>>()?;
        Some(parts.join("/"))
    }
}

/// Walk up from `start` to the nearest directory holding a root marker.
///
/// Falls back to the starting directory itself when no marker is found.
pub fn find_project_root(start: &Path) -> PathBuf {
    let start_dir = if start.is_file() {
        start.parent().unwrap_or(start)
    } else {
        start
    };

    for dir in start_dir.ancestors() {
        if ROOT_MARKERS.iter().any(|m| dir.join(m).exists()) {
            return dir.to_path_buf();
        }
    }
    start_dir.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_finds_python_files() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("pkg")).unwrap();
        fs::write(dir.path().join("main.py"), "x = 1").unwrap();
        fs::write(dir.path().join("pkg/__init__.py"), "").unwrap();
        fs::write(dir.path().join("pkg/util.py"), "def f(): pass").unwrap();
        fs::write(dir.path().join("README.md"), "# hi").unwrap();

        let walker = FileWalker::new(dir.path());
        let files = walker.python_files();
        let rel: Vec<String> = files.iter().filter_map(|f| walker.relative(f)).collect();
        assert_eq!(rel, vec!["main.py", "pkg/__init__.py", "pkg/util.py"]);
    }

    #[test]
    fn test_skips_hidden_and_cache_dirs() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join(".venv/lib")).unwrap();
        fs::create_dir_all(dir.path().join("venv")).unwrap();
        fs::write(dir.path().join(".venv/lib/dep.py"), "").unwrap();
        fs::write(dir.path().join("venv/dep.py"), "").unwrap();
        fs::write(dir.path().join("app.py"), "").unwrap();

        let files = FileWalker::new(dir.path()).python_files();
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("app.py"));
    }

    #[test]
    fn test_find_project_root() {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("src/tasks")).unwrap();
        fs::write(dir.path().join("pyproject.toml"), "[project]").unwrap();
        let file = dir.path().join("src/tasks/check.py");
        fs::write(&file, "").unwrap();

        assert_eq!(find_project_root(&file), dir.path().to_path_buf());
    }
}
