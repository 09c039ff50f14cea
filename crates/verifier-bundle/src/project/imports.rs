//! Python import statements as explicit bindings.
//!
//! Every `import` / `from ... import` statement is split into one binding
//! per bound name so the extractor can re-emit exactly the bindings an
//! extracted definition needs, and nothing else.

use serde::{Deserialize, Serialize};
use tree_sitter::Node;

/// Shape of a single import binding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImportForm {
    /// `import a.b` (binds `a`) or `import a.b as x` (binds `x`)
    Module {
        module: String,
        alias: Option<String>,
    },
    /// `from ..a import b as c`
    From {
        level: usize,
        module: Option<String>,
        member: String,
        alias: Option<String>,
    },
    /// `from a import *`
    Wildcard { level: usize, module: Option<String> },
}

/// One name bound by an import statement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ImportBinding {
    pub form: ImportForm,
    /// Index of the top-level statement that contains the import
    pub statement: usize,
}

impl ImportBinding {
    /// The name this binding introduces; wildcards are keyed by their source.
    pub fn bound_name(&self) -> String {
        match &self.form {
            ImportForm::Module { module, alias } => alias
                .clone()
                .unwrap_or_else(|| module.split('.').next().unwrap_or(module).to_string()),
            ImportForm::From { member, alias, .. } => {
                alias.clone().unwrap_or_else(|| member.clone())
            }
            ImportForm::Wildcard { level, module } => format!("*{}", from_part(*level, module)),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self.form, ImportForm::Wildcard { .. })
    }

    /// Render as a standalone statement, relative imports kept as written.
    pub fn render(&self) -> String {
        match &self.form {
            ImportForm::Module { module, alias } => match alias {
                Some(alias) => format!("import {module} as {alias}"),
                None => format!("import {module}"),
            },
            ImportForm::From {
                level,
                module,
                member,
                alias,
            } => {
                let from = from_part(*level, module);
                match alias {
                    Some(alias) => format!("from {from} import {member} as {alias}"),
                    None => format!("from {from} import {member}"),
                }
            }
            ImportForm::Wildcard { level, module } => {
                format!("from {} import *", from_part(*level, module))
            }
        }
    }

    /// Render with relative imports resolved against `package`.
    ///
    /// Returns `None` when a relative import climbs above the project root.
    pub fn render_absolute(&self, package: &str) -> Option<String> {
        match &self.form {
            ImportForm::Module { .. } => Some(self.render()),
            ImportForm::From {
                level,
                module,
                member,
                alias,
            } => {
                let from = resolve_relative(package, *level, module.as_deref())?;
                Some(match alias {
                    Some(alias) => format!("from {from} import {member} as {alias}"),
                    None => format!("from {from} import {member}"),
                })
            }
            ImportForm::Wildcard { level, module } => {
                let from = resolve_relative(package, *level, module.as_deref())?;
                Some(format!("from {from} import *"))
            }
        }
    }

    /// Absolute module named by the statement (`a.b` for `import a.b`,
    /// the `from` part otherwise).
    pub fn source_module(&self, package: &str) -> Option<String> {
        match &self.form {
            ImportForm::Module { module, .. } => Some(module.clone()),
            ImportForm::From { level, module, .. } | ImportForm::Wildcard { level, module } => {
                resolve_relative(package, *level, module.as_deref())
            }
        }
    }
}

fn from_part(level: usize, module: &Option<String>) -> String {
    format!("{}{}", ".".repeat(level), module.as_deref().unwrap_or(""))
}

/// Resolve a (possibly relative) import against the importing module's package.
///
/// Level 1 is the package itself, level 2 its parent, and so on.
pub fn resolve_relative(package: &str, level: usize, module: Option<&str>) -> Option<String> {
    if level == 0 {
        return module.map(str::to_string);
    }
    if package.is_empty() {
        return None;
    }
    let mut parts: Vec<&str> = package.split('.').collect();
    for _ in 1..level {
        parts.pop()?;
    }
    if let Some(module) = module {
        parts.extend(module.split('.'));
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("."))
    }
}

/// Split an import statement node into its bindings.
pub fn parse_import(node: Node, source: &[u8], statement: usize) -> Vec<ImportBinding> {
    match node.kind() {
        "import_statement" => {
            let mut cursor = node.walk();
            let names: Vec<Node> = node.children_by_field_name("name", &mut cursor).collect();
            names
                .into_iter()
                .filter_map(|child| dotted_and_alias(child, source))
                .map(|(module, alias)| ImportBinding {
                    form: ImportForm::Module { module, alias },
                    statement,
                })
                .collect()
        }
        "import_from_statement" => {
            let Some(module_node) = node.child_by_field_name("module_name") else {
                return Vec::new();
            };
            let (level, module) = if module_node.kind() == "relative_import" {
                relative_parts(module_node, source)
            } else {
                (0, Some(dotted_text(module_node, source)))
            };

            let mut cursor = node.walk();
            let children: Vec<Node> = node.children(&mut cursor).collect();
            if children.iter().any(|c| c.kind() == "wildcard_import") {
                return vec![ImportBinding {
                    form: ImportForm::Wildcard { level, module },
                    statement,
                }];
            }

            let mut cursor = node.walk();
            let names: Vec<Node> = node.children_by_field_name("name", &mut cursor).collect();
            names
                .into_iter()
                .filter_map(|child| dotted_and_alias(child, source))
                .map(|(member, alias)| ImportBinding {
                    form: ImportForm::From {
                        level,
                        module: module.clone(),
                        member,
                        alias,
                    },
                    statement,
                })
                .collect()
        }
        _ => Vec::new(),
    }
}

fn dotted_and_alias(node: Node, source: &[u8]) -> Option<(String, Option<String>)> {
    match node.kind() {
        "dotted_name" | "identifier" => Some((dotted_text(node, source), None)),
        "aliased_import" => {
            let name = node.child_by_field_name("name")?;
            let alias = node
                .child_by_field_name("alias")
                .map(|a| dotted_text(a, source));
            Some((dotted_text(name, source), alias))
        }
        _ => None,
    }
}

fn relative_parts(node: Node, source: &[u8]) -> (usize, Option<String>) {
    let mut level = 0;
    let mut module = None;
    let mut cursor = node.walk();
    for child in node.children(&mut cursor) {
        match child.kind() {
            "import_prefix" => level = dotted_text(child, source).matches('.').count(),
            "dotted_name" => module = Some(dotted_text(child, source)),
            _ => {}
        }
    }
    (level, module)
}

fn dotted_text(node: Node, source: &[u8]) -> String {
    node.utf8_text(source)
        .unwrap_or("")
        .split_whitespace()
        .collect::<String>()
}
