//! Python Index — tree-sitter-based top-level definition extraction.
//!
//! Parses Python modules with tree-sitter-python and records, for every
//! top-level statement that binds a name, its kind, the names it binds,
//! its exact source text and the free names it reads. Imports are split
//! into one [`ImportBinding`] per bound name.

use serde::{Deserialize, Serialize};
use tree_sitter::{Node, Parser, Tree};

use super::imports::{parse_import, ImportBinding};
use super::scope::{body_bindings, free_names, NameUses};
use crate::error::{BundleError, BundleResult};

/// Categories of top-level Python definitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefinitionKind {
    Function,
    Class,
    /// Assignments and compound statements that bind module-level names
    ModuleState,
}

impl std::fmt::Display for DefinitionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Function => write!(f, "def"),
            Self::Class => write!(f, "class"),
            Self::ModuleState => write!(f, "state"),
        }
    }
}

/// One top-level statement that binds at least one name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Definition {
    /// Position among the module's top-level statements
    pub statement: usize,
    pub kind: DefinitionKind,
    /// Names bound (or mutated) by the statement
    pub names: Vec<String>,
    /// Exact source text, decorators included
    pub text: String,
    /// Free names and nested imports
    pub uses: NameUses,
    /// Starting line (0-indexed)
    pub start_line: usize,
    /// tree-sitter reported a syntax error inside the statement
    pub has_error: bool,
}

impl Definition {
    pub fn binds(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }
}

/// Index of one Python module of the local project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleIndex {
    /// Dotted module path (`pkg.helpers`)
    pub path: String,
    /// File path relative to the project root
    pub file: String,
    /// The module is a package `__init__.py`
    pub is_package: bool,
    pub definitions: Vec<Definition>,
    pub imports: Vec<ImportBinding>,
    /// `from __future__ import ...` lines, verbatim
    pub future_imports: Vec<String>,
}

impl ModuleIndex {
    /// Parse a module's source and index its top-level statements.
    pub fn parse(path: &str, file: &str, is_package: bool, source: &str) -> BundleResult<Self> {
        let tree = parse_tree(source)?;
        let root = tree.root_node();
        let bytes = source.as_bytes();

        let mut index = Self {
            path: path.to_string(),
            file: file.to_string(),
            is_package,
            definitions: Vec::new(),
            imports: Vec::new(),
            future_imports: Vec::new(),
        };

        let mut cursor = root.walk();
        let statements: Vec<Node> = root.named_children(&mut cursor).collect();
        for (statement, node) in statements.into_iter().enumerate() {
            match node.kind() {
                "import_statement" | "import_from_statement" => {
                    index.imports.extend(parse_import(node, bytes, statement));
                }
                "future_import_statement" => {
                    index.future_imports.push(node_text(node, bytes).to_string());
                }
                "function_definition" | "class_definition" | "decorated_definition" => {
                    if let Some(def) = Self::extract_callable(node, bytes, statement) {
                        index.definitions.push(def);
                    }
                }
                "if_statement" if is_main_guard(node, bytes) => {}
                "expression_statement" | "if_statement" | "try_statement" | "with_statement"
                | "for_statement" | "while_statement" | "match_statement" => {
                    if let Some(def) = Self::extract_state(node, bytes, statement) {
                        index.definitions.push(def);
                    }
                }
                _ => {}
            }
        }

        Ok(index)
    }

    fn extract_callable(node: Node, source: &[u8], statement: usize) -> Option<Definition> {
        let inner = if node.kind() == "decorated_definition" {
            node.child_by_field_name("definition")?
        } else {
            node
        };
        let kind = match inner.kind() {
            "function_definition" => DefinitionKind::Function,
            "class_definition" => DefinitionKind::Class,
            _ => return None,
        };
        let name = node_text(inner.child_by_field_name("name")?, source).to_string();

        Some(Definition {
            statement,
            kind,
            names: vec![name],
            text: node_text(node, source).to_string(),
            uses: free_names(node, source, statement),
            start_line: node.start_position().row,
            has_error: node.has_error(),
        })
    }

    fn extract_state(node: Node, source: &[u8], statement: usize) -> Option<Definition> {
        let (bound, declared) = body_bindings(node, source);
        let mut names: Vec<String> = bound.into_iter().chain(declared).collect();
        if names.is_empty() {
            // `CONFIG["k"] = v` / `registry.items += x` mutate an existing name
            names.extend(mutated_base(node, source));
        }
        if names.is_empty() {
            return None;
        }
        names.sort();

        Some(Definition {
            statement,
            kind: DefinitionKind::ModuleState,
            names,
            text: node_text(node, source).to_string(),
            uses: free_names(node, source, statement),
            start_line: node.start_position().row,
            has_error: node.has_error(),
        })
    }

    /// Whether a top-level definition binds `name`.
    pub fn defines(&self, name: &str) -> bool {
        self.definitions.iter().any(|d| d.binds(name))
    }

    /// All top-level statements binding `name`, in source order.
    pub fn definitions_of<'a>(
        &'a self,
        name: &'a str,
    ) -> impl Iterator<Item = &'a Definition> + 'a {
        self.definitions.iter().filter(move |d| d.binds(name))
    }

    /// Statement index of the last top-level definition of `name`.
    pub fn last_definition_of(&self, name: &str) -> Option<usize> {
        self.definitions_of(name).map(|d| d.statement).max()
    }

    /// The import binding for `name`; a later import of the same name wins.
    pub fn import_of(&self, name: &str) -> Option<&ImportBinding> {
        self.imports
            .iter()
            .filter(|b| !b.is_wildcard() && b.bound_name() == name)
            .max_by_key(|b| b.statement)
    }

    pub fn wildcard_imports(&self) -> impl Iterator<Item = &ImportBinding> {
        self.imports.iter().filter(|b| b.is_wildcard())
    }

    /// Package that relative imports in this module resolve against.
    pub fn package(&self) -> &str {
        if self.is_package {
            &self.path
        } else {
            self.path.rsplit_once('.').map(|(parent, _)| parent).unwrap_or("")
        }
    }
}

/// The verifier function itself, normalized for re-emission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionSource {
    pub name: String,
    /// Dedented `def` text without decorators
    pub text: String,
    pub uses: NameUses,
    pub is_async: bool,
}

/// Parse a verifier's source and locate the function named `function_name`.
///
/// The source may be indented (a method or nested definition captured
/// verbatim) and may carry decorators; both are removed.
pub fn parse_function(function_name: &str, source: &str) -> BundleResult<FunctionSource> {
    let parse_error = |reason: String| BundleError::Parse {
        function: function_name.to_string(),
        reason,
    };

    let dedented = dedent(source);
    let tree = parse_tree(&dedented)?;
    let root = tree.root_node();
    let bytes = dedented.as_bytes();

    if root.has_error() {
        let line = first_error(root).map(|n| n.start_position().row + 1).unwrap_or(1);
        return Err(parse_error(format!("syntax error near line {line}")));
    }

    let mut cursor = root.walk();
    let found = root.named_children(&mut cursor).find_map(|node| {
        let def = match node.kind() {
            "function_definition" => node,
            "decorated_definition" => node.child_by_field_name("definition")?,
            _ => return None,
        };
        let name = def.child_by_field_name("name")?;
        let matches =
            def.kind() == "function_definition" && node_text(name, bytes) == function_name;
        matches.then_some(def)
    });
    let Some(def) = found else {
        return Err(parse_error(format!("no top-level function named `{function_name}`")));
    };

    let text = node_text(def, bytes).to_string();
    Ok(FunctionSource {
        name: function_name.to_string(),
        is_async: text.starts_with("async"),
        uses: free_names(def, bytes, 0),
        text,
    })
}

/// Remove the common leading whitespace of all non-blank lines.
pub fn dedent(source: &str) -> String {
    let indent = source
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start().len())
        .min()
        .unwrap_or(0);

    let mut out = source
        .lines()
        .map(|l| {
            if l.trim().is_empty() {
                ""
            } else {
                l.get(indent..).unwrap_or_else(|| l.trim_start())
            }
        })
        .collect::<Vec<_>>()
        .join("\n");
    if source.ends_with('\n') {
        out.push('\n');
    }
    out
}

fn parse_tree(source: &str) -> BundleResult<Tree> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_python::LANGUAGE.into())
        .map_err(|e| BundleError::Project(format!("tree-sitter-python language: {e}")))?;
    parser
        .parse(source, None)
        .ok_or_else(|| BundleError::Project("tree-sitter produced no tree".to_string()))
}

fn node_text<'a>(node: Node, source: &'a [u8]) -> &'a str {
    node.utf8_text(source).unwrap_or("")
}

fn first_error(node: Node) -> Option<Node> {
    if node.is_error() || node.is_missing() {
        return Some(node);
    }
    let mut cursor = node.walk();
    let children: Vec<Node> = node.children(&mut cursor).collect();
    children
        .into_iter()
        .filter(|c| c.has_error())
        .find_map(first_error)
}

fn is_main_guard(node: Node, source: &[u8]) -> bool {
    node.child_by_field_name("condition")
        .map(|c| {
            let text = node_text(c, source);
            text.contains("__name__") && text.contains("__main__")
        })
        .unwrap_or(false)
}

/// Base identifier of an attribute/subscript assignment target.
fn mutated_base(node: Node, source: &[u8]) -> Option<String> {
    let expr = node.named_child(0)?;
    if !matches!(expr.kind(), "assignment" | "augmented_assignment") {
        return None;
    }
    let mut target = expr.child_by_field_name("left")?;
    while matches!(target.kind(), "attribute" | "subscript") {
        let field = if target.kind() == "attribute" { "object" } else { "value" };
        target = target.child_by_field_name(field)?;
    }
    (target.kind() == "identifier").then(|| node_text(target, source).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    const HELPERS: &str = r#"from __future__ import annotations
import json
from .base import Base as BaseCheck
from numpy import *

THRESHOLD = 0.5
CONFIG = {}
CONFIG["mode"] = "strict"

def helper(x):
    return json.dumps(x) if x > THRESHOLD else None

@register
class Scorer(BaseCheck):
    pass

try:
    import ujson as fastjson
except ImportError:
    fastjson = None

if __name__ == "__main__":
    helper(1)
"#;

    #[test]
    fn test_python_grammar_loads() {
        let mut parser = Parser::new();
        if let Err(err) = parser.set_language(&tree_sitter_python::LANGUAGE.into()) {
            panic!("tree-sitter-python grammar is incompatible with tree-sitter: {err}");
        }
        let tree = parse_tree("def f(x):\n    return x\n").unwrap();
        assert_eq!(tree.root_node().kind(), "module");
        assert!(!tree.root_node().has_error());

        let function = parse_function("f", "def f(x):\n    return x\n").unwrap();
        assert_eq!(function.name, "f");
        assert!(!function.is_async);
    }

    #[test]
    fn test_module_index() {
        let index = ModuleIndex::parse("pkg.helpers", "pkg/helpers.py", false, HELPERS).unwrap();
        assert_eq!(index.future_imports, vec!["from __future__ import annotations"]);
        assert_eq!(index.imports.len(), 3);
        assert_eq!(index.wildcard_imports().count(), 1);
        assert!(index.import_of("BaseCheck").is_some());
        assert!(index.import_of("json").is_some());

        assert!(index.defines("THRESHOLD"));
        assert!(index.defines("helper"));
        assert!(index.defines("Scorer"));
        assert!(index.defines("fastjson"));
        assert_eq!(index.definitions_of("CONFIG").count(), 2);

        let scorer = index.definitions_of("Scorer").next().unwrap();
        assert_eq!(scorer.kind, DefinitionKind::Class);
        assert!(scorer.text.starts_with("@register"));
        let uses: Vec<&str> = scorer.uses.names().collect();
        assert_eq!(uses, vec!["register", "BaseCheck"]);

        // main guard is never indexed
        assert!(index.definitions.iter().all(|d| !d.text.contains("__main__")));
        assert_eq!(index.package(), "pkg");
    }

    #[test]
    fn test_parse_function_strips_decorators_and_indent() {
        let source = "    @verifier(key=\"x\")\n    async def check(env, *args):\n        return await score(env)\n";
        let func = parse_function("check", source).unwrap();
        assert!(func.is_async);
        assert!(func.text.starts_with("async def check(env, *args):"));
        assert!(!func.text.contains("@verifier"));
        let uses: Vec<&str> = func.uses.names().collect();
        assert_eq!(uses, vec!["score"]);
    }

    #[test]
    fn test_parse_function_errors() {
        let err = parse_function("check", "def check(:\n    pass\n").unwrap_err();
        assert!(matches!(err, BundleError::Parse { .. }));

        let err = parse_function("check", "def other():\n    pass\n").unwrap_err();
        assert!(err.to_string().contains("no top-level function named `check`"));
    }

    #[test]
    fn test_dedent() {
        assert_eq!(dedent("    a\n\n      b\n"), "a\n\n  b\n");
        assert_eq!(dedent("x = 1"), "x = 1");
    }

    #[test]
    fn test_package_of_init_module() {
        let index = ModuleIndex::parse("pkg.sub", "pkg/sub/__init__.py", true, "X = 1\n").unwrap();
        assert_eq!(index.package(), "pkg.sub");
    }
}
