//! Scope Walker — free-name analysis over a tree-sitter Python subtree.
//!
//! Walks a function, class or module-level statement and reports every
//! name it reads that is not bound inside it. Python's scoping rules are
//! followed closely enough for dependency analysis:
//!
//! - function, lambda and comprehension bodies open a scope whose locals
//!   are every name bound anywhere in that body
//! - class bodies open a scope that is visible only to the body itself,
//!   never to methods nested inside it
//! - `global` / `nonlocal` declarations keep a name free
//! - parameter defaults, annotations and decorators are evaluated in the
//!   enclosing scope
//! - `match` patterns bind their capture names and read class and value
//!   patterns (`Point(x=0)`, `Color.RED`)

use std::collections::HashSet;

use serde::{Deserialize, Serialize};
use tree_sitter::Node;

use super::imports::{parse_import, ImportBinding};

const COMPREHENSIONS: &[&str] = &[
    "list_comprehension",
    "set_comprehension",
    "dictionary_comprehension",
    "generator_expression",
];

/// A free name and the attribute chain read from it (`np.linalg.norm` →
/// name `np`, chain `[linalg, norm]`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NameRef {
    pub name: String,
    pub chain: Vec<String>,
}

/// Everything a subtree needs from its surroundings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameUses {
    /// Free names in first-use order, deduplicated
    pub free: Vec<NameRef>,
    /// Import statements nested inside the subtree
    pub imports: Vec<ImportBinding>,
}

impl NameUses {
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.free.iter().map(|r| r.name.as_str())
    }
}

/// Collect the free names of `node`.
///
/// `statement` is the index of the enclosing top-level statement and is
/// recorded on nested imports.
pub fn free_names(node: Node, source: &[u8], statement: usize) -> NameUses {
    let mut walker = ScopeWalker {
        source,
        statement,
        scopes: Vec::new(),
        uses: NameUses::default(),
        seen: HashSet::new(),
    };
    walker.visit(node);
    walker.uses
}

struct Scope {
    locals: HashSet<String>,
    class_body: bool,
}

struct ScopeWalker<'s> {
    source: &'s [u8],
    statement: usize,
    scopes: Vec<Scope>,
    uses: NameUses,
    seen: HashSet<NameRef>,
}

impl ScopeWalker<'_> {
    fn visit(&mut self, node: Node) {
        match node.kind() {
            "function_definition" => self.visit_function(node),
            "class_definition" => self.visit_class(node),
            "lambda" => self.visit_lambda(node),
            kind if COMPREHENSIONS.contains(&kind) => self.visit_comprehension(node),
            "import_statement" | "import_from_statement" => {
                let bindings = parse_import(node, self.source, self.statement);
                self.uses.imports.extend(bindings);
            }
            "future_import_statement" | "global_statement" | "nonlocal_statement" | "comment"
            | "dotted_name" | "type_parameter" => {}
            "case_pattern" => {
                let mut names = Vec::new();
                pattern_names(node, &mut names);
                for name in names {
                    if let PatternName::Read(dotted) = name {
                        self.visit_dotted(dotted);
                    }
                }
            }
            "identifier" => self.visit_identifier(node),
            "attribute" => {
                if let Some(object) = node.child_by_field_name("object") {
                    self.visit(object);
                }
            }
            "keyword_argument" => {
                if let Some(value) = node.child_by_field_name("value") {
                    self.visit(value);
                }
            }
            "as_pattern" => {
                let alias = node.child_by_field_name("alias");
                for child in named_children(node) {
                    if Some(child) != alias {
                        self.visit(child);
                    }
                }
            }
            "except_clause" => {
                let alias = except_alias(node);
                for child in named_children(node) {
                    if Some(child) != alias {
                        self.visit(child);
                    }
                }
            }
            _ => self.visit_children(node),
        }
    }

    fn visit_children(&mut self, node: Node) {
        for child in named_children(node) {
            self.visit(child);
        }
    }

    fn visit_identifier(&mut self, node: Node) {
        let name = node.utf8_text(self.source).unwrap_or("");
        let chain = attribute_chain(node, self.source);
        self.record(name, chain);
    }

    /// A value or class pattern: `Color.RED` reads `Color` with chain `[RED]`.
    fn visit_dotted(&mut self, node: Node) {
        let mut parts = named_children(node)
            .into_iter()
            .map(|part| part.utf8_text(self.source).unwrap_or("").to_string());
        if let Some(name) = parts.next() {
            let chain = parts.collect();
            self.record(&name, chain);
        }
    }

    fn record(&mut self, name: &str, chain: Vec<String>) {
        if name.is_empty() || self.is_bound(name) {
            return;
        }
        let name_ref = NameRef {
            name: name.to_string(),
            chain,
        };
        if self.seen.insert(name_ref.clone()) {
            self.uses.free.push(name_ref);
        }
    }

    fn is_bound(&self, name: &str) -> bool {
        let innermost = self.scopes.len().saturating_sub(1);
        self.scopes
            .iter()
            .enumerate()
            .rev()
            .any(|(i, scope)| (!scope.class_body || i == innermost) && scope.locals.contains(name))
    }

    fn visit_function(&mut self, node: Node) {
        let mut locals = HashSet::new();
        if let Some(params) = node.child_by_field_name("parameters") {
            self.visit_parameters(params, &mut locals);
        }
        if let Some(ret) = node.child_by_field_name("return_type") {
            self.visit(ret);
        }
        if let Some(body) = node.child_by_field_name("body") {
            let (bound, declared) = body_bindings(body, self.source);
            locals.extend(bound.into_iter().filter(|n| !declared.contains(n)));
            self.scopes.push(Scope {
                locals,
                class_body: false,
            });
            self.visit(body);
            self.scopes.pop();
        }
    }

    fn visit_lambda(&mut self, node: Node) {
        let mut locals = HashSet::new();
        if let Some(params) = node.child_by_field_name("parameters") {
            self.visit_parameters(params, &mut locals);
        }
        if let Some(body) = node.child_by_field_name("body") {
            self.scopes.push(Scope {
                locals,
                class_body: false,
            });
            self.visit(body);
            self.scopes.pop();
        }
    }

    fn visit_class(&mut self, node: Node) {
        if let Some(supers) = node.child_by_field_name("superclasses") {
            self.visit(supers);
        }
        if let Some(body) = node.child_by_field_name("body") {
            let (bound, declared) = body_bindings(body, self.source);
            self.scopes.push(Scope {
                locals: bound.into_iter().filter(|n| !declared.contains(n)).collect(),
                class_body: true,
            });
            self.visit(body);
            self.scopes.pop();
        }
    }

    fn visit_comprehension(&mut self, node: Node) {
        let mut locals = HashSet::new();
        for child in named_children(node) {
            if child.kind() == "for_in_clause" {
                if let Some(left) = child.child_by_field_name("left") {
                    collect_targets(left, self.source, &mut locals);
                }
            }
        }
        self.scopes.push(Scope {
            locals,
            class_body: false,
        });
        self.visit_children(node);
        self.scopes.pop();
    }

    /// Bind parameter names; defaults and annotations are visited in the
    /// enclosing scope before the function scope is pushed.
    fn visit_parameters(&mut self, params: Node, locals: &mut HashSet<String>) {
        for param in named_children(params) {
            match param.kind() {
                "identifier"
                | "list_splat_pattern"
                | "dictionary_splat_pattern"
                | "tuple_pattern" => {
                    collect_targets(param, self.source, locals);
                }
                "typed_parameter" => {
                    let annotation = param.child_by_field_name("type");
                    for child in named_children(param) {
                        if Some(child) == annotation {
                            self.visit(child);
                        } else {
                            collect_targets(child, self.source, locals);
                        }
                    }
                }
                "default_parameter" | "typed_default_parameter" => {
                    if let Some(name) = param.child_by_field_name("name") {
                        collect_targets(name, self.source, locals);
                    }
                    if let Some(annotation) = param.child_by_field_name("type") {
                        self.visit(annotation);
                    }
                    if let Some(value) = param.child_by_field_name("value") {
                        self.visit(value);
                    }
                }
                _ => {}
            }
        }
    }
}

fn named_children(node: Node) -> Vec<Node> {
    let mut cursor = node.walk();
    node.named_children(&mut cursor).collect()
}

/// The name bound by `except E as name`, across grammar revisions.
fn except_alias(node: Node) -> Option<Node> {
    if let Some(alias) = node.child_by_field_name("alias") {
        return Some(alias);
    }
    let mut cursor = node.walk();
    let mut after_as = false;
    for child in node.children(&mut cursor) {
        if after_as && child.is_named() {
            return Some(child);
        }
        after_as = child.kind() == "as";
    }
    None
}

/// Attribute names read off an identifier, outermost last.
fn attribute_chain(node: Node, source: &[u8]) -> Vec<String> {
    let mut chain = Vec::new();
    let mut current = node;
    while let Some(parent) = current.parent() {
        if parent.kind() != "attribute" || parent.child_by_field_name("object") != Some(current) {
            break;
        }
        match parent.child_by_field_name("attribute") {
            Some(attr) => chain.push(attr.utf8_text(source).unwrap_or("").to_string()),
            None => break,
        }
        current = parent;
    }
    chain
}

/// Names bound anywhere in a body, not descending into nested scopes, and
/// names declared `global` / `nonlocal`.
pub(crate) fn body_bindings(body: Node, source: &[u8]) -> (HashSet<String>, HashSet<String>) {
    let mut bound = HashSet::new();
    let mut declared = HashSet::new();
    collect_bindings(body, source, &mut bound, &mut declared);
    (bound, declared)
}

fn collect_bindings(
    node: Node,
    source: &[u8],
    bound: &mut HashSet<String>,
    declared: &mut HashSet<String>,
) {
    match node.kind() {
        "function_definition" | "class_definition" => {
            if let Some(name) = node.child_by_field_name("name") {
                bound.insert(name.utf8_text(source).unwrap_or("").to_string());
            }
            return;
        }
        "lambda" => return,
        kind if COMPREHENSIONS.contains(&kind) => return,
        "import_statement" | "import_from_statement" => {
            for binding in parse_import(node, source, 0) {
                if !binding.is_wildcard() {
                    bound.insert(binding.bound_name());
                }
            }
            return;
        }
        "global_statement" | "nonlocal_statement" => {
            for child in named_children(node) {
                if child.kind() == "identifier" {
                    declared.insert(child.utf8_text(source).unwrap_or("").to_string());
                }
            }
            return;
        }
        "assignment" | "augmented_assignment" | "for_statement" | "for_in_clause" => {
            if let Some(left) = node.child_by_field_name("left") {
                collect_targets(left, source, bound);
            }
        }
        "named_expression" => {
            if let Some(name) = node.child_by_field_name("name") {
                collect_targets(name, source, bound);
            }
        }
        "as_pattern" => {
            if let Some(alias) = node.child_by_field_name("alias") {
                collect_targets(alias, source, bound);
            }
        }
        "except_clause" => {
            if let Some(alias) = except_alias(node) {
                collect_targets(alias, source, bound);
            }
        }
        "case_pattern" => {
            let mut names = Vec::new();
            pattern_names(node, &mut names);
            for name in names {
                if let PatternName::Capture(capture) = name {
                    bound.insert(capture.utf8_text(source).unwrap_or("").to_string());
                }
            }
            return;
        }
        _ => {}
    }
    for child in named_children(node) {
        collect_bindings(child, source, bound, declared);
    }
}

enum PatternName<'t> {
    /// Identifier the pattern binds on a match
    Capture(Node<'t>),
    /// Dotted name the pattern evaluates (class or value pattern)
    Read(Node<'t>),
}

/// Split a `match` pattern into captured and read names.
///
/// A bare name is a capture, a dotted name is a value pattern, the head of a
/// class pattern is read, and the keyword of `attr=pattern` is neither.
fn pattern_names<'t>(node: Node<'t>, out: &mut Vec<PatternName<'t>>) {
    match node.kind() {
        "identifier" => out.push(PatternName::Capture(node)),
        "dotted_name" => {
            let parts = named_children(node);
            match parts.as_slice() {
                [single] => out.push(PatternName::Capture(*single)),
                _ => out.push(PatternName::Read(node)),
            }
        }
        "class_pattern" => {
            for (i, child) in named_children(node).into_iter().enumerate() {
                if i == 0 && child.kind() == "dotted_name" {
                    out.push(PatternName::Read(child));
                } else {
                    pattern_names(child, out);
                }
            }
        }
        "keyword_pattern" => {
            for child in named_children(node).into_iter().skip(1) {
                pattern_names(child, out);
            }
        }
        "dict_pattern" => {
            let mut cursor = node.walk();
            let keys: Vec<Node> = node.children_by_field_name("key", &mut cursor).collect();
            for child in named_children(node) {
                if keys.contains(&child) && child.kind() == "dotted_name" {
                    out.push(PatternName::Read(child));
                } else {
                    pattern_names(child, out);
                }
            }
        }
        _ => {
            for child in named_children(node) {
                pattern_names(child, out);
            }
        }
    }
}

/// Identifiers bound by an assignment target; attribute and subscript
/// targets bind nothing.
pub(crate) fn collect_targets(node: Node, source: &[u8], out: &mut HashSet<String>) {
    match node.kind() {
        "identifier" => {
            out.insert(node.utf8_text(source).unwrap_or("").to_string());
        }
        "attribute" | "subscript" => {}
        _ => {
            for child in named_children(node) {
                collect_targets(child, source, out);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tree_sitter::Parser;

    fn uses_of(source: &str) -> NameUses {
        let mut parser = Parser::new();
        parser
            .set_language(&tree_sitter_python::LANGUAGE.into())
            .unwrap();
        let tree = parser.parse(source, None).unwrap();
        let root = tree.root_node();
        let def = root.named_child(0).unwrap();
        free_names(def, source.as_bytes(), 0)
    }

    fn names(uses: &NameUses) -> Vec<&str> {
        uses.names().collect()
    }

    #[test]
    fn test_locals_and_params_are_not_free() {
        let uses = uses_of(
            "def f(a, b=DEFAULT, *args, c: Kind = 1, **kw):\n    x = a + b\n    for i, j in pairs(x):\n        print(i, j, c, args, kw)\n    return helper(x)\n",
        );
        assert_eq!(names(&uses), vec!["DEFAULT", "Kind", "pairs", "print", "helper"]);
    }

    #[test]
    fn test_attribute_chains() {
        let uses = uses_of("def f(v):\n    return np.linalg.norm(v) + v.size\n");
        assert_eq!(uses.free.len(), 1);
        assert_eq!(uses.free[0].name, "np");
        assert_eq!(uses.free[0].chain, vec!["linalg", "norm"]);
    }

    #[test]
    fn test_class_scope_not_visible_in_methods() {
        let uses = uses_of(
            "class C(Base):\n    LIMIT = 3\n    size = LIMIT * 2\n    def m(self):\n        return LIMIT\n",
        );
        assert_eq!(names(&uses), vec!["Base", "LIMIT"]);
    }

    #[test]
    fn test_global_declaration_keeps_name_free() {
        let uses = uses_of("def f():\n    global COUNTER\n    COUNTER = COUNTER + 1\n");
        assert_eq!(names(&uses), vec!["COUNTER"]);
    }

    #[test]
    fn test_comprehension_and_lambda_bindings() {
        let uses = uses_of(
            "def f(items):\n    key = lambda item: item.score\n    return [transform(x) for x in items if x], key\n",
        );
        assert_eq!(names(&uses), vec!["transform"]);
    }

    #[test]
    fn test_nested_imports_are_recorded() {
        let uses = uses_of(
            "def f():\n    import json\n    from .util import fmt\n    return fmt(json.dumps({}))\n",
        );
        assert!(uses.free.is_empty());
        let rendered: Vec<String> = uses.imports.iter().map(|b| b.render()).collect();
        assert_eq!(rendered, vec!["import json", "from .util import fmt"]);
    }

    #[test]
    fn test_except_alias_and_keywords() {
        let uses = uses_of(
            "def f():\n    try:\n        run(retries=3)\n    except ValueError as err:\n        log(err)\n",
        );
        assert_eq!(names(&uses), vec!["run", "ValueError", "log"]);
    }

    #[test]
    fn test_match_patterns_read_classes_and_bind_captures() {
        let uses = uses_of(
            "def f(shape):\n    match shape:\n        case Point(x=0, y=py) as p:\n            return py, p\n        case Color.RED:\n            return 1\n        case [first, *rest]:\n            return first, rest\n        case {\"k\": value}:\n            return value\n    return Point(1, 2)\n",
        );
        assert_eq!(names(&uses), vec!["Point", "Color"]);
        assert_eq!(uses.free[1].chain, vec!["RED"]);
    }

    #[test]
    fn test_match_pattern_does_not_shadow_class() {
        let uses = uses_of(
            "def f(shape):\n    p = Point(1, 2)\n    match shape:\n        case Point(x=0):\n            return p\n",
        );
        assert_eq!(names(&uses), vec!["Point"]);
    }

    #[test]
    fn test_fstring_interpolation_is_read() {
        let uses = uses_of("def f():\n    return f\"{PREFIX}-value\"\n");
        assert_eq!(names(&uses), vec!["PREFIX"]);
    }
}
