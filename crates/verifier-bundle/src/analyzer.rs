//! Dependency Analyzer — static closure of everything a verifier references.
//!
//! Resolution is two-pass: the [`ProjectIndex`] is built first, then every
//! free name of the verifier is classified by table lookup and local
//! definitions are expanded breadth-first until fixpoint. External
//! packages, standard-library modules and builtins are leaves.
//!
//! The traversal is recorded as a petgraph reference graph; node identity
//! doubles as the visited set, which keeps cyclic local references finite.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;

use petgraph::dot::{Config, Dot};
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::config::BundlerConfig;
use crate::definition::VerifierDefinition;
use crate::error::{BundleError, BundleResult};
use crate::project::stdlib::{is_builtin, is_stdlib};
use crate::project::{
    parse_function, FunctionSource, ImportBinding, ImportForm, ModuleIndex, NameRef, ProjectIndex,
};

/// Re-export and wildcard chains longer than this are treated as cycles.
const MAX_REEXPORT_DEPTH: usize = 32;

/// A piece of the local project that must travel with the verifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LocalItem {
    /// Every top-level statement of `module` binding `name`
    Definition { module: String, name: String },
    /// The import binding of `module` keyed by `key` (bound name, or
    /// `*source` for wildcards)
    Import { module: String, key: String },
    /// A module used opaquely, included whole
    Module { module: String },
}

impl LocalItem {
    pub fn module(&self) -> &str {
        match self {
            Self::Definition { module, .. }
            | Self::Import { module, .. }
            | Self::Module { module } => module,
        }
    }
}

impl fmt::Display for LocalItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Definition { module, name } => write!(f, "{module}:{name}"),
            Self::Import { module, key } => write!(f, "{module}:import {key}"),
            Self::Module { module } => write!(f, "{module}:*"),
        }
    }
}

/// How a free name of the verifier gets bound in the generated entry module.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryBinding {
    /// `from {module} import {name}` out of the extracted tree
    Local { module: String, name: String },
    /// An import statement, already absolute
    Import(String),
}

impl EntryBinding {
    pub fn render(&self) -> String {
        match self {
            Self::Local { module, name } => format!("from {module} import {name}"),
            Self::Import(line) => line.clone(),
        }
    }
}

/// Node of the reference graph.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GraphNode {
    Entry(String),
    Local(LocalItem),
    External(String),
    Stdlib(String),
    Builtin(String),
}

impl fmt::Display for GraphNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Entry(name) => write!(f, "verifier {name}"),
            Self::Local(item) => write!(f, "{item}"),
            Self::External(pkg) => write!(f, "external {pkg}"),
            Self::Stdlib(module) => write!(f, "stdlib {module}"),
            Self::Builtin(name) => write!(f, "builtin {name}"),
        }
    }
}

/// Result of analyzing one verifier.
#[derive(Debug, Clone)]
pub struct DependencyClosure {
    /// The normalized verifier function
    pub function: FunctionSource,
    /// Defining module, if the verifier lives in the project
    pub entry_module: Option<String>,
    pub local: BTreeSet<LocalItem>,
    /// Top-level import names of external packages (SDK included)
    pub external_packages: BTreeSet<String>,
    /// Standard-library modules referenced (never bundled)
    pub stdlib: BTreeSet<String>,
    /// Import preamble of the entry module, in first-use order
    pub entry_bindings: Vec<EntryBinding>,
    pub graph: DiGraph<GraphNode, &'static str>,
}

impl DependencyClosure {
    /// Qualified `module:name` of every local definition in the closure.
    pub fn local_symbols(&self) -> Vec<String> {
        self.local
            .iter()
            .filter(|item| matches!(item, LocalItem::Definition { .. }))
            .map(|item| item.to_string())
            .collect()
    }

    pub fn contains_symbol(&self, qualified: &str) -> bool {
        self.local_symbols().iter().any(|s| s == qualified)
    }

    /// Local modules that contribute at least one item.
    pub fn modules(&self) -> BTreeSet<&str> {
        self.local.iter().map(LocalItem::module).collect()
    }
}

/// What a reference resolved to.
#[derive(Debug, Clone)]
enum Target {
    Local(LocalItem),
    External(String),
    Stdlib(String),
    Builtin(String),
}

impl From<Target> for GraphNode {
    fn from(target: Target) -> Self {
        match target {
            Target::Local(item) => Self::Local(item),
            Target::External(pkg) => Self::External(pkg),
            Target::Stdlib(module) => Self::Stdlib(module),
            Target::Builtin(name) => Self::Builtin(name),
        }
    }
}

struct Resolution {
    targets: Vec<Target>,
    binding: Option<EntryBinding>,
}

/// Graph under construction plus the work queue of unexpanded local items.
#[derive(Default)]
struct Traversal {
    graph: DiGraph<GraphNode, &'static str>,
    nodes: HashMap<GraphNode, NodeIndex>,
    queue: VecDeque<(NodeIndex, LocalItem)>,
}

impl Traversal {
    fn node(&mut self, node: GraphNode) -> NodeIndex {
        if let Some(ix) = self.nodes.get(&node) {
            return *ix;
        }
        let ix = self.graph.add_node(node.clone());
        if let GraphNode::Local(item) = &node {
            self.queue.push_back((ix, item.clone()));
        }
        self.nodes.insert(node, ix);
        ix
    }

    fn link(&mut self, from: NodeIndex, targets: Vec<Target>, label: &'static str) {
        for target in targets {
            let to = self.node(target.into());
            self.graph.update_edge(from, to, label);
        }
    }
}

/// Computes [`DependencyClosure`]s against one project.
pub struct DependencyAnalyzer<'p> {
    project: &'p ProjectIndex,
    config: &'p BundlerConfig,
}

impl<'p> DependencyAnalyzer<'p> {
    pub fn new(project: &'p ProjectIndex, config: &'p BundlerConfig) -> Self {
        Self { project, config }
    }

    /// Analyze a verifier definition.
    pub fn analyze(&self, definition: &VerifierDefinition) -> BundleResult<DependencyClosure> {
        let function = parse_function(definition.function_name(), definition.source())?;
        let entry_module = definition.module().map(str::to_string);
        if let Some(module) = &entry_module {
            self.module_index(module)?;
        }

        let scope = format!("verifier `{}`", function.name);
        let mut walk = Traversal::default();
        let entry = walk.node(GraphNode::Entry(function.name.clone()));
        let mut entry_bindings: Vec<EntryBinding> = Vec::new();

        for name_ref in &function.uses.free {
            // recursion binds to the entry module's own definition
            if name_ref.name == function.name {
                continue;
            }
            let resolved = self.resolve_name(entry_module.as_deref(), name_ref, &scope)?;
            if let Some(binding) = resolved.binding {
                if !entry_bindings.contains(&binding) {
                    entry_bindings.push(binding);
                }
            }
            // the entry module re-imports these itself
            let targets = resolved
                .targets
                .into_iter()
                .filter(|target| {
                    !matches!(target, Target::Local(LocalItem::Import { module, .. })
                        if Some(module) == entry_module.as_ref())
                })
                .collect();
            walk.link(entry, targets, "references");
        }

        for import in &function.uses.imports {
            let relative = matches!(
                import.form,
                ImportForm::From { level, .. } | ImportForm::Wildcard { level, .. } if level > 0
            );
            if relative {
                return Err(BundleError::extraction(
                    function.name.clone(),
                    format!("relative import `{}` inside the verifier body", import.render()),
                ));
            }
            let targets = self.resolve_nested_import(None, import, &scope)?;
            walk.link(entry, targets, "imports");
        }

        while let Some((from, item)) = walk.queue.pop_front() {
            let targets = self.expand(&item)?;
            walk.link(from, targets, "references");
        }

        let mut local = BTreeSet::new();
        let mut external_packages = BTreeSet::new();
        let mut stdlib = BTreeSet::new();
        let mut dfs = Dfs::new(&walk.graph, entry);
        while let Some(ix) = dfs.next(&walk.graph) {
            match &walk.graph[ix] {
                GraphNode::Local(item) => {
                    local.insert(item.clone());
                }
                GraphNode::External(pkg) => {
                    external_packages.insert(pkg.clone());
                }
                GraphNode::Stdlib(module) => {
                    stdlib.insert(module.clone());
                }
                GraphNode::Entry(_) | GraphNode::Builtin(_) => {}
            }
        }

        debug!(
            verifier = %function.name,
            local = local.len(),
            external = external_packages.len(),
            stdlib = stdlib.len(),
            "Dependency closure computed"
        );
        trace!(
            verifier = %function.name,
            "Reference graph:\n{}",
            Dot::with_config(&walk.graph, &[Config::EdgeNoLabel])
        );

        Ok(DependencyClosure {
            function,
            entry_module,
            local,
            external_packages,
            stdlib,
            entry_bindings,
            graph: walk.graph,
        })
    }

    fn module_index(&self, path: &str) -> BundleResult<&'p ModuleIndex> {
        self.project
            .module(path)
            .ok_or_else(|| {
                BundleError::Project(format!("module `{path}` is not part of the project"))
            })
    }

    /// Leaf target for a non-local module path; `None` means local.
    fn external_target(&self, path: &str) -> Option<Target> {
        let top = path.split('.').next().unwrap_or(path);
        if top == self.config.sdk_module {
            return Some(Target::External(top.to_string()));
        }
        if self.project.is_local_top_level(top) {
            return None;
        }
        if is_stdlib(top) {
            Some(Target::Stdlib(top.to_string()))
        } else {
            Some(Target::External(top.to_string()))
        }
    }

    /// Dependencies of one local item.
    fn expand(&self, item: &LocalItem) -> BundleResult<Vec<Target>> {
        let mut targets = Vec::new();
        match item {
            LocalItem::Definition { module, name } => {
                let index = self.module_index(module)?;
                let scope = item.to_string();
                for def in index.definitions_of(name) {
                    for name_ref in &def.uses.free {
                        if def.binds(&name_ref.name) {
                            continue;
                        }
                        targets.extend(self.resolve_name(Some(module), name_ref, &scope)?.targets);
                    }
                    for import in &def.uses.imports {
                        targets.extend(self.resolve_nested_import(Some(module), import, &scope)?);
                    }
                }
            }
            // targets are linked where the binding is referenced
            LocalItem::Import { .. } => {}
            LocalItem::Module { module } => {
                // namespace packages contribute markers only
                let Some(index) = self.project.module(module) else {
                    return Ok(targets);
                };
                let scope = item.to_string();
                for def in &index.definitions {
                    for name in &def.names {
                        targets.push(Target::Local(LocalItem::Definition {
                            module: module.clone(),
                            name: name.clone(),
                        }));
                    }
                }
                for import in &index.imports {
                    targets.push(Target::Local(LocalItem::Import {
                        module: module.clone(),
                        key: import.bound_name(),
                    }));
                    targets.extend(self.import_target(index, import, &[], 0, &scope)?);
                }
            }
        }
        Ok(targets)
    }

    /// Resolve a free name read inside `module` (or inside a verifier
    /// outside the project when `module` is `None`).
    fn resolve_name(
        &self,
        module: Option<&str>,
        name_ref: &NameRef,
        scope: &str,
    ) -> BundleResult<Resolution> {
        let index = module.map(|m| self.module_index(m)).transpose()?;
        if let Some(index) = index {
            if let Some(hit) = self.lookup(index, &name_ref.name, &name_ref.chain, 0, scope)? {
                return Ok(hit);
            }
        }
        if is_builtin(&name_ref.name) {
            return Ok(Resolution {
                targets: vec![Target::Builtin(name_ref.name.clone())],
                binding: None,
            });
        }
        if let Some(index) = index {
            if let Some(hit) = self.external_wildcard(index) {
                return Ok(hit);
            }
        }
        Err(BundleError::unresolved(name_ref.name.clone(), scope))
    }

    /// Steps that stay inside the project: own definition, import binding,
    /// wildcard import from a local module.
    fn lookup(
        &self,
        index: &ModuleIndex,
        name: &str,
        chain: &[String],
        depth: usize,
        scope: &str,
    ) -> BundleResult<Option<Resolution>> {
        if index.defines(name) {
            return Ok(Some(Resolution {
                targets: vec![Target::Local(LocalItem::Definition {
                    module: index.path.clone(),
                    name: name.to_string(),
                })],
                binding: Some(EntryBinding::Local {
                    module: index.path.clone(),
                    name: name.to_string(),
                }),
            }));
        }

        if let Some(binding) = index.import_of(name) {
            let line = binding
                .render_absolute(index.package())
                .ok_or_else(|| BundleError::unresolved(binding.render(), scope))?;
            let mut targets = vec![Target::Local(LocalItem::Import {
                module: index.path.clone(),
                key: binding.bound_name(),
            })];
            targets.extend(self.import_target(index, binding, chain, depth, scope)?);
            return Ok(Some(Resolution {
                targets,
                binding: Some(EntryBinding::Import(line)),
            }));
        }

        if depth >= MAX_REEXPORT_DEPTH {
            return Ok(None);
        }
        for wildcard in index.wildcard_imports() {
            let Some(source) = wildcard.source_module(index.package()) else {
                continue;
            };
            if self.external_target(&source).is_some() {
                continue;
            }
            let Some(source_index) = self.project.module(&source) else {
                continue;
            };
            if let Some(inner) = self.lookup(source_index, name, chain, depth + 1, scope)? {
                let mut targets = vec![Target::Local(LocalItem::Import {
                    module: index.path.clone(),
                    key: wildcard.bound_name(),
                })];
                targets.extend(inner.targets);
                return Ok(Some(Resolution {
                    targets,
                    binding: Some(EntryBinding::Local {
                        module: source,
                        name: name.to_string(),
                    }),
                }));
            }
        }
        Ok(None)
    }

    /// First wildcard import of a non-local module, which may provide any name.
    fn external_wildcard(&self, index: &ModuleIndex) -> Option<Resolution> {
        index.wildcard_imports().find_map(|wildcard| {
            let source = wildcard.source_module(index.package())?;
            let leaf = self.external_target(&source)?;
            let line = wildcard.render_absolute(index.package())?;
            Some(Resolution {
                targets: vec![
                    Target::Local(LocalItem::Import {
                        module: index.path.clone(),
                        key: wildcard.bound_name(),
                    }),
                    leaf,
                ],
                binding: Some(EntryBinding::Import(line)),
            })
        })
    }

    /// What a top-level import binding of `index` brings in, given the
    /// attribute chain read off the bound name.
    fn import_target(
        &self,
        index: &ModuleIndex,
        binding: &ImportBinding,
        chain: &[String],
        depth: usize,
        scope: &str,
    ) -> BundleResult<Vec<Target>> {
        let source = binding
            .source_module(index.package())
            .ok_or_else(|| BundleError::unresolved(binding.render(), scope))?;
        if let Some(leaf) = self.external_target(&source) {
            return Ok(vec![leaf]);
        }

        match &binding.form {
            ImportForm::Module { module, alias } => {
                if !self.project.contains_module(module) {
                    return Err(BundleError::unresolved(module.clone(), scope));
                }
                let base = match alias {
                    Some(_) => module.clone(),
                    None => module.split('.').next().unwrap_or(module).to_string(),
                };
                let (reached, mut targets) = self.walk_chain(base, chain, depth, scope)?;
                // `import a.b.c` must still find a/b/c.py
                if reached != *module && !reached.starts_with(&format!("{module}.")) {
                    targets.push(Target::Local(LocalItem::Module {
                        module: module.clone(),
                    }));
                }
                Ok(targets)
            }
            ImportForm::From { member, .. } => {
                let submodule = format!("{source}.{member}");
                if self.project.contains_module(&submodule) {
                    Ok(self.walk_chain(submodule, chain, depth, scope)?.1)
                } else if self.project.module(&source).is_some() {
                    self.resolve_member(&source, member, depth + 1, scope)
                } else {
                    Err(BundleError::unresolved(submodule, scope))
                }
            }
            ImportForm::Wildcard { .. } => {
                if self.project.contains_module(&source) {
                    Ok(vec![Target::Local(LocalItem::Module { module: source })])
                } else {
                    Err(BundleError::unresolved(binding.render(), scope))
                }
            }
        }
    }

    /// Follow `start.chain[0].chain[1]...` through local modules; the first
    /// attribute that is not a submodule is resolved as a member.
    fn walk_chain(
        &self,
        start: String,
        chain: &[String],
        depth: usize,
        scope: &str,
    ) -> BundleResult<(String, Vec<Target>)> {
        let mut current = start;
        for attr in chain {
            let next = format!("{current}.{attr}");
            if self.project.contains_module(&next) {
                current = next;
                continue;
            }
            if self.project.module(&current).is_some() {
                let targets = self.resolve_member(&current, attr, depth + 1, scope)?;
                return Ok((current, targets));
            }
            return Err(BundleError::unresolved(next, scope));
        }
        let targets = vec![Target::Local(LocalItem::Module {
            module: current.clone(),
        })];
        Ok((current, targets))
    }

    /// Resolve `module.member` where `module` is local.
    fn resolve_member(
        &self,
        module: &str,
        member: &str,
        depth: usize,
        scope: &str,
    ) -> BundleResult<Vec<Target>> {
        let qualified = format!("{module}.{member}");
        if depth > MAX_REEXPORT_DEPTH {
            return Err(BundleError::unresolved(qualified, format!("{scope} (re-export cycle)")));
        }
        if let Some(index) = self.project.module(module) {
            if let Some(hit) = self.lookup(index, member, &[], depth, scope)? {
                return Ok(hit.targets);
            }
            if let Some(hit) = self.external_wildcard(index) {
                return Ok(hit.targets);
            }
        }
        if self.project.contains_module(&qualified) {
            return Ok(vec![Target::Local(LocalItem::Module { module: qualified })]);
        }
        Err(BundleError::unresolved(qualified, scope))
    }

    /// An import statement nested inside a definition or the verifier body.
    fn resolve_nested_import(
        &self,
        module: Option<&str>,
        binding: &ImportBinding,
        scope: &str,
    ) -> BundleResult<Vec<Target>> {
        let package = match module {
            Some(path) => self.module_index(path)?.package().to_string(),
            None => String::new(),
        };
        let source = binding
            .source_module(&package)
            .ok_or_else(|| BundleError::unresolved(binding.render(), scope))?;
        if let Some(leaf) = self.external_target(&source) {
            return Ok(vec![leaf]);
        }

        match &binding.form {
            ImportForm::Module { .. } | ImportForm::Wildcard { .. } => {
                if self.project.contains_module(&source) {
                    Ok(vec![Target::Local(LocalItem::Module { module: source })])
                } else {
                    Err(BundleError::unresolved(source, scope))
                }
            }
            ImportForm::From { member, .. } => {
                let submodule = format!("{source}.{member}");
                if self.project.contains_module(&submodule) {
                    Ok(vec![Target::Local(LocalItem::Module { module: submodule })])
                } else {
                    self.resolve_member(&source, member, 1, scope)
                }
            }
        }
    }
}
