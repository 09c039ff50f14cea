//! Verifier definitions — the immutable input to bundling.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Globally unique identifier of a verifier, assigned once at definition time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VerifierId(Uuid);

impl VerifierId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for VerifierId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for VerifierId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for VerifierId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// An external package requirement, kept verbatim as the user declared it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Requirement(String);

impl Requirement {
    pub fn new(line: impl Into<String>) -> Self {
        Self(line.into().trim().to_string())
    }

    /// The declared line, e.g. `torch==2.3.0` or `numpy>=1.20.0`.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Package name without extras or version constraint.
    pub fn name(&self) -> &str {
        let end = self
            .0
            .find(|c: char| matches!(c, '=' | '<' | '>' | '!' | '~' | '[' | ';' | ' ' | '@'))
            .unwrap_or(self.0.len());
        &self.0[..end]
    }

    /// Version constraint part, if any (`==2.3.0`).
    pub fn constraint(&self) -> Option<&str> {
        let rest = self.0[self.name().len()..].trim();
        if rest.is_empty() {
            None
        } else {
            Some(rest)
        }
    }

    /// PEP 503 normalized name, used to compare requirements by package.
    pub fn normalized_name(&self) -> String {
        normalize_package_name(self.name())
    }
}

impl std::fmt::Display for Requirement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Requirement {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Lower-case a package name and collapse runs of `-`, `_`, `.` into `-`.
pub fn normalize_package_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut last_sep = false;
    for c in name.chars() {
        if matches!(c, '-' | '_' | '.') {
            if !last_sep {
                out.push('-');
            }
            last_sep = true;
        } else {
            out.push(c.to_ascii_lowercase());
            last_sep = false;
        }
    }
    out
}

/// A user-authored verifier function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifierDefinition {
    id: VerifierId,
    /// Display name (defaults to the function name)
    name: String,
    function_name: String,
    /// Function source text, possibly decorated and indented
    source: String,
    /// Dotted module path of the defining module inside the local project
    module: Option<String>,
    requirements: Vec<Requirement>,
}

impl VerifierDefinition {
    pub fn builder(
        function_name: impl Into<String>,
        source: impl Into<String>,
    ) -> VerifierDefinitionBuilder {
        VerifierDefinitionBuilder {
            id: None,
            name: None,
            function_name: function_name.into(),
            source: source.into(),
            module: None,
            requirements: Vec::new(),
        }
    }

    pub fn id(&self) -> VerifierId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn module(&self) -> Option<&str> {
        self.module.as_deref()
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }
}

/// Builder for [`VerifierDefinition`]; the id is generated unless given.
#[derive(Debug, Clone)]
pub struct VerifierDefinitionBuilder {
    id: Option<VerifierId>,
    name: Option<String>,
    function_name: String,
    source: String,
    module: Option<String>,
    requirements: Vec<Requirement>,
}

impl VerifierDefinitionBuilder {
    pub fn id(mut self, id: VerifierId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn module(mut self, module: impl Into<String>) -> Self {
        self.module = Some(module.into());
        self
    }

    pub fn requirement(mut self, requirement: impl Into<Requirement>) -> Self {
        self.requirements.push(requirement.into());
        self
    }

    pub fn requirements<I, R>(mut self, requirements: I) -> Self
    where
        I: IntoIterator<Item = R>,
        R: Into<Requirement>,
    {
        self.requirements
            .extend(requirements.into_iter().map(Into::into));
        self
    }

    pub fn build(self) -> VerifierDefinition {
        VerifierDefinition {
            id: self.id.unwrap_or_default(),
            name: self.name.unwrap_or_else(|| self.function_name.clone()),
            function_name: self.function_name,
            source: self.source,
            module: self.module,
            requirements: self.requirements,
        }
    }
}
