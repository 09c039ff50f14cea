//! Configuration for the bundler and the remote protocol client.
//!
//! Both structs carry working defaults; a partial TOML document overrides
//! only the keys it names.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;

use crate::error::BundleError;

/// Bundle assembly settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BundlerConfig {
    /// Top-level Python module of the SDK itself (imports of it are never local).
    pub sdk_module: String,
    /// Requirement line that makes the SDK available on the remote side.
    pub sdk_requirement: String,
    /// Module name of the generated entry file (`verifier.py`).
    pub entry_module: String,
    /// Format version marker written into the manifest.
    pub format_version: String,
    /// Add detected external imports to the requirements manifest.
    pub include_detected_packages: bool,
    /// Write a `generated_at` timestamp into the manifest.
    pub embed_timestamp: bool,
    /// Import name → distribution name, for packages whose names differ.
    pub package_aliases: BTreeMap<String, String>,
}

impl Default for BundlerConfig {
    fn default() -> Self {
        let package_aliases = [
            ("PIL", "Pillow"),
            ("bs4", "beautifulsoup4"),
            ("cv2", "opencv-python"),
            ("dateutil", "python-dateutil"),
            ("sklearn", "scikit-learn"),
            ("yaml", "PyYAML"),
        ]
        .into_iter()
        .map(|(module, dist)| (module.to_string(), dist.to_string()))
        .collect();

        Self {
            sdk_module: "fleet".to_string(),
            sdk_requirement: "fleet-python".to_string(),
            entry_module: "verifier".to_string(),
            format_version: "1.0".to_string(),
            include_detected_packages: true,
            embed_timestamp: false,
            package_aliases,
        }
    }
}

impl BundlerConfig {
    /// Parse a TOML document, falling back to defaults for missing keys.
    pub fn from_toml_str(text: &str) -> Result<Self, BundleError> {
        toml::from_str(text)
            .map_err(|e| BundleError::Project(format!("invalid bundler config: {e}")))
    }

    /// Distribution name for a detected top-level import.
    pub fn distribution_for(&self, module: &str) -> String {
        self.package_aliases
            .get(module)
            .cloned()
            .unwrap_or_else(|| module.to_string())
    }

    /// File name of the entry module inside the archive.
    pub fn entry_file(&self) -> String {
        format!("{}.py", self.entry_module)
    }
}

/// HTTP client settings for one remote execution service.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Base URL of the instance (e.g. `https://host/instance-id`).
    pub base_url: String,
    /// Bearer token sent with every request, if set.
    pub api_key: Option<String>,
    /// Execution timeout forwarded to the remote, in seconds.
    pub remote_timeout_secs: u64,
    /// Client-side HTTP timeout, in seconds.
    pub http_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            api_key: None,
            remote_timeout_secs: 30,
            http_timeout_secs: 120,
        }
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }

    pub fn from_toml_str(text: &str) -> Result<Self, BundleError> {
        toml::from_str(text)
            .map_err(|e| BundleError::Project(format!("invalid client config: {e}")))
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }
}
