//! Verifier Bundle Library
//!
//! Ships user-authored Python verifier functions to remote execution
//! environments without shipping the whole project they live in.
//!
//! This library provides:
//! - Static dependency analysis of a verifier over a Python project (tree-sitter AST)
//! - Tree-shaken extraction of only the reachable local definitions
//! - Deterministic zip bundles with manifest, requirements and entry module
//! - A content-addressed, single-flight bundle cache
//! - Per-target delivery tracking: full bundle once, then by reference,
//!   with one automatic re-send when a target forgets a verifier
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use verifier_bundle::{
//!     Bundler, BundlerConfig, CallArgs, ClientConfig, DeliveryCache, ProjectIndex,
//!     RemoteTarget, VerifierDefinition,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let project = ProjectIndex::load("./my_project")?;
//! let bundler = Arc::new(Bundler::new(project, BundlerConfig::default()));
//! let delivery = DeliveryCache::new(bundler);
//!
//! let definition = VerifierDefinition::builder("check_answer", "def check_answer(env):\n    return 1.0\n")
//!     .module("verifiers.math")
//!     .requirement("numpy==1.26.4")
//!     .build();
//! let target = RemoteTarget::http(ClientConfig::new("https://env.example.com"))?;
//!
//! let outcome = delivery.deliver(&definition, &target, CallArgs::new().arg(42)).await?;
//! println!("score = {}", outcome.value);
//! # Ok(())
//! # }
//! ```

pub mod analyzer;
pub mod bundle;
pub mod config;
pub mod definition;
pub mod delivery;
pub mod error;
pub mod extractor;
pub mod project;
pub mod protocol;

// Re-export key bundling types
pub use analyzer::{DependencyAnalyzer, DependencyClosure, GraphNode, LocalItem};
pub use bundle::{read_archive, Bundle, BundleCache, BundleKey, BundleManifest, Bundler};
pub use extractor::{CodeExtractor, ExtractedTree};
pub use project::ProjectIndex;

// Re-export definition and config types
pub use config::{BundlerConfig, ClientConfig};
pub use definition::{Requirement, VerifierDefinition, VerifierId};

// Re-export key delivery types
pub use delivery::{DeliveryCache, DeliveryOutcome, DeliveryState, RemoteTarget, TargetHandle};
pub use protocol::{CallArgs, ExecutionRequest, HttpRemoteClient, RemoteExecutor, RequestKind};

pub use error::{BundleError, BundleResult, DeliveryError, DeliveryResult, RemoteError};
