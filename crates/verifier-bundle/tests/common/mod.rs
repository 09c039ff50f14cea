//! Shared fixtures for the integration tests: an in-process remote that
//! remembers loaded verifiers, and small project builders.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use verifier_bundle::{
    read_archive, Bundler, BundlerConfig, DeliveryCache, ExecutionRequest, ProjectIndex,
    RemoteError, RemoteExecutor, RemoteTarget, RequestKind, TargetHandle, VerifierId,
};

/// One request as the remote saw it.
#[derive(Debug, Clone)]
pub struct Recorded {
    pub kind: RequestKind,
    pub verifier_id: VerifierId,
    /// Archive contents of a full-bundle request
    pub files: Option<BTreeMap<String, String>>,
}

/// Behaves like an execution service: a full bundle loads the verifier,
/// a by-reference call succeeds only for loaded verifiers.
#[derive(Default)]
pub struct ScriptedExecutor {
    loaded: Mutex<HashSet<VerifierId>>,
    requests: Mutex<Vec<Recorded>>,
    failures: Mutex<VecDeque<RemoteError>>,
    transfer_delay: Mutex<Option<Duration>>,
}

impl ScriptedExecutor {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_transfer_delay(delay: Duration) -> Arc<Self> {
        let executor = Self::default();
        *executor.transfer_delay.lock().unwrap() = Some(delay);
        Arc::new(executor)
    }

    pub fn set_transfer_delay(&self, delay: Option<Duration>) {
        *self.transfer_delay.lock().unwrap() = delay;
    }

    /// Simulate a restarted environment that dropped a verifier.
    pub fn forget(&self, verifier_id: VerifierId) {
        self.loaded.lock().unwrap().remove(&verifier_id);
    }

    /// Answer the next request with `error`. A full bundle answered with an
    /// execution error still leaves the verifier loaded.
    pub fn fail_next(&self, error: RemoteError) {
        self.failures.lock().unwrap().push_back(error);
    }

    pub fn requests(&self) -> Vec<Recorded> {
        self.requests.lock().unwrap().clone()
    }

    pub fn kinds(&self) -> Vec<RequestKind> {
        self.requests().into_iter().map(|r| r.kind).collect()
    }

    pub fn full_transfers(&self, verifier_id: VerifierId) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.kind == RequestKind::FullBundle && r.verifier_id == verifier_id)
            .count()
    }
}

#[async_trait]
impl RemoteExecutor for ScriptedExecutor {
    async fn execute(&self, request: &ExecutionRequest) -> Result<Value, RemoteError> {
        let verifier_id = request.verifier_id();
        let files = request
            .bundle()
            .map(|bundle| read_archive(bundle.archive()).unwrap());
        self.requests.lock().unwrap().push(Recorded {
            kind: request.kind(),
            verifier_id,
            files,
        });

        let delay = *self.transfer_delay.lock().unwrap();
        if request.kind() == RequestKind::FullBundle {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
        }

        let failure = self.failures.lock().unwrap().pop_front();
        if let Some(error) = failure {
            if request.kind() == RequestKind::FullBundle && error.is_acknowledged() {
                self.loaded.lock().unwrap().insert(verifier_id);
            }
            return Err(error);
        }

        match request {
            ExecutionRequest::FullBundle { .. } => {
                self.loaded.lock().unwrap().insert(verifier_id);
            }
            ExecutionRequest::ByReference { .. } => {
                if !self.loaded.lock().unwrap().contains(&verifier_id) {
                    return Err(RemoteError::UnknownVerifier {
                        verifier_id: verifier_id.to_string(),
                        message: "Verifier not found".to_string(),
                    });
                }
            }
        }
        Ok(json!({ "score": 1.0, "args": request.call().args }))
    }
}

pub fn target(name: &str, executor: &Arc<ScriptedExecutor>) -> RemoteTarget {
    RemoteTarget::new(TargetHandle::new(name), executor.clone())
}

pub fn delivery(project: ProjectIndex) -> DeliveryCache {
    DeliveryCache::new(Arc::new(Bundler::new(project, BundlerConfig::default())))
}

pub fn transmission_error() -> RemoteError {
    RemoteError::Transmission("connection reset by peer".to_string())
}

/// Install a test subscriber once; honours `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// `grading.checks.check` calls `a` → `b` → `c` across two helper modules;
/// `d` is unused.
pub const GRADING_PROJECT: &[(&str, &str)] = &[
    ("grading/__init__.py", ""),
    (
        "grading/checks.py",
        "from grading.helpers.chain import a\n\n\ndef check(env):\n    return a(env)\n",
    ),
    ("grading/helpers/__init__.py", ""),
    (
        "grading/helpers/chain.py",
        "from .leaf import c\n\n\ndef a(x):\n    return b(x)\n\n\ndef b(x):\n    return c(x)\n\n\ndef d(x):\n    return -1\n",
    ),
    ("grading/helpers/leaf.py", "def c(x):\n    return 1.0\n"),
];
