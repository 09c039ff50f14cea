//! Delivery Cache — decides per invocation whether a target gets the full
//! bundle or only the verifier id.
//!
//! State lives per (verifier id, target handle) pair:
//!
//! ```text
//!            full bundle acknowledged
//!   NotSent ─────────────────────────► Sent
//!      ▲                                 │
//!      └──── remote reports unknown ─────┘  (evict, re-send once)
//! ```
//!
//! Each pair has its own async mutex. The full-bundle path holds it across
//! bundling and transfer, so concurrent callers queue behind the first
//! transfer and then observe `Sent`. The by-reference path releases it
//! before touching the network. Unrelated pairs never contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::bundle::Bundler;
use crate::config::ClientConfig;
use crate::definition::{VerifierDefinition, VerifierId};
use crate::error::{BundleResult, DeliveryError, DeliveryResult, RemoteError};
use crate::protocol::{CallArgs, ExecutionRequest, HttpRemoteClient, RemoteExecutor, RequestKind};

/// Stable identity of a remote execution endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetHandle(String);

impl TargetHandle {
    /// An explicit, caller-chosen identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive a handle from a base URL: scheme, lower-cased host, explicit
    /// port, path without trailing slash.
    pub fn from_address(address: &str) -> Result<Self, RemoteError> {
        let invalid = |reason: &str| RemoteError::InvalidAddress(format!("{address}: {reason}"));
        let url = reqwest::Url::parse(address.trim()).map_err(|e| invalid(&e.to_string()))?;
        let host = url.host_str().ok_or_else(|| invalid("missing host"))?;
        let port = url
            .port_or_known_default()
            .ok_or_else(|| invalid("missing port"))?;
        let path = url.path().trim_end_matches('/');
        Ok(Self(format!(
            "{}://{}:{}{}",
            url.scheme(),
            host.to_ascii_lowercase(),
            port,
            path
        )))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for TargetHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A target handle plus the executor that reaches it.
#[derive(Clone)]
pub struct RemoteTarget {
    handle: TargetHandle,
    executor: Arc<dyn RemoteExecutor>,
}

impl RemoteTarget {
    pub fn new(handle: TargetHandle, executor: Arc<dyn RemoteExecutor>) -> Self {
        Self { handle, executor }
    }

    /// HTTP target whose handle is derived from the configured base URL.
    pub fn http(config: ClientConfig) -> Result<Self, RemoteError> {
        let handle = TargetHandle::from_address(&config.base_url)?;
        let executor = Arc::new(HttpRemoteClient::new(config)?);
        Ok(Self::new(handle, executor))
    }

    pub fn handle(&self) -> &TargetHandle {
        &self.handle
    }

    pub fn executor(&self) -> &dyn RemoteExecutor {
        self.executor.as_ref()
    }
}

impl std::fmt::Debug for RemoteTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteTarget")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    NotSent,
    Sent,
}

#[derive(Debug)]
struct DeliveryEntry {
    state: DeliveryState,
    /// Bumped on every acknowledged full-bundle transfer
    generation: u64,
}

impl Default for DeliveryEntry {
    fn default() -> Self {
        Self {
            state: DeliveryState::NotSent,
            generation: 0,
        }
    }
}

/// Result of one `deliver` invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryOutcome {
    pub value: Value,
    /// Request shape that produced `value`
    pub kind: RequestKind,
    /// An unknown-verifier report was recovered by re-sending the bundle
    pub recovered: bool,
}

type EntryKey = (VerifierId, TargetHandle);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct DeliveryCache {
    bundler: Arc<Bundler>,
    entries: Mutex<HashMap<EntryKey, Arc<AsyncMutex<DeliveryEntry>>>>,
}

impl DeliveryCache {
    pub fn new(bundler: Arc<Bundler>) -> Self {
        Self {
            bundler,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn bundler(&self) -> &Bundler {
        &self.bundler
    }

    /// Number of (verifier, target) pairs seen.
    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry(&self, key: &EntryKey) -> Arc<AsyncMutex<DeliveryEntry>> {
        lock(&self.entries).entry(key.clone()).or_default().clone()
    }

    /// Current state of a pair; waits for an in-flight transfer to settle.
    pub async fn state(&self, verifier_id: VerifierId, target: &TargetHandle) -> DeliveryState {
        let entry = lock(&self.entries)
            .get(&(verifier_id, target.clone()))
            .cloned();
        match entry {
            Some(entry) => entry.lock().await.state,
            None => DeliveryState::NotSent,
        }
    }

    /// Forget that `target` holds this verifier.
    pub async fn evict(&self, verifier_id: VerifierId, target: &TargetHandle) {
        let entry = lock(&self.entries)
            .get(&(verifier_id, target.clone()))
            .cloned();
        if let Some(entry) = entry {
            entry.lock().await.state = DeliveryState::NotSent;
        }
    }

    /// Execute `definition` on `target`, sending the bundle only when the
    /// target does not hold it yet.
    pub async fn deliver(
        &self,
        definition: &VerifierDefinition,
        target: &RemoteTarget,
        call: CallArgs,
    ) -> DeliveryResult<DeliveryOutcome> {
        let key = (definition.id(), target.handle().clone());
        let entry = self.entry(&key);

        let (kind, generation, result) = self
            .attempt(definition, target, &entry, &call, None)
            .await?;
        let err = match result {
            Ok(value) => {
                return Ok(DeliveryOutcome {
                    value,
                    kind,
                    recovered: false,
                })
            }
            Err(err) if err.is_unknown_verifier() => err,
            Err(err) => return Err(err.into()),
        };

        warn!(
            verifier = %definition.name(),
            target = %target.handle(),
            kind = %kind,
            error = %err,
            "Remote does not know verifier; evicting and re-sending bundle"
        );
        {
            let mut guard = entry.lock().await;
            // a newer transfer already replaced the one the remote lost
            if guard.generation == generation {
                guard.state = DeliveryState::NotSent;
            }
        }

        let (kind, _, result) = self
            .attempt(definition, target, &entry, &call, Some(generation))
            .await?;
        match result {
            Ok(value) => Ok(DeliveryOutcome {
                value,
                kind,
                recovered: true,
            }),
            Err(err) if err.is_unknown_verifier() => Err(DeliveryError::PersistentUnknownVerifier {
                verifier_id: definition.id().to_string(),
                target: target.handle().to_string(),
            }),
            Err(err) => Err(err.into()),
        }
    }

    /// One request. By reference when the pair is `Sent` (and, on a retry,
    /// only if a transfer newer than `after` happened), full bundle otherwise.
    async fn attempt(
        &self,
        definition: &VerifierDefinition,
        target: &RemoteTarget,
        entry: &AsyncMutex<DeliveryEntry>,
        call: &CallArgs,
        after: Option<u64>,
    ) -> BundleResult<(RequestKind, u64, Result<Value, RemoteError>)> {
        let mut guard = entry.lock().await;

        let newer = after.map_or(true, |generation| guard.generation > generation);
        if guard.state == DeliveryState::Sent && newer {
            let generation = guard.generation;
            drop(guard);
            debug!(
                verifier = %definition.name(),
                target = %target.handle(),
                "Executing verifier by reference"
            );
            let request = ExecutionRequest::by_reference(definition.id(), call.clone());
            let result = target.executor().execute(&request).await;
            return Ok((RequestKind::ByReference, generation, result));
        }

        let bundle = self.bundler.bundle(definition).await?;
        info!(
            verifier = %definition.name(),
            target = %target.handle(),
            bundle = %bundle.short_digest(),
            bytes = bundle.archive().len(),
            "Sending full bundle"
        );
        let request = ExecutionRequest::full_bundle(bundle, call.clone());
        let result = target.executor().execute(&request).await;

        let acknowledged = match &result {
            Ok(_) => true,
            Err(err) => err.is_acknowledged(),
        };
        if acknowledged {
            guard.state = DeliveryState::Sent;
            guard.generation += 1;
        }
        Ok((RequestKind::FullBundle, guard.generation, result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BundlerConfig;
    use crate::project::ProjectIndex;
    use crate::protocol::MockRemoteExecutor;
    use mockall::Sequence;
    use serde_json::json;

    fn cache() -> DeliveryCache {
        let bundler = Bundler::new(ProjectIndex::empty(), BundlerConfig::default());
        DeliveryCache::new(Arc::new(bundler))
    }

    fn definition() -> VerifierDefinition {
        VerifierDefinition::builder("f", "def f(env):\n    return 1.0\n")
            .requirement("numpy")
            .build()
    }

    fn expect(
        mock: &mut MockRemoteExecutor,
        seq: &mut Sequence,
        kind: RequestKind,
        result: Result<Value, RemoteError>,
    ) {
        let result = std::sync::Mutex::new(Some(result));
        mock.expect_execute()
            .times(1)
            .in_sequence(seq)
            .withf(move |request| request.kind() == kind)
            .returning(move |_| {
                result
                    .lock()
                    .unwrap()
                    .take()
                    .unwrap_or_else(|| Ok(Value::Null))
            });
    }

    fn unknown() -> Result<Value, RemoteError> {
        Err(RemoteError::UnknownVerifier {
            verifier_id: "v".into(),
            message: "Verifier not found".into(),
        })
    }

    #[test]
    fn test_target_handle_normalization() {
        let a = TargetHandle::from_address("https://ENV.example.com/inst-1/").unwrap();
        let b = TargetHandle::from_address("https://env.example.com:443/inst-1").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "https://env.example.com:443/inst-1");

        let other = TargetHandle::from_address("http://env.example.com/inst-1").unwrap();
        assert_ne!(a, other);
        assert!(TargetHandle::from_address("::nope").is_err());
    }

    #[tokio::test]
    async fn test_full_then_by_reference() {
        let mut mock = MockRemoteExecutor::new();
        let mut seq = Sequence::new();
        expect(&mut mock, &mut seq, RequestKind::FullBundle, Ok(json!(1.0)));
        expect(&mut mock, &mut seq, RequestKind::ByReference, Ok(json!(0.5)));

        let cache = cache();
        let target = RemoteTarget::new(TargetHandle::new("env-a"), Arc::new(mock));
        let def = definition();

        let first = cache.deliver(&def, &target, CallArgs::new()).await.unwrap();
        assert_eq!(first.kind, RequestKind::FullBundle);
        assert_eq!(first.value, json!(1.0));
        assert_eq!(cache.state(def.id(), target.handle()).await, DeliveryState::Sent);

        let second = cache.deliver(&def, &target, CallArgs::new()).await.unwrap();
        assert_eq!(second.kind, RequestKind::ByReference);
        assert!(!second.recovered);
    }

    #[tokio::test]
    async fn test_unknown_verifier_recovers_once() {
        let mut mock = MockRemoteExecutor::new();
        let mut seq = Sequence::new();
        expect(&mut mock, &mut seq, RequestKind::FullBundle, Ok(json!(1.0)));
        expect(&mut mock, &mut seq, RequestKind::ByReference, unknown());
        expect(&mut mock, &mut seq, RequestKind::FullBundle, Ok(json!(2.0)));

        let cache = cache();
        let target = RemoteTarget::new(TargetHandle::new("env-a"), Arc::new(mock));
        let def = definition();

        cache.deliver(&def, &target, CallArgs::new()).await.unwrap();
        let outcome = cache.deliver(&def, &target, CallArgs::new()).await.unwrap();
        assert_eq!(outcome.kind, RequestKind::FullBundle);
        assert!(outcome.recovered);
        assert_eq!(outcome.value, json!(2.0));
    }

    #[tokio::test]
    async fn test_persistent_unknown_is_surfaced() {
        let mut mock = MockRemoteExecutor::new();
        let mut seq = Sequence::new();
        expect(&mut mock, &mut seq, RequestKind::FullBundle, unknown());
        expect(&mut mock, &mut seq, RequestKind::FullBundle, unknown());

        let cache = cache();
        let target = RemoteTarget::new(TargetHandle::new("env-a"), Arc::new(mock));
        let def = definition();

        let err = cache.deliver(&def, &target, CallArgs::new()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::PersistentUnknownVerifier { .. }));
        assert_eq!(cache.state(def.id(), target.handle()).await, DeliveryState::NotSent);
    }

    #[tokio::test]
    async fn test_execution_error_still_marks_sent() {
        let mut mock = MockRemoteExecutor::new();
        let mut seq = Sequence::new();
        expect(
            &mut mock,
            &mut seq,
            RequestKind::FullBundle,
            Err(RemoteError::Execution {
                error_type: "TypeError".into(),
                message: "f() takes 1 positional argument".into(),
                traceback: None,
            }),
        );

        let cache = cache();
        let target = RemoteTarget::new(TargetHandle::new("env-a"), Arc::new(mock));
        let def = definition();

        let err = cache.deliver(&def, &target, CallArgs::new().arg(1).arg(2)).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Remote(RemoteError::Execution { .. })));
        assert_eq!(cache.state(def.id(), target.handle()).await, DeliveryState::Sent);
    }

    #[tokio::test]
    async fn test_bundle_error_sends_nothing() {
        let mock = MockRemoteExecutor::new();
        let cache = cache();
        let target = RemoteTarget::new(TargetHandle::new("env-a"), Arc::new(mock));
        let def = VerifierDefinition::builder("f", "def f(env):\n    return helper(env)\n").build();

        let err = cache.deliver(&def, &target, CallArgs::new()).await.unwrap_err();
        assert!(matches!(err, DeliveryError::Bundle(_)));
    }
}
