//! Bundle Cache — process-local, content-addressed, single-flight.
//!
//! One `tokio::sync::OnceCell` per key: the first caller builds, every
//! concurrent caller for the same key awaits that build. A failed build
//! leaves the cell empty so the next caller retries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::OnceCell;

use super::Bundle;
use crate::definition::{VerifierDefinition, VerifierId};
use crate::error::BundleResult;

/// Cache key: verifier id plus content hashes of everything that shapes
/// the bundle. Timestamps never participate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BundleKey {
    pub verifier_id: VerifierId,
    pub source_hash: String,
    pub requirements_hash: String,
}

impl BundleKey {
    pub fn for_definition(definition: &VerifierDefinition) -> Self {
        let mut source = blake3::Hasher::new();
        source.update(definition.function_name().as_bytes());
        source.update(b"\0");
        source.update(definition.source().as_bytes());
        source.update(b"\0");
        source.update(definition.module().unwrap_or("").as_bytes());

        let mut requirements = blake3::Hasher::new();
        for requirement in definition.requirements() {
            requirements.update(requirement.as_str().as_bytes());
            requirements.update(b"\n");
        }

        Self {
            verifier_id: definition.id(),
            source_hash: source.finalize().to_hex().to_string(),
            requirements_hash: requirements.finalize().to_hex().to_string(),
        }
    }
}

type Slot = Arc<OnceCell<Arc<Bundle>>>;

#[derive(Default)]
struct CacheInner {
    slots: Mutex<HashMap<BundleKey, Slot>>,
    builds: AtomicUsize,
}

/// Shared handle; clones see the same entries.
#[derive(Clone, Default)]
pub struct BundleCache {
    inner: Arc<CacheInner>,
}

impl std::fmt::Debug for BundleCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BundleCache")
            .field("entries", &self.len())
            .field("builds", &self.builds())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl BundleCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached bundle for `key`, building it at most once.
    pub async fn get_or_build<F>(&self, key: BundleKey, build: F) -> BundleResult<Arc<Bundle>>
    where
        F: FnOnce() -> BundleResult<Bundle>,
    {
        let slot = {
            let mut slots = lock(&self.inner.slots);
            slots.entry(key).or_default().clone()
        };
        let bundle = slot
            .get_or_try_init(|| async {
                self.inner.builds.fetch_add(1, Ordering::SeqCst);
                build().map(Arc::new)
            })
            .await?;
        Ok(bundle.clone())
    }

    pub fn get(&self, key: &BundleKey) -> Option<Arc<Bundle>> {
        lock(&self.inner.slots)
            .get(key)
            .and_then(|slot| slot.get().cloned())
    }

    /// Number of built bundles held.
    pub fn len(&self) -> usize {
        lock(&self.inner.slots)
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total build attempts since creation.
    pub fn builds(&self) -> usize {
        self.inner.builds.load(Ordering::SeqCst)
    }

    /// Drop every bundle of one verifier.
    pub fn invalidate(&self, verifier_id: VerifierId) {
        lock(&self.inner.slots).retain(|key, _| key.verifier_id != verifier_id);
    }

    pub fn clear(&self) {
        lock(&self.inner.slots).clear();
    }
}
