use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use strata_substrate::{Mutation, Substrate};
use strata_types::Urn;
use tracing::{debug, warn};

use crate::cache::ObjectCache;
use crate::error::StoreResult;

struct PoolInner {
    substrate: Arc<dyn Substrate>,
    cache: Arc<ObjectCache>,
    pending: Mutex<Vec<Mutation>>,
}

/// Caller-managed batch of substrate writes.
///
/// Objects created in a pool stage their flushes here; nothing reaches the
/// substrate until [`MutationPool::flush`]. Cheap to clone: clones share the
/// same pending batch.
#[derive(Clone)]
pub struct MutationPool {
    inner: Arc<PoolInner>,
}

impl MutationPool {
    pub(crate) fn new(substrate: Arc<dyn Substrate>, cache: Arc<ObjectCache>) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                substrate,
                cache,
                pending: Mutex::new(Vec::new()),
            }),
        }
    }

    pub(crate) fn stage(&self, mutations: Vec<Mutation>) {
        self.inner
            .pending
            .lock()
            .expect("lock poisoned")
            .extend(mutations);
    }

    /// Number of staged mutations.
    pub fn len(&self) -> usize {
        self.inner.pending.lock().expect("lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write every staged mutation in one batch.
    ///
    /// On failure the batch stays staged and the error is returned. On
    /// success every touched URN is dropped from the object cache, so the
    /// writes are visible to the next open.
    pub fn flush(&self) -> StoreResult<usize> {
        let batch = std::mem::take(&mut *self.inner.pending.lock().expect("lock poisoned"));
        if batch.is_empty() {
            return Ok(0);
        }

        if let Err(e) = self.inner.substrate.apply(&batch) {
            warn!(count = batch.len(), error = %e, "mutation pool flush failed");
            let mut pending = self.inner.pending.lock().expect("lock poisoned");
            let staged_since = std::mem::replace(&mut *pending, batch);
            pending.extend(staged_since);
            return Err(e.into());
        }

        let touched: BTreeSet<&Urn> = batch.iter().map(Mutation::urn).collect();
        for urn in &touched {
            self.inner.cache.invalidate(urn);
        }
        debug!(count = batch.len(), objects = touched.len(), "mutation pool flushed");
        Ok(batch.len())
    }
}

impl std::fmt::Debug for MutationPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationPool")
            .field("pending", &self.len())
            .finish()
    }
}
