//! Lease-based pessimistic locks over substrate lock rows.
//!
//! A lock on a URN is a lock row `(identity, acquired_at, lease)`. It is
//! valid until `now > acquired_at + lease`; after that it is abandoned and
//! any identity may take it without an explicit release. Lease arithmetic
//! always uses the store [`Clock`]; the blocking acquisition timeout uses the
//! monotonic [`Instant`] so a frozen clock cannot stall the poll loop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use strata_substrate::Substrate;
use strata_types::{Clock, Urn};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};

/// Parameters of one acquisition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LockOptions {
    pub lease: Duration,
    pub blocking: bool,
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl LockOptions {
    /// Non-blocking acquisition with the configured lease.
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            lease: config.lock_lease,
            blocking: false,
            poll_interval: config.lock_poll_interval,
            timeout: config.lock_timeout,
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Poll until the lock frees up or `timeout` elapses.
    pub fn blocking(mut self, timeout: Duration) -> Self {
        self.blocking = true;
        self.timeout = timeout;
        self
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }
}

impl Default for LockOptions {
    fn default() -> Self {
        Self::from_config(&StoreConfig::default())
    }
}

/// Acquires and releases lock rows.
///
/// The in-process table records the identity this process holds per URN;
/// it is mutated only while its mutex is held, together with the matching
/// lock-row transition.
pub struct LockManager {
    substrate: Arc<dyn Substrate>,
    clock: Arc<dyn Clock>,
    held: Mutex<HashMap<Urn, String>>,
}

impl LockManager {
    pub fn new(substrate: Arc<dyn Substrate>, clock: Arc<dyn Clock>) -> Self {
        Self {
            substrate,
            clock,
            held: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire the lock on `urn` under a fresh identity.
    pub fn acquire(self: &Arc<Self>, urn: &Urn, options: &LockOptions) -> StoreResult<LockHandle> {
        let identity = Uuid::now_v7().to_string();
        let deadline = Instant::now() + options.timeout;

        loop {
            if self.try_acquire(urn, &identity, options.lease)? {
                debug!(urn = %urn, identity = %identity, lease = ?options.lease, "lock acquired");
                return Ok(LockHandle {
                    manager: Arc::clone(self),
                    urn: urn.clone(),
                    identity,
                    released: false,
                });
            }

            if !options.blocking {
                return Err(StoreError::lock(urn, "already locked"));
            }
            let now = Instant::now();
            if now >= deadline {
                debug!(urn = %urn, timeout = ?options.timeout, "lock acquisition timed out");
                return Err(StoreError::lock(
                    urn,
                    format!("timed out after {:?}", options.timeout),
                ));
            }
            thread::sleep(options.poll_interval.min(deadline - now));
        }
    }

    fn try_acquire(&self, urn: &Urn, identity: &str, lease: Duration) -> StoreResult<bool> {
        let mut held = self.held.lock().expect("lock poisoned");
        let acquired = self
            .substrate
            .acquire_lock_row(urn, identity, lease, self.clock.now())?;
        if acquired {
            held.insert(urn.clone(), identity.to_string());
        }
        Ok(acquired)
    }

    fn release(&self, urn: &Urn, identity: &str) -> StoreResult<bool> {
        let mut held = self.held.lock().expect("lock poisoned");
        if held.get(urn).is_some_and(|id| id == identity) {
            held.remove(urn);
        }
        let released = self.substrate.release_lock_row(urn, identity)?;
        debug!(urn = %urn, identity = %identity, released, "lock released");
        Ok(released)
    }

    /// Remaining lease of `identity` on `urn`; zero if expired or not held.
    fn remaining(&self, urn: &Urn, identity: &str) -> StoreResult<Duration> {
        let now = self.clock.now();
        Ok(match self.substrate.read_lock_row(urn)? {
            Some(row) if row.identity == identity && !row.is_expired(now) => {
                row.expires_at().duration_since(now)
            }
            _ => Duration::ZERO,
        })
    }

    fn is_live(&self, urn: &Urn, identity: &str) -> StoreResult<bool> {
        let now = self.clock.now();
        Ok(self
            .substrate
            .read_lock_row(urn)?
            .is_some_and(|row| row.identity == identity && !row.is_expired(now)))
    }

    /// Returns `true` if this process currently records a lock on `urn`.
    pub fn is_held_locally(&self, urn: &Urn) -> bool {
        self.held.lock().expect("lock poisoned").contains_key(urn)
    }
}

impl std::fmt::Debug for LockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let held = self.held.lock().expect("lock poisoned").len();
        f.debug_struct("LockManager").field("held", &held).finish()
    }
}

/// A held lock. Released on [`LockHandle::release`] or drop.
pub struct LockHandle {
    manager: Arc<LockManager>,
    urn: Urn,
    identity: String,
    released: bool,
}

impl LockHandle {
    /// The locked URN.
    pub fn urn(&self) -> &Urn {
        &self.urn
    }

    /// Fresh identity this holder recorded in the lock row.
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Remaining lease, zero once it has expired or was taken over.
    pub fn check_lease(&self) -> StoreResult<Duration> {
        self.manager.remaining(&self.urn, &self.identity)
    }

    /// Extend the lease to `lease` from now.
    pub fn update_lease(&self, lease: Duration) -> StoreResult<()> {
        if !self.manager.is_live(&self.urn, &self.identity)? {
            warn!(urn = %self.urn, "lease update on expired lock");
            return Err(StoreError::lock(&self.urn, "lease expired"));
        }
        if !self.manager.try_acquire(&self.urn, &self.identity, lease)? {
            return Err(StoreError::lock(&self.urn, "lease taken over"));
        }
        debug!(urn = %self.urn, lease = ?lease, "lease updated");
        Ok(())
    }

    /// Fails with a lock error unless the lease is still held and live.
    pub fn ensure_live(&self) -> StoreResult<()> {
        if self.manager.is_live(&self.urn, &self.identity)? {
            Ok(())
        } else {
            Err(StoreError::lock(&self.urn, "lease expired before write"))
        }
    }

    /// Release the lock. Safe even if the lease already lapsed.
    pub fn release(mut self) -> StoreResult<()> {
        self.released = true;
        self.manager.release(&self.urn, &self.identity).map(|_| ())
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.manager.release(&self.urn, &self.identity) {
            warn!(urn = %self.urn, error = %e, "failed to release lock on drop");
        }
    }
}

impl std::fmt::Debug for LockHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockHandle")
            .field("urn", &self.urn)
            .field("identity", &self.identity)
            .finish()
    }
}
