//! Coarse-grained table locks.
//!
//! Locks are an addition to MVCC, not a replacement: a transaction that
//! holds no locks still gets snapshot isolation. Locks serialize schema
//! changes and let callers enforce stricter orderings when they need them.
//!
//! # Compatibility
//!
//! ```text
//!            │ Shared │ Exclusive │
//! ───────────┼────────┼───────────┤
//!  Shared    │   ✓    │     ✗     │
//!  Exclusive │   ✗    │     ✗     │
//! ```
//!
//! Locks held by the requesting owner never block it.

use crate::error::{CoreError, CoreResult};
use crate::types::{TableId, TransactionId};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace};

/// Lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    /// Read lock; any number of owners.
    Shared,
    /// Write lock; a single owner.
    Exclusive,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Shared => write!(f, "S"),
            Self::Exclusive => write!(f, "X"),
        }
    }
}

/// Who holds a lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockOwner {
    /// A transaction; released when it closes.
    Transaction(TransactionId),
    /// A caller outside any transaction.
    Session(u64),
}

#[derive(Debug, Default)]
struct ResourceLock {
    shared: HashMap<LockOwner, usize>,
    exclusive: Option<(LockOwner, usize)>,
}

impl ResourceLock {
    fn can_grant(&self, owner: LockOwner, mode: LockMode) -> bool {
        let exclusive_ok = self.exclusive.map_or(true, |(holder, _)| holder == owner);
        match mode {
            LockMode::Shared => exclusive_ok,
            LockMode::Exclusive => exclusive_ok && self.shared.keys().all(|&h| h == owner),
        }
    }

    fn grant(&mut self, owner: LockOwner, mode: LockMode) {
        match mode {
            LockMode::Shared => *self.shared.entry(owner).or_insert(0) += 1,
            LockMode::Exclusive => match &mut self.exclusive {
                Some((_, count)) => *count += 1,
                None => self.exclusive = Some((owner, 1)),
            },
        }
    }

    fn release(&mut self, owner: LockOwner, mode: LockMode) {
        match mode {
            LockMode::Shared => {
                if let Some(count) = self.shared.get_mut(&owner) {
                    *count -= 1;
                    if *count == 0 {
                        self.shared.remove(&owner);
                    }
                }
            }
            LockMode::Exclusive => {
                if let Some((holder, count)) = &mut self.exclusive {
                    if *holder == owner {
                        *count -= 1;
                        if *count == 0 {
                            self.exclusive = None;
                        }
                    }
                }
            }
        }
    }

    fn is_free(&self) -> bool {
        self.shared.is_empty() && self.exclusive.is_none()
    }
}

#[derive(Debug)]
struct LockerInner {
    table: Mutex<HashMap<TableId, ResourceLock>>,
    released: Condvar,
    timeout: Duration,
    next_session: AtomicU64,
}

impl LockerInner {
    fn release(&self, owner: LockOwner, resources: &[TableId], mode: LockMode) {
        let mut table = self.table.lock();
        for resource in resources {
            if let Some(lock) = table.get_mut(resource) {
                lock.release(owner, mode);
                if lock.is_free() {
                    table.remove(resource);
                }
            }
        }
        drop(table);
        self.released.notify_all();
        trace!(?owner, ?resources, %mode, "locks released");
    }
}

/// Table lock manager shared by every session of a conglomerate.
///
/// A request names a set of tables and is granted all at once or not at
/// all, so a waiter never holds part of what it asked for.
#[derive(Debug, Clone)]
pub struct Locker {
    inner: Arc<LockerInner>,
}

impl Locker {
    /// Creates a locker whose `lock` calls wait at most `timeout`.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(LockerInner {
                table: Mutex::new(HashMap::new()),
                released: Condvar::new(),
                timeout,
                next_session: AtomicU64::new(1),
            }),
        }
    }

    /// Returns the default wait timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    fn session(&self) -> LockOwner {
        LockOwner::Session(self.inner.next_session.fetch_add(1, Ordering::Relaxed))
    }

    /// Locks `resources` for a fresh session owner, waiting up to the
    /// configured timeout.
    ///
    /// # Errors
    ///
    /// Returns `LockTimeout` if the locks could not all be granted in time.
    /// Nothing is held in that case.
    pub fn lock(&self, resources: &[TableId], mode: LockMode) -> CoreResult<LockHandle> {
        self.lock_for(self.session(), resources, mode, self.inner.timeout)
    }

    /// Locks `resources` without waiting.
    ///
    /// Returns `None` if any resource is held incompatibly.
    #[must_use]
    pub fn try_lock(&self, resources: &[TableId], mode: LockMode) -> Option<LockHandle> {
        let owner = self.session();
        let resources = normalize(resources);
        let mut table = self.inner.table.lock();
        if !Self::grantable(&table, owner, &resources, mode) {
            return None;
        }
        Self::grant_all(&mut table, owner, &resources, mode);
        Some(self.handle(owner, resources, mode))
    }

    /// Locks `resources` on behalf of `owner`, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// Returns `LockTimeout` if the locks could not all be granted in time.
    pub fn lock_for(
        &self,
        owner: LockOwner,
        resources: &[TableId],
        mode: LockMode,
        timeout: Duration,
    ) -> CoreResult<LockHandle> {
        let resources = normalize(resources);
        let deadline = Instant::now() + timeout;
        let mut table = self.inner.table.lock();

        while !Self::grantable(&table, owner, &resources, mode) {
            if self.inner.released.wait_until(&mut table, deadline).timed_out()
                && !Self::grantable(&table, owner, &resources, mode)
            {
                debug!(?owner, ?resources, %mode, "lock wait timed out");
                return Err(CoreError::LockTimeout {
                    resources,
                    millis: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
        }

        Self::grant_all(&mut table, owner, &resources, mode);
        drop(table);
        trace!(?owner, ?resources, %mode, "locks granted");
        Ok(self.handle(owner, resources, mode))
    }

    /// Whether any owner holds a lock on `resource`.
    #[must_use]
    pub fn is_locked(&self, resource: TableId) -> bool {
        self.inner.table.lock().contains_key(&resource)
    }

    /// Returns the mode `resource` is held in, exclusive taking precedence.
    #[must_use]
    pub fn held_mode(&self, resource: TableId) -> Option<LockMode> {
        let table = self.inner.table.lock();
        let lock = table.get(&resource)?;
        if lock.exclusive.is_some() {
            Some(LockMode::Exclusive)
        } else if lock.shared.is_empty() {
            None
        } else {
            Some(LockMode::Shared)
        }
    }

    fn grantable(
        table: &HashMap<TableId, ResourceLock>,
        owner: LockOwner,
        resources: &[TableId],
        mode: LockMode,
    ) -> bool {
        resources
            .iter()
            .all(|r| table.get(r).map_or(true, |lock| lock.can_grant(owner, mode)))
    }

    fn grant_all(
        table: &mut HashMap<TableId, ResourceLock>,
        owner: LockOwner,
        resources: &[TableId],
        mode: LockMode,
    ) {
        for resource in resources {
            table.entry(*resource).or_default().grant(owner, mode);
        }
    }

    fn handle(&self, owner: LockOwner, resources: Vec<TableId>, mode: LockMode) -> LockHandle {
        LockHandle {
            inner: Arc::clone(&self.inner),
            owner,
            resources,
            mode,
            released: AtomicBool::new(false),
        }
    }
}

fn normalize(resources: &[TableId]) -> Vec<TableId> {
    let mut resources = resources.to_vec();
    resources.sort_unstable();
    resources.dedup();
    resources
}

/// Locks granted by one request.
///
/// Released exactly once: by [`LockHandle::release`] or on drop.
#[derive(Debug)]
pub struct LockHandle {
    inner: Arc<LockerInner>,
    owner: LockOwner,
    resources: Vec<TableId>,
    mode: LockMode,
    released: AtomicBool,
}

impl LockHandle {
    /// Returns the owner.
    #[must_use]
    pub fn owner(&self) -> LockOwner {
        self.owner
    }

    /// Returns the locked resources, sorted.
    #[must_use]
    pub fn resources(&self) -> &[TableId] {
        &self.resources
    }

    /// Returns the lock mode.
    #[must_use]
    pub fn mode(&self) -> LockMode {
        self.mode
    }

    /// Whether the locks have been released.
    #[must_use]
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Releases the locks. Later calls do nothing.
    pub fn release(&self) {
        if !self.released.swap(true, Ordering::AcqRel) {
            self.inner.release(self.owner, &self.resources, self.mode);
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        self.release();
    }
}
