//! Lock adapter for the redirection host
//!
//! The redirection host is threading-agnostic: it asks its embedder for
//! opaque locks through an alloc/lock/unlock/free contract and uses them to
//! serialize its internal buffers between the controlling task and the USB
//! event pump thread. Lock and unlock are separate calls in that contract,
//! so the lock cannot be a plain `MutexGuard`; it is a binary lock built
//! from a `Mutex<bool>` and a `Condvar`.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use tracing::{trace, warn};

/// Non-reentrant lock with explicit lock/unlock calls
#[derive(Debug, Default)]
pub struct HostLock {
    /// Whether the lock is currently held
    locked: Mutex<bool>,
    /// Signalled on every unlock
    released: Condvar,
}

impl HostLock {
    /// Create a new, unlocked lock
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until the lock is acquired
    ///
    /// Locking twice from the same thread without an unlock in between
    /// deadlocks, matching the host's expectations of a plain mutex.
    pub fn lock(&self) {
        let mut locked = self.locked.lock().unwrap_or_else(PoisonError::into_inner);
        while *locked {
            locked = self
                .released
                .wait(locked)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *locked = true;
    }

    /// Acquire the lock if it is free
    pub fn try_lock(&self) -> bool {
        let mut locked = self.locked.lock().unwrap_or_else(PoisonError::into_inner);
        if *locked {
            false
        } else {
            *locked = true;
            true
        }
    }

    /// Release the lock
    pub fn unlock(&self) {
        let mut locked = self.locked.lock().unwrap_or_else(PoisonError::into_inner);
        if !*locked {
            warn!("Redirection host released a lock it did not hold");
            return;
        }
        *locked = false;
        drop(locked);
        self.released.notify_one();
    }

    /// Whether the lock is currently held by anyone
    pub fn is_locked(&self) -> bool {
        *self.locked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Acquire the lock for the lifetime of the returned guard
    pub fn guard(&self) -> HostLockGuard<'_> {
        self.lock();
        HostLockGuard { lock: self }
    }
}

/// RAII guard returned by [`HostLock::guard`]
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct HostLockGuard<'a> {
    lock: &'a HostLock,
}

impl Drop for HostLockGuard<'_> {
    fn drop(&mut self) {
        self.lock.unlock();
    }
}

/// Lock provider handed to the redirection host at open time
#[derive(Debug, Clone, Copy, Default)]
pub struct LockAdapter;

impl LockAdapter {
    /// Allocate a new lock
    pub fn alloc(&self) -> Arc<HostLock> {
        trace!("Allocating redirection host lock");
        Arc::new(HostLock::new())
    }

    /// Acquire a lock previously returned by [`LockAdapter::alloc`]
    pub fn lock(&self, lock: &HostLock) {
        lock.lock();
    }

    /// Release a lock previously acquired with [`LockAdapter::lock`]
    pub fn unlock(&self, lock: &HostLock) {
        lock.unlock();
    }

    /// Free a lock
    pub fn free(&self, lock: Arc<HostLock>) {
        if lock.is_locked() {
            warn!("Redirection host freed a lock that is still held");
        }
        trace!("Freeing redirection host lock");
        drop(lock);
    }
}
