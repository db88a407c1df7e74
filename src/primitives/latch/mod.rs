//! Hybrid latch: a version counter coupled with a reader-writer lock.
//!
//! Three access modes. Optimistic acquisition is a non-blocking shared
//! attempt; an active writer makes it fail so the caller falls back to a
//! pessimistic (blocking) path. Exclusive guards bump the version counter on
//! release, which is what invalidates stamped capabilities such as the GC
//! dangling pointer.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};

/// A value guarded by a hybrid latch. Guards hold their own handles on the
/// counter and the lock, so they stay valid however long they live.
pub struct HybridLatch<T> {
    version: Arc<AtomicU64>,
    lock: Arc<RwLock<T>>,
}

impl<T> HybridLatch<T> {
    pub fn new(value: T) -> Self {
        Self {
            version: Arc::new(AtomicU64::new(0)),
            lock: Arc::new(RwLock::new(value)),
        }
    }

    /// Current latch generation. Incremented once per exclusive release.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Blocking shared acquisition.
    pub fn read(&self) -> SharedGuard<T> {
        SharedGuard {
            version: Arc::clone(&self.version),
            inner: self.lock.read_arc(),
        }
    }

    /// Non-blocking shared acquisition; `None` when a writer holds the latch.
    pub fn try_read(&self) -> Option<SharedGuard<T>> {
        let inner = self.lock.try_read_arc()?;
        Some(SharedGuard {
            version: Arc::clone(&self.version),
            inner,
        })
    }

    /// Blocking exclusive acquisition. The returned guard bumps the version
    /// counter when dropped.
    pub fn write(&self) -> ExclusiveGuard<T> {
        ExclusiveGuard {
            version: Arc::clone(&self.version),
            inner: self.lock.write_arc(),
        }
    }

    /// Exclusive acquisition that only succeeds if the latch generation still
    /// equals `expected`. A failed probe releases without bumping the
    /// version, so it never invalidates other outstanding capabilities.
    pub fn try_write_if_version(&self, expected: u64) -> Option<ExclusiveGuard<T>> {
        let inner = self.lock.try_write_arc()?;
        if self.version.load(Ordering::Acquire) != expected {
            return None;
        }
        Some(ExclusiveGuard {
            version: Arc::clone(&self.version),
            inner,
        })
    }
}

/// Shared guard. Releasing it leaves the latch generation untouched.
pub struct SharedGuard<T> {
    version: Arc<AtomicU64>,
    inner: ArcRwLockReadGuard<RawRwLock, T>,
}

impl<T> SharedGuard<T> {
    /// Generation observed while the guard is held.
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }
}

impl<T> std::ops::Deref for SharedGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

/// Exclusive guard. Dropping it increments the latch generation before the
/// underlying lock is released, so no reader can observe new data under an
/// old version.
pub struct ExclusiveGuard<T> {
    version: Arc<AtomicU64>,
    inner: ArcRwLockWriteGuard<RawRwLock, T>,
}

impl<T> ExclusiveGuard<T> {
    /// Generation observed while the guard is held (the pre-release value).
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Generation the latch will carry once this guard is released. This is
    /// the value stamped into dangling-pointer capabilities.
    pub fn version_after_release(&self) -> u64 {
        self.version.load(Ordering::Acquire) + 1
    }
}

impl<T> std::ops::Deref for ExclusiveGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.inner
    }
}

impl<T> std::ops::DerefMut for ExclusiveGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.inner
    }
}

impl<T> Drop for ExclusiveGuard<T> {
    fn drop(&mut self) {
        // Bump while still holding the write lock; the guard field is
        // released after this runs.
        self.version.fetch_add(1, Ordering::Release);
    }
}
