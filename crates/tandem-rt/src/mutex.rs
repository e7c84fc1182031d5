// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Mutex.
//!
//! `RawMutex` is the bare lock: `lock`/`unlock` with owner checking, so
//! unlocking from a thread that doesn't hold it is reported instead of
//! corrupting the lock. `Mutex<T>` pairs a value with a `RawMutex`; the
//! value is only reachable while the lock is held, through a closure
//! (`lock`) or a guard (`acquire`).
//!
//! Not reentrant: locking twice from one thread blocks forever. No
//! poisoning; a panic while locked releases the lock on unwind.

use std::cell::UnsafeCell;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::thread::{self, ThreadId};

use log::warn;
use parking_lot::{Condvar, Mutex as StateLock};

use crate::error::SyncError;

/// Exclusive lock without data.
pub struct RawMutex {
    owner: StateLock<Option<ThreadId>>,
    released: Condvar,
}

impl RawMutex {
    pub fn new() -> Self {
        Self {
            owner: StateLock::new(None),
            released: Condvar::new(),
        }
    }

    /// Block until the lock is free, then take it.
    pub fn lock(&self) {
        let me = thread::current().id();
        let mut owner = self.owner.lock();
        while owner.is_some() {
            self.released.wait(&mut owner);
        }
        *owner = Some(me);
    }

    /// Take the lock if it is free right now.
    pub fn try_lock(&self) -> bool {
        let mut owner = self.owner.lock();
        if owner.is_some() {
            return false;
        }
        *owner = Some(thread::current().id());
        true
    }

    /// Release the lock. The calling thread must hold it.
    pub fn unlock(&self) -> Result<(), SyncError> {
        let mut owner = self.owner.lock();
        if *owner != Some(thread::current().id()) {
            warn!("unlock of mutex not held by {:?}", thread::current().id());
            return Err(SyncError::UnlockNotHeld);
        }
        *owner = None;
        self.released.notify_one();
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.owner.lock().is_some()
    }
}

impl Default for RawMutex {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive-access wrapper around a value.
pub struct Mutex<T> {
    raw: RawMutex,
    data: UnsafeCell<T>,
}

// Safety: access to `data` is serialized by `raw`; T: Send is enough to
// hand it from one locking thread to the next.
unsafe impl<T: Send> Send for Mutex<T> {}
unsafe impl<T: Send> Sync for Mutex<T> {}

impl<T> Mutex<T> {
    /// Create a new mutex wrapping `value`.
    pub fn new(value: T) -> Self {
        Self {
            raw: RawMutex::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquire the lock and run `f` with exclusive access.
    pub fn lock<R, F: FnOnce(&mut T) -> R>(&self, f: F) -> R {
        let mut guard = self.acquire();
        f(&mut guard)
    }

    /// Try to acquire the lock without blocking.
    pub fn try_lock<R, F: FnOnce(&mut T) -> R>(&self, f: F) -> Option<R> {
        let mut guard = self.try_acquire()?;
        Some(f(&mut guard))
    }

    /// Acquire the lock, holding it until the guard drops.
    pub fn acquire(&self) -> MutexGuard<'_, T> {
        self.raw.lock();
        MutexGuard {
            mutex: self,
            _not_send: PhantomData,
        }
    }

    pub fn try_acquire(&self) -> Option<MutexGuard<'_, T>> {
        if !self.raw.try_lock() {
            return None;
        }
        Some(MutexGuard {
            mutex: self,
            _not_send: PhantomData,
        })
    }

    pub fn is_locked(&self) -> bool {
        self.raw.is_locked()
    }

    pub fn get_mut(&mut self) -> &mut T {
        self.data.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: Default> Default for Mutex<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("locked", &self.is_locked())
            .finish_non_exhaustive()
    }
}

/// Held lock on a [`Mutex`]. Stays on the thread that locked it.
pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
    _not_send: PhantomData<*const ()>,
}

impl<T> Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the guard proves this thread holds the lock.
        unsafe { &*self.mutex.data.get() }
    }
}

impl<T> DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the guard proves this thread holds the lock.
        unsafe { &mut *self.mutex.data.get() }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        // The guard is !Send, so we are still on the owning thread.
        let _ = self.mutex.raw.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn lock_and_mutate() {
        let m = Mutex::new(0);
        m.lock(|v| *v += 1);
        let val = m.lock(|v| *v);
        assert_eq!(val, 1);
    }

    #[test]
    fn try_lock_succeeds() {
        let m = Mutex::new(42);
        assert_eq!(m.try_lock(|v| *v), Some(42));
    }

    #[test]
    fn try_lock_fails_while_held() {
        let m = Mutex::new(0);
        let _held = m.acquire();
        assert!(m.is_locked());
        assert_eq!(m.try_lock(|v| *v), None);
    }

    #[test]
    fn guard_releases_on_drop() {
        let m = Mutex::new(String::from("Damar"));
        {
            let mut g = m.acquire();
            g.push_str(" Benny");
        }
        assert!(!m.is_locked());
        assert_eq!(m.into_inner(), "Damar Benny");
    }

    #[test]
    fn concurrent_lock() {
        let m = Arc::new(Mutex::new(0));
        let mut handles = vec![];
        for _ in 0..10 {
            let m = m.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..100 {
                    m.lock(|v| *v += 1);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(m.lock(|v| *v), 1000);
    }

    #[test]
    fn unlock_unheld_is_usage_error() {
        let raw = RawMutex::new();
        assert_eq!(raw.unlock(), Err(SyncError::UnlockNotHeld));
    }

    #[test]
    fn unlock_from_other_thread_is_usage_error() {
        let raw = Arc::new(RawMutex::new());
        raw.lock();
        let other = raw.clone();
        let r = std::thread::spawn(move || other.unlock()).join().unwrap();
        assert_eq!(r, Err(SyncError::UnlockNotHeld));
        assert!(raw.is_locked());
        raw.unlock().unwrap();
        assert!(!raw.is_locked());
    }

    #[test]
    fn panic_inside_lock_releases() {
        let m = Arc::new(Mutex::new(1));
        let m2 = m.clone();
        let r = std::thread::spawn(move || m2.lock(|_| panic!("boom"))).join();
        assert!(r.is_err());
        assert_eq!(m.lock(|v| *v), 1);
    }
}
