// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Shared<T>: reader/writer lock.
//!
//! Any number of readers or one writer. Writer-preferring: once a writer
//! is waiting, new readers queue behind it, so a steady stream of readers
//! cannot starve writers. The flip side is that a thread taking a second
//! shared lock while a writer waits will block.

use std::cell::UnsafeCell;
use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::thread::{self, ThreadId};

use log::warn;
use parking_lot::{Condvar, Mutex as StateLock};

use crate::error::SyncError;

struct RwState {
    writer: Option<ThreadId>,
    /// Shared holds per thread, so `unlock_shared` can check the caller.
    readers: HashMap<ThreadId, usize>,
    reader_count: usize,
    writers_waiting: usize,
}

impl RwState {
    fn admits_reader(&self) -> bool {
        self.writer.is_none() && self.writers_waiting == 0
    }

    fn admits_writer(&self) -> bool {
        self.writer.is_none() && self.reader_count == 0
    }

    fn add_reader(&mut self, id: ThreadId) {
        self.reader_count += 1;
        *self.readers.entry(id).or_insert(0) += 1;
    }
}

/// Reader/writer lock without data.
pub struct RawRwLock {
    state: StateLock<RwState>,
    readers_cv: Condvar,
    writers_cv: Condvar,
}

impl RawRwLock {
    pub fn new() -> Self {
        Self {
            state: StateLock::new(RwState {
                writer: None,
                readers: HashMap::new(),
                reader_count: 0,
                writers_waiting: 0,
            }),
            readers_cv: Condvar::new(),
            writers_cv: Condvar::new(),
        }
    }

    /// Shared acquire. Blocks while a writer holds or waits for the lock.
    pub fn lock_shared(&self) {
        let me = thread::current().id();
        let mut st = self.state.lock();
        while !st.admits_reader() {
            self.readers_cv.wait(&mut st);
        }
        st.add_reader(me);
    }

    pub fn try_lock_shared(&self) -> bool {
        let mut st = self.state.lock();
        if !st.admits_reader() {
            return false;
        }
        st.add_reader(thread::current().id());
        true
    }

    /// Release one shared hold taken by the calling thread.
    pub fn unlock_shared(&self) -> Result<(), SyncError> {
        let me = thread::current().id();
        let mut st = self.state.lock();
        let holds = match st.readers.get(&me).copied() {
            Some(holds) => holds,
            None => {
                warn!("shared unlock of rwlock not read-held by {:?}", me);
                return Err(SyncError::UnlockSharedNotHeld);
            }
        };
        if holds > 1 {
            st.readers.insert(me, holds - 1);
        } else {
            st.readers.remove(&me);
        }
        st.reader_count -= 1;
        if st.reader_count == 0 {
            self.writers_cv.notify_one();
        }
        Ok(())
    }

    /// Exclusive acquire. Blocks new readers while waiting.
    pub fn lock(&self) {
        let me = thread::current().id();
        let mut st = self.state.lock();
        st.writers_waiting += 1;
        while !st.admits_writer() {
            self.writers_cv.wait(&mut st);
        }
        st.writers_waiting -= 1;
        st.writer = Some(me);
    }

    pub fn try_lock(&self) -> bool {
        let mut st = self.state.lock();
        if !st.admits_writer() {
            return false;
        }
        st.writer = Some(thread::current().id());
        true
    }

    /// Release the exclusive hold. The calling thread must hold it.
    pub fn unlock(&self) -> Result<(), SyncError> {
        let me = thread::current().id();
        let mut st = self.state.lock();
        if st.writer != Some(me) {
            warn!("unlock of rwlock not write-held by {:?}", me);
            return Err(SyncError::UnlockNotHeld);
        }
        st.writer = None;
        if st.writers_waiting > 0 {
            self.writers_cv.notify_one();
        } else {
            self.readers_cv.notify_all();
        }
        Ok(())
    }

    pub fn readers(&self) -> usize {
        self.state.lock().reader_count
    }

    pub fn is_write_locked(&self) -> bool {
        self.state.lock().writer.is_some()
    }
}

impl Default for RawRwLock {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-heavy shared state. Multiple readers concurrent, exclusive writer.
pub struct Shared<T> {
    raw: RawRwLock,
    data: UnsafeCell<T>,
}

// Safety: `raw` hands out either many `&T` (needs Sync) or one `&mut T`
// (needs Send).
unsafe impl<T: Send + Sync> Send for Shared<T> {}
unsafe impl<T: Send + Sync> Sync for Shared<T> {}

impl<T> Shared<T> {
    /// Create a new shared value.
    pub fn new(value: T) -> Self {
        Self {
            raw: RawRwLock::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Shared read access; other readers run concurrently.
    pub fn read<R, F: FnOnce(&T) -> R>(&self, f: F) -> R {
        let guard = self.read_guard();
        f(&guard)
    }

    /// Exclusive write access; waits for current readers to finish.
    pub fn write<R, F: FnOnce(&mut T) -> R>(&self, f: F) -> R {
        let mut guard = self.write_guard();
        f(&mut guard)
    }

    /// Try shared read without blocking.
    pub fn try_read<R, F: FnOnce(&T) -> R>(&self, f: F) -> Option<R> {
        if !self.raw.try_lock_shared() {
            return None;
        }
        let guard = ReadGuard {
            shared: self,
            _not_send: PhantomData,
        };
        Some(f(&guard))
    }

    /// Try exclusive write without blocking.
    pub fn try_write<R, F: FnOnce(&mut T) -> R>(&self, f: F) -> Option<R> {
        if !self.raw.try_lock() {
            return None;
        }
        let mut guard = WriteGuard {
            shared: self,
            _not_send: PhantomData,
        };
        Some(f(&mut guard))
    }

    pub fn read_guard(&self) -> ReadGuard<'_, T> {
        self.raw.lock_shared();
        ReadGuard {
            shared: self,
            _not_send: PhantomData,
        }
    }

    pub fn write_guard(&self) -> WriteGuard<'_, T> {
        self.raw.lock();
        WriteGuard {
            shared: self,
            _not_send: PhantomData,
        }
    }

    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T: Default> Default for Shared<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T> fmt::Debug for Shared<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shared")
            .field("readers", &self.raw.readers())
            .field("write_locked", &self.raw.is_write_locked())
            .finish_non_exhaustive()
    }
}

pub struct ReadGuard<'a, T> {
    shared: &'a Shared<T>,
    _not_send: PhantomData<*const ()>,
}

impl<T> Deref for ReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: a shared hold excludes writers.
        unsafe { &*self.shared.data.get() }
    }
}

impl<T> Drop for ReadGuard<'_, T> {
    fn drop(&mut self) {
        let _ = self.shared.raw.unlock_shared();
    }
}

pub struct WriteGuard<'a, T> {
    shared: &'a Shared<T>,
    _not_send: PhantomData<*const ()>,
}

impl<T> Deref for WriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // Safety: the exclusive hold excludes everyone else.
        unsafe { &*self.shared.data.get() }
    }
}

impl<T> DerefMut for WriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // Safety: the exclusive hold excludes everyone else.
        unsafe { &mut *self.shared.data.get() }
    }
}

impl<T> Drop for WriteGuard<'_, T> {
    fn drop(&mut self) {
        let _ = self.shared.raw.unlock();
    }
}
