// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! WaitBarrier: one coordinator waits for N workers.
//!
//! Register all outstanding work with `add` *before* starting the workers
//! it accounts for, then each worker calls `done` once. Calling `add` from
//! inside a worker that is already running races with `wait`: the
//! coordinator can see zero and return before that worker registered.
//! Register up front, always.

use std::fmt;

use log::{trace, warn};
use parking_lot::{Condvar, Mutex};

use crate::error::SyncError;

struct Counter {
    outstanding: usize,
    waiting: bool,
}

pub struct WaitBarrier {
    counter: Mutex<Counter>,
    zero: Condvar,
}

impl WaitBarrier {
    pub fn new() -> Self {
        Self {
            counter: Mutex::new(Counter {
                outstanding: 0,
                waiting: false,
            }),
            zero: Condvar::new(),
        }
    }

    /// Register `n` more workers.
    pub fn add(&self, n: usize) {
        self.counter.lock().outstanding += n;
    }

    /// Mark one worker finished. Errors instead of going below zero.
    pub fn done(&self) -> Result<(), SyncError> {
        let mut c = self.counter.lock();
        if c.outstanding == 0 {
            warn!("wait barrier done() without matching add()");
            return Err(SyncError::NegativeCounter);
        }
        c.outstanding -= 1;
        if c.outstanding == 0 {
            self.zero.notify_all();
        }
        Ok(())
    }

    /// Block until every registered worker called `done`.
    ///
    /// Meant for a single coordinator; a second concurrent waiter gets
    /// `ConcurrentWait`.
    pub fn wait(&self) -> Result<(), SyncError> {
        let mut c = self.counter.lock();
        if c.waiting {
            return Err(SyncError::ConcurrentWait);
        }
        c.waiting = true;
        while c.outstanding > 0 {
            trace!("wait barrier parked, {} outstanding", c.outstanding);
            self.zero.wait(&mut c);
        }
        c.waiting = false;
        Ok(())
    }

    pub fn outstanding(&self) -> usize {
        self.counter.lock().outstanding
    }
}

impl Default for WaitBarrier {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for WaitBarrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WaitBarrier")
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn wait_with_nothing_registered() {
        let wg = WaitBarrier::new();
        wg.wait().unwrap();
    }

    #[test]
    fn waits_for_every_worker() {
        let wg = Arc::new(WaitBarrier::new());
        let finished = Arc::new(AtomicUsize::new(0));
        wg.add(20);
        for i in 0..20 {
            let wg = wg.clone();
            let finished = finished.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(i % 5));
                finished.fetch_add(1, Ordering::SeqCst);
                wg.done().unwrap();
            });
        }
        wg.wait().unwrap();
        assert_eq!(finished.load(Ordering::SeqCst), 20);
        assert_eq!(wg.outstanding(), 0);
    }

    #[test]
    fn done_below_zero_is_usage_error() {
        let wg = WaitBarrier::new();
        wg.add(1);
        wg.done().unwrap();
        assert_eq!(wg.done(), Err(SyncError::NegativeCounter));
    }

    #[test]
    fn second_waiter_rejected() {
        let wg = Arc::new(WaitBarrier::new());
        wg.add(1);
        let w = wg.clone();
        let first = std::thread::spawn(move || w.wait());
        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(wg.wait(), Err(SyncError::ConcurrentWait));
        wg.done().unwrap();
        assert_eq!(first.join().unwrap(), Ok(()));
    }
}
