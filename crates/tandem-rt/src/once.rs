// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Run an initialization action exactly once across threads.
//!
//! The first caller runs its action; everyone else blocks until it has
//! returned. If the action fails (an `Err` from `try_call_once`, or a
//! panic) the guard goes back to not-started and the next caller, parked
//! or new, runs its own action. Failure is retriable, never sticky.

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnceState {
    NotStarted,
    InProgress,
    Done,
}

pub struct OnceGuard {
    state: Mutex<OnceState>,
    changed: Condvar,
}

/// Resets an in-progress guard if the action unwinds.
struct Running<'a> {
    once: &'a OnceGuard,
    finished: bool,
}

impl Running<'_> {
    fn finish(mut self, state: OnceState) {
        self.finished = true;
        self.once.settle(state);
    }
}

impl Drop for Running<'_> {
    fn drop(&mut self) {
        if !self.finished {
            warn!("once action panicked, guard reset");
            self.once.settle(OnceState::NotStarted);
        }
    }
}

impl OnceGuard {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(OnceState::NotStarted),
            changed: Condvar::new(),
        }
    }

    /// Run `action` if nobody has completed one yet.
    pub fn call_once<F: FnOnce()>(&self, action: F) {
        let _ = self.try_call_once(|| {
            action();
            Ok::<(), std::convert::Infallible>(())
        });
    }

    /// Like `call_once`, for an action that can fail. On `Err` the guard
    /// is left retriable and the error returned to this caller only.
    pub fn try_call_once<E, F>(&self, action: F) -> Result<(), E>
    where
        F: FnOnce() -> Result<(), E>,
    {
        if !self.claim() {
            return Ok(());
        }

        let running = Running {
            once: self,
            finished: false,
        };
        match action() {
            Ok(()) => {
                running.finish(OnceState::Done);
                Ok(())
            }
            Err(e) => {
                debug!("once action failed, guard reset");
                running.finish(OnceState::NotStarted);
                Err(e)
            }
        }
    }

    pub fn is_done(&self) -> bool {
        *self.state.lock() == OnceState::Done
    }

    pub fn state(&self) -> OnceState {
        *self.state.lock()
    }

    /// True if the caller must run the action. Blocks through InProgress.
    fn claim(&self) -> bool {
        let mut state = self.state.lock();
        loop {
            match *state {
                OnceState::Done => return false,
                OnceState::InProgress => self.changed.wait(&mut state),
                OnceState::NotStarted => {
                    *state = OnceState::InProgress;
                    return true;
                }
            }
        }
    }

    fn settle(&self, to: OnceState) {
        *self.state.lock() = to;
        self.changed.notify_all();
    }
}

impl Default for OnceGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for OnceGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnceGuard")
            .field("state", &self.state())
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
    fn runs_once_sequentially() {
        let once = OnceGuard::new();
        let mut counter = 0;
        once.call_once(|| counter += 1);
        once.call_once(|| counter += 1);
        assert_eq!(counter, 1);
        assert!(once.is_done());
    }

    #[test]
    fn concurrent_callers_wait_for_completion() {
        let once = Arc::new(OnceGuard::new());
        let counter = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let once = once.clone();
                let counter = counter.clone();
                std::thread::spawn(move || {
                    once.call_once(|| {
                        std::thread::sleep(Duration::from_millis(30));
                        counter.fetch_add(1, Ordering::SeqCst);
                    });
                    // Nobody passes the guard before the action returned.
                    assert_eq!(counter.load(Ordering::SeqCst), 1);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_action_is_retriable() {
        let once = OnceGuard::new();
        assert_eq!(once.try_call_once(|| Err("not yet")), Err("not yet"));
        assert_eq!(once.state(), OnceState::NotStarted);
        assert_eq!(once.try_call_once(|| Ok::<(), &str>(())), Ok(()));
        assert!(once.is_done());
        assert_eq!(once.try_call_once(|| Err("ignored")), Ok(()));
    }

    #[test]
    fn panicking_action_resets_guard() {
        let once = Arc::new(OnceGuard::new());
        let o = once.clone();
        let r = std::thread::spawn(move || o.call_once(|| panic!("init failed"))).join();
        assert!(r.is_err());
        assert_eq!(once.state(), OnceState::NotStarted);

        let mut ran = false;
        once.call_once(|| ran = true);
        assert!(ran);
    }
}
