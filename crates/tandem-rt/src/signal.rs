// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Wake cell and hand-off claim for parked selectors.
//!
//! Channels hold an `Arc<Signal>` for every selector watching them and
//! fire it on any state change. A fire that lands before `wait` is not lost.
//!
//! The claim decides who commits a selector. The selector takes it before
//! trying its arms; an unbuffered sender takes it to hand a value straight
//! into one of the selector's receive slots. Whoever gets it first wins,
//! and a delivered claim is never released.

use parking_lot::{Condvar, Mutex};

#[derive(Default)]
struct Claim {
    held: bool,
    /// A sender was turned away while the owner held the claim.
    refused: bool,
}

pub(crate) struct Signal {
    fired: Mutex<bool>,
    cvar: Condvar,
    claim: Mutex<Claim>,
}

impl Signal {
    pub fn new() -> Self {
        Self {
            fired: Mutex::new(false),
            cvar: Condvar::new(),
            claim: Mutex::new(Claim::default()),
        }
    }

    pub fn notify(&self) {
        let mut fired = self.fired.lock();
        *fired = true;
        self.cvar.notify_one();
    }

    /// Park until notified, then re-arm.
    pub fn wait(&self) {
        let mut fired = self.fired.lock();
        while !*fired {
            self.cvar.wait(&mut fired);
        }
        *fired = false;
    }

    /// Take the claim. `false` if someone else holds it.
    pub fn try_claim(&self) -> bool {
        let mut claim = self.claim.lock();
        if claim.held {
            claim.refused = true;
            return false;
        }
        claim.held = true;
        true
    }

    /// Give the claim back. Returns whether a sender was refused meanwhile.
    pub fn release(&self) -> bool {
        let mut claim = self.claim.lock();
        claim.held = false;
        std::mem::take(&mut claim.refused)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn notify_before_wait_is_kept() {
        let s = Signal::new();
        s.notify();
        s.wait();
    }

    #[test]
    fn notify_from_other_thread() {
        let s = Arc::new(Signal::new());
        let s2 = s.clone();
        let h = std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(10));
            s2.notify();
        });
        s.wait();
        h.join().unwrap();
    }

    #[test]
    fn claim_is_exclusive() {
        let s = Signal::new();
        assert!(s.try_claim());
        assert!(!s.try_claim());
        assert!(s.release());
        assert!(s.try_claim());
        assert!(!s.release());
    }
}
