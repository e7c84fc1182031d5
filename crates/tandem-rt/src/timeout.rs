// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Bounded waits.
//!
//! None of the primitives time out on their own. Bounded waits are built
//! here by polling a select with a default arm, backing off between polls,
//! until a deadline passes.

use std::thread;
use std::time::{Duration, Instant};

use crate::channel::{self, Receiver};
use crate::select::Select;

const MIN_BACKOFF: Duration = Duration::from_nanos(100);
const MAX_BACKOFF: Duration = Duration::from_millis(1);

/// Call `poll` until it yields a value or `deadline` passes.
///
/// Spins with exponential backoff up to 1ms between polls.
pub fn poll_until<T, F>(deadline: Instant, mut poll: F) -> Result<T, TimedOut>
where
    F: FnMut() -> Option<T>,
{
    let mut backoff = MIN_BACKOFF;
    loop {
        if let Some(val) = poll() {
            return Ok(val);
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(TimedOut);
        }
        thread::sleep(backoff.min(deadline - now));
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

/// Receive with a bound. `Ok(None)` means closed and drained.
pub fn recv_within<T>(rx: &Receiver<T>, timeout: Duration) -> Result<Option<T>, TimedOut> {
    poll_until(Instant::now() + timeout, || {
        Select::new()
            .recv(rx, Some)
            .default(|| None)
            .run()
            .ok()
            .flatten()
    })
}

/// Run a closure with a timeout. Returns `Err(TimedOut)` if the closure
/// doesn't complete within `duration`.
///
/// The closure runs on its own thread. On timeout that thread is left
/// behind; a closure that never finishes keeps its thread forever.
pub fn with_timeout<T, F>(duration: Duration, f: F) -> Result<T, TimedOut>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = channel::buffered(1);
    thread::spawn(move || {
        let result = f();
        let _ = tx.send(result);
    });

    match recv_within(&rx, duration) {
        Ok(Some(val)) => Ok(val),
        _ => Err(TimedOut),
    }
}

/// Timeout error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimedOut;

impl std::fmt::Display for TimedOut {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "operation timed out")
    }
}

impl std::error::Error for TimedOut {}
