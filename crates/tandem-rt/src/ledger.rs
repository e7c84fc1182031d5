// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Accounts and transfers: the classic two-lock deadlock.
//!
//! `transfer` locks the source, pauses, then locks the destination. Two
//! transfers running in opposite directions each end up holding one
//! account and waiting for the other, forever. The pause widens the
//! window so the cycle forms reliably.
//!
//! Two ways out:
//! - `transfer_ordered`: every caller locks accounts in ascending id
//!   order, so no cycle can form.
//! - `transfer_with_backoff`: take the second lock with `try_acquire`;
//!   on failure release the first, back off, retry.

use std::fmt;
use std::time::Duration;

use log::{debug, trace};
use rand::Rng;

use crate::mutex::{Mutex, MutexGuard};
use crate::shared::Shared;

pub type AccountId = u64;

/// A named balance with its own lock. Balance access goes through methods.
pub struct Account {
    id: AccountId,
    name: String,
    balance: Mutex<i64>,
}

impl Account {
    pub fn new(id: AccountId, name: impl Into<String>, balance: i64) -> Self {
        Self {
            id,
            name: name.into(),
            balance: Mutex::new(balance),
        }
    }

    pub fn id(&self) -> AccountId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current balance (locks briefly).
    pub fn balance(&self) -> i64 {
        self.balance.lock(|b| *b)
    }

    /// Lock the account until the returned handle drops.
    pub fn lock(&self) -> LockedAccount<'_> {
        LockedAccount {
            account: self,
            balance: self.balance.acquire(),
        }
    }

    pub fn try_lock(&self) -> Option<LockedAccount<'_>> {
        Some(LockedAccount {
            account: self,
            balance: self.balance.try_acquire()?,
        })
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// An account held under its lock.
pub struct LockedAccount<'a> {
    account: &'a Account,
    balance: MutexGuard<'a, i64>,
}

impl LockedAccount<'_> {
    pub fn change(&mut self, amount: i64) {
        *self.balance += amount;
    }

    pub fn balance(&self) -> i64 {
        *self.balance
    }

    pub fn name(&self) -> &str {
        self.account.name()
    }
}

/// Move `amount` from `from` to `to`, locking in argument order.
///
/// Deadlocks against a concurrent `transfer(to, from, ..)`.
pub fn transfer(from: &Account, to: &Account, amount: i64, pause: Duration) {
    let mut src = from.lock();
    trace!("locked {}", src.name());
    src.change(-amount);

    std::thread::sleep(pause);

    let mut dst = to.lock();
    trace!("locked {}", dst.name());
    dst.change(amount);

    std::thread::sleep(pause);
    drop(src);
    drop(dst);
}

/// Same transfer, but both locks are taken in ascending account id order.
///
/// Accounts sharing an id are treated as one account: nothing moves.
pub fn transfer_ordered(from: &Account, to: &Account, amount: i64, pause: Duration) {
    if from.id() == to.id() {
        debug!("transfer {} -> {} skipped, same account", from.name(), to.name());
        return;
    }
    let from_first = from.id() <= to.id();
    let (first, second) = if from_first { (from, to) } else { (to, from) };

    let mut a = first.lock();
    std::thread::sleep(pause);
    let mut b = second.lock();

    if from_first {
        a.change(-amount);
        b.change(amount);
    } else {
        b.change(-amount);
        a.change(amount);
    }

    std::thread::sleep(pause);
}

/// Transfer that never waits while holding a lock. Returns the number of
/// attempts it took.
pub fn transfer_with_backoff(from: &Account, to: &Account, amount: i64, pause: Duration) -> usize {
    let mut rng = rand::thread_rng();
    let mut attempts = 0;
    loop {
        attempts += 1;
        let mut src = from.lock();
        std::thread::sleep(pause);

        if let Some(mut dst) = to.try_lock() {
            src.change(-amount);
            dst.change(amount);
            return attempts;
        }

        drop(src);
        // Randomized so two colliding transfers fall out of step.
        let backoff = Duration::from_nanos(rng.gen_range(0..backoff_bound(pause)));
        debug!(
            "transfer {} -> {} backing off {:?} (attempt {})",
            from.name(),
            to.name(),
            backoff,
            attempts
        );
        std::thread::sleep(backoff);
    }
}

/// Upper bound of a backoff, in nanoseconds: the pause, at least 1µs.
fn backoff_bound(pause: Duration) -> u64 {
    u64::try_from(pause.as_nanos().max(1_000)).unwrap_or(u64::MAX)
}

/// A balance read far more often than written.
#[derive(Debug, Default)]
pub struct Balance {
    amount: Shared<i64>,
}

impl Balance {
    pub fn new(amount: i64) -> Self {
        Self {
            amount: Shared::new(amount),
        }
    }

    pub fn add(&self, amount: i64) {
        self.amount.write(|b| *b += amount);
    }

    pub fn get(&self) -> i64 {
        self.amount.read(|b| *b)
    }
}
