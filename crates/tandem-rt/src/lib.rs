// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Tandem runtime library: concurrency primitives on OS threads.
//!
//! Blocking operations park only the calling thread. Nothing times out on
//! its own; bounded waits are composed in `timeout` from a select with a
//! default arm.
//!
//! Components:
//! - channel — bounded/rendezvous message passing, directional views
//! - select — channel multiplexing, random-fair
//! - mutex/shared — exclusive and reader/writer locks
//! - once — one-time initialization guard
//! - wait_group — wait for N workers
//! - spawn — thread-per-worker and bounded worker pool
//! - timeout — bounded waits
//! - ledger — account transfers and the lock-ordering hazard

pub mod channel;
pub mod error;
pub mod ledger;
pub mod mutex;
pub mod once;
pub mod select;
pub mod shared;
mod signal;
pub mod spawn;
pub mod timeout;
pub mod wait_group;

pub use channel::{buffered, unbuffered, Channel, Receiver, SendError, Sender};
pub use error::SyncError;
pub use mutex::{Mutex, RawMutex};
pub use once::OnceGuard;
pub use select::{Select, SelectResult};
pub use shared::{RawRwLock, Shared};
pub use spawn::{available_parallelism, live_workers, spawn, PoolConfig, TaskHandle, WorkerPool};
pub use wait_group::WaitBarrier;
