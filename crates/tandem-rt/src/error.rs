// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Usage errors shared by every primitive.
//!
//! A `SyncError` means the caller broke the primitive's protocol. It is
//! returned at the call site that broke it and should not be ignored.

use thiserror::Error;

/// A protocol violation detected by a primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SyncError {
    /// `close` called on a channel that was already closed.
    #[error("close of closed channel")]
    CloseOfClosed,

    /// `close` raced with senders still blocked in `send`. The channel is
    /// closed anyway and those senders fail.
    #[error("close of channel with {pending} send(s) still in flight")]
    CloseWithPendingSend { pending: usize },

    /// A select send arm fired on a closed channel.
    #[error("send on closed channel")]
    SendOnClosed,

    /// `unlock` called by a thread that does not hold the exclusive lock.
    #[error("unlock of a lock not held by this thread")]
    UnlockNotHeld,

    /// `unlock_shared` called by a thread that holds no shared lock.
    #[error("shared unlock of a lock not read-held by this thread")]
    UnlockSharedNotHeld,

    /// `done` called more times than `add` registered.
    #[error("wait barrier counter would go negative")]
    NegativeCounter,

    /// A second coordinator called `wait` while another was parked.
    #[error("wait barrier already has a waiting coordinator")]
    ConcurrentWait,

    /// A select with no arms and no default would park forever.
    #[error("select with no arms and no default")]
    EmptySelect,
}
