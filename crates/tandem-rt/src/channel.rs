// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Channels.
//!
//! A channel is a bounded FIFO shared by any number of senders and
//! receivers. Capacity 0 is a rendezvous: `send` returns only after a
//! receiver has taken the value.
//!
//! Closing is explicit and happens once, by whichever party the protocol
//! names as the closer. After close, senders fail and receivers drain
//! what is buffered, then get `None`. Dropping handles never closes.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use log::{debug, trace, warn};
use parking_lot::{Condvar, Mutex};
use thiserror::Error;

use crate::error::SyncError;
use crate::signal::Signal;

/// Error from a blocking send.
#[derive(Debug, PartialEq, Eq)]
pub enum SendError<T> {
    /// The channel was closed. Carries the value back.
    Closed(T),
}

impl<T> SendError<T> {
    pub fn into_inner(self) -> T {
        match self {
            SendError::Closed(v) => v,
        }
    }
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "send on closed channel")
    }
}

impl<T: fmt::Debug> std::error::Error for SendError<T> {}

#[derive(Debug, PartialEq, Eq)]
pub enum TrySendError<T> {
    /// No room right now (or, unbuffered, no receiver committed).
    Full(T),
    /// The channel was closed.
    Closed(T),
}

impl<T> fmt::Display for TrySendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrySendError::Full(_) => write!(f, "channel full"),
            TrySendError::Closed(_) => write!(f, "send on closed channel"),
        }
    }
}

impl<T: fmt::Debug> std::error::Error for TrySendError<T> {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TryRecvError {
    /// No value available right now.
    #[error("channel empty")]
    Empty,
    /// Closed and drained.
    #[error("channel closed and drained")]
    Closed,
}

/// Where a claimed selector receives an unbuffered hand-off.
pub(crate) type Slot<T> = Arc<Mutex<Option<T>>>;

/// A selector parked on this channel.
struct Watcher<T> {
    signal: Arc<Signal>,
    /// Set for receive arms.
    slot: Option<Slot<T>>,
}

struct State<T> {
    buf: VecDeque<T>,
    closed: bool,
    /// Threads parked in `recv`.
    recv_waiting: usize,
    /// Threads parked in `send`, waiting for room or for pickup.
    send_waiting: usize,
    /// Values ever pushed / popped. Rendezvous senders wait on `popped`.
    pushed: u64,
    popped: u64,
    watchers: Vec<Watcher<T>>,
}

impl<T> State<T> {
    fn wake_watchers(&self) {
        for w in &self.watchers {
            w.signal.notify();
        }
    }

    /// Give `val` to the first parked selector that can be claimed.
    fn hand_off(&self, val: T) -> Result<(), T> {
        for w in &self.watchers {
            let Some(slot) = &w.slot else { continue };
            if w.signal.try_claim() {
                *slot.lock() = Some(val);
                w.signal.notify();
                trace!("value handed off to parked selector");
                return Ok(());
            }
        }
        Err(val)
    }
}

pub(crate) struct Chan<T> {
    cap: usize,
    state: Mutex<State<T>>,
    not_empty: Condvar,
    /// Room freed or a value picked up.
    not_full: Condvar,
}

impl<T> Chan<T> {
    fn new(cap: usize) -> Self {
        Self {
            cap,
            state: Mutex::new(State {
                buf: VecDeque::with_capacity(cap.max(1)),
                closed: false,
                recv_waiting: 0,
                send_waiting: 0,
                pushed: 0,
                popped: 0,
                watchers: Vec::new(),
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Buffer slots. An unbuffered channel holds the one value in hand-off.
    fn slots(&self) -> usize {
        self.cap.max(1)
    }

    fn push(&self, st: &mut State<T>, val: T) -> u64 {
        st.buf.push_back(val);
        st.pushed += 1;
        self.not_empty.notify_one();
        st.wake_watchers();
        st.pushed
    }

    fn pop(&self, st: &mut State<T>) -> Option<T> {
        let val = st.buf.pop_front()?;
        st.popped += 1;
        if self.cap == 0 {
            // Rendezvous senders wait for their own ticket.
            self.not_full.notify_all();
        } else {
            self.not_full.notify_one();
        }
        st.wake_watchers();
        Some(val)
    }

    pub(crate) fn send(&self, val: T) -> Result<(), SendError<T>> {
        let mut st = self.state.lock();
        loop {
            if st.closed {
                warn!("send on closed channel");
                return Err(SendError::Closed(val));
            }
            if st.buf.len() < self.slots() {
                break;
            }
            st.send_waiting += 1;
            trace!("send parked, buffer full ({})", st.buf.len());
            self.not_full.wait(&mut st);
            st.send_waiting -= 1;
        }

        let ticket = self.push(&mut st, val);
        if self.cap > 0 {
            return Ok(());
        }

        // Rendezvous: hold until a receiver has taken our value.
        st.send_waiting += 1;
        while st.popped < ticket {
            if st.closed {
                st.send_waiting -= 1;
                // Not picked up, so ours is the only value buffered.
                match st.buf.pop_back() {
                    Some(val) => {
                        st.pushed -= 1;
                        warn!("unbuffered send failed, channel closed before pickup");
                        return Err(SendError::Closed(val));
                    }
                    None => return Ok(()),
                }
            }
            self.not_full.wait(&mut st);
        }
        st.send_waiting -= 1;
        Ok(())
    }

    pub(crate) fn try_send(&self, val: T) -> Result<(), TrySendError<T>> {
        let mut st = self.state.lock();
        if st.closed {
            return Err(TrySendError::Closed(val));
        }
        if self.cap > 0 {
            if st.buf.len() >= self.cap {
                return Err(TrySendError::Full(val));
            }
            self.push(&mut st, val);
            return Ok(());
        }

        // Unbuffered: only a receiver already committed to this channel
        // may take the value.
        if st.buf.is_empty() && st.recv_waiting > 0 {
            self.push(&mut st, val);
            return Ok(());
        }
        st.hand_off(val).map_err(TrySendError::Full)
    }

    pub(crate) fn recv(&self) -> Option<T> {
        let mut st = self.state.lock();
        loop {
            if let Some(val) = self.pop(&mut st) {
                return Some(val);
            }
            if st.closed {
                return None;
            }
            st.recv_waiting += 1;
            // A selector holding a send arm can hand off to us now.
            st.wake_watchers();
            trace!("recv parked, buffer empty");
            self.not_empty.wait(&mut st);
            st.recv_waiting -= 1;
        }
    }

    pub(crate) fn try_recv(&self) -> Result<T, TryRecvError> {
        let mut st = self.state.lock();
        match self.pop(&mut st) {
            Some(val) => Ok(val),
            None if st.closed => Err(TryRecvError::Closed),
            None => Err(TryRecvError::Empty),
        }
    }

    pub(crate) fn close(&self) -> Result<(), SyncError> {
        let mut st = self.state.lock();
        if st.closed {
            warn!("close of closed channel");
            return Err(SyncError::CloseOfClosed);
        }
        st.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
        st.wake_watchers();
        debug!("channel closed, {} value(s) left to drain", st.buf.len());

        let pending = st.send_waiting;
        if pending > 0 {
            warn!("channel closed with {} send(s) in flight", pending);
            return Err(SyncError::CloseWithPendingSend { pending });
        }
        Ok(())
    }

    pub(crate) fn watch(&self, signal: &Arc<Signal>, slot: Option<Slot<T>>) {
        let mut st = self.state.lock();
        let recv = slot.is_some();
        st.watchers.push(Watcher {
            signal: signal.clone(),
            slot,
        });
        if recv && self.cap == 0 {
            // Parked send arms elsewhere may now have a receiver.
            st.wake_watchers();
        }
    }

    pub(crate) fn unwatch(&self, signal: &Arc<Signal>) {
        self.state
            .lock()
            .watchers
            .retain(|w| !Arc::ptr_eq(&w.signal, signal));
    }

    /// Wake every watcher except `signal`'s owner.
    pub(crate) fn wake_others(&self, signal: &Arc<Signal>) {
        let st = self.state.lock();
        for w in st.watchers.iter().filter(|w| !Arc::ptr_eq(&w.signal, signal)) {
            w.signal.notify();
        }
    }

    fn len(&self) -> usize {
        self.state.lock().buf.len()
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }
}

/// A bidirectional channel handle. Cloning shares the same channel.
pub struct Channel<T> {
    chan: Arc<Chan<T>>,
}

impl<T> Channel<T> {
    /// Create a channel holding up to `capacity` values. 0 = rendezvous.
    pub fn new(capacity: usize) -> Self {
        Self {
            chan: Arc::new(Chan::new(capacity)),
        }
    }

    pub fn unbuffered() -> Self {
        Self::new(0)
    }

    /// Blocking send. Fails only if the channel is (or becomes) closed.
    pub fn send(&self, val: T) -> Result<(), SendError<T>> {
        self.chan.send(val)
    }

    pub fn try_send(&self, val: T) -> Result<(), TrySendError<T>> {
        self.chan.try_send(val)
    }

    /// Blocking receive. `None` once the channel is closed and drained.
    pub fn recv(&self) -> Option<T> {
        self.chan.recv()
    }

    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        self.chan.try_recv()
    }

    pub fn close(&self) -> Result<(), SyncError> {
        self.chan.close()
    }

    pub fn capacity(&self) -> usize {
        self.chan.cap
    }

    /// Buffered values. On an unbuffered channel this is the value in hand-off, if any.
    pub fn len(&self) -> usize {
        self.chan.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.chan.is_closed()
    }

    /// A view that can only send (and close).
    pub fn as_send_only(&self) -> Sender<T> {
        Sender {
            chan: self.chan.clone(),
        }
    }

    /// A view that can only receive.
    pub fn as_receive_only(&self) -> Receiver<T> {
        Receiver {
            chan: self.chan.clone(),
        }
    }

    pub fn split(self) -> (Sender<T>, Receiver<T>) {
        (self.as_send_only(), self.as_receive_only())
    }
}

impl<T> Clone for Channel<T> {
    fn clone(&self) -> Self {
        Channel {
            chan: self.chan.clone(),
        }
    }
}

impl<T> fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("capacity", &self.chan.cap)
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Create a buffered channel with capacity `n`.
pub fn buffered<T>(n: usize) -> (Sender<T>, Receiver<T>) {
    Channel::new(n).split()
}

/// Create an unbuffered (rendezvous) channel.
pub fn unbuffered<T>() -> (Sender<T>, Receiver<T>) {
    Channel::unbuffered().split()
}

/// Send-only view of a channel. The designated closer holds one of these.
pub struct Sender<T> {
    pub(crate) chan: Arc<Chan<T>>,
}

impl<T> Sender<T> {
    /// Blocking send. Pauses/blocks if buffer full.
    pub fn send(&self, val: T) -> Result<(), SendError<T>> {
        self.chan.send(val)
    }

    /// Non-blocking send attempt. On an unbuffered channel this succeeds
    /// only if a receiver is parked in `recv`, or a parked select can be
    /// claimed to take the value on its receive arm.
    pub fn try_send(&self, val: T) -> Result<(), TrySendError<T>> {
        self.chan.try_send(val)
    }

    /// Signal "no more data" to receivers.
    pub fn close(&self) -> Result<(), SyncError> {
        self.chan.close()
    }

    pub fn capacity(&self) -> usize {
        self.chan.cap
    }

    pub fn is_closed(&self) -> bool {
        self.chan.is_closed()
    }
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Sender {
            chan: self.chan.clone(),
        }
    }
}

impl<T> fmt::Debug for Sender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sender")
            .field("capacity", &self.chan.cap)
            .finish_non_exhaustive()
    }
}

/// Receive-only view of a channel.
pub struct Receiver<T> {
    pub(crate) chan: Arc<Chan<T>>,
}

impl<T> Receiver<T> {
    /// Blocking receive. Pauses/blocks if buffer empty.
    pub fn recv(&self) -> Option<T> {
        self.chan.recv()
    }

    /// Non-blocking receive attempt.
    pub fn try_recv(&self) -> Result<T, TryRecvError> {
        self.chan.try_recv()
    }

    /// Receive until the channel is closed and drained.
    pub fn iter(&self) -> Iter<'_, T> {
        Iter { rx: self }
    }

    pub fn capacity(&self) -> usize {
        self.chan.cap
    }

    pub fn len(&self) -> usize {
        self.chan.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_closed(&self) -> bool {
        self.chan.is_closed()
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        Receiver {
            chan: self.chan.clone(),
        }
    }
}

impl<T> fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Receiver")
            .field("capacity", &self.chan.cap)
            .finish_non_exhaustive()
    }
}

pub struct Iter<'a, T> {
    rx: &'a Receiver<T>,
}

impl<T> Iterator for Iter<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.rx.recv()
    }
}

impl<'a, T> IntoIterator for &'a Receiver<T> {
    type Item = T;
    type IntoIter = Iter<'a, T>;

    fn into_iter(self) -> Iter<'a, T> {
        self.iter()
    }
}
