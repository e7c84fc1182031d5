// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Select: wait on several channel operations, run exactly one.
//!
//! Arms are tried in a fresh uniformly random order on every attempt, so
//! no arm can starve another that is ready just as often. With a default
//! arm the select never parks. Without one it registers on every channel
//! involved and parks until one of them changes state.
//!
//! Only the chosen arm takes effect. A parked select commits through its
//! signal's claim: it holds the claim while trying its arms, and an
//! unbuffered sender that claims it first delivers into one receive arm's
//! slot, which then is the arm that fires. Other arms leave their channels
//! untouched; a pending send arm keeps its value and drops it with the
//! select.

use std::sync::Arc;

use log::trace;
use parking_lot::Mutex;
use rand::seq::SliceRandom;

use crate::channel::{Chan, Receiver, Sender, Slot, TryRecvError, TrySendError};
use crate::error::SyncError;
use crate::signal::Signal;

/// A channel a parked selector is registered on.
trait Watch {
    fn unwatch(&self, signal: &Arc<Signal>);
    fn wake_others(&self, signal: &Arc<Signal>);
}

impl<T> Watch for Chan<T> {
    fn unwatch(&self, signal: &Arc<Signal>) {
        Chan::unwatch(self, signal)
    }

    fn wake_others(&self, signal: &Arc<Signal>) {
        Chan::wake_others(self, signal)
    }
}

/// Registration on a set of channels, undone on drop.
struct Watching<'a> {
    targets: Vec<Arc<dyn Watch + 'a>>,
    signal: Arc<Signal>,
}

impl Watching<'_> {
    /// Senders turned away while we held our own claim get another look.
    fn wake_others(&self) {
        for chan in &self.targets {
            chan.wake_others(&self.signal);
        }
    }
}

impl Drop for Watching<'_> {
    fn drop(&mut self) {
        for chan in &self.targets {
            chan.unwatch(&self.signal);
        }
    }
}

trait Arm<'a, R> {
    /// Try the operation without blocking. `None` = not ready.
    fn attempt(&mut self) -> Option<Result<R, SyncError>>;
    /// Register on the arm's channel.
    fn watch(&self, signal: &Arc<Signal>) -> Arc<dyn Watch + 'a>;
    /// Fire on a value a sender delivered while we were parked.
    fn take_delivered(&mut self) -> Option<R> {
        None
    }
}

struct RecvArm<T, F> {
    chan: Arc<Chan<T>>,
    slot: Slot<T>,
    action: Option<F>,
}

impl<'a, T: 'a, R, F> Arm<'a, R> for RecvArm<T, F>
where
    F: FnOnce(Option<T>) -> R,
{
    fn attempt(&mut self) -> Option<Result<R, SyncError>> {
        let received = match self.chan.try_recv() {
            Ok(val) => Some(val),
            // Closed and drained is ready: the action sees ok=false.
            Err(TryRecvError::Closed) => None,
            Err(TryRecvError::Empty) => return None,
        };
        let action = self.action.take()?;
        Some(Ok(action(received)))
    }

    fn watch(&self, signal: &Arc<Signal>) -> Arc<dyn Watch + 'a> {
        self.chan.watch(signal, Some(self.slot.clone()));
        let chan: Arc<dyn Watch + 'a> = self.chan.clone();
        chan
    }

    fn take_delivered(&mut self) -> Option<R> {
        let val = self.slot.lock().take()?;
        let action = self.action.take()?;
        Some(action(Some(val)))
    }
}

struct SendArm<T, F> {
    chan: Arc<Chan<T>>,
    value: Option<T>,
    action: Option<F>,
}

impl<'a, T: 'a, R, F> Arm<'a, R> for SendArm<T, F>
where
    F: FnOnce() -> R,
{
    fn attempt(&mut self) -> Option<Result<R, SyncError>> {
        let val = self.value.take()?;
        match self.chan.try_send(val) {
            Ok(()) => self.action.take().map(|action| Ok(action())),
            Err(TrySendError::Full(val)) => {
                self.value = Some(val);
                None
            }
            Err(TrySendError::Closed(_)) => Some(Err(SyncError::SendOnClosed)),
        }
    }

    fn watch(&self, signal: &Arc<Signal>) -> Arc<dyn Watch + 'a> {
        self.chan.watch(signal, None);
        let chan: Arc<dyn Watch + 'a> = self.chan.clone();
        chan
    }
}

/// A one-shot select. Build with arms, then [`Select::run`].
///
/// ```ignore
/// let got = Select::new()
///     .recv(&rx1, |v| v.map(|s| format!("one: {}", s)))
///     .recv(&rx2, |v| v.map(|s| format!("two: {}", s)))
///     .run()?;
/// ```
pub struct Select<'a, R> {
    arms: Vec<Box<dyn Arm<'a, R> + 'a>>,
    default: Option<Box<dyn FnOnce() -> R + 'a>>,
    biased: bool,
}

impl<'a, R> Select<'a, R> {
    pub fn new() -> Self {
        Self {
            arms: Vec::new(),
            default: None,
            biased: false,
        }
    }

    /// Receive arm. The action gets `Some(value)`, or `None` if the
    /// channel is closed and drained.
    pub fn recv<T: 'a, F>(mut self, rx: &Receiver<T>, action: F) -> Self
    where
        F: FnOnce(Option<T>) -> R + 'a,
    {
        self.arms.push(Box::new(RecvArm {
            chan: rx.chan.clone(),
            slot: Arc::new(Mutex::new(None)),
            action: Some(action),
        }));
        self
    }

    /// Send arm. Fires when `value` can be handed off without blocking.
    pub fn send<T: 'a, F>(mut self, tx: &Sender<T>, value: T, action: F) -> Self
    where
        F: FnOnce() -> R + 'a,
    {
        self.arms.push(Box::new(SendArm {
            chan: tx.chan.clone(),
            value: Some(value),
            action: Some(action),
        }));
        self
    }

    /// Default arm: makes the select non-blocking.
    pub fn default<F>(mut self, action: F) -> Self
    where
        F: FnOnce() -> R + 'a,
    {
        self.default = Some(Box::new(action));
        self
    }

    /// Try arms in the order they were added instead of at random.
    pub fn biased(mut self) -> Self {
        self.biased = true;
        self
    }

    /// Run exactly one ready arm (or the default) and return its result.
    pub fn run(mut self) -> Result<R, SyncError> {
        let mut order: Vec<usize> = (0..self.arms.len()).collect();
        let mut rng = rand::thread_rng();

        if let Some(default) = self.default.take() {
            if let Some(result) = self.attempt_all(&mut order, &mut rng) {
                return result;
            }
            return Ok(default());
        }

        if self.arms.is_empty() {
            return Err(SyncError::EmptySelect);
        }

        let signal = Arc::new(Signal::new());
        let watching = Watching {
            targets: self.arms.iter().map(|arm| arm.watch(&signal)).collect(),
            signal: signal.clone(),
        };

        loop {
            if !signal.try_claim() {
                // A sender claimed us and is filling a receive slot.
                return Ok(self.take_delivered(&signal));
            }
            if let Some(result) = self.attempt_all(&mut order, &mut rng) {
                return result;
            }
            if signal.release() {
                watching.wake_others();
            }
            trace!("select parked on {} arm(s)", order.len());
            signal.wait();
        }
    }

    fn attempt_all(
        &mut self,
        order: &mut [usize],
        rng: &mut impl rand::Rng,
    ) -> Option<Result<R, SyncError>> {
        if !self.biased {
            order.shuffle(rng);
        }
        order.iter().find_map(|&idx| self.arms[idx].attempt())
    }

    fn take_delivered(&mut self, signal: &Signal) -> R {
        loop {
            if let Some(result) = self.arms.iter_mut().find_map(|arm| arm.take_delivered()) {
                return result;
            }
            signal.wait();
        }
    }
}

impl<R> Default for Select<'_, R> {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of a select over homogeneous receivers.
#[derive(Debug, PartialEq, Eq)]
pub enum SelectResult<T> {
    /// Received a value from channel at the given index.
    Recv(usize, T),
    /// Default arm fired (non-blocking, all channels empty).
    Default,
    /// All channels closed.
    AllClosed,
}

/// Fair select over receivers of one type (random order, see [`Select`]).
///
/// Closed channels are skipped; `AllClosed` once every channel is closed
/// and drained. `has_default`: return `Default` instead of parking.
pub fn select_recv<T>(receivers: &[&Receiver<T>], has_default: bool) -> SelectResult<T> {
    select_over(receivers, has_default, false)
}

/// Priority select: evaluates arms in listed order.
pub fn select_priority_recv<T>(receivers: &[&Receiver<T>], has_default: bool) -> SelectResult<T> {
    select_over(receivers, has_default, true)
}

fn select_over<T>(receivers: &[&Receiver<T>], has_default: bool, biased: bool) -> SelectResult<T> {
    loop {
        let live: Vec<(usize, &Receiver<T>)> = receivers
            .iter()
            .enumerate()
            .filter(|(_, rx)| !(rx.is_closed() && rx.is_empty()))
            .map(|(idx, rx)| (idx, *rx))
            .collect();
        if live.is_empty() {
            return SelectResult::AllClosed;
        }

        let mut select = Select::new();
        for (idx, rx) in live {
            select = select.recv(rx, move |val| match val {
                Some(val) => SelectResult::Recv(idx, val),
                // Closed since we looked; recompute the live set.
                None => SelectResult::AllClosed,
            });
        }
        if has_default {
            select = select.default(|| SelectResult::Default);
        }
        if biased {
            select = select.biased();
        }

        match select.run() {
            Ok(SelectResult::AllClosed) => continue,
            Ok(result) => return result,
            Err(_) => return SelectResult::AllClosed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{self, Channel};
    use crate::timeout::{with_timeout, TimedOut};
    use std::thread;
    use std::time::Duration;

    #[test]
    fn select_single_channel() {
        let (tx, rx) = channel::buffered(10);
        tx.send(42).unwrap();
        match select_recv(&[&rx], false) {
            SelectResult::Recv(0, val) => assert_eq!(val, 42),
            other => panic!("expected Recv(0, 42), got {:?}", other),
        }
    }

    #[test]
    fn select_multiple_channels() {
        let (tx1, rx1) = channel::buffered(10);
        let (_tx2, rx2) = channel::buffered::<i32>(10);
        tx1.send(99).unwrap();
        match select_recv(&[&rx1, &rx2], false) {
            SelectResult::Recv(0, val) => assert_eq!(val, 99),
            other => panic!("expected Recv(0, 99), got {:?}", other),
        }
    }

    #[test]
    fn select_default_arm() {
        let (_tx, rx) = channel::buffered::<i32>(10);
        assert_eq!(select_recv(&[&rx], true), SelectResult::Default);
    }

    #[test]
    fn select_all_closed() {
        let (tx, rx) = channel::buffered::<i32>(10);
        tx.close().unwrap();
        assert_eq!(select_recv(&[&rx], false), SelectResult::AllClosed);
    }

    #[test]
    fn select_skips_closed_and_waits_on_live() {
        let (tx1, rx1) = channel::buffered::<i32>(1);
        let (tx2, rx2) = channel::buffered::<i32>(1);
        tx1.close().unwrap();
        thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            tx2.send(5).unwrap();
        });
        assert_eq!(select_recv(&[&rx1, &rx2], false), SelectResult::Recv(1, 5));
    }

    #[test]
    fn select_priority_first_ready_wins() {
        let (tx1, rx1) = channel::buffered(10);
        let (tx2, rx2) = channel::buffered(10);
        tx1.send(1).unwrap();
        tx2.send(2).unwrap();
        // Priority: rx1 always checked first
        match select_priority_recv(&[&rx1, &rx2], false) {
            SelectResult::Recv(0, val) => assert_eq!(val, 1),
            other => panic!("expected Recv(0, 1), got {:?}", other),
        }
    }

    #[test]
    fn select_priority_parks_until_send() {
        let (tx, rx) = channel::unbuffered::<&str>();
        let (_tx2, rx2) = channel::buffered::<&str>(1);
        let h = thread::spawn(move || tx.send("late").unwrap());
        assert_eq!(
            select_priority_recv(&[&rx2, &rx], false),
            SelectResult::Recv(1, "late")
        );
        h.join().unwrap();
    }

    #[test]
    fn builder_default_when_nothing_ready() {
        let (_tx, rx) = channel::buffered::<i32>(1);
        let r = Select::new()
            .recv(&rx, |_| "recv")
            .default(|| "default")
            .run()
            .unwrap();
        assert_eq!(r, "default");
    }

    #[test]
    fn builder_blocks_until_ready() {
        let (tx1, rx1) = channel::unbuffered::<String>();
        let (tx2, rx2) = channel::unbuffered::<String>();
        thread::spawn(move || tx1.send("Raden Ario Damar".to_string()).unwrap());
        thread::spawn(move || tx2.send("Raden Ario Damar".to_string()).unwrap());

        let mut counter = 0;
        while counter < 2 {
            let got = Select::new()
                .recv(&rx1, |v| v)
                .recv(&rx2, |v| v)
                .run()
                .unwrap();
            assert_eq!(got.as_deref(), Some("Raden Ario Damar"));
            counter += 1;
        }
    }

    #[test]
    fn only_chosen_arm_takes_effect() {
        let (tx1, rx1) = channel::buffered(1);
        let (tx2, rx2) = channel::buffered(1);
        tx1.send(1).unwrap();
        tx2.send(2).unwrap();
        let got = Select::new()
            .recv(&rx1, |v| v)
            .recv(&rx2, |v| v)
            .run()
            .unwrap()
            .unwrap();
        let left = if got == 1 { rx2.len() } else { rx1.len() };
        assert_eq!(left, 1);
    }

    #[test]
    fn ready_arms_chosen_fairly() {
        let (tx1, rx1) = channel::buffered(1);
        let (tx2, rx2) = channel::buffered(1);
        let mut hits = [0usize; 2];
        for _ in 0..400 {
            if rx1.is_empty() {
                tx1.send(()).unwrap();
            }
            if rx2.is_empty() {
                tx2.send(()).unwrap();
            }
            let idx = Select::new()
                .recv(&rx1, |_| 0)
                .recv(&rx2, |_| 1)
                .run()
                .unwrap();
            hits[idx] += 1;
        }
        assert!(hits[0] > 100, "arm 0 starved: {:?}", hits);
        assert!(hits[1] > 100, "arm 1 starved: {:?}", hits);
    }

    #[test]
    fn send_arm_hands_off_to_parked_receiver() {
        let (tx, rx) = channel::unbuffered::<i32>();
        let h = thread::spawn(move || rx.recv());
        let sent = Select::new().send(&tx, 7, || true).run().unwrap();
        assert!(sent);
        assert_eq!(h.join().unwrap(), Some(7));
    }

    #[test]
    fn send_arm_on_full_channel_keeps_value() {
        let (tx, rx) = channel::buffered(1);
        tx.send(1).unwrap();
        let r = Select::new()
            .send(&tx, 2, || "sent")
            .default(|| "full")
            .run()
            .unwrap();
        assert_eq!(r, "full");
        assert_eq!(rx.recv(), Some(1));
        assert!(rx.is_empty());
    }

    #[test]
    fn send_arm_on_closed_channel_is_usage_error() {
        let (tx, _rx) = channel::buffered::<i32>(1);
        tx.close().unwrap();
        let r = Select::new().send(&tx, 1, || ()).run();
        assert_eq!(r, Err(SyncError::SendOnClosed));
    }

    #[test]
    fn recv_arm_sees_closed() {
        let (tx, rx) = channel::buffered::<i32>(1);
        tx.close().unwrap();
        let r = Select::new().recv(&rx, |v| v.is_none()).run().unwrap();
        assert!(r);
    }

    #[test]
    fn empty_select_is_usage_error() {
        let r: Result<(), _> = Select::new().run();
        assert_eq!(r, Err(SyncError::EmptySelect));
    }

    #[test]
    fn default_loop_until_counter() {
        let (tx1, rx1) = channel::unbuffered::<&str>();
        let (tx2, rx2) = channel::unbuffered::<&str>();
        thread::spawn(move || tx1.send("one").unwrap());
        thread::spawn(move || tx2.send("two").unwrap());

        let mut counter = 0;
        while counter < 2 {
            let got = Select::new()
                .recv(&rx1, |v| v.is_some())
                .recv(&rx2, |v| v.is_some())
                .default(|| false)
                .run()
                .unwrap();
            if got {
                counter += 1;
            } else {
                thread::yield_now();
            }
        }
        assert_eq!(counter, 2);
    }

    #[test]
    fn select_does_not_rendezvous_with_itself() {
        let ch = Channel::<i32>::unbuffered();
        let (tx, rx) = (ch.as_send_only(), ch.as_receive_only());
        let r = with_timeout(Duration::from_millis(100), move || {
            Select::new()
                .recv(&rx, |_| "recv")
                .send(&tx, 5, || "send")
                .run()
        });
        assert_eq!(r, Err(TimedOut));
        assert!(ch.is_empty());
    }

    #[test]
    fn mixed_select_with_default_leaves_channel_alone() {
        let ch = Channel::<i32>::unbuffered();
        let (tx, rx) = (ch.as_send_only(), ch.as_receive_only());
        let r = Select::new()
            .recv(&rx, |_| "recv")
            .send(&tx, 5, || "send")
            .default(|| "default")
            .run()
            .unwrap();
        assert_eq!(r, "default");
        assert!(ch.is_empty());
    }

    #[test]
    fn send_arm_delivers_into_parked_select() {
        let one = Channel::<i32>::unbuffered();
        let two = Channel::<i32>::unbuffered();
        let (rx1, rx2) = (one.as_receive_only(), two.as_receive_only());
        let h = thread::spawn(move || {
            Select::new()
                .recv(&rx1, |v| (1, v))
                .recv(&rx2, |v| (2, v))
                .run()
                .unwrap()
        });
        thread::sleep(Duration::from_millis(50));

        let first = Select::new()
            .send(&one.as_send_only(), 10, || true)
            .default(|| false)
            .run()
            .unwrap();
        // The parked select is already committed to `one`.
        let second = Select::new()
            .send(&two.as_send_only(), 20, || true)
            .default(|| false)
            .run()
            .unwrap();

        assert!(first);
        assert!(!second);
        assert_eq!(h.join().unwrap(), (1, Some(10)));
        assert!(one.is_empty());
        assert!(two.is_empty());
    }

    #[test]
    fn try_send_delivers_into_parked_select() {
        let ch = Channel::<&str>::unbuffered();
        let rx = ch.as_receive_only();
        let h = thread::spawn(move || Select::new().recv(&rx, |v| v).run().unwrap());
        thread::sleep(Duration::from_millis(50));
        assert_eq!(ch.try_send("Raden"), Ok(()));
        assert_eq!(h.join().unwrap(), Some("Raden"));
        assert!(ch.is_empty());
        // Nobody is parked any more.
        assert_eq!(ch.try_send("Ario"), Err(TrySendError::Full("Ario")));
    }

    #[test]
    fn parked_selects_pair_up() {
        let ch = Channel::<u8>::unbuffered();
        let rx = ch.as_receive_only();
        let receiver = thread::spawn(move || Select::new().recv(&rx, |v| v).run().unwrap());
        let tx = ch.as_send_only();
        let sender = thread::spawn(move || Select::new().send(&tx, 3, || "sent").run().unwrap());
        assert_eq!(sender.join().unwrap(), "sent");
        assert_eq!(receiver.join().unwrap(), Some(3));
        assert!(ch.is_empty());
    }
}
