// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Spawning workers.
//!
//! `spawn` gives every worker its own OS thread. `WorkerPool` runs workers
//! on a fixed set of threads fed through a bounded job channel, so a test
//! that starts a thousand workers uses a predictable number of threads;
//! `spawn` blocks once the queue is full.
//!
//! Pool workers that block on each other can exhaust the pool. Work that
//! must all be running at once (rendezvous partners, lock-order demos)
//! belongs on `spawn`.

use std::any::Any;
use std::fmt;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::{debug, error, trace};
use thiserror::Error;

use crate::channel::{self, Receiver, Sender};

/// Error returned by `join()` when the task failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinError {
    /// Task panicked with the given message.
    Panicked(String),
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JoinError::Panicked(msg) => write!(f, "task panicked: {}", msg),
        }
    }
}

impl std::error::Error for JoinError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SpawnError {
    #[error("worker pool is closed")]
    PoolClosed,
}

/// Affine task handle.
///
/// Must be consumed via `join()` or `detach()`.
pub struct TaskHandle<T> {
    result: Receiver<Result<T, String>>,
    consumed: bool,
}

impl<T> TaskHandle<T> {
    fn new(result: Receiver<Result<T, String>>) -> Self {
        Self {
            result,
            consumed: false,
        }
    }

    /// Wait for the task to complete, returning its result.
    pub fn join(mut self) -> Result<T, JoinError> {
        self.consumed = true;
        match self.result.recv() {
            Some(Ok(val)) => Ok(val),
            Some(Err(msg)) => Err(JoinError::Panicked(msg)),
            // Nothing closes a task's result channel.
            None => unreachable!("task result channel closed"),
        }
    }

    /// Fire-and-forget. The task keeps running; its result is dropped.
    pub fn detach(mut self) {
        self.consumed = true;
    }

    pub fn is_finished(&self) -> bool {
        !self.result.is_empty()
    }
}

impl<T> Drop for TaskHandle<T> {
    fn drop(&mut self) {
        if !self.consumed && !thread::panicking() {
            panic!("TaskHandle dropped without being joined or detached");
        }
    }
}

/// Workers running right now, across `spawn` and every pool.
static LIVE_WORKERS: AtomicUsize = AtomicUsize::new(0);

/// Number of workers currently running user code, process-wide.
pub fn live_workers() -> usize {
    LIVE_WORKERS.load(Ordering::SeqCst)
}

/// CPU cores the process may use. Falls back to 4 when unknown.
pub fn available_parallelism() -> usize {
    thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4)
}

/// Run `f`, turning a panic into its message. Counted in `live_workers`.
fn run_caught<T>(f: impl FnOnce() -> T) -> Result<T, String> {
    LIVE_WORKERS.fetch_add(1, Ordering::SeqCst);
    let result = panic::catch_unwind(AssertUnwindSafe(f)).map_err(panic_message);
    LIVE_WORKERS.fetch_sub(1, Ordering::SeqCst);
    result
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Spawn a worker on its own OS thread.
///
/// Returns an affine `TaskHandle` that must be consumed.
pub fn spawn<T, F>(f: F) -> TaskHandle<T>
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    let (tx, rx) = channel::buffered(1);
    thread::spawn(move || {
        let _ = tx.send(run_caught(f));
    });
    TaskHandle::new(rx)
}

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Worker pool sizing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Worker threads. 0 = number of available CPU cores.
    pub workers: usize,
    /// Jobs queued before `spawn` blocks. 0 = hand each job straight to an idle worker.
    pub queue_capacity: usize,
    pub name_prefix: String,
}

impl PoolConfig {
    pub fn workers(mut self, n: usize) -> Self {
        self.workers = n;
        self
    }

    pub fn queue_capacity(mut self, n: usize) -> Self {
        self.queue_capacity = n;
        self
    }

    pub fn name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.name_prefix = prefix.into();
        self
    }

    /// Threads a pool built from this config starts.
    pub fn worker_count(&self) -> usize {
        if self.workers == 0 {
            available_parallelism()
        } else {
            self.workers
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            queue_capacity: 1024,
            name_prefix: "tandem-worker".to_string(),
        }
    }
}

/// Fixed set of worker threads pulling jobs from a bounded channel.
pub struct WorkerPool {
    jobs: Sender<Job>,
    workers: Vec<JoinHandle<()>>,
    /// Jobs being run right now.
    active: Arc<AtomicUsize>,
}

impl WorkerPool {
    /// Start a pool with `n` workers (0 = one per CPU core).
    pub fn new(n: usize) -> io::Result<Self> {
        Self::with_config(PoolConfig::default().workers(n))
    }

    pub fn with_config(config: PoolConfig) -> io::Result<Self> {
        let count = config.worker_count();
        let (jobs, queue) = channel::buffered::<Job>(config.queue_capacity);
        let active = Arc::new(AtomicUsize::new(0));

        let spawned: io::Result<Vec<_>> = (0..count)
            .map(|id| {
                let queue = queue.clone();
                let active = active.clone();
                thread::Builder::new()
                    .name(format!("{}-{}", config.name_prefix, id))
                    .spawn(move || worker_loop(id, queue, &active))
            })
            .collect();
        let workers = match spawned {
            Ok(workers) => workers,
            Err(e) => {
                // Let the workers that did start exit.
                let _ = jobs.close();
                return Err(e);
            }
        };

        debug!(
            "worker pool started: {} worker(s), queue capacity {}",
            count, config.queue_capacity
        );
        Ok(Self {
            jobs,
            workers,
            active,
        })
    }

    /// Queue `f` and return a handle to its result.
    pub fn spawn<T, F>(&self, f: F) -> Result<TaskHandle<T>, SpawnError>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = channel::buffered(1);
        let job: Job = Box::new(move || {
            let _ = tx.send(run_caught(f));
        });
        self.jobs.send(job).map_err(|_| SpawnError::PoolClosed)?;
        Ok(TaskHandle::new(rx))
    }

    /// Queue `f` without a handle. A panic is logged and swallowed.
    pub fn execute<F>(&self, f: F) -> Result<(), SpawnError>
    where
        F: FnOnce() + Send + 'static,
    {
        let job: Job = Box::new(move || {
            if let Err(msg) = run_caught(f) {
                error!("pool job panicked: {}", msg);
            }
        });
        self.jobs.send(job).map_err(|_| SpawnError::PoolClosed)
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Jobs a worker is running at this moment. Queued jobs don't count.
    pub fn active_jobs(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Stop accepting jobs. Queued jobs still run.
    pub fn close(&self) {
        let _ = self.jobs.close();
    }

    /// Close, run everything still queued, and join the workers.
    pub fn shutdown(mut self) {
        self.close();
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                error!("pool worker thread panicked");
            }
        }
        debug!("worker pool shut down");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if !self.workers.is_empty() && !self.jobs.is_closed() {
            // Workers drain the queue and exit on their own.
            self.close();
        }
    }
}

fn worker_loop(id: usize, queue: Receiver<Job>, active: &AtomicUsize) {
    trace!("worker {} started", id);
    for job in &queue {
        active.fetch_add(1, Ordering::SeqCst);
        job();
        active.fetch_sub(1, Ordering::SeqCst);
    }
    trace!("worker {} exiting, queue closed", id);
}
