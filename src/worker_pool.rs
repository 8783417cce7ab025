// Copyright 2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! A worker pool running each task on its own thread, with bounded
//! concurrency.

use crate::cancel::CancellationToken;
use crate::error::Error;
use crate::macros::{log_debug, log_error, log_trace, log_warn};
use crate::semaphore::{Permit, Semaphore};
use crate::stream::Stream;
use crate::util::Status;
use crossbeam_channel::select;
use crossbeam_utils::CachePadded;
use std::num::NonZeroUsize;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

/// A unit of work executed by a [`WorkerPool`].
///
/// The pool doesn't inspect what a task does: if it panics, the panic is
/// contained to the task and logged.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Maximum number of tasks that a [`WorkerPool`] runs concurrently.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolLimit {
    /// Use the number of threads returned by
    /// [`std::thread::available_parallelism()`].
    AvailableParallelism,
    /// Use the given number of concurrent tasks.
    Count(NonZeroUsize),
}

impl PoolLimit {
    fn resolve(self) -> NonZeroUsize {
        match self {
            PoolLimit::Count(count) => count,
            PoolLimit::AvailableParallelism => {
                std::thread::available_parallelism().unwrap_or_else(|_e| {
                    log_warn!("Getting the available parallelism failed, using a limit of 1: {_e}");
                    NonZeroUsize::MIN
                })
            }
        }
    }
}

impl From<NonZeroUsize> for PoolLimit {
    fn from(count: NonZeroUsize) -> Self {
        PoolLimit::Count(count)
    }
}

macro_rules! impl_pool_limit_try_from {
    ( $($int:ty),* ) => {
        $(
            impl TryFrom<$int> for PoolLimit {
                type Error = Error;

                fn try_from(limit: $int) -> Result<Self, Error> {
                    usize::try_from(limit)
                        .ok()
                        .and_then(NonZeroUsize::new)
                        .map(PoolLimit::Count)
                        .ok_or(Error::InvalidConfiguration {
                            limit: limit as i128,
                        })
                }
            }
        )*
    };
}

impl_pool_limit_try_from!(usize, u32, u64, isize, i32, i64);

/// A builder for [`WorkerPool`].
#[derive(Clone, Debug)]
pub struct WorkerPoolBuilder {
    /// Maximum number of tasks running concurrently.
    pub limit: PoolLimit,
    /// Stack size of the threads spawned by the pool (the admission thread and
    /// the tasks), or the platform's default if [`None`].
    pub stack_size: Option<usize>,
}

impl WorkerPoolBuilder {
    /// Creates a worker pool.
    ///
    /// ```
    /// # use pipelight::{stream_of, PoolLimit, Task, WorkerPoolBuilder};
    /// # use std::sync::atomic::{AtomicUsize, Ordering};
    /// # use std::sync::Arc;
    /// let pool = WorkerPoolBuilder {
    ///     limit: PoolLimit::AvailableParallelism,
    ///     stack_size: Some(256 * 1024),
    /// }
    /// .build();
    ///
    /// let counter = Arc::new(AtomicUsize::new(0));
    /// let tasks = (0..10).map(|_| {
    ///     let counter = counter.clone();
    ///     Box::new(move || {
    ///         counter.fetch_add(1, Ordering::Relaxed);
    ///     }) as Task
    /// });
    /// pool.start(stream_of(tasks));
    /// pool.wait();
    /// assert_eq!(counter.load(Ordering::Relaxed), 10);
    /// ```
    pub fn build(&self) -> WorkerPool {
        WorkerPool::with_config(self.limit.resolve(), self.stack_size)
    }
}

/// Externally visible state of a [`WorkerPool`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PoolState {
    /// The pool was created but not started yet.
    Idle,
    /// The pool admits tasks from its source.
    Running,
    /// The pool doesn't admit tasks anymore, but some of them may still be
    /// running.
    Draining,
    /// No task is running and none will ever be started.
    Stopped,
}

/// Snapshot of the counters of a [`WorkerPool`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Number of tasks admitted so far, i.e. that were given a slot.
    pub admitted: usize,
    /// Number of admitted tasks that have finished running (including those
    /// that panicked).
    pub completed: usize,
    /// Number of tasks that were received from the source but never started
    /// because the pool was stopped while they waited for a slot.
    pub abandoned: usize,
}

impl PoolStats {
    /// Number of tasks running at the time of the snapshot.
    pub fn running(&self) -> usize {
        self.admitted.saturating_sub(self.completed)
    }
}

/// Internal lifecycle, refining [`PoolState`] with who reclaims the slots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    /// The admission loop has exited. `reclaiming` is set once a caller of
    /// [`WorkerPool::wait()`] has started waiting for the running tasks.
    Draining {
        reclaiming: bool,
    },
    Stopped,
}

impl Lifecycle {
    /// Moves from draining to stopped if all the admitted tasks have
    /// completed.
    fn settle(&mut self, admitted: usize, completed: usize) {
        if matches!(self, Lifecycle::Draining { .. }) && completed == admitted {
            *self = Lifecycle::Stopped;
        }
    }
}

/// A pool executing tasks with at most `limit` of them running concurrently.
///
/// Tasks are received from a [`Stream`] passed to [`start()`](Self::start).
/// Each task runs on a freshly spawned thread once it has acquired one of the
/// `limit` slots, and the slot is released when the task returns. No thread
/// idles in the pool: only the admission thread and the running tasks exist.
///
/// ```
/// # use pipelight::{Task, WorkerPool};
/// # use std::sync::{Arc, Mutex};
/// let pool = WorkerPool::new(4usize).unwrap();
/// let (sender, tasks) = crossbeam_channel::unbounded::<Task>();
/// pool.start(tasks);
///
/// let total = Arc::new(Mutex::new(0));
/// for i in 1..=100 {
///     let total = total.clone();
///     sender.send(Box::new(move || *total.lock().unwrap() += i)).unwrap();
/// }
/// drop(sender);
///
/// pool.wait();
/// assert_eq!(*total.lock().unwrap(), 5050);
/// ```
pub struct WorkerPool {
    limit: NonZeroUsize,
    shared: Arc<Shared>,
    /// Handle to the admission thread, joined by whoever reclaims the slots.
    admission: Mutex<Option<JoinHandle<()>>>,
}

/// State shared between the pool, its admission thread and its tasks.
struct Shared {
    slots: Semaphore,
    stop: CancellationToken,
    lifecycle: Status<Lifecycle>,
    stack_size: Option<usize>,
    admitted: CachePadded<AtomicUsize>,
    completed: CachePadded<AtomicUsize>,
    abandoned: CachePadded<AtomicUsize>,
}

impl WorkerPool {
    /// Creates a worker pool running at most `limit` tasks concurrently.
    ///
    /// Fails with [`Error::InvalidConfiguration`] if `limit` isn't positive.
    ///
    /// ```
    /// # use pipelight::{Error, WorkerPool};
    /// assert!(WorkerPool::new(3usize).is_ok());
    /// assert_eq!(
    ///     WorkerPool::new(0usize).err(),
    ///     Some(Error::InvalidConfiguration { limit: 0 })
    /// );
    /// assert_eq!(
    ///     WorkerPool::new(-2i32).err(),
    ///     Some(Error::InvalidConfiguration { limit: -2 })
    /// );
    /// ```
    pub fn new<L>(limit: L) -> Result<Self, Error>
    where
        L: TryInto<PoolLimit>,
        Error: From<L::Error>,
    {
        let limit: PoolLimit = limit.try_into()?;
        Ok(WorkerPoolBuilder {
            limit,
            stack_size: None,
        }
        .build())
    }

    fn with_config(limit: NonZeroUsize, stack_size: Option<usize>) -> Self {
        log_debug!("[main thread] Creating a worker pool with a limit of {limit}.");
        Self {
            limit,
            shared: Arc::new(Shared {
                slots: Semaphore::new(limit),
                stop: CancellationToken::new(),
                lifecycle: Status::new(Lifecycle::Idle),
                stack_size,
                admitted: CachePadded::new(AtomicUsize::new(0)),
                completed: CachePadded::new(AtomicUsize::new(0)),
                abandoned: CachePadded::new(AtomicUsize::new(0)),
            }),
            admission: Mutex::new(None),
        }
    }

    /// Returns the maximum number of tasks running concurrently.
    pub fn limit(&self) -> NonZeroUsize {
        self.limit
    }

    /// Returns the current state of the pool.
    pub fn state(&self) -> PoolState {
        match *self.shared.lifecycle.lock() {
            Lifecycle::Idle => PoolState::Idle,
            Lifecycle::Running => PoolState::Running,
            Lifecycle::Draining { .. } => PoolState::Draining,
            Lifecycle::Stopped => PoolState::Stopped,
        }
    }

    /// Returns a snapshot of the task counters.
    pub fn stats(&self) -> PoolStats {
        // Loading `completed` first keeps the snapshot consistent with
        // `completed <= admitted`.
        let completed = self.shared.completed.load(Ordering::SeqCst);
        PoolStats {
            admitted: self.shared.admitted.load(Ordering::SeqCst),
            completed,
            abandoned: self.shared.abandoned.load(Ordering::SeqCst),
        }
    }

    /// Starts admitting tasks from the given stream, in a background thread.
    ///
    /// The pool keeps admitting tasks until the stream ends or
    /// [`stop()`](Self::stop) is called.
    ///
    /// # Panics
    ///
    /// Panics if the pool was already started or stopped, or if the admission
    /// thread cannot be spawned. In the latter case the pool is stopped, with
    /// no task admitted.
    pub fn start(&self, tasks: Stream<Task>) {
        let started = self.shared.lifecycle.update_and_notify(|lifecycle| {
            if *lifecycle == Lifecycle::Idle {
                *lifecycle = Lifecycle::Running;
                true
            } else {
                false
            }
        });
        if !started {
            panic!("WorkerPool::start() must be called once, before any call to stop()");
        }

        let shared = self.shared.clone();
        let mut builder = std::thread::Builder::new().name("pipelight-admission".to_owned());
        if let Some(stack_size) = self.shared.stack_size {
            builder = builder.stack_size(stack_size);
        }
        let spawned = builder.spawn(move || shared.admit(tasks));
        match spawned {
            Ok(handle) => *self.admission.lock().unwrap() = Some(handle),
            Err(e) => {
                self.shared.stop.cancel();
                self.shared.lifecycle.notify_all(Lifecycle::Stopped);
                panic!("Failed to spawn thread pipelight-admission: {e}");
            }
        }
    }

    /// Waits until the task stream has ended (or the pool was stopped) and
    /// all the admitted tasks have finished running.
    ///
    /// After this returns, no task is running and no task will ever be
    /// started. Returns immediately if the pool already moved to
    /// [`PoolState::Stopped`] on its own. It is fine to call this several
    /// times, or concurrently with [`stop()`](Self::stop).
    ///
    /// # Panics
    ///
    /// Panics if the pool was never started nor stopped, as the call would
    /// otherwise block forever.
    pub fn wait(&self) {
        let reclaim = {
            let mut lifecycle = self.shared.lifecycle.wait_while(|lifecycle| {
                matches!(
                    lifecycle,
                    Lifecycle::Running | Lifecycle::Draining { reclaiming: true }
                )
            });
            let current = *lifecycle;
            match current {
                Lifecycle::Idle => None,
                Lifecycle::Stopped => Some(false),
                Lifecycle::Draining { reclaiming: false } => {
                    *lifecycle = Lifecycle::Draining { reclaiming: true };
                    Some(true)
                }
                Lifecycle::Running | Lifecycle::Draining { reclaiming: true } => {
                    unreachable!()
                }
            }
        };

        match reclaim {
            None => panic!("WorkerPool::wait() called before WorkerPool::start()"),
            Some(false) => (),
            Some(true) => self.reclaim_slots(),
        }
    }

    /// Stops admitting tasks, then waits for the admitted tasks to finish
    /// running.
    ///
    /// Tasks still in the stream, or waiting for a slot, are never started.
    /// Calling this before [`start()`](Self::start) stops the pool for good.
    /// It is fine to call this several times, or concurrently with
    /// [`wait()`](Self::wait).
    pub fn stop(&self) {
        log_debug!("[main thread] Stopping the worker pool.");
        self.shared.stop.cancel();
        self.shared.lifecycle.update_and_notify(|lifecycle| {
            if *lifecycle == Lifecycle::Idle {
                *lifecycle = Lifecycle::Stopped;
            }
        });
        self.wait();
    }

    /// Waits for the admission thread to exit and for all the slots to be
    /// released, then keeps them so that no task starts anymore.
    fn reclaim_slots(&self) {
        let handle = self.admission.lock().unwrap().take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                log_error!("[main thread] The admission thread panicked.");
            }
        }

        log_debug!("[main thread] Waiting for the running tasks to finish.");
        self.shared.slots.acquire_all();
        self.shared.lifecycle.notify_all(Lifecycle::Stopped);
        log_debug!("[main thread] Worker pool stopped: {:?}", self.stats());
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Don't let the admission thread outlive the pool. Running tasks
        // finish on their own threads.
        self.shared.stop.cancel();
    }
}

impl Shared {
    /// Admission loop: receives tasks and launches each of them once it has
    /// a slot.
    fn admit(self: Arc<Self>, tasks: Stream<Task>) {
        log_debug!("[admission] Started.");
        let mut id = 0;
        loop {
            // `select!` doesn't prioritize, so a stream with many pending
            // tasks could keep winning over the stop signal.
            if self.stop.is_cancelled() {
                log_debug!("[admission] Stop requested.");
                break;
            }

            let task = select! {
                recv(tasks) -> msg => match msg {
                    Ok(task) => task,
                    Err(_) => {
                        log_debug!("[admission] The task stream ended.");
                        break;
                    }
                },
                recv(self.stop.signal()) -> _ => {
                    log_debug!("[admission] Stop requested.");
                    break;
                }
            };

            let Some(permit) = self.slots.acquire(&self.stop) else {
                log_debug!("[admission] Stop requested while task #{id} waited for a slot.");
                self.abandoned.fetch_add(1, Ordering::SeqCst);
                break;
            };
            self.admitted.fetch_add(1, Ordering::SeqCst);
            log_trace!("[admission] Admitted task #{id}.");
            self.launch(id, task, permit);
            id += 1;
        }

        // `admitted` is final from here on, so either this or the last task
        // to complete sees all of them completed.
        self.lifecycle.update_and_notify(|lifecycle| {
            *lifecycle = Lifecycle::Draining { reclaiming: false };
            lifecycle.settle(
                self.admitted.load(Ordering::SeqCst),
                self.completed.load(Ordering::SeqCst),
            );
        });
        log_debug!("[admission] Exiting after admitting {id} task(s).");
    }

    /// Runs the task on a new thread, or inline if no thread can be spawned so
    /// that an admitted task always runs.
    fn launch(self: &Arc<Self>, id: usize, task: Task, permit: Permit) {
        let job = Job {
            id,
            task,
            _slot: Slot {
                shared: self.clone(),
                permit: Some(permit),
            },
        };
        let handoff = Arc::new(Mutex::new(Some(job)));

        let mut builder = std::thread::Builder::new().name(format!("pipelight-task-{id}"));
        if let Some(stack_size) = self.stack_size {
            builder = builder.stack_size(stack_size);
        }
        let spawned = builder.spawn({
            let handoff = handoff.clone();
            move || {
                let job = handoff.lock().unwrap().take();
                if let Some(job) = job {
                    job.run();
                }
            }
        });

        if let Err(_e) = spawned {
            log_warn!("[admission] Failed to spawn a thread for task #{id}, running it inline: {_e}");
            let job = handoff.lock().unwrap().take();
            if let Some(job) = job {
                job.run();
            }
        }
    }
}

/// An admitted task with its slot.
struct Job {
    id: usize,
    task: Task,
    _slot: Slot,
}

impl Job {
    fn run(self) {
        let Job { id: _id, task, _slot } = self;
        if std::panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
            log_error!("[task #{_id}] The task panicked.");
        }
        log_trace!("[task #{_id}] Finished.");
        // Dropping `_slot` releases the slot.
    }
}

/// Marks the task as completed then releases its slot, in this order, so
/// that the counters are final once all the slots are reclaimed. The last
/// task to complete after the admission loop exited stops the pool.
struct Slot {
    shared: Arc<Shared>,
    permit: Option<Permit>,
}

impl Drop for Slot {
    fn drop(&mut self) {
        self.shared.completed.fetch_add(1, Ordering::SeqCst);
        drop(self.permit.take());

        let shared = &self.shared;
        shared.lifecycle.update_and_notify(|lifecycle| {
            lifecycle.settle(
                shared.admitted.load(Ordering::SeqCst),
                shared.completed.load(Ordering::SeqCst),
            );
        });
    }
}
