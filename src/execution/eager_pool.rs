//! # Eager Thread Pool
//!
//! Background executor that grows to its maximum size before it starts queueing.
//!
//! ## Overview
//!
//! A conventional bounded pool keeps `core` workers and only adds threads once its queue
//! is full, which with an unbounded queue means never. This pool inverts that: on every
//! submission it temporarily raises its worker target to `max_threads`, so a task that
//! finds no idle worker gets a fresh thread, then lowers the target back to
//! `core_threads`. Workers above the core floor retire after `keep_alive` without work.
//!
//! While a submission is adjusting the target, workers that finish a task wait before
//! picking up the next one, so the submitter never observes a worker count that is
//! changing under it.

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::units::Runnable;
use crate::error::{BusError, HandlerError, Result};

/// Executes tasks off the dispatching thread.
pub trait BackgroundExecutor: Send + Sync {
    fn execute(&self, task: Box<dyn Runnable>);

    /// Stop accepting tasks. Already accepted tasks still run.
    fn shutdown(&self) {}
}

/// Sizing of an [`EagerThreadPool`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EagerPoolConfig {
    pub core_threads: usize,
    pub max_threads: usize,
    pub keep_alive: Duration,
    pub thread_name_prefix: String,
}

impl Default for EagerPoolConfig {
    fn default() -> Self {
        let cpus = thread::available_parallelism().map_or(1, |n| n.get());
        Self {
            core_threads: 2,
            max_threads: (cpus * 2).max(2),
            keep_alive: Duration::from_secs(60),
            thread_name_prefix: "event-bus-background".to_string(),
        }
    }
}

impl EagerPoolConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_threads == 0 {
            return Err(BusError::InvalidConfig(
                "max_threads must be greater than zero".to_string(),
            ));
        }
        if self.core_threads > self.max_threads {
            return Err(BusError::InvalidConfig(format!(
                "core_threads ({}) must not exceed max_threads ({})",
                self.core_threads, self.max_threads
            )));
        }
        Ok(())
    }
}

/// Point-in-time counters of an [`EagerThreadPool`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub workers: usize,
    pub idle: usize,
    pub queued: usize,
    pub completed: u64,
    pub core_threads: usize,
    pub max_threads: usize,
}

struct PoolState {
    queue: VecDeque<Box<dyn Runnable>>,
    workers: usize,
    idle: usize,
    /// Live worker target; `max_threads` during a submission, the core floor otherwise.
    target: usize,
    core_threads: usize,
    paused: bool,
    shutdown: bool,
    completed: u64,
    spawned: u64,
}

struct PoolShared {
    state: Mutex<PoolState>,
    work_available: Condvar,
    unpaused: Condvar,
    handles: Mutex<Vec<JoinHandle<()>>>,
    max_threads: usize,
    keep_alive: Duration,
    name_prefix: String,
}

/// Thread pool that prefers starting threads over queueing
pub struct EagerThreadPool {
    shared: Arc<PoolShared>,
    submission: Mutex<()>,
}

impl EagerThreadPool {
    pub fn new(config: EagerPoolConfig) -> Result<Self> {
        config.validate()?;
        info!(
            core_threads = config.core_threads,
            max_threads = config.max_threads,
            keep_alive_ms = config.keep_alive.as_millis() as u64,
            "🧵 Creating eager background pool"
        );

        Ok(Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    queue: VecDeque::new(),
                    workers: 0,
                    idle: 0,
                    target: config.core_threads,
                    core_threads: config.core_threads,
                    paused: false,
                    shutdown: false,
                    completed: 0,
                    spawned: 0,
                }),
                work_available: Condvar::new(),
                unpaused: Condvar::new(),
                handles: Mutex::new(Vec::new()),
                max_threads: config.max_threads,
                keep_alive: config.keep_alive,
                name_prefix: config.thread_name_prefix,
            }),
            submission: Mutex::new(()),
        })
    }

    pub fn with_defaults() -> Result<Self> {
        Self::new(EagerPoolConfig::default())
    }

    /// Submit a task, starting a new worker when none is idle and the pool is below
    /// `max_threads`.
    pub fn execute(&self, task: Box<dyn Runnable>) {
        let _submission = self.submission.lock();

        {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                warn!("Background pool is shut down; dropping task");
                return;
            }
            state.paused = true;
            state.target = self.shared.max_threads;
        }

        self.submit(task);

        {
            let mut state = self.shared.state.lock();
            state.target = state.core_threads;
            state.paused = false;
        }
        self.shared.unpaused.notify_all();
    }

    fn submit(&self, task: Box<dyn Runnable>) {
        let mut state = self.shared.state.lock();
        let free_workers = state.idle.saturating_sub(state.queue.len());
        if free_workers > 0 || state.workers >= state.target {
            state.queue.push_back(task);
            drop(state);
            self.shared.work_available.notify_one();
            return;
        }

        state.workers += 1;
        state.spawned += 1;
        let index = state.spawned;
        drop(state);

        if let Err(task) = self.spawn_worker(index, task) {
            let mut state = self.shared.state.lock();
            state.workers -= 1;
            state.queue.push_back(task);
            let stranded = state.workers == 0;
            drop(state);
            if stranded {
                error!("No background worker could be started; task stays queued");
            }
            self.shared.work_available.notify_one();
        }
    }

    fn spawn_worker(
        &self,
        index: u64,
        first: Box<dyn Runnable>,
    ) -> std::result::Result<(), Box<dyn Runnable>> {
        // The task comes back through this slot when the OS refuses the thread.
        let slot = Arc::new(Mutex::new(Some(first)));
        let worker_slot = Arc::clone(&slot);
        let shared = Arc::clone(&self.shared);

        let spawned = thread::Builder::new()
            .name(format!("{}-{}", self.shared.name_prefix, index))
            .spawn(move || {
                let first = worker_slot.lock().take();
                worker_loop(&shared, first);
            });

        match spawned {
            Ok(handle) => {
                let mut handles = self.shared.handles.lock();
                handles.retain(|handle| !handle.is_finished());
                handles.push(handle);
                debug!(worker = index, "Started background worker");
                Ok(())
            }
            Err(err) => {
                error!(error = %err, "Failed to start background worker");
                match slot.lock().take() {
                    Some(task) => Err(task),
                    None => Ok(()),
                }
            }
        }
    }

    /// Change the core floor. Idle workers above the new floor retire after `keep_alive`.
    pub fn set_core_threads(&self, core_threads: usize) -> Result<()> {
        if core_threads > self.shared.max_threads {
            return Err(BusError::InvalidConfig(format!(
                "core_threads ({}) must not exceed max_threads ({})",
                core_threads, self.shared.max_threads
            )));
        }
        let _submission = self.submission.lock();
        {
            let mut state = self.shared.state.lock();
            state.core_threads = core_threads;
            state.target = core_threads;
        }
        self.shared.work_available.notify_all();
        Ok(())
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            workers: state.workers,
            idle: state.idle,
            queued: state.queue.len(),
            completed: state.completed,
            core_threads: state.core_threads,
            max_threads: self.shared.max_threads,
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.state.lock().shutdown
    }

    /// Stop accepting tasks, let workers drain the queue, and wait for them to exit.
    pub fn shutdown_and_wait(&self) {
        self.signal_shutdown();
        let current = thread::current().id();
        let handles: Vec<_> = self.shared.handles.lock().drain(..).collect();
        for handle in handles {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                error!("Background worker exited by panic");
            }
        }
    }

    fn signal_shutdown(&self) {
        {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            state.paused = false;
        }
        self.shared.work_available.notify_all();
        self.shared.unpaused.notify_all();
        info!("🛑 Background pool shutting down");
    }
}

impl BackgroundExecutor for EagerThreadPool {
    fn execute(&self, task: Box<dyn Runnable>) {
        EagerThreadPool::execute(self, task);
    }

    fn shutdown(&self) {
        self.signal_shutdown();
    }
}

impl Drop for EagerThreadPool {
    fn drop(&mut self) {
        self.signal_shutdown();
    }
}

impl fmt::Debug for EagerThreadPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EagerThreadPool")
            .field("stats", &self.stats())
            .finish()
    }
}

fn run_task(task: Box<dyn Runnable>) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| task.run())) {
        error!(
            error = %HandlerError::from_panic(payload),
            "Background task panicked"
        );
    }
}

fn worker_loop(shared: &PoolShared, first: Option<Box<dyn Runnable>>) {
    let mut next = first;
    loop {
        let ran = next.take().map(run_task).is_some();

        let mut state = shared.state.lock();
        if ran {
            state.completed += 1;
        }
        while state.paused {
            shared.unpaused.wait(&mut state);
        }

        loop {
            if let Some(task) = state.queue.pop_front() {
                next = Some(task);
                break;
            }
            if state.shutdown {
                state.workers -= 1;
                return;
            }

            // Measured against the core floor, not `target`: a submission may hold the
            // target at max while this worker goes idle.
            state.idle += 1;
            let timed_out = if state.workers > state.core_threads {
                shared
                    .work_available
                    .wait_for(&mut state, shared.keep_alive)
                    .timed_out()
            } else {
                shared.work_available.wait(&mut state);
                false
            };
            state.idle -= 1;

            if timed_out && state.queue.is_empty() && state.workers > state.target {
                state.workers -= 1;
                debug!(remaining = state.workers, "Idle background worker retired");
                return;
            }
        }
    }
}
