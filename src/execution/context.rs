//! # Execution Contexts
//!
//! A named serial queue owned by exactly one thread. Tasks posted to a context run one at
//! a time on that thread in submission order; delayed tasks run once their deadline
//! passes, in deadline order (ties keep submission order).
//!
//! ## Key Features
//!
//! - **Thread binding**: a thread that drives a context can find it again through
//!   [`ExecutionContext::current`]. This is what `AsRegistered` affinity relies on.
//! - **Owned threads**: [`ContextThread::spawn`] starts a dedicated thread running a
//!   context loop and returns once the loop is accepting work.
//! - **Adopted threads**: [`Looper::prepare`] turns the calling thread into a context;
//!   the caller then drives it with [`Looper::run`] or [`Looper::pump`].
//! - **Main context**: one process-wide context, installed by the host with
//!   [`ExecutionContext::install_main`] or spawned lazily on first use.
//!
//! A task that panics is logged and the loop keeps running.

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::fmt;
use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use super::units::{task, Runnable};
use crate::error::{BusError, HandlerError, Result};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);
static MAIN_CONTEXT: OnceLock<ExecutionContext> = OnceLock::new();

thread_local! {
    static CURRENT: RefCell<Option<Weak<ContextShared>>> = const { RefCell::new(None) };
}

enum Message {
    Task {
        due: Option<Instant>,
        task: Box<dyn Runnable>,
    },
    Quit,
}

/// A task a context refused because it has stopped; the caller gets it back.
pub struct RejectedTask(Box<dyn Runnable>);

impl RejectedTask {
    pub fn into_inner(self) -> Box<dyn Runnable> {
        self.0
    }
}

impl fmt::Debug for RejectedTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RejectedTask")
    }
}

struct ContextShared {
    id: u64,
    name: String,
    sender: Sender<Message>,
    accepting: AtomicBool,
    thread: OnceLock<ThreadId>,
}

impl ContextShared {
    fn new(name: String, sender: Sender<Message>) -> Self {
        Self {
            id: NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed),
            name,
            sender,
            accepting: AtomicBool::new(true),
            thread: OnceLock::new(),
        }
    }
}

/// Handle to a serial execution context. Cheap to clone.
#[derive(Clone)]
pub struct ExecutionContext {
    shared: Arc<ContextShared>,
}

impl ExecutionContext {
    /// The context the calling thread drives, if any.
    pub fn current() -> Option<ExecutionContext> {
        CURRENT
            .with(|current| current.borrow().as_ref().and_then(Weak::upgrade))
            .map(|shared| ExecutionContext { shared })
    }

    /// The process-wide main context, spawning a dedicated "main" thread for it when the
    /// host has not installed one.
    pub fn main() -> Result<ExecutionContext> {
        if let Some(main) = MAIN_CONTEXT.get() {
            return Ok(main.clone());
        }

        let spawned = ContextThread::spawn("main")?;
        let context = spawned.context();
        match MAIN_CONTEXT.set(context.clone()) {
            Ok(()) => {
                spawned.detach();
                info!(context = %context.name(), "Started main execution context");
                Ok(context)
            }
            // Lost the race; `spawned` quits when dropped.
            Err(_) => MAIN_CONTEXT
                .get()
                .cloned()
                .ok_or(BusError::MainContextInstalled),
        }
    }

    /// Designate `context` as the process-wide main context. Only the first call (or the
    /// first lazy spawn) wins.
    pub fn install_main(context: ExecutionContext) -> Result<()> {
        let name = context.name().to_string();
        MAIN_CONTEXT
            .set(context)
            .map_err(|_| BusError::MainContextInstalled)?;
        info!(context = %name, "Installed main execution context");
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// The thread driving this context, once its loop has started.
    pub fn thread_id(&self) -> Option<ThreadId> {
        self.shared.thread.get().copied()
    }

    /// Whether the calling thread is the one driving this context.
    pub fn is_current(&self) -> bool {
        self.shared.thread.get() == Some(&thread::current().id())
    }

    /// False once the context has been asked to quit.
    pub fn is_accepting(&self) -> bool {
        self.shared.accepting.load(Ordering::Acquire)
    }

    /// Queue `task` behind everything already submitted.
    pub fn execute(&self, task: Box<dyn Runnable>) -> std::result::Result<(), RejectedTask> {
        self.submit(None, task)
    }

    /// Queue `task` to run no earlier than `delay` from now.
    pub fn execute_after(
        &self,
        delay: Duration,
        task: Box<dyn Runnable>,
    ) -> std::result::Result<(), RejectedTask> {
        self.submit(Some(Instant::now() + delay), task)
    }

    /// Convenience for running a closure on this context.
    pub fn run<F: FnOnce() + Send + 'static>(&self, f: F) -> std::result::Result<(), RejectedTask> {
        self.execute(task(f))
    }

    /// Stop accepting work. Tasks that have not started yet, delayed or not, are dropped.
    pub fn quit(&self) {
        if self.shared.accepting.swap(false, Ordering::AcqRel) {
            let _ = self.shared.sender.send(Message::Quit);
            debug!(context = %self.name(), "Execution context asked to quit");
        }
    }

    pub fn downgrade(&self) -> WeakContext {
        WeakContext {
            shared: Arc::downgrade(&self.shared),
        }
    }

    fn submit(
        &self,
        due: Option<Instant>,
        task: Box<dyn Runnable>,
    ) -> std::result::Result<(), RejectedTask> {
        if !self.is_accepting() {
            return Err(RejectedTask(task));
        }
        match self.shared.sender.send(Message::Task { due, task }) {
            Ok(()) => Ok(()),
            Err(channel::SendError(Message::Task { task, .. })) => Err(RejectedTask(task)),
            Err(channel::SendError(Message::Quit)) => Ok(()),
        }
    }
}

impl PartialEq for ExecutionContext {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }
}

impl Eq for ExecutionContext {}

impl fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .field("accepting", &self.is_accepting())
            .finish()
    }
}

/// Non-owning reference to a context.
#[derive(Clone)]
pub struct WeakContext {
    shared: Weak<ContextShared>,
}

impl WeakContext {
    /// The context, if it is still alive and accepting work.
    pub fn upgrade(&self) -> Option<ExecutionContext> {
        self.shared
            .upgrade()
            .map(|shared| ExecutionContext { shared })
            .filter(ExecutionContext::is_accepting)
    }
}

impl fmt::Debug for WeakContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakContext")
            .field("alive", &(self.shared.strong_count() > 0))
            .finish()
    }
}

struct Timer {
    due: Instant,
    seq: u64,
    task: Box<dyn Runnable>,
}

impl PartialEq for Timer {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Timer {}

impl PartialOrd for Timer {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

// Reversed so `BinaryHeap` pops the earliest deadline first.
impl Ord for Timer {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct LoopState {
    shared: Arc<ContextShared>,
    receiver: Receiver<Message>,
    timers: BinaryHeap<Timer>,
    next_seq: u64,
}

impl LoopState {
    fn new(shared: Arc<ContextShared>, receiver: Receiver<Message>) -> Self {
        Self {
            shared,
            receiver,
            timers: BinaryHeap::new(),
            next_seq: 0,
        }
    }

    /// Run due timers. Returns how many ran.
    fn run_due_timers(&mut self) -> usize {
        let now = Instant::now();
        let mut ran = 0;
        while self.timers.peek().is_some_and(|timer| timer.due <= now) {
            if let Some(timer) = self.timers.pop() {
                self.run_task(timer.task);
                ran += 1;
            }
        }
        ran
    }

    /// Handle one message. Returns false on quit.
    fn handle(&mut self, message: Message) -> bool {
        match message {
            Message::Task { due: None, task } => {
                if self.shared.accepting.load(Ordering::Acquire) {
                    self.run_task(task);
                }
                true
            }
            Message::Task {
                due: Some(due),
                task,
            } => {
                self.next_seq += 1;
                self.timers.push(Timer {
                    due,
                    seq: self.next_seq,
                    task,
                });
                true
            }
            Message::Quit => false,
        }
    }

    fn run(&mut self) {
        loop {
            self.run_due_timers();

            let received = match self.timers.peek() {
                Some(timer) => match self.receiver.recv_deadline(timer.due) {
                    Ok(message) => message,
                    Err(RecvTimeoutError::Timeout) => continue,
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match self.receiver.recv() {
                    Ok(message) => message,
                    Err(_) => break,
                },
            };

            if !self.handle(received) {
                break;
            }
        }
        self.finish();
    }

    fn pump(&mut self) -> usize {
        let mut ran = self.run_due_timers();
        loop {
            match self.receiver.try_recv() {
                Ok(Message::Task { due: None, task }) => {
                    if self.shared.accepting.load(Ordering::Acquire) {
                        self.run_task(task);
                        ran += 1;
                    }
                }
                Ok(message) => {
                    if !self.handle(message) {
                        self.finish();
                        break;
                    }
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        ran + self.run_due_timers()
    }

    fn run_task(&self, task: Box<dyn Runnable>) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(|| task.run())) {
            error!(
                context = %self.shared.name,
                error = %HandlerError::from_panic(payload),
                "Task panicked on execution context"
            );
        }
    }

    fn finish(&mut self) {
        self.shared.accepting.store(false, Ordering::Release);
        let mut dropped = self.timers.len();
        self.timers.clear();
        // Queued tasks may hold handles to whatever owns this context.
        while self.receiver.try_recv().is_ok() {
            dropped += 1;
        }
        debug!(
            context = %self.shared.name,
            dropped_tasks = dropped,
            "Execution context loop finished"
        );
    }
}

fn bind_current(shared: &Arc<ContextShared>) -> Result<()> {
    CURRENT.with(|current| {
        let mut current = current.borrow_mut();
        let bound = current
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some_and(|existing| existing.accepting.load(Ordering::Acquire));
        if bound {
            return Err(BusError::ContextAlreadyBound {
                thread: thread::current().name().unwrap_or("unnamed").to_string(),
            });
        }
        *current = Some(Arc::downgrade(shared));
        Ok(())
    })?;
    let _ = shared.thread.set(thread::current().id());
    Ok(())
}

fn unbind_current(shared: &Arc<ContextShared>) {
    CURRENT.with(|current| {
        let mut current = current.borrow_mut();
        if current
            .as_ref()
            .is_some_and(|bound| Weak::as_ptr(bound) == Arc::as_ptr(shared))
        {
            *current = None;
        }
    });
}

/// A dedicated thread running an execution context loop.
///
/// Dropping the handle asks the context to quit without waiting for it.
pub struct ContextThread {
    context: ExecutionContext,
    handle: Mutex<Option<JoinHandle<()>>>,
    detached: bool,
}

impl ContextThread {
    /// Start a thread named `name` and block until its loop is ready to accept work.
    pub fn spawn(name: impl Into<String>) -> Result<ContextThread> {
        let name = name.into();
        let (sender, receiver) = channel::unbounded();
        let shared = Arc::new(ContextShared::new(name.clone(), sender));
        let (ready_tx, ready_rx) = channel::bounded::<()>(1);

        let loop_shared = Arc::clone(&shared);
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            // A freshly started thread has no binding yet.
            if bind_current(&loop_shared).is_err() {
                return;
            }
            let _ = ready_tx.send(());
            let mut state = LoopState::new(Arc::clone(&loop_shared), receiver);
            state.run();
            unbind_current(&loop_shared);
        })?;

        let _ = ready_rx.recv();
        debug!(context = %name, "Execution context thread started");

        Ok(ContextThread {
            context: ExecutionContext { shared },
            handle: Mutex::new(Some(handle)),
            detached: false,
        })
    }

    pub fn context(&self) -> ExecutionContext {
        self.context.clone()
    }

    pub fn quit(&self) {
        self.context.quit();
    }

    /// Quit and wait for the loop thread to exit. Does not wait when called from the loop
    /// thread itself.
    pub fn join(&self) {
        self.context.quit();
        if self.context.is_current() {
            return;
        }
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                error!(context = %self.context.name(), "Execution context thread panicked");
            }
        }
    }

    /// Let the thread outlive this handle.
    pub fn detach(mut self) -> ExecutionContext {
        self.detached = true;
        self.handle.lock().take();
        self.context.clone()
    }
}

impl Drop for ContextThread {
    fn drop(&mut self) {
        if !self.detached {
            self.context.quit();
        }
    }
}

impl fmt::Debug for ContextThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextThread")
            .field("context", &self.context)
            .finish()
    }
}

/// Binds an execution context to the calling thread, which then drives it.
///
/// Must stay on the thread that prepared it.
pub struct Looper {
    context: ExecutionContext,
    state: LoopState,
    _not_send: PhantomData<*const ()>,
}

impl Looper {
    /// Bind a new context named `name` to the calling thread.
    pub fn prepare(name: impl Into<String>) -> Result<Looper> {
        let (sender, receiver) = channel::unbounded();
        let shared = Arc::new(ContextShared::new(name.into(), sender));
        bind_current(&shared)?;
        debug!(context = %shared.name, "Execution context bound to calling thread");

        Ok(Looper {
            context: ExecutionContext {
                shared: Arc::clone(&shared),
            },
            state: LoopState::new(shared, receiver),
            _not_send: PhantomData,
        })
    }

    pub fn context(&self) -> ExecutionContext {
        self.context.clone()
    }

    /// Drive the context until it is asked to quit.
    pub fn run(mut self) {
        self.state.run();
    }

    /// Run everything that is ready now without blocking. Returns the number of tasks run.
    pub fn pump(&mut self) -> usize {
        self.state.pump()
    }

    /// Keep pumping until `condition` holds or `timeout` passes. Returns whether it held.
    pub fn pump_until<F: FnMut() -> bool>(&mut self, timeout: Duration, mut condition: F) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.pump();
            if condition() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }
}

impl Drop for Looper {
    fn drop(&mut self) {
        self.context.shared.accepting.store(false, Ordering::Release);
        unbind_current(&self.context.shared);
    }
}
