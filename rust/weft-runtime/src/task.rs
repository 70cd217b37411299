//! Asynchronous units of work.
//!
//! A [`Task`] owns a primary closure (the *execute* phase), an ordered chain
//! of callback/errback handlers, an error cell, a result cell, and edges to
//! other tasks: *dependencies* it waits for and *observers* waiting on it.
//! Every mutation of a task flows as a [`TaskMessage`] through the task's
//! control port, whose receiver is limited to one in-flight handler — the
//! state machine therefore sees a totally ordered message sequence and never
//! needs a lock across user code.
//!
//! The execute phase runs on the work scheduler. When it completes (or, for
//! async tasks, when [`work_finished`](Task::work_finished) is called) the
//! callbacks phase runs the handler chain in insertion order: `callback`
//! handlers when no error is set, `errback` handlers when one is, `both`
//! handlers always. Handlers may set or clear the error, stack further
//! handlers, or add dependencies — in which case the chain suspends until
//! those dependencies finish.
//!
//! Cancellation is cooperative: it marks the task, synthesizes a
//! cancellation error for the errback chain, and prevents work that has not
//! started. A closure that is already running is expected to poll
//! [`was_cancelled`](Task::was_cancelled).

use crate::error::TaskError;
use crate::message::Value;
use crate::port::Port;
use crate::process::{self, Process};
use crate::progress::{ProgressMessage, ProgressMode};
use crate::receiver::Receiver;
use crate::runtime;
use crate::scheduler::{ScheduleExt, Scheduler};
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use tracing::warn;

// ---------------------------------------------------------------------------
// Handler chain
// ---------------------------------------------------------------------------

/// A closure invoked with the task during the execute or callbacks phase.
pub type TaskFn = Box<dyn FnOnce(&Task) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandlerKind {
    /// Runs only while no error is set.
    Callback,
    /// Runs only while an error is set.
    Errback,
    /// Runs unconditionally.
    Both,
}

pub(crate) struct Handler {
    kind: HandlerKind,
    func: TaskFn,
}

// ---------------------------------------------------------------------------
// Control messages
// ---------------------------------------------------------------------------

/// The task state machine's input alphabet.
///
/// Public API calls post these to the task's control port and return; the
/// control receiver applies them one at a time, in post order.
pub(crate) enum TaskMessage {
    Execute,
    Cancel,
    AddHandler(Handler),
    AddDependency(Task),
    RemoveDependency(Task),
    AddObserver(Task),
    RemoveObserver(Task),
    DepFinished(Task),
    DepCancelled(Task),
    WorkFinished,
    Callbacks,
    Finish,
    Error(Option<TaskError>),
    Result(Value),
    Context(Arc<dyn Scheduler>),
    Completion(TaskFn),
    // Process extension (ignored with a warning on plain tasks).
    NoMoreWork,
    AddSource(Process),
    AddSink(Process),
    AddWatch(Arc<Port<ProgressMessage>>),
    ChainEstimate(usize),
}

// ---------------------------------------------------------------------------
// Flags
// ---------------------------------------------------------------------------

mod flag {
    pub const STARTED: u32 = 1 << 0;
    pub const NEED_EXECUTE: u32 = 1 << 1;
    pub const EXECUTING: u32 = 1 << 2;
    pub const CALLBACKS: u32 = 1 << 3;
    pub const FINISHED: u32 = 1 << 4;
    pub const CANCELLED: u32 = 1 << 5;
    pub const ASYNC: u32 = 1 << 6;
}

// ---------------------------------------------------------------------------
// Task core
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum Behavior {
    Standard,
    AllOf,
    AnyOf,
    Process,
}

struct TaskState {
    closure: Option<TaskFn>,
    handlers: VecDeque<Handler>,
    error: Option<TaskError>,
    result: Option<Value>,
    dependencies: Vec<Task>,
    observers: Vec<Task>,
    completion: Option<TaskFn>,
    context: Option<Arc<dyn Scheduler>>,
}

pub(crate) struct TaskCore {
    port: Arc<Port<TaskMessage>>,
    /// Keeps the control receiver alive as long as the task.
    _receiver: Arc<Receiver<TaskMessage>>,
    flags: AtomicU32,
    behavior: Behavior,
    work_scheduler: Mutex<Arc<dyn Scheduler>>,
    progress_mode: Mutex<ProgressMode>,
    state: Mutex<TaskState>,
    /// Present when this task is the control half of a process.
    pub(crate) process: OnceLock<Weak<process::ProcessCore>>,
}

impl TaskCore {
    fn has(&self, flag: u32) -> bool {
        self.flags.load(Ordering::Acquire) & flag != 0
    }

    fn set_flag(&self, flag: u32) {
        self.flags.fetch_or(flag, Ordering::AcqRel);
    }

    fn clear_flag(&self, flag: u32) {
        self.flags.fetch_and(!flag, Ordering::AcqRel);
    }
}

// ---------------------------------------------------------------------------
// Task handle
// ---------------------------------------------------------------------------

/// A shareable handle to an asynchronous unit of work.
///
/// Clones refer to the same task. Dropping every handle while the task runs
/// is fine — the scheduler keeps it alive until it finishes.
#[derive(Clone)]
pub struct Task {
    core: Arc<TaskCore>,
}

impl Task {
    pub(crate) fn from_core(core: Arc<TaskCore>) -> Self {
        Self { core }
    }

    pub(crate) fn build(
        closure: Option<TaskFn>,
        behavior: Behavior,
        is_async: bool,
        control_scheduler: Arc<dyn Scheduler>,
        work_scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        let core = Arc::new_cyclic(|weak: &Weak<TaskCore>| {
            let port = Arc::new(Port::new());
            let handler_core = Weak::clone(weak);
            // One in-flight control handler at a time: messages are applied
            // in post order, which is the state machine's ordering contract.
            let receiver = Receiver::with_limit(control_scheduler, 1, move |message| {
                if let Some(core) = handler_core.upgrade() {
                    handle_message(&core, message);
                }
            });
            port.set_receiver(Some(Arc::clone(&receiver)));

            let mut flags = 0;
            if is_async {
                flags |= flag::ASYNC;
            }

            TaskCore {
                port,
                _receiver: receiver,
                flags: AtomicU32::new(flags),
                behavior,
                work_scheduler: Mutex::new(work_scheduler),
                progress_mode: Mutex::new(ProgressMode::ActivityOnly),
                state: Mutex::new(TaskState {
                    closure,
                    handlers: VecDeque::new(),
                    error: None,
                    result: None,
                    dependencies: Vec::new(),
                    observers: Vec::new(),
                    completion: None,
                    context: None,
                }),
                process: OnceLock::new(),
            }
        });
        Self { core }
    }

    /// Create a task around `func`, using the default schedulers.
    pub fn new<F>(func: F) -> Self
    where
        F: FnOnce(&Task) + Send + 'static,
    {
        Self::with_schedulers(
            func,
            false,
            runtime::default_control_scheduler(),
            runtime::default_scheduler(),
        )
    }

    /// Create a task with no work of its own; it finishes as soon as its
    /// dependencies do.
    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    /// Create an async task: `func` returning does not complete the execute
    /// phase — the task finishes when [`work_finished`](Task::work_finished)
    /// is called.
    pub fn new_async<F>(func: F) -> Self
    where
        F: FnOnce(&Task) + Send + 'static,
    {
        Self::with_schedulers(
            func,
            true,
            runtime::default_control_scheduler(),
            runtime::default_scheduler(),
        )
    }

    /// Full-control constructor: explicit schedulers for control messages
    /// and for the execute phase.
    pub fn with_schedulers<F>(
        func: F,
        is_async: bool,
        control_scheduler: Arc<dyn Scheduler>,
        work_scheduler: Arc<dyn Scheduler>,
    ) -> Self
    where
        F: FnOnce(&Task) + Send + 'static,
    {
        Self::build(
            Some(Box::new(func)),
            Behavior::Standard,
            is_async,
            control_scheduler,
            work_scheduler,
        )
    }

    /// A task that finishes when **all** of `tasks` finish and cancels as
    /// soon as any of them cancels.
    pub fn all_of<I>(tasks: I) -> Self
    where
        I: IntoIterator<Item = Task>,
    {
        let composite = Self::build(
            None,
            Behavior::AllOf,
            false,
            runtime::default_control_scheduler(),
            runtime::default_scheduler(),
        );
        for task in tasks {
            composite.add_dependency(&task);
        }
        composite
    }

    /// A task that finishes when **any** of `tasks` finishes and cancels
    /// only when every one of them has cancelled.
    pub fn any_of<I>(tasks: I) -> Self
    where
        I: IntoIterator<Item = Task>,
    {
        let composite = Self::build(
            None,
            Behavior::AnyOf,
            false,
            runtime::default_control_scheduler(),
            runtime::default_scheduler(),
        );
        for task in tasks {
            composite.add_dependency(&task);
        }
        composite
    }

    pub(crate) fn post(&self, message: TaskMessage) {
        self.core.port.post(message);
    }

    pub(crate) fn core(&self) -> &Arc<TaskCore> {
        &self.core
    }

    /// Identity comparison: do two handles refer to the same task?
    pub fn same(&self, other: &Task) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }

    // -- lifecycle --------------------------------------------------------

    /// Schedule the task for execution. Idempotent.
    pub fn run(&self) {
        self.post(TaskMessage::Execute);
    }

    /// Schedule the task and register `completion` to be invoked once the
    /// task finishes (on the context scheduler, if one is set).
    pub fn run_with_completion<F>(&self, completion: F)
    where
        F: FnOnce(&Task) + Send + 'static,
    {
        self.post(TaskMessage::Completion(Box::new(completion)));
        self.post(TaskMessage::Execute);
    }

    /// Request cancellation. Idempotent; running closures are not preempted.
    pub fn cancel(&self) {
        self.post(TaskMessage::Cancel);
    }

    /// Complete the execute phase of an async task.
    pub fn work_finished(&self) {
        self.post(TaskMessage::WorkFinished);
    }

    // -- handlers ---------------------------------------------------------

    /// Append a handler that runs only if no error is set when reached.
    pub fn add_callback<F>(&self, func: F)
    where
        F: FnOnce(&Task) + Send + 'static,
    {
        self.post(TaskMessage::AddHandler(Handler {
            kind: HandlerKind::Callback,
            func: Box::new(func),
        }));
    }

    /// Append a handler that runs only if an error is set when reached.
    pub fn add_errback<F>(&self, func: F)
    where
        F: FnOnce(&Task) + Send + 'static,
    {
        self.post(TaskMessage::AddHandler(Handler {
            kind: HandlerKind::Errback,
            func: Box::new(func),
        }));
    }

    /// Append a handler that runs whether or not an error is set.
    pub fn add_both<F>(&self, func: F)
    where
        F: FnOnce(&Task) + Send + 'static,
    {
        self.post(TaskMessage::AddHandler(Handler {
            kind: HandlerKind::Both,
            func: Box::new(func),
        }));
    }

    // -- dependencies -----------------------------------------------------

    /// Block this task (or its callback chain) until `dep` finishes.
    pub fn add_dependency(&self, dep: &Task) {
        self.post(TaskMessage::AddDependency(dep.clone()));
    }

    /// Drop the dependency on `dep`; may unblock execution.
    pub fn remove_dependency(&self, dep: &Task) {
        self.post(TaskMessage::RemoveDependency(dep.clone()));
    }

    // -- error and result cells -------------------------------------------

    /// Attach an error; the callback chain switches to errback handlers.
    pub fn set_error(&self, error: TaskError) {
        self.post(TaskMessage::Error(Some(error)));
    }

    /// Clear the error ("catching" it from an errback).
    pub fn clear_error(&self) {
        self.post(TaskMessage::Error(None));
    }

    /// The current error, if any.
    pub fn error(&self) -> Option<TaskError> {
        self.core.state.lock().unwrap().error.clone()
    }

    /// Store the task's result value.
    pub fn set_result(&self, value: Value) {
        self.post(TaskMessage::Result(value));
    }

    /// The current result value, if any.
    pub fn result(&self) -> Option<Value> {
        self.core.state.lock().unwrap().result.clone()
    }

    // -- context and progress ---------------------------------------------

    /// Dispatch the completion notifier (and nothing else) on `scheduler`
    /// instead of inline. Must be set before [`run`](Task::run).
    pub fn set_context(&self, scheduler: Arc<dyn Scheduler>) {
        self.post(TaskMessage::Context(scheduler));
    }

    /// How progress watchers should display this work.
    pub fn progress_mode(&self) -> ProgressMode {
        *self.core.progress_mode.lock().unwrap()
    }

    /// Set the progress display mode. Meaningful before watches attach.
    pub fn set_progress_mode(&self, mode: ProgressMode) {
        *self.core.progress_mode.lock().unwrap() = mode;
    }

    // -- observations ------------------------------------------------------

    /// Whether the execute phase is currently running.
    pub fn is_executing(&self) -> bool {
        self.core.has(flag::EXECUTING)
    }

    /// Whether the task has fully finished (callbacks included).
    pub fn is_finished(&self) -> bool {
        self.core.has(flag::FINISHED)
    }

    /// Whether cancellation has been requested. Poll this from long-running
    /// closures.
    pub fn was_cancelled(&self) -> bool {
        self.core.has(flag::CANCELLED)
    }

    /// Finished without cancellation and without an unhandled error.
    pub fn has_succeeded(&self) -> bool {
        self.is_finished() && !self.was_cancelled() && self.error().is_none()
    }

    /// Finished with an unhandled error.
    pub fn has_failed(&self) -> bool {
        self.is_finished() && self.error().is_some()
    }

    pub(crate) fn is_started(&self) -> bool {
        self.core.has(flag::STARTED)
    }

    pub(crate) fn work_scheduler(&self) -> Arc<dyn Scheduler> {
        Arc::clone(&self.core.work_scheduler.lock().unwrap())
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let flags = self.core.flags.load(Ordering::Relaxed);
        f.debug_struct("Task")
            .field("behavior", &self.core.behavior)
            .field("started", &(flags & flag::STARTED != 0))
            .field("executing", &(flags & flag::EXECUTING != 0))
            .field("callbacks", &(flags & flag::CALLBACKS != 0))
            .field("finished", &(flags & flag::FINISHED != 0))
            .field("cancelled", &(flags & flag::CANCELLED != 0))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Message handling (runs on the control receiver, one message at a time)
// ---------------------------------------------------------------------------

fn handle_message(core: &Arc<TaskCore>, message: TaskMessage) {
    match message {
        TaskMessage::Error(error) => {
            core.state.lock().unwrap().error = error;
        }
        TaskMessage::Result(value) => {
            core.state.lock().unwrap().result = Some(value);
        }
        TaskMessage::Context(scheduler) => {
            if core.has(flag::STARTED) {
                warn!("task context scheduler cannot change after run; ignored");
            } else {
                core.state.lock().unwrap().context = Some(scheduler);
            }
        }
        TaskMessage::Completion(func) => {
            core.state.lock().unwrap().completion = Some(func);
        }
        TaskMessage::AddHandler(handler) => {
            if core.has(flag::FINISHED) {
                warn!("handler added to a finished task; ignored");
            } else {
                core.state.lock().unwrap().handlers.push_back(handler);
            }
        }
        TaskMessage::AddDependency(dep) => {
            let me = Task::from_core(Arc::clone(core));
            core.state.lock().unwrap().dependencies.push(dep.clone());
            dep.post(TaskMessage::AddObserver(me));
        }
        TaskMessage::RemoveDependency(dep) => {
            let me = Task::from_core(Arc::clone(core));
            let removed = {
                let mut state = core.state.lock().unwrap();
                let before = state.dependencies.len();
                state.dependencies.retain(|d| !d.same(&dep));
                state.dependencies.len() != before
            };
            if removed {
                dep.post(TaskMessage::RemoveObserver(me));
                after_dependency_change(core);
            }
        }
        TaskMessage::AddObserver(observer) => {
            if core.has(flag::FINISHED) {
                // Already settled: answer immediately so the observer never
                // waits on an edge that will not fire.
                let me = Task::from_core(Arc::clone(core));
                if core.has(flag::CANCELLED) {
                    observer.post(TaskMessage::DepCancelled(me));
                } else {
                    observer.post(TaskMessage::DepFinished(me));
                }
            } else {
                core.state.lock().unwrap().observers.push(observer);
            }
        }
        TaskMessage::RemoveObserver(observer) => {
            core.state
                .lock()
                .unwrap()
                .observers
                .retain(|o| !o.same(&observer));
        }
        TaskMessage::Execute => {
            if core.has(flag::STARTED) {
                return;
            }
            core.set_flag(flag::STARTED);
            let has_deps = !core.state.lock().unwrap().dependencies.is_empty();
            if has_deps {
                core.set_flag(flag::NEED_EXECUTE);
            } else {
                start_execute(core);
            }
            if core.behavior == Behavior::Process {
                process::on_started(core);
            }
        }
        TaskMessage::DepFinished(dep) => handle_dep_finished(core, dep),
        TaskMessage::DepCancelled(dep) => handle_dep_cancelled(core, dep),
        TaskMessage::Cancel => do_cancel(core),
        TaskMessage::WorkFinished => {
            if !core.has(flag::EXECUTING) {
                return;
            }
            core.clear_flag(flag::EXECUTING);
            if core.has(flag::CALLBACKS) || core.has(flag::FINISHED) {
                return;
            }
            core.set_flag(flag::CALLBACKS);
            if core.state.lock().unwrap().dependencies.is_empty() {
                post_self(core, TaskMessage::Callbacks);
            }
        }
        TaskMessage::Callbacks => run_one_callback(core),
        TaskMessage::Finish => do_finish(core),
        // Everything else is the process extension: NoMoreWork, AddSource,
        // AddSink, AddWatch, ChainEstimate.
        other => {
            if core.behavior == Behavior::Process {
                process::handle_control(core, other);
            } else {
                warn!("process control message sent to a plain task; ignored");
            }
        }
    }
}

fn post_self(core: &Arc<TaskCore>, message: TaskMessage) {
    core.port.post(message);
}

/// A dependency was removed (finished or explicitly dropped): resume
/// whatever the task was waiting to do.
fn after_dependency_change(core: &Arc<TaskCore>) {
    if !core.state.lock().unwrap().dependencies.is_empty() {
        return;
    }
    if core.has(flag::NEED_EXECUTE) {
        start_execute(core);
    } else if core.has(flag::CALLBACKS) {
        post_self(core, TaskMessage::Callbacks);
    }
}

fn handle_dep_finished(core: &Arc<TaskCore>, dep: Task) {
    match core.behavior {
        Behavior::AnyOf => {
            let others = {
                let mut state = core.state.lock().unwrap();
                if !state.dependencies.iter().any(|d| d.same(&dep)) {
                    return;
                }
                // First finisher wins: the remaining dependencies are let go.
                let others: Vec<Task> = state
                    .dependencies
                    .drain(..)
                    .filter(|d| !d.same(&dep))
                    .collect();
                others
            };
            let me = Task::from_core(Arc::clone(core));
            for other in others {
                other.post(TaskMessage::RemoveObserver(me.clone()));
            }
            after_dependency_change(core);
        }
        _ => {
            let removed = {
                let mut state = core.state.lock().unwrap();
                let before = state.dependencies.len();
                state.dependencies.retain(|d| !d.same(&dep));
                state.dependencies.len() != before
            };
            if removed {
                after_dependency_change(core);
            }
        }
    }
}

fn handle_dep_cancelled(core: &Arc<TaskCore>, dep: Task) {
    match core.behavior {
        Behavior::AnyOf => {
            // A cancelled dependency is a lost vote, not a verdict — cancel
            // only once every alternative is gone.
            let now_empty = {
                let mut state = core.state.lock().unwrap();
                state.dependencies.retain(|d| !d.same(&dep));
                state.dependencies.is_empty()
            };
            if now_empty {
                do_cancel(core);
                after_dependency_change(core);
            }
        }
        _ => {
            // One cancelled dependency is the verdict. Let go of the rest —
            // they may never settle, and the errback chain must not wait on
            // edges that will not fire.
            let others = {
                let mut state = core.state.lock().unwrap();
                let others: Vec<Task> = state
                    .dependencies
                    .drain(..)
                    .filter(|d| !d.same(&dep))
                    .collect();
                others
            };
            let me = Task::from_core(Arc::clone(core));
            for other in others {
                other.post(TaskMessage::RemoveObserver(me.clone()));
            }
            do_cancel(core);
            // Resume a chain that was already suspended on these edges. A
            // spare `Callbacks` message is harmless; a missing one would
            // stall the task.
            after_dependency_change(core);
        }
    }
}

fn do_cancel(core: &Arc<TaskCore>) {
    if core.has(flag::FINISHED) || core.has(flag::CANCELLED) {
        return;
    }
    core.set_flag(flag::CANCELLED);

    {
        let mut state = core.state.lock().unwrap();
        if state.error.is_none() {
            state.error = Some(TaskError::cancelled());
        }
    }

    if core.behavior == Behavior::Process {
        process::on_cancelled(core);
    }

    // A running execute phase ends through its own completion path; an
    // active callback chain keeps going (now through errbacks).
    if core.has(flag::EXECUTING) || core.has(flag::CALLBACKS) {
        return;
    }

    // Never ran (or still waiting on dependencies): go straight to the
    // errback chain and finish.
    core.set_flag(flag::STARTED);
    core.clear_flag(flag::NEED_EXECUTE);
    core.set_flag(flag::CALLBACKS);
    post_self(core, TaskMessage::Callbacks);
}

fn start_execute(core: &Arc<TaskCore>) {
    core.clear_flag(flag::NEED_EXECUTE);
    core.set_flag(flag::EXECUTING);

    let task = Task::from_core(Arc::clone(core));
    let scheduler = task.work_scheduler();

    if core.behavior == Behavior::Process {
        let process = process::from_task_core(core);
        scheduler.queue(move || {
            if let Some(process) = process {
                process::execute_loop(process);
            }
        });
        return;
    }

    let closure = core.state.lock().unwrap().closure.take();
    scheduler.queue(move || {
        if let Some(closure) = closure {
            let result = catch_unwind(AssertUnwindSafe(|| closure(&task)));
            if result.is_err() {
                task.set_error(TaskError::panicked("task closure panicked"));
            }
        }
        if !task.core.has(flag::ASYNC) {
            task.post(TaskMessage::WorkFinished);
        }
    });
}

/// One step of the callbacks phase: run the next eligible handler, then
/// re-post `Callbacks` so error/result updates it made are applied first.
fn run_one_callback(core: &Arc<TaskCore>) {
    if !core.has(flag::CALLBACKS) || core.has(flag::FINISHED) {
        return;
    }

    let (handler, suspended) = {
        let mut state = core.state.lock().unwrap();
        if !state.dependencies.is_empty() {
            // Suspended mid-chain; a DepFinished will resume us.
            (None, true)
        } else {
            (state.handlers.pop_front(), false)
        }
    };
    if suspended {
        return;
    }

    let Some(handler) = handler else {
        post_self(core, TaskMessage::Finish);
        return;
    };

    let error_set = core.state.lock().unwrap().error.is_some();
    let should_run = match handler.kind {
        HandlerKind::Callback => !error_set,
        HandlerKind::Errback => error_set,
        HandlerKind::Both => true,
    };

    if should_run {
        let task = Task::from_core(Arc::clone(core));
        let func = handler.func;
        if catch_unwind(AssertUnwindSafe(|| func(&task))).is_err() {
            core.state.lock().unwrap().error = Some(TaskError::panicked("task handler panicked"));
        }
    }

    post_self(core, TaskMessage::Callbacks);
}

fn do_finish(core: &Arc<TaskCore>) {
    if core.has(flag::FINISHED) || !core.has(flag::CALLBACKS) {
        return;
    }
    {
        let state = core.state.lock().unwrap();
        if !state.dependencies.is_empty() || !state.handlers.is_empty() {
            return;
        }
    }

    core.clear_flag(flag::CALLBACKS);

    // The synthesized cancellation error was only there to drive the
    // errback chain; the cancelled flag carries the outcome.
    {
        let mut state = core.state.lock().unwrap();
        if state.error.as_ref().is_some_and(TaskError::is_cancellation) {
            state.error = None;
        }
    }

    core.set_flag(flag::FINISHED);

    if core.behavior == Behavior::Process {
        process::on_finished(core);
    }

    let me = Task::from_core(Arc::clone(core));
    let cancelled = core.has(flag::CANCELLED);
    let (observers, completion, context) = {
        let mut state = core.state.lock().unwrap();
        (
            std::mem::take(&mut state.observers),
            state.completion.take(),
            state.context.clone(),
        )
    };

    for observer in observers {
        if cancelled {
            observer.post(TaskMessage::DepCancelled(me.clone()));
        } else {
            observer.post(TaskMessage::DepFinished(me.clone()));
        }
    }

    if let Some(completion) = completion {
        match context {
            Some(context) => {
                let task = me.clone();
                context.queue(move || completion(&task));
            }
            None => completion(&me),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DOMAIN_RUNTIME;
    use std::sync::atomic::AtomicUsize;
    use std::thread;
    use std::time::{Duration, Instant};

    fn wait_until(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let end = Instant::now() + deadline;
        while Instant::now() < end {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        done()
    }

    fn wait_finished(task: &Task) -> bool {
        wait_until(Duration::from_secs(5), || task.is_finished())
    }

    #[test]
    fn run_executes_closure_once_and_finishes() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let task = Task::new(move |_| {
            c.fetch_add(1, Ordering::Relaxed);
        });

        task.run();
        task.run(); // idempotent

        assert!(wait_finished(&task));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(counter.load(Ordering::Relaxed), 1);
        assert!(task.error().is_none());
        assert!(task.result().is_none());
        assert!(task.has_succeeded());
    }

    #[test]
    fn callbacks_run_in_insertion_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let task = Task::new(|_| {});
        for i in 0..3 {
            let order = Arc::clone(&order);
            task.add_callback(move |_| order.lock().unwrap().push(i));
        }
        task.run();
        assert!(wait_finished(&task));
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn errback_catches_error_set_by_closure() {
        let task = Task::new(|t| {
            t.set_error(TaskError::new(1, 1, "e"));
        });
        let seen = Arc::new(Mutex::new(None));
        let s = Arc::clone(&seen);
        task.add_errback(move |t| {
            *s.lock().unwrap() = t.error();
            t.clear_error();
        });

        task.run();
        assert!(wait_finished(&task));
        assert!(task.error().is_none());
        assert!(task.has_succeeded());
        let caught = seen.lock().unwrap().clone().expect("errback saw the error");
        assert_eq!(caught.domain, 1);
        assert_eq!(caught.code, 1);
    }

    #[test]
    fn callback_skipped_while_error_set() {
        let ran_callback = Arc::new(AtomicUsize::new(0));
        let ran_errback = Arc::new(AtomicUsize::new(0));

        let task = Task::new(|t| t.set_error(TaskError::new(2, 5, "boom")));
        let c = Arc::clone(&ran_callback);
        task.add_callback(move |_| {
            c.fetch_add(1, Ordering::Relaxed);
        });
        let e = Arc::clone(&ran_errback);
        task.add_errback(move |_| {
            e.fetch_add(1, Ordering::Relaxed);
        });

        task.run();
        assert!(wait_finished(&task));
        assert_eq!(ran_callback.load(Ordering::Relaxed), 0);
        assert_eq!(ran_errback.load(Ordering::Relaxed), 1);
        assert!(task.has_failed());
    }

    #[test]
    fn both_handler_runs_either_way() {
        let hits = Arc::new(AtomicUsize::new(0));

        let ok = Task::new(|_| {});
        let h = Arc::clone(&hits);
        ok.add_both(move |_| {
            h.fetch_add(1, Ordering::Relaxed);
        });

        let failing = Task::new(|t| t.set_error(TaskError::new(1, 2, "x")));
        let h = Arc::clone(&hits);
        failing.add_both(move |_| {
            h.fetch_add(1, Ordering::Relaxed);
        });

        ok.run();
        failing.run();
        assert!(wait_finished(&ok));
        assert!(wait_finished(&failing));
        assert_eq!(hits.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn result_value_round_trips() {
        let task = Task::new(|t| t.set_result(Value::Int(42)));
        task.run();
        assert!(wait_finished(&task));
        assert_eq!(task.result().and_then(|v| v.as_int()), Some(42));
    }

    #[test]
    fn handlers_can_stack_more_handlers() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let task = Task::new(|_| {});

        let o = Arc::clone(&order);
        task.add_callback(move |t| {
            o.lock().unwrap().push("first");
            let o2 = Arc::clone(&o);
            t.add_callback(move |_| o2.lock().unwrap().push("stacked"));
        });
        let o = Arc::clone(&order);
        task.add_callback(move |_| o.lock().unwrap().push("second"));

        task.run();
        assert!(wait_finished(&task));
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "stacked"]);
    }

    #[test]
    fn cancel_before_run_finishes_cancelled() {
        let task = Task::new(|_| {});
        task.cancel();
        assert!(wait_finished(&task));
        assert!(task.was_cancelled());
        assert!(!task.has_succeeded());
        // The synthesized cancellation error does not linger.
        assert!(task.error().is_none());
    }

    #[test]
    fn cancel_twice_is_idempotent() {
        let task = Task::new(|_| {});
        task.cancel();
        task.cancel();
        assert!(wait_finished(&task));
        assert!(task.was_cancelled());
    }

    #[test]
    fn cancelled_task_runs_errbacks_with_synthesized_error() {
        let seen = Arc::new(Mutex::new(None));
        let task = Task::new(|_| {});
        let s = Arc::clone(&seen);
        task.add_errback(move |t| {
            *s.lock().unwrap() = t.error();
        });
        task.cancel();
        assert!(wait_finished(&task));
        let error = seen.lock().unwrap().clone().expect("errback ran");
        assert!(error.is_cancellation());
        assert_eq!(error.domain, DOMAIN_RUNTIME);
    }

    #[test]
    fn dependency_gates_execution() {
        let gate_ran = Arc::new(AtomicUsize::new(0));
        let dep = Task::new(|_| {
            thread::sleep(Duration::from_millis(30));
        });
        let g = Arc::clone(&gate_ran);
        let task = Task::new(move |_| {
            g.fetch_add(1, Ordering::Relaxed);
        });
        task.add_dependency(&dep);
        task.run();

        // The dependent must not run while the dependency is unfinished.
        thread::sleep(Duration::from_millis(10));
        assert!(!task.is_finished());
        assert_eq!(gate_ran.load(Ordering::Relaxed), 0);

        dep.run();
        assert!(wait_finished(&task));
        assert_eq!(gate_ran.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn dependency_finished_before_attach_still_fires() {
        let dep = Task::new(|_| {});
        dep.run();
        assert!(wait_finished(&dep));

        let task = Task::new(|_| {});
        task.add_dependency(&dep);
        task.run();
        assert!(wait_finished(&task));
    }

    #[test]
    fn remove_dependency_unblocks() {
        let dep = Task::new(|_| {});
        let task = Task::new(|_| {});
        task.add_dependency(&dep);
        task.run();

        thread::sleep(Duration::from_millis(10));
        assert!(!task.is_finished());

        task.remove_dependency(&dep);
        assert!(wait_finished(&task));
        assert!(!dep.is_started());
    }

    #[test]
    fn dependency_cancellation_cancels_dependent() {
        let dep = Task::new(|_| {});
        let task = Task::new(|_| {});
        task.add_dependency(&dep);
        task.run();

        dep.cancel();
        assert!(wait_finished(&task));
        assert!(task.was_cancelled());
    }

    #[test]
    fn dependency_cancellation_releases_unsettled_siblings() {
        // `never` is neither run nor cancelled; the cancellation verdict
        // from `doomed` must still let the dependent finish.
        let doomed = Task::new(|_| {});
        let never = Task::new(|_| {});
        let task = Task::new(|_| {});
        task.add_dependency(&doomed);
        task.add_dependency(&never);
        task.run();

        doomed.cancel();
        assert!(wait_finished(&task));
        assert!(task.was_cancelled());
        assert!(!never.is_started());
    }

    #[test]
    fn all_of_waits_for_every_dependency() {
        let t1 = Task::new(|_| {});
        let t2 = Task::new(|_| {});
        let t3 = Task::new(|_| {});
        let all = Task::all_of([t1.clone(), t2.clone(), t3.clone()]);
        all.run();

        t1.run();
        assert!(wait_finished(&t1));
        thread::sleep(Duration::from_millis(20));
        assert!(!all.is_finished());

        t2.run();
        assert!(wait_finished(&t2));
        thread::sleep(Duration::from_millis(20));
        assert!(!all.is_finished());

        t3.run();
        assert!(wait_finished(&all));
        assert!(all.has_succeeded());
    }

    #[test]
    fn all_of_cancels_when_any_dep_cancels() {
        let t1 = Task::new(|_| {});
        let t2 = Task::new(|_| {});
        let all = Task::all_of([t1.clone(), t2.clone()]);
        all.run();

        t1.cancel();
        assert!(wait_finished(&all));
        assert!(all.was_cancelled());
    }

    #[test]
    fn any_of_finishes_on_first_completion() {
        let t1 = Task::new(|_| {});
        let t2 = Task::new(|_| {});
        let t3 = Task::new(|_| {});
        let any = Task::any_of([t1.clone(), t2.clone(), t3.clone()]);
        any.run();

        t3.run();
        assert!(wait_finished(&any));
        assert!(any.has_succeeded());
        assert!(!t1.is_finished());
        assert!(!t2.is_finished());
    }

    #[test]
    fn any_of_survives_partial_cancellation() {
        let t1 = Task::new(|_| {});
        let t2 = Task::new(|_| {});
        let any = Task::any_of([t1.clone(), t2.clone()]);
        any.run();

        t1.cancel();
        assert!(wait_finished(&t1));
        thread::sleep(Duration::from_millis(20));
        assert!(!any.is_finished());

        t2.run();
        assert!(wait_finished(&any));
        assert!(!any.was_cancelled());
    }

    #[test]
    fn any_of_cancels_only_when_all_deps_cancel() {
        let t1 = Task::new(|_| {});
        let t2 = Task::new(|_| {});
        let any = Task::any_of([t1.clone(), t2.clone()]);
        any.run();

        t1.cancel();
        t2.cancel();
        assert!(wait_finished(&any));
        assert!(any.was_cancelled());
    }

    #[test]
    fn async_task_waits_for_work_finished() {
        let task = Task::new_async(|_| {
            // Returning does not complete the work.
        });
        task.run();
        thread::sleep(Duration::from_millis(30));
        assert!(!task.is_finished());

        task.work_finished();
        assert!(wait_finished(&task));
    }

    #[test]
    fn completion_notifier_runs_after_finish() {
        let notified = Arc::new(AtomicUsize::new(0));
        let task = Task::new(|_| {});
        let n = Arc::clone(&notified);
        task.run_with_completion(move |t| {
            assert!(t.is_finished());
            n.fetch_add(1, Ordering::Relaxed);
        });
        assert!(wait_finished(&task));
        assert!(wait_until(Duration::from_secs(2), || {
            notified.load(Ordering::Relaxed) == 1
        }));
    }

    #[test]
    fn completion_notifier_on_context_scheduler() {
        let main = Arc::new(crate::main_scheduler::MainLoopScheduler::new());
        let notified = Arc::new(AtomicUsize::new(0));

        let task = Task::new(|_| {});
        task.set_context(main.clone() as Arc<dyn Scheduler>);
        let n = Arc::clone(&notified);
        task.run_with_completion(move |_| {
            n.fetch_add(1, Ordering::Relaxed);
        });

        assert!(wait_finished(&task));
        // Not delivered until the loop drains.
        assert_eq!(notified.load(Ordering::Relaxed), 0);
        assert!(wait_until(Duration::from_secs(2), || {
            main.run_pending() > 0
        }));
        assert_eq!(notified.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn panicking_closure_becomes_task_error() {
        let task = Task::new(|_| panic!("kaboom"));
        task.run();
        assert!(wait_finished(&task));
        assert!(task.has_failed());
        let error = task.error().unwrap();
        assert_eq!(error.domain, DOMAIN_RUNTIME);
    }

    #[test]
    fn callbacks_suspend_on_mid_chain_dependency() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let late = Task::new(|_| {});

        let task = Task::new(|_| {});
        let o = Arc::clone(&order);
        let late_for_cb = late.clone();
        task.add_callback(move |t| {
            o.lock().unwrap().push("first");
            t.add_dependency(&late_for_cb);
        });
        let o = Arc::clone(&order);
        task.add_callback(move |_| o.lock().unwrap().push("second"));

        task.run();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(*order.lock().unwrap(), vec!["first"]);
        assert!(!task.is_finished());

        late.run();
        assert!(wait_finished(&task));
        assert_eq!(*order.lock().unwrap(), vec!["first", "second"]);
    }

    #[test]
    fn executing_and_callbacks_are_mutually_exclusive() {
        let saw_overlap = Arc::new(AtomicUsize::new(0));
        let task = Task::new(|_| {
            thread::sleep(Duration::from_millis(10));
        });
        let flag_probe = Arc::clone(&saw_overlap);
        task.add_callback(move |t| {
            if t.is_executing() {
                flag_probe.fetch_add(1, Ordering::Relaxed);
            }
        });
        task.run();
        assert!(wait_finished(&task));
        assert_eq!(saw_overlap.load(Ordering::Relaxed), 0);
    }
}
