//! Stream-processing tasks.
//!
//! A [`Process`] is a [`Task`] whose execute phase is a loop: work items
//! (plain [`Message`]s) are enqueued from outside, drained through a bulk
//! work port into a FIFO, and fed one at a time to the process's work
//! function. The loop keeps running until the input closes —
//! [`no_more_work`](Process::no_more_work) for a head process, or the
//! predecessor finishing for a chained one — or until cancellation.
//!
//! Processes chain: [`connect`](Process::connect) links a head to a tail so
//! the head's work function can [`forward`](Process::forward) items
//! downstream. Run requests propagate down the chain, cancellation
//! propagates up, and each process posts total-size estimates to its
//! successor so progress displays have a usable bound before the upstream
//! finishes.
//!
//! Progress goes to registered watch ports as [`ProgressMessage`]s, at most
//! one batch every 200 ms, always ending with exactly one terminal message.

use crate::arbiter;
use crate::message::Message;
use crate::port::Port;
use crate::progress::{ProgressMessage, ProgressMode};
use crate::receiver::{Arbitrated, Receiver};
use crate::runtime;
use crate::scheduler::{ScheduleExt, Scheduler};
use crate::task::{Behavior, Task, TaskCore, TaskMessage};
use crossbeam_channel as cb;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};
use tracing::warn;

/// Re-queue the execute loop after this long so one process cannot hog a
/// worker thread.
const FAIRNESS_QUANTUM: Duration = Duration::from_secs(1);

/// Minimum spacing between progress batches to the watch ports.
const PROGRESS_INTERVAL: Duration = Duration::from_millis(200);

/// Nap before re-queueing an idle loop, so a process waiting for work does
/// not spin a worker flat out.
const IDLE_NAP: Duration = Duration::from_millis(5);

// ---------------------------------------------------------------------------
// ProcessCore
// ---------------------------------------------------------------------------

struct ChainLinks {
    source: Option<Process>,
    sink: Option<Process>,
}

pub(crate) struct ProcessCore {
    work_port: Arc<Port<Message>>,
    /// Keeps the work receiver (and its arbiter) alive.
    _work_receiver: Arc<Receiver<Message>>,
    /// FIFO between the work port and the execute loop.
    work_rx: cb::Receiver<Message>,
    work_fn: Box<dyn Fn(&Process, Message) + Send + Sync>,
    processed_items: AtomicUsize,
    total_items: AtomicUsize,
    estimated_total_items: AtomicUsize,
    /// f32 bits; the ratio of expected outputs per input.
    estimate_factor: AtomicU32,
    no_more_work: AtomicBool,
    title: Mutex<Option<Arc<str>>>,
    links: Mutex<ChainLinks>,
    watches: Mutex<Vec<Arc<Port<ProgressMessage>>>>,
    watch_timer: Mutex<Instant>,
    /// Largest total already reported to watchers.
    watch_sent_total: AtomicUsize,
    /// Guards the single terminal Complete/Cancelled broadcast.
    terminal_sent: AtomicBool,
}

impl ProcessCore {
    fn raise_estimated(&self, value: usize) {
        let mut current = self.estimated_total_items.load(Ordering::Acquire);
        while value > current {
            match self.estimated_total_items.compare_exchange(
                current,
                value,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(seen) => current = seen,
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Process
// ---------------------------------------------------------------------------

/// A work-queue task: items in, work function per item, progress out.
#[derive(Clone)]
pub struct Process {
    task: Task,
    core: Arc<ProcessCore>,
}

impl Process {
    /// Create a process with the default schedulers.
    pub fn new<F>(work_fn: F) -> Self
    where
        F: Fn(&Process, Message) + Send + Sync + 'static,
    {
        Self::with_schedulers(
            work_fn,
            runtime::default_control_scheduler(),
            runtime::default_scheduler(),
        )
    }

    /// Create a process with explicit control and work schedulers.
    pub fn with_schedulers<F>(
        work_fn: F,
        control_scheduler: Arc<dyn Scheduler>,
        work_scheduler: Arc<dyn Scheduler>,
    ) -> Self
    where
        F: Fn(&Process, Message) + Send + Sync + 'static,
    {
        let task = Task::build(
            None,
            Behavior::Process,
            false,
            Arc::clone(&control_scheduler),
            work_scheduler,
        );
        task.set_progress_mode(ProgressMode::Discrete);

        let (work_tx, work_rx) = cb::unbounded();
        let work_port = Arc::new(Port::new());
        let work_receiver = Receiver::new(control_scheduler, move |item: Message| {
            // The loop owns the other end; if it is gone the item is moot.
            let _ = work_tx.send(item);
        });
        work_port.set_receiver(Some(Arc::clone(&work_receiver)));
        arbiter::coordinate(
            Some(Arc::clone(&work_receiver) as Arc<dyn Arbitrated>),
            None,
            None,
        );

        let core = Arc::new(ProcessCore {
            work_port,
            _work_receiver: work_receiver,
            work_rx,
            work_fn: Box::new(work_fn),
            processed_items: AtomicUsize::new(0),
            total_items: AtomicUsize::new(0),
            estimated_total_items: AtomicUsize::new(0),
            estimate_factor: AtomicU32::new(1.0f32.to_bits()),
            no_more_work: AtomicBool::new(false),
            title: Mutex::new(None),
            links: Mutex::new(ChainLinks {
                source: None,
                sink: None,
            }),
            watches: Mutex::new(Vec::new()),
            watch_timer: Mutex::new(Instant::now()),
            watch_sent_total: AtomicUsize::new(0),
            terminal_sent: AtomicBool::new(false),
        });

        let _ = task.core().process.set(Arc::downgrade(&core));
        Self { task, core }
    }

    /// The task half of this process: callbacks, errbacks, dependencies and
    /// the error/result cells all live there.
    pub fn task(&self) -> &Task {
        &self.task
    }

    /// Identity comparison.
    pub fn same(&self, other: &Process) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }

    // -- lifecycle --------------------------------------------------------

    /// Start executing work items. Successor processes start too.
    pub fn run(&self) {
        self.task.run();
    }

    /// Cancel this process and, transitively, its predecessors.
    pub fn cancel(&self) {
        self.task.cancel();
    }

    /// Whether the execute loop is currently running.
    pub fn is_executing(&self) -> bool {
        self.task.is_executing()
    }

    /// Whether the process has finished (succeeded, failed, or cancelled).
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Whether cancellation has been requested.
    pub fn was_cancelled(&self) -> bool {
        self.task.was_cancelled()
    }

    /// Completed all work with the input closed, and — for a chained
    /// process — the whole upstream chain succeeded too.
    pub fn has_succeeded(&self) -> bool {
        match self.predecessor() {
            Some(source) => source.has_succeeded() && self.task.has_succeeded(),
            None => self.task.has_succeeded(),
        }
    }

    // -- work intake ------------------------------------------------------

    /// Submit a work item.
    ///
    /// Refused with a warning once [`no_more_work`](Process::no_more_work)
    /// has been called.
    pub fn enqueue(&self, item: Message) {
        if self.core.no_more_work.load(Ordering::Acquire) {
            warn!("enqueue refused: no_more_work was already called on this process");
            return;
        }
        let total = self.core.total_items.fetch_add(1, Ordering::AcqRel) + 1;
        self.core.raise_estimated(total);
        self.core.work_port.post(item);
        post_output_estimate(self);
    }

    /// Enqueue back into this process from its own work function, bypassing
    /// the `no_more_work` check.
    ///
    /// Safe because the posting work item is still counted as unprocessed
    /// while its function runs, so the loop cannot observe a closed, drained
    /// queue before this item lands.
    pub fn recurse(&self, item: Message) {
        self.core.total_items.fetch_add(1, Ordering::AcqRel);
        let total = self.core.total_items.load(Ordering::Acquire);
        self.core.raise_estimated(total);
        self.core.work_port.post(item);
    }

    /// Forward an item to the successor process. Requires a connected sink.
    pub fn forward(&self, item: Message) {
        let sink = self.core.links.lock().unwrap().sink.clone();
        match sink {
            Some(sink) => sink.enqueue(item),
            None => warn!("forward with no successor connected; item dropped"),
        }
    }

    /// Declare the input stream closed: once the queue drains the process
    /// completes. Idempotent.
    pub fn no_more_work(&self) {
        self.task.post(TaskMessage::NoMoreWork);
    }

    // -- chaining ---------------------------------------------------------

    /// Connect `head`'s output to `tail`'s input.
    ///
    /// Both must be unstarted, `head` must have no sink yet and `tail` no
    /// source; violations warn and leave the processes untouched.
    pub fn connect(head: &Process, tail: &Process) {
        if head.task.is_started() || tail.task.is_started() {
            warn!("connect refused: processes can only be chained before they run");
            return;
        }
        if head.has_successor() {
            warn!("connect refused: head process already has a successor");
            return;
        }
        if tail.has_predecessor() {
            warn!("connect refused: tail process already has a predecessor");
            return;
        }
        head.task.post(TaskMessage::AddSink(tail.clone()));
        tail.task.post(TaskMessage::AddSource(head.clone()));
    }

    /// Whether a successor is connected.
    pub fn has_successor(&self) -> bool {
        self.core.links.lock().unwrap().sink.is_some()
    }

    /// Whether a predecessor is connected.
    pub fn has_predecessor(&self) -> bool {
        self.core.links.lock().unwrap().source.is_some()
    }

    /// The next process in the chain, if any.
    pub fn successor(&self) -> Option<Process> {
        self.core.links.lock().unwrap().sink.clone()
    }

    /// The previous process in the chain, if any.
    pub fn predecessor(&self) -> Option<Process> {
        self.core.links.lock().unwrap().source.clone()
    }

    // -- progress ---------------------------------------------------------

    /// Items handed to the work function so far.
    pub fn processed_items(&self) -> usize {
        self.core.processed_items.load(Ordering::Acquire)
    }

    /// Items enqueued so far.
    pub fn total_items(&self) -> usize {
        self.core.total_items.load(Ordering::Acquire)
    }

    /// Best known bound on the total, including upstream estimates.
    pub fn estimated_total_items(&self) -> usize {
        self.core.estimated_total_items.load(Ordering::Acquire)
    }

    /// Work items enqueued but not yet executed.
    pub fn queue_length(&self) -> usize {
        // Read processed first: a racing completion then shows a length one
        // too high, never negative.
        let processed = self.processed_items();
        self.total_items().saturating_sub(processed)
    }

    /// `(processed, total)` where total falls back to the estimate while the
    /// upstream is still running.
    pub fn status(&self) -> (usize, usize) {
        let processed = self.processed_items();
        let mut total = self.estimated_total_items();
        if total == 0 {
            total = self.total_items();
        }
        (processed, total)
    }

    /// Expected outputs per input, used to estimate a successor's total.
    pub fn set_output_estimation(&self, factor: f32) {
        if factor <= 0.0 {
            warn!("output estimation factor must be positive; ignored");
            return;
        }
        self.core
            .estimate_factor
            .store(factor.to_bits(), Ordering::Release);
        post_output_estimate(self);
    }

    /// Human-readable label shown by progress watchers.
    pub fn set_title(&self, title: &str) {
        let title: Arc<str> = Arc::from(title);
        *self.core.title.lock().unwrap() = Some(Arc::clone(&title));
        if !self.core.terminal_sent.load(Ordering::Acquire) {
            broadcast(&self.core, ProgressMessage::Title(title.to_string()));
        }
    }

    /// The current title, if one was set.
    pub fn title(&self) -> Option<Arc<str>> {
        self.core.title.lock().unwrap().clone()
    }

    /// How watchers should display progress.
    pub fn progress_mode(&self) -> ProgressMode {
        self.task.progress_mode()
    }

    /// Set the progress display mode (before watchers attach).
    pub fn set_progress_mode(&self, mode: ProgressMode) {
        self.task.set_progress_mode(mode);
    }

    /// Subscribe `port` to this process's progress stream.
    pub fn add_watch(&self, port: Arc<Port<ProgressMessage>>) {
        self.task.post(TaskMessage::AddWatch(port));
    }
}

impl std::fmt::Debug for Process {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Process")
            .field("task", &self.task)
            .field("processed", &self.processed_items())
            .field("total", &self.total_items())
            .field("estimated", &self.estimated_total_items())
            .field("no_more_work", &self.core.no_more_work.load(Ordering::Relaxed))
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Hooks called from the task state machine
// ---------------------------------------------------------------------------

pub(crate) fn from_task_core(core: &Arc<TaskCore>) -> Option<Process> {
    let process_core = core.process.get()?.upgrade()?;
    Some(Process {
        task: Task::from_core(Arc::clone(core)),
        core: process_core,
    })
}

/// The process started executing: start the successor too.
pub(crate) fn on_started(core: &Arc<TaskCore>) {
    let Some(process) = from_task_core(core) else {
        return;
    };
    if let Some(sink) = process.successor() {
        sink.run();
    }
}

/// The process was cancelled: cancellation climbs the chain.
pub(crate) fn on_cancelled(core: &Arc<TaskCore>) {
    let Some(process) = from_task_core(core) else {
        return;
    };
    if let Some(source) = process.predecessor() {
        if !source.is_finished() {
            source.cancel();
        }
    }
}

/// The task machinery finished: close out the progress stream and drop the
/// chain links so head and tail stop owning each other.
pub(crate) fn on_finished(core: &Arc<TaskCore>) {
    let Some(process) = from_task_core(core) else {
        return;
    };

    if process
        .core
        .terminal_sent
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
    {
        send_progress(&process, true);
        if process.was_cancelled() {
            broadcast(&process.core, ProgressMessage::Cancelled);
        } else {
            broadcast(&process.core, ProgressMessage::Complete);
        }
    }

    let mut links = process.core.links.lock().unwrap();
    links.source = None;
    links.sink = None;
}

/// Process-specific control messages, dispatched from the task's handler.
pub(crate) fn handle_control(core: &Arc<TaskCore>, message: TaskMessage) {
    let Some(process) = from_task_core(core) else {
        return;
    };

    match message {
        TaskMessage::NoMoreWork => {
            process.core.no_more_work.store(true, Ordering::Release);
        }
        TaskMessage::AddSource(source) => {
            let mut links = process.core.links.lock().unwrap();
            if links.source.is_some() {
                warn!("process already has a source; connection ignored");
            } else {
                links.source = Some(source);
            }
        }
        TaskMessage::AddSink(sink) => {
            {
                let mut links = process.core.links.lock().unwrap();
                if links.sink.is_some() {
                    warn!("process already has a sink; connection ignored");
                    return;
                }
                links.sink = Some(sink);
            }
            post_output_estimate(&process);
        }
        TaskMessage::AddWatch(port) => {
            process.core.watches.lock().unwrap().push(Arc::clone(&port));

            // The watcher may have missed everything; bring it up to date.
            // Snapshot goes to this port alone — earlier watchers may have
            // already received their terminal message.
            if let Some(title) = process.title() {
                port.post(ProgressMessage::Title(title.to_string()));
            }
            for message in progress_snapshot(&process) {
                port.post(message);
            }

            if process.is_finished() {
                // The terminal broadcast predates this watcher.
                if process.was_cancelled() {
                    port.post(ProgressMessage::Cancelled);
                } else {
                    port.post(ProgressMessage::Complete);
                }
            }
        }
        TaskMessage::ChainEstimate(estimate) => {
            if process.has_predecessor() {
                process.core.raise_estimated(estimate);
                post_output_estimate(&process);
            }
        }
        _ => {}
    }
}

// ---------------------------------------------------------------------------
// Execute loop
// ---------------------------------------------------------------------------

/// The process execute phase. Runs on the work scheduler and re-queues
/// itself to yield; posting `WorkFinished` at the end hands control back to
/// the task callback/finish machinery.
pub(crate) fn execute_loop(process: Process) {
    let started = Instant::now();

    loop {
        let cancelled = process.was_cancelled();

        maybe_send_progress(&process);

        if cancelled {
            break;
        }

        if started.elapsed() > FAIRNESS_QUANTUM {
            yield_loop(&process, false);
            return;
        }

        match process.core.work_rx.try_recv() {
            Ok(item) => {
                (process.core.work_fn)(&process, item);
                process.core.processed_items.fetch_add(1, Ordering::AcqRel);
            }
            Err(_) => {
                let source = process.predecessor();
                if let Some(source) = source {
                    if source.is_finished() && process.queue_length() == 0 {
                        break;
                    }
                } else if process.core.no_more_work.load(Ordering::Acquire)
                    && process.processed_items() == process.total_items()
                {
                    break;
                }
                yield_loop(&process, true);
                return;
            }
        }
    }

    // Loop is done for good: final status, terminal message on
    // cancellation, then the task finish machinery.
    send_progress(&process, true);
    if process.was_cancelled()
        && process
            .core
            .terminal_sent
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    {
        broadcast(&process.core, ProgressMessage::Cancelled);
    }

    process.task().work_finished();
}

fn yield_loop(process: &Process, idle: bool) {
    if idle {
        thread::sleep(IDLE_NAP);
    }
    let scheduler = process.task().work_scheduler();
    let process = process.clone();
    scheduler.queue(move || execute_loop(process));
}

// ---------------------------------------------------------------------------
// Progress plumbing
// ---------------------------------------------------------------------------

fn broadcast(core: &ProcessCore, message: ProgressMessage) {
    let watches = core.watches.lock().unwrap().clone();
    for port in watches {
        port.post(message.clone());
    }
}

/// Send a throttled progress batch if watchers are attached.
fn maybe_send_progress(process: &Process) {
    if process.core.watches.lock().unwrap().is_empty() {
        return;
    }
    {
        let mut timer = process.core.watch_timer.lock().unwrap();
        if timer.elapsed() < PROGRESS_INTERVAL {
            return;
        }
        *timer = Instant::now();
    }
    send_progress(process, false);
}

/// The displayable total: the estimate while the upstream still runs, the
/// exact count once it has succeeded.
fn resolved_total(process: &Process) -> usize {
    let core = &*process.core;
    let total = process.total_items();
    if let Some(source) = process.predecessor() {
        if source.has_succeeded() {
            // Upstream is done: the real total is now exact.
            core.estimated_total_items.store(total, Ordering::Release);
            total
        } else {
            core.estimated_total_items.load(Ordering::Acquire).max(total)
        }
    } else {
        total
    }
}

/// The current status as a message batch, for one port or a broadcast.
fn progress_snapshot(process: &Process) -> Vec<ProgressMessage> {
    match process.progress_mode() {
        ProgressMode::ActivityOnly => vec![ProgressMessage::Pulse],
        ProgressMode::Continuous => {
            let processed = process.processed_items();
            let total = resolved_total(process);
            let fraction = if total == 0 {
                0.0
            } else {
                (processed as f32 / total as f32).clamp(0.0, 1.0)
            };
            vec![ProgressMessage::Fraction(fraction)]
        }
        ProgressMode::Discrete => {
            // Total first, so a watcher never sees processed > total.
            let total = resolved_total(process);
            vec![
                ProgressMessage::TotalItems(total),
                ProgressMessage::ProcessedItems(process.processed_items()),
            ]
        }
    }
}

fn send_progress(process: &Process, force: bool) {
    let core = &*process.core;
    if core.watches.lock().unwrap().is_empty() {
        return;
    }
    // Nothing follows the terminal message.
    if core.terminal_sent.load(Ordering::Acquire) && !force {
        return;
    }

    match process.progress_mode() {
        ProgressMode::ActivityOnly | ProgressMode::Continuous => {
            for message in progress_snapshot(process) {
                broadcast(core, message);
            }
        }
        ProgressMode::Discrete => {
            let total = resolved_total(process);
            if force || core.watch_sent_total.load(Ordering::Acquire) < total {
                core.watch_sent_total.store(total, Ordering::Release);
                broadcast(core, ProgressMessage::TotalItems(total));
            }
            broadcast(core, ProgressMessage::ProcessedItems(process.processed_items()));
        }
    }
}

/// Tell the successor how much work to expect.
fn post_output_estimate(process: &Process) {
    let Some(sink) = process.successor() else {
        return;
    };

    let mut our_total = process.estimated_total_items();
    if our_total == 0 {
        our_total = process.total_items();
    }
    if our_total == 0 {
        return;
    }

    let factor = f32::from_bits(process.core.estimate_factor.load(Ordering::Acquire));
    let estimate = (our_total as f32 * factor).ceil() as usize;
    sink.task().post(TaskMessage::ChainEstimate(estimate));
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Value;
    use std::time::Duration;

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

    #[test]
    fn counters_start_at_zero() {
        let process = Process::new(|_, _| {});
        assert_eq!(process.processed_items(), 0);
        assert_eq!(process.total_items(), 0);
        assert_eq!(process.estimated_total_items(), 0);
        assert_eq!(process.queue_length(), 0);
    }

    #[test]
    fn enqueue_counts_items() {
        let process = Process::new(|_, _| {});
        process.enqueue(Message::new(1));
        process.enqueue(Message::new(2));
        assert_eq!(process.total_items(), 2);
        assert!(process.estimated_total_items() >= 2);
        assert_eq!(process.queue_length(), 2);
    }

    #[test]
    fn processes_all_items_and_succeeds() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let process = Process::new(move |_, item| {
            c.fetch_add(item.what() as usize, Ordering::Relaxed);
        });

        for _ in 0..20 {
            process.enqueue(Message::new(1));
        }
        process.run();
        process.no_more_work();

        assert!(wait_until(Duration::from_secs(10), || process.is_finished()));
        assert_eq!(counter.load(Ordering::Relaxed), 20);
        assert_eq!(process.processed_items(), 20);
        assert!(process.has_succeeded());
    }

    #[test]
    fn enqueue_after_no_more_work_is_refused() {
        let process = Process::new(|_, _| {});
        process.run();
        process.no_more_work();
        assert!(wait_until(Duration::from_secs(5), || process.is_finished()));

        process.enqueue(Message::new(1));
        assert_eq!(process.total_items(), 0);
    }

    #[test]
    fn no_more_work_twice_is_idempotent() {
        let process = Process::new(|_, _| {});
        process.enqueue(Message::new(1));
        process.run();
        process.no_more_work();
        process.no_more_work();
        assert!(wait_until(Duration::from_secs(5), || process.is_finished()));
        assert!(process.has_succeeded());
    }

    #[test]
    fn title_round_trips() {
        let process = Process::new(|_, _| {});
        assert!(process.title().is_none());
        process.set_title("scanning files");
        assert_eq!(&*process.title().unwrap(), "scanning files");
    }

    #[test]
    fn default_progress_mode_is_discrete() {
        let process = Process::new(|_, _| {});
        assert_eq!(process.progress_mode(), ProgressMode::Discrete);
    }

    #[test]
    fn connect_rejects_double_sink() {
        let a = Process::new(|_, _| {});
        let b = Process::new(|_, _| {});
        let c = Process::new(|_, _| {});
        Process::connect(&a, &b);
        assert!(wait_until(Duration::from_secs(2), || a.has_successor()));

        // Second connection from the same head must be refused.
        Process::connect(&a, &c);
        thread::sleep(Duration::from_millis(50));
        assert!(a.successor().unwrap().same(&b));
        assert!(!c.has_predecessor());
    }

    #[test]
    fn recurse_bypasses_no_more_work() {
        let counter = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&counter);
        let process = Process::new(move |process, item| {
            let depth = item.what();
            c.fetch_add(1, Ordering::Relaxed);
            if depth > 0 {
                process.recurse(Message::new(depth - 1));
            }
        });

        process.enqueue(Message::new(3));
        process.run();
        process.no_more_work();

        assert!(wait_until(Duration::from_secs(10), || process.is_finished()));
        // Depths 3, 2, 1, 0.
        assert_eq!(counter.load(Ordering::Relaxed), 4);
        assert_eq!(process.total_items(), 4);
        assert!(process.has_succeeded());
    }

    #[test]
    fn cancelled_process_stops_and_reports() {
        let process = Process::new(move |_, _| {
            thread::sleep(Duration::from_millis(1));
        });
        for _ in 0..10_000 {
            process.enqueue(Message::new(0));
        }
        process.run();
        assert!(wait_until(Duration::from_secs(5), || process.processed_items() > 0));

        process.cancel();
        assert!(wait_until(Duration::from_secs(5), || process.is_finished()));
        assert!(process.was_cancelled());
        assert!(!process.has_succeeded());
        assert!(process.processed_items() < process.total_items());
    }

    #[test]
    fn work_item_values_reach_the_work_fn() {
        let sum = Arc::new(AtomicUsize::new(0));
        let s = Arc::clone(&sum);
        let process = Process::new(move |_, item| {
            if let Some(n) = item.data().and_then(Value::as_int) {
                s.fetch_add(n as usize, Ordering::Relaxed);
            }
        });

        for i in 1..=10 {
            process.enqueue(Message::new(0).with_data(Value::Int(i)));
        }
        process.run();
        process.no_more_work();

        assert!(wait_until(Duration::from_secs(10), || process.is_finished()));
        assert_eq!(sum.load(Ordering::Relaxed), 55);
    }
}
