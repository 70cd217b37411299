//! Schedulable thread pool with work stealing.
//!
//! A [`PooledScheduler`] accepts closures from any thread and runs them on a
//! pool of worker threads. Work submitted from inside one of the pool's own
//! workers lands on that worker's local [`WorkStealingQueue`] (recursive work
//! stays cache-hot); everything else goes through a global injection channel.
//!
//! # Worker loop
//!
//! Each worker runs the following priority order:
//! 1. Pop from the local deque (no contention).
//! 2. Take from the global injection channel without blocking.
//! 3. Walk the round-robin of peer queues and try to steal.
//! 4. Block on the global channel with a bounded timeout and go around.
//!
//! One worker per scheduler is the *leader*: roughly once a second it
//! compares the number of items it completed in the last quantum against the
//! backlog, and asks the thread manager for an extra worker when it is
//! falling behind. Extra workers are *transient* — they drain work until
//! they sit idle through a full pop timeout, then return themselves to the
//! process-wide free list for reuse by any scheduler.

use crate::rrobin::RoundRobin;
use crate::wsqueue::{Stealer, WorkStealingQueue};
use crossbeam_channel as cb;
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, warn};

/// A unit of schedulable work.
pub type Work = Box<dyn FnOnce() + Send + 'static>;

/// How long the leader waits between growth decisions.
const QUANTUM: Duration = Duration::from_secs(1);

/// Bounded block on the global channel; also the idle window after which a
/// transient worker yields itself back to the thread manager.
const POP_WAIT_TIMEOUT: Duration = Duration::from_secs(2);

/// Longest a worker keeps retrying one contended peer queue while stealing.
const STEAL_TIMEOUT: Duration = Duration::from_millis(1);

// ---------------------------------------------------------------------------
// Scheduler trait
// ---------------------------------------------------------------------------

/// Anything that can run closures: the pooled work-stealing scheduler or the
/// cooperative main-loop scheduler.
///
/// `queue` guarantees at-most-once execution of each submitted closure.
/// Ordering between independently queued items is unspecified.
pub trait Scheduler: Send + Sync {
    /// Schedule a boxed closure.
    fn queue_boxed(&self, work: Work);
}

/// Ergonomic, monomorphised `queue` over any scheduler.
pub trait ScheduleExt: Scheduler {
    /// Schedule a closure.
    fn queue<F>(&self, work: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.queue_boxed(Box::new(work));
    }
}

impl<S: Scheduler + ?Sized> ScheduleExt for S {}

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Thread bounds for a pooled scheduler.
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Workers attached up front.
    pub min_threads: usize,
    /// Hard ceiling on attached workers.
    pub max_threads: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let max = num_cpus::get().max(2);
        Self {
            min_threads: 2,
            max_threads: max,
        }
    }
}

impl SchedulerConfig {
    /// Bounds-checked constructor; swaps the pair if given backwards.
    pub fn new(min_threads: usize, max_threads: usize) -> Self {
        let min = min_threads.max(1);
        let max = max_threads.max(min);
        Self {
            min_threads: min,
            max_threads: max,
        }
    }
}

// ---------------------------------------------------------------------------
// Worker-thread identity (submission placement)
// ---------------------------------------------------------------------------

struct WorkerTls {
    scheduler_id: usize,
    queue: WorkStealingQueue<Work>,
}

thread_local! {
    static CURRENT_WORKER: RefCell<Option<WorkerTls>> = const { RefCell::new(None) };
}

// ---------------------------------------------------------------------------
// Pool internals
// ---------------------------------------------------------------------------

static NEXT_SCHEDULER_ID: AtomicUsize = AtomicUsize::new(1);

/// A detach request for one attached worker.
struct WorkerSlot {
    detach: AtomicBool,
}

struct PoolShared {
    id: usize,
    min_threads: usize,
    max_threads: usize,
    global_tx: cb::Sender<Work>,
    global_rx: cb::Receiver<Work>,
    /// Steal victims, one slot per attached worker.
    rrobin: RoundRobin<Stealer<Work>>,
    /// Detach flags, parallel to live workers (not to rrobin slots).
    slots: Mutex<Vec<Arc<WorkerSlot>>>,
    shutdown: AtomicBool,
    has_leader: AtomicBool,
    maxed: AtomicBool,
    thread_count: AtomicUsize,
    completed: AtomicUsize,
}

impl PoolShared {
    fn backlog(&self) -> usize {
        self.global_rx.len()
    }
}

struct Assignment {
    shared: Arc<PoolShared>,
    leader: bool,
    transient: bool,
    slot: Arc<WorkerSlot>,
}

// ---------------------------------------------------------------------------
// Thread manager
// ---------------------------------------------------------------------------

enum ThreadMessage {
    Manage(Assignment),
    Shutdown,
}

/// A reusable OS thread, addressed through its control channel.
struct WorkerThread {
    tx: cb::Sender<ThreadMessage>,
}

/// Process-wide owner of worker threads.
///
/// Threads are created on demand and parked on their control channel between
/// assignments, so schedulers can hand workers back and forth instead of
/// paying thread creation on every growth request.
struct ThreadManager {
    free: Mutex<Vec<WorkerThread>>,
    spawned: AtomicUsize,
}

static MANAGER: OnceLock<ThreadManager> = OnceLock::new();

fn manager() -> &'static ThreadManager {
    MANAGER.get_or_init(|| ThreadManager {
        free: Mutex::new(Vec::new()),
        spawned: AtomicUsize::new(0),
    })
}

impl ThreadManager {
    /// Take a thread from the free list, or spawn a fresh one.
    ///
    /// Returns `None` only when the OS refuses to create a thread; the
    /// caller is expected to carry on with its existing workers.
    fn obtain(&self) -> Option<WorkerThread> {
        if let Some(thread) = self.free.lock().unwrap().pop() {
            return Some(thread);
        }

        let index = self.spawned.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = cb::unbounded::<ThreadMessage>();
        let self_tx = tx.clone();

        let spawned = thread::Builder::new()
            .name(format!("weft-worker-{index}"))
            .spawn(move || worker_thread_main(rx, self_tx));

        match spawned {
            Ok(_) => Some(WorkerThread { tx }),
            Err(err) => {
                warn!(%err, "worker thread creation failed; continuing with current pool");
                None
            }
        }
    }

    fn yield_thread(&self, thread: WorkerThread) {
        self.free.lock().unwrap().push(thread);
    }
}

/// Top-level loop of a managed OS thread: wait for an assignment, run it,
/// hand the thread back to the free list, repeat.
fn worker_thread_main(rx: cb::Receiver<ThreadMessage>, self_tx: cb::Sender<ThreadMessage>) {
    while let Ok(message) = rx.recv() {
        match message {
            ThreadMessage::Manage(assignment) => {
                run_worker(assignment);
                manager().yield_thread(WorkerThread {
                    tx: self_tx.clone(),
                });
            }
            ThreadMessage::Shutdown => break,
        }
    }
}

// ---------------------------------------------------------------------------
// Worker loop
// ---------------------------------------------------------------------------

fn run_work(shared: &PoolShared, work: Work) {
    work();
    shared.completed.fetch_add(1, Ordering::Release);
}

fn run_worker(assignment: Assignment) {
    let Assignment {
        shared,
        leader,
        transient,
        slot,
    } = assignment;

    let queue = WorkStealingQueue::new();
    let my_stealer = Arc::new(queue.stealer());
    let registered = shared.rrobin.append(Arc::clone(&my_stealer));

    CURRENT_WORKER.with(|tls| {
        *tls.borrow_mut() = Some(WorkerTls {
            scheduler_id: shared.id,
            queue,
        });
    });

    let mut per_quantum: usize = 0;
    let mut quantum_start = Instant::now();

    loop {
        if shared.shutdown.load(Ordering::Acquire) || slot.detach.load(Ordering::Acquire) {
            break;
        }

        // Leader: once a quantum, ask for another worker if this pool is
        // completing fewer items than are waiting.
        if leader && quantum_start.elapsed() >= QUANTUM {
            let backlog = shared.backlog();
            if per_quantum < backlog {
                request_growth(&shared);
            }
            per_quantum = 0;
            quantum_start = Instant::now();
        }

        // 1. Local deque.
        let local = CURRENT_WORKER
            .with(|tls| tls.borrow().as_ref().and_then(|tls| tls.queue.local_pop()));
        if let Some(work) = local {
            run_work(&shared, work);
            per_quantum += 1;
            continue;
        }

        // 2. Global injection channel, without blocking.
        match shared.global_rx.try_recv() {
            Ok(work) => {
                run_work(&shared, work);
                per_quantum += 1;
                continue;
            }
            Err(cb::TryRecvError::Disconnected) => break,
            Err(cb::TryRecvError::Empty) => {}
        }

        // 3. Steal from a peer.
        if let Some(work) = steal_from_peers(&shared, &my_stealer) {
            run_work(&shared, work);
            per_quantum += 1;
            continue;
        }

        // 4. Bounded block on the global channel.
        match shared.global_rx.recv_timeout(POP_WAIT_TIMEOUT) {
            Ok(work) => {
                run_work(&shared, work);
                per_quantum += 1;
            }
            Err(cb::RecvTimeoutError::Timeout) => {
                if transient {
                    // Idle long enough; give the thread back.
                    break;
                }
            }
            Err(cb::RecvTimeoutError::Disconnected) => break,
        }
    }

    // Drain on the way out: teardown must not strand submitted work.
    if shared.shutdown.load(Ordering::Acquire) {
        drain_for_shutdown(&shared);
    }

    detach(&shared, &my_stealer, registered, &slot);
}

fn steal_from_peers(shared: &PoolShared, me: &Arc<Stealer<Work>>) -> Option<Work> {
    let mut stolen = None;
    shared.rrobin.for_each(|peer| {
        if Arc::ptr_eq(peer, me) {
            return true;
        }
        match peer.try_steal(STEAL_TIMEOUT) {
            Some(work) => {
                stolen = Some(work);
                false
            }
            None => true,
        }
    });
    stolen
}

/// Run everything still reachable from this worker before it leaves.
fn drain_for_shutdown(shared: &PoolShared) {
    loop {
        let local = CURRENT_WORKER
            .with(|tls| tls.borrow().as_ref().and_then(|tls| tls.queue.local_pop()));
        if let Some(work) = local {
            run_work(shared, work);
            continue;
        }
        match shared.global_rx.try_recv() {
            Ok(work) => run_work(shared, work),
            Err(_) => break,
        }
    }
}

/// Unregister from the pool and redistribute unfinished local items.
///
/// Items go back through the global injection channel: peers pull from it in
/// their normal loop, which keeps the at-most-once guarantee without pushing
/// into queues this thread does not own.
fn detach(
    shared: &PoolShared,
    my_stealer: &Arc<Stealer<Work>>,
    registered: bool,
    slot: &Arc<WorkerSlot>,
) {
    if registered {
        shared.rrobin.remove(my_stealer);
    }

    let tls = CURRENT_WORKER.with(|tls| tls.borrow_mut().take());
    if let Some(tls) = tls {
        while let Some(work) = tls.queue.local_pop() {
            if shared.shutdown.load(Ordering::Acquire) {
                run_work(shared, work);
            } else if let Err(send_failed) = shared.global_tx.send(work) {
                // Channel gone mid-teardown; run inline rather than drop.
                (send_failed.0)();
            }
        }
    }

    let mut slots = shared.slots.lock().unwrap();
    if let Some(position) = slots.iter().position(|s| Arc::ptr_eq(s, slot)) {
        slots.remove(position);
    }
    drop(slots);

    shared.thread_count.fetch_sub(1, Ordering::AcqRel);
    shared.maxed.store(false, Ordering::Release);
}

fn request_growth(shared: &Arc<PoolShared>) {
    if shared.shutdown.load(Ordering::Acquire) {
        return;
    }
    let count = shared.thread_count.load(Ordering::Acquire);
    if count >= shared.max_threads {
        shared.maxed.store(true, Ordering::Release);
        return;
    }
    attach_worker(shared, true);
}

/// Obtain a thread from the manager and assign it to this pool.
fn attach_worker(shared: &Arc<PoolShared>, transient: bool) -> bool {
    let count = shared.thread_count.fetch_add(1, Ordering::AcqRel);
    if count >= shared.max_threads {
        shared.thread_count.fetch_sub(1, Ordering::AcqRel);
        shared.maxed.store(true, Ordering::Release);
        return false;
    }

    let Some(thread) = manager().obtain() else {
        shared.thread_count.fetch_sub(1, Ordering::AcqRel);
        return false;
    };

    let leader = !transient
        && shared
            .has_leader
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();

    let slot = Arc::new(WorkerSlot {
        detach: AtomicBool::new(false),
    });
    shared.slots.lock().unwrap().push(Arc::clone(&slot));

    let assignment = Assignment {
        shared: Arc::clone(shared),
        leader,
        transient,
        slot,
    };

    if thread.tx.send(ThreadMessage::Manage(assignment)).is_err() {
        shared.thread_count.fetch_sub(1, Ordering::AcqRel);
        return false;
    }
    true
}

// ---------------------------------------------------------------------------
// PooledScheduler
// ---------------------------------------------------------------------------

/// The default scheduler: a thread pool with per-worker work-stealing
/// queues, grown on demand up to `max_threads`.
pub struct PooledScheduler {
    shared: Arc<PoolShared>,
}

impl PooledScheduler {
    /// Create a scheduler and attach `min_threads` workers.
    pub fn new(config: SchedulerConfig) -> Arc<Self> {
        let config = SchedulerConfig::new(config.min_threads, config.max_threads);
        let (global_tx, global_rx) = cb::unbounded();

        let shared = Arc::new(PoolShared {
            id: NEXT_SCHEDULER_ID.fetch_add(1, Ordering::Relaxed),
            min_threads: config.min_threads,
            max_threads: config.max_threads,
            global_tx,
            global_rx,
            rrobin: RoundRobin::new(config.max_threads),
            slots: Mutex::new(Vec::new()),
            shutdown: AtomicBool::new(false),
            has_leader: AtomicBool::new(false),
            maxed: AtomicBool::new(false),
            thread_count: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
        });

        for _ in 0..shared.min_threads {
            attach_worker(&shared, false);
        }

        Arc::new(Self { shared })
    }

    /// Create a scheduler with the default thread bounds.
    pub fn with_defaults() -> Arc<Self> {
        Self::new(SchedulerConfig::default())
    }

    /// Number of workers currently attached.
    pub fn thread_count(&self) -> usize {
        self.shared.thread_count.load(Ordering::Acquire)
    }

    /// Total closures completed across all workers.
    pub fn completed_count(&self) -> usize {
        self.shared.completed.load(Ordering::Acquire)
    }

    /// Attach one more worker, up to `max_threads`.
    ///
    /// Returns `false` when the pool is maxed out, shut down, or the OS
    /// refused a thread.
    pub fn add_thread(&self) -> bool {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return false;
        }
        attach_worker(&self.shared, false)
    }

    /// Detach one worker; its unfinished local items are redistributed to
    /// the remaining workers.
    pub fn remove_thread(&self) {
        let slots = self.shared.slots.lock().unwrap();
        if let Some(slot) = slots.last() {
            slot.detach.store(true, Ordering::Release);
        }
        drop(slots);
        self.wake_workers();
    }

    /// Whether shutdown has been requested.
    pub fn is_shutdown(&self) -> bool {
        self.shared.shutdown.load(Ordering::Acquire)
    }

    /// Request shutdown: workers drain outstanding items and return to the
    /// process-wide free list. Idempotent.
    pub fn shutdown(&self) {
        if self
            .shared
            .shutdown
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        self.wake_workers();
    }

    /// Block until at least `expected` closures have completed or `timeout`
    /// elapses. Returns the completed count at the time the wait ended.
    pub fn wait_for_completion(&self, expected: usize, timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        loop {
            let current = self.completed_count();
            if current >= expected || Instant::now() >= deadline {
                return current;
            }
            thread::sleep(Duration::from_millis(1));
        }
    }

    /// Nudge every blocked worker so it re-reads its flags.
    fn wake_workers(&self) {
        let count = self.thread_count();
        for _ in 0..count {
            let _ = self.shared.global_tx.send(Box::new(|| {}));
        }
    }
}

impl Scheduler for PooledScheduler {
    fn queue_boxed(&self, work: Work) {
        if self.shared.shutdown.load(Ordering::Acquire) {
            error!("work submitted to a scheduler that has been shut down");
            panic!("PooledScheduler::queue called after shutdown");
        }

        // Submission from one of our own workers goes to its local queue.
        let mut work = Some(work);
        let placed = CURRENT_WORKER.with(|tls| {
            let tls = tls.borrow();
            match tls.as_ref() {
                Some(worker) if worker.scheduler_id == self.shared.id => {
                    worker.queue.local_push(work.take().unwrap());
                    true
                }
                _ => false,
            }
        });

        if !placed {
            if let Err(send_failed) = self.shared.global_tx.send(work.take().unwrap()) {
                // Receiver side only disappears when the pool is gone.
                error!("scheduler global queue is gone; running work inline");
                (send_failed.0)();
            }
        }
    }
}

impl Drop for PooledScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for PooledScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledScheduler")
            .field("id", &self.shared.id)
            .field("threads", &self.thread_count())
            .field("max_threads", &self.shared.max_threads)
            .field("completed", &self.completed_count())
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn runs_submitted_work() {
        let sched = PooledScheduler::new(SchedulerConfig::new(2, 4));
        let counter = Arc::new(AtomicUsize::new(0));

        let n = 100;
        for _ in 0..n {
            let counter = Arc::clone(&counter);
            sched.queue(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }

        let completed = sched.wait_for_completion(n, Duration::from_secs(5));
        assert!(completed >= n);
        assert_eq!(counter.load(Ordering::Relaxed), n);
        sched.shutdown();
    }

    #[test]
    fn default_config_bounds() {
        let config = SchedulerConfig::default();
        assert_eq!(config.min_threads, 2);
        assert!(config.max_threads >= config.min_threads);
    }

    #[test]
    fn config_swaps_inverted_bounds() {
        let config = SchedulerConfig::new(8, 2);
        assert!(config.max_threads >= config.min_threads);
    }

    #[test]
    fn starts_min_threads() {
        let sched = PooledScheduler::new(SchedulerConfig::new(3, 6));
        // Workers attach asynchronously via the manager; wait briefly.
        let deadline = Instant::now() + Duration::from_secs(2);
        while sched.thread_count() < 3 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(sched.thread_count(), 3);
        sched.shutdown();
    }

    #[test]
    fn recursive_work_lands_locally_and_completes() {
        let sched = PooledScheduler::new(SchedulerConfig::new(2, 4));
        let counter = Arc::new(AtomicUsize::new(0));

        // Each outer item spawns inner items from the worker thread itself.
        let outer = 20;
        let inner = 10;
        for _ in 0..outer {
            let sched_inner = Arc::clone(&sched);
            let counter = Arc::clone(&counter);
            sched.queue(move || {
                for _ in 0..inner {
                    let counter = Arc::clone(&counter);
                    sched_inner.queue(move || {
                        counter.fetch_add(1, Ordering::Relaxed);
                    });
                }
            });
        }

        let expected = outer * inner + outer;
        sched.wait_for_completion(expected, Duration::from_secs(5));
        assert_eq!(counter.load(Ordering::Relaxed), (outer * inner) as usize);
        sched.shutdown();
    }

    #[test]
    fn shutdown_is_idempotent() {
        let sched = PooledScheduler::new(SchedulerConfig::new(1, 2));
        sched.shutdown();
        assert!(sched.is_shutdown());
        sched.shutdown();
        assert!(sched.is_shutdown());
    }

    #[test]
    #[should_panic(expected = "after shutdown")]
    fn queue_after_shutdown_panics() {
        let sched = PooledScheduler::new(SchedulerConfig::new(1, 2));
        sched.shutdown();
        sched.queue(|| {});
    }

    #[test]
    fn shutdown_drains_outstanding_work() {
        let sched = PooledScheduler::new(SchedulerConfig::new(2, 4));
        let counter = Arc::new(AtomicUsize::new(0));

        let n = 500;
        for _ in 0..n {
            let counter = Arc::clone(&counter);
            sched.queue(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        sched.shutdown();

        let deadline = Instant::now() + Duration::from_secs(5);
        while counter.load(Ordering::Relaxed) < n && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(counter.load(Ordering::Relaxed), n);
    }

    #[test]
    fn add_and_remove_thread() {
        let sched = PooledScheduler::new(SchedulerConfig::new(1, 4));
        let deadline = Instant::now() + Duration::from_secs(2);
        while sched.thread_count() < 1 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }

        assert!(sched.add_thread());
        let deadline = Instant::now() + Duration::from_secs(2);
        while sched.thread_count() < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(sched.thread_count(), 2);

        sched.remove_thread();
        let deadline = Instant::now() + Duration::from_secs(5);
        while sched.thread_count() > 1 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(sched.thread_count(), 1);
        sched.shutdown();
    }

    #[test]
    fn add_thread_respects_max() {
        let sched = PooledScheduler::new(SchedulerConfig::new(2, 2));
        let deadline = Instant::now() + Duration::from_secs(2);
        while sched.thread_count() < 2 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!sched.add_thread());
        assert_eq!(sched.thread_count(), 2);
        sched.shutdown();
    }

    #[test]
    fn many_tasks_across_workers() {
        let sched = PooledScheduler::new(SchedulerConfig::new(4, 4));
        let counter = Arc::new(AtomicUsize::new(0));

        let n = 2_000;
        for _ in 0..n {
            let counter = Arc::clone(&counter);
            sched.queue(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }

        sched.wait_for_completion(n, Duration::from_secs(10));
        assert_eq!(counter.load(Ordering::Relaxed), n);
        sched.shutdown();
    }

    #[test]
    fn debug_format() {
        let sched = PooledScheduler::new(SchedulerConfig::new(1, 2));
        let dbg = format!("{sched:?}");
        assert!(dbg.contains("PooledScheduler"));
        assert!(dbg.contains("max_threads: 2"));
        sched.shutdown();
    }
}
