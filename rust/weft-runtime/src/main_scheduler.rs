//! Cooperative scheduler for an external event loop.
//!
//! A [`MainLoopScheduler`] never spawns threads. `queue` appends the closure
//! to an internal FIFO and fires the wake callback so the embedding loop
//! knows to come back; the loop thread then calls
//! [`run_pending`](MainLoopScheduler::run_pending) to drain everything that
//! has accumulated. There is no stealing and no cancellation at this layer —
//! queued items run to completion, in submission order, on whichever thread
//! drains them.

use crate::scheduler::{Scheduler, Work};
use crossbeam_channel as cb;
use std::sync::Mutex;

type WakeFn = Box<dyn Fn() + Send + Sync + 'static>;

/// A scheduler that delivers work to an event loop instead of a pool.
pub struct MainLoopScheduler {
    tx: cb::Sender<Work>,
    rx: cb::Receiver<Work>,
    wake: Mutex<Option<WakeFn>>,
}

impl Default for MainLoopScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl MainLoopScheduler {
    /// Create a scheduler with no wake callback.
    pub fn new() -> Self {
        let (tx, rx) = cb::unbounded();
        Self {
            tx,
            rx,
            wake: Mutex::new(None),
        }
    }

    /// Install the callback fired after each `queue`.
    ///
    /// Typically this posts a wake-up to the embedding loop (an eventfd
    /// write, a channel send, a `glib::MainContext::wakeup`-alike).
    pub fn set_wake<F>(&self, wake: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        *self.wake.lock().unwrap() = Some(Box::new(wake));
    }

    /// Number of closures waiting to run.
    pub fn pending(&self) -> usize {
        self.rx.len()
    }

    /// Run every closure currently queued. Returns how many ran.
    ///
    /// Call this from the loop thread. Closures queued *while* draining are
    /// picked up in the same call — the drain continues until the FIFO is
    /// observed empty.
    pub fn run_pending(&self) -> usize {
        let mut ran = 0;
        while let Ok(work) = self.rx.try_recv() {
            work();
            ran += 1;
        }
        ran
    }

    /// Drain repeatedly until an entire pass finds nothing queued.
    pub fn run_until_idle(&self) -> usize {
        let mut total = 0;
        loop {
            let ran = self.run_pending();
            if ran == 0 {
                return total;
            }
            total += ran;
        }
    }
}

impl Scheduler for MainLoopScheduler {
    fn queue_boxed(&self, work: Work) {
        // The receiver lives as long as self, so this cannot fail.
        let _ = self.tx.send(work);
        if let Some(wake) = self.wake.lock().unwrap().as_ref() {
            wake();
        }
    }
}

impl std::fmt::Debug for MainLoopScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MainLoopScheduler")
            .field("pending", &self.pending())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
