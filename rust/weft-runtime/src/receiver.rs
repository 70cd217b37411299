//! Scheduler-bound message consumers.
//!
//! A [`Receiver`] sits behind a [`Port`](crate::port::Port) and decides, per
//! message, whether to run its handler now, park the message, or refuse it.
//! Admitted handlers are dispatched onto the receiver's scheduler; the
//! deliver call itself never runs user code.
//!
//! The fast path — persistent receiver, no arbiter, no concurrency limit —
//! schedules unconditionally without taking any lock. Everything else goes
//! through the decision lock: completed one-shots refuse, receivers at
//! their concurrency limit push back on the port, and arbitrated receivers
//! ask their [`CoordinationArbiter`] for a verdict.

use crate::arbiter::{CoordinationArbiter, Lane, ReceiveDecision};
use crate::port::Port;
use crate::scheduler::{ScheduleExt, Scheduler};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};

// ---------------------------------------------------------------------------
// DeliveryStatus
// ---------------------------------------------------------------------------

/// Outcome of offering one message to a receiver.
///
/// Variants that decline the message hand it back so the port can buffer it.
#[derive(Debug)]
pub enum DeliveryStatus<T> {
    /// Handler scheduled; nothing more to do.
    Accepted,
    /// Handler parked the message internally; pause the port until the
    /// receiver flushes.
    AcceptedPause,
    /// Not accepted right now; pause the port and keep the message pending.
    Pause(T),
    /// Accepted as the one allowed message of a one-shot receiver; detach.
    AcceptedRemove,
    /// Refused permanently; keep the message pending and detach.
    Remove(T),
}

// ---------------------------------------------------------------------------
// Receiver
// ---------------------------------------------------------------------------

struct Arbitration {
    arbiter: Arc<CoordinationArbiter>,
    lane: Lane,
}

/// A message consumer bound to a scheduler.
///
/// Created with [`Receiver::new`] (persistent, unlimited),
/// [`Receiver::one_shot`] (accepts a single message over its lifetime), or
/// [`Receiver::with_limit`] (bounded concurrent handlers), then attached to
/// a port via [`Port::set_receiver`](crate::port::Port::set_receiver).
pub struct Receiver<T> {
    scheduler: Arc<dyn Scheduler>,
    handler: Box<dyn Fn(T) + Send + Sync>,
    persistent: bool,
    /// One-shot receivers flip this with a CAS on their only accept.
    completed: AtomicBool,
    /// Handlers currently scheduled or running.
    active: AtomicUsize,
    /// 0 = unlimited.
    max_active: usize,
    /// The one message an arbiter told us to take later.
    held: Mutex<Option<T>>,
    /// Serializes the slow-path admission decision.
    decision: Mutex<()>,
    arbitration: OnceLock<Arbitration>,
    /// Back-reference for flushing parked deliveries after completions.
    port: Mutex<Weak<Port<T>>>,
    /// Self-reference so `&self` methods can schedule owning closures.
    this: Weak<Receiver<T>>,
}

impl<T: Send + 'static> Receiver<T> {
    fn build(
        scheduler: Arc<dyn Scheduler>,
        handler: Box<dyn Fn(T) + Send + Sync>,
        persistent: bool,
        max_active: usize,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            scheduler,
            handler,
            persistent,
            completed: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            max_active,
            held: Mutex::new(None),
            decision: Mutex::new(()),
            arbitration: OnceLock::new(),
            port: Mutex::new(Weak::new()),
            this: Weak::clone(this),
        })
    }

    /// A persistent receiver with unbounded handler concurrency.
    pub fn new<F>(scheduler: Arc<dyn Scheduler>, handler: F) -> Arc<Self>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Self::build(scheduler, Box::new(handler), true, 0)
    }

    /// A receiver that accepts at most one message over its lifetime.
    pub fn one_shot<F>(scheduler: Arc<dyn Scheduler>, handler: F) -> Arc<Self>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Self::build(scheduler, Box::new(handler), false, 0)
    }

    /// A persistent receiver running at most `max_active` handlers at once.
    pub fn with_limit<F>(scheduler: Arc<dyn Scheduler>, max_active: usize, handler: F) -> Arc<Self>
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        Self::build(scheduler, Box::new(handler), true, max_active.max(1))
    }

    /// The scheduler handlers are dispatched on.
    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    /// Whether an arbiter governs this receiver.
    pub fn has_arbiter(&self) -> bool {
        self.arbitration.get().is_some()
    }

    /// Handlers currently scheduled or running.
    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Whether a one-shot receiver has consumed its message.
    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    /// No handler in flight and nothing parked: a push-back decision based
    /// on older state is stale and the port should re-offer.
    ///
    /// The port checks this after buffering a `Pause`d message; the
    /// completion path checks the port after releasing its slot. One of the
    /// two always observes the other's write, so a message can never be
    /// stranded between them.
    pub(crate) fn is_idle(&self) -> bool {
        self.active.load(Ordering::SeqCst) == 0 && self.held.lock().unwrap().is_none()
    }

    pub(crate) fn bind_port(&self, port: Weak<Port<T>>) {
        *self.port.lock().unwrap() = port;
    }

    /// Offer one message. Called by the port, outside the port's own lock.
    pub fn deliver(&self, message: T) -> DeliveryStatus<T> {
        // Fast path: nothing can pause or refuse, so skip the decision lock.
        if self.arbitration.get().is_none() && self.max_active == 0 && self.persistent {
            self.active.fetch_add(1, Ordering::AcqRel);
            self.schedule(message);
            return DeliveryStatus::Accepted;
        }

        let mut status;
        let mut execute = false;
        let mut admitted_lane = None;
        {
            let _guard = self.decision.lock().unwrap();

            if self.completed.load(Ordering::Acquire) {
                return DeliveryStatus::Remove(message);
            }

            let at_limit = self.max_active > 0 && self.active_count() >= self.max_active;
            if at_limit || self.held.lock().unwrap().is_some() {
                return DeliveryStatus::Pause(message);
            }

            if let Some(arbitration) = self.arbitration.get() {
                match arbitration.arbiter.can_receive(arbitration.lane) {
                    ReceiveDecision::Now => {
                        execute = true;
                        admitted_lane = Some(arbitration.lane);
                        status = DeliveryStatus::Accepted;
                    }
                    ReceiveDecision::Later => {
                        *self.held.lock().unwrap() = Some(message);
                        return DeliveryStatus::AcceptedPause;
                    }
                    ReceiveDecision::Never => {
                        return DeliveryStatus::Remove(message);
                    }
                }
            } else {
                execute = true;
                status = DeliveryStatus::Accepted;
            }

            if execute {
                self.active.fetch_add(1, Ordering::AcqRel);
            }
        }

        // One-shots race here when two deliveries both got past the lock-free
        // fast checks; exactly one wins the CAS.
        if !self.persistent && execute {
            if self
                .completed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                status = DeliveryStatus::AcceptedRemove;
            } else {
                execute = false;
                self.active.fetch_sub(1, Ordering::AcqRel);
                if let Some(lane) = admitted_lane {
                    if let Some(arbitration) = self.arbitration.get() {
                        arbitration.arbiter.rescind(lane);
                    }
                }
                return DeliveryStatus::Remove(message);
            }
        }

        if execute {
            self.schedule(message);
        }
        status
    }

    /// Dispatch the handler for an admitted message.
    fn schedule(&self, message: T) {
        let this = self.this.upgrade().expect("receiver scheduled during teardown");
        self.scheduler.queue(move || {
            (this.handler)(message);
            this.handler_completed();
        });
    }

    /// Bookkeeping after a handler returns: release the slot, tell the
    /// arbiter, and resume any deliveries that were parked while we ran.
    fn handler_completed(&self) {
        self.active.fetch_sub(1, Ordering::AcqRel);

        if let Some(arbitration) = self.arbitration.get() {
            arbitration
                .arbiter
                .receive_completed(arbitration.lane);
        }

        let port = self.port.lock().unwrap().upgrade();
        if let Some(port) = port {
            if port.is_parked() {
                port.flush();
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Arbitrated: object-safe hooks for the coordination arbiter
// ---------------------------------------------------------------------------

/// Hooks an arbiter uses on receivers regardless of their message type.
pub trait Arbitrated: Send + Sync {
    /// Attach an arbiter on `lane`. Returns `false` if one is already set.
    fn set_arbitration(&self, arbiter: Arc<CoordinationArbiter>, lane: Lane) -> bool;

    /// Re-offer the held message (if any) and drain the port buffer.
    fn flush_held(&self);
}

impl<T: Send + 'static> Arbitrated for Receiver<T> {
    fn set_arbitration(&self, arbiter: Arc<CoordinationArbiter>, lane: Lane) -> bool {
        self.arbitration.set(Arbitration { arbiter, lane }).is_ok()
    }

    fn flush_held(&self) {
        let message = self.held.lock().unwrap().take();
        if let Some(message) = message {
            match self.deliver(message) {
                DeliveryStatus::Pause(message) => {
                    // Still blocked; park it again for the next flip.
                    *self.held.lock().unwrap() = Some(message);
                }
                // Refused for good (one-shot already consumed): the message
                // is dropped. Later-decisions re-parked it inside deliver.
                DeliveryStatus::Remove(_) => {}
                _ => {}
            }
        }

        let port = self.port.lock().unwrap().upgrade();
        if let Some(port) = port {
            if port.is_parked() {
                port.flush();
            }
        }
    }
}

impl<T: Send + 'static> std::fmt::Debug for Receiver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receiver")
            .field("persistent", &self.persistent)
            .field("max_active", &self.max_active)
            .field("active", &self.active.load(Ordering::Relaxed))
            .field("completed", &self.completed.load(Ordering::Relaxed))
            .field("arbitrated", &self.has_arbiter())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
