//! Receive arbitration.
//!
//! An arbiter decides whether a receiver may take its next message *now*,
//! *later*, or *never*. The [`CoordinationArbiter`] manages three lanes of
//! receivers — exclusive, concurrent, and teardown — letting concurrent
//! messages flow freely until an exclusive message arrives, bleeding the
//! in-flight handlers off, running the exclusive work, then reopening the
//! flood gates. Teardown runs once everything else has drained, after which
//! nothing more is admitted.
//!
//! Decisions are made under a plain mutex and *applied* outside it: a mode
//! flip returns the set of receivers whose parked messages should be
//! re-delivered, and the caller flushes them after the state lock is
//! released.

use crate::receiver::Arbitrated;
use std::sync::{Arc, Mutex, Weak};

// ---------------------------------------------------------------------------
// Decisions and lanes
// ---------------------------------------------------------------------------

/// An arbiter's answer to "may this receiver take the next message?".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveDecision {
    /// Admit and run the handler now.
    Now,
    /// Park the message inside the receiver; it is re-offered on the next
    /// mode flip.
    Later,
    /// Refuse permanently; the receiver is detached from its port.
    Never,
}

/// Which lane of a [`CoordinationArbiter`] a receiver belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    /// Must run alone with respect to the concurrent lane.
    Exclusive,
    /// May run alongside other concurrent handlers.
    Concurrent,
    /// Runs once everything has drained; nothing is admitted afterwards.
    Teardown,
}

// ---------------------------------------------------------------------------
// CoordinationArbiter
// ---------------------------------------------------------------------------

mod flags {
    pub const CONCURRENT: u8 = 1 << 0;
    pub const EXCLUSIVE: u8 = 1 << 1;
    pub const TEARDOWN: u8 = 1 << 2;
    pub const NEEDS_CONCURRENT: u8 = 1 << 3;
    pub const NEEDS_EXCLUSIVE: u8 = 1 << 4;
    pub const NEEDS_TEARDOWN: u8 = 1 << 5;
}

struct CoordState {
    mode: u8,
    /// Handlers admitted but not yet completed.
    active: usize,
    exclusive: Option<Weak<dyn Arbitrated>>,
    concurrent: Option<Weak<dyn Arbitrated>>,
    teardown: Option<Weak<dyn Arbitrated>>,
}

impl CoordState {
    fn is(&self, flag: u8) -> bool {
        self.mode & flag != 0
    }

    fn set(&mut self, flag: u8) {
        self.mode |= flag;
    }
}

/// Three-lane arbiter: exclusive / concurrent / teardown.
pub struct CoordinationArbiter {
    state: Mutex<CoordState>,
}

impl CoordinationArbiter {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(CoordState {
                mode: 0,
                active: 0,
                exclusive: None,
                concurrent: None,
                teardown: None,
            }),
        })
    }

    /// Decide whether a receiver on `lane` may take its next message.
    ///
    /// Called by the receiver with its own decision lock held; this only
    /// touches the arbiter's state lock, never calls back out.
    pub fn can_receive(&self, lane: Lane) -> ReceiveDecision {
        let mut state = self.state.lock().unwrap();

        if state.is(flags::TEARDOWN) {
            return ReceiveDecision::Never;
        }

        match lane {
            Lane::Concurrent => {
                if state.is(flags::EXCLUSIVE) {
                    state.set(flags::NEEDS_CONCURRENT);
                    ReceiveDecision::Later
                } else {
                    state.set(flags::CONCURRENT);
                    state.active += 1;
                    ReceiveDecision::Now
                }
            }
            Lane::Exclusive => {
                if state.is(flags::CONCURRENT) {
                    state.set(flags::NEEDS_EXCLUSIVE);
                    ReceiveDecision::Later
                } else {
                    state.set(flags::EXCLUSIVE);
                    state.active += 1;
                    ReceiveDecision::Now
                }
            }
            Lane::Teardown => {
                if state.active == 0 {
                    state.mode = flags::TEARDOWN;
                    state.active += 1;
                    ReceiveDecision::Now
                } else {
                    state.set(flags::NEEDS_TEARDOWN);
                    ReceiveDecision::Later
                }
            }
        }
    }

    /// Release an admission that never ran (lost a completion race).
    pub fn rescind(&self, lane: Lane) {
        self.complete(lane);
    }

    /// Note a handler completion on `lane`; flips modes and re-offers parked
    /// messages once the active count drains.
    pub fn receive_completed(&self, lane: Lane) {
        self.complete(lane);
    }

    fn complete(&self, _lane: Lane) {
        let plan = {
            let mut state = self.state.lock().unwrap();
            state.active = state.active.saturating_sub(1);
            if state.active > 0 {
                Vec::new()
            } else {
                Self::drained(&mut state)
            }
        };

        // State lock released: re-offer parked messages.
        for receiver in plan {
            if let Some(receiver) = receiver.upgrade() {
                receiver.flush_held();
            }
        }
    }

    /// The active count just hit zero: flip modes per the pending "needs"
    /// flags and return the receivers to flush.
    fn drained(state: &mut CoordState) -> Vec<Weak<dyn Arbitrated>> {
        let mut plan = Vec::new();

        if state.is(flags::TEARDOWN) {
            // Terminal; nothing reopens.
        } else if state.is(flags::NEEDS_TEARDOWN) {
            // Re-offer; the teardown receiver's re-delivery claims the
            // teardown mode itself (or re-parks if something snuck in).
            state.mode = 0;
            if let Some(r) = &state.teardown {
                plan.push(Weak::clone(r));
            }
        } else if state.is(flags::NEEDS_EXCLUSIVE) {
            state.mode = 0;
            state.set(flags::EXCLUSIVE);
            if let Some(r) = &state.exclusive {
                plan.push(Weak::clone(r));
            }
        } else if state.is(flags::NEEDS_CONCURRENT) {
            state.mode = 0;
            state.set(flags::CONCURRENT);
            if let Some(r) = &state.concurrent {
                plan.push(Weak::clone(r));
            }
        } else {
            state.mode = 0;
        }

        plan
    }

    #[cfg(test)]
    fn active(&self) -> usize {
        self.state.lock().unwrap().active
    }
}

impl std::fmt::Debug for CoordinationArbiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap();
        f.debug_struct("CoordinationArbiter")
            .field("mode", &state.mode)
            .field("active", &state.active)
            .finish()
    }
}

/// Wire up to three lanes of receivers to a new [`CoordinationArbiter`].
///
/// Each receiver is attached to the arbiter on its lane; a receiver that
/// already has an arbiter keeps the one it has (attachment happens once).
pub fn coordinate(
    exclusive: Option<Arc<dyn Arbitrated>>,
    concurrent: Option<Arc<dyn Arbitrated>>,
    teardown: Option<Arc<dyn Arbitrated>>,
) -> Arc<CoordinationArbiter> {
    let arbiter = CoordinationArbiter::new();

    {
        let mut state = arbiter.state.lock().unwrap();
        state.exclusive = exclusive.as_ref().map(Arc::downgrade);
        state.concurrent = concurrent.as_ref().map(Arc::downgrade);
        state.teardown = teardown.as_ref().map(Arc::downgrade);
    }

    if let Some(r) = exclusive {
        r.set_arbitration(Arc::clone(&arbiter), Lane::Exclusive);
    }
    if let Some(r) = concurrent {
        r.set_arbitration(Arc::clone(&arbiter), Lane::Concurrent);
    }
    if let Some(r) = teardown {
        r.set_arbitration(Arc::clone(&arbiter), Lane::Teardown);
    }

    arbiter
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
