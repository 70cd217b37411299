//! Fixed-capacity round-robin slot ring.
//!
//! A [`RoundRobin`] spreads picks over a set of registered items: the pooled
//! scheduler keeps one slot per worker queue, using [`apply`](RoundRobin::apply)
//! to spread externally submitted work and [`for_each`](RoundRobin::for_each)
//! to iterate steal victims. Items come and go while pickers run, so both
//! traversals tolerate transiently empty slots by advancing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// A fixed-size ring of slots holding shared items.
///
/// `count` is a high-water mark claimed atomically by [`append`] — it never
/// decreases, so the pick cursor keeps a stable modulus while slots empty
/// and refill. [`apply`] probes at most `count` slots per call.
///
/// [`append`]: RoundRobin::append
/// [`apply`]: RoundRobin::apply
pub struct RoundRobin<T> {
    size: usize,
    /// High-water mark of claimed slots.
    count: AtomicUsize,
    /// Monotonic pick cursor; read mod `count`.
    active: AtomicUsize,
    slots: Vec<Mutex<Option<Arc<T>>>>,
}

impl<T> RoundRobin<T> {
    /// Create a ring with room for `size` items.
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "round-robin size must be non-zero");
        Self {
            size,
            count: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            slots: (0..size).map(|_| Mutex::new(None)).collect(),
        }
    }

    /// Capacity of the ring.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of slots ever claimed (high-water mark).
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    /// Register an item. Returns `false` if the ring is at capacity.
    ///
    /// The claim is two-phase: the count is raised with a CAS first, then the
    /// first empty slot is filled. Concurrent pickers may observe the raised
    /// count before the slot fills; they skip the empty slot and move on.
    pub fn append(&self, item: Arc<T>) -> bool {
        loop {
            let count = self.count.load(Ordering::Acquire);
            if count + 1 > self.size {
                return false;
            }
            if self
                .count
                .compare_exchange(count, count + 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                break;
            }
        }

        for slot in &self.slots {
            let mut guard = slot.lock().unwrap();
            if guard.is_none() {
                *guard = Some(item);
                return true;
            }
        }

        // Unreachable while removes keep the claimed count honest, but do
        // not lose the claim if it ever happens.
        self.count.fetch_sub(1, Ordering::AcqRel);
        false
    }

    /// Remove an item by identity. A no-op if the item is not present.
    pub fn remove(&self, item: &Arc<T>) {
        for slot in &self.slots {
            let mut guard = slot.lock().unwrap();
            if guard.as_ref().is_some_and(|held| Arc::ptr_eq(held, item)) {
                *guard = None;
                return;
            }
        }
    }

    /// Offer items to `callback` in round-robin order until one accepts.
    ///
    /// The cursor advances on every probe, so consecutive calls spread across
    /// the ring. At most `count` slots are probed; returns `false` when the
    /// ring is empty or every probed item rejected the offer.
    pub fn apply<F>(&self, mut callback: F) -> bool
    where
        F: FnMut(&Arc<T>) -> bool,
    {
        let count = self.count.load(Ordering::Acquire);
        if count == 0 {
            return false;
        }

        for _ in 0..count {
            let index = self.active.fetch_add(1, Ordering::Relaxed) % count;
            let item = self.slots[index].lock().unwrap().clone();
            if let Some(item) = item {
                if callback(&item) {
                    return true;
                }
            }
        }
        false
    }

    /// Visit every occupied slot in ring order.
    ///
    /// `callback` returns `false` to stop early. Slots emptied mid-iteration
    /// are simply skipped.
    pub fn for_each<F>(&self, mut callback: F)
    where
        F: FnMut(&Arc<T>) -> bool,
    {
        for slot in &self.slots {
            let item = slot.lock().unwrap().clone();
            if let Some(item) = item {
                if !callback(&item) {
                    return;
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
