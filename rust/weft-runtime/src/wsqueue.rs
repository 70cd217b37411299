//! Work-stealing deque for scheduler work items.
//!
//! A [`WorkStealingQueue`] is owned by exactly one worker thread, which
//! pushes and pops at its own end without contention. Peers hold cloneable
//! [`Stealer`] handles and take items from the opposite end, so the owner
//! sees its items LIFO (freshest first, cache-hot) while thieves drain the
//! oldest work first.
//!
//! Built on [`crossbeam_deque`]'s `Worker`/`Stealer` pair. The one addition
//! is a bounded-patience steal: `crossbeam` reports transient contention as
//! [`Steal::Retry`], and [`try_steal`](Stealer::try_steal) keeps retrying
//! until its timeout elapses instead of making every caller write that loop.

use crossbeam_deque::{Steal, Worker};
use std::thread;
use std::time::{Duration, Instant};

// ---------------------------------------------------------------------------
// WorkStealingQueue (owner side)
// ---------------------------------------------------------------------------

/// The owner side of a work-stealing deque.
///
/// Not shareable between threads — move it to the worker thread that owns
/// it and hand [`stealer`](WorkStealingQueue::stealer) handles to peers.
pub struct WorkStealingQueue<T> {
    worker: Worker<T>,
}

impl<T: Send> Default for WorkStealingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> WorkStealingQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self {
            // LIFO for the owner: recursively spawned work runs while its
            // data is still warm; stealers take from the other end.
            worker: Worker::new_lifo(),
        }
    }

    /// Create a stealer handle for peer threads.
    pub fn stealer(&self) -> Stealer<T> {
        Stealer {
            inner: self.worker.stealer(),
        }
    }

    /// Number of items currently in the queue.
    pub fn len(&self) -> usize {
        self.worker.len()
    }

    /// Whether the queue is currently empty.
    pub fn is_empty(&self) -> bool {
        self.worker.is_empty()
    }

    /// Push an item. Owner only.
    pub fn local_push(&self, item: T) {
        self.worker.push(item);
    }

    /// Pop the most recently pushed item. Owner only.
    pub fn local_pop(&self) -> Option<T> {
        self.worker.pop()
    }
}

impl<T> std::fmt::Debug for WorkStealingQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkStealingQueue")
            .field("len", &self.worker.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Stealer
// ---------------------------------------------------------------------------

/// A shareable handle that takes items from the cold end of a peer's queue.
pub struct Stealer<T> {
    inner: crossbeam_deque::Stealer<T>,
}

impl<T> Clone for Stealer<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send> Stealer<T> {
    /// Number of items currently in the queue.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Whether the queue is currently empty.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Try to steal one item, retrying through transient contention for at
    /// most `timeout`.
    ///
    /// Returns `None` when the queue is empty or the timeout elapses while
    /// other threads keep winning the race.
    pub fn try_steal(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        loop {
            match self.inner.steal() {
                Steal::Success(item) => return Some(item),
                Steal::Empty => return None,
                Steal::Retry => {
                    if Instant::now() >= deadline {
                        return None;
                    }
                    thread::yield_now();
                }
            }
        }
    }
}

impl<T> std::fmt::Debug for Stealer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stealer")
            .field("len", &self.inner.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const STEAL_WAIT: Duration = Duration::from_millis(50);

    #[test]
    fn push_pop_lifo_for_owner() {
        let queue = WorkStealingQueue::new();
        queue.local_push(1);
        queue.local_push(2);
        queue.local_push(3);
        assert_eq!(queue.len(), 3);

        assert_eq!(queue.local_pop(), Some(3));
        assert_eq!(queue.local_pop(), Some(2));
        assert_eq!(queue.local_pop(), Some(1));
        assert_eq!(queue.local_pop(), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn steal_takes_the_oldest_item() {
        let queue = WorkStealingQueue::new();
        let stealer = queue.stealer();
        queue.local_push(1);
        queue.local_push(2);

        assert_eq!(stealer.try_steal(STEAL_WAIT), Some(1));
        assert_eq!(queue.local_pop(), Some(2));
        assert_eq!(stealer.try_steal(STEAL_WAIT), None);
    }

    #[test]
    fn steal_empty_returns_none() {
        let queue = WorkStealingQueue::<u32>::new();
        let stealer = queue.stealer();
        assert_eq!(stealer.try_steal(STEAL_WAIT), None);
        // A failed steal must not lose anything pushed afterwards.
        queue.local_push(7);
        assert_eq!(queue.local_pop(), Some(7));
    }

    #[test]
    fn growth_preserves_identity_and_order() {
        let queue = WorkStealingQueue::new();
        // Push well past any initial capacity.
        for i in 0..1000 {
            queue.local_push(i);
        }
        assert_eq!(queue.len(), 1000);

        for expected in (0..1000).rev() {
            assert_eq!(queue.local_pop(), Some(expected));
        }
        assert_eq!(queue.local_pop(), None);
    }

    #[test]
    fn interleaved_growth_and_steals() {
        let queue = WorkStealingQueue::new();
        let stealer = queue.stealer();

        for i in 0..100 {
            queue.local_push(i);
        }
        // Steal a few of the oldest, then pile on more.
        for expected in 0..10 {
            assert_eq!(stealer.try_steal(STEAL_WAIT), Some(expected));
        }
        for i in 100..200 {
            queue.local_push(i);
        }

        let mut seen = HashSet::new();
        while let Some(v) = queue.local_pop() {
            seen.insert(v);
        }
        assert_eq!(seen.len(), 190);
        assert!(!seen.contains(&5));
        assert!(seen.contains(&10) && seen.contains(&199));
    }

    #[test]
    fn every_item_returned_exactly_once_under_contention() {
        const ITEMS: usize = 10_000;
        const STEALERS: usize = 4;

        let queue = WorkStealingQueue::new();
        let taken = Arc::new(AtomicUsize::new(0));
        let seen: Arc<std::sync::Mutex<HashSet<usize>>> =
            Arc::new(std::sync::Mutex::new(HashSet::new()));

        let mut handles = vec![];
        for _ in 0..STEALERS {
            let stealer = queue.stealer();
            let taken = Arc::clone(&taken);
            let seen = Arc::clone(&seen);
            handles.push(thread::spawn(move || {
                while taken.load(Ordering::Relaxed) < ITEMS {
                    if let Some(v) = stealer.try_steal(Duration::from_millis(1)) {
                        assert!(seen.lock().unwrap().insert(v), "item {v} seen twice");
                        taken.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }));
        }

        // Owner interleaves pushes and pops.
        for i in 0..ITEMS {
            queue.local_push(i);
            if i % 3 == 0 {
                if let Some(v) = queue.local_pop() {
                    assert!(seen.lock().unwrap().insert(v), "item {v} seen twice");
                    taken.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
        while let Some(v) = queue.local_pop() {
            assert!(seen.lock().unwrap().insert(v), "item {v} seen twice");
            taken.fetch_add(1, Ordering::Relaxed);
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(taken.load(Ordering::Relaxed), ITEMS);
        assert_eq!(seen.lock().unwrap().len(), ITEMS);
    }

    #[test]
    fn length_tracks_pushes_and_takes() {
        let queue = WorkStealingQueue::new();
        let stealer = queue.stealer();
        assert_eq!(queue.len(), 0);

        for i in 0..10 {
            queue.local_push(i);
        }
        assert_eq!(queue.len(), 10);
        assert_eq!(stealer.len(), 10);

        queue.local_pop();
        stealer.try_steal(STEAL_WAIT);
        assert_eq!(queue.len(), 8);
    }

    #[test]
    fn drop_releases_remaining_items() {
        struct Tracked(Arc<AtomicUsize>);
        impl Drop for Tracked {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let drops = Arc::new(AtomicUsize::new(0));
        {
            let queue = WorkStealingQueue::new();
            for _ in 0..5 {
                queue.local_push(Tracked(Arc::clone(&drops)));
            }
            drop(queue.local_pop());
        }
        assert_eq!(drops.load(Ordering::Relaxed), 5);
    }
}
