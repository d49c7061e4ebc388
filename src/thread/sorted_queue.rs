//! Ordered release queue for parallel pipeline results.
//!
//! Workers decode blobs in whatever order the scheduler runs them; the
//! consumer must see results in source order. The queue is a dense sliding
//! window indexed by `seq - base`: `push` stores an item at its sequence
//! slot, `wait_and_pop` releases only slot `base` and then advances the
//! window. Sequence numbers are dense (0, 1, 2, ...), so slot access is
//! O(1) and the consumer never inspects anything beyond slot zero; a heap
//! would buy nothing here.
//!
//! A slot is occupied iff it holds `Some`, which keeps "not ready"
//! distinct from any real value. `finish(end)` declares the exclusive end
//! of the sequence so the consumer can terminate without a sentinel item:
//! `wait_and_pop` returns `None` once `base == end`.
//!
//! The window grows only to `max(seq seen) - base + 1`; producers throttle
//! on [`len`](SortedQueue::len), which keeps it bounded.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};

#[derive(Debug)]
struct Inner<T> {
    slots: VecDeque<Option<T>>,
    base: u64,
    end: Option<u64>,
}

/// Single-consumer queue releasing items in sequence order.
#[derive(Debug)]
pub struct SortedQueue<T> {
    inner: Mutex<Inner<T>>,
    ready: Condvar,
}

impl<T> SortedQueue<T> {
    /// Creates an empty queue with `base == 0`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                slots: VecDeque::new(),
                base: 0,
                end: None,
            }),
            ready: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Stores `value` at sequence slot `seq`.
    ///
    /// # Panics
    /// - if `seq` is below the window base (the slot was already consumed)
    /// - if the slot is already occupied
    /// - if `seq` is at or past a declared end
    pub fn push(&self, value: T, seq: u64) {
        let mut inner = self.lock();
        assert!(seq >= inner.base, "push below queue base");
        if let Some(end) = inner.end {
            assert!(seq < end, "push past declared end");
        }
        let idx = (seq - inner.base) as usize;
        if inner.slots.len() <= idx {
            inner.slots.resize_with(idx + 1, || None);
        }
        assert!(inner.slots[idx].is_none(), "slot pushed twice");
        inner.slots[idx] = Some(value);
        if idx == 0 {
            self.ready.notify_all();
        }
    }

    /// Declares the exclusive end of the sequence.
    ///
    /// Every sequence number below `end` must still be pushed (by in-flight
    /// producers); nothing at or past `end` may be. Idempotent only with the
    /// same value.
    pub fn finish(&self, end: u64) {
        let mut inner = self.lock();
        assert!(end >= inner.base, "end below queue base");
        if let Some(prev) = inner.end {
            assert!(prev == end, "conflicting end marks");
        }
        inner.end = Some(end);
        self.ready.notify_all();
    }

    /// Blocks until slot `base` is ready, returns it, and advances the base.
    ///
    /// Returns `None` once the declared end is reached.
    pub fn wait_and_pop(&self) -> Option<T> {
        let mut inner = self.lock();
        loop {
            if inner.end == Some(inner.base) {
                return None;
            }
            if let Some(slot) = inner.slots.front_mut() {
                if let Some(value) = slot.take() {
                    inner.slots.pop_front();
                    inner.base += 1;
                    return Some(value);
                }
            }
            inner = self.ready.wait(inner).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Non-blocking pop of slot `base`; `None` when it is not ready.
    pub fn try_pop(&self) -> Option<T> {
        let mut inner = self.lock();
        let value = inner.slots.front_mut().and_then(Option::take)?;
        inner.slots.pop_front();
        inner.base += 1;
        Some(value)
    }

    /// True iff slot `base` is empty. Later slots may still be populated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        let inner = self.lock();
        !matches!(inner.slots.front(), Some(Some(_)))
    }

    /// Current window length, regardless of which slots are occupied.
    ///
    /// `len() == 0` implies `is_empty()`, but not the other way around.
    /// Producers use this for backpressure.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().slots.len()
    }
}

impl<T> Default for SortedQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn releases_in_sequence_order() {
        let q = SortedQueue::new();
        q.push("b", 1);
        assert!(q.is_empty());
        assert!(q.try_pop().is_none());

        q.push("a", 0);
        assert!(!q.is_empty());
        assert_eq!(q.try_pop(), Some("a"));
        assert_eq!(q.try_pop(), Some("b"));
        assert!(q.try_pop().is_none());
    }

    #[test]
    fn finish_terminates_consumer() {
        let q = SortedQueue::<u32>::new();
        q.finish(0);
        assert_eq!(q.wait_and_pop(), None);
        // Terminal state is stable.
        assert_eq!(q.wait_and_pop(), None);
    }

    #[test]
    fn finish_after_pending_items() {
        let q = SortedQueue::new();
        q.push(10, 0);
        q.push(20, 1);
        q.finish(2);
        assert_eq!(q.wait_and_pop(), Some(10));
        assert_eq!(q.wait_and_pop(), Some(20));
        assert_eq!(q.wait_and_pop(), None);
    }

    #[test]
    fn window_length_counts_gaps() {
        let q = SortedQueue::new();
        q.push(1u32, 4);
        assert_eq!(q.len(), 5);
        assert!(q.is_empty());
    }

    #[test]
    #[should_panic(expected = "slot pushed twice")]
    fn double_push_panics() {
        let q = SortedQueue::new();
        q.push(1u32, 0);
        q.push(2u32, 0);
    }

    #[test]
    fn concurrent_out_of_order_producers() {
        const COUNT: u64 = 200;
        let q = Arc::new(SortedQueue::new());

        let producers: Vec<_> = (0..4)
            .map(|p| {
                let q = Arc::clone(&q);
                thread::spawn(move || {
                    // Each producer owns seq numbers congruent to p mod 4,
                    // pushed high-to-low to maximize reordering.
                    let mut seqs: Vec<u64> = (0..COUNT).filter(|s| s % 4 == p).collect();
                    seqs.reverse();
                    for seq in seqs {
                        q.push(seq, seq);
                    }
                })
            })
            .collect();

        let consumer = {
            let q = Arc::clone(&q);
            thread::spawn(move || {
                let mut out = Vec::new();
                while let Some(v) = q.wait_and_pop() {
                    out.push(v);
                }
                out
            })
        };

        for p in producers {
            p.join().unwrap();
        }
        q.finish(COUNT);

        let out = consumer.join().unwrap();
        let expected: Vec<u64> = (0..COUNT).collect();
        assert_eq!(out, expected);
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Model check: the queue behaves like sorting by sequence number.
        #[test]
        fn model(perm in proptest::collection::vec(0usize..1000, 1..64)) {
            // Dedupe and compact to a dense 0..n permutation.
            let mut idx: Vec<usize> = (0..perm.len()).collect();
            idx.sort_by_key(|&i| (perm[i], i));
            let mut seq_of = vec![0u64; perm.len()];
            for (rank, &i) in idx.iter().enumerate() {
                seq_of[i] = rank as u64;
            }

            let q = SortedQueue::new();
            let mut popped = Vec::new();
            for (i, &seq) in seq_of.iter().enumerate() {
                q.push(seq, seq);
                prop_assert!(q.len() <= i + 1 || q.len() <= seq_of.len());
                while let Some(v) = q.try_pop() {
                    popped.push(v);
                }
            }
            while let Some(v) = q.try_pop() {
                popped.push(v);
            }
            let expected: Vec<u64> = (0..seq_of.len() as u64).collect();
            prop_assert_eq!(popped, expected);
        }
    }
}
