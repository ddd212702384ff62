//! Hand-off between capture, analysis workers and the decision stage.
//!
//! Capture must never block, so [`FrameQueue`] evicts the oldest waiting
//! frame when full. Sequence numbers are assigned at push, so an evicted
//! frame leaves a known gap that the capture thread reports with
//! [`Resequencer::skip`]. Workers may finish out of order; [`Resequencer`]
//! restores capture order before anything reaches the decision engine.

use crossbeam::queue::ArrayQueue;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free bounded queue with a drop-oldest overflow policy.
///
/// Sequence numbers follow queue order only while a single thread pushes.
pub struct FrameQueue<T> {
    items: ArrayQueue<(u64, T)>,
    next_seq: AtomicU64,
    dropped: AtomicU64,
}

impl<T> FrameQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: ArrayQueue::new(capacity.max(1)),
            next_seq: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Enqueue `item` under the next sequence number.
    ///
    /// Returns that number and, when the queue was full, the evicted oldest
    /// entry with its own sequence number.
    pub fn push(&self, item: T) -> (u64, Option<(u64, T)>) {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        let evicted = self.items.force_push((seq, item));
        if evicted.is_some() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        (seq, evicted)
    }

    pub fn pop(&self) -> Option<(u64, T)> {
        self.items.pop()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.items.capacity()
    }

    /// Items evicted by overflow since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Releases items strictly in sequence order.
///
/// Every sequence number must arrive exactly once, either as an item
/// ([`push`](Self::push)) or as a gap ([`skip`](Self::skip)).
pub struct Resequencer<T> {
    next: u64,
    pending: BTreeMap<u64, Option<T>>,
}

impl<T> Default for Resequencer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Resequencer<T> {
    pub fn new() -> Self {
        Self {
            next: 0,
            pending: BTreeMap::new(),
        }
    }

    /// Accept item `seq` and return every item now releasable, in order.
    ///
    /// Sequence numbers below the release point are discarded.
    pub fn push(&mut self, seq: u64, item: T) -> Vec<T> {
        self.accept(seq, Some(item))
    }

    /// Mark `seq` as never arriving and return every item now releasable.
    pub fn skip(&mut self, seq: u64) -> Vec<T> {
        self.accept(seq, None)
    }

    fn accept(&mut self, seq: u64, slot: Option<T>) -> Vec<T> {
        if seq < self.next {
            tracing::warn!(seq, next = self.next, "discarding already-released sequence number");
            return Vec::new();
        }
        self.pending.insert(seq, slot);

        let mut ready = Vec::new();
        while let Some(slot) = self.pending.remove(&self.next) {
            ready.extend(slot);
            self.next += 1;
        }
        ready
    }

    /// Sequence numbers held back waiting for an earlier one.
    pub fn backlog(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_queue_drops_oldest_when_full() {
        let q = FrameQueue::new(2);
        assert_eq!(q.push(1), (0, None));
        assert_eq!(q.push(2), (1, None));
        assert_eq!(q.push(3), (2, Some((0, 1))));
        assert_eq!(q.dropped(), 1);
        assert_eq!(q.len(), 2);
        assert_eq!(q.pop(), Some((1, 2)));
        assert_eq!(q.pop(), Some((2, 3)));
        assert_eq!(q.pop(), None);
        assert!(q.is_empty());
    }

    #[test]
    fn test_queue_zero_capacity_holds_one() {
        let q = FrameQueue::new(0);
        assert_eq!(q.capacity(), 1);
        assert_eq!(q.push('a'), (0, None));
        assert_eq!(q.push('b'), (1, Some((0, 'a'))));
    }

    #[test]
    fn test_queue_concurrent_consumers_see_each_item_once() {
        let q = Arc::new(FrameQueue::new(64));
        for i in 0..64u32 {
            q.push(i);
        }
        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let q = Arc::clone(&q);
                std::thread::spawn(move || {
                    let mut seen = Vec::new();
                    while let Some((seq, _)) = q.pop() {
                        seen.push(seq);
                    }
                    seen
                })
            })
            .collect();

        let mut all: Vec<u64> = consumers.into_iter().flat_map(|c| c.join().unwrap()).collect();
        all.sort_unstable();
        assert_eq!(all, (0..64).collect::<Vec<_>>());
    }

    #[test]
    fn test_resequencer_restores_order() {
        let mut r = Resequencer::new();
        assert!(r.push(1, "b").is_empty());
        assert!(r.push(2, "c").is_empty());
        assert_eq!(r.backlog(), 2);
        assert_eq!(r.push(0, "a"), vec!["a", "b", "c"]);
        assert_eq!(r.push(3, "d"), vec!["d"]);
        assert_eq!(r.backlog(), 0);
    }

    #[test]
    fn test_resequencer_discards_old_sequence() {
        let mut r = Resequencer::new();
        assert_eq!(r.push(0, 1), vec![1]);
        assert!(r.push(0, 2).is_empty());
        assert!(r.skip(0).is_empty());
    }

    #[test]
    fn test_resequencer_skip_releases_past_gap() {
        let mut r = Resequencer::new();
        assert!(r.push(1, "b").is_empty());
        assert!(r.push(3, "d").is_empty());
        assert_eq!(r.skip(0), vec!["b"]);
        assert_eq!(r.skip(2), vec!["d"]);
        assert_eq!(r.backlog(), 0);
        assert_eq!(r.push(4, "e"), vec!["e"]);
    }

    #[test]
    fn test_evicted_frames_do_not_stall_release() {
        let q = FrameQueue::new(1);
        let mut r = Resequencer::new();
        let mut released = Vec::new();

        for frame in ["a", "b", "c"] {
            let (_, evicted) = q.push(frame);
            if let Some((seq, _)) = evicted {
                released.extend(r.skip(seq));
            }
        }
        while let Some((seq, frame)) = q.pop() {
            released.extend(r.push(seq, frame));
        }

        assert_eq!(released, vec!["c"]);
        assert_eq!(r.backlog(), 0);
    }
}
