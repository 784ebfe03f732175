//! Lock-free unbounded sample queue
//!
//! A Michael–Scott two-pointer MPMC FIFO moving [`Sample`] records from the
//! real-time control thread to the best-effort statistics thread. Neither
//! side ever blocks: enqueue and dequeue are CAS loops, a lagging tail is
//! repaired opportunistically by whichever thread observes it, and retired
//! nodes go through [`epoch`] reclamation instead of being freed while a
//! concurrent reader might still hold them.
//!
//! A sentinel node is always present; "empty" is a logical state, not a
//! structural one.

#![allow(unsafe_code)] // AtomicPtr-linked nodes

pub mod epoch;

use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::domain::Sample;
use epoch::{EpochManager, LocalEpoch};

struct QueueNode {
    sample: Sample,
    next: AtomicPtr<QueueNode>,
}

impl QueueNode {
    fn boxed(sample: Sample) -> *mut QueueNode {
        // Allocation failure aborts the process: a lock-free queue has no
        // degraded mode without dynamic memory.
        Box::into_raw(Box::new(QueueNode { sample, next: AtomicPtr::new(ptr::null_mut()) }))
    }
}

/// Lock-free MPMC FIFO of telemetry samples.
pub struct SampleQueue {
    head: AtomicPtr<QueueNode>,
    tail: AtomicPtr<QueueNode>,
    fill_level: AtomicUsize,
    reclaim: EpochManager<QueueNode>,
}

unsafe impl Send for SampleQueue {}
unsafe impl Sync for SampleQueue {}

impl Default for SampleQueue {
    fn default() -> Self {
        SampleQueue::new()
    }
}

impl SampleQueue {
    #[must_use]
    pub fn new() -> Self {
        let sentinel = QueueNode::boxed(Sample::default());
        SampleQueue {
            head: AtomicPtr::new(sentinel),
            tail: AtomicPtr::new(sentinel),
            fill_level: AtomicUsize::new(0),
            reclaim: EpochManager::new(),
        }
    }

    /// Register the calling thread with the queue's reclamation scheme.
    /// Every thread touching the queue needs its own guard.
    pub fn register_thread(&self) -> Arc<LocalEpoch> {
        self.reclaim.register_thread()
    }

    /// Append a sample. Lock-free: retries CAS on contention, never waits
    /// on the consumer.
    pub fn enqueue(&self, sample: Sample, guard: &LocalEpoch) {
        let node = QueueNode::boxed(sample);
        self.reclaim.enter(guard);
        loop {
            let tail = self.tail.load(Ordering::Acquire);
            // SAFETY: tail is protected by the epoch guard.
            let next = unsafe { (*tail).next.load(Ordering::Acquire) };
            if tail != self.tail.load(Ordering::Acquire) {
                continue;
            }
            if next.is_null() {
                // SAFETY: tail stays valid for the same reason as above.
                let linked = unsafe {
                    (*tail)
                        .next
                        .compare_exchange_weak(
                            ptr::null_mut(),
                            node,
                            Ordering::Release,
                            Ordering::Relaxed,
                        )
                        .is_ok()
                };
                if linked {
                    // Best effort: a lagging tail is fixed by any observer.
                    let _ = self.tail.compare_exchange(
                        tail,
                        node,
                        Ordering::Release,
                        Ordering::Relaxed,
                    );
                    self.fill_level.fetch_add(1, Ordering::Relaxed);
                    break;
                }
            } else {
                let _ =
                    self.tail.compare_exchange(tail, next, Ordering::Release, Ordering::Relaxed);
            }
        }
        self.reclaim.exit(guard);
    }

    /// Remove and return the oldest sample, or `None` when logically empty.
    /// CAS failures are retried internally; the old sentinel is retired
    /// through the epoch manager, never freed in place.
    pub fn dequeue(&self, guard: &LocalEpoch) -> Option<Sample> {
        self.reclaim.enter(guard);
        let result = loop {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);
            // SAFETY: head is protected by the epoch guard.
            let next = unsafe { (*head).next.load(Ordering::Acquire) };
            if head != self.head.load(Ordering::Acquire) {
                continue;
            }
            if head == tail {
                if next.is_null() {
                    break None;
                }
                // Tail lagging behind a completed enqueue; help it along.
                let _ =
                    self.tail.compare_exchange(tail, next, Ordering::Release, Ordering::Relaxed);
            } else {
                // SAFETY: next was reached through a protected head and the
                // epoch guard keeps it alive even if another consumer wins.
                let sample = unsafe { (*next).sample };
                if self
                    .head
                    .compare_exchange(head, next, Ordering::Release, Ordering::Relaxed)
                    .is_ok()
                {
                    self.fill_level.fetch_sub(1, Ordering::Relaxed);
                    self.reclaim.defer_retire(head);
                    break Some(sample);
                }
            }
        };
        self.reclaim.exit(guard);
        // With the guard dropped this thread no longer blocks the epoch, so
        // give it a nudge; retired sentinels become freeable two epochs on.
        if result.is_some() {
            self.reclaim.try_advance();
        }
        result
    }

    /// Point-in-time estimate of the number of queued samples. Exact only
    /// at quiescence; a relaxed observation under concurrent mutation.
    #[must_use]
    pub fn fill_level(&self) -> usize {
        self.fill_level.load(Ordering::Relaxed)
    }
}

impl Drop for SampleQueue {
    fn drop(&mut self) {
        // Exclusive access: free the remaining chain, sentinel included.
        // Nodes already retired live on the epoch manager's garbage lists
        // and are freed by its own Drop.
        let mut cur = *self.head.get_mut();
        while !cur.is_null() {
            // SAFETY: sole owner; every node in the chain was Box-allocated.
            unsafe {
                let next = *(*cur).next.get_mut();
                drop(Box::from_raw(cur));
                cur = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Barrier;
    use std::thread;

    fn tagged(tag: i64) -> Sample {
        Sample { exec_time_ns: tag, ..Sample::default() }
    }

    #[test]
    fn dequeue_on_empty_reports_none() {
        let queue = SampleQueue::new();
        let guard = queue.register_thread();
        assert_eq!(queue.dequeue(&guard), None);
        assert_eq!(queue.fill_level(), 0);
    }

    #[test]
    fn fifo_order_over_full_drain() {
        let queue = SampleQueue::new();
        let guard = queue.register_thread();
        for tag in 0..100 {
            queue.enqueue(tagged(tag), &guard);
        }
        for tag in 0..100 {
            assert_eq!(queue.dequeue(&guard).unwrap().exec_time_ns, tag);
        }
        assert_eq!(queue.dequeue(&guard), None);
    }

    #[test]
    fn fill_level_matches_enqueues_minus_dequeues() {
        let queue = SampleQueue::new();
        let guard = queue.register_thread();
        for tag in 0..50 {
            queue.enqueue(tagged(tag), &guard);
        }
        assert_eq!(queue.fill_level(), 50);
        for _ in 0..20 {
            queue.dequeue(&guard).unwrap();
        }
        assert_eq!(queue.fill_level(), 30);
        while queue.dequeue(&guard).is_some() {}
        assert_eq!(queue.fill_level(), 0);
    }

    #[test]
    fn queue_usable_after_drain() {
        let queue = SampleQueue::new();
        let guard = queue.register_thread();
        queue.enqueue(tagged(1), &guard);
        assert!(queue.dequeue(&guard).is_some());
        assert_eq!(queue.dequeue(&guard), None);
        // The sentinel survives a full drain; the structure keeps working.
        queue.enqueue(tagged(2), &guard);
        assert_eq!(queue.dequeue(&guard).unwrap().exec_time_ns, 2);
    }

    #[test]
    fn concurrent_producers_lose_and_duplicate_nothing() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: i64 = 1_000;

        let queue = Arc::new(SampleQueue::new());
        let barrier = Arc::new(Barrier::new(PRODUCERS + 1));

        let mut handles = Vec::new();
        for producer in 0..PRODUCERS {
            let queue = Arc::clone(&queue);
            let barrier = Arc::clone(&barrier);
            let guard = queue.register_thread();
            handles.push(thread::spawn(move || {
                barrier.wait();
                let base = producer as i64 * PER_PRODUCER;
                for i in 0..PER_PRODUCER {
                    queue.enqueue(tagged(base + i), &guard);
                }
            }));
        }

        let consumer = {
            let queue = Arc::clone(&queue);
            let barrier = Arc::clone(&barrier);
            let guard = queue.register_thread();
            thread::spawn(move || {
                barrier.wait();
                let expected = PRODUCERS * PER_PRODUCER as usize;
                let mut seen = Vec::with_capacity(expected);
                while seen.len() < expected {
                    match queue.dequeue(&guard) {
                        Some(sample) => seen.push(sample.exec_time_ns),
                        None => thread::yield_now(),
                    }
                }
                seen
            })
        };

        for handle in handles {
            handle.join().unwrap();
        }
        let seen = consumer.join().unwrap();

        // Exactly N*M samples, no duplicates, no loss.
        let unique: HashSet<i64> = seen.iter().copied().collect();
        assert_eq!(unique.len(), PRODUCERS * PER_PRODUCER as usize);
        assert_eq!(queue.fill_level(), 0);

        // FIFO linearization: each producer's tags appear in submit order.
        let mut last_seen = vec![-1i64; PRODUCERS];
        for tag in seen {
            let producer = (tag / PER_PRODUCER) as usize;
            let offset = tag % PER_PRODUCER;
            assert!(
                offset > last_seen[producer],
                "producer {producer} tag {offset} out of order"
            );
            last_seen[producer] = offset;
        }
    }
}
