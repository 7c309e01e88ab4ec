//! Concurrent priority multiqueue.
//!
//! `heap_p = heap_c * workers` independently locked d-ary min-heaps. Inserts
//! pick a heap at random and redraw while the heap lock is contended; deletes
//! sample two heaps, prefer the one whose published minimum is lower, and
//! re-validate that minimum under the lock before extracting. The published
//! minimum is advisory only; the heap mutex is the ground truth.

use std::sync::Mutex;
use std::sync::atomic::{AtomicI16, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;

use crate::rng::{self, Cong};
use crate::task::Task;

/// Published-summary sentinel for an empty heap.
pub const PRIO_EMPTY: i16 = i16::MAX;

/// Insertion failure: the chosen heap was at capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFull;

struct HeapSlots {
    tasks: Box<[Option<Arc<Task>>]>,
    ntasks: usize,
}

impl HeapSlots {
    #[inline]
    fn prio_at(&self, idx: usize) -> i16 {
        self.tasks[idx]
            .as_ref()
            .expect("heap slot below ntasks must be occupied")
            .prio()
    }

    #[inline]
    fn swap(&mut self, a: usize, b: usize) {
        self.tasks.swap(a, b);
    }
}

struct TaskHeap {
    slots: Mutex<HeapSlots>,
    /// Current root priority, readable without the lock.
    prio: AtomicI16,
}

pub(crate) struct Multiq {
    heaps: Box<[CachePadded<TaskHeap>]>,
    heap_p: usize,
    unbias: u64,
    /// Probe rounds per `delete_min`, one per worker.
    rounds: usize,
    d: usize,
    capacity: usize,
}

impl Multiq {
    pub fn new(heap_p: usize, d: usize, capacity: usize, rounds: usize) -> Self {
        assert!(heap_p > 0 && d >= 2 && capacity > 0 && rounds > 0);
        let heaps = (0..heap_p)
            .map(|_| {
                CachePadded::new(TaskHeap {
                    slots: Mutex::new(HeapSlots {
                        tasks: (0..capacity).map(|_| None).collect(),
                        ntasks: 0,
                    }),
                    prio: AtomicI16::new(PRIO_EMPTY),
                })
            })
            .collect();
        Self {
            heaps,
            heap_p,
            unbias: rng::unbias_threshold(heap_p as u64),
            rounds,
            d,
            capacity,
        }
    }

    /// Stores `task` in one randomly chosen heap at `prio` and refreshes that
    /// heap's published minimum. Fails without retrying elsewhere if the
    /// chosen heap is full.
    pub fn insert(&self, task: &Arc<Task>, prio: i16, rng: &mut Cong) -> Result<(), QueueFull> {
        task.set_prio(prio);
        let (idx, mut slots) = loop {
            let idx = rng.next_below(self.heap_p as u64, self.unbias) as usize;
            if let Ok(guard) = self.heaps[idx].slots.try_lock() {
                break (idx, guard);
            }
        };

        if slots.ntasks >= self.capacity {
            return Err(QueueFull);
        }

        let at = slots.ntasks;
        slots.tasks[at] = Some(task.clone());
        slots.ntasks = at + 1;
        self.sift_up(&mut slots, at);
        drop(slots);

        // One-shot CAS: a concurrent insert or delete may have moved the
        // summary already, and that is fine.
        let published = self.heaps[idx].prio.load(Ordering::Acquire);
        if prio < published {
            let _ = self.heaps[idx].prio.compare_exchange(
                published,
                prio,
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
        }
        Ok(())
    }

    /// Extracts a task of approximately minimum priority, or `None` if all
    /// heaps look empty after `rounds` probe rounds.
    pub fn delete_min(&self, rng: &mut Cong) -> Option<Arc<Task>> {
        for _ in 0..self.rounds {
            let r1 = rng.next_below(self.heap_p as u64, self.unbias) as usize;
            let mut r2 = rng.next_below(self.heap_p as u64, self.unbias) as usize;
            if self.heap_p > 1 {
                while r2 == r1 {
                    r2 = rng.next_below(self.heap_p as u64, self.unbias) as usize;
                }
            }

            let p1 = self.heaps[r1].prio.load(Ordering::Acquire);
            let p2 = self.heaps[r2].prio.load(Ordering::Acquire);
            let (target, observed) = if p1 > p2 { (r2, p2) } else { (r1, p1) };
            if observed == PRIO_EMPTY {
                continue;
            }

            if let Ok(mut slots) = self.heaps[target].slots.try_lock() {
                if self.heaps[target].prio.load(Ordering::Acquire) == observed {
                    return Some(self.extract_root(target, &mut slots));
                }
                // Summary went stale between the probe and the lock.
            }
        }
        None
    }

    fn extract_root(&self, idx: usize, slots: &mut HeapSlots) -> Arc<Task> {
        let task = slots.tasks[0].take().expect("committed heap must be non-empty");
        slots.ntasks -= 1;
        let n = slots.ntasks;
        slots.tasks[0] = slots.tasks[n].take();

        let mut published = PRIO_EMPTY;
        if n > 0 {
            self.sift_down(slots, 0);
            published = slots.prio_at(0);
        }
        self.heaps[idx].prio.store(published, Ordering::Release);
        task
    }

    fn sift_up(&self, slots: &mut HeapSlots, mut idx: usize) {
        while idx > 0 {
            let parent = (idx - 1) / self.d;
            if slots.prio_at(idx) <= slots.prio_at(parent) {
                slots.swap(idx, parent);
                idx = parent;
            } else {
                break;
            }
        }
    }

    /// First-fit sift-down: swap with the first child whose priority is not
    /// above ours and recurse there. Heap order only needs parent <= child,
    /// and depth is log_d of the capacity, so the extra churn is bounded.
    fn sift_down(&self, slots: &mut HeapSlots, idx: usize) {
        if idx >= slots.ntasks {
            return;
        }
        let first = self.d * idx + 1;
        let last = (self.d * idx + self.d).min(self.capacity - 1);
        for child in first..=last {
            if child >= slots.ntasks {
                break;
            }
            if slots.prio_at(child) <= slots.prio_at(idx) {
                slots.swap(idx, child);
                self.sift_down(slots, child);
            }
        }
    }

    /// Takes every queued task out of every heap. Shutdown path.
    pub fn drain_all(&self) -> Vec<Arc<Task>> {
        let mut drained = Vec::new();
        for heap in self.heaps.iter() {
            let mut slots = heap.slots.lock().unwrap();
            for slot in slots.tasks.iter_mut() {
                if let Some(task) = slot.take() {
                    drained.push(task);
                }
            }
            slots.ntasks = 0;
            heap.prio.store(PRIO_EMPTY, Ordering::Release);
        }
        drained
    }

    pub fn len(&self) -> usize {
        self.heaps
            .iter()
            .map(|h| h.slots.lock().unwrap().ntasks)
            .sum()
    }

    /// Checks heap order and the published-minimum invariant on every heap.
    #[cfg(test)]
    pub fn check_invariants(&self) {
        for heap in self.heaps.iter() {
            let slots = heap.slots.lock().unwrap();
            for i in 0..slots.ntasks {
                assert!(slots.tasks[i].is_some());
                if i > 0 {
                    let parent = (i - 1) / self.d;
                    assert!(slots.prio_at(parent) <= slots.prio_at(i));
                }
            }
            for i in slots.ntasks..self.capacity {
                assert!(slots.tasks[i].is_none());
            }
            let published = heap.prio.load(Ordering::Acquire);
            if slots.ntasks > 0 {
                assert_eq!(published, slots.prio_at(0));
            } else {
                assert_eq!(published, PRIO_EMPTY);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{Task, Value};
    use std::sync::Arc;

    const TEST_STACK: usize = 64 * 1024;

    fn mk_task() -> Arc<Task> {
        Task::new_single(Arc::new(|| Arc::new(()) as Value), TEST_STACK)
    }

    fn mk_rng() -> Cong {
        Cong::new(0xfeed_beef)
    }

    #[test]
    fn insert_then_delete_roundtrip() {
        let q = Multiq::new(4, 8, 129, 1);
        let mut rng = mk_rng();
        let t = mk_task();
        q.insert(&t, 3, &mut rng).unwrap();
        q.check_invariants();
        let got = q.delete_min(&mut rng).expect("task should come back");
        assert!(Arc::ptr_eq(&t, &got));
        assert_eq!(q.len(), 0);
        q.check_invariants();
    }

    #[test]
    fn empty_queue_returns_none() {
        let q = Multiq::new(4, 8, 129, 4);
        let mut rng = mk_rng();
        assert!(q.delete_min(&mut rng).is_none());
    }

    #[test]
    fn no_task_lost_and_roughly_ordered() {
        let q = Multiq::new(8, 8, 129, 8);
        let mut rng = mk_rng();
        let total = 200;
        for i in 0..total {
            let t = mk_task();
            q.insert(&t, (i % 13) as i16, &mut rng).unwrap();
        }
        q.check_invariants();

        let mut count = 0;
        loop {
            // Probing is probabilistic; only a full drain proves emptiness.
            match q.delete_min(&mut rng) {
                Some(_) => count += 1,
                None => {
                    if q.len() == 0 {
                        break;
                    }
                }
            }
        }
        assert_eq!(count, total);
        q.check_invariants();
    }

    #[test]
    fn full_heap_rejects_and_keeps_state() {
        // One heap of capacity 8 makes the target deterministic.
        let q = Multiq::new(1, 8, 8, 1);
        let mut rng = mk_rng();
        for i in 0..8 {
            q.insert(&mk_task(), i, &mut rng).unwrap();
        }
        assert_eq!(q.insert(&mk_task(), 0, &mut rng), Err(QueueFull));
        assert_eq!(q.len(), 8);
        q.check_invariants();
    }

    #[test]
    fn min_first_on_a_single_heap() {
        let q = Multiq::new(1, 8, 129, 1);
        let mut rng = mk_rng();
        for prio in [5i16, 1, 9, 3, 7, 0, 2] {
            q.insert(&mk_task(), prio, &mut rng).unwrap();
        }
        let mut out = Vec::new();
        while let Some(t) = q.delete_min(&mut rng) {
            out.push(t.prio());
        }
        // A single heap is a strict priority queue.
        assert_eq!(out, vec![0, 1, 2, 3, 5, 7, 9]);
    }

    #[test]
    fn drain_all_empties_every_heap() {
        let q = Multiq::new(8, 8, 129, 8);
        let mut rng = mk_rng();
        for i in 0..50 {
            q.insert(&mk_task(), i, &mut rng).unwrap();
        }
        assert_eq!(q.drain_all().len(), 50);
        assert_eq!(q.len(), 0);
        q.check_invariants();
    }
}
