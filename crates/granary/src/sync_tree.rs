//! Synchronization trees for grain fan-out.
//!
//! An arriver is an implicit binary tree of atomic counters: each grain
//! climbs from its leaf toward the root, bumping each counter once; the
//! second arrival at a node keeps climbing, so exactly one grain reaches the
//! root and owns the "last" verdict. A reducer is the matching tree of value
//! slots used to pairwise-combine grain results on the way up.
//!
//! Both kinds are preallocated in pools with an intrusive lock-free free
//! list, because the allocation happens on the task-creation fast path and
//! the release happens inside scheduler code where allocating is forbidden.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicI16, Ordering};

use crate::task::{catch_invoke, CapturedPanic, ReduceFn, Value};

pub(crate) trait PoolItem {
    fn pool_index(&self) -> i16;
    fn next_avail(&self) -> &AtomicI16;
    /// Restore the pristine state before the item re-enters the free list.
    fn clear(&self);
}

/// Fan-in counter tree. `counters` has `grains - 1` nodes; leaf `i` of the
/// implicit tree is `i + grains - 1` and only internal nodes carry counters.
pub(crate) struct Arriver {
    index: i16,
    next_avail: AtomicI16,
    counters: Box<[AtomicI16]>,
}

impl Arriver {
    fn new(index: i16, grains: usize) -> Self {
        Self {
            index,
            next_avail: AtomicI16::new(-1),
            counters: (0..grains.saturating_sub(1))
                .map(|_| AtomicI16::new(0))
                .collect(),
        }
    }

    #[cfg(test)]
    pub fn counters_clear(&self) -> bool {
        self.counters
            .iter()
            .all(|c| c.load(Ordering::Acquire) == 0)
    }
}

impl PoolItem for Arriver {
    fn pool_index(&self) -> i16 {
        self.index
    }

    fn next_avail(&self) -> &AtomicI16 {
        &self.next_avail
    }

    fn clear(&self) {
        for counter in self.counters.iter() {
            counter.store(0, Ordering::Release);
        }
    }
}

/// One slot of a reducer tree. Writes and reads are ordered by the paired
/// arriver's counters: a slot is written before the writer's fetch_add and
/// read only by the thread that observed that fetch_add's result.
struct ValueSlot(UnsafeCell<Option<Value>>);

unsafe impl Sync for ValueSlot {}

impl ValueSlot {
    fn put(&self, value: Value) {
        unsafe { *self.0.get() = Some(value) }
    }

    fn take(&self) -> Option<Value> {
        unsafe { (*self.0.get()).take() }
    }
}

/// Pairwise-combining value tree, `2 * grains - 1` slots (leaves and
/// internal nodes).
pub(crate) struct Reducer {
    index: i16,
    next_avail: AtomicI16,
    slots: Box<[ValueSlot]>,
}

impl Reducer {
    fn new(index: i16, grains: usize) -> Self {
        Self {
            index,
            next_avail: AtomicI16::new(-1),
            slots: (0..2 * grains - 1)
                .map(|_| ValueSlot(UnsafeCell::new(None)))
                .collect(),
        }
    }
}

impl PoolItem for Reducer {
    fn pool_index(&self) -> i16 {
        self.index
    }

    fn next_avail(&self) -> &AtomicI16 {
        &self.next_avail
    }

    fn clear(&self) {
        for slot in self.slots.iter() {
            slot.take();
        }
    }
}

pub(crate) struct SyncTreePool<T: PoolItem> {
    items: Box<[T]>,
    head: AtomicI16,
}

impl<T: PoolItem> SyncTreePool<T> {
    fn new(items: Box<[T]>) -> Self {
        for (i, item) in items.iter().enumerate() {
            let next = if i + 1 == items.len() { -1 } else { (i + 1) as i16 };
            item.next_avail().store(next, Ordering::Relaxed);
        }
        let head = if items.is_empty() { -1 } else { 0 };
        Self {
            items,
            head: AtomicI16::new(head),
        }
    }

    /// Pops the free-list head, or `None` when the pool is exhausted.
    pub fn alloc(&self) -> Option<&T> {
        loop {
            let candidate = self.head.load(Ordering::Acquire);
            if candidate == -1 {
                return None;
            }
            let item = &self.items[candidate as usize];
            let next = item.next_avail().load(Ordering::Acquire);
            if self
                .head
                .compare_exchange(candidate, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Some(item);
            }
        }
    }

    /// Clears the item and pushes it back on the free list.
    pub fn free(&self, item: &T) {
        item.clear();
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            item.next_avail().store(head, Ordering::Relaxed);
            match self.head.compare_exchange_weak(
                head,
                item.pool_index(),
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => return,
                Err(observed) => head = observed,
            }
        }
    }

    pub fn free_index(&self, index: i16) {
        self.free(&self.items[index as usize]);
    }

    pub fn get(&self, index: i16) -> &T {
        &self.items[index as usize]
    }

    #[cfg(test)]
    pub fn free_len(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.head.load(Ordering::Acquire);
        while cursor != -1 {
            count += 1;
            cursor = self.items[cursor as usize]
                .next_avail()
                .load(Ordering::Acquire);
        }
        count
    }
}

pub(crate) fn arriver_pool(count: usize, grains: usize) -> SyncTreePool<Arriver> {
    SyncTreePool::new(
        (0..count)
            .map(|i| Arriver::new(i as i16, grains))
            .collect(),
    )
}

pub(crate) fn reducer_pool(count: usize, grains: usize) -> SyncTreePool<Reducer> {
    SyncTreePool::new(
        (0..count)
            .map(|i| Reducer::new(i as i16, grains))
            .collect(),
    )
}

/// Climbs the arriver tree from grain `grain_num`'s leaf. Returns true iff
/// this grain was the last to arrive at the root.
pub(crate) fn last_arriver(arr: &Arriver, grain_num: usize, grains: usize) -> bool {
    let mut aidx = grain_num + grains - 1;
    while aidx > 0 {
        aidx = (aidx - 1) >> 1;
        let arrived = arr.counters[aidx].fetch_add(1, Ordering::AcqRel);
        if arrived == 0 {
            return false;
        }
    }
    true
}

/// Climbs the arriver tree while pairwise-combining values on the reducer
/// tree. Returns `Some(total)` iff this grain was last; the total is then the
/// reduction over every grain's value.
///
/// Both operands come from the tree: the sibling slot holds the value that
/// the first-arriving side parked there, and `val` is this side's running
/// value (also parked at `ridx` for the symmetric case). A panic inside the
/// user reducer is captured and carried up the tree as the value.
pub(crate) fn reduce(
    arr: &Arriver,
    red: &Reducer,
    rf: &ReduceFn,
    mut val: Value,
    grain_num: usize,
    grains: usize,
) -> Option<Value> {
    let mut aidx = grain_num + grains - 1;
    let mut ridx = aidx;
    red.slots[ridx].put(val.clone());

    while aidx > 0 {
        aidx = (aidx - 1) >> 1;
        let arrived = arr.counters[aidx].fetch_add(1, Ordering::AcqRel);
        if arrived == 0 {
            // First at this node; the sibling side finishes the climb.
            return None;
        }

        let nidx = if ridx & 1 == 1 { ridx + 1 } else { ridx - 1 };
        let sibling = red.slots[nidx]
            .take()
            .expect("second arrival implies the sibling value was parked");
        let current = val;
        val = match catch_invoke(|| rf(sibling, current)) {
            Ok(combined) => combined,
            Err(payload) => CapturedPanic::value(payload),
        };

        ridx = (ridx - 1) >> 1;
        red.slots[ridx].put(val.clone());
    }

    Some(val)
}
