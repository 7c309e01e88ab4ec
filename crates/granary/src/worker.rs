//! Worker threads and the scheduler loop.
//!
//! Each worker repeatedly drains its sticky queue, then samples the
//! multiqueue, then idles (worker 0 services the external event loop if one
//! is configured). Obtaining a task resumes its fiber; the fiber hands
//! control back by finishing or by yielding at one of the suspension points
//! (`task_yield`, `task_sync`, `task_wait`, or a waiting grain parent).

use std::cell::{Cell, UnsafeCell};
use std::ptr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier, Weak};

use crate::rng::Cong;
use crate::runtime::Runtime;
use crate::sync_tree::{last_arriver, reduce};
use crate::task::{catch_invoke, Task, Value};

thread_local! {
    static CURRENT_RUNTIME: Cell<*const Runtime> = const { Cell::new(ptr::null()) };
    static CURRENT_TASK: Cell<*const Task> = const { Cell::new(ptr::null()) };
    static WORKER_TID: Cell<i16> = const { Cell::new(-1) };
    static WORKER_RNG: UnsafeCell<Cong> = const { UnsafeCell::new(Cong::new(0)) };
}

/// Per-worker counters, padded to a cache line each by the runtime.
#[derive(Default)]
pub(crate) struct WorkerStats {
    pub dispatches: AtomicU64,
    pub sticky_dispatches: AtomicU64,
    pub empty_polls: AtomicU64,
}

/// Point-in-time copy of one worker's counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct StatsSnapshot {
    pub dispatches: u64,
    pub sticky_dispatches: u64,
    pub empty_polls: u64,
}

impl WorkerStats {
    pub(crate) fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            dispatches: self.dispatches.load(Ordering::Relaxed),
            sticky_dispatches: self.sticky_dispatches.load(Ordering::Relaxed),
            empty_polls: self.empty_polls.load(Ordering::Relaxed),
        }
    }
}

/// Id of the worker running the current thread, or -1 off the worker pool.
pub fn current_worker_id() -> i16 {
    WORKER_TID.with(|cell| cell.get())
}

pub(crate) fn current_task_ptr() -> *const Task {
    CURRENT_TASK.with(|cell| cell.get())
}

/// Strong reference to the task running on this thread. The raw cell is
/// valid because the dispatching worker holds its own strong reference for
/// the whole resume.
pub(crate) fn current_task_arc() -> Option<Arc<Task>> {
    let ptr = current_task_ptr();
    if ptr.is_null() {
        return None;
    }
    unsafe {
        Arc::increment_strong_count(ptr);
        Some(Arc::from_raw(ptr))
    }
}

fn current_runtime<'a>() -> &'a Runtime {
    let ptr = CURRENT_RUNTIME.with(|cell| cell.get());
    debug_assert!(!ptr.is_null(), "scheduler code off a worker thread");
    unsafe { &*ptr }
}

/// Runs `f` with this thread's congruential RNG, seeding it first if the
/// thread never went through worker bootstrap.
pub(crate) fn with_rng<R>(f: impl FnOnce(&mut Cong) -> R) -> R {
    WORKER_RNG.with(|cell| {
        let rng = unsafe { &mut *cell.get() };
        if rng.is_unseeded() {
            rng.reseed();
        }
        f(rng)
    })
}

/// Suspends the current fiber; control returns to the worker loop.
pub(crate) fn fiber_yield() {
    generator::yield_with(());
}

/// Worker thread entry: bind thread-locals, seed the RNG, rendezvous with
/// the runtime constructor, then run the scheduler loop until shutdown.
pub(crate) fn thread_main(rt: Arc<Runtime>, tid: i16, barrier: Arc<Barrier>) {
    CURRENT_RUNTIME.with(|cell| cell.set(Arc::as_ptr(&rt)));
    WORKER_TID.with(|cell| cell.set(tid));
    with_rng(|rng| rng.reseed());
    tracing::debug!(tid, "worker online");
    barrier.wait();

    run_next(&rt, tid);

    tracing::debug!(tid, "worker exiting");
    CURRENT_RUNTIME.with(|cell| cell.set(ptr::null()));
    WORKER_TID.with(|cell| cell.set(-1));
}

/// The scheduler loop. Returns only when the runtime shuts down and the
/// worker is idle.
fn run_next(rt: &Runtime, tid: i16) {
    let mut spins: u32 = 0;
    loop {
        let mut from_sticky = true;
        let mut task = rt.sticky_queue(tid).pop();

        if task.is_none() {
            from_sticky = false;
            task = with_rng(|rng| rt.multiq().delete_min(rng));
            if let Some(t) = task.as_ref() {
                // A sticky task only reaches the multiqueue on its first
                // enqueue; pin it to this worker now.
                if t.is_sticky() && t.sticky_tid() == -1 {
                    t.pin_sticky(tid);
                }
            }
        }

        match task {
            Some(task) => {
                spins = 0;
                let stats = rt.stats(tid);
                stats.dispatches.fetch_add(1, Ordering::Relaxed);
                if from_sticky {
                    stats.sticky_dispatches.fetch_add(1, Ordering::Relaxed);
                }
                resume_task(tid, task);
            }
            None => {
                if rt.is_shutdown() {
                    return;
                }
                rt.stats(tid).empty_polls.fetch_add(1, Ordering::Relaxed);
                if tid == 0 {
                    if let Some(event_loop) = rt.event_loop() {
                        event_loop.run_once();
                        continue;
                    }
                }
                // TODO: park idle workers on a condvar instead of spinning
                spins = spins.wrapping_add(1);
                if spins % 64 == 0 {
                    std::thread::yield_now();
                } else {
                    std::hint::spin_loop();
                }
            }
        }
    }
}

fn resume_task(tid: i16, task: Arc<Task>) {
    // The task may still be mid-suspension on the worker that last ran it:
    // it becomes visible in a queue before its fiber finishes yielding.
    // Wait for that worker to publish the handshake.
    while task.current_tid() != -1 {
        std::hint::spin_loop();
    }

    task.set_current_tid(tid);
    CURRENT_TASK.with(|cell| cell.set(Arc::as_ptr(&task)));
    let finished = unsafe { task.resume_fiber() };
    CURRENT_TASK.with(|cell| cell.set(ptr::null()));
    task.set_current_tid(-1);

    if finished {
        tracing::trace!(tid, "task finished");
        unsafe { task.drop_fiber() };
    }
}

/// Fiber trampoline: every task starts and ends here, on its own stack.
pub(crate) fn task_wrapper(task_addr: usize) {
    // The worker that resumed us holds a strong reference to the task for
    // the whole dispatch, so the address stays valid across yields.
    let task = unsafe { &*(task_addr as *const Task) };
    let rt = current_runtime();
    task.mark_started();

    let mut failed = false;
    match catch_invoke(|| task.invoke_body()) {
        Ok(v) => task.set_result(v),
        Err(payload) => {
            task.store_exception(payload);
            failed = true;
        }
    }

    // Grain tasks synchronize (and possibly reduce) before going terminal,
    // so a syncing task never sees Done ahead of the reduction result.
    if task.is_grain() {
        sync_grains(rt, task);
    }

    task.finish(failed);

    if !task.is_detached() {
        for waiter in task.cq_drain() {
            rt.enqueue_task(waiter);
        }
    }

    if let Some(joiner) = task.joiner() {
        joiner.notify();
    }
}

/// Fan-in (and reduction) for a finishing grain. The last arriver wakes the
/// parent if the parent was not last, and returns both trees to their pools;
/// a parent that was not last yields here and resumes once woken.
fn sync_grains(rt: &Runtime, task: &Task) {
    let meta = task.grain().expect("sync_grains on a non-grain task");
    let grains = rt.grains();
    let arr = rt.arrivers().get(meta.arriver);

    let mut was_last = false;
    if let (Some(red_idx), Some(rf)) = (meta.reducer, meta.reduce.as_ref()) {
        let red = rt.reducers().get(red_idx);
        let val = task
            .result_clone()
            .unwrap_or_else(|| Arc::new(()) as Value);
        if let Some(total) = reduce(arr, red, rf, val, meta.grain_num, grains) {
            task.set_result(total.clone());
            if meta.grain_num == 0 {
                task.set_red_result(total);
            } else if let Some(parent) = meta.parent.as_ref().and_then(Weak::upgrade) {
                parent.set_red_result(total);
            }
            was_last = true;
        }
    } else if last_arriver(arr, meta.grain_num, grains) {
        was_last = true;
    }

    if was_last {
        if meta.grain_num > 0 {
            if let Some(parent) = meta.parent.as_ref().and_then(Weak::upgrade) {
                // Highest priority so the waiting parent resumes promptly.
                rt.insert_retrying(&parent, 0);
            }
        } else if meta.reduce.is_none() {
            // Barrier-only parent: syncing on the fan-out yields nothing.
            task.clear_result();
        }
        if let Some(red_idx) = meta.reducer {
            rt.reducers().free_index(red_idx);
        }
        rt.arrivers().free_index(meta.arriver);
    } else if meta.grain_num == 0 {
        // Parent waits for the last arriver's wake, then adopts the
        // reduction result as its own.
        rt.task_yield(false);
        match task.red_result_clone() {
            Some(total) => task.set_result(total),
            None => task.clear_result(),
        }
    }
}
