//! The runtime handle: owns the multiqueue, the sync-tree pools, the sticky
//! queues, and the worker threads, and exposes the task and condition APIs.

use std::io;
use std::panic;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread::{self, JoinHandle};

use crossbeam_utils::CachePadded;

use crate::condition::Condition;
use crate::config::{Config, EventLoop};
use crate::error::SpawnError;
use crate::multiq::Multiq;
use crate::sync_tree::{arriver_pool, reducer_pool, Arriver, PoolItem, Reducer, SyncTreePool};
use crate::task::{
    GrainFn, GrainMeta, Joiner, ReduceFn, SingleFn, Task, TaskQueue, TaskState, Value,
    TASK_IS_DETACHED, TASK_IS_STICKY,
};
use crate::worker::{self, StatsSnapshot, WorkerStats};

pub struct Runtime {
    config: Config,
    multiq: Multiq,
    arrivers: SyncTreePool<Arriver>,
    reducers: SyncTreePool<Reducer>,
    sticky: Box<[TaskQueue]>,
    stats: Box<[CachePadded<WorkerStats>]>,
    shutdown: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Runtime {
    /// Allocates the scheduling infrastructure and starts `config.workers`
    /// worker threads. Returns once every worker is online.
    pub fn new(config: Config) -> io::Result<Arc<Runtime>> {
        config.validate()?;
        let grains = config.grains();
        let workers = config.workers;

        let rt = Arc::new(Runtime {
            multiq: Multiq::new(
                config.heap_count(),
                config.heap_d,
                config.tasks_per_heap,
                workers,
            ),
            arrivers: arriver_pool(config.num_arrivers(), grains),
            reducers: reducer_pool(config.num_reducers(), grains),
            sticky: (0..workers).map(|_| TaskQueue::new()).collect(),
            stats: (0..workers)
                .map(|_| CachePadded::new(WorkerStats::default()))
                .collect(),
            shutdown: AtomicBool::new(false),
            workers: Mutex::new(Vec::new()),
            config,
        });

        let barrier = Arc::new(Barrier::new(workers + 1));
        let mut handles = Vec::with_capacity(workers);
        for tid in 0..workers {
            let rt = rt.clone();
            let barrier = barrier.clone();
            handles.push(
                thread::Builder::new()
                    .name(format!("granary-worker-{tid}"))
                    .spawn(move || worker::thread_main(rt, tid as i16, barrier))?,
            );
        }
        *rt.workers.lock().unwrap() = handles;
        barrier.wait();
        tracing::debug!(workers, "runtime started");
        Ok(rt)
    }

    /// Stops the workers once they go idle and releases everything still
    /// queued. Idempotent. Must not be called from a task.
    pub fn shutdown(&self) {
        debug_assert!(
            worker::current_task_ptr().is_null(),
            "shutdown called from inside a task"
        );
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        let handles = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in handles {
            let _ = handle.join();
        }
        drop(self.multiq.drain_all());
        for queue in self.sticky.iter() {
            while queue.pop().is_some() {}
        }
        tracing::debug!("runtime stopped");
    }

    /// Creates a task for `f`. The task can then be spawned.
    pub fn task_new(&self, f: impl Fn() -> Value + Send + Sync + 'static) -> Arc<Task> {
        Task::new_single(Arc::new(f), self.config.stack_size)
    }

    /// Creates a `grain_k * workers` fan-out over `[0, count)`. Each grain
    /// invokes `f(start, end)` with the ranges partitioning `count`; with a
    /// reducer, the per-grain returns are pairwise combined and the total is
    /// read by syncing on the returned parent. Returns `None` when a sync
    /// tree pool is exhausted; nothing is leaked in that case.
    pub fn task_new_multi(
        &self,
        f: impl Fn(i64, i64) -> Value + Send + Sync + 'static,
        count: i64,
        reduce: Option<ReduceFn>,
    ) -> Option<Arc<Task>> {
        debug_assert!(count >= 0);
        let grains = self.grains();

        let arr = self.arrivers.alloc()?;
        let arr_idx = arr.pool_index();
        let (red_idx, rf) = match reduce {
            Some(rf) => match self.reducers.alloc() {
                Some(red) => (Some(red.pool_index()), Some(rf)),
                None => {
                    self.arrivers.free(arr);
                    return None;
                }
            },
            None => (None, None),
        };

        let body: GrainFn = Arc::new(f);
        let quot = count / grains as i64;
        let rem = count % grains as i64;

        let mut start = 0i64;
        let mut parent: Option<Arc<Task>> = None;
        let mut chain = Vec::with_capacity(grains - 1);
        for i in 0..grains {
            let end = start + quot + if (i as i64) < rem { 1 } else { 0 };
            let meta = GrainMeta {
                grain_num: i,
                start,
                end,
                parent: parent.as_ref().map(Arc::downgrade),
                arriver: arr_idx,
                reducer: red_idx,
                reduce: rf.clone(),
            };
            let task = Task::new_grain(body.clone(), meta, self.config.stack_size);
            match &parent {
                None => parent = Some(task),
                Some(_) => chain.push(task),
            }
            start = end;
        }

        let parent = parent.expect("grains >= 1");
        parent.set_grain_chain(chain);
        Some(parent)
    }

    /// Enqueues `task` at this worker's id as its priority. A sticky task
    /// runs only on the worker that first picks it up; a detached task
    /// cannot be synced. Yields unless the calling task is itself sticky.
    pub fn task_spawn(
        &self,
        task: &Arc<Task>,
        sticky: bool,
        detach: bool,
    ) -> Result<(), SpawnError> {
        if !task.started() {
            if sticky {
                task.set_setting(TASK_IS_STICKY);
            }
            if detach {
                task.set_setting(TASK_IS_DETACHED);
            }
        }

        task.mark_spawned();
        let inserted = worker::with_rng(|rng| self.multiq.insert(task, Self::spawn_prio(), rng));
        if inserted.is_err() {
            task.clear_spawned();
            return Err(SpawnError::QueueFull);
        }

        self.yield_after_spawn();
        Ok(())
    }

    /// Enqueues every grain of a fan-out previously created with
    /// `task_new_multi`. Yields unless the calling task is sticky.
    pub fn task_spawn_multi(&self, parent: &Arc<Task>) -> Result<(), SpawnError> {
        let grains = self.grains();
        let chain = parent.take_grain_chain();
        if chain.len() != grains - 1 {
            parent.set_grain_chain(chain);
            return Err(SpawnError::MissingSibling);
        }

        let prio = Self::spawn_prio();
        parent.mark_spawned();
        if worker::with_rng(|rng| self.multiq.insert(parent, prio, rng)).is_err() {
            parent.clear_spawned();
            parent.set_grain_chain(chain);
            return Err(SpawnError::QueueFull);
        }
        for task in &chain {
            task.mark_spawned();
            if worker::with_rng(|rng| self.multiq.insert(task, prio, rng)).is_err() {
                return Err(SpawnError::QueueFull);
            }
        }

        self.yield_after_spawn();
        Ok(())
    }

    /// Waits for `task` and returns its value: the reduction result for a
    /// reduced fan-out parent, the plain result otherwise, `None` for a
    /// failed task. Returns `None` immediately for detached or never-spawned
    /// tasks. From a task context this parks on the target's completion
    /// queue; from an external thread it polls.
    pub fn task_sync(&self, task: &Arc<Task>) -> Option<Value> {
        if task.is_detached() || !task.was_spawned() {
            return None;
        }

        if !task.is_terminal() {
            match worker::current_task_arc() {
                Some(cur) => {
                    if task.cq_push_if_running(cur) {
                        self.task_yield(false);
                    }
                }
                None => {
                    while !task.is_terminal() {
                        thread::yield_now();
                    }
                }
            }
        }

        let reduced = task.grain().map(|g| g.reduce.is_some()).unwrap_or(false);
        if reduced {
            task.red_result_clone()
        } else {
            task.result_clone()
        }
    }

    /// Yields the current fiber. With `requeue` the task re-enters its queue
    /// (sticky or multiqueue); without, something else must re-enqueue it
    /// (a completion queue, a condition, or a grain wake). No-op off a task.
    pub fn task_yield(&self, requeue: bool) {
        if worker::current_task_ptr().is_null() {
            return;
        }
        if requeue {
            if let Some(cur) = worker::current_task_arc() {
                self.enqueue_task(cur);
            }
        }
        worker::fiber_yield();
        if worker::current_worker_id() == 0 {
            if let Some(event_loop) = self.event_loop() {
                event_loop.process_events();
            }
        }
    }

    pub fn condition_new(&self) -> Arc<Condition> {
        Arc::new(Condition::new())
    }

    /// Deschedules the current task until `c` is notified; returns
    /// immediately once `c` has ever been notified.
    pub fn task_wait(&self, c: &Condition) {
        if c.notified() {
            return;
        }
        match worker::current_task_arc() {
            Some(cur) => {
                if c.push_waiter_if_unnotified(cur) {
                    self.task_yield(false);
                }
            }
            None => {
                while !c.notified() {
                    thread::yield_now();
                }
            }
        }
    }

    /// Latches `c` and makes every waiter schedulable, in wait order.
    pub fn task_notify(&self, c: &Condition) {
        for waiter in c.notify_and_drain() {
            self.enqueue_task(waiter);
        }
    }

    /// Runs `f` as a task and blocks the calling (non-worker) thread until
    /// it completes. A panic inside `f` resumes on this thread.
    pub fn block_on(&self, f: impl FnOnce() -> Value + Send + 'static) -> Value {
        debug_assert!(
            worker::current_task_ptr().is_null(),
            "block_on called from inside a task"
        );
        let joiner = Arc::new(Joiner::new());
        let slot = Mutex::new(Some(f));
        let body: SingleFn = Arc::new(move || {
            let f = slot
                .lock()
                .unwrap()
                .take()
                .expect("block_on body runs once");
            f()
        });
        let task = Task::new_single_with_joiner(body, self.config.stack_size, joiner.clone());
        task.mark_spawned();
        self.insert_retrying(&task, 0);
        joiner.wait();

        if task.state() == TaskState::Failed {
            if let Some(payload) = task.take_exception() {
                panic::resume_unwind(payload);
            }
        }
        task.result_clone().unwrap_or_else(|| Arc::new(()) as Value)
    }

    /// Re-enqueues a runnable task: sticky tasks go to their pinned worker's
    /// queue, everything else back into the multiqueue at its priority.
    pub(crate) fn enqueue_task(&self, task: Arc<Task>) {
        if task.is_sticky() {
            let tid = task.sticky_tid();
            assert!(tid >= 0, "sticky task re-enqueued before first dispatch");
            self.sticky[tid as usize].push(task);
        } else {
            let prio = task.prio();
            self.insert_retrying(&task, prio);
        }
    }

    /// Inserts until a heap accepts the task. Losing a task here would break
    /// the completion protocol, so full heaps are retried, not reported.
    pub(crate) fn insert_retrying(&self, task: &Arc<Task>, prio: i16) {
        worker::with_rng(|rng| {
            while self.multiq.insert(task, prio, rng).is_err() {
                std::hint::spin_loop();
            }
        });
    }

    fn yield_after_spawn(&self) {
        let cur = worker::current_task_ptr();
        if cur.is_null() {
            return;
        }
        // Sticky tasks stay put on their pinned worker.
        if !unsafe { &*cur }.is_sticky() {
            self.task_yield(true);
        }
    }

    fn spawn_prio() -> i16 {
        // The spawning worker's id, coarsely keeping children near their
        // parent; external threads spawn at the highest priority band.
        worker::current_worker_id().max(0)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Grain fan-out width `G`.
    pub fn grains(&self) -> usize {
        self.config.grains()
    }

    pub fn worker_stats(&self, tid: usize) -> StatsSnapshot {
        self.stats[tid].snapshot()
    }

    /// Total dispatches across all workers.
    pub fn tasks_dispatched(&self) -> u64 {
        self.stats.iter().map(|s| s.snapshot().dispatches).sum()
    }

    pub(crate) fn multiq(&self) -> &Multiq {
        &self.multiq
    }

    pub(crate) fn arrivers(&self) -> &SyncTreePool<Arriver> {
        &self.arrivers
    }

    pub(crate) fn reducers(&self) -> &SyncTreePool<Reducer> {
        &self.reducers
    }

    pub(crate) fn sticky_queue(&self, tid: i16) -> &TaskQueue {
        &self.sticky[tid as usize]
    }

    pub(crate) fn stats(&self, tid: i16) -> &WorkerStats {
        &self.stats[tid as usize]
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    pub(crate) fn event_loop(&self) -> Option<&Arc<dyn EventLoop>> {
        self.config.event_loop.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::value;

    fn small_config(workers: usize) -> Config {
        Config::default()
            .with_workers(workers)
            .with_stack_size(128 * 1024)
    }

    #[test]
    fn grain_ranges_partition_count() {
        let rt = Runtime::new(small_config(2)).unwrap();
        // G = 8; 21 = 2*8 + 5, so the first five grains get 3 elements.
        let parent = rt
            .task_new_multi(|_s, _e| value(()), 21, None)
            .expect("pool has capacity");

        let mut ranges = vec![{
            let meta = parent.grain().unwrap();
            (meta.start, meta.end)
        }];
        for task in parent.take_grain_chain() {
            let meta = task.grain().unwrap();
            ranges.push((meta.start, meta.end));
        }

        assert_eq!(ranges.len(), 8);
        assert_eq!(ranges[0], (0, 3));
        let mut cursor = 0;
        for (i, (s, e)) in ranges.iter().copied().enumerate() {
            assert_eq!(s, cursor, "grain {i} starts where the previous ended");
            assert!(e - s == 2 || e - s == 3);
            cursor = e;
        }
        assert_eq!(cursor, 21);
        rt.shutdown();
    }

    #[test]
    fn empty_ranges_when_count_is_small() {
        let rt = Runtime::new(small_config(2)).unwrap();
        let parent = rt.task_new_multi(|_s, _e| value(()), 3, None).unwrap();
        let chain = parent.take_grain_chain();
        let empty = chain
            .iter()
            .filter(|t| {
                let meta = t.grain().unwrap();
                meta.start == meta.end
            })
            .count();
        // 8 grains, 3 elements: five grains get an empty range.
        assert_eq!(empty, 5);
        rt.shutdown();
    }

    #[test]
    fn pool_exhaustion_returns_none_without_leaking() {
        let config = Config::default()
            .with_workers(1)
            .with_grain_k(1)
            .with_stack_size(128 * 1024);
        // G = 1, so the arriver pool holds 1^2 + 1 = 2 trees.
        let rt = Runtime::new(config).unwrap();
        let a = rt.task_new_multi(|_s, _e| value(()), 1, None).unwrap();
        let b = rt.task_new_multi(|_s, _e| value(()), 1, None).unwrap();
        assert!(rt.task_new_multi(|_s, _e| value(()), 1, None).is_none());
        drop((a, b));
        rt.shutdown();
    }

    #[test]
    fn missing_sibling_reported_and_chain_restored() {
        let rt = Runtime::new(small_config(2)).unwrap();
        let parent = rt.task_new_multi(|_s, _e| value(()), 8, None).unwrap();
        let chain = parent.take_grain_chain();
        assert_eq!(
            rt.task_spawn_multi(&parent),
            Err(SpawnError::MissingSibling)
        );
        parent.set_grain_chain(chain);
        rt.shutdown();
    }
}
