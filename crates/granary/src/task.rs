//! Task objects and their fibers.
//!
//! A task owns a stackful fiber (a `generator` coroutine with its own
//! guard-paged stack), the body closure to run on it, result and exception
//! channels, a completion queue of tasks blocked syncing on it, and optional
//! grain metadata tying it to a `task_new_multi` fan-out.

use std::any::Any;
use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI16, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};

use generator::Gn;

/// The opaque value user work produces and consumes. Shared so that every
/// task syncing on the same target can observe the result.
pub type Value = Arc<dyn Any + Send + Sync>;

/// A captured user panic payload.
pub type Exception = Box<dyn Any + Send>;

/// Convenience wrapper for returning a concrete value from a task body.
pub fn value<T: Any + Send + Sync>(v: T) -> Value {
    Arc::new(v)
}

pub(crate) type SingleFn = Arc<dyn Fn() -> Value + Send + Sync>;
pub(crate) type GrainFn = Arc<dyn Fn(i64, i64) -> Value + Send + Sync>;

/// Binary reduction over grain results.
pub type ReduceFn = Arc<dyn Fn(Value, Value) -> Value + Send + Sync>;

pub(crate) enum TaskBody {
    Single(SingleFn),
    Grain(GrainFn),
}

const STATE_RUNNABLE: u8 = 0;
const STATE_DONE: u8 = 1;
const STATE_FAILED: u8 = 2;

/// Task lifecycle state. Terminal states are sticky.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Runnable,
    Done,
    Failed,
}

pub(crate) const TASK_IS_STICKY: u8 = 1 << 0;
pub(crate) const TASK_IS_DETACHED: u8 = 1 << 1;

/// Metadata tying a task to its grain fan-out.
pub(crate) struct GrainMeta {
    pub grain_num: usize,
    pub start: i64,
    pub end: i64,
    /// `None` for grain 0, which is its own parent.
    pub parent: Option<Weak<Task>>,
    /// Pool index of the shared arriver tree.
    pub arriver: i16,
    /// Pool index of the shared reducer tree, when reducing.
    pub reducer: Option<i16>,
    pub reduce: Option<ReduceFn>,
}

pub struct Task {
    /// First field: the fiber (and any cancellation unwind it triggers)
    /// drops before the rest of the task state.
    fiber: UnsafeCell<Option<Fiber>>,
    body: TaskBody,
    state: AtomicU8,
    started: AtomicBool,
    spawned: AtomicBool,
    settings: AtomicU8,
    prio: AtomicI16,
    /// Worker currently executing the task, else -1. Doubles as the
    /// suspension handshake: a worker publishes -1 only once the fiber has
    /// fully yielded, and a resuming worker waits for that.
    current_tid: AtomicI16,
    sticky_tid: AtomicI16,
    result: UnsafeCell<Option<Value>>,
    red_result: UnsafeCell<Option<Value>>,
    exception: Mutex<Option<Exception>>,
    /// Tasks suspended in `task_sync` on this task; drained exactly once at
    /// termination unless the task is detached.
    cq: TaskQueue,
    grain: Option<GrainMeta>,
    /// Sibling grains not yet spawned. Populated on the parent by
    /// `task_new_multi`, drained by `task_spawn_multi`.
    grain_chain: Mutex<Vec<Arc<Task>>>,
    joiner: Option<Arc<Joiner>>,
}

// The UnsafeCell fields follow the scheduler protocol: `fiber`, `result` and
// `red_result` are touched only by the worker currently running the task
// (serialized by the current_tid handshake) or after a happens-before edge
// from the terminal-state publication / a queue lock.
unsafe impl Send for Task {}
unsafe impl Sync for Task {}

impl Task {
    fn build(
        body: TaskBody,
        grain: Option<GrainMeta>,
        joiner: Option<Arc<Joiner>>,
        stack_size: usize,
    ) -> Arc<Task> {
        let task = Arc::new(Task {
            fiber: UnsafeCell::new(None),
            body,
            state: AtomicU8::new(STATE_RUNNABLE),
            started: AtomicBool::new(false),
            spawned: AtomicBool::new(false),
            settings: AtomicU8::new(0),
            prio: AtomicI16::new(0),
            current_tid: AtomicI16::new(-1),
            sticky_tid: AtomicI16::new(-1),
            result: UnsafeCell::new(None),
            red_result: UnsafeCell::new(None),
            exception: Mutex::new(None),
            cq: TaskQueue::new(),
            grain,
            grain_chain: Mutex::new(Vec::new()),
            joiner,
        });
        // The fiber trampoline needs the task's address; nothing else can
        // observe the task yet, so the plain store is fine.
        let addr = Arc::as_ptr(&task) as usize;
        unsafe { *task.fiber.get() = Some(Fiber::new(stack_size, addr)) };
        task
    }

    pub(crate) fn new_single(f: SingleFn, stack_size: usize) -> Arc<Task> {
        Self::build(TaskBody::Single(f), None, None, stack_size)
    }

    pub(crate) fn new_single_with_joiner(
        f: SingleFn,
        stack_size: usize,
        joiner: Arc<Joiner>,
    ) -> Arc<Task> {
        Self::build(TaskBody::Single(f), None, Some(joiner), stack_size)
    }

    pub(crate) fn new_grain(f: GrainFn, meta: GrainMeta, stack_size: usize) -> Arc<Task> {
        Self::build(TaskBody::Grain(f), Some(meta), None, stack_size)
    }

    pub(crate) fn invoke_body(&self) -> Value {
        match &self.body {
            TaskBody::Single(f) => f(),
            TaskBody::Grain(f) => {
                let meta = self.grain.as_ref().expect("grain body without metadata");
                f(meta.start, meta.end)
            }
        }
    }

    pub fn state(&self) -> TaskState {
        match self.state.load(Ordering::Acquire) {
            STATE_RUNNABLE => TaskState::Runnable,
            STATE_DONE => TaskState::Done,
            _ => TaskState::Failed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.load(Ordering::Acquire) != STATE_RUNNABLE
    }

    /// Publishes the terminal state. Result and reduction writes must happen
    /// before this.
    pub(crate) fn finish(&self, failed: bool) {
        let next = if failed { STATE_FAILED } else { STATE_DONE };
        self.state.store(next, Ordering::Release);
    }

    pub(crate) fn mark_started(&self) {
        self.started.store(true, Ordering::Release);
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub(crate) fn mark_spawned(&self) {
        self.spawned.store(true, Ordering::Release);
    }

    pub(crate) fn clear_spawned(&self) {
        self.spawned.store(false, Ordering::Release);
    }

    pub fn was_spawned(&self) -> bool {
        self.spawned.load(Ordering::Acquire)
    }

    pub(crate) fn set_setting(&self, bit: u8) {
        self.settings.fetch_or(bit, Ordering::AcqRel);
    }

    pub fn is_sticky(&self) -> bool {
        self.settings.load(Ordering::Acquire) & TASK_IS_STICKY != 0
    }

    pub fn is_detached(&self) -> bool {
        self.settings.load(Ordering::Acquire) & TASK_IS_DETACHED != 0
    }

    pub(crate) fn prio(&self) -> i16 {
        self.prio.load(Ordering::Relaxed)
    }

    pub(crate) fn set_prio(&self, prio: i16) {
        self.prio.store(prio, Ordering::Relaxed);
    }

    pub(crate) fn current_tid(&self) -> i16 {
        self.current_tid.load(Ordering::Acquire)
    }

    pub(crate) fn set_current_tid(&self, tid: i16) {
        self.current_tid.store(tid, Ordering::Release);
    }

    /// Worker the task is pinned to, or -1 before its first dispatch.
    pub fn sticky_tid(&self) -> i16 {
        self.sticky_tid.load(Ordering::Acquire)
    }

    pub(crate) fn pin_sticky(&self, tid: i16) {
        self.sticky_tid.store(tid, Ordering::Release);
    }

    pub(crate) fn set_result(&self, v: Value) {
        unsafe { *self.result.get() = Some(v) }
    }

    pub(crate) fn clear_result(&self) {
        unsafe { *self.result.get() = None }
    }

    pub(crate) fn result_clone(&self) -> Option<Value> {
        unsafe { (*self.result.get()).clone() }
    }

    pub(crate) fn set_red_result(&self, v: Value) {
        unsafe { *self.red_result.get() = Some(v) }
    }

    pub(crate) fn red_result_clone(&self) -> Option<Value> {
        unsafe { (*self.red_result.get()).clone() }
    }

    pub(crate) fn store_exception(&self, e: Exception) {
        *self.exception.lock().unwrap() = Some(e);
    }

    /// Removes and returns the captured panic of a failed task.
    pub fn take_exception(&self) -> Option<Exception> {
        self.exception.lock().unwrap().take()
    }

    /// Appends `waiter` to the completion queue unless the task went terminal
    /// first; the double check runs under the queue lock.
    pub(crate) fn cq_push_if_running(&self, waiter: Arc<Task>) -> bool {
        self.cq.push_if(waiter, || !self.is_terminal())
    }

    pub(crate) fn cq_drain(&self) -> Vec<Arc<Task>> {
        self.cq.drain_with(|| {})
    }

    pub(crate) fn grain(&self) -> Option<&GrainMeta> {
        self.grain.as_ref()
    }

    pub fn is_grain(&self) -> bool {
        self.grain.is_some()
    }

    pub(crate) fn set_grain_chain(&self, chain: Vec<Arc<Task>>) {
        *self.grain_chain.lock().unwrap() = chain;
    }

    pub(crate) fn take_grain_chain(&self) -> Vec<Arc<Task>> {
        std::mem::take(&mut *self.grain_chain.lock().unwrap())
    }

    pub(crate) fn joiner(&self) -> Option<&Arc<Joiner>> {
        self.joiner.as_ref()
    }

    /// Resumes the fiber; returns true once the trampoline has returned.
    /// Caller must hold the execution right (current_tid handshake).
    pub(crate) unsafe fn resume_fiber(&self) -> bool {
        match unsafe { &mut *self.fiber.get() } {
            Some(fiber) => fiber.resume(),
            None => true,
        }
    }

    /// Frees the finished fiber and its stack.
    pub(crate) unsafe fn drop_fiber(&self) {
        unsafe { (*self.fiber.get()).take() };
    }
}

/// A stackful coroutine bound to one task. The generator allocates the stack
/// (with a guard page at its low end) and enters the trampoline on first
/// resume.
struct Fiber(generator::Generator<'static, (), ()>);

// The fiber migrates between workers; only one worker resumes it at a time.
unsafe impl Send for Fiber {}

impl Fiber {
    fn new(stack_size: usize, task_addr: usize) -> Self {
        Fiber(Gn::<()>::new_opt(stack_size, move || {
            crate::worker::task_wrapper(task_addr);
        }))
    }

    /// Runs the fiber until its next yield; true when the trampoline
    /// returned and the fiber is finished.
    fn resume(&mut self) -> bool {
        self.0.resume();
        self.0.is_done()
    }
}

/// Runs `f`, converting a user panic into an `Err`. Fiber-cancellation
/// panics (`generator::Error`) are not user failures and keep unwinding.
pub(crate) fn catch_invoke<R>(f: impl FnOnce() -> R) -> Result<R, Exception> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(v) => Ok(v),
        Err(payload) => {
            if payload.downcast_ref::<generator::Error>().is_some() {
                panic::resume_unwind(payload);
            }
            Err(payload)
        }
    }
}

/// A panic captured while reducing grain results, carried through the
/// reduction tree as an ordinary value.
pub struct CapturedPanic(Mutex<Option<Exception>>);

impl CapturedPanic {
    pub(crate) fn value(payload: Exception) -> Value {
        Arc::new(CapturedPanic(Mutex::new(Some(payload))))
    }

    pub fn take(&self) -> Option<Exception> {
        self.0.lock().unwrap().take()
    }
}

/// Locked FIFO of tasks: sticky queues, completion queues, and condition
/// wait queues.
pub(crate) struct TaskQueue {
    inner: Mutex<VecDeque<Arc<Task>>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(VecDeque::new()),
        }
    }

    pub fn push(&self, task: Arc<Task>) {
        self.inner.lock().unwrap().push_back(task);
    }

    /// Appends `task` if `guard` still holds under the queue lock.
    pub fn push_if(&self, task: Arc<Task>, guard: impl FnOnce() -> bool) -> bool {
        let mut queue = self.inner.lock().unwrap();
        if !guard() {
            return false;
        }
        queue.push_back(task);
        true
    }

    pub fn pop(&self) -> Option<Arc<Task>> {
        self.inner.lock().unwrap().pop_front()
    }

    /// Detaches the whole queue in FIFO order, running `f` under the lock.
    pub fn drain_with(&self, f: impl FnOnce()) -> Vec<Arc<Task>> {
        let mut queue = self.inner.lock().unwrap();
        f();
        queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }
}

/// Blocks an external thread on a task's completion (`block_on`).
pub(crate) struct Joiner {
    done: Mutex<bool>,
    cv: Condvar,
}

impl Joiner {
    pub fn new() -> Self {
        Self {
            done: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub fn notify(&self) {
        *self.done.lock().unwrap() = true;
        self.cv.notify_all();
    }

    pub fn wait(&self) {
        let mut done = self.done.lock().unwrap();
        while !*done {
            done = self.cv.wait(done).unwrap();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_STACK: usize = 64 * 1024;

    fn mk_task() -> Arc<Task> {
        Task::new_single(Arc::new(|| value(())), TEST_STACK)
    }

    #[test]
    fn queue_is_fifo() {
        let q = TaskQueue::new();
        let a = mk_task();
        let b = mk_task();
        let c = mk_task();
        q.push(a.clone());
        q.push(b.clone());
        q.push(c.clone());
        assert!(Arc::ptr_eq(&q.pop().unwrap(), &a));
        assert!(Arc::ptr_eq(&q.pop().unwrap(), &b));
        assert!(Arc::ptr_eq(&q.pop().unwrap(), &c));
        assert!(q.pop().is_none());
    }

    #[test]
    fn drain_preserves_order_and_empties() {
        let q = TaskQueue::new();
        let a = mk_task();
        let b = mk_task();
        q.push(a.clone());
        q.push(b.clone());
        let drained = q.drain_with(|| {});
        assert_eq!(drained.len(), 2);
        assert!(Arc::ptr_eq(&drained[0], &a));
        assert!(Arc::ptr_eq(&drained[1], &b));
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn push_if_respects_the_guard() {
        let q = TaskQueue::new();
        assert!(!q.push_if(mk_task(), || false));
        assert_eq!(q.len(), 0);
        assert!(q.push_if(mk_task(), || true));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn settings_bits_accumulate() {
        let t = mk_task();
        assert!(!t.is_sticky());
        assert!(!t.is_detached());
        t.set_setting(TASK_IS_STICKY);
        assert!(t.is_sticky());
        t.set_setting(TASK_IS_DETACHED);
        assert!(t.is_sticky() && t.is_detached());
    }

    #[test]
    fn state_machine() {
        let t = mk_task();
        assert_eq!(t.state(), TaskState::Runnable);
        assert!(!t.is_terminal());
        t.finish(false);
        assert_eq!(t.state(), TaskState::Done);
        assert!(t.is_terminal());

        let t = mk_task();
        t.finish(true);
        assert_eq!(t.state(), TaskState::Failed);
    }

    #[test]
    fn cq_push_refused_after_terminal() {
        let t = mk_task();
        assert!(t.cq_push_if_running(mk_task()));
        t.finish(false);
        assert!(!t.cq_push_if_running(mk_task()));
        assert_eq!(t.cq_drain().len(), 1);
    }

    #[test]
    fn captured_panic_roundtrip() {
        let v = CapturedPanic::value(Box::new("boom"));
        let cp = v.downcast_ref::<CapturedPanic>().unwrap();
        let payload = cp.take().unwrap();
        assert_eq!(*payload.downcast_ref::<&str>().unwrap(), "boom");
        assert!(cp.take().is_none());
    }
}
