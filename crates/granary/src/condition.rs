//! One-shot condition latch.
//!
//! The notify flag is monotone: once set it never clears, and every later
//! wait returns immediately. Waiters park on a locked FIFO; notify detaches
//! the whole queue and re-enqueues the waiters in order.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::task::{Task, TaskQueue};

pub struct Condition {
    notify: AtomicBool,
    waitq: TaskQueue,
}

impl Condition {
    pub fn new() -> Self {
        Self {
            notify: AtomicBool::new(false),
            waitq: TaskQueue::new(),
        }
    }

    pub fn notified(&self) -> bool {
        self.notify.load(Ordering::Acquire)
    }

    /// Parks `waiter` unless notify won the race; the recheck runs under the
    /// wait-queue lock.
    pub(crate) fn push_waiter_if_unnotified(&self, waiter: Arc<Task>) -> bool {
        self.waitq.push_if(waiter, || !self.notified())
    }

    /// Latches the flag and detaches every parked waiter, in wait order.
    pub(crate) fn notify_and_drain(&self) -> Vec<Arc<Task>> {
        self.waitq
            .drain_with(|| self.notify.store(true, Ordering::Release))
    }
}

impl Default for Condition {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{value, Task};
    use std::sync::Arc;

    fn mk_task() -> Arc<Task> {
        Task::new_single(Arc::new(|| value(())), 64 * 1024)
    }

    #[test]
    fn notify_latches() {
        let c = Condition::new();
        assert!(!c.notified());
        assert!(c.notify_and_drain().is_empty());
        assert!(c.notified());
        // Latched: a would-be waiter is refused.
        assert!(!c.push_waiter_if_unnotified(mk_task()));
    }

    #[test]
    fn waiters_drain_in_wait_order() {
        let c = Condition::new();
        let a = mk_task();
        let b = mk_task();
        assert!(c.push_waiter_if_unnotified(a.clone()));
        assert!(c.push_waiter_if_unnotified(b.clone()));
        let drained = c.notify_and_drain();
        assert_eq!(drained.len(), 2);
        assert!(Arc::ptr_eq(&drained[0], &a));
        assert!(Arc::ptr_eq(&drained[1], &b));
        // A second notify has nothing left to hand out.
        assert!(c.notify_and_drain().is_empty());
    }
}
