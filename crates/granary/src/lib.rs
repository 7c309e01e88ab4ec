//! A parallel task runtime built around a concurrent priority multiqueue of
//! lightweight user-space tasks.
//!
//! The pieces: a randomized, lock-striped min-priority multiqueue sampled
//! with two random probes per extraction; lock-free pools of synchronization
//! trees coordinating fan-out/fan-in for data-parallel grain loops (with
//! optional pairwise reduction); per-worker sticky queues for pinned tasks;
//! and cooperative stackful fibers, one guard-paged stack per task.
//!
//! ```no_run
//! use granary::{Config, Runtime, value};
//!
//! let rt = Runtime::new(Config::default()).unwrap();
//! let out = rt.block_on({
//!     let rt2 = rt.clone();
//!     move || {
//!         let t = rt2.task_new(|| value(41i64 + 1));
//!         rt2.task_spawn(&t, false, false).unwrap();
//!         rt2.task_sync(&t).unwrap()
//!     }
//! });
//! assert_eq!(*out.downcast_ref::<i64>().unwrap(), 42);
//! rt.shutdown();
//! ```

mod condition;
mod config;
mod error;
mod multiq;
mod rng;
mod runtime;
mod sync_tree;
mod task;
mod worker;

pub use condition::Condition;
pub use config::{
    Config, EventLoop, DEFAULT_ARRIVERS_P, DEFAULT_GRAIN_K, DEFAULT_HEAP_C, DEFAULT_HEAP_D,
    DEFAULT_REDUCERS_FRAC, DEFAULT_STACK_SIZE, DEFAULT_TASKS_PER_HEAP,
};
pub use error::{
    SpawnError, SPAWN_ERR_INVALID_TASK, SPAWN_ERR_MISSING_SIBLING, SPAWN_ERR_QUEUE_FULL, SPAWN_OK,
};
pub use runtime::Runtime;
pub use task::{value, CapturedPanic, Exception, ReduceFn, Task, TaskState, Value};
pub use worker::{current_worker_id, StatsSnapshot};
