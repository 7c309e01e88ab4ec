use std::fmt;
use std::io;
use std::sync::Arc;

/// Heaps per worker in the multiqueue.
pub const DEFAULT_HEAP_C: usize = 4;
/// Arity of each task heap.
pub const DEFAULT_HEAP_D: usize = 8;
/// Capacity of each task heap.
pub const DEFAULT_TASKS_PER_HEAP: usize = 129;
/// Grains per worker for a `task_new_multi` fan-out.
pub const DEFAULT_GRAIN_K: usize = 4;
/// Arriver pool size exponent: the pool holds `G^ARRIVERS_P + 1` trees.
pub const DEFAULT_ARRIVERS_P: u32 = 2;
/// Reducer pool size as a multiple of the arriver pool size.
pub const DEFAULT_REDUCERS_FRAC: usize = 1;
/// Fiber stack size in bytes.
pub const DEFAULT_STACK_SIZE: usize = 1024 * 1024;

/// Hook for an external event loop serviced by worker 0.
///
/// `run_once` is called when worker 0 finds no runnable task; `process_events`
/// is called on worker 0 after a fiber resumes from a yield.
pub trait EventLoop: Send + Sync {
    fn run_once(&self);
    fn process_events(&self);
}

/// Runtime tunables. All fields have working defaults; `validate` is called
/// by `Runtime::new`.
#[derive(Clone)]
pub struct Config {
    /// Number of OS worker threads.
    pub workers: usize,
    pub grain_k: usize,
    pub arrivers_p: u32,
    pub reducers_frac: usize,
    pub heap_c: usize,
    pub heap_d: usize,
    pub tasks_per_heap: usize,
    pub stack_size: usize,
    pub event_loop: Option<Arc<dyn EventLoop>>,
}

impl Default for Config {
    fn default() -> Self {
        // The arriver pool is quadratic in grain count; keep the default
        // worker count bounded so default pools stay small on wide machines.
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
            .min(16);
        Self {
            workers,
            grain_k: DEFAULT_GRAIN_K,
            arrivers_p: DEFAULT_ARRIVERS_P,
            reducers_frac: DEFAULT_REDUCERS_FRAC,
            heap_c: DEFAULT_HEAP_C,
            heap_d: DEFAULT_HEAP_D,
            tasks_per_heap: DEFAULT_TASKS_PER_HEAP,
            stack_size: DEFAULT_STACK_SIZE,
            event_loop: None,
        }
    }
}

impl Config {
    pub fn new(workers: usize) -> io::Result<Self> {
        let config = Self {
            workers,
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_grain_k(mut self, grain_k: usize) -> Self {
        self.grain_k = grain_k;
        self
    }

    pub fn with_stack_size(mut self, stack_size: usize) -> Self {
        self.stack_size = stack_size;
        self
    }

    pub fn with_event_loop(mut self, event_loop: Arc<dyn EventLoop>) -> Self {
        self.event_loop = Some(event_loop);
        self
    }

    /// Grain fan-out width `G = grain_k * workers`.
    pub fn grains(&self) -> usize {
        self.grain_k * self.workers
    }

    /// Number of heaps in the multiqueue, `heap_p = heap_c * workers`.
    pub fn heap_count(&self) -> usize {
        self.heap_c * self.workers
    }

    pub fn num_arrivers(&self) -> usize {
        self.grains().pow(self.arrivers_p) + 1
    }

    pub fn num_reducers(&self) -> usize {
        self.num_arrivers() * self.reducers_frac
    }

    pub fn validate(&self) -> io::Result<()> {
        if self.workers == 0 {
            return Err(invalid("workers must be > 0"));
        }
        if self.grain_k == 0 {
            return Err(invalid("grain_k must be > 0"));
        }
        if self.heap_c == 0 || self.heap_d < 2 || self.tasks_per_heap == 0 {
            return Err(invalid("multiqueue dimensions must be positive"));
        }
        // i16 priorities and i16 pool indices bound the addressable sizes.
        if self.heap_count() > i16::MAX as usize {
            return Err(invalid("heap_c * workers exceeds i16 range"));
        }
        if self.num_arrivers() > i16::MAX as usize || self.num_reducers() > i16::MAX as usize {
            return Err(invalid("sync tree pools exceed i16 range"));
        }
        if self.stack_size < 16 * 1024 {
            return Err(invalid("stack_size must be at least 16 KiB"));
        }
        Ok(())
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("workers", &self.workers)
            .field("grain_k", &self.grain_k)
            .field("arrivers_p", &self.arrivers_p)
            .field("reducers_frac", &self.reducers_frac)
            .field("heap_c", &self.heap_c)
            .field("heap_d", &self.heap_d)
            .field("tasks_per_heap", &self.tasks_per_heap)
            .field("stack_size", &self.stack_size)
            .field("event_loop", &self.event_loop.is_some())
            .finish()
    }
}

fn invalid(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidInput, msg)
}
