//! Executor abstraction the pipeline runs on.
//!
//! Stages never spawn threads of their own and never reach for a global
//! runtime; everything that may block is handed to an injected [`Executor`],
//! and the two timers the core needs (minimum job interval, requeue backoff)
//! go through a [`ScheduledExecutor`]. Production wires these to a tokio
//! runtime handle; tests use the deterministic implementations below.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;

use crate::clock::MonotonicClock;

/// A unit of work handed to an executor.
pub type Task = Box<dyn FnOnce() + Send>;

/// Runs tasks, possibly concurrently, on threads owned by the executor.
pub trait Executor: Send + Sync {
    fn execute(&self, task: Task);
}

/// Runs tasks after a delay.
pub trait ScheduledExecutor: Send + Sync {
    fn schedule(&self, delay: Duration, task: Task);
}

/// Adapter dispatching pipeline work onto a tokio runtime.
///
/// Tasks are synchronous callbacks, so they run on the blocking pool;
/// scheduled tasks sleep on the timer wheel first.
pub struct TokioExecutor {
    handle: tokio::runtime::Handle,
}

impl TokioExecutor {
    pub fn new(handle: tokio::runtime::Handle) -> TokioExecutor {
        TokioExecutor { handle }
    }
}

impl Executor for TokioExecutor {
    fn execute(&self, task: Task) {
        self.handle.spawn_blocking(task);
    }
}

impl ScheduledExecutor for TokioExecutor {
    fn schedule(&self, delay: Duration, task: Task) {
        let handle = self.handle.clone();
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            handle.spawn_blocking(task);
        });
    }
}

/// Runs each task synchronously on the calling thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct CallerThreadExecutor;

impl Executor for CallerThreadExecutor {
    fn execute(&self, task: Task) {
        task();
    }
}

/// Deterministic executor for tests: queues tasks until told to run them.
#[derive(Default)]
pub struct DeferredExecutor {
    queue: Mutex<VecDeque<Task>>,
}

impl DeferredExecutor {
    pub fn new() -> DeferredExecutor {
        DeferredExecutor::default()
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Runs everything queued so far, in submission order. Tasks submitted
    /// by running tasks stay queued for the next call. Returns the number
    /// of tasks run.
    pub fn run_pending(&self) -> usize {
        let batch: Vec<Task> = self.queue.lock().drain(..).collect();
        let count = batch.len();
        for task in batch {
            task();
        }
        count
    }

    /// Keeps running until the queue stays empty.
    pub fn run_until_idle(&self) {
        while self.run_pending() > 0 {}
    }
}

impl Executor for DeferredExecutor {
    fn execute(&self, task: Task) {
        self.queue.lock().push_back(task);
    }
}

struct ScheduledTask {
    due_ms: u64,
    task: Task,
}

/// Deterministic scheduled executor keyed off an injected clock.
///
/// `schedule` records a due time; nothing runs until the test advances the
/// clock and calls [`run_due`](ManualScheduledExecutor::run_due).
pub struct ManualScheduledExecutor {
    clock: Arc<dyn MonotonicClock>,
    queue: Mutex<Vec<ScheduledTask>>,
}

impl ManualScheduledExecutor {
    pub fn new(clock: Arc<dyn MonotonicClock>) -> ManualScheduledExecutor {
        ManualScheduledExecutor {
            clock,
            queue: Mutex::new(Vec::new()),
        }
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    /// Earliest due time among pending tasks.
    pub fn next_due_ms(&self) -> Option<u64> {
        self.queue.lock().iter().map(|t| t.due_ms).min()
    }

    /// Runs every task whose due time has been reached, in due order.
    /// Returns the number of tasks run.
    pub fn run_due(&self) -> usize {
        let now = self.clock.now_ms();
        let due: Vec<ScheduledTask> = {
            let mut queue = self.queue.lock();
            let mut due: Vec<ScheduledTask> = Vec::new();
            let mut index = 0;
            while index < queue.len() {
                if queue[index].due_ms <= now {
                    due.push(queue.swap_remove(index));
                } else {
                    index += 1;
                }
            }
            due.sort_by_key(|t| t.due_ms);
            due
        };
        let count = due.len();
        for scheduled in due {
            (scheduled.task)();
        }
        count
    }
}

impl ScheduledExecutor for ManualScheduledExecutor {
    fn schedule(&self, delay: Duration, task: Task) {
        let due_ms = self
            .clock
            .now_ms()
            .saturating_add(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX));
        self.queue.lock().push(ScheduledTask { due_ms, task });
    }
}
