//! Background task scheduler
//!
//! Runs named tasks at or after their due time on one dedicated worker
//! thread. Tasks are ordered by due time, ties broken by insertion order.
//! Failures (errors and panics) go to a single error sink and never stop
//! the worker.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, info, warn};

use crate::pvr::condition::ScalarCondition;

/// Body of a scheduled task, handed the scheduler's cancellation condition
pub type TaskFn = Box<dyn FnOnce(&ScalarCondition<bool>) -> anyhow::Result<()> + Send + 'static>;

/// Receives every failure raised by a task body
pub type ErrorSink = Box<dyn Fn(&str, &anyhow::Error) + Send + Sync + 'static>;

struct PendingTask {
    name: &'static str,
    body: TaskFn,
}

#[derive(Default)]
struct SchedulerState {
    /// Pending tasks keyed by (due time, insertion sequence)
    queue: BTreeMap<(Instant, u64), PendingTask>,
    next_seq: u64,
    /// Bumped by every `stop`; a worker exits once it no longer matches
    generation: u64,
    /// A task body is running, possibly on a worker that was already stopped
    executing: bool,
}

struct Shared {
    state: Mutex<SchedulerState>,
    wake: Condvar,
    sink: ErrorSink,
}

/// The running worker and the condition its tasks are cancelled through
struct Worker {
    handle: JoinHandle<()>,
    cancel: Arc<ScalarCondition<bool>>,
}

/// Time-ordered task scheduler with a single worker thread
pub struct Scheduler {
    shared: Arc<Shared>,
    worker: Mutex<Option<Worker>>,
}

impl Scheduler {
    /// Create a stopped scheduler that reports task failures to `sink`
    pub fn new<F>(sink: F) -> Self
    where
        F: Fn(&str, &anyhow::Error) + Send + Sync + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(SchedulerState::default()),
                wake: Condvar::new(),
                sink: Box::new(sink),
            }),
            worker: Mutex::new(None),
        }
    }

    /// Create a scheduler whose failures are written to the log
    pub fn with_logging_sink() -> Self {
        Self::new(|name, err| error!("Scheduled task {} failed: {:#}", name, err))
    }

    /// Queue `task` to run at or after `due`
    pub fn add<F>(&self, due: Instant, name: &'static str, task: F)
    where
        F: FnOnce(&ScalarCondition<bool>) -> anyhow::Result<()> + Send + 'static,
    {
        let mut state = self.shared.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.queue.insert(
            (due, seq),
            PendingTask {
                name,
                body: Box::new(task),
            },
        );
        drop(state);

        debug!("Scheduled task {}", name);
        self.shared.wake.notify_all();
    }

    /// Remove every pending occurrence of the named task
    pub fn remove(&self, name: &str) {
        let mut state = self.shared.state.lock();
        let before = state.queue.len();
        state.queue.retain(|_, task| task.name != name);
        let removed = before - state.queue.len();
        drop(state);

        if removed > 0 {
            debug!("Removed {} pending occurrence(s) of task {}", removed, name);
            self.shared.wake.notify_all();
        }
    }

    /// Remove every pending task; a running task is not interrupted
    pub fn clear(&self) {
        self.shared.state.lock().queue.clear();
        self.shared.wake.notify_all();
    }

    /// Number of tasks waiting to run
    pub fn pending(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn is_running(&self) -> bool {
        self.worker.lock().is_some()
    }

    /// Start the worker thread
    pub fn start(&self) -> anyhow::Result<()> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            warn!("Scheduler already running");
            return Ok(());
        }

        let generation = self.shared.state.lock().generation;
        let cancel = Arc::new(ScalarCondition::new(false));

        let shared = self.shared.clone();
        let worker_cancel = cancel.clone();
        let handle = thread::Builder::new()
            .name("pvr-scheduler".to_string())
            .spawn(move || run_worker(&shared, generation, &worker_cancel))?;

        *worker = Some(Worker { handle, cancel });
        info!("Task scheduler started");
        Ok(())
    }

    /// Stop the worker thread and wait for it to exit. Pending tasks stay
    /// queued for the next `start`.
    ///
    /// Called from inside a task, the worker is signalled but not joined; a
    /// following `start` does not run anything until that task returns.
    pub fn stop(&self) {
        let Some(Worker { handle, cancel }) = self.worker.lock().take() else {
            return;
        };

        info!("Stopping task scheduler");
        cancel.set(true);
        self.shared.state.lock().generation += 1;
        self.shared.wake.notify_all();

        if handle.thread().id() == thread::current().id() {
            // Called from inside a task; the worker exits once the task returns
            return;
        }

        if handle.join().is_err() {
            error!("Task scheduler worker terminated abnormally");
        }
        info!("Task scheduler stopped");
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_worker(shared: &Shared, generation: u64, cancel: &ScalarCondition<bool>) {
    loop {
        let mut state = shared.state.lock();

        let task = loop {
            if state.generation != generation {
                return;
            }

            // Only one task body runs at a time, across restarts too
            if state.executing {
                shared.wake.wait(&mut state);
                continue;
            }

            let due = match state.queue.keys().next() {
                Some(&(due, _)) => due,
                None => {
                    shared.wake.wait(&mut state);
                    continue;
                }
            };

            if due <= Instant::now() {
                if let Some((_, task)) = state.queue.pop_first() {
                    state.executing = true;
                    break task;
                }
                continue;
            }

            shared.wake.wait_until(&mut state, due);
        };
        drop(state);

        execute(shared, cancel, task);

        shared.state.lock().executing = false;
        shared.wake.notify_all();
    }
}

fn execute(shared: &Shared, cancel: &ScalarCondition<bool>, task: PendingTask) {
    let PendingTask { name, body } = task;
    debug!("Running scheduled task {}", name);

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(cancel)));
    let err = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(err)) => err,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            anyhow::anyhow!("task panicked: {}", message)
        }
    };

    // The sink itself must not take the worker down
    if panic::catch_unwind(AssertUnwindSafe(|| (shared.sink)(name, &err))).is_err() {
        error!("Error sink panicked while reporting task {}", name);
    }
}
