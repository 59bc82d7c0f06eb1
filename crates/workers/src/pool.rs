//! Elastic OS-thread pool for CPU-bound kernel jobs.
//!
//! Threads are kept between `min_threads` and `max_threads`. A new thread is
//! spawned when the backlog outgrows the idle workers; threads above the minimum
//! retire after `idle_timeout` without work. Results come back over a tokio
//! oneshot, so async callers never block a runtime thread.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use amas_core::config::WorkerConfig;
use amas_kernels::task::{KernelOutput, KernelTask};
use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::PoolError;

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerPoolConfig {
    pub min_threads: usize,
    pub max_threads: usize,
    pub idle_timeout: Duration,
    pub max_queue: usize,
    /// Upper bound on any wait for a job result; longer caller timeouts are
    /// clamped to it.
    pub task_timeout: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

impl From<&WorkerConfig> for WorkerPoolConfig {
    fn from(c: &WorkerConfig) -> Self {
        let max_threads = c.max_threads.max(1);
        Self {
            min_threads: c.min_threads.min(max_threads),
            max_threads,
            idle_timeout: Duration::from_millis(c.idle_timeout_ms),
            max_queue: c.max_queue.max(1),
            task_timeout: Duration::from_millis(c.pool_task_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub live_threads: usize,
    pub idle_threads: usize,
    pub queued: usize,
    pub completed: u64,
    pub panicked: u64,
}

struct PoolState {
    jobs: VecDeque<Job>,
    live: usize,
    idle: usize,
    shutdown: bool,
}

struct Shared {
    config: WorkerPoolConfig,
    state: Mutex<PoolState>,
    available: Condvar,
    handles: Mutex<Vec<JoinHandle<()>>>,
    next_worker: AtomicU64,
    completed: AtomicU64,
    panicked: AtomicU64,
}

impl Shared {
    /// Block until there is a job, or return `None` when this thread should
    /// exit. `live` is decremented before returning `None`.
    fn next_job(&self) -> Option<Job> {
        let mut state = self.state.lock();
        loop {
            if let Some(job) = state.jobs.pop_front() {
                return Some(job);
            }
            if state.shutdown {
                state.live -= 1;
                return None;
            }

            state.idle += 1;
            let timed_out = self
                .available
                .wait_for(&mut state, self.config.idle_timeout)
                .timed_out();
            state.idle -= 1;

            if timed_out && state.jobs.is_empty() && state.live > self.config.min_threads {
                state.live -= 1;
                return None;
            }
        }
    }

    fn worker_loop(&self, worker: u64) {
        debug!(worker, "worker started");
        while let Some(job) = self.next_job() {
            match catch_unwind(AssertUnwindSafe(job)) {
                Ok(()) => {
                    self.completed.fetch_add(1, Ordering::Relaxed);
                }
                Err(_) => {
                    self.panicked.fetch_add(1, Ordering::Relaxed);
                    error!(worker, "kernel job panicked");
                }
            }
        }
        debug!(worker, "worker exiting");
    }
}

/// Spawn one worker. The caller has already counted it in `live`.
fn spawn_worker(shared: &Arc<Shared>) -> Result<(), PoolError> {
    let id = shared.next_worker.fetch_add(1, Ordering::Relaxed);
    let worker_shared = shared.clone();
    let handle = std::thread::Builder::new()
        .name(format!("amas-worker-{id}"))
        .spawn(move || worker_shared.worker_loop(id))
        .map_err(|e| PoolError::Spawn(e.to_string()))?;

    let mut handles = shared.handles.lock();
    handles.retain(|h| !h.is_finished());
    handles.push(handle);
    Ok(())
}

pub struct WorkerPool {
    shared: Arc<Shared>,
}

impl WorkerPool {
    /// Start the pool with `min_threads` workers.
    pub fn start(config: WorkerPoolConfig) -> Result<Self, PoolError> {
        let min_threads = config.min_threads;
        let shared = Arc::new(Shared {
            config,
            state: Mutex::new(PoolState {
                jobs: VecDeque::new(),
                live: 0,
                idle: 0,
                shutdown: false,
            }),
            available: Condvar::new(),
            handles: Mutex::new(Vec::new()),
            next_worker: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            panicked: AtomicU64::new(0),
        });

        for _ in 0..min_threads {
            shared.state.lock().live += 1;
            if let Err(e) = spawn_worker(&shared) {
                shared.state.lock().live -= 1;
                let pool = Self { shared };
                pool.shutdown();
                return Err(e);
            }
        }

        info!(
            min_threads,
            max_threads = shared.config.max_threads,
            max_queue = shared.config.max_queue,
            "worker pool started"
        );
        Ok(Self { shared })
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.shared.config
    }

    fn enqueue(&self, job: Job) -> Result<(), PoolError> {
        let mut state = self.shared.state.lock();
        if state.shutdown {
            return Err(PoolError::ShutDown);
        }
        if state.jobs.len() >= self.shared.config.max_queue {
            return Err(PoolError::Saturated {
                queued: state.jobs.len(),
                capacity: self.shared.config.max_queue,
            });
        }
        state.jobs.push_back(job);

        // Idle workers may not have woken for earlier jobs yet, so compare
        // against the backlog rather than checking for zero idle.
        if state.jobs.len() > state.idle && state.live < self.shared.config.max_threads {
            state.live += 1;
            if let Err(e) = spawn_worker(&self.shared) {
                state.live -= 1;
                // The job stays queued for the existing workers.
                warn!(error = %e, live = state.live, "could not grow worker pool");
                if state.live == 0 {
                    state.jobs.pop_back();
                    return Err(e);
                }
            }
        }
        drop(state);
        self.shared.available.notify_one();
        Ok(())
    }

    /// Run `f` on a worker and wait at most `timeout` (capped at the pool's
    /// `task_timeout`) for its result.
    ///
    /// On timeout the job keeps running and its result is discarded.
    pub async fn run_blocking<T, F>(&self, f: F, timeout: Duration) -> Result<T, PoolError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let timeout = timeout.min(self.shared.config.task_timeout);
        let (tx, rx) = oneshot::channel();
        self.enqueue(Box::new(move || {
            // Receiver may be gone after a timeout.
            let _ = tx.send(f());
        }))?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(value)) => Ok(value),
            // Sender dropped without a value: the job panicked or was discarded.
            Ok(Err(_)) => Err(PoolError::WorkerLost),
            Err(_) => Err(PoolError::Timeout(timeout)),
        }
    }

    pub async fn run(&self, task: KernelTask, timeout: Duration) -> Result<KernelOutput, PoolError> {
        let task_id = Uuid::new_v4();
        let kind = task.kind();
        debug!(%task_id, kind, d = task.dimension(), "submitting kernel task");
        let result = self.run_blocking(move || task.execute(), timeout).await;
        if let Err(e) = &result {
            debug!(%task_id, kind, error = %e, "kernel task did not complete");
        }
        result
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            live_threads: state.live,
            idle_threads: state.idle,
            queued: state.jobs.len(),
            completed: self.shared.completed.load(Ordering::Relaxed),
            panicked: self.shared.panicked.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting jobs. Queued jobs still run; workers exit once the
    /// queue is empty.
    pub fn shutdown(&self) {
        self.shared.state.lock().shutdown = true;
        self.shared.available.notify_all();
    }

    /// Block until every worker thread has exited. Call after `shutdown`.
    pub fn join(&self) {
        let handles: Vec<JoinHandle<()>> = self.shared.handles.lock().drain(..).collect();
        for handle in handles {
            if handle.join().is_err() {
                error!("worker thread panicked outside a job");
            }
        }
    }

    /// Shut down and wait for all threads without blocking the runtime.
    pub async fn destroy(self: Arc<Self>) {
        self.shutdown();
        let pool = self.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || pool.join()).await {
            error!(error = %e, "worker pool join task failed");
        }
        info!(completed = self.shared.completed.load(Ordering::Relaxed), "worker pool destroyed");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Threads hold their own `Arc<Shared>`; tell them to go.
        self.shutdown();
    }
}

/// Owner of a lazily started pool.
///
/// Pass an `Arc<WorkerPoolHandle>` to whoever needs the pool; the pool itself
/// starts on first use (or [`start`](Self::start)) and stops on
/// [`destroy`](Self::destroy). Destroy is final: later starts fail with
/// [`PoolError::ShutDown`].
pub struct WorkerPoolHandle {
    config: WorkerPoolConfig,
    slot: Mutex<PoolSlot>,
}

enum PoolSlot {
    Idle,
    Running(Arc<WorkerPool>),
    Destroyed,
}

impl WorkerPoolHandle {
    pub fn new(config: WorkerPoolConfig) -> Self {
        Self {
            config,
            slot: Mutex::new(PoolSlot::Idle),
        }
    }

    pub fn config(&self) -> &WorkerPoolConfig {
        &self.config
    }

    /// Running pool, starting it if needed.
    pub fn get_or_start(&self) -> Result<Arc<WorkerPool>, PoolError> {
        let mut slot = self.slot.lock();
        match &*slot {
            PoolSlot::Running(pool) => return Ok(pool.clone()),
            PoolSlot::Destroyed => return Err(PoolError::ShutDown),
            PoolSlot::Idle => {}
        }
        let pool = Arc::new(WorkerPool::start(self.config.clone())?);
        *slot = PoolSlot::Running(pool.clone());
        Ok(pool)
    }

    pub fn start(&self) -> Result<(), PoolError> {
        self.get_or_start().map(|_| ())
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.slot.lock(), PoolSlot::Running(_))
    }

    pub fn stats(&self) -> Option<PoolStats> {
        match &*self.slot.lock() {
            PoolSlot::Running(pool) => Some(pool.stats()),
            _ => None,
        }
    }

    /// Stop the pool and wait for its threads. The handle refuses to start
    /// another pool afterwards.
    pub async fn destroy(&self) {
        let previous = std::mem::replace(&mut *self.slot.lock(), PoolSlot::Destroyed);
        if let PoolSlot::Running(pool) = previous {
            pool.destroy().await;
        }
    }
}
