//! Inline-or-offload execution of kernel tasks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use amas_core::config::WorkerConfig;
use amas_kernels::task::{KernelOutput, KernelTask};
use serde::Serialize;
use tracing::{debug, warn};

use crate::error::PoolError;
use crate::pool::WorkerPoolHandle;

#[derive(Debug, Clone, PartialEq)]
pub struct OffloadConfig {
    pub enabled: bool,
    /// Tasks smaller than this run on the caller.
    pub threshold_dimension: usize,
    pub task_timeout: Duration,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

impl From<&WorkerConfig> for OffloadConfig {
    fn from(c: &WorkerConfig) -> Self {
        Self {
            enabled: c.use_worker,
            threshold_dimension: c.worker_threshold_dimension,
            task_timeout: Duration::from_millis(c.task_timeout_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OffloadStats {
    /// Tasks answered by a worker.
    pub offloaded: u64,
    /// Tasks run on the caller because they were small or offload is off.
    pub inline: u64,
    /// Tasks that tried the pool and were then run on the caller.
    pub fallbacks: u64,
    pub timeouts: u64,
    pub pool_errors: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OffloadOutcome {
    pub output: KernelOutput,
    /// True only when a worker produced `output`.
    pub offloaded: bool,
}

/// Routes kernel tasks to the worker pool and always returns an answer.
pub struct KernelOffload {
    config: OffloadConfig,
    pool: Option<Arc<WorkerPoolHandle>>,
    offloaded: AtomicU64,
    inline: AtomicU64,
    fallbacks: AtomicU64,
    timeouts: AtomicU64,
    pool_errors: AtomicU64,
}

impl KernelOffload {
    pub fn new(config: OffloadConfig, pool: Option<Arc<WorkerPoolHandle>>) -> Self {
        Self {
            config,
            pool,
            offloaded: AtomicU64::new(0),
            inline: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            pool_errors: AtomicU64::new(0),
        }
    }

    /// Every task runs on the caller.
    pub fn inline_only() -> Self {
        Self::new(
            OffloadConfig {
                enabled: false,
                ..OffloadConfig::default()
            },
            None,
        )
    }

    pub fn config(&self) -> &OffloadConfig {
        &self.config
    }

    pub fn pool(&self) -> Option<&Arc<WorkerPoolHandle>> {
        self.pool.as_ref()
    }

    pub fn should_offload(&self, task: &KernelTask) -> bool {
        self.config.enabled
            && self.pool.is_some()
            && task.dimension() >= self.config.threshold_dimension
    }

    pub async fn run(&self, task: KernelTask) -> OffloadOutcome {
        let handle = match &self.pool {
            Some(handle) if self.should_offload(&task) => handle,
            _ => {
                self.inline.fetch_add(1, Ordering::Relaxed);
                return OffloadOutcome {
                    output: task.execute(),
                    offloaded: false,
                };
            }
        };

        let kind = task.kind();
        let pool = match handle.get_or_start() {
            Ok(pool) => pool,
            Err(e) => return self.fall_back(task, kind, e),
        };

        let started = Instant::now();
        // Keep `task` for the synchronous fallback.
        match pool.run(task.clone(), self.config.task_timeout).await {
            Ok(output) => {
                self.offloaded.fetch_add(1, Ordering::Relaxed);
                let elapsed_us = started.elapsed().as_micros() as f64;
                metrics::histogram!("amas.worker.task_latency_us").record(elapsed_us);
                debug!(kind, elapsed_us, success = output.success(), "kernel task offloaded");
                OffloadOutcome {
                    output,
                    offloaded: true,
                }
            }
            Err(e) => self.fall_back(task, kind, e),
        }
    }

    fn fall_back(&self, task: KernelTask, kind: &'static str, error: PoolError) -> OffloadOutcome {
        match error {
            PoolError::Timeout(_) => self.timeouts.fetch_add(1, Ordering::Relaxed),
            _ => self.pool_errors.fetch_add(1, Ordering::Relaxed),
        };
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("amas.worker.fallbacks").increment(1);
        warn!(kind, error = %error, reason = error.label(), "worker unavailable, running kernel inline");

        OffloadOutcome {
            output: task.execute(),
            offloaded: false,
        }
    }

    pub fn stats(&self) -> OffloadStats {
        OffloadStats {
            offloaded: self.offloaded.load(Ordering::Relaxed),
            inline: self.inline.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            pool_errors: self.pool_errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::pool::WorkerPoolConfig;
    use amas_kernels::task::{BayesianOptimizePayload, CholeskyDecomposePayload, LinucbUpdatePayload};
    use amas_kernels::{GpHyper, Observation, ParamBound};

    fn identity(d: usize) -> Vec<f64> {
        let mut m = vec![0.0; d * d];
        for i in 0..d {
            m[i * d + i] = 1.0;
        }
        m
    }

    fn update_task(d: usize) -> KernelTask {
        KernelTask::LinucbUpdate(LinucbUpdatePayload {
            a: identity(d),
            b: vec![0.0; d],
            l: identity(d),
            d,
            x: vec![0.5; d],
            reward: 1.0,
        })
    }

    fn handle() -> Arc<WorkerPoolHandle> {
        Arc::new(WorkerPoolHandle::new(WorkerPoolConfig {
            min_threads: 1,
            max_threads: 2,
            idle_timeout: Duration::from_secs(1),
            max_queue: 8,
            task_timeout: Duration::from_secs(60),
        }))
    }

    fn config(timeout: Duration) -> OffloadConfig {
        OffloadConfig {
            enabled: true,
            threshold_dimension: 10,
            task_timeout: timeout,
        }
    }

    #[tokio::test]
    async fn test_small_tasks_run_inline() {
        let pool = handle();
        let offload = KernelOffload::new(config(Duration::from_secs(5)), Some(pool.clone()));
        let out = offload.run(update_task(4)).await;
        assert!(out.output.success());
        assert!(!out.offloaded);
        assert_eq!(offload.stats().inline, 1);
        assert!(!pool.is_running(), "pool must not start for inline work");
    }

    #[tokio::test]
    async fn test_large_tasks_offload() {
        let pool = handle();
        let offload = KernelOffload::new(config(Duration::from_secs(5)), Some(pool.clone()));
        let out = offload.run(update_task(12)).await;
        assert!(out.output.success());
        assert!(out.offloaded);
        assert_eq!(offload.stats().offloaded, 1);
        assert!(pool.is_running());
        pool.destroy().await;
    }

    #[tokio::test]
    async fn test_offloaded_result_matches_inline() {
        let pool = handle();
        let offload = KernelOffload::new(config(Duration::from_secs(5)), Some(pool.clone()));
        let task = KernelTask::CholeskyDecompose(CholeskyDecomposePayload {
            a: identity(16),
            d: 16,
            lambda: 0.5,
        });
        let remote = offload.run(task.clone()).await;
        assert!(remote.offloaded);
        assert_eq!(remote.output, task.execute());
        pool.destroy().await;
    }

    #[tokio::test]
    async fn test_timeout_falls_back_and_counts() {
        let pool = handle();
        let offload = KernelOffload::new(config(Duration::from_nanos(1)), Some(pool.clone()));
        // Heavy enough that a worker cannot answer within a nanosecond.
        let observations: Vec<Observation> = (0..120)
            .map(|i| Observation {
                params: vec![i as f64 / 120.0],
                value: (i as f64 / 7.0).sin(),
            })
            .collect();
        let task = KernelTask::BayesianOptimize(BayesianOptimizePayload {
            observations,
            bounds: vec![ParamBound::new(0.0, 1.0)],
            hyper: GpHyper::default(),
            beta: 1.0,
            batch_size: 6,
            seed: Some(1),
        });

        let out = offload.run(task).await;
        assert!(out.output.success());
        assert!(!out.offloaded);

        let stats = offload.stats();
        assert_eq!(stats.fallbacks, 1);
        assert_eq!(stats.timeouts, 1);
        assert_eq!(stats.offloaded, 0);
        pool.destroy().await;
    }

    #[tokio::test]
    async fn test_shut_down_pool_falls_back() {
        let pool = handle();
        let offload = KernelOffload::new(config(Duration::from_secs(5)), Some(pool.clone()));
        let running = pool.get_or_start().unwrap();
        running.shutdown();

        let out = offload.run(update_task(12)).await;
        assert!(out.output.success());
        assert!(!out.offloaded);
        let stats = offload.stats();
        assert_eq!(stats.fallbacks, 1);
        assert_eq!(stats.pool_errors, 1);
        running.join();
    }

    #[tokio::test]
    async fn test_destroyed_handle_does_not_restart() {
        let pool = handle();
        let offload = KernelOffload::new(config(Duration::from_secs(5)), Some(pool.clone()));
        assert!(offload.run(update_task(12)).await.offloaded);
        pool.destroy().await;

        let out = offload.run(update_task(12)).await;
        assert!(out.output.success());
        assert!(!out.offloaded);
        assert!(!pool.is_running());
        let stats = offload.stats();
        assert_eq!(stats.offloaded, 1);
        assert_eq!(stats.fallbacks, 1);
        assert_eq!(stats.pool_errors, 1);
    }

    #[tokio::test]
    async fn test_disabled_or_missing_pool_runs_inline() {
        let offload = KernelOffload::inline_only();
        let out = offload.run(update_task(32)).await;
        assert!(out.output.success());
        assert_eq!(offload.stats().inline, 1);

        let disabled = KernelOffload::new(
            OffloadConfig {
                enabled: false,
                ..config(Duration::from_secs(5))
            },
            Some(handle()),
        );
        assert!(!disabled.should_offload(&update_task(32)));
    }
}
