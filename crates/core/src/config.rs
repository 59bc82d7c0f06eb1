use serde::Deserialize;

use crate::error::{EngineError, EngineResult};

/// Root engine configuration. Loaded from an optional TOML file and
/// environment variables with the prefix `AMAS_ENGINE__`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub bandit: BanditConfig,
    #[serde(default)]
    pub circuit: CircuitConfig,
    #[serde(default)]
    pub accelerator: AcceleratorConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BanditConfig {
    #[serde(default = "default_alpha")]
    pub alpha: f64,
    #[serde(default = "default_lambda")]
    pub lambda: f64,
    #[serde(default = "default_dimension")]
    pub dimension: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CircuitConfig {
    /// Failure fraction in `(0, 1]` that opens the breaker.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: f64,
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
    #[serde(default = "default_half_open_probe")]
    pub half_open_probe: u32,
    /// Outcomes required in the window before the failure rate is evaluated.
    #[serde(default = "default_minimum_samples")]
    pub minimum_samples: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AcceleratorConfig {
    #[serde(default = "default_use_accelerated")]
    pub use_accelerated: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_use_worker")]
    pub use_worker: bool,
    #[serde(default = "default_worker_threshold_dimension")]
    pub worker_threshold_dimension: usize,
    /// Timeout for user-facing kernel tasks.
    #[serde(default = "default_task_timeout_ms")]
    pub task_timeout_ms: u64,
    /// Pool-wide default for background tasks.
    #[serde(default = "default_pool_task_timeout_ms")]
    pub pool_task_timeout_ms: u64,
    #[serde(default = "default_min_threads")]
    pub min_threads: usize,
    #[serde(default = "default_max_threads")]
    pub max_threads: usize,
    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,
    #[serde(default = "default_max_queue")]
    pub max_queue: usize,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct MetricsConfig {
    /// Prometheus listener port; no exporter when unset.
    #[serde(default)]
    pub port: Option<u16>,
}

// Default functions
fn default_alpha() -> f64 {
    0.3
}
fn default_lambda() -> f64 {
    1.0
}
fn default_dimension() -> usize {
    crate::types::FEATURE_DIMENSION
}
fn default_failure_threshold() -> f64 {
    0.5
}
fn default_window_size() -> usize {
    20
}
fn default_recovery_timeout_ms() -> u64 {
    30_000
}
fn default_half_open_probe() -> u32 {
    2
}
fn default_minimum_samples() -> usize {
    5
}
fn default_use_accelerated() -> bool {
    true
}
fn default_use_worker() -> bool {
    true
}
fn default_worker_threshold_dimension() -> usize {
    10
}
fn default_task_timeout_ms() -> u64 {
    5_000
}
fn default_pool_task_timeout_ms() -> u64 {
    60_000
}
fn default_min_threads() -> usize {
    1
}
fn default_max_threads() -> usize {
    4
}
fn default_idle_timeout_ms() -> u64 {
    30_000
}
fn default_max_queue() -> usize {
    1024
}

impl Default for BanditConfig {
    fn default() -> Self {
        Self {
            alpha: default_alpha(),
            lambda: default_lambda(),
            dimension: default_dimension(),
        }
    }
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            window_size: default_window_size(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            half_open_probe: default_half_open_probe(),
            minimum_samples: default_minimum_samples(),
        }
    }
}

impl Default for AcceleratorConfig {
    fn default() -> Self {
        Self {
            use_accelerated: default_use_accelerated(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            use_worker: default_use_worker(),
            worker_threshold_dimension: default_worker_threshold_dimension(),
            task_timeout_ms: default_task_timeout_ms(),
            pool_task_timeout_ms: default_pool_task_timeout_ms(),
            min_threads: default_min_threads(),
            max_threads: default_max_threads(),
            idle_timeout_ms: default_idle_timeout_ms(),
            max_queue: default_max_queue(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables only.
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::load_from(None)
    }

    /// Load configuration from an optional file, then environment variables.
    /// Environment values win over file values.
    pub fn load_from(path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }
        let builder = builder.add_source(
            config::Environment::with_prefix("AMAS_ENGINE")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Reject values the engine cannot run with.
    pub fn validate(&self) -> EngineResult<()> {
        let b = &self.bandit;
        if !(b.lambda.is_finite() && b.lambda > 0.0) {
            return Err(EngineError::Config(format!("lambda must be > 0, got {}", b.lambda)));
        }
        if !(b.alpha.is_finite() && b.alpha >= 0.0) {
            return Err(EngineError::Config(format!("alpha must be >= 0, got {}", b.alpha)));
        }
        if b.dimension == 0 {
            return Err(EngineError::Config("dimension must be positive".into()));
        }

        let c = &self.circuit;
        if !(c.failure_threshold > 0.0 && c.failure_threshold <= 1.0) {
            return Err(EngineError::Config(format!(
                "failure_threshold must be in (0, 1], got {}",
                c.failure_threshold
            )));
        }
        if c.window_size == 0 || c.half_open_probe == 0 {
            return Err(EngineError::Config(
                "window_size and half_open_probe must be positive".into(),
            ));
        }

        let w = &self.worker;
        if w.max_threads == 0 || w.min_threads > w.max_threads {
            return Err(EngineError::Config(format!(
                "thread bounds invalid: min={}, max={}",
                w.min_threads, w.max_threads
            )));
        }
        if w.task_timeout_ms == 0 || w.pool_task_timeout_ms == 0 || w.max_queue == 0 {
            return Err(EngineError::Config(
                "task_timeout_ms, pool_task_timeout_ms and max_queue must be positive".into(),
            ));
        }
        // Idle workers wait on this; zero would spin them.
        if w.idle_timeout_ms == 0 {
            return Err(EngineError::Config("idle_timeout_ms must be positive".into()));
        }
        Ok(())
    }
}
