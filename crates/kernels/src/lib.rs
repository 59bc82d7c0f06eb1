//! Numeric kernels for the bandit engine.
//!
//! Everything here is a pure function over flat row-major buffers; callers own
//! the model state. [`task::KernelTask`] packages the same kernels as owned
//! jobs for the worker pool.

pub mod bayesian;
pub mod error;
pub mod linucb;
pub mod matrix;
pub mod sanitize;
pub mod task;

pub use bayesian::{bayesian_optimize, bayesian_suggest, GpHyper, Observation, ParamBound};
pub use error::{KernelError, KernelResult};
pub use linucb::{linucb_select, linucb_update, SelectOutcome};
pub use matrix::{cholesky_decompose, cholesky_rank1_update};
pub use task::{KernelOutput, KernelTask};
