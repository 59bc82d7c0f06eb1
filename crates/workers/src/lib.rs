//! Off-thread execution of numeric kernels.
//!
//! [`WorkerPool`] runs owned jobs on a bounded set of OS threads;
//! [`KernelOffload`] decides per task whether to use it and falls back to
//! running the kernel on the caller when the pool is slow or unavailable.

pub mod error;
pub mod offload;
pub mod pool;

pub use error::PoolError;
pub use offload::{KernelOffload, OffloadConfig, OffloadOutcome, OffloadStats};
pub use pool::{PoolStats, WorkerPool, WorkerPoolConfig, WorkerPoolHandle};
