use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PoolError {
    #[error("worker pool is shut down")]
    ShutDown,

    #[error("worker queue full ({queued}/{capacity})")]
    Saturated { queued: usize, capacity: usize },

    #[error("task timed out after {0:?}")]
    Timeout(Duration),

    #[error("worker dropped the task before replying")]
    WorkerLost,

    #[error("failed to spawn worker thread: {0}")]
    Spawn(String),
}

impl PoolError {
    pub fn label(&self) -> &'static str {
        match self {
            PoolError::ShutDown => "shut_down",
            PoolError::Saturated { .. } => "saturated",
            PoolError::Timeout(_) => "timeout",
            PoolError::WorkerLost => "worker_lost",
            PoolError::Spawn(_) => "spawn",
        }
    }
}
