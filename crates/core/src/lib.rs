//! Shared types, configuration and error taxonomy for the adaptive bandit
//! engine.

pub mod accel;
pub mod config;
pub mod error;
pub mod event_bus;
pub mod types;

pub use config::EngineConfig;
pub use error::{EngineError, EngineResult, FailureReason};
