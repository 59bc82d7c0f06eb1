//! Accelerated/reference dispatch for the LinUCB bandit.

pub mod backends;
pub mod dispatcher;
pub mod registry;

pub use backends::batched::NdarrayAccelerator;
pub use dispatcher::{BanditBackend, BanditDispatcher, DispatcherStats};
pub use registry::{DispatcherRegistry, SharedDispatcher};
