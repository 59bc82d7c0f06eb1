//! Failure isolation for optional fast paths.

pub mod circuit_breaker;

pub use circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig};
