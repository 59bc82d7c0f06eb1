use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid numeric input: {0}")]
    InvalidInput(String),

    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("No candidate actions to select from")]
    EmptyActionSet,

    #[error("Ill-conditioned model, previous state retained: {0}")]
    IllConditioned(String),

    #[error("Invalid model: {0}")]
    InvalidModel(String),

    #[error("Numeric kernel error: {0}")]
    Kernel(String),
}

/// Why an accelerated call did not produce a usable result.
///
/// Returned from the accelerated call site instead of unwinding; the
/// dispatcher records it on the circuit breaker and falls back.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FailureReason {
    #[error("accelerated backend unavailable: {0}")]
    Unavailable(String),

    #[error("accelerated call timed out")]
    Timeout,

    #[error("selection index {index} outside [0, {len})")]
    BoundaryError { index: usize, len: usize },

    #[error("invalid accelerated result: {0}")]
    InvalidResult(String),

    #[error("numeric failure in accelerated path: {0}")]
    Numeric(String),
}

impl FailureReason {
    /// Short label used for metrics and breaker events.
    pub fn label(&self) -> &'static str {
        match self {
            FailureReason::Unavailable(_) => "unavailable",
            FailureReason::Timeout => "timeout",
            FailureReason::BoundaryError { .. } => "boundary_error",
            FailureReason::InvalidResult(_) => "invalid_result",
            FailureReason::Numeric(_) => "numeric",
        }
    }
}
