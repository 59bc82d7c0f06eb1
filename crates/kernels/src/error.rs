use amas_core::EngineError;
use thiserror::Error;

pub type KernelResult<T> = Result<T, KernelError>;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum KernelError {
    #[error("non-finite value in {0}")]
    NonFinite(&'static str),

    #[error("{what}: expected length {expected}, got {got}")]
    Length {
        what: &'static str,
        expected: usize,
        got: usize,
    },

    #[error("matrix not positive definite at pivot {index}")]
    NotPositiveDefinite { index: usize },

    #[error("rank-1 update collapsed diagonal {index} below {min_diag:e}")]
    Rank1Collapse { index: usize, min_diag: f64 },

    #[error("no candidate feature vectors")]
    EmptyCandidates,

    #[error("invalid parameter bounds: {0}")]
    InvalidBounds(String),
}

impl From<KernelError> for EngineError {
    fn from(err: KernelError) -> Self {
        match err {
            KernelError::NonFinite(_) => EngineError::InvalidInput(err.to_string()),
            KernelError::Length { expected, got, .. } => {
                EngineError::DimensionMismatch { expected, got }
            }
            KernelError::NotPositiveDefinite { .. } | KernelError::Rank1Collapse { .. } => {
                EngineError::IllConditioned(err.to_string())
            }
            KernelError::EmptyCandidates => EngineError::EmptyActionSet,
            KernelError::InvalidBounds(_) => EngineError::InvalidInput(err.to_string()),
        }
    }
}

pub(crate) fn check_len(what: &'static str, buf: &[f64], expected: usize) -> KernelResult<()> {
    if buf.len() != expected {
        return Err(KernelError::Length {
            what,
            expected,
            got: buf.len(),
        });
    }
    Ok(())
}

pub(crate) fn check_finite(what: &'static str, buf: &[f64]) -> KernelResult<()> {
    if buf.iter().any(|v| !v.is_finite()) {
        return Err(KernelError::NonFinite(what));
    }
    Ok(())
}
