//! Accelerated bandit backend abstraction.
//!
//! An accelerated backend computes the same LinUCB quantities as the reference
//! model but through a faster numeric path. The dispatcher owns the model state
//! and hands the backend read-only snapshots; a backend never mutates the model
//! directly, it returns a candidate state that the dispatcher validates first.

use crate::error::FailureReason;
use crate::types::{BanditModel, DiagnosticResult};

/// Candidate feature vectors flattened into one row-major buffer.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureBatch {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f64>,
}

impl FeatureBatch {
    /// Flatten candidate vectors. Rows shorter or longer than `cols` are
    /// zero-padded or truncated so the buffer is always `rows × cols`.
    pub fn from_rows(rows: &[Vec<f64>], cols: usize) -> Self {
        let mut data = Vec::with_capacity(rows.len() * cols);
        for row in rows {
            data.extend(row.iter().copied().take(cols));
            data.extend(std::iter::repeat(0.0).take(cols.saturating_sub(row.len())));
        }
        Self {
            rows: rows.len(),
            cols,
            data,
        }
    }
}

/// Raw selection produced by an accelerated backend, before validation.
#[derive(Debug, Clone, PartialEq)]
pub struct AcceleratedSelection {
    pub selected_index: usize,
    pub exploitation: f64,
    pub exploration: f64,
    pub scores: Vec<f64>,
}

/// Hardware/library-agnostic accelerated LinUCB provider.
pub trait AcceleratedBandit: Send + Sync {
    /// Provider name for metrics/logging.
    fn name(&self) -> &str;

    /// Score every candidate row against the model and pick the best.
    fn select(
        &self,
        model: &BanditModel,
        features: &FeatureBatch,
    ) -> Result<AcceleratedSelection, FailureReason>;

    /// Return the model after applying one `(x, reward)` observation.
    fn update(
        &self,
        model: &BanditModel,
        x: &[f64],
        reward: f64,
    ) -> Result<BanditModel, FailureReason>;

    /// Health report of the model as seen by this backend.
    fn diagnose(&self, model: &BanditModel) -> Result<DiagnosticResult, FailureReason>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_feature_batch_pads_and_truncates() {
        let batch = FeatureBatch::from_rows(&[vec![1.0, 2.0, 3.0], vec![4.0]], 2);
        assert_eq!(batch.rows, 2);
        assert_eq!(batch.data, vec![1.0, 2.0, 4.0, 0.0]);
        assert_eq!(batch.cols, 2);
    }
}
