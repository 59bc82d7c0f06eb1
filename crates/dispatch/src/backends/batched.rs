//! Batched LinUCB on `ndarray` matrices.
//!
//! Selection stacks every candidate into one `n × d` matrix and runs a single
//! multi-column triangular solve, instead of one solve per candidate as the
//! reference model does. Updates reuse the shared rank-1 kernel and rebuild
//! the factor from `A` when it has drifted.

use amas_core::accel::{AcceleratedBandit, AcceleratedSelection, FeatureBatch};
use amas_core::types::{BanditModel, DiagnosticResult};
use amas_core::FailureReason;
use amas_kernels::linucb::linucb_update;
use amas_kernels::matrix::{add_outer, add_scaled, cholesky_decompose};
use amas_kernels::sanitize::{diagnose_model, needs_full_recompute, sanitize_covariance};
use ndarray::{Array1, Array2, Axis};
use tracing::debug;

#[derive(Debug, Clone, Copy, Default)]
pub struct NdarrayAccelerator;

impl NdarrayAccelerator {
    pub fn new() -> Self {
        Self
    }
}

fn numeric(e: impl std::fmt::Display) -> FailureReason {
    FailureReason::Numeric(e.to_string())
}

fn check_shape(model: &BanditModel) -> Result<(), FailureReason> {
    let d = model.d;
    if d == 0 || model.l.len() != d * d || model.a.len() != d * d || model.b.len() != d {
        return Err(FailureReason::InvalidResult(format!(
            "model buffers do not match d = {d}"
        )));
    }
    Ok(())
}

fn factor(model: &BanditModel) -> Result<Array2<f64>, FailureReason> {
    Array2::from_shape_vec((model.d, model.d), model.l.clone()).map_err(numeric)
}

/// Solve `L·Y = R` for every column of `R` at once.
fn forward_solve(l: &Array2<f64>, mut rhs: Array2<f64>) -> Result<Array2<f64>, FailureReason> {
    let d = l.nrows();
    for i in 0..d {
        let pivot = l[[i, i]];
        if !(pivot > 0.0) {
            return Err(FailureReason::Numeric(format!("L[{i},{i}] = {pivot}")));
        }
        let (solved, mut rest) = rhs.view_mut().split_at(Axis(0), i);
        let mut row = rest.row_mut(0);
        for k in 0..i {
            let lik = l[[i, k]];
            if lik != 0.0 {
                row.scaled_add(-lik, &solved.row(k));
            }
        }
        row.mapv_inplace(|v| v / pivot);
    }
    Ok(rhs)
}

/// Solve `Lᵗ·Y = R` for every column of `R` at once.
fn backward_solve_transpose(
    l: &Array2<f64>,
    mut rhs: Array2<f64>,
) -> Result<Array2<f64>, FailureReason> {
    let d = l.nrows();
    for i in (0..d).rev() {
        let pivot = l[[i, i]];
        if !(pivot > 0.0) {
            return Err(FailureReason::Numeric(format!("L[{i},{i}] = {pivot}")));
        }
        let (mut head, solved) = rhs.view_mut().split_at(Axis(0), i + 1);
        let mut row = head.row_mut(i);
        for k in (i + 1)..d {
            let lki = l[[k, i]];
            if lki != 0.0 {
                row.scaled_add(-lki, &solved.row(k - i - 1));
            }
        }
        row.mapv_inplace(|v| v / pivot);
    }
    Ok(rhs)
}

impl AcceleratedBandit for NdarrayAccelerator {
    fn name(&self) -> &str {
        "ndarray_batched"
    }

    fn select(
        &self,
        model: &BanditModel,
        features: &FeatureBatch,
    ) -> Result<AcceleratedSelection, FailureReason> {
        check_shape(model)?;
        let d = model.d;
        if features.cols != d {
            return Err(FailureReason::InvalidResult(format!(
                "feature width {} does not match d = {d}",
                features.cols
            )));
        }
        if features.rows == 0 {
            return Err(FailureReason::InvalidResult("no candidates".into()));
        }

        let l = factor(model)?;
        let x = Array2::from_shape_vec((features.rows, d), features.data.clone()).map_err(numeric)?;
        let b = Array2::from_shape_vec((d, 1), model.b.clone()).map_err(numeric)?;

        let z = forward_solve(&l, b)?;
        let theta = backward_solve_transpose(&l, z)?;
        let exploitation: Array1<f64> = x.dot(&theta.column(0));

        let widths = forward_solve(&l, x.t().to_owned())?;
        let exploration: Array1<f64> =
            widths.map_axis(Axis(0), |col| model.alpha * col.dot(&col).sqrt());

        let scores = &exploitation + &exploration;
        if scores.iter().any(|s| !s.is_finite()) {
            return Err(FailureReason::Numeric("non-finite score".into()));
        }

        let mut best = 0;
        for (i, &s) in scores.iter().enumerate().skip(1) {
            if s > scores[best] {
                best = i;
            }
        }

        Ok(AcceleratedSelection {
            selected_index: best,
            exploitation: exploitation[best],
            exploration: exploration[best],
            scores: scores.to_vec(),
        })
    }

    fn update(
        &self,
        model: &BanditModel,
        x: &[f64],
        reward: f64,
    ) -> Result<BanditModel, FailureReason> {
        check_shape(model)?;
        let d = model.d;
        let mut next = model.clone();

        if needs_full_recompute(model.update_count, &model.l, d) {
            add_outer(&mut next.a, x, d);
            sanitize_covariance(&mut next.a, d, model.lambda);
            next.l = cholesky_decompose(&next.a, d, 0.0).map_err(numeric)?;
            add_scaled(&mut next.b, x, reward);
            debug!(update_count = model.update_count, "accelerated path refactorized");
        } else {
            linucb_update(&mut next.a, &mut next.b, &mut next.l, d, x, reward).map_err(numeric)?;
        }

        next.update_count += 1;
        Ok(next)
    }

    fn diagnose(&self, model: &BanditModel) -> Result<DiagnosticResult, FailureReason> {
        check_shape(model)?;
        Ok(diagnose_model(&model.a, &model.l, model.d))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use amas_kernels::linucb::linucb_select;

    fn trained_model() -> BanditModel {
        let mut m = BanditModel::new(3, 1.0, 0.7);
        let acc = NdarrayAccelerator::new();
        let samples = [
            (vec![1.0, 0.2, 0.0], 1.0),
            (vec![0.0, 1.0, 0.5], -0.5),
            (vec![0.3, 0.3, 0.3], 0.8),
        ];
        for (x, r) in samples {
            m = acc.update(&m, &x, r).unwrap();
        }
        m
    }

    #[test]
    fn test_select_matches_reference_scoring() {
        let model = trained_model();
        let rows = vec![
            vec![1.0, 0.0, 0.0],
            vec![0.0, 1.0, 0.0],
            vec![0.2, 0.4, 0.9],
            vec![0.5, 0.5, 0.5],
        ];
        let batch = FeatureBatch::from_rows(&rows, 3);
        let fast = NdarrayAccelerator::new().select(&model, &batch).unwrap();
        let reference = linucb_select(&model.l, &model.b, model.alpha, 3, &rows).unwrap();

        assert_eq!(fast.selected_index, reference.best_index);
        for (a, b) in fast.scores.iter().zip(&reference.scores) {
            assert!((a - b).abs() < 1e-9, "{a} vs {b}");
        }
        assert!((fast.exploration - reference.exploration).abs() < 1e-9);
    }

    #[test]
    fn test_update_counts_and_keeps_factor_consistent() {
        let model = trained_model();
        assert_eq!(model.update_count, 3);
        assert!(model.validate().is_ok());

        let d = model.d;
        for i in 0..d {
            for j in 0..d {
                let llt: f64 = (0..d).map(|k| model.l[i * d + k] * model.l[j * d + k]).sum();
                assert!((llt - model.a[i * d + j]).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_width_mismatch_is_a_failure() {
        let model = BanditModel::new(3, 1.0, 0.3);
        let batch = FeatureBatch::from_rows(&[vec![1.0, 0.0]], 2);
        let err = NdarrayAccelerator::new().select(&model, &batch).unwrap_err();
        assert_eq!(err.label(), "invalid_result");
    }

    #[test]
    fn test_collapsed_factor_is_numeric_failure() {
        let mut model = BanditModel::new(2, 1.0, 0.3);
        model.l[3] = 0.0;
        let batch = FeatureBatch::from_rows(&[vec![1.0, 1.0]], 2);
        let err = NdarrayAccelerator::new().select(&model, &batch).unwrap_err();
        assert_eq!(err.label(), "numeric");
    }

    #[test]
    fn test_diagnose_fresh_model_is_healthy() {
        let report = NdarrayAccelerator::new()
            .diagnose(&BanditModel::new(4, 1.0, 0.3))
            .unwrap();
        assert!(report.is_healthy);
    }
}
