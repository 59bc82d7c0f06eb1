//! LinUCB scoring and the transactional model update.

use amas_core::types::{confidence_from_exploration, MIN_RANK1_DIAG};
use serde::{Deserialize, Serialize};

use crate::error::{check_finite, check_len, KernelError, KernelResult};
use crate::matrix::{add_outer, add_scaled, cholesky_rank1_update, dot, solve_cholesky, solve_lower};

/// Per-candidate decomposition of the UCB score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UcbStats {
    pub exploitation: f64,
    pub exploration: f64,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectOutcome {
    pub best_index: usize,
    pub score: f64,
    pub exploitation: f64,
    pub exploration: f64,
    pub confidence: f64,
    pub scores: Vec<f64>,
}

/// `θ = A⁻¹ b` through the factor.
pub fn theta(l: &[f64], b: &[f64], d: usize) -> Vec<f64> {
    solve_cholesky(l, b, d)
}

/// Score one candidate against a precomputed `θ`.
pub fn ucb_stats(l: &[f64], theta: &[f64], alpha: f64, d: usize, x: &[f64]) -> UcbStats {
    let exploitation = dot(theta, x);
    let width: f64 = solve_lower(l, x, d).iter().map(|v| v * v).sum::<f64>().sqrt();
    let exploration = alpha * width;
    UcbStats {
        exploitation,
        exploration,
        score: exploitation + exploration,
    }
}

/// Score every candidate and return the argmax. Ties keep the lowest index.
///
/// Candidates must already be `d` long and finite; the caller decides how
/// malformed input is handled.
pub fn linucb_select(
    l: &[f64],
    b: &[f64],
    alpha: f64,
    d: usize,
    features: &[Vec<f64>],
) -> KernelResult<SelectOutcome> {
    if features.is_empty() {
        return Err(KernelError::EmptyCandidates);
    }
    check_len("L", l, d * d)?;
    check_len("b", b, d)?;
    if !alpha.is_finite() {
        return Err(KernelError::NonFinite("alpha"));
    }
    for x in features {
        check_len("x", x, d)?;
        check_finite("x", x)?;
    }

    let theta = theta(l, b, d);
    let stats: Vec<UcbStats> = features
        .iter()
        .map(|x| ucb_stats(l, &theta, alpha, d, x))
        .collect();

    let mut best = 0;
    for (i, s) in stats.iter().enumerate().skip(1) {
        if s.score > stats[best].score {
            best = i;
        }
    }
    let chosen = stats[best];

    Ok(SelectOutcome {
        best_index: best,
        score: chosen.score,
        exploitation: chosen.exploitation,
        exploration: chosen.exploration,
        confidence: confidence_from_exploration(chosen.exploration),
        scores: stats.iter().map(|s| s.score).collect(),
    })
}

/// Apply one observation: `A += xxᵗ`, `b += r·x`, `L ← rank1(L, x)`.
///
/// All-or-nothing: the new factor is computed before anything is written, so
/// on error `A`, `b` and `L` are exactly as they were.
pub fn linucb_update(
    a: &mut [f64],
    b: &mut [f64],
    l: &mut [f64],
    d: usize,
    x: &[f64],
    reward: f64,
) -> KernelResult<()> {
    check_len("A", a, d * d)?;
    check_len("b", b, d)?;
    check_len("x", x, d)?;
    check_finite("x", x)?;
    if !reward.is_finite() {
        return Err(KernelError::NonFinite("reward"));
    }

    let new_l = cholesky_rank1_update(l, x, d, MIN_RANK1_DIAG)?;

    add_outer(a, x, d);
    add_scaled(b, x, reward);
    l.copy_from_slice(&new_l);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::{cholesky_decompose, multiply_lower_transpose};

    fn identity(d: usize) -> Vec<f64> {
        let mut m = vec![0.0; d * d];
        for i in 0..d {
            m[i * d + i] = 1.0;
        }
        m
    }

    #[test]
    fn test_select_prefers_aligned_candidate() {
        let l = identity(2);
        let b = vec![1.0, 0.0];
        let features = vec![vec![1.0, 0.0], vec![0.0, 1.0]];

        let out = linucb_select(&l, &b, 0.1, 2, &features).unwrap();
        assert_eq!(out.best_index, 0);
        assert!(out.exploitation > 0.0);
        assert!((out.score - 1.1).abs() < 1e-12);
        assert_eq!(out.scores.len(), 2);
        assert!(out.confidence > 0.0 && out.confidence < 1.0);
        assert!((out.confidence - 0.1_f64.tanh()).abs() < 1e-12);
    }

    #[test]
    fn test_select_unit_alpha_scores() {
        let l = identity(2);
        let b = vec![1.0, 0.0];
        let features = vec![vec![1.0, 0.0], vec![0.0, 1.0]];

        let out = linucb_select(&l, &b, 1.0, 2, &features).unwrap();
        assert_eq!(out.best_index, 0);
        assert!((out.score - 2.0).abs() < 1e-12);
        assert!((out.exploitation - 1.0).abs() < 1e-12);
        assert!((out.exploration - 1.0).abs() < 1e-12);
        assert!((out.scores[1] - 1.0).abs() < 1e-12);
        assert!((out.confidence - 1.0_f64.tanh()).abs() < 1e-12);
    }

    #[test]
    fn test_exploitation_monotone_in_alignment() {
        let l = identity(2);
        let b = vec![1.0, 0.0];
        let theta = theta(&l, &b, 2);
        let mut last = f64::NEG_INFINITY;
        for t in [0.0, 0.25, 0.5, 0.75, 1.0] {
            let x = [t, 1.0 - t];
            let s = ucb_stats(&l, &theta, 0.0, 2, &x);
            assert!(s.exploitation >= last);
            last = s.exploitation;
        }
    }

    #[test]
    fn test_ties_pick_first_candidate() {
        let l = identity(2);
        let b = vec![0.0, 0.0];
        let features = vec![vec![0.5, 0.5], vec![0.5, 0.5], vec![0.5, 0.5]];
        let out = linucb_select(&l, &b, 1.0, 2, &features).unwrap();
        assert_eq!(out.best_index, 0);

        // Different candidates with equal scores.
        let swapped = vec![vec![0.0, 1.0], vec![1.0, 0.0]];
        let out = linucb_select(&l, &b, 1.0, 2, &swapped).unwrap();
        assert_eq!(out.scores[0], out.scores[1]);
        assert_eq!(out.best_index, 0);
    }

    #[test]
    fn test_select_rejects_bad_candidates() {
        let l = identity(2);
        let b = vec![0.0, 0.0];
        assert_eq!(
            linucb_select(&l, &b, 0.3, 2, &[]),
            Err(KernelError::EmptyCandidates)
        );
        assert!(linucb_select(&l, &b, 0.3, 2, &[vec![1.0]]).is_err());
        assert!(linucb_select(&l, &b, 0.3, 2, &[vec![f64::NAN, 0.0]]).is_err());
    }

    #[test]
    fn test_update_accumulates_statistics() {
        let d = 2;
        let mut a = identity(d);
        let mut b = vec![0.0; d];
        let mut l = identity(d);

        linucb_update(&mut a, &mut b, &mut l, d, &[1.0, 0.0], 1.0).unwrap();
        linucb_update(&mut a, &mut b, &mut l, d, &[0.0, 1.0], -0.5).unwrap();

        assert!((b[0] - 1.0).abs() < 1e-12);
        assert!((b[1] + 0.5).abs() < 1e-12);
        assert!((a[0] - 2.0).abs() < 1e-12);
        assert!((a[3] - 2.0).abs() < 1e-12);

        let rebuilt = multiply_lower_transpose(&l, d);
        for (x, y) in rebuilt.iter().zip(&a) {
            assert!((x - y).abs() < 1e-9);
        }
    }

    #[test]
    fn test_update_is_transactional() {
        let d = 2;
        let mut a = identity(d);
        let mut b = vec![0.0; d];
        let mut l = cholesky_decompose(&a, d, 0.0).unwrap();
        let snapshot = (a.clone(), b.clone(), l.clone());

        assert!(linucb_update(&mut a, &mut b, &mut l, d, &[f64::NAN, 1.0], 1.0).is_err());
        assert!(linucb_update(&mut a, &mut b, &mut l, d, &[1.0, 1.0], f64::INFINITY).is_err());
        assert!(linucb_update(&mut a, &mut b, &mut l, d, &[1.0], 1.0).is_err());

        // Collapsed factor: rank-1 fails and nothing is written.
        let mut bad_l = vec![1e-9, 0.0, 0.0, 1.0];
        let err = linucb_update(&mut a, &mut b, &mut bad_l, d, &[0.0, 1.0], 1.0);
        assert!(matches!(err, Err(KernelError::Rank1Collapse { index: 0, .. })));

        assert_eq!((a, b, l), snapshot);
        assert_eq!(bad_l, vec![1e-9, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_zero_vector_update_leaves_buffers() {
        let d = 2;
        let mut a = identity(d);
        let mut b = vec![0.3, 0.1];
        let mut l = identity(d);
        linucb_update(&mut a, &mut b, &mut l, d, &[0.0, 0.0], 1.0).unwrap();
        assert_eq!(a, identity(d));
        assert_eq!(b, vec![0.3, 0.1]);
        assert_eq!(l, identity(d));
    }
}
