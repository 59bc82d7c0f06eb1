//! Input scrubbing and model health checks.

use amas_core::types::{
    DiagnosticResult, CHOLESKY_RECOMPUTE_INTERVAL, EPSILON, MAX_COVARIANCE, MAX_FEATURE_ABS,
    MIN_LAMBDA, MIN_RANK1_DIAG,
};

/// Above this `max/min` ratio of `L`'s diagonal the factor is rebuilt.
const RECOMPUTE_DIAG_RATIO: f64 = 1e8;
/// Squared diagonal ratio at which a model stops being reported healthy.
const UNHEALTHY_CONDITION: f64 = 1e12;

pub fn has_invalid_values(buf: &[f64]) -> bool {
    buf.iter().any(|v| !v.is_finite())
}

/// Non-finite entries become 0, finite ones are clamped to `±MAX_FEATURE_ABS`.
pub fn sanitize_feature_vector(x: &mut [f64]) {
    for v in x.iter_mut() {
        *v = if v.is_finite() {
            v.clamp(-MAX_FEATURE_ABS, MAX_FEATURE_ABS)
        } else {
            0.0
        };
    }
}

/// Repair a covariance matrix in place before a full refactorization.
///
/// Non-finite diagonals become `λ`, non-finite off-diagonals `0`, magnitudes
/// are capped at `MAX_COVARIANCE`, the diagonal is floored at `λ` and the
/// result is symmetrized.
pub fn sanitize_covariance(a: &mut [f64], d: usize, lambda: f64) {
    let floor = if lambda.is_finite() {
        lambda.max(MIN_LAMBDA)
    } else {
        MIN_LAMBDA
    };

    for i in 0..d {
        for j in 0..d {
            let v = &mut a[i * d + j];
            if !v.is_finite() {
                *v = if i == j { floor } else { 0.0 };
            } else if v.abs() > MAX_COVARIANCE {
                *v = v.signum() * MAX_COVARIANCE;
            }
        }
        if a[i * d + i] < floor {
            a[i * d + i] = floor;
        }
    }

    for i in 0..d {
        for j in (i + 1)..d {
            let mean = 0.5 * (a[i * d + j] + a[j * d + i]);
            a[i * d + j] = mean;
            a[j * d + i] = mean;
        }
    }
}

/// Whether the incremental factor should be replaced by a fresh decomposition.
///
/// True on every `CHOLESKY_RECOMPUTE_INTERVAL`-th accepted update, when a
/// diagonal entry of `L` is non-finite or under the floor, or when the
/// diagonal spread suggests the factor has drifted.
pub fn needs_full_recompute(update_count: u64, l: &[f64], d: usize) -> bool {
    if update_count > 0 && update_count % CHOLESKY_RECOMPUTE_INTERVAL == 0 {
        return true;
    }

    let mut min_diag = f64::MAX;
    let mut max_diag = 0.0_f64;
    for i in 0..d {
        let diag = l[i * d + i];
        if !diag.is_finite() || diag < MIN_RANK1_DIAG {
            return true;
        }
        min_diag = min_diag.min(diag);
        max_diag = max_diag.max(diag);
    }

    d > 0 && max_diag / min_diag > RECOMPUTE_DIAG_RATIO
}

/// Health report for `(A, L)`.
///
/// The condition number is estimated as `(max diag L / min diag L)²`; `min`
/// and `max` only consider finite positive diagonals and report 0 when none
/// exist.
pub fn diagnose_model(a: &[f64], l: &[f64], d: usize) -> DiagnosticResult {
    let mut has_nan = a.iter().any(|v| v.is_nan());
    let mut has_inf = a.iter().any(|v| v.is_infinite());
    let mut min_diag = f64::MAX;
    let mut max_diag = f64::MIN;

    for i in 0..d {
        let diag = l[i * d + i];
        has_nan |= diag.is_nan();
        has_inf |= diag.is_infinite();
        if diag.is_finite() && diag > 0.0 {
            min_diag = min_diag.min(diag);
            max_diag = max_diag.max(diag);
        }
    }

    let condition_number = if min_diag > EPSILON && min_diag != f64::MAX {
        (max_diag / min_diag).powi(2)
    } else {
        f64::MAX
    };
    let is_healthy = !has_nan && !has_inf && condition_number < UNHEALTHY_CONDITION;

    let message = if is_healthy {
        "Model is healthy".to_string()
    } else if has_nan {
        "Model contains NaN values".to_string()
    } else if has_inf {
        "Model contains infinite values".to_string()
    } else {
        format!("Model has high condition number: {condition_number:.2e}")
    };

    DiagnosticResult {
        is_healthy,
        has_nan,
        has_inf,
        condition_number,
        min_diagonal: if min_diag == f64::MAX { 0.0 } else { min_diag },
        max_diagonal: if max_diag == f64::MIN { 0.0 } else { max_diag },
        message,
    }
}
