//! Dense linear algebra on flat row-major `d × d` buffers.

use amas_core::types::{EPSILON, MIN_RANK1_DIAG};

use crate::error::{check_finite, check_len, KernelError, KernelResult};

/// Cholesky factor `L` of `(A + Aᵗ)/2 + λI`.
///
/// Fails on the first pivot that is not strictly positive instead of patching
/// it, so a caller never receives a degenerate factor.
pub fn cholesky_decompose(a: &[f64], d: usize, lambda: f64) -> KernelResult<Vec<f64>> {
    check_len("A", a, d * d)?;
    check_finite("A", a)?;
    if !lambda.is_finite() {
        return Err(KernelError::NonFinite("lambda"));
    }
    let lambda = lambda.max(0.0);

    let mut work = vec![0.0; d * d];
    for i in 0..d {
        for j in 0..d {
            work[i * d + j] = 0.5 * (a[i * d + j] + a[j * d + i]);
        }
        work[i * d + i] += lambda;
    }

    let mut l = vec![0.0; d * d];
    for j in 0..d {
        let mut pivot = work[j * d + j];
        for k in 0..j {
            pivot -= l[j * d + k] * l[j * d + k];
        }
        // NaN pivots fail here too.
        if !(pivot > 0.0) {
            return Err(KernelError::NotPositiveDefinite { index: j });
        }
        let diag = pivot.sqrt();
        l[j * d + j] = diag;

        for i in (j + 1)..d {
            let mut sum = work[i * d + j];
            for k in 0..j {
                sum -= l[i * d + k] * l[j * d + k];
            }
            l[i * d + j] = sum / diag;
        }
    }

    Ok(l)
}

/// Givens-rotation rank-1 update: returns `L'` with `L'L'ᵗ = LLᵗ + xxᵗ`.
///
/// Only the lower triangle is touched. `min_diag` is floored at
/// [`MIN_RANK1_DIAG`]; any diagonal falling under it aborts the update and
/// the caller keeps `L`.
pub fn cholesky_rank1_update(
    l: &[f64],
    x: &[f64],
    d: usize,
    min_diag: f64,
) -> KernelResult<Vec<f64>> {
    check_len("L", l, d * d)?;
    check_len("x", x, d)?;
    check_finite("x", x)?;
    let min_diag = if min_diag.is_finite() {
        min_diag.max(MIN_RANK1_DIAG)
    } else {
        MIN_RANK1_DIAG
    };

    let mut out = l.to_vec();
    let mut work = x.to_vec();

    for k in 0..d {
        let l_kk = out[k * d + k];
        let x_k = work[k];
        let r = (l_kk * l_kk + x_k * x_k).sqrt();
        if !(r >= min_diag) {
            return Err(KernelError::Rank1Collapse { index: k, min_diag });
        }

        let c = l_kk / r;
        let s = x_k / r;
        out[k * d + k] = r;

        for i in (k + 1)..d {
            let l_ik = out[i * d + k];
            let x_i = work[i];
            out[i * d + k] = c * l_ik + s * x_i;
            work[i] = c * x_i - s * l_ik;
        }
    }

    if out.iter().any(|v| !v.is_finite()) {
        return Err(KernelError::NonFinite("L"));
    }
    Ok(out)
}

/// Forward substitution: solve `L y = b`.
pub fn solve_lower(l: &[f64], b: &[f64], d: usize) -> Vec<f64> {
    let mut y = vec![0.0; d];
    for i in 0..d {
        let mut sum = b[i];
        for j in 0..i {
            sum -= l[i * d + j] * y[j];
        }
        let diag = l[i * d + i];
        y[i] = if diag.abs() > EPSILON { sum / diag } else { 0.0 };
    }
    y
}

/// Back substitution against the transpose: solve `Lᵗ x = y`.
pub fn solve_upper_transpose(l: &[f64], y: &[f64], d: usize) -> Vec<f64> {
    let mut x = vec![0.0; d];
    for i in (0..d).rev() {
        let mut sum = y[i];
        for j in (i + 1)..d {
            sum -= l[j * d + i] * x[j];
        }
        let diag = l[i * d + i];
        x[i] = if diag.abs() > EPSILON { sum / diag } else { 0.0 };
    }
    x
}

/// Solve `A x = b` given `A = L Lᵗ`.
pub fn solve_cholesky(l: &[f64], b: &[f64], d: usize) -> Vec<f64> {
    let y = solve_lower(l, b, d);
    solve_upper_transpose(l, &y, d)
}

/// `xᵗ A⁻¹ x = ‖L⁻¹x‖²`.
pub fn quadratic_form(l: &[f64], x: &[f64], d: usize) -> f64 {
    solve_lower(l, x, d).iter().map(|v| v * v).sum()
}

pub fn dot(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// `A += x xᵗ`
pub fn add_outer(a: &mut [f64], x: &[f64], d: usize) {
    for i in 0..d {
        for j in 0..d {
            a[i * d + j] += x[i] * x[j];
        }
    }
}

/// `a += scale · b`
pub fn add_scaled(a: &mut [f64], b: &[f64], scale: f64) {
    for (ai, bi) in a.iter_mut().zip(b) {
        *ai += scale * bi;
    }
}

/// `L Lᵗ`, mostly for verification.
pub fn multiply_lower_transpose(l: &[f64], d: usize) -> Vec<f64> {
    let mut out = vec![0.0; d * d];
    for i in 0..d {
        for j in 0..d {
            let mut sum = 0.0;
            for k in 0..=i.min(j) {
                sum += l[i * d + k] * l[j * d + k];
            }
            out[i * d + j] = sum;
        }
    }
    out
}
