//! GP-UCB suggestions over a bounded, optionally stepped parameter box.
//!
//! Coordinates are normalized to `[0, 1]` per dimension before the squared
//! exponential kernel is applied, so `length_scale` is unit-free. Targets are
//! centered on their mean and the observation noise, floored by a small
//! jitter, is passed to the Cholesky decomposition as its diagonal regularizer.

use ndarray::{Array1, Array2};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{KernelError, KernelResult};
use crate::matrix::{cholesky_decompose, solve_cholesky, solve_lower};

/// Uniform candidates drawn over the whole box.
const RANDOM_CANDIDATES: usize = 256;
/// Best observations used as centers for local search.
const LOCAL_ANCHORS: usize = 5;
const PERTURBATIONS_PER_ANCHOR: usize = 16;
/// Half-width of a local perturbation, in normalized units.
const LOCAL_RADIUS: f64 = 0.1;
/// Diagonal jitter relative to `output_variance`; keeps the Gram matrix
/// positive definite with zero noise and repeated points.
const GRAM_JITTER: f64 = 1e-8;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParamBound {
    pub min: f64,
    pub max: f64,
    #[serde(default)]
    pub step: Option<f64>,
}

impl ParamBound {
    pub fn new(min: f64, max: f64) -> Self {
        Self {
            min,
            max,
            step: None,
        }
    }

    pub fn with_step(mut self, step: f64) -> Self {
        self.step = Some(step);
        self
    }

    fn span(&self) -> f64 {
        self.max - self.min
    }

    fn normalize(&self, v: f64) -> f64 {
        let span = self.span();
        if span > 0.0 {
            (v - self.min) / span
        } else {
            0.0
        }
    }

    fn denormalize(&self, u: f64) -> f64 {
        self.min + u.clamp(0.0, 1.0) * self.span()
    }

    /// Round to the nearest step from `min`, then clamp into the box.
    pub fn snap(&self, v: f64) -> f64 {
        let snapped = match self.step {
            Some(step) if step > 0.0 => self.min + ((v - self.min) / step).round() * step,
            _ => v,
        };
        snapped.clamp(self.min, self.max)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub params: Vec<f64>,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GpHyper {
    pub length_scale: f64,
    pub output_variance: f64,
    pub noise_variance: f64,
}

impl Default for GpHyper {
    fn default() -> Self {
        Self {
            length_scale: 0.25,
            output_variance: 1.0,
            noise_variance: 1e-3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Suggestion {
    pub params: Vec<f64>,
    pub acquisition: f64,
    pub mean: f64,
    pub std_dev: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizeOutcome {
    pub suggestions: Vec<Suggestion>,
    pub best: Option<Observation>,
}

/// Fitted posterior over normalized coordinates.
struct GpPosterior<'a> {
    hyper: &'a GpHyper,
    inputs: Array2<f64>,
    l: Vec<f64>,
    weights: Vec<f64>,
    y_mean: f64,
}

impl<'a> GpPosterior<'a> {
    fn fit(inputs: Array2<f64>, targets: &[f64], hyper: &'a GpHyper) -> KernelResult<Self> {
        let n = inputs.nrows();
        let y_mean = targets.iter().sum::<f64>() / n as f64;
        let centered: Vec<f64> = targets.iter().map(|y| y - y_mean).collect();

        let gram = Array2::from_shape_fn((n, n), |(i, j)| {
            se_kernel(hyper, &inputs.row(i).to_owned(), &inputs.row(j).to_owned())
        });
        let regularizer = hyper.noise_variance + GRAM_JITTER * hyper.output_variance;
        let l = cholesky_decompose(&gram.into_raw_vec(), n, regularizer)?;
        let weights = solve_cholesky(&l, &centered, n);

        Ok(Self {
            hyper,
            inputs,
            l,
            weights,
            y_mean,
        })
    }

    /// Posterior `(mean, std)` at a normalized point.
    fn predict(&self, u: &Array1<f64>) -> (f64, f64) {
        let n = self.inputs.nrows();
        let k_star: Vec<f64> = (0..n)
            .map(|i| se_kernel(self.hyper, &self.inputs.row(i).to_owned(), u))
            .collect();
        let mean = self.y_mean
            + k_star
                .iter()
                .zip(&self.weights)
                .map(|(k, w)| k * w)
                .sum::<f64>();
        let v = solve_lower(&self.l, &k_star, n);
        let variance = (self.hyper.output_variance - v.iter().map(|x| x * x).sum::<f64>()).max(0.0);
        (mean, variance.sqrt())
    }
}

fn se_kernel(hyper: &GpHyper, a: &Array1<f64>, b: &Array1<f64>) -> f64 {
    let diff = a - b;
    let sq = diff.dot(&diff);
    let ls = hyper.length_scale;
    hyper.output_variance * (-sq / (2.0 * ls * ls)).exp()
}

fn validate(observations: &[Observation], bounds: &[ParamBound], hyper: &GpHyper) -> KernelResult<()> {
    if bounds.is_empty() {
        return Err(KernelError::InvalidBounds("no dimensions".into()));
    }
    for (i, bound) in bounds.iter().enumerate() {
        if !bound.min.is_finite() || !bound.max.is_finite() || bound.min > bound.max {
            return Err(KernelError::InvalidBounds(format!(
                "dimension {i}: [{}, {}]",
                bound.min, bound.max
            )));
        }
        if let Some(step) = bound.step {
            if !(step > 0.0) || !step.is_finite() {
                return Err(KernelError::InvalidBounds(format!("dimension {i}: step {step}")));
            }
        }
    }
    let hyper_ok = [hyper.length_scale, hyper.output_variance]
        .iter()
        .all(|v| v.is_finite() && *v > 0.0)
        && hyper.noise_variance.is_finite()
        && hyper.noise_variance >= 0.0;
    if !hyper_ok {
        return Err(KernelError::InvalidBounds(format!("hyperparameters {hyper:?}")));
    }
    for obs in observations {
        if obs.params.len() != bounds.len() {
            return Err(KernelError::Length {
                what: "params",
                expected: bounds.len(),
                got: obs.params.len(),
            });
        }
        if !obs.value.is_finite() || obs.params.iter().any(|p| !p.is_finite()) {
            return Err(KernelError::NonFinite("observation"));
        }
    }
    Ok(())
}

fn random_point<R: Rng>(bounds: &[ParamBound], rng: &mut R) -> Array1<f64> {
    Array1::from_iter(bounds.iter().map(|_| rng.gen::<f64>()))
}

fn to_params(bounds: &[ParamBound], u: &Array1<f64>) -> Vec<f64> {
    bounds
        .iter()
        .zip(u.iter())
        .map(|(bound, &ui)| bound.snap(bound.denormalize(ui)))
        .collect()
}

fn normalize_params(bounds: &[ParamBound], params: &[f64]) -> Array1<f64> {
    Array1::from_iter(bounds.iter().zip(params).map(|(b, &p)| b.normalize(p)))
}

/// Next point to evaluate, maximizing `mean + beta·std`.
///
/// With fewer than two observations the point is uniform random over the box
/// with acquisition `1.0`.
pub fn bayesian_suggest<R: Rng>(
    observations: &[Observation],
    bounds: &[ParamBound],
    hyper: &GpHyper,
    beta: f64,
    rng: &mut R,
) -> KernelResult<Suggestion> {
    validate(observations, bounds, hyper)?;
    if !beta.is_finite() {
        return Err(KernelError::NonFinite("beta"));
    }

    if observations.len() < 2 {
        let u = random_point(bounds, rng);
        return Ok(Suggestion {
            params: to_params(bounds, &u),
            acquisition: 1.0,
            mean: 0.0,
            std_dev: hyper.output_variance.sqrt(),
        });
    }

    let dims = bounds.len();
    let n = observations.len();
    let inputs = Array2::from_shape_fn((n, dims), |(i, j)| {
        bounds[j].normalize(observations[i].params[j])
    });
    let targets: Vec<f64> = observations.iter().map(|o| o.value).collect();
    let posterior = GpPosterior::fit(inputs, &targets, hyper)?;

    let mut candidates: Vec<Array1<f64>> = (0..RANDOM_CANDIDATES)
        .map(|_| random_point(bounds, rng))
        .collect();

    let mut ranked: Vec<&Observation> = observations.iter().collect();
    ranked.sort_by(|a, b| b.value.total_cmp(&a.value));
    for anchor in ranked.into_iter().take(LOCAL_ANCHORS) {
        let center = normalize_params(bounds, &anchor.params);
        for _ in 0..PERTURBATIONS_PER_ANCHOR {
            let candidate = center.mapv(|c| {
                (c + rng.gen_range(-LOCAL_RADIUS..=LOCAL_RADIUS)).clamp(0.0, 1.0)
            });
            candidates.push(candidate);
        }
    }

    let mut best: Option<Suggestion> = None;
    for u in &candidates {
        // Score the point that will actually be returned.
        let params = to_params(bounds, u);
        let (mean, std_dev) = posterior.predict(&normalize_params(bounds, &params));
        let acquisition = mean + beta * std_dev;
        if best.as_ref().map_or(true, |b| acquisition > b.acquisition) {
            best = Some(Suggestion {
                params,
                acquisition,
                mean,
                std_dev,
            });
        }
    }

    best.ok_or(KernelError::EmptyCandidates)
}

/// A batch of `batch_size` suggestions plus the best observation so far.
///
/// Batches use the kriging-believer heuristic: each pick is appended as a
/// pseudo-observation at its posterior mean before the next one is chosen.
/// Picks made without a fitted posterior are not appended.
pub fn bayesian_optimize<R: Rng>(
    observations: &[Observation],
    bounds: &[ParamBound],
    hyper: &GpHyper,
    beta: f64,
    batch_size: usize,
    rng: &mut R,
) -> KernelResult<OptimizeOutcome> {
    validate(observations, bounds, hyper)?;

    let mut believed = observations.to_vec();
    let mut suggestions = Vec::with_capacity(batch_size);
    for _ in 0..batch_size {
        let fitted = believed.len() >= 2;
        let suggestion = bayesian_suggest(&believed, bounds, hyper, beta, rng)?;
        if fitted {
            believed.push(Observation {
                params: suggestion.params.clone(),
                value: suggestion.mean,
            });
        }
        suggestions.push(suggestion);
    }

    let best = observations
        .iter()
        .fold(None::<&Observation>, |best, o| match best {
            Some(b) if b.value >= o.value => Some(b),
            _ => Some(o),
        })
        .cloned();

    Ok(OptimizeOutcome { suggestions, best })
}
