//! Self-contained kernel jobs for worker threads.
//!
//! A task owns copies of every buffer it reads, so it can cross a thread
//! boundary and be abandoned without touching caller state. Serialized as
//! `{"type": <kind>, "payload": {...}}`; results as `{"type": <kind>,
//! "result": {"success": .., ...}}`.

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::bayesian::{
    bayesian_optimize, bayesian_suggest, GpHyper, Observation, OptimizeOutcome, ParamBound,
    Suggestion,
};
use crate::error::KernelResult;
use crate::linucb::{linucb_select, linucb_update, SelectOutcome};
use crate::matrix::{cholesky_decompose, cholesky_rank1_update};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum KernelTask {
    LinucbSelect(LinucbSelectPayload),
    LinucbUpdate(LinucbUpdatePayload),
    BayesianSuggest(BayesianSuggestPayload),
    BayesianOptimize(BayesianOptimizePayload),
    CholeskyDecompose(CholeskyDecomposePayload),
    CholeskyRank1Update(CholeskyRank1Payload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinucbSelectPayload {
    #[serde(rename = "L")]
    pub l: Vec<f64>,
    pub b: Vec<f64>,
    pub alpha: f64,
    pub d: usize,
    pub features: Vec<Vec<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinucbUpdatePayload {
    #[serde(rename = "A")]
    pub a: Vec<f64>,
    pub b: Vec<f64>,
    #[serde(rename = "L")]
    pub l: Vec<f64>,
    pub d: usize,
    pub x: Vec<f64>,
    pub reward: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BayesianSuggestPayload {
    pub observations: Vec<Observation>,
    pub bounds: Vec<ParamBound>,
    #[serde(default)]
    pub hyper: GpHyper,
    pub beta: f64,
    #[serde(default)]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BayesianOptimizePayload {
    pub observations: Vec<Observation>,
    pub bounds: Vec<ParamBound>,
    #[serde(default)]
    pub hyper: GpHyper,
    pub beta: f64,
    pub batch_size: usize,
    #[serde(default)]
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CholeskyDecomposePayload {
    #[serde(rename = "A")]
    pub a: Vec<f64>,
    pub d: usize,
    pub lambda: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CholeskyRank1Payload {
    #[serde(rename = "L")]
    pub l: Vec<f64>,
    pub x: Vec<f64>,
    pub d: usize,
    pub min_diag: f64,
}

/// LinUCB buffers after an accepted update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatedBuffers {
    #[serde(rename = "A")]
    pub a: Vec<f64>,
    pub b: Vec<f64>,
    #[serde(rename = "L")]
    pub l: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Factor {
    #[serde(rename = "L")]
    pub l: Vec<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult<T> {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<T>,
}

impl<T> From<KernelResult<T>> for TaskResult<T> {
    fn from(result: KernelResult<T>) -> Self {
        match result {
            Ok(value) => Self {
                success: true,
                error: None,
                value: Some(value),
            },
            Err(e) => Self {
                success: false,
                error: Some(e.to_string()),
                value: None,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "result", rename_all = "snake_case")]
pub enum KernelOutput {
    LinucbSelect(TaskResult<SelectOutcome>),
    LinucbUpdate(TaskResult<UpdatedBuffers>),
    BayesianSuggest(TaskResult<Suggestion>),
    BayesianOptimize(TaskResult<OptimizeOutcome>),
    CholeskyDecompose(TaskResult<Factor>),
    CholeskyRank1Update(TaskResult<Factor>),
}

impl KernelOutput {
    pub fn success(&self) -> bool {
        match self {
            KernelOutput::LinucbSelect(r) => r.success,
            KernelOutput::LinucbUpdate(r) => r.success,
            KernelOutput::BayesianSuggest(r) => r.success,
            KernelOutput::BayesianOptimize(r) => r.success,
            KernelOutput::CholeskyDecompose(r) => r.success,
            KernelOutput::CholeskyRank1Update(r) => r.success,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            KernelOutput::LinucbSelect(r) => r.error.as_deref(),
            KernelOutput::LinucbUpdate(r) => r.error.as_deref(),
            KernelOutput::BayesianSuggest(r) => r.error.as_deref(),
            KernelOutput::BayesianOptimize(r) => r.error.as_deref(),
            KernelOutput::CholeskyDecompose(r) => r.error.as_deref(),
            KernelOutput::CholeskyRank1Update(r) => r.error.as_deref(),
        }
    }
}

fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    }
}

impl KernelTask {
    pub fn kind(&self) -> &'static str {
        match self {
            KernelTask::LinucbSelect(_) => "linucb_select",
            KernelTask::LinucbUpdate(_) => "linucb_update",
            KernelTask::BayesianSuggest(_) => "bayesian_suggest",
            KernelTask::BayesianOptimize(_) => "bayesian_optimize",
            KernelTask::CholeskyDecompose(_) => "cholesky_decompose",
            KernelTask::CholeskyRank1Update(_) => "cholesky_rank1_update",
        }
    }

    /// Problem size used for the inline-vs-offload decision.
    pub fn dimension(&self) -> usize {
        match self {
            KernelTask::LinucbSelect(p) => p.d,
            KernelTask::LinucbUpdate(p) => p.d,
            KernelTask::BayesianSuggest(p) => p.observations.len().max(p.bounds.len()),
            KernelTask::BayesianOptimize(p) => p.observations.len().max(p.bounds.len()),
            KernelTask::CholeskyDecompose(p) => p.d,
            KernelTask::CholeskyRank1Update(p) => p.d,
        }
    }

    /// Run the kernel. Never panics on bad input; failures come back with
    /// `success == false`.
    pub fn execute(self) -> KernelOutput {
        let kind = self.kind();
        let d = self.dimension();
        let out = self.run();
        if let Some(error) = out.error() {
            debug!(kind, d, error, "kernel task failed");
        }
        out
    }

    fn run(self) -> KernelOutput {
        match self {
            KernelTask::LinucbSelect(p) => KernelOutput::LinucbSelect(
                linucb_select(&p.l, &p.b, p.alpha, p.d, &p.features).into(),
            ),
            KernelTask::LinucbUpdate(mut p) => {
                let result = linucb_update(&mut p.a, &mut p.b, &mut p.l, p.d, &p.x, p.reward)
                    .map(|()| UpdatedBuffers {
                        a: p.a,
                        b: p.b,
                        l: p.l,
                    });
                KernelOutput::LinucbUpdate(result.into())
            }
            KernelTask::BayesianSuggest(p) => {
                let mut rng = seeded_rng(p.seed);
                KernelOutput::BayesianSuggest(
                    bayesian_suggest(&p.observations, &p.bounds, &p.hyper, p.beta, &mut rng).into(),
                )
            }
            KernelTask::BayesianOptimize(p) => {
                let mut rng = seeded_rng(p.seed);
                KernelOutput::BayesianOptimize(
                    bayesian_optimize(
                        &p.observations,
                        &p.bounds,
                        &p.hyper,
                        p.beta,
                        p.batch_size,
                        &mut rng,
                    )
                    .into(),
                )
            }
            KernelTask::CholeskyDecompose(p) => KernelOutput::CholeskyDecompose(
                cholesky_decompose(&p.a, p.d, p.lambda)
                    .map(|l| Factor { l })
                    .into(),
            ),
            KernelTask::CholeskyRank1Update(p) => KernelOutput::CholeskyRank1Update(
                cholesky_rank1_update(&p.l, &p.x, p.d, p.min_diag)
                    .map(|l| Factor { l })
                    .into(),
            ),
        }
    }
}
