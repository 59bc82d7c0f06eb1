use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Canonical length of the LinUCB feature vector.
pub const FEATURE_DIMENSION: usize = 22;
/// Bumped whenever the feature layout changes; persisted models are only
/// comparable within one version.
pub const FEATURE_VERSION: u32 = 1;

pub const MIN_LAMBDA: f64 = 1e-3;
pub const MIN_RANK1_DIAG: f64 = 1e-6;
pub const MAX_COVARIANCE: f64 = 1e9;
pub const MAX_FEATURE_ABS: f64 = 50.0;
pub const EPSILON: f64 = 1e-10;
pub const CHOLESKY_RECOMPUTE_INTERVAL: u64 = 200;

// ─── Bandit model state ─────────────────────────────────────────────────

/// Persistent LinUCB state. Matrices are flat, row-major `d × d` buffers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BanditModel {
    pub d: usize,
    pub lambda: f64,
    pub alpha: f64,
    #[serde(rename = "A")]
    pub a: Vec<f64>,
    pub b: Vec<f64>,
    #[serde(rename = "L")]
    pub l: Vec<f64>,
    pub update_count: u64,
}

impl BanditModel {
    /// Fresh model: `A = λI`, `b = 0`, `L = √λ·I`.
    pub fn new(d: usize, lambda: f64, alpha: f64) -> Self {
        let mut a = vec![0.0; d * d];
        let mut l = vec![0.0; d * d];
        let sqrt_lambda = lambda.sqrt();
        for i in 0..d {
            a[i * d + i] = lambda;
            l[i * d + i] = sqrt_lambda;
        }
        Self {
            d,
            lambda,
            alpha,
            a,
            b: vec![0.0; d],
            l,
            update_count: 0,
        }
    }

    /// Check buffer shapes and finiteness. Does not check `L·Lᵗ ≈ A`.
    pub fn validate(&self) -> EngineResult<()> {
        let d = self.d;
        if d == 0 {
            return Err(EngineError::InvalidModel("dimension must be positive".into()));
        }
        if self.a.len() != d * d {
            return Err(EngineError::InvalidModel(format!(
                "A has {} entries, expected {}",
                self.a.len(),
                d * d
            )));
        }
        if self.l.len() != d * d {
            return Err(EngineError::InvalidModel(format!(
                "L has {} entries, expected {}",
                self.l.len(),
                d * d
            )));
        }
        if self.b.len() != d {
            return Err(EngineError::InvalidModel(format!(
                "b has {} entries, expected {d}",
                self.b.len()
            )));
        }
        if !self.lambda.is_finite() || self.lambda <= 0.0 {
            return Err(EngineError::InvalidModel(format!(
                "lambda must be positive, got {}",
                self.lambda
            )));
        }
        if !self.alpha.is_finite() || self.alpha < 0.0 {
            return Err(EngineError::InvalidModel(format!(
                "alpha must be non-negative, got {}",
                self.alpha
            )));
        }
        let finite = self
            .a
            .iter()
            .chain(self.b.iter())
            .chain(self.l.iter())
            .all(|v| v.is_finite());
        if !finite {
            return Err(EngineError::InvalidModel("non-finite entries".into()));
        }
        for i in 0..d {
            if self.l[i * d + i] < MIN_RANK1_DIAG {
                return Err(EngineError::InvalidModel(format!(
                    "L[{i},{i}] = {} below diagonal floor",
                    self.l[i * d + i]
                )));
            }
        }
        Ok(())
    }
}

// ─── Feature sources ────────────────────────────────────────────────────

/// Question format presented for a word, from easiest to hardest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    #[default]
    Recognition,
    Recall,
    Spelling,
    Listening,
    Usage,
}

impl Difficulty {
    pub const ALL: [Difficulty; 5] = [
        Difficulty::Recognition,
        Difficulty::Recall,
        Difficulty::Spelling,
        Difficulty::Listening,
        Difficulty::Usage,
    ];

    pub fn index(self) -> usize {
        match self {
            Difficulty::Recognition => 0,
            Difficulty::Recall => 1,
            Difficulty::Spelling => 2,
            Difficulty::Listening => 3,
            Difficulty::Usage => 4,
        }
    }

    /// Relative effort of the format, used in interaction features.
    pub fn weight(self) -> f64 {
        match self {
            Difficulty::Recognition => 0.2,
            Difficulty::Recall => 0.4,
            Difficulty::Spelling => 0.6,
            Difficulty::Listening => 0.8,
            Difficulty::Usage => 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub word_id: String,
    pub difficulty: Difficulty,
    pub scheduled_at: Option<f64>,
}

impl Action {
    pub fn new(word_id: impl Into<String>, difficulty: Difficulty) -> Self {
        Self {
            word_id: word_id.into(),
            difficulty,
            scheduled_at: None,
        }
    }
}

/// Learner snapshot supplied by the learning-event pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct UserState {
    pub mastery_level: f64,
    pub recent_accuracy: f64,
    pub study_streak: u32,
    pub total_interactions: u32,
    /// Milliseconds.
    pub average_response_time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LinUcbContext {
    /// Fraction of the day in `[0, 1]`.
    pub time_of_day: f64,
    pub day_of_week: u32,
    /// Seconds.
    pub session_duration: f64,
    pub fatigue_factor: Option<f64>,
}

// ─── Outputs ────────────────────────────────────────────────────────────

/// Diagnostic fields attached to a selection. Never read by decision logic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct SelectionMeta {
    pub exploitation: f64,
    pub exploration: f64,
    pub all_scores: Vec<f64>,
    pub accelerated: bool,
    pub offloaded: bool,
    pub boundary_error: bool,
    pub feature_version: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionSelection {
    pub action: Action,
    pub index: usize,
    pub score: f64,
    /// `tanh(exploration)`: a squashed uncertainty, not a calibrated probability.
    pub confidence: f64,
    pub meta: SelectionMeta,
}

impl ActionSelection {
    pub fn new(
        action: Action,
        index: usize,
        exploitation: f64,
        exploration: f64,
        all_scores: Vec<f64>,
    ) -> Self {
        Self {
            action,
            index,
            score: exploitation + exploration,
            confidence: confidence_from_exploration(exploration),
            meta: SelectionMeta {
                exploitation,
                exploration,
                all_scores,
                feature_version: FEATURE_VERSION,
                ..Default::default()
            },
        }
    }
}

pub fn confidence_from_exploration(exploration: f64) -> f64 {
    if exploration.is_finite() {
        exploration.max(0.0).tanh()
    } else if exploration > 0.0 {
        1.0
    } else {
        0.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticResult {
    pub is_healthy: bool,
    #[serde(rename = "hasNaN")]
    pub has_nan: bool,
    pub has_inf: bool,
    pub condition_number: f64,
    pub min_diagonal: f64,
    pub max_diagonal: f64,
    pub message: String,
}
