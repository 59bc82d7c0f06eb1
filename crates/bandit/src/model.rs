//! Reference LinUCB model.

use amas_core::config::BanditConfig;
use amas_core::types::{
    Action, ActionSelection, BanditModel, DiagnosticResult, LinUcbContext, UserState,
    FEATURE_DIMENSION, MIN_LAMBDA,
};
use amas_core::{EngineError, EngineResult};
use amas_kernels::linucb::{linucb_select, linucb_update, SelectOutcome};
use amas_kernels::matrix::{add_outer, add_scaled, cholesky_decompose};
use amas_kernels::sanitize::{
    diagnose_model, needs_full_recompute, sanitize_covariance, sanitize_feature_vector,
};
use amas_kernels::KernelError;
use tracing::{debug, warn};

use crate::features::build_feature_vector;

/// One learner's LinUCB state plus the operations on it.
///
/// Mutation requires `&mut self`, so updates are applied strictly in call
/// order.
#[derive(Debug, Clone, PartialEq)]
pub struct LinUcbModel {
    state: BanditModel,
}

impl Default for LinUcbModel {
    fn default() -> Self {
        Self {
            state: BanditModel::new(FEATURE_DIMENSION, 1.0, 0.3),
        }
    }
}

impl LinUcbModel {
    /// Fresh model. `lambda` is floored at [`MIN_LAMBDA`].
    pub fn new(d: usize, lambda: f64, alpha: f64) -> EngineResult<Self> {
        if d == 0 {
            return Err(EngineError::Config("bandit dimension must be positive".into()));
        }
        if !lambda.is_finite() || !alpha.is_finite() || alpha < 0.0 {
            return Err(EngineError::Config(format!(
                "invalid bandit parameters: lambda={lambda}, alpha={alpha}"
            )));
        }
        Ok(Self {
            state: BanditModel::new(d, lambda.max(MIN_LAMBDA), alpha),
        })
    }

    pub fn from_config(config: &BanditConfig) -> EngineResult<Self> {
        Self::new(config.dimension, config.lambda, config.alpha)
    }

    pub fn dimension(&self) -> usize {
        self.state.d
    }

    pub fn alpha(&self) -> f64 {
        self.state.alpha
    }

    /// Negative values clamp to 0; non-finite values are ignored.
    pub fn set_alpha(&mut self, alpha: f64) {
        if !alpha.is_finite() {
            warn!(alpha, "ignoring non-finite alpha");
            return;
        }
        self.state.alpha = alpha.max(0.0);
    }

    pub fn update_count(&self) -> u64 {
        self.state.update_count
    }

    /// Borrow the current state.
    pub fn model(&self) -> &BanditModel {
        &self.state
    }

    /// Owned snapshot of the current state.
    pub fn get_model(&self) -> BanditModel {
        self.state.clone()
    }

    /// Replace the state. The snapshot must be internally valid and match this
    /// model's dimension; otherwise nothing changes.
    pub fn set_model(&mut self, model: BanditModel) -> EngineResult<()> {
        if model.d != self.state.d {
            return Err(EngineError::DimensionMismatch {
                expected: self.state.d,
                got: model.d,
            });
        }
        model.validate()?;
        self.state = model;
        Ok(())
    }

    /// Back to `A = λI, b = 0, L = √λI`, keeping `alpha` and `lambda`.
    pub fn reset(&mut self) {
        self.state = BanditModel::new(self.state.d, self.state.lambda, self.state.alpha);
    }

    /// Feature vectors for every candidate, in order.
    pub fn feature_vectors(
        &self,
        state: &UserState,
        actions: &[Action],
        context: &LinUcbContext,
    ) -> Vec<Vec<f64>> {
        actions
            .iter()
            .map(|a| build_feature_vector(state, a, context, self.state.d))
            .collect()
    }

    /// Score prepared candidate vectors against the current state.
    pub fn score(&self, features: &[Vec<f64>]) -> EngineResult<SelectOutcome> {
        let s = &self.state;
        Ok(linucb_select(&s.l, &s.b, s.alpha, s.d, features)?)
    }

    pub fn select_action(
        &self,
        state: &UserState,
        actions: &[Action],
        context: &LinUcbContext,
    ) -> EngineResult<ActionSelection> {
        if actions.is_empty() {
            return Err(EngineError::EmptyActionSet);
        }
        let features = self.feature_vectors(state, actions, context);
        let outcome = self.score(&features)?;
        let index = outcome.best_index;
        Ok(ActionSelection::new(
            actions[index].clone(),
            index,
            outcome.exploitation,
            outcome.exploration,
            outcome.scores,
        ))
    }

    pub fn update(
        &mut self,
        state: &UserState,
        action: &Action,
        reward: f64,
        context: &LinUcbContext,
    ) -> EngineResult<()> {
        let x = build_feature_vector(state, action, context, self.state.d);
        self.update_with_feature_vector(&x, reward)
    }

    /// Length-check, reject non-finite input and clamp.
    pub fn prepare_feature_vector(&self, x: &[f64], reward: f64) -> EngineResult<Vec<f64>> {
        if x.len() != self.state.d {
            return Err(EngineError::DimensionMismatch {
                expected: self.state.d,
                got: x.len(),
            });
        }
        if x.iter().any(|v| !v.is_finite()) {
            return Err(EngineError::InvalidInput("feature vector has non-finite entries".into()));
        }
        if !reward.is_finite() {
            return Err(EngineError::InvalidInput(format!("reward {reward}")));
        }
        let mut x = x.to_vec();
        sanitize_feature_vector(&mut x);
        Ok(x)
    }

    /// Whether the next update should rebuild `L` from `A` instead of
    /// applying a rank-1 step.
    pub fn refactor_due(&self) -> bool {
        needs_full_recompute(self.state.update_count, &self.state.l, self.state.d)
    }

    /// Apply one observation. On error the state is exactly as before.
    ///
    /// A zero vector is accepted: `A`, `b` and `L` stay put and the update
    /// count still advances.
    pub fn update_with_feature_vector(&mut self, x: &[f64], reward: f64) -> EngineResult<()> {
        let x = self.prepare_feature_vector(x, reward)?;

        if self.refactor_due() {
            return self.refactor_with(&x, reward);
        }

        let s = &mut self.state;
        match linucb_update(&mut s.a, &mut s.b, &mut s.l, s.d, &x, reward) {
            Ok(()) => {
                s.update_count += 1;
                Ok(())
            }
            Err(e @ (KernelError::Rank1Collapse { .. } | KernelError::NonFinite(_))) => {
                debug!(error = %e, update_count = s.update_count, "rank-1 update failed, refactorizing");
                self.refactor_with(&x, reward)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Rebuild the factor from the sanitized `A + xxᵗ`.
    fn refactor_with(&mut self, x: &[f64], reward: f64) -> EngineResult<()> {
        let d = self.state.d;
        let mut a = self.state.a.clone();
        add_outer(&mut a, x, d);
        sanitize_covariance(&mut a, d, self.state.lambda);

        let l = cholesky_decompose(&a, d, 0.0).map_err(|e| {
            warn!(error = %e, update_count = self.state.update_count, "refactorization failed, update rejected");
            EngineError::IllConditioned(e.to_string())
        })?;

        let mut b = self.state.b.clone();
        add_scaled(&mut b, x, reward);

        self.state.a = a;
        self.state.b = b;
        self.state.l = l;
        self.state.update_count += 1;
        debug!(update_count = self.state.update_count, "model refactorized");
        Ok(())
    }

    /// Accept `A`, `b`, `L` computed elsewhere (e.g. on a worker) as one
    /// accepted update.
    pub fn commit_kernel_update(&mut self, a: Vec<f64>, b: Vec<f64>, l: Vec<f64>) -> EngineResult<()> {
        let candidate = BanditModel {
            a,
            b,
            l,
            update_count: self.state.update_count + 1,
            ..self.state.clone()
        };
        candidate.validate()?;
        self.state = candidate;
        Ok(())
    }

    /// Apply `(x, r)` pairs in order over the overlapping prefix and return
    /// how many were accepted.
    pub fn update_batch(&mut self, features: &[Vec<f64>], rewards: &[f64]) -> usize {
        if features.len() != rewards.len() {
            warn!(
                features = features.len(),
                rewards = rewards.len(),
                "batch length mismatch, using overlapping prefix"
            );
        }
        let mut accepted = 0;
        for (i, (x, &r)) in features.iter().zip(rewards).enumerate() {
            match self.update_with_feature_vector(x, r) {
                Ok(()) => accepted += 1,
                Err(e) => warn!(index = i, error = %e, "batch update rejected"),
            }
        }
        accepted
    }

    pub fn diagnose(&self) -> DiagnosticResult {
        diagnose_model(&self.state.a, &self.state.l, self.state.d)
    }

    /// Health check plus a select/update trial on a scratch copy.
    pub fn self_test(&self) -> bool {
        if self.state.validate().is_err() || !self.diagnose().is_healthy {
            return false;
        }

        let d = self.state.d;
        let mut scratch = self.clone();
        let candidates: Vec<Vec<f64>> = (0..d.min(2))
            .map(|i| {
                let mut x = vec![0.0; d];
                x[i] = 1.0;
                x
            })
            .collect();

        let selected = match scratch.score(&candidates) {
            Ok(outcome) => outcome,
            Err(_) => return false,
        };
        if !selected.score.is_finite() || selected.best_index >= candidates.len() {
            return false;
        }

        let before = scratch.update_count();
        if scratch.update_with_feature_vector(&candidates[0], 1.0).is_err() {
            return false;
        }
        scratch.update_count() == before + 1 && scratch.diagnose().is_healthy
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use amas_core::types::Difficulty;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    fn actions() -> Vec<Action> {
        vec![
            Action::new("apple", Difficulty::Recognition),
            Action::new("apple", Difficulty::Spelling),
            Action::new("banana", Difficulty::Usage),
        ]
    }

    #[test]
    fn test_new_floors_lambda_and_rejects_bad_config() {
        let m = LinUcbModel::new(3, 1e-9, 0.3).unwrap();
        assert_eq!(m.model().lambda, MIN_LAMBDA);
        assert!(LinUcbModel::new(0, 1.0, 0.3).is_err());
        assert!(LinUcbModel::new(3, 1.0, -1.0).is_err());
        assert!(LinUcbModel::new(3, f64::NAN, 0.3).is_err());
    }

    #[test]
    fn test_update_batch_scenario() {
        let mut m = LinUcbModel::new(2, 1.0, 0.3).unwrap();
        let n = m.update_batch(&[vec![1.0, 0.0], vec![0.0, 1.0]], &[1.0, -0.5]);
        assert_eq!(n, 2);

        let s = m.model();
        assert!(approx(s.b[0], 1.0));
        assert!(approx(s.b[1], -0.5));
        assert!(approx(s.a[0], 2.0));
        assert!(approx(s.a[3], 2.0));
        assert_eq!(s.update_count, 2);
    }

    #[test]
    fn test_update_batch_uses_overlapping_prefix() {
        let mut m = LinUcbModel::new(2, 1.0, 0.3).unwrap();
        let n = m.update_batch(&[vec![1.0, 0.0], vec![0.0, 1.0], vec![1.0, 1.0]], &[1.0]);
        assert_eq!(n, 1);
        assert_eq!(m.update_count(), 1);
        assert!(approx(m.model().b[1], 0.0));
    }

    #[test]
    fn test_zero_vector_update_counts_but_keeps_statistics() {
        let mut m = LinUcbModel::new(3, 1.0, 0.3).unwrap();
        let before = m.get_model();
        m.update_with_feature_vector(&[0.0, 0.0, 0.0], 1.0).unwrap();
        let after = m.get_model();
        assert_eq!(after.a, before.a);
        assert_eq!(after.b, before.b);
        assert_eq!(after.l, before.l);
        assert_eq!(after.update_count, 1);
    }

    #[test]
    fn test_invalid_input_leaves_state() {
        let mut m = LinUcbModel::new(2, 1.0, 0.3).unwrap();
        m.update_with_feature_vector(&[0.5, 0.5], 1.0).unwrap();
        let before = m.get_model();

        assert!(matches!(
            m.update_with_feature_vector(&[f64::NAN, 1.0], 1.0),
            Err(EngineError::InvalidInput(_))
        ));
        assert!(matches!(
            m.update_with_feature_vector(&[1.0, 1.0], f64::INFINITY),
            Err(EngineError::InvalidInput(_))
        ));
        assert!(matches!(
            m.update_with_feature_vector(&[1.0], 1.0),
            Err(EngineError::DimensionMismatch { expected: 2, got: 1 })
        ));
        assert_eq!(m.get_model(), before);
    }

    #[test]
    fn test_set_get_model_roundtrip() {
        let mut m = LinUcbModel::new(2, 1.0, 0.3).unwrap();
        m.update_with_feature_vector(&[1.0, 0.2], 0.7).unwrap();
        let snapshot = m.get_model();

        let mut other = LinUcbModel::new(2, 1.0, 0.3).unwrap();
        other.set_model(snapshot.clone()).unwrap();
        assert_eq!(other.get_model(), snapshot);

        let mut wrong = LinUcbModel::new(3, 1.0, 0.3).unwrap();
        assert!(matches!(
            wrong.set_model(snapshot),
            Err(EngineError::DimensionMismatch { expected: 3, got: 2 })
        ));
    }

    #[test]
    fn test_set_model_rejects_invalid_snapshot() {
        let mut m = LinUcbModel::new(2, 1.0, 0.3).unwrap();
        let mut bad = m.get_model();
        bad.l[0] = f64::NAN;
        assert!(m.set_model(bad).is_err());
        assert_eq!(m.get_model(), BanditModel::new(2, 1.0, 0.3));
    }

    #[test]
    fn test_reset_keeps_hyperparameters() {
        let mut m = LinUcbModel::new(2, 2.0, 0.3).unwrap();
        m.set_alpha(0.9);
        m.update_with_feature_vector(&[1.0, 1.0], 1.0).unwrap();
        m.reset();
        assert_eq!(m.get_model(), BanditModel::new(2, 2.0, 0.9));
    }

    #[test]
    fn test_set_alpha_clamps() {
        let mut m = LinUcbModel::default();
        m.set_alpha(-2.0);
        assert_eq!(m.alpha(), 0.0);
        m.set_alpha(f64::NAN);
        assert_eq!(m.alpha(), 0.0);
        m.set_alpha(1.5);
        assert_eq!(m.alpha(), 1.5);
    }

    #[test]
    fn test_select_action_returns_candidate() {
        let m = LinUcbModel::default();
        let sel = m
            .select_action(&UserState::default(), &actions(), &LinUcbContext::default())
            .unwrap();
        assert!(sel.index < 3);
        assert_eq!(sel.action, actions()[sel.index]);
        assert_eq!(sel.meta.all_scores.len(), 3);
        assert!(sel.confidence > 0.0 && sel.confidence <= 1.0);
        assert!(!sel.meta.accelerated);
    }

    #[test]
    fn test_select_action_empty() {
        let m = LinUcbModel::default();
        assert!(matches!(
            m.select_action(&UserState::default(), &[], &LinUcbContext::default()),
            Err(EngineError::EmptyActionSet)
        ));
    }

    #[test]
    fn test_learns_rewarded_difficulty() {
        let mut m = LinUcbModel::default();
        let state = UserState {
            mastery_level: 0.5,
            recent_accuracy: 0.7,
            ..Default::default()
        };
        let ctx = LinUcbContext::default();
        let actions = actions();
        for _ in 0..30 {
            m.update(&state, &actions[1], 1.0, &ctx).unwrap();
            m.update(&state, &actions[0], 0.0, &ctx).unwrap();
            m.update(&state, &actions[2], 0.0, &ctx).unwrap();
        }
        m.set_alpha(0.0);
        let sel = m.select_action(&state, &actions, &ctx).unwrap();
        assert_eq!(sel.index, 1);
    }

    #[test]
    fn test_periodic_refactor_keeps_factor_consistent() {
        let mut m = LinUcbModel::new(3, 1.0, 0.3).unwrap();
        for i in 0..450 {
            let t = i as f64 * 0.1;
            m.update_with_feature_vector(&[t.sin(), t.cos(), 1.0], (i % 2) as f64)
                .unwrap();
        }
        assert_eq!(m.update_count(), 450);
        assert!(m.diagnose().is_healthy);

        let s = m.model();
        let rebuilt = amas_kernels::matrix::multiply_lower_transpose(&s.l, 3);
        for (x, y) in rebuilt.iter().zip(&s.a) {
            assert!((x - y).abs() < 1e-6 * y.abs().max(1.0));
        }
    }

    #[test]
    fn test_collapsed_factor_recovers_through_refactor() {
        let mut m = LinUcbModel::new(2, 1.0, 0.3).unwrap();
        let mut broken = m.get_model();
        // Passes validation, but L has drifted far from A.
        broken.l = vec![1e-6, 0.0, 0.0, 1e3];
        m.set_model(broken).unwrap();
        assert!(m.refactor_due());

        m.update_with_feature_vector(&[0.0, 1.0], 1.0).unwrap();
        let s = m.model();
        assert!(approx(s.l[0], 1.0));
        assert!(approx(s.l[3], 2f64.sqrt()));
        assert_eq!(s.update_count, 1);
    }

    #[test]
    fn test_commit_kernel_update_validates() {
        let mut m = LinUcbModel::new(2, 1.0, 0.3).unwrap();
        let good = (vec![2.0, 0.0, 0.0, 1.0], vec![1.0, 0.0], vec![2f64.sqrt(), 0.0, 0.0, 1.0]);
        m.commit_kernel_update(good.0.clone(), good.1.clone(), good.2.clone())
            .unwrap();
        assert_eq!(m.update_count(), 1);
        assert_eq!(m.model().b, good.1);

        let before = m.get_model();
        assert!(m
            .commit_kernel_update(vec![1.0; 4], vec![0.0; 3], vec![1.0, 0.0, 0.0, 1.0])
            .is_err());
        assert_eq!(m.get_model(), before);
    }

    #[test]
    fn test_diagnose_and_self_test() {
        let m = LinUcbModel::default();
        assert!(m.diagnose().is_healthy);
        assert!(m.self_test());

        let one = LinUcbModel::new(1, 1.0, 0.3).unwrap();
        assert!(one.self_test());
    }
}
