//! Breaker-gated choice between an accelerated backend and the reference
//! model.
//!
//! The reference path is total: it never calls the accelerated backend and
//! only fails on input the caller got wrong. Accelerated failures are
//! recorded on the breaker and answered by the reference path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use amas_bandit::{build_feature_vector, LinUcbModel};
use amas_core::accel::{AcceleratedBandit, AcceleratedSelection, FeatureBatch};
use amas_core::event_bus::CircuitState;
use amas_core::types::{
    Action, ActionSelection, BanditModel, DiagnosticResult, LinUcbContext, UserState,
};
use amas_core::{EngineError, EngineResult, FailureReason};
use amas_kernels::task::{
    KernelOutput, KernelTask, LinucbSelectPayload, LinucbUpdatePayload, TaskResult,
};
use amas_resilience::{CircuitBreaker, CircuitBreakerConfig};
use amas_workers::{KernelOffload, OffloadStats};
use serde::Serialize;
use tracing::{debug, warn};

/// Relative tolerance when comparing accelerated and reference scores.
const PARITY_TOLERANCE: f64 = 1e-6;

/// Which implementation serves requests while the breaker allows it.
#[derive(Clone)]
pub enum BanditBackend {
    Accelerated(Arc<dyn AcceleratedBandit>),
    Reference,
}

impl BanditBackend {
    pub fn name(&self) -> &str {
        match self {
            BanditBackend::Accelerated(accel) => accel.name(),
            BanditBackend::Reference => "reference",
        }
    }

    pub fn is_accelerated(&self) -> bool {
        matches!(self, BanditBackend::Accelerated(_))
    }
}

impl std::fmt::Debug for BanditBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("BanditBackend").field(&self.name()).finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatcherStats {
    pub backend: String,
    pub native_calls: u64,
    pub fallback_calls: u64,
    pub failures: u64,
    pub circuit_state: CircuitState,
    pub failure_rate: f64,
    pub offload: OffloadStats,
}

/// Owns one learner's model and routes every operation on it.
///
/// Selection takes `&self`; anything that changes the model takes
/// `&mut self`, so updates land in call order.
pub struct BanditDispatcher {
    model: LinUcbModel,
    backend: BanditBackend,
    breaker: Arc<CircuitBreaker>,
    offload: Arc<KernelOffload>,
    native_calls: AtomicU64,
    fallback_calls: AtomicU64,
    failures: AtomicU64,
}

impl BanditDispatcher {
    pub fn new(
        model: LinUcbModel,
        backend: BanditBackend,
        breaker: Arc<CircuitBreaker>,
        offload: Arc<KernelOffload>,
    ) -> Self {
        Self {
            model,
            backend,
            breaker,
            offload,
            native_calls: AtomicU64::new(0),
            fallback_calls: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Reference model only, kernels run on the caller.
    pub fn reference(model: LinUcbModel) -> Self {
        Self::new(
            model,
            BanditBackend::Reference,
            Arc::new(CircuitBreaker::new("reference", CircuitBreakerConfig::default())),
            Arc::new(KernelOffload::inline_only()),
        )
    }

    pub fn backend(&self) -> &BanditBackend {
        &self.backend
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn model(&self) -> &LinUcbModel {
        &self.model
    }

    pub fn alpha(&self) -> f64 {
        self.model.alpha()
    }

    pub fn set_alpha(&mut self, alpha: f64) {
        self.model.set_alpha(alpha);
    }

    /// The accelerated backend, if one is configured and the breaker lets
    /// this call through.
    fn permitted_accelerator(&self) -> Option<Arc<dyn AcceleratedBandit>> {
        match &self.backend {
            BanditBackend::Accelerated(accel) if self.breaker.can_execute() => {
                Some(Arc::clone(accel))
            }
            _ => None,
        }
    }

    fn record_native(&self) {
        self.breaker.record_success();
        self.native_calls.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("amas.dispatch.native_calls").increment(1);
    }

    fn record_failure(&self, op: &'static str, reason: &FailureReason) {
        self.breaker.record_failure(reason.label());
        self.failures.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("amas.dispatch.failures", "reason" => reason.label()).increment(1);
        warn!(
            backend = self.backend.name(),
            op,
            reason = %reason,
            "accelerated call failed, using reference path"
        );
    }

    fn record_fallback(&self) {
        self.fallback_calls.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("amas.dispatch.fallback_calls").increment(1);
    }

    // ─── Selection ──────────────────────────────────────────────────────

    pub async fn select_action(
        &self,
        state: &UserState,
        actions: &[Action],
        context: &LinUcbContext,
    ) -> EngineResult<ActionSelection> {
        if actions.is_empty() {
            return Err(EngineError::EmptyActionSet);
        }
        let features = self.model.feature_vectors(state, actions, context);

        if let Some(accel) = self.permitted_accelerator() {
            let batch = FeatureBatch::from_rows(&features, self.model.dimension());
            let attempt = accel
                .select(self.model.model(), &batch)
                .and_then(|selection| validate_selection(selection, actions.len()));

            match attempt {
                Ok(selection) => {
                    self.record_native();
                    let index = selection.selected_index;
                    let mut result = ActionSelection::new(
                        actions[index].clone(),
                        index,
                        selection.exploitation,
                        selection.exploration,
                        selection.scores,
                    );
                    result.meta.accelerated = true;
                    return Ok(result);
                }
                Err(reason @ FailureReason::BoundaryError { .. }) => {
                    self.record_failure("select", &reason);
                    let mut result = ActionSelection::new(actions[0].clone(), 0, 0.0, 0.0, Vec::new());
                    result.meta.accelerated = true;
                    result.meta.boundary_error = true;
                    return Ok(result);
                }
                Err(reason) => self.record_failure("select", &reason),
            }
        }

        self.reference_select(actions, features).await
    }

    async fn reference_select(
        &self,
        actions: &[Action],
        features: Vec<Vec<f64>>,
    ) -> EngineResult<ActionSelection> {
        self.record_fallback();
        let state = self.model.model();
        let task = KernelTask::LinucbSelect(LinucbSelectPayload {
            l: state.l.clone(),
            b: state.b.clone(),
            alpha: state.alpha,
            d: state.d,
            features,
        });

        let outcome = self.offload.run(task).await;
        let selected = match outcome.output {
            KernelOutput::LinucbSelect(TaskResult {
                value: Some(selected),
                ..
            }) => selected,
            other => {
                return Err(EngineError::Kernel(
                    other.error().unwrap_or("unexpected kernel output").to_string(),
                ))
            }
        };

        let index = selected.best_index;
        let action = actions
            .get(index)
            .ok_or_else(|| EngineError::Kernel(format!("selection index {index} out of range")))?;
        let mut result = ActionSelection::new(
            action.clone(),
            index,
            selected.exploitation,
            selected.exploration,
            selected.scores,
        );
        result.meta.offloaded = outcome.offloaded;
        Ok(result)
    }

    // ─── Updates ────────────────────────────────────────────────────────

    pub async fn update(
        &mut self,
        state: &UserState,
        action: &Action,
        reward: f64,
        context: &LinUcbContext,
    ) -> EngineResult<()> {
        let x = build_feature_vector(state, action, context, self.model.dimension());
        self.update_with_feature_vector(&x, reward).await
    }

    /// Apply one observation. Invalid input is rejected before either
    /// backend sees it and does not count against the breaker.
    pub async fn update_with_feature_vector(&mut self, x: &[f64], reward: f64) -> EngineResult<()> {
        let x = self.model.prepare_feature_vector(x, reward)?;

        if let Some(accel) = self.permitted_accelerator() {
            let current = self.model.model();
            let attempt = accel
                .update(current, &x, reward)
                .and_then(|next| validate_update(current, next));

            match attempt {
                Ok(next) => match self.model.set_model(next) {
                    Ok(()) => {
                        self.record_native();
                        return Ok(());
                    }
                    Err(e) => {
                        self.record_failure("update", &FailureReason::InvalidResult(e.to_string()))
                    }
                },
                Err(reason) => self.record_failure("update", &reason),
            }
        }

        self.reference_update(x, reward).await
    }

    async fn reference_update(&mut self, x: Vec<f64>, reward: f64) -> EngineResult<()> {
        self.record_fallback();
        if self.model.refactor_due() {
            return self.model.update_with_feature_vector(&x, reward);
        }

        let state = self.model.model();
        let task = KernelTask::LinucbUpdate(LinucbUpdatePayload {
            a: state.a.clone(),
            b: state.b.clone(),
            l: state.l.clone(),
            d: state.d,
            x: x.clone(),
            reward,
        });

        match self.offload.run(task).await.output {
            KernelOutput::LinucbUpdate(TaskResult {
                value: Some(buffers),
                ..
            }) => match self.model.commit_kernel_update(buffers.a, buffers.b, buffers.l) {
                Ok(()) => return Ok(()),
                Err(e) => debug!(error = %e, "kernel update rejected, applying in place"),
            },
            other => debug!(
                error = other.error().unwrap_or("unexpected kernel output"),
                "kernel update failed, applying in place"
            ),
        }

        // The in-place path refactorizes when the rank-1 step collapses.
        self.model.update_with_feature_vector(&x, reward)
    }

    /// Apply `(x, r)` pairs in order over the overlapping prefix; returns how
    /// many were accepted.
    pub async fn update_batch(&mut self, features: &[Vec<f64>], rewards: &[f64]) -> usize {
        if features.len() != rewards.len() {
            warn!(
                features = features.len(),
                rewards = rewards.len(),
                "batch length mismatch, using overlapping prefix"
            );
        }
        let mut accepted = 0;
        for (i, (x, &r)) in features.iter().zip(rewards).enumerate() {
            match self.update_with_feature_vector(x, r).await {
                Ok(()) => accepted += 1,
                Err(e) => warn!(index = i, error = %e, "batch update rejected"),
            }
        }
        accepted
    }

    // ─── State ──────────────────────────────────────────────────────────

    pub fn get_model(&self) -> BanditModel {
        self.model.get_model()
    }

    pub fn set_model(&mut self, model: BanditModel) -> EngineResult<()> {
        self.model.set_model(model)
    }

    pub fn reset(&mut self) {
        self.model.reset();
    }

    pub fn diagnose(&self) -> DiagnosticResult {
        if let Some(accel) = self.permitted_accelerator() {
            match accel.diagnose(self.model.model()) {
                Ok(report) => {
                    self.record_native();
                    return report;
                }
                Err(reason) => self.record_failure("diagnose", &reason),
            }
        }
        self.record_fallback();
        self.model.diagnose()
    }

    /// Reference self-test, plus a score comparison against the accelerated
    /// backend when the breaker admits a call. The comparison counts as an
    /// accelerated call: agreement is recorded as a success, a mismatch or
    /// error as a failure. With the breaker open only the reference check runs.
    pub fn self_test(&self) -> bool {
        if !self.model.self_test() {
            return false;
        }
        let Some(accel) = self.permitted_accelerator() else {
            return true;
        };
        match self.accelerator_agrees(accel.as_ref()) {
            Ok(true) => {
                self.record_native();
                true
            }
            Ok(false) => false,
            Err(reason) => {
                self.record_failure("self_test", &reason);
                false
            }
        }
    }

    /// `Ok(false)` when the reference side could not be scored.
    fn accelerator_agrees(&self, accel: &dyn AcceleratedBandit) -> Result<bool, FailureReason> {
        let d = self.model.dimension();
        let basis: Vec<Vec<f64>> = (0..d.min(4))
            .map(|i| {
                let mut x = vec![0.0; d];
                x[i] = 1.0;
                x
            })
            .collect();

        let expected = match self.model.score(&basis) {
            Ok(outcome) => outcome.scores,
            Err(_) => return Ok(false),
        };
        let batch = FeatureBatch::from_rows(&basis, d);
        let actual = accel.select(self.model.model(), &batch)?.scores;

        let agrees = actual.len() == expected.len()
            && actual
                .iter()
                .zip(&expected)
                .all(|(a, e)| (a - e).abs() <= PARITY_TOLERANCE * e.abs().max(1.0));
        if agrees {
            Ok(true)
        } else {
            Err(FailureReason::InvalidResult("self-test score mismatch".into()))
        }
    }

    pub fn stats(&self) -> DispatcherStats {
        DispatcherStats {
            backend: self.backend.name().to_string(),
            native_calls: self.native_calls.load(Ordering::Relaxed),
            fallback_calls: self.fallback_calls.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            circuit_state: self.breaker.state(),
            failure_rate: self.breaker.failure_rate(),
            offload: self.offload.stats(),
        }
    }

    pub fn reset_circuit(&self) {
        self.breaker.reset();
    }

    pub fn force_circuit_open(&self, reason: &str) {
        self.breaker.force_open(reason);
    }
}

/// Reject accelerated selections the caller cannot use.
fn validate_selection(
    selection: AcceleratedSelection,
    len: usize,
) -> Result<AcceleratedSelection, FailureReason> {
    if selection.selected_index >= len {
        return Err(FailureReason::BoundaryError {
            index: selection.selected_index,
            len,
        });
    }
    if selection.scores.len() != len {
        return Err(FailureReason::InvalidResult(format!(
            "{} scores for {len} candidates",
            selection.scores.len()
        )));
    }
    let finite = selection.exploitation.is_finite()
        && selection.exploration.is_finite()
        && selection.scores.iter().all(|s| s.is_finite());
    if !finite {
        return Err(FailureReason::InvalidResult("non-finite score".into()));
    }
    Ok(selection)
}

/// An accelerated update must be exactly one step on from `current`.
fn validate_update(current: &BanditModel, next: BanditModel) -> Result<BanditModel, FailureReason> {
    if next.d != current.d {
        return Err(FailureReason::InvalidResult(format!(
            "dimension changed from {} to {}",
            current.d, next.d
        )));
    }
    if next.update_count != current.update_count + 1 {
        return Err(FailureReason::InvalidResult(format!(
            "update count {} after {}",
            next.update_count, current.update_count
        )));
    }
    if next.lambda != current.lambda || next.alpha != current.alpha {
        return Err(FailureReason::InvalidResult("hyperparameters changed".into()));
    }
    next.validate()
        .map_err(|e| FailureReason::InvalidResult(e.to_string()))?;
    Ok(next)
}
