//! Synthetic learners driving the registry, for smoke runs and load checks.

use std::sync::Arc;

use amas_bandit::cold_start_alpha;
use amas_core::types::{Action, Difficulty, LinUcbContext, UserState};
use amas_dispatch::DispatcherRegistry;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{debug, warn};

const WORDS_PER_ROUND: usize = 5;

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SimulationReport {
    pub users: usize,
    pub rounds: usize,
    pub selections: u64,
    pub accelerated: u64,
    pub offloaded: u64,
    pub boundary_errors: u64,
    pub rejected_updates: u64,
    pub mean_reward: f64,
}

impl SimulationReport {
    fn merge(&mut self, other: &SimulationReport) {
        self.selections += other.selections;
        self.accelerated += other.accelerated;
        self.offloaded += other.offloaded;
        self.boundary_errors += other.boundary_errors;
        self.rejected_updates += other.rejected_updates;
    }
}

/// A learner whose reward peaks when the question format matches their
/// mastery.
struct Learner {
    state: UserState,
    fatigue: f64,
}

impl Learner {
    fn new(rng: &mut StdRng) -> Self {
        Self {
            state: UserState {
                mastery_level: rng.gen_range(0.05..0.5),
                recent_accuracy: rng.gen_range(0.4..0.9),
                study_streak: rng.gen_range(0..10),
                total_interactions: 0,
                average_response_time: rng.gen_range(1500.0..6000.0),
            },
            fatigue: 0.0,
        }
    }

    fn reward(&self, action: &Action, rng: &mut StdRng) -> f64 {
        let gap = (action.difficulty.weight() - self.state.mastery_level).abs();
        let noise: f64 = rng.gen_range(-0.1..0.1);
        (1.0 - 2.0 * gap - 0.3 * self.fatigue + noise).clamp(-1.0, 1.0)
    }

    fn observe(&mut self, reward: f64) {
        let s = &mut self.state;
        let correct = if reward > 0.0 { 1.0 } else { 0.0 };
        s.recent_accuracy = 0.9 * s.recent_accuracy + 0.1 * correct;
        s.mastery_level = (s.mastery_level + 0.01 * reward.max(0.0)).min(1.0);
        s.total_interactions += 1;
        self.fatigue = (self.fatigue + 0.01).min(1.0);
    }

    fn context(&self, round: usize) -> LinUcbContext {
        LinUcbContext {
            time_of_day: (round % 24) as f64 / 24.0,
            day_of_week: (round / 24 % 7) as u32,
            session_duration: round as f64 * 30.0,
            fatigue_factor: Some(self.fatigue),
        }
    }
}

fn candidate_actions(round: usize, rng: &mut StdRng) -> Vec<Action> {
    (0..WORDS_PER_ROUND)
        .map(|i| {
            let difficulty = Difficulty::ALL[rng.gen_range(0..Difficulty::ALL.len())];
            Action::new(format!("word-{round}-{i}"), difficulty)
        })
        .collect()
}

async fn run_learner(
    registry: Arc<DispatcherRegistry>,
    user_id: String,
    rounds: usize,
    seed: u64,
) -> anyhow::Result<(SimulationReport, f64)> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut learner = Learner::new(&mut rng);
    let dispatcher = registry.get_or_create(&user_id)?;
    let mut report = SimulationReport::default();
    let mut reward_sum = 0.0;

    for round in 0..rounds {
        let actions = candidate_actions(round, &mut rng);
        let context = learner.context(round);
        let mut guard = dispatcher.lock().await;

        guard.set_alpha(cold_start_alpha(
            learner.state.total_interactions,
            learner.state.recent_accuracy,
            learner.fatigue,
        ));
        let selection = guard.select_action(&learner.state, &actions, &context).await?;
        report.selections += 1;
        report.accelerated += u64::from(selection.meta.accelerated);
        report.offloaded += u64::from(selection.meta.offloaded);
        report.boundary_errors += u64::from(selection.meta.boundary_error);

        let reward = learner.reward(&selection.action, &mut rng);
        if let Err(e) = guard
            .update(&learner.state, &selection.action, reward, &context)
            .await
        {
            warn!(user = %user_id, round, error = %e, "update rejected");
            report.rejected_updates += 1;
        }
        drop(guard);

        debug!(user = %user_id, round, index = selection.index, reward, "round complete");
        reward_sum += reward;
        learner.observe(reward);
    }

    Ok((report, reward_sum))
}

/// Run every learner concurrently for `rounds` rounds.
pub async fn run(
    registry: Arc<DispatcherRegistry>,
    users: usize,
    rounds: usize,
    seed: u64,
) -> anyhow::Result<SimulationReport> {
    let handles: Vec<_> = (0..users)
        .map(|u| {
            let registry = Arc::clone(&registry);
            tokio::spawn(run_learner(
                registry,
                format!("user-{u}"),
                rounds,
                seed.wrapping_add(u as u64),
            ))
        })
        .collect();

    let mut total = SimulationReport {
        users,
        rounds,
        ..Default::default()
    };
    let mut reward_sum = 0.0;
    for handle in handles {
        let (report, rewards) = handle.await??;
        total.merge(&report);
        reward_sum += rewards;
    }
    if total.selections > 0 {
        total.mean_reward = reward_sum / total.selections as f64;
    }
    Ok(total)
}
