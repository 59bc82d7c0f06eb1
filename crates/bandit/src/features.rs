//! Context feature construction.
//!
//! The canonical layout (version
//! [`FEATURE_VERSION`](amas_core::types::FEATURE_VERSION)) has
//! [`FEATURE_DIMENSION`] entries:
//!
//! | idx   | feature                                  |
//! |-------|------------------------------------------|
//! | 0-4   | mastery, accuracy, streak, log interactions, response time |
//! | 5     | error rate                               |
//! | 6-10  | difficulty one-hot                       |
//! | 11    | mastery × difficulty weight              |
//! | 12-14 | time of day, day of week, session length |
//! | 15-20 | interactions with time, difficulty and fatigue |
//! | 21    | bias                                     |

use amas_core::types::{Action, LinUcbContext, UserState, FEATURE_DIMENSION};
use amas_kernels::sanitize::sanitize_feature_vector;

/// The full-length vector for one candidate, before sizing and clamping.
pub fn canonical_features(
    state: &UserState,
    action: &Action,
    context: &LinUcbContext,
) -> [f64; FEATURE_DIMENSION] {
    let mastery = state.mastery_level;
    let accuracy = state.recent_accuracy;
    let weight = action.difficulty.weight();
    let fatigue = context.fatigue_factor.unwrap_or(0.0);
    let tod = context.time_of_day;

    let mut x = [0.0; FEATURE_DIMENSION];
    x[0] = mastery;
    x[1] = accuracy;
    x[2] = f64::from(state.study_streak).min(30.0) / 30.0;
    x[3] = f64::from(state.total_interactions).ln_1p() / 10.0;
    x[4] = (state.average_response_time / 10_000.0).min(1.0);
    x[5] = 1.0 - accuracy;
    x[6 + action.difficulty.index()] = 1.0;
    x[11] = mastery * weight;
    x[12] = tod;
    x[13] = f64::from(context.day_of_week) / 6.0;
    x[14] = (context.session_duration / 3600.0).min(1.0);
    x[15] = mastery * accuracy;
    x[16] = mastery * tod;
    x[17] = accuracy * weight;
    x[18] = tod * weight;
    x[19] = mastery * (1.0 - fatigue);
    x[20] = accuracy * (1.0 - fatigue);
    x[21] = 1.0;
    x
}

/// Feature vector sized to `d`: truncated or zero-padded, non-finite entries
/// zeroed and the rest clamped.
pub fn build_feature_vector(
    state: &UserState,
    action: &Action,
    context: &LinUcbContext,
    d: usize,
) -> Vec<f64> {
    let canonical = canonical_features(state, action, context);
    let mut x: Vec<f64> = canonical.iter().copied().take(d).collect();
    x.resize(d, 0.0);
    sanitize_feature_vector(&mut x);
    x
}

#[cfg(test)]
mod tests {
    use super::*;
    use amas_core::types::Difficulty;

    fn state() -> UserState {
        UserState {
            mastery_level: 0.6,
            recent_accuracy: 0.8,
            study_streak: 45,
            total_interactions: 120,
            average_response_time: 2500.0,
        }
    }

    fn context() -> LinUcbContext {
        LinUcbContext {
            time_of_day: 0.5,
            day_of_week: 3,
            session_duration: 7200.0,
            fatigue_factor: Some(0.25),
        }
    }

    #[test]
    fn test_canonical_layout() {
        let x = canonical_features(&state(), &Action::new("w1", Difficulty::Spelling), &context());
        assert_eq!(x[0], 0.6);
        assert_eq!(x[2], 1.0, "streak capped at 30");
        assert!((x[3] - 121f64.ln() / 10.0).abs() < 1e-12);
        assert_eq!(x[4], 0.25);
        assert!((x[5] - 0.2).abs() < 1e-12);
        assert_eq!(&x[6..11], &[0.0, 0.0, 1.0, 0.0, 0.0]);
        assert!((x[11] - 0.36).abs() < 1e-12);
        assert_eq!(x[13], 0.5);
        assert_eq!(x[14], 1.0, "session capped at one hour");
        assert!((x[19] - 0.45).abs() < 1e-12);
        assert_eq!(x[21], 1.0);
    }

    #[test]
    fn test_deterministic() {
        let action = Action::new("w1", Difficulty::Recall);
        let a = build_feature_vector(&state(), &action, &context(), FEATURE_DIMENSION);
        let b = build_feature_vector(&state(), &action, &context(), FEATURE_DIMENSION);
        assert_eq!(a, b);
    }

    #[test]
    fn test_sized_to_dimension() {
        let action = Action::new("w1", Difficulty::Usage);
        let short = build_feature_vector(&state(), &action, &context(), 4);
        assert_eq!(short, vec![0.6, 0.8, 1.0, 121f64.ln() / 10.0]);

        let long = build_feature_vector(&state(), &action, &context(), 30);
        assert_eq!(long.len(), 30);
        assert_eq!(long[21], 1.0);
        assert!(long[22..].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_clamps_and_zeroes() {
        let mut s = state();
        s.mastery_level = 500.0;
        s.recent_accuracy = f64::NAN;
        let x = build_feature_vector(&s, &Action::new("w", Difficulty::Usage), &context(), 22);
        assert_eq!(x[0], 50.0);
        assert_eq!(x[1], 0.0);
        assert!(x.iter().all(|v| v.is_finite()));
    }
}
