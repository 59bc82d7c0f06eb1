//! Exploration schedule for learners with little history.

const BASE_ALPHA: f64 = 0.3;

/// Exploration weight for a learner given how much we know about them.
///
/// Fewer interactions and unstable accuracy explore more; fatigue (clamped to
/// `[0, 1]`) explores less.
pub fn cold_start_alpha(interactions: u32, recent_accuracy: f64, fatigue: f64) -> f64 {
    let history = match interactions {
        0..=9 => 2.0,
        10..=49 => 1.5,
        50..=199 => 1.2,
        _ => 1.0,
    };

    let unstable = if (0.3..=0.9).contains(&recent_accuracy) {
        1.0
    } else {
        1.3
    };

    let fatigue = if fatigue.is_finite() {
        fatigue.clamp(0.0, 1.0)
    } else {
        0.0
    };

    BASE_ALPHA * history * unstable * (1.0 - 0.3 * fatigue)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-12
    }

    #[test]
    fn test_interaction_tiers() {
        assert!(close(cold_start_alpha(0, 0.5, 0.0), 0.6));
        assert!(close(cold_start_alpha(9, 0.5, 0.0), 0.6));
        assert!(close(cold_start_alpha(10, 0.5, 0.0), 0.45));
        assert!(close(cold_start_alpha(49, 0.5, 0.0), 0.45));
        assert!(close(cold_start_alpha(50, 0.5, 0.0), 0.36));
        assert!(close(cold_start_alpha(199, 0.5, 0.0), 0.36));
        assert!(close(cold_start_alpha(200, 0.5, 0.0), 0.3));
    }

    #[test]
    fn test_unstable_accuracy_explores_more() {
        assert!(close(cold_start_alpha(500, 0.2, 0.0), 0.39));
        assert!(close(cold_start_alpha(500, 0.95, 0.0), 0.39));
        assert!(close(cold_start_alpha(500, 0.3, 0.0), 0.3));
        assert!(close(cold_start_alpha(500, 0.9, 0.0), 0.3));
    }

    #[test]
    fn test_fatigue_reduces_exploration() {
        assert!(close(cold_start_alpha(500, 0.5, 1.0), 0.21));
        assert!(close(cold_start_alpha(500, 0.5, 0.5), 0.255));
        // Clamped.
        assert!(close(cold_start_alpha(500, 0.5, 3.0), 0.21));
        assert!(close(cold_start_alpha(500, 0.5, -1.0), 0.3));
    }
}
