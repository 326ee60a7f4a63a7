//! Scenario scoring and exploration policy

use chrono::{DateTime, Duration, Utc};
use rand::Rng;

use crate::feedback::EventRecord;

/// Score for a scenario with no recorded trials
pub const UNTESTED_SCORE: f64 = 0.5;
/// Recent tagged events considered when scoring a scenario
pub const SCORE_WINDOW: usize = 20;

pub const MIN_EXPLORATION_RATE: f64 = 0.1;
pub const MAX_EXPLORATION_RATE: f64 = 0.5;

/// `avg_reward * success_rate` over the given events
pub fn scenario_score(events: &[EventRecord]) -> f64 {
    if events.is_empty() {
        return UNTESTED_SCORE;
    }
    let n = events.len() as f64;
    let avg_reward = events.iter().map(|e| e.reward).sum::<f64>() / n;
    let success_rate = events.iter().filter(|e| e.success).count() as f64 / n;
    avg_reward * success_rate
}

/// Highest-scoring index; ties go to whichever comes first in rotation
/// order starting at `rotation`.
pub fn best_scored(scores: &[f64], rotation: usize) -> Option<usize> {
    let len = scores.len();
    if len == 0 {
        return None;
    }

    let mut best: Option<(usize, f64)> = None;
    for offset in 0..len {
        let idx = (rotation + offset) % len;
        let score = scores[idx];
        match best {
            Some((_, top)) if score <= top => {}
            _ => best = Some((idx, score)),
        }
    }
    best.map(|(idx, _)| idx)
}

/// Epsilon-greedy pick over `count` scenarios.
///
/// `scores` is `None` when scoring failed; the rotation pointer is used then.
pub fn pick_scenario<R: Rng + ?Sized>(
    rng: &mut R,
    exploration_rate: f64,
    count: usize,
    scores: Option<&[f64]>,
    rotation: usize,
) -> Option<usize> {
    if count == 0 {
        return None;
    }

    if rng.random::<f64>() < exploration_rate {
        return Some(rng.random_range(0..count));
    }

    match scores {
        Some(scores) if scores.len() == count => best_scored(scores, rotation),
        _ => Some(rotation % count),
    }
}

/// Narrow exploration after a recent improvement, widen it when progress stalls
pub fn adapt_exploration_rate(current: f64, last_improvement: Option<DateTime<Utc>>, now: DateTime<Utc>) -> f64 {
    let improved_recently = last_improvement
        .map(|at| now.signed_duration_since(at) <= Duration::hours(1))
        .unwrap_or(false);

    if improved_recently {
        (current * 0.95).max(MIN_EXPLORATION_RATE)
    } else {
        (current * 1.05).min(MAX_EXPLORATION_RATE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashMap;

    fn record(reward: f64, success: bool) -> EventRecord {
        EventRecord {
            id: 0,
            timestamp: Utc::now(),
            agent: "continuous_learning".to_string(),
            provider: "p".to_string(),
            model: "m".to_string(),
            task_type: "experiment".to_string(),
            success,
            reward,
            latency_ms: 10.0,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn test_scenario_score() {
        assert_eq!(scenario_score(&[]), UNTESTED_SCORE);
        let events = vec![record(1.0, true), record(0.0, false)];
        assert!((scenario_score(&events) - 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_best_scored_tie_breaks_by_rotation() {
        let scores = [0.5, 0.9, 0.9, 0.1];
        assert_eq!(best_scored(&scores, 0), Some(1));
        assert_eq!(best_scored(&scores, 2), Some(2));
        assert_eq!(best_scored(&scores, 3), Some(1));
        assert_eq!(best_scored(&[], 0), None);
    }

    #[test]
    fn test_pick_scenario_without_exploration() {
        let mut rng = StdRng::seed_from_u64(3);
        let scores = [0.2, 0.8, 0.4];
        for _ in 0..10 {
            assert_eq!(pick_scenario(&mut rng, 0.0, 3, Some(&scores), 0), Some(1));
        }
        // Scoring failed: follow the rotation pointer
        assert_eq!(pick_scenario(&mut rng, 0.0, 3, None, 5), Some(2));
        assert_eq!(pick_scenario(&mut rng, 0.0, 0, None, 0), None);
    }

    #[test]
    fn test_pick_scenario_full_exploration_stays_in_range() {
        let mut rng = StdRng::seed_from_u64(11);
        let scores = [0.0, 1.0];
        let mut seen = [false; 2];
        for _ in 0..50 {
            let idx = pick_scenario(&mut rng, 1.0, 2, Some(&scores), 0).unwrap();
            seen[idx] = true;
        }
        assert!(seen[0] && seen[1]);
    }

    #[test]
    fn test_adapt_exploration_rate() {
        let now = Utc::now();
        let recent = Some(now - Duration::minutes(10));
        let stale = Some(now - Duration::hours(2));

        assert!((adapt_exploration_rate(0.2, recent, now) - 0.19).abs() < 1e-12);
        assert!((adapt_exploration_rate(0.2, stale, now) - 0.21).abs() < 1e-12);
        assert!((adapt_exploration_rate(0.2, None, now) - 0.21).abs() < 1e-12);
        assert_eq!(adapt_exploration_rate(0.1, recent, now), MIN_EXPLORATION_RATE);
        assert_eq!(adapt_exploration_rate(0.49, stale, now), MAX_EXPLORATION_RATE);
    }
}
