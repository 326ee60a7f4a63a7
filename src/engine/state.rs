//! Optimization bookkeeping types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::scenarios::LearningScenario;

/// Best known (provider, model) for a scenario
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BestConfiguration {
    pub provider: String,
    pub model: String,
    pub avg_reward: f64,
    pub success_rate: f64,
    pub timestamp: DateTime<Utc>,
}

/// Winning candidate of one experiment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentResult {
    pub scenario_id: String,
    pub experiment_id: String,
    pub provider: String,
    pub model: String,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub avg_reward: f64,
    pub timestamp: DateTime<Utc>,
    pub sample_size: usize,
}

/// Engine-wide optimization progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizationState {
    pub current_round: u64,
    pub total_experiments: u64,
    pub successful_optimizations: u64,
    pub last_improvement: Option<DateTime<Utc>>,
    /// scenario id -> best configuration
    pub best_configurations: BTreeMap<String, BestConfiguration>,
    pub learning_rate: f64,
    pub exploration_rate: f64,
}

impl OptimizationState {
    pub fn new(learning_rate: f64, exploration_rate: f64) -> Self {
        Self {
            current_round: 0,
            total_experiments: 0,
            successful_optimizations: 0,
            last_improvement: None,
            best_configurations: BTreeMap::new(),
            learning_rate,
            exploration_rate,
        }
    }

    /// Fold an experiment result in. Returns true if it beat the recorded best.
    ///
    /// A non-finite reward never becomes the best; a non-finite incumbent
    /// loses to any finite reward.
    pub fn record_result(&mut self, result: &ExperimentResult, now: DateTime<Utc>) -> bool {
        self.total_experiments += 1;

        let improved = result.avg_reward.is_finite()
            && self
                .best_configurations
                .get(&result.scenario_id)
                .map(|best| !best.avg_reward.is_finite() || result.avg_reward > best.avg_reward)
                .unwrap_or(true);

        if improved {
            self.best_configurations.insert(
                result.scenario_id.clone(),
                BestConfiguration {
                    provider: result.provider.clone(),
                    model: result.model.clone(),
                    avg_reward: result.avg_reward,
                    success_rate: result.success_rate,
                    timestamp: now,
                },
            );
            self.successful_optimizations += 1;
            self.last_improvement = Some(now);
        }

        improved
    }
}

/// Summary produced by the performance analyzer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceAnalysis {
    pub sample_size: usize,
    pub mean_reward: f64,
    pub success_rate: f64,
    /// Mean reward of the newer half minus the older half
    pub reward_trend: f64,
    pub analyzed_at: DateTime<Utc>,
}

/// What the persistence loop writes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedEngineState {
    pub optimization: OptimizationState,
    pub scenarios: Vec<LearningScenario>,
    pub saved_at: DateTime<Utc>,
}
