//! Continuous Learning Engine
//!
//! Runs exploratory experiments while the system is idle and folds the
//! results into provider/model preferences. Six background loops:
//! - activity monitor: notices outside traffic in the feedback log
//! - experiment scheduler: launches supervised experiment tasks
//! - optimization loop: re-syncs best configurations into the policy
//! - scenario rotator: advances the round-robin tie-breaker
//! - performance analyzer: summarizes reward trends
//! - state persistence: snapshots optimization state

pub mod provider;
pub mod scenarios;
pub mod selection;
pub mod state;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::FutureExt;
use rand::rngs::StdRng;
use rand::seq::IndexedRandom;
use rand::SeedableRng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::federated::{FederatedBroker, BROKER_AGENT};
use crate::feedback::{FeedbackEvent, META_EXPERIMENT_ID, META_SCENARIO_ID};
use crate::policy::PolicyManager;
use crate::snapshot::{ModelSnapshot, SnapshotStore, OPTIMIZATION_STATE_KEY, WINNING_CONFIG_KEY};
use crate::supervisor::{LoopSet, RunState};

pub use provider::{Invocation, ProviderInvoker, SimulatedInvoker, SimulatedProfile};
pub use scenarios::{default_scenarios, LearningScenario, SuccessThresholds};
pub use selection::{adapt_exploration_rate, best_scored, pick_scenario, scenario_score};
pub use state::{
    BestConfiguration, ExperimentResult, OptimizationState, PerformanceAnalysis, PersistedEngineState,
};

/// Agent label on every event the engine records
pub const ENGINE_AGENT: &str = "continuous_learning";

/// Events scanned by the activity monitor
const ACTIVITY_SCAN_LIMIT: usize = 20;
/// Upper bound on events pulled for performance analysis
const ANALYSIS_SCAN_LIMIT: usize = 1000;

#[derive(Debug, Default)]
struct CandidateStats {
    trials: usize,
    successes: usize,
    reward_sum: f64,
    latency_sum: f64,
}

impl CandidateStats {
    fn avg_reward(&self) -> f64 {
        self.reward_sum / self.trials as f64
    }
}

/// Idle-time optimizer over provider/model choices
pub struct LearningEngine {
    config: EngineConfig,
    policy: Arc<PolicyManager>,
    invoker: Arc<dyn ProviderInvoker>,
    broker: Option<Arc<FederatedBroker>>,
    snapshots: Option<Arc<dyn SnapshotStore>>,
    scenarios: Vec<LearningScenario>,
    state: RwLock<OptimizationState>,
    /// Serializes read-modify-write cycles on `state`
    state_update: Mutex<()>,
    loops: Mutex<Option<LoopSet>>,
    experiments: Mutex<HashMap<String, JoinHandle<()>>>,
    last_user_activity: Mutex<Instant>,
    rotation: AtomicUsize,
    rng: Mutex<StdRng>,
    last_analysis: RwLock<Option<PerformanceAnalysis>>,
}

impl LearningEngine {
    pub fn new(config: EngineConfig, policy: Arc<PolicyManager>, invoker: Arc<dyn ProviderInvoker>) -> Self {
        let state = OptimizationState::new(config.initial_learning_rate, config.initial_exploration_rate);
        Self {
            config,
            policy,
            invoker,
            broker: None,
            snapshots: None,
            scenarios: default_scenarios(),
            state: RwLock::new(state),
            state_update: Mutex::new(()),
            loops: Mutex::new(None),
            experiments: Mutex::new(HashMap::new()),
            last_user_activity: Mutex::new(Instant::now()),
            rotation: AtomicUsize::new(0),
            rng: Mutex::new(StdRng::from_os_rng()),
            last_analysis: RwLock::new(None),
        }
    }

    pub fn with_broker(mut self, broker: Arc<FederatedBroker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn with_snapshot_store(mut self, snapshots: Arc<dyn SnapshotStore>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    pub fn with_scenarios(mut self, scenarios: Vec<LearningScenario>) -> Self {
        self.scenarios = scenarios;
        self
    }

    /// Fixed RNG seed for reproducible exploration
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn scenarios(&self) -> &[LearningScenario] {
        &self.scenarios
    }

    pub async fn optimization_state(&self) -> OptimizationState {
        self.state.read().await.clone()
    }

    pub async fn latest_analysis(&self) -> Option<PerformanceAnalysis> {
        self.last_analysis.read().await.clone()
    }

    pub fn rotation_pointer(&self) -> usize {
        self.rotation.load(Ordering::SeqCst)
    }

    pub async fn state(&self) -> RunState {
        if self.loops.lock().await.is_some() {
            RunState::Running
        } else {
            RunState::Stopped
        }
    }

    // Idle tracking

    pub async fn mark_user_activity(&self) {
        *self.last_user_activity.lock().await = Instant::now();
    }

    pub async fn is_system_idle(&self) -> bool {
        self.last_user_activity.lock().await.elapsed() > self.config.idle_threshold()
    }

    /// Mark activity if an outside agent recorded an event inside the idle window
    pub async fn check_activity(&self) -> Result<bool> {
        let window = chrono::Duration::from_std(self.config.idle_threshold())
            .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let now = Utc::now();

        let events = self.policy.store().recent_events(ACTIVITY_SCAN_LIMIT).await?;
        let active = events.iter().any(|e| {
            e.agent != ENGINE_AGENT
                && e.agent != BROKER_AGENT
                && now.signed_duration_since(e.timestamp) <= window
        });

        if active {
            debug!("Recent outside activity detected");
            self.mark_user_activity().await;
        }
        Ok(active)
    }

    // Experiments

    /// Experiments currently in flight
    pub async fn running_experiments(&self) -> usize {
        let mut running = self.experiments.lock().await;
        running.retain(|_, handle| !handle.is_finished());
        running.len()
    }

    /// Launch an experiment if idle and below the concurrency cap.
    ///
    /// Returns the experiment id when one was started.
    pub async fn schedule_experiment(self: &Arc<Self>) -> Result<Option<String>> {
        if !self.is_system_idle().await {
            debug!("System active; skipping experiment");
            return Ok(None);
        }

        let mut running = self.experiments.lock().await;
        running.retain(|_, handle| !handle.is_finished());
        if running.len() >= self.config.max_concurrent_experiments {
            debug!(running = running.len(), "Experiment limit reached; skipping");
            return Ok(None);
        }

        let index = match self.select_next_scenario().await {
            Some(index) => index,
            None => return Ok(None),
        };

        let experiment_id = uuid::Uuid::new_v4().to_string();
        let engine = Arc::clone(self);
        let id = experiment_id.clone();

        // Insert under the same lock; the task removes its own entry on exit
        let handle = tokio::spawn(async move {
            let scenario = &engine.scenarios[index];
            match engine.run_experiment(scenario, &id).await {
                Ok(Some(result)) => {
                    if let Err(e) = engine.update_optimization_state(&result).await {
                        warn!(experiment = %id, "Failed to apply experiment result: {:#}", e);
                    }
                }
                Ok(None) => debug!(experiment = %id, "Experiment produced no result"),
                Err(e) => warn!(experiment = %id, "Experiment failed: {:#}", e),
            }
            engine.experiments.lock().await.remove(&id);
        });
        running.insert(experiment_id.clone(), handle);

        info!(
            experiment = %experiment_id,
            scenario = %self.scenarios[index].id,
            "Experiment launched"
        );
        Ok(Some(experiment_id))
    }

    /// Epsilon-greedy choice of the next scenario index
    pub async fn select_next_scenario(&self) -> Option<usize> {
        if self.scenarios.is_empty() {
            return None;
        }

        let scores = match self.scenario_scores().await {
            Ok(scores) => Some(scores),
            Err(e) => {
                warn!("Scenario scoring failed, using rotation: {:#}", e);
                None
            }
        };

        let exploration_rate = self.state.read().await.exploration_rate;
        let rotation = self.rotation_pointer();
        let mut rng = self.rng.lock().await;
        pick_scenario(&mut *rng, exploration_rate, self.scenarios.len(), scores.as_deref(), rotation)
    }

    async fn scenario_scores(&self) -> Result<Vec<f64>> {
        let mut scores = Vec::with_capacity(self.scenarios.len());
        for scenario in &self.scenarios {
            let events = self
                .policy
                .store()
                .recent_events_tagged(META_SCENARIO_ID, &scenario.id, selection::SCORE_WINDOW)
                .await?;
            scores.push(scenario_score(&events));
        }
        Ok(scores)
    }

    /// Try every candidate against a scenario.
    ///
    /// Stops early once the system is no longer idle. Returns the
    /// best-average-reward candidate, or `None` if nothing ran.
    pub async fn run_experiment(
        &self,
        scenario: &LearningScenario,
        experiment_id: &str,
    ) -> Result<Option<ExperimentResult>> {
        let mut stats: Vec<CandidateStats> = Vec::with_capacity(self.config.candidates.len());
        let trials = self.config.trials_per_candidate.max(1);

        'candidates: for candidate in &self.config.candidates {
            let mut candidate_stats = CandidateStats::default();

            for _ in 0..trials {
                if !self.is_system_idle().await {
                    debug!(experiment = experiment_id, "User returned; ending experiment early");
                    stats.push(candidate_stats);
                    break 'candidates;
                }

                let prompt = {
                    let mut rng = self.rng.lock().await;
                    scenario.test_prompts.choose(&mut *rng).cloned().unwrap_or_default()
                };

                let outcome = self.invoke_with_timeout(&candidate.provider, &candidate.model, &prompt).await;
                let success = scenario.trial_succeeded(&outcome);

                let event = FeedbackEvent::new(ENGINE_AGENT, &candidate.provider, &candidate.model, &scenario.id, success)
                    .with_reward(outcome.reward)
                    .with_latency(outcome.latency_ms)
                    .with_metadata(META_EXPERIMENT_ID, experiment_id)
                    .with_metadata(META_SCENARIO_ID, scenario.id.as_str());
                if let Err(e) = self.policy.store().insert_event(&event).await {
                    warn!(experiment = experiment_id, "Failed to record trial: {:#}", e);
                }

                candidate_stats.trials += 1;
                candidate_stats.successes += usize::from(success);
                candidate_stats.reward_sum += outcome.reward;
                candidate_stats.latency_sum += outcome.latency_ms;
            }

            stats.push(candidate_stats);
        }

        let mut best: Option<(usize, &CandidateStats)> = None;
        for (i, s) in stats.iter().enumerate() {
            if s.trials == 0 {
                continue;
            }
            match best {
                Some((_, top)) if s.avg_reward() <= top.avg_reward() => {}
                _ => best = Some((i, s)),
            }
        }

        let Some((index, winner)) = best else {
            return Ok(None);
        };
        let candidate = &self.config.candidates[index];
        let success_rate = winner.successes as f64 / winner.trials as f64;

        debug!(
            experiment = experiment_id,
            winner = %candidate,
            meets_target = scenario.meets_success_rate(success_rate),
            "Experiment finished"
        );

        Ok(Some(ExperimentResult {
            scenario_id: scenario.id.clone(),
            experiment_id: experiment_id.to_string(),
            provider: candidate.provider.clone(),
            model: candidate.model.clone(),
            success_rate,
            avg_latency_ms: winner.latency_sum / winner.trials as f64,
            avg_reward: winner.avg_reward(),
            timestamp: Utc::now(),
            sample_size: winner.trials,
        }))
    }

    async fn invoke_with_timeout(&self, provider: &str, model: &str, prompt: &str) -> Invocation {
        let started = Instant::now();
        let timeout = self.config.call_timeout();

        match tokio::time::timeout(timeout, self.invoker.invoke(provider, model, prompt)).await {
            Ok(Ok(outcome)) if outcome.is_well_formed() => outcome,
            Ok(Ok(outcome)) => {
                warn!(
                    provider,
                    model,
                    reward = outcome.reward,
                    latency_ms = outcome.latency_ms,
                    "Provider returned a malformed outcome; counting as failed"
                );
                Invocation::failed(started.elapsed().as_secs_f64() * 1000.0)
            }
            Ok(Err(e)) => {
                warn!(provider, model, "Provider call failed: {:#}", e);
                Invocation::failed(started.elapsed().as_secs_f64() * 1000.0)
            }
            Err(_) => {
                warn!(provider, model, "Provider call timed out after {:?}", timeout);
                Invocation::failed(timeout.as_secs_f64() * 1000.0)
            }
        }
    }

    /// Fold an experiment result into the optimization state.
    ///
    /// Returns true if it became the scenario's new best.
    pub async fn update_optimization_state(&self, result: &ExperimentResult) -> Result<bool> {
        let _guard = self.state_update.lock().await;

        let mut next = self.state.read().await.clone();
        let now = Utc::now();
        let improved = next.record_result(result, now);

        if improved {
            self.policy
                .set_task_preference(&result.scenario_id, &result.provider, &result.model)
                .await
                .context("Failed to push winning configuration into policy")?;
            info!(
                scenario = %result.scenario_id,
                provider = %result.provider,
                model = %result.model,
                reward = result.avg_reward,
                "New best configuration"
            );
        }

        next.exploration_rate = adapt_exploration_rate(next.exploration_rate, next.last_improvement, now);
        *self.state.write().await = next;

        if improved {
            self.publish_winner(result).await;
        }
        Ok(improved)
    }

    async fn publish_winner(&self, result: &ExperimentResult) {
        let (Some(broker), Some(snapshots)) = (&self.broker, &self.snapshots) else {
            return;
        };

        let payload = serde_json::json!({
            "scenario_id": result.scenario_id,
            "experiment_id": result.experiment_id,
            "provider": result.provider,
            "model": result.model,
            "avg_reward": result.avg_reward,
            "success_rate": result.success_rate,
        });
        let mut tags = HashMap::new();
        tags.insert("scenario_id".to_string(), result.scenario_id.clone());
        tags.insert("source".to_string(), ENGINE_AGENT.to_string());

        match snapshots
            .store_snapshot(payload.clone(), WINNING_CONFIG_KEY.to_string(), tags.clone())
            .await
        {
            Ok(handle) => {
                let snapshot = ModelSnapshot {
                    key: WINNING_CONFIG_KEY.to_string(),
                    payload,
                    tags,
                    handle,
                    created_at: Utc::now(),
                };
                broker.announce_snapshot(&snapshot).await;
            }
            Err(e) => warn!("Failed to publish winning configuration: {:#}", e),
        }
    }

    // Periodic work

    /// Advance the round, re-sync best configurations, adapt exploration
    pub async fn run_optimization_round(&self) -> Result<()> {
        let _guard = self.state_update.lock().await;
        let mut next = self.state.read().await.clone();
        next.current_round += 1;

        if !next.best_configurations.is_empty() {
            let best = &next.best_configurations;
            self.policy
                .modify_state(|priority, prefs| {
                    let mut changed = false;
                    for (scenario_id, best) in best {
                        let mut entry = HashMap::new();
                        entry.insert(best.provider.clone(), best.model.clone());
                        if prefs.get(scenario_id) != Some(&entry) {
                            prefs.insert(scenario_id.clone(), entry);
                            changed = true;
                        }
                        if !priority.contains(&best.provider) {
                            priority.push(best.provider.clone());
                            changed = true;
                        }
                    }
                    changed
                })
                .await?;
        }

        let now = Utc::now();
        next.exploration_rate = adapt_exploration_rate(next.exploration_rate, next.last_improvement, now);
        debug!(round = next.current_round, exploration = next.exploration_rate, "Optimization round");
        *self.state.write().await = next;
        Ok(())
    }

    /// Advance the rotation pointer, returning the new position
    pub fn rotate_scenarios(&self) -> usize {
        let len = self.scenarios.len().max(1);
        let next = (self.rotation.load(Ordering::SeqCst) + 1) % len;
        self.rotation.store(next, Ordering::SeqCst);
        debug!(rotation = next, "Scenario rotation advanced");
        next
    }

    /// Summarize recent rewards once enough events exist
    pub async fn analyze_performance(&self) -> Result<Option<PerformanceAnalysis>> {
        let limit = self.config.min_events_for_analysis.max(ANALYSIS_SCAN_LIMIT);
        let mut events = self.policy.store().recent_events(limit).await?;
        if events.is_empty() || events.len() < self.config.min_events_for_analysis {
            debug!(events = events.len(), "Not enough events for analysis");
            return Ok(None);
        }

        // Oldest first so the halves split older/newer
        events.reverse();
        let n = events.len() as f64;
        let mean_reward = events.iter().map(|e| e.reward).sum::<f64>() / n;
        let success_rate = events.iter().filter(|e| e.success).count() as f64 / n;

        let mid = events.len() / 2;
        let mean = |slice: &[crate::feedback::EventRecord]| {
            if slice.is_empty() {
                0.0
            } else {
                slice.iter().map(|e| e.reward).sum::<f64>() / slice.len() as f64
            }
        };
        let reward_trend = mean(&events[mid..]) - mean(&events[..mid]);

        let analysis = PerformanceAnalysis {
            sample_size: events.len(),
            mean_reward,
            success_rate,
            reward_trend,
            analyzed_at: Utc::now(),
        };

        info!(
            samples = analysis.sample_size,
            mean_reward = %format!("{:.3}", mean_reward),
            success_rate = %format!("{:.3}", success_rate),
            trend = %format!("{:+.3}", reward_trend),
            "Performance analysis"
        );

        *self.last_analysis.write().await = Some(analysis.clone());
        Ok(Some(analysis))
    }

    /// Write optimization state and scenario catalog to the snapshot store
    pub async fn persist_state(&self) -> Result<Option<String>> {
        let Some(snapshots) = &self.snapshots else {
            return Ok(None);
        };

        let persisted = PersistedEngineState {
            optimization: self.optimization_state().await,
            scenarios: self.scenarios.clone(),
            saved_at: Utc::now(),
        };
        let mut tags = HashMap::new();
        tags.insert("round".to_string(), persisted.optimization.current_round.to_string());

        let handle = snapshots
            .store_snapshot(serde_json::to_value(&persisted)?, OPTIMIZATION_STATE_KEY.to_string(), tags)
            .await
            .context("Failed to persist optimization state")?;

        info!(%handle, "Optimization state persisted");
        Ok(Some(handle))
    }

    /// Load the last persisted optimization state, if any
    pub async fn restore_state(&self) -> Result<bool> {
        let Some(snapshots) = &self.snapshots else {
            return Ok(false);
        };

        let Some(payload) = snapshots.load_latest(OPTIMIZATION_STATE_KEY.to_string()).await? else {
            return Ok(false);
        };

        let persisted: PersistedEngineState =
            serde_json::from_value(payload).context("Persisted optimization state is unreadable")?;

        let _guard = self.state_update.lock().await;
        *self.state.write().await = persisted.optimization;
        info!(saved_at = %persisted.saved_at, "Optimization state restored");
        Ok(true)
    }

    // Lifecycle

    /// Launch the background loops. No-op while running.
    pub async fn start_continuous_learning(self: &Arc<Self>) {
        let mut loops = self.loops.lock().await;
        if loops.is_some() {
            debug!("Continuous learning already running");
            return;
        }

        let mut set = LoopSet::new();
        let retry = self.config.retry_delay();
        let secs = |s: u64| Duration::from_secs(s.max(1));

        let engine = Arc::clone(self);
        set.spawn("activity_monitor", secs(self.config.activity_check_interval_secs), retry, move || {
            let engine = engine.clone();
            async move { engine.check_activity().await.map(|_| ()) }.boxed()
        });

        let engine = Arc::clone(self);
        set.spawn("experiment_scheduler", secs(self.config.experiment_interval_secs), retry, move || {
            let engine = engine.clone();
            async move { engine.schedule_experiment().await.map(|_| ()) }.boxed()
        });

        let engine = Arc::clone(self);
        set.spawn("optimization_loop", secs(self.config.optimization_interval_secs), retry, move || {
            let engine = engine.clone();
            async move { engine.run_optimization_round().await }.boxed()
        });

        let engine = Arc::clone(self);
        set.spawn("scenario_rotator", secs(self.config.scenario_rotation_interval_secs), retry, move || {
            let engine = engine.clone();
            async move {
                engine.rotate_scenarios();
                Ok(())
            }
            .boxed()
        });

        let engine = Arc::clone(self);
        set.spawn("performance_analyzer", secs(self.config.performance_analysis_interval_secs), retry, move || {
            let engine = engine.clone();
            async move { engine.analyze_performance().await.map(|_| ()) }.boxed()
        });

        let engine = Arc::clone(self);
        set.spawn("state_persistence", secs(self.config.persistence_interval_secs), retry, move || {
            let engine = engine.clone();
            async move { engine.persist_state().await.map(|_| ()) }.boxed()
        });

        info!(loops = set.len(), scenarios = self.scenarios.len(), "Continuous learning started");
        *loops = Some(set);
    }

    /// Stop every loop and cancel in-flight experiments. No-op while stopped.
    pub async fn stop_continuous_learning(&self) {
        let Some(set) = self.loops.lock().await.take() else {
            return;
        };

        set.shutdown().await;

        let handles: Vec<JoinHandle<()>> = self.experiments.lock().await.drain().map(|(_, h)| h).collect();
        let cancelled = handles.len();
        for handle in &handles {
            handle.abort();
        }
        futures::future::join_all(handles).await;

        info!(cancelled, "Continuous learning stopped");
    }
}
