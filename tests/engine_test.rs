//! Continuous learning engine integration tests

use adaptive_policy::config::{EngineConfig, PolicyConfig};
use adaptive_policy::engine::{LearningScenario, SuccessThresholds, ENGINE_AGENT};
use adaptive_policy::feedback::{META_EXPERIMENT_ID, META_SCENARIO_ID};
use adaptive_policy::supervisor::RunState;
use adaptive_policy::{
    Complexity, ExperimentResult, FeedbackEvent, FeedbackStore, Invocation, LearningEngine, Modality,
    PolicyManager, ProviderChoice, ProviderInvoker,
};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Fixed reward per provider, optional sleep per call
struct FixedInvoker {
    rewards: HashMap<String, f64>,
    latency_ms: f64,
    delay: Duration,
}

impl FixedInvoker {
    fn new(rewards: &[(&str, f64)]) -> Self {
        Self {
            rewards: rewards.iter().map(|(p, r)| (p.to_string(), *r)).collect(),
            latency_ms: 100.0,
            delay: Duration::ZERO,
        }
    }

    fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl ProviderInvoker for FixedInvoker {
    async fn invoke(&self, provider: &str, _model: &str, _prompt: &str) -> anyhow::Result<Invocation> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        match self.rewards.get(provider) {
            Some(reward) => Ok(Invocation::new(self.latency_ms, true, *reward)),
            None => anyhow::bail!("unknown provider {}", provider),
        }
    }
}

fn scenario() -> LearningScenario {
    LearningScenario {
        id: "qa".to_string(),
        name: "QA".to_string(),
        description: "Short answers".to_string(),
        test_prompts: vec!["What is 2 + 2?".to_string()],
        expected_keywords: vec!["4".to_string()],
        complexity: Complexity::Simple,
        modalities: vec![Modality::Text],
        thresholds: SuccessThresholds { min_reward: 0.6, max_latency_ms: 1_000.0, min_success_rate: 0.5 },
    }
}

fn config(candidates: &[(&str, &str)], trials: usize) -> EngineConfig {
    EngineConfig {
        trials_per_candidate: trials,
        call_timeout_secs: 5,
        candidates: candidates.iter().map(|(p, m)| ProviderChoice::new(*p, *m)).collect(),
        ..EngineConfig::default()
    }
}

fn setup(config: EngineConfig, invoker: FixedInvoker) -> anyhow::Result<(Arc<LearningEngine>, Arc<PolicyManager>)> {
    let store = Arc::new(FeedbackStore::in_memory()?);
    let policy = Arc::new(PolicyManager::new(store, &PolicyConfig::default()));
    let engine = LearningEngine::new(config, policy.clone(), Arc::new(invoker))
        .with_scenarios(vec![scenario()])
        .with_seed(7);
    Ok((Arc::new(engine), policy))
}

fn result(provider: &str, reward: f64) -> ExperimentResult {
    ExperimentResult {
        scenario_id: "qa".to_string(),
        experiment_id: format!("exp-{}", provider),
        provider: provider.to_string(),
        model: "m".to_string(),
        success_rate: 1.0,
        avg_latency_ms: 100.0,
        avg_reward: reward,
        timestamp: Utc::now(),
        sample_size: 1,
    }
}

#[tokio::test(start_paused = true)]
async fn test_idle_after_threshold() -> anyhow::Result<()> {
    let (engine, _) = setup(EngineConfig::default(), FixedInvoker::new(&[]))?;

    engine.mark_user_activity().await;
    assert!(!engine.is_system_idle().await);

    tokio::time::advance(Duration::from_secs(59)).await;
    assert!(!engine.is_system_idle().await);

    tokio::time::advance(Duration::from_secs(2)).await;
    assert!(engine.is_system_idle().await);

    engine.mark_user_activity().await;
    assert!(!engine.is_system_idle().await);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_experiment_picks_highest_reward() -> anyhow::Result<()> {
    let invoker = FixedInvoker::new(&[("a", 0.5), ("b", 0.9), ("c", 0.7)]);
    let (engine, policy) = setup(config(&[("a", "a-1"), ("b", "b-1"), ("c", "c-1")], 2), invoker)?;
    tokio::time::advance(Duration::from_secs(61)).await;

    let scenario = scenario();
    let result = engine.run_experiment(&scenario, "exp-1").await?.expect("experiment ran");

    assert_eq!(result.provider, "b");
    assert_eq!(result.model, "b-1");
    assert_eq!(result.sample_size, 2);
    assert!((result.avg_reward - 0.9).abs() < 1e-12);
    assert!((result.success_rate - 1.0).abs() < 1e-12);

    let trials = policy.store().recent_events_tagged(META_EXPERIMENT_ID, "exp-1", 100).await?;
    assert_eq!(trials.len(), 6);
    assert!(trials.iter().all(|e| e.agent == ENGINE_AGENT && e.task_type == "qa"));
    assert!(trials.iter().all(|e| e.meta_str(META_SCENARIO_ID) == Some("qa")));
    // Below the reward bar counts as a failed trial
    assert!(trials.iter().filter(|e| e.provider == "a").all(|e| !e.success));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_experiment_skipped_while_user_active() -> anyhow::Result<()> {
    let (engine, policy) = setup(config(&[("a", "a-1")], 1), FixedInvoker::new(&[("a", 0.9)]))?;

    assert!(engine.run_experiment(&scenario(), "exp-1").await?.is_none());
    assert!(engine.schedule_experiment().await?.is_none());
    assert_eq!(policy.store().event_count().await?, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_failed_and_timed_out_calls_score_zero() -> anyhow::Result<()> {
    let invoker = FixedInvoker::new(&[("slow", 0.9)]).with_delay(Duration::from_secs(30));
    let (engine, policy) = setup(config(&[("slow", "s-1"), ("missing", "m-1")], 1), invoker)?;
    tokio::time::advance(Duration::from_secs(61)).await;

    let result = engine.run_experiment(&scenario(), "exp-t").await?.expect("experiment ran");
    assert_eq!(result.avg_reward, 0.0);
    assert_eq!(result.success_rate, 0.0);
    // Ties keep the first candidate
    assert_eq!(result.provider, "slow");

    let trials = policy.store().recent_events_tagged(META_EXPERIMENT_ID, "exp-t", 10).await?;
    assert_eq!(trials.len(), 2);
    assert!(trials.iter().all(|e| !e.success && e.reward == 0.0));
    let timed_out = trials.iter().find(|e| e.provider == "slow").expect("slow trial");
    assert!((timed_out.latency_ms - 5_000.0).abs() < 1e-9);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_scheduler_respects_concurrency_cap() -> anyhow::Result<()> {
    let invoker = FixedInvoker::new(&[("a", 0.8), ("b", 0.6)]).with_delay(Duration::from_secs(2));
    let mut config = config(&[("a", "a-1"), ("b", "b-1")], 1);
    config.max_concurrent_experiments = 1;
    let (engine, policy) = setup(config, invoker)?;
    tokio::time::advance(Duration::from_secs(61)).await;

    let first = engine.schedule_experiment().await?;
    assert!(first.is_some());
    assert_eq!(engine.running_experiments().await, 1);
    assert!(engine.schedule_experiment().await?.is_none());

    while engine.running_experiments().await > 0 {
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    let state = engine.optimization_state().await;
    assert_eq!(state.total_experiments, 1);
    assert_eq!(state.best_configurations["qa"].provider, "a");

    let prefs = policy.current_state().await?.model_prefs;
    assert_eq!(prefs["qa"]["a"], "a-1");
    Ok(())
}

#[tokio::test]
async fn test_best_reward_is_monotonic() -> anyhow::Result<()> {
    let (engine, _) = setup(EngineConfig::default(), FixedInvoker::new(&[]))?;

    let mut best_seen = f64::MIN;
    for (provider, reward) in [("a", 0.3), ("b", 0.8), ("c", 0.2), ("d", 0.8), ("e", 0.95), ("f", 0.1)] {
        engine.update_optimization_state(&result(provider, reward)).await?;
        let best = engine.optimization_state().await.best_configurations["qa"].avg_reward;
        assert!(best >= best_seen);
        best_seen = best;
    }

    let state = engine.optimization_state().await;
    assert_eq!(state.total_experiments, 6);
    assert_eq!(state.successful_optimizations, 3);
    assert_eq!(state.best_configurations["qa"].provider, "e");
    assert!(state.exploration_rate >= 0.1 && state.exploration_rate <= 0.5);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_activity_monitor_ignores_internal_agents() -> anyhow::Result<()> {
    let (engine, policy) = setup(EngineConfig::default(), FixedInvoker::new(&[]))?;
    tokio::time::advance(Duration::from_secs(61)).await;
    assert!(engine.is_system_idle().await);

    policy.store().insert_event(&FeedbackEvent::new(ENGINE_AGENT, "p", "m", "qa", true)).await?;
    assert!(!engine.check_activity().await?);
    assert!(engine.is_system_idle().await);

    policy.store().insert_event(&FeedbackEvent::new("assistant", "p", "m", "chat", true)).await?;
    assert!(engine.check_activity().await?);
    assert!(!engine.is_system_idle().await);
    Ok(())
}

#[tokio::test]
async fn test_start_and_stop_are_idempotent() -> anyhow::Result<()> {
    let (engine, _) = setup(EngineConfig::default(), FixedInvoker::new(&[]))?;
    assert_eq!(engine.state().await, RunState::Stopped);

    engine.stop_continuous_learning().await;
    assert_eq!(engine.state().await, RunState::Stopped);

    engine.start_continuous_learning().await;
    engine.start_continuous_learning().await;
    assert_eq!(engine.state().await, RunState::Running);

    engine.stop_continuous_learning().await;
    engine.stop_continuous_learning().await;
    assert_eq!(engine.state().await, RunState::Stopped);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_non_finite_reward_counts_as_failed_trial() -> anyhow::Result<()> {
    let invoker = FixedInvoker::new(&[("bad", f64::NAN), ("good", 0.7)]);
    let (engine, policy) = setup(config(&[("bad", "b-1"), ("good", "g-1")], 1), invoker)?;
    tokio::time::advance(Duration::from_secs(61)).await;

    let outcome = engine.run_experiment(&scenario(), "exp-nan").await?.expect("experiment ran");
    assert_eq!(outcome.provider, "good");
    assert!((outcome.avg_reward - 0.7).abs() < 1e-12);

    // Every trial is backed by a stored event
    let trials = policy.store().recent_events_tagged(META_EXPERIMENT_ID, "exp-nan", 10).await?;
    assert_eq!(trials.len(), 2);
    let bad = trials.iter().find(|e| e.provider == "bad").expect("bad trial recorded");
    assert!(!bad.success);
    assert_eq!(bad.reward, 0.0);

    assert!(engine.update_optimization_state(&outcome).await?);
    assert!(engine.update_optimization_state(&result("good", 0.9)).await?);
    let best = &engine.optimization_state().await.best_configurations["qa"];
    assert!((best.avg_reward - 0.9).abs() < 1e-12);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_stop_cancels_in_flight_experiment() -> anyhow::Result<()> {
    let invoker = FixedInvoker::new(&[("a", 0.8)]).with_delay(Duration::from_secs(10));
    let mut config = config(&[("a", "a-1")], 3);
    config.call_timeout_secs = 30;
    let (engine, policy) = setup(config, invoker)?;
    tokio::time::advance(Duration::from_secs(61)).await;

    engine.start_continuous_learning().await;
    let id = engine.schedule_experiment().await?.expect("experiment launched");

    // Partway through the second trial
    tokio::time::sleep(Duration::from_secs(15)).await;
    assert_eq!(engine.running_experiments().await, 1);

    engine.stop_continuous_learning().await;
    assert_eq!(engine.running_experiments().await, 0);

    tokio::time::sleep(Duration::from_secs(120)).await;
    let state = engine.optimization_state().await;
    assert_eq!(state.total_experiments, 0);
    assert!(state.best_configurations.is_empty());

    let trials = policy.store().recent_events_tagged(META_EXPERIMENT_ID, &id, 10).await?;
    assert_eq!(trials.len(), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_experiment_stops_when_user_returns() -> anyhow::Result<()> {
    let invoker = FixedInvoker::new(&[("a", 0.6), ("b", 0.9), ("c", 0.99)]).with_delay(Duration::from_secs(10));
    let mut config = config(&[("a", "a-1"), ("b", "b-1"), ("c", "c-1")], 1);
    config.call_timeout_secs = 30;
    let (engine, policy) = setup(config, invoker)?;
    tokio::time::advance(Duration::from_secs(61)).await;

    let runner = {
        let engine = engine.clone();
        tokio::spawn(async move { engine.run_experiment(&scenario(), "exp-back").await })
    };

    // The user comes back while b's call is in flight
    tokio::time::sleep(Duration::from_secs(15)).await;
    engine.mark_user_activity().await;

    let result = runner.await??.expect("partial experiment still reports");
    assert_eq!(result.provider, "b");

    let trials = policy.store().recent_events_tagged(META_EXPERIMENT_ID, "exp-back", 10).await?;
    assert_eq!(trials.len(), 2);
    assert!(trials.iter().all(|e| e.provider != "c"));
    Ok(())
}
