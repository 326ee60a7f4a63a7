//! Policy Manager
//!
//! Deterministic (provider, model) selection over the feedback store.
//! Exploration is injected by the learning engine; nothing here is random.

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::{PolicyConfig, TierModels};
use crate::feedback::{FeedbackEvent, FeedbackStore, ModelPreferences, PolicyState};
use crate::types::{Complexity, Modality, ProviderChoice};

/// Prompts longer than this (in characters) are treated as complex
pub const COMPLEX_PROMPT_CHARS: usize = 600;

const CODE_MARKERS: &[&str] = &["```", "def ", "fn ", "function ", "class ", "import ", "#include"];
const SQL_MARKERS: &[&str] = &["select ", "insert into", "delete from", "create table", "alter table"];

/// Classify a task into a complexity tier
pub fn classify_complexity(prompt: &str, modalities: &[Modality]) -> Complexity {
    if modalities.iter().any(Modality::is_media) {
        return Complexity::Complex;
    }

    if prompt.chars().count() > COMPLEX_PROMPT_CHARS {
        return Complexity::Complex;
    }

    if CODE_MARKERS.iter().any(|m| prompt.contains(m)) {
        return Complexity::Complex;
    }

    let lower = prompt.to_lowercase();
    if SQL_MARKERS.iter().any(|m| lower.contains(m)) {
        return Complexity::Complex;
    }

    Complexity::Simple
}

/// Selects providers and models from accumulated reward history
pub struct PolicyManager {
    store: Arc<FeedbackStore>,
    default_models: HashMap<String, TierModels>,
    /// Held across every read-modify-write of the policy state
    state_lock: Mutex<()>,
}

impl PolicyManager {
    pub fn new(store: Arc<FeedbackStore>, config: &PolicyConfig) -> Self {
        Self {
            store,
            default_models: config.default_models.clone(),
            state_lock: Mutex::new(()),
        }
    }

    pub fn store(&self) -> &Arc<FeedbackStore> {
        &self.store
    }

    fn default_model(&self, provider: &str, tier: Complexity) -> Option<&str> {
        self.default_models.get(provider).and_then(|m| m.for_tier(tier))
    }

    /// Pick the provider and model for a task
    pub async fn choose_provider_model(
        &self,
        prompt: &str,
        task_type: &str,
        modalities: &[Modality],
    ) -> Result<ProviderChoice> {
        let tier = classify_complexity(prompt, modalities);
        let state = self.store.get_policy_state().await?;

        // Explicit per-task preference wins, walking priority order
        if let Some(prefs) = state.model_prefs.get(task_type) {
            for provider in &state.provider_priority {
                if let Some(model) = prefs.get(provider) {
                    debug!(task_type, %provider, %model, "Using stored preference");
                    return Ok(ProviderChoice::new(provider.as_str(), model.as_str()));
                }
            }
        }

        // Re-rank by mean reward; stable sort keeps priority order on ties
        let summary = self.store.summary_by_provider().await?;
        let rewards: HashMap<&str, f64> = summary
            .iter()
            .map(|s| (s.key.as_str(), s.avg_reward))
            .collect();

        let mut ranked: Vec<&String> = state.provider_priority.iter().collect();
        ranked.sort_by(|a, b| {
            let ra = rewards.get(a.as_str()).copied().unwrap_or(0.0);
            let rb = rewards.get(b.as_str()).copied().unwrap_or(0.0);
            rb.partial_cmp(&ra).unwrap_or(std::cmp::Ordering::Equal)
        });

        for provider in ranked {
            if let Some(model) = self.default_model(provider, tier) {
                debug!(task_type, %provider, model, tier = %tier, "Using ranked default");
                return Ok(ProviderChoice::new(provider.as_str(), model));
            }
        }

        // Fallback: first priority provider with its simple default
        let provider = state.provider_priority.first().cloned().unwrap_or_default();
        let model = self
            .default_model(&provider, Complexity::Simple)
            .unwrap_or_default()
            .to_string();
        debug!(task_type, %provider, %model, "Falling back to first priority provider");
        Ok(ProviderChoice { provider, model })
    }

    /// Record an outcome as a feedback event
    #[allow(clippy::too_many_arguments)]
    pub async fn update_reward(
        &self,
        agent: &str,
        provider: &str,
        model: &str,
        task_type: &str,
        success: bool,
        reward: Option<f64>,
        latency_ms: f64,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<i64> {
        let mut event = FeedbackEvent::new(agent, provider, model, task_type, success)
            .with_latency(latency_ms);
        event.reward = reward;
        event.metadata = metadata;
        self.store.insert_event(&event).await
    }

    /// Current policy state
    pub async fn current_state(&self) -> Result<PolicyState> {
        self.store.get_policy_state().await
    }

    /// Replace both priority and preferences
    pub async fn set_preferences(
        &self,
        provider_priority: Vec<String>,
        model_prefs: ModelPreferences,
    ) -> Result<PolicyState> {
        let _guard = self.state_lock.lock().await;
        self.store.set_policy_state(provider_priority, model_prefs).await
    }

    /// Read, edit and write back the policy state as one step.
    ///
    /// `edit` returns false when it changed nothing; the state is then
    /// returned without a write.
    pub async fn modify_state<F>(&self, edit: F) -> Result<PolicyState>
    where
        F: FnOnce(&mut Vec<String>, &mut ModelPreferences) -> bool,
    {
        let _guard = self.state_lock.lock().await;
        let mut state = self.store.get_policy_state().await?;

        if !edit(&mut state.provider_priority, &mut state.model_prefs) {
            return Ok(state);
        }
        self.store.set_policy_state(state.provider_priority, state.model_prefs).await
    }

    /// Make `provider`/`model` the sole preference for one task type,
    /// leaving other task types untouched
    pub async fn set_task_preference(&self, task_type: &str, provider: &str, model: &str) -> Result<PolicyState> {
        let state = self
            .modify_state(|priority, prefs| {
                let mut entry = HashMap::new();
                entry.insert(provider.to_string(), model.to_string());
                prefs.insert(task_type.to_string(), entry);

                if !priority.iter().any(|p| p == provider) {
                    priority.push(provider.to_string());
                }
                true
            })
            .await?;

        info!(task_type, provider, model, "Task preference updated");
        Ok(state)
    }

    /// Move the given ids to the front of the priority list in order.
    ///
    /// Ids already in the list move ahead of everything else; ids that are
    /// not yet known are appended after the known providers.
    pub async fn promote_providers(&self, ids: &[String]) -> Result<PolicyState> {
        self.modify_state(|priority, _| {
            let promoted = promoted_priority(priority, ids);
            if promoted == *priority {
                return false;
            }
            info!("Provider priority promoted: {:?}", promoted);
            *priority = promoted;
            true
        })
        .await
    }
}

fn promoted_priority(current: &[String], ids: &[String]) -> Vec<String> {
    let mut front: Vec<String> = Vec::new();
    let mut unknown: Vec<String> = Vec::new();

    for id in ids {
        if front.contains(id) || unknown.contains(id) {
            continue;
        }
        if current.contains(id) {
            front.push(id.clone());
        } else {
            unknown.push(id.clone());
        }
    }

    let mut priority = front.clone();
    priority.extend(current.iter().filter(|p| !front.contains(p)).cloned());
    priority.extend(unknown);
    priority
}
