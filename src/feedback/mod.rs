//! Feedback Event Store
//!
//! Provides:
//! - Append-only log of task outcomes (feedback events)
//! - Provider/agent summaries ordered by mean reward
//! - The singleton policy state consulted by provider selection
//! - Per-session interaction memory

pub mod sqlite;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub use sqlite::{FeedbackStore, StoreStats};

/// Metadata key tagging an event with the experiment that produced it
pub const META_EXPERIMENT_ID: &str = "experiment_id";
/// Metadata key tagging an event with its learning scenario
pub const META_SCENARIO_ID: &str = "scenario_id";

/// Reasons an event is refused at the call boundary
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("provider must not be empty")]
    EmptyProvider,
    #[error("task type must not be empty")]
    EmptyTaskType,
    #[error("agent must not be empty")]
    EmptyAgent,
    #[error("reward must be a finite number, got {0}")]
    InvalidReward(f64),
    #[error("latency must be a finite, non-negative number of milliseconds, got {0}")]
    InvalidLatency(f64),
}

/// A task outcome to be appended to the log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackEvent {
    /// When the outcome was observed
    pub timestamp: DateTime<Utc>,
    /// Agent or category that produced the outcome
    pub agent: String,
    /// Provider identifier
    pub provider: String,
    /// Model identifier
    pub model: String,
    /// Task-type label
    pub task_type: String,
    /// Whether the task succeeded
    pub success: bool,
    /// Explicit reward; derived from `success` when absent
    pub reward: Option<f64>,
    /// Latency in milliseconds
    pub latency_ms: f64,
    /// Free-form metadata
    pub metadata: HashMap<String, serde_json::Value>,
}

impl FeedbackEvent {
    pub fn new(
        agent: impl Into<String>,
        provider: impl Into<String>,
        model: impl Into<String>,
        task_type: impl Into<String>,
        success: bool,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            agent: agent.into(),
            provider: provider.into(),
            model: model.into(),
            task_type: task_type.into(),
            success,
            reward: None,
            latency_ms: 0.0,
            metadata: HashMap::new(),
        }
    }

    pub fn with_reward(mut self, reward: f64) -> Self {
        self.reward = Some(reward);
        self
    }

    pub fn with_latency(mut self, latency_ms: f64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Reward that will be stored for this event
    pub fn resolved_reward(&self) -> f64 {
        self.reward.unwrap_or(if self.success { 1.0 } else { 0.0 })
    }

    /// Check the event before it is written
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.agent.trim().is_empty() {
            return Err(ValidationError::EmptyAgent);
        }
        if self.provider.trim().is_empty() {
            return Err(ValidationError::EmptyProvider);
        }
        if self.task_type.trim().is_empty() {
            return Err(ValidationError::EmptyTaskType);
        }
        if let Some(reward) = self.reward {
            if !reward.is_finite() {
                return Err(ValidationError::InvalidReward(reward));
            }
        }
        if !self.latency_ms.is_finite() || self.latency_ms < 0.0 {
            return Err(ValidationError::InvalidLatency(self.latency_ms));
        }
        Ok(())
    }
}

/// A stored feedback event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRecord {
    /// Monotonic insertion id
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub agent: String,
    pub provider: String,
    pub model: String,
    pub task_type: String,
    pub success: bool,
    pub reward: f64,
    pub latency_ms: f64,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl EventRecord {
    /// String metadata value for a key
    pub fn meta_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(|v| v.as_str())
    }
}

/// Aggregate outcome statistics for one provider or agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutcomeSummary {
    /// Provider or agent value
    pub key: String,
    pub count: u64,
    pub successes: u64,
    pub avg_reward: f64,
    pub avg_latency_ms: f64,
}

impl OutcomeSummary {
    pub fn success_rate(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.successes as f64 / self.count as f64
        }
    }
}

/// task type -> (provider -> preferred model)
pub type ModelPreferences = HashMap<String, HashMap<String, String>>;

/// Persisted provider/model selection preferences
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PolicyState {
    /// Providers in priority order
    pub provider_priority: Vec<String>,
    /// Preferred model per provider, keyed by task type
    pub model_prefs: ModelPreferences,
    pub updated_at: DateTime<Utc>,
}

impl PolicyState {
    pub fn new(provider_priority: Vec<String>) -> Self {
        Self {
            provider_priority,
            model_prefs: HashMap::new(),
            updated_at: Utc::now(),
        }
    }
}

/// An entry in a session's interaction log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: i64,
    pub session_id: String,
    pub timestamp: DateTime<Utc>,
    pub agent: String,
    pub event: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reward_defaults_from_success() {
        let ok = FeedbackEvent::new("agent", "p1", "m1", "chat", true);
        let failed = FeedbackEvent::new("agent", "p1", "m1", "chat", false);
        assert_eq!(ok.resolved_reward(), 1.0);
        assert_eq!(failed.resolved_reward(), 0.0);
        assert_eq!(failed.with_reward(0.4).resolved_reward(), 0.4);
    }

    #[test]
    fn test_validation() {
        let event = FeedbackEvent::new("agent", "", "m1", "chat", true);
        assert_eq!(event.validate(), Err(ValidationError::EmptyProvider));

        let event = FeedbackEvent::new("agent", "p1", "m1", " ", true);
        assert_eq!(event.validate(), Err(ValidationError::EmptyTaskType));

        let event = FeedbackEvent::new("agent", "p1", "m1", "chat", true).with_reward(f64::NAN);
        assert!(matches!(event.validate(), Err(ValidationError::InvalidReward(_))));

        let event = FeedbackEvent::new("agent", "p1", "m1", "chat", true).with_latency(-1.0);
        assert!(matches!(event.validate(), Err(ValidationError::InvalidLatency(_))));

        let event = FeedbackEvent::new("agent", "p1", "", "chat", true);
        assert!(event.validate().is_ok());
    }

    #[test]
    fn test_summary_success_rate() {
        let summary = OutcomeSummary {
            key: "p1".to_string(),
            count: 4,
            successes: 3,
            avg_reward: 0.75,
            avg_latency_ms: 120.0,
        };
        assert_eq!(summary.success_rate(), 0.75);
    }
}
