//! Federated Learning Broker
//!
//! Provides:
//! - Node registry with active/inactive lifecycle
//! - Quorum-gated queue of model updates
//! - Sample-weighted federated averaging into a global model
//! - Feedback of aggregation outcomes into provider priority

pub mod averaging;
pub mod broker;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub use averaging::{federated_average, metrics_hash, total_samples, update_reward, AggregationError};
pub use broker::FederatedBroker;

/// Agent label on every event the broker records
pub const BROKER_AGENT: &str = "federated_learning";
/// Provider label on every event the broker records
pub const BROKER_PROVIDER: &str = "federated";

/// A participant in federated aggregation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederatedNode {
    pub node_id: String,
    /// Callback endpoint for the node
    pub endpoint: String,
    pub registered_at: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub model_version: String,
    pub performance_score: f64,
    pub is_active: bool,
    /// Number of aggregation rounds this node contributed to
    pub contributions: u64,
}

impl FederatedNode {
    pub fn new(node_id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            node_id: node_id.into(),
            endpoint: endpoint.into(),
            registered_at: now,
            last_seen: now,
            model_version: String::new(),
            performance_score: 0.0,
            is_active: true,
            contributions: 0,
        }
    }
}

/// One node's contribution for a round
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelUpdate {
    pub node_id: String,
    pub model_version: String,
    /// Content hash of the node's local model
    pub model_hash: String,
    pub metrics: BTreeMap<String, f64>,
    pub timestamp: DateTime<Utc>,
    /// Averaging weight
    pub data_samples: u64,
}

impl ModelUpdate {
    pub fn new(node_id: impl Into<String>, data_samples: u64) -> Self {
        Self {
            node_id: node_id.into(),
            model_version: String::new(),
            model_hash: String::new(),
            metrics: BTreeMap::new(),
            timestamp: Utc::now(),
            data_samples,
        }
    }

    pub fn with_metric(mut self, name: &str, value: f64) -> Self {
        self.metrics.insert(name.to_string(), value);
        self
    }

    pub fn with_version(mut self, version: impl Into<String>, hash: impl Into<String>) -> Self {
        self.model_version = version.into();
        self.model_hash = hash.into();
        self
    }

    /// The update's `accuracy` metric, or 0 when absent
    pub fn accuracy(&self) -> f64 {
        self.metrics.get("accuracy").copied().unwrap_or(0.0)
    }

    /// Value used for the node's performance score
    pub fn observed_performance(&self) -> f64 {
        if let Some(accuracy) = self.metrics.get("accuracy") {
            return *accuracy;
        }
        if self.metrics.is_empty() {
            return 0.0;
        }
        self.metrics.values().sum::<f64>() / self.metrics.len() as f64
    }
}

/// The current aggregated model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalModel {
    pub version: String,
    pub model_hash: String,
    pub aggregated_metrics: BTreeMap<String, f64>,
    pub participating_nodes: Vec<String>,
    /// Summary figures for the round (samples, participants)
    pub performance_metrics: BTreeMap<String, f64>,
    pub created_at: DateTime<Utc>,
}

/// Broker progress as seen by pollers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub total_nodes: usize,
    pub active_nodes: usize,
    pub pending_updates: usize,
    pub min_nodes_for_aggregation: usize,
    pub aggregation_rounds: u64,
    pub successful_rounds: u64,
    pub current_model_version: Option<String>,
    pub last_snapshot: Option<String>,
    pub running: bool,
}

/// EMA update of a node's performance score. The first observation is taken as-is.
pub fn smoothed_score(previous: Option<f64>, observed: f64, smoothing: f64) -> f64 {
    match previous {
        Some(prev) => smoothing * observed + (1.0 - smoothing) * prev,
        None => observed,
    }
}
