//! Federated learning broker

use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{
    federated_average, metrics_hash, smoothed_score, total_samples, update_reward, FederatedNode, GlobalModel,
    ModelUpdate, NetworkStatus, BROKER_AGENT, BROKER_PROVIDER,
};
use crate::config::FederatedConfig;
use crate::feedback::FeedbackEvent;
use crate::policy::PolicyManager;
use crate::snapshot::ModelSnapshot;
use crate::supervisor::{LoopSet, RunState};

const TASK_REGISTRATION: &str = "node_registration";
const TASK_MODEL_UPDATE: &str = "model_update";
const TASK_AGGREGATION: &str = "federated_aggregation";
const TASK_CLEANUP: &str = "node_cleanup";
const TASK_SNAPSHOT: &str = "snapshot_announcement";

#[derive(Default)]
struct BrokerState {
    nodes: HashMap<String, FederatedNode>,
    pending: Vec<ModelUpdate>,
    current_model: Option<GlobalModel>,
    /// Aggregation attempts, successful or not
    round: u64,
    successful_rounds: u64,
    last_snapshot: Option<String>,
}

/// Registry, update queue and aggregation for federated nodes
pub struct FederatedBroker {
    config: FederatedConfig,
    policy: Arc<PolicyManager>,
    state: Mutex<BrokerState>,
    loops: Mutex<Option<LoopSet>>,
}

impl FederatedBroker {
    pub fn new(config: FederatedConfig, policy: Arc<PolicyManager>) -> Self {
        Self {
            config,
            policy,
            state: Mutex::new(BrokerState::default()),
            loops: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &FederatedConfig {
        &self.config
    }

    async fn log_event(&self, event: FeedbackEvent) {
        if let Err(e) = self.policy.store().insert_event(&event).await {
            warn!("Failed to record {} event: {:#}", event.task_type, e);
        }
    }

    fn event(task_type: &str, model: &str, success: bool) -> FeedbackEvent {
        FeedbackEvent::new(BROKER_AGENT, BROKER_PROVIDER, model, task_type, success)
    }

    /// Register (or re-activate) a node
    pub async fn register_node(&self, node: FederatedNode) -> bool {
        let node_id = node.node_id.trim().to_string();
        if node_id.is_empty() || node.endpoint.trim().is_empty() {
            warn!("Rejected node registration with empty id or endpoint");
            self.log_event(
                Self::event(TASK_REGISTRATION, &node_id, false)
                    .with_metadata("endpoint", node.endpoint.clone()),
            )
            .await;
            return false;
        }

        let now = Utc::now();
        {
            let mut state = self.state.lock().await;
            let previous = state.nodes.get(&node_id).cloned();
            let entry = FederatedNode {
                node_id: node_id.clone(),
                endpoint: node.endpoint.clone(),
                registered_at: previous.as_ref().map(|p| p.registered_at).unwrap_or(now),
                last_seen: now,
                model_version: node.model_version.clone(),
                performance_score: previous.as_ref().map(|p| p.performance_score).unwrap_or(node.performance_score),
                is_active: true,
                contributions: previous.as_ref().map(|p| p.contributions).unwrap_or(0),
            };
            state.nodes.insert(node_id.clone(), entry);
        }

        info!(node_id = %node_id, endpoint = %node.endpoint, "Federated node registered");
        self.log_event(
            Self::event(TASK_REGISTRATION, &node_id, true)
                .with_metadata("node_id", node_id.clone())
                .with_metadata("endpoint", node.endpoint),
        )
        .await;
        true
    }

    /// Queue an update from an active node, aggregating once quorum is reached
    pub async fn submit_model_update(&self, mut update: ModelUpdate) -> bool {
        let mut state = self.state.lock().await;

        let node = match state.nodes.get_mut(&update.node_id) {
            Some(node) if node.is_active => node,
            Some(_) => {
                debug!(node_id = %update.node_id, "Rejected update from inactive node");
                return false;
            }
            None => {
                debug!(node_id = %update.node_id, "Rejected update from unregistered node");
                return false;
            }
        };

        let now = Utc::now();
        node.last_seen = now;
        if !update.model_version.is_empty() {
            node.model_version = update.model_version.clone();
        }
        update.timestamp = now;

        let reward = update_reward(update.data_samples, update.accuracy());
        let event = Self::event(TASK_MODEL_UPDATE, &update.model_version, true)
            .with_reward(reward)
            .with_metadata("node_id", update.node_id.clone())
            .with_metadata("data_samples", update.data_samples)
            .with_metadata("model_hash", update.model_hash.clone());

        state.pending.push(update);
        let queued = state.pending.len();
        debug!(queued, quorum = self.config.min_nodes_for_aggregation, "Model update queued");

        self.log_event(event).await;

        if queued >= self.config.min_nodes_for_aggregation {
            self.aggregate_locked(&mut state, true).await;
        }
        true
    }

    /// Aggregate if the pending queue has reached quorum
    pub async fn trigger_aggregation(&self) -> Option<GlobalModel> {
        let mut state = self.state.lock().await;
        if state.pending.len() < self.config.min_nodes_for_aggregation {
            return None;
        }
        self.aggregate_locked(&mut state, true).await
    }

    /// Run an aggregation attempt regardless of quorum
    pub async fn aggregate_now(&self) -> Option<GlobalModel> {
        let mut state = self.state.lock().await;
        self.aggregate_locked(&mut state, false).await
    }

    /// Aggregate the queued updates from active nodes.
    ///
    /// With `require_quorum`, updates from nodes that went inactive while
    /// queued are dropped first, and the round waits if fewer than
    /// `min_nodes_for_aggregation` updates remain.
    async fn aggregate_locked(&self, state: &mut BrokerState, require_quorum: bool) -> Option<GlobalModel> {
        if require_quorum {
            let BrokerState { pending, nodes, .. } = &mut *state;
            let before = pending.len();
            pending.retain(|u| nodes.get(&u.node_id).map(|n| n.is_active).unwrap_or(false));
            if pending.len() < before {
                debug!(dropped = before - pending.len(), "Dropped queued updates from inactive nodes");
            }
            if pending.len() < self.config.min_nodes_for_aggregation {
                debug!(queued = pending.len(), "Quorum lost; waiting for more updates");
                return None;
            }
        }

        state.round += 1;
        let round = state.round;

        let batch: Vec<ModelUpdate> = state
            .pending
            .iter()
            .filter(|u| state.nodes.get(&u.node_id).map(|n| n.is_active).unwrap_or(false))
            .cloned()
            .collect();

        let aggregated = match federated_average(&batch) {
            Ok(metrics) => metrics,
            Err(e) => {
                warn!(round, pending = state.pending.len(), "Aggregation deferred: {}", e);
                self.log_event(
                    Self::event(TASK_AGGREGATION, "", false)
                        .with_metadata("round", round)
                        .with_metadata("error", e.to_string()),
                )
                .await;
                return None;
            }
        };

        let now = Utc::now();
        let version = format!("v{}_{}", round, now.timestamp());

        let mut participants: Vec<String> = Vec::new();
        for update in &batch {
            if !participants.contains(&update.node_id) {
                participants.push(update.node_id.clone());
            }
        }

        let samples = total_samples(&batch);
        let mut performance = BTreeMap::new();
        performance.insert("total_samples".to_string(), samples as f64);
        performance.insert("participants".to_string(), participants.len() as f64);
        if let Some(accuracy) = aggregated.get("accuracy") {
            performance.insert("accuracy".to_string(), *accuracy);
        }

        let model = GlobalModel {
            version: version.clone(),
            model_hash: metrics_hash(&aggregated),
            aggregated_metrics: aggregated,
            participating_nodes: participants.clone(),
            performance_metrics: performance,
            created_at: now,
        };

        for update in &batch {
            if let Some(node) = state.nodes.get_mut(&update.node_id) {
                let previous = (node.contributions > 0).then_some(node.performance_score);
                node.performance_score = smoothed_score(
                    previous,
                    update.observed_performance(),
                    self.config.score_smoothing,
                );
                node.contributions += 1;
                node.model_version = version.clone();
            }
        }

        state.pending.clear();
        state.successful_rounds += 1;
        state.current_model = Some(model.clone());

        info!(
            version = %version,
            participants = participants.len(),
            total_samples = %samples,
            "Federated aggregation complete"
        );

        self.log_event(
            Self::event(TASK_AGGREGATION, &version, true)
                .with_reward(2.0)
                .with_metadata("round", round)
                .with_metadata("participants", participants.clone())
                .with_metadata("model_hash", model.model_hash.clone()),
        )
        .await;

        let leaders = top_performers(&state.nodes, &participants, self.config.promote_top_nodes);
        if !leaders.is_empty() {
            if let Err(e) = self.policy.promote_providers(&leaders).await {
                warn!("Failed to promote federated leaders: {:#}", e);
            }
        }

        Some(model)
    }

    /// Mark nodes unseen for longer than `timeout` inactive
    pub async fn cleanup_inactive_nodes(&self, timeout: Duration) -> usize {
        self.cleanup_inactive_nodes_at(timeout, Utc::now()).await
    }

    /// `cleanup_inactive_nodes` evaluated at an explicit instant
    pub async fn cleanup_inactive_nodes_at(&self, timeout: Duration, now: DateTime<Utc>) -> usize {
        let timeout = chrono::Duration::from_std(timeout)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));

        let expired: Vec<(String, DateTime<Utc>)> = {
            let mut state = self.state.lock().await;
            let mut expired = Vec::new();
            for node in state.nodes.values_mut() {
                if node.is_active && now.signed_duration_since(node.last_seen) > timeout {
                    node.is_active = false;
                    expired.push((node.node_id.clone(), node.last_seen));
                }
            }
            expired
        };

        for (node_id, last_seen) in &expired {
            info!(node_id = %node_id, "Federated node marked inactive");
            self.log_event(
                Self::event(TASK_CLEANUP, node_id, true)
                    .with_reward(0.0)
                    .with_metadata("node_id", node_id.clone())
                    .with_metadata("last_seen", last_seen.to_rfc3339()),
            )
            .await;
        }

        expired.len()
    }

    /// Record a configuration snapshot published for distribution
    pub async fn announce_snapshot(&self, snapshot: &ModelSnapshot) {
        self.state.lock().await.last_snapshot = Some(snapshot.handle.clone());
        info!(key = %snapshot.key, handle = %snapshot.handle, "Snapshot announced to federation");
        self.log_event(
            Self::event(TASK_SNAPSHOT, &snapshot.key, true)
                .with_metadata("handle", snapshot.handle.clone()),
        )
        .await;
    }

    pub async fn get_node(&self, node_id: &str) -> Option<FederatedNode> {
        self.state.lock().await.nodes.get(node_id).cloned()
    }

    pub async fn current_model(&self) -> Option<GlobalModel> {
        self.state.lock().await.current_model.clone()
    }

    pub async fn pending_updates(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn get_network_status(&self) -> NetworkStatus {
        let running = self.loops.lock().await.is_some();
        let state = self.state.lock().await;
        NetworkStatus {
            total_nodes: state.nodes.len(),
            active_nodes: state.nodes.values().filter(|n| n.is_active).count(),
            pending_updates: state.pending.len(),
            min_nodes_for_aggregation: self.config.min_nodes_for_aggregation,
            aggregation_rounds: state.round,
            successful_rounds: state.successful_rounds,
            current_model_version: state.current_model.as_ref().map(|m| m.version.clone()),
            last_snapshot: state.last_snapshot.clone(),
            running,
        }
    }

    pub async fn state(&self) -> RunState {
        if self.loops.lock().await.is_some() {
            RunState::Running
        } else {
            RunState::Stopped
        }
    }

    /// Start the aggregation and cleanup sweeps
    pub async fn start(self: &Arc<Self>) {
        let mut loops = self.loops.lock().await;
        if loops.is_some() {
            return;
        }

        let mut set = LoopSet::new();
        let aggregation_interval = Duration::from_secs(self.config.aggregation_interval_secs.max(1));
        let cleanup_interval = Duration::from_secs(self.config.cleanup_interval_secs.max(1));

        let broker = Arc::clone(self);
        set.spawn("federated_aggregation", aggregation_interval, aggregation_interval / 2, move || {
            let broker = broker.clone();
            async move {
                broker.trigger_aggregation().await;
                Ok(())
            }
            .boxed()
        });

        let broker = Arc::clone(self);
        set.spawn("federated_cleanup", cleanup_interval, cleanup_interval / 2, move || {
            let broker = broker.clone();
            async move {
                let timeout = Duration::from_secs(broker.config.node_timeout_secs);
                let removed = broker.cleanup_inactive_nodes(timeout).await;
                if removed > 0 {
                    info!(removed, "Inactive federated nodes swept");
                }
                Ok(())
            }
            .boxed()
        });

        *loops = Some(set);
        info!("Federated broker started");
    }

    /// Stop the background sweeps
    pub async fn stop(&self) {
        let set = self.loops.lock().await.take();
        if let Some(set) = set {
            set.shutdown().await;
            info!("Federated broker stopped");
        }
    }
}

/// Participants with the highest performance scores, best first
fn top_performers(nodes: &HashMap<String, FederatedNode>, participants: &[String], limit: usize) -> Vec<String> {
    let mut scored: Vec<(&String, f64)> = participants
        .iter()
        .filter_map(|id| nodes.get(id).map(|n| (id, n.performance_score)))
        .collect();
    scored.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.0.cmp(b.0))
    });
    scored.into_iter().take(limit).map(|(id, _)| id.clone()).collect()
}
