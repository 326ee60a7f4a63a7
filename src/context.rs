//! Process-wide context
//!
//! Built once at startup and handed to whatever exposes the management
//! surface. Holds the store, policy manager, broker and engine.

use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::engine::{LearningEngine, OptimizationState, ProviderInvoker, SimulatedInvoker};
use crate::federated::{FederatedBroker, FederatedNode, ModelUpdate, NetworkStatus};
use crate::feedback::{FeedbackStore, PolicyState};
use crate::policy::PolicyManager;
use crate::snapshot::{LocalSnapshotStore, SnapshotStore};

pub struct AdaptiveContext {
    pub config: Config,
    pub store: Arc<FeedbackStore>,
    pub policy: Arc<PolicyManager>,
    pub broker: Arc<FederatedBroker>,
    pub engine: Arc<LearningEngine>,
    pub snapshots: Option<Arc<dyn SnapshotStore>>,
}

impl AdaptiveContext {
    /// Open the configured store and wire every component with the simulated invoker
    pub async fn build(config: Config) -> Result<Self> {
        let db_path = config.store.resolve_database_path()?;
        let store = FeedbackStore::open(&db_path)
            .await
            .with_context(|| format!("Failed to open feedback store at {}", db_path.display()))?;

        let snapshots: Option<Arc<dyn SnapshotStore>> = if config.snapshots.enabled {
            let dir = config.snapshots.resolve_directory()?;
            Some(Arc::new(LocalSnapshotStore::new(dir)))
        } else {
            None
        };

        Self::assemble(config, store, Arc::new(SimulatedInvoker::new()), snapshots).await
    }

    /// Wire components around an existing store and invoker
    pub async fn assemble(
        config: Config,
        store: FeedbackStore,
        invoker: Arc<dyn ProviderInvoker>,
        snapshots: Option<Arc<dyn SnapshotStore>>,
    ) -> Result<Self> {
        let store = Arc::new(
            store
                .with_default_priority(config.policy.provider_priority.clone())
                .with_history_limit(config.store.session_history_limit),
        );
        let policy = Arc::new(PolicyManager::new(store.clone(), &config.policy));
        let broker = Arc::new(FederatedBroker::new(config.federated.clone(), policy.clone()));

        let mut engine = LearningEngine::new(config.engine.clone(), policy.clone(), invoker)
            .with_broker(broker.clone());
        if let Some(snapshots) = &snapshots {
            engine = engine.with_snapshot_store(snapshots.clone());
        }
        let engine = Arc::new(engine);

        if config.snapshots.restore_on_start && snapshots.is_some() {
            match engine.restore_state().await {
                Ok(true) => info!("Restored optimization state from snapshot"),
                Ok(false) => {}
                Err(e) => warn!("Could not restore optimization state: {:#}", e),
            }
        }

        Ok(Self {
            config,
            store,
            policy,
            broker,
            engine,
            snapshots,
        })
    }

    /// Start the broker sweeps and the learning loops
    pub async fn start(&self) {
        self.broker.start().await;
        self.engine.start_continuous_learning().await;
    }

    /// Stop everything started by `start`
    pub async fn stop(&self) {
        self.engine.stop_continuous_learning().await;
        self.broker.stop().await;
    }

    pub async fn mark_user_activity(&self) {
        self.engine.mark_user_activity().await;
    }

    pub async fn register_node(&self, node: FederatedNode) -> bool {
        self.broker.register_node(node).await
    }

    pub async fn submit_model_update(&self, update: ModelUpdate) -> bool {
        self.broker.submit_model_update(update).await
    }

    pub async fn policy_state(&self) -> Result<PolicyState> {
        self.policy.current_state().await
    }

    pub async fn optimization_state(&self) -> OptimizationState {
        self.engine.optimization_state().await
    }

    pub async fn network_status(&self) -> NetworkStatus {
        self.broker.get_network_status().await
    }
}
