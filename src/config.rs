//! Configuration management
//!
//! Manages store location, policy defaults, engine scheduling intervals,
//! federated aggregation settings and snapshot persistence.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::types::{Complexity, ProviderChoice};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Feedback event store settings
    #[serde(default)]
    pub store: StoreConfig,
    /// Provider priority and per-tier default models
    #[serde(default)]
    pub policy: PolicyConfig,
    /// Continuous learning engine settings
    #[serde(default)]
    pub engine: EngineConfig,
    /// Federated learning broker settings
    #[serde(default)]
    pub federated: FederatedConfig,
    /// Snapshot persistence settings
    #[serde(default)]
    pub snapshots: SnapshotConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Path to the SQLite database (defaults to the data directory)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<PathBuf>,
    /// Maximum session memory entries returned per read
    #[serde(default = "default_session_history_limit")]
    pub session_history_limit: usize,
}

fn default_session_history_limit() -> usize {
    50
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            session_history_limit: default_session_history_limit(),
        }
    }
}

impl StoreConfig {
    /// Resolve the database path, falling back to the data directory
    pub fn resolve_database_path(&self) -> Result<PathBuf> {
        match &self.database_path {
            Some(path) => Ok(path.clone()),
            None => Ok(data_dir()?.join("feedback.db")),
        }
    }
}

/// Default models a provider offers for each complexity tier
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TierModels {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub simple: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub medium: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complex: Option<String>,
}

impl TierModels {
    pub fn new(simple: &str, medium: &str, complex: &str) -> Self {
        Self {
            simple: Some(simple.to_string()),
            medium: Some(medium.to_string()),
            complex: Some(complex.to_string()),
        }
    }

    /// Model for a tier, if the provider defines one
    pub fn for_tier(&self, tier: Complexity) -> Option<&str> {
        match tier {
            Complexity::Simple => self.simple.as_deref(),
            Complexity::Medium => self.medium.as_deref(),
            Complexity::Complex => self.complex.as_deref(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Provider priority used when the policy state is first created
    #[serde(default = "default_provider_priority")]
    pub provider_priority: Vec<String>,
    /// Provider -> default model per complexity tier
    #[serde(default = "default_models")]
    pub default_models: HashMap<String, TierModels>,
}

fn default_provider_priority() -> Vec<String> {
    vec![
        "openai".to_string(),
        "anthropic".to_string(),
        "google".to_string(),
        "ollama".to_string(),
    ]
}

fn default_models() -> HashMap<String, TierModels> {
    let mut models = HashMap::new();
    models.insert(
        "openai".to_string(),
        TierModels::new("gpt-4o-mini", "gpt-4o-mini", "gpt-4o"),
    );
    models.insert(
        "anthropic".to_string(),
        TierModels::new("claude-3-haiku", "claude-3-5-sonnet", "claude-3-5-sonnet"),
    );
    models.insert(
        "google".to_string(),
        TierModels::new("gemini-1.5-flash", "gemini-1.5-flash", "gemini-1.5-pro"),
    );
    models.insert(
        "ollama".to_string(),
        TierModels {
            simple: Some("llama3.1:8b".to_string()),
            medium: Some("llama3.1:8b".to_string()),
            complex: None,
        },
    );
    models
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            provider_priority: default_provider_priority(),
            default_models: default_models(),
        }
    }
}

/// Continuous learning engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Seconds without user activity before the system counts as idle
    #[serde(default = "default_idle_threshold")]
    pub idle_threshold_secs: u64,
    /// Seconds between experiment scheduling checks
    #[serde(default = "default_experiment_interval")]
    pub experiment_interval_secs: u64,
    /// Maximum experiments in flight at once
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_experiments: usize,
    /// Seconds between optimization rounds
    #[serde(default = "default_optimization_interval")]
    pub optimization_interval_secs: u64,
    /// Seconds between scenario rotation steps
    #[serde(default = "default_rotation_interval")]
    pub scenario_rotation_interval_secs: u64,
    /// Seconds between performance analyses
    #[serde(default = "default_analysis_interval")]
    pub performance_analysis_interval_secs: u64,
    /// Seconds between state persistence runs
    #[serde(default = "default_persistence_interval")]
    pub persistence_interval_secs: u64,
    /// Seconds between activity monitor checks
    #[serde(default = "default_activity_check_interval")]
    pub activity_check_interval_secs: u64,
    /// Sleep after a failed loop iteration
    #[serde(default = "default_retry_delay")]
    pub retry_delay_secs: u64,
    /// Per-call timeout for provider invocations
    #[serde(default = "default_call_timeout")]
    pub call_timeout_secs: u64,
    /// Trials per candidate in one experiment
    #[serde(default = "default_trials_per_candidate")]
    pub trials_per_candidate: usize,
    /// Starting exploration rate (epsilon)
    #[serde(default = "default_exploration_rate")]
    pub initial_exploration_rate: f64,
    /// Starting learning rate
    #[serde(default = "default_learning_rate")]
    pub initial_learning_rate: f64,
    /// Minimum recent events before the analyzer reports a trend
    #[serde(default = "default_min_events_for_analysis")]
    pub min_events_for_analysis: usize,
    /// Candidate (provider, model) pairs tried in each experiment
    #[serde(default = "default_candidates")]
    pub candidates: Vec<ProviderChoice>,
}

fn default_idle_threshold() -> u64 { 60 }
fn default_experiment_interval() -> u64 { 300 }
fn default_max_concurrent() -> usize { 3 }
fn default_optimization_interval() -> u64 { 600 }
fn default_rotation_interval() -> u64 { 1800 }
fn default_analysis_interval() -> u64 { 900 }
fn default_persistence_interval() -> u64 { 3600 }
fn default_activity_check_interval() -> u64 { 10 }
fn default_retry_delay() -> u64 { 30 }
fn default_call_timeout() -> u64 { 60 }
fn default_trials_per_candidate() -> usize { 1 }
fn default_exploration_rate() -> f64 { 0.2 }
fn default_learning_rate() -> f64 { 0.01 }
fn default_min_events_for_analysis() -> usize { 100 }

fn default_candidates() -> Vec<ProviderChoice> {
    vec![
        ProviderChoice::new("openai", "gpt-4o-mini"),
        ProviderChoice::new("openai", "gpt-4o"),
        ProviderChoice::new("anthropic", "claude-3-haiku"),
        ProviderChoice::new("anthropic", "claude-3-5-sonnet"),
        ProviderChoice::new("google", "gemini-1.5-flash"),
        ProviderChoice::new("ollama", "llama3.1:8b"),
    ]
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            idle_threshold_secs: default_idle_threshold(),
            experiment_interval_secs: default_experiment_interval(),
            max_concurrent_experiments: default_max_concurrent(),
            optimization_interval_secs: default_optimization_interval(),
            scenario_rotation_interval_secs: default_rotation_interval(),
            performance_analysis_interval_secs: default_analysis_interval(),
            persistence_interval_secs: default_persistence_interval(),
            activity_check_interval_secs: default_activity_check_interval(),
            retry_delay_secs: default_retry_delay(),
            call_timeout_secs: default_call_timeout(),
            trials_per_candidate: default_trials_per_candidate(),
            initial_exploration_rate: default_exploration_rate(),
            initial_learning_rate: default_learning_rate(),
            min_events_for_analysis: default_min_events_for_analysis(),
            candidates: default_candidates(),
        }
    }
}

impl EngineConfig {
    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_threshold_secs)
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }
}

/// Federated learning broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FederatedConfig {
    /// Pending updates required before an aggregation round runs
    #[serde(default = "default_min_nodes")]
    pub min_nodes_for_aggregation: usize,
    /// Seconds between aggregation sweeps
    #[serde(default = "default_aggregation_interval")]
    pub aggregation_interval_secs: u64,
    /// Seconds between inactive-node cleanup sweeps
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
    /// Seconds without a submission before a node is marked inactive
    #[serde(default = "default_node_timeout")]
    pub node_timeout_secs: u64,
    /// Smoothing factor for node performance scores
    #[serde(default = "default_score_smoothing")]
    pub score_smoothing: f64,
    /// Number of top contributors promoted in provider priority per round
    #[serde(default = "default_promote_top")]
    pub promote_top_nodes: usize,
}

fn default_min_nodes() -> usize { 3 }
fn default_aggregation_interval() -> u64 { 300 }
fn default_cleanup_interval() -> u64 { 300 }
fn default_node_timeout() -> u64 { 600 }
fn default_score_smoothing() -> f64 { 0.3 }
fn default_promote_top() -> usize { 3 }

impl Default for FederatedConfig {
    fn default() -> Self {
        Self {
            min_nodes_for_aggregation: default_min_nodes(),
            aggregation_interval_secs: default_aggregation_interval(),
            cleanup_interval_secs: default_cleanup_interval(),
            node_timeout_secs: default_node_timeout(),
            score_smoothing: default_score_smoothing(),
            promote_top_nodes: default_promote_top(),
        }
    }
}

/// Snapshot persistence configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    /// Persist optimization state and publish winning configurations
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Snapshot directory (defaults to the data directory)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub directory: Option<PathBuf>,
    /// Restore the last persisted optimization state on startup
    #[serde(default = "default_true")]
    pub restore_on_start: bool,
}

fn default_true() -> bool {
    true
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: None,
            restore_on_start: true,
        }
    }
}

impl SnapshotConfig {
    pub fn resolve_directory(&self) -> Result<PathBuf> {
        match &self.directory {
            Some(dir) => Ok(dir.clone()),
            None => Ok(data_dir()?.join("snapshots")),
        }
    }
}

impl Config {
    /// Load configuration from file
    pub fn load() -> Result<Self> {
        let config_path = config_path()?;

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save()?;
            Ok(config)
        }
    }

    /// Load configuration from an explicit path
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: Config = toml::from_str(&contents)
            .context("Failed to parse config file")?;
        Ok(config)
    }

    /// Save configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = config_path()?;
        let parent = config_path.parent()
            .context("Config path has no parent")?;

        std::fs::create_dir_all(parent)
            .context("Failed to create config directory")?;

        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize config")?;

        std::fs::write(&config_path, contents)
            .context("Failed to write config file")?;

        Ok(())
    }
}

/// Get the configuration file path
pub fn config_path() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("com", "adaptive-policy", "adaptive-policy")
        .context("Failed to get project directories")?;
    Ok(base.config_dir().join("config.toml"))
}

/// Get the data directory path
pub fn data_dir() -> Result<PathBuf> {
    let base = directories::ProjectDirs::from("com", "adaptive-policy", "adaptive-policy")
        .context("Failed to get project directories")?;
    Ok(base.data_dir().to_path_buf())
}

/// Get default configuration as TOML string
pub fn default_config_toml() -> String {
    let config = Config::default();
    toml::to_string_pretty(&config).unwrap_or_else(|_| "# Default configuration\n".to_string())
}
