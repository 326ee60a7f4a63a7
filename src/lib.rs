//! Adaptive Policy Library
//!
//! Learns which execution provider and model to use for a task:
//! - Feedback event store (SQLite) with a single policy-state record
//! - Deterministic provider/model selection from reward history
//! - Continuous learning engine running experiments while the system is idle
//! - Federated broker aggregating node updates with sample-weighted averaging
//!
//! # Example
//!
//! ```ignore
//! use adaptive_policy::{AdaptiveContext, Config};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let ctx = AdaptiveContext::build(Config::load()?).await?;
//!     let choice = ctx.policy.choose_provider_model("Summarize this", "summarization", &[]).await?;
//!     println!("{}", choice);
//!     Ok(())
//! }
//! ```

// Core modules (order matters for cross-module dependencies)
pub mod types;
pub mod config;
pub mod feedback;
pub mod policy;
pub mod snapshot;
pub mod supervisor;

// Feature modules
pub mod federated;
pub mod engine;
pub mod context;
pub mod cli;

// Re-export commonly used types for convenience
pub use types::{Complexity, Modality, ProviderChoice};

pub use config::Config;

pub use feedback::{
    FeedbackEvent,
    FeedbackStore,
    EventRecord,
    OutcomeSummary,
    PolicyState,
    ValidationError,
};

pub use policy::{PolicyManager, classify_complexity};

pub use snapshot::{SnapshotStore, LocalSnapshotStore, ModelSnapshot};

pub use federated::{
    FederatedBroker,
    FederatedNode,
    ModelUpdate,
    GlobalModel,
    NetworkStatus,
    AggregationError,
};

pub use engine::{
    LearningEngine,
    ProviderInvoker,
    Invocation,
    SimulatedInvoker,
    OptimizationState,
    ExperimentResult,
};

pub use context::AdaptiveContext;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");

/// Get the library info
pub fn info() -> String {
    format!("{} v{} - Adaptive provider/model policy library", NAME, VERSION)
}
