//! Provider invocation seam

use anyhow::Result;
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::Mutex;

/// Outcome of a single provider call
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    pub latency_ms: f64,
    pub success: bool,
    pub reward: f64,
    /// Response text, when the invoker has one
    pub response: Option<String>,
}

impl Invocation {
    pub fn new(latency_ms: f64, success: bool, reward: f64) -> Self {
        Self {
            latency_ms,
            success,
            reward,
            response: None,
        }
    }

    /// A failed call (error or timeout)
    pub fn failed(latency_ms: f64) -> Self {
        Self::new(latency_ms, false, 0.0)
    }

    pub fn with_response(mut self, response: impl Into<String>) -> Self {
        self.response = Some(response.into());
        self
    }

    /// Reward and latency are finite and non-negative
    pub fn is_well_formed(&self) -> bool {
        self.reward.is_finite() && self.reward >= 0.0 && self.latency_ms.is_finite() && self.latency_ms >= 0.0
    }
}

/// Calls a (provider, model) pair with a prompt.
///
/// Providers and models are opaque identifiers here.
#[async_trait]
pub trait ProviderInvoker: Send + Sync {
    async fn invoke(&self, provider: &str, model: &str, prompt: &str) -> Result<Invocation>;
}

/// Per-provider profile used by the simulator
#[derive(Debug, Clone, Copy)]
pub struct SimulatedProfile {
    pub success_rate: f64,
    pub base_latency_ms: f64,
    pub mean_reward: f64,
}

impl Default for SimulatedProfile {
    fn default() -> Self {
        Self {
            success_rate: 0.85,
            base_latency_ms: 800.0,
            mean_reward: 0.8,
        }
    }
}

/// Random outcomes drawn from per-provider profiles
pub struct SimulatedInvoker {
    rng: Mutex<StdRng>,
    profiles: HashMap<String, SimulatedProfile>,
    /// Real sleep per call; zero keeps simulations instant
    delay: Duration,
}

impl Default for SimulatedInvoker {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedInvoker {
    pub fn new() -> Self {
        Self::from_rng(StdRng::from_os_rng())
    }

    /// Reproducible simulator for tests
    pub fn with_seed(seed: u64) -> Self {
        Self::from_rng(StdRng::seed_from_u64(seed))
    }

    fn from_rng(rng: StdRng) -> Self {
        let mut profiles = HashMap::new();
        profiles.insert("openai".to_string(), SimulatedProfile { success_rate: 0.92, base_latency_ms: 900.0, mean_reward: 0.85 });
        profiles.insert("anthropic".to_string(), SimulatedProfile { success_rate: 0.93, base_latency_ms: 1100.0, mean_reward: 0.88 });
        profiles.insert("google".to_string(), SimulatedProfile { success_rate: 0.88, base_latency_ms: 700.0, mean_reward: 0.8 });
        profiles.insert("ollama".to_string(), SimulatedProfile { success_rate: 0.8, base_latency_ms: 400.0, mean_reward: 0.65 });
        Self {
            rng: Mutex::new(rng),
            profiles,
            delay: Duration::ZERO,
        }
    }

    pub fn with_profile(mut self, provider: &str, profile: SimulatedProfile) -> Self {
        self.profiles.insert(provider.to_string(), profile);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

#[async_trait]
impl ProviderInvoker for SimulatedInvoker {
    async fn invoke(&self, provider: &str, _model: &str, prompt: &str) -> Result<Invocation> {
        let profile = self.profiles.get(provider).copied().unwrap_or_default();

        let outcome = {
            let mut rng = self.rng.lock().await;
            // Longer prompts take a little longer
            let latency = profile.base_latency_ms * rng.random_range(0.6..1.6)
                + prompt.len() as f64 * 0.5;
            let success = rng.random_bool(profile.success_rate.clamp(0.0, 1.0));
            let reward = if success {
                (profile.mean_reward + rng.random_range(-0.2..0.2)).clamp(0.0, 1.0)
            } else {
                0.0
            };
            Invocation::new(latency.round(), success, reward)
        };

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        Ok(outcome)
    }
}
