//! Built-in learning scenario catalog

use serde::{Deserialize, Serialize};

use super::provider::Invocation;
use crate::types::{Complexity, Modality};

/// Named thresholds a trial must meet to count as successful
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SuccessThresholds {
    pub min_reward: f64,
    pub max_latency_ms: f64,
    /// Target share of successful trials across an experiment
    pub min_success_rate: f64,
}

/// A fixed experiment template
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningScenario {
    pub id: String,
    pub name: String,
    pub description: String,
    pub test_prompts: Vec<String>,
    /// Keywords a good response is expected to cover. Only checked when the
    /// invoker returns response text.
    pub expected_keywords: Vec<String>,
    pub complexity: Complexity,
    pub modalities: Vec<Modality>,
    pub thresholds: SuccessThresholds,
}

impl LearningScenario {
    /// A trial succeeds when the call succeeded, met the reward and latency
    /// bars, and any returned text mentions at least one expected keyword
    pub fn trial_succeeded(&self, outcome: &Invocation) -> bool {
        outcome.success
            && outcome.reward >= self.thresholds.min_reward
            && outcome.latency_ms <= self.thresholds.max_latency_ms
            && outcome.response.as_deref().map_or(true, |text| self.mentions_keyword(text))
    }

    /// Case-insensitive keyword match; scenarios without keywords accept anything
    pub fn mentions_keyword(&self, text: &str) -> bool {
        if self.expected_keywords.is_empty() {
            return true;
        }
        let lower = text.to_lowercase();
        self.expected_keywords.iter().any(|k| lower.contains(&k.to_lowercase()))
    }

    /// Whether an experiment's success rate met the scenario target
    pub fn meets_success_rate(&self, success_rate: f64) -> bool {
        success_rate >= self.thresholds.min_success_rate
    }
}

#[allow(clippy::too_many_arguments)]
fn scenario(
    id: &str,
    name: &str,
    description: &str,
    prompts: &[&str],
    keywords: &[&str],
    complexity: Complexity,
    modalities: &[Modality],
    thresholds: SuccessThresholds,
) -> LearningScenario {
    LearningScenario {
        id: id.to_string(),
        name: name.to_string(),
        description: description.to_string(),
        test_prompts: prompts.iter().map(|p| p.to_string()).collect(),
        expected_keywords: keywords.iter().map(|k| k.to_string()).collect(),
        complexity,
        modalities: modalities.to_vec(),
        thresholds,
    }
}

/// The catalog the engine starts with
pub fn default_scenarios() -> Vec<LearningScenario> {
    vec![
        scenario(
            "quick_answers",
            "Quick answers",
            "Short factual questions where latency matters most",
            &[
                "What is the capital of Australia?",
                "Convert 72 degrees Fahrenheit to Celsius.",
                "Give a one-line definition of idempotence.",
            ],
            &["canberra", "celsius", "idempotent"],
            Complexity::Simple,
            &[Modality::Text],
            SuccessThresholds { min_reward: 0.6, max_latency_ms: 2_000.0, min_success_rate: 0.9 },
        ),
        scenario(
            "code_generation",
            "Code generation",
            "Write small, correct functions from a description",
            &[
                "Write a function that checks whether a string is a palindrome.",
                "Implement binary search over a sorted slice of integers.",
                "Write a function that merges two sorted lists.",
            ],
            &["fn", "return", "loop"],
            Complexity::Complex,
            &[Modality::Text, Modality::Code],
            SuccessThresholds { min_reward: 0.7, max_latency_ms: 8_000.0, min_success_rate: 0.8 },
        ),
        scenario(
            "summarization",
            "Summarization",
            "Condense a passage while keeping the key facts",
            &[
                "Summarize the causes of the 2008 financial crisis in three sentences.",
                "Summarize the plot of a heist story in two sentences.",
            ],
            &["summary", "key"],
            Complexity::Medium,
            &[Modality::Text],
            SuccessThresholds { min_reward: 0.65, max_latency_ms: 5_000.0, min_success_rate: 0.85 },
        ),
        scenario(
            "data_analysis",
            "Data analysis",
            "Reason over tabular data and write queries",
            &[
                "Write a SQL query returning the top five customers by revenue.",
                "Given monthly sales figures, describe the trend and any outliers.",
            ],
            &["select", "trend", "outlier"],
            Complexity::Complex,
            &[Modality::Text, Modality::Code],
            SuccessThresholds { min_reward: 0.7, max_latency_ms: 10_000.0, min_success_rate: 0.75 },
        ),
        scenario(
            "image_understanding",
            "Image understanding",
            "Describe and reason about image content",
            &[
                "Describe the objects in this photo and their arrangement.",
                "Read the chart in this image and report its maximum value.",
            ],
            &["object", "chart"],
            Complexity::Complex,
            &[Modality::Image, Modality::Text],
            SuccessThresholds { min_reward: 0.6, max_latency_ms: 12_000.0, min_success_rate: 0.7 },
        ),
    ]
}
