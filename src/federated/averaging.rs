//! Federated averaging and contribution scoring

use sha2::{Digest, Sha256};
use std::collections::BTreeMap;

use super::ModelUpdate;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AggregationError {
    #[error("no pending updates to aggregate")]
    EmptyQueue,
    #[error("pending updates carry no data samples")]
    NoSamples,
}

/// Sample-weighted mean of every metric across `updates`.
///
/// A metric missing from an update contributes zero for that update.
pub fn federated_average(updates: &[ModelUpdate]) -> Result<BTreeMap<String, f64>, AggregationError> {
    if updates.is_empty() {
        return Err(AggregationError::EmptyQueue);
    }

    let total = total_samples(updates);
    if total == 0 {
        return Err(AggregationError::NoSamples);
    }

    let mut aggregated = BTreeMap::new();
    for update in updates {
        let weight = update.data_samples as f64 / total as f64;
        for (name, value) in &update.metrics {
            *aggregated.entry(name.clone()).or_insert(0.0) += value * weight;
        }
    }

    Ok(aggregated)
}

/// Sum of sample counts. Counts come from remote nodes, so the sum is
/// widened to `u128` and cannot overflow.
pub fn total_samples(updates: &[ModelUpdate]) -> u128 {
    updates.iter().map(|u| u128::from(u.data_samples)).sum()
}

/// Reward logged for an accepted update: larger, more accurate
/// contributions score higher.
pub fn update_reward(data_samples: u64, accuracy: f64) -> f64 {
    1.0 + (data_samples as f64 / 1000.0).min(0.5) + accuracy * 0.3
}

/// SHA-256 hex of the aggregated metrics
pub fn metrics_hash(metrics: &BTreeMap<String, f64>) -> String {
    let encoded = serde_json::to_vec(metrics).unwrap_or_default();
    hex::encode(Sha256::digest(&encoded))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_weighted_average() {
        let updates = vec![
            ModelUpdate::new("n1", 100).with_metric("accuracy", 1.0),
            ModelUpdate::new("n2", 100).with_metric("accuracy", 0.0),
            ModelUpdate::new("n3", 800).with_metric("accuracy", 0.0),
        ];
        let aggregated = federated_average(&updates).unwrap();
        assert!((aggregated["accuracy"] - 0.1).abs() < 1e-12);
    }

    #[test]
    fn test_missing_metric_counts_as_zero() {
        let updates = vec![
            ModelUpdate::new("n1", 50).with_metric("loss", 0.4),
            ModelUpdate::new("n2", 50),
        ];
        let aggregated = federated_average(&updates).unwrap();
        assert!((aggregated["loss"] - 0.2).abs() < 1e-12);
    }

    #[test]
    fn test_aggregation_errors() {
        assert_eq!(federated_average(&[]), Err(AggregationError::EmptyQueue));
        let zero = vec![ModelUpdate::new("n1", 0).with_metric("accuracy", 1.0)];
        assert_eq!(federated_average(&zero), Err(AggregationError::NoSamples));
    }

    #[test]
    fn test_update_reward() {
        assert!((update_reward(0, 0.0) - 1.0).abs() < 1e-12);
        assert!((update_reward(200, 0.5) - 1.35).abs() < 1e-12);
        // Sample bonus caps at 0.5
        assert!((update_reward(5000, 1.0) - 1.8).abs() < 1e-12);
    }

    #[test]
    fn test_metrics_hash() {
        let mut metrics = BTreeMap::new();
        metrics.insert("accuracy".to_string(), 0.9);
        let hash = metrics_hash(&metrics);
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, metrics_hash(&metrics.clone()));
    }

    #[test]
    fn test_huge_sample_counts_do_not_overflow() {
        let updates = vec![
            ModelUpdate::new("n1", u64::MAX / 2).with_metric("accuracy", 0.5),
            ModelUpdate::new("n2", u64::MAX / 2).with_metric("accuracy", 0.5),
            ModelUpdate::new("n3", u64::MAX / 2).with_metric("accuracy", 0.5),
        ];
        assert_eq!(total_samples(&updates), 3 * u128::from(u64::MAX / 2));

        let metrics = federated_average(&updates).unwrap();
        assert!((metrics["accuracy"] - 0.5).abs() < 1e-9);
    }
}
