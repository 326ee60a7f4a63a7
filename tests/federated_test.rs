//! Federated broker integration tests

use adaptive_policy::config::{FederatedConfig, PolicyConfig};
use adaptive_policy::{FederatedBroker, FederatedNode, FeedbackStore, ModelUpdate, PolicyManager};
use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;

fn broker_with_store() -> anyhow::Result<(FederatedBroker, Arc<FeedbackStore>)> {
    let store = Arc::new(FeedbackStore::in_memory()?);
    let policy = Arc::new(PolicyManager::new(store.clone(), &PolicyConfig::default()));
    Ok((FederatedBroker::new(FederatedConfig::default(), policy), store))
}

fn broker() -> anyhow::Result<FederatedBroker> {
    Ok(broker_with_store()?.0)
}

async fn register(broker: &FederatedBroker, ids: &[&str]) {
    for id in ids {
        assert!(broker.register_node(FederatedNode::new(*id, format!("http://{}.local", id))).await);
    }
}

#[tokio::test]
async fn test_quorum_triggers_single_aggregation() -> anyhow::Result<()> {
    let broker = broker()?;
    register(&broker, &["n1", "n2", "n3"]).await;

    let samples = [50, 50, 100];
    let accuracy = [0.8, 0.9, 0.95];

    for i in 0..2 {
        let update = ModelUpdate::new(format!("n{}", i + 1), samples[i]).with_metric("accuracy", accuracy[i]);
        assert!(broker.submit_model_update(update).await);
        assert!(broker.current_model().await.is_none());
    }
    assert_eq!(broker.pending_updates().await, 2);

    assert!(broker.submit_model_update(ModelUpdate::new("n3", samples[2]).with_metric("accuracy", accuracy[2])).await);

    let model = broker.current_model().await.expect("aggregation should have run");
    assert_eq!(model.participating_nodes, vec!["n1", "n2", "n3"]);
    assert!(model.version.starts_with("v1_"));
    assert_eq!(model.model_hash.len(), 64);

    // 0.25*0.8 + 0.25*0.9 + 0.5*0.95
    assert!((model.aggregated_metrics["accuracy"] - 0.9).abs() < 1e-9);

    let status = broker.get_network_status().await;
    assert_eq!(status.pending_updates, 0);
    assert_eq!(status.successful_rounds, 1);
    assert_eq!(status.current_model_version.as_deref(), Some(model.version.as_str()));
    Ok(())
}

#[tokio::test]
async fn test_weighted_average_matches_sample_counts() -> anyhow::Result<()> {
    let broker = broker()?;
    register(&broker, &["a", "b", "c"]).await;

    broker.submit_model_update(ModelUpdate::new("a", 100).with_metric("accuracy", 1.0)).await;
    broker.submit_model_update(ModelUpdate::new("b", 100).with_metric("accuracy", 0.0)).await;
    broker.submit_model_update(ModelUpdate::new("c", 800).with_metric("accuracy", 0.0)).await;

    let model = broker.current_model().await.expect("aggregated");
    assert!((model.aggregated_metrics["accuracy"] - 0.1).abs() < 1e-12);
    Ok(())
}

#[tokio::test]
async fn test_unregistered_node_is_rejected() -> anyhow::Result<()> {
    let (broker, store) = broker_with_store()?;
    register(&broker, &["n1"]).await;
    broker.submit_model_update(ModelUpdate::new("n1", 10).with_metric("accuracy", 0.5)).await;

    let before = broker.pending_updates().await;
    let events_before = store.event_count().await?;

    assert!(!broker.submit_model_update(ModelUpdate::new("ghost", 500).with_metric("accuracy", 1.0)).await);

    assert_eq!(broker.pending_updates().await, before);
    assert_eq!(store.event_count().await?, events_before);
    assert!(broker.get_node("ghost").await.is_none());
    Ok(())
}

#[tokio::test]
async fn test_node_lifecycle_cleanup() -> anyhow::Result<()> {
    let broker = broker()?;
    register(&broker, &["n1"]).await;

    let registered = broker.get_node("n1").await.expect("registered");
    assert!(registered.is_active);

    let timeout = Duration::from_secs(600);
    let just_before = registered.last_seen + ChronoDuration::seconds(599);
    assert_eq!(broker.cleanup_inactive_nodes_at(timeout, just_before).await, 0);
    assert!(broker.get_node("n1").await.expect("registered").is_active);

    let after = registered.last_seen + ChronoDuration::seconds(601);
    assert_eq!(broker.cleanup_inactive_nodes_at(timeout, after).await, 1);
    let node = broker.get_node("n1").await.expect("kept for audit");
    assert!(!node.is_active);

    // Inactive nodes cannot submit until they register again
    assert!(!broker.submit_model_update(ModelUpdate::new("n1", 10)).await);
    assert!(broker.register_node(FederatedNode::new("n1", "http://n1.local")).await);
    assert!(broker.submit_model_update(ModelUpdate::new("n1", 10)).await);

    let status = broker.get_network_status().await;
    assert_eq!(status.total_nodes, 1);
    assert_eq!(status.active_nodes, 1);
    Ok(())
}

#[tokio::test]
async fn test_inactive_updates_do_not_count_toward_quorum() -> anyhow::Result<()> {
    let broker = broker()?;
    register(&broker, &["n1", "n2", "n3"]).await;

    broker.submit_model_update(ModelUpdate::new("n1", 900).with_metric("accuracy", 0.0)).await;
    // Every node goes quiet; n2 and n3 come back, n1 does not
    let far_future = chrono::Utc::now() + ChronoDuration::seconds(10_000);
    assert_eq!(broker.cleanup_inactive_nodes_at(Duration::from_secs(600), far_future).await, 3);
    register(&broker, &["n2", "n3"]).await;

    broker.submit_model_update(ModelUpdate::new("n2", 100).with_metric("accuracy", 1.0)).await;
    broker.submit_model_update(ModelUpdate::new("n3", 100).with_metric("accuracy", 0.5)).await;

    // Three queued, but only two from active nodes: n1's update is dropped
    assert!(broker.current_model().await.is_none());
    assert_eq!(broker.pending_updates().await, 2);
    assert_eq!(broker.get_network_status().await.aggregation_rounds, 0);

    register(&broker, &["n1"]).await;
    broker.submit_model_update(ModelUpdate::new("n1", 200).with_metric("accuracy", 0.25)).await;

    let model = broker.current_model().await.expect("aggregated");
    assert_eq!(model.participating_nodes, vec!["n2", "n3", "n1"]);
    // 0.25*1.0 + 0.25*0.5 + 0.5*0.25
    assert!((model.aggregated_metrics["accuracy"] - 0.5).abs() < 1e-12);
    Ok(())
}

#[tokio::test]
async fn test_failed_round_keeps_queue() -> anyhow::Result<()> {
    let (broker, store) = broker_with_store()?;
    register(&broker, &["n1", "n2", "n3"]).await;

    for id in ["n1", "n2", "n3"] {
        assert!(broker.submit_model_update(ModelUpdate::new(id, 0).with_metric("accuracy", 0.9)).await);
    }

    let status = broker.get_network_status().await;
    assert_eq!(status.pending_updates, 3);
    assert_eq!(status.aggregation_rounds, 1);
    assert_eq!(status.successful_rounds, 0);
    assert!(status.current_model_version.is_none());

    let events = store.recent_events(20).await?;
    let failed = events
        .iter()
        .find(|e| e.task_type == "federated_aggregation")
        .expect("aggregation event logged");
    assert!(!failed.success);
    assert!(events.iter().filter(|e| e.task_type == "federated_aggregation").all(|e| !e.success));
    Ok(())
}

#[tokio::test]
async fn test_huge_sample_counts_aggregate() -> anyhow::Result<()> {
    let broker = broker()?;
    register(&broker, &["n1", "n2", "n3"]).await;

    for id in ["n1", "n2", "n3"] {
        assert!(broker.submit_model_update(ModelUpdate::new(id, u64::MAX / 2).with_metric("accuracy", 0.6)).await);
    }

    let model = broker.current_model().await.expect("aggregated");
    assert!((model.aggregated_metrics["accuracy"] - 0.6).abs() < 1e-9);
    assert!(model.performance_metrics["total_samples"] > u64::MAX as f64);
    Ok(())
}

#[tokio::test]
async fn test_sweep_waits_for_quorum() -> anyhow::Result<()> {
    let broker = broker()?;
    register(&broker, &["n1", "n2"]).await;
    broker.submit_model_update(ModelUpdate::new("n1", 10).with_metric("accuracy", 0.5)).await;

    assert!(broker.trigger_aggregation().await.is_none());
    let status = broker.get_network_status().await;
    assert_eq!(status.aggregation_rounds, 0);
    assert_eq!(status.pending_updates, 1);
    Ok(())
}
