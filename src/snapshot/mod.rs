//! Content-addressed snapshot storage
//!
//! Snapshots are JSON payloads stored under the SHA-256 of their canonical
//! encoding. A per-key ref file points at the latest handle for that key.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Key under which the learning engine persists its optimization state
pub const OPTIMIZATION_STATE_KEY: &str = "optimization_state";
/// Key under which winning configurations are published
pub const WINNING_CONFIG_KEY: &str = "winning_configuration";

/// A stored snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub key: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    /// SHA-256 hex of the payload
    pub handle: String,
    pub created_at: DateTime<Utc>,
}

/// Durable snapshot backend
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Store a payload, returning its content handle
    async fn store_snapshot(
        &self,
        payload: serde_json::Value,
        key: String,
        tags: HashMap<String, String>,
    ) -> Result<String>;

    /// Latest payload stored under `key`
    async fn load_latest(&self, key: String) -> Result<Option<serde_json::Value>>;
}

/// SHA-256 hex digest of a JSON value's serialized form
pub fn content_hash(value: &serde_json::Value) -> String {
    // serde_json maps are ordered, so the encoding is stable
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    hex::encode(Sha256::digest(&bytes))
}

/// Snapshot store backed by a local directory
pub struct LocalSnapshotStore {
    root: PathBuf,
}

impl LocalSnapshotStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self { root: root.as_ref().to_path_buf() }
    }

    fn object_path(&self, handle: &str) -> PathBuf {
        self.root.join("objects").join(format!("{}.json", handle))
    }

    fn ref_path(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.root.join("refs").join(safe)
    }

    /// Load a full snapshot record by handle
    pub async fn load_snapshot(&self, handle: &str) -> Result<Option<ModelSnapshot>> {
        let path = self.object_path(handle);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }
        let raw = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read snapshot {}", path.display()))?;
        let snapshot = serde_json::from_str(&raw)
            .with_context(|| format!("Corrupt snapshot {}", handle))?;
        Ok(Some(snapshot))
    }
}

#[async_trait]
impl SnapshotStore for LocalSnapshotStore {
    async fn store_snapshot(
        &self,
        payload: serde_json::Value,
        key: String,
        tags: HashMap<String, String>,
    ) -> Result<String> {
        let handle = content_hash(&payload);

        let object = self.object_path(&handle);
        if let Some(parent) = object.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let snapshot = ModelSnapshot {
            key: key.clone(),
            payload,
            tags,
            handle: handle.clone(),
            created_at: Utc::now(),
        };
        tokio::fs::write(&object, serde_json::to_string_pretty(&snapshot)?)
            .await
            .context("Failed to write snapshot object")?;

        let reference = self.ref_path(&key);
        if let Some(parent) = reference.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&reference, &handle)
            .await
            .context("Failed to write snapshot ref")?;

        debug!(%key, %handle, "Stored snapshot");
        Ok(handle)
    }

    async fn load_latest(&self, key: String) -> Result<Option<serde_json::Value>> {
        let reference = self.ref_path(&key);
        if !tokio::fs::try_exists(&reference).await.unwrap_or(false) {
            return Ok(None);
        }

        let handle = tokio::fs::read_to_string(&reference).await?;
        Ok(self.load_snapshot(handle.trim()).await?.map(|s| s.payload))
    }
}
