//! SQLite-backed feedback event store

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{EventRecord, FeedbackEvent, MemoryRecord, ModelPreferences, OutcomeSummary, PolicyState};

const DEFAULT_HISTORY_LIMIT: usize = 50;

/// Durable event log plus the policy-state slot and session memory.
///
/// All access goes through one connection behind an async mutex, so writes
/// are serialized and every read observes every write that returned before it.
pub struct FeedbackStore {
    conn: Arc<Mutex<Connection>>,
    default_priority: Vec<String>,
    history_limit: usize,
}

impl FeedbackStore {
    /// Open (or create) a store at the given path
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open feedback database {}", path.display()))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        Self::init_schema(&conn)?;
        info!("Opened feedback store at {}", path.display());

        Ok(Self::from_connection(conn))
    }

    /// Open a throwaway in-memory store
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self::from_connection(conn))
    }

    fn from_connection(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
            default_priority: crate::config::PolicyConfig::default().provider_priority,
            history_limit: DEFAULT_HISTORY_LIMIT,
        }
    }

    /// Provider priority used when the policy state is created lazily
    pub fn with_default_priority(mut self, priority: Vec<String>) -> Self {
        self.default_priority = priority;
        self
    }

    /// Maximum entries returned by `history`
    pub fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit.max(1);
        self
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(r#"
            -- Append-only outcome log
            CREATE TABLE IF NOT EXISTS feedback_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                agent TEXT NOT NULL,
                provider TEXT NOT NULL,
                model TEXT NOT NULL,
                task_type TEXT NOT NULL,
                success INTEGER NOT NULL,
                reward REAL NOT NULL,
                latency_ms REAL NOT NULL,
                metadata TEXT NOT NULL DEFAULT '{}'
            );

            -- Single-row policy state
            CREATE TABLE IF NOT EXISTS policy_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                provider_priority TEXT NOT NULL,
                model_prefs TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            -- Per-session interaction memory
            CREATE TABLE IF NOT EXISTS session_memory (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                agent TEXT NOT NULL,
                event TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_events_provider ON feedback_events(provider);
            CREATE INDEX IF NOT EXISTS idx_events_agent ON feedback_events(agent);
            CREATE INDEX IF NOT EXISTS idx_session_memory_session ON session_memory(session_id, id);
        "#)?;

        Ok(())
    }

    /// Validate and append an event, returning its sequence id
    pub async fn insert_event(&self, event: &FeedbackEvent) -> Result<i64> {
        event.validate().context("Rejected feedback event")?;

        let reward = event.resolved_reward();
        let metadata_json = serde_json::to_string(&event.metadata)?;

        let conn = self.conn.lock().await;
        conn.execute(
            r#"INSERT INTO feedback_events
               (timestamp, agent, provider, model, task_type, success, reward, latency_ms, metadata)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"#,
            params![
                event.timestamp.to_rfc3339(),
                event.agent,
                event.provider,
                event.model,
                event.task_type,
                event.success,
                reward,
                event.latency_ms,
                metadata_json,
            ],
        )
        .context("Failed to insert feedback event")?;

        let id = conn.last_insert_rowid();
        debug!(id, provider = %event.provider, task_type = %event.task_type, reward, "Recorded feedback event");
        Ok(id)
    }

    /// Per-provider outcome summary, best mean reward first
    pub async fn summary_by_provider(&self) -> Result<Vec<OutcomeSummary>> {
        self.summary_by("provider").await
    }

    /// Per-agent outcome summary, best mean reward first
    pub async fn summary_by_agent(&self) -> Result<Vec<OutcomeSummary>> {
        self.summary_by("agent").await
    }

    async fn summary_by(&self, column: &'static str) -> Result<Vec<OutcomeSummary>> {
        let conn = self.conn.lock().await;

        let sql = format!(
            "SELECT {col}, COUNT(*), SUM(success), AVG(reward), AVG(latency_ms)
             FROM feedback_events
             GROUP BY {col}
             ORDER BY AVG(reward) DESC, {col} ASC",
            col = column
        );
        let mut stmt = conn.prepare_cached(&sql)?;

        let summaries = stmt.query_map([], |row| {
            Ok(OutcomeSummary {
                key: row.get(0)?,
                count: row.get::<_, i64>(1)? as u64,
                successes: row.get::<_, i64>(2)? as u64,
                avg_reward: row.get(3)?,
                avg_latency_ms: row.get(4)?,
            })
        })?.collect::<Result<Vec<_>, _>>()?;

        Ok(summaries)
    }

    /// Most recent events, newest first
    pub async fn recent_events(&self, limit: usize) -> Result<Vec<EventRecord>> {
        let conn = self.conn.lock().await;

        let mut stmt = conn.prepare_cached(
            "SELECT id, timestamp, agent, provider, model, task_type, success, reward, latency_ms, metadata
             FROM feedback_events
             ORDER BY id DESC
             LIMIT ?1",
        )?;

        let records = stmt
            .query_map(params![limit as i64], row_to_event)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// Most recent events whose metadata `key` equals `value`, newest first
    pub async fn recent_events_tagged(&self, key: &str, value: &str, limit: usize) -> Result<Vec<EventRecord>> {
        let conn = self.conn.lock().await;

        let mut stmt = conn.prepare_cached(
            "SELECT id, timestamp, agent, provider, model, task_type, success, reward, latency_ms, metadata
             FROM feedback_events
             WHERE json_extract(metadata, '$.' || ?1) = ?2
             ORDER BY id DESC
             LIMIT ?3",
        )?;

        let records = stmt
            .query_map(params![key, value, limit as i64], row_to_event)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }

    /// Read the policy state, creating it on first access
    pub async fn get_policy_state(&self) -> Result<PolicyState> {
        let conn = self.conn.lock().await;

        let existing = conn
            .query_row(
                "SELECT provider_priority, model_prefs, updated_at FROM policy_state WHERE id = 1",
                [],
                |row| {
                    let priority: String = row.get(0)?;
                    let prefs: String = row.get(1)?;
                    let updated_at: String = row.get(2)?;
                    Ok((priority, prefs, updated_at))
                },
            )
            .optional()?;

        if let Some((priority, prefs, updated_at)) = existing {
            let provider_priority: Vec<String> = serde_json::from_str(&priority)
                .context("Corrupt provider priority in policy state")?;
            let model_prefs: ModelPreferences = serde_json::from_str(&prefs)
                .context("Corrupt model preferences in policy state")?;
            return Ok(PolicyState {
                provider_priority,
                model_prefs,
                updated_at: parse_timestamp(&updated_at),
            });
        }

        let state = PolicyState::new(self.default_priority.clone());
        write_policy_state(&conn, &state)?;
        info!("Initialized policy state with priority {:?}", state.provider_priority);
        Ok(state)
    }

    /// Replace the policy state (insert if absent, overwrite otherwise)
    pub async fn set_policy_state(&self, priority: Vec<String>, model_prefs: ModelPreferences) -> Result<PolicyState> {
        let state = PolicyState {
            provider_priority: priority,
            model_prefs,
            updated_at: Utc::now(),
        };

        let conn = self.conn.lock().await;
        write_policy_state(&conn, &state)?;
        debug!("Policy state replaced: priority {:?}", state.provider_priority);
        Ok(state)
    }

    /// Append to a session's interaction log
    pub async fn append_memory(&self, session_id: &str, agent: &str, event: &serde_json::Value) -> Result<i64> {
        let conn = self.conn.lock().await;

        conn.execute(
            "INSERT INTO session_memory (session_id, timestamp, agent, event) VALUES (?1, ?2, ?3, ?4)",
            params![session_id, Utc::now().to_rfc3339(), agent, serde_json::to_string(event)?],
        )
        .context("Failed to append session memory")?;

        Ok(conn.last_insert_rowid())
    }

    /// The most recent entries of a session, oldest first
    pub async fn history(&self, session_id: &str) -> Result<Vec<MemoryRecord>> {
        let conn = self.conn.lock().await;

        let mut stmt = conn.prepare_cached(
            "SELECT id, session_id, timestamp, agent, event
             FROM session_memory
             WHERE session_id = ?1
             ORDER BY id DESC
             LIMIT ?2",
        )?;

        let mut records = stmt.query_map(params![session_id, self.history_limit as i64], |row| {
            let timestamp: String = row.get(2)?;
            let event: String = row.get(4)?;
            Ok(MemoryRecord {
                id: row.get(0)?,
                session_id: row.get(1)?,
                timestamp: parse_timestamp(&timestamp),
                agent: row.get(3)?,
                event: serde_json::from_str(&event).unwrap_or(serde_json::Value::Null),
            })
        })?.collect::<Result<Vec<_>, _>>()?;

        records.reverse();
        Ok(records)
    }

    /// Total number of stored events
    pub async fn event_count(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM feedback_events", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Store statistics
    pub async fn stats(&self) -> Result<StoreStats> {
        let conn = self.conn.lock().await;

        let (events, successes, avg_reward): (i64, Option<i64>, Option<f64>) = conn.query_row(
            "SELECT COUNT(*), SUM(success), AVG(reward) FROM feedback_events",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let sessions: i64 = conn.query_row(
            "SELECT COUNT(DISTINCT session_id) FROM session_memory", [], |row| row.get(0)
        )?;

        let newest: Option<String> = conn.query_row(
            "SELECT MAX(timestamp) FROM feedback_events", [], |row| row.get(0)
        )?;

        Ok(StoreStats {
            total_events: events as usize,
            successful_events: successes.unwrap_or(0) as usize,
            mean_reward: avg_reward.unwrap_or(0.0),
            sessions: sessions as usize,
            newest_event: newest,
        })
    }
}

/// Feedback store statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct StoreStats {
    pub total_events: usize,
    pub successful_events: usize,
    pub mean_reward: f64,
    pub sessions: usize,
    pub newest_event: Option<String>,
}

fn write_policy_state(conn: &Connection, state: &PolicyState) -> Result<()> {
    conn.execute(
        r#"INSERT INTO policy_state (id, provider_priority, model_prefs, updated_at)
           VALUES (1, ?1, ?2, ?3)
           ON CONFLICT(id) DO UPDATE SET
               provider_priority = excluded.provider_priority,
               model_prefs = excluded.model_prefs,
               updated_at = excluded.updated_at"#,
        params![
            serde_json::to_string(&state.provider_priority)?,
            serde_json::to_string(&state.model_prefs)?,
            state.updated_at.to_rfc3339(),
        ],
    )
    .context("Failed to write policy state")?;
    Ok(())
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<EventRecord> {
    let timestamp: String = row.get(1)?;
    let metadata: String = row.get(9)?;
    Ok(EventRecord {
        id: row.get(0)?,
        timestamp: parse_timestamp(&timestamp),
        agent: row.get(2)?,
        provider: row.get(3)?,
        model: row.get(4)?,
        task_type: row.get(5)?,
        success: row.get(6)?,
        reward: row.get(7)?,
        latency_ms: row.get(8)?,
        metadata: serde_json::from_str::<HashMap<String, serde_json::Value>>(&metadata)
            .unwrap_or_default(),
    })
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|d| d.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}
