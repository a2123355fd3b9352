//! Durable checkpoint persistence.

use super::errors::{RuntimeError, RuntimeResult};
use super::models::{AgentState, Checkpoint};
use super::ports::CheckpointStore;
use async_trait::async_trait;
use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct CheckpointStoreConfig {
    pub max_checkpoint_size: usize,
    pub compress: bool,
}

impl Default for CheckpointStoreConfig {
    fn default() -> Self {
        Self { max_checkpoint_size: 10 * 1024 * 1024, compress: true }
    }
}

fn gzip(data: &[u8]) -> RuntimeResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).map_err(|e| RuntimeError::Database(e.to_string()))?;
    encoder.finish().map_err(|e| RuntimeError::Database(e.to_string()))
}

fn gunzip(data: &[u8]) -> RuntimeResult<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).map_err(|e| RuntimeError::Database(e.to_string()))?;
    Ok(out)
}

/// `CheckpointStore` backed by a SQLite pool. Uses a two-table layout:
/// `checkpoints` (append-only) and `agent_state` (upsert latest-state row,
/// used for fast "what was this agent doing" lookups).
pub struct SqliteCheckpointStore {
    pool: SqlitePool,
    config: CheckpointStoreConfig,
}

impl SqliteCheckpointStore {
    pub async fn connect(database_url: &str, config: CheckpointStoreConfig) -> RuntimeResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .map_err(|e| RuntimeError::Database(e.to_string()))?
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .min_connections(1)
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;

        let store = Self { pool, config };
        store.migrate().await?;
        Ok(store)
    }

    async fn migrate(&self) -> RuntimeResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS checkpoints (
                checkpoint_id TEXT PRIMARY KEY,
                agent_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                state TEXT NOT NULL,
                blob BLOB NOT NULL,
                compressed INTEGER NOT NULL,
                metadata TEXT NOT NULL,
                created_at TEXT NOT NULL,
                size_bytes INTEGER NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_checkpoints_agent_id ON checkpoints(agent_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_checkpoints_session_id ON checkpoints(session_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_checkpoints_created_at ON checkpoints(created_at)")
            .execute(&self.pool)
            .await?;
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS agent_state (
                agent_id TEXT PRIMARY KEY,
                latest_checkpoint_id TEXT NOT NULL,
                state TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn create_checkpoint(
        &self,
        agent_id: &str,
        session_id: &str,
        state: AgentState,
        context: Vec<u8>,
        metadata: Value,
    ) -> RuntimeResult<String> {
        if context.len() > self.config.max_checkpoint_size {
            return Err(RuntimeError::CheckpointTooLarge { size: context.len(), max: self.config.max_checkpoint_size });
        }

        let (blob, compressed) = if self.config.compress {
            (gzip(&context)?, true)
        } else {
            (context.clone(), false)
        };

        let checkpoint_id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let state_str = serde_json::to_string(&state)?;
        let metadata_str = serde_json::to_string(&metadata)?;

        sqlx::query(
            "INSERT INTO checkpoints (checkpoint_id, agent_id, session_id, state, blob, compressed, metadata, created_at, size_bytes)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&checkpoint_id)
        .bind(agent_id)
        .bind(session_id)
        .bind(&state_str)
        .bind(&blob)
        .bind(compressed)
        .bind(&metadata_str)
        .bind(now.to_rfc3339())
        .bind(context.len() as i64)
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "INSERT INTO agent_state (agent_id, latest_checkpoint_id, state, updated_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(agent_id) DO UPDATE SET latest_checkpoint_id = excluded.latest_checkpoint_id, state = excluded.state, updated_at = excluded.updated_at",
        )
        .bind(agent_id)
        .bind(&checkpoint_id)
        .bind(&state_str)
        .bind(now.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(checkpoint_id)
    }

    async fn restore(&self, checkpoint_id: &str) -> RuntimeResult<Option<Checkpoint>> {
        let row = sqlx::query_as::<_, (String, String, String, String, Vec<u8>, bool, String, String, i64)>(
            "SELECT checkpoint_id, agent_id, session_id, state, blob, compressed, metadata, created_at, size_bytes
             FROM checkpoints WHERE checkpoint_id = ?",
        )
        .bind(checkpoint_id)
        .fetch_optional(&self.pool)
        .await?;

        let Some((id, agent_id, session_id, state_str, blob, compressed, metadata_str, created_at, size_bytes)) = row else {
            return Ok(None);
        };

        let context = if compressed { gunzip(&blob)? } else { blob };
        let state: AgentState = serde_json::from_str(&state_str)?;
        let metadata: Value = serde_json::from_str(&metadata_str)?;
        let created_at = chrono::DateTime::parse_from_rfc3339(&created_at)
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|_| Utc::now());

        Ok(Some(Checkpoint {
            checkpoint_id: id,
            agent_id,
            session_id,
            state,
            context,
            compressed,
            metadata,
            size_bytes: size_bytes as usize,
            created_at,
            expires_at: None,
        }))
    }

    async fn list_checkpoints(&self, agent_id: &str, limit: u32) -> RuntimeResult<Vec<Checkpoint>> {
        let rows = sqlx::query_as::<_, (String, String, String, String, Vec<u8>, bool, String, String, i64)>(
            "SELECT checkpoint_id, agent_id, session_id, state, blob, compressed, metadata, created_at, size_bytes
             FROM checkpoints WHERE agent_id = ? ORDER BY created_at DESC LIMIT ?",
        )
        .bind(agent_id)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(id, agent_id, session_id, state_str, blob, compressed, metadata_str, created_at, size_bytes)| {
                let context = if compressed { gunzip(&blob)? } else { blob };
                Ok(Checkpoint {
                    checkpoint_id: id,
                    agent_id,
                    session_id,
                    state: serde_json::from_str(&state_str)?,
                    context,
                    compressed,
                    metadata: serde_json::from_str(&metadata_str)?,
                    size_bytes: size_bytes as usize,
                    created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
                        .map(|dt| dt.with_timezone(&Utc))
                        .unwrap_or_else(|_| Utc::now()),
                    expires_at: None,
                })
            })
            .collect()
    }

    async fn cleanup_old(&self, retention_days: i64) -> RuntimeResult<u64> {
        let cutoff = (Utc::now() - chrono::Duration::days(retention_days)).to_rfc3339();
        let result = sqlx::query("DELETE FROM checkpoints WHERE created_at < ?").bind(cutoff).execute(&self.pool).await?;
        let deleted = result.rows_affected();
        info!(deleted, retention_days, "cleaned up old checkpoints");
        Ok(deleted)
    }
}

/// In-memory `CheckpointStore` for tests and the no-database dev profile.
#[derive(Default)]
pub struct InMemoryCheckpointStore {
    config: CheckpointStoreConfig,
    checkpoints: RwLock<HashMap<String, Checkpoint>>,
}

impl InMemoryCheckpointStore {
    pub fn new(config: CheckpointStoreConfig) -> Self {
        Self { config, checkpoints: RwLock::new(HashMap::new()) }
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn create_checkpoint(
        &self,
        agent_id: &str,
        session_id: &str,
        state: AgentState,
        context: Vec<u8>,
        metadata: Value,
    ) -> RuntimeResult<String> {
        if context.len() > self.config.max_checkpoint_size {
            return Err(RuntimeError::CheckpointTooLarge { size: context.len(), max: self.config.max_checkpoint_size });
        }
        let checkpoint_id = Uuid::new_v4().to_string();
        let size_bytes = context.len();
        self.checkpoints.write().await.insert(
            checkpoint_id.clone(),
            Checkpoint {
                checkpoint_id: checkpoint_id.clone(),
                agent_id: agent_id.to_string(),
                session_id: session_id.to_string(),
                state,
                context,
                compressed: false,
                metadata,
                size_bytes,
                created_at: Utc::now(),
                expires_at: None,
            },
        );
        Ok(checkpoint_id)
    }

    async fn restore(&self, checkpoint_id: &str) -> RuntimeResult<Option<Checkpoint>> {
        Ok(self.checkpoints.read().await.get(checkpoint_id).cloned())
    }

    async fn list_checkpoints(&self, agent_id: &str, limit: u32) -> RuntimeResult<Vec<Checkpoint>> {
        let mut matches: Vec<Checkpoint> =
            self.checkpoints.read().await.values().filter(|c| c.agent_id == agent_id).cloned().collect();
        matches.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matches.truncate(limit as usize);
        Ok(matches)
    }

    async fn cleanup_old(&self, retention_days: i64) -> RuntimeResult<u64> {
        let cutoff = Utc::now() - chrono::Duration::days(retention_days);
        let mut checkpoints = self.checkpoints.write().await;
        let before = checkpoints.len();
        checkpoints.retain(|_, c| c.created_at >= cutoff);
        Ok((before - checkpoints.len()) as u64)
    }
}

/// Wraps any `HotStateStore`-less fallback: an Arc-shared `CheckpointStore`
/// used by `LifecycleManager`/`WorkflowEngine` for optional mid-run saves.
pub type SharedCheckpointStore = Arc<dyn CheckpointStore>;
