//! Cache-tier state store. Degrades silently on unavailability.

use super::ports::HotStateStore;
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::warn;

fn namespaced(agent_id: &str) -> String {
    format!("state:{agent_id}")
}

/// Redis-backed `HotStateStore`. Every operation swallows connection errors
/// and degrades to empty/None — callers never see a hot-state-store
/// outage as a hard error.
pub struct RedisHotStateStore {
    manager: ConnectionManager,
}

impl RedisHotStateStore {
    pub async fn connect(redis_url: &str) -> redis::RedisResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl HotStateStore for RedisHotStateStore {
    async fn save_hot_state(&self, agent_id: &str, data: Value, ttl_seconds: u64) {
        let mut conn = self.manager.clone();
        let key = namespaced(agent_id);
        let Ok(payload) = serde_json::to_string(&data) else {
            warn!(agent_id, "failed to serialize hot state");
            return;
        };
        if let Err(err) = redis::cmd("SET")
            .arg(&key)
            .arg(payload)
            .arg("EX")
            .arg(ttl_seconds)
            .query_async::<_, ()>(&mut conn)
            .await
        {
            warn!(agent_id, %err, "hot state store unavailable, save degraded");
        }
    }

    async fn load_hot_state(&self, agent_id: &str) -> Option<Value> {
        let mut conn = self.manager.clone();
        let key = namespaced(agent_id);
        match redis::cmd("GET").arg(&key).query_async::<_, Option<String>>(&mut conn).await {
            Ok(Some(raw)) => serde_json::from_str(&raw).ok(),
            Ok(None) => None,
            Err(err) => {
                warn!(agent_id, %err, "hot state store unavailable, load degraded to None");
                None
            }
        }
    }

    async fn get_keys(&self, pattern: &str) -> Vec<String> {
        let mut conn = self.manager.clone();
        match redis::cmd("KEYS").arg(format!("state:{pattern}")).query_async::<_, Vec<String>>(&mut conn).await {
            Ok(keys) => keys,
            Err(err) => {
                warn!(pattern, %err, "hot state store unavailable, get_keys degraded to empty");
                Vec::new()
            }
        }
    }

    async fn delete(&self, agent_id: &str) {
        let mut conn = self.manager.clone();
        let key = namespaced(agent_id);
        if let Err(err) = redis::cmd("DEL").arg(&key).query_async::<_, ()>(&mut conn).await {
            warn!(agent_id, %err, "hot state store unavailable, delete degraded to no-op");
        }
    }
}

struct Entry {
    data: Value,
    expires_at: Instant,
}

/// In-process `HotStateStore` for tests and the no-Redis dev profile.
#[derive(Default)]
pub struct InMemoryHotStateStore {
    entries: Arc<RwLock<HashMap<String, Entry>>>,
}

impl InMemoryHotStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl HotStateStore for InMemoryHotStateStore {
    async fn save_hot_state(&self, agent_id: &str, data: Value, ttl_seconds: u64) {
        self.entries
            .write()
            .await
            .insert(agent_id.to_string(), Entry { data, expires_at: Instant::now() + Duration::from_secs(ttl_seconds) });
    }

    async fn load_hot_state(&self, agent_id: &str) -> Option<Value> {
        let entries = self.entries.read().await;
        let entry = entries.get(agent_id)?;
        if entry.expires_at < Instant::now() {
            None
        } else {
            Some(entry.data.clone())
        }
    }

    async fn get_keys(&self, pattern: &str) -> Vec<String> {
        let prefix = pattern.trim_end_matches('*');
        self.entries.read().await.keys().filter(|k| k.starts_with(prefix)).cloned().collect()
    }

    async fn delete(&self, agent_id: &str) {
        self.entries.write().await.remove(agent_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let store = InMemoryHotStateStore::new();
        store.save_hot_state("a1", serde_json::json!({"x": 1}), 3600).await;
        let loaded = store.load_hot_state("a1").await;
        assert_eq!(loaded, Some(serde_json::json!({"x": 1})));
    }

    #[tokio::test]
    async fn expired_entry_loads_as_none() {
        let store = InMemoryHotStateStore::new();
        store.save_hot_state("a1", serde_json::json!({"x": 1}), 0).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(store.load_hot_state("a1").await, None);
    }

    #[tokio::test]
    async fn delete_removes_entry() {
        let store = InMemoryHotStateStore::new();
        store.save_hot_state("a1", serde_json::json!({"x": 1}), 3600).await;
        store.delete("a1").await;
        assert_eq!(store.load_hot_state("a1").await, None);
    }

    #[tokio::test]
    async fn get_keys_matches_prefix() {
        let store = InMemoryHotStateStore::new();
        store.save_hot_state("a1", serde_json::json!({}), 3600).await;
        store.save_hot_state("a2", serde_json::json!({}), 3600).await;
        let keys = store.get_keys("*").await;
        assert_eq!(keys.len(), 2);
    }
}
