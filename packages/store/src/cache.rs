//! Cache layer for the conversation store: keyspace, TTL, and the two
//! interchangeable backends behind one [`CacheBackend`] trait, per §4.I and
//! §6's "Cache layout".

use std::time::Duration;

use async_trait::async_trait;
use chatgraph_store_models::{ConversationMeta, StoredMessage};

use crate::DEFAULT_CACHE_TTL_SECS;

/// `conv:meta:{user}:{id}`.
#[must_use]
pub fn meta_key(user_client_id: &str, conversation_id: &str) -> String {
    format!("conv:meta:{user_client_id}:{conversation_id}")
}

/// `conv:msgs:{id}`.
#[must_use]
pub fn msgs_key(conversation_id: &str) -> String {
    format!("conv:msgs:{conversation_id}")
}

/// Bounded-TTL read-through cache for conversation metadata and message
/// lists. Failures are never propagated to callers — the store logs and
/// falls back to durable storage, per §4.I.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    async fn get_meta(&self, key: &str) -> Option<ConversationMeta>;
    async fn set_meta(&self, key: &str, value: ConversationMeta);
    async fn invalidate_meta(&self, key: &str);

    async fn get_msgs(&self, key: &str) -> Option<Vec<StoredMessage>>;
    async fn set_msgs(&self, key: &str, value: Vec<StoredMessage>);
    async fn invalidate_msgs(&self, key: &str);
}

/// In-process cache backed by `moka::future::Cache`, the default (and only
/// non-feature-gated) backend — selected when `CHAT_HISTORY_MODE` is `local`
/// or unset.
pub struct MokaCacheBackend {
    meta: moka::future::Cache<String, ConversationMeta>,
    msgs: moka::future::Cache<String, Vec<StoredMessage>>,
}

impl MokaCacheBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::with_ttl(Duration::from_secs(DEFAULT_CACHE_TTL_SECS))
    }

    #[must_use]
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            meta: moka::future::Cache::builder().time_to_live(ttl).build(),
            msgs: moka::future::Cache::builder().time_to_live(ttl).build(),
        }
    }
}

impl Default for MokaCacheBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CacheBackend for MokaCacheBackend {
    async fn get_meta(&self, key: &str) -> Option<ConversationMeta> {
        self.meta.get(key).await
    }

    async fn set_meta(&self, key: &str, value: ConversationMeta) {
        self.meta.insert(key.to_string(), value).await;
    }

    async fn invalidate_meta(&self, key: &str) {
        self.meta.invalidate(key).await;
    }

    async fn get_msgs(&self, key: &str) -> Option<Vec<StoredMessage>> {
        self.msgs.get(key).await
    }

    async fn set_msgs(&self, key: &str, value: Vec<StoredMessage>) {
        self.msgs.insert(key.to_string(), value).await;
    }

    async fn invalidate_msgs(&self, key: &str) {
        self.msgs.invalidate(key).await;
    }
}

/// A cache backend that never returns a hit; selected when no caching is
/// desired. Kept for symmetry with `MokaCacheBackend` during tests.
pub struct NoopCacheBackend;

#[async_trait]
impl CacheBackend for NoopCacheBackend {
    async fn get_meta(&self, _key: &str) -> Option<ConversationMeta> {
        None
    }

    async fn set_meta(&self, _key: &str, _value: ConversationMeta) {}

    async fn invalidate_meta(&self, _key: &str) {}

    async fn get_msgs(&self, _key: &str) -> Option<Vec<StoredMessage>> {
        None
    }

    async fn set_msgs(&self, _key: &str, _value: Vec<StoredMessage>) {}

    async fn invalidate_msgs(&self, _key: &str) {}
}

#[cfg(feature = "redis-cache")]
pub use redis_backend::RedisCacheBackend;

#[cfg(feature = "redis-cache")]
mod redis_backend {
    use super::{CacheBackend, ConversationMeta, StoredMessage, DEFAULT_CACHE_TTL_SECS};
    use async_trait::async_trait;
    use redis::AsyncCommands;

    /// Shared cache backed by Redis, selected via `CHAT_HISTORY_MODE=redis`
    /// for operators who want a cache shared across processes (§4.I).
    pub struct RedisCacheBackend {
        client: redis::Client,
        ttl_secs: u64,
    }

    impl RedisCacheBackend {
        /// # Errors
        ///
        /// Returns an error if `url` cannot be parsed into a Redis client.
        pub fn new(url: &str) -> Result<Self, redis::RedisError> {
            Ok(Self {
                client: redis::Client::open(url)?,
                ttl_secs: DEFAULT_CACHE_TTL_SECS,
            })
        }

        async fn get_json<T: serde::de::DeserializeOwned>(&self, key: &str) -> Option<T> {
            let mut conn = self.client.get_multiplexed_async_connection().await.ok()?;
            let raw: Option<String> = conn.get(key).await.ok()?;
            raw.and_then(|s| serde_json::from_str(&s).ok())
        }

        async fn set_json<T: serde::Serialize>(&self, key: &str, value: &T) {
            let Ok(mut conn) = self.client.get_multiplexed_async_connection().await else {
                log::warn!("redis cache: failed to connect while writing {key}");
                return;
            };
            let Ok(raw) = serde_json::to_string(value) else {
                return;
            };
            if let Err(err) = conn
                .set_ex::<_, _, ()>(key, raw, self.ttl_secs)
                .await
            {
                log::warn!("redis cache: failed to write {key}: {err}");
            }
        }

        async fn del(&self, key: &str) {
            let Ok(mut conn) = self.client.get_multiplexed_async_connection().await else {
                log::warn!("redis cache: failed to connect while invalidating {key}");
                return;
            };
            if let Err(err) = conn.del::<_, ()>(key).await {
                log::warn!("redis cache: failed to invalidate {key}: {err}");
            }
        }
    }

    #[async_trait]
    impl CacheBackend for RedisCacheBackend {
        async fn get_meta(&self, key: &str) -> Option<ConversationMeta> {
            self.get_json(key).await
        }

        async fn set_meta(&self, key: &str, value: ConversationMeta) {
            self.set_json(key, &value).await;
        }

        async fn invalidate_meta(&self, key: &str) {
            self.del(key).await;
        }

        async fn get_msgs(&self, key: &str) -> Option<Vec<StoredMessage>> {
            self.get_json(key).await
        }

        async fn set_msgs(&self, key: &str, value: Vec<StoredMessage>) {
            self.set_json(key, &value).await;
        }

        async fn invalidate_msgs(&self, key: &str) {
            self.del(key).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_meta() -> ConversationMeta {
        ConversationMeta {
            conversation_id: "conv-1".to_string(),
            user_client_id: "user-1".to_string(),
            title: "hello".to_string(),
            model: "gpt-4.1".to_string(),
            agent_level_llm_overwrite: None,
            created_at: chrono::Utc::now(),
            last_modified: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn moka_cache_round_trips_and_invalidates() {
        let cache = MokaCacheBackend::new();
        let key = meta_key("user-1", "conv-1");

        assert!(cache.get_meta(&key).await.is_none());
        cache.set_meta(&key, sample_meta()).await;
        assert_eq!(cache.get_meta(&key).await.unwrap().conversation_id, "conv-1");

        cache.invalidate_meta(&key).await;
        assert!(cache.get_meta(&key).await.is_none());
    }

    #[tokio::test]
    async fn noop_cache_never_hits() {
        let cache = NoopCacheBackend;
        let key = meta_key("user-1", "conv-1");
        cache.set_meta(&key, sample_meta()).await;
        assert!(cache.get_meta(&key).await.is_none());
    }
}
