use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tracing::debug;

use crate::config::DispatchConfig;
use crate::context::WindowContext;
use crate::topics::{self, Destination};

/// The only contract the subscription store needs from its persistence:
/// get, set with expiry. Anything key-value shaped qualifies.
#[async_trait]
pub trait TopicCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;
}

pub struct RedisTopicCache {
    conn: ConnectionManager,
}

impl RedisTopicCache {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).context("invalid redis url")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("failed connecting redis topic cache")?;
        Ok(Self { conn })
    }
}

#[async_trait]
impl TopicCache for RedisTopicCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await.context("redis get failed")?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .set_ex(key, value, ttl.as_secs().max(1))
            .await
            .context("redis set failed")?;
        Ok(())
    }
}

/// In-memory cache with expiry, for tests and single-process runs.
#[derive(Default)]
pub struct MemoryTopicCache {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl MemoryTopicCache {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TopicCache for MemoryTopicCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some((_, deadline)) if *deadline <= Instant::now() => {
                entries.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.lock().await;
        entries.insert(key.to_owned(), (value.to_owned(), Instant::now() + ttl));
        Ok(())
    }
}

/// Per-window set of subscribed topics. Written by producers when a page is
/// served, read by the gateway when the websocket attaches. A window that
/// never had `set_topics` called simply receives nothing targeted; that is
/// the opt-in model, not an error.
pub struct SubscriptionStore {
    cache: Arc<dyn TopicCache>,
    config: DispatchConfig,
}

impl SubscriptionStore {
    pub fn new(cache: Arc<dyn TopicCache>, config: DispatchConfig) -> Self {
        Self { cache, config }
    }

    /// Replace the window's full topic set. The window topic and the
    /// broadcast topic are always included; the user topic is added when the
    /// context is authenticated. Destinations that do not resolve are
    /// dropped.
    pub async fn set_topics(
        &self,
        ctx: &WindowContext,
        destinations: &[Destination],
    ) -> Result<()> {
        let Some(window_key) = ctx.window_key.as_deref() else {
            bail!("set_topics requires a context with a window key");
        };
        let mut topic_set = BTreeSet::new();
        for dest in destinations {
            if dest.is_server_side() {
                continue;
            }
            if let Some(key) = topics::resolve_key(Some(ctx), dest) {
                topic_set.insert(key);
            }
        }
        if ctx.is_authenticated() {
            if let Some(key) = topics::resolve_key(Some(ctx), &Destination::User) {
                topic_set.insert(key);
            }
        }
        if let Some(key) = topics::resolve_key(Some(ctx), &Destination::Window) {
            topic_set.insert(key);
        }
        topic_set.insert(topics::topic_key(topics::BROADCAST_TOPIC));

        let cache_key = self.config.subscription_key(window_key);
        let value = serde_json::to_string(&topic_set.iter().collect::<Vec<_>>())?;
        debug!("window {window_key} is now bound to {} topics", topic_set.len());
        self.cache
            .set(
                &cache_key,
                &value,
                Duration::from_secs(self.config.subscription_ttl_secs),
            )
            .await
    }

    /// Current hashed topic set for a window, or empty when absent/expired.
    pub async fn get_topics(&self, window_key: &str) -> Result<Vec<String>> {
        let cache_key = self.config.subscription_key(window_key);
        let Some(value) = self.cache.get(&cache_key).await? else {
            return Ok(Vec::new());
        };
        let topics: Vec<String> = serde_json::from_str(&value)
            .with_context(|| format!("corrupt subscription record for window {window_key}"))?;
        Ok(topics)
    }
}
