use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub redis: RedisConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_gateway_bind")]
    pub bind: String,
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    #[serde(default = "default_outbound_queue_capacity")]
    pub outbound_queue_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind: default_gateway_bind(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            outbound_queue_capacity: default_outbound_queue_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    #[serde(default = "default_backend_mode")]
    pub backend: BackendMode,
    #[serde(default = "default_queue_name")]
    pub default_queue: String,
    /// Worker-pool sizes per queue name for the `pool` backend. The special
    /// empty-string key is the fallback size for queues not listed here.
    #[serde(default = "default_pool_sizes")]
    pub pool_sizes: HashMap<String, usize>,
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_subscription_ttl_secs")]
    pub subscription_ttl_secs: u64,
    /// Poll interval for promoting due scheduled jobs on the task-queue backend.
    #[serde(default = "default_scheduler_poll_ms")]
    pub scheduler_poll_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            backend: default_backend_mode(),
            default_queue: default_queue_name(),
            pool_sizes: default_pool_sizes(),
            key_prefix: default_key_prefix(),
            subscription_ttl_secs: default_subscription_ttl_secs(),
            scheduler_poll_ms: default_scheduler_poll_ms(),
        }
    }
}

impl DispatchConfig {
    pub fn pool_size(&self, queue: &str) -> usize {
        self.pool_sizes
            .get(queue)
            .or_else(|| self.pool_sizes.get(""))
            .copied()
            .unwrap_or(DEFAULT_POOL_SIZE)
    }

    pub fn queue_key(&self, queue: &str) -> String {
        format!("{}queue.{queue}", self.key_prefix)
    }

    pub fn scheduled_key(&self, queue: &str) -> String {
        format!("{}scheduled.{queue}", self.key_prefix)
    }

    pub fn subscription_key(&self, window_key: &str) -> String {
        format!("{}topics.{window_key}", self.key_prefix)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendMode {
    /// Run jobs in-place before the trigger call returns.
    Inline,
    /// Per-queue pools of worker tasks inside this process.
    Pool,
    /// Hand jobs to sibling worker processes over named redis lists.
    Channel,
    /// Durable redis queue with eta/countdown/expires support.
    TaskQueue,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_url")]
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed reading config file {}", path.display()))?;
        let config: Config = toml::from_str(&text)
            .with_context(|| format!("failed parsing config file {}", path.display()))?;
        Ok(config)
    }
}

const DEFAULT_POOL_SIZE: usize = 5;

fn default_gateway_bind() -> String {
    "127.0.0.1:8787".to_owned()
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_outbound_queue_capacity() -> usize {
    64
}

fn default_backend_mode() -> BackendMode {
    BackendMode::Pool
}

fn default_queue_name() -> String {
    "default".to_owned()
}

fn default_pool_sizes() -> HashMap<String, usize> {
    HashMap::from([(String::new(), DEFAULT_POOL_SIZE)])
}

fn default_key_prefix() -> String {
    "sigbridge.".to_owned()
}

fn default_subscription_ttl_secs() -> u64 {
    36_000
}

fn default_scheduler_poll_ms() -> u64 {
    500
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_owned()
}

#[cfg(test)]
mod tests {
    use super::{BackendMode, Config};

    #[test]
    fn empty_config_uses_defaults() {
        let config: Config = toml::from_str("").expect("parse");
        assert_eq!(config.dispatch.default_queue, "default");
        assert_eq!(config.dispatch.backend, BackendMode::Pool);
        assert_eq!(config.dispatch.pool_size("anything"), 5);
        assert_eq!(config.gateway.bind, "127.0.0.1:8787");
        assert_eq!(config.dispatch.subscription_ttl_secs, 36_000);
    }

    #[test]
    fn pool_size_prefers_exact_queue_then_fallback() {
        let config: Config = toml::from_str(
            r#"
[dispatch]
backend = "task_queue"
pool_sizes = { "slow" = 2, "" = 8 }
"#,
        )
        .expect("parse");
        assert_eq!(config.dispatch.backend, BackendMode::TaskQueue);
        assert_eq!(config.dispatch.pool_size("slow"), 2);
        assert_eq!(config.dispatch.pool_size("other"), 8);
    }

    #[test]
    fn key_helpers_apply_prefix() {
        let config = Config::default();
        assert_eq!(
            config.dispatch.queue_key("default"),
            "sigbridge.queue.default"
        );
        assert_eq!(
            config.dispatch.subscription_key("w123"),
            "sigbridge.topics.w123"
        );
    }
}
