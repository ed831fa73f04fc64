//! Engine configuration
//!
//! Loaded from TOML, then `PORT`, `BROKER_URL` and `REDIS_URL` from the
//! environment override the file. Every section has defaults so an empty
//! file is a valid in-memory configuration.

use crate::cache::RedisTarget;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct EngineConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub broker: BrokerSection,
    #[serde(default)]
    pub consumer: ConsumerSection,
    #[serde(default)]
    pub shutdown: ShutdownSection,
    /// Absent means handlers get `CacheError::NotConfigured`
    #[serde(default)]
    pub cache: Option<CacheSection>,
    #[serde(default)]
    pub topics: Vec<TopicSection>,
}

/// HTTP listener
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSection {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: String,
    /// Serve `POST /shutdown` to loopback peers
    #[serde(default)]
    pub admin_shutdown: bool,
}

fn default_port() -> u16 {
    3000
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: default_port(),
            host: default_host(),
            admin_shutdown: false,
        }
    }
}

/// Which broker backend consumers attach to
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BrokerBackend {
    Mqtt,
    #[default]
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    #[serde(default)]
    pub backend: BrokerBackend,
    /// Broker URL, `mqtt://` or `mqtts://`
    #[serde(default = "default_broker_url")]
    pub url: String,
    /// Consumer group shared by every instance of this engine
    #[serde(default = "default_group_id")]
    pub group_id: String,
    /// Client id prefix; defaults to the group id
    pub client_id: Option<String>,
    /// Environment variable containing the username
    pub username_env: Option<String>,
    /// Environment variable containing the password
    pub password_env: Option<String>,
    /// Seconds to wait for the broker to acknowledge connect and subscribe
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_broker_url() -> String {
    "mqtt://localhost:1883".to_string()
}

fn default_group_id() -> String {
    "silk-engine".to_string()
}

fn default_connect_timeout_secs() -> u64 {
    10
}

impl Default for BrokerSection {
    fn default() -> Self {
        Self {
            backend: BrokerBackend::default(),
            url: default_broker_url(),
            group_id: default_group_id(),
            client_id: None,
            username_env: None,
            password_env: None,
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl BrokerSection {
    pub fn client_id(&self) -> &str {
        self.client_id.as_deref().unwrap_or(&self.group_id)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Username from the configured environment variable
    pub fn username(&self) -> Option<String> {
        self.username_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
    }

    /// Password from the configured environment variable
    pub fn password(&self) -> Option<String> {
        self.password_env
            .as_ref()
            .and_then(|name| std::env::var(name).ok())
    }
}

/// Consumption loop behaviour
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConsumerSection {
    /// Await each record's dispatch before pulling the next
    #[serde(default = "default_ordered")]
    pub ordered: bool,
    /// Concurrent dispatches per consumer in unordered mode
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// Per-handler bound in milliseconds; 0 disables it
    #[serde(default)]
    pub handler_timeout_ms: u64,
    /// Budget for one consumer's `stop()`
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

fn default_ordered() -> bool {
    true
}

fn default_max_in_flight() -> usize {
    64
}

fn default_drain_timeout_ms() -> u64 {
    10_000
}

impl Default for ConsumerSection {
    fn default() -> Self {
        Self {
            ordered: default_ordered(),
            max_in_flight: default_max_in_flight(),
            handler_timeout_ms: 0,
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

impl ConsumerSection {
    pub fn handler_timeout(&self) -> Option<Duration> {
        (self.handler_timeout_ms > 0).then(|| Duration::from_millis(self.handler_timeout_ms))
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

/// Coordinated shutdown budgets
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ShutdownSection {
    /// Global budget for signal or administrative shutdown
    #[serde(default = "default_shutdown_timeout_ms")]
    pub timeout_ms: u64,
    /// Expedited budget when a process fault triggered shutdown
    #[serde(default = "default_fault_timeout_ms")]
    pub fault_timeout_ms: u64,
    /// Grace for in-flight HTTP requests
    #[serde(default = "default_server_grace_ms")]
    pub server_grace_ms: u64,
}

fn default_shutdown_timeout_ms() -> u64 {
    15_000
}

fn default_fault_timeout_ms() -> u64 {
    2_000
}

fn default_server_grace_ms() -> u64 {
    5_000
}

impl Default for ShutdownSection {
    fn default() -> Self {
        Self {
            timeout_ms: default_shutdown_timeout_ms(),
            fault_timeout_ms: default_fault_timeout_ms(),
            server_grace_ms: default_server_grace_ms(),
        }
    }
}

impl ShutdownSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn fault_timeout(&self) -> Duration {
        Duration::from_millis(self.fault_timeout_ms)
    }

    pub fn server_grace(&self) -> Duration {
        Duration::from_millis(self.server_grace_ms)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    #[default]
    Memory,
    Redis,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CacheSection {
    #[serde(default)]
    pub backend: CacheBackend,
    /// Required when `backend = "redis"`
    pub redis: Option<RedisTarget>,
}

/// One consumer subscription
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TopicSection {
    pub name: String,
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl EngineConfig {
    /// Copy safe to print: cache credentials are masked
    pub fn redacted(&self) -> EngineConfig {
        let mut config = self.clone();
        if let Some(target) = config.cache.as_mut().and_then(|cache| cache.redis.as_mut()) {
            *target = target.masked();
        }
        config
    }

    /// Load, apply environment overrides, validate
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml(&content)?;
        config.apply_env_overrides(|name| std::env::var(name).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse TOML without overrides or validation
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Apply `PORT`, `BROKER_URL` and `REDIS_URL` using `lookup`
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(port) = lookup("PORT").and_then(|p| p.trim().parse::<u16>().ok()) {
            self.server.port = port;
        }

        if let Some(url) = lookup("BROKER_URL").filter(|u| !u.is_empty()) {
            self.broker.url = url;
        }

        if let Some(url) = lookup("REDIS_URL").filter(|u| !u.is_empty()) {
            self.cache = Some(CacheSection {
                backend: CacheBackend::Redis,
                redis: Some(RedisTarget::Url(url)),
            });
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker.group_id.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "broker.group_id must not be empty".to_string(),
            ));
        }

        if self.broker.backend == BrokerBackend::Mqtt {
            validate_broker_url(&self.broker.url)?;
        }

        if self.consumer.max_in_flight == 0 {
            return Err(ConfigError::InvalidConfig(
                "consumer.max_in_flight must be at least 1".to_string(),
            ));
        }

        let mut seen = HashSet::new();
        for topic in &self.topics {
            if topic.name.trim().is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "topic names must not be empty".to_string(),
                ));
            }
            if !seen.insert(topic.name.as_str()) {
                return Err(ConfigError::InvalidConfig(format!(
                    "topic '{}' is listed more than once",
                    topic.name
                )));
            }
        }

        if let Some(cache) = &self.cache {
            if cache.backend == CacheBackend::Redis && cache.redis.is_none() {
                return Err(ConfigError::InvalidConfig(
                    "cache.backend = \"redis\" requires cache.redis".to_string(),
                ));
            }
        }

        Ok(())
    }

    pub fn topic_names(&self) -> Vec<String> {
        self.topics.iter().map(|t| t.name.clone()).collect()
    }

    /// Socket address string for the HTTP listener
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[server]
port = 0
host = "127.0.0.1"

[broker]
backend = "memory"
group_id = "test-group"

[consumer]
drain_timeout_ms = 1000

[shutdown]
timeout_ms = 2000
fault_timeout_ms = 500
server_grace_ms = 200

[cache]
backend = "memory"

[[topics]]
name = "orders"
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

fn validate_broker_url(raw: &str) -> Result<(), ConfigError> {
    let url = Url::parse(raw).map_err(|_| ConfigError::InvalidBrokerUrl(raw.to_string()))?;

    if !matches!(url.scheme(), "mqtt" | "mqtts" | "tcp") || url.host_str().is_none() {
        return Err(ConfigError::InvalidBrokerUrl(raw.to_string()));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_empty_file_uses_defaults() {
        let config = EngineConfig::from_toml("").unwrap();

        assert_eq!(config.server.port, 3000);
        assert_eq!(config.broker.backend, BrokerBackend::Memory);
        assert_eq!(config.broker.group_id, "silk-engine");
        assert!(config.consumer.ordered);
        assert_eq!(config.consumer.max_in_flight, 64);
        assert_eq!(config.consumer.handler_timeout(), None);
        assert_eq!(config.consumer.drain_timeout(), Duration::from_secs(10));
        assert_eq!(config.shutdown.timeout(), Duration::from_secs(15));
        assert_eq!(config.shutdown.fault_timeout(), Duration::from_secs(2));
        assert!(config.cache.is_none());
        assert!(config.topics.is_empty());
        assert!(config.validate().is_ok());
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_full_config() {
        let config = EngineConfig::from_toml(
            r#"
[server]
port = 8080

[broker]
backend = "mqtt"
url = "mqtts://broker.example.com:8883"
group_id = "orders-service"
username_env = "BROKER_USER"
password_env = "BROKER_PASS"

[consumer]
ordered = false
max_in_flight = 8
handler_timeout_ms = 250

[cache]
backend = "redis"
redis = { host = "cache", port = 6380 }

[[topics]]
name = "orders"

[[topics]]
name = "payments"
"#,
        )
        .unwrap();

        assert_eq!(config.server.port, 8080);
        assert_eq!(config.broker.backend, BrokerBackend::Mqtt);
        assert_eq!(config.broker.client_id(), "orders-service");
        assert!(!config.consumer.ordered);
        assert_eq!(
            config.consumer.handler_timeout(),
            Some(Duration::from_millis(250))
        );
        assert_eq!(config.topic_names(), vec!["orders", "payments"]);
        assert_eq!(config.cache.as_ref().unwrap().backend, CacheBackend::Redis);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_redacted_masks_cache_password() {
        let config = EngineConfig::from_toml(
            r#"
[cache]
backend = "redis"
redis = { host = "cache", password = "hunter2" }
"#,
        )
        .unwrap();

        let rendered = toml::to_string_pretty(&config.redacted()).unwrap();
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("***"));
        assert!(toml::to_string_pretty(&config).unwrap().contains("hunter2"));
    }

    #[test]
    fn test_env_overrides() {
        let mut config = EngineConfig::default();
        config.apply_env_overrides(lookup(&[
            ("PORT", "4100"),
            ("BROKER_URL", "mqtt://other:1883"),
            ("REDIS_URL", "redis://cache:6379"),
        ]));

        assert_eq!(config.server.port, 4100);
        assert_eq!(config.broker.url, "mqtt://other:1883");
        let cache = config.cache.unwrap();
        assert_eq!(cache.backend, CacheBackend::Redis);
        assert_eq!(cache.redis, Some(RedisTarget::from("redis://cache:6379")));
    }

    #[test]
    fn test_unparseable_port_override_is_ignored() {
        let mut config = EngineConfig::default();
        config.apply_env_overrides(lookup(&[("PORT", "not-a-port")]));
        assert_eq!(config.server.port, 3000);
    }

    #[test]
    fn test_invalid_broker_url() {
        let mut config = EngineConfig::default();
        config.broker.backend = BrokerBackend::Mqtt;
        config.broker.url = "invalid-url".to_string();

        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBrokerUrl(_))
        ));

        config.broker.url = "http://localhost".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidBrokerUrl(_))
        ));
    }

    #[test]
    fn test_broker_url_ignored_for_memory_backend() {
        let mut config = EngineConfig::default();
        config.broker.url = "invalid-url".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duplicate_topics_rejected() {
        let config = EngineConfig::from_toml(
            r#"
[[topics]]
name = "orders"

[[topics]]
name = "orders"
"#,
        )
        .unwrap();

        assert!(matches!(config.validate(), Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_empty_group_and_zero_in_flight_rejected() {
        let mut config = EngineConfig::default();
        config.broker.group_id = " ".to_string();
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.consumer.max_in_flight = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_redis_backend_requires_target() {
        let config = EngineConfig::from_toml("[cache]\nbackend = \"redis\"\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_test_config_parses() {
        let config = EngineConfig::test_config();
        assert_eq!(config.broker.group_id, "test-group");
        assert_eq!(config.listen_addr(), "127.0.0.1:0");
        assert!(config.validate().is_ok());
    }
}
