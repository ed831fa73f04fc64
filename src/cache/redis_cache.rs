use super::{Cache, CacheError};
use async_trait::async_trait;
use bytes::Bytes;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, warn};
use url::Url;

fn default_redis_port() -> u16 {
    6379
}

/// Where the Redis backend connects: a URL or its parts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RedisTarget {
    Url(String),
    Parts {
        host: String,
        #[serde(default = "default_redis_port")]
        port: u16,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        password: Option<String>,
    },
}

impl RedisTarget {
    /// Connection URL, credentials percent-encoded
    pub fn to_url(&self) -> Result<String, CacheError> {
        match self {
            RedisTarget::Url(url) => {
                Url::parse(url).map_err(|e| CacheError::InvalidTarget(e.to_string()))?;
                Ok(url.clone())
            }
            RedisTarget::Parts {
                host,
                port,
                username,
                password,
            } => {
                let mut url = Url::parse(&format!("redis://{host}:{port}"))
                    .map_err(|e| CacheError::InvalidTarget(e.to_string()))?;
                if let Some(username) = username {
                    url.set_username(username)
                        .map_err(|_| CacheError::InvalidTarget("username rejected".to_string()))?;
                }
                if let Some(password) = password {
                    url.set_password(Some(password))
                        .map_err(|_| CacheError::InvalidTarget("password rejected".to_string()))?;
                }
                Ok(url.to_string())
            }
        }
    }

    /// URL with the password masked, for logs
    pub fn redacted(&self) -> String {
        match self.to_url().and_then(|u| {
            Url::parse(&u).map_err(|e| CacheError::InvalidTarget(e.to_string()))
        }) {
            Ok(mut url) => {
                if url.password().is_some() {
                    let _ = url.set_password(Some("***"));
                }
                url.to_string()
            }
            Err(_) => "<invalid redis target>".to_string(),
        }
    }

    /// Same target with any password masked, for display
    pub fn masked(&self) -> RedisTarget {
        match self {
            RedisTarget::Url(_) => RedisTarget::Url(self.redacted()),
            RedisTarget::Parts {
                host,
                port,
                username,
                password,
            } => RedisTarget::Parts {
                host: host.clone(),
                port: *port,
                username: username.clone(),
                password: password.as_ref().map(|_| "***".to_string()),
            },
        }
    }
}

impl From<&str> for RedisTarget {
    fn from(url: &str) -> Self {
        RedisTarget::Url(url.to_string())
    }
}

/// Remote cache backed by Redis
///
/// `connect` must succeed before any command; the connection manager
/// reconnects on its own after that.
pub struct RedisCache {
    target: RedisTarget,
    client: redis::Client,
    connection: RwLock<Option<ConnectionManager>>,
}

impl RedisCache {
    pub fn new(target: RedisTarget) -> Result<Self, CacheError> {
        let url = target.to_url()?;
        let client = redis::Client::open(url.as_str())?;
        Ok(Self {
            target,
            client,
            connection: RwLock::new(None),
        })
    }

    pub fn target(&self) -> &RedisTarget {
        &self.target
    }

    pub async fn is_connected(&self) -> bool {
        self.connection.read().await.is_some()
    }

    async fn connection(&self) -> Result<ConnectionManager, CacheError> {
        self.connection
            .read()
            .await
            .clone()
            .ok_or(CacheError::NotConnected("redis"))
    }
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCache")
            .field("target", &self.target.redacted())
            .finish()
    }
}

#[async_trait]
impl Cache for RedisCache {
    fn backend(&self) -> &'static str {
        "redis"
    }

    async fn connect(&self) -> Result<(), CacheError> {
        let mut slot = self.connection.write().await;
        if slot.is_some() {
            return Ok(());
        }

        match ConnectionManager::new(self.client.clone()).await {
            Ok(manager) => {
                *slot = Some(manager);
                info!(target_url = %self.target.redacted(), "Redis connected");
                Ok(())
            }
            Err(e) => {
                warn!(target_url = %self.target.redacted(), error = %e, "Redis connection failed");
                Err(e.into())
            }
        }
    }

    async fn disconnect(&self) -> Result<(), CacheError> {
        if self.connection.write().await.take().is_some() {
            info!("Redis disconnected");
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        let mut conn = self.connection().await?;
        let value: Option<Vec<u8>> = conn.get(key).await?;
        Ok(value.map(Bytes::from))
    }

    async fn set(&self, key: &str, value: Bytes) -> Result<(), CacheError> {
        let mut conn = self.connection().await?;
        conn.set::<_, _, ()>(key, value.to_vec()).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool, CacheError> {
        let mut conn = self.connection().await?;
        let removed: i64 = conn.del(key).await?;
        Ok(removed > 0)
    }
}
