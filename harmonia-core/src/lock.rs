use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock backend error: {0}")]
    Backend(String),
}

impl From<redis::RedisError> for LockError {
    fn from(error: redis::RedisError) -> Self {
        LockError::Backend(error.to_string())
    }
}

/// TTL'd, token-guarded advisory mutual exclusion shared by all service
/// instances. Acquisition is `SET key token EX ttl NX`; release deletes the
/// key only while it still holds the caller's token.
#[async_trait]
pub trait BuildLock: Send + Sync {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError>;

    /// Atomic compare-and-delete. Returns true when the caller's token was
    /// still the holder.
    async fn release(&self, key: &str, token: &str) -> Result<bool, LockError>;

    /// Plain existence probe; only meaningful when no local build is in
    /// flight for the same key.
    async fn is_held(&self, key: &str) -> Result<bool, LockError>;
}

const RELEASE_SCRIPT: &str =
    "if redis.call('get', KEYS[1]) == ARGV[1] then return redis.call('del', KEYS[1]) else return 0 end";

pub struct RedisBuildLock {
    client: redis::Client,
}

impl RedisBuildLock {
    pub fn connect(url: &str) -> Result<Self, LockError> {
        let client = redis::Client::open(url)?;
        Ok(Self { client })
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, LockError> {
        Ok(self.client.get_multiplexed_async_connection().await?)
    }
}

#[async_trait]
impl BuildLock for RedisBuildLock {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = self.connection().await?;
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .arg("NX")
            .query_async(&mut conn)
            .await?;
        Ok(reply.as_deref() == Some("OK"))
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, LockError> {
        let mut conn = self.connection().await?;
        let released: i64 = redis::Script::new(RELEASE_SCRIPT)
            .key(key)
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(released == 1)
    }

    async fn is_held(&self, key: &str) -> Result<bool, LockError> {
        let mut conn = self.connection().await?;
        let exists: bool = redis::cmd("EXISTS").arg(key).query_async(&mut conn).await?;
        Ok(exists)
    }
}

/// Single-node stand-in with the same token/TTL semantics. Used when no redis
/// backend is configured and by tests exercising cross-instance behaviour.
#[derive(Debug, Default)]
pub struct InMemoryBuildLock {
    entries: Mutex<HashMap<String, (String, Instant)>>,
}

impl InMemoryBuildLock {
    pub fn new() -> Self {
        Self::default()
    }

    fn purge_expired(entries: &mut HashMap<String, (String, Instant)>) {
        let now = Instant::now();
        entries.retain(|_, (_, expires_at)| *expires_at > now);
    }
}

#[async_trait]
impl BuildLock for InMemoryBuildLock {
    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut entries = self.entries.lock().unwrap();
        Self::purge_expired(&mut entries);
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), (token.to_string(), Instant::now() + ttl));
        Ok(true)
    }

    async fn release(&self, key: &str, token: &str) -> Result<bool, LockError> {
        let mut entries = self.entries.lock().unwrap();
        Self::purge_expired(&mut entries);
        match entries.get(key) {
            Some((holder, _)) if holder == token => {
                entries.remove(key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn is_held(&self, key: &str) -> Result<bool, LockError> {
        let mut entries = self.entries.lock().unwrap();
        Self::purge_expired(&mut entries);
        Ok(entries.contains_key(key))
    }
}
