//! Networked key-value cache backend (Redis).
//!
//! The most precise medium: one sorted set per key, scored by epoch
//! seconds, gives a true sliding window with native atomic primitives.
//! Every operation runs under a short deadline so an unreachable server
//! fails fast into the coordinator's fallback path.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Client};
use tracing::warn;
use uuid::Uuid;

use crate::config::CacheConfig;
use crate::error::{Result, TurnstileError};
use super::backend::{now_epoch, StorageBackend, StorageKind};

const KEY_PREFIX: &str = "ratelimit:";

fn storage_key(key: &str) -> String {
    format!("{}{}", KEY_PREFIX, key)
}

/// Redis-backed rate limit storage.
pub struct RedisBackend {
    /// `None` when the backend was never given a usable URL
    client: Option<Client>,
    op_timeout: Duration,
}

impl RedisBackend {
    /// Create a backend from optional configuration.
    ///
    /// Missing or malformed configuration leaves the backend
    /// permanently unavailable; construction itself cannot fail.
    pub fn new(config: Option<&CacheConfig>) -> Self {
        let op_timeout = Duration::from_millis(config.map(|c| c.timeout_ms).unwrap_or(1000));
        let client = config.and_then(|c| match Client::open(c.url.as_str()) {
            Ok(client) => Some(client),
            Err(e) => {
                warn!(error = %e, "Invalid cache URL, cache storage disabled");
                None
            }
        });
        Self { client, op_timeout }
    }

    async fn connect(&self) -> Result<MultiplexedConnection> {
        let client = self
            .client
            .as_ref()
            .ok_or(TurnstileError::Unconfigured("cache"))?;
        Ok(client.get_multiplexed_async_connection().await?)
    }

    /// Run a storage operation under the configured deadline.
    async fn with_deadline<T>(&self, op: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.op_timeout, op)
            .await
            .unwrap_or(Err(TurnstileError::Timeout(self.op_timeout)))
    }

    /// Drop members scored before the window, keeping the boundary.
    async fn purge_stale(
        conn: &mut MultiplexedConnection,
        skey: &str,
        window_secs: u64,
    ) -> Result<()> {
        let cutoff = now_epoch() - window_secs as i64;
        let _: () = conn
            .zrembyscore(skey, "-inf", format!("({}", cutoff))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl StorageBackend for RedisBackend {
    fn kind(&self) -> StorageKind {
        StorageKind::Cache
    }

    async fn is_available(&self) -> bool {
        if self.client.is_none() {
            return false;
        }
        let pong = self
            .with_deadline(async {
                let mut conn = self.connect().await?;
                let pong: String = redis::cmd("PING").query_async(&mut conn).await?;
                Ok(pong)
            })
            .await;
        matches!(pong, Ok(ref reply) if reply == "PONG")
    }

    async fn test(&self) -> Result<bool> {
        let probe = format!("{}healthcheck:{}", KEY_PREFIX, Uuid::new_v4().simple());
        self.with_deadline(async {
            let mut conn = self.connect().await?;
            let _: () = conn.set_ex(&probe, "ok", 5).await?;
            let read: Option<String> = conn.get(&probe).await?;
            let _: () = conn.del(&probe).await?;
            Ok(read.as_deref() == Some("ok"))
        })
        .await
    }

    async fn current_count(&self, key: &str, window_secs: u64) -> Result<u64> {
        let skey = storage_key(key);
        self.with_deadline(async {
            let mut conn = self.connect().await?;
            Self::purge_stale(&mut conn, &skey, window_secs).await?;
            let count: u64 = conn.zcard(&skey).await?;
            Ok(count)
        })
        .await
    }

    async fn increment_count(&self, key: &str, window_secs: u64) -> Result<bool> {
        let skey = storage_key(key);
        self.with_deadline(async {
            let mut conn = self.connect().await?;
            Self::purge_stale(&mut conn, &skey, window_secs).await?;

            // Timestamp plus nonce keeps same-second observations unique
            let now = now_epoch();
            let member = format!("{}-{}", now, Uuid::new_v4().simple());
            let _: () = conn.zadd(&skey, member, now).await?;
            // Refresh expiry so abandoned keys clean themselves up
            let _: () = conn.expire(&skey, window_secs as i64).await?;
            Ok(true)
        })
        .await
    }

    async fn reset(&self, key: &str) -> Result<bool> {
        let skey = storage_key(key);
        self.with_deadline(async {
            let mut conn = self.connect().await?;
            let _: () = conn.del(&skey).await?;
            Ok(true)
        })
        .await
    }

    async fn ttl(&self, key: &str, window_secs: u64) -> Result<Option<u64>> {
        let skey = storage_key(key);
        self.with_deadline(async {
            let mut conn = self.connect().await?;
            Self::purge_stale(&mut conn, &skey, window_secs).await?;
            let oldest: Vec<(String, f64)> = conn.zrange_withscores(&skey, 0, 0).await?;
            Ok(oldest.first().map(|(_, score)| {
                let ts = *score as i64;
                (ts + window_secs as i64 - now_epoch()).max(0) as u64
            }))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_key_prefix() {
        assert_eq!(storage_key("ip:1.2.3.4"), "ratelimit:ip:1.2.3.4");
    }

    #[tokio::test]
    async fn test_unconfigured_backend_is_unavailable() {
        let backend = RedisBackend::new(None);
        assert!(!backend.is_available().await);
    }

    #[tokio::test]
    async fn test_unconfigured_backend_operations_fail() {
        let backend = RedisBackend::new(None);
        let err = backend.current_count("ip:a", 60).await.unwrap_err();
        assert!(matches!(err, TurnstileError::Unconfigured("cache")));
        let err = backend.is_limited("ip:a", 10, 60).await.unwrap_err();
        assert!(matches!(err, TurnstileError::Unconfigured("cache")));
    }

    #[tokio::test]
    async fn test_malformed_url_disables_backend() {
        let backend = RedisBackend::new(Some(&CacheConfig {
            url: "not a url".to_string(),
            timeout_ms: 50,
        }));
        assert!(!backend.is_available().await);
    }
}
