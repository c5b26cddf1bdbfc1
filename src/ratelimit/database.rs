//! Relational database backend (Postgres via sqlx).
//!
//! Observations are aggregated into fixed-width time buckets, one row
//! per (key, bucket), so row growth stays bounded no matter how hot a
//! key gets. Trades the cache backend's timing precision for
//! durability and safety across concurrent workers.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use tokio::sync::OnceCell;
use tracing::warn;
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::error::{Result, TurnstileError};
use super::backend::{now_epoch, StorageBackend, StorageKind};

/// Width of one aggregation bucket in seconds.
const BUCKET_SECS: i64 = 60;

const CREATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS rate_limit_buckets (
    rate_key      TEXT   NOT NULL,
    bucket_ts     BIGINT NOT NULL,
    request_count BIGINT NOT NULL DEFAULT 0,
    PRIMARY KEY (rate_key, bucket_ts)
)
"#;

const PURGE_STALE: &str = "DELETE FROM rate_limit_buckets WHERE rate_key = $1 AND bucket_ts < $2";

const SUM_WINDOW: &str = "SELECT COALESCE(SUM(request_count), 0)::BIGINT \
     FROM rate_limit_buckets WHERE rate_key = $1 AND bucket_ts >= $2";

const UPSERT_BUCKET: &str = "INSERT INTO rate_limit_buckets (rate_key, bucket_ts, request_count) \
     VALUES ($1, $2, 1) \
     ON CONFLICT (rate_key, bucket_ts) \
     DO UPDATE SET request_count = rate_limit_buckets.request_count + 1";

const OLDEST_BUCKET: &str = "SELECT MIN(bucket_ts) \
     FROM rate_limit_buckets WHERE rate_key = $1 AND bucket_ts >= $2";

const DELETE_KEY: &str = "DELETE FROM rate_limit_buckets WHERE rate_key = $1";

/// Floor a timestamp to its bucket boundary.
fn bucket_for(timestamp: i64) -> i64 {
    timestamp - timestamp.rem_euclid(BUCKET_SECS)
}

/// Postgres-backed rate limit storage.
pub struct DatabaseBackend {
    /// `None` when the backend was never given a usable URL
    pool: Option<PgPool>,
    /// Guards one-time schema creation on first use
    schema: OnceCell<()>,
    op_timeout: Duration,
}

impl DatabaseBackend {
    /// Create a backend from optional configuration.
    ///
    /// The pool connects lazily, so construction never touches the
    /// network; missing or malformed configuration leaves the backend
    /// permanently unavailable.
    pub fn new(config: Option<&DatabaseConfig>) -> Self {
        let op_timeout = Duration::from_millis(config.map(|c| c.timeout_ms).unwrap_or(1000));
        let pool = config.and_then(|c| {
            let options = PgPoolOptions::new()
                .max_connections(c.max_connections)
                .acquire_timeout(op_timeout);
            match options.connect_lazy(&c.url) {
                Ok(pool) => Some(pool),
                Err(e) => {
                    warn!(error = %e, "Invalid database URL, database storage disabled");
                    None
                }
            }
        });
        Self {
            pool,
            schema: OnceCell::new(),
            op_timeout,
        }
    }

    /// Pool accessor that bootstraps the schema on first use.
    async fn pool(&self) -> Result<&PgPool> {
        let pool = self
            .pool
            .as_ref()
            .ok_or(TurnstileError::Unconfigured("database"))?;
        self.schema
            .get_or_try_init(|| async {
                sqlx::query(CREATE_TABLE).execute(pool).await?;
                Ok::<(), TurnstileError>(())
            })
            .await?;
        Ok(pool)
    }

    /// Run a storage operation under the configured deadline.
    async fn with_deadline<T>(&self, op: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.op_timeout, op)
            .await
            .unwrap_or(Err(TurnstileError::Timeout(self.op_timeout)))
    }
}

#[async_trait]
impl StorageBackend for DatabaseBackend {
    fn kind(&self) -> StorageKind {
        StorageKind::Database
    }

    async fn is_available(&self) -> bool {
        let Some(pool) = self.pool.as_ref() else {
            return false;
        };
        self.with_deadline(async {
            let one: i32 = sqlx::query_scalar("SELECT 1").fetch_one(pool).await?;
            Ok(one)
        })
        .await
        .is_ok()
    }

    async fn test(&self) -> Result<bool> {
        let probe = format!("healthcheck:{}", Uuid::new_v4().simple());
        self.with_deadline(async {
            let pool = self.pool().await?;
            let bucket = bucket_for(now_epoch());
            sqlx::query(UPSERT_BUCKET)
                .bind(&probe)
                .bind(bucket)
                .execute(pool)
                .await?;
            let count: i64 = sqlx::query_scalar(SUM_WINDOW)
                .bind(&probe)
                .bind(bucket)
                .fetch_one(pool)
                .await?;
            sqlx::query(DELETE_KEY).bind(&probe).execute(pool).await?;
            Ok(count == 1)
        })
        .await
    }

    async fn current_count(&self, key: &str, window_secs: u64) -> Result<u64> {
        self.with_deadline(async {
            let pool = self.pool().await?;
            let cutoff = now_epoch() - window_secs as i64;
            sqlx::query(PURGE_STALE)
                .bind(key)
                .bind(cutoff)
                .execute(pool)
                .await?;
            let sum: i64 = sqlx::query_scalar(SUM_WINDOW)
                .bind(key)
                .bind(cutoff)
                .fetch_one(pool)
                .await?;
            Ok(sum.max(0) as u64)
        })
        .await
    }

    async fn increment_count(&self, key: &str, window_secs: u64) -> Result<bool> {
        self.with_deadline(async {
            let pool = self.pool().await?;
            let now = now_epoch();
            sqlx::query(PURGE_STALE)
                .bind(key)
                .bind(now - window_secs as i64)
                .execute(pool)
                .await?;
            // Native upsert: concurrent writers never lose an update
            sqlx::query(UPSERT_BUCKET)
                .bind(key)
                .bind(bucket_for(now))
                .execute(pool)
                .await?;
            Ok(true)
        })
        .await
    }

    async fn reset(&self, key: &str) -> Result<bool> {
        self.with_deadline(async {
            let pool = self.pool().await?;
            sqlx::query(DELETE_KEY).bind(key).execute(pool).await?;
            Ok(true)
        })
        .await
    }

    async fn ttl(&self, key: &str, window_secs: u64) -> Result<Option<u64>> {
        self.with_deadline(async {
            let pool = self.pool().await?;
            let cutoff = now_epoch() - window_secs as i64;
            let oldest: Option<i64> = sqlx::query_scalar(OLDEST_BUCKET)
                .bind(key)
                .bind(cutoff)
                .fetch_one(pool)
                .await?;
            Ok(oldest.map(|bucket| (bucket + window_secs as i64 - now_epoch()).max(0) as u64))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bucket_flooring() {
        assert_eq!(bucket_for(0), 0);
        assert_eq!(bucket_for(59), 0);
        assert_eq!(bucket_for(60), 60);
        assert_eq!(bucket_for(1_700_000_042), 1_700_000_040);
    }

    #[test]
    fn test_bucket_purged_after_window() {
        // Five observations land in bucket t0; at t0+61 with a 60s
        // window the cutoff passes t0, so the bucket is purged.
        let t0 = bucket_for(1_700_000_000);
        let cutoff = (t0 + 61) - 60;
        assert!(t0 < cutoff);
        // One second earlier the bucket still counts
        let cutoff = (t0 + 59) - 60;
        assert!(t0 >= cutoff);
    }

    #[tokio::test]
    async fn test_unconfigured_backend_is_unavailable() {
        let backend = DatabaseBackend::new(None);
        assert!(!backend.is_available().await);
    }

    #[tokio::test]
    async fn test_unconfigured_backend_operations_fail() {
        let backend = DatabaseBackend::new(None);
        let err = backend.current_count("ip:a", 60).await.unwrap_err();
        assert!(matches!(err, TurnstileError::Unconfigured("database")));
        let err = backend.reset("ip:a").await.unwrap_err();
        assert!(matches!(err, TurnstileError::Unconfigured("database")));
    }
}
