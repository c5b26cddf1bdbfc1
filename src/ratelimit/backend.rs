//! Storage backend contract shared by every rate-limit medium.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Identifies one concrete storage medium.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// Networked key-value cache (Redis)
    Cache,
    /// Relational database (Postgres)
    Database,
    /// Process-local memory
    Memory,
    /// Local filesystem
    File,
}

impl StorageKind {
    /// Stable name used in configuration and status reports.
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageKind::Cache => "cache",
            StorageKind::Database => "database",
            StorageKind::Memory => "memory",
            StorageKind::File => "file",
        }
    }
}

impl std::fmt::Display for StorageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Snapshot of one key's standing against its limit.
///
/// Feeds rate-limit response headers and status dashboards.
#[derive(Debug, Clone, Serialize)]
pub struct RateLimitInfo {
    /// Observations currently inside the window
    pub count: u64,
    /// Requests left before the key is limited
    pub remaining: u64,
    /// Epoch seconds at which the oldest observation expires
    pub reset_time_epoch: i64,
    /// Backend that answered
    pub storage: StorageKind,
    /// Seconds until the oldest observation leaves the window
    pub ttl_secs: u64,
}

/// Availability summary for one backend.
#[derive(Debug, Clone, Serialize)]
pub struct StorageStatus {
    /// Passed the cheap availability probe
    pub available: bool,
    /// Currently selected by the coordinator
    pub active: bool,
    /// Passed an active read/write round trip
    pub working: bool,
}

/// Outcome of an explicit round-trip test against one backend.
#[derive(Debug, Clone, Serialize)]
pub struct StorageTestReport {
    /// Passed the cheap availability probe
    pub available: bool,
    /// Passed the read/write round trip
    pub test: bool,
    /// Failure detail when the round trip errored
    pub error: Option<String>,
}

/// Current wall-clock time as epoch seconds.
pub(crate) fn now_epoch() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Contract every storage medium implements.
///
/// A backend only answers for itself; rerouting a failed call to the
/// next medium is the failover coordinator's job. Any method returning
/// a `Result` may fail when the medium is unreachable.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Which medium this backend is.
    fn kind(&self) -> StorageKind;

    /// Cheap configuration/reachability probe. Never errors; a backend
    /// with missing or malformed configuration reports `false`.
    async fn is_available(&self) -> bool;

    /// Active read/write round trip against the medium.
    async fn test(&self) -> Result<bool>;

    /// Purge observations older than the window, then count the rest.
    async fn current_count(&self, key: &str, window_secs: u64) -> Result<u64>;

    /// Record one observation at the current time, trimming stale ones.
    async fn increment_count(&self, key: &str, window_secs: u64) -> Result<bool>;

    /// Check the key against the limit, recording the request only when
    /// it is admitted. Returns `true` when the key is at or over the
    /// limit.
    ///
    /// The default is a count followed by a conditional increment; the
    /// pair is only as atomic as two sequential storage commands.
    /// Backends that can hold a lock across the sequence override this.
    async fn is_limited(&self, key: &str, max_requests: u64, window_secs: u64) -> Result<bool> {
        let count = self.current_count(key, window_secs).await?;
        if count >= max_requests {
            return Ok(true);
        }
        self.increment_count(key, window_secs).await?;
        Ok(false)
    }

    /// Drop every observation for the key.
    async fn reset(&self, key: &str) -> Result<bool>;

    /// Seconds until the oldest in-window observation expires, or
    /// `None` when the key has no observations.
    async fn ttl(&self, key: &str, window_secs: u64) -> Result<Option<u64>>;

    /// Snapshot the key's standing without recording a request.
    async fn info(&self, key: &str, max_requests: u64, window_secs: u64) -> Result<RateLimitInfo> {
        let count = self.current_count(key, window_secs).await?;
        let ttl_secs = self.ttl(key, window_secs).await?.unwrap_or(0);
        Ok(RateLimitInfo {
            count,
            remaining: max_requests.saturating_sub(count),
            reset_time_epoch: now_epoch() + ttl_secs as i64,
            storage: self.kind(),
            ttl_secs,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_kind_names() {
        assert_eq!(StorageKind::Cache.as_str(), "cache");
        assert_eq!(StorageKind::Database.as_str(), "database");
        assert_eq!(StorageKind::Memory.as_str(), "memory");
        assert_eq!(StorageKind::File.as_str(), "file");
        assert_eq!(StorageKind::File.to_string(), "file");
    }

    #[test]
    fn test_storage_kind_serde_lowercase() {
        let kinds: Vec<StorageKind> = serde_yaml::from_str("[cache, database, memory, file]").unwrap();
        assert_eq!(
            kinds,
            vec![
                StorageKind::Cache,
                StorageKind::Database,
                StorageKind::Memory,
                StorageKind::File,
            ]
        );
        assert_eq!(serde_json::to_string(&StorageKind::Memory).unwrap(), "\"memory\"");
    }
}
