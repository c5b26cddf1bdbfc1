//! Process-local storage backend.
//!
//! Fastest medium and the second-to-last fallback: observations live in
//! a table scoped to this process and are lost on restart. Nothing here
//! can fail, so every operation returns `Ok`.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::Result;
use super::backend::{now_epoch, StorageBackend, StorageKind};

/// Minimum wall-clock gap between global sweeps.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
/// Observations older than this are swept regardless of any window.
const SWEEP_MAX_AGE_SECS: i64 = 3600;

/// In-memory rate limit storage.
///
/// The whole check-then-increment sequence runs under one mutex, since
/// the tokio host runs true shared-memory threads.
pub struct MemoryBackend {
    /// Key -> ordered observation timestamps (epoch seconds)
    entries: Mutex<HashMap<String, Vec<i64>>>,
    /// Last time the global sweep ran; `None` forces a sweep
    last_sweep: Mutex<Option<Instant>>,
}

impl MemoryBackend {
    /// Create an empty in-memory backend.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            last_sweep: Mutex::new(Some(Instant::now())),
        }
    }

    /// Drop hour-old observations across all keys, at most once per
    /// sweep interval. Invoked lazily from normal operations.
    fn maybe_sweep(&self, entries: &mut HashMap<String, Vec<i64>>) {
        let mut last_sweep = self.last_sweep.lock();
        if matches!(*last_sweep, Some(at) if at.elapsed() < SWEEP_INTERVAL) {
            return;
        }
        *last_sweep = Some(Instant::now());
        drop(last_sweep);

        let cutoff = now_epoch() - SWEEP_MAX_AGE_SECS;
        for timestamps in entries.values_mut() {
            timestamps.retain(|ts| *ts >= cutoff);
        }
        entries.retain(|_, timestamps| !timestamps.is_empty());
    }

    /// Trim one key's observations to the window, returning the count.
    fn trim_to_window(entries: &mut HashMap<String, Vec<i64>>, key: &str, window_secs: u64) -> u64 {
        let cutoff = now_epoch() - window_secs as i64;
        match entries.get_mut(key) {
            Some(timestamps) => {
                timestamps.retain(|ts| *ts >= cutoff);
                timestamps.len() as u64
            }
            None => 0,
        }
    }

    /// Seed an observation at an arbitrary timestamp.
    #[cfg(test)]
    pub(crate) fn insert_at(&self, key: &str, timestamp: i64) {
        self.entries
            .lock()
            .entry(key.to_string())
            .or_default()
            .push(timestamp);
    }

    /// Force the next operation to sweep.
    #[cfg(test)]
    pub(crate) fn expire_sweep_timer(&self) {
        *self.last_sweep.lock() = None;
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn kind(&self) -> StorageKind {
        StorageKind::Memory
    }

    async fn is_available(&self) -> bool {
        true
    }

    async fn test(&self) -> Result<bool> {
        let probe = format!("healthcheck:{}", uuid::Uuid::new_v4().simple());
        let mut entries = self.entries.lock();
        entries.insert(probe.clone(), vec![now_epoch()]);
        let seen = entries.get(&probe).map(|v| v.len()) == Some(1);
        entries.remove(&probe);
        Ok(seen)
    }

    async fn current_count(&self, key: &str, window_secs: u64) -> Result<u64> {
        let mut entries = self.entries.lock();
        self.maybe_sweep(&mut entries);
        Ok(Self::trim_to_window(&mut entries, key, window_secs))
    }

    async fn increment_count(&self, key: &str, window_secs: u64) -> Result<bool> {
        let mut entries = self.entries.lock();
        self.maybe_sweep(&mut entries);
        Self::trim_to_window(&mut entries, key, window_secs);
        entries.entry(key.to_string()).or_default().push(now_epoch());
        Ok(true)
    }

    async fn is_limited(&self, key: &str, max_requests: u64, window_secs: u64) -> Result<bool> {
        let mut entries = self.entries.lock();
        self.maybe_sweep(&mut entries);
        let count = Self::trim_to_window(&mut entries, key, window_secs);
        if count >= max_requests {
            return Ok(true);
        }
        entries.entry(key.to_string()).or_default().push(now_epoch());
        Ok(false)
    }

    async fn reset(&self, key: &str) -> Result<bool> {
        self.entries.lock().remove(key);
        Ok(true)
    }

    async fn ttl(&self, key: &str, window_secs: u64) -> Result<Option<u64>> {
        let mut entries = self.entries.lock();
        Self::trim_to_window(&mut entries, key, window_secs);
        let oldest = entries.get(key).and_then(|timestamps| timestamps.first().copied());
        Ok(oldest.map(|ts| (ts + window_secs as i64 - now_epoch()).max(0) as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counts_up_to_limit_then_limits() {
        let backend = MemoryBackend::new();

        for _ in 0..3 {
            assert!(!backend.is_limited("ip:a", 3, 10).await.unwrap());
        }
        assert!(backend.is_limited("ip:a", 3, 10).await.unwrap());
        assert_eq!(backend.current_count("ip:a", 10).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_limited_call_does_not_record() {
        let backend = MemoryBackend::new();

        assert!(!backend.is_limited("ip:a", 1, 60).await.unwrap());
        assert!(backend.is_limited("ip:a", 1, 60).await.unwrap());
        assert!(backend.is_limited("ip:a", 1, 60).await.unwrap());
        assert_eq!(backend.current_count("ip:a", 60).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_reset_clears_count() {
        let backend = MemoryBackend::new();

        backend.increment_count("ip:a", 60).await.unwrap();
        backend.increment_count("ip:a", 60).await.unwrap();
        assert!(backend.reset("ip:a").await.unwrap());
        assert_eq!(backend.current_count("ip:a", 60).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_window_expiry() {
        let backend = MemoryBackend::new();

        backend.insert_at("ip:a", now_epoch() - 30);
        backend.insert_at("ip:a", now_epoch() - 5);
        assert_eq!(backend.current_count("ip:a", 60).await.unwrap(), 2);
        assert_eq!(backend.current_count("ip:a", 10).await.unwrap(), 1);

        // All observations stale: key admits requests again
        assert!(!backend.is_limited("ip:a", 1, 2).await.unwrap());
    }

    #[tokio::test]
    async fn test_ttl_tracks_oldest_observation() {
        let backend = MemoryBackend::new();

        assert_eq!(backend.ttl("ip:a", 60).await.unwrap(), None);

        backend.insert_at("ip:a", now_epoch() - 40);
        backend.insert_at("ip:a", now_epoch());
        let ttl = backend.ttl("ip:a", 60).await.unwrap().unwrap();
        assert!(ttl <= 20, "ttl {} should reflect the oldest entry", ttl);
    }

    #[tokio::test]
    async fn test_sweep_purges_hour_old_entries() {
        let backend = MemoryBackend::new();

        backend.insert_at("stale", now_epoch() - 7200);
        backend.insert_at("fresh", now_epoch());
        backend.expire_sweep_timer();

        backend.current_count("other", 60).await.unwrap();

        let entries = backend.entries.lock();
        assert!(!entries.contains_key("stale"));
        assert!(entries.contains_key("fresh"));
    }

    #[tokio::test]
    async fn test_sweep_rate_limited_to_interval() {
        let backend = MemoryBackend::new();

        backend.insert_at("stale", now_epoch() - 7200);

        // Timer was just initialized, so no sweep happens yet
        backend.current_count("other", 60).await.unwrap();
        assert!(backend.entries.lock().contains_key("stale"));
    }

    #[tokio::test]
    async fn test_info_idempotent() {
        let backend = MemoryBackend::new();

        backend.increment_count("ip:a", 60).await.unwrap();
        let first = backend.info("ip:a", 10, 60).await.unwrap();
        let second = backend.info("ip:a", 10, 60).await.unwrap();
        assert_eq!(first.count, second.count);
        assert_eq!(first.count, 1);
        assert_eq!(first.remaining, 9);
        assert_eq!(first.storage, StorageKind::Memory);
    }

    #[tokio::test]
    async fn test_round_trip_probe() {
        let backend = MemoryBackend::new();
        assert!(backend.test().await.unwrap());
        assert!(backend.entries.lock().is_empty());
    }
}
