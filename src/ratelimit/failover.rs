//! Failover coordination across the storage backends.
//!
//! The coordinator owns every constructed backend in priority order
//! (fast and volatile first, durable and slow last), selects the first
//! healthy one, and reroutes failing calls down the list. When every
//! backend fails for a call it fails open: the request is allowed and
//! a diagnostic is logged at the highest severity.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{error, info, warn};

use crate::config::TurnstileConfig;
use super::backend::{
    now_epoch, RateLimitInfo, StorageBackend, StorageKind, StorageStatus, StorageTestReport,
};
use super::cache::RedisBackend;
use super::database::DatabaseBackend;
use super::file::FileBackend;
use super::memory::MemoryBackend;

/// Rate limiter with sticky failover across storage backends.
///
/// Construct one at startup and hand it to every consumer; no method on
/// the public surface ever returns an error. Switching is sticky: once
/// a fallback backend is promoted, earlier backends are not re-probed
/// until a restart or an explicit operator action.
pub struct FailoverLimiter {
    /// Backends in priority order
    backends: Vec<Arc<dyn StorageBackend>>,
    /// Index of the active backend; `None` until first selection
    active: RwLock<Option<usize>>,
    max_requests: u64,
    window_secs: u64,
}

fn build_backends(config: &TurnstileConfig) -> Vec<Arc<dyn StorageBackend>> {
    config
        .limiter
        .storage_priority
        .iter()
        .map(|kind| -> Arc<dyn StorageBackend> {
            match kind {
                StorageKind::Cache => Arc::new(RedisBackend::new(config.storage.cache.as_ref())),
                StorageKind::Database => {
                    Arc::new(DatabaseBackend::new(config.storage.database.as_ref()))
                }
                StorageKind::Memory => Arc::new(MemoryBackend::new()),
                StorageKind::File => Arc::new(FileBackend::new(&config.storage.file)),
            }
        })
        .collect()
}

impl FailoverLimiter {
    /// Build every configured backend and select the initial active one.
    pub async fn new(config: &TurnstileConfig) -> Self {
        let limiter = Self::with_backends(
            build_backends(config),
            config.limiter.max_requests,
            config.limiter.time_window_secs,
        );
        limiter.ensure_active().await;
        limiter
    }

    /// Assemble a coordinator from pre-built backends.
    ///
    /// The seam for tests and for callers wiring their own backends.
    /// Selection happens lazily on the first call.
    pub fn with_backends(
        backends: Vec<Arc<dyn StorageBackend>>,
        max_requests: u64,
        window_secs: u64,
    ) -> Self {
        assert!(!backends.is_empty(), "at least one storage backend is required");
        Self {
            backends,
            active: RwLock::new(None),
            max_requests,
            window_secs,
        }
    }

    /// Current active backend, `None` before first selection.
    pub fn active_storage(&self) -> Option<StorageKind> {
        self.active.read().map(|idx| self.backends[idx].kind())
    }

    /// Return the active index, selecting one if never done.
    async fn ensure_active(&self) -> usize {
        if let Some(idx) = *self.active.read() {
            return idx;
        }
        let idx = self.initial_backend().await;
        *self.active.write() = Some(idx);
        info!(storage = %self.backends[idx].kind(), "Selected active rate limit storage");
        idx
    }

    /// First available backend in priority order; when none answers,
    /// the file backend (always assumed present) is the default.
    async fn initial_backend(&self) -> usize {
        for (idx, backend) in self.backends.iter().enumerate() {
            if backend.is_available().await {
                return idx;
            }
        }
        warn!("No rate limit storage available, defaulting to file storage");
        self.backends
            .iter()
            .position(|backend| backend.kind() == StorageKind::File)
            .unwrap_or(self.backends.len() - 1)
    }

    /// Persistently switch to a backend that just proved itself.
    fn promote(&self, start: usize, idx: usize) {
        if idx != start {
            *self.active.write() = Some(idx);
            warn!(storage = %self.backends[idx].kind(), "Switched active rate limit storage");
        }
    }

    /// Check a key against the configured defaults.
    pub async fn is_limited(&self, key: &str) -> bool {
        self.is_limited_with(key, self.max_requests, self.window_secs)
            .await
    }

    /// Check a key against an explicit limit and window.
    ///
    /// Tries the active backend, then walks the backends after it in
    /// priority order, retrying the identical check; the first that
    /// answers becomes the new active backend. When the whole list
    /// fails the request is allowed.
    pub async fn is_limited_with(&self, key: &str, max_requests: u64, window_secs: u64) -> bool {
        let start = self.ensure_active().await;
        for idx in start..self.backends.len() {
            let backend = &self.backends[idx];
            match backend.is_limited(key, max_requests, window_secs).await {
                Ok(limited) => {
                    self.promote(start, idx);
                    return limited;
                }
                Err(e) => {
                    warn!(
                        storage = %backend.kind(),
                        error = %e,
                        "Rate limit storage failed, trying next backend"
                    );
                }
            }
        }
        error!(
            key = %key,
            "All rate limit storage backends failed; allowing request"
        );
        false
    }

    /// Drop every observation for the key.
    pub async fn reset(&self, key: &str) -> bool {
        let start = self.ensure_active().await;
        for idx in start..self.backends.len() {
            let backend = &self.backends[idx];
            match backend.reset(key).await {
                Ok(result) => {
                    self.promote(start, idx);
                    return result;
                }
                Err(e) => {
                    warn!(storage = %backend.kind(), error = %e, "Reset failed, trying next backend");
                }
            }
        }
        error!(key = %key, "All rate limit storage backends failed to reset key");
        false
    }

    /// Snapshot a key's standing against the configured defaults.
    pub async fn info(&self, key: &str) -> RateLimitInfo {
        self.info_with(key, self.max_requests, self.window_secs).await
    }

    /// Snapshot a key's standing against an explicit limit and window.
    /// Falls back to a zeroed snapshot when no backend answers.
    pub async fn info_with(&self, key: &str, max_requests: u64, window_secs: u64) -> RateLimitInfo {
        let start = self.ensure_active().await;
        for idx in start..self.backends.len() {
            let backend = &self.backends[idx];
            match backend.info(key, max_requests, window_secs).await {
                Ok(info) => {
                    self.promote(start, idx);
                    return info;
                }
                Err(e) => {
                    warn!(storage = %backend.kind(), error = %e, "Info failed, trying next backend");
                }
            }
        }
        error!(key = %key, "All rate limit storage backends failed to report info");
        RateLimitInfo {
            count: 0,
            remaining: max_requests,
            reset_time_epoch: now_epoch(),
            storage: self.backends[start].kind(),
            ttl_secs: 0,
        }
    }

    /// Seconds until the key's oldest observation leaves the window.
    pub async fn ttl(&self, key: &str) -> Option<u64> {
        let start = self.ensure_active().await;
        for idx in start..self.backends.len() {
            let backend = &self.backends[idx];
            match backend.ttl(key, self.window_secs).await {
                Ok(ttl) => {
                    self.promote(start, idx);
                    return ttl;
                }
                Err(e) => {
                    warn!(storage = %backend.kind(), error = %e, "TTL lookup failed, trying next backend");
                }
            }
        }
        None
    }

    /// Operator override: switch to the first backend after the active
    /// one that passes a synthetic round-trip check, without waiting
    /// for an organic failure. Returns the newly active backend.
    pub async fn force_fallback(&self) -> Option<StorageKind> {
        let start = self.ensure_active().await;
        for idx in start + 1..self.backends.len() {
            let backend = &self.backends[idx];
            match backend.test().await {
                Ok(true) => {
                    *self.active.write() = Some(idx);
                    info!(storage = %backend.kind(), "Forced fallback to storage");
                    return Some(backend.kind());
                }
                Ok(false) => {
                    warn!(storage = %backend.kind(), "Synthetic check failed during forced fallback");
                }
                Err(e) => {
                    warn!(storage = %backend.kind(), error = %e, "Storage errored during forced fallback");
                }
            }
        }
        warn!("Forced fallback found no healthy storage to switch to");
        None
    }

    /// Availability probe of every backend, keyed by name.
    pub async fn available_storages(&self) -> HashMap<String, bool> {
        let mut report = HashMap::new();
        for backend in &self.backends {
            report.insert(backend.kind().to_string(), backend.is_available().await);
        }
        report
    }

    /// Availability, active flag, and round-trip health per backend.
    pub async fn storage_status(&self) -> HashMap<String, StorageStatus> {
        let active = *self.active.read();
        let mut report = HashMap::new();
        for (idx, backend) in self.backends.iter().enumerate() {
            report.insert(
                backend.kind().to_string(),
                StorageStatus {
                    available: backend.is_available().await,
                    active: active == Some(idx),
                    working: matches!(backend.test().await, Ok(true)),
                },
            );
        }
        report
    }

    /// Full round-trip test of every backend, with failure detail.
    pub async fn test_all_storages(&self) -> HashMap<String, StorageTestReport> {
        let mut report = HashMap::new();
        for backend in &self.backends {
            let available = backend.is_available().await;
            let (test, error) = match backend.test().await {
                Ok(passed) => (passed, None),
                Err(e) => (false, Some(e.to_string())),
            };
            report.insert(
                backend.kind().to_string(),
                StorageTestReport {
                    available,
                    test,
                    error,
                },
            );
        }
        report
    }
}
