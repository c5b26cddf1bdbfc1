//! Filesystem storage backend.
//!
//! A single JSON file mapping key -> observation timestamps, shared by
//! every process pointed at the same path. Advisory locks guard the
//! file: shared for pure reads, exclusive across the whole
//! read-modify-write cycle. Slowest medium, but always assumed
//! available, which makes it the last resort in the fallback chain.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use async_trait::async_trait;
use fs2::FileExt;

use crate::config::FileConfig;
use crate::error::{Result, TurnstileError};
use super::backend::{now_epoch, StorageBackend, StorageKind};

/// File-backed rate limit storage.
pub struct FileBackend {
    path: PathBuf,
}

impl FileBackend {
    /// Create a backend persisting to the configured path.
    pub fn new(config: &FileConfig) -> Self {
        Self {
            path: config.path.clone(),
        }
    }

    /// Open the storage file, creating it when missing.
    fn open(&self) -> Result<File> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&self.path)?;
        Ok(file)
    }

    /// Parse the full observation map from an already-locked file.
    fn load(file: &mut File) -> Result<HashMap<String, Vec<i64>>> {
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        if contents.trim().is_empty() {
            return Ok(HashMap::new());
        }
        serde_json::from_str(&contents).map_err(|e| TurnstileError::CorruptState(e.to_string()))
    }

    /// Rewrite the file with the given map, dropping empty entries.
    fn store(file: &mut File, mut entries: HashMap<String, Vec<i64>>) -> Result<()> {
        entries.retain(|_, timestamps| !timestamps.is_empty());
        let contents = serde_json::to_string(&entries)
            .map_err(|e| TurnstileError::CorruptState(e.to_string()))?;
        file.seek(SeekFrom::Start(0))?;
        file.set_len(0)?;
        file.write_all(contents.as_bytes())?;
        Ok(())
    }

    /// Count one key's in-window observations without mutating anything.
    fn count_in_window(entries: &HashMap<String, Vec<i64>>, key: &str, window_secs: u64) -> u64 {
        let cutoff = now_epoch() - window_secs as i64;
        entries
            .get(key)
            .map(|timestamps| timestamps.iter().filter(|ts| **ts >= cutoff).count() as u64)
            .unwrap_or(0)
    }

    /// Trim one key's list to the window in place.
    fn trim_key(entries: &mut HashMap<String, Vec<i64>>, key: &str, window_secs: u64) {
        let cutoff = now_epoch() - window_secs as i64;
        if let Some(timestamps) = entries.get_mut(key) {
            timestamps.retain(|ts| *ts >= cutoff);
        }
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    fn kind(&self) -> StorageKind {
        StorageKind::File
    }

    async fn is_available(&self) -> bool {
        // Last-resort medium, always assumed present
        true
    }

    async fn test(&self) -> Result<bool> {
        let probe = format!("healthcheck:{}", uuid::Uuid::new_v4().simple());
        let mut file = self.open()?;
        file.lock_exclusive()?;

        let mut entries = Self::load(&mut file)?;
        entries.insert(probe.clone(), vec![now_epoch()]);
        Self::store(&mut file, entries)?;

        file.seek(SeekFrom::Start(0))?;
        let mut entries = Self::load(&mut file)?;
        let seen = entries.remove(&probe).is_some();
        Self::store(&mut file, entries)?;
        Ok(seen)
    }

    async fn current_count(&self, key: &str, window_secs: u64) -> Result<u64> {
        let mut file = self.open()?;
        file.lock_shared()?;
        let entries = Self::load(&mut file)?;
        Ok(Self::count_in_window(&entries, key, window_secs))
    }

    async fn increment_count(&self, key: &str, window_secs: u64) -> Result<bool> {
        let mut file = self.open()?;
        file.lock_exclusive()?;

        let mut entries = Self::load(&mut file)?;
        Self::trim_key(&mut entries, key, window_secs);
        entries.entry(key.to_string()).or_default().push(now_epoch());
        Self::store(&mut file, entries)?;
        Ok(true)
    }

    async fn is_limited(&self, key: &str, max_requests: u64, window_secs: u64) -> Result<bool> {
        // The exclusive lock spans check and increment, serializing
        // every caller of this file system-wide.
        let mut file = self.open()?;
        file.lock_exclusive()?;

        let mut entries = Self::load(&mut file)?;
        Self::trim_key(&mut entries, key, window_secs);
        let count = entries.get(key).map(|t| t.len() as u64).unwrap_or(0);
        if count >= max_requests {
            return Ok(true);
        }
        entries.entry(key.to_string()).or_default().push(now_epoch());
        Self::store(&mut file, entries)?;
        Ok(false)
    }

    async fn reset(&self, key: &str) -> Result<bool> {
        let mut file = self.open()?;
        file.lock_exclusive()?;

        let mut entries = Self::load(&mut file)?;
        entries.remove(key);
        Self::store(&mut file, entries)?;
        Ok(true)
    }

    async fn ttl(&self, key: &str, window_secs: u64) -> Result<Option<u64>> {
        let mut file = self.open()?;
        file.lock_shared()?;

        let entries = Self::load(&mut file)?;
        let cutoff = now_epoch() - window_secs as i64;
        let oldest = entries
            .get(key)
            .and_then(|timestamps| timestamps.iter().filter(|ts| **ts >= cutoff).min().copied());
        Ok(oldest.map(|ts| (ts + window_secs as i64 - now_epoch()).max(0) as u64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn backend_at(dir: &tempfile::TempDir) -> FileBackend {
        FileBackend::new(&FileConfig {
            path: dir.path().join("limits.json"),
        })
    }

    #[tokio::test]
    async fn test_counts_up_to_limit_then_limits() {
        let dir = tempdir().unwrap();
        let backend = backend_at(&dir);

        for _ in 0..3 {
            assert!(!backend.is_limited("ip:a", 3, 10).await.unwrap());
        }
        assert!(backend.is_limited("ip:a", 3, 10).await.unwrap());
        assert_eq!(backend.current_count("ip:a", 10).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_reset_clears_count() {
        let dir = tempdir().unwrap();
        let backend = backend_at(&dir);

        backend.increment_count("ip:a", 60).await.unwrap();
        assert!(backend.reset("ip:a").await.unwrap());
        assert_eq!(backend.current_count("ip:a", 60).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_observations_shared_across_instances() {
        let dir = tempdir().unwrap();
        let writer = backend_at(&dir);
        let reader = backend_at(&dir);

        writer.increment_count("ip:a", 60).await.unwrap();
        writer.increment_count("ip:a", 60).await.unwrap();
        assert_eq!(reader.current_count("ip:a", 60).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_window_expiry_filters_stale_entries() {
        let dir = tempdir().unwrap();
        let backend = backend_at(&dir);
        let path = dir.path().join("limits.json");

        let stale = now_epoch() - 120;
        let fresh = now_epoch() - 5;
        std::fs::write(&path, format!("{{\"ip:a\":[{},{}]}}", stale, fresh)).unwrap();

        assert_eq!(backend.current_count("ip:a", 60).await.unwrap(), 1);
        // A full window admits one more request before limiting
        assert!(!backend.is_limited("ip:a", 2, 60).await.unwrap());
        assert!(backend.is_limited("ip:a", 2, 60).await.unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_file_reports_corrupt_state() {
        let dir = tempdir().unwrap();
        let backend = backend_at(&dir);
        std::fs::write(dir.path().join("limits.json"), "not json {{").unwrap();

        let err = backend.current_count("ip:a", 60).await.unwrap_err();
        assert!(matches!(err, TurnstileError::CorruptState(_)));
    }

    #[tokio::test]
    async fn test_ttl_and_info() {
        let dir = tempdir().unwrap();
        let backend = backend_at(&dir);

        assert_eq!(backend.ttl("ip:a", 60).await.unwrap(), None);
        backend.increment_count("ip:a", 60).await.unwrap();

        let ttl = backend.ttl("ip:a", 60).await.unwrap().unwrap();
        assert!(ttl > 0 && ttl <= 60);

        let info = backend.info("ip:a", 5, 60).await.unwrap();
        assert_eq!(info.count, 1);
        assert_eq!(info.remaining, 4);
        assert_eq!(info.storage, StorageKind::File);
    }

    #[tokio::test]
    async fn test_round_trip_probe_leaves_no_residue() {
        let dir = tempdir().unwrap();
        let backend = backend_at(&dir);

        backend.increment_count("ip:a", 60).await.unwrap();
        assert!(backend.test().await.unwrap());
        assert_eq!(backend.current_count("ip:a", 60).await.unwrap(), 1);
    }

    #[test]
    fn test_exclusive_lock_serializes_contending_callers() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("limits.json");

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let path = path.clone();
                std::thread::spawn(move || {
                    let backend = FileBackend::new(&FileConfig { path });
                    let rt = tokio::runtime::Runtime::new().unwrap();
                    rt.block_on(backend.is_limited("ip:b", 1, 60)).unwrap()
                })
            })
            .collect();

        let verdicts: Vec<bool> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        // Exactly one caller is admitted, never both
        assert_eq!(verdicts.iter().filter(|limited| !**limited).count(), 1);
    }
}
