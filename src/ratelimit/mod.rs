//! Rate limiting storage backends and failover coordination.

mod backend;
mod cache;
mod database;
mod failover;
mod file;
mod memory;

pub use backend::{
    RateLimitInfo, StorageBackend, StorageKind, StorageStatus, StorageTestReport,
};
pub use cache::RedisBackend;
pub use database::DatabaseBackend;
pub use failover::FailoverLimiter;
pub use file::FileBackend;
pub use memory::MemoryBackend;
