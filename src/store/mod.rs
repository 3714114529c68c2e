mod disk;
mod json;
#[cfg(test)]
pub(crate) mod memory;
mod records;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StoreError;
use crate::identity::EpisodeIdentity;
use crate::record::EpisodeRecord;

pub use disk::DiskFileStore;
pub use json::JsonRecordStore;
pub use records::Records;

/// Durable key-value store of per-episode records.
///
/// `put` must be atomic for a single record. Bulk loads may contain
/// duplicate identities (free-text titles can normalize to the same key);
/// callers deduplicate via [`crate::reconcile::dedup_by_identity`].
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, identity: &EpisodeIdentity) -> Result<Option<EpisodeRecord>, StoreError>;
    async fn put(&self, record: &EpisodeRecord) -> Result<(), StoreError>;
    async fn delete(&self, identity: &EpisodeIdentity) -> Result<(), StoreError>;
    async fn list_all(&self) -> Result<Vec<EpisodeRecord>, StoreError>;
}

/// Byte storage for downloaded media
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Write bytes under the given store-relative name, returning the
    /// absolute path
    async fn save(&self, bytes: Bytes, name: &str) -> Result<PathBuf, StoreError>;

    /// Move an already-written temporary file into the store. Used by the
    /// download commit step so media is never read back into memory.
    async fn adopt(&self, temp: &Path, name: &str) -> Result<PathBuf, StoreError>;

    async fn exists(&self, path: &Path) -> bool;

    async fn delete(&self, path: &Path) -> Result<(), StoreError>;

    async fn available_free_space(&self) -> Result<u64, StoreError>;

    /// Total bytes currently held by the store
    async fn total_used_bytes(&self) -> Result<u64, StoreError>;
}
