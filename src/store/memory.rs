//! In-memory store fakes shared by the crate's tests

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::StoreError;
use crate::identity::EpisodeIdentity;
use crate::record::EpisodeRecord;
use crate::store::{FileStore, RecordStore};

#[derive(Default)]
pub struct MemoryRecordStore {
    pub records: Mutex<Vec<EpisodeRecord>>,
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn get(&self, identity: &EpisodeIdentity) -> Result<Option<EpisodeRecord>, StoreError> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .find(|r| &r.identity == identity)
            .cloned())
    }

    async fn put(&self, record: &EpisodeRecord) -> Result<(), StoreError> {
        let mut records = self.records.lock().unwrap();
        records.retain(|r| r.identity != record.identity);
        records.push(record.clone());
        Ok(())
    }

    async fn delete(&self, identity: &EpisodeIdentity) -> Result<(), StoreError> {
        self.records
            .lock()
            .unwrap()
            .retain(|r| &r.identity != identity);
        Ok(())
    }

    async fn list_all(&self) -> Result<Vec<EpisodeRecord>, StoreError> {
        Ok(self.records.lock().unwrap().clone())
    }
}

/// File store holding byte blobs in a map, with adjustable free space and
/// out-of-band deletion for reconciliation tests
pub struct MemoryFileStore {
    pub files: Mutex<HashMap<PathBuf, Vec<u8>>>,
    pub free_space: AtomicU64,
}

impl Default for MemoryFileStore {
    fn default() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            free_space: AtomicU64::new(u64::MAX),
        }
    }
}

impl MemoryFileStore {
    pub fn set_free_space(&self, bytes: u64) {
        self.free_space.store(bytes, Ordering::SeqCst);
    }

    /// Delete a file behind the engine's back
    pub fn remove_out_of_band(&self, path: &Path) {
        self.files.lock().unwrap().remove(path);
    }
}

#[async_trait]
impl FileStore for MemoryFileStore {
    async fn save(&self, bytes: Bytes, name: &str) -> Result<PathBuf, StoreError> {
        let path = PathBuf::from("/media").join(name);
        self.files
            .lock()
            .unwrap()
            .insert(path.clone(), bytes.to_vec());
        Ok(path)
    }

    async fn adopt(&self, temp: &Path, name: &str) -> Result<PathBuf, StoreError> {
        let bytes = std::fs::read(temp).map_err(|e| StoreError::ReadFailed {
            path: temp.to_path_buf(),
            source: e,
        })?;
        let _ = std::fs::remove_file(temp);

        let path = PathBuf::from("/media").join(name);
        self.files.lock().unwrap().insert(path.clone(), bytes);
        Ok(path)
    }

    async fn exists(&self, path: &Path) -> bool {
        self.files.lock().unwrap().contains_key(path)
    }

    async fn delete(&self, path: &Path) -> Result<(), StoreError> {
        self.files.lock().unwrap().remove(path);
        Ok(())
    }

    async fn available_free_space(&self) -> Result<u64, StoreError> {
        Ok(self.free_space.load(Ordering::SeqCst))
    }

    async fn total_used_bytes(&self) -> Result<u64, StoreError> {
        Ok(self
            .files
            .lock()
            .unwrap()
            .values()
            .map(|bytes| bytes.len() as u64)
            .sum())
    }
}
