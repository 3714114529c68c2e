use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::StoreError;
use crate::identity::EpisodeIdentity;
use crate::record::EpisodeRecord;
use crate::store::RecordStore;

/// Record store keeping one pretty-printed JSON file per episode record in a
/// flat directory.
///
/// Writes go through a `.partial` sibling and a rename, so a crash mid-write
/// never leaves a half-written record behind; stray `.partial` files are
/// skipped on load. An unreadable record file is treated as store
/// corruption and propagated, not skipped.
pub struct JsonRecordStore {
    dir: PathBuf,
}

impl JsonRecordStore {
    pub fn new(dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir).map_err(|e| StoreError::CreateDirectoryFailed {
            path: dir.to_path_buf(),
            source: e,
        })?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn record_path(&self, identity: &EpisodeIdentity) -> PathBuf {
        self.dir.join(format!("{}.json", identity.file_stem()))
    }
}

#[async_trait]
impl RecordStore for JsonRecordStore {
    async fn get(&self, identity: &EpisodeIdentity) -> Result<Option<EpisodeRecord>, StoreError> {
        let path = self.record_path(identity);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::ReadFailed { path, source: e }),
        };

        let record =
            serde_json::from_str(&content).map_err(|e| StoreError::Corrupt { path, source: e })?;
        Ok(Some(record))
    }

    async fn put(&self, record: &EpisodeRecord) -> Result<(), StoreError> {
        let path = self.record_path(&record.identity);
        let json = serde_json::to_string_pretty(record)?;

        let partial = path.with_extension("json.partial");
        tokio::fs::write(&partial, json)
            .await
            .map_err(|e| StoreError::WriteFailed {
                path: partial.clone(),
                source: e,
            })?;
        tokio::fs::rename(&partial, &path)
            .await
            .map_err(|e| StoreError::WriteFailed { path, source: e })
    }

    async fn delete(&self, identity: &EpisodeIdentity) -> Result<(), StoreError> {
        let path = self.record_path(identity);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::RemoveFailed { path, source: e }),
        }
    }

    async fn list_all(&self) -> Result<Vec<EpisodeRecord>, StoreError> {
        let mut entries =
            tokio::fs::read_dir(&self.dir)
                .await
                .map_err(|e| StoreError::ReadFailed {
                    path: self.dir.clone(),
                    source: e,
                })?;

        let mut records = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::ReadFailed {
                path: self.dir.clone(),
                source: e,
            })?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let content =
                tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| StoreError::ReadFailed {
                        path: path.clone(),
                        source: e,
                    })?;
            let record = serde_json::from_str(&content)
                .map_err(|e| StoreError::Corrupt { path, source: e })?;
            records.push(record);
        }

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::DownloadState;
    use tempfile::tempdir;

    fn make_record(show: &str, episode: &str) -> EpisodeRecord {
        EpisodeRecord::new(EpisodeIdentity::new(show, episode))
    }

    #[tokio::test]
    async fn put_then_get_roundtrips() {
        let dir = tempdir().unwrap();
        let store = JsonRecordStore::new(dir.path()).unwrap();

        let mut record = make_record("Show", "Ep 1");
        record.download = DownloadState::Failed {
            reason: "transport error".to_string(),
        };
        store.put(&record).await.unwrap();

        let back = store.get(&record.identity).await.unwrap().unwrap();
        assert_eq!(back, record);
    }

    #[tokio::test]
    async fn very_long_titles_still_roundtrip() {
        let dir = tempdir().unwrap();
        let store = JsonRecordStore::new(dir.path()).unwrap();

        // Derived filename must stay bounded for ordinary long titles
        let episode =
            "A Complete and Unabridged Accounting of Everything That Happened ".repeat(4);
        let record = make_record("Show", &episode);
        store.put(&record).await.unwrap();

        let back = store.get(&record.identity).await.unwrap().unwrap();
        assert_eq!(back, record);
    }

    #[tokio::test]
    async fn get_missing_returns_none() {
        let dir = tempdir().unwrap();
        let store = JsonRecordStore::new(dir.path()).unwrap();

        let result = store
            .get(&EpisodeIdentity::new("Show", "Nope"))
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let dir = tempdir().unwrap();
        let store = JsonRecordStore::new(dir.path()).unwrap();
        let record = make_record("Show", "Ep 1");

        store.put(&record).await.unwrap();
        store.delete(&record.identity).await.unwrap();
        store.delete(&record.identity).await.unwrap();

        assert!(store.get(&record.identity).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_all_returns_every_record() {
        let dir = tempdir().unwrap();
        let store = JsonRecordStore::new(dir.path()).unwrap();

        store.put(&make_record("Show", "Ep 1")).await.unwrap();
        store.put(&make_record("Show", "Ep 2")).await.unwrap();
        store.put(&make_record("Other", "Ep 1")).await.unwrap();

        let all = store.list_all().await.unwrap();
        assert_eq!(all.len(), 3);
    }

    #[tokio::test]
    async fn corrupt_record_propagates_as_error() {
        let dir = tempdir().unwrap();
        let store = JsonRecordStore::new(dir.path()).unwrap();

        std::fs::write(dir.path().join("broken.json"), "{not json").unwrap();

        let result = store.list_all().await;
        assert!(matches!(result, Err(StoreError::Corrupt { .. })));
    }
}
