use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::StoreError;
use crate::identity::EpisodeIdentity;
use crate::record::{DownloadState, EpisodeRecord};
use crate::store::{FileStore, Records};

/// Collapse duplicate identities in a bulk load, keeping the most recently
/// updated record.
///
/// Identities derive from free-text titles, so two persisted records can
/// normalize to the same key; a batch load must tolerate that rather than
/// crash.
pub fn dedup_by_identity(records: Vec<EpisodeRecord>) -> Vec<EpisodeRecord> {
    let mut by_identity: HashMap<EpisodeIdentity, EpisodeRecord> = HashMap::new();

    for record in records {
        match by_identity.get(&record.identity) {
            Some(existing) if existing.updated_at >= record.updated_at => {
                debug!(identity = %record.identity, "dropping duplicate record");
            }
            _ => {
                by_identity.insert(record.identity.clone(), record);
            }
        }
    }

    by_identity.into_values().collect()
}

/// Read-repair between the record store and the file store.
///
/// A record claiming `downloaded` whose file was deleted out-of-band is
/// demoted to not-downloaded. The inverse never happens: a file on disk
/// without a matching record is not promoted to a download.
pub struct Reconciler {
    records: Arc<Records>,
    files: Arc<dyn FileStore>,
}

impl Reconciler {
    pub fn new(records: Arc<Records>, files: Arc<dyn FileStore>) -> Self {
        Self { records, files }
    }

    /// Startup pass over every record.
    ///
    /// Besides the missing-file check, records stranded in an in-flight
    /// state by a crash are demoted: transfers do not survive a restart.
    pub async fn reconcile_at_startup(&self) -> Result<usize, StoreError> {
        let mut repaired = 0;

        for record in self.records.all().await {
            if record.download.is_in_flight() {
                warn!(identity = %record.identity, "demoting record stranded mid-transfer");
                self.records
                    .update(&record.identity, |r| r.clear_download())
                    .await?;
                repaired += 1;
                continue;
            }

            if let Some(path) = &record.local_path
                && !self.files.exists(path).await
            {
                warn!(identity = %record.identity, path = %path.display(),
                    "downloaded file missing on disk, demoting record");
                self.records
                    .update(&record.identity, |r| r.clear_download())
                    .await?;
                repaired += 1;
            }
        }

        Ok(repaired)
    }

    /// Lazy repair of a single record, used when a cached `downloaded`
    /// state is about to be served. Returns the state after repair.
    pub async fn reconcile_one(
        &self,
        identity: &EpisodeIdentity,
    ) -> Result<DownloadState, StoreError> {
        let Some(record) = self.records.get(identity).await else {
            return Ok(DownloadState::NotDownloaded);
        };

        if let DownloadState::Downloaded { path } = &record.download
            && !self.files.exists(path).await
        {
            warn!(identity = %identity, path = %path.display(),
                "downloaded file missing on disk, demoting record");
            let repaired = self
                .records
                .update(identity, |r| r.clear_download())
                .await?;
            return Ok(repaired.download);
        }

        Ok(record.download)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::{MemoryFileStore, MemoryRecordStore};
    use bytes::Bytes;
    use chrono::{Duration, Utc};
    use std::path::PathBuf;

    fn identity() -> EpisodeIdentity {
        EpisodeIdentity::new("Show", "Ep 1")
    }

    async fn setup() -> (Arc<Records>, Arc<MemoryFileStore>, Reconciler) {
        let records = Arc::new(
            Records::load(Arc::new(MemoryRecordStore::default()))
                .await
                .unwrap(),
        );
        let files = Arc::new(MemoryFileStore::default());
        let reconciler = Reconciler::new(records.clone(), files.clone());
        (records, files, reconciler)
    }

    async fn mark_downloaded(records: &Records, files: &MemoryFileStore) -> PathBuf {
        let path = files
            .save(Bytes::from_static(b"audio"), "ep1.mp3")
            .await
            .unwrap();
        records
            .update(&identity(), |r| {
                r.download = DownloadState::Downloaded { path: path.clone() };
                r.local_path = Some(path.clone());
                r.file_size_bytes = 5;
                r.downloaded_at = Some(Utc::now());
            })
            .await
            .unwrap();
        path
    }

    #[test]
    fn dedup_keeps_latest_of_duplicates() {
        let mut older = EpisodeRecord::new(identity());
        older.file_size_bytes = 1;
        older.updated_at = Utc::now() - Duration::minutes(10);

        let mut newer = EpisodeRecord::new(identity());
        newer.file_size_bytes = 2;

        let deduped = dedup_by_identity(vec![older, newer]);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].file_size_bytes, 2);
    }

    #[test]
    fn dedup_keeps_latest_regardless_of_input_order() {
        let mut older = EpisodeRecord::new(identity());
        older.file_size_bytes = 1;
        older.updated_at = Utc::now() - Duration::minutes(10);

        let mut newer = EpisodeRecord::new(identity());
        newer.file_size_bytes = 2;

        let deduped = dedup_by_identity(vec![newer, older]);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].file_size_bytes, 2);
    }

    #[test]
    fn dedup_preserves_distinct_identities() {
        let a = EpisodeRecord::new(EpisodeIdentity::new("Show", "Ep 1"));
        let b = EpisodeRecord::new(EpisodeIdentity::new("Show", "Ep 2"));
        assert_eq!(dedup_by_identity(vec![a, b]).len(), 2);
    }

    #[tokio::test]
    async fn missing_file_demotes_record() {
        let (records, files, reconciler) = setup().await;
        let path = mark_downloaded(&records, &files).await;

        files.remove_out_of_band(&path);

        let state = reconciler.reconcile_one(&identity()).await.unwrap();
        assert_eq!(state, DownloadState::NotDownloaded);

        let record = records.get(&identity()).await.unwrap();
        assert!(record.local_path.is_none());
        assert_eq!(record.file_size_bytes, 0);
        assert!(record.downloaded_at.is_none());
    }

    #[tokio::test]
    async fn intact_file_leaves_record_alone() {
        let (records, files, reconciler) = setup().await;
        let path = mark_downloaded(&records, &files).await;

        let state = reconciler.reconcile_one(&identity()).await.unwrap();
        assert_eq!(state, DownloadState::Downloaded { path });
    }

    #[tokio::test]
    async fn unknown_identity_reports_not_downloaded() {
        let (_records, _files, reconciler) = setup().await;
        let state = reconciler.reconcile_one(&identity()).await.unwrap();
        assert_eq!(state, DownloadState::NotDownloaded);
    }

    #[tokio::test]
    async fn startup_pass_repairs_missing_files_and_stranded_states() {
        let (records, files, reconciler) = setup().await;

        // Downloaded with file gone
        let path = mark_downloaded(&records, &files).await;
        files.remove_out_of_band(&path);

        // Stranded mid-transfer
        let stranded = EpisodeIdentity::new("Show", "Ep 2");
        records
            .update(&stranded, |r| {
                r.download = DownloadState::Downloading { progress: 0.4 }
            })
            .await
            .unwrap();

        // Healthy record, untouched
        let healthy = EpisodeIdentity::new("Show", "Ep 3");
        records.update(&healthy, |_| {}).await.unwrap();

        let repaired = reconciler.reconcile_at_startup().await.unwrap();
        assert_eq!(repaired, 2);

        for id in [identity(), stranded] {
            let record = records.get(&id).await.unwrap();
            assert_eq!(record.download, DownloadState::NotDownloaded);
        }
    }

    #[tokio::test]
    async fn orphan_file_is_never_promoted() {
        let (records, files, reconciler) = setup().await;

        // A file on disk with no record
        files
            .save(Bytes::from_static(b"orphan"), "orphan.mp3")
            .await
            .unwrap();

        reconciler.reconcile_at_startup().await.unwrap();
        assert!(records.all().await.is_empty());
    }
}
