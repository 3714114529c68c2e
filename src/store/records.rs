use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::StoreError;
use crate::identity::EpisodeIdentity;
use crate::record::EpisodeRecord;
use crate::reconcile::dedup_by_identity;
use crate::store::RecordStore;

/// Single-writer coordinator over the record store.
///
/// The orchestrator, reconciler and playback tracker all mutate the same
/// per-identity records; every mutation goes through [`Records::update`],
/// which holds one lock across the read-modify-write and the store put.
/// That serializes transitions per identity (and totally orders them) while
/// transfers themselves run in parallel.
///
/// Reads are served from a write-through in-memory cache, so a `get` never
/// observes a state older than the last committed write.
pub struct Records {
    store: Arc<dyn RecordStore>,
    cache: Mutex<HashMap<EpisodeIdentity, EpisodeRecord>>,
}

impl Records {
    /// Load all records from the store, collapsing duplicate identities by
    /// keeping the most recently updated record.
    ///
    /// A corrupt store propagates the error; the owning process is expected
    /// to reset the store and inform the user rather than silently recover.
    pub async fn load(store: Arc<dyn RecordStore>) -> Result<Self, StoreError> {
        let all = store.list_all().await?;
        let records = dedup_by_identity(all);
        debug!(count = records.len(), "loaded episode records");

        let cache = records
            .into_iter()
            .map(|r| (r.identity.clone(), r))
            .collect();

        Ok(Self {
            store,
            cache: Mutex::new(cache),
        })
    }

    pub async fn get(&self, identity: &EpisodeIdentity) -> Option<EpisodeRecord> {
        self.cache.lock().await.get(identity).cloned()
    }

    pub async fn all(&self) -> Vec<EpisodeRecord> {
        self.cache.lock().await.values().cloned().collect()
    }

    /// Apply a mutation to the record for `identity`, creating the record
    /// if absent, and persist the result.
    ///
    /// Both a first download request and a first playback event arrive
    /// here, so neither path requires the other to have created the record.
    pub async fn update<F>(
        &self,
        identity: &EpisodeIdentity,
        mutate: F,
    ) -> Result<EpisodeRecord, StoreError>
    where
        F: FnOnce(&mut EpisodeRecord),
    {
        let mut cache = self.cache.lock().await;
        let record = cache
            .entry(identity.clone())
            .or_insert_with(|| EpisodeRecord::new(identity.clone()));

        mutate(record);
        record.updated_at = Utc::now();

        let snapshot = record.clone();
        self.store.put(&snapshot).await?;
        Ok(snapshot)
    }

    /// Remove the record entirely (explicit user "clear history")
    pub async fn remove(&self, identity: &EpisodeIdentity) -> Result<(), StoreError> {
        let mut cache = self.cache.lock().await;
        cache.remove(identity);
        self.store.delete(identity).await
    }
}
