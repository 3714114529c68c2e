// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{Mutex, Semaphore, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::config::{EngineConfig, RetryPolicy};
use crate::error::{DownloadError, TransferError};
use crate::events::{EngineEvent, EventBus};
use crate::identity::EpisodeIdentity;
use crate::record::DownloadState;
use crate::reconcile::Reconciler;
use crate::store::{FileStore, Records};
use crate::transfer::{CompletedTransfer, TransferEngine};

/// A download request waiting for or holding a concurrency slot
struct ActiveDownload {
    cancel: CancellationToken,
    progress: watch::Receiver<f32>,
    /// Present once the dispatcher has admitted the request
    task: Option<JoinHandle<()>>,
}

struct AdmissionJob {
    identity: EpisodeIdentity,
    source: Url,
    progress_tx: watch::Sender<f32>,
    cancel: CancellationToken,
}

struct Inner {
    records: Arc<Records>,
    files: Arc<dyn FileStore>,
    transfer: Arc<dyn TransferEngine>,
    reconciler: Reconciler,
    events: EventBus,
    slots: Arc<Semaphore>,
    active: Mutex<HashMap<EpisodeIdentity, ActiveDownload>>,
    min_free_space_bytes: u64,
    retry: RetryPolicy,
}

/// Owns the per-episode download state machine.
///
/// Requests are admitted from a FIFO queue into at most
/// `max_concurrent_downloads` transfer tasks. Completed transfers are
/// committed synchronously (file-store adoption plus record write) before
/// the task finishes, so a `downloaded` state always refers to bytes in
/// permanent storage.
pub struct DownloadOrchestrator {
    inner: Arc<Inner>,
    admit_tx: mpsc::UnboundedSender<AdmissionJob>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl DownloadOrchestrator {
    pub fn new(
        config: &EngineConfig,
        records: Arc<Records>,
        files: Arc<dyn FileStore>,
        transfer: Arc<dyn TransferEngine>,
        events: EventBus,
    ) -> Self {
        let inner = Arc::new(Inner {
            reconciler: Reconciler::new(records.clone(), files.clone()),
            records,
            files,
            transfer,
            events,
            slots: Arc::new(Semaphore::new(config.max_concurrent_downloads)),
            active: Mutex::new(HashMap::new()),
            min_free_space_bytes: config.min_free_space_bytes,
            retry: config.retry,
        });

        let (admit_tx, admit_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let dispatcher = tokio::spawn(dispatch(inner.clone(), admit_rx, shutdown.clone()));

        Self {
            inner,
            admit_tx,
            dispatcher: Mutex::new(Some(dispatcher)),
            shutdown,
        }
    }

    /// Request a download for `identity` from `source`.
    ///
    /// Idempotent: a request for an identity that is already queued,
    /// downloading or downloaded returns its current state without
    /// starting a second transfer. The free-space preflight rejects the
    /// request before it consumes a concurrency slot.
    pub async fn request_download(
        &self,
        identity: &EpisodeIdentity,
        source: &Url,
    ) -> Result<DownloadState, DownloadError> {
        let mut active = self.inner.active.lock().await;

        if let Some(existing) = active.get(identity) {
            let progress = *existing.progress.borrow();
            let state = match self.inner.records.get(identity).await.map(|r| r.download) {
                Some(DownloadState::Downloading { .. }) => DownloadState::Downloading { progress },
                Some(state) => state,
                None => DownloadState::Queued,
            };
            debug!(identity = %identity, "download already in flight");
            return Ok(state);
        }

        if let Some(record) = self.inner.records.get(identity).await
            && record.download.is_downloaded()
        {
            return Ok(record.download);
        }

        let available = self.inner.files.available_free_space().await?;
        if available < self.inner.min_free_space_bytes {
            warn!(
                identity = %identity,
                available, "refusing download, free space below threshold"
            );
            return Err(DownloadError::InsufficientStorage {
                available,
                required: self.inner.min_free_space_bytes,
            });
        }

        let source = source.clone();
        self.inner
            .records
            .update(identity, |r| {
                r.download = DownloadState::Queued;
                r.source_url = Some(source.clone());
            })
            .await?;

        let cancel = CancellationToken::new();
        let (progress_tx, progress_rx) = watch::channel(0.0f32);

        active.insert(
            identity.clone(),
            ActiveDownload {
                cancel: cancel.clone(),
                progress: progress_rx,
                task: None,
            },
        );

        // The dispatcher only stops at shutdown; a send failure means the
        // engine is being torn down and the request is dropped.
        let queued = self
            .admit_tx
            .send(AdmissionJob {
                identity: identity.clone(),
                source,
                progress_tx,
                cancel,
            })
            .is_ok();
        if !queued {
            active.remove(identity);
            self.inner
                .records
                .update(identity, |r| r.clear_download())
                .await?;
            return Ok(DownloadState::NotDownloaded);
        }

        info!(identity = %identity, "download queued");
        Ok(DownloadState::Queued)
    }

    /// Re-request a download using the source URL remembered from the last
    /// request. Serves a manual retry from a `failed` state, where the
    /// caller has the identity but not necessarily the URL.
    pub async fn retry_download(
        &self,
        identity: &EpisodeIdentity,
    ) -> Result<DownloadState, DownloadError> {
        let source = self
            .inner
            .records
            .get(identity)
            .await
            .and_then(|r| r.source_url)
            .ok_or(DownloadError::MissingSource)?;
        self.request_download(identity, &source).await
    }

    /// Cancel a queued or running download.
    ///
    /// The concurrency slot is released before this returns, so an
    /// admission-queued request can proceed immediately. A no-op for
    /// identities with no transfer in flight.
    pub async fn cancel_download(&self, identity: &EpisodeIdentity) -> Result<(), DownloadError> {
        let entry = self.inner.active.lock().await.remove(identity);

        if let Some(entry) = entry {
            entry.cancel.cancel();
            if let Some(task) = entry.task {
                let _ = task.await;
            }
            info!(identity = %identity, "download cancelled");
        }

        // Cancellation is terminal-but-resettable, not a failure
        if let Some(record) = self.inner.records.get(identity).await
            && record.download.is_in_flight()
        {
            self.inner
                .records
                .update(identity, |r| r.clear_download())
                .await?;
        }
        Ok(())
    }

    /// Remove the downloaded file and reset the record's download fields
    pub async fn delete_download(&self, identity: &EpisodeIdentity) -> Result<(), DownloadError> {
        self.cancel_download(identity).await?;

        if let Some(record) = self.inner.records.get(identity).await {
            if let Some(path) = &record.local_path {
                self.inner.files.delete(path).await?;
            }
            self.inner
                .records
                .update(identity, |r| r.clear_download())
                .await?;
        }
        Ok(())
    }

    /// Current download state, with live progress for running transfers and
    /// lazy reconciliation for cached `downloaded` states
    pub async fn get_state(
        &self,
        identity: &EpisodeIdentity,
    ) -> Result<DownloadState, DownloadError> {
        if let Some(entry) = self.inner.active.lock().await.get(identity) {
            let progress = *entry.progress.borrow();
            return Ok(
                match self.inner.records.get(identity).await.map(|r| r.download) {
                    Some(DownloadState::Downloading { .. }) => {
                        DownloadState::Downloading { progress }
                    }
                    Some(state) => state,
                    None => DownloadState::Queued,
                },
            );
        }

        Ok(self.inner.reconciler.reconcile_one(identity).await?)
    }

    /// Number of requests currently queued or transferring
    pub async fn active_count(&self) -> usize {
        self.inner.active.lock().await.len()
    }

    /// Cancel all in-flight work and stop the admission dispatcher.
    ///
    /// Must be called when the owning component is torn down; the
    /// dispatcher task does not stop on drop.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if let Some(dispatcher) = self.dispatcher.lock().await.take() {
            let _ = dispatcher.await;
        }

        let entries: Vec<_> = {
            let mut active = self.inner.active.lock().await;
            active.drain().collect()
        };
        for (identity, entry) in entries {
            entry.cancel.cancel();
            if let Some(task) = entry.task {
                let _ = task.await;
            }
            debug!(identity = %identity, "cancelled at shutdown");
        }
    }
}

/// Admission loop: pulls requests in FIFO order and starts a transfer task
/// once a slot is free
async fn dispatch(
    inner: Arc<Inner>,
    mut admit_rx: mpsc::UnboundedReceiver<AdmissionJob>,
    shutdown: CancellationToken,
) {
    'admission: loop {
        let job = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            job = admit_rx.recv() => match job {
                Some(job) => job,
                None => break,
            },
        };

        if job.cancel.is_cancelled() {
            continue;
        }

        // A queued request holds no slot; cancelling it must not stall
        // admission of the requests behind it.
        let permit = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = job.cancel.cancelled() => continue 'admission,
            permit = inner.slots.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let task = tokio::spawn(run_transfer(
            inner.clone(),
            job.identity.clone(),
            job.source,
            job.progress_tx,
            job.cancel.clone(),
            permit,
        ));

        let mut active = inner.active.lock().await;
        match active.get_mut(&job.identity) {
            Some(entry) => entry.task = Some(task),
            // Cancelled between the admission check and the spawn
            None => job.cancel.cancel(),
        }
    }
}

async fn run_transfer(
    inner: Arc<Inner>,
    identity: EpisodeIdentity,
    source: Url,
    progress_tx: watch::Sender<f32>,
    cancel: CancellationToken,
    permit: tokio::sync::OwnedSemaphorePermit,
) {
    let max_attempts = match inner.retry {
        RetryPolicy::Manual => 1,
        RetryPolicy::Automatic { max_attempts } => max_attempts.max(1),
    };

    // Coarse progress write-back so persisted records carry progress too;
    // fine-grained progress is served from the watch channel.
    let forwarder = spawn_progress_forwarder(inner.clone(), identity.clone(), progress_tx.clone());

    let mut attempt = 0;
    let outcome = loop {
        attempt += 1;

        // Cancelled between admission and spawn; the record must never
        // flip to downloading for a request the user already withdrew
        if cancel.is_cancelled() {
            break Some(Err(TransferError::Cancelled));
        }

        let _ = progress_tx.send(0.0);

        if write_state(&inner, &identity, DownloadState::Downloading { progress: 0.0 })
            .await
            .is_err()
        {
            break None;
        }

        match inner
            .transfer
            .fetch(&source, progress_tx.clone(), cancel.clone())
            .await
        {
            Ok(completed) => break Some(Ok(completed)),
            Err(e) if e.is_cancelled() => break Some(Err(e)),
            Err(e) if attempt < max_attempts => {
                warn!(identity = %identity, attempt, error = %e, "transfer failed, retrying");
            }
            Err(e) => break Some(Err(e)),
        }
    };

    drop(progress_tx);
    let _ = forwarder.await;

    match outcome {
        Some(Ok(completed)) => {
            if let Err(e) = commit(&inner, &identity, &source, completed).await {
                error!(identity = %identity, error = %e, "commit failed");
                let reason = e.to_string();
                let _ = write_state(&inner, &identity, DownloadState::Failed { reason }).await;
            }
        }
        Some(Err(e)) if e.is_cancelled() => {
            let _ = inner
                .records
                .update(&identity, |r| r.clear_download())
                .await;
        }
        Some(Err(e)) => {
            warn!(identity = %identity, error = %e, "download failed");
            let reason = e.to_string();
            let _ = write_state(&inner, &identity, DownloadState::Failed { reason }).await;
        }
        None => {}
    }

    inner.active.lock().await.remove(&identity);
    drop(permit);
}

/// Move the transient transfer result into permanent storage and write the
/// record, all under `Finishing` so no observer sees `downloaded` while the
/// bytes are still in the staging location
async fn commit(
    inner: &Inner,
    identity: &EpisodeIdentity,
    source: &Url,
    completed: CompletedTransfer,
) -> Result<(), DownloadError> {
    write_state(inner, identity, DownloadState::Finishing).await?;

    let name = media_filename(identity, source);
    let path = inner
        .files
        .adopt(&completed.temp_path, &name)
        .await
        .map_err(DownloadError::Commit)?;

    let bytes = completed.bytes;
    inner
        .records
        .update(identity, |r| {
            r.download = DownloadState::Downloaded { path: path.clone() };
            r.local_path = Some(path.clone());
            r.file_size_bytes = bytes;
            r.downloaded_at = Some(Utc::now());
        })
        .await?;

    info!(identity = %identity, path = %path.display(), bytes, "download complete");
    inner.events.emit(EngineEvent::DownloadCompleted {
        identity: identity.clone(),
        path,
        bytes,
    });
    Ok(())
}

async fn write_state(
    inner: &Inner,
    identity: &EpisodeIdentity,
    state: DownloadState,
) -> Result<(), DownloadError> {
    inner
        .records
        .update(identity, |r| r.download = state)
        .await
        .map_err(|e| {
            error!(identity = %identity, error = %e, "record write failed");
            DownloadError::Store(e)
        })?;
    Ok(())
}

/// Persist progress in coarse steps while a transfer runs. Exits when the
/// transfer drops its progress sender.
fn spawn_progress_forwarder(
    inner: Arc<Inner>,
    identity: EpisodeIdentity,
    progress_tx: watch::Sender<f32>,
) -> JoinHandle<()> {
    let mut progress_rx = progress_tx.subscribe();
    drop(progress_tx);

    tokio::spawn(async move {
        let mut last_written = 0.0f32;
        while progress_rx.changed().await.is_ok() {
            let progress = *progress_rx.borrow_and_update();
            // A retry resets progress to zero; regressions always persist
            // so the guard cannot get stuck above the live value
            if progress >= last_written && progress - last_written < 0.05 {
                continue;
            }
            last_written = progress;
            let result = inner
                .records
                .update(&identity, |r| {
                    // Only while still downloading; never clobber a
                    // terminal state written by the transfer task
                    if matches!(r.download, DownloadState::Downloading { .. }) {
                        r.download = DownloadState::Downloading { progress };
                    }
                })
                .await;
            if result.is_err() {
                break;
            }
        }
    })
}

/// Store-relative media filename, keeping the source URL's extension
fn media_filename(identity: &EpisodeIdentity, source: &Url) -> String {
    let extension = Path::new(source.path())
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("mp3");
    format!("{}.{}", identity.file_stem(), extension)
}
