// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::info;

use crate::config::EngineConfig;
use crate::download::DownloadOrchestrator;
use crate::error::StoreError;
use crate::events::{EngineEvent, EventBus};
use crate::identity::EpisodeIdentity;
use crate::playback::PlaybackTracker;
use crate::queue::QueueManager;
use crate::reconcile::Reconciler;
use crate::store::{FileStore, RecordStore, Records};
use crate::transfer::TransferEngine;

/// The assembled acquisition and playback-state engine.
///
/// Constructed once at application startup with its collaborators injected,
/// handed around by reference, and torn down with [`Engine::shutdown`];
/// there is no ambient global instance. Construction runs the startup
/// reconciliation pass so stale records are repaired before anything reads
/// them.
pub struct Engine {
    records: Arc<Records>,
    files: Arc<dyn FileStore>,
    orchestrator: DownloadOrchestrator,
    tracker: Arc<PlaybackTracker>,
    queue: QueueManager,
    events: EventBus,
}

impl Engine {
    pub async fn new(
        config: EngineConfig,
        record_store: Arc<dyn RecordStore>,
        files: Arc<dyn FileStore>,
        transfer: Arc<dyn TransferEngine>,
    ) -> Result<Self, StoreError> {
        let events = EventBus::new();
        let records = Arc::new(Records::load(record_store).await?);

        let repaired = Reconciler::new(records.clone(), files.clone())
            .reconcile_at_startup()
            .await?;
        if repaired > 0 {
            info!(repaired, "repaired stale records at startup");
        }

        let orchestrator = DownloadOrchestrator::new(
            &config,
            records.clone(),
            files.clone(),
            transfer,
            events.clone(),
        );
        let tracker = Arc::new(PlaybackTracker::new(&config, records.clone(), events.clone()));
        let queue = QueueManager::new(&config, records.clone());

        Ok(Self {
            records,
            files,
            orchestrator,
            tracker,
            queue,
            events,
        })
    }

    pub fn downloads(&self) -> &DownloadOrchestrator {
        &self.orchestrator
    }

    pub fn playback(&self) -> &Arc<PlaybackTracker> {
        &self.tracker
    }

    pub fn queue(&self) -> &QueueManager {
        &self.queue
    }

    /// Subscribe to position updates and download completions
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.events.subscribe()
    }

    /// Total bytes of downloaded media currently on disk, for storage
    /// management surfaces
    pub async fn media_usage_bytes(&self) -> Result<u64, StoreError> {
        self.files.total_used_bytes().await
    }

    /// Drop an episode's record entirely (explicit user action)
    pub async fn clear_history(&self, identity: &EpisodeIdentity) -> Result<(), StoreError> {
        self.records.remove(identity).await
    }

    /// Stop all background work: in-flight transfers, the admission
    /// dispatcher and the position sampler
    pub async fn shutdown(&self) {
        self.tracker.shutdown().await;
        self.orchestrator.shutdown().await;
        info!("engine shut down");
    }
}
