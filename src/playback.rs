use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::config::EngineConfig;
use crate::error::StoreError;
use crate::events::{EngineEvent, EventBus};
use crate::identity::EpisodeIdentity;
use crate::record::PlaybackRecord;
use crate::store::Records;

/// One observation of the playback surface
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackSample {
    pub identity: EpisodeIdentity,
    pub position_seconds: f64,
    pub duration_seconds: f64,
}

/// Where the sampler reads the current position from.
///
/// Returns whatever the surface is playing right now, or `None` when
/// playback is stopped.
pub trait PositionSource: Send + Sync {
    fn current_position(&self) -> Option<PlaybackSample>;
}

/// Snapshots playback position into the record store so a session can be
/// resumed exactly where it left off.
///
/// A periodic sampler covers steady playback; pause, seek and
/// app-backgrounding call [`PlaybackTracker::record_sample`] directly. The
/// sampler is a cancellable task owned by this tracker and must be stopped
/// via [`PlaybackTracker::shutdown`] on teardown.
pub struct PlaybackTracker {
    records: Arc<Records>,
    events: EventBus,
    completion_threshold: f64,
    sample_interval: Duration,
    active: Arc<std::sync::Mutex<Option<EpisodeIdentity>>>,
    cancel: CancellationToken,
    sampler: Mutex<Option<JoinHandle<()>>>,
}

impl PlaybackTracker {
    pub fn new(config: &EngineConfig, records: Arc<Records>, events: EventBus) -> Self {
        Self {
            records,
            events,
            completion_threshold: config.completion_threshold,
            sample_interval: config.sample_interval,
            active: Arc::new(std::sync::Mutex::new(None)),
            cancel: CancellationToken::new(),
            sampler: Mutex::new(None),
        }
    }

    /// Set which identity the sampler is allowed to write for.
    ///
    /// The active episode may change between a tick being scheduled and
    /// firing; ticks for a stale identity are dropped.
    pub fn set_active(&self, identity: Option<EpisodeIdentity>) {
        *self.active.lock().unwrap() = identity;
    }

    /// Start the periodic sampler over the given position source.
    ///
    /// At most one sampler runs per tracker; further calls while it is
    /// running are ignored.
    pub async fn start(&self, source: Arc<dyn PositionSource>) {
        let mut sampler = self.sampler.lock().await;
        if sampler.is_some() {
            warn!("position sampler already running, ignoring start");
            return;
        }

        let records = self.records.clone();
        let events = self.events.clone();
        let threshold = self.completion_threshold;
        let interval = self.sample_interval;
        let active = self.active.clone();
        let cancel = self.cancel.clone();

        let handle = tokio::spawn(async move {
            let mut ticks = tokio::time::interval(interval);
            ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first interval tick fires immediately; skip it so the
            // first sample lands one interval into playback.
            ticks.tick().await;

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticks.tick() => {}
                }

                let Some(sample) = source.current_position() else {
                    continue;
                };
                let matches_active = active
                    .lock()
                    .unwrap()
                    .as_ref()
                    .is_some_and(|active| active == &sample.identity);
                if !matches_active {
                    debug!(identity = %sample.identity, "dropping sample for stale identity");
                    continue;
                }

                if let Err(e) = write_sample(&records, &events, threshold, &sample).await {
                    error!(identity = %sample.identity, error = %e, "position write failed");
                }
            }
        });

        *sampler = Some(handle);
    }

    /// Write one position sample. Called by the sampler each interval and
    /// directly on pause, seek and app-backgrounding.
    ///
    /// Position is clamped into `[0, duration]`; completion is set once the
    /// position crosses the threshold and is never reset here.
    pub async fn record_sample(&self, sample: &PlaybackSample) -> Result<(), StoreError> {
        write_sample(&self.records, &self.events, self.completion_threshold, sample).await
    }

    /// Where playback of `identity` should start: the stored position for
    /// an unfinished episode, otherwise the beginning
    pub async fn resume_position(&self, identity: &EpisodeIdentity) -> f64 {
        match self.records.get(identity).await.and_then(|r| r.playback) {
            Some(playback) if !playback.is_completed => playback
                .last_position_seconds
                .clamp(0.0, playback.duration_seconds.max(0.0)),
            _ => 0.0,
        }
    }

    /// Stop the periodic sampler
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.sampler.lock().await.take() {
            let _ = handle.await;
        }
    }
}

async fn write_sample(
    records: &Records,
    events: &EventBus,
    threshold: f64,
    sample: &PlaybackSample,
) -> Result<(), StoreError> {
    let duration = sample.duration_seconds.max(0.0);
    let position = sample.position_seconds.clamp(0.0, duration);

    records
        .update(&sample.identity, |r| {
            let completed_now = duration > 0.0 && position >= duration * threshold;
            let playback = r.playback.get_or_insert_with(|| PlaybackRecord {
                last_position_seconds: 0.0,
                duration_seconds: duration,
                is_completed: false,
                last_played_at: Utc::now(),
            });
            playback.last_position_seconds = position;
            playback.duration_seconds = duration;
            playback.is_completed = playback.is_completed || completed_now;
            playback.last_played_at = Utc::now();
        })
        .await?;

    events.emit(EngineEvent::PositionUpdate {
        identity: sample.identity.clone(),
        position_seconds: position,
        duration_seconds: duration,
    });
    Ok(())
}
