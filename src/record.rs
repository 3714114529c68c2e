use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::identity::EpisodeIdentity;

/// Download lifecycle of one episode.
///
/// `Finishing` is deliberately distinct from `Downloading`: the transfer
/// engine hands back a transient location whose lifetime is not guaranteed
/// beyond the completion callback, so the move into permanent storage and
/// the record write happen under this state before the task returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DownloadState {
    NotDownloaded,
    /// Waiting for an admission slot
    Queued,
    Downloading {
        progress: f32,
    },
    Finishing,
    Downloaded {
        path: PathBuf,
    },
    Failed {
        reason: String,
    },
}

impl DownloadState {
    pub fn is_downloaded(&self) -> bool {
        matches!(self, DownloadState::Downloaded { .. })
    }

    /// States held while a transfer task exists for the identity
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            DownloadState::Queued | DownloadState::Downloading { .. } | DownloadState::Finishing
        )
    }
}

/// Playback progress for one episode.
///
/// `is_completed` is monotonic: once an episode crosses the completion
/// threshold the tracker never resets it, so re-listening to a finished
/// episode does not resurrect it in the unplayed pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaybackRecord {
    pub last_position_seconds: f64,
    pub duration_seconds: f64,
    pub is_completed: bool,
    pub last_played_at: DateTime<Utc>,
}

/// Persisted per-episode state: download fields plus optional playback
/// progress, keyed by [`EpisodeIdentity`].
///
/// Created on first download request or on first playback event, whichever
/// comes first; neither path requires the other to have run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeRecord {
    pub identity: EpisodeIdentity,
    pub download: DownloadState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,
    #[serde(default)]
    pub file_size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downloaded_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_url: Option<Url>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub playback: Option<PlaybackRecord>,
    pub updated_at: DateTime<Utc>,
}

impl EpisodeRecord {
    pub fn new(identity: EpisodeIdentity) -> Self {
        Self {
            identity,
            download: DownloadState::NotDownloaded,
            local_path: None,
            file_size_bytes: 0,
            downloaded_at: None,
            source_url: None,
            playback: None,
            updated_at: Utc::now(),
        }
    }

    /// Clear all download fields back to the not-downloaded baseline,
    /// leaving playback progress untouched
    pub fn clear_download(&mut self) {
        self.download = DownloadState::NotDownloaded;
        self.local_path = None;
        self.file_size_bytes = 0;
        self.downloaded_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_serde_roundtrip() {
        let mut record = EpisodeRecord::new(EpisodeIdentity::new("Show", "Ep 1"));
        record.download = DownloadState::Downloaded {
            path: PathBuf::from("/media/ep1.mp3"),
        };
        record.local_path = Some(PathBuf::from("/media/ep1.mp3"));
        record.file_size_bytes = 1234;
        record.playback = Some(PlaybackRecord {
            last_position_seconds: 42.5,
            duration_seconds: 1800.0,
            is_completed: false,
            last_played_at: Utc::now(),
        });

        let json = serde_json::to_string_pretty(&record).unwrap();
        let back: EpisodeRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back, record);
    }

    #[test]
    fn clear_download_preserves_playback() {
        let mut record = EpisodeRecord::new(EpisodeIdentity::new("Show", "Ep 1"));
        record.download = DownloadState::Downloaded {
            path: PathBuf::from("/media/ep1.mp3"),
        };
        record.local_path = Some(PathBuf::from("/media/ep1.mp3"));
        record.file_size_bytes = 99;
        record.downloaded_at = Some(Utc::now());
        record.playback = Some(PlaybackRecord {
            last_position_seconds: 10.0,
            duration_seconds: 100.0,
            is_completed: false,
            last_played_at: Utc::now(),
        });

        record.clear_download();

        assert_eq!(record.download, DownloadState::NotDownloaded);
        assert!(record.local_path.is_none());
        assert_eq!(record.file_size_bytes, 0);
        assert!(record.downloaded_at.is_none());
        assert!(record.playback.is_some());
    }

    #[test]
    fn in_flight_states() {
        assert!(DownloadState::Queued.is_in_flight());
        assert!(DownloadState::Downloading { progress: 0.5 }.is_in_flight());
        assert!(DownloadState::Finishing.is_in_flight());
        assert!(!DownloadState::NotDownloaded.is_in_flight());
        assert!(
            !DownloadState::Failed {
                reason: "x".into()
            }
            .is_in_flight()
        );
    }
}
