pub mod config;
pub mod download;
pub mod engine;
pub mod error;
pub mod events;
pub mod identity;
pub mod playback;
pub mod queue;
pub mod record;
pub mod reconcile;
pub mod store;
pub mod transfer;

// Re-export main types for convenience
pub use config::{EngineConfig, RetryPolicy};
pub use download::DownloadOrchestrator;
pub use engine::Engine;
pub use error::{DownloadError, StoreError, TransferError};
pub use events::{EngineEvent, EventBus};
pub use identity::EpisodeIdentity;
pub use playback::{PlaybackSample, PlaybackTracker, PositionSource};
pub use queue::{QueueEntry, QueueManager};
pub use record::{DownloadState, EpisodeRecord, PlaybackRecord};
pub use reconcile::{Reconciler, dedup_by_identity};
pub use store::{DiskFileStore, FileStore, JsonRecordStore, RecordStore, Records};
pub use transfer::{
    CompletedTransfer, HttpClient, HttpTransferEngine, ReqwestClient, TransferEngine,
};
