use std::time::Duration;

/// Retry behavior for transient transfer failures.
///
/// The engine defaults to manual retry; automatic retry re-requests the
/// transfer up to `max_attempts` total attempts before settling in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryPolicy {
    Manual,
    Automatic { max_attempts: u32 },
}

/// Tunables for the acquisition and playback-state engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of concurrent transfers; further requests wait in a
    /// FIFO admission queue
    pub max_concurrent_downloads: usize,
    /// Preflight free-space floor; requests fail with `InsufficientStorage`
    /// below this without consuming a concurrency slot
    pub min_free_space_bytes: u64,
    /// Fraction of the duration at which an episode counts as completed
    pub completion_threshold: f64,
    /// Interval between playback position samples
    pub sample_interval: Duration,
    /// Play-queue capacity; enqueueing beyond it evicts the oldest entry
    pub queue_capacity: usize,
    /// Whether a random unplayed episode is started when the queue is empty
    pub auto_play: bool,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_downloads: 4,
            min_free_space_bytes: 50 * 1024 * 1024,
            completion_threshold: 0.98,
            sample_interval: Duration::from_secs(5),
            queue_capacity: 50,
            auto_play: true,
            retry: RetryPolicy::Manual,
        }
    }
}
