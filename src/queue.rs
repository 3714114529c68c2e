use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use rand::Rng;
use tracing::debug;
use url::Url;

use crate::config::EngineConfig;
use crate::identity::EpisodeIdentity;
use crate::store::Records;

/// Snapshot of an episode reference holding enough to start playback
/// without a feed re-fetch
#[derive(Debug, Clone, PartialEq)]
pub struct QueueEntry {
    pub identity: EpisodeIdentity,
    pub media_url: Url,
    pub duration_seconds: Option<f64>,
}

/// Ordered "play next" queue with a fallback random-unplayed selector.
///
/// The queue is bounded; when full, the entry that has been queued longest
/// is evicted to make room (tracked by a per-entry sequence number, so the
/// rule holds for both append and prepend). An identity already queued is
/// not added twice and keeps its earlier position.
pub struct QueueManager {
    records: Arc<Records>,
    capacity: usize,
    auto_play: bool,
    queue: std::sync::Mutex<QueueState>,
    /// Identities auto-play already chose this session, to avoid
    /// immediate repeats
    session_picks: std::sync::Mutex<HashSet<EpisodeIdentity>>,
}

struct QueueState {
    entries: VecDeque<(u64, QueueEntry)>,
    next_seq: u64,
}

impl QueueManager {
    pub fn new(config: &EngineConfig, records: Arc<Records>) -> Self {
        Self {
            records,
            capacity: config.queue_capacity,
            auto_play: config.auto_play,
            queue: std::sync::Mutex::new(QueueState {
                entries: VecDeque::new(),
                next_seq: 0,
            }),
            session_picks: std::sync::Mutex::new(HashSet::new()),
        }
    }

    /// Append an entry ("play later")
    pub fn enqueue(&self, entry: QueueEntry) {
        let mut queue = self.queue.lock().unwrap();
        if queue.contains(&entry.identity) {
            return;
        }
        let seq = queue.take_seq();
        queue.entries.push_back((seq, entry));
        queue.evict_to(self.capacity);
    }

    /// Prepend an entry ("play next")
    pub fn enqueue_next(&self, entry: QueueEntry) {
        let mut queue = self.queue.lock().unwrap();
        if queue.contains(&entry.identity) {
            return;
        }
        let seq = queue.take_seq();
        queue.entries.push_front((seq, entry));
        queue.evict_to(self.capacity);
    }

    pub fn dequeue_next(&self) -> Option<QueueEntry> {
        self.queue
            .lock()
            .unwrap()
            .entries
            .pop_front()
            .map(|(_, entry)| entry)
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// What to play when playback of `current` ends.
    ///
    /// The queue head wins when present. Otherwise, with auto-play on, an
    /// episode is drawn uniformly at random from `catalog` entries that are
    /// unplayed or unfinished, excluding `current` and anything auto-play
    /// already chose this session. `None` means stop; queue and position
    /// state are left untouched.
    pub async fn next_after_playback(
        &self,
        current: Option<&EpisodeIdentity>,
        catalog: &[QueueEntry],
    ) -> Option<QueueEntry> {
        if let Some(entry) = self.dequeue_next() {
            debug!(identity = %entry.identity, "continuing with queued episode");
            return Some(entry);
        }

        if !self.auto_play {
            return None;
        }

        let mut pool = Vec::new();
        for entry in catalog {
            if Some(&entry.identity) == current {
                continue;
            }
            if self.session_picks.lock().unwrap().contains(&entry.identity) {
                continue;
            }
            let played = self
                .records
                .get(&entry.identity)
                .await
                .and_then(|r| r.playback);
            if played.is_none_or(|p| !p.is_completed) {
                pool.push(entry.clone());
            }
        }

        if pool.is_empty() {
            return None;
        }

        let pick = pool.swap_remove(rand::rng().random_range(0..pool.len()));
        self.session_picks
            .lock()
            .unwrap()
            .insert(pick.identity.clone());
        debug!(identity = %pick.identity, "auto-playing random unplayed episode");
        Some(pick)
    }
}

impl QueueState {
    fn contains(&self, identity: &EpisodeIdentity) -> bool {
        self.entries.iter().any(|(_, e)| &e.identity == identity)
    }

    fn take_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Drop longest-queued entries until within capacity
    fn evict_to(&mut self, capacity: usize) {
        while self.entries.len() > capacity {
            if let Some(oldest) = self
                .entries
                .iter()
                .enumerate()
                .min_by_key(|(_, (seq, _))| *seq)
                .map(|(index, _)| index)
            {
                self.entries.remove(oldest);
            }
        }
    }
}
