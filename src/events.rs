use std::path::PathBuf;

use tokio::sync::broadcast;

use crate::identity::EpisodeIdentity;

/// Events broadcast by the engine for other features to consume (companion
/// widgets, transcript generation) without coupling them to its internals
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Emitted at the sampling interval and on pause/seek
    PositionUpdate {
        identity: EpisodeIdentity,
        position_seconds: f64,
        duration_seconds: f64,
    },

    /// Emitted when an episode transitions into `downloaded`
    DownloadCompleted {
        identity: EpisodeIdentity,
        path: PathBuf,
        bytes: u64,
    },
}

/// Broadcast fan-out for [`EngineEvent`]s. Subscribers that fall behind
/// lose old events; delivery is best-effort.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(64);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: EngineEvent) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_emitted_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();

        bus.emit(EngineEvent::PositionUpdate {
            identity: EpisodeIdentity::new("Show", "Ep 1"),
            position_seconds: 10.0,
            duration_seconds: 100.0,
        });

        match rx.recv().await.unwrap() {
            EngineEvent::PositionUpdate {
                position_seconds, ..
            } => assert_eq!(position_seconds, 10.0),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn emit_without_subscribers_does_not_panic() {
        let bus = EventBus::new();
        bus.emit(EngineEvent::DownloadCompleted {
            identity: EpisodeIdentity::new("Show", "Ep 1"),
            path: PathBuf::from("/media/ep1.mp3"),
            bytes: 1,
        });
    }
}
