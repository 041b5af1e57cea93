//! Engine events broadcast to observers (gateway subscribers, the CLI).
//!
//! Uses [`tokio::sync::broadcast`] so a slow subscriber only loses its own
//! oldest events and never blocks ingestion.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EngineEvent {
    MemoryIngested {
        user_id: String,
        memory_id: String,
        /// `None` when a duplicate refers to a memory that has since been
        /// corrected.
        cluster_id: Option<Uuid>,
        duplicate: bool,
    },
    ClusterDormant { user_id: String, cluster_id: Uuid },
    ClusterPruned { user_id: String, cluster_id: Uuid },
    ClustersMerged {
        user_id: String,
        survivor: Uuid,
        absorbed: Uuid,
    },
    InconsistencyHealed {
        user_id: String,
        details: String,
    },
    SweepCompleted {
        user_id: String,
        timeframe: String,
        patterns: usize,
        predictions: usize,
    },
    EnrichmentDeferred {
        user_id: String,
        memory_id: String,
        attempt: u32,
        retry_in_ms: u64,
    },
    EnrichmentAbandoned {
        user_id: String,
        memory_id: String,
        reason: String,
    },
}

impl EngineEvent {
    pub fn user_id(&self) -> &str {
        match self {
            EngineEvent::MemoryIngested { user_id, .. }
            | EngineEvent::ClusterDormant { user_id, .. }
            | EngineEvent::ClusterPruned { user_id, .. }
            | EngineEvent::ClustersMerged { user_id, .. }
            | EngineEvent::InconsistencyHealed { user_id, .. }
            | EngineEvent::SweepCompleted { user_id, .. }
            | EngineEvent::EnrichmentDeferred { user_id, .. }
            | EngineEvent::EnrichmentAbandoned { user_id, .. } => user_id,
        }
    }
}

/// Cheaply cloneable broadcast handle.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Publish to every current subscriber.  Having none is normal; the
    /// number of receivers reached is returned.
    pub fn publish(&self, event: EngineEvent) -> usize {
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_published_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();
        let reached = bus.publish(EngineEvent::ClusterPruned {
            user_id: "u1".into(),
            cluster_id: Uuid::new_v4(),
        });
        assert_eq!(reached, 1);
        let event = rx.recv().await.unwrap();
        assert_eq!(event.user_id(), "u1");
    }

    #[test]
    fn publish_without_subscribers_is_not_an_error() {
        let bus = EventBus::new(4);
        assert_eq!(
            bus.publish(EngineEvent::InconsistencyHealed {
                user_id: "u1".into(),
                details: "x".into(),
            }),
            0
        );
    }

    #[test]
    fn events_are_tagged_on_the_wire() {
        let json = serde_json::to_value(EngineEvent::SweepCompleted {
            user_id: "u1".into(),
            timeframe: "week".into(),
            patterns: 2,
            predictions: 1,
        })
        .unwrap();
        assert_eq!(json["event"], "sweep_completed");
        assert_eq!(json["patterns"], 2);
    }
}
