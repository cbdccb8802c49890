//! Sync events
//!
//! Everything the orchestrator reports to the UI goes through [`EventBus`] as a
//! [`SyncEvent`]. Subscribers that fall behind lose the oldest events
//! (`RecvError::Lagged`) but never block the sync core.

use super::models::{OperationType, SyncStatus};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Summary of one completed sync cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    /// Remote operations received by pull
    pub pulled: usize,
    /// Remote operations that passed validation and went through the register
    pub applied: usize,
    /// Remote operations rejected at the boundary
    pub skipped: usize,
    /// Local operations confirmed by the remote store
    pub pushed: usize,
    /// Local operations that failed this cycle
    pub failed: usize,
    /// Cursor after the cycle
    pub last_sync_version: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    OperationQueued {
        operation_id: Uuid,
        operation_type: OperationType,
        entity_type: String,
        entity_id: String,
    },
    OperationSynced {
        operation_id: Uuid,
        entity_id: String,
    },
    OperationFailed {
        operation_id: Uuid,
        entity_id: String,
        error: String,
        retry_count: u32,
        /// Excluded from automatic retry
        permanent: bool,
    },
    StatusChanged(SyncStatus),
    SyncComplete(CycleReport),
    RemoteOperationReceived {
        operation_id: String,
        entity_id: String,
    },
    RemoteOperationApplied {
        operation_id: Uuid,
        entity_id: String,
        operation_type: OperationType,
        /// False when the register already held a newer state
        changed: bool,
    },
    RemoteOperationSkipped {
        operation_id: String,
        reason: String,
    },
}

/// Event bus for broadcasting sync events
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn emit(&self, event: SyncEvent) {
        // No receivers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_events_in_order() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        let id = Uuid::new_v4();
        bus.emit(SyncEvent::OperationSynced {
            operation_id: id,
            entity_id: "n1".to_string(),
        });
        bus.emit(SyncEvent::SyncComplete(CycleReport::default()));

        assert!(matches!(rx.recv().await, Ok(SyncEvent::OperationSynced { operation_id, .. }) if operation_id == id));
        assert!(matches!(rx.recv().await, Ok(SyncEvent::SyncComplete(_))));
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new(4);
        assert_eq!(bus.receiver_count(), 0);
        bus.emit(SyncEvent::StatusChanged(SyncStatus::default()));
    }

    #[test]
    fn test_event_json_is_tagged() {
        let json = serde_json::to_value(SyncEvent::RemoteOperationSkipped {
            operation_id: "x".to_string(),
            reason: "bad payload".to_string(),
        })
        .unwrap();
        assert_eq!(json["type"], "remote_operation_skipped");
    }
}
