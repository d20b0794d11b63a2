//! Notifications published by the data service

use crate::error::StoreError;
use crate::outbox::OperationType;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum StoreEvent {
    /// A mutation committed but its outbox entry could not be written
    SyncBookkeepingFailed {
        table: String,
        record_id: String,
        operation: OperationType,
        error: String,
    },
    /// A snapshot was sealed and written to the block store
    SnapshotPersisted { bytes: usize },
}

impl StoreEvent {
    pub fn as_error(&self) -> Option<StoreError> {
        match self {
            StoreEvent::SyncBookkeepingFailed {
                table,
                record_id,
                operation,
                error,
            } => Some(StoreError::SyncBookkeeping(format!(
                "{} {table}/{record_id}: {error}",
                operation.as_str()
            ))),
            StoreEvent::SnapshotPersisted { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bookkeeping_event_as_error() {
        let event = StoreEvent::SyncBookkeepingFailed {
            table: "rooms".into(),
            record_id: "4".into(),
            operation: OperationType::Insert,
            error: "Unknown table: sync_queue".into(),
        };
        let err = event.as_error().unwrap();
        assert_eq!(
            err.to_string(),
            "Sync bookkeeping failed: INSERT rooms/4: Unknown table: sync_queue"
        );
        assert!(StoreEvent::SnapshotPersisted { bytes: 10 }.as_error().is_none());
    }
}
