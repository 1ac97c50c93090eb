use tokio::sync::broadcast;

use crate::model::{EncryptedDocument, SyncAction};
use crate::sync::report::SyncReport;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum SyncEvent {
    ActionStarted {
        action: SyncAction,
        document_id: i64,
    },
    DocumentChanged(EncryptedDocument),
    DocumentRemoved {
        document_id: i64,
    },
    RunFinished(SyncReport),
    ChangesApplied {
        account_id: i64,
        planned: usize,
    },
}

/// Fan-out of engine events; slow subscribers lose the oldest events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SyncEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    pub fn publish(&self, event: SyncEvent) {
        // No subscribers is fine.
        let _ = self.sender.send(event);
    }
}
