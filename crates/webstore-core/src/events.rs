//! Storage object lifecycle events

use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::Mutex;
use webstore_index::EntryId;

use crate::TransactionId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectEvent {
    Opened(EntryId),
    TransactionCreated(TransactionId),
    TransactionClosed(TransactionId),
    Closing(EntryId),
    Closed(EntryId),
}

/// Observer list owned by one storage object. Dropped with it, which
/// disconnects every receiver.
#[derive(Default)]
pub(crate) struct EventFeed {
    subscribers: Mutex<Vec<Sender<ObjectEvent>>>,
}

impl EventFeed {
    pub(crate) fn subscribe(&self) -> Receiver<ObjectEvent> {
        let (tx, rx) = channel::unbounded();
        self.subscribers.lock().push(tx);
        rx
    }

    pub(crate) fn emit(&self, event: ObjectEvent) {
        tracing::debug!(event = ?event, "Storage object event");
        self.subscribers
            .lock()
            .retain(|subscriber| subscriber.send(event.clone()).is_ok());
    }

    /// Disconnects every subscriber.
    pub(crate) fn close(&self) {
        self.subscribers.lock().clear();
    }
}
