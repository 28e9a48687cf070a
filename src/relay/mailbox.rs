//! Latest-payload slot between a fan-out and one subscriber.
//!
//! A mailbox holds at most one undelivered payload. Putting a new one
//! replaces it, so a subscriber that reads slower than the broadcast cadence
//! skips straight to the newest payload and nothing stale piles up.

use std::sync::Arc;

use tokio::sync::watch;

use super::Payload;

/// Fan-out side of a subscriber's slot.
#[derive(Clone)]
pub struct Mailbox {
    tx: Arc<watch::Sender<Option<Payload>>>,
}

/// Connection side of a subscriber's slot.
pub struct Inbox {
    rx: watch::Receiver<Option<Payload>>,
}

/// Creates an empty slot.
pub fn mailbox() -> (Mailbox, Inbox) {
    let (tx, rx) = watch::channel(None);
    (Mailbox { tx: Arc::new(tx) }, Inbox { rx })
}

impl Mailbox {
    /// Replaces any undelivered payload; never waits.
    ///
    /// Returns false once the inbox has been dropped.
    pub fn put(&self, payload: Payload) -> bool {
        self.tx.send(Some(payload)).is_ok()
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

impl Inbox {
    /// Waits for a payload newer than the last one taken.
    ///
    /// Returns `None` once every mailbox handle is gone. Cancel-safe.
    pub async fn recv(&mut self) -> Option<Payload> {
        self.rx.changed().await.ok()?;
        self.rx.borrow_and_update().clone()
    }

    /// Takes the waiting payload, if any.
    pub fn try_recv(&mut self) -> Option<Payload> {
        if !self.rx.has_changed().unwrap_or(false) {
            return None;
        }
        self.rx.borrow_and_update().clone()
    }
}
