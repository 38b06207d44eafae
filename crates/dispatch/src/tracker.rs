//! Per-container runner mailbox.

use crate::api::Container;
use tokio::sync::watch;

/// The dispatcher side of one runner's update mailbox.
///
/// The mailbox holds a single container record. Updates overwrite the slot
/// without blocking, so a runner that falls behind sees only the most
/// recent state. Closing drops the sender, which ends the runner's receive
/// loop; closing twice is a no-op.
pub struct RunTracker {
    tx: Option<watch::Sender<Container>>,
}

impl RunTracker {
    /// Create a tracker seeded with the container's current record, and
    /// the receiver to hand to the runner.
    pub fn new(initial: Container) -> (Self, watch::Receiver<Container>) {
        let (tx, rx) = watch::channel(initial);
        (Self { tx: Some(tx) }, rx)
    }

    /// Deliver an updated record. Dropped silently once closed or once the
    /// runner has gone away.
    pub fn update(&self, container: Container) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(container);
        }
    }

    /// Close the mailbox. Idempotent.
    pub fn close(&mut self) {
        self.tx = None;
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_none()
    }
}
