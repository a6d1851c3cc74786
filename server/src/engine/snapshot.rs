use tokio::sync::watch;

use super::reconciler::{Resource, Snapshot};

/// Last-value cache of a [`Snapshot`] with change broadcast to subscribers.
///
/// Subscribers always see the current value first; publishing an equal
/// snapshot does not wake them.
pub struct SnapshotState<T> {
    tx: watch::Sender<Snapshot<T>>,
}

impl<T: Resource> SnapshotState<T> {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Snapshot::default());
        Self { tx }
    }

    /// Replace the current snapshot. Returns true if subscribers were notified.
    pub fn publish(&self, snapshot: Snapshot<T>) -> bool {
        self.tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        })
    }

    /// Revert to the empty snapshot.
    pub fn clear(&self) -> bool {
        self.publish(Snapshot::default())
    }

    pub fn current(&self) -> Snapshot<T> {
        self.tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot<T>> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl<T: Resource> Default for SnapshotState<T> {
    fn default() -> Self {
        Self::new()
    }
}
