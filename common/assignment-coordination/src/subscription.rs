use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// Latest-value view maintained by a background task.
///
/// Values published while the holder is busy overwrite each other, so the
/// holder only ever acts on the newest snapshot.
pub struct Subscription<T> {
    receiver: watch::Receiver<T>,
    task: JoinHandle<()>,
}

impl<T: Clone> Subscription<T> {
    pub fn new(receiver: watch::Receiver<T>, task: JoinHandle<()>) -> Self {
        Self { receiver, task }
    }

    /// Wait until a value newer than the last [`take`](Self::take) arrives.
    pub async fn changed(&mut self) -> Result<()> {
        self.receiver
            .changed()
            .await
            .map_err(|_| Error::InvalidState("subscription task ended".to_string()))
    }

    /// Return the newest value and mark it seen.
    pub fn take(&mut self) -> T {
        self.receiver.borrow_and_update().clone()
    }

    /// Return the newest value without marking it seen.
    pub fn peek(&self) -> T {
        self.receiver.borrow().clone()
    }

    /// A second handle on the same channel. It tracks what it has seen
    /// separately, so waiting on it leaves [`changed`](Self::changed) intact.
    pub fn receiver(&self) -> watch::Receiver<T> {
        self.receiver.clone()
    }

    /// Wait for the driving task to finish. Cancel its token first.
    pub async fn close(self) {
        drop(self.task.await);
    }
}
