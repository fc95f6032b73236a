use std::sync::Arc;
use std::time::Duration;

use assignment_coordination::backend::{
    self, ChangeStream, CoordinationBackend, GuardedPut, Snapshot,
};
use assignment_coordination::subscription::Subscription;
use assignment_coordination::util::{self, Backoff};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, StaleWriteError};
use crate::keys::{Keyspace, StoreKey};
use crate::metrics_consts::WATCH_RESTARTS;
use crate::types::{AssignmentTable, Epoch, OwnAssignment, WorkerId};

/// Shared record of the current assignment table.
///
/// Writes are last-writer-wins among equal or newer epochs; a table stamped
/// with an older epoch than the stored one is rejected.
pub struct AssignmentStore {
    backend: Arc<dyn CoordinationBackend>,
    keys: Keyspace,
    debounce_interval: Duration,
    retry_backoff: Backoff,
}

impl AssignmentStore {
    pub fn new(
        backend: Arc<dyn CoordinationBackend>,
        keys: Keyspace,
        debounce_interval: Duration,
        retry_backoff: Backoff,
    ) -> Self {
        Self {
            backend,
            keys,
            debounce_interval,
            retry_backoff,
        }
    }

    /// Store `table`, or fail with [`StaleWriteError`] if a table from a
    /// newer epoch is already stored. Stored state is untouched on failure.
    pub async fn publish(&self, table: &AssignmentTable) -> Result<()> {
        let guard = table.epoch.to_guard();
        let outcome = self
            .backend
            .put_guarded(
                &self.keys.key(StoreKey::AssignmentEpoch),
                guard.as_bytes(),
                &self.keys.key(StoreKey::AssignmentTable),
                backend::to_json(table)?,
            )
            .await?;

        match outcome {
            GuardedPut::Applied => Ok(()),
            GuardedPut::Rejected { current_guard } => Err(StaleWriteError {
                attempted: table.epoch,
                current: Epoch::from_guard(&current_guard).unwrap_or_default(),
            }
            .into()),
        }
    }

    /// The stored table, or an empty one at epoch 0 if none was published yet.
    pub async fn read(&self) -> Result<AssignmentTable> {
        read_table(self.backend.as_ref(), &self.keys).await
    }

    /// Publish `worker`'s own task set, with the epoch of the table it came
    /// from, whenever a stored table changes the set or supersedes it.
    pub async fn watch_self(
        &self,
        worker: WorkerId,
        cancel: CancellationToken,
    ) -> Result<Subscription<OwnAssignment>> {
        let stream = self
            .backend
            .watch(&self.keys.key(StoreKey::AssignmentPrefix))
            .await?;
        let table = self.read().await?;
        let (tx, rx) = watch::channel(OwnAssignment {
            epoch: table.epoch,
            tasks: table.tasks_for(&worker),
        });

        let backend = Arc::clone(&self.backend);
        let keys = self.keys.clone();
        let debounce = self.debounce_interval;
        let backoff = self.retry_backoff;
        let task = tokio::spawn(async move {
            Self::watch_self_loop(backend, keys, worker, debounce, backoff, stream, tx, cancel)
                .await
        });
        Ok(Subscription::new(rx, task))
    }

    #[allow(clippy::too_many_arguments)]
    async fn watch_self_loop(
        backend: Arc<dyn CoordinationBackend>,
        keys: Keyspace,
        worker: WorkerId,
        debounce: Duration,
        backoff: Backoff,
        mut stream: ChangeStream,
        tx: watch::Sender<OwnAssignment>,
        cancel: CancellationToken,
    ) {
        loop {
            match util::next_debounced_change(&mut stream, debounce, &cancel).await {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => {
                    tracing::warn!(worker = %worker, error = %e, "assignment watch failed, re-establishing");
                    metrics::counter!(WATCH_RESTARTS, "watch" => "assignment").increment(1);
                    let prefix = keys.key(StoreKey::AssignmentPrefix);
                    match util::rewatch(backend.as_ref(), &prefix, backoff, &cancel).await {
                        Some(s) => stream = s,
                        None => return,
                    }
                }
            }

            match read_table(backend.as_ref(), &keys).await {
                Ok(table) => {
                    let mine = table.tasks_for(&worker);
                    tx.send_if_modified(|current| {
                        if table.epoch < current.epoch
                            || (table.epoch == current.epoch && current.tasks == mine)
                        {
                            return false;
                        }
                        tracing::debug!(worker = %worker, epoch = %table.epoch, tasks = mine.len(), "own assignment changed");
                        *current = OwnAssignment {
                            epoch: table.epoch,
                            tasks: mine,
                        };
                        true
                    });
                }
                // The next change triggers another read
                Err(e) => tracing::warn!(worker = %worker, error = %e, "failed to read assignment table"),
            }
        }
    }
}

async fn read_table(backend: &dyn CoordinationBackend, keys: &Keyspace) -> Result<AssignmentTable> {
    match backend.get(&keys.key(StoreKey::AssignmentTable)).await? {
        Some(bytes) => Ok(backend::from_json(&bytes)?),
        None => Ok(AssignmentTable::default()),
    }
}

/// The table stored in `snapshot`, or an empty one if it holds none.
pub(crate) fn table_from(snapshot: &Snapshot, keys: &Keyspace) -> Result<AssignmentTable> {
    let key = keys.key(StoreKey::AssignmentTable);
    match snapshot.entries.iter().find(|kv| kv.key == key) {
        Some(kv) => Ok(backend::from_json(&kv.value)?),
        None => Ok(AssignmentTable::default()),
    }
}
