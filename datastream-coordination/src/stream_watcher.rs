use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use assignment_coordination::backend::{self, ChangeStream, CoordinationBackend, Snapshot};
use assignment_coordination::subscription::Subscription;
use assignment_coordination::util::{self, Backoff};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::keys::{Keyspace, StoreKey};
use crate::metrics_consts::WATCH_RESTARTS;
use crate::types::{Epoch, StreamDefinition, StreamSet};

/// Watches stream definitions under `{prefix}streams/` and always hands out
/// the full set, never deltas.
pub struct StreamRegistryWatcher {
    backend: Arc<dyn CoordinationBackend>,
    keys: Keyspace,
    debounce_interval: Duration,
    retry_backoff: Backoff,
}

impl StreamRegistryWatcher {
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

    pub async fn current_streams(&self) -> Result<StreamSet> {
        read_stream_set(self.backend.as_ref(), &self.keys).await
    }

    /// Publish a fresh [`StreamSet`] whenever any definition is added,
    /// removed, or changed.
    pub async fn watch(&self, cancel: CancellationToken) -> Result<Subscription<StreamSet>> {
        let stream = self
            .backend
            .watch(&self.keys.key(StoreKey::StreamsPrefix))
            .await?;
        let initial = self.current_streams().await?;
        let (tx, rx) = watch::channel(initial);

        let backend = Arc::clone(&self.backend);
        let keys = self.keys.clone();
        let debounce = self.debounce_interval;
        let backoff = self.retry_backoff;
        let task = tokio::spawn(async move {
            Self::watch_loop(backend, keys, debounce, backoff, stream, tx, cancel).await
        });
        Ok(Subscription::new(rx, task))
    }

    async fn watch_loop(
        backend: Arc<dyn CoordinationBackend>,
        keys: Keyspace,
        debounce: Duration,
        backoff: Backoff,
        mut stream: ChangeStream,
        tx: watch::Sender<StreamSet>,
        cancel: CancellationToken,
    ) {
        loop {
            match util::next_debounced_change(&mut stream, debounce, &cancel).await {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => {
                    tracing::warn!(error = %e, "stream watch failed, re-establishing");
                    metrics::counter!(WATCH_RESTARTS, "watch" => "streams").increment(1);
                    let prefix = keys.key(StoreKey::StreamsPrefix);
                    match util::rewatch(backend.as_ref(), &prefix, backoff, &cancel).await {
                        Some(s) => stream = s,
                        None => return,
                    }
                }
            }

            let mut attempt = 0u32;
            loop {
                match read_stream_set(backend.as_ref(), &keys).await {
                    Ok(streams) => {
                        publish(&tx, streams);
                        break;
                    }
                    Err(e) => {
                        attempt += 1;
                        tracing::warn!(attempt, error = %e, "failed to read stream definitions");
                    }
                }
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(backoff.delay_for_attempt(attempt)) => {}
                }
            }
        }
    }
}

fn publish(tx: &watch::Sender<StreamSet>, streams: StreamSet) {
    tx.send_if_modified(|current| {
        if streams.epoch < current.epoch || *current == streams {
            return false;
        }
        tracing::debug!(epoch = %streams.epoch, streams = streams.streams.len(), "stream set changed");
        *current = streams;
        true
    });
}

async fn read_stream_set(backend: &dyn CoordinationBackend, keys: &Keyspace) -> Result<StreamSet> {
    let snapshot = backend.snapshot(&keys.key(StoreKey::StreamsPrefix)).await?;
    Ok(stream_set_from(&snapshot, keys))
}

/// Stream definitions in `snapshot`, stamped with its revision.
pub(crate) fn stream_set_from(snapshot: &Snapshot, keys: &Keyspace) -> StreamSet {
    let prefix = keys.key(StoreKey::StreamsPrefix);

    let mut streams = BTreeMap::new();
    for kv in &snapshot.entries {
        let Some(name) = kv.key.strip_prefix(&prefix) else {
            continue;
        };
        let definition: StreamDefinition = match backend::from_json(&kv.value) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(stream = name, error = %e, "skipping unparseable stream definition");
                continue;
            }
        };
        if definition.name != name {
            tracing::warn!(
                key = name,
                name = %definition.name,
                "skipping stream definition whose name does not match its key"
            );
            continue;
        }
        streams.insert(definition.name.clone(), definition);
    }

    StreamSet {
        epoch: Epoch::from_revision(snapshot.revision),
        streams,
    }
}

#[cfg(test)]
mod tests {
    use assignment_coordination::memory::InMemoryBackend;

    use super::*;
    use crate::types::StreamStatus;

    async fn put_stream(backend: &InMemoryBackend, definition: &StreamDefinition) {
        backend
            .put(
                &format!("/test/streams/{}", definition.name),
                backend::to_json(definition).unwrap(),
            )
            .await
            .unwrap();
    }

    fn watcher(backend: &Arc<InMemoryBackend>) -> StreamRegistryWatcher {
        StreamRegistryWatcher::new(
            backend.clone(),
            Keyspace::new("/test/"),
            Duration::from_millis(10),
            Backoff::new(Duration::from_millis(10), Duration::from_millis(50)),
        )
    }

    #[tokio::test]
    async fn skips_malformed_and_mismatched_entries() {
        let backend = Arc::new(InMemoryBackend::new());
        put_stream(&backend, &StreamDefinition::new("orders", "kafka")).await;
        backend
            .put("/test/streams/broken", b"not json".to_vec())
            .await
            .unwrap();
        backend
            .put(
                "/test/streams/alias",
                backend::to_json(&StreamDefinition::new("other", "kafka")).unwrap(),
            )
            .await
            .unwrap();

        let set = watcher(&backend).current_streams().await.unwrap();
        assert_eq!(set.streams.keys().collect::<Vec<_>>(), vec!["orders"]);
    }

    #[tokio::test]
    async fn watch_delivers_full_snapshots() {
        let backend = Arc::new(InMemoryBackend::new());
        put_stream(&backend, &StreamDefinition::new("orders", "kafka")).await;

        let cancel = CancellationToken::new();
        let mut sub = watcher(&backend).watch(cancel.clone()).await.unwrap();
        assert_eq!(sub.take().streams.len(), 1);

        put_stream(&backend, &StreamDefinition::new("users", "kafka")).await;
        tokio::time::timeout(Duration::from_secs(2), sub.changed())
            .await
            .unwrap()
            .unwrap();
        let set = sub.take();
        assert_eq!(
            set.streams.keys().collect::<Vec<_>>(),
            vec!["orders", "users"]
        );

        let mut paused = StreamDefinition::new("orders", "kafka");
        paused.status = StreamStatus::Paused;
        put_stream(&backend, &paused).await;
        assert!(backend.delete("/test/streams/users"));
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                sub.changed().await.unwrap();
                let set = sub.take();
                if set.streams.len() == 1 && set.streams["orders"].status == StreamStatus::Paused {
                    return;
                }
            }
        })
        .await
        .unwrap();

        cancel.cancel();
        sub.close().await;
    }
}
