use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::backend::{
    ChangeStream, CoordinationBackend, GuardedPut, KeyValue, Revision, SessionId, Snapshot,
};
use crate::error::{Error, Result};

const WATCH_CHANNEL_SIZE: usize = 16;

/// In-process [`CoordinationBackend`].
///
/// Mirrors the etcd semantics the coordinator relies on: a single revision
/// counter bumped per mutation, sessions owning ephemeral keys, and prefix
/// watches. Sessions never time out on their own; use [`expire_session`]
/// to simulate a crash or partition.
///
/// [`expire_session`]: InMemoryBackend::expire_session
pub struct InMemoryBackend {
    state: Mutex<State>,
}

struct Entry {
    value: Vec<u8>,
    session: Option<SessionId>,
}

struct Watcher {
    prefix: String,
    tx: mpsc::Sender<Result<Revision>>,
}

struct State {
    revision: Revision,
    next_session: SessionId,
    sessions: HashSet<SessionId>,
    entries: BTreeMap<String, Entry>,
    watchers: Vec<Watcher>,
}

impl State {
    /// Bump the revision and wake every watcher covering one of `keys`.
    fn commit(&mut self, keys: &[String]) {
        self.revision += 1;
        let revision = self.revision;
        self.watchers.retain(|w| !w.tx.is_closed());
        for watcher in &self.watchers {
            if keys.iter().any(|k| k.starts_with(&watcher.prefix)) {
                // A full channel already holds a pending wake-up
                drop(watcher.tx.try_send(Ok(revision)));
            }
        }
    }

    fn drop_session(&mut self, session: SessionId) -> bool {
        if !self.sessions.remove(&session) {
            return false;
        }
        let owned: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.session == Some(session))
            .map(|(k, _)| k.clone())
            .collect();
        for key in &owned {
            self.entries.remove(key);
        }
        if !owned.is_empty() {
            self.commit(&owned);
        }
        true
    }
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                revision: 1,
                next_session: 1,
                sessions: HashSet::new(),
                entries: BTreeMap::new(),
                watchers: Vec::new(),
            }),
        }
    }

    /// Expire a session as if its owner stopped heartbeating. Deletes the
    /// session's keys; its keepalive returns `SessionLost` on the next tick.
    pub fn expire_session(&self, session: SessionId) -> bool {
        self.state.lock().drop_session(session)
    }

    /// The session that owns an ephemeral key, if any.
    pub fn session_of(&self, key: &str) -> Option<SessionId> {
        self.state.lock().entries.get(key).and_then(|e| e.session)
    }

    /// Remove a single key, as an operator deleting a definition would.
    pub fn delete(&self, key: &str) -> bool {
        let mut state = self.state.lock();
        let removed = state.entries.remove(key).is_some();
        if removed {
            state.commit(&[key.to_string()]);
        }
        removed
    }

    pub fn revision(&self) -> Revision {
        self.state.lock().revision
    }
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationBackend for InMemoryBackend {
    async fn grant_session(&self, _ttl_secs: i64) -> Result<SessionId> {
        let mut state = self.state.lock();
        let session = state.next_session;
        state.next_session += 1;
        state.sessions.insert(session);
        Ok(session)
    }

    async fn keep_session_alive(
        &self,
        session: SessionId,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Result<()> {
        loop {
            if !self.state.lock().sessions.contains(&session) {
                return Err(Error::SessionLost);
            }
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }

    async fn revoke_session(&self, session: SessionId) -> Result<()> {
        self.state.lock().drop_session(session);
        Ok(())
    }

    async fn create_ephemeral(
        &self,
        key: &str,
        value: Vec<u8>,
        session: SessionId,
    ) -> Result<bool> {
        let mut state = self.state.lock();
        if !state.sessions.contains(&session) {
            return Err(Error::SessionLost);
        }
        if state.entries.contains_key(key) {
            return Ok(false);
        }
        state.entries.insert(
            key.to_string(),
            Entry {
                value,
                session: Some(session),
            },
        );
        state.commit(&[key.to_string()]);
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.state.lock().entries.get(key).map(|e| e.value.clone()))
    }

    async fn snapshot(&self, prefix: &str) -> Result<Snapshot> {
        let state = self.state.lock();
        let entries = state
            .entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, e)| KeyValue {
                key: k.clone(),
                value: e.value.clone(),
            })
            .collect();
        Ok(Snapshot {
            revision: state.revision,
            entries,
        })
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        let mut state = self.state.lock();
        state.entries.insert(
            key.to_string(),
            Entry {
                value,
                session: None,
            },
        );
        state.commit(&[key.to_string()]);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<()> {
        let mut state = self.state.lock();
        let keys: Vec<String> = state
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        for key in &keys {
            state.entries.remove(key);
        }
        if !keys.is_empty() {
            state.commit(&keys);
        }
        Ok(())
    }

    async fn put_guarded(
        &self,
        guard_key: &str,
        guard: &[u8],
        key: &str,
        value: Vec<u8>,
    ) -> Result<GuardedPut> {
        let mut state = self.state.lock();
        if let Some(current) = state.entries.get(guard_key) {
            if current.value.as_slice() > guard {
                return Ok(GuardedPut::Rejected {
                    current_guard: current.value.clone(),
                });
            }
        }
        state.entries.insert(
            guard_key.to_string(),
            Entry {
                value: guard.to_vec(),
                session: None,
            },
        );
        state.entries.insert(
            key.to_string(),
            Entry {
                value,
                session: None,
            },
        );
        state.commit(&[guard_key.to_string(), key.to_string()]);
        Ok(GuardedPut::Applied)
    }

    async fn watch(&self, prefix: &str) -> Result<ChangeStream> {
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_SIZE);
        self.state.lock().watchers.push(Watcher {
            prefix: prefix.to_string(),
            tx,
        });
        Ok(ChangeStream::new(rx))
    }
}
