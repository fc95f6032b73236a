use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Monotonic version of the whole keyspace. Bumped by every mutation.
pub type Revision = i64;

/// Liveness session that ephemeral keys are attached to (an etcd lease).
pub type SessionId = i64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: Vec<u8>,
}

/// Every key under a prefix, read at a single revision.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub revision: Revision,
    pub entries: Vec<KeyValue>,
}

impl Snapshot {
    /// Keys relative to `prefix`, in key order.
    pub fn names<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .iter()
            .filter_map(move |kv| kv.key.strip_prefix(prefix))
    }
}

/// Outcome of [`CoordinationBackend::put_guarded`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuardedPut {
    Applied,
    /// The stored guard was greater than the one supplied; nothing was written.
    Rejected { current_guard: Vec<u8> },
}

/// Primitives a coordination service has to offer: sessions with ephemeral
/// keys, prefix snapshots and watches, and a conditional write.
///
/// Implemented over etcd for production and in memory for tests.
#[async_trait]
pub trait CoordinationBackend: Send + Sync {
    async fn grant_session(&self, ttl_secs: i64) -> Result<SessionId>;

    /// Keep a session alive until `cancel` fires. Returns `Err(SessionLost)`
    /// as soon as the session can no longer be refreshed.
    async fn keep_session_alive(
        &self,
        session: SessionId,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Result<()>;

    /// Revoke a session, deleting every key attached to it.
    async fn revoke_session(&self, session: SessionId) -> Result<()>;

    /// Create `key` bound to `session`. Returns `false` without writing if
    /// the key already exists.
    async fn create_ephemeral(&self, key: &str, value: Vec<u8>, session: SessionId)
        -> Result<bool>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn snapshot(&self, prefix: &str) -> Result<Snapshot>;

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;

    async fn delete_prefix(&self, prefix: &str) -> Result<()>;

    /// Atomically write `guard` to `guard_key` and `value` to `key`, unless
    /// the stored guard compares greater (bytewise) than `guard`. A missing
    /// guard key never rejects.
    async fn put_guarded(
        &self,
        guard_key: &str,
        guard: &[u8],
        key: &str,
        value: Vec<u8>,
    ) -> Result<GuardedPut>;

    /// Watch every key under `prefix`. Yields the revision of each change.
    async fn watch(&self, prefix: &str) -> Result<ChangeStream>;
}

/// Stream of change revisions for a watched prefix.
///
/// Notifications may be coalesced when the consumer falls behind; callers
/// re-read a snapshot on every change rather than applying deltas.
pub struct ChangeStream {
    rx: mpsc::Receiver<Result<Revision>>,
}

impl ChangeStream {
    pub fn new(rx: mpsc::Receiver<Result<Revision>>) -> Self {
        Self { rx }
    }

    /// Next change revision, or `None` once the watch has ended.
    pub async fn message(&mut self) -> Result<Option<Revision>> {
        match self.rx.recv().await {
            Some(Ok(revision)) => Ok(Some(revision)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

// ── JSON helpers ─────────────────────────────────────────────

pub fn to_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(value)?)
}

pub fn from_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(Error::from)
}
