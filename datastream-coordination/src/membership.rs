use std::sync::Arc;
use std::time::Duration;

use assignment_coordination::backend::{
    self, ChangeStream, CoordinationBackend, SessionId, Snapshot,
};
use assignment_coordination::subscription::Subscription;
use assignment_coordination::util::{self, Backoff};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::keys::{Keyspace, StoreKey};
use crate::metrics_consts::{REREGISTRATIONS, SESSION_LOSSES, WATCH_RESTARTS};
use crate::types::{Epoch, LiveSet, RegisteredWorker, WorkerId};

#[derive(Debug, Clone)]
pub struct MembershipConfig {
    /// Seconds a registration survives without a keepalive.
    pub session_ttl: i64,
    pub keepalive_interval: Duration,
    /// Membership changes arriving within this window are published once.
    pub debounce_interval: Duration,
    /// Delay schedule for re-registering after a lost session.
    pub reregister_backoff: Backoff,
}

impl Default for MembershipConfig {
    fn default() -> Self {
        Self {
            session_ttl: 30,
            keepalive_interval: Duration::from_secs(10),
            debounce_interval: Duration::from_millis(250),
            reregister_backoff: Backoff::default(),
        }
    }
}

/// Proof of a live registration: the worker's entry exists and is bound to
/// `session`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationHandle {
    pub worker_id: WorkerId,
    pub session: SessionId,
}

/// Tracks live workers through ephemeral entries under `{prefix}workers/`.
pub struct MembershipRegistry {
    backend: Arc<dyn CoordinationBackend>,
    keys: Keyspace,
    config: MembershipConfig,
}

impl MembershipRegistry {
    pub fn new(
        backend: Arc<dyn CoordinationBackend>,
        keys: Keyspace,
        config: MembershipConfig,
    ) -> Self {
        Self {
            backend,
            keys,
            config,
        }
    }

    /// Create this worker's ephemeral entry. Fails with
    /// [`Error::Registration`] if the identity is already live.
    pub async fn register(&self, worker_id: &WorkerId) -> Result<RegistrationHandle> {
        register_worker(
            self.backend.as_ref(),
            &self.keys,
            self.config.session_ttl,
            worker_id,
        )
        .await
    }

    /// Remove the entry right away instead of waiting for the session to expire.
    pub async fn deregister(&self, registration: &RegistrationHandle) -> Result<()> {
        self.backend.revoke_session(registration.session).await?;
        Ok(())
    }

    pub async fn current_members(&self) -> Result<LiveSet> {
        read_live_set(self.backend.as_ref(), &self.keys).await
    }

    /// Observe membership without owning a registration.
    pub async fn watch(&self, cancel: CancellationToken) -> Result<Subscription<LiveSet>> {
        self.start_watch(None, cancel).await
    }

    /// Observe membership while keeping `registration` alive.
    ///
    /// If the session is lost, publishes a view without any workers, then
    /// re-registers with exponential backoff until it succeeds or `cancel`
    /// fires. Cancelling also revokes the session.
    pub async fn watch_as(
        &self,
        registration: RegistrationHandle,
        cancel: CancellationToken,
    ) -> Result<Subscription<LiveSet>> {
        self.start_watch(Some(registration), cancel).await
    }

    async fn start_watch(
        &self,
        registration: Option<RegistrationHandle>,
        cancel: CancellationToken,
    ) -> Result<Subscription<LiveSet>> {
        // Watch before reading so no change between the two is missed
        let stream = self
            .backend
            .watch(&self.keys.key(StoreKey::WorkersPrefix))
            .await?;
        let initial = self.current_members().await?;
        let (tx, rx) = watch::channel(initial);

        let watch_loop = MembershipWatchLoop {
            backend: Arc::clone(&self.backend),
            keys: self.keys.clone(),
            config: self.config.clone(),
            tx,
            registration,
        };
        let task = tokio::spawn(watch_loop.run(stream, cancel));
        Ok(Subscription::new(rx, task))
    }
}

struct MembershipWatchLoop {
    backend: Arc<dyn CoordinationBackend>,
    keys: Keyspace,
    config: MembershipConfig,
    tx: watch::Sender<LiveSet>,
    registration: Option<RegistrationHandle>,
}

impl MembershipWatchLoop {
    async fn run(mut self, mut stream: ChangeStream, cancel: CancellationToken) {
        let mut keepalive = self.spawn_keepalive(&cancel);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = wait_for_exit(&mut keepalive) => {
                    keepalive = None;
                    if cancel.is_cancelled() {
                        break;
                    }
                    self.on_session_lost(result);
                    if !self.reregister(&cancel).await {
                        break;
                    }
                    keepalive = self.spawn_keepalive(&cancel);
                    self.refresh(&cancel).await;
                }
                changed = util::next_debounced_change(&mut stream, self.config.debounce_interval, &cancel) => {
                    match changed {
                        Ok(true) => self.refresh(&cancel).await,
                        Ok(false) => break,
                        Err(e) => {
                            tracing::warn!(error = %e, "membership watch failed, re-establishing");
                            metrics::counter!(WATCH_RESTARTS, "watch" => "membership").increment(1);
                            let prefix = self.keys.key(StoreKey::WorkersPrefix);
                            let backoff = self.config.reregister_backoff;
                            match util::rewatch(self.backend.as_ref(), &prefix, backoff, &cancel).await {
                                Some(s) => stream = s,
                                None => break,
                            }
                            self.refresh(&cancel).await;
                        }
                    }
                }
            }
        }

        if let Some(handle) = keepalive {
            drop(handle.await);
        }
        if let Some(registration) = &self.registration {
            drop(self.backend.revoke_session(registration.session).await);
            tracing::info!(worker = %registration.worker_id, "deregistered");
        }
    }

    fn spawn_keepalive(&self, cancel: &CancellationToken) -> Option<JoinHandle<Result<()>>> {
        let registration = self.registration.as_ref()?;
        let backend = Arc::clone(&self.backend);
        let session = registration.session;
        let interval = self.config.keepalive_interval;
        let token = cancel.child_token();
        Some(tokio::spawn(async move {
            backend
                .keep_session_alive(session, interval, token)
                .await
                .map_err(Error::from)
        }))
    }

    fn on_session_lost(&self, result: Result<()>) {
        let worker = self
            .registration
            .as_ref()
            .map(|r| r.worker_id.to_string())
            .unwrap_or_default();
        match result {
            Err(e) => tracing::warn!(worker = %worker, error = %e, "session lost, treating self as unassigned"),
            Ok(()) => tracing::warn!(worker = %worker, "keepalive ended, treating self as unassigned"),
        }
        metrics::counter!(SESSION_LOSSES).increment(1);

        let epoch = self.tx.borrow().epoch;
        self.publish(LiveSet {
            epoch,
            workers: Default::default(),
        });
    }

    /// Returns `false` if cancelled before re-registration succeeded.
    async fn reregister(&mut self, cancel: &CancellationToken) -> bool {
        let Some(previous) = self.registration.clone() else {
            return true;
        };
        // Best effort: if the old session is still alive server-side, this
        // frees the identity immediately
        drop(self.backend.revoke_session(previous.session).await);

        let backoff = self.config.reregister_backoff;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let delay = backoff.delay_for_attempt(attempt);
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }

            match register_worker(
                self.backend.as_ref(),
                &self.keys,
                self.config.session_ttl,
                &previous.worker_id,
            )
            .await
            {
                Ok(handle) => {
                    tracing::info!(worker = %handle.worker_id, attempt, "re-registered after session loss");
                    metrics::counter!(REREGISTRATIONS).increment(1);
                    self.registration = Some(handle);
                    return true;
                }
                Err(e) => {
                    tracing::warn!(
                        worker = %previous.worker_id,
                        attempt,
                        error = %e,
                        "re-registration failed, retrying"
                    );
                }
            }
        }
    }

    /// Read and publish the current live set, retrying until it succeeds.
    async fn refresh(&self, cancel: &CancellationToken) {
        let backoff = self.config.reregister_backoff;
        let mut attempt = 0u32;
        loop {
            match read_live_set(self.backend.as_ref(), &self.keys).await {
                Ok(live) => {
                    self.publish(live);
                    return;
                }
                Err(e) => {
                    attempt += 1;
                    tracing::warn!(attempt, error = %e, "failed to read membership");
                }
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(backoff.delay_for_attempt(attempt)) => {}
            }
        }
    }

    /// Publish `view` unless it would move the epoch backwards.
    fn publish(&self, view: LiveSet) {
        self.tx.send_if_modified(|current| {
            if view.epoch < current.epoch || *current == view {
                return false;
            }
            tracing::debug!(epoch = %view.epoch, workers = view.workers.len(), "membership changed");
            *current = view;
            true
        });
    }
}

async fn wait_for_exit(handle: &mut Option<JoinHandle<Result<()>>>) -> Result<()> {
    match handle {
        Some(h) => match h.await {
            Ok(result) => result,
            Err(e) => Err(Error::invalid_state(format!("keepalive panicked: {e}"))),
        },
        None => std::future::pending().await,
    }
}

async fn register_worker(
    backend: &dyn CoordinationBackend,
    keys: &Keyspace,
    session_ttl: i64,
    worker_id: &WorkerId,
) -> Result<RegistrationHandle> {
    let session = backend.grant_session(session_ttl).await?;
    let entry = RegisteredWorker {
        worker_id: worker_id.clone(),
        session_id: session,
        registered_at: util::now_seconds(),
    };
    let created = backend
        .create_ephemeral(
            &keys.key(StoreKey::Worker(worker_id)),
            backend::to_json(&entry)?,
            session,
        )
        .await?;

    if !created {
        drop(backend.revoke_session(session).await);
        return Err(Error::Registration(worker_id.clone()));
    }

    tracing::info!(worker = %worker_id, session, "registered");
    Ok(RegistrationHandle {
        worker_id: worker_id.clone(),
        session,
    })
}

async fn read_live_set(backend: &dyn CoordinationBackend, keys: &Keyspace) -> Result<LiveSet> {
    let snapshot = backend.snapshot(&keys.key(StoreKey::WorkersPrefix)).await?;
    Ok(live_set_from(&snapshot, keys))
}

/// Registered workers in `snapshot`, stamped with its revision. Entries
/// outside `{prefix}workers/` are ignored.
pub(crate) fn live_set_from(snapshot: &Snapshot, keys: &Keyspace) -> LiveSet {
    let prefix = keys.key(StoreKey::WorkersPrefix);
    let workers = snapshot
        .names(&prefix)
        .filter_map(|name| match WorkerId::new(name) {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!(key = name, error = %e, "ignoring malformed worker entry");
                None
            }
        })
        .collect();
    LiveSet {
        epoch: Epoch::from_revision(snapshot.revision),
        workers,
    }
}
