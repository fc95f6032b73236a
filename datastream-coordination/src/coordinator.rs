use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use assignment_coordination::backend::CoordinationBackend;
use assignment_coordination::subscription::Subscription;
use assignment_coordination::util::Backoff;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::assignment_store::AssignmentStore;
use crate::cluster_view::ClusterView;
use crate::connector::{ConnectorBindings, EventSink};
use crate::error::{Error, Result};
use crate::keys::Keyspace;
use crate::membership::{MembershipConfig, MembershipRegistry, RegistrationHandle};
use crate::metrics_consts::{LIVE_WORKERS, REBALANCES, STALE_WRITES, STATE_TRANSITIONS};
use crate::reconciler::{ReconcileReport, Reconciler, ReconcilerConfig};
use crate::stream_watcher::StreamRegistryWatcher;
use crate::types::{
    AssignmentTable, Epoch, LiveSet, OwnAssignment, StreamDefinition, StreamSet, Task, WorkerId,
    WorkerState, WorkerStatus,
};

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub membership: MembershipConfig,
    /// How long to wait after the first stream event before recomputing, to
    /// batch bursts of definition changes into a single rebalance.
    pub rebalance_debounce_interval: Duration,
    /// Backoff for re-establishing broken watches and for startup
    /// registration against an unreachable store.
    pub retry_backoff: Backoff,
    pub reconciler: ReconcilerConfig,
    /// Delay before retrying a rebalance whose publish failed for reasons
    /// other than a stale epoch.
    pub publish_retry_interval: Duration,
    /// Immediate recomputations after a stale write before falling back to
    /// `publish_retry_interval`.
    pub max_stale_write_retries: u32,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            membership: MembershipConfig::default(),
            rebalance_debounce_interval: Duration::from_millis(250),
            retry_backoff: Backoff::default(),
            reconciler: ReconcilerConfig::default(),
            publish_retry_interval: Duration::from_secs(1),
            max_stale_write_retries: 5,
        }
    }
}

/// One worker's view of the cluster.
///
/// There is no leader: every worker recomputes the whole table from the same
/// observed state, publishes it, and runs its own share. Workers agree
/// because strategies are deterministic and every write carries the epoch it
/// was computed from.
pub struct Coordinator {
    worker_id: WorkerId,
    backend: Arc<dyn CoordinationBackend>,
    keys: Keyspace,
    membership: MembershipRegistry,
    streams: StreamRegistryWatcher,
    store: AssignmentStore,
    bindings: Arc<ConnectorBindings>,
    sink: Arc<dyn EventSink>,
    config: CoordinatorConfig,
    status: watch::Sender<WorkerStatus>,
}

/// Mutable state owned by a single `run` call.
struct LocalState {
    reconciler: Reconciler,
    retry_at: Option<Instant>,
    /// Epoch of the table the running tasks were last reconciled against.
    reconciled_epoch: Epoch,
    /// Our share of that table. Empty after an interrupted pass.
    reconciled_tasks: BTreeSet<Task>,
}

struct Subscriptions {
    live: Subscription<LiveSet>,
    streams: Subscription<StreamSet>,
    assigned: Subscription<OwnAssignment>,
}

impl LocalState {
    fn mark_reconciled(&mut self, epoch: Epoch, tasks: BTreeSet<Task>, report: &ReconcileReport) {
        self.reconciled_epoch = epoch;
        self.reconciled_tasks = if report.interrupted.is_empty() {
            tasks
        } else {
            BTreeSet::new()
        };
    }
}

impl Subscriptions {
    async fn close(self) {
        self.live.close().await;
        self.streams.close().await;
        self.assigned.close().await;
    }
}

/// What woke the event loop.
enum Wake {
    Inputs,
    Stored,
}

enum PublishOutcome {
    Published(AssignmentTable, StreamSet),
    Superseded,
    Deferred,
    NotMember,
}

impl Coordinator {
    pub fn new(
        backend: Arc<dyn CoordinationBackend>,
        keys: Keyspace,
        worker_id: WorkerId,
        bindings: ConnectorBindings,
        sink: Arc<dyn EventSink>,
        config: CoordinatorConfig,
    ) -> Self {
        let membership =
            MembershipRegistry::new(Arc::clone(&backend), keys.clone(), config.membership.clone());
        let streams = StreamRegistryWatcher::new(
            Arc::clone(&backend),
            keys.clone(),
            config.rebalance_debounce_interval,
            config.retry_backoff,
        );
        let store = AssignmentStore::new(
            Arc::clone(&backend),
            keys.clone(),
            config.rebalance_debounce_interval,
            config.retry_backoff,
        );
        let (status, _) = watch::channel(WorkerStatus::default());

        Self {
            worker_id,
            backend,
            keys,
            membership,
            streams,
            store,
            bindings: Arc::new(bindings),
            sink,
            config,
            status,
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    pub fn status(&self) -> WorkerStatus {
        self.status.borrow().clone()
    }

    /// Follow state, epoch, and local task changes as they happen.
    pub fn subscribe(&self) -> watch::Receiver<WorkerStatus> {
        self.status.subscribe()
    }

    /// Register, follow the cluster until `cancel` fires, then release
    /// everything.
    ///
    /// Only a duplicate live identity or a watch that dies underneath us ends
    /// the run with an error. Store outages, lost sessions, and connector
    /// failures are retried inside the loop.
    pub async fn run(&self, cancel: CancellationToken) -> Result<()> {
        self.transition(WorkerState::Starting);

        let registration = match self.register(&cancel).await {
            Ok(Some(registration)) => registration,
            Ok(None) => {
                self.transition(WorkerState::Stopped);
                return Ok(());
            }
            Err(e) => {
                tracing::error!(worker = %self.worker_id, error = %e, "registration failed");
                self.transition(WorkerState::Stopped);
                return Err(e);
            }
        };

        // Cancelling this token revokes the session, which deregisters us
        let session = cancel.child_token();
        let mut subs = match self.subscribe_all(registration, &session).await {
            Ok(subs) => subs,
            Err(e) => {
                session.cancel();
                self.transition(WorkerState::Stopped);
                return Err(e);
            }
        };

        let initial = subs.assigned.take();
        tracing::info!(
            worker = %self.worker_id,
            epoch = %initial.epoch,
            tasks = initial.tasks.len(),
            "read initial assignment"
        );

        let mut local = LocalState {
            reconciler: Reconciler::new(
                self.worker_id.clone(),
                Arc::clone(&self.bindings),
                Arc::clone(&self.sink),
                self.config.reconciler.clone(),
            ),
            retry_at: None,
            reconciled_epoch: Epoch::default(),
            reconciled_tasks: BTreeSet::new(),
        };

        self.transition(WorkerState::Active);
        self.apply_latest(&mut local, &mut subs, &cancel).await;

        let result = loop {
            let retry_at = local.retry_at;
            let wake = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Ok(()),
                changed = subs.live.changed() => changed.map(|()| Wake::Inputs),
                changed = subs.streams.changed() => changed.map(|()| Wake::Inputs),
                changed = subs.assigned.changed() => changed.map(|()| Wake::Stored),
                _ = tokio::time::sleep_until(retry_at.unwrap_or_else(Instant::now)), if retry_at.is_some() => {
                    tracing::debug!(worker = %self.worker_id, "retrying deferred rebalance");
                    Ok(Wake::Inputs)
                }
            };
            match wake {
                Ok(Wake::Inputs) => self.apply_latest(&mut local, &mut subs, &cancel).await,
                Ok(Wake::Stored) => self.follow_stored(&mut local, &mut subs, &cancel).await,
                // Watches end with the session token, a child of `cancel`
                Err(_) if cancel.is_cancelled() => break Ok(()),
                Err(e) => break Err(Error::from(e)),
            }
        };

        if let Err(e) = &result {
            tracing::error!(worker = %self.worker_id, error = %e, "watch ended unexpectedly, shutting down");
        }
        self.shutdown(local, session, subs).await;
        result
    }

    async fn register(&self, cancel: &CancellationToken) -> Result<Option<RegistrationHandle>> {
        let mut attempt = 0u32;
        loop {
            match self.membership.register(&self.worker_id).await {
                Ok(registration) => return Ok(Some(registration)),
                Err(e) if e.is_transient() => {
                    attempt += 1;
                    tracing::warn!(worker = %self.worker_id, attempt, error = %e, "registration failed, retrying");
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(None),
                        _ = tokio::time::sleep(self.config.retry_backoff.delay_for_attempt(attempt)) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn subscribe_all(
        &self,
        registration: RegistrationHandle,
        session: &CancellationToken,
    ) -> Result<Subscriptions> {
        let live = match self
            .membership
            .watch_as(registration.clone(), session.clone())
            .await
        {
            Ok(live) => live,
            Err(e) => {
                drop(self.membership.deregister(&registration).await);
                return Err(e);
            }
        };
        let streams = match self.streams.watch(session.clone()).await {
            Ok(streams) => streams,
            Err(e) => {
                session.cancel();
                live.close().await;
                return Err(e);
            }
        };
        match self
            .store
            .watch_self(self.worker_id.clone(), session.clone())
            .await
        {
            Ok(assigned) => Ok(Subscriptions {
                live,
                streams,
                assigned,
            }),
            Err(e) => {
                session.cancel();
                live.close().await;
                streams.close().await;
                Err(e)
            }
        }
    }

    /// Act on the newest membership and stream snapshots. Anything published
    /// while this runs is picked up by the next call.
    async fn apply_latest(
        &self,
        local: &mut LocalState,
        subs: &mut Subscriptions,
        cancel: &CancellationToken,
    ) {
        local.retry_at = None;
        let live_set = subs.live.take();
        subs.streams.take();
        metrics::gauge!(LIVE_WORKERS).set(live_set.workers.len() as f64);

        if !live_set.contains(&self.worker_id) {
            self.on_not_member(local, live_set.epoch).await;
            return;
        }

        if self.state() == WorkerState::Degraded {
            tracing::info!(worker = %self.worker_id, epoch = %live_set.epoch, "registration restored");
            self.transition(WorkerState::Active);
        }

        match self.rebalance(subs).await {
            PublishOutcome::Published(table, stream_set) => {
                // The table just stored is the stored table as of its epoch;
                // anything newer arrives through the assignment watch
                let mine = table.tasks_for(&self.worker_id);
                let desired = desired_tasks(mine.clone(), &stream_set.streams);
                let report = self.reconcile(local, &desired, subs, cancel).await;
                local.mark_reconciled(table.epoch, mine, &report);
                self.record_local(&local.reconciler, Some(table.epoch));
            }
            PublishOutcome::Superseded => {}
            PublishOutcome::Deferred => {
                local.retry_at = Some(Instant::now() + self.config.publish_retry_interval);
            }
            PublishOutcome::NotMember => {
                let epoch = subs.live.peek().epoch;
                self.on_not_member(local, epoch).await;
            }
        }
    }

    /// Another worker published a table at least as new as the one we last
    /// applied. Its assignment wins, so run our share of it.
    async fn follow_stored(
        &self,
        local: &mut LocalState,
        subs: &mut Subscriptions,
        cancel: &CancellationToken,
    ) {
        let own = subs.assigned.take();
        if self.state() != WorkerState::Active
            || cancel.is_cancelled()
            || !subs.live.peek().contains(&self.worker_id)
            || own.epoch < local.reconciled_epoch
        {
            return;
        }

        // Our own publish coming back, or a peer agreeing with it. Tasks that
        // already used up their start attempts wait for a real change.
        if own.tasks == local.reconciled_tasks {
            local.reconciled_epoch = own.epoch;
            self.record_local(&local.reconciler, Some(own.epoch));
            return;
        }

        let desired = desired_tasks(own.tasks.clone(), &subs.streams.peek().streams);
        tracing::debug!(
            worker = %self.worker_id,
            epoch = %own.epoch,
            tasks = desired.len(),
            "following stored assignment"
        );
        let report = self.reconcile(local, &desired, subs, cancel).await;
        local.mark_reconciled(own.epoch, own.tasks, &report);
        self.record_local(&local.reconciler, Some(own.epoch));
    }

    /// Run one reconciliation pass. Pending starts are abandoned as soon as
    /// `cancel` fires or this worker drops out of the live set, so neither
    /// waits behind slow connectors.
    async fn reconcile(
        &self,
        local: &mut LocalState,
        desired: &BTreeMap<Task, StreamDefinition>,
        subs: &Subscriptions,
        cancel: &CancellationToken,
    ) -> ReconcileReport {
        let interrupt = cancel.child_token();
        let mut live = subs.live.receiver();

        let pass = local.reconciler.reconcile(desired, &interrupt);
        tokio::pin!(pass);
        loop {
            tokio::select! {
                biased;
                report = &mut pass => return report,
                changed = live.changed(), if !interrupt.is_cancelled() => {
                    let member = changed.is_ok() && live.borrow_and_update().contains(&self.worker_id);
                    if !member {
                        tracing::info!(worker = %self.worker_id, "left the live set mid-reconcile, abandoning pending starts");
                        interrupt.cancel();
                    }
                }
            }
        }
    }

    async fn on_not_member(&self, local: &mut LocalState, epoch: Epoch) {
        if self.state() != WorkerState::Degraded {
            tracing::warn!(
                worker = %self.worker_id,
                epoch = %epoch,
                "not in live set, stopping local tasks until re-registered"
            );
            self.transition(WorkerState::Degraded);
        }
        let stopped = local.reconciler.stop_all().await;
        if !stopped.is_empty() {
            tracing::info!(worker = %self.worker_id, stopped = stopped.len(), "released tasks after session loss");
        }
        local.reconciled_tasks.clear();
        self.record_local(&local.reconciler, None);
    }

    /// Compute and publish a table from one consistent read of the cluster.
    /// A stale write means a newer table landed first, so read again and
    /// recompute right away.
    async fn rebalance(&self, subs: &Subscriptions) -> PublishOutcome {
        let mut attempt = 0u32;
        loop {
            attempt += 1;

            let view = match ClusterView::read(self.backend.as_ref(), &self.keys).await {
                Ok(view) => view,
                Err(e) => {
                    tracing::warn!(worker = %self.worker_id, error = %e, "failed to read cluster state");
                    metrics::counter!(REBALANCES, "outcome" => "failed").increment(1);
                    return PublishOutcome::Deferred;
                }
            };
            if !view.live.contains(&self.worker_id) {
                return PublishOutcome::NotMember;
            }

            let epoch = view.epoch;
            let table = compute_assignment(
                &self.bindings,
                &view.live.workers,
                &view.streams.streams,
                &view.stored,
            )
            .with_epoch(epoch);

            // Newer input already arrived; the next pass computes from it
            let observed = subs.live.peek().epoch.max(subs.streams.peek().epoch);
            if observed > epoch {
                tracing::debug!(
                    worker = %self.worker_id,
                    epoch = %epoch,
                    observed = %observed,
                    "discarding recomputation from superseded epoch"
                );
                metrics::counter!(REBALANCES, "outcome" => "superseded").increment(1);
                return PublishOutcome::Superseded;
            }

            match self.store.publish(&table).await {
                Ok(()) => {
                    tracing::info!(
                        worker = %self.worker_id,
                        epoch = %epoch,
                        workers = view.live.workers.len(),
                        assigned = table.assigned_count(),
                        mine = table.tasks_for(&self.worker_id).len(),
                        "published assignment"
                    );
                    metrics::counter!(REBALANCES, "outcome" => "published").increment(1);
                    return PublishOutcome::Published(table, view.streams);
                }
                Err(Error::StaleWrite(e)) => {
                    metrics::counter!(STALE_WRITES).increment(1);
                    if attempt > self.config.max_stale_write_retries {
                        tracing::warn!(worker = %self.worker_id, error = %e, attempt, "still stale after retries, deferring");
                        metrics::counter!(REBALANCES, "outcome" => "stale").increment(1);
                        return PublishOutcome::Deferred;
                    }
                    tracing::debug!(worker = %self.worker_id, error = %e, "lost publish race, recomputing");
                }
                Err(e) => {
                    tracing::warn!(worker = %self.worker_id, error = %e, "failed to publish assignment");
                    metrics::counter!(REBALANCES, "outcome" => "failed").increment(1);
                    return PublishOutcome::Deferred;
                }
            }
        }
    }

    async fn shutdown(&self, mut local: LocalState, session: CancellationToken, subs: Subscriptions) {
        self.transition(WorkerState::ShuttingDown);

        // Deregister before draining tasks
        session.cancel();
        subs.close().await;

        let stopped = local.reconciler.stop_all().await;
        tracing::info!(worker = %self.worker_id, stopped = stopped.len(), "stopped local tasks");
        self.record_local(&local.reconciler, None);
        self.transition(WorkerState::Stopped);
    }

    fn state(&self) -> WorkerState {
        self.status.borrow().state
    }

    fn transition(&self, to: WorkerState) {
        let from = self.state();
        if from == to {
            return;
        }
        tracing::info!(worker = %self.worker_id, from = %from, to = %to, "state transition");
        metrics::counter!(STATE_TRANSITIONS, "state" => to.as_str()).increment(1);
        self.status.send_modify(|status| status.state = to);
    }

    fn record_local(&self, reconciler: &Reconciler, epoch: Option<Epoch>) {
        let running = reconciler.running();
        let failed = reconciler.failed().clone();
        self.status.send_if_modified(|status| {
            let epoch = epoch.unwrap_or(status.epoch);
            if status.running == running && status.failed == failed && status.epoch == epoch {
                return false;
            }
            status.epoch = epoch;
            status.running = running;
            status.failed = failed;
            true
        });
    }
}

// ── Pure functions ──────────────────────────────────────────────

/// Full table for `workers`: the active streams' tasks grouped by connector
/// type, each group assigned by its bound strategy.
///
/// Streams of a type this worker has no binding for are left out. Every live
/// worker gets an entry, even if empty.
pub fn compute_assignment(
    bindings: &ConnectorBindings,
    workers: &BTreeSet<WorkerId>,
    streams: &BTreeMap<String, StreamDefinition>,
    previous: &AssignmentTable,
) -> AssignmentTable {
    let mut by_type: BTreeMap<&str, BTreeSet<Task>> = BTreeMap::new();
    for definition in streams.values() {
        if bindings.get(&definition.connector_type).is_none() {
            tracing::warn!(
                stream = %definition.name,
                connector_type = %definition.connector_type,
                "no connector bound for stream, leaving it out"
            );
            continue;
        }
        by_type
            .entry(definition.connector_type.as_str())
            .or_default()
            .extend(definition.tasks());
    }

    let mut table = AssignmentTable {
        assignments: workers.iter().map(|w| (w.clone(), BTreeSet::new())).collect(),
        ..Default::default()
    };
    for (connector_type, tasks) in by_type {
        if let Some(binding) = bindings.get(connector_type) {
            table.merge(binding.strategy.assign(workers, &tasks, previous));
        }
    }
    table
}

/// Pair each task with its stream's current definition, dropping tasks whose
/// stream is gone.
pub fn desired_tasks(
    tasks: BTreeSet<Task>,
    streams: &BTreeMap<String, StreamDefinition>,
) -> BTreeMap<Task, StreamDefinition> {
    tasks
        .into_iter()
        .filter_map(|task| {
            let definition = streams.get(&task.stream)?.clone();
            Some((task, definition))
        })
        .collect()
}
