#![allow(dead_code)]

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use assignment_coordination::backend::{self, CoordinationBackend};
use assignment_coordination::memory::InMemoryBackend;
use assignment_coordination::util::Backoff;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use datastream_coordination::connector::{
    Connector, ConnectorBindings, ConnectorError, EventSink, NoopEventSink,
};
use datastream_coordination::coordinator::{Coordinator, CoordinatorConfig};
use datastream_coordination::error::Result;
use datastream_coordination::keys::{Keyspace, StoreKey};
use datastream_coordination::membership::MembershipConfig;
use datastream_coordination::reconciler::ReconcilerConfig;
use datastream_coordination::strategy::AssignmentStrategy;
use datastream_coordination::types::{
    AssignmentTable, StreamDefinition, Task, WorkerId, WorkerState, WorkerStatus,
};

pub const CONNECTOR_TYPE: &str = "mock";
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);
pub const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub fn test_cluster() -> (Arc<InMemoryBackend>, Keyspace) {
    let prefix = format!("/test-{}/", uuid::Uuid::new_v4());
    (Arc::new(InMemoryBackend::new()), Keyspace::new(prefix))
}

pub async fn wait_for_condition<F, Fut>(timeout: Duration, interval: Duration, f: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if f().await {
            return;
        }
        tokio::time::sleep(interval).await;
    }
    panic!("condition not met within {timeout:?}");
}

/// [`wait_for_condition`] for checks that need no awaiting.
pub async fn wait_until<F>(f: F)
where
    F: Fn() -> bool,
{
    wait_for_condition(WAIT_TIMEOUT, POLL_INTERVAL, || {
        let met = f();
        async move { met }
    })
    .await;
}

// ── Store helpers ───────────────────────────────────────────────

pub async fn put_stream(backend: &InMemoryBackend, keys: &Keyspace, definition: &StreamDefinition) {
    backend
        .put(
            &keys.key(StoreKey::Stream(&definition.name)),
            backend::to_json(definition).expect("definition should serialize"),
        )
        .await
        .expect("put stream");
}

pub async fn put_streams(backend: &InMemoryBackend, keys: &Keyspace, names: &[&str], partitions: u32) {
    for name in names {
        put_stream(
            backend,
            keys,
            &StreamDefinition::new(name, CONNECTOR_TYPE).with_partitions(partitions),
        )
        .await;
    }
}

pub async fn read_table(backend: &InMemoryBackend, keys: &Keyspace) -> AssignmentTable {
    match backend
        .get(&keys.key(StoreKey::AssignmentTable))
        .await
        .expect("get table")
    {
        Some(bytes) => backend::from_json(&bytes).expect("table should parse"),
        None => AssignmentTable::default(),
    }
}

pub fn session_of(backend: &InMemoryBackend, keys: &Keyspace, worker: &str) -> Option<i64> {
    let id = WorkerId::new(worker).expect("valid worker id");
    backend.session_of(&keys.key(StoreKey::Worker(&id)))
}

// ── Mock connector ──────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorEvent {
    Started(Task),
    StartFailed(Task),
    Stopped(Task),
}

#[derive(Debug, Clone, Default)]
pub struct MockBehavior {
    /// `stop` never returns.
    pub hang_on_stop: bool,
    /// Every `start` fails.
    pub fail_start: bool,
    /// Every `start` takes this long before finishing.
    pub start_delay: Option<Duration>,
}

pub struct MockConnector {
    events: Arc<Mutex<Vec<ConnectorEvent>>>,
    behavior: MockBehavior,
}

impl MockConnector {
    pub fn new(behavior: MockBehavior) -> (Self, Arc<Mutex<Vec<ConnectorEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        (
            Self {
                events: events.clone(),
                behavior,
            },
            events,
        )
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn start(
        &self,
        task: &Task,
        _definition: &StreamDefinition,
        _sink: Arc<dyn EventSink>,
    ) -> std::result::Result<(), ConnectorError> {
        if let Some(delay) = self.behavior.start_delay {
            tokio::time::sleep(delay).await;
        }
        if self.behavior.fail_start {
            self.events
                .lock()
                .await
                .push(ConnectorEvent::StartFailed(task.clone()));
            return Err(ConnectorError::new("mock start failure"));
        }
        self.events
            .lock()
            .await
            .push(ConnectorEvent::Started(task.clone()));
        Ok(())
    }

    async fn stop(&self, task: &Task) -> std::result::Result<(), ConnectorError> {
        self.events
            .lock()
            .await
            .push(ConnectorEvent::Stopped(task.clone()));
        if self.behavior.hang_on_stop {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

// ── Worker builders ─────────────────────────────────────────────

pub fn fast_config() -> CoordinatorConfig {
    let backoff = Backoff::new(Duration::from_millis(20), Duration::from_millis(200));
    CoordinatorConfig {
        membership: MembershipConfig {
            session_ttl: 10,
            keepalive_interval: Duration::from_millis(20),
            debounce_interval: Duration::from_millis(20),
            reregister_backoff: backoff,
        },
        rebalance_debounce_interval: Duration::from_millis(20),
        retry_backoff: backoff,
        reconciler: ReconcilerConfig {
            stop_timeout: Duration::from_millis(300),
            start_timeout: Duration::from_secs(1),
            start_attempts: 2,
            start_backoff: Backoff::new(Duration::from_millis(5), Duration::from_millis(20)),
        },
        publish_retry_interval: Duration::from_millis(100),
        max_stale_write_retries: 5,
    }
}

pub struct WorkerHandle {
    pub id: WorkerId,
    pub coordinator: Arc<Coordinator>,
    pub events: Arc<Mutex<Vec<ConnectorEvent>>>,
    pub cancel: CancellationToken,
    pub join: JoinHandle<Result<()>>,
}

impl WorkerHandle {
    pub fn status(&self) -> WorkerStatus {
        self.coordinator.status()
    }

    pub fn running(&self) -> BTreeSet<Task> {
        self.status().running
    }

    pub fn state(&self) -> WorkerState {
        self.status().state
    }

    pub async fn starts_of(&self, task: &Task) -> usize {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| **e == ConnectorEvent::Started(task.clone()))
            .count()
    }

    /// Successful and failed `start` calls for `task`.
    pub async fn start_attempts_of(&self, task: &Task) -> usize {
        self.events
            .lock()
            .await
            .iter()
            .filter(|e| match e {
                ConnectorEvent::Started(t) | ConnectorEvent::StartFailed(t) => t == task,
                ConnectorEvent::Stopped(_) => false,
            })
            .count()
    }

    pub async fn stop(self) -> Result<()> {
        self.cancel.cancel();
        self.join.await.expect("worker task panicked")
    }
}

pub fn start_worker(
    backend: Arc<InMemoryBackend>,
    keys: &Keyspace,
    name: &str,
    strategy: Arc<dyn AssignmentStrategy>,
) -> WorkerHandle {
    start_worker_with(
        backend,
        keys,
        name,
        strategy,
        MockBehavior::default(),
        fast_config(),
    )
}

pub fn start_worker_with(
    backend: Arc<InMemoryBackend>,
    keys: &Keyspace,
    name: &str,
    strategy: Arc<dyn AssignmentStrategy>,
    behavior: MockBehavior,
    config: CoordinatorConfig,
) -> WorkerHandle {
    let id = WorkerId::new(name).expect("valid worker id");
    let (connector, events) = MockConnector::new(behavior);
    let bindings = ConnectorBindings::new().bind(CONNECTOR_TYPE, Arc::new(connector), strategy);
    let coordinator = Arc::new(Coordinator::new(
        backend,
        keys.clone(),
        id.clone(),
        bindings,
        Arc::new(NoopEventSink),
        config,
    ));

    let cancel = CancellationToken::new();
    let join = tokio::spawn({
        let coordinator = Arc::clone(&coordinator);
        let token = cancel.clone();
        async move { coordinator.run(token).await }
    });

    WorkerHandle {
        id,
        coordinator,
        events,
        cancel,
        join,
    }
}

/// All tasks `workers` run, with one entry per running copy.
pub fn running_copies(workers: &[&WorkerHandle]) -> Vec<Task> {
    let mut all: Vec<Task> = workers.iter().flat_map(|w| w.running()).collect();
    all.sort();
    all
}

pub fn tasks_of(streams: &[&str], partitions: u32) -> Vec<Task> {
    let mut tasks: Vec<Task> = streams
        .iter()
        .flat_map(|s| (0..partitions).map(move |p| Task::new(s, p)))
        .collect();
    tasks.sort();
    tasks
}
