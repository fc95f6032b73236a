use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Identity of one worker process. Created at startup and valid only while
/// the worker's registration entry is live.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        assignment_coordination::util::validate_identifier(&id)?;
        Ok(Self(id))
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Version stamp over the observed membership and stream state.
///
/// Taken from the coordination service's revision at read time, so it only
/// moves forward and is comparable across workers.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Epoch(pub u64);

impl Epoch {
    pub fn from_revision(revision: i64) -> Self {
        Self(u64::try_from(revision).unwrap_or_default())
    }

    /// Fixed-width encoding whose byte order matches numeric order.
    pub fn to_guard(self) -> String {
        format!("{:020}", self.0)
    }

    pub fn from_guard(bytes: &[u8]) -> Option<Self> {
        std::str::from_utf8(bytes).ok()?.parse().ok().map(Self)
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A configured stream, stored under `{prefix}streams/{name}`.
///
/// Owned by the external configuration store; the coordinator only reads it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamDefinition {
    pub name: String,
    pub connector_type: String,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub destination: String,
    #[serde(default)]
    pub status: StreamStatus,
    /// Number of tasks the stream is split into.
    #[serde(default = "default_partitions")]
    pub partitions: u32,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

fn default_partitions() -> u32 {
    1
}

impl StreamDefinition {
    pub fn new(name: &str, connector_type: &str) -> Self {
        Self {
            name: name.to_string(),
            connector_type: connector_type.to_string(),
            source: String::new(),
            destination: String::new(),
            status: StreamStatus::Active,
            partitions: 1,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_partitions(mut self, partitions: u32) -> Self {
        self.partitions = partitions;
        self
    }

    /// Tasks derived from this stream. Only active streams produce work.
    pub fn tasks(&self) -> Vec<Task> {
        if self.status != StreamStatus::Active {
            return Vec::new();
        }
        (0..self.partitions.max(1))
            .map(|partition| Task::new(&self.name, partition))
            .collect()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamStatus {
    #[default]
    Active,
    Paused,
    Deleted,
}

/// One assignable unit of work: a partition of a stream.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Task {
    pub stream: String,
    pub partition: u32,
}

impl Task {
    pub fn new(stream: &str, partition: u32) -> Self {
        Self {
            stream: stream.to_string(),
            partition,
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.stream, self.partition)
    }
}

/// Which worker runs which tasks, stored under `{prefix}assignment/table`.
///
/// Every live worker has an entry (possibly empty). Tasks only land in
/// `unassigned` when there are no workers at all.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssignmentTable {
    pub epoch: Epoch,
    pub assignments: BTreeMap<WorkerId, BTreeSet<Task>>,
    #[serde(default)]
    pub unassigned: BTreeSet<Task>,
}

impl AssignmentTable {
    pub fn with_epoch(mut self, epoch: Epoch) -> Self {
        self.epoch = epoch;
        self
    }

    pub fn tasks_for(&self, worker: &WorkerId) -> BTreeSet<Task> {
        self.assignments.get(worker).cloned().unwrap_or_default()
    }

    pub fn owners_of<'a>(&'a self, task: &'a Task) -> impl Iterator<Item = &'a WorkerId> + 'a {
        self.assignments
            .iter()
            .filter(move |(_, tasks)| tasks.contains(task))
            .map(|(worker, _)| worker)
    }

    /// Fold another table's assignments into this one. Epochs are left alone.
    pub fn merge(&mut self, other: AssignmentTable) {
        for (worker, tasks) in other.assignments {
            self.assignments.entry(worker).or_default().extend(tasks);
        }
        self.unassigned.extend(other.unassigned);
    }

    pub fn assigned_count(&self) -> usize {
        self.assignments.values().map(BTreeSet::len).sum()
    }
}

/// One worker's share of the stored table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OwnAssignment {
    pub epoch: Epoch,
    pub tasks: BTreeSet<Task>,
}

/// Membership snapshot: live workers as of `epoch`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveSet {
    pub epoch: Epoch,
    pub workers: BTreeSet<WorkerId>,
}

impl LiveSet {
    pub fn contains(&self, worker: &WorkerId) -> bool {
        self.workers.contains(worker)
    }
}

/// Full stream-definition snapshot as of `epoch`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamSet {
    pub epoch: Epoch,
    pub streams: BTreeMap<String, StreamDefinition>,
}

/// Registration entry stored under `{prefix}workers/{worker_id}`, bound to
/// the worker's session so it vanishes when the worker dies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredWorker {
    pub worker_id: WorkerId,
    pub session_id: i64,
    pub registered_at: i64,
}

/// Coordinator lifecycle:
/// `Starting -> Active <-> Degraded -> ShuttingDown -> Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Active,
    /// Session lost; no local tasks run until re-registration succeeds.
    Degraded,
    ShuttingDown,
    Stopped,
}

impl WorkerState {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::Starting => "starting",
            WorkerState::Active => "active",
            WorkerState::Degraded => "degraded",
            WorkerState::ShuttingDown => "shutting_down",
            WorkerState::Stopped => "stopped",
        }
    }
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Externally observable state of one worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerStatus {
    pub state: WorkerState,
    /// Epoch of the last assignment this worker reconciled against.
    pub epoch: Epoch,
    pub running: BTreeSet<Task>,
    /// Tasks assigned here that could not be started, with the last error.
    pub failed: BTreeMap<Task, String>,
}

impl Default for WorkerStatus {
    fn default() -> Self {
        Self {
            state: WorkerState::Starting,
            epoch: Epoch::default(),
            running: BTreeSet::new(),
            failed: BTreeMap::new(),
        }
    }
}
