use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use assignment_coordination::util::Backoff;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::connector::{Connector, ConnectorBindings, EventSink};
use crate::error::Error;
use crate::metrics_consts::{FAILED_TASKS, RUNNING_TASKS, TASK_STARTS, TASK_STOPS, TASK_STOP_FAULTS};
use crate::types::{StreamDefinition, Task, WorkerId};

#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// Grace period for a single `stop` before the task is forcibly released.
    pub stop_timeout: Duration,
    /// Upper bound on a single `start` attempt.
    pub start_timeout: Duration,
    /// Attempts per task before it is reported as failed.
    pub start_attempts: u32,
    pub start_backoff: Backoff,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(10),
            start_timeout: Duration::from_secs(30),
            start_attempts: 3,
            start_backoff: Backoff::new(Duration::from_millis(200), Duration::from_secs(5)),
        }
    }
}

/// What one reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub started: Vec<Task>,
    pub stopped: Vec<Task>,
    pub failed: Vec<Task>,
    /// Starts abandoned because the pass was interrupted. Neither running
    /// nor failed; the next pass tries them again.
    pub interrupted: Vec<Task>,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        self.started.is_empty()
            && self.stopped.is_empty()
            && self.failed.is_empty()
            && self.interrupted.is_empty()
    }
}

struct RunningTask {
    connector: Arc<dyn Connector>,
    definition: StreamDefinition,
}

enum StopOutcome {
    Stopped,
    Failed(Error),
    TimedOut,
}

enum StartOutcome {
    Started,
    Failed(Error),
    Interrupted,
}

/// Drives this worker's connector instances towards a desired task set.
///
/// Starts and stops within a pass run concurrently; the pass returns once
/// every one of them has settled or timed out.
pub struct Reconciler {
    worker: WorkerId,
    bindings: Arc<ConnectorBindings>,
    sink: Arc<dyn EventSink>,
    config: ReconcilerConfig,
    running: BTreeMap<Task, RunningTask>,
    failed: BTreeMap<Task, String>,
}

impl Reconciler {
    pub fn new(
        worker: WorkerId,
        bindings: Arc<ConnectorBindings>,
        sink: Arc<dyn EventSink>,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            worker,
            bindings,
            sink,
            config,
            running: BTreeMap::new(),
            failed: BTreeMap::new(),
        }
    }

    pub fn running(&self) -> BTreeSet<Task> {
        self.running.keys().cloned().collect()
    }

    pub fn failed(&self) -> &BTreeMap<Task, String> {
        &self.failed
    }

    /// Stop tasks no longer in `desired`, restart tasks whose definition
    /// changed, and start the rest. Already-running tasks with an unchanged
    /// definition are left alone.
    ///
    /// Cancelling `interrupt` abandons starts still in progress, including
    /// their retries. Stops always run to completion or their grace period.
    pub async fn reconcile(
        &mut self,
        desired: &BTreeMap<Task, StreamDefinition>,
        interrupt: &CancellationToken,
    ) -> ReconcileReport {
        let to_stop: Vec<Task> = self
            .running
            .iter()
            .filter(|(task, running)| desired.get(*task) != Some(&running.definition))
            .map(|(task, _)| task.clone())
            .collect();

        let mut report = ReconcileReport {
            stopped: self.stop_tasks(to_stop).await,
            ..Default::default()
        };

        self.failed.retain(|task, _| desired.contains_key(task));

        let to_start: Vec<(&Task, &StreamDefinition)> = desired
            .iter()
            .filter(|(task, _)| !self.running.contains_key(*task))
            .collect();
        let (started, failed, interrupted) = self.start_tasks(to_start, interrupt).await;
        report.started = started;
        report.failed = failed;
        report.interrupted = interrupted;

        self.record_gauges();
        if !report.is_noop() {
            tracing::info!(
                worker = %self.worker,
                started = report.started.len(),
                stopped = report.stopped.len(),
                failed = report.failed.len(),
                interrupted = report.interrupted.len(),
                running = self.running.len(),
                "reconciled local tasks"
            );
        }
        report
    }

    /// Stop and release every running task.
    pub async fn stop_all(&mut self) -> Vec<Task> {
        let all: Vec<Task> = self.running.keys().cloned().collect();
        let stopped = self.stop_tasks(all).await;
        self.failed.clear();
        self.record_gauges();
        stopped
    }

    // ── Stopping ─────────────────────────────────────────────────

    async fn stop_tasks(&mut self, tasks: Vec<Task>) -> Vec<Task> {
        if tasks.is_empty() {
            return Vec::new();
        }

        // Released up front: whatever the connector does, these are no longer ours
        let work: Vec<(Task, Arc<dyn Connector>)> = tasks
            .into_iter()
            .filter_map(|task| {
                let running = self.running.remove(&task)?;
                Some((task, running.connector))
            })
            .collect();

        let grace = self.config.stop_timeout;
        let outcomes = join_all(
            work.iter()
                .map(|(task, connector)| stop_with_grace(connector.as_ref(), task, grace)),
        )
        .await;

        for ((task, _), outcome) in work.iter().zip(outcomes) {
            match outcome {
                StopOutcome::Stopped => {
                    tracing::debug!(worker = %self.worker, task = %task, "stopped task");
                    metrics::counter!(TASK_STOPS).increment(1);
                }
                StopOutcome::Failed(e) => {
                    tracing::warn!(worker = %self.worker, task = %task, error = %e, "task stop failed, released anyway");
                    metrics::counter!(TASK_STOP_FAULTS, "kind" => "error").increment(1);
                }
                StopOutcome::TimedOut => {
                    tracing::error!(
                        worker = %self.worker,
                        task = %task,
                        grace_ms = grace.as_millis() as u64,
                        "task did not stop within grace period, forcibly released"
                    );
                    metrics::counter!(TASK_STOP_FAULTS, "kind" => "timeout").increment(1);
                }
            }
        }

        work.into_iter().map(|(task, _)| task).collect()
    }

    // ── Starting ─────────────────────────────────────────────────

    async fn start_tasks(
        &mut self,
        tasks: Vec<(&Task, &StreamDefinition)>,
        interrupt: &CancellationToken,
    ) -> (Vec<Task>, Vec<Task>, Vec<Task>) {
        let mut started = Vec::new();
        let mut failed = Vec::new();
        let mut interrupted = Vec::new();
        if tasks.is_empty() {
            return (started, failed, interrupted);
        }

        let mut work = Vec::with_capacity(tasks.len());
        for (task, definition) in tasks {
            match self.bindings.get(&definition.connector_type) {
                Some(binding) => work.push((task, definition, Arc::clone(&binding.connector))),
                None => {
                    let reason = format!("no connector bound for type {}", definition.connector_type);
                    tracing::error!(worker = %self.worker, task = %task, reason = %reason, "cannot start task");
                    self.failed.insert(task.clone(), reason);
                    failed.push(task.clone());
                }
            }
        }

        let results = join_all(work.iter().map(|(task, definition, connector)| {
            start_with_retry(
                connector.as_ref(),
                task,
                definition,
                Arc::clone(&self.sink),
                &self.config,
                interrupt,
            )
        }))
        .await;

        for ((task, definition, connector), result) in work.into_iter().zip(results) {
            match result {
                StartOutcome::Started => {
                    tracing::debug!(worker = %self.worker, task = %task, "started task");
                    metrics::counter!(TASK_STARTS, "outcome" => "success").increment(1);
                    self.failed.remove(task);
                    self.running.insert(
                        task.clone(),
                        RunningTask {
                            connector,
                            definition: definition.clone(),
                        },
                    );
                    started.push(task.clone());
                }
                StartOutcome::Failed(e) => {
                    tracing::error!(
                        worker = %self.worker,
                        error = %e,
                        "giving up on task, leaving it unassigned locally"
                    );
                    metrics::counter!(TASK_STARTS, "outcome" => "failed").increment(1);
                    self.failed.insert(task.clone(), e.to_string());
                    failed.push(task.clone());
                }
                StartOutcome::Interrupted => {
                    tracing::debug!(worker = %self.worker, task = %task, "start interrupted");
                    metrics::counter!(TASK_STARTS, "outcome" => "interrupted").increment(1);
                    interrupted.push(task.clone());
                }
            }
        }

        (started, failed, interrupted)
    }

    fn record_gauges(&self) {
        metrics::gauge!(RUNNING_TASKS).set(self.running.len() as f64);
        metrics::gauge!(FAILED_TASKS).set(self.failed.len() as f64);
    }
}

// ── Pure functions ──────────────────────────────────────────────

async fn stop_with_grace(connector: &dyn Connector, task: &Task, grace: Duration) -> StopOutcome {
    match tokio::time::timeout(grace, connector.stop(task)).await {
        Ok(Ok(())) => StopOutcome::Stopped,
        Ok(Err(e)) => StopOutcome::Failed(Error::ConnectorStop {
            task: task.clone(),
            reason: e.to_string(),
        }),
        Err(_) => StopOutcome::TimedOut,
    }
}

async fn start_with_retry(
    connector: &dyn Connector,
    task: &Task,
    definition: &StreamDefinition,
    sink: Arc<dyn EventSink>,
    config: &ReconcilerConfig,
    interrupt: &CancellationToken,
) -> StartOutcome {
    let attempts = config.start_attempts.max(1);
    let mut reason = String::new();

    for attempt in 1..=attempts {
        let start = connector.start(task, definition, Arc::clone(&sink));
        tokio::select! {
            biased;
            _ = interrupt.cancelled() => return StartOutcome::Interrupted,
            result = tokio::time::timeout(config.start_timeout, start) => match result {
                Ok(Ok(())) => return StartOutcome::Started,
                Ok(Err(e)) => reason = e.to_string(),
                Err(_) => reason = format!("start timed out after {:?}", config.start_timeout),
            },
        }
        tracing::warn!(task = %task, attempt, attempts, reason = %reason, "task start attempt failed");

        if attempt < attempts {
            tokio::select! {
                biased;
                _ = interrupt.cancelled() => return StartOutcome::Interrupted,
                _ = tokio::time::sleep(config.start_backoff.delay_for_attempt(attempt)) => {}
            }
        }
    }

    StartOutcome::Failed(Error::ConnectorStart {
        task: task.clone(),
        reason,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;
    use crate::connector::{ConnectorError, NoopEventSink};
    use crate::strategy::BroadcastStrategy;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Start(Task),
        Stop(Task),
    }

    #[derive(Default)]
    struct RecordingConnector {
        calls: Mutex<Vec<Call>>,
        fail_starts: AtomicU32,
        hang_on_start: bool,
        hang_on_stop: bool,
    }

    #[async_trait]
    impl Connector for RecordingConnector {
        async fn start(
            &self,
            task: &Task,
            _definition: &StreamDefinition,
            _sink: Arc<dyn EventSink>,
        ) -> std::result::Result<(), ConnectorError> {
            self.calls.lock().push(Call::Start(task.clone()));
            if self.hang_on_start {
                std::future::pending::<()>().await;
            }
            let remaining = self.fail_starts.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_starts.store(remaining - 1, Ordering::SeqCst);
                return Err(ConnectorError::new("source unavailable"));
            }
            Ok(())
        }

        async fn stop(&self, task: &Task) -> std::result::Result<(), ConnectorError> {
            self.calls.lock().push(Call::Stop(task.clone()));
            if self.hang_on_stop {
                std::future::pending::<()>().await;
            }
            Ok(())
        }
    }

    fn reconciler(connector: Arc<RecordingConnector>, config: ReconcilerConfig) -> Reconciler {
        let bindings = ConnectorBindings::new().bind("test", connector, Arc::new(BroadcastStrategy));
        Reconciler::new(
            WorkerId::new("w-1").unwrap(),
            Arc::new(bindings),
            Arc::new(NoopEventSink),
            config,
        )
    }

    fn fast_config() -> ReconcilerConfig {
        ReconcilerConfig {
            stop_timeout: Duration::from_millis(50),
            start_timeout: Duration::from_millis(200),
            start_attempts: 3,
            start_backoff: Backoff::new(Duration::from_millis(1), Duration::from_millis(5)),
        }
    }

    fn desired(streams: &[&str]) -> BTreeMap<Task, StreamDefinition> {
        streams
            .iter()
            .map(|s| (Task::new(s, 0), StreamDefinition::new(s, "test")))
            .collect()
    }

    async fn reconcile(
        reconciler: &mut Reconciler,
        desired: &BTreeMap<Task, StreamDefinition>,
    ) -> ReconcileReport {
        reconciler.reconcile(desired, &CancellationToken::new()).await
    }

    fn starts(connector: &RecordingConnector) -> usize {
        connector
            .calls
            .lock()
            .iter()
            .filter(|c| matches!(c, Call::Start(_)))
            .count()
    }

    #[tokio::test]
    async fn identical_snapshot_is_a_noop() {
        let connector = Arc::new(RecordingConnector::default());
        let mut reconciler = reconciler(connector.clone(), fast_config());

        let first = reconcile(&mut reconciler, &desired(&["a", "b"])).await;
        assert_eq!(first.started.len(), 2);

        let second = reconcile(&mut reconciler, &desired(&["a", "b"])).await;
        assert!(second.is_noop());
        assert_eq!(starts(&connector), 2);
    }

    #[tokio::test]
    async fn revoked_tasks_are_stopped() {
        let connector = Arc::new(RecordingConnector::default());
        let mut reconciler = reconciler(connector.clone(), fast_config());

        reconcile(&mut reconciler, &desired(&["a", "b"])).await;
        let report = reconcile(&mut reconciler, &desired(&["b"])).await;

        assert_eq!(report.stopped, vec![Task::new("a", 0)]);
        assert!(report.started.is_empty());
        assert_eq!(reconciler.running(), BTreeSet::from([Task::new("b", 0)]));
    }

    #[tokio::test]
    async fn changed_definition_restarts_task() {
        let connector = Arc::new(RecordingConnector::default());
        let mut reconciler = reconciler(connector.clone(), fast_config());

        reconcile(&mut reconciler, &desired(&["a"])).await;
        let mut changed = desired(&["a"]);
        if let Some(def) = changed.get_mut(&Task::new("a", 0)) {
            def.destination = "kafka://elsewhere".to_string();
        }
        let report = reconcile(&mut reconciler, &changed).await;

        assert_eq!(report.stopped, vec![Task::new("a", 0)]);
        assert_eq!(report.started, vec![Task::new("a", 0)]);
    }

    #[tokio::test]
    async fn start_is_retried_then_succeeds() {
        let connector = Arc::new(RecordingConnector {
            fail_starts: AtomicU32::new(2),
            ..Default::default()
        });
        let mut reconciler = reconciler(connector.clone(), fast_config());

        let report = reconcile(&mut reconciler, &desired(&["a"])).await;
        assert_eq!(report.started, vec![Task::new("a", 0)]);
        assert_eq!(starts(&connector), 3);
        assert!(reconciler.failed().is_empty());
    }

    #[tokio::test]
    async fn exhausted_start_is_reported_and_retried_next_pass() {
        let connector = Arc::new(RecordingConnector {
            fail_starts: AtomicU32::new(3),
            ..Default::default()
        });
        let mut reconciler = reconciler(connector.clone(), fast_config());

        let report = reconcile(&mut reconciler, &desired(&["a"])).await;
        assert_eq!(report.failed, vec![Task::new("a", 0)]);
        assert!(reconciler.running().is_empty());
        assert!(reconciler.failed()[&Task::new("a", 0)].contains("source unavailable"));

        let report = reconcile(&mut reconciler, &desired(&["a"])).await;
        assert_eq!(report.started, vec![Task::new("a", 0)]);
        assert!(reconciler.failed().is_empty());
    }

    #[tokio::test]
    async fn hung_stop_is_forcibly_released() {
        let connector = Arc::new(RecordingConnector {
            hang_on_stop: true,
            ..Default::default()
        });
        let mut reconciler = reconciler(connector.clone(), fast_config());
        reconcile(&mut reconciler, &desired(&["a", "b"])).await;

        let begin = tokio::time::Instant::now();
        let stopped = reconciler.stop_all().await;
        assert_eq!(stopped.len(), 2);
        assert!(reconciler.running().is_empty());
        // Both stops share one grace period
        assert!(begin.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn unbound_connector_type_is_reported_failed() {
        let connector = Arc::new(RecordingConnector::default());
        let mut reconciler = reconciler(connector.clone(), fast_config());

        let mut want = desired(&["a"]);
        want.insert(Task::new("x", 0), StreamDefinition::new("x", "unknown"));
        let report = reconcile(&mut reconciler, &want).await;

        assert_eq!(report.started, vec![Task::new("a", 0)]);
        assert_eq!(report.failed, vec![Task::new("x", 0)]);
    }

    #[tokio::test]
    async fn interrupted_start_is_abandoned_promptly() {
        let connector = Arc::new(RecordingConnector {
            hang_on_start: true,
            ..Default::default()
        });
        let config = ReconcilerConfig {
            start_timeout: Duration::from_secs(30),
            ..fast_config()
        };
        let mut reconciler = reconciler(connector.clone(), config);

        let interrupt = CancellationToken::new();
        let trigger = interrupt.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let begin = tokio::time::Instant::now();
        let report = reconciler.reconcile(&desired(&["a", "b"]), &interrupt).await;
        assert!(begin.elapsed() < Duration::from_secs(2));
        assert_eq!(report.interrupted, vec![Task::new("a", 0), Task::new("b", 0)]);
        assert!(report.started.is_empty() && report.failed.is_empty());
        assert!(reconciler.running().is_empty());
        assert!(reconciler.failed().is_empty());
        assert_eq!(starts(&connector), 2);
    }

    #[tokio::test]
    async fn interrupt_skips_remaining_retries() {
        let connector = Arc::new(RecordingConnector {
            fail_starts: AtomicU32::new(10),
            ..Default::default()
        });
        let config = ReconcilerConfig {
            start_attempts: 5,
            start_backoff: Backoff::new(Duration::from_secs(30), Duration::from_secs(30)),
            ..fast_config()
        };
        let mut reconciler = reconciler(connector.clone(), config);

        let interrupt = CancellationToken::new();
        let trigger = interrupt.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let begin = tokio::time::Instant::now();
        let report = reconciler.reconcile(&desired(&["a"]), &interrupt).await;
        assert!(begin.elapsed() < Duration::from_secs(2));
        assert_eq!(report.interrupted, vec![Task::new("a", 0)]);
        assert_eq!(starts(&connector), 1);
    }
}
