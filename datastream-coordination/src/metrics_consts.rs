pub const REBALANCES: &str = "datastream_coordinator_rebalances_total";
pub const STALE_WRITES: &str = "datastream_coordinator_stale_writes_total";
pub const STATE_TRANSITIONS: &str = "datastream_coordinator_state_transitions_total";
pub const TASK_STARTS: &str = "datastream_coordinator_task_starts_total";
pub const TASK_STOPS: &str = "datastream_coordinator_task_stops_total";
pub const TASK_STOP_FAULTS: &str = "datastream_coordinator_task_stop_faults_total";
pub const RUNNING_TASKS: &str = "datastream_coordinator_running_tasks";
pub const FAILED_TASKS: &str = "datastream_coordinator_failed_tasks";
pub const LIVE_WORKERS: &str = "datastream_coordinator_live_workers";
pub const SESSION_LOSSES: &str = "datastream_membership_session_losses_total";
pub const REREGISTRATIONS: &str = "datastream_membership_reregistrations_total";
pub const WATCH_RESTARTS: &str = "datastream_watch_restarts_total";
