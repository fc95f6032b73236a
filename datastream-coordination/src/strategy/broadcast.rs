use std::collections::BTreeSet;

use super::{all_unassigned, AssignmentStrategy};
use crate::types::{AssignmentTable, Task, WorkerId};

/// Assigns every task to every worker. For stateless fan-out connectors
/// where duplicate processing downstream is acceptable.
pub struct BroadcastStrategy;

impl AssignmentStrategy for BroadcastStrategy {
    fn name(&self) -> &'static str {
        "broadcast"
    }

    fn assign(
        &self,
        workers: &BTreeSet<WorkerId>,
        tasks: &BTreeSet<Task>,
        _previous: &AssignmentTable,
    ) -> AssignmentTable {
        if workers.is_empty() {
            return all_unassigned(tasks);
        }

        AssignmentTable {
            assignments: workers
                .iter()
                .map(|worker| (worker.clone(), tasks.clone()))
                .collect(),
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workers(names: &[&str]) -> BTreeSet<WorkerId> {
        names.iter().map(|n| WorkerId::new(*n).unwrap()).collect()
    }

    fn tasks(n: u32) -> BTreeSet<Task> {
        (0..n).map(|i| Task::new(&format!("s{i}"), 0)).collect()
    }

    #[test]
    fn no_workers_leaves_everything_unassigned() {
        let table = BroadcastStrategy.assign(&workers(&[]), &tasks(3), &AssignmentTable::default());
        assert!(table.assignments.is_empty());
        assert_eq!(table.unassigned, tasks(3));
    }

    #[test]
    fn every_worker_gets_every_task() {
        let ws = workers(&["w-1", "w-2", "w-3"]);
        let table = BroadcastStrategy.assign(&ws, &tasks(3), &AssignmentTable::default());
        for worker in &ws {
            assert_eq!(table.tasks_for(worker), tasks(3));
        }
        assert!(table.unassigned.is_empty());
    }

    #[test]
    fn removing_a_worker_leaves_others_untouched() {
        let before = BroadcastStrategy.assign(
            &workers(&["w-1", "w-2", "w-3"]),
            &tasks(3),
            &AssignmentTable::default(),
        );
        let after = BroadcastStrategy.assign(&workers(&["w-1", "w-3"]), &tasks(3), &before);

        for name in ["w-1", "w-3"] {
            let w = WorkerId::new(name).unwrap();
            assert_eq!(before.tasks_for(&w), after.tasks_for(&w));
        }
        assert!(after.tasks_for(&WorkerId::new("w-2").unwrap()).is_empty());
    }
}
