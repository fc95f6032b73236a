mod balanced_partition;
mod broadcast;

pub use balanced_partition::BalancedPartitionStrategy;
pub use broadcast::BroadcastStrategy;

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::types::{AssignmentTable, Task, WorkerId};

/// Trait for task assignment strategies.
///
/// Every live worker calls `assign` independently with the same inputs and
/// must arrive at the same table, so implementations are pure functions of
/// their arguments: iterate sorted collections, never hash or insertion order.
pub trait AssignmentStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    /// Compute the table for `tasks` over `workers`.
    ///
    /// - `previous`: last published table, used to keep tasks where they are
    /// - With no workers, every task ends up in `unassigned`
    ///
    /// The returned epoch is left at its default; callers stamp it.
    fn assign(
        &self,
        workers: &BTreeSet<WorkerId>,
        tasks: &BTreeSet<Task>,
        previous: &AssignmentTable,
    ) -> AssignmentTable;
}

pub fn strategy_from_name(name: &str) -> Result<Arc<dyn AssignmentStrategy>> {
    match name {
        "broadcast" => Ok(Arc::new(BroadcastStrategy)),
        "balanced-partition" => Ok(Arc::new(BalancedPartitionStrategy)),
        other => Err(Error::configuration(format!(
            "unknown assignment strategy: {other}"
        ))),
    }
}

fn all_unassigned(tasks: &BTreeSet<Task>) -> AssignmentTable {
    AssignmentTable {
        unassigned: tasks.clone(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_builtin_names() {
        assert_eq!(strategy_from_name("broadcast").unwrap().name(), "broadcast");
        assert_eq!(
            strategy_from_name("balanced-partition").unwrap().name(),
            "balanced-partition"
        );
    }

    #[test]
    fn unknown_name_is_a_configuration_error() {
        let err = strategy_from_name("round-robin").err().unwrap();
        assert!(matches!(err, Error::Configuration(_)));
    }
}
