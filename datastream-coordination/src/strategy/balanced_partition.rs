use std::collections::{BTreeMap, BTreeSet};

use super::{all_unassigned, AssignmentStrategy};
use crate::types::{AssignmentTable, Task, WorkerId};

/// Spreads tasks evenly while moving as few as possible.
///
/// Keeps every previous assignment whose worker is still live, trims workers
/// above their share, then deals the leftover tasks round-robin over the
/// sorted worker list. Each worker ends within one task of the others; the
/// extra slots go to the workers already holding the most, ties broken by
/// worker order, so a fresh table gives the remainder to the earliest workers.
pub struct BalancedPartitionStrategy;

impl AssignmentStrategy for BalancedPartitionStrategy {
    fn name(&self) -> &'static str {
        "balanced-partition"
    }

    fn assign(
        &self,
        workers: &BTreeSet<WorkerId>,
        tasks: &BTreeSet<Task>,
        previous: &AssignmentTable,
    ) -> AssignmentTable {
        if workers.is_empty() {
            return all_unassigned(tasks);
        }

        let target_min = tasks.len() / workers.len();
        let extra = tasks.len() % workers.len();

        // Step 1: Keep previous assignments to live workers. A task listed
        // under several workers stays with the first one only.
        let mut owned: BTreeMap<&WorkerId, Vec<Task>> =
            workers.iter().map(|w| (w, Vec::new())).collect();
        let mut placed: BTreeSet<&Task> = BTreeSet::new();
        for (worker, previous_tasks) in &previous.assignments {
            let Some(kept) = owned.get_mut(worker) else {
                continue;
            };
            for task in previous_tasks {
                if tasks.contains(task) && placed.insert(task) {
                    kept.push(task.clone());
                }
            }
        }

        let mut pool: Vec<Task> = tasks
            .iter()
            .filter(|t| !placed.contains(t))
            .cloned()
            .collect();

        // Step 2: Workers holding the most get the `extra` slots of
        // target_min + 1. The sort is stable, so ties keep worker order.
        let mut by_load: Vec<&WorkerId> = workers.iter().collect();
        by_load.sort_by(|a, b| owned[b].len().cmp(&owned[a].len()));
        let targets: BTreeMap<&WorkerId, usize> = by_load
            .iter()
            .enumerate()
            .map(|(i, w)| (*w, if i < extra { target_min + 1 } else { target_min }))
            .collect();

        // Step 3: Strip excess, evicting the highest tasks
        for (worker, kept) in owned.iter_mut() {
            let target = targets[*worker];
            if kept.len() > target {
                kept.sort();
                pool.extend(kept.drain(target..));
            }
        }

        // Step 4: Deal the pool round-robin over the sorted worker list
        pool.sort();
        let mut pool = pool.into_iter();
        'deal: loop {
            let mut dealt = false;
            for worker in workers {
                let Some(kept) = owned.get_mut(worker) else {
                    continue;
                };
                if kept.len() >= targets[worker] {
                    continue;
                }
                match pool.next() {
                    Some(task) => {
                        kept.push(task);
                        dealt = true;
                    }
                    None => break 'deal,
                }
            }
            if !dealt {
                break;
            }
        }

        AssignmentTable {
            assignments: owned
                .into_iter()
                .map(|(worker, kept)| (worker.clone(), kept.into_iter().collect()))
                .collect(),
            ..Default::default()
        }
    }
}
