//! Execution ordering
//!
//! Tasks are ordered by a priority-aware topological sort: at every step the
//! eligible task (all dependencies already placed) with the highest priority
//! is placed next, ties going to the task defined first. The resulting order
//! is deterministic for a given definition.

use super::models::WorkflowTask;
use crate::config::CyclePolicy;
use crate::{Error, Result};
use std::collections::HashMap;
use tracing::warn;

/// Compute the execution order as indices into `tasks`
///
/// Dependencies on ids that are not in `tasks` are never satisfied, so such
/// tasks are handled like tasks on a cycle.
pub fn execution_order(tasks: &[WorkflowTask], policy: CyclePolicy) -> Result<Vec<usize>> {
    let index: HashMap<&str, usize> = tasks
        .iter()
        .enumerate()
        .map(|(i, task)| (task.id.as_str(), i))
        .collect();

    let dependencies: Vec<Vec<Option<usize>>> = tasks
        .iter()
        .map(|task| {
            task.dependencies
                .iter()
                .map(|dep| index.get(dep.as_str()).copied())
                .collect()
        })
        .collect();

    let mut placed = vec![false; tasks.len()];
    let mut order = Vec::with_capacity(tasks.len());

    while order.len() < tasks.len() {
        let next = (0..tasks.len())
            .filter(|&i| !placed[i])
            .filter(|&i| dependencies[i].iter().all(|dep| dep.is_some_and(|d| placed[d])))
            // ties go to the earlier task
            .max_by_key(|&i| (tasks[i].priority, std::cmp::Reverse(i)));

        match next {
            Some(i) => {
                placed[i] = true;
                order.push(i);
            }
            None => {
                let remaining: Vec<usize> = (0..tasks.len()).filter(|&i| !placed[i]).collect();
                let ids: Vec<&str> = remaining.iter().map(|&i| tasks[i].id.as_str()).collect();

                match policy {
                    CyclePolicy::Reject => {
                        return Err(Error::dependency(
                            ids.join(", "),
                            "circular or unresolvable dependencies",
                        ));
                    }
                    CyclePolicy::AppendRemaining => {
                        warn!(
                            "Circular dependency detected or missing dependencies. Executing remaining tasks in definition order: {}",
                            ids.join(", ")
                        );
                        order.extend(remaining);
                    }
                }
            }
        }
    }

    Ok(order)
}

/// Task ids in execution order
pub fn execution_order_ids(tasks: &[WorkflowTask], policy: CyclePolicy) -> Result<Vec<String>> {
    Ok(execution_order(tasks, policy)?
        .into_iter()
        .map(|i| tasks[i].id.clone())
        .collect())
}
