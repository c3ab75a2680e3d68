//! Readiness and cycle checks over the task dependency graph.
//!
//! An edge `task -> depends_on` means `task` may only run once `depends_on` has completed. The
//! graph must stay acyclic: a cycle would leave every task on it waiting forever. Backends call
//! [`check_new_edge`] before persisting an edge so a cycle is rejected when it is defined rather
//! than discovered (or silently starved) at claim time.
use std::collections::HashMap;

use thiserror::Error;

use crate::task::{TaskId, TaskStatus};

/// Returned when a dependency edge would make the dependency graph cyclic.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Adding dependency {task} -> {depends_on} would create a cycle")]
pub struct StructuralError {
    pub task: TaskId,
    pub depends_on: TaskId,
}

/// A task is ready when every one of its dependencies has completed.
///
/// A task without dependencies is always ready.
pub fn is_ready(dependency_statuses: impl IntoIterator<Item = TaskStatus>) -> bool {
    dependency_statuses
        .into_iter()
        .all(|status| status == TaskStatus::Completed)
}

enum Mark {
    OnStack,
    Visited,
}

/// Checks that adding `task -> depends_on` keeps the graph acyclic.
///
/// `dependencies_of` returns the existing outgoing edges of a node. The traversal is an
/// iterative depth first search from `depends_on` using an explicit stack, with nodes marked
/// on-stack while their children are explored and visited afterwards. Reaching `task`, or a node
/// that is still on the stack, rejects the edge.
pub fn check_new_edge<F, I>(
    task: TaskId,
    depends_on: TaskId,
    mut dependencies_of: F,
) -> Result<(), StructuralError>
where
    F: FnMut(TaskId) -> I,
    I: IntoIterator<Item = TaskId>,
{
    let cycle = StructuralError { task, depends_on };
    if task == depends_on {
        return Err(cycle);
    }

    let mut marks = HashMap::new();
    let mut stack = Vec::new();
    marks.insert(depends_on, Mark::OnStack);
    stack.push((depends_on, children(&mut dependencies_of, depends_on)));

    while let Some((node, children_left)) = stack.last_mut() {
        let node = *node;
        let Some(child) = children_left.next() else {
            marks.insert(node, Mark::Visited);
            stack.pop();
            continue;
        };
        if child == task {
            return Err(cycle);
        }
        match marks.get(&child) {
            Some(Mark::OnStack) => return Err(cycle),
            Some(Mark::Visited) => {}
            None => {
                marks.insert(child, Mark::OnStack);
                let grandchildren = children(&mut dependencies_of, child);
                stack.push((child, grandchildren));
            }
        }
    }

    Ok(())
}

fn children<F, I>(dependencies_of: &mut F, node: TaskId) -> std::vec::IntoIter<TaskId>
where
    F: FnMut(TaskId) -> I,
    I: IntoIterator<Item = TaskId>,
{
    dependencies_of(node).into_iter().collect::<Vec<_>>().into_iter()
}
