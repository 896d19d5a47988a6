//! Id to task mapping for one agent.
//!
//! The registry is owned by a single control flow: every mutating operation
//! takes `&mut self`, so concurrent callers must wrap it in their own lock.
//! Tasks themselves are shared (`Arc`) with their background supervision.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use crate::models::{AssignTask, CoreResult, TaskAction, TaskId, TaskSnapshot};
use crate::task::Task;
use crate::task_context::TaskContext;

pub struct TaskRegistry {
    context: Arc<TaskContext>,
    tasks: BTreeMap<TaskId, Arc<Task>>,
}

impl TaskRegistry {
    pub fn new(context: Arc<TaskContext>) -> Self {
        Self {
            context,
            tasks: BTreeMap::new(),
        }
    }

    pub fn get(&self, id: TaskId) -> Option<Arc<Task>> {
        self.tasks.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Applies one assignment. Redelivery of an assignment that was already
    /// dispatched is a no-op, as is a kill for a task never seen here. A start
    /// for a new clock waits until the task is no longer alive.
    pub fn assign_task(&mut self, assignment: &AssignTask) {
        let action = match assignment.action.parse::<TaskAction>() {
            Ok(action) => action,
            Err(_) => {
                tracing::warn!(
                    task_id = assignment.id.0,
                    action = %assignment.action,
                    "unknown action, assignment ignored"
                );
                return;
            }
        };

        let task = match self.tasks.get(&assignment.id) {
            Some(task) => {
                let task = Arc::clone(task);
                if task.clock() == assignment.clock
                    && task.action() == action
                    && !task.awaiting_retry()
                {
                    tracing::debug!(
                        task_id = assignment.id.0,
                        clock = assignment.clock.0,
                        "repeated assignment ignored"
                    );
                    return;
                }

                // The next delivery picks the new clock up once the current
                // run or kill has recorded its result under its own clock.
                if action == TaskAction::Start && task.is_alive() {
                    tracing::debug!(
                        task_id = assignment.id.0,
                        clock = assignment.clock.0,
                        running_clock = task.clock().0,
                        "task busy, start deferred"
                    );
                    return;
                }

                task.reassign(assignment.clock, action);
                if action == TaskAction::Start && !task.is_alive() && task.done_before() {
                    task.load_result();
                    return;
                }
                task
            }
            None => {
                if action == TaskAction::Kill {
                    tracing::debug!(task_id = assignment.id.0, "no local task to kill");
                    return;
                }

                let task = Task::new(
                    assignment.id,
                    assignment.clock,
                    action,
                    Arc::clone(&self.context),
                );
                self.tasks.insert(assignment.id, Arc::clone(&task));

                if task.done_before() {
                    task.load_result();
                    return;
                }
                task
            }
        };

        tracing::info!(
            task_id = assignment.id.0,
            clock = assignment.clock.0,
            action = action.as_str(),
            "dispatching task"
        );
        match action {
            TaskAction::Kill => task.kill(),
            TaskAction::Start => task.start(),
        }
    }

    /// Drops every task the coordinator no longer references, except those
    /// still executing or being killed. Returns the removed ids.
    pub fn reconcile(&mut self, assigned: &HashSet<TaskId>) -> Vec<TaskId> {
        let stale: Vec<TaskId> = self
            .tasks
            .keys()
            .filter(|id| !assigned.contains(id))
            .copied()
            .collect();

        let mut removed = Vec::with_capacity(stale.len());
        for id in stale {
            let Some(task) = self.tasks.get(&id) else {
                continue;
            };

            let status = task.status();
            if status.is_intermediate() {
                tracing::debug!(task_id = id.0, %status, "unreferenced task still active, retained");
                continue;
            }

            if let Some(task) = self.tasks.remove(&id) {
                task.release();
                tracing::debug!(task_id = id.0, %status, "task removed from registry");
                removed.push(id);
            }
        }

        removed
    }

    pub fn snapshot(&self) -> Vec<TaskSnapshot> {
        self.tasks.values().map(|task| task.snapshot()).collect()
    }

    /// Waits until no task has a run or kill in flight.
    pub async fn wait_idle(&self, timeout: Option<Duration>) -> CoreResult<()> {
        let deadline = timeout.map(|duration| tokio::time::Instant::now() + duration);
        let tasks: Vec<Arc<Task>> = self.tasks.values().cloned().collect();

        for task in tasks {
            let remaining =
                deadline.map(|deadline| deadline.saturating_duration_since(tokio::time::Instant::now()));
            task.wait_settled(remaining).await?;
        }

        Ok(())
    }
}
