#![cfg(unix)]

mod support;

use std::collections::HashSet;
use std::fs;
use std::time::Duration;

use agentd_core::models::{AssignTask, Clock, TaskId, TaskStatus};
use agentd_core::registry::TaskRegistry;

use support::{CountingController, ScriptedMetadata, context, shell_meta, wait_for_process};

const SETTLE: Option<Duration> = Some(Duration::from_secs(15));

fn assign(id: i64, clock: i64, action: &str) -> AssignTask {
    AssignTask {
        id: TaskId(id),
        clock: Clock(clock),
        action: action.to_string(),
    }
}

fn ids(values: &[i64]) -> HashSet<TaskId> {
    values.iter().copied().map(TaskId).collect()
}

#[tokio::test]
async fn repeated_assignment_runs_once() {
    let dir = tempfile::tempdir().unwrap();
    let controller = CountingController::new();
    let metadata = ScriptedMetadata::new(shell_meta("echo once", 10));
    let mut registry = TaskRegistry::new(context(dir.path(), metadata.clone(), controller.clone()));

    registry.assign_task(&assign(1, 1, "start"));
    registry.assign_task(&assign(1, 1, "start"));
    registry.wait_idle(SETTLE).await.unwrap();
    registry.assign_task(&assign(1, 1, "start"));
    registry.wait_idle(SETTLE).await.unwrap();

    let task = registry.get(TaskId(1)).expect("task registered");
    assert_eq!(task.status(), TaskStatus::Success);
    assert_eq!(controller.starts(), 1);
    assert_eq!(metadata.calls(), 1);
}

#[tokio::test]
async fn new_clock_reruns_with_cached_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let controller = CountingController::new();
    let metadata = ScriptedMetadata::new(shell_meta("echo run", 10));
    let ctx = context(dir.path(), metadata.clone(), controller.clone());
    let mut registry = TaskRegistry::new(ctx.clone());

    registry.assign_task(&assign(2, 1, "start"));
    registry.wait_idle(SETTLE).await.unwrap();
    registry.assign_task(&assign(2, 2, "start"));
    registry.wait_idle(SETTLE).await.unwrap();

    let task = registry.get(TaskId(2)).unwrap();
    assert_eq!(task.clock(), Clock(2));
    assert_eq!(task.status(), TaskStatus::Success);
    assert_eq!(controller.starts(), 2);
    assert_eq!(metadata.calls(), 1);
    assert!(ctx.store.done_before(TaskId(2), Clock(1)));
    assert!(ctx.store.done_before(TaskId(2), Clock(2)));
}

#[tokio::test]
async fn kill_for_unknown_task_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let controller = CountingController::new();
    let metadata = ScriptedMetadata::new(shell_meta("true", 10));
    let mut registry = TaskRegistry::new(context(dir.path(), metadata.clone(), controller.clone()));

    registry.assign_task(&assign(3, 1, "kill"));

    assert!(registry.is_empty());
    assert_eq!(controller.kills(), 0);
    assert_eq!(metadata.calls(), 0);
}

#[tokio::test]
async fn unknown_action_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let metadata = ScriptedMetadata::new(shell_meta("true", 10));
    let mut registry = TaskRegistry::new(context(dir.path(), metadata.clone(), CountingController::new()));

    registry.assign_task(&assign(4, 1, "restart"));

    assert!(registry.is_empty());
    assert_eq!(metadata.calls(), 0);
}

#[tokio::test]
async fn finished_clock_on_disk_is_hydrated_not_rerun() {
    let dir = tempfile::tempdir().unwrap();
    let controller = CountingController::new();
    let metadata = ScriptedMetadata::new(shell_meta("echo again", 10));
    let ctx = context(dir.path(), metadata.clone(), controller.clone());

    let task_dir = ctx.store.ensure_dir(TaskId(5)).unwrap();
    fs::write(task_dir.join("5.done"), "success").unwrap();
    fs::write(task_dir.join("stdout"), "before restart\n").unwrap();
    fs::write(task_dir.join("stderr"), "").unwrap();

    let mut registry = TaskRegistry::new(ctx);
    registry.assign_task(&assign(5, 5, "start"));

    let task = registry.get(TaskId(5)).unwrap();
    assert_eq!(task.status(), TaskStatus::Success);
    assert!(!task.is_alive());
    assert_eq!(task.stdout(), b"before restart\n");
    assert_eq!(controller.starts(), 0);
    assert_eq!(metadata.calls(), 0);

    let reported = registry.snapshot();
    assert_eq!(reported.len(), 1);
    assert_eq!(reported[0].clock, Clock(5));
}

#[tokio::test]
async fn reconcile_keeps_running_task_until_killed() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = TaskRegistry::new(context(
        dir.path(),
        ScriptedMetadata::new(shell_meta("sleep 30", 60)),
        CountingController::new(),
    ));

    registry.assign_task(&assign(6, 1, "start"));
    let task = registry.get(TaskId(6)).unwrap();
    wait_for_process(&task).await;

    let removed = registry.reconcile(&HashSet::new());
    assert!(removed.is_empty());
    assert!(registry.get(TaskId(6)).is_some());

    registry.assign_task(&assign(6, 1, "kill"));
    let done = task.wait_for_terminal(SETTLE).await.unwrap();
    assert_eq!(done.status, TaskStatus::Killed);
    registry.wait_idle(SETTLE).await.unwrap();

    let removed = registry.reconcile(&HashSet::new());
    assert_eq!(removed, vec![TaskId(6)]);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn reconcile_releases_finished_tasks() {
    let dir = tempfile::tempdir().unwrap();
    let mut registry = TaskRegistry::new(context(
        dir.path(),
        ScriptedMetadata::new(shell_meta("echo bye", 10)),
        CountingController::new(),
    ));

    registry.assign_task(&assign(7, 1, "start"));
    registry.assign_task(&assign(8, 1, "start"));
    registry.wait_idle(SETTLE).await.unwrap();

    let dropped = registry.get(TaskId(7)).unwrap();
    let removed = registry.reconcile(&ids(&[8]));

    assert_eq!(removed, vec![TaskId(7)]);
    assert_eq!(registry.len(), 1);
    assert!(registry.get(TaskId(8)).is_some());
    assert!(dropped.stdout().is_empty());
    assert!(!dropped.has_process());
}

#[tokio::test]
async fn failed_prepare_is_retried_on_redelivery() {
    let dir = tempfile::tempdir().unwrap();
    let controller = CountingController::new();
    let metadata = ScriptedMetadata::failing_first(shell_meta("echo recovered", 10), 1);
    let mut registry = TaskRegistry::new(context(dir.path(), metadata.clone(), controller.clone()));

    registry.assign_task(&assign(9, 1, "start"));
    registry.wait_idle(SETTLE).await.unwrap();

    let task = registry.get(TaskId(9)).unwrap();
    assert_eq!(task.status(), TaskStatus::Running);
    assert!(!task.is_alive());
    assert_eq!(controller.starts(), 0);

    registry.assign_task(&assign(9, 1, "start"));
    let done = task.wait_for_terminal(SETTLE).await.unwrap();

    assert_eq!(done.status, TaskStatus::Success);
    assert_eq!(done.stdout, b"recovered\n");
    assert_eq!(metadata.calls(), 2);
    assert_eq!(controller.starts(), 1);
}

#[tokio::test]
async fn new_clock_start_waits_for_inflight_kill() {
    let dir = tempfile::tempdir().unwrap();
    let controller = CountingController::slow_kills(Duration::from_millis(500));
    let ctx = context(
        dir.path(),
        ScriptedMetadata::new(shell_meta("sleep 30", 60)),
        controller.clone(),
    );
    let mut registry = TaskRegistry::new(ctx.clone());

    registry.assign_task(&assign(10, 1, "start"));
    let task = registry.get(TaskId(10)).unwrap();
    wait_for_process(&task).await;

    registry.assign_task(&assign(10, 1, "kill"));
    registry.assign_task(&assign(10, 2, "start"));
    assert_eq!(task.clock(), Clock(1));
    assert_eq!(task.status(), TaskStatus::Killing);

    let done = task.wait_for_terminal(SETTLE).await.unwrap();
    assert_eq!(done.status, TaskStatus::Killed);
    assert_eq!(ctx.store.load_result(TaskId(10), Clock(1)).status, "killed");
    assert!(!ctx.store.done_before(TaskId(10), Clock(2)));
    assert_eq!(controller.starts(), 1);

    // Redelivery after the kill settled runs the new clock.
    registry.assign_task(&assign(10, 2, "start"));
    wait_for_process(&task).await;
    assert_eq!(task.clock(), Clock(2));
    assert_eq!(task.status(), TaskStatus::Running);
    assert_eq!(controller.starts(), 2);

    registry.assign_task(&assign(10, 2, "kill"));
    let done = task.wait_for_terminal(SETTLE).await.unwrap();
    assert_eq!(done.clock, Clock(2));
    assert_eq!(ctx.store.load_result(TaskId(10), Clock(2)).status, "killed");
}
