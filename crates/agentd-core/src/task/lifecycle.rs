use std::sync::Arc;
use std::time::Duration;

use crate::execution::{
    ExecutionResult, OutputSink, ProcessExitStatus, ProcessHandle, RunningProcess,
    start_validated,
};
use crate::models::{Clock, CoreError, CoreErrorKind, CoreResult, TaskMeta, TaskStatus};
use crate::task::{Task, command};

/// How long a killed process tree gets to be reaped before the kill counts as
/// unconfirmed.
const KILL_REAP_DEADLINE: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug)]
enum Role {
    Supervise,
    Kill,
}

impl Task {
    /// Marks the task `running` and launches the current clock in the
    /// background. While a run or a kill is in flight nothing changes, so an
    /// in-flight kill keeps its `killing` status.
    pub fn start(self: &Arc<Self>) {
        {
            let mut state = self.lock_state();
            if state.alive() {
                tracing::debug!(task_id = self.id.0, status = %state.status, "task is alive, start ignored");
                return;
            }
            state.status = TaskStatus::Running;
            state.supervising = true;
        }

        let task = Arc::clone(self);
        self.context.runtime.spawn(async move {
            task.run().await;
        });
    }

    /// Force-terminates the process tree in the background and records
    /// `killed`, or `killfailed` when termination cannot be confirmed.
    pub fn kill(self: &Arc<Self>) {
        let handle = {
            let mut state = self.lock_state();
            if state.status.is_terminal() {
                tracing::debug!(task_id = self.id.0, status = %state.status, "task already finished, kill ignored");
                return;
            }
            state.status = TaskStatus::Killing;
            if state.killing {
                return;
            }
            state.killing = true;
            state.process
        };

        let task = Arc::clone(self);
        self.context.runtime.spawn(async move {
            task.run_kill(handle).await;
        });
    }

    async fn run(self: Arc<Self>) {
        let meta = match self.prepare_in_background().await {
            Ok(meta) => meta,
            Err(error) => {
                tracing::warn!(
                    task_id = self.id.0,
                    kind = ?error.kind,
                    message = %error.message,
                    "task prepare failed, waiting for next dispatch"
                );
                self.finish_role(Role::Supervise);
                return;
            }
        };

        let process = match self.launch(&meta) {
            Ok(Some(process)) => process,
            Ok(None) => {
                tracing::debug!(task_id = self.id.0, "kill requested before launch");
                self.finish_role(Role::Supervise);
                return;
            }
            Err(error) => {
                tracing::error!(
                    task_id = self.id.0,
                    kind = ?error.kind,
                    message = %error.message,
                    "cannot start task process"
                );
                self.finish_role(Role::Supervise);
                return;
            }
        };

        let timeout = self.context.effective_timeout(meta.timeout_secs);
        self.supervise(process, timeout).await;
    }

    async fn prepare_in_background(self: &Arc<Self>) -> CoreResult<TaskMeta> {
        let task = Arc::clone(self);
        tokio::task::spawn_blocking(move || task.prepare())
            .await
            .map_err(|join_error| {
                CoreError::for_task(
                    self.id,
                    CoreErrorKind::Internal,
                    format!("prepare join failure: {join_error}"),
                )
            })?
    }

    /// Starts the process under the task lock so a concurrent kill either sees
    /// the handle or stops the launch.
    fn launch(self: &Arc<Self>, meta: &TaskMeta) -> CoreResult<Option<Box<dyn RunningProcess>>> {
        let request = command::launch_request(self.id, &self.context, meta)?;

        let mut state = self.lock_state();
        if state.status != TaskStatus::Running {
            return Ok(None);
        }

        state.stdout.clear();
        state.stderr.clear();

        let output: Arc<dyn OutputSink> = self.clone();
        let process = start_validated(self.context.controller.as_ref(), request, output)?;
        let handle = process.handle();
        state.process = Some(handle);

        tracing::info!(
            task_id = self.id.0,
            clock = state.clock.0,
            pid = ?handle.pid,
            "task process started"
        );
        Ok(Some(process))
    }

    /// Waits for exit or for twice the declared timeout, whichever comes
    /// first, then records the outcome unless a kill request took over.
    async fn supervise(self: Arc<Self>, process: Box<dyn RunningProcess>, timeout: Duration) {
        let handle = process.handle();
        let deadline = timeout.saturating_mul(2);
        let wait = process.wait();
        tokio::pin!(wait);

        let outcome = tokio::select! {
            result = &mut wait => classify_exit(&self, result),
            _ = tokio::time::sleep(deadline) => {
                tracing::warn!(
                    task_id = self.id.0,
                    pid = ?handle.pid,
                    deadline_secs = deadline.as_secs(),
                    "task exceeded its deadline, killing process tree"
                );
                match self.force_kill(handle).await {
                    Ok(()) => match tokio::time::timeout(KILL_REAP_DEADLINE, &mut wait).await {
                        Ok(_) => TaskStatus::Killed,
                        Err(_) => {
                            tracing::error!(task_id = self.id.0, pid = ?handle.pid, "process tree still running after kill");
                            TaskStatus::KillFailed
                        }
                    },
                    Err(error) => {
                        tracing::error!(task_id = self.id.0, %error, "failed to kill timed out task");
                        TaskStatus::KillFailed
                    }
                }
            }
        };

        let recorded = {
            let mut state = self.lock_state();
            state.process = None;
            if matches!(
                state.status,
                TaskStatus::Killing | TaskStatus::Killed | TaskStatus::KillFailed
            ) {
                None
            } else {
                state.status = outcome;
                Some((state.clock, state.stdout.clone(), state.stderr.clone()))
            }
        };

        // A kill request records its own result.
        if let Some((clock, stdout, stderr)) = recorded {
            self.persist_result(clock, outcome, stdout, stderr).await;
        }
        self.finish_role(Role::Supervise);
    }

    async fn run_kill(self: Arc<Self>, handle: Option<ProcessHandle>) {
        tracing::info!(task_id = self.id.0, pid = ?handle.and_then(|h| h.pid), "killing task process tree");

        let result = match handle {
            Some(handle) => self.force_kill(handle).await,
            None => Ok(()),
        };

        let status = match result {
            Ok(()) => TaskStatus::Killed,
            Err(error) => {
                tracing::error!(task_id = self.id.0, %error, "failed to kill task process tree");
                TaskStatus::KillFailed
            }
        };

        let (clock, stdout, stderr) = {
            let mut state = self.lock_state();
            state.status = status;
            (state.clock, state.stdout.clone(), state.stderr.clone())
        };

        self.persist_result(clock, status, stdout, stderr).await;
        self.finish_role(Role::Kill);
    }

    async fn force_kill(&self, handle: ProcessHandle) -> ExecutionResult<()> {
        let controller = Arc::clone(&self.context.controller);
        tokio::task::spawn_blocking(move || controller.force_kill(&handle))
            .await
            .map_err(|join_error| {
                CoreError::for_task(
                    self.id,
                    CoreErrorKind::Internal,
                    format!("force kill join failure: {join_error}"),
                )
            })?
    }

    async fn persist_result(
        &self,
        clock: Clock,
        status: TaskStatus,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
    ) {
        let store = self.context.store.clone();
        let id = self.id;
        let persisted = tokio::task::spawn_blocking(move || {
            store.save_result(id, clock, status.as_str(), &stdout, &stderr)
        })
        .await;

        match persisted {
            Ok(Ok(())) => {
                tracing::info!(task_id = id.0, clock = clock.0, %status, "task result persisted");
            }
            Ok(Err(error)) => {
                tracing::error!(task_id = id.0, clock = clock.0, %error, "task result not persisted");
            }
            Err(join_error) => {
                tracing::error!(task_id = id.0, clock = clock.0, %join_error, "task result persistence aborted");
            }
        }
    }

    fn finish_role(&self, role: Role) {
        {
            let mut state = self.lock_state();
            match role {
                Role::Supervise => state.supervising = false,
                Role::Kill => state.killing = false,
            }
        }
        self.settled.notify_waiters();
    }
}

/// Maps a process exit onto a terminal status.
///
/// Kept from the legacy agent: any non-zero exit code reads as `killed`
/// (the old wait error carried an "exit status" message exactly in that case),
/// while a signal termination or a wait error reads as `failed`. Detecting the
/// terminating signal would be more precise, but coordinators rely on the
/// current mapping.
fn classify_exit(task: &Task, result: ExecutionResult<ProcessExitStatus>) -> TaskStatus {
    match result {
        Ok(ProcessExitStatus::ExitCode(0)) => {
            tracing::debug!(task_id = task.id.0, "task process done");
            TaskStatus::Success
        }
        Ok(ProcessExitStatus::ExitCode(code)) => {
            tracing::warn!(task_id = task.id.0, code, "task process exited with non-zero status");
            TaskStatus::Killed
        }
        Ok(ProcessExitStatus::Terminated) => {
            tracing::warn!(task_id = task.id.0, "task process terminated by signal");
            TaskStatus::Failed
        }
        Err(error) => {
            tracing::error!(task_id = task.id.0, %error, "task process wait failed");
            TaskStatus::Failed
        }
    }
}
