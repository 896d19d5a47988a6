//! Single-task state machine.
//!
//! ```text
//! pending -> running -> success | failed | killed
//! pending | running -> killing -> killed | killfailed
//! ```
//!
//! All mutable fields live behind one per-task lock and are only reachable
//! through the accessors below, so a reader never sees a status paired with
//! output from another moment.

pub mod command;
mod lifecycle;

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::sync::Notify;

use crate::execution::{OutputSink, OutputStream, ProcessHandle};
use crate::models::{
    Clock, CoreError, CoreErrorKind, CoreResult, TaskAction, TaskId, TaskMeta, TaskSnapshot,
    TaskStatus,
};
use crate::task_context::TaskContext;

pub struct Task {
    id: TaskId,
    context: Arc<TaskContext>,
    state: Mutex<TaskState>,
    settled: Notify,
}

#[derive(Debug)]
struct TaskState {
    clock: Clock,
    action: TaskAction,
    status: TaskStatus,
    // `alive` is the union of both: a run is being supervised or a kill is
    // in flight.
    supervising: bool,
    killing: bool,
    meta: Option<TaskMeta>,
    process: Option<ProcessHandle>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl TaskState {
    fn alive(&self) -> bool {
        self.supervising || self.killing
    }

    fn snapshot(&self, id: TaskId) -> TaskSnapshot {
        TaskSnapshot {
            id,
            clock: self.clock,
            action: self.action,
            status: self.status,
            alive: self.alive(),
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
        }
    }
}

impl Task {
    pub fn new(id: TaskId, clock: Clock, action: TaskAction, context: Arc<TaskContext>) -> Arc<Self> {
        Arc::new(Self {
            id,
            context,
            state: Mutex::new(TaskState {
                clock,
                action,
                status: TaskStatus::Pending,
                supervising: false,
                killing: false,
                meta: None,
                process: None,
                stdout: Vec::new(),
                stderr: Vec::new(),
            }),
            settled: Notify::new(),
        })
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn clock(&self) -> Clock {
        self.lock_state().clock
    }

    pub fn action(&self) -> TaskAction {
        self.lock_state().action
    }

    pub fn status(&self) -> TaskStatus {
        self.lock_state().status
    }

    pub fn is_alive(&self) -> bool {
        self.lock_state().alive()
    }

    pub fn stdout(&self) -> Vec<u8> {
        self.lock_state().stdout.clone()
    }

    pub fn stderr(&self) -> Vec<u8> {
        self.lock_state().stderr.clone()
    }

    pub fn meta(&self) -> Option<TaskMeta> {
        self.lock_state().meta.clone()
    }

    pub fn has_process(&self) -> bool {
        self.lock_state().process.is_some()
    }

    pub fn snapshot(&self) -> TaskSnapshot {
        self.lock_state().snapshot(self.id)
    }

    pub(crate) fn reassign(&self, clock: Clock, action: TaskAction) {
        let mut state = self.lock_state();
        state.clock = clock;
        state.action = action;
    }

    /// A start that never got a process running: the status still says
    /// `running` but nothing is alive.
    pub(crate) fn awaiting_retry(&self) -> bool {
        let state = self.lock_state();
        state.action == TaskAction::Start && state.status == TaskStatus::Running && !state.alive()
    }

    /// Whether the current clock already produced a persisted result.
    pub fn done_before(&self) -> bool {
        self.context.store.done_before(self.id, self.clock())
    }

    /// Hydrates status and output of the current clock from disk.
    pub fn load_result(&self) {
        let clock = self.clock();
        let stored = self.context.store.load_result(self.id, clock);
        let status = match stored.status.parse::<TaskStatus>() {
            Ok(status) if status.is_terminal() => status,
            _ => {
                tracing::warn!(
                    task_id = self.id.0,
                    clock = clock.0,
                    recorded = %stored.status,
                    "done marker holds no terminal status, treating as failed"
                );
                TaskStatus::Failed
            }
        };

        let mut state = self.lock_state();
        state.status = status;
        state.stdout = stored.stdout;
        state.stderr = stored.stderr;
        tracing::info!(task_id = self.id.0, clock = clock.0, %status, "loaded persisted task result");
    }

    /// Resolves execution metadata, fetching it from the coordinator only when
    /// no cached copy exists. Blocks on disk and network I/O.
    pub fn prepare(&self) -> CoreResult<TaskMeta> {
        if let Some(meta) = self.meta() {
            return Ok(meta);
        }

        let store = &self.context.store;
        store.ensure_dir(self.id)?;

        let meta = if store.metadata_cached(self.id) {
            store.load_meta(self.id)
        } else {
            let fetched = self.context.metadata.fetch_meta(self.id).map_err(|error| {
                tracing::error!(task_id = self.id.0, %error, "failed to fetch task metadata");
                error
            })?;
            store.save_meta(self.id, &fetched)?;
            tracing::debug!(task_id = self.id.0, "cached task metadata");
            fetched
        };

        self.lock_state().meta = Some(meta.clone());
        Ok(meta)
    }

    /// Drops the process handle and the captured output.
    pub fn release(&self) {
        let mut state = self.lock_state();
        state.process = None;
        state.stdout = Vec::new();
        state.stderr = Vec::new();
    }

    pub async fn wait_for_terminal(&self, timeout: Option<Duration>) -> CoreResult<TaskSnapshot> {
        self.wait_until(timeout, |snapshot| {
            snapshot.status.is_terminal() && !snapshot.alive
        })
        .await
    }

    /// Waits until neither a run nor a kill is in flight.
    pub async fn wait_settled(&self, timeout: Option<Duration>) -> CoreResult<TaskSnapshot> {
        self.wait_until(timeout, |snapshot| !snapshot.alive).await
    }

    async fn wait_until(
        &self,
        timeout: Option<Duration>,
        done: impl Fn(&TaskSnapshot) -> bool,
    ) -> CoreResult<TaskSnapshot> {
        let deadline = timeout.map(|duration| tokio::time::Instant::now() + duration);

        loop {
            let notified = self.settled.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let snapshot = self.snapshot();
            if done(&snapshot) {
                return Ok(snapshot);
            }

            match deadline {
                Some(deadline) => tokio::time::timeout_at(deadline, notified)
                    .await
                    .map_err(|_| {
                        CoreError::for_task(
                            self.id,
                            CoreErrorKind::Timeout,
                            format!("timed out waiting for task '{}'", self.id),
                        )
                    })?,
                None => notified.await,
            }
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, TaskState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl OutputSink for Task {
    fn append(&self, stream: OutputStream, chunk: &[u8]) {
        let mut state = self.lock_state();
        match stream {
            OutputStream::Stdout => state.stdout.extend_from_slice(chunk),
            OutputStream::Stderr => state.stderr.extend_from_slice(chunk),
        }
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock_state();
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("clock", &state.clock)
            .field("action", &state.action)
            .field("status", &state.status)
            .field("alive", &state.alive())
            .finish()
    }
}
