pub mod tokio_process;

pub use tokio_process::TokioProcessController;

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use crate::models::{CoreError, CoreErrorKind, TaskId};

pub type ExecutionResult<T> = Result<T, CoreError>;

pub type ProcessWaitFuture = Pin<Box<dyn Future<Output = ExecutionResult<ProcessExitStatus>> + Send>>;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct LaunchRequest {
    pub task_id: TaskId,
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
}

impl LaunchRequest {
    pub fn new(task_id: TaskId, program: impl Into<PathBuf>) -> Self {
        Self {
            task_id,
            program: program.into(),
            args: Vec::new(),
            working_dir: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, working_dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(working_dir.into());
        self
    }

    pub fn validate(&self) -> ExecutionResult<()> {
        if self.program.as_os_str().is_empty() {
            return Err(invalid_input(
                self.task_id,
                "command program path must not be empty",
            ));
        }

        if self.args.iter().any(|arg| arg.contains('\0')) {
            return Err(invalid_input(
                self.task_id,
                "command args must not contain NUL bytes",
            ));
        }

        Ok(())
    }
}

/// Opaque reference to a started process tree, valid only while the process
/// is alive.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ProcessHandle {
    pub pid: Option<u32>,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProcessExitStatus {
    ExitCode(i32),
    Terminated,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Receives output chunks as the process produces them.
pub trait OutputSink: Send + Sync {
    fn append(&self, stream: OutputStream, chunk: &[u8]);
}

pub trait RunningProcess: Send {
    fn handle(&self) -> ProcessHandle;

    /// Resolves once the process has exited and its streams have been drained.
    fn wait(self: Box<Self>) -> ProcessWaitFuture;
}

/// Platform capability to start a command and to tear down its whole process
/// tree.
pub trait ProcessController: Send + Sync {
    fn start(
        &self,
        request: LaunchRequest,
        output: Arc<dyn OutputSink>,
    ) -> ExecutionResult<Box<dyn RunningProcess>>;

    /// Must return `Ok(())` when the target has already exited.
    fn force_kill(&self, handle: &ProcessHandle) -> ExecutionResult<()>;
}

pub fn start_validated(
    controller: &dyn ProcessController,
    request: LaunchRequest,
    output: Arc<dyn OutputSink>,
) -> ExecutionResult<Box<dyn RunningProcess>> {
    request.validate()?;
    controller.start(request, output)
}

fn invalid_input(task_id: TaskId, message: &str) -> CoreError {
    CoreError::for_task(task_id, CoreErrorKind::InvalidInput, message)
}
