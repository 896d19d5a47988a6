use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;

use crate::execution::{
    ExecutionResult, LaunchRequest, OutputSink, OutputStream, ProcessController,
    ProcessExitStatus, ProcessHandle, ProcessWaitFuture, RunningProcess,
};
use crate::models::{CoreError, CoreErrorKind, TaskId};

const READ_CHUNK_BYTES: usize = 8 * 1024;
const DRAIN_DEADLINE: Duration = Duration::from_millis(250);

/// Starts commands with tokio and kills them as a whole process group
/// (`taskkill /T` on windows).
pub struct TokioProcessController;

impl ProcessController for TokioProcessController {
    fn start(
        &self,
        request: LaunchRequest,
        output: Arc<dyn OutputSink>,
    ) -> ExecutionResult<Box<dyn RunningProcess>> {
        let mut cmd = tokio::process::Command::new(&request.program);
        cmd.args(&request.args);

        if let Some(dir) = &request.working_dir {
            cmd.current_dir(dir);
        }

        cmd.stdin(std::process::Stdio::null());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|error| {
            process_failure(request.task_id, format!("failed to spawn process: {error}"))
        })?;

        let pid = child.id();
        let stdout_reader = forward_stream(child.stdout.take(), OutputStream::Stdout, &output);
        let stderr_reader = forward_stream(child.stderr.take(), OutputStream::Stderr, &output);

        Ok(Box::new(TokioRunningProcess {
            child: Mutex::new(Some(child)),
            readers: [stdout_reader, stderr_reader],
            pid,
            task_id: request.task_id,
        }))
    }

    fn force_kill(&self, handle: &ProcessHandle) -> ExecutionResult<()> {
        let Some(pid) = handle.pid else {
            return Ok(());
        };
        kill_process_tree(pid)
    }
}

struct TokioRunningProcess {
    child: Mutex<Option<tokio::process::Child>>,
    readers: [Option<JoinHandle<()>>; 2],
    pid: Option<u32>,
    task_id: TaskId,
}

impl RunningProcess for TokioRunningProcess {
    fn handle(&self) -> ProcessHandle {
        ProcessHandle { pid: self.pid }
    }

    fn wait(self: Box<Self>) -> ProcessWaitFuture {
        let task_id = self.task_id;
        let child = self.child.into_inner().ok().flatten();
        let readers = self.readers;

        Box::pin(async move {
            let mut child = child.ok_or_else(|| {
                process_failure(task_id, "child process already consumed".to_string())
            })?;

            let status = child.wait().await.map_err(|error| {
                process_failure(task_id, format!("failed to wait for process: {error}"))
            })?;

            // Descendants may keep the pipes open after the leader exits, so
            // the drain is bounded.
            for reader in readers.into_iter().flatten() {
                let abort = reader.abort_handle();
                if tokio::time::timeout(DRAIN_DEADLINE, reader).await.is_err() {
                    abort.abort();
                }
            }

            Ok(match status.code() {
                Some(code) => ProcessExitStatus::ExitCode(code),
                None => ProcessExitStatus::Terminated,
            })
        })
    }
}

fn forward_stream<R>(
    stream: Option<R>,
    kind: OutputStream,
    output: &Arc<dyn OutputSink>,
) -> Option<JoinHandle<()>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut stream = stream?;
    let output = Arc::clone(output);
    Some(tokio::spawn(async move {
        let mut buffer = vec![0u8; READ_CHUNK_BYTES];
        loop {
            match stream.read(&mut buffer).await {
                Ok(0) | Err(_) => break,
                Ok(read) => output.append(kind, &buffer[..read]),
            }
        }
    }))
}

#[cfg(unix)]
fn kill_process_tree(pid: u32) -> ExecutionResult<()> {
    let pgid = -(pid as libc::pid_t);
    let result = unsafe { libc::kill(pgid, libc::SIGKILL) };

    if result != 0 {
        let os_error = std::io::Error::last_os_error();
        if os_error.raw_os_error() != Some(libc::ESRCH) {
            return Err(CoreError::new(
                CoreErrorKind::ProcessFailure,
                format!("failed to kill process group {pid}: {os_error}"),
            ));
        }
    }

    Ok(())
}

#[cfg(windows)]
fn kill_process_tree(pid: u32) -> ExecutionResult<()> {
    // taskkill exits with 128 when the process is already gone.
    const NOT_FOUND: i32 = 128;

    let status = std::process::Command::new("taskkill")
        .args(["/F", "/T", "/PID", &pid.to_string()])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map_err(|error| {
            CoreError::new(
                CoreErrorKind::ProcessFailure,
                format!("failed to run taskkill for pid {pid}: {error}"),
            )
        })?;

    match status.code() {
        Some(0) | Some(NOT_FOUND) => Ok(()),
        other => Err(CoreError::new(
            CoreErrorKind::ProcessFailure,
            format!("taskkill for pid {pid} exited with {other:?}"),
        )),
    }
}

fn process_failure(task_id: TaskId, message: String) -> CoreError {
    CoreError::for_task(task_id, CoreErrorKind::ProcessFailure, message)
}
