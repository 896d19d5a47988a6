#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agentd_core::coordinator::{CoordinatorLink, MetadataSource};
use agentd_core::execution::{
    ExecutionResult, LaunchRequest, OutputSink, ProcessController, ProcessHandle,
    RunningProcess, TokioProcessController,
};
use agentd_core::models::{
    CoreError, CoreErrorKind, CoreResult, ReportRequest, ReportResponse, TaskId, TaskMeta,
};
use agentd_core::persistence::TaskStore;
use agentd_core::task::Task;
use agentd_core::task_context::{ExecutionSettings, TaskContext};

pub fn shell_meta(body: &str, timeout_secs: u64) -> TaskMeta {
    TaskMeta {
        script: format!("#!/bin/sh\n{body}\n"),
        args: String::new(),
        account: "root".to_string(),
        timeout_secs,
    }
}

/// Serves queued answers first, then the fallback, counting every call.
pub struct ScriptedMetadata {
    calls: AtomicUsize,
    queued: Mutex<VecDeque<CoreResult<TaskMeta>>>,
    fallback: TaskMeta,
}

impl ScriptedMetadata {
    pub fn new(meta: TaskMeta) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            queued: Mutex::new(VecDeque::new()),
            fallback: meta,
        })
    }

    pub fn failing_first(meta: TaskMeta, failures: usize) -> Arc<Self> {
        let source = Self::new(meta);
        {
            let mut queued = source.queued.lock().unwrap();
            for _ in 0..failures {
                queued.push_back(Err(CoreError::new(
                    CoreErrorKind::Transport,
                    "coordinator unreachable",
                )));
            }
        }
        source
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl MetadataSource for ScriptedMetadata {
    fn fetch_meta(&self, _id: TaskId) -> CoreResult<TaskMeta> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.queued.lock().unwrap().pop_front() {
            Some(answer) => answer,
            None => Ok(self.fallback.clone()),
        }
    }
}

/// Real tokio controller that counts starts and kills and can be told to fail
/// every kill.
pub struct CountingController {
    inner: TokioProcessController,
    starts: AtomicUsize,
    kills: AtomicUsize,
    fail_kills: bool,
    kill_delay: Duration,
}

impl CountingController {
    fn build(fail_kills: bool, kill_delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            inner: TokioProcessController,
            starts: AtomicUsize::new(0),
            kills: AtomicUsize::new(0),
            fail_kills,
            kill_delay,
        })
    }

    pub fn new() -> Arc<Self> {
        Self::build(false, Duration::ZERO)
    }

    pub fn failing_kills() -> Arc<Self> {
        Self::build(true, Duration::ZERO)
    }

    /// Kills succeed, but only after `delay`, keeping the task in `killing`.
    pub fn slow_kills(delay: Duration) -> Arc<Self> {
        Self::build(false, delay)
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }
}

impl ProcessController for CountingController {
    fn start(
        &self,
        request: LaunchRequest,
        output: Arc<dyn OutputSink>,
    ) -> ExecutionResult<Box<dyn RunningProcess>> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        self.inner.start(request, output)
    }

    fn force_kill(&self, handle: &ProcessHandle) -> ExecutionResult<()> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        if !self.kill_delay.is_zero() {
            std::thread::sleep(self.kill_delay);
        }
        if self.fail_kills {
            return Err(CoreError::new(
                CoreErrorKind::ProcessFailure,
                "kill refused by test controller",
            ));
        }
        self.inner.force_kill(handle)
    }
}

/// Link that replays queued responses and records every request it saw.
pub struct ScriptedLink {
    responses: Mutex<VecDeque<CoreResult<ReportResponse>>>,
    requests: Mutex<Vec<ReportRequest>>,
}

impl ScriptedLink {
    pub fn new(responses: Vec<CoreResult<ReportResponse>>) -> Arc<Self> {
        Arc::new(Self {
            responses: Mutex::new(responses.into()),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn requests(&self) -> Vec<ReportRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl CoordinatorLink for ScriptedLink {
    fn report(&self, request: &ReportRequest) -> CoreResult<ReportResponse> {
        self.requests.lock().unwrap().push(request.clone());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(ReportResponse::default()))
    }
}

pub fn context(
    root: &Path,
    metadata: Arc<dyn MetadataSource>,
    controller: Arc<dyn ProcessController>,
) -> Arc<TaskContext> {
    let work_dir = root.to_path_buf();
    Arc::new(
        TaskContext::new(
            TaskStore::new(root.join("meta")),
            controller,
            metadata,
            tokio::runtime::Handle::current(),
        )
        .with_settings(ExecutionSettings {
            default_timeout: Duration::from_secs(30),
            work_dir: Some(work_dir),
        }),
    )
}

pub async fn wait_for_process(task: &Task) {
    for _ in 0..250 {
        if task.has_process() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("task {} never started a process", task.id());
}
