use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::coordinator::MetadataSource;
use crate::execution::ProcessController;
use crate::persistence::TaskStore;

pub const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(3600);

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExecutionSettings {
    /// Used when a task declares no positive timeout.
    pub default_timeout: Duration,
    /// Working directory for scripts. `None` means the home directory, then the
    /// task directory.
    pub work_dir: Option<PathBuf>,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_TASK_TIMEOUT,
            work_dir: None,
        }
    }
}

/// Collaborators shared by every task of one agent.
pub struct TaskContext {
    pub store: TaskStore,
    pub controller: Arc<dyn ProcessController>,
    pub metadata: Arc<dyn MetadataSource>,
    pub runtime: tokio::runtime::Handle,
    pub settings: ExecutionSettings,
}

impl TaskContext {
    pub fn new(
        store: TaskStore,
        controller: Arc<dyn ProcessController>,
        metadata: Arc<dyn MetadataSource>,
        runtime: tokio::runtime::Handle,
    ) -> Self {
        Self {
            store,
            controller,
            metadata,
            runtime,
            settings: ExecutionSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: ExecutionSettings) -> Self {
        self.settings = settings;
        self
    }

    pub(crate) fn effective_timeout(&self, declared_secs: u64) -> Duration {
        if declared_secs == 0 {
            self.settings.default_timeout
        } else {
            Duration::from_secs(declared_secs)
        }
    }
}
