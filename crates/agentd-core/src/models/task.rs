use std::fmt::{Display, Formatter};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(pub i64);

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical version of an assignment. A new clock for the same task id is a
/// fresh run request.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Clock(pub i64);

impl Display for Clock {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskAction {
    Start,
    Kill,
}

impl TaskAction {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskAction::Start => "start",
            TaskAction::Kill => "kill",
        }
    }
}

impl FromStr for TaskAction {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "start" => Ok(TaskAction::Start),
            "kill" => Ok(TaskAction::Kill),
            other => Err(format!("unknown task action '{other}'")),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Running,
    Killing,
    Success,
    Failed,
    Killed,
    #[serde(rename = "killfailed")]
    KillFailed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Killing => "killing",
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
            TaskStatus::Killed => "killed",
            TaskStatus::KillFailed => "killfailed",
        }
    }

    /// Terminal statuses never change again for the current clock.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failed | TaskStatus::Killed | TaskStatus::KillFailed
        )
    }

    /// `running` and `killing` are never reported upstream.
    pub fn is_intermediate(self) -> bool {
        matches!(self, TaskStatus::Running | TaskStatus::Killing)
    }
}

impl Display for TaskStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "pending" => Ok(TaskStatus::Pending),
            "running" => Ok(TaskStatus::Running),
            "killing" => Ok(TaskStatus::Killing),
            "success" => Ok(TaskStatus::Success),
            "failed" => Ok(TaskStatus::Failed),
            "killed" => Ok(TaskStatus::Killed),
            "killfailed" => Ok(TaskStatus::KillFailed),
            other => Err(format!("unknown task status '{other}'")),
        }
    }
}

/// Execution metadata fetched once per task id and pinned on disk afterwards.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct TaskMeta {
    pub script: String,
    pub args: String,
    pub account: String,
    pub timeout_secs: u64,
}

/// Consistent view of a task taken under its lock.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TaskSnapshot {
    pub id: TaskId,
    pub clock: Clock,
    pub action: TaskAction,
    pub status: TaskStatus,
    pub alive: bool,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}
