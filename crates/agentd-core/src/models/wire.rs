//! Payloads exchanged with the coordinator.

use serde::{Deserialize, Serialize};

use crate::models::{Clock, TaskId, TaskStatus};

/// One entry of the assignment feed. `action` stays a raw string so unknown
/// actions can be logged and skipped instead of failing the whole response.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct AssignTask {
    pub id: TaskId,
    pub clock: Clock,
    pub action: String,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ReportTask {
    pub id: TaskId,
    pub clock: Clock,
    pub status: TaskStatus,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct ReportRequest {
    pub ident: String,
    pub report_tasks: Vec<ReportTask>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportResponse {
    pub message: String,
    pub assign_tasks: Vec<AssignTask>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct TaskMetaRequest {
    pub id: TaskId,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskMetaResponse {
    pub message: String,
    pub script: String,
    pub args: String,
    pub account: String,
    pub timeout: i64,
}
