//! Contracts for the coordinator transport. Implementations block the calling
//! thread and are expected to reset their connection after a transport error
//! or a refused metadata fetch.

use crate::models::{
    CoreError, CoreErrorKind, CoreResult, ReportRequest, ReportResponse, TaskId, TaskMeta,
    TaskMetaResponse,
};

pub trait MetadataSource: Send + Sync {
    fn fetch_meta(&self, id: TaskId) -> CoreResult<TaskMeta>;
}

pub trait CoordinatorLink: Send + Sync {
    fn report(&self, request: &ReportRequest) -> CoreResult<ReportResponse>;
}

impl TaskMetaResponse {
    /// A non-empty message is a coordinator-side failure. Negative timeouts
    /// read as "not declared".
    pub fn into_meta(self, id: TaskId) -> CoreResult<TaskMeta> {
        if !self.message.is_empty() {
            return Err(CoreError::for_task(id, CoreErrorKind::Coordinator, self.message));
        }

        Ok(TaskMeta {
            script: self.script,
            args: self.args,
            account: self.account,
            timeout_secs: u64::try_from(self.timeout).unwrap_or(0),
        })
    }
}

impl ReportResponse {
    pub fn into_result(self) -> CoreResult<Self> {
        if self.message.is_empty() {
            Ok(self)
        } else {
            Err(CoreError::new(CoreErrorKind::Coordinator, self.message))
        }
    }
}
