pub mod error;
pub mod task;
pub mod wire;

pub use error::{CoreError, CoreErrorKind, CoreResult};
pub use task::{Clock, TaskAction, TaskId, TaskMeta, TaskSnapshot, TaskStatus};
pub use wire::{
    AssignTask, ReportRequest, ReportResponse, ReportTask, TaskMetaRequest, TaskMetaResponse,
};
