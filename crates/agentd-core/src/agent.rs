use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::coordinator::CoordinatorLink;
use crate::models::{CoreResult, ReportRequest, ReportResponse};
use crate::registry::TaskRegistry;
use crate::report::ReportFormatter;

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct HeartbeatSummary {
    pub reported: usize,
    pub assigned: usize,
    pub removed: usize,
}

/// Report-then-reconcile cycle against the coordinator.
pub struct Agent {
    ident: String,
    registry: TaskRegistry,
    link: Arc<dyn CoordinatorLink>,
    formatter: ReportFormatter,
}

impl Agent {
    pub fn new(ident: impl Into<String>, registry: TaskRegistry, link: Arc<dyn CoordinatorLink>) -> Self {
        Self {
            ident: ident.into(),
            registry,
            link,
            formatter: ReportFormatter::new(),
        }
    }

    pub fn ident(&self) -> &str {
        &self.ident
    }

    pub fn registry(&self) -> &TaskRegistry {
        &self.registry
    }

    pub fn report_request(&self) -> ReportRequest {
        ReportRequest {
            ident: self.ident.clone(),
            report_tasks: self.formatter.format(self.registry.snapshot()),
        }
    }

    /// Reports finished tasks, applies the returned assignments and drops
    /// tasks that are no longer assigned. Blocks on the coordinator link; on a
    /// failed exchange the registry is left untouched.
    pub fn heartbeat(&mut self) -> CoreResult<HeartbeatSummary> {
        let request = self.report_request();
        let reported = request.report_tasks.len();

        let response = self
            .link
            .report(&request)
            .and_then(ReportResponse::into_result)
            .map_err(|error| {
                tracing::warn!(kind = ?error.kind, message = %error.message, "report exchange failed");
                error
            })?;

        let mut assigned = HashSet::with_capacity(response.assign_tasks.len());
        for assignment in &response.assign_tasks {
            assigned.insert(assignment.id);
            self.registry.assign_task(assignment);
        }

        let removed = self.registry.reconcile(&assigned);

        Ok(HeartbeatSummary {
            reported,
            assigned: response.assign_tasks.len(),
            removed: removed.len(),
        })
    }

    pub async fn wait_idle(&self, timeout: Option<Duration>) -> CoreResult<()> {
        self.registry.wait_idle(timeout).await
    }
}
