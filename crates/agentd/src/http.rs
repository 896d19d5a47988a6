//! JSON-over-HTTP coordinator transport.
//!
//! One live link is kept at a time. A transport failure, or a failure message
//! on the metadata path, closes it and the next call connects to the next
//! server in the list.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use agentd_core::coordinator::{CoordinatorLink, MetadataSource};
use agentd_core::models::{
    CoreError, CoreErrorKind, CoreResult, ReportRequest, ReportResponse, TaskId, TaskMeta,
    TaskMetaRequest, TaskMetaResponse,
};
use serde::Serialize;
use serde::de::DeserializeOwned;

const TASK_META_PATH: &str = "/v1/agent/task-meta";
const REPORT_PATH: &str = "/v1/agent/report";

pub struct HttpCoordinator {
    servers: Vec<String>,
    timeout: Duration,
    state: Mutex<LinkState>,
}

#[derive(Default)]
struct LinkState {
    next_server: usize,
    link: Option<Link>,
}

#[derive(Clone)]
struct Link {
    server: String,
    agent: ureq::Agent,
}

impl HttpCoordinator {
    pub fn new(servers: Vec<String>, timeout: Duration) -> CoreResult<Self> {
        if servers.is_empty() {
            return Err(CoreError::new(
                CoreErrorKind::InvalidInput,
                "at least one coordinator server is required",
            ));
        }

        Ok(Self {
            servers,
            timeout,
            state: Mutex::new(LinkState::default()),
        })
    }

    fn call<Req, Resp>(&self, link: &Link, path: &str, request: &Req) -> CoreResult<Resp>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let body = serde_json::to_string(request).map_err(|error| {
            CoreError::new(
                CoreErrorKind::Internal,
                format!("cannot encode request for {path}: {error}"),
            )
        })?;

        let url = format!("{}{}", link.server, path);

        let text = link
            .agent
            .post(&url)
            .set("Content-Type", "application/json")
            .send_string(&body)
            .map_err(|error| error.to_string())
            .and_then(|response| response.into_string().map_err(|error| error.to_string()));

        let text = match text {
            Ok(text) => text,
            Err(message) => {
                tracing::warn!(server = %link.server, path, error = %message, "coordinator call failed, closing link");
                self.close_link(&link.server);
                return Err(CoreError::new(
                    CoreErrorKind::Transport,
                    format!("{url}: {message}"),
                ));
            }
        };

        serde_json::from_str(&text).map_err(|error| {
            tracing::warn!(server = %link.server, path, %error, "undecodable coordinator response, closing link");
            self.close_link(&link.server);
            CoreError::new(
                CoreErrorKind::Transport,
                format!("{url}: cannot decode response: {error}"),
            )
        })
    }

    fn current_link(&self) -> Link {
        let mut state = self.lock_state();
        if let Some(link) = &state.link {
            return link.clone();
        }

        let server = self.servers[state.next_server % self.servers.len()].clone();
        state.next_server = (state.next_server + 1) % self.servers.len();

        let link = Link {
            server,
            agent: ureq::AgentBuilder::new().timeout(self.timeout).build(),
        };
        tracing::info!(server = %link.server, "connected to coordinator");
        state.link = Some(link.clone());
        link
    }

    // Only the link that failed is dropped; another caller may already have
    // reconnected elsewhere.
    fn close_link(&self, server: &str) {
        let mut state = self.lock_state();
        if state.link.as_ref().is_some_and(|link| link.server == server) {
            state.link = None;
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl MetadataSource for HttpCoordinator {
    fn fetch_meta(&self, id: TaskId) -> CoreResult<TaskMeta> {
        let link = self.current_link();
        let response: TaskMetaResponse = self
            .call(&link, TASK_META_PATH, &TaskMetaRequest { id })
            .map_err(|mut error| {
                error.task = Some(id);
                error
            })?;

        response.into_meta(id).map_err(|error| {
            tracing::warn!(server = %link.server, task_id = id.0, message = %error.message, "coordinator refused task metadata, closing link");
            self.close_link(&link.server);
            error
        })
    }
}

impl CoordinatorLink for HttpCoordinator {
    fn report(&self, request: &ReportRequest) -> CoreResult<ReportResponse> {
        let link = self.current_link();
        self.call(&link, REPORT_PATH, request)
    }
}
