//! Carriers between an agent's mailbox and the code that executes its actions.
//!
//! A worker owns exactly one [`AgentTransport`], chosen when it is built:
//! [`LocalTransport`] calls an in-process [`ActionHandler`], while
//! [`HttpTransport`] forwards messages to a remote agent over HTTP.

use async_trait::async_trait;
use opsmesh_core::{Message, OpsMeshError, OpsMeshResult, Payload, TaskResponse};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Domain work an agent can perform.
#[async_trait]
pub trait ActionHandler: Send + Sync {
    /// Runs `action` with `payload`. Errors become failed task responses.
    async fn execute_action(&self, action: &str, payload: Payload) -> OpsMeshResult<Payload>;

    /// Receives a one-way notification. Ignored by default.
    async fn on_notification(&self, _from: &str, _payload: &Payload) {}
}

/// Moves one mailbox message to its agent.
#[async_trait]
pub trait AgentTransport: Send + Sync {
    /// Short carrier name for logs.
    fn name(&self) -> &'static str;

    /// Delivers `msg`. A task request yields the agent's response; other
    /// messages yield `None`.
    async fn deliver(&self, msg: &Message) -> OpsMeshResult<Option<TaskResponse>>;
}

/// Text carried in a failed response for `err`.
pub(crate) fn failure_text(err: OpsMeshError) -> String {
    match err {
        OpsMeshError::TaskExecution(msg) => msg,
        other => other.to_string(),
    }
}

/// Calls an in-process handler directly.
pub struct LocalTransport {
    handler: Arc<dyn ActionHandler>,
}

impl LocalTransport {
    pub fn new(handler: Arc<dyn ActionHandler>) -> Self {
        Self { handler }
    }
}

#[async_trait]
impl AgentTransport for LocalTransport {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn deliver(&self, msg: &Message) -> OpsMeshResult<Option<TaskResponse>> {
        match msg {
            Message::TaskRequest(req) => {
                let response = match self
                    .handler
                    .execute_action(&req.action, req.payload.clone())
                    .await
                {
                    Ok(result) => TaskResponse::completed(req.id, result),
                    Err(e) => TaskResponse::failed(req.id, failure_text(e)),
                };
                Ok(Some(response))
            }
            Message::Notification(note) => {
                self.handler.on_notification(&note.from, &note.payload).await;
                Ok(None)
            }
            Message::TaskResponse(_) | Message::Heartbeat(_) => Ok(None),
        }
    }
}

/// Path, relative to an agent's endpoint, that accepts protocol messages.
pub const AGENT_MESSAGES_PATH: &str = "/a2a/messages";

/// POSTs each message as JSON to a remote agent.
///
/// A task request is answered synchronously with a [`TaskResponse`] body.
pub struct HttpTransport {
    http: reqwest::Client,
    url: String,
}

impl HttpTransport {
    pub fn new(endpoint: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            url: format!("{}{AGENT_MESSAGES_PATH}", endpoint.trim_end_matches('/')),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl AgentTransport for HttpTransport {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn deliver(&self, msg: &Message) -> OpsMeshResult<Option<TaskResponse>> {
        let mut request = self.http.post(&self.url).json(msg);
        if let Message::TaskRequest(req) = msg {
            request = request.timeout(Duration::from_secs(req.timeout_seconds.max(1)));
        }

        let resp = request
            .send()
            .await
            .map_err(|e| OpsMeshError::Transport(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(OpsMeshError::Transport(format!(
                "agent at {} answered {status}: {body}",
                self.url
            )));
        }
        debug!(url = %self.url, kind = msg.kind(), "Message delivered over HTTP");

        match msg {
            Message::TaskRequest(req) => {
                let response: TaskResponse = resp
                    .json()
                    .await
                    .map_err(|e| OpsMeshError::Transport(e.to_string()))?;
                if response.task_id != req.id {
                    return Err(OpsMeshError::Transport(format!(
                        "agent answered task {} for request {}",
                        response.task_id, req.id
                    )));
                }
                Ok(Some(response))
            }
            _ => Ok(None),
        }
    }
}
