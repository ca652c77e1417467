use crate::router::{MessageRouter, Subscription};
use crate::transport::{failure_text, AgentTransport};
use chrono::Utc;
use opsmesh_core::{Heartbeat, Message, TaskRequest, TaskResponse};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Event name of the notification that withdraws an in-flight task.
pub const TASK_CANCELLED_EVENT: &str = "task_cancelled";

/// Consumes one agent's mailbox and feeds the answers back to the router.
///
/// Requests are taken in mailbox order and run concurrently; the number in
/// flight is the load reported with each heartbeat.
pub struct AgentWorker {
    subscription: Subscription,
    transport: Arc<dyn AgentTransport>,
    router: Arc<MessageRouter>,
    heartbeat_interval: Option<Duration>,
}

impl AgentWorker {
    pub fn new(
        subscription: Subscription,
        transport: Arc<dyn AgentTransport>,
        router: Arc<MessageRouter>,
    ) -> Self {
        Self {
            subscription,
            transport,
            router,
            heartbeat_interval: None,
        }
    }

    /// Emits a heartbeat for this agent at the given interval.
    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    pub fn agent_id(&self) -> &str {
        self.subscription.agent_id()
    }

    pub fn spawn(self, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Runs until shutdown or until the mailbox is closed.
    pub async fn run(mut self, shutdown: CancellationToken) {
        let agent_id = self.agent_id().to_string();
        info!(agent_id = %agent_id, transport = self.transport.name(), "Agent worker started");

        let mut heartbeat = self.heartbeat_interval.map(|period| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval
        });
        let mut in_flight: JoinSet<Uuid> = JoinSet::new();
        let mut aborts: HashMap<Uuid, AbortHandle> = HashMap::new();

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    debug!(agent_id = %agent_id, "Agent worker shutting down");
                    break;
                }
                msg = self.subscription.recv() => {
                    let Some(msg) = msg else {
                        info!(agent_id = %agent_id, "Mailbox closed, agent worker stopping");
                        break;
                    };
                    self.dispatch(msg, &mut in_flight, &mut aborts).await;
                }
                Some(done) = in_flight.join_next(), if !in_flight.is_empty() => {
                    match done {
                        Ok(task_id) => {
                            aborts.remove(&task_id);
                        }
                        Err(e) if e.is_cancelled() => {}
                        Err(e) => warn!(agent_id = %agent_id, error = %e, "Task panicked"),
                    }
                }
                _ = tick(heartbeat.as_mut()) => {
                    let hb = Heartbeat {
                        agent_id: agent_id.clone(),
                        capabilities: Vec::new(),
                        current_load: u32::try_from(in_flight.len()).unwrap_or(u32::MAX),
                    };
                    if let Err(e) = self.router.send(Message::Heartbeat(hb)) {
                        warn!(agent_id = %agent_id, error = %e, "Heartbeat rejected");
                    }
                }
            }
        }

        in_flight.abort_all();
    }

    async fn dispatch(
        &self,
        msg: Message,
        in_flight: &mut JoinSet<Uuid>,
        aborts: &mut HashMap<Uuid, AbortHandle>,
    ) {
        match msg {
            Message::TaskRequest(req) => {
                let task_id = req.id;
                let transport = self.transport.clone();
                let router = self.router.clone();
                let handle = in_flight.spawn(async move {
                    let response = execute(transport.as_ref(), req).await;
                    router.correlate_response(response);
                    task_id
                });
                aborts.insert(task_id, handle);
            }
            Message::Notification(note) => {
                if let Some(task_id) = cancelled_task(&note.payload) {
                    if let Some(handle) = aborts.remove(&task_id) {
                        handle.abort();
                        info!(agent_id = %self.agent_id(), task_id = %task_id, "In-flight task withdrawn");
                    }
                }
                let msg = Message::Notification(note);
                if let Err(e) = self.transport.deliver(&msg).await {
                    warn!(agent_id = %self.agent_id(), error = %e, "Notification delivery failed");
                }
            }
            other => {
                debug!(agent_id = %self.agent_id(), kind = other.kind(), "Ignoring message kind in mailbox");
            }
        }
    }
}

async fn execute(transport: &dyn AgentTransport, req: TaskRequest) -> TaskResponse {
    if req.is_expired_at(Utc::now()) {
        debug!(task_id = %req.id, "Request expired before execution");
        return TaskResponse::failed(req.id, "expired");
    }
    let task_id = req.id;
    match transport.deliver(&Message::TaskRequest(req)).await {
        Ok(Some(response)) => response,
        Ok(None) => TaskResponse::failed(task_id, "agent returned no response"),
        Err(e) => {
            warn!(task_id = %task_id, error = %e, "Transport failed");
            TaskResponse::failed(task_id, failure_text(e))
        }
    }
}

fn cancelled_task(payload: &opsmesh_core::Payload) -> Option<Uuid> {
    if payload.get("event").and_then(|v| v.as_str()) != Some(TASK_CANCELLED_EVENT) {
        return None;
    }
    payload
        .get("task_id")
        .and_then(|v| v.as_str())
        .and_then(|s| Uuid::parse_str(s).ok())
}

async fn tick(interval: Option<&mut tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use crate::registry::AgentRegistry;
    use crate::transport::{ActionHandler, LocalTransport};
    use async_trait::async_trait;
    use opsmesh_core::{AgentRecord, AgentStatus, Notification, OpsMeshResult, Payload, TaskStatus};
    use serde_json::json;

    struct Stamp;

    #[async_trait]
    impl ActionHandler for Stamp {
        async fn execute_action(&self, action: &str, mut payload: Payload) -> OpsMeshResult<Payload> {
            if action == "stall" {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            payload.insert("handled".into(), json!(action));
            Ok(payload)
        }
    }

    fn setup() -> (Arc<AgentRegistry>, Arc<MessageRouter>) {
        let registry = Arc::new(AgentRegistry::new(RegistryConfig {
            busy_load_threshold: 1,
            ..RegistryConfig::default()
        }));
        registry
            .register(AgentRecord::local("queue", "Queue", ["queue"]))
            .unwrap();
        let router = Arc::new(MessageRouter::new(registry.clone()));
        (registry, router)
    }

    fn start(router: &Arc<MessageRouter>, shutdown: &CancellationToken) -> JoinHandle<()> {
        let sub = router.subscribe("queue").unwrap();
        AgentWorker::new(sub, Arc::new(LocalTransport::new(Arc::new(Stamp))), router.clone())
            .spawn(shutdown.clone())
    }

    #[tokio::test]
    async fn test_worker_answers_requests() {
        let (_, router) = setup();
        let shutdown = CancellationToken::new();
        let handle = start(&router, &shutdown);

        let req = TaskRequest::new("orchestrator", "queue", "add_to_queue", Payload::new(), 30);
        let (_, rx) = router.request(req).unwrap();
        let resp = rx.await.unwrap();
        assert_eq!(resp.status, TaskStatus::Completed);
        assert_eq!(resp.result.unwrap()["handled"], json!("add_to_queue"));

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_request_not_executed() {
        let (_, router) = setup();
        let shutdown = CancellationToken::new();
        let _handle = start(&router, &shutdown);

        let mut req = TaskRequest::new("orchestrator", "queue", "add_to_queue", Payload::new(), 1);
        req.created_at = Utc::now() - chrono::Duration::seconds(5);
        let (_, rx) = router.request(req).unwrap();
        let resp = rx.await.unwrap();
        assert_eq!(resp.status, TaskStatus::Failed);
        assert_eq!(resp.error.as_deref(), Some("expired"));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_worker_stops_when_mailbox_closed() {
        let (_, router) = setup();
        let handle = start(&router, &CancellationToken::new());
        router.close_mailbox("queue");
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_reports_load() {
        let (registry, router) = setup();
        let shutdown = CancellationToken::new();
        let sub = router.subscribe("queue").unwrap();
        let _handle = AgentWorker::new(
            sub,
            Arc::new(LocalTransport::new(Arc::new(Stamp))),
            router.clone(),
        )
        .with_heartbeat(Duration::from_secs(5))
        .spawn(shutdown.clone());

        let req = TaskRequest::new("orchestrator", "queue", "stall", Payload::new(), 7200);
        let task_id = req.id;
        let (_, _rx) = router.request(req).unwrap();

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(registry.status("queue"), Some(AgentStatus::Busy));
        assert_eq!(registry.get("queue").unwrap().load, 1);

        let mut payload = Payload::new();
        payload.insert("event".into(), json!(TASK_CANCELLED_EVENT));
        payload.insert("task_id".into(), json!(task_id.to_string()));
        router
            .send(Message::Notification(Notification {
                from: "orchestrator".into(),
                to: "queue".into(),
                payload,
            }))
            .unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(registry.get("queue").unwrap().load, 0);
        assert_eq!(registry.status("queue"), Some(AgentStatus::Available));
        shutdown.cancel();
    }
}
