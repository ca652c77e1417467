use crate::registry::AgentRegistry;
use opsmesh_core::{
    AgentRecord, AgentStatus, DeliveryId, Message, Notification, OpsMeshError, OpsMeshResult,
    Payload, TaskRequest, TaskResponse,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};
use uuid::Uuid;

/// The receiving end of an agent's mailbox.
///
/// Dropping it releases the mailbox: messages for the agent are refused with
/// [`OpsMeshError::RecipientUnhealthy`] until someone subscribes again.
pub struct Subscription {
    agent_id: String,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl Subscription {
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }

    /// Waits for the next message. `None` once the mailbox is closed.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Takes a message if one is already queued.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }
}

struct Mailbox {
    tx: mpsc::UnboundedSender<Message>,
    /// Receiver created before anyone subscribed.
    unclaimed: Option<mpsc::UnboundedReceiver<Message>>,
}

impl Mailbox {
    fn open() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            unclaimed: Some(rx),
        }
    }

    /// A subscriber existed and went away.
    fn is_released(&self) -> bool {
        self.unclaimed.is_none() && self.tx.is_closed()
    }
}

/// Result of matching a [`TaskResponse`] against outstanding requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correlation {
    /// A terminal response reached the waiting requester.
    Delivered,
    /// A progress report for a request that stays outstanding.
    Progress,
    /// No requester is waiting; the response was dropped.
    Unmatched,
}

/// Delivers typed messages between registered agents.
///
/// Each agent has one FIFO mailbox. Task responses never go through a mailbox:
/// they are matched to the requester through the outstanding-request map.
pub struct MessageRouter {
    registry: Arc<AgentRegistry>,
    mailboxes: Mutex<HashMap<String, Mailbox>>,
    outstanding: Mutex<HashMap<Uuid, oneshot::Sender<TaskResponse>>>,
}

impl MessageRouter {
    pub fn new(registry: Arc<AgentRegistry>) -> Self {
        Self {
            registry,
            mailboxes: Mutex::new(HashMap::new()),
            outstanding: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    /// Routes one message.
    ///
    /// Task requests and notifications are enqueued for their recipient,
    /// heartbeats update the registry and task responses are correlated.
    pub fn send(&self, msg: Message) -> OpsMeshResult<DeliveryId> {
        let delivery_id = Uuid::new_v4();
        if let Some(to) = msg.recipient().map(str::to_string) {
            self.enqueue(&to, msg, delivery_id)?;
            return Ok(delivery_id);
        }
        match msg {
            Message::Heartbeat(hb) => {
                self.registry.apply_heartbeat(&hb)?;
            }
            Message::TaskResponse(resp) => {
                self.correlate_response(resp);
            }
            Message::TaskRequest(_) | Message::Notification(_) => {}
        }
        Ok(delivery_id)
    }

    /// Sends a task request and returns a receiver for its terminal response.
    pub fn request(
        &self,
        req: TaskRequest,
    ) -> OpsMeshResult<(DeliveryId, oneshot::Receiver<TaskResponse>)> {
        let task_id = req.id;
        let (tx, rx) = oneshot::channel();
        self.outstanding.lock().insert(task_id, tx);
        match self.send(Message::TaskRequest(req)) {
            Ok(delivery_id) => Ok((delivery_id, rx)),
            Err(e) => {
                self.outstanding.lock().remove(&task_id);
                Err(e)
            }
        }
    }

    /// Stops waiting for a request; a later response is treated as unmatched.
    pub fn forget(&self, task_id: Uuid) -> bool {
        self.outstanding.lock().remove(&task_id).is_some()
    }

    pub fn is_outstanding(&self, task_id: Uuid) -> bool {
        self.outstanding.lock().contains_key(&task_id)
    }

    pub fn outstanding_count(&self) -> usize {
        self.outstanding.lock().len()
    }

    /// Matches a response to its outstanding request.
    ///
    /// Unmatched responses are protocol anomalies: logged and dropped.
    pub fn correlate_response(&self, resp: TaskResponse) -> Correlation {
        if !resp.status.is_terminal() {
            return if self.is_outstanding(resp.task_id) {
                debug!(task_id = %resp.task_id, status = %resp.status, "Task progress");
                Correlation::Progress
            } else {
                warn!(task_id = %resp.task_id, status = %resp.status, "Progress for unknown task dropped");
                Correlation::Unmatched
            };
        }

        let waiter = self.outstanding.lock().remove(&resp.task_id);
        match waiter {
            Some(tx) => {
                let task_id = resp.task_id;
                if tx.send(resp).is_err() {
                    warn!(task_id = %task_id, "Requester gone before response arrived");
                    return Correlation::Unmatched;
                }
                debug!(task_id = %task_id, "Response correlated");
                Correlation::Delivered
            }
            None => {
                warn!(
                    task_id = %resp.task_id,
                    status = %resp.status,
                    "Unmatched task response dropped"
                );
                Correlation::Unmatched
            }
        }
    }

    /// Hands the caller the read side of an agent's mailbox.
    ///
    /// Messages queued before the first subscription are kept. Subscribing
    /// again replaces the previous subscription.
    pub fn subscribe(&self, agent_id: &str) -> OpsMeshResult<Subscription> {
        if self.registry.get(agent_id).is_none() {
            return Err(OpsMeshError::UnknownAgent(agent_id.to_string()));
        }
        let mut mailboxes = self.mailboxes.lock();
        let mailbox = mailboxes
            .entry(agent_id.to_string())
            .or_insert_with(Mailbox::open);
        let rx = match mailbox.unclaimed.take() {
            Some(rx) => rx,
            None => {
                if !mailbox.tx.is_closed() {
                    warn!(agent_id, "Replacing active mailbox subscription");
                }
                let (tx, rx) = mpsc::unbounded_channel();
                mailbox.tx = tx;
                rx
            }
        };
        debug!(agent_id, "Mailbox subscribed");
        Ok(Subscription {
            agent_id: agent_id.to_string(),
            rx,
        })
    }

    /// Whether messages for `agent_id` would be accepted: either a subscriber
    /// is reading the mailbox or nobody has subscribed yet.
    pub fn is_deliverable(&self, agent_id: &str) -> bool {
        self.mailboxes
            .lock()
            .get(agent_id)
            .map_or(true, |m| !m.is_released())
    }

    /// Sends a notification to every reachable agent not in `exclude`.
    pub fn broadcast(&self, from: &str, payload: Payload, exclude: &[&str]) -> Vec<DeliveryId> {
        self.registry
            .list()
            .into_iter()
            .filter(|r| r.status.is_reachable() && r.id != from && !exclude.contains(&r.id.as_str()))
            .filter_map(|r| {
                let note = Notification {
                    from: from.to_string(),
                    to: r.id.clone(),
                    payload: payload.clone(),
                };
                match self.send(Message::Notification(note)) {
                    Ok(id) => Some(id),
                    Err(e) => {
                        warn!(agent_id = %r.id, error = %e, "Broadcast delivery failed");
                        None
                    }
                }
            })
            .collect()
    }

    /// Drops an agent's mailbox so its worker sees the channel close.
    pub fn close_mailbox(&self, agent_id: &str) -> bool {
        let closed = self.mailboxes.lock().remove(agent_id).is_some();
        if closed {
            debug!(agent_id, "Mailbox closed");
        }
        closed
    }

    pub fn close_mailboxes(&self, agents: &[AgentRecord]) {
        for agent in agents {
            self.close_mailbox(&agent.id);
        }
    }

    fn enqueue(&self, to: &str, msg: Message, delivery_id: DeliveryId) -> OpsMeshResult<()> {
        match self.registry.status(to) {
            None => return Err(OpsMeshError::RecipientNotFound(to.to_string())),
            Some(AgentStatus::Unhealthy | AgentStatus::Evicted) => {
                return Err(OpsMeshError::RecipientUnhealthy(to.to_string()));
            }
            Some(_) => {}
        }

        let kind = msg.kind();
        let mut mailboxes = self.mailboxes.lock();
        let mailbox = mailboxes.entry(to.to_string()).or_insert_with(Mailbox::open);
        if mailbox.tx.send(msg).is_err() {
            drop(mailboxes);
            warn!(to, kind, "Mailbox released, message refused");
            return Err(OpsMeshError::RecipientUnhealthy(to.to_string()));
        }
        drop(mailboxes);

        debug!(to, kind, delivery_id = %delivery_id, "Message enqueued");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::config::RegistryConfig;
    use opsmesh_core::{Heartbeat, TaskStatus};

    fn setup() -> (Arc<AgentRegistry>, MessageRouter) {
        let registry = Arc::new(AgentRegistry::new(RegistryConfig::default()));
        registry
            .register(AgentRecord::local("frontdesk", "Front Desk", ["checkin"]))
            .unwrap();
        let router = MessageRouter::new(registry.clone());
        (registry, router)
    }

    fn request_to(to: &str) -> TaskRequest {
        TaskRequest::new("orchestrator", to, "patient_checkin", Payload::new(), 30)
    }

    #[tokio::test]
    async fn test_send_unknown_recipient() {
        let (_, router) = setup();
        let err = router.send(Message::TaskRequest(request_to("billing"))).unwrap_err();
        assert!(matches!(err, OpsMeshError::RecipientNotFound(_)));
    }

    #[tokio::test]
    async fn test_send_unhealthy_recipient() {
        let (registry, router) = setup();
        let last = registry.get("frontdesk").unwrap().last_heartbeat;
        registry.sweep_at(last + chrono::Duration::seconds(61));
        let err = router.send(Message::TaskRequest(request_to("frontdesk"))).unwrap_err();
        assert!(matches!(err, OpsMeshError::RecipientUnhealthy(_)));
    }

    #[tokio::test]
    async fn test_mailbox_is_fifo_and_buffers_before_subscribe() {
        let (_, router) = setup();
        let first = request_to("frontdesk");
        let second = request_to("frontdesk");
        router.send(Message::TaskRequest(first.clone())).unwrap();
        router.send(Message::TaskRequest(second.clone())).unwrap();

        let mut sub = router.subscribe("frontdesk").unwrap();
        match sub.recv().await.unwrap() {
            Message::TaskRequest(r) => assert_eq!(r.id, first.id),
            other => panic!("unexpected {other:?}"),
        }
        match sub.recv().await.unwrap() {
            Message::TaskRequest(r) => assert_eq!(r.id, second.id),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dropped_subscription_refuses_messages() {
        let (_, router) = setup();
        let sub = router.subscribe("frontdesk").unwrap();
        assert!(router.is_deliverable("frontdesk"));
        drop(sub);
        assert!(!router.is_deliverable("frontdesk"));

        let err = router.send(Message::TaskRequest(request_to("frontdesk"))).unwrap_err();
        assert!(matches!(err, OpsMeshError::RecipientUnhealthy(_)));
        assert!(router.request(request_to("frontdesk")).is_err());
        assert_eq!(router.outstanding_count(), 0);

        let mut sub = router.subscribe("frontdesk").unwrap();
        assert!(sub.try_recv().is_none());
        let req = request_to("frontdesk");
        router.send(Message::TaskRequest(req.clone())).unwrap();
        match sub.try_recv() {
            Some(Message::TaskRequest(r)) => assert_eq!(r.id, req.id),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_subscribe_unknown_agent() {
        let (_, router) = setup();
        assert!(matches!(
            router.subscribe("ghost"),
            Err(OpsMeshError::UnknownAgent(_))
        ));
    }

    #[tokio::test]
    async fn test_request_correlates_terminal_response() {
        let (_, router) = setup();
        let req = request_to("frontdesk");
        let id = req.id;
        let (_, rx) = router.request(req).unwrap();
        assert!(router.is_outstanding(id));

        let progress = TaskResponse::progress(id, TaskStatus::Running);
        assert_eq!(router.correlate_response(progress), Correlation::Progress);
        assert!(router.is_outstanding(id));

        let mut result = Payload::new();
        result.insert("patient_id".into(), serde_json::json!(7));
        router
            .send(Message::TaskResponse(TaskResponse::completed(id, result)))
            .unwrap();
        let resp = rx.await.unwrap();
        assert_eq!(resp.status, TaskStatus::Completed);
        assert_eq!(router.outstanding_count(), 0);
    }

    #[tokio::test]
    async fn test_unmatched_and_duplicate_responses_are_dropped() {
        let (_, router) = setup();
        let stray = TaskResponse::failed(Uuid::new_v4(), "boom");
        assert_eq!(router.correlate_response(stray), Correlation::Unmatched);

        let req = request_to("frontdesk");
        let id = req.id;
        let (_, _rx) = router.request(req).unwrap();
        let done = TaskResponse::completed(id, Payload::new());
        assert_eq!(router.correlate_response(done.clone()), Correlation::Delivered);
        assert_eq!(router.correlate_response(done), Correlation::Unmatched);
    }

    #[tokio::test]
    async fn test_forget_discards_late_response() {
        let (_, router) = setup();
        let req = request_to("frontdesk");
        let id = req.id;
        let (_, _rx) = router.request(req).unwrap();
        assert!(router.forget(id));
        let late = TaskResponse::completed(id, Payload::new());
        assert_eq!(router.correlate_response(late), Correlation::Unmatched);
    }

    #[tokio::test]
    async fn test_failed_request_leaves_nothing_outstanding() {
        let (_, router) = setup();
        assert!(router.request(request_to("nobody")).is_err());
        assert_eq!(router.outstanding_count(), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_message_updates_registry() {
        let (registry, router) = setup();
        router
            .send(Message::Heartbeat(Heartbeat {
                agent_id: "frontdesk".into(),
                capabilities: vec![],
                current_load: 9,
            }))
            .unwrap();
        assert_eq!(registry.status("frontdesk"), Some(AgentStatus::Busy));
    }

    #[tokio::test]
    async fn test_broadcast_skips_excluded_and_unhealthy() {
        let (registry, router) = setup();
        registry.register(AgentRecord::local("queue", "Queue", ["queue"])).unwrap();
        registry.register(AgentRecord::local("staff", "Staff", ["staff"])).unwrap();
        let mut queue = router.subscribe("queue").unwrap();

        let sent = router.broadcast("orchestrator", Payload::new(), &["staff"]);
        assert_eq!(sent.len(), 2);
        assert!(matches!(queue.try_recv(), Some(Message::Notification(_))));
    }

    #[tokio::test]
    async fn test_close_mailbox_ends_subscription() {
        let (_, router) = setup();
        let mut sub = router.subscribe("frontdesk").unwrap();
        assert!(router.close_mailbox("frontdesk"));
        assert!(sub.recv().await.is_none());
    }
}
