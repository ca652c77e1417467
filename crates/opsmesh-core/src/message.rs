use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Free-form JSON object carried by requests, results and notifications.
pub type Payload = serde_json::Map<String, serde_json::Value>;

/// Identifier handed back by the router for every accepted message.
pub type DeliveryId = Uuid;

/// Priority of a protocol message, lowest to highest.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    /// Background traffic such as heartbeats.
    Low,
    /// Default priority.
    #[default]
    Normal,
    /// Time-sensitive work.
    High,
    /// Work that should pre-empt normal traffic.
    Urgent,
    /// Life-safety or emergency traffic.
    Critical,
}

impl MessagePriority {
    /// Numeric level, 1 (low) through 5 (critical).
    pub fn level(self) -> u8 {
        match self {
            MessagePriority::Low => 1,
            MessagePriority::Normal => 2,
            MessagePriority::High => 3,
            MessagePriority::Urgent => 4,
            MessagePriority::Critical => 5,
        }
    }
}

/// Lifecycle status of a task, as reported in a [`TaskResponse`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Terminal statuses settle an outstanding request; the others are progress reports.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Completed => write!(f, "completed"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A request for an agent to perform a domain action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequest {
    /// Unique id; responses refer back to it.
    pub id: Uuid,
    /// Sender agent id.
    pub from: String,
    /// Recipient agent id.
    pub to: String,
    /// Action name understood by the recipient.
    pub action: String,
    /// Action input.
    #[serde(default)]
    pub payload: Payload,
    #[serde(default)]
    pub priority: MessagePriority,
    /// Groups related requests, e.g. all steps of one flow instance.
    #[serde(default)]
    pub correlation_id: Option<String>,
    pub created_at: DateTime<Utc>,
    /// How long the sender waits for an answer.
    pub timeout_seconds: u64,
}

impl TaskRequest {
    /// Creates a request with a fresh id, normal priority and the given deadline.
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        action: impl Into<String>,
        payload: Payload,
        timeout_seconds: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            from: from.into(),
            to: to.into(),
            action: action.into(),
            payload,
            priority: MessagePriority::Normal,
            correlation_id: None,
            created_at: Utc::now(),
            timeout_seconds,
        }
    }

    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_correlation(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Instant after which the sender no longer waits for this request.
    pub fn expires_at(&self) -> DateTime<Utc> {
        let secs = i64::try_from(self.timeout_seconds).unwrap_or(i64::MAX);
        self.created_at + Duration::seconds(secs)
    }

    /// Whether the request's deadline has passed at `now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at()
    }
}

/// The answer to a [`TaskRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResponse {
    /// Id of the request being answered.
    pub task_id: Uuid,
    pub status: TaskStatus,
    /// Action output on success.
    #[serde(default)]
    pub result: Option<Payload>,
    /// Agent-provided error text on failure.
    #[serde(default)]
    pub error: Option<String>,
    pub completed_at: DateTime<Utc>,
}

impl TaskResponse {
    /// Creates a successful response.
    pub fn completed(task_id: Uuid, result: Payload) -> Self {
        Self {
            task_id,
            status: TaskStatus::Completed,
            result: Some(result),
            error: None,
            completed_at: Utc::now(),
        }
    }

    /// Creates a failed response carrying the agent's error.
    pub fn failed(task_id: Uuid, error: impl Into<String>) -> Self {
        Self {
            task_id,
            status: TaskStatus::Failed,
            result: None,
            error: Some(error.into()),
            completed_at: Utc::now(),
        }
    }

    /// Creates a non-terminal progress report.
    pub fn progress(task_id: Uuid, status: TaskStatus) -> Self {
        Self {
            task_id,
            status,
            result: None,
            error: None,
            completed_at: Utc::now(),
        }
    }
}

/// Periodic liveness signal from an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub agent_id: String,
    /// Capabilities currently advertised; empty means "unchanged".
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Number of tasks the agent is currently handling.
    #[serde(default)]
    pub current_load: u32,
}

/// One-way informational message between agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub payload: Payload,
}

/// Every message carried between agents, discriminated by `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Message {
    TaskRequest(TaskRequest),
    TaskResponse(TaskResponse),
    Heartbeat(Heartbeat),
    Notification(Notification),
}

impl Message {
    /// The `kind` discriminator as it appears on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::TaskRequest(_) => "task_request",
            Message::TaskResponse(_) => "task_response",
            Message::Heartbeat(_) => "heartbeat",
            Message::Notification(_) => "notification",
        }
    }

    /// Mailbox this message is addressed to, if it is mailbox-delivered.
    pub fn recipient(&self) -> Option<&str> {
        match self {
            Message::TaskRequest(req) => Some(&req.to),
            Message::Notification(note) => Some(&note.to),
            Message::TaskResponse(_) | Message::Heartbeat(_) => None,
        }
    }
}
