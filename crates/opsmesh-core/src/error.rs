use thiserror::Error;

/// A convenience `Result` alias using [`OpsMeshError`].
pub type OpsMeshResult<T> = Result<T, OpsMeshError>;

/// Top-level error type for the coordination layer.
///
/// The first group of variants is the protocol taxonomy surfaced to callers;
/// the rest cover infrastructure failures around it.
#[derive(Error, Debug)]
pub enum OpsMeshError {
    /// An agent record failed validation on registration.
    #[error("Invalid agent record: {0}")]
    InvalidRecord(String),

    /// The referenced agent is not registered.
    #[error("Unknown agent: {0}")]
    UnknownAgent(String),

    /// A message named a recipient that is not in the registry.
    #[error("Recipient not found: {0}")]
    RecipientNotFound(String),

    /// A message named a recipient that is unhealthy or evicted.
    #[error("Recipient unhealthy: {0}")]
    RecipientUnhealthy(String),

    /// No live agent advertises the capability a step targets.
    #[error("No capable agent for capability '{0}'")]
    NoCapableAgent(String),

    /// The `depends_on` graph of a flow definition contains a cycle.
    #[error("Cyclic flow definition: circular dependency involving step '{0}'")]
    CyclicFlowDefinition(String),

    /// A step depends on a step id that does not exist in the definition.
    #[error("Step '{step}' depends on unknown step '{reference}'")]
    UnknownStepReference {
        /// The step declaring the dependency.
        step: String,
        /// The missing step id.
        reference: String,
    },

    /// A step did not answer within its deadline.
    #[error("Step '{step}' timed out after {timeout_seconds}s")]
    StepTimeout {
        /// The step that timed out.
        step: String,
        /// The deadline that elapsed.
        timeout_seconds: u64,
    },

    /// The agent executing a task reported an error.
    #[error("Task execution error: {0}")]
    TaskExecution(String),

    /// A flow definition is structurally invalid (empty ids, empty capability).
    #[error("Invalid flow definition: {0}")]
    InvalidFlowDefinition(String),

    /// Two steps in one flow definition share an id.
    #[error("Duplicate step id '{0}' in flow definition")]
    DuplicateStep(String),

    /// No flow definition is registered under the given id.
    #[error("Unknown flow definition: {0}")]
    UnknownFlowDefinition(String),

    /// No flow instance exists with the given id.
    #[error("Unknown flow instance: {0}")]
    UnknownFlowInstance(String),

    /// A carrier (in-process channel or network) failed to move a message.
    #[error("Transport error: {0}")]
    Transport(String),

    /// An error in configuration parsing or validation.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OpsMeshError {
    /// Short machine-readable name of the variant, used in logs and API bodies.
    pub fn kind(&self) -> &'static str {
        match self {
            OpsMeshError::InvalidRecord(_) => "invalid_record",
            OpsMeshError::UnknownAgent(_) => "unknown_agent",
            OpsMeshError::RecipientNotFound(_) => "recipient_not_found",
            OpsMeshError::RecipientUnhealthy(_) => "recipient_unhealthy",
            OpsMeshError::NoCapableAgent(_) => "no_capable_agent",
            OpsMeshError::CyclicFlowDefinition(_) => "cyclic_flow_definition",
            OpsMeshError::UnknownStepReference { .. } => "unknown_step_reference",
            OpsMeshError::StepTimeout { .. } => "step_timeout",
            OpsMeshError::TaskExecution(_) => "task_execution_error",
            OpsMeshError::InvalidFlowDefinition(_) => "invalid_flow_definition",
            OpsMeshError::DuplicateStep(_) => "duplicate_step",
            OpsMeshError::UnknownFlowDefinition(_) => "unknown_flow_definition",
            OpsMeshError::UnknownFlowInstance(_) => "unknown_flow_instance",
            OpsMeshError::Transport(_) => "transport_error",
            OpsMeshError::Config(_) => "config_error",
            OpsMeshError::Json(_) => "json_error",
            OpsMeshError::Io(_) => "io_error",
        }
    }

    /// Whether the error comes from template validation (never produces an instance).
    pub fn is_template_error(&self) -> bool {
        matches!(
            self,
            OpsMeshError::CyclicFlowDefinition(_)
                | OpsMeshError::UnknownStepReference { .. }
                | OpsMeshError::InvalidFlowDefinition(_)
                | OpsMeshError::DuplicateStep(_)
        )
    }
}
