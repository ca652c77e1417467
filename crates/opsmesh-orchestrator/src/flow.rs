use crate::retry::RetryPolicy;
use chrono::{DateTime, Utc};
use opsmesh_core::{MessagePriority, OpsMeshError, OpsMeshResult, Payload};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

/// One step of a flow template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowStep {
    pub step_id: String,
    /// Capability resolved to a concrete agent at dispatch time.
    pub target_capability: String,
    pub action: String,
    /// Steps that must have completed before this one dispatches.
    #[serde(default)]
    pub depends_on: Vec<String>,
    #[serde(default = "default_step_timeout")]
    pub timeout_seconds: u64,
    /// A failed required step fails the whole instance; an optional one is skipped.
    #[serde(default = "default_required")]
    pub required: bool,
    #[serde(default)]
    pub priority: MessagePriority,
    #[serde(default)]
    pub description: String,
}

fn default_step_timeout() -> u64 {
    30
}
fn default_required() -> bool {
    true
}

impl FlowStep {
    pub fn new(
        step_id: impl Into<String>,
        target_capability: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            step_id: step_id.into(),
            target_capability: target_capability.into(),
            action: action.into(),
            depends_on: Vec::new(),
            timeout_seconds: default_step_timeout(),
            required: true,
            priority: MessagePriority::Normal,
            description: String::new(),
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

/// Immutable template of a multi-step, multi-agent operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub description: String,
    /// Steps in declared order.
    #[serde(default)]
    pub steps: Vec<FlowStep>,
    /// Falls back to the orchestrator's default policy when absent.
    #[serde(default)]
    pub retry_policy: Option<RetryPolicy>,
    /// Deadline for the whole instance.
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

fn default_version() -> String {
    "1.0".into()
}

impl FlowDefinition {
    pub fn new(id: impl Into<String>, steps: Vec<FlowStep>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            version: default_version(),
            description: String::new(),
            steps,
            retry_policy: None,
            timeout_seconds: None,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    pub fn step(&self, step_id: &str) -> Option<&FlowStep> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    /// `metadata.category`, when it is a string.
    pub fn category(&self) -> Option<&str> {
        self.metadata.get("category").and_then(|v| v.as_str())
    }

    /// Checks the template: identifiers, unique steps, known references, no cycles.
    pub fn validate(&self) -> OpsMeshResult<()> {
        if self.id.trim().is_empty() {
            return Err(OpsMeshError::InvalidFlowDefinition(
                "flow id must not be empty".into(),
            ));
        }

        let mut seen = HashSet::new();
        for step in &self.steps {
            if step.step_id.trim().is_empty() {
                return Err(OpsMeshError::InvalidFlowDefinition(format!(
                    "flow '{}' has a step with an empty id",
                    self.id
                )));
            }
            if step.target_capability.trim().is_empty() {
                return Err(OpsMeshError::InvalidFlowDefinition(format!(
                    "step '{}' has no target capability",
                    step.step_id
                )));
            }
            if step.action.trim().is_empty() {
                return Err(OpsMeshError::InvalidFlowDefinition(format!(
                    "step '{}' has no action",
                    step.step_id
                )));
            }
            if !seen.insert(step.step_id.as_str()) {
                return Err(OpsMeshError::DuplicateStep(step.step_id.clone()));
            }
        }

        for step in &self.steps {
            for dep in &step.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(OpsMeshError::UnknownStepReference {
                        step: step.step_id.clone(),
                        reference: dep.clone(),
                    });
                }
            }
        }

        if let Some(step) = self.find_cycle() {
            return Err(OpsMeshError::CyclicFlowDefinition(step));
        }
        Ok(())
    }

    /// Returns a step on a dependency cycle, if any.
    fn find_cycle(&self) -> Option<String> {
        let graph: HashMap<&str, &[String]> = self
            .steps
            .iter()
            .map(|s| (s.step_id.as_str(), s.depends_on.as_slice()))
            .collect();
        let mut visited: HashMap<&str, u8> = HashMap::new();
        for step in &self.steps {
            if let Some(hit) = dfs_cycle(step.step_id.as_str(), &graph, &mut visited) {
                return Some(hit.to_string());
            }
        }
        None
    }
}

fn dfs_cycle<'a>(
    id: &'a str,
    graph: &HashMap<&'a str, &'a [String]>,
    visited: &mut HashMap<&'a str, u8>,
) -> Option<&'a str> {
    match visited.get(id) {
        Some(1) => return Some(id), // back edge
        Some(2) => return None,
        _ => {}
    }
    visited.insert(id, 1);
    if let Some(&deps) = graph.get(id) {
        for dep in deps {
            if let Some(hit) = dfs_cycle(dep.as_str(), graph, visited) {
                return Some(hit);
            }
        }
    }
    visited.insert(id, 2);
    None
}

/// Lifecycle of a flow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    Pending,
    Active,
    Completed,
    Failed,
    Cancelled,
}

impl FlowStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FlowStatus::Completed | FlowStatus::Failed | FlowStatus::Cancelled
        )
    }
}

impl std::fmt::Display for FlowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlowStatus::Pending => write!(f, "pending"),
            FlowStatus::Active => write!(f, "active"),
            FlowStatus::Completed => write!(f, "completed"),
            FlowStatus::Failed => write!(f, "failed"),
            FlowStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Output recorded for a completed step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    /// Agent that executed the step.
    pub agent_id: String,
    pub result: Payload,
    pub completed_at: DateTime<Utc>,
}

/// One running execution of a [`FlowDefinition`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowInstance {
    pub instance_id: Uuid,
    pub definition_id: String,
    pub status: FlowStatus,
    /// Number of resolved (completed or skipped) steps.
    pub current_step_index: usize,
    /// Step currently in flight, if any.
    pub current_step_id: Option<String>,
    pub step_results: Vec<StepResult>,
    pub skipped_steps: Vec<String>,
    /// Dispatch attempts per step.
    pub attempts: BTreeMap<String, u32>,
    pub initial_payload: Payload,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    /// Error variant name behind `error_message`, e.g. `no_capable_agent`.
    pub error_kind: Option<String>,
}

/// What the dependency gate allows next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    /// Index of the first unresolved step whose dependencies all completed.
    Ready(usize),
    /// Unresolved steps remain but none can run; index of the first one.
    Blocked(usize),
    /// Every step is resolved.
    Done,
}

impl FlowInstance {
    pub fn new(definition_id: impl Into<String>, initial_payload: Payload) -> Self {
        Self {
            instance_id: Uuid::new_v4(),
            definition_id: definition_id.into(),
            status: FlowStatus::Pending,
            current_step_index: 0,
            current_step_id: None,
            step_results: Vec::new(),
            skipped_steps: Vec::new(),
            attempts: BTreeMap::new(),
            initial_payload,
            started_at: Utc::now(),
            completed_at: None,
            error_message: None,
            error_kind: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn has_result(&self, step_id: &str) -> bool {
        self.step_results.iter().any(|r| r.step_id == step_id)
    }

    pub fn is_resolved(&self, step_id: &str) -> bool {
        self.has_result(step_id) || self.skipped_steps.iter().any(|s| s == step_id)
    }

    pub fn result_of(&self, step_id: &str) -> Option<&StepResult> {
        self.step_results.iter().find(|r| r.step_id == step_id)
    }

    /// Applies the dependency gate to pick the next step.
    pub fn next_step(&self, definition: &FlowDefinition) -> NextStep {
        let mut first_blocked = None;
        for (i, step) in definition.steps.iter().enumerate() {
            if self.is_resolved(&step.step_id) {
                continue;
            }
            if step.depends_on.iter().all(|d| self.has_result(d)) {
                return NextStep::Ready(i);
            }
            first_blocked.get_or_insert(i);
        }
        first_blocked.map_or(NextStep::Done, NextStep::Blocked)
    }

    /// Records a completed step. Returns `false` if it was already recorded.
    pub fn record_result(&mut self, step_id: &str, agent_id: &str, result: Payload) -> bool {
        if self.is_resolved(step_id) {
            return false;
        }
        self.step_results.push(StepResult {
            step_id: step_id.to_string(),
            agent_id: agent_id.to_string(),
            result,
            completed_at: Utc::now(),
        });
        self.current_step_index += 1;
        self.current_step_id = None;
        true
    }

    /// Records a skipped optional step. Returns `false` if it was already resolved.
    pub fn record_skip(&mut self, step_id: &str) -> bool {
        if self.is_resolved(step_id) {
            return false;
        }
        self.skipped_steps.push(step_id.to_string());
        self.current_step_index += 1;
        self.current_step_id = None;
        true
    }

    /// Request payload for `step`: the initial payload overlaid with the
    /// results of its dependencies, in `depends_on` order.
    pub fn step_payload(&self, step: &FlowStep) -> Payload {
        let mut payload = self.initial_payload.clone();
        for dep in &step.depends_on {
            if let Some(prior) = self.result_of(dep) {
                for (k, v) in &prior.result {
                    payload.insert(k.clone(), v.clone());
                }
            }
        }
        payload
    }

    pub(crate) fn finish(&mut self, status: FlowStatus) {
        self.status = status;
        self.current_step_id = None;
        self.completed_at = Some(Utc::now());
    }

    pub(crate) fn fail(&mut self, error: &OpsMeshError) {
        self.error_message = Some(error.to_string());
        self.error_kind = Some(error.kind().to_string());
        self.finish(FlowStatus::Failed);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;

    fn chain() -> FlowDefinition {
        FlowDefinition::new(
            "intake",
            vec![
                FlowStep::new("register", "checkin", "register_patient"),
                FlowStep::new("verify", "insurance", "verify_insurance").depends_on(["register"]),
                FlowStep::new("notify", "staff", "notify_staff")
                    .depends_on(["register", "verify"])
                    .optional(),
            ],
        )
    }

    #[test]
    fn test_valid_definition() {
        assert!(chain().validate().is_ok());
        assert!(FlowDefinition::new("empty", vec![]).validate().is_ok());
    }

    #[test]
    fn test_unknown_reference() {
        let def = FlowDefinition::new(
            "f",
            vec![FlowStep::new("a", "checkin", "x").depends_on(["ghost"])],
        );
        let err = def.validate().unwrap_err();
        assert!(matches!(
            err,
            OpsMeshError::UnknownStepReference { ref step, ref reference } if step == "a" && reference == "ghost"
        ));
    }

    #[test]
    fn test_cycle_detected() {
        let def = FlowDefinition::new(
            "f",
            vec![
                FlowStep::new("a", "checkin", "x").depends_on(["c"]),
                FlowStep::new("b", "checkin", "x").depends_on(["a"]),
                FlowStep::new("c", "checkin", "x").depends_on(["b"]),
            ],
        );
        assert!(matches!(
            def.validate(),
            Err(OpsMeshError::CyclicFlowDefinition(_))
        ));
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let def = FlowDefinition::new("f", vec![FlowStep::new("a", "checkin", "x").depends_on(["a"])]);
        assert!(matches!(
            def.validate(),
            Err(OpsMeshError::CyclicFlowDefinition(s)) if s == "a"
        ));
    }

    #[test]
    fn test_duplicate_and_empty_ids() {
        let dup = FlowDefinition::new(
            "f",
            vec![
                FlowStep::new("a", "checkin", "x"),
                FlowStep::new("a", "queue", "y"),
            ],
        );
        assert!(matches!(dup.validate(), Err(OpsMeshError::DuplicateStep(s)) if s == "a"));

        let no_id = FlowDefinition::new(" ", vec![]);
        assert!(matches!(
            no_id.validate(),
            Err(OpsMeshError::InvalidFlowDefinition(_))
        ));

        let no_cap = FlowDefinition::new("f", vec![FlowStep::new("a", "", "x")]);
        assert!(matches!(
            no_cap.validate(),
            Err(OpsMeshError::InvalidFlowDefinition(_))
        ));
    }

    #[test]
    fn test_next_step_follows_dependency_gate() {
        let def = chain();
        let mut inst = FlowInstance::new("intake", Payload::new());
        assert_eq!(inst.next_step(&def), NextStep::Ready(0));

        // "verify" cannot run before "register" has a result
        assert!(inst.record_result("register", "frontdesk", Payload::new()));
        assert_eq!(inst.next_step(&def), NextStep::Ready(1));

        assert!(inst.record_result("verify", "insurer", Payload::new()));
        assert_eq!(inst.next_step(&def), NextStep::Ready(2));

        assert!(inst.record_skip("notify"));
        assert_eq!(inst.next_step(&def), NextStep::Done);
        assert_eq!(inst.current_step_index, 3);
    }

    #[test]
    fn test_blocked_when_dependency_skipped() {
        let def = FlowDefinition::new(
            "f",
            vec![
                FlowStep::new("a", "checkin", "x").optional(),
                FlowStep::new("b", "queue", "y").depends_on(["a"]),
            ],
        );
        let mut inst = FlowInstance::new("f", Payload::new());
        inst.record_skip("a");
        assert_eq!(inst.next_step(&def), NextStep::Blocked(1));
    }

    #[test]
    fn test_duplicate_result_not_recorded_twice() {
        let mut inst = FlowInstance::new("f", Payload::new());
        assert!(inst.record_result("a", "agent", Payload::new()));
        assert!(!inst.record_result("a", "agent", Payload::new()));
        assert_eq!(inst.current_step_index, 1);
        assert_eq!(inst.step_results.len(), 1);
    }

    #[test]
    fn test_step_payload_chains_dependency_results() {
        let def = chain();
        let mut initial = Payload::new();
        initial.insert("name".into(), json!("Ada"));
        initial.insert("patient_id".into(), json!(null));
        let mut inst = FlowInstance::new("intake", initial);

        let mut reg = Payload::new();
        reg.insert("patient_id".into(), json!(42));
        inst.record_result("register", "frontdesk", reg);
        let mut ver = Payload::new();
        ver.insert("verified".into(), json!(true));
        inst.record_result("verify", "insurer", ver);

        let payload = inst.step_payload(def.step("notify").unwrap());
        assert_eq!(payload["name"], json!("Ada"));
        assert_eq!(payload["patient_id"], json!(42));
        assert_eq!(payload["verified"], json!(true));
    }

    #[test]
    fn test_definition_from_json_defaults() {
        let def: FlowDefinition = serde_json::from_value(json!({
            "id": "walkin",
            "metadata": {"category": "walk_in"},
            "steps": [{"step_id": "a", "target_capability": "checkin", "action": "x"}]
        }))
        .unwrap();
        assert_eq!(def.category(), Some("walk_in"));
        assert_eq!(def.steps[0].timeout_seconds, 30);
        assert!(def.steps[0].required);
        assert!(def.retry_policy.is_none());
    }
}
