use crate::checkpoint::{CheckpointStore, NoopCheckpointStore};
use crate::config::OrchestratorConfig;
use crate::flow::{FlowDefinition, FlowInstance, FlowStatus, FlowStep, NextStep};
use crate::router::MessageRouter;
use crate::worker::TASK_CANCELLED_EVENT;
use opsmesh_core::{
    AgentRecord, AgentStatus, Message, Notification, OpsMeshError, OpsMeshResult, Payload,
    TaskRequest, TaskStatus,
};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

struct ActiveFlow {
    instance: FlowInstance,
    cancel: CancellationToken,
    driver: Option<JoinHandle<()>>,
    /// Serializes checkpoint writes so a stale snapshot never lands last.
    writes: Arc<tokio::sync::Mutex<()>>,
}

/// Finished instances, oldest first.
#[derive(Default)]
struct Archive {
    instances: HashMap<Uuid, FlowInstance>,
    order: VecDeque<Uuid>,
}

impl Archive {
    /// Stores `instance` and returns the ids pushed out beyond `limit`.
    fn insert(&mut self, instance: FlowInstance, limit: usize) -> Vec<Uuid> {
        let id = instance.instance_id;
        if self.instances.insert(id, instance).is_none() {
            self.order.push_back(id);
        }
        let mut evicted = Vec::new();
        while self.order.len() > limit.max(1) {
            if let Some(old) = self.order.pop_front() {
                self.instances.remove(&old);
                evicted.push(old);
            }
        }
        evicted
    }

    fn get(&self, id: &Uuid) -> Option<&FlowInstance> {
        self.instances.get(id)
    }

    fn len(&self) -> usize {
        self.instances.len()
    }
}

enum StepOutcome {
    Completed { agent_id: String, result: Payload },
    /// Attempts exhausted, or no agent can serve the step.
    Failed(OpsMeshError),
    /// The whole-flow deadline passed; fails the instance even for optional steps.
    Expired(OpsMeshError),
    /// Cancelled or shutting down.
    Stopped,
}

/// Drives flow instances through their steps.
///
/// Instances move `Pending → Active → {Completed, Failed, Cancelled}`. Each
/// active instance has one driver task that dispatches a single step at a
/// time, so steps of one instance never run concurrently while different
/// instances progress in parallel. Terminal instances move to an archive
/// capped at `max_archived_instances`.
pub struct WorkflowOrchestrator {
    router: Arc<MessageRouter>,
    config: OrchestratorConfig,
    definitions: RwLock<BTreeMap<String, Arc<FlowDefinition>>>,
    active: Mutex<HashMap<Uuid, ActiveFlow>>,
    archive: Mutex<Archive>,
    /// Status channels of instances that have not finished yet.
    watchers: Mutex<HashMap<Uuid, watch::Sender<FlowStatus>>>,
    checkpoints: Arc<dyn CheckpointStore>,
    shutdown: CancellationToken,
}

impl WorkflowOrchestrator {
    pub fn new(router: Arc<MessageRouter>, config: OrchestratorConfig) -> Self {
        Self {
            router,
            config,
            definitions: RwLock::new(BTreeMap::new()),
            active: Mutex::new(HashMap::new()),
            archive: Mutex::new(Archive::default()),
            watchers: Mutex::new(HashMap::new()),
            checkpoints: Arc::new(NoopCheckpointStore),
            shutdown: CancellationToken::new(),
        }
    }

    /// Persists every instance transition to `store`.
    pub fn with_checkpoints(mut self, store: Arc<dyn CheckpointStore>) -> Self {
        self.checkpoints = store;
        self
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    // --- Definitions ---

    /// Validates and stores a flow template, replacing one with the same id.
    pub fn register_flow(&self, definition: FlowDefinition) -> OpsMeshResult<()> {
        definition.validate()?;
        info!(
            definition_id = %definition.id,
            steps = definition.steps.len(),
            "Flow definition registered"
        );
        self.definitions
            .write()
            .insert(definition.id.clone(), Arc::new(definition));
        Ok(())
    }

    pub fn definition(&self, definition_id: &str) -> Option<FlowDefinition> {
        self.definitions
            .read()
            .get(definition_id)
            .map(|d| d.as_ref().clone())
    }

    /// All registered definitions, ordered by id.
    pub fn definitions(&self) -> Vec<FlowDefinition> {
        self.definitions
            .read()
            .values()
            .map(|d| d.as_ref().clone())
            .collect()
    }

    pub fn definitions_in_category(&self, category: &str) -> Vec<FlowDefinition> {
        self.definitions()
            .into_iter()
            .filter(|d| d.category() == Some(category))
            .collect()
    }

    // --- Instances ---

    /// Starts an instance of a registered definition and returns its id.
    ///
    /// Template errors are returned here and create no instance. Everything
    /// that goes wrong later is only visible through [`get_flow_status`](Self::get_flow_status).
    pub async fn start_flow(
        self: &Arc<Self>,
        definition_id: &str,
        initial_payload: Payload,
    ) -> OpsMeshResult<Uuid> {
        let definition = self
            .definitions
            .read()
            .get(definition_id)
            .cloned()
            .ok_or_else(|| OpsMeshError::UnknownFlowDefinition(definition_id.to_string()))?;
        self.launch(definition, initial_payload).await
    }

    /// Starts an instance of an unregistered, ad-hoc definition.
    pub async fn start_flow_from(
        self: &Arc<Self>,
        definition: FlowDefinition,
        initial_payload: Payload,
    ) -> OpsMeshResult<Uuid> {
        self.launch(Arc::new(definition), initial_payload).await
    }

    async fn launch(
        self: &Arc<Self>,
        definition: Arc<FlowDefinition>,
        initial_payload: Payload,
    ) -> OpsMeshResult<Uuid> {
        definition.validate()?;

        let mut instance = FlowInstance::new(definition.id.clone(), initial_payload);
        let id = instance.instance_id;
        instance.status = FlowStatus::Active;
        let (tx, _) = watch::channel(FlowStatus::Active);
        self.watchers.lock().insert(id, tx);

        if definition.steps.is_empty() {
            instance.finish(FlowStatus::Completed);
            info!(instance_id = %id, definition_id = %definition.id, "Flow has no steps, completed");
            let evicted = self.archive_instance(instance.clone());
            self.checkpoint(&instance).await;
            self.notify(id, FlowStatus::Completed);
            self.prune(evicted).await;
            return Ok(id);
        }

        let cancel = self.shutdown.child_token();
        self.checkpoint(&instance).await;
        self.active.lock().insert(
            id,
            ActiveFlow {
                instance,
                cancel: cancel.clone(),
                driver: None,
                writes: Arc::new(tokio::sync::Mutex::new(())),
            },
        );

        let driver = tokio::spawn(self.clone().drive(id, definition, cancel));
        match self.active.lock().get_mut(&id) {
            Some(flow) => flow.driver = Some(driver),
            None => drop(driver),
        }
        Ok(id)
    }

    /// Snapshot of an instance, active or archived.
    pub fn get_flow_status(&self, instance_id: Uuid) -> OpsMeshResult<FlowInstance> {
        if let Some(flow) = self.active.lock().get(&instance_id) {
            return Ok(flow.instance.clone());
        }
        self.archive
            .lock()
            .get(&instance_id)
            .cloned()
            .ok_or_else(|| OpsMeshError::UnknownFlowInstance(instance_id.to_string()))
    }

    /// Stops dispatch for an active instance and marks it `Cancelled`.
    ///
    /// Side effects already applied by agents are not rolled back. A terminal
    /// instance keeps, and returns, its status.
    pub async fn cancel(&self, instance_id: Uuid) -> OpsMeshResult<FlowStatus> {
        let (snapshot, writes, evicted) = {
            let mut active = self.active.lock();
            match active.remove(&instance_id) {
                Some(mut flow) => {
                    flow.cancel.cancel();
                    flow.instance.finish(FlowStatus::Cancelled);
                    let snapshot = flow.instance.clone();
                    let evicted = self.archive_instance(flow.instance);
                    (snapshot, flow.writes, evicted)
                }
                None => {
                    drop(active);
                    return self
                        .archive
                        .lock()
                        .get(&instance_id)
                        .map(|i| i.status)
                        .ok_or_else(|| OpsMeshError::UnknownFlowInstance(instance_id.to_string()));
                }
            }
        };
        info!(instance_id = %instance_id, definition_id = %snapshot.definition_id, "Flow cancelled");
        {
            let _write = writes.lock().await;
            self.checkpoint(&snapshot).await;
        }
        self.notify(instance_id, FlowStatus::Cancelled);
        self.prune(evicted).await;
        Ok(FlowStatus::Cancelled)
    }

    /// Resolves once the instance is terminal.
    pub async fn wait_for_terminal(&self, instance_id: Uuid) -> OpsMeshResult<FlowInstance> {
        let rx = self
            .watchers
            .lock()
            .get(&instance_id)
            .map(watch::Sender::subscribe);
        // no watcher: already archived, or unknown
        if let Some(mut rx) = rx {
            if rx.wait_for(|s| s.is_terminal()).await.is_err() {
                debug!(instance_id = %instance_id, "Status channel closed");
            }
        }
        self.get_flow_status(instance_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.lock().len()
    }

    /// Number of instances held in memory (active and archived).
    pub fn instance_count(&self) -> usize {
        self.active.lock().len() + self.archive.lock().len()
    }

    /// Loads checkpointed instances into the archive.
    ///
    /// Instances that were still running when the process stopped are failed,
    /// since their in-flight requests cannot be resumed.
    pub async fn recover(&self) -> OpsMeshResult<usize> {
        let mut restored = Vec::new();
        for id in self.checkpoints.list().await? {
            let mut instance = match self.checkpoints.load(id).await {
                Ok(Some(instance)) => instance,
                Ok(None) => continue,
                Err(e) => {
                    warn!(instance_id = %id, error = %e, "Skipping unreadable checkpoint");
                    continue;
                }
            };
            if self.active.lock().contains_key(&id) {
                continue;
            }
            if !instance.is_terminal() {
                instance.fail(&OpsMeshError::TaskExecution(
                    "interrupted by coordinator restart".into(),
                ));
                self.checkpoint(&instance).await;
            }
            restored.push(instance);
        }

        restored.sort_by_key(|i| i.started_at);
        let recovered = restored.len();
        let mut evicted = Vec::new();
        for instance in restored {
            evicted.extend(self.archive_instance(instance));
        }
        self.prune(evicted).await;
        if recovered > 0 {
            info!(recovered, "Flow instances restored from checkpoints");
        }
        Ok(recovered)
    }

    /// Stops every driver and waits for them. Active instances stay `Active`.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let drivers: Vec<JoinHandle<()>> = self
            .active
            .lock()
            .values_mut()
            .filter_map(|f| f.driver.take())
            .collect();
        for driver in drivers {
            if let Err(e) = driver.await {
                warn!(error = %e, "Flow driver ended abnormally");
            }
        }
    }

    // --- Driver ---

    async fn drive(
        self: Arc<Self>,
        id: Uuid,
        definition: Arc<FlowDefinition>,
        cancel: CancellationToken,
    ) {
        let deadline = definition
            .timeout_seconds
            .map(|secs| Instant::now() + Duration::from_secs(secs));
        info!(instance_id = %id, definition_id = %definition.id, "Flow started");

        loop {
            if cancel.is_cancelled() {
                return;
            }
            let Some(next) = self.with_active(id, |inst| inst.next_step(&definition)) else {
                return;
            };

            match next {
                NextStep::Done => {
                    self.finish(id, None).await;
                    return;
                }
                NextStep::Blocked(i) => {
                    let step = &definition.steps[i];
                    if step.required {
                        let err = OpsMeshError::TaskExecution(format!(
                            "step '{}' dependency not satisfied",
                            step.step_id
                        ));
                        self.finish(id, Some(err)).await;
                        return;
                    }
                    warn!(instance_id = %id, step_id = %step.step_id, "Optional step skipped, dependency not satisfied");
                    self.with_active(id, |inst| inst.record_skip(&step.step_id));
                    self.checkpoint_active(id).await;
                }
                NextStep::Ready(i) => {
                    let step = &definition.steps[i];
                    match self.run_step(id, &definition, step, &cancel, deadline).await {
                        StepOutcome::Completed { agent_id, result } => {
                            match self.with_active(id, |inst| {
                                inst.record_result(&step.step_id, &agent_id, result)
                            }) {
                                None => return,
                                Some(false) => {
                                    warn!(instance_id = %id, step_id = %step.step_id, "Duplicate step result ignored");
                                }
                                Some(true) => {
                                    info!(instance_id = %id, step_id = %step.step_id, agent_id = %agent_id, "Step completed");
                                }
                            }
                            self.checkpoint_active(id).await;
                        }
                        StepOutcome::Failed(err) if step.required => {
                            self.finish(id, Some(err)).await;
                            return;
                        }
                        StepOutcome::Failed(err) => {
                            warn!(instance_id = %id, step_id = %step.step_id, error = %err, "Optional step failed, skipped");
                            self.with_active(id, |inst| inst.record_skip(&step.step_id));
                            self.checkpoint_active(id).await;
                        }
                        StepOutcome::Expired(err) => {
                            self.finish(id, Some(err)).await;
                            return;
                        }
                        StepOutcome::Stopped => return,
                    }
                }
            }
        }
    }

    /// Dispatches one step until it succeeds or its retry budget runs out.
    async fn run_step(
        &self,
        id: Uuid,
        definition: &FlowDefinition,
        step: &FlowStep,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> StepOutcome {
        let policy = definition
            .retry_policy
            .clone()
            .unwrap_or_else(|| self.config.default_retry.clone());
        let mut failures: u32 = 0;

        loop {
            let Some(agent) = self.select_agent(&step.target_capability) else {
                return StepOutcome::Failed(OpsMeshError::NoCapableAgent(
                    step.target_capability.clone(),
                ));
            };

            let err = match self.attempt(id, definition, step, &agent, cancel, deadline).await {
                Ok(outcome) => return outcome,
                Err(err) => err,
            };

            failures += 1;
            if !policy.allows_retry(failures) {
                error!(
                    instance_id = %id,
                    step_id = %step.step_id,
                    attempts = failures,
                    max_attempts = policy.total_attempts(),
                    error = %err,
                    "Step failed, retries exhausted"
                );
                return StepOutcome::Failed(err);
            }

            let delay = policy.delay_for(failures - 1);
            warn!(
                instance_id = %id,
                step_id = %step.step_id,
                attempt = failures,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %err,
                "Step failed, retrying"
            );
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return StepOutcome::Stopped,
                _ = sleep_until(deadline) => {
                    return StepOutcome::Expired(flow_timeout(definition, step));
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One dispatch. `Err` is a failure the retry policy may retry.
    async fn attempt(
        &self,
        id: Uuid,
        definition: &FlowDefinition,
        step: &FlowStep,
        agent: &AgentRecord,
        cancel: &CancellationToken,
        deadline: Option<Instant>,
    ) -> Result<StepOutcome, OpsMeshError> {
        let Some(payload) = self.with_active(id, |inst| {
            *inst.attempts.entry(step.step_id.clone()).or_insert(0) += 1;
            inst.current_step_id = Some(step.step_id.clone());
            inst.step_payload(step)
        }) else {
            return Ok(StepOutcome::Stopped);
        };

        let request = TaskRequest::new(
            self.config.agent_id.clone(),
            agent.id.clone(),
            step.action.clone(),
            payload,
            step.timeout_seconds,
        )
        .with_priority(step.priority)
        .with_correlation(id.to_string());
        let task_id = request.id;
        let (_, rx) = self.router.request(request)?;
        debug!(
            instance_id = %id,
            step_id = %step.step_id,
            agent_id = %agent.id,
            task_id = %task_id,
            "Step dispatched"
        );

        let step_timeout = Duration::from_secs(step.timeout_seconds);
        let answer = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.withdraw(task_id, &agent.id);
                return Ok(StepOutcome::Stopped);
            }
            _ = sleep_until(deadline) => {
                self.withdraw(task_id, &agent.id);
                return Ok(StepOutcome::Expired(flow_timeout(definition, step)));
            }
            answer = tokio::time::timeout(step_timeout, rx) => answer,
        };

        match answer {
            Err(_) => {
                self.withdraw(task_id, &agent.id);
                Err(OpsMeshError::StepTimeout {
                    step: step.step_id.clone(),
                    timeout_seconds: step.timeout_seconds,
                })
            }
            Ok(Err(_)) => Err(OpsMeshError::Transport(format!(
                "response channel for task {task_id} closed"
            ))),
            Ok(Ok(response)) if response.status == TaskStatus::Completed => {
                Ok(StepOutcome::Completed {
                    agent_id: agent.id.clone(),
                    result: response.result.unwrap_or_default(),
                })
            }
            Ok(Ok(response)) => Err(OpsMeshError::TaskExecution(
                response
                    .error
                    .unwrap_or_else(|| format!("agent reported {}", response.status)),
            )),
        }
    }

    /// Least-loaded available agent, falling back to any live candidate.
    /// Agents whose mailbox nobody reads any more are passed over.
    fn select_agent(&self, capability: &str) -> Option<AgentRecord> {
        let mut candidates = self.router.registry().find_by_capability(capability, false);
        candidates.retain(|a| self.router.is_deliverable(&a.id));
        candidates
            .iter()
            .find(|a| a.status == AgentStatus::Available)
            .cloned()
            .or_else(|| candidates.into_iter().next())
    }

    /// Stops waiting for a task and tells its agent, best effort.
    fn withdraw(&self, task_id: Uuid, agent_id: &str) {
        self.router.forget(task_id);
        let mut payload = Payload::new();
        payload.insert("event".into(), TASK_CANCELLED_EVENT.into());
        payload.insert("task_id".into(), task_id.to_string().into());
        let note = Notification {
            from: self.config.agent_id.clone(),
            to: agent_id.to_string(),
            payload,
        };
        if let Err(e) = self.router.send(Message::Notification(note)) {
            debug!(task_id = %task_id, agent_id, error = %e, "Cancellation notice not delivered");
        }
    }

    fn with_active<R>(&self, id: Uuid, f: impl FnOnce(&mut FlowInstance) -> R) -> Option<R> {
        self.active.lock().get_mut(&id).map(|flow| f(&mut flow.instance))
    }

    /// Moves an active instance to the archive as completed, or failed with `err`.
    async fn finish(&self, id: Uuid, err: Option<OpsMeshError>) {
        let (snapshot, writes, evicted) = {
            let mut active = self.active.lock();
            let Some(flow) = active.remove(&id) else {
                return;
            };
            let mut instance = flow.instance;
            match &err {
                Some(e) => instance.fail(e),
                None => instance.finish(FlowStatus::Completed),
            }
            let evicted = self.archive_instance(instance.clone());
            (instance, flow.writes, evicted)
        };

        match &err {
            Some(e) => error!(
                instance_id = %id,
                definition_id = %snapshot.definition_id,
                error_kind = e.kind(),
                error = %e,
                "Flow failed"
            ),
            None => info!(
                instance_id = %id,
                definition_id = %snapshot.definition_id,
                steps = snapshot.step_results.len(),
                "Flow completed"
            ),
        }
        {
            let _write = writes.lock().await;
            self.checkpoint(&snapshot).await;
        }
        self.notify(id, snapshot.status);
        self.prune(evicted).await;
    }

    /// Publishes a terminal status and drops the instance's watcher.
    fn notify(&self, id: Uuid, status: FlowStatus) {
        if let Some(tx) = self.watchers.lock().remove(&id) {
            tx.send_replace(status);
        }
    }

    /// Moves a finished instance into the archive. Caller holds no archive lock.
    fn archive_instance(&self, instance: FlowInstance) -> Vec<Uuid> {
        self.archive
            .lock()
            .insert(instance, self.config.max_archived_instances)
    }

    /// Deletes checkpoints of instances dropped from the archive.
    async fn prune(&self, evicted: Vec<Uuid>) {
        for id in evicted {
            if let Err(e) = self.checkpoints.remove(id).await {
                warn!(instance_id = %id, error = %e, "Checkpoint removal failed");
            }
            debug!(instance_id = %id, "Archived instance dropped");
        }
    }

    /// Writes the current state of an active instance.
    ///
    /// The snapshot is taken after acquiring the instance's write lock, so a
    /// concurrent terminal write always lands after it.
    async fn checkpoint_active(&self, id: Uuid) {
        let Some(writes) = self.active.lock().get(&id).map(|f| f.writes.clone()) else {
            return;
        };
        let _write = writes.lock().await;
        if let Some(snapshot) = self.with_active(id, |inst| inst.clone()) {
            self.checkpoint(&snapshot).await;
        }
    }

    async fn checkpoint(&self, instance: &FlowInstance) {
        if let Err(e) = self.checkpoints.save(instance).await {
            warn!(instance_id = %instance.instance_id, error = %e, "Checkpoint write failed");
        }
    }
}

fn flow_timeout(definition: &FlowDefinition, step: &FlowStep) -> OpsMeshError {
    OpsMeshError::StepTimeout {
        step: step.step_id.clone(),
        timeout_seconds: definition.timeout_seconds.unwrap_or(step.timeout_seconds),
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}
