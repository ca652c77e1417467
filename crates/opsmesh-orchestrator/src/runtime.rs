//! Composition root for the coordination layer.
//!
//! [`Coordinator`] builds the registry, router and orchestrator from
//! configuration, owns every background task (liveness sweep, agent workers,
//! flow drivers) and stops them all on [`Coordinator::shutdown`].

use crate::checkpoint::{CheckpointStore, FileCheckpointStore};
use crate::config::{OrchestratorConfig, RegistryConfig};
use crate::engine::WorkflowOrchestrator;
use crate::registry::AgentRegistry;
use crate::router::MessageRouter;
use crate::transport::{ActionHandler, AgentTransport, HttpTransport, LocalTransport};
use crate::worker::AgentWorker;
use opsmesh_core::{AgentRecord, OpsMeshError, OpsMeshResult};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Running coordination layer.
pub struct Coordinator {
    registry: Arc<AgentRegistry>,
    router: Arc<MessageRouter>,
    orchestrator: Arc<WorkflowOrchestrator>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Coordinator {
    /// Builds the components, restores checkpoints and starts the liveness sweep.
    pub async fn start(
        registry_config: RegistryConfig,
        orchestrator_config: OrchestratorConfig,
    ) -> OpsMeshResult<Self> {
        let sweep_interval = registry_config.sweep_interval();
        let registry = Arc::new(AgentRegistry::new(registry_config));
        let router = Arc::new(MessageRouter::new(registry.clone()));

        let mut orchestrator = WorkflowOrchestrator::new(router.clone(), orchestrator_config.clone());
        if let Some(dir) = &orchestrator_config.checkpoint_dir {
            let store: Arc<dyn CheckpointStore> =
                Arc::new(FileCheckpointStore::new(dir.clone()).await?);
            orchestrator = orchestrator.with_checkpoints(store);
        }
        let orchestrator = Arc::new(orchestrator);
        orchestrator.recover().await?;

        let shutdown = CancellationToken::new();
        let sweeper = tokio::spawn(run_sweeper(
            registry.clone(),
            router.clone(),
            sweep_interval,
            shutdown.clone(),
        ));
        info!(
            sweep_interval_secs = sweep_interval.as_secs(),
            "Coordinator started"
        );

        Ok(Self {
            registry,
            router,
            orchestrator,
            shutdown,
            tasks: Mutex::new(vec![sweeper]),
        })
    }

    pub fn registry(&self) -> &Arc<AgentRegistry> {
        &self.registry
    }

    pub fn router(&self) -> &Arc<MessageRouter> {
        &self.router
    }

    pub fn orchestrator(&self) -> &Arc<WorkflowOrchestrator> {
        &self.orchestrator
    }

    /// Registers an in-process agent and starts a worker that runs `handler`
    /// and heartbeats on its behalf.
    pub fn attach_local(
        &self,
        record: AgentRecord,
        handler: Arc<dyn ActionHandler>,
    ) -> OpsMeshResult<AgentRecord> {
        let heartbeat = (self.registry.config().heartbeat_timeout() / 3).max(Duration::from_secs(1));
        self.attach_with(record, Arc::new(LocalTransport::new(handler)), Some(heartbeat))
    }

    /// Registers an agent reachable at an `http(s)://` endpoint and starts a
    /// worker that forwards its mailbox. The agent heartbeats by itself.
    pub fn attach_remote(&self, record: AgentRecord) -> OpsMeshResult<AgentRecord> {
        if record.is_local() {
            return Err(OpsMeshError::InvalidRecord(format!(
                "agent '{}' is in-process and needs a handler",
                record.id
            )));
        }
        if !record.endpoint.starts_with("http://") && !record.endpoint.starts_with("https://") {
            return Err(OpsMeshError::InvalidRecord(format!(
                "agent '{}' endpoint '{}' is not an HTTP URL",
                record.id, record.endpoint
            )));
        }
        let transport = Arc::new(HttpTransport::new(&record.endpoint));
        self.attach_with(record, transport, None)
    }

    fn attach_with(
        &self,
        record: AgentRecord,
        transport: Arc<dyn AgentTransport>,
        heartbeat: Option<Duration>,
    ) -> OpsMeshResult<AgentRecord> {
        let record = self.registry.register(record)?;
        let subscription = self.router.subscribe(&record.id)?;
        let mut worker = AgentWorker::new(subscription, transport, self.router.clone());
        if let Some(interval) = heartbeat {
            worker = worker.with_heartbeat(interval);
        }
        let handle = worker.spawn(self.shutdown.child_token());

        let mut tasks = self.tasks.lock();
        tasks.retain(|t| !t.is_finished());
        tasks.push(handle);
        Ok(record)
    }

    /// Unregisters an agent and closes its mailbox, which stops its worker.
    pub fn detach(&self, agent_id: &str) -> Option<AgentRecord> {
        let record = self.registry.unregister(agent_id)?;
        self.router.close_mailbox(agent_id);
        info!(agent_id, "Agent detached");
        Some(record)
    }

    /// Stops flow drivers, workers and the sweep, and waits for them.
    pub async fn shutdown(&self) {
        info!("Coordinator shutting down");
        self.orchestrator.shutdown().await;
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Background task ended abnormally");
            }
        }
        info!("Coordinator stopped");
    }
}

async fn run_sweeper(
    registry: Arc<AgentRegistry>,
    router: Arc<MessageRouter>,
    interval: Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Liveness sweep stopping");
                break;
            }
            _ = ticker.tick() => {
                let report = registry.sweep();
                if !report.evicted.is_empty() {
                    router.close_mailboxes(&report.evicted);
                }
                if !report.is_empty() {
                    info!(
                        marked_unhealthy = report.marked_unhealthy.len(),
                        evicted = report.evicted.len(),
                        "Liveness sweep"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::flow::{FlowDefinition, FlowStatus, FlowStep};
    use async_trait::async_trait;
    use chrono::Utc;
    use opsmesh_core::{AgentStatus, Payload};

    struct Accept;

    #[async_trait]
    impl ActionHandler for Accept {
        async fn execute_action(&self, _action: &str, payload: Payload) -> OpsMeshResult<Payload> {
            Ok(payload)
        }
    }

    #[tokio::test]
    async fn test_local_agent_serves_flow() {
        let coordinator = Coordinator::start(RegistryConfig::default(), OrchestratorConfig::default())
            .await
            .unwrap();
        coordinator
            .attach_local(AgentRecord::local("beds", "Bed Manager", ["beds"]), Arc::new(Accept))
            .unwrap();

        let def = FlowDefinition::new("f", vec![FlowStep::new("reserve", "beds", "reserve_bed")]);
        let id = coordinator
            .orchestrator()
            .start_flow_from(def, Payload::new())
            .await
            .unwrap();
        let inst = coordinator.orchestrator().wait_for_terminal(id).await.unwrap();
        assert_eq!(inst.status, FlowStatus::Completed);

        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_remote_agent_requires_http_endpoint() {
        let coordinator = Coordinator::start(RegistryConfig::default(), OrchestratorConfig::default())
            .await
            .unwrap();
        let err = coordinator
            .attach_remote(AgentRecord::local("beds", "Beds", ["beds"]))
            .unwrap_err();
        assert!(matches!(err, OpsMeshError::InvalidRecord(_)));

        let record = AgentRecord::new("beds", "Beds", ["beds"], "http://127.0.0.1:9");
        coordinator.attach_remote(record).unwrap();
        assert!(coordinator.registry().get("beds").is_some());
        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_detach_stops_worker() {
        let coordinator = Coordinator::start(RegistryConfig::default(), OrchestratorConfig::default())
            .await
            .unwrap();
        coordinator
            .attach_local(AgentRecord::local("staff", "Staff", ["staff"]), Arc::new(Accept))
            .unwrap();
        assert!(coordinator.detach("staff").is_some());
        assert!(coordinator.detach("staff").is_none());
        assert!(coordinator.registry().get("staff").is_none());
        coordinator.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_silent_agents() {
        let coordinator = Coordinator::start(
            RegistryConfig {
                heartbeat_timeout_secs: 60,
                sweep_interval_secs: 1,
                busy_load_threshold: 8,
            },
            OrchestratorConfig::default(),
        )
        .await
        .unwrap();
        let registry = coordinator.registry();
        registry.register(AgentRecord::local("quiet", "Quiet", ["queue"])).unwrap();
        registry.register(AgentRecord::local("gone", "Gone", ["queue"])).unwrap();
        registry
            .heartbeat_at("quiet", 0, Utc::now() - chrono::Duration::seconds(90))
            .unwrap();
        registry
            .heartbeat_at("gone", 0, Utc::now() - chrono::Duration::seconds(600))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(registry.status("quiet"), Some(AgentStatus::Unhealthy));
        assert!(registry.get("gone").is_none());

        coordinator.shutdown().await;
    }

    #[tokio::test]
    async fn test_checkpoint_dir_restores_history() {
        let dir = tempfile::tempdir().unwrap();
        let config = OrchestratorConfig {
            checkpoint_dir: Some(dir.path().to_path_buf()),
            ..OrchestratorConfig::default()
        };

        let first = Coordinator::start(RegistryConfig::default(), config.clone())
            .await
            .unwrap();
        let id = first
            .orchestrator()
            .start_flow_from(FlowDefinition::new("noop", vec![]), Payload::new())
            .await
            .unwrap();
        first.shutdown().await;

        let second = Coordinator::start(RegistryConfig::default(), config).await.unwrap();
        assert_eq!(
            second.orchestrator().get_flow_status(id).unwrap().status,
            FlowStatus::Completed
        );
        second.shutdown().await;
    }
}
