//! Coordination engine for OpsMesh agents.
//!
//! Tracks which agents are alive and what they can do, moves messages between
//! them, and drives multi-step flows across them with dependency gating,
//! per-step timeouts and retries.
//!
//! # Main types
//!
//! - [`AgentRegistry`] — Capability index with heartbeat-based liveness.
//! - [`MessageRouter`] — Per-agent mailboxes and request/response correlation.
//! - [`WorkflowOrchestrator`] — Flow instance state machine.
//! - [`Coordinator`] — Wires the above together and supervises background tasks.
//! - [`PriorityQueueCalculator`] — Queue ordering and wait estimation.

/// Instance checkpoint stores.
pub mod checkpoint;
/// Registry and orchestrator settings.
pub mod config;
/// The workflow orchestrator.
pub mod engine;
/// Flow definitions and instances.
pub mod flow;
/// Priority queue ordering and wait estimates.
pub mod queue;
/// Agent registry and liveness sweep.
pub mod registry;
/// Retry policy with backoff.
pub mod retry;
/// Mailboxes and response correlation.
pub mod router;
/// Composition root.
pub mod runtime;
/// Built-in patient-flow templates.
pub mod templates;
/// Local and HTTP agent transports.
pub mod transport;
/// Mailbox-consuming agent worker.
pub mod worker;

pub use checkpoint::{CheckpointStore, FileCheckpointStore, NoopCheckpointStore};
pub use config::{OrchestratorConfig, RegistryConfig};
pub use engine::WorkflowOrchestrator;
pub use flow::{FlowDefinition, FlowInstance, FlowStatus, FlowStep, NextStep, StepResult};
pub use queue::{
    PriorityMultipliers, PriorityQueueCalculator, QueueEntry, QueueMetrics, QueuePriority,
    QueueSettings, QueueStatus, QueueType,
};
pub use registry::{AgentRegistry, RegistryStats, SweepReport};
pub use retry::RetryPolicy;
pub use router::{Correlation, MessageRouter, Subscription};
pub use runtime::Coordinator;
pub use transport::{ActionHandler, AgentTransport, HttpTransport, LocalTransport};
pub use worker::{AgentWorker, TASK_CANCELLED_EVENT};
