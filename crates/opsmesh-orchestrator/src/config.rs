use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Liveness settings of the agent registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Seconds without a heartbeat before an agent is marked unhealthy.
    /// Three times this value evicts it.
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,
    /// Interval of the liveness sweep.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
    /// Reported load at which an agent is considered busy.
    #[serde(default = "default_busy_threshold")]
    pub busy_load_threshold: u32,
}

fn default_heartbeat_timeout() -> u64 {
    60
}
fn default_sweep_interval() -> u64 {
    10
}
fn default_busy_threshold() -> u32 {
    8
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            sweep_interval_secs: default_sweep_interval(),
            busy_load_threshold: default_busy_threshold(),
        }
    }
}

impl RegistryConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Settings of the workflow orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Sender id stamped on every task request the orchestrator issues.
    #[serde(default = "default_agent_id")]
    pub agent_id: String,
    /// Directory for JSON instance checkpoints; unset keeps instances in memory only.
    #[serde(default)]
    pub checkpoint_dir: Option<PathBuf>,
    /// Retry policy for flows that do not declare one.
    #[serde(default)]
    pub default_retry: RetryPolicy,
    /// Finished instances kept for inspection. Older ones are dropped, along
    /// with their checkpoints.
    #[serde(default = "default_max_archived")]
    pub max_archived_instances: usize,
}

fn default_agent_id() -> String {
    "orchestrator".into()
}
fn default_max_archived() -> usize {
    10_000
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            agent_id: default_agent_id(),
            checkpoint_dir: None,
            default_retry: RetryPolicy::default(),
            max_archived_instances: default_max_archived(),
        }
    }
}
