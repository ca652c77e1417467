use opsmesh_core::AgentRecord;
use opsmesh_orchestrator::{FlowDefinition, OrchestratorConfig, QueueSettings, RegistryConfig};
use serde::Deserialize;
use std::path::Path;
use tracing::info;

/// Contents of `opsmesh.toml`. Every section is optional.
#[derive(Debug, Default, Deserialize)]
pub struct OpsMeshConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub queue: QueueSettings,
    /// Remote agents known at startup.
    #[serde(default)]
    pub agents: Vec<AgentConfig>,
    /// Flow definitions registered next to the built-in ones.
    #[serde(default)]
    pub flows: Vec<FlowDefinition>,
    /// Start in-process agents for every built-in capability.
    #[serde(default)]
    pub demo_agents: bool,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    pub capabilities: Vec<String>,
    pub endpoint: String,
}

impl AgentConfig {
    pub fn to_record(&self) -> AgentRecord {
        let name = self.display_name.clone().unwrap_or_else(|| self.id.clone());
        AgentRecord::new(&self.id, name, &self.capabilities, &self.endpoint)
    }
}

impl OpsMeshConfig {
    /// Reads `path`; a missing file yields the defaults.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e)
        })?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// Built-in flows followed by configured ones.
    pub fn all_flows(&self) -> Vec<FlowDefinition> {
        let mut flows = opsmesh_orchestrator::templates::builtin_flows();
        flows.extend(self.flows.iter().cloned());
        flows
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = OpsMeshConfig::parse("").unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.registry.heartbeat_timeout_secs, 60);
        assert_eq!(config.orchestrator.agent_id, "orchestrator");
        assert_eq!(config.queue.minimum_wait_minutes, 5);
        assert!(!config.demo_agents);
        assert_eq!(config.all_flows().len(), 3);
    }

    #[test]
    fn test_full_config() {
        let raw = r#"
demo_agents = true

[server]
port = 9090

[registry]
heartbeat_timeout_secs = 30

[orchestrator]
checkpoint_dir = "/var/lib/opsmesh/flows"

[orchestrator.default_retry]
max_retries = 5

[queue.priority_multipliers]
urgent = 0.25

[[agents]]
id = "billing"
capabilities = ["billing"]
endpoint = "http://billing.internal:7000"

[[flows]]
id = "discharge_v1"
timeout_seconds = 600

[[flows.steps]]
step_id = "settle"
target_capability = "billing"
action = "settle_invoice"

[[flows.steps]]
step_id = "release_bed"
target_capability = "beds"
action = "release_bed"
depends_on = ["settle"]
required = false
"#;
        let config = OpsMeshConfig::parse(raw).unwrap();
        assert!(config.demo_agents);
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.registry.heartbeat_timeout_secs, 30);
        assert_eq!(config.registry.sweep_interval_secs, 10);
        assert_eq!(config.orchestrator.default_retry.max_retries, 5);
        assert!(config.orchestrator.checkpoint_dir.is_some());
        assert!((config.queue.priority_multipliers.urgent - 0.25).abs() < f64::EPSILON);
        assert!((config.queue.priority_multipliers.low - 1.2).abs() < f64::EPSILON);

        let record = config.agents[0].to_record();
        assert_eq!(record.display_name, "billing");
        assert!(!record.is_local());

        let flow = &config.flows[0];
        assert!(flow.validate().is_ok());
        assert_eq!(flow.steps[1].timeout_seconds, 30);
        assert!(!flow.steps[1].required);
        assert_eq!(config.all_flows().len(), 4);
    }

    #[tokio::test]
    async fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = OpsMeshConfig::load(&dir.path().join("absent.toml")).await.unwrap();
        assert!(config.agents.is_empty());
    }

    #[test]
    fn test_shipped_config_parses() {
        let config = OpsMeshConfig::parse(include_str!("../../../opsmesh.toml")).unwrap();
        assert!(config.demo_agents);
        assert_eq!(config.orchestrator.default_retry.max_delay_ms, 60_000);
        assert!(config.agents.is_empty());
    }
}
