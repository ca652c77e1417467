use crate::error::{OpsMeshError, OpsMeshResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Endpoint scheme used for agents running inside the coordinator process.
pub const LOCAL_ENDPOINT_SCHEME: &str = "local://";

/// Liveness status of a registered agent.
///
/// Only registration, heartbeats and the liveness sweep change it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Heartbeating and below the busy threshold.
    Available,
    /// Heartbeating but reporting load at or above the busy threshold.
    Busy,
    /// Missed its heartbeat deadline.
    Unhealthy,
    /// Removed by the liveness sweep.
    Evicted,
}

impl AgentStatus {
    /// Whether messages may be delivered to an agent in this status.
    pub fn is_reachable(self) -> bool {
        matches!(self, AgentStatus::Available | AgentStatus::Busy)
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Available => write!(f, "available"),
            AgentStatus::Busy => write!(f, "busy"),
            AgentStatus::Unhealthy => write!(f, "unhealthy"),
            AgentStatus::Evicted => write!(f, "evicted"),
        }
    }
}

/// A registered agent and the capabilities it advertises.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    /// Unique agent id.
    pub id: String,
    /// Human-readable name.
    pub display_name: String,
    /// Capabilities this agent can serve.
    pub capabilities: BTreeSet<String>,
    pub status: AgentStatus,
    pub last_heartbeat: DateTime<Utc>,
    /// Opaque address; `local://<id>` for in-process agents, a base URL otherwise.
    pub endpoint: String,
    /// Load reported with the last heartbeat.
    #[serde(default)]
    pub load: u32,
}

impl AgentRecord {
    /// Builds a record for registration. Status and heartbeat are reset by the registry.
    pub fn new<I, S>(
        id: impl Into<String>,
        display_name: impl Into<String>,
        capabilities: I,
        endpoint: impl Into<String>,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            capabilities: capabilities.into_iter().map(Into::into).collect(),
            status: AgentStatus::Available,
            last_heartbeat: Utc::now(),
            endpoint: endpoint.into(),
            load: 0,
        }
    }

    /// Builds a record for an in-process agent with a `local://` endpoint.
    pub fn local<I, S>(id: impl Into<String>, display_name: impl Into<String>, capabilities: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let id = id.into();
        let endpoint = format!("{LOCAL_ENDPOINT_SCHEME}{id}");
        Self::new(id, display_name, capabilities, endpoint)
    }

    /// Checks the record before it enters the registry.
    pub fn validate(&self) -> OpsMeshResult<()> {
        if self.id.trim().is_empty() {
            return Err(OpsMeshError::InvalidRecord("agent id must not be empty".into()));
        }
        if self.capabilities.iter().any(|c| c.trim().is_empty()) {
            return Err(OpsMeshError::InvalidRecord(format!(
                "agent '{}' advertises an empty capability",
                self.id
            )));
        }
        Ok(())
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    /// Whether the agent lives in this process.
    pub fn is_local(&self) -> bool {
        self.endpoint.starts_with(LOCAL_ENDPOINT_SCHEME)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_id_rejected() {
        let record = AgentRecord::new("  ", "Nobody", ["checkin"], "http://localhost:9000");
        let err = record.validate().unwrap_err();
        assert!(matches!(err, OpsMeshError::InvalidRecord(_)));
    }

    #[test]
    fn test_empty_capability_rejected() {
        let record = AgentRecord::new("frontdesk", "Front Desk", ["checkin", ""], "http://x");
        assert!(record.validate().is_err());
    }

    #[test]
    fn test_local_record_endpoint() {
        let record = AgentRecord::local("frontdesk", "Front Desk", ["checkin", "scheduling"]);
        assert!(record.is_local());
        assert_eq!(record.endpoint, "local://frontdesk");
        assert!(record.has_capability("scheduling"));
        assert!(!record.has_capability("billing"));
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&AgentStatus::Unhealthy).unwrap();
        assert_eq!(json, "\"unhealthy\"");
        assert!(AgentStatus::Busy.is_reachable());
        assert!(!AgentStatus::Evicted.is_reachable());
    }
}
