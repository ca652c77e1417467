use crate::config::RegistryConfig;
use chrono::{DateTime, Utc};
use opsmesh_core::{AgentRecord, AgentStatus, Heartbeat, OpsMeshError, OpsMeshResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use tracing::{debug, info, warn};

#[derive(Default)]
struct RegistryState {
    agents: HashMap<String, AgentRecord>,
    by_capability: HashMap<String, BTreeSet<String>>,
}

impl RegistryState {
    fn index(&mut self, record: &AgentRecord) {
        for cap in &record.capabilities {
            self.by_capability
                .entry(cap.clone())
                .or_default()
                .insert(record.id.clone());
        }
    }

    fn unindex(&mut self, record: &AgentRecord) {
        for cap in &record.capabilities {
            if let Some(ids) = self.by_capability.get_mut(cap) {
                ids.remove(&record.id);
                if ids.is_empty() {
                    self.by_capability.remove(cap);
                }
            }
        }
    }

    fn remove(&mut self, agent_id: &str) -> Option<AgentRecord> {
        let record = self.agents.remove(agent_id)?;
        self.unindex(&record);
        Some(record)
    }
}

/// Agents touched by one liveness sweep.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SweepReport {
    /// Agents that crossed the heartbeat timeout during this sweep.
    pub marked_unhealthy: Vec<String>,
    /// Agents removed for exceeding three times the timeout, with status `Evicted`.
    pub evicted: Vec<AgentRecord>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.marked_unhealthy.is_empty() && self.evicted.is_empty()
    }
}

/// Snapshot counts of registered agents by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total: usize,
    pub available: usize,
    pub busy: usize,
    pub unhealthy: usize,
    pub heartbeat_timeout_secs: u64,
}

/// Capability records of every known agent and their liveness.
///
/// All maps sit behind one mutex. Every critical section is a plain map
/// operation, so the lock is never held across I/O or an `.await`.
pub struct AgentRegistry {
    state: Mutex<RegistryState>,
    config: RegistryConfig,
}

impl AgentRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            config,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Inserts or replaces an agent and rebuilds its capability index entries.
    ///
    /// A registered agent starts `Available` with a fresh heartbeat and zero load.
    pub fn register(&self, mut record: AgentRecord) -> OpsMeshResult<AgentRecord> {
        record.validate()?;
        record.status = AgentStatus::Available;
        record.last_heartbeat = Utc::now();
        record.load = 0;

        let mut state = self.state.lock();
        let replaced = state.remove(&record.id).is_some();
        state.index(&record);
        state.agents.insert(record.id.clone(), record.clone());
        drop(state);

        info!(
            agent_id = %record.id,
            capabilities = ?record.capabilities,
            replaced,
            "Agent registered"
        );
        Ok(record)
    }

    /// Refreshes an agent's heartbeat and derives its status from `load`.
    pub fn heartbeat(&self, agent_id: &str, load: u32) -> OpsMeshResult<AgentStatus> {
        self.heartbeat_at(agent_id, load, Utc::now())
    }

    /// [`heartbeat`](Self::heartbeat) with an explicit clock.
    pub fn heartbeat_at(
        &self,
        agent_id: &str,
        load: u32,
        now: DateTime<Utc>,
    ) -> OpsMeshResult<AgentStatus> {
        let threshold = self.config.busy_load_threshold;
        let mut state = self.state.lock();
        let record = state
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| OpsMeshError::UnknownAgent(agent_id.to_string()))?;
        let previous = record.status;
        record.last_heartbeat = now;
        record.load = load;
        record.status = if load >= threshold {
            AgentStatus::Busy
        } else {
            AgentStatus::Available
        };
        let status = record.status;
        drop(state);

        if previous == AgentStatus::Unhealthy {
            info!(agent_id, status = %status, "Agent recovered");
        } else {
            debug!(agent_id, load, "Heartbeat");
        }
        Ok(status)
    }

    /// Applies a heartbeat message; a non-empty capability list replaces the advertised set.
    pub fn apply_heartbeat(&self, heartbeat: &Heartbeat) -> OpsMeshResult<AgentStatus> {
        if !heartbeat.capabilities.is_empty() {
            let mut state = self.state.lock();
            let current = state
                .agents
                .get(&heartbeat.agent_id)
                .cloned()
                .ok_or_else(|| OpsMeshError::UnknownAgent(heartbeat.agent_id.clone()))?;
            let capabilities: BTreeSet<String> = heartbeat.capabilities.iter().cloned().collect();
            if capabilities != current.capabilities {
                state.unindex(&current);
                let mut updated = current;
                updated.capabilities = capabilities;
                state.index(&updated);
                state.agents.insert(updated.id.clone(), updated);
            }
        }
        self.heartbeat(&heartbeat.agent_id, heartbeat.current_load)
    }

    /// Agents advertising `capability`, least loaded first (ties by id).
    ///
    /// Unhealthy agents are only included when `include_unhealthy` is set.
    pub fn find_by_capability(&self, capability: &str, include_unhealthy: bool) -> Vec<AgentRecord> {
        let state = self.state.lock();
        let mut found: Vec<AgentRecord> = state
            .by_capability
            .get(capability)
            .into_iter()
            .flatten()
            .filter_map(|id| state.agents.get(id))
            .filter(|r| match r.status {
                AgentStatus::Available | AgentStatus::Busy => true,
                AgentStatus::Unhealthy => include_unhealthy,
                AgentStatus::Evicted => false,
            })
            .cloned()
            .collect();
        drop(state);
        found.sort_by(|a, b| a.load.cmp(&b.load).then_with(|| a.id.cmp(&b.id)));
        found
    }

    pub fn get(&self, agent_id: &str) -> Option<AgentRecord> {
        self.state.lock().agents.get(agent_id).cloned()
    }

    pub fn status(&self, agent_id: &str) -> Option<AgentStatus> {
        self.state.lock().agents.get(agent_id).map(|r| r.status)
    }

    /// All registered agents ordered by id.
    pub fn list(&self) -> Vec<AgentRecord> {
        let mut agents: Vec<AgentRecord> = self.state.lock().agents.values().cloned().collect();
        agents.sort_by(|a, b| a.id.cmp(&b.id));
        agents
    }

    /// Removes an agent and all of its capability index entries.
    pub fn unregister(&self, agent_id: &str) -> Option<AgentRecord> {
        let removed = self.state.lock().remove(agent_id);
        if removed.is_some() {
            info!(agent_id, "Agent unregistered");
        }
        removed
    }

    pub fn stats(&self) -> RegistryStats {
        let state = self.state.lock();
        let count = |s: AgentStatus| state.agents.values().filter(|r| r.status == s).count();
        RegistryStats {
            total: state.agents.len(),
            available: count(AgentStatus::Available),
            busy: count(AgentStatus::Busy),
            unhealthy: count(AgentStatus::Unhealthy),
            heartbeat_timeout_secs: self.config.heartbeat_timeout_secs,
        }
    }

    /// One liveness pass against the wall clock.
    pub fn sweep(&self) -> SweepReport {
        self.sweep_at(Utc::now())
    }

    /// One liveness pass as of `now`.
    ///
    /// Agents silent for longer than the heartbeat timeout become `Unhealthy`;
    /// agents silent for longer than three timeouts are unregistered.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let timeout_secs = i64::try_from(self.config.heartbeat_timeout_secs).unwrap_or(i64::MAX);
        let timeout = chrono::Duration::seconds(timeout_secs);
        let eviction = chrono::Duration::seconds(timeout_secs.saturating_mul(3));

        let mut report = SweepReport::default();
        let mut state = self.state.lock();
        let mut to_evict = Vec::new();
        for record in state.agents.values_mut() {
            let silent = now - record.last_heartbeat;
            if silent > eviction {
                to_evict.push(record.id.clone());
            } else if silent > timeout && record.status != AgentStatus::Unhealthy {
                record.status = AgentStatus::Unhealthy;
                report.marked_unhealthy.push(record.id.clone());
            }
        }
        for id in to_evict {
            if let Some(mut record) = state.remove(&id) {
                record.status = AgentStatus::Evicted;
                report.evicted.push(record);
            }
        }
        drop(state);

        report.marked_unhealthy.sort();
        report.evicted.sort_by(|a, b| a.id.cmp(&b.id));
        for id in &report.marked_unhealthy {
            warn!(agent_id = %id, "Agent missed heartbeat deadline, marked unhealthy");
        }
        for record in &report.evicted {
            warn!(agent_id = %record.id, last_heartbeat = %record.last_heartbeat, "Agent evicted");
        }
        report
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::new(RegistryConfig::default())
    }
}
