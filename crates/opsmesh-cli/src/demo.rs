//! In-process agents covering every capability of the built-in flows.
//!
//! They keep their state in memory and answer immediately, which is enough
//! to drive the patient flows end to end without any external service.

use async_trait::async_trait;
use chrono::Utc;
use opsmesh_core::{AgentRecord, OpsMeshError, OpsMeshResult, Payload};
use opsmesh_orchestrator::templates::capability;
use opsmesh_orchestrator::{
    ActionHandler, PriorityQueueCalculator, QueueEntry, QueuePriority, QueueSettings, QueueStatus,
    QueueType,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

fn unsupported(agent: &str, action: &str) -> OpsMeshError {
    OpsMeshError::TaskExecution(format!("{agent} does not support action '{action}'"))
}

fn patient_id(payload: &Payload) -> Option<String> {
    match payload.get("patient_id") {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn reply(pairs: impl IntoIterator<Item = (&'static str, Value)>) -> Payload {
    pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect()
}

/// Registers arriving patients.
#[derive(Default)]
pub struct FrontDesk {
    issued: Mutex<u32>,
}

#[async_trait]
impl ActionHandler for FrontDesk {
    async fn execute_action(&self, action: &str, payload: Payload) -> OpsMeshResult<Payload> {
        let checkin_type = match action {
            "patient_checkin" => "appointment",
            "register_walkin" => "walk_in",
            "emergency_checkin" => "emergency",
            other => return Err(unsupported("frontdesk", other)),
        };
        let patient_id = match patient_id(&payload) {
            Some(id) => id,
            None => {
                let mut issued = self.issued.lock();
                *issued += 1;
                format!("P-{:04}", *issued)
            }
        };
        info!(patient_id = %patient_id, checkin_type, "Patient checked in");
        Ok(reply([
            ("patient_id", json!(patient_id)),
            ("checkin_type", json!(checkin_type)),
            ("checked_in_at", json!(Utc::now())),
        ]))
    }
}

/// Confirms booked appointments.
pub struct Scheduler;

#[async_trait]
impl ActionHandler for Scheduler {
    async fn execute_action(&self, action: &str, payload: Payload) -> OpsMeshResult<Payload> {
        if action != "verify_appointment" {
            return Err(unsupported("scheduler", action));
        }
        let appointment = payload
            .get("appointment_id")
            .cloned()
            .unwrap_or_else(|| json!(format!("A-{}", Utc::now().format("%H%M%S"))));
        Ok(reply([
            ("appointment_id", appointment),
            ("appointment_verified", json!(true)),
        ]))
    }
}

/// Checks coverage. Payloads flagged `"uninsured": true` are rejected.
pub struct InsuranceDesk;

#[async_trait]
impl ActionHandler for InsuranceDesk {
    async fn execute_action(&self, action: &str, payload: Payload) -> OpsMeshResult<Payload> {
        if action != "verify_insurance" {
            return Err(unsupported("insurance", action));
        }
        if payload.get("uninsured").and_then(Value::as_bool) == Some(true) {
            return Err(OpsMeshError::TaskExecution("no active coverage on file".into()));
        }
        Ok(reply([
            ("insurance_verified", json!(true)),
            ("coverage", json!("standard")),
        ]))
    }
}

/// Hands out beds from a fixed pool.
pub struct BedManager {
    free: Mutex<Vec<String>>,
}

impl BedManager {
    pub fn new(beds: usize) -> Self {
        Self {
            free: Mutex::new((1..=beds).rev().map(|n| format!("B-{n:02}")).collect()),
        }
    }
}

#[async_trait]
impl ActionHandler for BedManager {
    async fn execute_action(&self, action: &str, _payload: Payload) -> OpsMeshResult<Payload> {
        let ward = match action {
            "reserve_bed" => "general",
            "request_emergency_bed" => "emergency",
            "allocate_critical_bed" => "critical_care",
            other => return Err(unsupported("beds", other)),
        };
        let mut free = self.free.lock();
        let bed = free
            .pop()
            .ok_or_else(|| OpsMeshError::TaskExecution("no beds available".into()))?;
        info!(bed_id = %bed, ward, remaining = free.len(), "Bed assigned");
        Ok(reply([("bed_id", json!(bed)), ("ward", json!(ward))]))
    }
}

/// Keeps the waiting room and estimates waits with [`PriorityQueueCalculator`].
pub struct QueueDesk {
    calculator: PriorityQueueCalculator,
    entries: Mutex<Vec<QueueEntry>>,
}

impl QueueDesk {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            calculator: PriorityQueueCalculator::new(settings),
            entries: Mutex::new(Vec::new()),
        }
    }

    fn enqueue(&self, payload: &Payload, queue_type: QueueType, priority: QueuePriority) -> Payload {
        let id = patient_id(payload).unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let entry = QueueEntry::waiting(id.clone(), queue_type, priority, Utc::now());
        let mut entries = self.entries.lock();
        entries.retain(|e| e.id != id);
        entries.push(entry.clone());
        let position = self.calculator.position(&entries, &entry);
        let wait = self.calculator.estimate_wait(&entries, &entry);
        drop(entries);

        info!(patient_id = %id, position, estimated_wait_minutes = wait, "Patient queued");
        reply([
            ("queue_entry_id", json!(id)),
            ("position", json!(position)),
            ("estimated_wait_minutes", json!(wait)),
        ])
    }

    fn call_next(&self) -> OpsMeshResult<Payload> {
        let mut entries = self.entries.lock();
        let next = self
            .calculator
            .order(&entries)
            .first()
            .map(|e| e.id.clone())
            .ok_or_else(|| OpsMeshError::TaskExecution("no patients waiting".into()))?;
        if let Some(entry) = entries.iter_mut().find(|e| e.id == next) {
            entry.status = QueueStatus::Called;
            entry.started_at = Some(Utc::now());
        }
        Ok(reply([("patient_id", json!(next))]))
    }
}

#[async_trait]
impl ActionHandler for QueueDesk {
    async fn execute_action(&self, action: &str, payload: Payload) -> OpsMeshResult<Payload> {
        match action {
            "add_to_queue" => Ok(self.enqueue(&payload, QueueType::Appointment, QueuePriority::Medium)),
            "add_to_priority_queue" => Ok(self.enqueue(&payload, QueueType::WalkIn, QueuePriority::High)),
            "bypass_queue" => Ok(self.enqueue(&payload, QueueType::Emergency, QueuePriority::Urgent)),
            "call_next_patient" => self.call_next(),
            "get_queue_status" => {
                let metrics = self.calculator.metrics(&self.entries.lock());
                Ok(reply([("metrics", serde_json::to_value(metrics)?)]))
            }
            other => Err(unsupported("queue", other)),
        }
    }
}

/// Assigns staff to admitted patients.
pub struct StaffCoordinator;

#[async_trait]
impl ActionHandler for StaffCoordinator {
    async fn execute_action(&self, action: &str, _payload: Payload) -> OpsMeshResult<Payload> {
        let team = match action {
            "coordinate_care" => "attending_physician",
            "immediate_care_coordination" => "triage_nurse",
            "mobilize_emergency_staff" => "trauma_team",
            other => return Err(unsupported("staff", other)),
        };
        Ok(reply([("assigned", json!(team)), ("notified", json!(true))]))
    }
}

/// One record and handler per built-in capability.
pub fn agents(queue: QueueSettings) -> Vec<(AgentRecord, Arc<dyn ActionHandler>)> {
    vec![
        (
            AgentRecord::local("frontdesk", "Front Desk", [capability::CHECKIN]),
            Arc::new(FrontDesk::default()),
        ),
        (
            AgentRecord::local("scheduler", "Appointment Scheduler", [capability::SCHEDULING]),
            Arc::new(Scheduler),
        ),
        (
            AgentRecord::local("insurance", "Insurance Verification", [capability::INSURANCE]),
            Arc::new(InsuranceDesk),
        ),
        (
            AgentRecord::local("beds", "Bed Manager", [capability::BEDS]),
            Arc::new(BedManager::new(20)),
        ),
        (
            AgentRecord::local("queue", "Queue Manager", [capability::QUEUE]),
            Arc::new(QueueDesk::new(queue)),
        ),
        (
            AgentRecord::local("staff", "Staff Coordinator", [capability::STAFF]),
            Arc::new(StaffCoordinator),
        ),
    ]
}
