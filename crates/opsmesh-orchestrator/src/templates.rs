use crate::flow::{FlowDefinition, FlowStep};
use crate::retry::RetryPolicy;
use opsmesh_core::MessagePriority;
use std::time::Duration;

/// Capabilities the built-in flows target.
pub mod capability {
    pub const CHECKIN: &str = "checkin";
    pub const SCHEDULING: &str = "scheduling";
    pub const INSURANCE: &str = "insurance";
    pub const BEDS: &str = "beds";
    pub const QUEUE: &str = "queue";
    pub const STAFF: &str = "staff";
}

fn minutes(m: u64) -> u64 {
    m * 60
}

fn flow(
    id: &str,
    name: &str,
    description: &str,
    category: &str,
    timeout_minutes: u64,
    retry: RetryPolicy,
    steps: Vec<FlowStep>,
) -> FlowDefinition {
    let mut def = FlowDefinition::new(id, steps).with_retry(retry);
    def.name = name.into();
    def.version = "1.0.0".into();
    def.description = description.into();
    def.timeout_seconds = Some(minutes(timeout_minutes));
    def.metadata
        .insert("category".into(), serde_json::Value::String(category.into()));
    def
}

/// Scheduled patient arrival through to care team hand-off.
pub fn appointment_checkin() -> FlowDefinition {
    use capability::*;
    flow(
        "appointment_checkin_v1",
        "Appointment Check-in Flow",
        "Appointment check-in with insurance verification and bed reservation",
        "appointment",
        30,
        RetryPolicy::new(3, Duration::from_secs(5), true),
        vec![
            FlowStep::new("patient_checkin", CHECKIN, "patient_checkin")
                .timeout(minutes(5))
                .priority(MessagePriority::High),
            FlowStep::new("appointment_verification", SCHEDULING, "verify_appointment")
                .depends_on(["patient_checkin"])
                .timeout(minutes(3))
                .priority(MessagePriority::High),
            FlowStep::new("insurance_verification", INSURANCE, "verify_insurance")
                .depends_on(["appointment_verification"])
                .timeout(minutes(10)),
            FlowStep::new("bed_reservation", BEDS, "reserve_bed")
                .depends_on(["insurance_verification"])
                .timeout(minutes(5))
                .priority(MessagePriority::High),
            FlowStep::new("queue_placement", QUEUE, "add_to_queue")
                .depends_on(["bed_reservation"])
                .timeout(minutes(2)),
            FlowStep::new("staff_coordination", STAFF, "coordinate_care")
                .depends_on(["queue_placement"])
                .timeout(minutes(3)),
        ],
    )
}

/// Unscheduled arrival registered and fast-tracked to care.
pub fn walkin_registration() -> FlowDefinition {
    use capability::*;
    flow(
        "walkin_registration_v1",
        "Walk-in Registration Flow",
        "Walk-in patient registration and immediate care coordination",
        "walkin",
        15,
        RetryPolicy::new(2, Duration::from_secs(3), false),
        vec![
            FlowStep::new("walkin_registration", CHECKIN, "register_walkin")
                .timeout(minutes(3))
                .priority(MessagePriority::High),
            FlowStep::new("emergency_bed_request", BEDS, "request_emergency_bed")
                .depends_on(["walkin_registration"])
                .timeout(minutes(2))
                .priority(MessagePriority::Urgent),
            FlowStep::new("priority_queue_placement", QUEUE, "add_to_priority_queue")
                .depends_on(["emergency_bed_request"])
                .timeout(minutes(1))
                .priority(MessagePriority::Urgent),
            FlowStep::new("immediate_staff_coordination", STAFF, "immediate_care_coordination")
                .depends_on(["priority_queue_placement"])
                .timeout(minutes(2))
                .priority(MessagePriority::Urgent),
        ],
    )
}

/// Critical admission that bypasses the regular queue.
pub fn emergency_admission() -> FlowDefinition {
    use capability::*;
    flow(
        "emergency_admission_v1",
        "Emergency Admission Flow",
        "Emergency patient admission with immediate care coordination",
        "emergency",
        5,
        RetryPolicy::new(1, Duration::from_secs(1), false),
        vec![
            FlowStep::new("emergency_checkin", CHECKIN, "emergency_checkin")
                .timeout(minutes(1))
                .priority(MessagePriority::Critical),
            FlowStep::new("critical_bed_allocation", BEDS, "allocate_critical_bed")
                .depends_on(["emergency_checkin"])
                .timeout(minutes(1))
                .priority(MessagePriority::Critical),
            FlowStep::new("immediate_queue_bypass", QUEUE, "bypass_queue")
                .depends_on(["critical_bed_allocation"])
                .timeout(minutes(1))
                .priority(MessagePriority::Critical),
            FlowStep::new("emergency_staff_mobilization", STAFF, "mobilize_emergency_staff")
                .depends_on(["immediate_queue_bypass"])
                .timeout(minutes(1))
                .priority(MessagePriority::Critical),
        ],
    )
}

/// Every built-in flow.
pub fn builtin_flows() -> Vec<FlowDefinition> {
    vec![
        appointment_checkin(),
        walkin_registration(),
        emergency_admission(),
    ]
}
