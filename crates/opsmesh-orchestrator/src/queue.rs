use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Triage priority of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuePriority {
    Low,
    Medium,
    High,
    Urgent,
}

impl QueuePriority {
    pub const ALL: [QueuePriority; 4] = [
        QueuePriority::Urgent,
        QueuePriority::High,
        QueuePriority::Medium,
        QueuePriority::Low,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            QueuePriority::Low => "low",
            QueuePriority::Medium => "medium",
            QueuePriority::High => "high",
            QueuePriority::Urgent => "urgent",
        }
    }
}

/// How the patient arrived; decides the base processing time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueType {
    Appointment,
    WalkIn,
    Emergency,
    /// Any type not known to this build; processed at the fallback rate.
    #[serde(other)]
    Other,
}

impl QueueType {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueType::Appointment => "appointment",
            QueueType::WalkIn => "walk_in",
            QueueType::Emergency => "emergency",
            QueueType::Other => "other",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    #[default]
    Waiting,
    Called,
    InProgress,
    Completed,
    Cancelled,
}

/// One ticket in a service queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub id: String,
    pub queue_type: QueueType,
    #[serde(default)]
    pub status: QueueStatus,
    pub priority: QueuePriority,
    /// Arrival time.
    pub created_at: DateTime<Utc>,
    /// When service began; used for historical wait metrics.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
}

impl QueueEntry {
    /// A waiting entry that arrived at `created_at`.
    pub fn waiting(
        id: impl Into<String>,
        queue_type: QueueType,
        priority: QueuePriority,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            queue_type,
            status: QueueStatus::Waiting,
            priority,
            created_at,
            started_at: None,
        }
    }
}

/// Tunable inputs of the wait-time model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Estimates never go below this many minutes.
    #[serde(default = "default_minimum_wait")]
    pub minimum_wait_minutes: u32,
    #[serde(default = "default_appointment_minutes")]
    pub appointment_minutes: f64,
    #[serde(default = "default_walk_in_minutes")]
    pub walk_in_minutes: f64,
    #[serde(default = "default_emergency_minutes")]
    pub emergency_minutes: f64,
    /// Processing time for queue types without a dedicated rate.
    #[serde(default = "default_fallback_minutes")]
    pub fallback_minutes: f64,
    #[serde(default = "default_multipliers")]
    pub priority_multipliers: PriorityMultipliers,
}

/// Scale applied to an entry's processing time according to its priority.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorityMultipliers {
    pub urgent: f64,
    pub high: f64,
    pub medium: f64,
    pub low: f64,
}

fn default_minimum_wait() -> u32 {
    5
}
fn default_appointment_minutes() -> f64 {
    30.0
}
fn default_walk_in_minutes() -> f64 {
    20.0
}
fn default_emergency_minutes() -> f64 {
    10.0
}
fn default_fallback_minutes() -> f64 {
    15.0
}
fn default_multipliers() -> PriorityMultipliers {
    PriorityMultipliers {
        urgent: 0.5,
        high: 0.7,
        medium: 1.0,
        low: 1.2,
    }
}

impl Default for PriorityMultipliers {
    fn default() -> Self {
        default_multipliers()
    }
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            minimum_wait_minutes: default_minimum_wait(),
            appointment_minutes: default_appointment_minutes(),
            walk_in_minutes: default_walk_in_minutes(),
            emergency_minutes: default_emergency_minutes(),
            fallback_minutes: default_fallback_minutes(),
            priority_multipliers: default_multipliers(),
        }
    }
}

/// Aggregate view of a queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueMetrics {
    pub total_entries: usize,
    pub waiting: usize,
    pub called: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub cancelled: usize,
    /// Mean minutes between arrival and start of service over completed entries.
    pub average_wait_minutes: f64,
    /// Waiting entries per priority.
    pub priority_breakdown: BTreeMap<String, usize>,
    /// All entries per queue type.
    pub queue_type_breakdown: BTreeMap<String, usize>,
}

/// Converts priority and arrival order into queue positions and wait estimates.
///
/// Every method is pure: the same entries always yield the same answer.
#[derive(Debug, Clone, Default)]
pub struct PriorityQueueCalculator {
    settings: QueueSettings,
}

impl PriorityQueueCalculator {
    pub fn new(settings: QueueSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }

    /// Base processing minutes for one entry of the given type.
    pub fn base_processing_minutes(&self, queue_type: QueueType) -> f64 {
        match queue_type {
            QueueType::Appointment => self.settings.appointment_minutes,
            QueueType::WalkIn => self.settings.walk_in_minutes,
            QueueType::Emergency => self.settings.emergency_minutes,
            QueueType::Other => self.settings.fallback_minutes,
        }
    }

    pub fn priority_multiplier(&self, priority: QueuePriority) -> f64 {
        let m = &self.settings.priority_multipliers;
        match priority {
            QueuePriority::Urgent => m.urgent,
            QueuePriority::High => m.high,
            QueuePriority::Medium => m.medium,
            QueuePriority::Low => m.low,
        }
    }

    /// Waiting entries in service order: priority descending, then arrival ascending.
    /// The sort is stable, so exact ties keep their input order.
    pub fn order<'a>(&self, entries: &'a [QueueEntry]) -> Vec<&'a QueueEntry> {
        let mut waiting: Vec<&QueueEntry> = entries
            .iter()
            .filter(|e| e.status == QueueStatus::Waiting)
            .collect();
        waiting.sort_by(|a, b| service_order(a, b));
        waiting
    }

    /// 1-based rank of `target` among waiting entries, or 0 if it is not waiting there.
    pub fn position(&self, entries: &[QueueEntry], target: &QueueEntry) -> usize {
        self.order(entries)
            .iter()
            .position(|e| e.id == target.id)
            .map_or(0, |i| i + 1)
    }

    /// Estimated minutes until `target` is served.
    ///
    /// Sums the weighted processing time of every waiting entry strictly ahead
    /// of the target. A target that is not in `entries` is placed where it
    /// would land on arrival, behind any exact ties.
    pub fn estimate_wait(&self, entries: &[QueueEntry], target: &QueueEntry) -> u32 {
        let ordered = self.order(entries);
        let ahead: &[&QueueEntry] = match ordered.iter().position(|e| e.id == target.id) {
            Some(i) => &ordered[..i],
            None => {
                let cut = ordered
                    .iter()
                    .take_while(|e| service_order(e, target) != Ordering::Greater)
                    .count();
                &ordered[..cut]
            }
        };
        let total: f64 = ahead
            .iter()
            .map(|e| self.base_processing_minutes(e.queue_type) * self.priority_multiplier(e.priority))
            .sum();
        let minutes = if total.is_finite() && total > 0.0 {
            total.min(f64::from(u32::MAX)) as u32
        } else {
            0
        };
        minutes.max(self.settings.minimum_wait_minutes)
    }

    /// Counts per status, priority and type plus the historical average wait.
    pub fn metrics(&self, entries: &[QueueEntry]) -> QueueMetrics {
        let count = |status: QueueStatus| entries.iter().filter(|e| e.status == status).count();

        let mut priority_breakdown = BTreeMap::new();
        for priority in QueuePriority::ALL {
            let n = entries
                .iter()
                .filter(|e| e.status == QueueStatus::Waiting && e.priority == priority)
                .count();
            priority_breakdown.insert(priority.as_str().to_string(), n);
        }

        let mut queue_type_breakdown: BTreeMap<String, usize> = BTreeMap::new();
        for entry in entries {
            *queue_type_breakdown
                .entry(entry.queue_type.as_str().to_string())
                .or_default() += 1;
        }

        let waits: Vec<f64> = entries
            .iter()
            .filter(|e| e.status == QueueStatus::Completed)
            .filter_map(|e| {
                e.started_at
                    .map(|started| (started - e.created_at).num_seconds() as f64 / 60.0)
            })
            .collect();
        let average_wait_minutes = if waits.is_empty() {
            0.0
        } else {
            let mean = waits.iter().sum::<f64>() / waits.len() as f64;
            (mean * 10.0).round() / 10.0
        };

        QueueMetrics {
            total_entries: entries.len(),
            waiting: count(QueueStatus::Waiting),
            called: count(QueueStatus::Called),
            in_progress: count(QueueStatus::InProgress),
            completed: count(QueueStatus::Completed),
            cancelled: count(QueueStatus::Cancelled),
            average_wait_minutes,
            priority_breakdown,
            queue_type_breakdown,
        }
    }
}

fn service_order(a: &QueueEntry, b: &QueueEntry) -> Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
}
