//! Property-based tests for queue ordering and wait estimation.
//!
//! Uses proptest to validate:
//! - Estimates never fall below the configured minimum
//! - Waits are non-decreasing along the service order
//! - Raising a ticket's priority never lengthens its wait

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

use chrono::{DateTime, Duration, TimeZone, Utc};
use opsmesh_orchestrator::{
    PriorityQueueCalculator, QueueEntry, QueuePriority, QueueSettings, QueueStatus, QueueType,
};
use proptest::prelude::*;

fn epoch() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
}

fn priority() -> impl Strategy<Value = QueuePriority> {
    prop_oneof![
        Just(QueuePriority::Low),
        Just(QueuePriority::Medium),
        Just(QueuePriority::High),
        Just(QueuePriority::Urgent),
    ]
}

fn queue_type() -> impl Strategy<Value = QueueType> {
    prop_oneof![
        Just(QueueType::Appointment),
        Just(QueueType::WalkIn),
        Just(QueueType::Emergency),
    ]
}

fn status() -> impl Strategy<Value = QueueStatus> {
    prop_oneof![
        4 => Just(QueueStatus::Waiting),
        1 => Just(QueueStatus::Called),
        1 => Just(QueueStatus::Completed),
    ]
}

fn entries() -> impl Strategy<Value = Vec<QueueEntry>> {
    prop::collection::vec((queue_type(), priority(), status(), 0i64..240), 0..40).prop_map(
        |specs| {
            specs
                .into_iter()
                .enumerate()
                .map(|(i, (kind, prio, status, minute))| {
                    let mut entry = QueueEntry::waiting(
                        format!("t-{i}"),
                        kind,
                        prio,
                        epoch() + Duration::minutes(minute),
                    );
                    entry.status = status;
                    entry
                })
                .collect()
        },
    )
}

proptest! {
    /// Property: no estimate is below the minimum wait
    #[test]
    fn prop_estimate_respects_floor(queue in entries(), minimum in 0u32..30) {
        let calc = PriorityQueueCalculator::new(QueueSettings {
            minimum_wait_minutes: minimum,
            ..QueueSettings::default()
        });
        for entry in &queue {
            prop_assert!(calc.estimate_wait(&queue, entry) >= minimum);
        }
    }

    /// Property: later positions never wait less than earlier ones
    #[test]
    fn prop_wait_monotone_in_position(queue in entries()) {
        let calc = PriorityQueueCalculator::new(QueueSettings::default());
        let ordered = calc.order(&queue);
        let waits: Vec<u32> = ordered.iter().map(|e| calc.estimate_wait(&queue, e)).collect();
        for pair in waits.windows(2) {
            prop_assert!(pair[0] <= pair[1], "waits not monotone: {:?}", waits);
        }
        for (i, entry) in ordered.iter().enumerate() {
            prop_assert_eq!(calc.position(&queue, entry), i + 1);
        }
    }

    /// Property: a newcomer's wait does not grow as its priority rises
    #[test]
    fn prop_wait_non_increasing_in_priority(
        queue in entries(),
        kind in queue_type(),
        minute in 0i64..240,
    ) {
        let calc = PriorityQueueCalculator::new(QueueSettings::default());
        let waits: Vec<u32> = QueuePriority::ALL
            .iter()
            .map(|&prio| {
                let newcomer = QueueEntry::waiting("newcomer", kind, prio, epoch() + Duration::minutes(minute));
                calc.estimate_wait(&queue, &newcomer)
            })
            .collect();
        // ALL runs from highest to lowest priority.
        for pair in waits.windows(2) {
            prop_assert!(pair[0] <= pair[1], "waits by priority: {:?}", waits);
        }
    }

    /// Property: metrics account for every entry exactly once
    #[test]
    fn prop_metrics_partition_entries(queue in entries()) {
        let calc = PriorityQueueCalculator::new(QueueSettings::default());
        let m = calc.metrics(&queue);
        prop_assert_eq!(m.total_entries, queue.len());
        prop_assert_eq!(
            m.waiting + m.called + m.in_progress + m.completed + m.cancelled,
            queue.len()
        );
        prop_assert_eq!(m.priority_breakdown.values().sum::<usize>(), m.waiting);
    }
}
