//! Pure reconcile planner for the inter-root run queue.
//!
//! Given a snapshot of queue rows and an admission policy, compute which
//! queued rows to activate and which active rows still need a launched
//! job. The function sorts internally, so the plan depends only on the
//! row set and the policy, never on input order.

use std::collections::BTreeSet;

use super::{RunQueueRow, RunState};

/// Admission policy for root slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionPolicy {
    /// At most one root active at a time.
    Sequential,
    /// Up to `max_active_roots` distinct roots active at a time.
    Parallel {
        /// Positive slot ceiling.
        max_active_roots: usize,
    },
}

impl AdmissionPolicy {
    /// Slot ceiling for this policy.
    pub fn max_active_roots(self) -> usize {
        match self {
            AdmissionPolicy::Sequential => 1,
            AdmissionPolicy::Parallel { max_active_roots } => max_active_roots.max(1),
        }
    }
}

/// Output of one reconcile pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcilePlan {
    /// Queued rows to transition into `active`, in admission order.
    pub activate_queue_ids: Vec<String>,
    /// Active rows without a launched job, one per root slot.
    pub launch_queue_ids: Vec<String>,
    /// Distinct root slots currently occupied.
    pub active_root_count: usize,
    /// Free slots remaining after this plan's activations.
    pub available_root_slots: usize,
}

/// Plan one reconcile turn over the given rows.
pub fn reconcile_inter_root_queue(
    rows: &[RunQueueRow],
    policy: AdmissionPolicy,
) -> ReconcilePlan {
    let mut sorted: Vec<&RunQueueRow> = rows.iter().collect();
    sorted.sort_by(|a, b| {
        (a.created_at_ms, a.queue_id.as_str()).cmp(&(b.created_at_ms, b.queue_id.as_str()))
    });

    let occupied: BTreeSet<String> = sorted
        .iter()
        .filter(|r| r.state.occupies_root())
        .map(|r| r.root_slot_key())
        .collect();

    // One launch per root slot: the first active-without-job row wins.
    let mut launch_slots: BTreeSet<String> = BTreeSet::new();
    let mut launch_queue_ids = Vec::new();
    for row in &sorted {
        if row.state == RunState::Active && row.job_id.is_none() {
            let slot = row.root_slot_key();
            if launch_slots.insert(slot) {
                launch_queue_ids.push(row.queue_id.clone());
            }
        }
    }

    let max_roots = policy.max_active_roots();
    let free_slots = max_roots.saturating_sub(occupied.len());

    let mut admitted_slots: BTreeSet<String> = occupied.clone();
    let mut activate_queue_ids = Vec::new();
    for row in &sorted {
        if activate_queue_ids.len() >= free_slots {
            break;
        }
        if row.state != RunState::Queued {
            continue;
        }
        let slot = row.root_slot_key();
        if admitted_slots.insert(slot) {
            activate_queue_ids.push(row.queue_id.clone());
        }
    }

    let available_root_slots = free_slots.saturating_sub(activate_queue_ids.len());
    ReconcilePlan {
        activate_queue_ids,
        launch_queue_ids,
        active_root_count: occupied.len(),
        available_root_slots,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runqueue::{RunMode, RunSource};

    fn row(queue_id: &str, state: RunState, root: Option<&str>, created: i64) -> RunQueueRow {
        RunQueueRow {
            queue_id: queue_id.to_owned(),
            dedupe_key: format!("dk-{queue_id}"),
            mode: RunMode::RunStart,
            state,
            prompt: None,
            root_issue_id: root.map(str::to_owned),
            max_steps: None,
            command_id: None,
            source: RunSource::Command,
            job_id: None,
            started_at_ms: None,
            finished_at_ms: None,
            exit_code: None,
            pid: None,
            last_progress: None,
            created_at_ms: created,
            updated_at_ms: created,
            revision: 1,
            applied_operation_ids: Vec::new(),
        }
    }

    #[test]
    fn test_sequential_admits_one_row() {
        let rows = vec![
            row("rq-1", RunState::Queued, Some("R1"), 100),
            row("rq-2", RunState::Queued, Some("R2"), 200),
            row("rq-3", RunState::Queued, Some("R2"), 300),
        ];
        let plan = reconcile_inter_root_queue(&rows, AdmissionPolicy::Sequential);
        assert_eq!(plan.activate_queue_ids, vec!["rq-1".to_owned()]);
        assert_eq!(plan.active_root_count, 0);
        assert_eq!(plan.available_root_slots, 0);
    }

    #[test]
    fn test_sequential_blocks_while_root_occupied() {
        let rows = vec![
            row("rq-1", RunState::Active, Some("R1"), 100),
            row("rq-2", RunState::Queued, Some("R2"), 200),
        ];
        let plan = reconcile_inter_root_queue(&rows, AdmissionPolicy::Sequential);
        assert!(plan.activate_queue_ids.is_empty());
        assert_eq!(plan.active_root_count, 1);
    }

    #[test]
    fn test_waiting_review_and_refining_occupy_roots() {
        for state in [RunState::WaitingReview, RunState::Refining] {
            let rows = vec![
                row("rq-1", state, Some("R1"), 100),
                row("rq-2", RunState::Queued, Some("R2"), 200),
            ];
            let plan = reconcile_inter_root_queue(&rows, AdmissionPolicy::Sequential);
            assert!(
                plan.activate_queue_ids.is_empty(),
                "{state:?} should occupy the root slot"
            );
        }
    }

    #[test]
    fn test_parallel_admits_distinct_roots_up_to_cap() {
        let rows = vec![
            row("rq-1", RunState::Queued, Some("R1"), 100),
            row("rq-2", RunState::Queued, Some("R1"), 150),
            row("rq-3", RunState::Queued, Some("R2"), 200),
            row("rq-4", RunState::Queued, Some("R3"), 300),
        ];
        let plan = reconcile_inter_root_queue(
            &rows,
            AdmissionPolicy::Parallel {
                max_active_roots: 2,
            },
        );
        // rq-2 shares R1 with rq-1, so rq-3 (R2) is the second admission.
        assert_eq!(
            plan.activate_queue_ids,
            vec!["rq-1".to_owned(), "rq-3".to_owned()]
        );
    }

    #[test]
    fn test_rows_without_root_use_queue_slot() {
        let rows = vec![
            row("rq-1", RunState::Queued, None, 100),
            row("rq-2", RunState::Queued, None, 200),
        ];
        let plan = reconcile_inter_root_queue(
            &rows,
            AdmissionPolicy::Parallel {
                max_active_roots: 2,
            },
        );
        assert_eq!(plan.activate_queue_ids.len(), 2, "each row is its own slot");
    }

    #[test]
    fn test_launch_set_one_per_slot() {
        let mut active_without_job = row("rq-1", RunState::Active, Some("R1"), 100);
        active_without_job.job_id = None;
        let mut second_same_root = row("rq-2", RunState::Active, Some("R1"), 200);
        second_same_root.job_id = None;
        let mut launched = row("rq-3", RunState::Active, Some("R2"), 300);
        launched.job_id = Some("job-1".to_owned());

        let plan = reconcile_inter_root_queue(
            &[active_without_job, second_same_root, launched],
            AdmissionPolicy::Parallel {
                max_active_roots: 4,
            },
        );
        assert_eq!(plan.launch_queue_ids, vec!["rq-1".to_owned()]);
    }

    #[test]
    fn test_plan_is_order_independent() {
        let rows = vec![
            row("rq-1", RunState::Queued, Some("R1"), 100),
            row("rq-2", RunState::Active, Some("R2"), 50),
            row("rq-3", RunState::Queued, Some("R3"), 200),
        ];
        let mut shuffled = rows.clone();
        shuffled.reverse();

        let policy = AdmissionPolicy::Parallel {
            max_active_roots: 3,
        };
        let a = reconcile_inter_root_queue(&rows, policy);
        let b = reconcile_inter_root_queue(&shuffled, policy);
        assert_eq!(a, b);
    }

    #[test]
    fn test_terminal_rows_do_not_occupy() {
        let rows = vec![
            row("rq-1", RunState::Done, Some("R1"), 100),
            row("rq-2", RunState::Failed, Some("R2"), 150),
            row("rq-3", RunState::Queued, Some("R1"), 200),
        ];
        let plan = reconcile_inter_root_queue(&rows, AdmissionPolicy::Sequential);
        assert_eq!(plan.activate_queue_ids, vec!["rq-3".to_owned()]);
    }

    #[test]
    fn test_parallel_policy_minimum_one_slot() {
        assert_eq!(
            AdmissionPolicy::Parallel {
                max_active_roots: 0
            }
            .max_active_roots(),
            1
        );
    }
}
