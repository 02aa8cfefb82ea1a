//! Run-queue coordinator: glue between the pipeline, the durable run
//! queue, and the run supervisor that launches external processes.
//!
//! Reconcile turns are strictly linearized: callers serialize through
//! one async mutex, and a follow-up flag coalesces requests that arrive
//! during a turn. Each turn re-reads queue state, computes the pure
//! plan, and applies claims and launches with per-turn operation ids so
//! a crashed-and-retried turn replays as a no-op.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::pipeline::parse::{parse_command_text, ParsedInbound};
use crate::pipeline::{MutationOutcome, RunCommandGateway};
use crate::types::{mint_id, Clock, CommandRecord};

use super::reconcile::{reconcile_inter_root_queue, AdmissionPolicy};
use super::{
    RunEnqueueParams, RunMode, RunQueue, RunQueueError, RunQueueRow, RunSnapshot, RunSource,
    RunState,
};

/// Ceiling on reconcile turns per outer call.
pub const MAX_RECONCILE_TURNS: u32 = 256;

/// Launches and interrupts external run processes.
#[async_trait]
pub trait RunSupervisor: Send + Sync {
    /// Launch the process for an admitted row; returns the job id.
    async fn launch(&self, row: &RunQueueRow) -> Result<String, String>;

    /// Interrupt a running job. `Ok(true)` when the supervisor knew it.
    async fn interrupt(&self, job_id: &str) -> Result<bool, String>;
}

/// A runtime event mirrored into the durable queue.
#[derive(Debug, Clone)]
pub struct RunEvent {
    /// Monotone per-run sequence number.
    pub seq: u64,
    /// Event kind (`started`, `progress`, `heartbeat`, `exit`, ...).
    pub kind: String,
    /// The runtime snapshot carried by the event.
    pub snapshot: RunSnapshot,
}

impl RunEvent {
    /// Replay-safe operation id for this event.
    pub fn operation_id(&self) -> String {
        format!("run-event:{}:{}", self.seq, self.kind)
    }

    fn triggers_reconcile(&self) -> bool {
        self.kind == "heartbeat"
            || self
                .snapshot
                .state
                .map(RunState::is_terminal)
                .unwrap_or(false)
    }
}

/// Observer for terminal run events (e.g. chat notification fan-out).
#[async_trait]
pub trait RunEventSink: Send + Sync {
    /// Called after a terminal event was mirrored into the queue.
    async fn on_terminal(&self, row: &RunQueueRow, event: &RunEvent);
}

/// Parameters for [`RunQueueCoordinator::launch_queued_run`].
#[derive(Debug, Clone)]
pub struct LaunchParams {
    /// Caller-chosen dedupe key.
    pub dedupe_key: String,
    /// Start or resume.
    pub mode: RunMode,
    /// Prompt, if any.
    pub prompt: Option<String>,
    /// Root issue, if known.
    pub root_issue_id: Option<String>,
    /// Step ceiling.
    pub max_steps: Option<u32>,
    /// Originating command.
    pub command_id: Option<String>,
    /// Who asked.
    pub source: RunSource,
}

/// The coordinator.
pub struct RunQueueCoordinator {
    queue: Arc<RunQueue>,
    supervisor: Arc<dyn RunSupervisor>,
    sink: Option<Arc<dyn RunEventSink>>,
    policy: AdmissionPolicy,
    clock: Arc<dyn Clock>,
    reconcile_lock: Mutex<()>,
    follow_up: AtomicBool,
    turn_counter: AtomicU64,
}

impl RunQueueCoordinator {
    /// Wire up the coordinator.
    pub fn new(
        queue: Arc<RunQueue>,
        supervisor: Arc<dyn RunSupervisor>,
        sink: Option<Arc<dyn RunEventSink>>,
        policy: AdmissionPolicy,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new(Self {
            queue,
            supervisor,
            sink,
            policy,
            clock,
            reconcile_lock: Mutex::new(()),
            follow_up: AtomicBool::new(false),
            turn_counter: AtomicU64::new(0),
        })
    }

    /// The durable queue this coordinator drives.
    pub fn queue(&self) -> &Arc<RunQueue> {
        &self.queue
    }

    /// Enqueue a run, reconcile, and return the latest row view.
    pub async fn launch_queued_run(
        &self,
        params: LaunchParams,
    ) -> Result<RunQueueRow, RunQueueError> {
        let row = self
            .queue
            .enqueue(RunEnqueueParams {
                dedupe_key: params.dedupe_key,
                mode: params.mode,
                prompt: params.prompt,
                root_issue_id: params.root_issue_id,
                max_steps: params.max_steps,
                command_id: params.command_id,
                source: params.source,
                now_ms: self.clock.now_ms(),
            })
            .await?;
        self.schedule_reconcile("enqueue").await?;
        Ok(self.queue.get(&row.queue_id).await.unwrap_or(row))
    }

    /// Interrupt a run by queue id or root issue id.
    ///
    /// Tries the runtime supervisor first; if the durable row is still
    /// queued or active afterwards, it is transitioned to `cancelled`.
    pub async fn interrupt_queued_run(
        &self,
        id_or_root: &str,
    ) -> Result<Option<RunQueueRow>, RunQueueError> {
        let Some(row) = self.queue.get(id_or_root).await else {
            return Ok(None);
        };
        if let Some(job_id) = row.job_id.as_deref() {
            match self.supervisor.interrupt(job_id).await {
                Ok(known) => {
                    info!(queue_id = %row.queue_id, job_id, known, "run interrupt requested");
                }
                Err(e) => {
                    warn!(queue_id = %row.queue_id, job_id, error = %e, "supervisor interrupt failed");
                }
            }
        }
        let current = self.queue.get(&row.queue_id).await.unwrap_or(row);
        if matches!(current.state, RunState::Queued | RunState::Active) {
            let cancelled = self
                .queue
                .transition(
                    &current.queue_id,
                    RunState::Cancelled,
                    Some(&format!("interrupt:{}", current.queue_id)),
                    self.clock.now_ms(),
                )
                .await?;
            self.schedule_reconcile("interrupt").await?;
            return Ok(Some(cancelled));
        }
        Ok(Some(current))
    }

    /// Mirror one runtime event into the durable queue.
    pub async fn on_run_event(&self, event: RunEvent) -> Result<(), RunQueueError> {
        let operation_id = event.operation_id();
        let row = self
            .queue
            .apply_run_snapshot(
                &event.snapshot,
                Some(&operation_id),
                true,
                self.clock.now_ms(),
            )
            .await?;
        if let Some(row) = &row {
            if row.state.is_terminal() {
                if let Some(sink) = &self.sink {
                    sink.on_terminal(row, &event).await;
                }
            }
        }
        if event.triggers_reconcile() {
            self.schedule_reconcile("run-event").await?;
        }
        Ok(())
    }

    /// Run reconcile turns until the queue is quiescent.
    ///
    /// Callers are linearized; a request arriving during another
    /// caller's turn is absorbed by that caller's follow-up loop.
    pub async fn schedule_reconcile(&self, reason: &str) -> Result<(), RunQueueError> {
        self.follow_up.store(true, Ordering::SeqCst);
        let _guard = self.reconcile_lock.lock().await;
        let mut turns = 0u32;
        while self.follow_up.swap(false, Ordering::SeqCst) {
            turns = turns.saturating_add(1);
            if turns > MAX_RECONCILE_TURNS {
                warn!(reason, "reconcile turn ceiling reached");
                break;
            }
            let changed = self.reconcile_turn().await?;
            if changed {
                self.follow_up.store(true, Ordering::SeqCst);
            }
        }
        Ok(())
    }

    /// One reconcile turn. Returns whether anything was applied.
    async fn reconcile_turn(&self) -> Result<bool, RunQueueError> {
        let turn = self.turn_counter.fetch_add(1, Ordering::SeqCst);
        let rows = self.queue.list(None, None).await;
        let plan = reconcile_inter_root_queue(&rows, self.policy);
        let mut changed = false;

        for queue_id in &plan.activate_queue_ids {
            let operation_id = format!("reconcile:{turn}:activate:{queue_id}");
            self.queue
                .claim(Some(queue_id), Some(&operation_id), self.clock.now_ms())
                .await?;
            changed = true;
        }

        for queue_id in &plan.launch_queue_ids {
            let Some(row) = self.queue.get(queue_id).await else {
                continue;
            };
            let operation_id = format!("reconcile:{turn}:launch:{queue_id}");
            match self.supervisor.launch(&row).await {
                Ok(job_id) => {
                    self.queue
                        .bind_run_snapshot(
                            queue_id,
                            &RunSnapshot {
                                job_id,
                                root_issue_id: row.root_issue_id.clone(),
                                state: None,
                                pid: None,
                                exit_code: None,
                                last_progress: None,
                            },
                            Some(&operation_id),
                            self.clock.now_ms(),
                        )
                        .await?;
                    changed = true;
                }
                Err(e) => {
                    warn!(queue_id = %queue_id, error = %e, "run launch failed");
                    self.queue
                        .transition(
                            queue_id,
                            RunState::Failed,
                            Some(&operation_id),
                            self.clock.now_ms(),
                        )
                        .await?;
                    changed = true;
                }
            }
        }

        if changed {
            info!(
                turn,
                activated = plan.activate_queue_ids.len(),
                launched = plan.launch_queue_ids.len(),
                active_roots = plan.active_root_count,
                "reconcile turn applied"
            );
        }
        Ok(changed)
    }
}

#[async_trait]
impl RunCommandGateway for RunQueueCoordinator {
    /// Map `run start`/`run resume`/`run interrupt` command records onto
    /// queue operations.
    async fn execute_run_command(&self, command: &CommandRecord) -> MutationOutcome {
        let parsed = match parse_command_text(&command.envelope.command_text) {
            ParsedInbound::Command(parsed) => parsed,
            other => {
                warn!(?other, "run gateway given a non-run command");
                return MutationOutcome::failed("run_command_unparseable");
            }
        };
        let kind = command.cli_command_kind.as_deref().unwrap_or_default();
        match kind {
            "run_start" | "run_resume" => {
                let mode = if kind == "run_start" {
                    RunMode::RunStart
                } else {
                    RunMode::RunResume
                };
                let result = self
                    .launch_queued_run(LaunchParams {
                        dedupe_key: format!("command:{}", command.command_id),
                        mode,
                        prompt: parsed.prompt.clone(),
                        root_issue_id: parsed.root_issue_id.clone(),
                        max_steps: parsed.max_steps,
                        command_id: Some(command.command_id.clone()),
                        source: RunSource::Command,
                    })
                    .await;
                match result {
                    Ok(row) => MutationOutcome::completed(serde_json::json!({
                        "summary": format!("run {} → {:?}", row.queue_id, row.state),
                        "queue_id": row.queue_id,
                        "state": row.state,
                        "root_issue_id": row.root_issue_id,
                    })),
                    Err(e) => MutationOutcome::failed(e.to_string()),
                }
            }
            "run_interrupt" => {
                let Some(target) = parsed
                    .root_issue_id
                    .as_deref()
                    .or(parsed.target_id.as_deref())
                else {
                    return MutationOutcome::failed("run_target_missing");
                };
                match self.interrupt_queued_run(target).await {
                    Ok(Some(row)) => MutationOutcome::completed(serde_json::json!({
                        "summary": format!("run {} → {:?}", row.queue_id, row.state),
                        "queue_id": row.queue_id,
                        "state": row.state,
                    })),
                    Ok(None) => MutationOutcome::failed("run_not_found"),
                    Err(e) => MutationOutcome::failed(e.to_string()),
                }
            }
            other => {
                warn!(kind = other, "run gateway given a non-run kind");
                MutationOutcome::failed("run_command_unparseable")
            }
        }
    }
}

/// Convenience for hosts that have no real supervisor yet: rejects
/// launches so queued rows fail visibly instead of hanging.
pub struct NullRunSupervisor;

#[async_trait]
impl RunSupervisor for NullRunSupervisor {
    async fn launch(&self, _row: &RunQueueRow) -> Result<String, String> {
        Err("no run supervisor configured".to_owned())
    }

    async fn interrupt(&self, _job_id: &str) -> Result<bool, String> {
        Ok(false)
    }
}

/// Minted job ids for tests and local supervisors.
pub fn mint_job_id() -> String {
    mint_id("job")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SystemClock;
    use std::sync::Mutex as StdMutex;

    /// Supervisor recording launches, optionally failing them.
    struct RecordingSupervisor {
        launches: StdMutex<Vec<String>>,
        interrupts: StdMutex<Vec<String>>,
        fail_launches: bool,
    }

    impl RecordingSupervisor {
        fn new(fail_launches: bool) -> Arc<Self> {
            Arc::new(Self {
                launches: StdMutex::new(Vec::new()),
                interrupts: StdMutex::new(Vec::new()),
                fail_launches,
            })
        }
    }

    #[async_trait]
    impl RunSupervisor for RecordingSupervisor {
        async fn launch(&self, row: &RunQueueRow) -> Result<String, String> {
            if self.fail_launches {
                return Err("spawn failed".to_owned());
            }
            self.launches
                .lock()
                .expect("lock")
                .push(row.queue_id.clone());
            Ok(format!("job-for-{}", row.queue_id))
        }

        async fn interrupt(&self, job_id: &str) -> Result<bool, String> {
            self.interrupts.lock().expect("lock").push(job_id.to_owned());
            Ok(true)
        }
    }

    fn coordinator(
        policy: AdmissionPolicy,
        fail_launches: bool,
    ) -> (Arc<RunQueueCoordinator>, Arc<RunQueue>, Arc<RecordingSupervisor>) {
        let queue = Arc::new(RunQueue::in_memory());
        let supervisor = RecordingSupervisor::new(fail_launches);
        let coordinator = RunQueueCoordinator::new(
            queue.clone(),
            supervisor.clone(),
            None,
            policy,
            Arc::new(SystemClock),
        );
        (coordinator, queue, supervisor)
    }

    fn launch_params(key: &str, root: Option<&str>) -> LaunchParams {
        LaunchParams {
            dedupe_key: key.to_owned(),
            mode: RunMode::RunStart,
            prompt: None,
            root_issue_id: root.map(str::to_owned),
            max_steps: None,
            command_id: None,
            source: RunSource::Api,
        }
    }

    #[tokio::test]
    async fn test_launch_activates_and_launches() {
        let (coordinator, queue, supervisor) =
            coordinator(AdmissionPolicy::Sequential, false);
        let row = coordinator
            .launch_queued_run(launch_params("k1", Some("mu-1")))
            .await
            .expect("launch");
        assert_eq!(row.state, RunState::Active);
        assert!(row.job_id.is_some());
        assert_eq!(supervisor.launches.lock().expect("lock").len(), 1);

        let persisted = queue.get(&row.queue_id).await.expect("row");
        assert_eq!(persisted.job_id, row.job_id);
    }

    #[tokio::test]
    async fn test_sequential_admits_one_at_a_time() {
        let (coordinator, queue, _supervisor) =
            coordinator(AdmissionPolicy::Sequential, false);
        let first = coordinator
            .launch_queued_run(launch_params("k1", Some("R1")))
            .await
            .expect("launch");
        let second = coordinator
            .launch_queued_run(launch_params("k2", Some("R2")))
            .await
            .expect("launch");
        assert_eq!(first.state, RunState::Active);
        assert_eq!(second.state, RunState::Queued, "blocked by sequential policy");

        // Finish the first root; the next reconcile admits the second.
        queue
            .transition(&first.queue_id, RunState::Done, None, 10_000)
            .await
            .expect("finish");
        coordinator
            .schedule_reconcile("test")
            .await
            .expect("reconcile");
        let second_now = queue.get(&second.queue_id).await.expect("row");
        assert_eq!(second_now.state, RunState::Active);
    }

    #[tokio::test]
    async fn test_failed_launch_marks_row_failed() {
        let (coordinator, queue, _supervisor) = coordinator(AdmissionPolicy::Sequential, true);
        let row = coordinator
            .launch_queued_run(launch_params("k1", Some("R1")))
            .await
            .expect("launch");
        assert_eq!(row.state, RunState::Failed);
        let persisted = queue.get(&row.queue_id).await.expect("row");
        assert_eq!(persisted.state, RunState::Failed);
        assert!(persisted.finished_at_ms.is_some());
    }

    #[tokio::test]
    async fn test_run_event_mirrors_and_reconciles() {
        let (coordinator, queue, _supervisor) =
            coordinator(AdmissionPolicy::Sequential, false);
        let first = coordinator
            .launch_queued_run(launch_params("k1", Some("R1")))
            .await
            .expect("launch");
        coordinator
            .launch_queued_run(launch_params("k2", Some("R2")))
            .await
            .expect("launch second");

        let job_id = first.job_id.clone().expect("job id");
        coordinator
            .on_run_event(RunEvent {
                seq: 9,
                kind: "exit".to_owned(),
                snapshot: RunSnapshot {
                    job_id: job_id.clone(),
                    root_issue_id: Some("R1".to_owned()),
                    state: Some(RunState::Done),
                    pid: None,
                    exit_code: Some(0),
                    last_progress: Some("merged".to_owned()),
                },
            })
            .await
            .expect("event");

        let finished = queue.get(&first.queue_id).await.expect("row");
        assert_eq!(finished.state, RunState::Done);
        assert_eq!(finished.exit_code, Some(0));

        // The terminal event freed the slot; R2 was admitted.
        let rows = queue.list(Some(&[RunState::Active]), None).await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].root_issue_id.as_deref(), Some("R2"));
    }

    #[tokio::test]
    async fn test_run_event_replay_is_noop() {
        let (coordinator, queue, _supervisor) =
            coordinator(AdmissionPolicy::Sequential, false);
        let row = coordinator
            .launch_queued_run(launch_params("k1", Some("R1")))
            .await
            .expect("launch");
        let job_id = row.job_id.clone().expect("job id");
        let event = RunEvent {
            seq: 3,
            kind: "exit".to_owned(),
            snapshot: RunSnapshot {
                job_id,
                root_issue_id: Some("R1".to_owned()),
                state: Some(RunState::Done),
                pid: None,
                exit_code: Some(0),
                last_progress: None,
            },
        };
        coordinator.on_run_event(event.clone()).await.expect("event");
        let after_first = queue.get(&row.queue_id).await.expect("row");
        coordinator.on_run_event(event).await.expect("replay");
        let after_replay = queue.get(&row.queue_id).await.expect("row");
        assert_eq!(after_first.revision, after_replay.revision);
    }

    #[tokio::test]
    async fn test_interrupt_cancels_durable_row() {
        let (coordinator, queue, supervisor) =
            coordinator(AdmissionPolicy::Sequential, false);
        let row = coordinator
            .launch_queued_run(launch_params("k1", Some("R1")))
            .await
            .expect("launch");
        let cancelled = coordinator
            .interrupt_queued_run("R1")
            .await
            .expect("interrupt")
            .expect("row");
        assert_eq!(cancelled.state, RunState::Cancelled);
        assert_eq!(supervisor.interrupts.lock().expect("lock").len(), 1);
        let persisted = queue.get(&row.queue_id).await.expect("row");
        assert_eq!(persisted.state, RunState::Cancelled);
    }

    #[tokio::test]
    async fn test_interrupt_unknown_run() {
        let (coordinator, _queue, _supervisor) =
            coordinator(AdmissionPolicy::Sequential, false);
        let result = coordinator.interrupt_queued_run("mu-unknown").await.expect("call");
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_parallel_policy_admits_distinct_roots() {
        let (coordinator, queue, _supervisor) = coordinator(
            AdmissionPolicy::Parallel {
                max_active_roots: 2,
            },
            false,
        );
        coordinator
            .launch_queued_run(launch_params("k1", Some("R1")))
            .await
            .expect("launch");
        coordinator
            .launch_queued_run(launch_params("k2", Some("R2")))
            .await
            .expect("launch");
        coordinator
            .launch_queued_run(launch_params("k3", Some("R3")))
            .await
            .expect("launch");
        let active = queue.list(Some(&[RunState::Active]), None).await;
        assert_eq!(active.len(), 2, "two slots, third stays queued");
    }

    #[tokio::test]
    async fn test_concurrent_schedule_reconcile_is_linear() {
        let (coordinator, queue, _supervisor) =
            coordinator(AdmissionPolicy::Sequential, false);
        coordinator
            .launch_queued_run(launch_params("k1", Some("R1")))
            .await
            .expect("launch");
        let mut handles = Vec::new();
        for _ in 0..8u32 {
            let c = Arc::clone(&coordinator);
            handles.push(tokio::spawn(async move {
                c.schedule_reconcile("stress").await
            }));
        }
        for handle in handles {
            handle.await.expect("join").expect("reconcile");
        }
        // Sequential policy invariant: never more than one active root.
        let active = queue.list(Some(&[RunState::Active]), None).await;
        assert!(active.len() <= 1);
    }
}
