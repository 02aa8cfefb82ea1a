//! Durable run queue: inter-root scheduler state.
//!
//! Rows move through a fixed transition graph; terminal rows are
//! immutable. Every mutating operation accepts an optional
//! `operation_id` and keeps a bounded ring of applied ids, so reconcile
//! turns and run-event mirroring are safe to retry: replaying an applied
//! id is a no-op that returns the existing row.

pub mod coordinator;
pub mod reconcile;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use crate::store::{JournalRecord, JsonlJournal, StorageError};
use crate::types::mint_id;

/// Bound on the per-row applied-operation ring.
pub const APPLIED_OPERATION_RING: usize = 128;

/// What the queued run should do when launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    /// Start a fresh run.
    RunStart,
    /// Resume an existing root.
    RunResume,
}

/// Lifecycle state of a queued run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Waiting for admission.
    Queued,
    /// Admitted; may or may not have a launched job yet.
    Active,
    /// Run paused awaiting review.
    WaitingReview,
    /// Review feedback is being folded back in.
    Refining,
    /// Finished successfully.
    Done,
    /// Finished unsuccessfully.
    Failed,
    /// Cancelled before finishing.
    Cancelled,
}

impl RunState {
    /// Terminal states are immutable.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Done | RunState::Failed | RunState::Cancelled)
    }

    /// States that occupy a root slot for admission purposes.
    pub fn occupies_root(self) -> bool {
        matches!(
            self,
            RunState::Active | RunState::WaitingReview | RunState::Refining
        )
    }
}

/// Who asked for the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunSource {
    /// A chat command.
    Command,
    /// A direct API caller.
    Api,
}

/// One durable run-queue row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunQueueRow {
    /// Stable id (`rq-` prefixed).
    pub queue_id: String,
    /// Enqueuer-chosen dedupe key.
    pub dedupe_key: String,
    /// Start or resume.
    pub mode: RunMode,
    /// Current state.
    pub state: RunState,
    /// Prompt for the run, when one was given.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    /// Root issue the run is bound to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_issue_id: Option<String>,
    /// Step ceiling for the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_steps: Option<u32>,
    /// Command that enqueued the run, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_id: Option<String>,
    /// Who asked for the run.
    pub source: RunSource,
    /// Supervisor job id once launched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    /// When the current attempt started (ms).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at_ms: Option<i64>,
    /// When the row reached a terminal state (ms).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at_ms: Option<i64>,
    /// Exit code of the launched process, when finished.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Pid of the launched process, while running.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    /// Most recent progress line from the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_progress: Option<String>,
    /// When the row was created (ms).
    pub created_at_ms: i64,
    /// When the row last changed (ms).
    pub updated_at_ms: i64,
    /// Monotone per-row revision.
    pub revision: u64,
    /// Bounded ring of applied operation ids, oldest first.
    #[serde(default)]
    pub applied_operation_ids: Vec<String>,
}

impl RunQueueRow {
    /// Unit of admission: the root issue when present, else the row itself.
    pub fn root_slot_key(&self) -> String {
        match &self.root_issue_id {
            Some(root) => format!("root:{root}"),
            None => format!("queue:{}", self.queue_id),
        }
    }

    fn record_operation(&mut self, operation_id: Option<&str>) {
        if let Some(op) = operation_id {
            self.applied_operation_ids.push(op.to_owned());
            while self.applied_operation_ids.len() > APPLIED_OPERATION_RING {
                self.applied_operation_ids.remove(0);
            }
        }
    }

    fn has_applied(&self, operation_id: Option<&str>) -> bool {
        operation_id.is_some_and(|op| self.applied_operation_ids.iter().any(|a| a == op))
    }
}

impl JournalRecord for RunQueueRow {
    fn primary_key(&self) -> &str {
        &self.queue_id
    }

    fn sort_key(&self) -> (i64, u64) {
        (self.updated_at_ms, self.revision)
    }
}

/// Run-queue errors.
#[derive(Debug, thiserror::Error)]
pub enum RunQueueError {
    /// Underlying journal failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// No row with the given id.
    #[error("run queue row not found: {0}")]
    NotFound(String),
    /// The requested transition is outside the allowed graph.
    #[error("invalid_run_queue_transition: {from:?} -> {to:?} for {queue_id}")]
    InvalidTransition {
        /// Row the transition targeted.
        queue_id: String,
        /// State the row was in.
        from: RunState,
        /// State the transition asked for.
        to: RunState,
    },
}

/// Whether `from → to` is in the allowed transition graph.
pub fn transition_allowed(from: RunState, to: RunState) -> bool {
    use RunState::*;
    match from {
        Queued => matches!(to, Active | Cancelled),
        Active => matches!(to, WaitingReview | Done | Failed | Cancelled),
        WaitingReview => matches!(to, Refining | Done | Failed | Cancelled),
        Refining => matches!(to, Queued | Failed | Cancelled),
        Done | Failed | Cancelled => false,
    }
}

/// Parameters for [`RunQueue::enqueue`].
#[derive(Debug, Clone)]
pub struct RunEnqueueParams {
    /// Dedupe key, stable per logical request.
    pub dedupe_key: String,
    /// Start or resume.
    pub mode: RunMode,
    /// Prompt, when one was given.
    pub prompt: Option<String>,
    /// Root issue to bind, if known.
    pub root_issue_id: Option<String>,
    /// Step ceiling.
    pub max_steps: Option<u32>,
    /// Originating command.
    pub command_id: Option<String>,
    /// Who asked.
    pub source: RunSource,
    /// Enqueue time (ms).
    pub now_ms: i64,
}

/// Runtime snapshot mirrored into the queue by the run supervisor.
#[derive(Debug, Clone)]
pub struct RunSnapshot {
    /// Supervisor job id.
    pub job_id: String,
    /// Root issue the run reports, if any.
    pub root_issue_id: Option<String>,
    /// Queue-state equivalent of the runtime state, when it changed.
    pub state: Option<RunState>,
    /// Process pid.
    pub pid: Option<u32>,
    /// Exit code, when finished.
    pub exit_code: Option<i32>,
    /// Latest progress line.
    pub last_progress: Option<String>,
}

/// Journal-backed durable run queue.
pub struct RunQueue {
    journal: JsonlJournal<RunQueueRow>,
    dedupe: Mutex<HashMap<String, String>>,
}

impl RunQueue {
    /// Open the run-queue journal at the given path.
    pub async fn open(path: impl AsRef<std::path::Path>) -> Result<Self, StorageError> {
        let journal: JsonlJournal<RunQueueRow> = JsonlJournal::open(path)?;
        let dedupe: HashMap<String, String> = journal
            .snapshot()
            .await
            .into_iter()
            .map(|r| (r.dedupe_key.clone(), r.queue_id.clone()))
            .collect();
        Ok(Self {
            journal,
            dedupe: Mutex::new(dedupe),
        })
    }

    /// In-memory queue for testing.
    pub fn in_memory() -> Self {
        Self {
            journal: JsonlJournal::in_memory(),
            dedupe: Mutex::new(HashMap::new()),
        }
    }

    /// Enqueue a run, idempotent on `dedupe_key`.
    pub async fn enqueue(&self, params: RunEnqueueParams) -> Result<RunQueueRow, RunQueueError> {
        let mut dedupe = self.dedupe.lock().await;
        if let Some(existing_id) = dedupe.get(&params.dedupe_key) {
            if let Some(row) = self.journal.get(existing_id).await {
                return Ok(row);
            }
        }
        let row = RunQueueRow {
            queue_id: mint_id("rq"),
            dedupe_key: params.dedupe_key.clone(),
            mode: params.mode,
            state: RunState::Queued,
            prompt: params.prompt,
            root_issue_id: params.root_issue_id,
            max_steps: params.max_steps,
            command_id: params.command_id,
            source: params.source,
            job_id: None,
            started_at_ms: None,
            finished_at_ms: None,
            exit_code: None,
            pid: None,
            last_progress: None,
            created_at_ms: params.now_ms,
            updated_at_ms: params.now_ms,
            revision: 1,
            applied_operation_ids: Vec::new(),
        };
        self.journal.append(row.clone()).await?;
        dedupe.insert(params.dedupe_key, row.queue_id.clone());
        info!(
            queue_id = %row.queue_id,
            mode = ?row.mode,
            root = row.root_issue_id.as_deref().unwrap_or("-"),
            "run enqueued"
        );
        Ok(row)
    }

    /// Claim a row into `active`.
    ///
    /// With no `queue_id` the oldest queued row (by
    /// `(created_at_ms, queue_id)`) is claimed; returns `None` when
    /// nothing is queued.
    pub async fn claim(
        &self,
        queue_id: Option<&str>,
        operation_id: Option<&str>,
        now_ms: i64,
    ) -> Result<Option<RunQueueRow>, RunQueueError> {
        let target = match queue_id {
            Some(id) => Some(self.require(id).await?),
            None => {
                let mut queued: Vec<RunQueueRow> = self
                    .journal
                    .snapshot()
                    .await
                    .into_iter()
                    .filter(|r| r.state == RunState::Queued)
                    .collect();
                queued.sort_by(|a, b| {
                    (a.created_at_ms, a.queue_id.as_str())
                        .cmp(&(b.created_at_ms, b.queue_id.as_str()))
                });
                queued.into_iter().next()
            }
        };
        let Some(row) = target else {
            return Ok(None);
        };
        if row.has_applied(operation_id) {
            return Ok(Some(row));
        }
        let row = self
            .apply_transition(row, RunState::Active, operation_id, now_ms)
            .await?;
        Ok(Some(row))
    }

    /// Transition a row to a new state.
    pub async fn transition(
        &self,
        queue_id: &str,
        to_state: RunState,
        operation_id: Option<&str>,
        now_ms: i64,
    ) -> Result<RunQueueRow, RunQueueError> {
        let row = self.require(queue_id).await?;
        if row.has_applied(operation_id) {
            return Ok(row);
        }
        self.apply_transition(row, to_state, operation_id, now_ms)
            .await
    }

    /// Attach runtime details (job id, pid, progress) to a row without
    /// changing its state.
    pub async fn bind_run_snapshot(
        &self,
        queue_id: &str,
        run: &RunSnapshot,
        operation_id: Option<&str>,
        now_ms: i64,
    ) -> Result<RunQueueRow, RunQueueError> {
        let mut row = self.require(queue_id).await?;
        if row.has_applied(operation_id) {
            return Ok(row);
        }
        row.job_id = Some(run.job_id.clone());
        if row.root_issue_id.is_none() {
            row.root_issue_id = run.root_issue_id.clone();
        }
        if let Some(pid) = run.pid {
            row.pid = Some(pid);
        }
        if let Some(progress) = &run.last_progress {
            row.last_progress = Some(progress.clone());
        }
        if row.started_at_ms.is_none() {
            row.started_at_ms = Some(now_ms);
        }
        row.updated_at_ms = now_ms;
        row.revision = row.revision.saturating_add(1);
        row.record_operation(operation_id);
        self.journal.append(row.clone()).await?;
        Ok(row)
    }

    /// Mirror a runtime snapshot onto the row owning its job id.
    ///
    /// Falls back to the newest non-terminal row for the snapshot's root,
    /// then (with `create_if_missing`) to a fresh row sourced from the API.
    pub async fn apply_run_snapshot(
        &self,
        run: &RunSnapshot,
        operation_id: Option<&str>,
        create_if_missing: bool,
        now_ms: i64,
    ) -> Result<Option<RunQueueRow>, RunQueueError> {
        let rows = self.journal.snapshot().await;
        let found = rows
            .iter()
            .find(|r| r.job_id.as_deref() == Some(run.job_id.as_str()))
            .or_else(|| {
                run.root_issue_id.as_ref().and_then(|root| {
                    rows.iter()
                        .filter(|r| {
                            !r.state.is_terminal() && r.root_issue_id.as_deref() == Some(root)
                        })
                        .max_by_key(|r| (r.created_at_ms, r.queue_id.clone()))
                })
            })
            .cloned();

        let mut row = match found {
            Some(row) => row,
            None if create_if_missing => {
                self.enqueue(RunEnqueueParams {
                    dedupe_key: format!("run-snapshot:{}", run.job_id),
                    mode: RunMode::RunResume,
                    prompt: None,
                    root_issue_id: run.root_issue_id.clone(),
                    max_steps: None,
                    command_id: None,
                    source: RunSource::Api,
                    now_ms,
                })
                .await?
            }
            None => return Ok(None),
        };

        if row.has_applied(operation_id) {
            return Ok(Some(row));
        }
        if let Some(target) = run.state {
            if target != row.state {
                if !transition_allowed(row.state, target) {
                    return Err(RunQueueError::InvalidTransition {
                        queue_id: row.queue_id,
                        from: row.state,
                        to: target,
                    });
                }
                row.state = target;
                if target.is_terminal() && row.finished_at_ms.is_none() {
                    row.finished_at_ms = Some(now_ms);
                }
            }
        }
        row.job_id = Some(run.job_id.clone());
        if let Some(pid) = run.pid {
            row.pid = Some(pid);
        }
        if let Some(code) = run.exit_code {
            row.exit_code = Some(code);
        }
        if let Some(progress) = &run.last_progress {
            row.last_progress = Some(progress.clone());
        }
        row.updated_at_ms = now_ms;
        row.revision = row.revision.saturating_add(1);
        row.record_operation(operation_id);
        self.journal.append(row.clone()).await?;
        Ok(Some(row))
    }

    /// Rows filtered by state, newest-created last, optionally limited.
    pub async fn list(&self, states: Option<&[RunState]>, limit: Option<usize>) -> Vec<RunQueueRow> {
        let mut rows: Vec<RunQueueRow> = self
            .journal
            .snapshot()
            .await
            .into_iter()
            .filter(|r| states.map_or(true, |s| s.contains(&r.state)))
            .collect();
        rows.sort_by(|a, b| {
            (a.created_at_ms, a.queue_id.as_str()).cmp(&(b.created_at_ms, b.queue_id.as_str()))
        });
        if let Some(limit) = limit {
            rows.truncate(limit);
        }
        rows
    }

    /// Look up a row by queue id, or the newest non-terminal row for a
    /// root issue id.
    pub async fn get(&self, id_or_root: &str) -> Option<RunQueueRow> {
        if let Some(row) = self.journal.get(id_or_root).await {
            return Some(row);
        }
        self.journal
            .snapshot()
            .await
            .into_iter()
            .filter(|r| !r.state.is_terminal() && r.root_issue_id.as_deref() == Some(id_or_root))
            .max_by_key(|r| (r.created_at_ms, r.queue_id.clone()))
    }

    async fn apply_transition(
        &self,
        mut row: RunQueueRow,
        to_state: RunState,
        operation_id: Option<&str>,
        now_ms: i64,
    ) -> Result<RunQueueRow, RunQueueError> {
        if !transition_allowed(row.state, to_state) {
            return Err(RunQueueError::InvalidTransition {
                queue_id: row.queue_id.clone(),
                from: row.state,
                to: to_state,
            });
        }
        row.state = to_state;
        if to_state == RunState::Active && row.started_at_ms.is_none() {
            row.started_at_ms = Some(now_ms);
        }
        if to_state.is_terminal() && row.finished_at_ms.is_none() {
            row.finished_at_ms = Some(now_ms);
        }
        row.updated_at_ms = now_ms;
        row.revision = row.revision.saturating_add(1);
        row.record_operation(operation_id);
        self.journal.append(row.clone()).await?;
        info!(queue_id = %row.queue_id, state = ?row.state, "run queue transition");
        Ok(row)
    }

    async fn require(&self, queue_id: &str) -> Result<RunQueueRow, RunQueueError> {
        self.journal
            .get(queue_id)
            .await
            .ok_or_else(|| RunQueueError::NotFound(queue_id.to_owned()))
    }
}
