//! Durable at-least-once outbox.
//!
//! Every outbound message is a journal row keyed by `outbox_id` and
//! deduplicated by `dedupe_key`: re-enqueueing an existing key returns the
//! original record no matter its current state, which collapses duplicate
//! inbound deliveries and re-enqueues from reconciles. Delivery outcomes
//! come back through [`Outbox::mark_delivered`] / [`Outbox::mark_failure`];
//! failures retry with exponential backoff until `max_attempts`, then the
//! record dead-letters.

pub mod dispatch;

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::store::{JournalRecord, JsonlJournal, StorageError};
use crate::types::{mint_id, OutboundEnvelope};

/// Default delivery attempt ceiling.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 8;

/// Backoff base delay in milliseconds.
const BACKOFF_BASE_MS: i64 = 250;

/// Backoff ceiling in milliseconds.
const BACKOFF_MAX_MS: i64 = 60_000;

/// Delivery state of one outbox record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxState {
    /// Waiting for (re)delivery.
    Pending,
    /// Confirmed delivered.
    Delivered,
    /// Exhausted retries.
    DeadLetter,
}

/// One durable outbound message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRecord {
    /// Stable id (`ob-` prefixed).
    pub outbox_id: String,
    /// Enqueuer-chosen key collapsing duplicate enqueues.
    pub dedupe_key: String,
    /// Current delivery state.
    pub state: OutboxState,
    /// The message to deliver.
    pub envelope: OutboundEnvelope,
    /// Attempts made so far.
    pub attempt_count: u32,
    /// Earliest time the next attempt may run (ms).
    pub next_attempt_at_ms: i64,
    /// Attempt ceiling before dead-lettering.
    pub max_attempts: u32,
    /// Most recent delivery error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Why the record dead-lettered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead_letter_reason: Option<String>,
    /// Original record when this one is a replay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replay_of: Option<String>,
    /// When the record was created (ms).
    pub created_at_ms: i64,
    /// When the record last changed (ms).
    pub updated_at_ms: i64,
    /// Monotone per-record revision.
    pub revision: u64,
}

impl JournalRecord for OutboxRecord {
    fn primary_key(&self) -> &str {
        &self.outbox_id
    }

    fn sort_key(&self) -> (i64, u64) {
        (self.updated_at_ms, self.revision)
    }
}

/// Outcome of [`Outbox::enqueue`].
#[derive(Debug, Clone)]
pub enum EnqueueOutcome {
    /// A new record was created.
    Enqueued(OutboxRecord),
    /// The dedupe key already existed; the original record is returned.
    Duplicate(OutboxRecord),
}

impl EnqueueOutcome {
    /// The record either way.
    pub fn record(&self) -> &OutboxRecord {
        match self {
            EnqueueOutcome::Enqueued(r) | EnqueueOutcome::Duplicate(r) => r,
        }
    }

    /// Whether the enqueue created a new record.
    pub fn is_new(&self) -> bool {
        matches!(self, EnqueueOutcome::Enqueued(_))
    }
}

/// Outbox errors.
#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    /// Underlying journal failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// No record with the given id.
    #[error("outbox record not found: {0}")]
    NotFound(String),
    /// The record is not in a state that permits the operation.
    #[error("outbox record {0} is {1:?}, operation not permitted")]
    InvalidState(String, OutboxState),
}

/// Parameters for [`Outbox::enqueue`].
#[derive(Debug, Clone)]
pub struct EnqueueParams {
    /// Dedupe key, stable for semantically-identical messages.
    pub dedupe_key: String,
    /// Message to deliver.
    pub envelope: OutboundEnvelope,
    /// Enqueue time (ms).
    pub now_ms: i64,
    /// Attempt ceiling override.
    pub max_attempts: Option<u32>,
}

/// Journal-backed outbox.
///
/// The dedupe index is guarded by its own mutex held across the
/// check-then-append in `enqueue`, so concurrent enqueues of the same key
/// serialize and exactly one wins.
pub struct Outbox {
    journal: JsonlJournal<OutboxRecord>,
    dedupe: Mutex<HashMap<String, String>>,
}

impl Outbox {
    /// Open the outbox journal at the given path.
    pub async fn open(path: impl AsRef<std::path::Path>) -> Result<Self, StorageError> {
        let journal: JsonlJournal<OutboxRecord> = JsonlJournal::open(path)?;
        let dedupe: HashMap<String, String> = journal
            .snapshot()
            .await
            .into_iter()
            .map(|r| (r.dedupe_key.clone(), r.outbox_id.clone()))
            .collect();
        Ok(Self {
            journal,
            dedupe: Mutex::new(dedupe),
        })
    }

    /// In-memory outbox for testing.
    pub fn in_memory() -> Self {
        Self {
            journal: JsonlJournal::in_memory(),
            dedupe: Mutex::new(HashMap::new()),
        }
    }

    /// Enqueue a message, idempotent on `dedupe_key`.
    pub async fn enqueue(&self, params: EnqueueParams) -> Result<EnqueueOutcome, OutboxError> {
        let mut dedupe = self.dedupe.lock().await;
        if let Some(existing_id) = dedupe.get(&params.dedupe_key) {
            if let Some(record) = self.journal.get(existing_id).await {
                return Ok(EnqueueOutcome::Duplicate(record));
            }
        }
        let record = OutboxRecord {
            outbox_id: mint_id("ob"),
            dedupe_key: params.dedupe_key.clone(),
            state: OutboxState::Pending,
            envelope: params.envelope,
            attempt_count: 0,
            next_attempt_at_ms: params.now_ms,
            max_attempts: params.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            last_error: None,
            dead_letter_reason: None,
            replay_of: None,
            created_at_ms: params.now_ms,
            updated_at_ms: params.now_ms,
            revision: 1,
        };
        self.journal.append(record.clone()).await?;
        dedupe.insert(params.dedupe_key, record.outbox_id.clone());
        info!(
            outbox_id = %record.outbox_id,
            dedupe_key = %record.dedupe_key,
            channel = %record.envelope.channel,
            "outbox record enqueued"
        );
        Ok(EnqueueOutcome::Enqueued(record))
    }

    /// Records in a given state, or all records.
    ///
    /// Pending rows come back sorted by
    /// `(next_attempt_at_ms, created_at_ms, outbox_id)`.
    pub async fn records(&self, state: Option<OutboxState>) -> Vec<OutboxRecord> {
        let mut rows: Vec<OutboxRecord> = self
            .journal
            .snapshot()
            .await
            .into_iter()
            .filter(|r| state.map_or(true, |s| r.state == s))
            .collect();
        rows.sort_by(|a, b| {
            (a.next_attempt_at_ms, a.created_at_ms, a.outbox_id.as_str()).cmp(&(
                b.next_attempt_at_ms,
                b.created_at_ms,
                b.outbox_id.as_str(),
            ))
        });
        rows
    }

    /// Pending records whose next attempt is due at or before `now_ms`.
    pub async fn due(&self, now_ms: i64) -> Vec<OutboxRecord> {
        self.records(Some(OutboxState::Pending))
            .await
            .into_iter()
            .filter(|r| r.next_attempt_at_ms <= now_ms)
            .collect()
    }

    /// Look up a record by id.
    pub async fn get(&self, outbox_id: &str) -> Option<OutboxRecord> {
        self.journal.get(outbox_id).await
    }

    /// Mark a pending record delivered.
    pub async fn mark_delivered(
        &self,
        outbox_id: &str,
        now_ms: i64,
    ) -> Result<OutboxRecord, OutboxError> {
        let mut record = self.require(outbox_id).await?;
        if record.state != OutboxState::Pending {
            return Err(OutboxError::InvalidState(record.outbox_id, record.state));
        }
        record.state = OutboxState::Delivered;
        record.attempt_count = record.attempt_count.saturating_add(1);
        record.updated_at_ms = now_ms;
        record.revision = record.revision.saturating_add(1);
        self.journal.append(record.clone()).await?;
        info!(
            outbox_id = %record.outbox_id,
            attempts = record.attempt_count,
            "outbox record delivered"
        );
        Ok(record)
    }

    /// Record a failed delivery attempt.
    ///
    /// Dead-letters once the incremented attempt count reaches
    /// `max_attempts`; otherwise schedules the next attempt after
    /// `retry_delay_ms` (or the default exponential backoff).
    pub async fn mark_failure(
        &self,
        outbox_id: &str,
        error: &str,
        now_ms: i64,
        retry_delay_ms: Option<i64>,
    ) -> Result<OutboxRecord, OutboxError> {
        let mut record = self.require(outbox_id).await?;
        if record.state != OutboxState::Pending {
            return Err(OutboxError::InvalidState(record.outbox_id, record.state));
        }
        record.attempt_count = record.attempt_count.saturating_add(1);
        record.last_error = Some(error.to_owned());
        record.updated_at_ms = now_ms;
        record.revision = record.revision.saturating_add(1);
        if record.attempt_count >= record.max_attempts {
            record.state = OutboxState::DeadLetter;
            record.dead_letter_reason = Some(error.to_owned());
            warn!(
                outbox_id = %record.outbox_id,
                attempts = record.attempt_count,
                reason = %error,
                "outbox record dead-lettered"
            );
        } else {
            let delay = retry_delay_ms.unwrap_or_else(|| backoff_ms(record.attempt_count));
            record.next_attempt_at_ms = now_ms.saturating_add(delay);
            warn!(
                outbox_id = %record.outbox_id,
                attempts = record.attempt_count,
                retry_in_ms = delay,
                error = %error,
                "outbox delivery failed, will retry"
            );
        }
        self.journal.append(record.clone()).await?;
        Ok(record)
    }

    /// Dead-letter a pending record immediately (non-retryable failure).
    pub async fn mark_permanent_failure(
        &self,
        outbox_id: &str,
        reason: &str,
        now_ms: i64,
    ) -> Result<OutboxRecord, OutboxError> {
        let mut record = self.require(outbox_id).await?;
        if record.state != OutboxState::Pending {
            return Err(OutboxError::InvalidState(record.outbox_id, record.state));
        }
        record.state = OutboxState::DeadLetter;
        record.attempt_count = record.attempt_count.saturating_add(1);
        record.last_error = Some(reason.to_owned());
        record.dead_letter_reason = Some(reason.to_owned());
        record.updated_at_ms = now_ms;
        record.revision = record.revision.saturating_add(1);
        self.journal.append(record.clone()).await?;
        warn!(
            outbox_id = %record.outbox_id,
            reason = %reason,
            "outbox record permanently failed"
        );
        Ok(record)
    }

    /// Clone a delivered or dead-lettered record into a fresh pending one.
    ///
    /// Idempotent per `(outbox_id, requested_by_command_id)` via the
    /// derived dedupe key.
    pub async fn replay(
        &self,
        outbox_id: &str,
        requested_by_command_id: &str,
        now_ms: i64,
    ) -> Result<EnqueueOutcome, OutboxError> {
        let original = self.require(outbox_id).await?;
        if original.state == OutboxState::Pending {
            return Err(OutboxError::InvalidState(original.outbox_id, original.state));
        }
        let outcome = self
            .enqueue(EnqueueParams {
                dedupe_key: format!("replay:{outbox_id}:{requested_by_command_id}"),
                envelope: original.envelope.clone(),
                now_ms,
                max_attempts: Some(original.max_attempts),
            })
            .await?;
        if let EnqueueOutcome::Enqueued(record) = &outcome {
            let mut linked = record.clone();
            linked.replay_of = Some(original.outbox_id.clone());
            linked.revision = linked.revision.saturating_add(1);
            self.journal.append(linked.clone()).await?;
            return Ok(EnqueueOutcome::Enqueued(linked));
        }
        Ok(outcome)
    }

    async fn require(&self, outbox_id: &str) -> Result<OutboxRecord, OutboxError> {
        self.journal
            .get(outbox_id)
            .await
            .ok_or_else(|| OutboxError::NotFound(outbox_id.to_owned()))
    }
}

/// Default retry backoff: `min(60_000, 250 · 2^(attempt-1))` ms.
pub fn backoff_ms(attempt: u32) -> i64 {
    let exponent = attempt.saturating_sub(1).min(16);
    let factor = 1_i64.checked_shl(exponent).unwrap_or(i64::MAX);
    BACKOFF_BASE_MS.saturating_mul(factor).min(BACKOFF_MAX_MS)
}
