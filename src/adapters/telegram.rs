//! Telegram adapter: webhook ingress with optional deferred processing.
//!
//! Verification is the `x-telegram-bot-api-secret-token` shared-secret
//! header. Updates normalize into envelopes keyed
//! `telegram-idem-{update|callback}-<id>`; callback data outside the
//! closed `confirm:`/`cancel:` set gets a polite unsupported ack.
//! With deferred ingress enabled, verified envelopes are journaled into
//! the ingress queue, the HTTP ack returns immediately
//! (`sendChatAction typing` for messages, `answerCallbackQuery` for
//! callbacks), and a background drain loop feeds the pipeline with
//! exponential backoff and dead-lettering on repeated failure.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tracing::{info, warn};

use crate::attachments::{AttachmentStore, IngestParams};
use crate::outbox::{backoff_ms, EnqueueParams as OutboxEnqueue, Outbox};
use crate::pipeline::render::{mode_for_channel, render_result};
use crate::pipeline::{CommandPipeline, PipelineError, PipelineResult};
use crate::store::{JournalRecord, JsonlJournal, StorageError};
use crate::types::{
    fingerprint, mint_id, AssuranceTier, AttachmentRef, Channel, Clock, InboundEnvelope,
    OutboundEnvelope, ENVELOPE_VERSION,
};

use super::fetch::AttachmentFetcher;
use super::verify::verify_shared_secret;
use super::{
    AdapterAudit, AdapterError, AdapterIngressResult, AdapterRequest, AdapterResponse,
    AdapterSpec, AuditEvent, ChannelAdapter, REASON_INVALID_JSON, REASON_INVALID_PAYLOAD,
};

/// 503 reason while a generation refuses ingress.
pub const REASON_DRAINING: &str = "telegram_generation_draining";

/// Default attempt ceiling for deferred ingress rows.
pub const DEFAULT_INGRESS_MAX_ATTEMPTS: u32 = 8;

/// Poll interval of the drain loop when rows are waiting on backoff.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Telegram adapter configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelegramConfig {
    /// Webhook shared secret.
    pub webhook_secret: Option<String>,
    /// Bot token for file downloads.
    pub bot_token: Option<String>,
    /// Bot username (display only).
    pub bot_username: Option<String>,
    /// Repository root commands operate on.
    pub repo_root: String,
    /// Whether verified ingress defers through the journal queue.
    pub deferred_ingress: bool,
    /// Attempt ceiling for deferred rows.
    pub ingress_max_attempts: u32,
}

impl TelegramConfig {
    /// Config with deferred ingress on and default attempt ceiling.
    pub fn new(webhook_secret: Option<String>, repo_root: impl Into<String>) -> Self {
        Self {
            webhook_secret,
            bot_token: None,
            bot_username: None,
            repo_root: repo_root.into(),
            deferred_ingress: true,
            ingress_max_attempts: DEFAULT_INGRESS_MAX_ATTEMPTS,
        }
    }
}

// ---------------------------------------------------------------------------
// Deferred ingress queue
// ---------------------------------------------------------------------------

/// State of one deferred ingress row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IngressState {
    /// Waiting for (re)processing.
    Pending,
    /// Processed by the pipeline.
    Completed,
    /// Exhausted retries.
    DeadLetter,
}

/// One deferred ingress row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramIngressRow {
    /// Stable id (`ing-` prefixed).
    pub ingress_id: String,
    /// `telegram:ingress:{update|callback}:<source_id>`.
    pub dedupe_key: String,
    /// Current state.
    pub state: IngressState,
    /// The envelope to process.
    pub envelope: InboundEnvelope,
    /// Attempts made so far.
    pub attempt_count: u32,
    /// Earliest time the next attempt may run (ms).
    pub next_attempt_at_ms: i64,
    /// Attempt ceiling.
    pub max_attempts: u32,
    /// Most recent processing error.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    /// Why the row dead-lettered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dead_letter_reason: Option<String>,
    /// When the row was created (ms).
    pub created_at_ms: i64,
    /// When the row last changed (ms).
    pub updated_at_ms: i64,
    /// Monotone per-row revision.
    pub revision: u64,
}

impl JournalRecord for TelegramIngressRow {
    fn primary_key(&self) -> &str {
        &self.ingress_id
    }

    fn sort_key(&self) -> (i64, u64) {
        (self.updated_at_ms, self.revision)
    }
}

/// Journal-backed deferred ingress queue, shared across generations.
pub struct TelegramIngressQueue {
    journal: JsonlJournal<TelegramIngressRow>,
    dedupe: Mutex<std::collections::HashMap<String, String>>,
}

impl TelegramIngressQueue {
    /// Open the queue journal at the given path.
    pub async fn open(path: impl AsRef<std::path::Path>) -> Result<Self, StorageError> {
        let journal: JsonlJournal<TelegramIngressRow> = JsonlJournal::open(path)?;
        let dedupe: std::collections::HashMap<String, String> = journal
            .snapshot()
            .await
            .into_iter()
            .map(|r| (r.dedupe_key.clone(), r.ingress_id.clone()))
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
            dedupe: Mutex::new(std::collections::HashMap::new()),
        }
    }

    /// Enqueue an envelope, idempotent on the dedupe key.
    pub async fn enqueue(
        &self,
        dedupe_key: String,
        envelope: InboundEnvelope,
        max_attempts: u32,
        now_ms: i64,
    ) -> Result<TelegramIngressRow, StorageError> {
        let mut dedupe = self.dedupe.lock().await;
        if let Some(existing_id) = dedupe.get(&dedupe_key) {
            if let Some(row) = self.journal.get(existing_id).await {
                return Ok(row);
            }
        }
        let row = TelegramIngressRow {
            ingress_id: mint_id("ing"),
            dedupe_key: dedupe_key.clone(),
            state: IngressState::Pending,
            envelope,
            attempt_count: 0,
            next_attempt_at_ms: now_ms,
            max_attempts,
            last_error: None,
            dead_letter_reason: None,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            revision: 1,
        };
        self.journal.append(row.clone()).await?;
        dedupe.insert(dedupe_key, row.ingress_id.clone());
        Ok(row)
    }

    /// Pending rows due at or before `now_ms`, oldest first.
    pub async fn due(&self, now_ms: i64) -> Vec<TelegramIngressRow> {
        let mut rows: Vec<TelegramIngressRow> = self
            .journal
            .snapshot()
            .await
            .into_iter()
            .filter(|r| r.state == IngressState::Pending && r.next_attempt_at_ms <= now_ms)
            .collect();
        rows.sort_by(|a, b| {
            (a.next_attempt_at_ms, a.created_at_ms, a.ingress_id.as_str()).cmp(&(
                b.next_attempt_at_ms,
                b.created_at_ms,
                b.ingress_id.as_str(),
            ))
        });
        rows
    }

    /// Number of pending rows (due or backing off).
    pub async fn pending_count(&self) -> usize {
        self.journal
            .snapshot()
            .await
            .iter()
            .filter(|r| r.state == IngressState::Pending)
            .count()
    }

    /// Mark a row processed.
    pub async fn mark_completed(
        &self,
        ingress_id: &str,
        now_ms: i64,
    ) -> Result<(), StorageError> {
        if let Some(mut row) = self.journal.get(ingress_id).await {
            row.state = IngressState::Completed;
            row.attempt_count = row.attempt_count.saturating_add(1);
            row.updated_at_ms = now_ms;
            row.revision = row.revision.saturating_add(1);
            self.journal.append(row).await?;
        }
        Ok(())
    }

    /// Record a failed attempt; dead-letters at the attempt ceiling.
    /// Returns the updated row.
    pub async fn mark_failure(
        &self,
        ingress_id: &str,
        error: &str,
        now_ms: i64,
    ) -> Result<Option<TelegramIngressRow>, StorageError> {
        let Some(mut row) = self.journal.get(ingress_id).await else {
            return Ok(None);
        };
        row.attempt_count = row.attempt_count.saturating_add(1);
        row.last_error = Some(error.to_owned());
        row.updated_at_ms = now_ms;
        row.revision = row.revision.saturating_add(1);
        if row.attempt_count >= row.max_attempts {
            row.state = IngressState::DeadLetter;
            row.dead_letter_reason = Some(error.to_owned());
        } else {
            row.next_attempt_at_ms = now_ms.saturating_add(backoff_ms(row.attempt_count));
        }
        self.journal.append(row.clone()).await?;
        Ok(Some(row))
    }
}

// ---------------------------------------------------------------------------
// Health probe seam
// ---------------------------------------------------------------------------

/// Injectable health probe so generation swaps can gate on real checks.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// `phase` is `warmup` or `post_cutover`.
    async fn check(&self, phase: &str) -> Result<(), String>;
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

/// The Telegram adapter. One *generation* of it, precisely: the
/// generation manager may run a standby instance alongside the active
/// one during config swaps. Ingress acceptance and queue draining are
/// both gated by per-instance flags.
pub struct TelegramAdapter {
    generation_id: String,
    config: TelegramConfig,
    pipeline: Arc<CommandPipeline>,
    audit: Arc<AdapterAudit>,
    outbox: Arc<Outbox>,
    ingress: Arc<TelegramIngressQueue>,
    clock: Arc<dyn Clock>,
    attachments: Option<Arc<AttachmentStore>>,
    fetcher: Option<Arc<dyn AttachmentFetcher>>,
    health: Option<Arc<dyn HealthProbe>>,
    accept_ingress: AtomicBool,
    drain_enabled: AtomicBool,
    draining: AtomicBool,
    stopped: AtomicBool,
    in_flight: AtomicUsize,
    drain_notify: Notify,
    drain_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

/// Construction parameters for one adapter generation.
pub struct TelegramAdapterDeps {
    /// Generation id (`telegram-adapter-gen-<seq>`).
    pub generation_id: String,
    /// Adapter configuration.
    pub config: TelegramConfig,
    /// The command pipeline.
    pub pipeline: Arc<CommandPipeline>,
    /// Shared audit log.
    pub audit: Arc<AdapterAudit>,
    /// Outbox for deferred replies.
    pub outbox: Arc<Outbox>,
    /// Shared deferred ingress queue.
    pub ingress: Arc<TelegramIngressQueue>,
    /// Clock.
    pub clock: Arc<dyn Clock>,
    /// Attachment store.
    pub attachments: Option<Arc<AttachmentStore>>,
    /// Attachment fetcher.
    pub fetcher: Option<Arc<dyn AttachmentFetcher>>,
    /// Optional health probe.
    pub health: Option<Arc<dyn HealthProbe>>,
}

impl TelegramAdapter {
    /// Build a generation in standby: ingress and draining disabled.
    pub fn standby(deps: TelegramAdapterDeps) -> Arc<Self> {
        Arc::new(Self {
            generation_id: deps.generation_id,
            config: deps.config,
            pipeline: deps.pipeline,
            audit: deps.audit,
            outbox: deps.outbox,
            ingress: deps.ingress,
            clock: deps.clock,
            attachments: deps.attachments,
            fetcher: deps.fetcher,
            health: deps.health,
            accept_ingress: AtomicBool::new(false),
            drain_enabled: AtomicBool::new(false),
            draining: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            drain_notify: Notify::new(),
            drain_task: Mutex::new(None),
        })
    }

    /// Generation id.
    pub fn generation_id(&self) -> &str {
        &self.generation_id
    }

    /// The configuration this generation runs with.
    pub fn config(&self) -> &TelegramConfig {
        &self.config
    }

    /// Whether this generation currently accepts HTTP ingress.
    pub fn accepts_ingress(&self) -> bool {
        self.accept_ingress.load(Ordering::SeqCst) && !self.draining.load(Ordering::SeqCst)
    }

    /// Rows this generation is processing right now.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Spawn the background drain loop for this generation.
    ///
    /// The loop only picks up rows while this generation is active
    /// (`drain_enabled`); a draining generation finishes in-flight rows
    /// and picks up nothing new.
    pub fn spawn_drain_loop(self: &Arc<Self>) {
        let adapter = Arc::clone(self);
        let handle = tokio::spawn(async move {
            adapter.drain_loop().await;
        });
        if let Ok(mut slot) = self.drain_task.try_lock() {
            *slot = Some(handle);
        }
    }

    /// Wake the drain loop (e.g. after an external producer enqueued).
    pub fn schedule_drain(&self) {
        self.drain_notify.notify_one();
    }

    async fn drain_loop(self: Arc<Self>) {
        info!(generation = %self.generation_id, "telegram ingress drain loop started");
        loop {
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            if !self.drain_enabled.load(Ordering::SeqCst) {
                self.drain_notify.notified().await;
                continue;
            }
            let due = self.ingress.due(self.clock.now_ms()).await;
            if due.is_empty() {
                tokio::select! {
                    () = self.drain_notify.notified() => {}
                    () = tokio::time::sleep(DRAIN_POLL_INTERVAL) => {}
                }
                continue;
            }
            for row in due {
                if self.stopped.load(Ordering::SeqCst)
                    || !self.drain_enabled.load(Ordering::SeqCst)
                {
                    break;
                }
                self.process_row(row).await;
            }
        }
        info!(generation = %self.generation_id, "telegram ingress drain loop stopped");
    }

    async fn process_row(&self, row: TelegramIngressRow) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let result = self.process_row_inner(&row).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        if let Err(e) = result {
            let now = self.clock.now_ms();
            match self.ingress.mark_failure(&row.ingress_id, &e, now).await {
                Ok(Some(updated)) if updated.state == IngressState::DeadLetter => {
                    self.audit.log(
                        Channel::Telegram,
                        AuditEvent::DeadLetter,
                        serde_json::json!({
                            "ingress_id": updated.ingress_id,
                            "attempts": updated.attempt_count,
                            "reason": updated.dead_letter_reason,
                        }),
                    );
                }
                Ok(_) => {
                    self.audit.log(
                        Channel::Telegram,
                        AuditEvent::Retry,
                        serde_json::json!({"ingress_id": row.ingress_id, "error": e}),
                    );
                }
                Err(store_err) => {
                    warn!(error = %store_err, "failed to record ingress failure");
                }
            }
        }
    }

    async fn process_row_inner(&self, row: &TelegramIngressRow) -> Result<(), String> {
        let mut envelope = row.envelope.clone();
        if let Some(map) = envelope.metadata.as_object_mut() {
            map.insert("deferred".to_owned(), serde_json::Value::Bool(true));
        } else {
            envelope.metadata = serde_json::json!({"deferred": true});
        }
        let request_id = envelope.request_id.clone();
        let result = self
            .pipeline
            .handle_inbound(envelope.clone())
            .await
            .map_err(|e| e.to_string())?;

        self.maybe_enqueue_deferred_reply(&envelope, &result)
            .await
            .map_err(|e| e.to_string())?;

        let now = self.clock.now_ms();
        self.ingress
            .mark_completed(&row.ingress_id, now)
            .await
            .map_err(|e| e.to_string())?;
        self.audit.log(
            Channel::Telegram,
            AuditEvent::Complete,
            serde_json::json!({"request_id": request_id, "state": result.state()}),
        );
        Ok(())
    }

    /// Deferred deliveries have no synchronous ack to carry the result,
    /// so results that the pipeline did not already queue get a
    /// `sendMessage` outbox record here. Confirm-flow outcomes are
    /// recognizable by their foreign originating request id and skipped:
    /// the pipeline queued those under the command's own dedupe key.
    async fn maybe_enqueue_deferred_reply(
        &self,
        envelope: &InboundEnvelope,
        result: &PipelineResult,
    ) -> Result<(), crate::outbox::OutboxError> {
        let should_reply = match result {
            PipelineResult::Completed { command, .. }
            | PipelineResult::Failed { command, .. }
            | PipelineResult::Cancelled { command }
            | PipelineResult::Expired { command } => {
                command.envelope.request_id == envelope.request_id
            }
            PipelineResult::Denied { .. } | PipelineResult::Invalid { .. } => true,
            PipelineResult::AwaitingConfirmation { .. }
            | PipelineResult::Noop { .. }
            | PipelineResult::Deferred { .. }
            | PipelineResult::OperatorResponse { .. } => false,
        };
        if !should_reply {
            return Ok(());
        }
        let body = render_result(result, mode_for_channel(Channel::Telegram));
        self.outbox
            .enqueue(OutboxEnqueue {
                dedupe_key: format!("reply:{}", envelope.request_id),
                envelope: OutboundEnvelope {
                    channel: Channel::Telegram,
                    channel_tenant_id: envelope.channel_tenant_id.clone(),
                    channel_conversation_id: envelope.channel_conversation_id.clone(),
                    correlation_command_id: None,
                    body,
                    attachments: None,
                    metadata: serde_json::json!({"method": "sendMessage"}),
                },
                now_ms: self.clock.now_ms(),
                max_attempts: None,
            })
            .await?;
        Ok(())
    }

    fn reject(&self, reason: &str, response: AdapterResponse) -> AdapterIngressResult {
        self.audit.log(
            Channel::Telegram,
            AuditEvent::Reject,
            serde_json::json!({"generation": self.generation_id, "reason": reason}),
        );
        AdapterIngressResult::rejected(Channel::Telegram, reason, response)
    }

    // ── Normalization ───────────────────────────────────────────

    async fn normalize(
        &self,
        update: &TelegramUpdate,
        received_at_ms: i64,
    ) -> Result<Normalized, String> {
        if let Some(callback) = &update.callback_query {
            let chat_id = callback
                .message
                .as_ref()
                .map(|m| m.chat.id_string())
                .unwrap_or_default();
            let data = callback.data.clone().unwrap_or_default();
            let command_text = match parse_callback_data(&data) {
                Some(text) => text,
                None => return Err("unsupported_update".to_owned()),
            };
            let envelope = self.envelope(
                &format!("callback-{}", callback.id),
                &chat_id,
                &callback.from.id.to_string(),
                command_text,
                received_at_ms,
                Vec::new(),
                serde_json::json!({"telegram_callback_id": callback.id}),
            );
            return Ok(Normalized {
                envelope,
                source: SourceKind::Callback {
                    callback_query_id: callback.id.clone(),
                },
            });
        }

        let Some(message) = &update.message else {
            return Err("unsupported_update".to_owned());
        };
        let chat_id = message.chat.id_string();
        let actor = message
            .from
            .as_ref()
            .map(|u| u.id.to_string())
            .unwrap_or_default();

        let attachments = self.ingest_message_files(message, received_at_ms).await;
        let text = message
            .text
            .clone()
            .or_else(|| message.caption.clone())
            .unwrap_or_default();
        let command_text = if text.trim().is_empty() {
            match &attachments {
                Ingested::Refs(refs) if !refs.is_empty() => synthetic_attachment_text(refs),
                Ingested::Denied(reason) => format!("[attachment rejected: {reason}]"),
                _ => String::new(),
            }
        } else {
            text
        };

        let refs = match attachments {
            Ingested::Refs(refs) => refs,
            Ingested::Denied(_) => Vec::new(),
        };
        let envelope = self.envelope(
            &format!("update-{}", update.update_id.unwrap_or(0)),
            &chat_id,
            &actor,
            command_text,
            received_at_ms,
            refs,
            serde_json::json!({"telegram_update_id": update.update_id}),
        );
        Ok(Normalized {
            envelope,
            source: SourceKind::Message { chat_id },
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn envelope(
        &self,
        source_id: &str,
        chat_id: &str,
        actor_id: &str,
        command_text: String,
        received_at_ms: i64,
        attachments: Vec<AttachmentRef>,
        metadata: serde_json::Value,
    ) -> InboundEnvelope {
        let tenant = self
            .config
            .bot_username
            .clone()
            .unwrap_or_else(|| "telegram-bot".to_owned());
        InboundEnvelope {
            version: ENVELOPE_VERSION,
            received_at_ms,
            request_id: format!(
                "telegram-{}",
                &crate::types::sha256_hex(&format!("telegram:{source_id}"))[..16]
            ),
            delivery_id: mint_id("dlv"),
            channel: Channel::Telegram,
            channel_tenant_id: tenant,
            channel_conversation_id: chat_id.to_owned(),
            actor_id: actor_id.to_owned(),
            actor_binding_id: None,
            assurance_tier: AssuranceTier::TierB,
            repo_root: self.config.repo_root.clone(),
            command_text: command_text.clone(),
            scope_required: None,
            scope_effective: None,
            target_type: None,
            target_id: None,
            idempotency_key: format!("telegram-idem-{source_id}"),
            fingerprint: fingerprint(&command_text),
            attachments,
            metadata,
        }
    }

    async fn ingest_message_files(
        &self,
        message: &TelegramMessage,
        now_ms: i64,
    ) -> Ingested {
        let Some(document) = &message.document else {
            return Ingested::Refs(Vec::new());
        };
        let (Some(store), Some(fetcher)) = (self.attachments.as_ref(), self.fetcher.as_ref())
        else {
            return Ingested::Refs(Vec::new());
        };
        let name = document.file_name.clone().unwrap_or_else(|| "file".to_owned());
        let mime = document
            .mime_type
            .clone()
            .unwrap_or_else(|| "application/octet-stream".to_owned());
        let size = document.file_size.unwrap_or(0);

        if let Err(reason) = store
            .policy()
            .check_pre_download(Channel::Telegram, &mime, size)
        {
            self.audit.log(
                Channel::Telegram,
                AuditEvent::Reject,
                serde_json::json!({"file": name, "reason": reason}),
            );
            return Ingested::Denied(reason.to_owned());
        }
        let url = format!("telegram-file:{}", document.file_id);
        let fetched = match fetcher.fetch(&url, self.config.bot_token.as_deref()).await {
            Ok(fetched) => fetched,
            Err(e) => {
                self.audit.log(
                    Channel::Telegram,
                    AuditEvent::Reject,
                    serde_json::json!({"file": name, "reason": "download_failed", "error": e}),
                );
                return Ingested::Denied("download_failed".to_owned());
            }
        };
        let stored_mime = fetched.mime.unwrap_or_else(|| mime.clone());
        match store
            .ingest(IngestParams {
                channel: Channel::Telegram,
                file_name: name.clone(),
                declared_mime: mime,
                declared_size: size,
                stored_mime,
                bytes: fetched.bytes,
                malware_flagged: false,
                metadata: serde_json::json!({"telegram_file_id": document.file_id}),
                now_ms,
            })
            .await
        {
            Ok(record) => Ingested::Refs(vec![record.as_ref()]),
            Err(e) => {
                self.audit.log(
                    Channel::Telegram,
                    AuditEvent::Reject,
                    serde_json::json!({"file": name, "reason": e.to_string()}),
                );
                Ingested::Denied(e.to_string())
            }
        }
    }

    // ── Acks ────────────────────────────────────────────────────

    fn deferred_ack(source: &SourceKind) -> AdapterResponse {
        match source {
            SourceKind::Message { chat_id } => AdapterResponse::json(
                200,
                &serde_json::json!({
                    "method": "sendChatAction",
                    "chat_id": chat_id,
                    "action": "typing",
                }),
            ),
            SourceKind::Callback { callback_query_id } => AdapterResponse::json(
                200,
                &serde_json::json!({
                    "method": "answerCallbackQuery",
                    "callback_query_id": callback_query_id,
                    "text": "Processing…",
                }),
            ),
        }
    }

    fn inline_ack(source: &SourceKind, body: &str) -> AdapterResponse {
        match source {
            SourceKind::Message { chat_id } => AdapterResponse::json(
                200,
                &serde_json::json!({
                    "method": "sendMessage",
                    "chat_id": chat_id,
                    "text": body,
                }),
            ),
            SourceKind::Callback { callback_query_id } => AdapterResponse::json(
                200,
                &serde_json::json!({
                    "method": "answerCallbackQuery",
                    "callback_query_id": callback_query_id,
                    "text": body,
                }),
            ),
        }
    }
}

enum Ingested {
    Refs(Vec<AttachmentRef>),
    Denied(String),
}

enum SourceKind {
    Message { chat_id: String },
    Callback { callback_query_id: String },
}

struct Normalized {
    envelope: InboundEnvelope,
    source: SourceKind,
}

/// `confirm:<id>`/`cancel:<id>` callback data → command text.
fn parse_callback_data(data: &str) -> Option<String> {
    if let Some(id) = data.strip_prefix("confirm:") {
        if !id.is_empty() {
            return Some(format!("/mu confirm {id}"));
        }
    }
    if let Some(id) = data.strip_prefix("cancel:") {
        if !id.is_empty() {
            return Some(format!("/mu cancel {id}"));
        }
    }
    None
}

/// Deterministic text for attachment-only messages.
fn synthetic_attachment_text(refs: &[AttachmentRef]) -> String {
    let parts: Vec<String> = refs
        .iter()
        .map(|r| format!("{} ({}, {} bytes)", r.file_name, r.mime, r.size_bytes))
        .collect();
    format!("[attachment] {}", parts.join(", "))
}

#[async_trait]
impl ChannelAdapter for TelegramAdapter {
    fn spec(&self) -> AdapterSpec {
        AdapterSpec {
            channel: Channel::Telegram,
            path: "/webhooks/telegram",
        }
    }

    async fn ingest(&self, request: AdapterRequest) -> AdapterIngressResult {
        self.audit.log(
            Channel::Telegram,
            AuditEvent::Ingest,
            serde_json::json!({"generation": self.generation_id, "method": request.method}),
        );
        if request.method != "POST" {
            return self.reject(
                super::REASON_METHOD_NOT_ALLOWED,
                AdapterResponse::method_not_allowed(),
            );
        }
        if !self.accepts_ingress() {
            return self.reject(REASON_DRAINING, AdapterResponse::text(503, REASON_DRAINING));
        }
        if let Err(e) = verify_shared_secret(
            self.config.webhook_secret.as_deref(),
            request.header("x-telegram-bot-api-secret-token"),
        ) {
            let reason = e.reason("telegram");
            let response = AdapterResponse::unauthorized(&reason);
            return self.reject(&reason, response);
        }

        let update: TelegramUpdate = match serde_json::from_slice(&request.body) {
            Ok(update) => update,
            Err(_) => {
                return self.reject(
                    REASON_INVALID_JSON,
                    AdapterResponse::bad_request(REASON_INVALID_JSON),
                );
            }
        };
        if update.update_id.is_none() && update.callback_query.is_none() {
            return self.reject(
                REASON_INVALID_PAYLOAD,
                AdapterResponse::bad_request(REASON_INVALID_PAYLOAD),
            );
        }

        let normalized = match self.normalize(&update, request.received_at_ms).await {
            Ok(normalized) => normalized,
            Err(reason) if reason == "unsupported_update" => {
                // Polite unsupported-action ack; nothing reaches the pipeline.
                let response = match update.callback_query.as_ref() {
                    Some(cb) => AdapterResponse::json(
                        200,
                        &serde_json::json!({
                            "method": "answerCallbackQuery",
                            "callback_query_id": cb.id,
                            "text": "That action isn't supported.",
                        }),
                    ),
                    None => AdapterResponse::json(200, &serde_json::json!({"ok": true})),
                };
                return AdapterIngressResult {
                    channel: Channel::Telegram,
                    accepted: true,
                    reason: Some("unsupported_update".to_owned()),
                    response,
                    inbound: None,
                    pipeline_result: None,
                    outbox_record: None,
                };
            }
            Err(reason) => {
                return self.reject(&reason, AdapterResponse::bad_request(&reason));
            }
        };

        let Normalized { envelope, source } = normalized;
        self.audit.log(
            Channel::Telegram,
            AuditEvent::Accept,
            serde_json::json!({"request_id": envelope.request_id}),
        );

        if self.config.deferred_ingress {
            let source_tag = match &source {
                SourceKind::Message { .. } => {
                    format!(
                        "update:{}",
                        envelope
                            .metadata
                            .get("telegram_update_id")
                            .and_then(|v| v.as_i64())
                            .unwrap_or_default()
                    )
                }
                SourceKind::Callback { callback_query_id } => {
                    format!("callback:{callback_query_id}")
                }
            };
            let dedupe_key = format!("telegram:ingress:{source_tag}");
            match self
                .ingress
                .enqueue(
                    dedupe_key,
                    envelope.clone(),
                    self.config.ingress_max_attempts,
                    self.clock.now_ms(),
                )
                .await
            {
                Ok(row) => {
                    self.audit.log(
                        Channel::Telegram,
                        AuditEvent::Defer,
                        serde_json::json!({
                            "ingress_id": row.ingress_id,
                            "request_id": envelope.request_id,
                        }),
                    );
                    self.schedule_drain();
                    return AdapterIngressResult {
                        channel: Channel::Telegram,
                        accepted: true,
                        reason: None,
                        response: Self::deferred_ack(&source),
                        inbound: Some(envelope),
                        pipeline_result: None,
                        outbox_record: None,
                    };
                }
                Err(e) => {
                    warn!(error = %e, "telegram ingress enqueue failed");
                    return self.reject(
                        "storage_error",
                        AdapterResponse::text(500, "storage_error"),
                    );
                }
            }
        }

        // Inline processing.
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let outcome = self.pipeline.handle_inbound(envelope.clone()).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        match outcome {
            Ok(result) => {
                let body = render_result(&result, mode_for_channel(Channel::Telegram));
                self.audit.log(
                    Channel::Telegram,
                    AuditEvent::Complete,
                    serde_json::json!({
                        "request_id": envelope.request_id,
                        "state": result.state(),
                    }),
                );
                AdapterIngressResult {
                    channel: Channel::Telegram,
                    accepted: true,
                    reason: None,
                    response: Self::inline_ack(&source, &body),
                    inbound: Some(envelope),
                    pipeline_result: Some(result),
                    outbox_record: None,
                }
            }
            Err(PipelineError::Storage(e)) => {
                warn!(error = %e, "telegram inline ingest hit storage failure");
                self.reject("storage_error", AdapterResponse::text(500, "storage_error"))
            }
        }
    }

    async fn warmup(&self) -> Result<(), AdapterError> {
        let pending = self.ingress.pending_count().await;
        info!(
            generation = %self.generation_id,
            pending,
            "telegram generation warming up"
        );
        // The self-health-check is part of warmup; its failure is the
        // health gate tripping, distinct from a warmup (load) failure.
        if let Some(probe) = &self.health {
            probe
                .check("warmup")
                .await
                .map_err(AdapterError::HealthFailed)?;
        }
        Ok(())
    }

    async fn health_check(&self) -> Result<(), AdapterError> {
        if self.config.webhook_secret.is_none() {
            return Err(AdapterError::HealthFailed(
                "missing_telegram_secret".to_owned(),
            ));
        }
        if let Some(probe) = &self.health {
            probe
                .check("post_cutover")
                .await
                .map_err(AdapterError::HealthFailed)?;
        }
        Ok(())
    }

    fn activate_ingress(&self) {
        self.accept_ingress.store(true, Ordering::SeqCst);
        self.draining.store(false, Ordering::SeqCst);
        self.drain_enabled.store(true, Ordering::SeqCst);
        self.drain_notify.notify_one();
        info!(generation = %self.generation_id, "telegram generation accepting ingress");
    }

    fn begin_drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
        self.accept_ingress.store(false, Ordering::SeqCst);
        // The draining generation finishes in-flight rows only.
        self.drain_enabled.store(false, Ordering::SeqCst);
        info!(generation = %self.generation_id, "telegram generation draining");
    }

    async fn drain(&self, timeout: Duration) -> Result<(), AdapterError> {
        let deadline = tokio::time::Instant::now()
            .checked_add(timeout)
            .unwrap_or_else(tokio::time::Instant::now);
        loop {
            let in_flight = self.in_flight.load(Ordering::SeqCst);
            if in_flight == 0 {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(AdapterError::DrainTimeout(in_flight));
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn stop(&self, force: bool) -> Result<(), AdapterError> {
        self.stopped.store(true, Ordering::SeqCst);
        self.accept_ingress.store(false, Ordering::SeqCst);
        self.drain_enabled.store(false, Ordering::SeqCst);
        self.drain_notify.notify_one();
        let handle = self.drain_task.lock().await.take();
        if let Some(handle) = handle {
            if force {
                handle.abort();
            } else if tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .is_err()
            {
                warn!(generation = %self.generation_id, "drain task did not stop in time");
            }
        }
        info!(generation = %self.generation_id, force, "telegram generation stopped");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Telegram API types (minimal subset)
// ---------------------------------------------------------------------------

/// Telegram `Update` object.
#[derive(Debug, Clone, Deserialize)]
pub struct TelegramUpdate {
    /// Update sequence id.
    pub update_id: Option<i64>,
    /// A new message, if any.
    pub message: Option<TelegramMessage>,
    /// A callback query, if any.
    pub callback_query: Option<TelegramCallbackQuery>,
}

/// Telegram `Message` object (subset of fields we use).
#[derive(Debug, Clone, Deserialize)]
pub struct TelegramMessage {
    /// Message id.
    pub message_id: i64,
    /// Sender.
    pub from: Option<TelegramUser>,
    /// Chat the message arrived in.
    pub chat: TelegramChat,
    /// Message text.
    pub text: Option<String>,
    /// Caption for media messages.
    pub caption: Option<String>,
    /// Attached document, if any.
    pub document: Option<TelegramDocument>,
}

/// Telegram `User` object.
#[derive(Debug, Clone, Deserialize)]
pub struct TelegramUser {
    /// User id.
    pub id: i64,
}

/// Telegram `Chat` object.
#[derive(Debug, Clone, Deserialize)]
pub struct TelegramChat {
    /// Chat id. Kept as JSON so string chat ids survive.
    pub id: serde_json::Value,
}

impl TelegramChat {
    /// Chat id as a plain string (numeric ids lose nothing).
    pub fn id_string(&self) -> String {
        match &self.id {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// Telegram `Document` object.
#[derive(Debug, Clone, Deserialize)]
pub struct TelegramDocument {
    /// Opaque file id for download.
    pub file_id: String,
    /// Original filename.
    pub file_name: Option<String>,
    /// Declared mime type.
    pub mime_type: Option<String>,
    /// Declared size in bytes.
    pub file_size: Option<u64>,
}

/// Telegram `CallbackQuery` object.
#[derive(Debug, Clone, Deserialize)]
pub struct TelegramCallbackQuery {
    /// Callback id.
    pub id: String,
    /// The pressing user.
    pub from: TelegramUser,
    /// The message the button lived on.
    pub message: Option<TelegramMessage>,
    /// Button payload.
    pub data: Option<String>,
}
