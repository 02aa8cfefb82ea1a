//! Command pipeline: inbound envelope → result.
//!
//! Orchestrates parsing, authorization, the confirmation state machine,
//! idempotency collapse, operator dispatch, and mutation execution.
//! Execution itself is delegated to host-provided seams: a
//! [`QueryExecutor`] for read-only commands, a [`MutationExecutor`] for
//! repository mutations, a [`SessionLifecycle`] for `reload`/`update`,
//! and a [`RunCommandGateway`] for run lifecycle commands.
//!
//! All failure modes surface as result variants; the only error the
//! pipeline ever returns is a storage failure while persisting outbox
//! rows, which the adapter maps to a retryable 5xx.

pub mod parse;
pub mod render;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::identity::{assurance_tier_for_channel, IdentityStore};
use crate::operator::broker::{BrokerDecision, OperatorBroker};
use crate::operator::{OperatorBridge, OperatorTurnOutput};
use crate::outbox::{EnqueueParams, Outbox, OutboxError};
use crate::policy::{CommandKind, PolicyEngine};
use crate::store::StorageError;
use crate::types::{
    fingerprint, mint_id, AssuranceTier, Channel, Clock, CommandRecord, CommandState,
    InboundEnvelope, OutboundEnvelope, ENVELOPE_VERSION,
};

use parse::{parse_command_text, ParsedCommand, ParsedInbound};
use render::{mode_for_channel, render_awaiting_confirmation, render_completed, render_failure};

/// Default window a pending confirmation stays valid.
pub const DEFAULT_CONFIRMATION_TTL_MS: i64 = 15 * 60 * 1000;

/// Reason code for a confirm/cancel that does not match a pending command.
pub const REASON_CONFIRMATION_INVALID: &str = "confirmation_invalid_state";

/// Reason code for non-command text on command-only channels.
pub const REASON_EXPLICIT_COMMAND: &str = "channel_requires_explicit_command";

/// Reason code for non-command text elsewhere.
pub const REASON_NOT_COMMAND: &str = "not_command";

/// Outcome of a mutation execution seam.
#[derive(Debug, Clone)]
pub struct MutationOutcome {
    /// `Completed` or `Failed`.
    pub terminal_state: CommandState,
    /// Result payload on success.
    pub result: Option<serde_json::Value>,
    /// Machine reason on failure.
    pub error_code: Option<String>,
    /// Execution trace lines for audit.
    pub trace: Vec<String>,
    /// Events describing what was mutated.
    pub mutating_events: Vec<serde_json::Value>,
}

impl MutationOutcome {
    /// Successful outcome with a payload.
    pub fn completed(result: serde_json::Value) -> Self {
        Self {
            terminal_state: CommandState::Completed,
            result: Some(result),
            error_code: None,
            trace: Vec::new(),
            mutating_events: Vec::new(),
        }
    }

    /// Failed outcome with a reason code.
    pub fn failed(error_code: impl Into<String>) -> Self {
        Self {
            terminal_state: CommandState::Failed,
            result: None,
            error_code: Some(error_code.into()),
            trace: Vec::new(),
            mutating_events: Vec::new(),
        }
    }
}

/// Read-only command execution against the surrounding repository state.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Execute a non-mutating command, returning its payload.
    async fn execute_query(&self, command: &CommandRecord)
        -> Result<serde_json::Value, String>;
}

/// Guarded mutation execution.
#[async_trait]
pub trait MutationExecutor: Send + Sync {
    /// Execute a confirmed mutation.
    async fn execute_mutation(&self, command: &CommandRecord) -> MutationOutcome;
}

/// Lifecycle shortcuts (`reload`, `update`).
#[async_trait]
pub trait SessionLifecycle: Send + Sync {
    /// Reload the control plane configuration.
    async fn reload(&self, command: &CommandRecord) -> MutationOutcome;
    /// Self-update the host.
    async fn update(&self, command: &CommandRecord) -> MutationOutcome;
}

/// Run lifecycle commands, backed by the run-queue coordinator.
#[async_trait]
pub trait RunCommandGateway: Send + Sync {
    /// Handle `run start`/`run resume`/`run interrupt`.
    async fn execute_run_command(&self, command: &CommandRecord) -> MutationOutcome;
}

/// Pipeline result taxonomy.
#[derive(Debug, Clone)]
pub enum PipelineResult {
    /// A mutating command waits for `confirm <command_id>`.
    AwaitingConfirmation {
        /// The pending command.
        command: CommandRecord,
    },
    /// Executed to completion.
    Completed {
        /// The command.
        command: CommandRecord,
        /// Result payload.
        result: Option<serde_json::Value>,
    },
    /// Policy denied the delivery.
    Denied {
        /// Machine reason.
        reason: String,
    },
    /// The text was addressed to the control plane but malformed.
    Invalid {
        /// Machine reason.
        reason: String,
    },
    /// Nothing to do for this delivery.
    Noop {
        /// Machine reason.
        reason: String,
    },
    /// Accepted into a deferred queue.
    Deferred {
        /// The command.
        command: CommandRecord,
    },
    /// The pending confirmation was cancelled.
    Cancelled {
        /// The command.
        command: CommandRecord,
    },
    /// The pending confirmation expired.
    Expired {
        /// The command.
        command: CommandRecord,
    },
    /// Execution failed.
    Failed {
        /// The command.
        command: CommandRecord,
        /// Machine reason.
        reason: Option<String>,
    },
    /// The operator answered conversationally.
    OperatorResponse {
        /// The reply text.
        message: String,
    },
}

impl PipelineResult {
    /// The command state this result corresponds to.
    pub fn state(&self) -> CommandState {
        match self {
            PipelineResult::AwaitingConfirmation { .. } => CommandState::AwaitingConfirmation,
            PipelineResult::Completed { .. } => CommandState::Completed,
            PipelineResult::Denied { .. } => CommandState::Denied,
            PipelineResult::Invalid { .. } => CommandState::Invalid,
            PipelineResult::Noop { .. } => CommandState::Noop,
            PipelineResult::Deferred { .. } => CommandState::Deferred,
            PipelineResult::Cancelled { .. } => CommandState::Cancelled,
            PipelineResult::Expired { .. } => CommandState::Expired,
            PipelineResult::Failed { .. } => CommandState::Failed,
            PipelineResult::OperatorResponse { .. } => CommandState::OperatorResponse,
        }
    }
}

/// Pipeline errors. Only storage failures escape as errors; everything
/// else is a [`PipelineResult`] variant.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Persisting command/outbox state failed; the inbound must be
    /// re-delivered to retry.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl From<OutboxError> for PipelineError {
    fn from(e: OutboxError) -> Self {
        match e {
            OutboxError::Storage(e) => PipelineError::Storage(e),
            // Non-storage outbox misuse inside the pipeline is a logic
            // error surfaced as a storage-class serialization failure.
            other => PipelineError::Storage(StorageError::Serialization(other.to_string())),
        }
    }
}

/// Per-channel chat and confirmation behaviour.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Channels whose free-form text goes to the operator.
    pub chat_channels: HashSet<Channel>,
    /// How long a pending confirmation stays valid.
    pub confirmation_ttl_ms: i64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chat_channels: HashSet::from([Channel::Telegram]),
            confirmation_ttl_ms: DEFAULT_CONFIRMATION_TTL_MS,
        }
    }
}

/// A table entry: the record plus the payload duplicates should observe.
#[derive(Debug, Clone)]
struct CommandEntry {
    record: CommandRecord,
    result: Option<serde_json::Value>,
}

#[derive(Default)]
struct CommandTable {
    by_idempotency_key: HashMap<String, CommandEntry>,
    key_by_command_id: HashMap<String, String>,
}

/// The command pipeline.
pub struct CommandPipeline {
    config: PipelineConfig,
    identity: Arc<IdentityStore>,
    policy: Arc<PolicyEngine>,
    outbox: Arc<Outbox>,
    clock: Arc<dyn Clock>,
    broker: OperatorBroker,
    operator: Option<Arc<OperatorBridge>>,
    queries: Arc<dyn QueryExecutor>,
    mutations: Arc<dyn MutationExecutor>,
    lifecycle: Arc<dyn SessionLifecycle>,
    runs: Arc<dyn RunCommandGateway>,
    commands: Mutex<CommandTable>,
    key_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Everything the pipeline is wired from.
pub struct PipelineDeps {
    /// Chat/confirmation configuration.
    pub config: PipelineConfig,
    /// Identity store.
    pub identity: Arc<IdentityStore>,
    /// Policy engine.
    pub policy: Arc<PolicyEngine>,
    /// Outbox for asynchronous replies.
    pub outbox: Arc<Outbox>,
    /// Clock.
    pub clock: Arc<dyn Clock>,
    /// Operator broker.
    pub broker: OperatorBroker,
    /// Optional operator bridge (chat).
    pub operator: Option<Arc<OperatorBridge>>,
    /// Read-only executor.
    pub queries: Arc<dyn QueryExecutor>,
    /// Mutation executor.
    pub mutations: Arc<dyn MutationExecutor>,
    /// Lifecycle shortcuts.
    pub lifecycle: Arc<dyn SessionLifecycle>,
    /// Run command gateway.
    pub runs: Arc<dyn RunCommandGateway>,
}

impl CommandPipeline {
    /// Wire up a pipeline.
    pub fn new(deps: PipelineDeps) -> Self {
        Self {
            config: deps.config,
            identity: deps.identity,
            policy: deps.policy,
            outbox: deps.outbox,
            clock: deps.clock,
            broker: deps.broker,
            operator: deps.operator,
            queries: deps.queries,
            mutations: deps.mutations,
            lifecycle: deps.lifecycle,
            runs: deps.runs,
            commands: Mutex::new(CommandTable::default()),
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Handle one inbound envelope.
    pub async fn handle_inbound(
        &self,
        mut inbound: InboundEnvelope,
    ) -> Result<PipelineResult, PipelineError> {
        let _guard = self.lock_key(&inbound.idempotency_key).await;

        // Duplicate delivery: observe the current state, no side effects
        // beyond the attempt counter.
        if let Some(result) = self.replay_duplicate(&inbound).await? {
            return Ok(result);
        }

        match parse_command_text(&inbound.command_text) {
            ParsedInbound::NotCommand => self.handle_chat(inbound).await,
            ParsedInbound::Invalid { reason } => Ok(PipelineResult::Invalid { reason }),
            ParsedInbound::Confirm { command_id } => {
                self.handle_confirm(&inbound, &command_id).await
            }
            ParsedInbound::Cancel { command_id } => {
                self.handle_cancel(&inbound, &command_id).await
            }
            ParsedInbound::Command(parsed) => {
                self.resolve_binding(&mut inbound).await;
                self.process_command(inbound, parsed, None).await
            }
        }
    }

    /// Handle a command typed at the local terminal.
    ///
    /// Terminal envelopes carry full trust: channel `editor`, tier A, and
    /// every scope. `request_id` defaults to a minted id.
    pub async fn handle_terminal_inbound(
        &self,
        command_text: &str,
        repo_root: &str,
        request_id: Option<&str>,
    ) -> Result<PipelineResult, PipelineError> {
        let now = self.clock.now_ms();
        let request_id = request_id
            .map(str::to_owned)
            .unwrap_or_else(|| mint_id("term"));
        let inbound = InboundEnvelope {
            version: ENVELOPE_VERSION,
            received_at_ms: now,
            request_id: request_id.clone(),
            delivery_id: mint_id("dlv"),
            channel: Channel::Editor,
            channel_tenant_id: "local".to_owned(),
            channel_conversation_id: "terminal".to_owned(),
            actor_id: "local-operator".to_owned(),
            actor_binding_id: None,
            assurance_tier: AssuranceTier::TierA,
            repo_root: repo_root.to_owned(),
            command_text: command_text.to_owned(),
            scope_required: None,
            scope_effective: None,
            target_type: None,
            target_id: None,
            idempotency_key: format!("terminal-idem-{request_id}"),
            fingerprint: fingerprint(command_text),
            attachments: Vec::new(),
            metadata: serde_json::json!({"terminal": true}),
        };
        self.handle_inbound(inbound).await
    }

    /// Move expired pending confirmations to `expired`. Returns how many.
    pub async fn expire_pending(&self, now_ms: i64) -> Result<usize, PipelineError> {
        let expired: Vec<String> = {
            let table = self.commands.lock().await;
            table
                .by_idempotency_key
                .values()
                .filter(|e| {
                    e.record.state == CommandState::AwaitingConfirmation
                        && e.record
                            .created_at_ms
                            .saturating_add(self.config.confirmation_ttl_ms)
                            <= now_ms
                })
                .map(|e| e.record.envelope.idempotency_key.clone())
                .collect()
        };
        let mut count = 0usize;
        for key in expired {
            let mut table = self.commands.lock().await;
            if let Some(entry) = table.by_idempotency_key.get_mut(&key) {
                if entry.record.state == CommandState::AwaitingConfirmation {
                    entry.record.state = CommandState::Expired;
                    entry.record.error_code = Some("confirmation_expired".to_owned());
                    entry.record.updated_at_ms = now_ms;
                    count = count.saturating_add(1);
                }
            }
        }
        Ok(count)
    }

    // ── Duplicate and chat handling ─────────────────────────────

    async fn replay_duplicate(
        &self,
        inbound: &InboundEnvelope,
    ) -> Result<Option<PipelineResult>, PipelineError> {
        let mut table = self.commands.lock().await;
        let Some(entry) = table.by_idempotency_key.get_mut(&inbound.idempotency_key) else {
            return Ok(None);
        };
        entry.record.attempt = entry.record.attempt.saturating_add(1);
        let entry = entry.clone();
        drop(table);
        info!(
            command_id = %entry.record.command_id,
            state = ?entry.record.state,
            attempt = entry.record.attempt,
            "duplicate delivery collapsed"
        );
        Ok(Some(self.result_for_entry(entry)))
    }

    fn result_for_entry(&self, entry: CommandEntry) -> PipelineResult {
        let reason = entry.record.error_code.clone();
        match entry.record.state {
            CommandState::AwaitingConfirmation => PipelineResult::AwaitingConfirmation {
                command: entry.record,
            },
            CommandState::Completed => PipelineResult::Completed {
                command: entry.record,
                result: entry.result,
            },
            CommandState::Failed => PipelineResult::Failed {
                command: entry.record,
                reason,
            },
            CommandState::Cancelled => PipelineResult::Cancelled {
                command: entry.record,
            },
            CommandState::Expired => PipelineResult::Expired {
                command: entry.record,
            },
            CommandState::Deferred => PipelineResult::Deferred {
                command: entry.record,
            },
            CommandState::OperatorResponse => PipelineResult::OperatorResponse {
                message: entry
                    .result
                    .as_ref()
                    .and_then(|v| v.get("message"))
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_owned(),
            },
            CommandState::Denied => PipelineResult::Denied {
                reason: reason.unwrap_or_else(|| "denied".to_owned()),
            },
            CommandState::Invalid => PipelineResult::Invalid {
                reason: reason.unwrap_or_else(|| "invalid".to_owned()),
            },
            CommandState::Noop => PipelineResult::Noop {
                reason: reason.unwrap_or_else(|| REASON_NOT_COMMAND.to_owned()),
            },
        }
    }

    async fn handle_chat(
        &self,
        mut inbound: InboundEnvelope,
    ) -> Result<PipelineResult, PipelineError> {
        if !inbound.channel.allows_chat() {
            return Ok(PipelineResult::Noop {
                reason: REASON_NOT_COMMAND.to_owned(),
            });
        }
        if !self.config.chat_channels.contains(&inbound.channel) {
            return Ok(PipelineResult::Noop {
                reason: REASON_EXPLICIT_COMMAND.to_owned(),
            });
        }
        let Some(operator) = self.operator.clone() else {
            return Ok(PipelineResult::Noop {
                reason: REASON_NOT_COMMAND.to_owned(),
            });
        };

        self.resolve_binding(&mut inbound).await;
        let turn = operator.run_turn(&inbound).await;

        match turn.output {
            OperatorTurnOutput::Respond { message } => {
                self.maybe_enqueue_reply(&inbound, &message).await?;
                self.store_operator_response(&inbound, &turn.session_id, &turn.turn_id, &message)
                    .await;
                Ok(PipelineResult::OperatorResponse { message })
            }
            OperatorTurnOutput::Command { proposal } => {
                match self.broker.evaluate(&proposal, &inbound) {
                    BrokerDecision::Rejected { reason } => {
                        let message = format!("I can't do that ({reason}).");
                        self.maybe_enqueue_reply(&inbound, &message).await?;
                        self.store_operator_response(
                            &inbound,
                            &turn.session_id,
                            &turn.turn_id,
                            &message,
                        )
                        .await;
                        Ok(PipelineResult::OperatorResponse { message })
                    }
                    BrokerDecision::Approved { command_text } => {
                        let mut brokered = inbound.clone();
                        brokered.request_id = format!("op:{}", inbound.request_id);
                        brokered.idempotency_key = format!("op:{}", inbound.idempotency_key);
                        brokered.command_text = command_text.clone();
                        brokered.fingerprint = fingerprint(&command_text);
                        let _brokered_guard = self.lock_key(&brokered.idempotency_key).await;
                        match parse_command_text(&command_text) {
                            ParsedInbound::Command(parsed) => {
                                self.process_command(
                                    brokered,
                                    parsed,
                                    Some((turn.session_id, turn.turn_id)),
                                )
                                .await
                            }
                            // The broker only emits the closed command set;
                            // anything else is a broker defect.
                            other => {
                                warn!(?other, "broker emitted unparseable command text");
                                Ok(PipelineResult::Invalid {
                                    reason: "operator_action_disallowed".to_owned(),
                                })
                            }
                        }
                    }
                }
            }
        }
    }

    async fn store_operator_response(
        &self,
        inbound: &InboundEnvelope,
        session_id: &str,
        turn_id: &str,
        message: &str,
    ) {
        let now = self.clock.now_ms();
        let record = CommandRecord {
            command_id: mint_id("cmd"),
            envelope: inbound.clone(),
            state: CommandState::OperatorResponse,
            attempt: 1,
            error_code: None,
            operator_session_id: Some(session_id.to_owned()),
            operator_turn_id: Some(turn_id.to_owned()),
            cli_invocation_id: None,
            cli_command_kind: None,
            run_root_id: None,
            command_args: Vec::new(),
            created_at_ms: now,
            updated_at_ms: now,
        };
        self.insert_entry(record, Some(serde_json::json!({"message": message})))
            .await;
    }

    // ── Explicit command processing ─────────────────────────────

    async fn process_command(
        &self,
        mut inbound: InboundEnvelope,
        parsed: ParsedCommand,
        operator_correlation: Option<(String, String)>,
    ) -> Result<PipelineResult, PipelineError> {
        let now = self.clock.now_ms();
        let kind = parsed.kind;
        inbound.scope_required = Some(kind.required_scope().to_owned());
        inbound.target_type = parsed.target_type.clone();
        inbound.target_id = parsed.target_id.clone();

        let granted = self.granted_scopes(&inbound).await;
        match self
            .policy
            .check_scope(kind, granted.iter().map(String::as_str))
        {
            Ok(effective) => inbound.scope_effective = Some(effective.to_owned()),
            Err(e) => {
                warn!(
                    kind = kind.as_str(),
                    actor = %inbound.actor_id,
                    channel = %inbound.channel,
                    "command denied: {e}"
                );
                return Ok(PipelineResult::Denied {
                    reason: e.reason_code().to_owned(),
                });
            }
        }

        let (session_id, turn_id) = match operator_correlation {
            Some((s, t)) => (Some(s), Some(t)),
            None => (None, None),
        };
        let mut record = CommandRecord {
            command_id: mint_id("cmd"),
            envelope: inbound,
            state: CommandState::AwaitingConfirmation,
            attempt: 1,
            error_code: None,
            operator_session_id: session_id,
            operator_turn_id: turn_id,
            cli_invocation_id: None,
            cli_command_kind: Some(kind.as_str().to_owned()),
            run_root_id: parsed.root_issue_id.clone(),
            command_args: parsed.args.clone(),
            created_at_ms: now,
            updated_at_ms: now,
        };

        if !kind.is_mutating() {
            let payload = match self.queries.execute_query(&record).await {
                Ok(payload) => payload,
                Err(reason) => {
                    record.state = CommandState::Failed;
                    record.error_code = Some(reason.clone());
                    record.updated_at_ms = self.clock.now_ms();
                    self.insert_entry(record.clone(), None).await;
                    return Ok(PipelineResult::Failed {
                        command: record,
                        reason: Some(reason),
                    });
                }
            };
            record.state = CommandState::Completed;
            record.updated_at_ms = self.clock.now_ms();
            self.insert_entry(record.clone(), Some(payload.clone())).await;
            return Ok(PipelineResult::Completed {
                command: record,
                result: Some(payload),
            });
        }

        // Mutating: queue the confirmation prompt, then record the
        // pending command. The outbox append happens first so a storage
        // failure surfaces before the idempotency table would collapse a
        // redelivery into a prompt-less awaiting state.
        let prompt = render_awaiting_confirmation(&record);
        self.enqueue_for_command(&record, "awaiting", &prompt).await?;
        self.insert_entry(record.clone(), None).await;
        info!(
            command_id = %record.command_id,
            kind = kind.as_str(),
            "mutation awaiting confirmation"
        );
        Ok(PipelineResult::AwaitingConfirmation { command: record })
    }

    async fn handle_confirm(
        &self,
        confirm_inbound: &InboundEnvelope,
        command_id: &str,
    ) -> Result<PipelineResult, PipelineError> {
        let now = self.clock.now_ms();
        let Some(mut entry) = self.take_pending(command_id, now).await else {
            return Ok(PipelineResult::Denied {
                reason: REASON_CONFIRMATION_INVALID.to_owned(),
            });
        };

        if entry.record.state == CommandState::Expired {
            let body = render_failure(
                CommandState::Expired,
                "confirmation_expired",
                "The pending command expired before it was confirmed.",
                None,
                mode_for_channel(entry.record.envelope.channel),
            );
            self.enqueue_for_command(&entry.record, "result", &body).await?;
            self.record_confirm_delivery(confirm_inbound, &entry).await;
            return Ok(PipelineResult::Expired {
                command: entry.record,
            });
        }

        // Kill switch is consulted at confirmation time.
        if let Err(e) = self.policy.check_mutation_allowed() {
            entry.record.state = CommandState::Failed;
            entry.record.error_code = Some(e.reason_code().to_owned());
            entry.record.updated_at_ms = now;
            self.update_entry(&entry).await;
            let body = render_failure(
                CommandState::Failed,
                e.reason_code(),
                "Mutations are disabled by the global kill switch.",
                Some(&serde_json::json!({"switch": "ops.mutations_enabled"})),
                mode_for_channel(entry.record.envelope.channel),
            );
            self.enqueue_for_command(&entry.record, "result", &body).await?;
            self.record_confirm_delivery(confirm_inbound, &entry).await;
            return Ok(PipelineResult::Failed {
                command: entry.record,
                reason: Some(e.reason_code().to_owned()),
            });
        }

        let kind = entry
            .record
            .cli_command_kind
            .as_deref()
            .and_then(kind_from_wire);
        entry.record.cli_invocation_id = Some(mint_id("cli"));
        let outcome = match kind {
            Some(k) if k.is_run_trigger() => self.runs.execute_run_command(&entry.record).await,
            Some(CommandKind::Reload) => self.lifecycle.reload(&entry.record).await,
            Some(CommandKind::Update) => self.lifecycle.update(&entry.record).await,
            _ => self.mutations.execute_mutation(&entry.record).await,
        };

        entry.record.state = outcome.terminal_state;
        entry.record.error_code = outcome.error_code.clone();
        entry.record.updated_at_ms = self.clock.now_ms();
        entry.result = outcome.result.clone();
        self.update_entry(&entry).await;
        self.record_confirm_delivery(confirm_inbound, &entry).await;

        let mode = mode_for_channel(entry.record.envelope.channel);
        match outcome.terminal_state {
            CommandState::Completed => {
                let body = render_completed(&entry.record, outcome.result.as_ref(), mode);
                self.enqueue_for_command(&entry.record, "result", &body).await?;
                info!(command_id = %entry.record.command_id, "mutation completed");
                Ok(PipelineResult::Completed {
                    command: entry.record,
                    result: outcome.result,
                })
            }
            _ => {
                let reason = outcome
                    .error_code
                    .unwrap_or_else(|| "mutation_failed".to_owned());
                let body = render_failure(
                    CommandState::Failed,
                    &reason,
                    "The mutation did not complete.",
                    None,
                    mode,
                );
                self.enqueue_for_command(&entry.record, "result", &body).await?;
                warn!(command_id = %entry.record.command_id, reason = %reason, "mutation failed");
                Ok(PipelineResult::Failed {
                    command: entry.record,
                    reason: Some(reason),
                })
            }
        }
    }

    async fn handle_cancel(
        &self,
        cancel_inbound: &InboundEnvelope,
        command_id: &str,
    ) -> Result<PipelineResult, PipelineError> {
        let now = self.clock.now_ms();
        let Some(mut entry) = self.take_pending(command_id, now).await else {
            return Ok(PipelineResult::Denied {
                reason: REASON_CONFIRMATION_INVALID.to_owned(),
            });
        };
        if entry.record.state == CommandState::Expired {
            self.record_confirm_delivery(cancel_inbound, &entry).await;
            return Ok(PipelineResult::Expired {
                command: entry.record,
            });
        }
        entry.record.state = CommandState::Cancelled;
        entry.record.updated_at_ms = now;
        self.update_entry(&entry).await;
        self.record_confirm_delivery(cancel_inbound, &entry).await;
        let body = format!(
            "CANCELLED · {}\nNothing was executed.",
            entry.record.cli_command_kind.as_deref().unwrap_or("command")
        );
        self.enqueue_for_command(&entry.record, "result", &body).await?;
        info!(command_id = %entry.record.command_id, "pending command cancelled");
        Ok(PipelineResult::Cancelled {
            command: entry.record,
        })
    }

    /// Pull the pending entry a confirm/cancel references, applying lazy
    /// expiry. `None` means no pending command matches the id.
    async fn take_pending(&self, command_id: &str, now_ms: i64) -> Option<CommandEntry> {
        let mut table = self.commands.lock().await;
        let key = table.key_by_command_id.get(command_id)?.clone();
        let entry = table.by_idempotency_key.get_mut(&key)?;
        if entry.record.state != CommandState::AwaitingConfirmation {
            return None;
        }
        if entry
            .record
            .created_at_ms
            .saturating_add(self.config.confirmation_ttl_ms)
            <= now_ms
        {
            entry.record.state = CommandState::Expired;
            entry.record.error_code = Some("confirmation_expired".to_owned());
            entry.record.updated_at_ms = now_ms;
        }
        Some(entry.clone())
    }

    /// Record the confirm/cancel delivery itself under its own
    /// idempotency key, pointing at the mutated command, so duplicate
    /// confirms observe the same outcome.
    async fn record_confirm_delivery(&self, inbound: &InboundEnvelope, entry: &CommandEntry) {
        let mut table = self.commands.lock().await;
        table.by_idempotency_key.insert(
            inbound.idempotency_key.clone(),
            CommandEntry {
                record: CommandRecord {
                    envelope: inbound.clone(),
                    ..entry.record.clone()
                },
                result: entry.result.clone(),
            },
        );
    }

    // ── Shared plumbing ─────────────────────────────────────────

    async fn resolve_binding(&self, inbound: &mut InboundEnvelope) {
        if inbound.actor_binding_id.is_some() {
            return;
        }
        match self
            .identity
            .resolve_active(
                inbound.channel,
                &inbound.channel_tenant_id,
                &inbound.actor_id,
            )
            .await
        {
            Some(binding) => {
                inbound.actor_binding_id = Some(binding.binding_id);
                inbound.assurance_tier = binding.assurance_tier;
            }
            None => {
                inbound.assurance_tier = assurance_tier_for_channel(inbound.channel);
            }
        }
    }

    async fn granted_scopes(&self, inbound: &InboundEnvelope) -> Vec<String> {
        if inbound
            .metadata
            .get("terminal")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
        {
            return vec![
                crate::types::scope::READ.to_owned(),
                crate::types::scope::ISSUE_WRITE.to_owned(),
                crate::types::scope::RUN_EXECUTE.to_owned(),
                crate::types::scope::OPS_ADMIN.to_owned(),
            ];
        }
        let Some(binding_id) = inbound.actor_binding_id.as_deref() else {
            return Vec::new();
        };
        self.identity
            .list_bindings(false)
            .await
            .into_iter()
            .find(|b| b.binding_id == binding_id)
            .map(|b| b.scopes.into_iter().collect())
            .unwrap_or_default()
    }

    async fn insert_entry(&self, record: CommandRecord, result: Option<serde_json::Value>) {
        let mut table = self.commands.lock().await;
        table
            .key_by_command_id
            .insert(record.command_id.clone(), record.envelope.idempotency_key.clone());
        table.by_idempotency_key.insert(
            record.envelope.idempotency_key.clone(),
            CommandEntry { record, result },
        );
    }

    async fn update_entry(&self, entry: &CommandEntry) {
        let mut table = self.commands.lock().await;
        table.by_idempotency_key.insert(
            entry.record.envelope.idempotency_key.clone(),
            entry.clone(),
        );
    }

    /// Reply envelope for a command's originating conversation.
    async fn enqueue_for_command(
        &self,
        record: &CommandRecord,
        phase: &str,
        body: &str,
    ) -> Result<(), PipelineError> {
        let envelope = OutboundEnvelope {
            channel: record.envelope.channel,
            channel_tenant_id: record.envelope.channel_tenant_id.clone(),
            channel_conversation_id: record.envelope.channel_conversation_id.clone(),
            correlation_command_id: Some(record.command_id.clone()),
            body: body.to_owned(),
            attachments: None,
            metadata: serde_json::Value::Null,
        };
        self.outbox
            .enqueue(EnqueueParams {
                dedupe_key: format!("command:{}:{phase}", record.command_id),
                envelope,
                now_ms: self.clock.now_ms(),
                max_attempts: None,
            })
            .await?;
        Ok(())
    }

    /// Chat replies ride the synchronous ack unless the delivery was
    /// deferred, in which case they go through the outbox.
    async fn maybe_enqueue_reply(
        &self,
        inbound: &InboundEnvelope,
        message: &str,
    ) -> Result<(), PipelineError> {
        let deferred = inbound
            .metadata
            .get("deferred")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        if !deferred {
            return Ok(());
        }
        let envelope = OutboundEnvelope {
            channel: inbound.channel,
            channel_tenant_id: inbound.channel_tenant_id.clone(),
            channel_conversation_id: inbound.channel_conversation_id.clone(),
            correlation_command_id: None,
            body: message.to_owned(),
            attachments: None,
            metadata: serde_json::Value::Null,
        };
        self.outbox
            .enqueue(EnqueueParams {
                dedupe_key: format!("reply:{}", inbound.request_id),
                envelope,
                now_ms: self.clock.now_ms(),
                max_attempts: None,
            })
            .await?;
        Ok(())
    }

    async fn lock_key(&self, key: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.key_locks.lock().await;
            locks
                .entry(key.to_owned())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// Wire name → kind, for dispatching confirmed mutations.
fn kind_from_wire(name: &str) -> Option<CommandKind> {
    match name {
        "status" => Some(CommandKind::Status),
        "help" => Some(CommandKind::Help),
        "issue_list" => Some(CommandKind::IssueList),
        "issue_get" => Some(CommandKind::IssueGet),
        "issue_close" => Some(CommandKind::IssueClose),
        "issue_open" => Some(CommandKind::IssueOpen),
        "issue_update" => Some(CommandKind::IssueUpdate),
        "run_list" => Some(CommandKind::RunList),
        "run_status" => Some(CommandKind::RunStatus),
        "run_start" => Some(CommandKind::RunStart),
        "run_resume" => Some(CommandKind::RunResume),
        "run_interrupt" => Some(CommandKind::RunInterrupt),
        "reload" => Some(CommandKind::Reload),
        "update" => Some(CommandKind::Update),
        _ => None,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Minimal pipeline fixture for adapter tests.

    use super::*;
    use crate::identity::LinkParams;
    use crate::operator::broker::BrokerConfig;
    use crate::types::{scope, SystemClock};
    use std::collections::BTreeSet;

    struct PassQueries;

    #[async_trait]
    impl QueryExecutor for PassQueries {
        async fn execute_query(
            &self,
            command: &CommandRecord,
        ) -> Result<serde_json::Value, String> {
            Ok(serde_json::json!({
                "summary": format!("ok {}", command.cli_command_kind.as_deref().unwrap_or("?"))
            }))
        }
    }

    struct PassMutations;

    #[async_trait]
    impl MutationExecutor for PassMutations {
        async fn execute_mutation(&self, _command: &CommandRecord) -> MutationOutcome {
            MutationOutcome::completed(serde_json::json!({"summary": "done"}))
        }
    }

    #[async_trait]
    impl SessionLifecycle for PassMutations {
        async fn reload(&self, _command: &CommandRecord) -> MutationOutcome {
            MutationOutcome::completed(serde_json::json!({"summary": "reloaded"}))
        }

        async fn update(&self, _command: &CommandRecord) -> MutationOutcome {
            MutationOutcome::completed(serde_json::json!({"summary": "updated"}))
        }
    }

    #[async_trait]
    impl RunCommandGateway for PassMutations {
        async fn execute_run_command(&self, _command: &CommandRecord) -> MutationOutcome {
            MutationOutcome::completed(serde_json::json!({"summary": "run handled"}))
        }
    }

    /// Pipeline with an in-memory identity/outbox, stub executors, and a
    /// fully-scoped binding for every channel's `actor-1` in `tenant-1`.
    pub(crate) async fn pipeline_fixture(
        operator: Option<Arc<OperatorBridge>>,
        chat_channels: HashSet<Channel>,
    ) -> (Arc<CommandPipeline>, Arc<Outbox>) {
        let identity = Arc::new(IdentityStore::in_memory());
        for channel in [
            Channel::Slack,
            Channel::Discord,
            Channel::Telegram,
            Channel::Neovim,
            Channel::Vscode,
            Channel::Editor,
        ] {
            identity
                .link(
                    LinkParams {
                        operator_id: "op-test".to_owned(),
                        channel,
                        channel_tenant_id: "tenant-1".to_owned(),
                        channel_actor_id: "actor-1".to_owned(),
                        scopes: BTreeSet::from([
                            scope::READ.to_owned(),
                            scope::ISSUE_WRITE.to_owned(),
                            scope::RUN_EXECUTE.to_owned(),
                            scope::OPS_ADMIN.to_owned(),
                        ]),
                        assurance_tier: AssuranceTier::TierA,
                    },
                    100,
                )
                .await
                .expect("link");
        }
        let outbox = Arc::new(Outbox::in_memory());
        let executors = Arc::new(PassMutations);
        let pipeline = Arc::new(CommandPipeline::new(PipelineDeps {
            config: PipelineConfig {
                chat_channels,
                confirmation_ttl_ms: DEFAULT_CONFIRMATION_TTL_MS,
            },
            identity,
            policy: Arc::new(PolicyEngine::with_defaults()),
            outbox: outbox.clone(),
            clock: Arc::new(SystemClock),
            broker: OperatorBroker::new(BrokerConfig::default()),
            operator,
            queries: Arc::new(PassQueries),
            mutations: executors.clone(),
            lifecycle: executors.clone(),
            runs: executors,
        }));
        (pipeline, outbox)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::LinkParams;
    use crate::operator::broker::{BrokerConfig, OperatorProposal};
    use crate::operator::{OperatorBackend, OperatorBackendError, OperatorTurnRequest};
    use crate::types::scope;
    use std::collections::BTreeSet;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct FixedClock(std::sync::atomic::AtomicI64);

    impl FixedClock {
        fn new(at: i64) -> Arc<Self> {
            Arc::new(Self(std::sync::atomic::AtomicI64::new(at)))
        }

        fn set(&self, at: i64) {
            self.0.store(at, Ordering::SeqCst);
        }
    }

    impl Clock for FixedClock {
        fn now_ms(&self) -> i64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    struct StubQueries;

    #[async_trait]
    impl QueryExecutor for StubQueries {
        async fn execute_query(
            &self,
            command: &CommandRecord,
        ) -> Result<serde_json::Value, String> {
            Ok(serde_json::json!({
                "summary": format!("query {}", command.cli_command_kind.as_deref().unwrap_or("?"))
            }))
        }
    }

    struct StubMutations {
        calls: AtomicUsize,
        fail: AtomicBool,
    }

    impl StubMutations {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                fail: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl MutationExecutor for StubMutations {
        async fn execute_mutation(&self, command: &CommandRecord) -> MutationOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                MutationOutcome::failed("issue_store_unavailable")
            } else {
                MutationOutcome::completed(serde_json::json!({
                    "summary": format!("mutated {}", command.envelope.target_id.as_deref().unwrap_or("?"))
                }))
            }
        }
    }

    struct StubLifecycle;

    #[async_trait]
    impl SessionLifecycle for StubLifecycle {
        async fn reload(&self, _command: &CommandRecord) -> MutationOutcome {
            MutationOutcome::completed(serde_json::json!({"summary": "reloaded"}))
        }

        async fn update(&self, _command: &CommandRecord) -> MutationOutcome {
            MutationOutcome::completed(serde_json::json!({"summary": "updated"}))
        }
    }

    struct StubRuns {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RunCommandGateway for StubRuns {
        async fn execute_run_command(&self, command: &CommandRecord) -> MutationOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            MutationOutcome::completed(serde_json::json!({
                "summary": format!("run {}", command.run_root_id.as_deref().unwrap_or("?"))
            }))
        }
    }

    struct ProposalBackend {
        proposal: OperatorProposal,
    }

    #[async_trait]
    impl OperatorBackend for ProposalBackend {
        async fn run_turn(
            &self,
            _request: OperatorTurnRequest,
        ) -> Result<OperatorTurnOutput, OperatorBackendError> {
            Ok(OperatorTurnOutput::Command {
                proposal: self.proposal.clone(),
            })
        }
    }

    struct RespondBackend;

    #[async_trait]
    impl OperatorBackend for RespondBackend {
        async fn run_turn(
            &self,
            request: OperatorTurnRequest,
        ) -> Result<OperatorTurnOutput, OperatorBackendError> {
            Ok(OperatorTurnOutput::Respond {
                message: format!("you said: {}", request.inbound.command_text),
            })
        }
    }

    struct Fixture {
        pipeline: CommandPipeline,
        outbox: Arc<Outbox>,
        policy: Arc<PolicyEngine>,
        mutations: Arc<StubMutations>,
        runs: Arc<StubRuns>,
        clock: Arc<FixedClock>,
    }

    async fn fixture_with_operator(operator: Option<Arc<OperatorBridge>>) -> Fixture {
        let identity = Arc::new(IdentityStore::in_memory());
        identity
            .link(
                LinkParams {
                    operator_id: "op-igor".to_owned(),
                    channel: Channel::Slack,
                    channel_tenant_id: "T1".to_owned(),
                    channel_actor_id: "U1".to_owned(),
                    scopes: BTreeSet::from([
                        scope::READ.to_owned(),
                        scope::ISSUE_WRITE.to_owned(),
                        scope::RUN_EXECUTE.to_owned(),
                    ]),
                    assurance_tier: crate::types::AssuranceTier::TierA,
                },
                500,
            )
            .await
            .expect("link");
        identity
            .link(
                LinkParams {
                    operator_id: "op-igor".to_owned(),
                    channel: Channel::Telegram,
                    channel_tenant_id: "bot".to_owned(),
                    channel_actor_id: "tg-1".to_owned(),
                    scopes: BTreeSet::from([
                        scope::READ.to_owned(),
                        scope::ISSUE_WRITE.to_owned(),
                        scope::RUN_EXECUTE.to_owned(),
                    ]),
                    assurance_tier: crate::types::AssuranceTier::TierB,
                },
                500,
            )
            .await
            .expect("link");

        let outbox = Arc::new(Outbox::in_memory());
        let policy = Arc::new(PolicyEngine::with_defaults());
        let mutations = StubMutations::new();
        let runs = Arc::new(StubRuns {
            calls: AtomicUsize::new(0),
        });
        let clock = FixedClock::new(1_000);
        let mut config = PipelineConfig::default();
        config.chat_channels.insert(Channel::Telegram);

        let pipeline = CommandPipeline::new(PipelineDeps {
            config,
            identity,
            policy: policy.clone(),
            outbox: outbox.clone(),
            clock: clock.clone(),
            broker: OperatorBroker::new(BrokerConfig::default()),
            operator,
            queries: Arc::new(StubQueries),
            mutations: mutations.clone(),
            lifecycle: Arc::new(StubLifecycle),
            runs: runs.clone(),
        });
        Fixture {
            pipeline,
            outbox,
            policy,
            mutations,
            runs,
            clock,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with_operator(None).await
    }

    fn slack_inbound(text: &str, request_id: &str) -> InboundEnvelope {
        InboundEnvelope {
            version: 1,
            received_at_ms: 1_000,
            request_id: request_id.to_owned(),
            delivery_id: mint_id("dlv"),
            channel: Channel::Slack,
            channel_tenant_id: "T1".to_owned(),
            channel_conversation_id: "C1".to_owned(),
            actor_id: "U1".to_owned(),
            actor_binding_id: None,
            assurance_tier: crate::types::AssuranceTier::TierA,
            repo_root: "/work/mu".to_owned(),
            command_text: text.to_owned(),
            scope_required: None,
            scope_effective: None,
            target_type: None,
            target_id: None,
            idempotency_key: format!("slack-idem-{request_id}"),
            fingerprint: fingerprint(text),
            attachments: Vec::new(),
            metadata: serde_json::Value::Null,
        }
    }

    fn telegram_chat(text: &str, request_id: &str) -> InboundEnvelope {
        let mut env = slack_inbound(text, request_id);
        env.channel = Channel::Telegram;
        env.channel_tenant_id = "bot".to_owned();
        env.channel_conversation_id = "tg-chat-1".to_owned();
        env.actor_id = "tg-1".to_owned();
        env.idempotency_key = format!("telegram-idem-update-{request_id}");
        env
    }

    #[tokio::test]
    async fn test_read_only_command_completes_directly() {
        let f = fixture().await;
        let result = f
            .pipeline
            .handle_inbound(slack_inbound("/mu status", "r1"))
            .await
            .expect("handle");
        match result {
            PipelineResult::Completed { command, result } => {
                assert_eq!(command.cli_command_kind.as_deref(), Some("status"));
                assert!(result.is_some());
            }
            other => panic!("expected completed, got {other:?}"),
        }
        // Read results ride the ack; nothing goes through the outbox.
        assert!(f.outbox.records(None).await.is_empty());
    }

    #[tokio::test]
    async fn test_mutating_command_awaits_confirmation() {
        let f = fixture().await;
        let result = f
            .pipeline
            .handle_inbound(slack_inbound("/mu issue close mu-100", "r1"))
            .await
            .expect("handle");
        let command = match result {
            PipelineResult::AwaitingConfirmation { command } => command,
            other => panic!("expected awaiting, got {other:?}"),
        };
        assert_eq!(command.envelope.scope_required.as_deref(), Some(scope::ISSUE_WRITE));
        assert_eq!(f.mutations.calls.load(Ordering::SeqCst), 0);

        let pending = f.outbox.records(None).await;
        assert_eq!(pending.len(), 1, "one confirmation prompt in the outbox");
        assert!(pending[0].envelope.body.contains(&command.command_id));
    }

    #[tokio::test]
    async fn test_duplicate_delivery_is_idempotent() {
        let f = fixture().await;
        let first = f
            .pipeline
            .handle_inbound(slack_inbound("/mu issue close mu-100", "r1"))
            .await
            .expect("handle");
        let second = f
            .pipeline
            .handle_inbound(slack_inbound("/mu issue close mu-100", "r1"))
            .await
            .expect("handle");
        let (a, b) = match (first, second) {
            (
                PipelineResult::AwaitingConfirmation { command: a },
                PipelineResult::AwaitingConfirmation { command: b },
            ) => (a, b),
            other => panic!("expected two awaiting results, got {other:?}"),
        };
        assert_eq!(a.command_id, b.command_id);
        assert_eq!(b.attempt, 2);
        assert_eq!(
            f.outbox.records(None).await.len(),
            1,
            "duplicate delivery must not add outbox records"
        );
    }

    #[tokio::test]
    async fn test_confirm_executes_mutation() {
        let f = fixture().await;
        let command = match f
            .pipeline
            .handle_inbound(slack_inbound("/mu issue close mu-100", "r1"))
            .await
            .expect("handle")
        {
            PipelineResult::AwaitingConfirmation { command } => command,
            other => panic!("unexpected {other:?}"),
        };

        let confirm = slack_inbound(&format!("confirm {}", command.command_id), "r2");
        let result = f.pipeline.handle_inbound(confirm).await.expect("confirm");
        match result {
            PipelineResult::Completed { command: done, .. } => {
                assert_eq!(done.command_id, command.command_id);
                assert!(done.cli_invocation_id.is_some());
            }
            other => panic!("expected completed, got {other:?}"),
        }
        assert_eq!(f.mutations.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.outbox.records(None).await.len(), 2, "prompt + result");
    }

    #[tokio::test]
    async fn test_confirm_wrong_id_denied() {
        let f = fixture().await;
        let result = f
            .pipeline
            .handle_inbound(slack_inbound("confirm cmd-nope", "r9"))
            .await
            .expect("handle");
        match result {
            PipelineResult::Denied { reason } => {
                assert_eq!(reason, REASON_CONFIRMATION_INVALID);
            }
            other => panic!("expected denied, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_confirm_twice_is_denied_then_idempotent_by_key() {
        let f = fixture().await;
        let command = match f
            .pipeline
            .handle_inbound(slack_inbound("/mu issue close mu-100", "r1"))
            .await
            .expect("handle")
        {
            PipelineResult::AwaitingConfirmation { command } => command,
            other => panic!("unexpected {other:?}"),
        };
        let confirm_text = format!("confirm {}", command.command_id);

        f.pipeline
            .handle_inbound(slack_inbound(&confirm_text, "r2"))
            .await
            .expect("confirm");
        assert_eq!(f.mutations.calls.load(Ordering::SeqCst), 1);

        // Same confirm delivered twice: replays the recorded outcome.
        let dup = f
            .pipeline
            .handle_inbound(slack_inbound(&confirm_text, "r2"))
            .await
            .expect("dup confirm");
        assert!(matches!(dup, PipelineResult::Completed { .. }));
        assert_eq!(f.mutations.calls.load(Ordering::SeqCst), 1, "no re-execution");

        // A *new* confirm delivery against the now-terminal command.
        let fresh = f
            .pipeline
            .handle_inbound(slack_inbound(&confirm_text, "r3"))
            .await
            .expect("fresh confirm");
        assert!(matches!(fresh, PipelineResult::Denied { .. }));
    }

    #[tokio::test]
    async fn test_kill_switch_fails_confirm() {
        let f = fixture().await;
        let command = match f
            .pipeline
            .handle_inbound(slack_inbound("/mu issue close mu-100", "r1"))
            .await
            .expect("handle")
        {
            PipelineResult::AwaitingConfirmation { command } => command,
            other => panic!("unexpected {other:?}"),
        };

        f.policy.set_mutations_enabled(false);
        let result = f
            .pipeline
            .handle_inbound(slack_inbound(&format!("confirm {}", command.command_id), "r2"))
            .await
            .expect("confirm");
        match result {
            PipelineResult::Failed { reason, .. } => {
                assert_eq!(reason.as_deref(), Some("mutations_disabled_global"));
            }
            other => panic!("expected failed, got {other:?}"),
        }
        assert_eq!(f.mutations.calls.load(Ordering::SeqCst), 0);

        let records = f.outbox.records(None).await;
        assert_eq!(records.len(), 2);
        let result_body = &records
            .iter()
            .find(|r| r.dedupe_key.ends_with(":result"))
            .expect("result envelope")
            .envelope
            .body;
        assert!(result_body.contains("ERROR · FAILED"));
        assert!(result_body.contains("mutations_disabled_global"));
    }

    #[tokio::test]
    async fn test_missing_scope_denied() {
        let f = fixture().await;
        let mut inbound = slack_inbound("/mu reload", "r1");
        inbound.actor_id = "U1".to_owned();
        let result = f.pipeline.handle_inbound(inbound).await.expect("handle");
        match result {
            PipelineResult::Denied { reason } => assert_eq!(reason, "missing_scope"),
            other => panic!("expected denied, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unbound_actor_has_no_scopes() {
        let f = fixture().await;
        let mut inbound = slack_inbound("/mu status", "r1");
        inbound.actor_id = "U-unknown".to_owned();
        let result = f.pipeline.handle_inbound(inbound).await.expect("handle");
        assert!(matches!(result, PipelineResult::Denied { .. }));
    }

    #[tokio::test]
    async fn test_cancel_pending_command() {
        let f = fixture().await;
        let command = match f
            .pipeline
            .handle_inbound(slack_inbound("/mu issue close mu-100", "r1"))
            .await
            .expect("handle")
        {
            PipelineResult::AwaitingConfirmation { command } => command,
            other => panic!("unexpected {other:?}"),
        };
        let result = f
            .pipeline
            .handle_inbound(slack_inbound(&format!("cancel {}", command.command_id), "r2"))
            .await
            .expect("cancel");
        assert!(matches!(result, PipelineResult::Cancelled { .. }));
        assert_eq!(f.mutations.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_confirmation_expires() {
        let f = fixture().await;
        let command = match f
            .pipeline
            .handle_inbound(slack_inbound("/mu issue close mu-100", "r1"))
            .await
            .expect("handle")
        {
            PipelineResult::AwaitingConfirmation { command } => command,
            other => panic!("unexpected {other:?}"),
        };

        f.clock.set(1_000_i64.saturating_add(DEFAULT_CONFIRMATION_TTL_MS));
        let result = f
            .pipeline
            .handle_inbound(slack_inbound(&format!("confirm {}", command.command_id), "r2"))
            .await
            .expect("confirm");
        assert!(matches!(result, PipelineResult::Expired { .. }));
        assert_eq!(f.mutations.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_non_command_on_slack_requires_explicit_command() {
        let f = fixture().await;
        let result = f
            .pipeline
            .handle_inbound(slack_inbound("what is the weather", "r1"))
            .await
            .expect("handle");
        match result {
            PipelineResult::Noop { reason } => assert_eq!(reason, REASON_EXPLICIT_COMMAND),
            other => panic!("expected noop, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_non_command_on_telegram_without_operator() {
        let f = fixture().await;
        let result = f
            .pipeline
            .handle_inbound(telegram_chat("hello", "u1"))
            .await
            .expect("handle");
        match result {
            PipelineResult::Noop { reason } => assert_eq!(reason, REASON_NOT_COMMAND),
            other => panic!("expected noop, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_operator_respond_flow() {
        let bridge = Arc::new(OperatorBridge::new(Arc::new(RespondBackend)));
        let f = fixture_with_operator(Some(bridge)).await;
        let result = f
            .pipeline
            .handle_inbound(telegram_chat("hello operator", "u1"))
            .await
            .expect("handle");
        match result {
            PipelineResult::OperatorResponse { message } => {
                assert_eq!(message, "you said: hello operator");
            }
            other => panic!("expected operator response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_operator_duplicate_chat_does_not_rerun_turn() {
        let bridge = Arc::new(OperatorBridge::new(Arc::new(RespondBackend)));
        let f = fixture_with_operator(Some(bridge)).await;
        let first = f
            .pipeline
            .handle_inbound(telegram_chat("hello", "u1"))
            .await
            .expect("handle");
        let second = f
            .pipeline
            .handle_inbound(telegram_chat("hello", "u1"))
            .await
            .expect("handle");
        match (first, second) {
            (
                PipelineResult::OperatorResponse { message: a },
                PipelineResult::OperatorResponse { message: b },
            ) => assert_eq!(a, b),
            other => panic!("expected two operator responses, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_operator_command_proposal_goes_through_broker() {
        let backend = ProposalBackend {
            proposal: OperatorProposal {
                kind: "run_resume".to_owned(),
                root_issue_id: Some("mu-42".to_owned()),
                max_steps: Some(10),
                ..OperatorProposal::default()
            },
        };
        let bridge = Arc::new(OperatorBridge::new(Arc::new(backend)));
        let f = fixture_with_operator(Some(bridge)).await;

        let result = f
            .pipeline
            .handle_inbound(telegram_chat("resume the auth work please", "u1"))
            .await
            .expect("handle");
        let command = match result {
            PipelineResult::AwaitingConfirmation { command } => command,
            other => panic!("expected awaiting, got {other:?}"),
        };
        assert_eq!(command.cli_command_kind.as_deref(), Some("run_resume"));
        assert!(command.envelope.request_id.starts_with("op:"));
        assert!(command.operator_session_id.is_some());

        // Confirm routes through the run gateway, not the mutation seam.
        let confirm = telegram_chat(&format!("confirm {}", command.command_id), "u2");
        let confirmed = f.pipeline.handle_inbound(confirm).await.expect("confirm");
        assert!(matches!(confirmed, PipelineResult::Completed { .. }));
        assert_eq!(f.runs.calls.load(Ordering::SeqCst), 1);
        assert_eq!(f.mutations.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_operator_disallowed_proposal_becomes_response() {
        let backend = ProposalBackend {
            proposal: OperatorProposal {
                kind: "rm_rf".to_owned(),
                ..OperatorProposal::default()
            },
        };
        let bridge = Arc::new(OperatorBridge::new(Arc::new(backend)));
        let f = fixture_with_operator(Some(bridge)).await;
        let result = f
            .pipeline
            .handle_inbound(telegram_chat("do something drastic", "u1"))
            .await
            .expect("handle");
        match result {
            PipelineResult::OperatorResponse { message } => {
                assert!(message.contains("operator_action_disallowed"));
            }
            other => panic!("expected operator response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_deferred_chat_reply_lands_in_outbox() {
        let bridge = Arc::new(OperatorBridge::new(Arc::new(RespondBackend)));
        let f = fixture_with_operator(Some(bridge)).await;
        let mut inbound = telegram_chat("hello operator", "u1");
        inbound.metadata = serde_json::json!({"deferred": true});
        f.pipeline.handle_inbound(inbound).await.expect("handle");

        let records = f.outbox.records(None).await;
        assert_eq!(records.len(), 1);
        assert!(records[0].envelope.body.contains("hello operator"));
        assert_eq!(records[0].envelope.channel, Channel::Telegram);
    }

    #[tokio::test]
    async fn test_invalid_command_text() {
        let f = fixture().await;
        let result = f
            .pipeline
            .handle_inbound(slack_inbound("/mu issue close NOPE", "r1"))
            .await
            .expect("handle");
        match result {
            PipelineResult::Invalid { reason } => assert_eq!(reason, "invalid_issue_id"),
            other => panic!("expected invalid, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_terminal_inbound_has_full_trust() {
        let f = fixture().await;
        let result = f
            .pipeline
            .handle_terminal_inbound("/mu reload", "/work/mu", Some("req-1"))
            .await
            .expect("handle");
        // reload is mutating, so even the terminal goes through confirm.
        let command = match result {
            PipelineResult::AwaitingConfirmation { command } => command,
            other => panic!("expected awaiting, got {other:?}"),
        };
        assert_eq!(command.envelope.channel, Channel::Editor);

        let confirmed = f
            .pipeline
            .handle_terminal_inbound(
                &format!("confirm {}", command.command_id),
                "/work/mu",
                Some("req-2"),
            )
            .await
            .expect("confirm");
        assert!(matches!(confirmed, PipelineResult::Completed { .. }));
    }

    #[tokio::test]
    async fn test_expire_pending_sweep() {
        let f = fixture().await;
        f.pipeline
            .handle_inbound(slack_inbound("/mu issue close mu-100", "r1"))
            .await
            .expect("handle");
        let expired = f
            .pipeline
            .expire_pending(1_000_i64.saturating_add(DEFAULT_CONFIRMATION_TTL_MS))
            .await
            .expect("sweep");
        assert_eq!(expired, 1);

        // A duplicate delivery now observes the expired state.
        let dup = f
            .pipeline
            .handle_inbound(slack_inbound("/mu issue close mu-100", "r1"))
            .await
            .expect("dup");
        assert!(matches!(dup, PipelineResult::Expired { .. }));
    }
}
