//! Core value types shared across the control plane.
//!
//! Everything here is a plain value structure: adapters produce
//! [`InboundEnvelope`]s, the pipeline turns them into [`CommandRecord`]s,
//! and outbound traffic is described by [`OutboundEnvelope`]s. Persistence
//! is line-oriented JSON, so every type derives `Serialize`/`Deserialize`
//! with snake_case tags.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Envelope schema version written into every inbound envelope.
pub const ENVELOPE_VERSION: u32 = 1;

/// Chat channel an inbound request arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Slack workspace (slash commands and event callbacks).
    Slack,
    /// Discord application (interactions).
    Discord,
    /// Telegram bot webhook.
    Telegram,
    /// Neovim frontend.
    Neovim,
    /// VS Code frontend.
    Vscode,
    /// Generic editor frontend.
    Editor,
}

impl Channel {
    /// Stable string form used in dedupe keys and audit rows.
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Slack => "slack",
            Channel::Discord => "discord",
            Channel::Telegram => "telegram",
            Channel::Neovim => "neovim",
            Channel::Vscode => "vscode",
            Channel::Editor => "editor",
        }
    }

    /// Channels that accept free-form chat (routed to the operator)
    /// rather than requiring an explicit `/mu` command.
    pub fn allows_chat(self) -> bool {
        matches!(self, Channel::Telegram | Channel::Slack | Channel::Discord)
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse identity strength attached to a resolved actor binding.
///
/// Ordering matters: `TierA` is the strongest assurance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssuranceTier {
    /// Unknown or unauthenticated source.
    TierC,
    /// Shared-secret channels (telegram, editor frontends).
    TierB,
    /// Signed-ingress channels with workspace identity (slack, discord).
    TierA,
}

/// Capability scope dot-paths understood by the policy engine.
pub mod scope {
    /// Read-only queries (status, issue get/list, run list/status).
    pub const READ: &str = "cp.read";
    /// Issue mutations (open, close, update).
    pub const ISSUE_WRITE: &str = "cp.issue.write";
    /// Administrative lifecycle (reload, update).
    pub const OPS_ADMIN: &str = "cp.ops.admin";
    /// Run lifecycle (start, resume, interrupt).
    pub const RUN_EXECUTE: &str = "cp.run.execute";
}

/// Attachment metadata carried on an inbound envelope after the
/// attachment store has ingested the underlying bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    /// Stable id into the inbound attachment store.
    pub attachment_id: String,
    /// Sanitized filename.
    pub file_name: String,
    /// Stored mime type.
    pub mime: String,
    /// Stored size in bytes.
    pub size_bytes: u64,
    /// SHA-256 content hash, hex-encoded.
    pub content_hash: String,
}

/// Canonical, adapter-independent representation of one inbound request.
///
/// Immutable once produced by an adapter. Two physical deliveries of the
/// same source request share `request_id` and `idempotency_key` but carry
/// distinct `delivery_id`s.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundEnvelope {
    /// Envelope schema version.
    pub version: u32,
    /// Receive timestamp in milliseconds.
    pub received_at_ms: i64,
    /// Stable per-inbound id, hashed from the adapter source id.
    pub request_id: String,
    /// Stable per-physical-delivery id.
    pub delivery_id: String,
    /// Originating channel.
    pub channel: Channel,
    /// Channel tenant (Slack team, Discord guild, Telegram bot scope).
    pub channel_tenant_id: String,
    /// Conversation within the tenant (channel id, chat id).
    pub channel_conversation_id: String,
    /// Channel-native actor id.
    pub actor_id: String,
    /// Resolved identity binding, if one exists.
    pub actor_binding_id: Option<String>,
    /// Identity strength for this delivery.
    pub assurance_tier: AssuranceTier,
    /// Repository root the command operates on.
    pub repo_root: String,
    /// Normalized command text (may be free-form chat).
    pub command_text: String,
    /// Scope the parsed command requires (filled by the pipeline).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_required: Option<String>,
    /// Scope the binding actually grants for this command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_effective: Option<String>,
    /// Target kind (issue, run, ...) when the command names one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_type: Option<String>,
    /// Target id when the command names one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    /// Stable key collapsing duplicate deliveries of the same request.
    pub idempotency_key: String,
    /// Hash of the normalized, lower-cased command text.
    pub fingerprint: String,
    /// Attachments ingested alongside the request.
    #[serde(default)]
    pub attachments: Vec<AttachmentRef>,
    /// Free-form adapter metadata.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Lifecycle state of a logical command.
///
/// `AwaitingConfirmation` is the only non-terminal state; every other
/// state is terminal and immutable for the command's `idempotency_key`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    /// Mutating command parsed and authorized, waiting for `confirm`.
    AwaitingConfirmation,
    /// Executed successfully.
    Completed,
    /// Execution or confirmation failed.
    Failed,
    /// Policy denied the command.
    Denied,
    /// The command text did not parse.
    Invalid,
    /// The pending confirmation expired before a confirm arrived.
    Expired,
    /// The actor cancelled the pending confirmation.
    Cancelled,
    /// Accepted into a deferred queue; processed later.
    Deferred,
    /// Not a command (free-form text, unsupported update).
    Noop,
    /// The operator answered conversationally.
    OperatorResponse,
}

impl CommandState {
    /// Whether the state is terminal for its idempotency key.
    pub fn is_terminal(self) -> bool {
        !matches!(self, CommandState::AwaitingConfirmation)
    }
}

/// Mutable record tracking one logical command through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRecord {
    /// Pipeline-issued id (`cmd-` prefixed).
    pub command_id: String,
    /// The envelope that created this command.
    pub envelope: InboundEnvelope,
    /// Current lifecycle state.
    pub state: CommandState,
    /// Delivery attempts observed for this idempotency key.
    pub attempt: u32,
    /// Machine reason code when denied/failed/invalid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    /// Operator session that produced or handled this command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_session_id: Option<String>,
    /// Operator turn correlation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator_turn_id: Option<String>,
    /// CLI invocation correlation for executed mutations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli_invocation_id: Option<String>,
    /// Parsed command kind (allowlist name, e.g. `issue_close`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cli_command_kind: Option<String>,
    /// Root issue the command binds a run to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_root_id: Option<String>,
    /// Positional arguments after the command kind.
    #[serde(default)]
    pub command_args: Vec<String>,
    /// When the record was created (ms).
    pub created_at_ms: i64,
    /// When the record last changed (ms).
    pub updated_at_ms: i64,
}

/// One outbound message destined for a channel transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundEnvelope {
    /// Destination channel.
    pub channel: Channel,
    /// Destination tenant.
    pub channel_tenant_id: String,
    /// Destination conversation.
    pub channel_conversation_id: String,
    /// Command this message reports on, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_command_id: Option<String>,
    /// Rendered message body.
    pub body: String,
    /// Optional structured attachments (channel-specific blocks).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<serde_json::Value>,
    /// Free-form transport metadata.
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Clock abstraction so retry/backoff logic is deterministic in tests.
pub trait Clock: Send + Sync {
    /// Current wall-clock time in milliseconds since the epoch.
    fn now_ms(&self) -> i64;
}

/// Production clock backed by `SystemTime`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        let elapsed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX)
    }
}

/// Mint a prefixed unique id, e.g. `mint_id("cmd")` → `cmd-3f2a…`.
pub fn mint_id(prefix: &str) -> String {
    format!("{prefix}-{}", Uuid::new_v4())
}

/// SHA-256 of the input, hex-encoded.
///
/// Used for request-id derivation, command fingerprints, and the
/// operator session key.
pub fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}

/// Fingerprint of a command: SHA-256 over the trimmed, lower-cased text.
pub fn fingerprint(command_text: &str) -> String {
    sha256_hex(&command_text.trim().to_lowercase())
}
