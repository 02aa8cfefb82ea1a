//! User-visible rendering of pipeline outcomes.
//!
//! Every denied/failed outcome renders a machine reason code plus a short
//! human summary, and optionally a structured "Key details" block.
//! Telegram gets compact mode (no structured payload dump); every other
//! channel gets detailed mode.

use crate::types::{Channel, CommandRecord, CommandState};

/// How much structure to include in a rendered message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderMode {
    /// Short body, no structured details.
    Compact,
    /// Body plus a "Key details" block.
    Detailed,
}

/// Rendering mode for a channel.
pub fn mode_for_channel(channel: Channel) -> RenderMode {
    match channel {
        Channel::Telegram => RenderMode::Compact,
        _ => RenderMode::Detailed,
    }
}

/// Uppercase label for a state in rendered headers.
fn state_label(state: CommandState) -> &'static str {
    match state {
        CommandState::AwaitingConfirmation => "CONFIRM",
        CommandState::Completed => "OK",
        CommandState::Failed => "FAILED",
        CommandState::Denied => "DENIED",
        CommandState::Invalid => "INVALID",
        CommandState::Expired => "EXPIRED",
        CommandState::Cancelled => "CANCELLED",
        CommandState::Deferred => "DEFERRED",
        CommandState::Noop => "NOOP",
        CommandState::OperatorResponse => "REPLY",
    }
}

/// Render a failure outcome: `ERROR · <STATE> · <reason>` plus summary.
pub fn render_failure(
    state: CommandState,
    reason: &str,
    summary: &str,
    details: Option<&serde_json::Value>,
    mode: RenderMode,
) -> String {
    let mut out = format!("ERROR · {} · {reason}", state_label(state));
    if !summary.is_empty() {
        out.push('\n');
        out.push_str(summary);
    }
    if mode == RenderMode::Detailed {
        if let Some(details) = details {
            out.push_str("\n\nKey details:\n");
            out.push_str(
                &serde_json::to_string_pretty(details).unwrap_or_else(|_| details.to_string()),
            );
        }
    }
    out
}

/// Render the confirmation prompt for a pending mutation.
pub fn render_awaiting_confirmation(record: &CommandRecord) -> String {
    let kind = record.cli_command_kind.as_deref().unwrap_or("command");
    let args = record.command_args.join(" ");
    let mut out = format!("CONFIRM · {kind}");
    if !args.is_empty() {
        out.push(' ');
        out.push_str(&args);
    }
    out.push_str(&format!(
        "\nReply `/mu confirm {}` to run it, `/mu cancel {}` to drop it.",
        record.command_id, record.command_id
    ));
    out
}

/// Render a completed command with its result payload.
pub fn render_completed(
    record: &CommandRecord,
    payload: Option<&serde_json::Value>,
    mode: RenderMode,
) -> String {
    let kind = record.cli_command_kind.as_deref().unwrap_or("command");
    let mut out = format!("OK · {kind}");
    match (mode, payload) {
        (RenderMode::Detailed, Some(payload)) => {
            out.push_str("\n\nKey details:\n");
            out.push_str(
                &serde_json::to_string_pretty(payload).unwrap_or_else(|_| payload.to_string()),
            );
        }
        (RenderMode::Compact, Some(payload)) => {
            if let Some(summary) = payload.get("summary").and_then(|v| v.as_str()) {
                out.push('\n');
                out.push_str(summary);
            }
        }
        (_, None) => {}
    }
    out
}

/// Render any pipeline result to a chat body, for acks and outbox rows.
pub fn render_result(result: &crate::pipeline::PipelineResult, mode: RenderMode) -> String {
    use crate::pipeline::PipelineResult;
    match result {
        PipelineResult::AwaitingConfirmation { command } => render_awaiting_confirmation(command),
        PipelineResult::Completed { command, result } => {
            render_completed(command, result.as_ref(), mode)
        }
        PipelineResult::Denied { reason } => render_failure(
            CommandState::Denied,
            reason,
            "The command was not allowed.",
            None,
            mode,
        ),
        PipelineResult::Invalid { reason } => render_failure(
            CommandState::Invalid,
            reason,
            "The command could not be parsed.",
            None,
            mode,
        ),
        PipelineResult::Noop { reason } => format!("NOOP · {reason}"),
        PipelineResult::Deferred { command } => {
            format!("DEFERRED · {}", command.command_id)
        }
        PipelineResult::Cancelled { command } => {
            format!("CANCELLED · {}", command.command_id)
        }
        PipelineResult::Expired { command } => render_failure(
            CommandState::Expired,
            "confirmation_expired",
            &format!("Command {} expired before confirmation.", command.command_id),
            None,
            mode,
        ),
        PipelineResult::Failed { command, reason } => render_failure(
            CommandState::Failed,
            reason.as_deref().unwrap_or("execution_failed"),
            &format!("Command {} failed.", command.command_id),
            None,
            mode,
        ),
        PipelineResult::OperatorResponse { message } => message.clone(),
    }
}

/// The command catalog shown for `/mu help`.
pub fn render_help() -> String {
    "mu commands:\n\
     /mu status\n\
     /mu issue list | get <id> | open \"title\" | close <id> | update <id> \"body\"\n\
     /mu run list | status [<id>] | start <id> [--max-steps N] [\"prompt\"] | resume <id> | interrupt <id>\n\
     /mu reload · /mu update\n\
     /mu confirm <command_id> · /mu cancel <command_id>"
        .to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AssuranceTier, InboundEnvelope};

    fn record(kind: &str, args: &[&str]) -> CommandRecord {
        CommandRecord {
            command_id: "cmd-1".to_owned(),
            envelope: envelope(),
            state: CommandState::AwaitingConfirmation,
            attempt: 1,
            error_code: None,
            operator_session_id: None,
            operator_turn_id: None,
            cli_invocation_id: None,
            cli_command_kind: Some(kind.to_owned()),
            run_root_id: None,
            command_args: args.iter().map(|s| (*s).to_owned()).collect(),
            created_at_ms: 0,
            updated_at_ms: 0,
        }
    }

    fn envelope() -> InboundEnvelope {
        InboundEnvelope {
            version: 1,
            received_at_ms: 0,
            request_id: "r".to_owned(),
            delivery_id: "d".to_owned(),
            channel: Channel::Slack,
            channel_tenant_id: "T".to_owned(),
            channel_conversation_id: "C".to_owned(),
            actor_id: "U".to_owned(),
            actor_binding_id: None,
            assurance_tier: AssuranceTier::TierA,
            repo_root: "/repo".to_owned(),
            command_text: "/mu status".to_owned(),
            scope_required: None,
            scope_effective: None,
            target_type: None,
            target_id: None,
            idempotency_key: "k".to_owned(),
            fingerprint: "f".to_owned(),
            attachments: Vec::new(),
            metadata: serde_json::Value::Null,
        }
    }

    #[test]
    fn test_failure_header_format() {
        let body = render_failure(
            CommandState::Denied,
            "missing_scope",
            "you lack cp.issue.write",
            None,
            RenderMode::Compact,
        );
        assert!(body.starts_with("ERROR · DENIED · missing_scope"));
        assert!(body.contains("cp.issue.write"));
    }

    #[test]
    fn test_detailed_mode_includes_key_details() {
        let details = serde_json::json!({"switch": "ops.mutations_enabled"});
        let body = render_failure(
            CommandState::Failed,
            "mutations_disabled_global",
            "mutations are disabled",
            Some(&details),
            RenderMode::Detailed,
        );
        assert!(body.contains("Key details:"));
        assert!(body.contains("ops.mutations_enabled"));

        let compact = render_failure(
            CommandState::Failed,
            "mutations_disabled_global",
            "mutations are disabled",
            Some(&details),
            RenderMode::Compact,
        );
        assert!(!compact.contains("Key details:"));
    }

    #[test]
    fn test_confirmation_prompt_names_command_id() {
        let body = render_awaiting_confirmation(&record("issue_close", &["mu-100"]));
        assert!(body.contains("CONFIRM · issue_close mu-100"));
        assert!(body.contains("/mu confirm cmd-1"));
        assert!(body.contains("/mu cancel cmd-1"));
    }

    #[test]
    fn test_telegram_is_compact() {
        assert_eq!(mode_for_channel(Channel::Telegram), RenderMode::Compact);
        assert_eq!(mode_for_channel(Channel::Slack), RenderMode::Detailed);
    }

    #[test]
    fn test_render_completed_compact_uses_summary() {
        let payload = serde_json::json!({"summary": "2 issues open", "rows": [1, 2]});
        let compact = render_completed(&record("issue_list", &[]), Some(&payload), RenderMode::Compact);
        assert!(compact.contains("2 issues open"));
        assert!(!compact.contains("rows"));
    }
}
