//! Operator broker: the approval gate between operator proposals and the
//! command pipeline.
//!
//! The operator backend is untrusted. Whatever it proposes, the pipeline
//! only ever sees a literal `/mu ...` string assembled here from a closed
//! allowlist of kinds with fixed argv shapes, every argument passed
//! through its validator. Anything else is rejected with a machine
//! reason.

use serde::Deserialize;
use tracing::{info, warn};

use crate::pipeline::parse::is_issue_id;
use crate::policy::CommandKind;
use crate::types::InboundEnvelope;

/// Rejection reason codes.
pub mod reject_reason {
    /// Kind outside the allowlist, or run triggers disabled.
    pub const ACTION_DISALLOWED: &str = "operator_action_disallowed";
    /// Required context (issue/root id) absent.
    pub const CONTEXT_MISSING: &str = "context_missing";
    /// More than one candidate target and no explicit choice.
    pub const CONTEXT_AMBIGUOUS: &str = "context_ambiguous";
    /// The envelope's repo root is outside the allowlist.
    pub const CONTEXT_UNAUTHORIZED: &str = "context_unauthorized";
    /// An argument failed its validator.
    pub const CLI_VALIDATION_FAILED: &str = "cli_validation_failed";
}

/// Ceiling on free-text arguments (prompts, titles, bodies).
pub const MAX_FREE_TEXT_CHARS: usize = 2_000;

/// A free-form action proposal from the operator backend.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct OperatorProposal {
    /// Proposed command kind (wire name, e.g. `run_resume`).
    pub kind: String,
    /// Issue the proposal targets.
    #[serde(default)]
    pub issue_id: Option<String>,
    /// Root issue for run proposals.
    #[serde(default)]
    pub root_issue_id: Option<String>,
    /// Step ceiling for run proposals.
    #[serde(default)]
    pub max_steps: Option<u32>,
    /// Run prompt.
    #[serde(default)]
    pub prompt: Option<String>,
    /// Issue title (for `issue_open`).
    #[serde(default)]
    pub title: Option<String>,
    /// Issue body (for `issue_update`).
    #[serde(default)]
    pub body: Option<String>,
}

/// Broker verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerDecision {
    /// The proposal maps to this literal command text.
    Approved {
        /// A member of the closed `/mu` command set.
        command_text: String,
    },
    /// The proposal was rejected.
    Rejected {
        /// One of the [`reject_reason`] codes.
        reason: &'static str,
    },
}

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Whether `run_*` proposals may pass at all.
    pub run_triggers_enabled: bool,
    /// Repo roots the operator may act on. Empty means any.
    pub allowed_repo_roots: Vec<String>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            run_triggers_enabled: true,
            allowed_repo_roots: Vec::new(),
        }
    }
}

/// The approval gate itself.
#[derive(Debug, Clone)]
pub struct OperatorBroker {
    config: BrokerConfig,
}

impl OperatorBroker {
    /// Broker with the given configuration.
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }

    /// Evaluate one proposal in the context of the inbound envelope.
    pub fn evaluate(
        &self,
        proposal: &OperatorProposal,
        envelope: &InboundEnvelope,
    ) -> BrokerDecision {
        let decision = self.evaluate_inner(proposal, envelope);
        match &decision {
            BrokerDecision::Approved { command_text } => {
                info!(kind = %proposal.kind, command = %command_text, "operator proposal approved");
            }
            BrokerDecision::Rejected { reason } => {
                warn!(kind = %proposal.kind, reason, "operator proposal rejected");
            }
        }
        decision
    }

    fn evaluate_inner(
        &self,
        proposal: &OperatorProposal,
        envelope: &InboundEnvelope,
    ) -> BrokerDecision {
        let Some(kind) = allowlisted_kind(&proposal.kind) else {
            return reject(reject_reason::ACTION_DISALLOWED);
        };

        if kind.is_run_trigger() && !self.config.run_triggers_enabled {
            return reject(reject_reason::ACTION_DISALLOWED);
        }

        if !self.config.allowed_repo_roots.is_empty()
            && !self
                .config
                .allowed_repo_roots
                .iter()
                .any(|root| root == &envelope.repo_root)
        {
            return reject(reject_reason::CONTEXT_UNAUTHORIZED);
        }

        match kind {
            CommandKind::Status => approve("/mu status".to_owned()),
            CommandKind::IssueList => approve("/mu issue list".to_owned()),
            CommandKind::RunList => approve("/mu run list".to_owned()),
            CommandKind::Reload => approve("/mu reload".to_owned()),
            CommandKind::Update => approve("/mu update".to_owned()),
            CommandKind::IssueGet => self
                .resolve_issue(proposal, envelope)
                .map(|id| approve(format!("/mu issue get {id}")))
                .unwrap_or_else(reject),
            CommandKind::IssueClose => self
                .resolve_issue(proposal, envelope)
                .map(|id| approve(format!("/mu issue close {id}")))
                .unwrap_or_else(reject),
            CommandKind::IssueOpen => {
                let title = proposal.title.as_deref().or(proposal.prompt.as_deref());
                match title.map(validate_free_text) {
                    Some(Ok(title)) => approve(format!("/mu issue open \"{title}\"")),
                    Some(Err(reason)) => reject(reason),
                    None => reject(reject_reason::CONTEXT_MISSING),
                }
            }
            CommandKind::IssueUpdate => {
                let id = match self.resolve_issue(proposal, envelope) {
                    Ok(id) => id,
                    Err(reason) => return reject(reason),
                };
                match proposal.body.as_deref().map(validate_free_text) {
                    Some(Ok(body)) => approve(format!("/mu issue update {id} \"{body}\"")),
                    Some(Err(reason)) => reject(reason),
                    None => reject(reject_reason::CONTEXT_MISSING),
                }
            }
            CommandKind::RunStatus => match self.resolve_root(proposal, envelope) {
                Ok(root) => approve(format!("/mu run status {root}")),
                // Status without a target reads the whole queue.
                Err(reject_reason::CONTEXT_MISSING) => approve("/mu run status".to_owned()),
                Err(reason) => reject(reason),
            },
            CommandKind::RunStart | CommandKind::RunResume => {
                let root = match self.resolve_root(proposal, envelope) {
                    Ok(root) => root,
                    Err(reason) => return reject(reason),
                };
                let verb = if kind == CommandKind::RunStart {
                    "start"
                } else {
                    "resume"
                };
                let mut text = format!("/mu run {verb} {root}");
                if let Some(steps) = proposal.max_steps {
                    if steps == 0 {
                        return reject(reject_reason::CLI_VALIDATION_FAILED);
                    }
                    text.push_str(&format!(" --max-steps {steps}"));
                }
                if let Some(prompt) = proposal.prompt.as_deref() {
                    match validate_free_text(prompt) {
                        Ok(prompt) => text.push_str(&format!(" \"{prompt}\"")),
                        Err(reason) => return reject(reason),
                    }
                }
                approve(text)
            }
            CommandKind::RunInterrupt => match self.resolve_root(proposal, envelope) {
                Ok(root) => approve(format!("/mu run interrupt {root}")),
                Err(reason) => reject(reason),
            },
            CommandKind::Help => reject(reject_reason::ACTION_DISALLOWED),
        }
    }

    /// Resolve the issue a proposal targets: the explicit id, else the
    /// envelope's issue target, else a single metadata candidate.
    fn resolve_issue(
        &self,
        proposal: &OperatorProposal,
        envelope: &InboundEnvelope,
    ) -> Result<String, &'static str> {
        resolve_target(proposal.issue_id.as_deref(), envelope, "issue")
    }

    fn resolve_root(
        &self,
        proposal: &OperatorProposal,
        envelope: &InboundEnvelope,
    ) -> Result<String, &'static str> {
        resolve_target(
            proposal
                .root_issue_id
                .as_deref()
                .or(proposal.issue_id.as_deref()),
            envelope,
            "run",
        )
    }
}

fn resolve_target(
    explicit: Option<&str>,
    envelope: &InboundEnvelope,
    target_type: &str,
) -> Result<String, &'static str> {
    if let Some(id) = explicit {
        if !is_issue_id(id) {
            return Err(reject_reason::CLI_VALIDATION_FAILED);
        }
        return Ok(id.to_owned());
    }
    if envelope.target_type.as_deref() == Some(target_type)
        || envelope.target_type.as_deref() == Some("issue")
    {
        if let Some(id) = envelope.target_id.as_deref() {
            if is_issue_id(id) {
                return Ok(id.to_owned());
            }
        }
    }
    let candidates: Vec<String> = envelope
        .metadata
        .get("candidate_issue_ids")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str())
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default();
    match candidates.as_slice() {
        [] => Err(reject_reason::CONTEXT_MISSING),
        [single] if is_issue_id(single) => Ok(single.clone()),
        [_single] => Err(reject_reason::CLI_VALIDATION_FAILED),
        _ => Err(reject_reason::CONTEXT_AMBIGUOUS),
    }
}

/// Map a proposed kind string onto the broker allowlist.
fn allowlisted_kind(kind: &str) -> Option<CommandKind> {
    match kind {
        "status" => Some(CommandKind::Status),
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

/// Bound and sanitize free text bound for a quoted argv slot.
fn validate_free_text(text: &str) -> Result<&str, &'static str> {
    if text.is_empty()
        || text.chars().count() > MAX_FREE_TEXT_CHARS
        || text.contains('"')
        || text.contains('\n')
        || text.contains('\\')
    {
        return Err(reject_reason::CLI_VALIDATION_FAILED);
    }
    Ok(text)
}

fn approve(command_text: String) -> BrokerDecision {
    BrokerDecision::Approved { command_text }
}

fn reject(reason: &'static str) -> BrokerDecision {
    BrokerDecision::Rejected { reason }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AssuranceTier, Channel};

    fn envelope() -> InboundEnvelope {
        InboundEnvelope {
            version: 1,
            received_at_ms: 0,
            request_id: "r1".to_owned(),
            delivery_id: "d1".to_owned(),
            channel: Channel::Telegram,
            channel_tenant_id: "bot".to_owned(),
            channel_conversation_id: "chat".to_owned(),
            actor_id: "u1".to_owned(),
            actor_binding_id: Some("idb-1".to_owned()),
            assurance_tier: AssuranceTier::TierB,
            repo_root: "/work/mu".to_owned(),
            command_text: "please resume the auth work".to_owned(),
            scope_required: None,
            scope_effective: None,
            target_type: None,
            target_id: None,
            idempotency_key: "k1".to_owned(),
            fingerprint: "f1".to_owned(),
            attachments: Vec::new(),
            metadata: serde_json::Value::Null,
        }
    }

    fn broker() -> OperatorBroker {
        OperatorBroker::new(BrokerConfig::default())
    }

    fn proposal(kind: &str) -> OperatorProposal {
        OperatorProposal {
            kind: kind.to_owned(),
            ..OperatorProposal::default()
        }
    }

    #[test]
    fn test_simple_kinds_map_to_fixed_text() {
        let env = envelope();
        for (kind, expected) in [
            ("status", "/mu status"),
            ("issue_list", "/mu issue list"),
            ("run_list", "/mu run list"),
            ("reload", "/mu reload"),
            ("update", "/mu update"),
        ] {
            assert_eq!(
                broker().evaluate(&proposal(kind), &env),
                BrokerDecision::Approved {
                    command_text: expected.to_owned()
                }
            );
        }
    }

    #[test]
    fn test_unknown_kind_disallowed() {
        let decision = broker().evaluate(&proposal("rm_rf"), &envelope());
        assert_eq!(
            decision,
            BrokerDecision::Rejected {
                reason: reject_reason::ACTION_DISALLOWED
            }
        );
    }

    #[test]
    fn test_run_triggers_disabled_rejects_all_run_kinds() {
        let broker = OperatorBroker::new(BrokerConfig {
            run_triggers_enabled: false,
            ..BrokerConfig::default()
        });
        let mut p = proposal("run_resume");
        p.root_issue_id = Some("mu-1".to_owned());
        for kind in ["run_start", "run_resume", "run_interrupt"] {
            let mut p = p.clone();
            p.kind = kind.to_owned();
            assert_eq!(
                broker.evaluate(&p, &envelope()),
                BrokerDecision::Rejected {
                    reason: reject_reason::ACTION_DISALLOWED
                },
                "{kind}"
            );
        }
        // Read-only run_list is not a trigger.
        assert!(matches!(
            broker.evaluate(&proposal("run_list"), &envelope()),
            BrokerDecision::Approved { .. }
        ));
    }

    #[test]
    fn test_run_resume_full_shape() {
        let mut p = proposal("run_resume");
        p.root_issue_id = Some("mu-12".to_owned());
        p.max_steps = Some(25);
        assert_eq!(
            broker().evaluate(&p, &envelope()),
            BrokerDecision::Approved {
                command_text: "/mu run resume mu-12 --max-steps 25".to_owned()
            }
        );
    }

    #[test]
    fn test_issue_close_uses_envelope_target() {
        let mut env = envelope();
        env.target_type = Some("issue".to_owned());
        env.target_id = Some("mu-9".to_owned());
        assert_eq!(
            broker().evaluate(&proposal("issue_close"), &env),
            BrokerDecision::Approved {
                command_text: "/mu issue close mu-9".to_owned()
            }
        );
    }

    #[test]
    fn test_context_missing_and_ambiguous() {
        let missing = broker().evaluate(&proposal("issue_close"), &envelope());
        assert_eq!(
            missing,
            BrokerDecision::Rejected {
                reason: reject_reason::CONTEXT_MISSING
            }
        );

        let mut env = envelope();
        env.metadata = serde_json::json!({"candidate_issue_ids": ["mu-1", "mu-2"]});
        let ambiguous = broker().evaluate(&proposal("issue_close"), &env);
        assert_eq!(
            ambiguous,
            BrokerDecision::Rejected {
                reason: reject_reason::CONTEXT_AMBIGUOUS
            }
        );

        env.metadata = serde_json::json!({"candidate_issue_ids": ["mu-1"]});
        let single = broker().evaluate(&proposal("issue_close"), &env);
        assert_eq!(
            single,
            BrokerDecision::Approved {
                command_text: "/mu issue close mu-1".to_owned()
            }
        );
    }

    #[test]
    fn test_repo_root_allowlist() {
        let broker = OperatorBroker::new(BrokerConfig {
            allowed_repo_roots: vec!["/work/other".to_owned()],
            ..BrokerConfig::default()
        });
        assert_eq!(
            broker.evaluate(&proposal("status"), &envelope()),
            BrokerDecision::Rejected {
                reason: reject_reason::CONTEXT_UNAUTHORIZED
            }
        );
    }

    #[test]
    fn test_bad_issue_id_fails_validation() {
        let mut p = proposal("issue_close");
        p.issue_id = Some("mu-; rm -rf /".to_owned());
        assert_eq!(
            broker().evaluate(&p, &envelope()),
            BrokerDecision::Rejected {
                reason: reject_reason::CLI_VALIDATION_FAILED
            }
        );
    }

    #[test]
    fn test_zero_max_steps_fails_validation() {
        let mut p = proposal("run_start");
        p.root_issue_id = Some("mu-1".to_owned());
        p.max_steps = Some(0);
        assert_eq!(
            broker().evaluate(&p, &envelope()),
            BrokerDecision::Rejected {
                reason: reject_reason::CLI_VALIDATION_FAILED
            }
        );
    }

    #[test]
    fn test_prompt_injection_rejected() {
        let mut p = proposal("run_start");
        p.root_issue_id = Some("mu-1".to_owned());
        p.prompt = Some("do it\" && /mu update \"".to_owned());
        assert_eq!(
            broker().evaluate(&p, &envelope()),
            BrokerDecision::Rejected {
                reason: reject_reason::CLI_VALIDATION_FAILED
            }
        );
    }

    #[test]
    fn test_prompt_length_bounded() {
        let mut p = proposal("run_start");
        p.root_issue_id = Some("mu-1".to_owned());
        p.prompt = Some("x".repeat(MAX_FREE_TEXT_CHARS.saturating_add(1)));
        assert_eq!(
            broker().evaluate(&p, &envelope()),
            BrokerDecision::Rejected {
                reason: reject_reason::CLI_VALIDATION_FAILED
            }
        );
    }

    #[test]
    fn test_issue_open_quotes_title() {
        let mut p = proposal("issue_open");
        p.title = Some("tighten webhook retries".to_owned());
        assert_eq!(
            broker().evaluate(&p, &envelope()),
            BrokerDecision::Approved {
                command_text: "/mu issue open \"tighten webhook retries\"".to_owned()
            }
        );
    }

    #[test]
    fn test_run_status_without_target_reads_queue() {
        assert_eq!(
            broker().evaluate(&proposal("run_status"), &envelope()),
            BrokerDecision::Approved {
                command_text: "/mu run status".to_owned()
            }
        );
    }
}
