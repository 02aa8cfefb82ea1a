//! Static policy: command-kind scope requirements and kill switches.
//!
//! Every command kind maps to exactly one required scope. Bindings are
//! checked against that map; there are no dynamic grants. Kill switches
//! are process-wide flags the host may flip at runtime (config reload),
//! consulted at confirmation time so an already-pending mutation cannot
//! slip past a newly-thrown switch.

use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};

use crate::types::scope;

/// Reason code when a binding lacks the required scope.
pub const DENY_MISSING_SCOPE: &str = "missing_scope";

/// Reason code when the global mutation kill switch is thrown.
pub const DENY_MUTATIONS_DISABLED: &str = "mutations_disabled_global";

/// Every command the control plane understands.
///
/// The variant names double as the broker allowlist; `as_str` yields the
/// wire name used in audit rows and `cli_command_kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    /// Control-plane status summary.
    Status,
    /// Command catalog.
    Help,
    /// List issues.
    IssueList,
    /// Show one issue.
    IssueGet,
    /// Close an issue.
    IssueClose,
    /// Open a new issue.
    IssueOpen,
    /// Update an issue.
    IssueUpdate,
    /// List queued/active runs.
    RunList,
    /// Show one run (or the whole queue).
    RunStatus,
    /// Start a run.
    RunStart,
    /// Resume a run.
    RunResume,
    /// Interrupt a run.
    RunInterrupt,
    /// Reload the control plane configuration.
    Reload,
    /// Self-update the host binary.
    Update,
}

impl CommandKind {
    /// Wire name, e.g. `issue_close`.
    pub fn as_str(self) -> &'static str {
        match self {
            CommandKind::Status => "status",
            CommandKind::Help => "help",
            CommandKind::IssueList => "issue_list",
            CommandKind::IssueGet => "issue_get",
            CommandKind::IssueClose => "issue_close",
            CommandKind::IssueOpen => "issue_open",
            CommandKind::IssueUpdate => "issue_update",
            CommandKind::RunList => "run_list",
            CommandKind::RunStatus => "run_status",
            CommandKind::RunStart => "run_start",
            CommandKind::RunResume => "run_resume",
            CommandKind::RunInterrupt => "run_interrupt",
            CommandKind::Reload => "reload",
            CommandKind::Update => "update",
        }
    }

    /// Scope a binding must hold to issue this command.
    pub fn required_scope(self) -> &'static str {
        match self {
            CommandKind::Status
            | CommandKind::Help
            | CommandKind::IssueList
            | CommandKind::IssueGet
            | CommandKind::RunList
            | CommandKind::RunStatus => scope::READ,
            CommandKind::IssueClose | CommandKind::IssueOpen | CommandKind::IssueUpdate => {
                scope::ISSUE_WRITE
            }
            CommandKind::RunStart | CommandKind::RunResume | CommandKind::RunInterrupt => {
                scope::RUN_EXECUTE
            }
            CommandKind::Reload | CommandKind::Update => scope::OPS_ADMIN,
        }
    }

    /// Whether executing this command mutates repository state and
    /// therefore requires a confirmation round-trip.
    pub fn is_mutating(self) -> bool {
        matches!(
            self,
            CommandKind::IssueClose
                | CommandKind::IssueOpen
                | CommandKind::IssueUpdate
                | CommandKind::RunStart
                | CommandKind::RunResume
                | CommandKind::RunInterrupt
                | CommandKind::Reload
                | CommandKind::Update
        )
    }

    /// Whether this is a run-lifecycle command (broker run-trigger gate).
    pub fn is_run_trigger(self) -> bool {
        matches!(
            self,
            CommandKind::RunStart | CommandKind::RunResume | CommandKind::RunInterrupt
        )
    }
}

/// Policy check errors, surfaced as `denied`/`failed` result reasons.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PolicyError {
    /// The binding does not hold the required scope.
    #[error("missing_scope: requires {required}")]
    MissingScope {
        /// Scope the command needed.
        required: &'static str,
    },
    /// The global mutation kill switch is thrown.
    #[error("mutations_disabled_global")]
    MutationsDisabled,
}

impl PolicyError {
    /// Machine reason code for result records.
    pub fn reason_code(&self) -> &'static str {
        match self {
            PolicyError::MissingScope { .. } => DENY_MISSING_SCOPE,
            PolicyError::MutationsDisabled => DENY_MUTATIONS_DISABLED,
        }
    }
}

/// Process-wide policy engine.
#[derive(Debug)]
pub struct PolicyEngine {
    mutations_enabled: AtomicBool,
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl PolicyEngine {
    /// Engine with all switches in their permissive default position.
    pub fn with_defaults() -> Self {
        Self {
            mutations_enabled: AtomicBool::new(true),
        }
    }

    /// Check that a binding's scopes cover the command kind.
    ///
    /// Returns the effective scope on success.
    pub fn check_scope<'a, I>(
        &self,
        kind: CommandKind,
        granted: I,
    ) -> Result<&'static str, PolicyError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let required = kind.required_scope();
        if granted.into_iter().any(|s| s == required) {
            Ok(required)
        } else {
            Err(PolicyError::MissingScope { required })
        }
    }

    /// Gate for executing a mutation (consulted at confirmation time).
    pub fn check_mutation_allowed(&self) -> Result<(), PolicyError> {
        if self.mutations_enabled.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(PolicyError::MutationsDisabled)
        }
    }

    /// Flip the global mutation kill switch.
    pub fn set_mutations_enabled(&self, enabled: bool) {
        self.mutations_enabled.store(enabled, Ordering::SeqCst);
    }

    /// Current kill-switch position.
    pub fn mutations_enabled(&self) -> bool {
        self.mutations_enabled.load(Ordering::SeqCst)
    }
}
