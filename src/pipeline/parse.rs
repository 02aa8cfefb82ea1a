//! `/mu` command grammar.
//!
//! A quote-aware tokenizer plus a small recursive matcher from tokens to
//! [`CommandKind`] and its arguments. Parsing is pure; authorization and
//! execution live in the pipeline.

use std::sync::OnceLock;

use regex::Regex;

use crate::policy::CommandKind;

/// Command prefix all explicit commands start with.
pub const COMMAND_PREFIX: &str = "/mu";

/// Validator for issue ids (`mu-` followed by lowercase alphanumerics).
pub fn issue_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new("^mu-[a-z0-9][a-z0-9-]*$").unwrap_or_else(|_| unreachable!()))
}

/// Whether a string is a well-formed issue id.
pub fn is_issue_id(candidate: &str) -> bool {
    issue_id_regex().is_match(candidate)
}

/// A fully parsed explicit command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    /// Which command.
    pub kind: CommandKind,
    /// Raw positional arguments after the kind tokens.
    pub args: Vec<String>,
    /// Target kind, when the command names one (`issue`, `run`).
    pub target_type: Option<String>,
    /// Target id, when the command names one.
    pub target_id: Option<String>,
    /// Root issue for run commands.
    pub root_issue_id: Option<String>,
    /// `--max-steps` value for run commands.
    pub max_steps: Option<u32>,
    /// Quoted free-text argument (issue title/body, run prompt).
    pub prompt: Option<String>,
}

/// Result of parsing one inbound text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedInbound {
    /// An explicit `/mu` command.
    Command(ParsedCommand),
    /// `confirm <command_id>`.
    Confirm {
        /// Command id the confirm references.
        command_id: String,
    },
    /// `cancel <command_id>`.
    Cancel {
        /// Command id the cancel references.
        command_id: String,
    },
    /// Free-form text (not addressed to the control plane).
    NotCommand,
    /// Addressed to the control plane but malformed.
    Invalid {
        /// Machine reason code.
        reason: String,
    },
}

/// Parse normalized command text.
pub fn parse_command_text(text: &str) -> ParsedInbound {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return ParsedInbound::NotCommand;
    }

    let tokens = match tokenize(trimmed) {
        Ok(tokens) => tokens,
        Err(reason) => {
            // Unbalanced quoting only matters once the text is addressed
            // to us; plain chat keeps flowing to the operator.
            if trimmed.starts_with(COMMAND_PREFIX) {
                return ParsedInbound::Invalid {
                    reason: reason.to_owned(),
                };
            }
            return ParsedInbound::NotCommand;
        }
    };

    let mut rest: &[Token] = &tokens;
    match rest.first() {
        Some(tok) if tok.is_bare(COMMAND_PREFIX) => {
            rest = &rest[1..];
        }
        // Bare confirm/cancel come from confirmation UI affordances
        // (Telegram inline buttons) without the prefix.
        Some(tok) if tok.is_bare("confirm") || tok.is_bare("cancel") => {}
        _ => return ParsedInbound::NotCommand,
    }

    match rest.first() {
        None => ParsedInbound::Command(simple(CommandKind::Help)),
        Some(first) if first.is_bare("help") => ParsedInbound::Command(simple(CommandKind::Help)),
        Some(first) if first.is_bare("status") => {
            ParsedInbound::Command(simple(CommandKind::Status))
        }
        Some(first) if first.is_bare("confirm") => match bare_arg(&rest[1..]) {
            Some(id) => ParsedInbound::Confirm { command_id: id },
            None => invalid("missing_argument"),
        },
        Some(first) if first.is_bare("cancel") => match bare_arg(&rest[1..]) {
            Some(id) => ParsedInbound::Cancel { command_id: id },
            None => invalid("missing_argument"),
        },
        Some(first) if first.is_bare("issue") => parse_issue(&rest[1..]),
        Some(first) if first.is_bare("run") => parse_run(&rest[1..]),
        Some(first) if first.is_bare("reload") => {
            ParsedInbound::Command(simple(CommandKind::Reload))
        }
        Some(first) if first.is_bare("update") => {
            ParsedInbound::Command(simple(CommandKind::Update))
        }
        Some(_) => invalid("unknown_command"),
    }
}

fn parse_issue(rest: &[Token]) -> ParsedInbound {
    let Some(verb) = rest.first() else {
        return invalid("missing_argument");
    };
    let args = &rest[1..];
    if verb.is_bare("list") {
        return ParsedInbound::Command(simple(CommandKind::IssueList));
    }
    if verb.is_bare("get") || verb.is_bare("close") {
        let Some(id) = bare_arg(args) else {
            return invalid("missing_argument");
        };
        if !is_issue_id(&id) {
            return invalid("invalid_issue_id");
        }
        let kind = if verb.is_bare("get") {
            CommandKind::IssueGet
        } else {
            CommandKind::IssueClose
        };
        return ParsedInbound::Command(ParsedCommand {
            target_type: Some("issue".to_owned()),
            target_id: Some(id.clone()),
            args: vec![id],
            ..simple(kind)
        });
    }
    if verb.is_bare("open") {
        let Some(Token::Quoted(title)) = args.first() else {
            return invalid("missing_argument");
        };
        return ParsedInbound::Command(ParsedCommand {
            target_type: Some("issue".to_owned()),
            prompt: Some(title.clone()),
            args: vec![title.clone()],
            ..simple(CommandKind::IssueOpen)
        });
    }
    if verb.is_bare("update") {
        let Some(id) = bare_arg(args) else {
            return invalid("missing_argument");
        };
        if !is_issue_id(&id) {
            return invalid("invalid_issue_id");
        }
        let Some(Token::Quoted(body)) = args.get(1) else {
            return invalid("missing_argument");
        };
        return ParsedInbound::Command(ParsedCommand {
            target_type: Some("issue".to_owned()),
            target_id: Some(id.clone()),
            prompt: Some(body.clone()),
            args: vec![id, body.clone()],
            ..simple(CommandKind::IssueUpdate)
        });
    }
    invalid("unknown_command")
}

fn parse_run(rest: &[Token]) -> ParsedInbound {
    let Some(verb) = rest.first() else {
        return invalid("missing_argument");
    };
    let args = &rest[1..];
    if verb.is_bare("list") {
        return ParsedInbound::Command(simple(CommandKind::RunList));
    }
    if verb.is_bare("status") {
        let root = bare_arg(args);
        if let Some(root) = &root {
            if !is_issue_id(root) {
                return invalid("invalid_issue_id");
            }
        }
        return ParsedInbound::Command(ParsedCommand {
            target_type: root.as_ref().map(|_| "run".to_owned()),
            target_id: root.clone(),
            root_issue_id: root.clone(),
            args: root.clone().into_iter().collect(),
            ..simple(CommandKind::RunStatus)
        });
    }

    let kind = if verb.is_bare("start") {
        CommandKind::RunStart
    } else if verb.is_bare("resume") {
        CommandKind::RunResume
    } else if verb.is_bare("interrupt") {
        CommandKind::RunInterrupt
    } else {
        return invalid("unknown_command");
    };

    let Some(root) = bare_arg(args) else {
        return invalid("missing_argument");
    };
    if !is_issue_id(&root) {
        return invalid("invalid_issue_id");
    }

    let mut max_steps = None;
    let mut prompt = None;
    let mut plain_args = vec![root.clone()];
    let mut idx = 1usize;
    while let Some(token) = args.get(idx) {
        if token.is_bare("--max-steps") {
            let Some(value) = args.get(idx.saturating_add(1)).and_then(Token::bare) else {
                return invalid("invalid_max_steps");
            };
            let Ok(parsed) = value.parse::<u32>() else {
                return invalid("invalid_max_steps");
            };
            if parsed == 0 {
                return invalid("invalid_max_steps");
            }
            max_steps = Some(parsed);
            plain_args.push("--max-steps".to_owned());
            plain_args.push(value.to_owned());
            idx = idx.saturating_add(2);
            continue;
        }
        match token {
            Token::Quoted(text) if prompt.is_none() && kind != CommandKind::RunInterrupt => {
                prompt = Some(text.clone());
                plain_args.push(text.clone());
                idx = idx.saturating_add(1);
            }
            _ => return invalid("unknown_command"),
        }
    }

    ParsedInbound::Command(ParsedCommand {
        target_type: Some("run".to_owned()),
        target_id: Some(root.clone()),
        root_issue_id: Some(root),
        max_steps,
        prompt,
        args: plain_args,
        ..simple(kind)
    })
}

fn simple(kind: CommandKind) -> ParsedCommand {
    ParsedCommand {
        kind,
        args: Vec::new(),
        target_type: None,
        target_id: None,
        root_issue_id: None,
        max_steps: None,
        prompt: None,
    }
}

fn invalid(reason: &str) -> ParsedInbound {
    ParsedInbound::Invalid {
        reason: reason.to_owned(),
    }
}

fn bare_arg(tokens: &[Token]) -> Option<String> {
    tokens.first().and_then(Token::bare).map(str::to_owned)
}

/// One shell-style token: bare word or double-quoted string.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Bare(String),
    Quoted(String),
}

impl Token {
    fn bare(&self) -> Option<&str> {
        match self {
            Token::Bare(s) => Some(s),
            Token::Quoted(_) => None,
        }
    }

    fn is_bare(&self, expected: &str) -> bool {
        self.bare().is_some_and(|s| s.eq_ignore_ascii_case(expected))
    }
}

/// Split into bare and double-quoted tokens. `\"` escapes a quote inside
/// a quoted token.
fn tokenize(text: &str) -> Result<Vec<Token>, &'static str> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c == '"' {
            chars.next();
            let mut value = String::new();
            let mut closed = false;
            while let Some(inner) = chars.next() {
                match inner {
                    '"' => {
                        closed = true;
                        break;
                    }
                    '\\' => match chars.next() {
                        Some('"') => value.push('"'),
                        Some(other) => {
                            value.push('\\');
                            value.push(other);
                        }
                        None => return Err("unbalanced_quotes"),
                    },
                    other => value.push(other),
                }
            }
            if !closed {
                return Err("unbalanced_quotes");
            }
            tokens.push(Token::Quoted(value));
        } else {
            let mut value = String::new();
            while let Some(&inner) = chars.peek() {
                if inner.is_whitespace() {
                    break;
                }
                value.push(inner);
                chars.next();
            }
            tokens.push(Token::Bare(value));
        }
    }
    Ok(tokens)
}
