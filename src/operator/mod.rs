//! Operator bridge: session continuity and turn lifecycle for the
//! external operator backend.
//!
//! The backend is an opaque advisor behind [`OperatorBackend`]. The
//! bridge owns session keys, the bounded per-session context window, and
//! turn timeouts. Backend failures and timeouts never propagate: they
//! degrade into a conversational `operator_backend_error` message.
//! A turn is attempted exactly once; a turn whose proposal reached the
//! confirmation state is never re-run.

pub mod broker;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::types::{mint_id, sha256_hex, InboundEnvelope};

use broker::OperatorProposal;

/// Default turn timeout.
pub const DEFAULT_TURN_TIMEOUT: Duration = Duration::from_secs(60);

/// Most prior turns included in a context window.
pub const MAX_CONTEXT_TURNS: usize = 20;

/// Character budget across the whole context window.
pub const MAX_CONTEXT_CHARS: usize = 16_000;

/// One prior exchange in a session's context window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextTurn {
    /// `user` or `operator`.
    pub role: &'static str,
    /// The text of the turn.
    pub text: String,
}

/// What the bridge hands the backend for one turn.
#[derive(Debug, Clone)]
pub struct OperatorTurnRequest {
    /// Session continuity key.
    pub session_id: String,
    /// Turn correlation id.
    pub turn_id: String,
    /// The inbound envelope that started the turn.
    pub inbound: InboundEnvelope,
    /// Bounded prior context, oldest first.
    pub context: Vec<ContextTurn>,
}

/// What the backend may answer with.
#[derive(Debug, Clone)]
pub enum OperatorTurnOutput {
    /// A conversational reply for the user.
    Respond {
        /// Reply text.
        message: String,
    },
    /// A privileged action proposal (goes through the broker).
    Command {
        /// The proposal.
        proposal: OperatorProposal,
    },
}

/// Backend failure surfaced to the bridge.
#[derive(Debug, thiserror::Error)]
pub enum OperatorBackendError {
    /// Any backend-side failure.
    #[error("{0}")]
    Backend(String),
}

/// The opaque operator backend.
#[async_trait]
pub trait OperatorBackend: Send + Sync {
    /// Run one turn.
    async fn run_turn(
        &self,
        request: OperatorTurnRequest,
    ) -> Result<OperatorTurnOutput, OperatorBackendError>;
}

/// Bridge result, post-degradation: always usable by the pipeline.
#[derive(Debug, Clone)]
pub struct OperatorTurn {
    /// Session the turn ran under.
    pub session_id: String,
    /// Turn correlation id.
    pub turn_id: String,
    /// The (possibly degraded) output.
    pub output: OperatorTurnOutput,
}

/// Session continuity key: hash of `(channel, tenant, conversation,
/// binding)`. Sessions never cross channels.
pub fn session_key(envelope: &InboundEnvelope) -> String {
    let binding = envelope.actor_binding_id.as_deref().unwrap_or("-");
    let digest = sha256_hex(&format!(
        "{}|{}|{}|{binding}",
        envelope.channel, envelope.channel_tenant_id, envelope.channel_conversation_id
    ));
    format!("ops-{}", &digest[..16])
}

/// The bridge.
pub struct OperatorBridge {
    backend: Arc<dyn OperatorBackend>,
    history: Mutex<HashMap<String, VecDeque<ContextTurn>>>,
    turn_timeout: Duration,
}

impl OperatorBridge {
    /// Bridge over the given backend with the default turn timeout.
    pub fn new(backend: Arc<dyn OperatorBackend>) -> Self {
        Self::with_timeout(backend, DEFAULT_TURN_TIMEOUT)
    }

    /// Bridge with an explicit turn timeout.
    pub fn with_timeout(backend: Arc<dyn OperatorBackend>, turn_timeout: Duration) -> Self {
        Self {
            backend,
            history: Mutex::new(HashMap::new()),
            turn_timeout,
        }
    }

    /// Run one operator turn for an inbound envelope.
    ///
    /// The turn id is adapter-provided when the envelope carries one in
    /// `metadata.operator_turn_id`, else minted. The backend call runs
    /// under the bridge timeout; errors and timeouts degrade to a
    /// `Respond` whose message carries `operator_backend_error`.
    pub async fn run_turn(&self, inbound: &InboundEnvelope) -> OperatorTurn {
        let session_id = session_key(inbound);
        let turn_id = inbound
            .metadata
            .get("operator_turn_id")
            .and_then(|v| v.as_str())
            .map(str::to_owned)
            .unwrap_or_else(|| mint_id("turn"));

        let context = self.context_window(&session_id).await;
        let request = OperatorTurnRequest {
            session_id: session_id.clone(),
            turn_id: turn_id.clone(),
            inbound: inbound.clone(),
            context,
        };

        info!(session_id = %session_id, turn_id = %turn_id, "operator turn starting");
        let result = tokio::time::timeout(self.turn_timeout, self.backend.run_turn(request)).await;

        let output = match result {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                warn!(session_id = %session_id, error = %e, "operator backend failed");
                OperatorTurnOutput::Respond {
                    message: format!("operator_backend_error: {e}"),
                }
            }
            Err(_) => {
                warn!(session_id = %session_id, "operator turn timed out");
                OperatorTurnOutput::Respond {
                    message: format!(
                        "operator_backend_error: turn timed out after {}ms",
                        self.turn_timeout.as_millis()
                    ),
                }
            }
        };

        self.record_exchange(&session_id, &inbound.command_text, &output)
            .await;

        OperatorTurn {
            session_id,
            turn_id,
            output,
        }
    }

    /// Bounded context window for a session, oldest first.
    async fn context_window(&self, session_id: &str) -> Vec<ContextTurn> {
        let history = self.history.lock().await;
        let Some(turns) = history.get(session_id) else {
            return Vec::new();
        };
        let mut budget = MAX_CONTEXT_CHARS;
        let mut window: Vec<ContextTurn> = Vec::new();
        for turn in turns.iter().rev().take(MAX_CONTEXT_TURNS) {
            let cost = turn.text.chars().count();
            if cost > budget {
                break;
            }
            budget = budget.saturating_sub(cost);
            window.push(turn.clone());
        }
        window.reverse();
        window
    }

    async fn record_exchange(
        &self,
        session_id: &str,
        user_text: &str,
        output: &OperatorTurnOutput,
    ) {
        let mut history = self.history.lock().await;
        let turns = history.entry(session_id.to_owned()).or_default();
        turns.push_back(ContextTurn {
            role: "user",
            text: user_text.to_owned(),
        });
        if let OperatorTurnOutput::Respond { message } = output {
            turns.push_back(ContextTurn {
                role: "operator",
                text: message.clone(),
            });
        }
        while turns.len() > MAX_CONTEXT_TURNS.saturating_mul(2) {
            turns.pop_front();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AssuranceTier, Channel};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn envelope(channel: Channel, conversation: &str, binding: Option<&str>) -> InboundEnvelope {
        InboundEnvelope {
            version: 1,
            received_at_ms: 0,
            request_id: "r1".to_owned(),
            delivery_id: "d1".to_owned(),
            channel,
            channel_tenant_id: "T1".to_owned(),
            channel_conversation_id: conversation.to_owned(),
            actor_id: "u1".to_owned(),
            actor_binding_id: binding.map(str::to_owned),
            assurance_tier: AssuranceTier::TierB,
            repo_root: "/work/mu".to_owned(),
            command_text: "what is running?".to_owned(),
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

    struct EchoBackend;

    #[async_trait]
    impl OperatorBackend for EchoBackend {
        async fn run_turn(
            &self,
            request: OperatorTurnRequest,
        ) -> Result<OperatorTurnOutput, OperatorBackendError> {
            Ok(OperatorTurnOutput::Respond {
                message: format!("echo: {}", request.inbound.command_text),
            })
        }
    }

    struct FailingBackend;

    #[async_trait]
    impl OperatorBackend for FailingBackend {
        async fn run_turn(
            &self,
            _request: OperatorTurnRequest,
        ) -> Result<OperatorTurnOutput, OperatorBackendError> {
            Err(OperatorBackendError::Backend("model unavailable".to_owned()))
        }
    }

    struct SlowBackend;

    #[async_trait]
    impl OperatorBackend for SlowBackend {
        async fn run_turn(
            &self,
            _request: OperatorTurnRequest,
        ) -> Result<OperatorTurnOutput, OperatorBackendError> {
            tokio::time::sleep(Duration::from_secs(3_600)).await;
            Ok(OperatorTurnOutput::Respond {
                message: "too late".to_owned(),
            })
        }
    }

    /// Counts turns and returns the context length it observed.
    struct ContextProbe {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl OperatorBackend for ContextProbe {
        async fn run_turn(
            &self,
            request: OperatorTurnRequest,
        ) -> Result<OperatorTurnOutput, OperatorBackendError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(OperatorTurnOutput::Respond {
                message: format!("context:{}", request.context.len()),
            })
        }
    }

    #[test]
    fn test_session_key_pins_all_four_parts() {
        let base = envelope(Channel::Telegram, "chat-1", Some("idb-1"));
        let same = session_key(&base);
        assert_eq!(session_key(&base), same);

        let other_conversation = envelope(Channel::Telegram, "chat-2", Some("idb-1"));
        assert_ne!(session_key(&other_conversation), same);

        let other_binding = envelope(Channel::Telegram, "chat-1", Some("idb-2"));
        assert_ne!(session_key(&other_binding), same);

        // Sessions do not cross channels even with identical ids.
        let other_channel = envelope(Channel::Slack, "chat-1", Some("idb-1"));
        assert_ne!(session_key(&other_channel), same);
    }

    #[tokio::test]
    async fn test_turn_round_trip() {
        let bridge = OperatorBridge::new(Arc::new(EchoBackend));
        let turn = bridge
            .run_turn(&envelope(Channel::Telegram, "chat-1", None))
            .await;
        match turn.output {
            OperatorTurnOutput::Respond { message } => {
                assert_eq!(message, "echo: what is running?");
            }
            other => panic!("expected respond, got {other:?}"),
        }
        assert!(turn.turn_id.starts_with("turn-"));
    }

    #[tokio::test]
    async fn test_backend_error_degrades_to_response() {
        let bridge = OperatorBridge::new(Arc::new(FailingBackend));
        let turn = bridge
            .run_turn(&envelope(Channel::Telegram, "chat-1", None))
            .await;
        match turn.output {
            OperatorTurnOutput::Respond { message } => {
                assert!(message.starts_with("operator_backend_error:"));
                assert!(message.contains("model unavailable"));
            }
            other => panic!("expected respond, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_degrades_to_response() {
        let bridge =
            OperatorBridge::with_timeout(Arc::new(SlowBackend), Duration::from_millis(250));
        let turn = bridge
            .run_turn(&envelope(Channel::Telegram, "chat-1", None))
            .await;
        match turn.output {
            OperatorTurnOutput::Respond { message } => {
                assert!(message.contains("operator_backend_error"));
                assert!(message.contains("timed out"));
            }
            other => panic!("expected respond, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_context_accumulates_within_session() {
        let probe = Arc::new(ContextProbe {
            calls: AtomicUsize::new(0),
        });
        let bridge = OperatorBridge::new(probe.clone());
        let env = envelope(Channel::Telegram, "chat-1", Some("idb-1"));

        let first = bridge.run_turn(&env).await;
        match first.output {
            OperatorTurnOutput::Respond { ref message } => assert_eq!(message, "context:0"),
            ref other => panic!("unexpected {other:?}"),
        }

        let second = bridge.run_turn(&env).await;
        match second.output {
            // First turn contributed a user + operator exchange.
            OperatorTurnOutput::Respond { ref message } => assert_eq!(message, "context:2"),
            ref other => panic!("unexpected {other:?}"),
        }

        // A different conversation starts from an empty window.
        let other = bridge
            .run_turn(&envelope(Channel::Telegram, "chat-9", Some("idb-1")))
            .await;
        match other.output {
            OperatorTurnOutput::Respond { ref message } => assert_eq!(message, "context:0"),
            ref other => panic!("unexpected {other:?}"),
        }
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_adapter_provided_turn_id_is_kept() {
        let bridge = OperatorBridge::new(Arc::new(EchoBackend));
        let mut env = envelope(Channel::Telegram, "chat-1", None);
        env.metadata = serde_json::json!({"operator_turn_id": "turn-adapter-7"});
        let turn = bridge.run_turn(&env).await;
        assert_eq!(turn.turn_id, "turn-adapter-7");
    }
}
