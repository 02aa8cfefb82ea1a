//! Editor frontends (neovim, vscode, generic editor).
//!
//! One adapter parameterized by channel: shared-secret header
//! (`x-mu-<channel>-secret`), structured JSON payload with explicit
//! `{tenant_id, conversation_id, actor_id, text, client_context?}`, and a
//! JSON ack `{ok, accepted, ack, message, interaction, result}`.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::warn;

use crate::pipeline::render::{mode_for_channel, render_result};
use crate::pipeline::{CommandPipeline, PipelineError};
use crate::types::{
    fingerprint, mint_id, sha256_hex, AssuranceTier, Channel, InboundEnvelope, ENVELOPE_VERSION,
};

use super::verify::verify_shared_secret;
use super::{
    AdapterAudit, AdapterIngressResult, AdapterRequest, AdapterResponse, AdapterSpec, AuditEvent,
    ChannelAdapter, REASON_INVALID_JSON, REASON_INVALID_PAYLOAD,
};

/// Editor adapter configuration.
#[derive(Debug, Clone)]
pub struct EditorConfig {
    /// Which editor channel this instance serves.
    pub channel: Channel,
    /// Shared secret expected in the `x-mu-<channel>-secret` header.
    pub shared_secret: Option<String>,
    /// Repository root commands operate on.
    pub repo_root: String,
}

/// Structured editor payload.
#[derive(Debug, Deserialize)]
struct EditorPayload {
    tenant_id: String,
    conversation_id: String,
    actor_id: String,
    text: String,
    #[serde(default)]
    request_id: Option<String>,
    #[serde(default)]
    client_context: Option<serde_json::Value>,
}

/// Adapter for the editor-family channels.
pub struct EditorAdapter {
    config: EditorConfig,
    pipeline: Arc<CommandPipeline>,
    audit: Arc<AdapterAudit>,
}

impl EditorAdapter {
    /// Wire up the adapter. Panics never: unknown channels fall back to
    /// the generic editor spec.
    pub fn new(
        config: EditorConfig,
        pipeline: Arc<CommandPipeline>,
        audit: Arc<AdapterAudit>,
    ) -> Self {
        Self {
            config,
            pipeline,
            audit,
        }
    }

    fn channel(&self) -> Channel {
        self.config.channel
    }

    fn secret_header(&self) -> String {
        format!("x-mu-{}-secret", self.channel().as_str())
    }

    fn reject(&self, reason: &str, response: AdapterResponse) -> AdapterIngressResult {
        self.audit.log(
            self.channel(),
            AuditEvent::Reject,
            serde_json::json!({"reason": reason}),
        );
        AdapterIngressResult::rejected(self.channel(), reason, response)
    }
}

#[async_trait]
impl ChannelAdapter for EditorAdapter {
    fn spec(&self) -> AdapterSpec {
        AdapterSpec {
            channel: self.channel(),
            path: match self.channel() {
                Channel::Neovim => "/webhooks/neovim",
                Channel::Vscode => "/webhooks/vscode",
                _ => "/webhooks/editor",
            },
        }
    }

    async fn ingest(&self, request: AdapterRequest) -> AdapterIngressResult {
        let channel = self.channel();
        self.audit.log(
            channel,
            AuditEvent::Ingest,
            serde_json::json!({"method": request.method}),
        );
        if request.method != "POST" {
            return self.reject(
                super::REASON_METHOD_NOT_ALLOWED,
                AdapterResponse::method_not_allowed(),
            );
        }
        if let Err(e) = verify_shared_secret(
            self.config.shared_secret.as_deref(),
            request.header(&self.secret_header()),
        ) {
            let reason = e.reason(channel.as_str());
            let response = AdapterResponse::unauthorized(&reason);
            return self.reject(&reason, response);
        }

        let payload: EditorPayload = match serde_json::from_slice(&request.body) {
            Ok(payload) => payload,
            Err(e) => {
                let reason = if serde_json::from_slice::<serde_json::Value>(&request.body).is_ok()
                {
                    REASON_INVALID_PAYLOAD
                } else {
                    REASON_INVALID_JSON
                };
                warn!(error = %e, reason, "editor payload rejected");
                return self.reject(reason, AdapterResponse::bad_request(reason));
            }
        };

        // Source id: client request id when given, else the content key.
        let source_id = payload.request_id.clone().unwrap_or_else(|| {
            format!(
                "{}:{}:{}",
                payload.tenant_id,
                payload.conversation_id,
                sha256_hex(&payload.text)
            )
        });
        let source_hash = &sha256_hex(&format!("{channel}:{source_id}"))[..16];

        let inbound = InboundEnvelope {
            version: ENVELOPE_VERSION,
            received_at_ms: request.received_at_ms,
            request_id: format!("{channel}-{source_hash}"),
            delivery_id: mint_id("dlv"),
            channel,
            channel_tenant_id: payload.tenant_id.clone(),
            channel_conversation_id: payload.conversation_id.clone(),
            actor_id: payload.actor_id.clone(),
            actor_binding_id: None,
            assurance_tier: AssuranceTier::TierB,
            repo_root: self.config.repo_root.clone(),
            command_text: payload.text.clone(),
            scope_required: None,
            scope_effective: None,
            target_type: None,
            target_id: None,
            idempotency_key: format!("{channel}-idem-{source_hash}"),
            fingerprint: fingerprint(&payload.text),
            attachments: Vec::new(),
            metadata: serde_json::json!({
                "client_context": payload.client_context,
            }),
        };

        self.audit.log(
            channel,
            AuditEvent::Accept,
            serde_json::json!({"request_id": inbound.request_id}),
        );
        match self.pipeline.handle_inbound(inbound.clone()).await {
            Ok(result) => {
                let body = render_result(&result, mode_for_channel(channel));
                self.audit.log(
                    channel,
                    AuditEvent::Complete,
                    serde_json::json!({
                        "request_id": inbound.request_id,
                        "state": result.state(),
                    }),
                );
                let state = result.state();
                let ack = serde_json::json!({
                    "ok": true,
                    "accepted": true,
                    "ack": state,
                    "message": body,
                    "interaction": inbound.request_id,
                    "result": match &result {
                        crate::pipeline::PipelineResult::Completed { result, .. } => {
                            result.clone().unwrap_or(serde_json::Value::Null)
                        }
                        _ => serde_json::Value::Null,
                    },
                });
                AdapterIngressResult {
                    channel,
                    accepted: true,
                    reason: None,
                    response: AdapterResponse::json(200, &ack),
                    inbound: Some(inbound),
                    pipeline_result: Some(result),
                    outbox_record: None,
                }
            }
            Err(PipelineError::Storage(e)) => {
                warn!(error = %e, "editor ingest hit storage failure");
                self.reject("storage_error", AdapterResponse::text(500, "storage_error"))
            }
        }
    }
}
