//! Discord adapter: application command interactions.
//!
//! Verifies the `v1` HMAC signature over `v1:<timestamp>:<body>`. Only
//! `type = 2` (application command) interactions are processed; anything
//! else is answered politely as unsupported. The ack is an interaction
//! response with `data.content`.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::warn;

use crate::pipeline::render::{mode_for_channel, render_result};
use crate::pipeline::{CommandPipeline, PipelineError};
use crate::types::{
    fingerprint, mint_id, AssuranceTier, Channel, InboundEnvelope, ENVELOPE_VERSION,
};

use super::verify::{verify_signed_request, DEFAULT_MAX_SKEW_SECS};
use super::{
    AdapterAudit, AdapterIngressResult, AdapterRequest, AdapterResponse, AdapterSpec, AuditEvent,
    ChannelAdapter, REASON_INVALID_JSON, REASON_INVALID_PAYLOAD,
};

/// Interaction response type: channel message with source.
const RESPONSE_CHANNEL_MESSAGE: u8 = 4;

/// Discord adapter configuration.
#[derive(Debug, Clone)]
pub struct DiscordConfig {
    /// Signing secret for `v1` signatures.
    pub signing_secret: Option<String>,
    /// Repository root commands operate on.
    pub repo_root: String,
    /// Accepted signature timestamp skew, seconds.
    pub max_skew_secs: i64,
}

impl DiscordConfig {
    /// Config with the default skew window.
    pub fn new(signing_secret: Option<String>, repo_root: impl Into<String>) -> Self {
        Self {
            signing_secret,
            repo_root: repo_root.into(),
            max_skew_secs: DEFAULT_MAX_SKEW_SECS,
        }
    }
}

/// The Discord adapter.
pub struct DiscordAdapter {
    config: DiscordConfig,
    pipeline: Arc<CommandPipeline>,
    audit: Arc<AdapterAudit>,
}

impl DiscordAdapter {
    /// Wire up the adapter.
    pub fn new(
        config: DiscordConfig,
        pipeline: Arc<CommandPipeline>,
        audit: Arc<AdapterAudit>,
    ) -> Self {
        Self {
            config,
            pipeline,
            audit,
        }
    }

    fn reject(&self, reason: &str, response: AdapterResponse) -> AdapterIngressResult {
        self.audit.log(
            Channel::Discord,
            AuditEvent::Reject,
            serde_json::json!({"reason": reason}),
        );
        AdapterIngressResult::rejected(Channel::Discord, reason, response)
    }

    fn ack(content: &str) -> AdapterResponse {
        AdapterResponse::json(
            200,
            &serde_json::json!({
                "type": RESPONSE_CHANNEL_MESSAGE,
                "data": {"content": content},
            }),
        )
    }
}

#[async_trait]
impl ChannelAdapter for DiscordAdapter {
    fn spec(&self) -> AdapterSpec {
        AdapterSpec {
            channel: Channel::Discord,
            path: "/webhooks/discord",
        }
    }

    async fn ingest(&self, request: AdapterRequest) -> AdapterIngressResult {
        self.audit.log(
            Channel::Discord,
            AuditEvent::Ingest,
            serde_json::json!({"method": request.method}),
        );
        if request.method != "POST" {
            return self.reject(
                super::REASON_METHOD_NOT_ALLOWED,
                AdapterResponse::method_not_allowed(),
            );
        }
        if let Err(e) = verify_signed_request(
            "v1",
            self.config.signing_secret.as_deref(),
            request.header("x-discord-request-timestamp"),
            request.header("x-discord-signature"),
            &request.body,
            request.received_at_ms,
            self.config.max_skew_secs,
        ) {
            let reason = e.reason("discord");
            let response = AdapterResponse::unauthorized(&reason);
            return self.reject(&reason, response);
        }

        let payload: serde_json::Value = match serde_json::from_slice(&request.body) {
            Ok(payload) => payload,
            Err(_) => {
                return self.reject(
                    REASON_INVALID_JSON,
                    AdapterResponse::bad_request(REASON_INVALID_JSON),
                );
            }
        };

        if payload.get("type").and_then(|v| v.as_u64()) != Some(2) {
            return AdapterIngressResult {
                channel: Channel::Discord,
                accepted: true,
                reason: Some("unsupported_update".to_owned()),
                response: Self::ack("Unsupported interaction."),
                inbound: None,
                pipeline_result: None,
                outbox_record: None,
            };
        }

        let Some(interaction_id) = payload.get("id").and_then(|v| v.as_str()) else {
            return self.reject(
                REASON_INVALID_PAYLOAD,
                AdapterResponse::bad_request(REASON_INVALID_PAYLOAD),
            );
        };
        let guild_id = payload
            .get("guild_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let channel_id = payload
            .get("channel_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let user_id = payload
            .get("member")
            .and_then(|m| m.get("user"))
            .or_else(|| payload.get("user"))
            .and_then(|u| u.get("id"))
            .and_then(|v| v.as_str())
            .unwrap_or_default();

        // Slash input arrives as the `text` option of the `/mu` command.
        let data = payload.get("data").cloned().unwrap_or_default();
        let text = data
            .get("options")
            .and_then(|v| v.as_array())
            .and_then(|opts| {
                opts.iter()
                    .find(|o| o.get("name").and_then(|n| n.as_str()) == Some("text"))
            })
            .and_then(|o| o.get("value"))
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        let command_text = if text.trim().is_empty() {
            "/mu".to_owned()
        } else {
            format!("/mu {}", text.trim())
        };

        let inbound = InboundEnvelope {
            version: ENVELOPE_VERSION,
            received_at_ms: request.received_at_ms,
            request_id: format!(
                "discord-{}",
                &crate::types::sha256_hex(&format!("discord:{interaction_id}"))[..16]
            ),
            delivery_id: mint_id("dlv"),
            channel: Channel::Discord,
            channel_tenant_id: guild_id.to_owned(),
            channel_conversation_id: channel_id.to_owned(),
            actor_id: user_id.to_owned(),
            actor_binding_id: None,
            assurance_tier: AssuranceTier::TierA,
            repo_root: self.config.repo_root.clone(),
            command_text: command_text.clone(),
            scope_required: None,
            scope_effective: None,
            target_type: None,
            target_id: None,
            idempotency_key: format!("discord-idem-{interaction_id}"),
            fingerprint: fingerprint(&command_text),
            attachments: Vec::new(),
            metadata: serde_json::json!({"discord_interaction_id": interaction_id}),
        };

        self.audit.log(
            Channel::Discord,
            AuditEvent::Accept,
            serde_json::json!({"request_id": inbound.request_id}),
        );
        match self.pipeline.handle_inbound(inbound.clone()).await {
            Ok(result) => {
                let body = render_result(&result, mode_for_channel(Channel::Discord));
                self.audit.log(
                    Channel::Discord,
                    AuditEvent::Complete,
                    serde_json::json!({
                        "request_id": inbound.request_id,
                        "state": result.state(),
                    }),
                );
                AdapterIngressResult {
                    channel: Channel::Discord,
                    accepted: true,
                    reason: None,
                    response: Self::ack(&body),
                    inbound: Some(inbound),
                    pipeline_result: Some(result),
                    outbox_record: None,
                }
            }
            Err(PipelineError::Storage(e)) => {
                warn!(error = %e, "discord ingest hit storage failure");
                self.reject("storage_error", AdapterResponse::text(500, "storage_error"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::test_support::SharedAuditBuf;
    use crate::adapters::verify::signature_base;
    use crate::pipeline::testing::pipeline_fixture;
    use crate::pipeline::PipelineResult;
    use std::collections::HashSet;

    const SECRET: &str = "discord-signing-secret";

    async fn adapter() -> DiscordAdapter {
        let (pipeline, _outbox) = pipeline_fixture(None, HashSet::new()).await;
        let audit = Arc::new(AdapterAudit::from_writer(Box::new(SharedAuditBuf::new())));
        DiscordAdapter::new(
            DiscordConfig::new(Some(SECRET.to_owned()), "/work/mu"),
            pipeline,
            audit,
        )
    }

    fn interaction(text: &str, id: &str) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "type": 2,
            "guild_id": "tenant-1",
            "channel_id": "chan-1",
            "member": {"user": {"id": "actor-1"}},
            "data": {"name": "mu", "options": [{"name": "text", "value": text}]},
        })
    }

    fn signed(body: &[u8], at_secs: i64) -> AdapterRequest {
        let ts = at_secs.to_string();
        let sig = signature_base("v1", SECRET, &ts, body);
        AdapterRequest::post(
            [
                ("content-type".to_owned(), "application/json".to_owned()),
                ("x-discord-request-timestamp".to_owned(), ts),
                ("x-discord-signature".to_owned(), sig),
            ],
            body.to_vec(),
            at_secs.saturating_mul(1_000),
        )
    }

    #[tokio::test]
    async fn test_command_interaction_round_trip() {
        let adapter = adapter().await;
        let body = interaction("status", "int-1").to_string();
        let result = adapter.ingest(signed(body.as_bytes(), 1_000)).await;
        assert!(result.accepted);
        assert!(matches!(
            result.pipeline_result,
            Some(PipelineResult::Completed { .. })
        ));
        let inbound = result.inbound.expect("envelope");
        assert_eq!(inbound.idempotency_key, "discord-idem-int-1");
        assert_eq!(inbound.command_text, "/mu status");

        // Ack is an interaction response carrying the rendered body.
        let ack: serde_json::Value =
            serde_json::from_str(&result.response.body).expect("ack json");
        assert_eq!(ack["type"], 4);
        assert!(ack["data"]["content"].as_str().is_some());
    }

    #[tokio::test]
    async fn test_wrong_version_signature_rejected() {
        let adapter = adapter().await;
        let body = interaction("status", "int-1").to_string();
        let ts = "1000";
        // Sign with v0 instead of v1.
        let sig = signature_base("v0", SECRET, ts, body.as_bytes());
        let request = AdapterRequest::post(
            [
                ("x-discord-request-timestamp".to_owned(), ts.to_owned()),
                ("x-discord-signature".to_owned(), sig),
            ],
            body.into_bytes(),
            1_000_000,
        );
        let result = adapter.ingest(request).await;
        assert!(!result.accepted);
        assert_eq!(result.response.status, 401);
        assert_eq!(result.reason.as_deref(), Some("invalid_discord_signature"));
    }

    #[tokio::test]
    async fn test_non_command_interaction_is_unsupported() {
        let adapter = adapter().await;
        let body = serde_json::json!({"id": "int-2", "type": 1}).to_string();
        let result = adapter.ingest(signed(body.as_bytes(), 1_000)).await;
        assert!(result.accepted);
        assert_eq!(result.reason.as_deref(), Some("unsupported_update"));
        assert!(result.pipeline_result.is_none());
    }

    #[tokio::test]
    async fn test_method_gate() {
        let adapter = adapter().await;
        let mut request = signed(b"{}", 1_000);
        request.method = "PUT".to_owned();
        let result = adapter.ingest(request).await;
        assert_eq!(result.response.status, 405);
    }

    #[tokio::test]
    async fn test_missing_secret_rejected() {
        let (pipeline, _outbox) = pipeline_fixture(None, HashSet::new()).await;
        let audit = Arc::new(AdapterAudit::from_writer(Box::new(SharedAuditBuf::new())));
        let adapter = DiscordAdapter::new(
            DiscordConfig::new(None, "/work/mu"),
            pipeline,
            audit,
        );
        let body = interaction("status", "int-3").to_string();
        let result = adapter.ingest(signed(body.as_bytes(), 1_000)).await;
        assert_eq!(result.response.status, 401);
        assert_eq!(result.reason.as_deref(), Some("missing_discord_secret"));
    }
}
