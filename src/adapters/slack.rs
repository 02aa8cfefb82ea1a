//! Slack adapter: slash commands and event callbacks.
//!
//! Verifies the `v0` HMAC signature over `v0:<timestamp>:<body>` with the
//! signing secret, rejecting stale timestamps. Slash commands carry the
//! command in the form body; event callbacks are accepted only when their
//! text leads with `/mu`. Files on event callbacks are downloaded with
//! the bot token and pushed through the attachment store; policy denials
//! are audited but never fail the command.

use std::sync::Arc;

use tracing::warn;

use crate::attachments::{AttachmentStore, IngestParams};
use crate::pipeline::render::{mode_for_channel, render_result};
use crate::pipeline::{CommandPipeline, PipelineError};
use crate::types::{
    fingerprint, mint_id, AssuranceTier, AttachmentRef, Channel, InboundEnvelope, ENVELOPE_VERSION,
};

use super::fetch::AttachmentFetcher;
use super::verify::{verify_signed_request, DEFAULT_MAX_SKEW_SECS};
use super::{
    AdapterAudit, AdapterIngressResult, AdapterRequest, AdapterResponse, AdapterSpec, AuditEvent,
    ChannelAdapter, REASON_INVALID_JSON, REASON_INVALID_PAYLOAD,
};

use async_trait::async_trait;

/// Slack adapter configuration.
#[derive(Debug, Clone)]
pub struct SlackConfig {
    /// Signing secret for `v0` signatures.
    pub signing_secret: Option<String>,
    /// Bot token used to download event files.
    pub bot_token: Option<String>,
    /// Repository root commands operate on.
    pub repo_root: String,
    /// Accepted signature timestamp skew, seconds.
    pub max_skew_secs: i64,
}

impl SlackConfig {
    /// Config with the default skew window.
    pub fn new(signing_secret: Option<String>, repo_root: impl Into<String>) -> Self {
        Self {
            signing_secret,
            bot_token: None,
            repo_root: repo_root.into(),
            max_skew_secs: DEFAULT_MAX_SKEW_SECS,
        }
    }
}

/// The Slack adapter.
pub struct SlackAdapter {
    config: SlackConfig,
    pipeline: Arc<CommandPipeline>,
    audit: Arc<AdapterAudit>,
    attachments: Option<Arc<AttachmentStore>>,
    fetcher: Option<Arc<dyn AttachmentFetcher>>,
}

impl SlackAdapter {
    /// Wire up the adapter.
    pub fn new(
        config: SlackConfig,
        pipeline: Arc<CommandPipeline>,
        audit: Arc<AdapterAudit>,
        attachments: Option<Arc<AttachmentStore>>,
        fetcher: Option<Arc<dyn AttachmentFetcher>>,
    ) -> Self {
        Self {
            config,
            pipeline,
            audit,
            attachments,
            fetcher,
        }
    }

    fn reject(&self, reason: &str, response: AdapterResponse) -> AdapterIngressResult {
        self.audit.log(
            Channel::Slack,
            AuditEvent::Reject,
            serde_json::json!({"reason": reason}),
        );
        AdapterIngressResult::rejected(Channel::Slack, reason, response)
    }

    /// Build the canonical envelope for a Slack source id.
    fn envelope(
        &self,
        source_id: &str,
        tenant: &str,
        conversation: &str,
        actor: &str,
        command_text: String,
        received_at_ms: i64,
        attachments: Vec<AttachmentRef>,
        metadata: serde_json::Value,
    ) -> InboundEnvelope {
        let source_hash = &crate::types::sha256_hex(&format!("slack:{source_id}"))[..16];
        InboundEnvelope {
            version: ENVELOPE_VERSION,
            received_at_ms,
            request_id: format!("slack-{source_hash}"),
            delivery_id: mint_id("dlv"),
            channel: Channel::Slack,
            channel_tenant_id: tenant.to_owned(),
            channel_conversation_id: conversation.to_owned(),
            actor_id: actor.to_owned(),
            actor_binding_id: None,
            assurance_tier: AssuranceTier::TierA,
            repo_root: self.config.repo_root.clone(),
            command_text: command_text.clone(),
            scope_required: None,
            scope_effective: None,
            target_type: None,
            target_id: None,
            idempotency_key: format!("slack-idem-{source_hash}"),
            fingerprint: fingerprint(&command_text),
            attachments,
            metadata,
        }
    }

    async fn ingest_event_files(
        &self,
        files: &[serde_json::Value],
        now_ms: i64,
    ) -> Vec<AttachmentRef> {
        let (Some(store), Some(fetcher)) = (self.attachments.as_ref(), self.fetcher.as_ref())
        else {
            return Vec::new();
        };
        let mut refs = Vec::new();
        for file in files {
            let name = file.get("name").and_then(|v| v.as_str()).unwrap_or("file");
            let mime = file
                .get("mimetype")
                .and_then(|v| v.as_str())
                .unwrap_or("application/octet-stream");
            let size = file.get("size").and_then(|v| v.as_u64()).unwrap_or(0);
            let url = file.get("url_private").and_then(|v| v.as_str());

            if let Err(reason) = store
                .policy()
                .check_pre_download(Channel::Slack, mime, size)
            {
                self.audit.log(
                    Channel::Slack,
                    AuditEvent::Reject,
                    serde_json::json!({"file": name, "reason": reason}),
                );
                continue;
            }
            let Some(url) = url else {
                continue;
            };
            let fetched = match fetcher.fetch(url, self.config.bot_token.as_deref()).await {
                Ok(fetched) => fetched,
                Err(e) => {
                    warn!(file = name, error = %e, "slack file download failed");
                    self.audit.log(
                        Channel::Slack,
                        AuditEvent::Reject,
                        serde_json::json!({"file": name, "reason": "download_failed"}),
                    );
                    continue;
                }
            };
            let stored_mime = fetched.mime.unwrap_or_else(|| mime.to_owned());
            match store
                .ingest(IngestParams {
                    channel: Channel::Slack,
                    file_name: name.to_owned(),
                    declared_mime: mime.to_owned(),
                    declared_size: size,
                    stored_mime,
                    bytes: fetched.bytes,
                    malware_flagged: false,
                    metadata: serde_json::json!({"slack_file_id": file.get("id")}),
                    now_ms,
                })
                .await
            {
                Ok(record) => refs.push(record.as_ref()),
                Err(e) => {
                    self.audit.log(
                        Channel::Slack,
                        AuditEvent::Reject,
                        serde_json::json!({"file": name, "reason": e.to_string()}),
                    );
                }
            }
        }
        refs
    }

    async fn run_pipeline(
        &self,
        inbound: InboundEnvelope,
    ) -> Result<AdapterIngressResult, PipelineError> {
        self.audit.log(
            Channel::Slack,
            AuditEvent::Accept,
            serde_json::json!({"request_id": inbound.request_id}),
        );
        let result = self.pipeline.handle_inbound(inbound.clone()).await?;
        let body = render_result(&result, mode_for_channel(Channel::Slack));
        self.audit.log(
            Channel::Slack,
            AuditEvent::Complete,
            serde_json::json!({"request_id": inbound.request_id, "state": result.state()}),
        );
        Ok(AdapterIngressResult {
            channel: Channel::Slack,
            accepted: true,
            reason: None,
            response: AdapterResponse::json(200, &serde_json::json!({"text": body})),
            inbound: Some(inbound),
            pipeline_result: Some(result),
            outbox_record: None,
        })
    }
}

#[async_trait]
impl ChannelAdapter for SlackAdapter {
    fn spec(&self) -> AdapterSpec {
        AdapterSpec {
            channel: Channel::Slack,
            path: "/webhooks/slack",
        }
    }

    async fn ingest(&self, request: AdapterRequest) -> AdapterIngressResult {
        self.audit.log(
            Channel::Slack,
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
            "v0",
            self.config.signing_secret.as_deref(),
            request.header("x-slack-request-timestamp"),
            request.header("x-slack-signature"),
            &request.body,
            request.received_at_ms,
            self.config.max_skew_secs,
        ) {
            let reason = e.reason("slack");
            let response = AdapterResponse::unauthorized(&reason);
            return self.reject(&reason, response);
        }

        let content_type = request.header("content-type").unwrap_or_default();
        let outcome = if content_type.starts_with("application/x-www-form-urlencoded") {
            self.ingest_slash_command(&request).await
        } else {
            self.ingest_event_callback(&request).await
        };
        match outcome {
            Ok(result) => result,
            Err(PipelineError::Storage(e)) => {
                warn!(error = %e, "slack ingest hit storage failure");
                self.reject(
                    "storage_error",
                    AdapterResponse::text(500, "storage_error"),
                )
            }
        }
    }
}

impl SlackAdapter {
    async fn ingest_slash_command(
        &self,
        request: &AdapterRequest,
    ) -> Result<AdapterIngressResult, PipelineError> {
        let mut command = None;
        let mut text = String::new();
        let mut trigger_id = None;
        let mut team_id = String::new();
        let mut channel_id = String::new();
        let mut user_id = String::new();
        for (key, value) in url::form_urlencoded::parse(&request.body) {
            match key.as_ref() {
                "command" => command = Some(value.into_owned()),
                "text" => text = value.into_owned(),
                "trigger_id" => trigger_id = Some(value.into_owned()),
                "team_id" => team_id = value.into_owned(),
                "channel_id" => channel_id = value.into_owned(),
                "user_id" => user_id = value.into_owned(),
                _ => {}
            }
        }
        let (Some(command), Some(trigger_id)) = (command, trigger_id) else {
            return Ok(self.reject(
                REASON_INVALID_PAYLOAD,
                AdapterResponse::bad_request(REASON_INVALID_PAYLOAD),
            ));
        };
        if command != "/mu" {
            return Ok(self.reject(
                REASON_INVALID_PAYLOAD,
                AdapterResponse::bad_request(REASON_INVALID_PAYLOAD),
            ));
        }
        let command_text = if text.trim().is_empty() {
            "/mu".to_owned()
        } else {
            format!("/mu {}", text.trim())
        };
        let inbound = self.envelope(
            &trigger_id,
            &team_id,
            &channel_id,
            &user_id,
            command_text,
            request.received_at_ms,
            Vec::new(),
            serde_json::json!({"slack_trigger_id": trigger_id}),
        );
        self.run_pipeline(inbound).await
    }

    async fn ingest_event_callback(
        &self,
        request: &AdapterRequest,
    ) -> Result<AdapterIngressResult, PipelineError> {
        let payload: serde_json::Value = match serde_json::from_slice(&request.body) {
            Ok(payload) => payload,
            Err(_) => {
                return Ok(self.reject(
                    REASON_INVALID_JSON,
                    AdapterResponse::bad_request(REASON_INVALID_JSON),
                ));
            }
        };
        if payload.get("type").and_then(|v| v.as_str()) != Some("event_callback") {
            return Ok(AdapterIngressResult {
                channel: Channel::Slack,
                accepted: true,
                reason: Some("unsupported_update".to_owned()),
                response: AdapterResponse::json(200, &serde_json::json!({"ok": true})),
                inbound: None,
                pipeline_result: None,
                outbox_record: None,
            });
        }
        let Some(event_id) = payload.get("event_id").and_then(|v| v.as_str()) else {
            return Ok(self.reject(
                REASON_INVALID_PAYLOAD,
                AdapterResponse::bad_request(REASON_INVALID_PAYLOAD),
            ));
        };
        let event = payload.get("event").cloned().unwrap_or_default();
        let team_id = payload
            .get("team_id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_owned();
        let channel_id = event
            .get("channel")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_owned();
        let user_id = event
            .get("user")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_owned();
        let text = event
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_owned();

        let files: Vec<serde_json::Value> = event
            .get("files")
            .and_then(|v| v.as_array())
            .cloned()
            .unwrap_or_default();
        let attachments = self.ingest_event_files(&files, request.received_at_ms).await;

        let inbound = self.envelope(
            event_id,
            &team_id,
            &channel_id,
            &user_id,
            text,
            request.received_at_ms,
            attachments,
            serde_json::json!({"slack_event_id": event_id}),
        );
        self.run_pipeline(inbound).await
    }
}
