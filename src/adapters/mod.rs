//! Channel adapters: per-channel verify/normalize/ack/defer.
//!
//! Every adapter consumes a normalized [`AdapterRequest`] (the HTTP
//! server out front stays out of scope) and produces an
//! [`AdapterIngressResult`] carrying the HTTP response, the normalized
//! envelope, and the pipeline outcome. Adapters share one JSONL audit
//! log; audit I/O never blocks command handling.

pub mod discord;
pub mod editor;
pub mod fetch;
pub mod generation;
pub mod slack;
pub mod telegram;
pub mod verify;

use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tracing::warn;

use crate::outbox::OutboxRecord;
use crate::pipeline::PipelineResult;
use crate::types::{Channel, InboundEnvelope};

/// Reason code for a non-POST request.
pub const REASON_METHOD_NOT_ALLOWED: &str = "method_not_allowed";

/// Reason code for a malformed JSON body.
pub const REASON_INVALID_JSON: &str = "invalid_json";

/// Reason code for a structurally wrong payload.
pub const REASON_INVALID_PAYLOAD: &str = "invalid_payload";

/// A normalized inbound HTTP request.
#[derive(Debug, Clone)]
pub struct AdapterRequest {
    /// HTTP method, uppercase.
    pub method: String,
    /// Header map with lowercase keys.
    pub headers: HashMap<String, String>,
    /// Raw body bytes.
    pub body: Vec<u8>,
    /// Receive timestamp (ms).
    pub received_at_ms: i64,
}

impl AdapterRequest {
    /// POST request with the given headers and body.
    pub fn post(
        headers: impl IntoIterator<Item = (String, String)>,
        body: impl Into<Vec<u8>>,
        received_at_ms: i64,
    ) -> Self {
        Self {
            method: "POST".to_owned(),
            headers: headers
                .into_iter()
                .map(|(k, v)| (k.to_lowercase(), v))
                .collect(),
            body: body.into(),
            received_at_ms,
        }
    }

    /// Header lookup (keys are lowercase).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }

    /// Body as UTF-8, lossy.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// The HTTP response an adapter answers with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterResponse {
    /// HTTP status code.
    pub status: u16,
    /// Content type.
    pub content_type: String,
    /// Response body.
    pub body: String,
}

impl AdapterResponse {
    /// JSON response.
    pub fn json(status: u16, value: &serde_json::Value) -> Self {
        Self {
            status,
            content_type: "application/json".to_owned(),
            body: value.to_string(),
        }
    }

    /// Plain-text response.
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: "text/plain".to_owned(),
            body: body.into(),
        }
    }

    /// 405 for non-POST methods.
    pub fn method_not_allowed() -> Self {
        Self::text(405, REASON_METHOD_NOT_ALLOWED)
    }

    /// 401 with a machine reason, no body disclosure.
    pub fn unauthorized(reason: &str) -> Self {
        Self::text(401, reason.to_owned())
    }

    /// 400 with a machine reason.
    pub fn bad_request(reason: &str) -> Self {
        Self::text(400, reason.to_owned())
    }
}

/// Everything one ingest produced.
#[derive(Debug)]
pub struct AdapterIngressResult {
    /// Which channel handled the request.
    pub channel: Channel,
    /// Whether the request made it past verification and parsing.
    pub accepted: bool,
    /// Machine reason when not accepted.
    pub reason: Option<String>,
    /// The HTTP response to send.
    pub response: AdapterResponse,
    /// The normalized envelope, when one was produced.
    pub inbound: Option<InboundEnvelope>,
    /// The pipeline outcome, when the envelope was processed inline.
    pub pipeline_result: Option<PipelineResult>,
    /// An outbox record enqueued as part of handling, if any.
    pub outbox_record: Option<OutboxRecord>,
}

impl AdapterIngressResult {
    /// A rejected ingest with the given response.
    pub fn rejected(channel: Channel, reason: &str, response: AdapterResponse) -> Self {
        Self {
            channel,
            accepted: false,
            reason: Some(reason.to_owned()),
            response,
            inbound: None,
            pipeline_result: None,
            outbox_record: None,
        }
    }
}

/// Static description of an adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterSpec {
    /// The channel served.
    pub channel: Channel,
    /// Webhook mount path, e.g. `/webhooks/slack`.
    pub path: &'static str,
}

/// Adapter lifecycle errors (warmup, drain, stop).
#[derive(Debug, thiserror::Error)]
pub enum AdapterError {
    /// Warmup did not complete.
    #[error("warmup failed: {0}")]
    WarmupFailed(String),
    /// Health check did not pass.
    #[error("health check failed: {0}")]
    HealthFailed(String),
    /// Drain did not finish inside its timeout.
    #[error("drain timed out with {0} in-flight")]
    DrainTimeout(usize),
    /// Stop failed.
    #[error("stop failed: {0}")]
    StopFailed(String),
}

/// The single interface every channel adapter satisfies.
///
/// The lifecycle methods default to no-ops; only reconfigurable adapters
/// (Telegram) override them.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Static description.
    fn spec(&self) -> AdapterSpec;

    /// Verify, normalize, and process one request.
    async fn ingest(&self, request: AdapterRequest) -> AdapterIngressResult;

    /// Prepare a standby instance (load queues, self-check).
    async fn warmup(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    /// Liveness/readiness probe.
    async fn health_check(&self) -> Result<(), AdapterError> {
        Ok(())
    }

    /// Begin accepting ingress (standby → active).
    fn activate_ingress(&self) {}

    /// Refuse new ingress; in-flight work continues.
    fn begin_drain(&self) {}

    /// Wait for in-flight ingress to finish, bounded by `timeout`.
    async fn drain(&self, _timeout: Duration) -> Result<(), AdapterError> {
        Ok(())
    }

    /// Release resources. `force` skips graceful winding down.
    async fn stop(&self, _force: bool) -> Result<(), AdapterError> {
        Ok(())
    }
}

/// Audit event discriminator.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEvent {
    /// A request arrived.
    Ingest,
    /// The request passed verification and was normalized.
    Accept,
    /// The request was rejected.
    Reject,
    /// The envelope was enqueued for deferred processing.
    Defer,
    /// A deferred row failed and will retry.
    Retry,
    /// Processing finished.
    Complete,
    /// A deferred row exhausted its retries.
    DeadLetter,
}

#[derive(Debug, Serialize)]
struct AuditEntry<'a> {
    timestamp: String,
    channel: &'a str,
    event: AuditEvent,
    details: serde_json::Value,
}

/// Shared JSONL audit log for all adapters.
///
/// Writes one JSON object per line through an internal mutex. Failures
/// are logged and swallowed; command handling never blocks on audit I/O.
pub struct AdapterAudit {
    writer: Mutex<Box<dyn Write + Send>>,
}

impl AdapterAudit {
    /// Audit log appending to the given file path.
    pub fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self {
            writer: Mutex::new(Box::new(file)),
        })
    }

    /// Audit log over an arbitrary writer (for testing).
    pub fn from_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Append one audit row. Never fails the caller.
    pub fn log(&self, channel: Channel, event: AuditEvent, details: serde_json::Value) {
        let entry = AuditEntry {
            timestamp: Utc::now().to_rfc3339(),
            channel: channel.as_str(),
            event,
            details,
        };
        let line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to serialize audit entry");
                return;
            }
        };
        let Ok(mut writer) = self.writer.lock() else {
            warn!("adapter audit writer poisoned");
            return;
        };
        if let Err(e) = writer
            .write_all(line.as_bytes())
            .and_then(|()| writer.write_all(b"\n"))
            .and_then(|()| writer.flush())
        {
            warn!(error = %e, "failed to append audit entry");
        }
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::SharedAuditBuf;
    use super::*;

    #[test]
    fn test_audit_rows_are_jsonl() {
        let buf = SharedAuditBuf::new();
        let audit = AdapterAudit::from_writer(Box::new(buf.clone()));
        audit.log(
            Channel::Slack,
            AuditEvent::Ingest,
            serde_json::json!({"request_id": "r1"}),
        );
        audit.log(
            Channel::Slack,
            AuditEvent::Accept,
            serde_json::json!({"request_id": "r1"}),
        );

        let lines = buf.lines();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["channel"], "slack");
        assert_eq!(lines[0]["event"], "ingest");
        assert_eq!(lines[1]["event"], "accept");
        assert_eq!(lines[1]["details"]["request_id"], "r1");
    }

    #[test]
    fn test_response_builders() {
        assert_eq!(AdapterResponse::method_not_allowed().status, 405);
        assert_eq!(
            AdapterResponse::unauthorized("invalid_slack_signature").status,
            401
        );
        assert_eq!(AdapterResponse::bad_request(REASON_INVALID_JSON).status, 400);
        let json = AdapterResponse::json(200, &serde_json::json!({"ok": true}));
        assert_eq!(json.content_type, "application/json");
    }

    #[test]
    fn test_request_header_lookup_case_insensitive() {
        let req = AdapterRequest::post(
            [("X-Slack-Signature".to_owned(), "v0=abc".to_owned())],
            b"body".to_vec(),
            1_000,
        );
        assert_eq!(req.header("x-slack-signature"), Some("v0=abc"));
        assert_eq!(req.header("X-SLACK-SIGNATURE"), Some("v0=abc"));
    }
}
