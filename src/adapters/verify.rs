//! Signed-ingress verification.
//!
//! Slack and Discord sign webhook bodies with HMAC-SHA256 over a
//! versioned base string (`v0:<ts>:<body>` / `v1:<ts>:<body>`); Telegram
//! and the editor frontends use shared-secret headers. All comparisons
//! are constant-time.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Maximum accepted signature timestamp skew, in seconds.
pub const DEFAULT_MAX_SKEW_SECS: i64 = 5 * 60;

/// Verification failure reasons, surfaced as 401 bodies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerifyError {
    /// The signing secret is not configured.
    MissingSecret,
    /// Required signature headers are absent.
    MissingSignature,
    /// The timestamp header is unparseable or outside the skew window.
    StaleTimestamp,
    /// The signature does not match.
    BadSignature,
}

impl VerifyError {
    /// Machine reason code with the channel spliced in, e.g.
    /// `invalid_slack_signature`.
    pub fn reason(self, channel: &str) -> String {
        match self {
            VerifyError::MissingSecret => format!("missing_{channel}_secret"),
            VerifyError::MissingSignature => format!("missing_{channel}_signature"),
            VerifyError::StaleTimestamp => format!("stale_{channel}_timestamp"),
            VerifyError::BadSignature => format!("invalid_{channel}_signature"),
        }
    }
}

/// HMAC-SHA256 of `<version>:<timestamp>:<body>`, hex-encoded and
/// prefixed with `<version>=`.
pub fn signature_base(version: &str, secret: &str, timestamp: &str, body: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
    mac.update(version.as_bytes());
    mac.update(b":");
    mac.update(timestamp.as_bytes());
    mac.update(b":");
    mac.update(body);
    format!("{version}={}", hex::encode(mac.finalize().into_bytes()))
}

/// Verify a versioned HMAC signature with timestamp skew checking.
pub fn verify_signed_request(
    version: &str,
    secret: Option<&str>,
    timestamp: Option<&str>,
    signature: Option<&str>,
    body: &[u8],
    now_ms: i64,
    max_skew_secs: i64,
) -> Result<(), VerifyError> {
    let secret = secret.ok_or(VerifyError::MissingSecret)?;
    let timestamp = timestamp.ok_or(VerifyError::MissingSignature)?;
    let signature = signature.ok_or(VerifyError::MissingSignature)?;

    let ts_secs: i64 = timestamp.parse().map_err(|_| VerifyError::StaleTimestamp)?;
    let now_secs = now_ms.saturating_div(1_000);
    if now_secs.saturating_sub(ts_secs).abs() > max_skew_secs {
        return Err(VerifyError::StaleTimestamp);
    }

    let expected = signature_base(version, secret, timestamp, body);
    if constant_time_eq(expected.as_bytes(), signature.as_bytes()) {
        Ok(())
    } else {
        Err(VerifyError::BadSignature)
    }
}

/// Constant-time comparison of a shared-secret header value.
pub fn verify_shared_secret(
    configured: Option<&str>,
    presented: Option<&str>,
) -> Result<(), VerifyError> {
    let configured = configured.ok_or(VerifyError::MissingSecret)?;
    let presented = presented.ok_or(VerifyError::MissingSignature)?;
    if constant_time_eq(configured.as_bytes(), presented.as_bytes()) {
        Ok(())
    } else {
        Err(VerifyError::BadSignature)
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "8f742231b10e8888abcd99yyyzzz85a5";
    const BODY: &[u8] = b"command=%2Fmu&text=status";

    fn now_for(ts: &str) -> i64 {
        ts.parse::<i64>().expect("ts").saturating_mul(1_000)
    }

    #[test]
    fn test_round_trip_v0() {
        let ts = "1531420618";
        let sig = signature_base("v0", SECRET, ts, BODY);
        assert!(sig.starts_with("v0="));
        let result = verify_signed_request(
            "v0",
            Some(SECRET),
            Some(ts),
            Some(&sig),
            BODY,
            now_for(ts),
            DEFAULT_MAX_SKEW_SECS,
        );
        assert_eq!(result, Ok(()));
    }

    #[test]
    fn test_bad_signature() {
        let ts = "1531420618";
        let result = verify_signed_request(
            "v0",
            Some(SECRET),
            Some(ts),
            Some("v0=deadbeef"),
            BODY,
            now_for(ts),
            DEFAULT_MAX_SKEW_SECS,
        );
        assert_eq!(result, Err(VerifyError::BadSignature));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let ts = "1531420618";
        let sig = signature_base("v0", "other-secret", ts, BODY);
        let result = verify_signed_request(
            "v0",
            Some(SECRET),
            Some(ts),
            Some(&sig),
            BODY,
            now_for(ts),
            DEFAULT_MAX_SKEW_SECS,
        );
        assert_eq!(result, Err(VerifyError::BadSignature));
    }

    #[test]
    fn test_stale_timestamp() {
        let ts = "1531420618";
        let sig = signature_base("v0", SECRET, ts, BODY);
        let an_hour_later = now_for(ts).saturating_add(3_600_000);
        let result = verify_signed_request(
            "v0",
            Some(SECRET),
            Some(ts),
            Some(&sig),
            BODY,
            an_hour_later,
            DEFAULT_MAX_SKEW_SECS,
        );
        assert_eq!(result, Err(VerifyError::StaleTimestamp));
    }

    #[test]
    fn test_missing_parts() {
        assert_eq!(
            verify_signed_request("v0", None, Some("1"), Some("v0=x"), BODY, 1_000, 300),
            Err(VerifyError::MissingSecret)
        );
        assert_eq!(
            verify_signed_request("v0", Some(SECRET), None, Some("v0=x"), BODY, 1_000, 300),
            Err(VerifyError::MissingSignature)
        );
        assert_eq!(
            verify_signed_request("v0", Some(SECRET), Some("1"), None, BODY, 1_000, 300),
            Err(VerifyError::MissingSignature)
        );
    }

    #[test]
    fn test_v1_differs_from_v0() {
        let ts = "1531420618";
        assert_ne!(
            signature_base("v0", SECRET, ts, BODY),
            signature_base("v1", SECRET, ts, BODY)
        );
    }

    #[test]
    fn test_shared_secret() {
        assert_eq!(verify_shared_secret(Some("s3cret"), Some("s3cret")), Ok(()));
        assert_eq!(
            verify_shared_secret(Some("s3cret"), Some("nope")),
            Err(VerifyError::BadSignature)
        );
        assert_eq!(
            verify_shared_secret(None, Some("s3cret")),
            Err(VerifyError::MissingSecret)
        );
        assert_eq!(
            verify_shared_secret(Some("s3cret"), None),
            Err(VerifyError::MissingSignature)
        );
    }

    #[test]
    fn test_reason_codes() {
        assert_eq!(
            VerifyError::BadSignature.reason("slack"),
            "invalid_slack_signature"
        );
        assert_eq!(
            VerifyError::MissingSecret.reason("telegram"),
            "missing_telegram_secret"
        );
    }
}
