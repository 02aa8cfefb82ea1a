//! Inbound attachment store.
//!
//! Two-stage guard around channel file ingestion: a pre-download gate on
//! the declared mime/size, and a post-download gate on what was actually
//! stored. Accepted blobs land in a content directory keyed by
//! `attachment_id`, with metadata in an index journal. Records expire
//! after a TTL and are purged by [`AttachmentStore::purge_expired`].

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::store::{JournalRecord, JsonlJournal, StorageError};
use crate::types::{mint_id, AttachmentRef, Channel};

/// Default attachment size ceiling: 10 MiB.
pub const DEFAULT_MAX_SIZE_BYTES: u64 = 10 * 1024 * 1024;

/// Default record TTL: 24 hours.
pub const DEFAULT_TTL_MS: i64 = 24 * 60 * 60 * 1000;

/// Deterministic denial reason codes.
pub mod deny_reason {
    /// Mime not in the closed allowlist, or changed after download.
    pub const UNSUPPORTED_MIME: &str = "inbound_attachment_unsupported_mime";
    /// Declared or stored size exceeds the ceiling.
    pub const OVERSIZE: &str = "inbound_attachment_oversize";
    /// Scanner flagged the content.
    pub const MALWARE_FLAGGED: &str = "inbound_attachment_malware_flagged";
    /// No content hash was produced for the stored bytes.
    pub const MISSING_CONTENT_HASH: &str = "inbound_attachment_missing_content_hash";
    /// Attachments are disabled for the channel.
    pub const CHANNEL_DISABLED: &str = "inbound_attachment_channel_disabled";
}

/// Static attachment policy.
#[derive(Debug, Clone)]
pub struct AttachmentPolicy {
    /// Per-channel enable flags; absent channels are disabled.
    pub channel_modes: HashMap<Channel, bool>,
    /// Closed set of acceptable mime types.
    pub allowed_mime_types: BTreeSet<String>,
    /// Size ceiling in bytes.
    pub max_size_bytes: u64,
    /// Record TTL in milliseconds.
    pub ttl_ms: i64,
}

impl Default for AttachmentPolicy {
    fn default() -> Self {
        let allowed = [
            "application/pdf",
            "image/jpeg",
            "image/png",
            "image/svg+xml",
            "image/webp",
            "text/plain",
            "text/markdown",
            "text/x-markdown",
        ];
        Self {
            channel_modes: HashMap::from([
                (Channel::Slack, true),
                (Channel::Telegram, true),
            ]),
            allowed_mime_types: allowed.iter().map(|s| (*s).to_owned()).collect(),
            max_size_bytes: DEFAULT_MAX_SIZE_BYTES,
            ttl_ms: DEFAULT_TTL_MS,
        }
    }
}

impl AttachmentPolicy {
    /// Pre-download gate on the declared mime and size.
    pub fn check_pre_download(
        &self,
        channel: Channel,
        declared_mime: &str,
        declared_size: u64,
    ) -> Result<(), &'static str> {
        if !self.channel_modes.get(&channel).copied().unwrap_or(false) {
            return Err(deny_reason::CHANNEL_DISABLED);
        }
        if !self.allowed_mime_types.contains(declared_mime) {
            return Err(deny_reason::UNSUPPORTED_MIME);
        }
        if declared_size > self.max_size_bytes {
            return Err(deny_reason::OVERSIZE);
        }
        Ok(())
    }

    /// Post-download gate on what was actually stored.
    pub fn check_post_download(
        &self,
        declared_mime: &str,
        stored_mime: &str,
        stored_size: u64,
        content_hash: Option<&str>,
        malware_flagged: bool,
    ) -> Result<(), &'static str> {
        if malware_flagged {
            return Err(deny_reason::MALWARE_FLAGGED);
        }
        match content_hash {
            None => return Err(deny_reason::MISSING_CONTENT_HASH),
            Some(h) if h.is_empty() => return Err(deny_reason::MISSING_CONTENT_HASH),
            Some(_) => {}
        }
        if stored_mime != declared_mime {
            return Err(deny_reason::UNSUPPORTED_MIME);
        }
        if stored_size > self.max_size_bytes {
            return Err(deny_reason::OVERSIZE);
        }
        Ok(())
    }
}

/// One stored attachment, as persisted in the index journal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentRecord {
    /// Stable id (`att-` prefixed); also the blob filename.
    pub attachment_id: String,
    /// Sanitized filename.
    pub file_name: String,
    /// Stored mime type.
    pub mime: String,
    /// Stored size in bytes.
    pub size_bytes: u64,
    /// SHA-256 of the stored bytes, hex-encoded.
    pub content_hash: String,
    /// Channel the file arrived on.
    pub channel: Channel,
    /// When the record expires (ms).
    pub expires_at_ms: i64,
    /// Source-specific metadata (file id, caption, ...).
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// True once purged; tombstones hide the blob from readers.
    #[serde(default)]
    pub purged: bool,
    /// When the record last changed (ms).
    pub updated_at_ms: i64,
    /// Monotone per-record revision.
    pub revision: u64,
}

impl JournalRecord for AttachmentRecord {
    fn primary_key(&self) -> &str {
        &self.attachment_id
    }

    fn sort_key(&self) -> (i64, u64) {
        (self.updated_at_ms, self.revision)
    }
}

impl AttachmentRecord {
    /// Envelope-carried reference to this record.
    pub fn as_ref(&self) -> AttachmentRef {
        AttachmentRef {
            attachment_id: self.attachment_id.clone(),
            file_name: self.file_name.clone(),
            mime: self.mime.clone(),
            size_bytes: self.size_bytes,
            content_hash: self.content_hash.clone(),
        }
    }
}

/// Attachment store errors.
#[derive(Debug, thiserror::Error)]
pub enum AttachmentError {
    /// Underlying storage failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// Policy denied the attachment; the payload is the reason code.
    #[error("attachment denied: {0}")]
    Denied(&'static str),
    /// No (unexpired) record with the given id.
    #[error("attachment not found: {0}")]
    NotFound(String),
}

/// Parameters for [`AttachmentStore::ingest`].
#[derive(Debug, Clone)]
pub struct IngestParams {
    /// Channel the file arrived on.
    pub channel: Channel,
    /// Original (untrusted) filename.
    pub file_name: String,
    /// Mime declared before download.
    pub declared_mime: String,
    /// Size declared before download.
    pub declared_size: u64,
    /// Mime observed after download.
    pub stored_mime: String,
    /// Downloaded bytes.
    pub bytes: Vec<u8>,
    /// Scanner verdict.
    pub malware_flagged: bool,
    /// Source metadata.
    pub metadata: serde_json::Value,
    /// Ingest time (ms).
    pub now_ms: i64,
}

/// Blob directory plus index journal.
pub struct AttachmentStore {
    policy: AttachmentPolicy,
    blob_dir: PathBuf,
    index: JsonlJournal<AttachmentRecord>,
}

impl AttachmentStore {
    /// Open the store with the given blob directory and index path.
    pub fn open(
        policy: AttachmentPolicy,
        blob_dir: impl Into<PathBuf>,
        index_path: impl AsRef<std::path::Path>,
    ) -> Result<Self, StorageError> {
        let blob_dir = blob_dir.into();
        std::fs::create_dir_all(&blob_dir)?;
        Ok(Self {
            policy,
            blob_dir,
            index: JsonlJournal::open(index_path)?,
        })
    }

    /// The configured policy.
    pub fn policy(&self) -> &AttachmentPolicy {
        &self.policy
    }

    /// Run both gates, store the blob, and index it.
    pub async fn ingest(&self, params: IngestParams) -> Result<AttachmentRecord, AttachmentError> {
        self.policy
            .check_pre_download(params.channel, &params.declared_mime, params.declared_size)
            .map_err(AttachmentError::Denied)?;

        let stored_size = u64::try_from(params.bytes.len()).unwrap_or(u64::MAX);
        let content_hash = sha256_bytes(&params.bytes);
        self.policy
            .check_post_download(
                &params.declared_mime,
                &params.stored_mime,
                stored_size,
                Some(&content_hash),
                params.malware_flagged,
            )
            .map_err(AttachmentError::Denied)?;

        let attachment_id = mint_id("att");
        let blob_path = self.blob_dir.join(&attachment_id);
        std::fs::write(&blob_path, &params.bytes).map_err(StorageError::from)?;

        let record = AttachmentRecord {
            attachment_id,
            file_name: sanitize_file_name(&params.file_name),
            mime: params.stored_mime,
            size_bytes: stored_size,
            content_hash,
            channel: params.channel,
            expires_at_ms: params.now_ms.saturating_add(self.policy.ttl_ms),
            metadata: params.metadata,
            purged: false,
            updated_at_ms: params.now_ms,
            revision: 1,
        };
        self.index.append(record.clone()).await?;
        info!(
            attachment_id = %record.attachment_id,
            file_name = %record.file_name,
            mime = %record.mime,
            size = record.size_bytes,
            "attachment ingested"
        );
        Ok(record)
    }

    /// Look up a live record, honouring expiry.
    pub async fn get(&self, attachment_id: &str, now_ms: i64) -> Option<AttachmentRecord> {
        self.index
            .get(attachment_id)
            .await
            .filter(|r| !r.purged && r.expires_at_ms > now_ms)
    }

    /// Read a live attachment's bytes.
    pub async fn read_bytes(
        &self,
        attachment_id: &str,
        now_ms: i64,
    ) -> Result<Vec<u8>, AttachmentError> {
        let record = self
            .get(attachment_id, now_ms)
            .await
            .ok_or_else(|| AttachmentError::NotFound(attachment_id.to_owned()))?;
        let bytes =
            std::fs::read(self.blob_dir.join(&record.attachment_id)).map_err(StorageError::from)?;
        Ok(bytes)
    }

    /// Remove expired blobs and append tombstones. Returns the purge count.
    pub async fn purge_expired(&self, now_ms: i64) -> Result<usize, AttachmentError> {
        let expired: Vec<AttachmentRecord> = self
            .index
            .snapshot()
            .await
            .into_iter()
            .filter(|r| !r.purged && r.expires_at_ms <= now_ms)
            .collect();
        let mut purged = 0usize;
        for mut record in expired {
            let blob_path = self.blob_dir.join(&record.attachment_id);
            if let Err(e) = std::fs::remove_file(&blob_path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(
                        attachment_id = %record.attachment_id,
                        error = %e,
                        "failed to remove expired attachment blob"
                    );
                    continue;
                }
            }
            record.purged = true;
            record.updated_at_ms = now_ms;
            record.revision = record.revision.saturating_add(1);
            self.index.append(record).await?;
            purged = purged.saturating_add(1);
        }
        if purged > 0 {
            info!(purged, "expired attachments purged");
        }
        Ok(purged)
    }
}

/// SHA-256 of raw bytes, hex-encoded.
fn sha256_bytes(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Sanitize an untrusted filename to a flat, shell-safe basename.
///
/// Strips any path components, maps disallowed characters to `_`, and
/// bounds the length. Empty input becomes `attachment`.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim()
        .trim_start_matches('.');
    let mut cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    cleaned.truncate(128);
    if cleaned.is_empty() {
        return "attachment".to_owned();
    }
    cleaned
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (AttachmentStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = AttachmentStore::open(
            AttachmentPolicy::default(),
            dir.path().join("blobs"),
            dir.path().join("index.jsonl"),
        )
        .expect("open");
        (store, dir)
    }

    fn ingest_params(name: &str, mime: &str, bytes: &[u8]) -> IngestParams {
        IngestParams {
            channel: Channel::Telegram,
            file_name: name.to_owned(),
            declared_mime: mime.to_owned(),
            declared_size: u64::try_from(bytes.len()).expect("len"),
            stored_mime: mime.to_owned(),
            bytes: bytes.to_vec(),
            malware_flagged: false,
            metadata: serde_json::json!({"file_id": "tg-file-1"}),
            now_ms: 1_000,
        }
    }

    #[tokio::test]
    async fn test_ingest_and_read() {
        let (store, _dir) = store();
        let record = store
            .ingest(ingest_params("notes.md", "text/markdown", b"# notes"))
            .await
            .expect("ingest");
        assert_eq!(record.file_name, "notes.md");
        assert_eq!(record.size_bytes, 7);

        let bytes = store
            .read_bytes(&record.attachment_id, 2_000)
            .await
            .expect("read");
        assert_eq!(bytes, b"# notes");
    }

    #[tokio::test]
    async fn test_unsupported_mime_denied() {
        let (store, _dir) = store();
        let result = store
            .ingest(ingest_params("a.exe", "application/x-dosexec", b"MZ"))
            .await;
        assert!(matches!(
            result,
            Err(AttachmentError::Denied(deny_reason::UNSUPPORTED_MIME))
        ));
    }

    #[tokio::test]
    async fn test_oversize_denied_pre_download() {
        let (store, _dir) = store();
        let mut params = ingest_params("big.pdf", "application/pdf", b"x");
        params.declared_size = DEFAULT_MAX_SIZE_BYTES.saturating_add(1);
        let result = store.ingest(params).await;
        assert!(matches!(
            result,
            Err(AttachmentError::Denied(deny_reason::OVERSIZE))
        ));
    }

    #[tokio::test]
    async fn test_disabled_channel_denied() {
        let (store, _dir) = store();
        let mut params = ingest_params("a.pdf", "application/pdf", b"pdf");
        params.channel = Channel::Neovim;
        let result = store.ingest(params).await;
        assert!(matches!(
            result,
            Err(AttachmentError::Denied(deny_reason::CHANNEL_DISABLED))
        ));
    }

    #[tokio::test]
    async fn test_malware_flag_denied() {
        let (store, _dir) = store();
        let mut params = ingest_params("a.pdf", "application/pdf", b"pdf");
        params.malware_flagged = true;
        let result = store.ingest(params).await;
        assert!(matches!(
            result,
            Err(AttachmentError::Denied(deny_reason::MALWARE_FLAGGED))
        ));
    }

    #[tokio::test]
    async fn test_mime_change_denied_post_download() {
        let (store, _dir) = store();
        let mut params = ingest_params("a.pdf", "application/pdf", b"pdf");
        params.stored_mime = "text/html".to_owned();
        let result = store.ingest(params).await;
        assert!(matches!(
            result,
            Err(AttachmentError::Denied(deny_reason::UNSUPPORTED_MIME))
        ));
    }

    #[test]
    fn test_post_download_missing_hash() {
        let policy = AttachmentPolicy::default();
        let result = policy.check_post_download("text/plain", "text/plain", 4, None, false);
        assert_eq!(result, Err(deny_reason::MISSING_CONTENT_HASH));
        let empty = policy.check_post_download("text/plain", "text/plain", 4, Some(""), false);
        assert_eq!(empty, Err(deny_reason::MISSING_CONTENT_HASH));
    }

    #[tokio::test]
    async fn test_ttl_expiry_and_purge() {
        let (store, _dir) = store();
        let record = store
            .ingest(ingest_params("notes.txt", "text/plain", b"hi"))
            .await
            .expect("ingest");

        let after_expiry = record.expires_at_ms.saturating_add(1);
        assert!(store.get(&record.attachment_id, after_expiry).await.is_none());

        let purged = store.purge_expired(after_expiry).await.expect("purge");
        assert_eq!(purged, 1);
        let read = store.read_bytes(&record.attachment_id, after_expiry).await;
        assert!(matches!(read, Err(AttachmentError::NotFound(_))));
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("my report.pdf"), "my_report.pdf");
        assert_eq!(sanitize_file_name(".hidden"), "hidden");
        assert_eq!(sanitize_file_name(""), "attachment");
        assert_eq!(sanitize_file_name("a\\b\\evil .sh"), "evil_.sh");
        assert!(sanitize_file_name(&"x".repeat(500)).len() <= 128);
    }

    #[tokio::test]
    async fn test_content_hash_matches_bytes() {
        let (store, _dir) = store();
        let record = store
            .ingest(ingest_params("a.txt", "text/plain", b"abc"))
            .await
            .expect("ingest");
        assert_eq!(
            record.content_hash,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
