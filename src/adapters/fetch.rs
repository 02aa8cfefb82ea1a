//! Attachment download seam.
//!
//! Adapters fetch channel files (Slack private URLs, Telegram file
//! paths) through this trait so tests can stub the network. The
//! production implementation is a thin `reqwest` client.

use async_trait::async_trait;

/// A downloaded file.
#[derive(Debug, Clone)]
pub struct FetchedFile {
    /// Raw bytes.
    pub bytes: Vec<u8>,
    /// Mime type reported by the transport, if any.
    pub mime: Option<String>,
}

/// Downloads channel attachments.
#[async_trait]
pub trait AttachmentFetcher: Send + Sync {
    /// Fetch a file, optionally with a bearer token.
    async fn fetch(&self, url: &str, bearer_token: Option<&str>) -> Result<FetchedFile, String>;
}

/// HTTP fetcher backed by `reqwest`.
pub struct HttpAttachmentFetcher {
    client: reqwest::Client,
}

impl HttpAttachmentFetcher {
    /// Fetcher with a fresh client.
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpAttachmentFetcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AttachmentFetcher for HttpAttachmentFetcher {
    async fn fetch(&self, url: &str, bearer_token: Option<&str>) -> Result<FetchedFile, String> {
        let mut request = self.client.get(url);
        if let Some(token) = bearer_token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await.map_err(|e| e.to_string())?;
        if !response.status().is_success() {
            return Err(format!("download failed with status {}", response.status()));
        }
        let mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_owned());
        let bytes = response.bytes().await.map_err(|e| e.to_string())?;
        Ok(FetchedFile {
            bytes: bytes.to_vec(),
            mime,
        })
    }
}
