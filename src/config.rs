//! Configuration loading and validation.
//!
//! The control plane consumes `config.json` from the repository root.
//! Every section defaults, so a minimal or empty config file is valid;
//! adapters without secrets simply refuse their ingress with the
//! matching `missing_*_secret` reason.

use std::path::Path;

use serde::Deserialize;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Per-channel adapter settings.
    #[serde(default)]
    pub adapters: AdaptersConfig,

    /// Operator backend settings.
    #[serde(default)]
    pub operator: OperatorConfig,

    /// Memory index settings (consumed by the host, not the core).
    #[serde(default)]
    pub memory_index: MemoryIndexConfig,

    /// Operational kill switches.
    #[serde(default)]
    pub ops: OpsConfig,

    /// Run queue admission settings.
    #[serde(default)]
    pub runs: RunsConfig,
}

impl Config {
    /// Load from a JSON file. A missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(text) => {
                let config = serde_json::from_str(&text).map_err(|e| {
                    anyhow::anyhow!("invalid config {}: {e}", path.display())
                })?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(anyhow::anyhow!(
                "failed to read config {}: {e}",
                path.display()
            )),
        }
    }
}

/// Per-channel adapter settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AdaptersConfig {
    /// Slack adapter.
    #[serde(default)]
    pub slack: SlackAdapterConfig,
    /// Discord adapter.
    #[serde(default)]
    pub discord: DiscordAdapterConfig,
    /// Telegram adapter.
    #[serde(default)]
    pub telegram: TelegramAdapterConfig,
    /// Neovim frontend.
    #[serde(default)]
    pub neovim: EditorAdapterSettings,
    /// VS Code frontend.
    #[serde(default)]
    pub vscode: EditorAdapterSettings,
    /// Generic editor frontend.
    #[serde(default)]
    pub editor: EditorAdapterSettings,
}

/// Slack settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SlackAdapterConfig {
    /// Mount the adapter at all.
    #[serde(default)]
    pub enabled: bool,
    /// Signing secret for `v0` signatures.
    #[serde(default)]
    pub signing_secret: Option<String>,
    /// Bot token for file downloads.
    #[serde(default)]
    pub bot_token: Option<String>,
    /// Route free-form text to the operator.
    #[serde(default)]
    pub chat_enabled: bool,
}

/// Discord settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiscordAdapterConfig {
    /// Mount the adapter at all.
    #[serde(default)]
    pub enabled: bool,
    /// Signing secret for `v1` signatures.
    #[serde(default)]
    pub signing_secret: Option<String>,
    /// Route free-form text to the operator.
    #[serde(default)]
    pub chat_enabled: bool,
}

/// Telegram settings.
#[derive(Debug, Clone, Deserialize)]
pub struct TelegramAdapterConfig {
    /// Mount the adapter at all.
    #[serde(default)]
    pub enabled: bool,
    /// Webhook shared secret.
    #[serde(default)]
    pub webhook_secret: Option<String>,
    /// Bot token for file downloads.
    #[serde(default)]
    pub bot_token: Option<String>,
    /// Bot username.
    #[serde(default)]
    pub bot_username: Option<String>,
    /// Defer verified ingress through the journal queue.
    #[serde(default = "default_true")]
    pub deferred_ingress: bool,
}

impl Default for TelegramAdapterConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            webhook_secret: None,
            bot_token: None,
            bot_username: None,
            deferred_ingress: true,
        }
    }
}

/// Editor-family settings.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct EditorAdapterSettings {
    /// Mount the adapter at all.
    #[serde(default)]
    pub enabled: bool,
    /// Shared secret expected in the channel's header.
    #[serde(default)]
    pub shared_secret: Option<String>,
}

/// Operator backend settings.
#[derive(Debug, Clone, Deserialize)]
pub struct OperatorConfig {
    /// Whether chat routes to the operator at all.
    #[serde(default)]
    pub enabled: bool,
    /// Whether operator proposals may trigger runs.
    #[serde(default = "default_true")]
    pub run_triggers_enabled: bool,
    /// Backend provider name.
    #[serde(default)]
    pub provider: Option<String>,
    /// Backend model identifier.
    #[serde(default)]
    pub model: Option<String>,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            run_triggers_enabled: true,
            provider: None,
            model: None,
        }
    }
}

/// Memory index settings.
#[derive(Debug, Clone, Deserialize)]
pub struct MemoryIndexConfig {
    /// Whether the host should run the index at all.
    #[serde(default)]
    pub enabled: bool,
    /// Index refresh interval.
    #[serde(default = "default_memory_index_every_ms")]
    pub every_ms: u64,
}

impl Default for MemoryIndexConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            every_ms: default_memory_index_every_ms(),
        }
    }
}

/// Operational kill switches.
#[derive(Debug, Clone, Deserialize)]
pub struct OpsConfig {
    /// Global mutation kill switch.
    #[serde(default = "default_true")]
    pub mutations_enabled: bool,
}

impl Default for OpsConfig {
    fn default() -> Self {
        Self {
            mutations_enabled: true,
        }
    }
}

/// Run queue admission settings.
#[derive(Debug, Clone, Deserialize)]
pub struct RunsConfig {
    /// Distinct roots allowed active at once. 1 means sequential.
    #[serde(default = "default_max_active_roots")]
    pub max_active_roots: usize,
}

impl Default for RunsConfig {
    fn default() -> Self {
        Self {
            max_active_roots: default_max_active_roots(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_memory_index_every_ms() -> u64 {
    15 * 60 * 1000
}

fn default_max_active_roots() -> usize {
    1
}
