//! Identity store: operator↔channel bindings.
//!
//! Bindings are the sole source of truth for capability scopes; there are
//! no dynamic grants. State is a single JSONL log of link/unlink events;
//! the live view keeps at most one active binding per
//! `(channel, tenant, actor)` key.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::store::{JournalRecord, JsonlJournal, StorageError};
use crate::types::{mint_id, AssuranceTier, Channel};

/// One operator↔channel binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityBinding {
    /// Stable binding id (`idb-` prefixed).
    pub binding_id: String,
    /// Operator this binding belongs to.
    pub operator_id: String,
    /// Channel the binding covers.
    pub channel: Channel,
    /// Tenant within the channel.
    pub channel_tenant_id: String,
    /// Channel-native actor id.
    pub channel_actor_id: String,
    /// Capability dot-paths granted by this binding.
    pub scopes: BTreeSet<String>,
    /// Identity strength of the binding.
    pub assurance_tier: AssuranceTier,
    /// False once unlinked.
    pub active: bool,
    /// When the binding was created (ms).
    pub created_at_ms: i64,
    /// When the binding last changed (ms).
    pub updated_at_ms: i64,
    /// Monotone per-binding revision.
    pub revision: u64,
}

impl JournalRecord for IdentityBinding {
    fn primary_key(&self) -> &str {
        &self.binding_id
    }

    fn sort_key(&self) -> (i64, u64) {
        (self.updated_at_ms, self.revision)
    }
}

/// Parameters for linking a new binding.
#[derive(Debug, Clone)]
pub struct LinkParams {
    /// Operator to bind.
    pub operator_id: String,
    /// Channel the binding covers.
    pub channel: Channel,
    /// Tenant within the channel.
    pub channel_tenant_id: String,
    /// Channel-native actor id.
    pub channel_actor_id: String,
    /// Scopes to grant.
    pub scopes: BTreeSet<String>,
    /// Identity strength.
    pub assurance_tier: AssuranceTier,
}

/// Identity store errors.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    /// Underlying journal failure.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// No binding with the given id.
    #[error("binding not found: {0}")]
    NotFound(String),
}

/// Journal-backed identity store.
pub struct IdentityStore {
    journal: JsonlJournal<IdentityBinding>,
}

impl IdentityStore {
    /// Open the store at the given journal path.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, StorageError> {
        Ok(Self {
            journal: JsonlJournal::open(path)?,
        })
    }

    /// In-memory store for testing.
    pub fn in_memory() -> Self {
        Self {
            journal: JsonlJournal::in_memory(),
        }
    }

    /// Link a binding, deactivating any previous active binding for the
    /// same `(channel, tenant, actor)` key first.
    pub async fn link(
        &self,
        params: LinkParams,
        now_ms: i64,
    ) -> Result<IdentityBinding, IdentityError> {
        if let Some(existing) = self
            .resolve_active(
                params.channel,
                &params.channel_tenant_id,
                &params.channel_actor_id,
            )
            .await
        {
            self.unlink(&existing.binding_id, now_ms).await?;
        }
        let binding = IdentityBinding {
            binding_id: mint_id("idb"),
            operator_id: params.operator_id,
            channel: params.channel,
            channel_tenant_id: params.channel_tenant_id,
            channel_actor_id: params.channel_actor_id,
            scopes: params.scopes,
            assurance_tier: params.assurance_tier,
            active: true,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            revision: 1,
        };
        self.journal.append(binding.clone()).await?;
        info!(
            binding_id = %binding.binding_id,
            operator_id = %binding.operator_id,
            channel = %binding.channel,
            "identity binding linked"
        );
        Ok(binding)
    }

    /// Deactivate a binding.
    pub async fn unlink(&self, binding_id: &str, now_ms: i64) -> Result<(), IdentityError> {
        let mut binding = self
            .journal
            .get(binding_id)
            .await
            .ok_or_else(|| IdentityError::NotFound(binding_id.to_owned()))?;
        binding.active = false;
        binding.updated_at_ms = now_ms;
        binding.revision = binding.revision.saturating_add(1);
        self.journal.append(binding).await?;
        info!(binding_id, "identity binding unlinked");
        Ok(())
    }

    /// Latest active binding for a `(channel, tenant, actor)` key.
    pub async fn resolve_active(
        &self,
        channel: Channel,
        tenant_id: &str,
        actor_id: &str,
    ) -> Option<IdentityBinding> {
        self.journal
            .snapshot()
            .await
            .into_iter()
            .filter(|b| {
                b.active
                    && b.channel == channel
                    && b.channel_tenant_id == tenant_id
                    && b.channel_actor_id == actor_id
            })
            .max_by_key(|b| b.sort_key())
    }

    /// All bindings, optionally including inactive ones.
    pub async fn list_bindings(&self, include_inactive: bool) -> Vec<IdentityBinding> {
        let mut rows: Vec<IdentityBinding> = self
            .journal
            .snapshot()
            .await
            .into_iter()
            .filter(|b| include_inactive || b.active)
            .collect();
        rows.sort_by(|a, b| a.created_at_ms.cmp(&b.created_at_ms));
        rows
    }
}

/// Static fallback tier when no binding exists for a channel actor.
pub fn assurance_tier_for_channel(channel: Channel) -> AssuranceTier {
    match channel {
        Channel::Slack | Channel::Discord => AssuranceTier::TierA,
        Channel::Telegram | Channel::Neovim | Channel::Vscode | Channel::Editor => {
            AssuranceTier::TierB
        }
    }
}
