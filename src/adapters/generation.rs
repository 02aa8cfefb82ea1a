//! Telegram generation manager: warm-standby config swaps.
//!
//! Exactly one generation of the Telegram adapter accepts ingress at a
//! time. When a reload changes only Telegram fields, a standby
//! generation is instantiated and taken through warmup → cutover →
//! drain; a post-cutover health failure rolls back to the previous
//! generation. Changes touching other adapters are refused
//! (`handled = false`): the caller must reload the whole control plane.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};

use super::telegram::{TelegramAdapter, TelegramConfig};
use super::{AdapterError, ChannelAdapter};

/// Default warmup timeout.
pub const DEFAULT_WARMUP_TIMEOUT: Duration = Duration::from_secs(2);

/// Default drain timeout for the outgoing generation.
pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Rollback / failure triggers.
pub mod trigger {
    /// The standby failed warmup (including warmup timeout).
    pub const WARMUP_FAILED: &str = "warmup_failed";
    /// The standby failed its pre-cutover health gate.
    pub const HEALTH_GATE_FAILED: &str = "health_gate_failed";
    /// Activation of the standby failed.
    pub const CUTOVER_FAILED: &str = "cutover_failed";
    /// The new generation failed health after taking ingress.
    pub const POST_CUTOVER_HEALTH_FAILED: &str = "post_cutover_health_failed";
    /// Rollback was needed but no previous generation existed.
    pub const ROLLBACK_UNAVAILABLE: &str = "rollback_unavailable";
}

/// Builds one adapter generation from a config.
pub type GenerationFactory =
    Box<dyn Fn(String, TelegramConfig) -> Arc<TelegramAdapter> + Send + Sync>;

/// A reload request.
#[derive(Debug, Clone)]
pub struct ReloadRequest {
    /// The Telegram configuration to converge on.
    pub config: TelegramConfig,
    /// Whether the config delta touches non-Telegram adapters.
    pub other_adapters_changed: bool,
    /// Human-readable reason, for the audit trail.
    pub reason: String,
}

/// What a rollback looked like.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RollbackInfo {
    /// Which gate tripped.
    pub trigger: &'static str,
}

/// Outcome of one reload.
#[derive(Debug, Clone)]
pub struct ReloadResult {
    /// Whether the reload converged on the requested config.
    pub ok: bool,
    /// Whether the manager handled the request at all.
    pub handled: bool,
    /// The generation accepting ingress after the reload.
    pub active_generation: Option<String>,
    /// The generation that was active before.
    pub from_generation: Option<String>,
    /// The generation the reload tried to activate.
    pub to_generation: Option<String>,
    /// Rollback details, when one happened.
    pub rollback: Option<RollbackInfo>,
    /// Failure reason, when not ok.
    pub error: Option<String>,
}

/// The manager.
pub struct TelegramGenerationManager {
    factory: GenerationFactory,
    active: Mutex<Option<Arc<TelegramAdapter>>>,
    seq: AtomicU64,
    warmup_timeout: Duration,
    drain_timeout: Duration,
}

impl TelegramGenerationManager {
    /// Manager with default timeouts.
    pub fn new(factory: GenerationFactory) -> Self {
        Self::with_timeouts(factory, DEFAULT_WARMUP_TIMEOUT, DEFAULT_DRAIN_TIMEOUT)
    }

    /// Manager with explicit warmup/drain timeouts.
    pub fn with_timeouts(
        factory: GenerationFactory,
        warmup_timeout: Duration,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            factory,
            active: Mutex::new(None),
            seq: AtomicU64::new(0),
            warmup_timeout,
            drain_timeout,
        }
    }

    /// The currently active generation, if any.
    pub async fn active_generation(&self) -> Option<Arc<TelegramAdapter>> {
        self.active.lock().await.clone()
    }

    fn next_generation_id(&self) -> String {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst).saturating_add(1);
        format!("telegram-adapter-gen-{seq}")
    }

    /// Converge the Telegram adapter on a new configuration.
    pub async fn reload(&self, request: ReloadRequest) -> ReloadResult {
        if request.other_adapters_changed {
            return ReloadResult {
                ok: false,
                handled: false,
                active_generation: self
                    .active_generation()
                    .await
                    .map(|g| g.generation_id().to_owned()),
                from_generation: None,
                to_generation: None,
                rollback: None,
                error: Some("non_telegram_config_changed".to_owned()),
            };
        }

        let mut active = self.active.lock().await;
        let previous = active.clone();
        let from_generation = previous.as_ref().map(|g| g.generation_id().to_owned());

        if let Some(current) = previous.as_ref() {
            if current.config() == &request.config {
                return ReloadResult {
                    ok: true,
                    handled: true,
                    active_generation: from_generation.clone(),
                    from_generation,
                    to_generation: None,
                    rollback: None,
                    error: None,
                };
            }
        }

        let generation_id = self.next_generation_id();
        info!(
            generation = %generation_id,
            reason = %request.reason,
            "telegram generation swap starting"
        );
        let standby = (self.factory)(generation_id.clone(), request.config);

        // Warmup gate, bounded by the warmup timeout.
        let warmup = tokio::time::timeout(self.warmup_timeout, standby.warmup()).await;
        let warmup_error = match warmup {
            Ok(Ok(())) => None,
            Ok(Err(AdapterError::HealthFailed(e))) => {
                Some((trigger::HEALTH_GATE_FAILED, e))
            }
            Ok(Err(e)) => Some((trigger::WARMUP_FAILED, e.to_string())),
            Err(_) => Some((
                trigger::WARMUP_FAILED,
                "telegram_warmup_timeout".to_owned(),
            )),
        };
        if let Some((gate, detail)) = warmup_error {
            warn!(generation = %generation_id, gate, detail = %detail, "standby failed before cutover");
            let _stop = standby.stop(true).await;
            return ReloadResult {
                ok: false,
                handled: true,
                active_generation: from_generation.clone(),
                from_generation,
                to_generation: Some(generation_id),
                rollback: None,
                error: Some(gate.to_owned()),
            };
        }

        // Cutover: the standby takes ingress, the previous generation
        // refuses new work.
        standby.activate_ingress();
        standby.spawn_drain_loop();
        if let Some(old) = previous.as_ref() {
            old.begin_drain();
        }

        // Post-cutover health gate.
        if let Err(e) = standby.health_check().await {
            warn!(
                generation = %generation_id,
                error = %e,
                "post-cutover health failed, rolling back"
            );
            let Some(old) = previous.as_ref() else {
                let _stop = standby.stop(true).await;
                *active = None;
                return ReloadResult {
                    ok: false,
                    handled: true,
                    active_generation: None,
                    from_generation,
                    to_generation: Some(generation_id),
                    rollback: Some(RollbackInfo {
                        trigger: trigger::ROLLBACK_UNAVAILABLE,
                    }),
                    error: Some(e.to_string()),
                };
            };
            standby.begin_drain();
            let _stop = standby.stop(true).await;
            old.activate_ingress();
            return ReloadResult {
                ok: false,
                handled: true,
                active_generation: from_generation.clone(),
                from_generation,
                to_generation: Some(generation_id),
                rollback: Some(RollbackInfo {
                    trigger: trigger::POST_CUTOVER_HEALTH_FAILED,
                }),
                error: Some(e.to_string()),
            };
        }

        // Drain and stop the previous generation.
        if let Some(old) = previous {
            match old.drain(self.drain_timeout).await {
                Ok(()) => {
                    let _stop = old.stop(false).await;
                }
                Err(e) => {
                    warn!(
                        generation = old.generation_id(),
                        error = %e,
                        "drain timed out, force-stopping previous generation"
                    );
                    let _stop = old.stop(true).await;
                }
            }
        }

        *active = Some(standby);
        info!(generation = %generation_id, "telegram generation swap complete");
        ReloadResult {
            ok: true,
            handled: true,
            active_generation: Some(generation_id.clone()),
            from_generation,
            to_generation: Some(generation_id),
            rollback: None,
            error: None,
        }
    }
}
