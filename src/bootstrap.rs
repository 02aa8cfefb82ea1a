//! Transactional control-plane startup.
//!
//! [`bootstrap`] acquires the writer lock, opens every durable store,
//! wires the pipeline, mounts the configured adapters, and returns a
//! [`ControlPlane`] handle owning all of it. Any failure unwinds the
//! partial startup: the writer lock is a drop guard, so a bootstrap that
//! errors out releases it before the error propagates.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tracing::info;

use crate::adapters::discord::{DiscordAdapter, DiscordConfig};
use crate::adapters::editor::{EditorAdapter, EditorConfig};
use crate::adapters::fetch::{AttachmentFetcher, HttpAttachmentFetcher};
use crate::adapters::generation::{ReloadRequest, TelegramGenerationManager};
use crate::adapters::slack::{SlackAdapter, SlackConfig};
use crate::adapters::telegram::{
    TelegramAdapter, TelegramAdapterDeps, TelegramConfig, TelegramIngressQueue,
};
use crate::adapters::{AdapterAudit, ChannelAdapter};
use crate::attachments::{AttachmentPolicy, AttachmentStore};
use crate::config::Config;
use crate::identity::IdentityStore;
use crate::operator::broker::{BrokerConfig, OperatorBroker};
use crate::operator::{OperatorBackend, OperatorBridge};
use crate::outbox::dispatch::{OutboundTransport, OutboxDispatcher};
use crate::outbox::Outbox;
use crate::pipeline::{
    CommandPipeline, MutationExecutor, MutationOutcome, PipelineConfig, PipelineDeps,
    QueryExecutor, SessionLifecycle,
};
use crate::policy::PolicyEngine;
use crate::runqueue::coordinator::{NullRunSupervisor, RunQueueCoordinator, RunSupervisor};
use crate::runqueue::reconcile::AdmissionPolicy;
use crate::runqueue::{RunQueue, RunState};
use crate::store::{StoreLayout, WriterLock};
use crate::types::{Channel, Clock, CommandRecord, SystemClock};

/// Host-provided collaborators. Everything is optional; unset seams fall
/// back to built-in behaviour (read-only queries against control-plane
/// state, mutation seams that fail with an explicit reason).
pub struct HostSeams {
    /// Read-only command execution.
    pub queries: Option<Arc<dyn QueryExecutor>>,
    /// Mutation execution.
    pub mutations: Option<Arc<dyn MutationExecutor>>,
    /// `reload`/`update` lifecycle.
    pub lifecycle: Option<Arc<dyn SessionLifecycle>>,
    /// Run process supervisor.
    pub run_supervisor: Option<Arc<dyn RunSupervisor>>,
    /// Operator backend; chat stays disabled without one.
    pub operator_backend: Option<Arc<dyn OperatorBackend>>,
    /// Per-channel outbound transports.
    pub transports: HashMap<Channel, Arc<dyn OutboundTransport>>,
    /// Attachment downloader.
    pub attachment_fetcher: Option<Arc<dyn AttachmentFetcher>>,
    /// Clock override (tests).
    pub clock: Option<Arc<dyn Clock>>,
}

impl Default for HostSeams {
    fn default() -> Self {
        Self {
            queries: None,
            mutations: None,
            lifecycle: None,
            run_supervisor: None,
            operator_backend: None,
            transports: HashMap::new(),
            attachment_fetcher: None,
            clock: None,
        }
    }
}

/// The assembled control plane.
pub struct ControlPlane {
    /// Keeps the writer lock held for the process lifetime.
    _writer_lock: WriterLock,
    /// The command pipeline.
    pub pipeline: Arc<CommandPipeline>,
    /// The durable outbox.
    pub outbox: Arc<Outbox>,
    /// The outbox dispatcher.
    pub dispatcher: Arc<OutboxDispatcher>,
    /// The identity store.
    pub identity: Arc<IdentityStore>,
    /// The inbound attachment store.
    pub attachments: Arc<AttachmentStore>,
    /// The run-queue coordinator.
    pub run_coordinator: Arc<RunQueueCoordinator>,
    /// The telegram generation manager (present when telegram is enabled).
    pub telegram: Option<Arc<TelegramGenerationManager>>,
    /// Mounted non-telegram adapters.
    pub adapters: Vec<Arc<dyn ChannelAdapter>>,
    /// Shared adapter audit log.
    pub audit: Arc<AdapterAudit>,
}

impl ControlPlane {
    /// Orderly shutdown: dispatcher first, then adapters, then the
    /// active telegram generation. The writer lock releases on drop.
    pub async fn shutdown(&self) {
        self.dispatcher.stop().await;
        for adapter in &self.adapters {
            if let Err(e) = adapter.stop(false).await {
                tracing::warn!(error = %e, "adapter stop failed");
            }
        }
        if let Some(manager) = &self.telegram {
            if let Some(generation) = manager.active_generation().await {
                let _stop = generation.stop(false).await;
            }
        }
        info!("control plane shut down");
    }
}

/// Bring the control plane up against the given repository root.
pub async fn bootstrap(
    config: Config,
    repo_root: impl AsRef<Path>,
    seams: HostSeams,
) -> anyhow::Result<ControlPlane> {
    let repo_root = repo_root.as_ref();
    let layout = StoreLayout::for_repo(repo_root);
    let clock: Arc<dyn Clock> = seams.clock.unwrap_or_else(|| Arc::new(SystemClock));

    let writer_lock = WriterLock::acquire(layout.writer_lock(), clock.now_ms())
        .context("control plane writer lock")?;

    let identity =
        Arc::new(IdentityStore::open(layout.identities()).context("open identity store")?);
    let outbox = Arc::new(Outbox::open(layout.outbox()).await.context("open outbox")?);
    let run_queue = Arc::new(
        RunQueue::open(layout.run_queue())
            .await
            .context("open run queue")?,
    );
    let ingress = Arc::new(
        TelegramIngressQueue::open(layout.telegram_ingress())
            .await
            .context("open telegram ingress queue")?,
    );
    let attachments = Arc::new(
        AttachmentStore::open(
            AttachmentPolicy::default(),
            layout.attachments_dir(),
            layout.attachments_index(),
        )
        .context("open attachment store")?,
    );
    let audit = Arc::new(AdapterAudit::open(layout.adapter_audit()).context("open adapter audit")?);

    let policy = Arc::new(PolicyEngine::with_defaults());
    policy.set_mutations_enabled(config.ops.mutations_enabled);

    let admission = if config.runs.max_active_roots <= 1 {
        AdmissionPolicy::Sequential
    } else {
        AdmissionPolicy::Parallel {
            max_active_roots: config.runs.max_active_roots,
        }
    };
    let supervisor: Arc<dyn RunSupervisor> = seams
        .run_supervisor
        .unwrap_or_else(|| Arc::new(NullRunSupervisor));
    let run_coordinator = RunQueueCoordinator::new(
        run_queue.clone(),
        supervisor,
        None,
        admission,
        clock.clone(),
    );

    let operator = match (config.operator.enabled, seams.operator_backend) {
        (true, Some(backend)) => Some(Arc::new(OperatorBridge::new(backend))),
        _ => None,
    };
    let broker = OperatorBroker::new(BrokerConfig {
        run_triggers_enabled: config.operator.run_triggers_enabled,
        allowed_repo_roots: vec![repo_root.display().to_string()],
    });

    let mut chat_channels = HashSet::new();
    if config.adapters.telegram.enabled {
        chat_channels.insert(Channel::Telegram);
    }
    if config.adapters.slack.chat_enabled {
        chat_channels.insert(Channel::Slack);
    }
    if config.adapters.discord.chat_enabled {
        chat_channels.insert(Channel::Discord);
    }

    let queries = seams.queries.unwrap_or_else(|| {
        Arc::new(ControlPlaneQueries {
            run_queue: run_queue.clone(),
            outbox: outbox.clone(),
        })
    });
    let mutations = seams
        .mutations
        .unwrap_or_else(|| Arc::new(UnconfiguredSeam));
    let lifecycle = seams
        .lifecycle
        .unwrap_or_else(|| Arc::new(UnconfiguredSeam));

    let pipeline = Arc::new(CommandPipeline::new(PipelineDeps {
        config: PipelineConfig {
            chat_channels,
            ..PipelineConfig::default()
        },
        identity: identity.clone(),
        policy: policy.clone(),
        outbox: outbox.clone(),
        clock: clock.clone(),
        broker,
        operator,
        queries,
        mutations,
        lifecycle,
        runs: run_coordinator.clone(),
    }));

    let fetcher: Arc<dyn AttachmentFetcher> = seams
        .attachment_fetcher
        .unwrap_or_else(|| Arc::new(HttpAttachmentFetcher::new()));

    let repo_root_string = repo_root.display().to_string();
    let mut adapters: Vec<Arc<dyn ChannelAdapter>> = Vec::new();

    if config.adapters.slack.enabled {
        let mut slack_config = SlackConfig::new(
            config.adapters.slack.signing_secret.clone(),
            repo_root_string.clone(),
        );
        slack_config.bot_token = config.adapters.slack.bot_token.clone();
        adapters.push(Arc::new(SlackAdapter::new(
            slack_config,
            pipeline.clone(),
            audit.clone(),
            Some(attachments.clone()),
            Some(fetcher.clone()),
        )));
    }
    if config.adapters.discord.enabled {
        adapters.push(Arc::new(DiscordAdapter::new(
            DiscordConfig::new(
                config.adapters.discord.signing_secret.clone(),
                repo_root_string.clone(),
            ),
            pipeline.clone(),
            audit.clone(),
        )));
    }
    for (channel, settings) in [
        (Channel::Neovim, &config.adapters.neovim),
        (Channel::Vscode, &config.adapters.vscode),
        (Channel::Editor, &config.adapters.editor),
    ] {
        if settings.enabled {
            adapters.push(Arc::new(EditorAdapter::new(
                EditorConfig {
                    channel,
                    shared_secret: settings.shared_secret.clone(),
                    repo_root: repo_root_string.clone(),
                },
                pipeline.clone(),
                audit.clone(),
            )));
        }
    }

    let telegram = if config.adapters.telegram.enabled {
        let telegram_settings = config.adapters.telegram.clone();
        let factory_pipeline = pipeline.clone();
        let factory_audit = audit.clone();
        let factory_outbox = outbox.clone();
        let factory_ingress = ingress;
        let factory_clock = clock.clone();
        let factory_attachments = attachments.clone();
        let factory_fetcher = fetcher;
        let manager = Arc::new(TelegramGenerationManager::new(Box::new(
            move |generation_id, telegram_config| {
                TelegramAdapter::standby(TelegramAdapterDeps {
                    generation_id,
                    config: telegram_config,
                    pipeline: factory_pipeline.clone(),
                    audit: factory_audit.clone(),
                    outbox: factory_outbox.clone(),
                    ingress: factory_ingress.clone(),
                    clock: factory_clock.clone(),
                    attachments: Some(factory_attachments.clone()),
                    fetcher: Some(factory_fetcher.clone()),
                    health: None,
                })
            },
        )));
        let mut telegram_config = TelegramConfig::new(
            telegram_settings.webhook_secret.clone(),
            repo_root_string.clone(),
        );
        telegram_config.bot_token = telegram_settings.bot_token.clone();
        telegram_config.bot_username = telegram_settings.bot_username.clone();
        telegram_config.deferred_ingress = telegram_settings.deferred_ingress;
        let result = manager
            .reload(ReloadRequest {
                config: telegram_config,
                other_adapters_changed: false,
                reason: "bootstrap".to_owned(),
            })
            .await;
        if !result.ok {
            anyhow::bail!(
                "telegram adapter failed to start: {}",
                result.error.unwrap_or_else(|| "unknown".to_owned())
            );
        }
        Some(manager)
    } else {
        None
    };

    let dispatcher = OutboxDispatcher::new(outbox.clone(), seams.transports, clock);
    dispatcher.spawn();

    info!(
        repo_root = %repo_root.display(),
        adapters = adapters.len(),
        telegram = telegram.is_some(),
        "control plane started"
    );
    Ok(ControlPlane {
        _writer_lock: writer_lock,
        pipeline,
        outbox,
        dispatcher,
        identity,
        attachments,
        run_coordinator,
        telegram,
        adapters,
        audit,
    })
}

/// Built-in read-only queries over control-plane state. Issue queries
/// need the surrounding repository and fail until the host provides a
/// real executor.
struct ControlPlaneQueries {
    run_queue: Arc<RunQueue>,
    outbox: Arc<Outbox>,
}

#[async_trait]
impl QueryExecutor for ControlPlaneQueries {
    async fn execute_query(&self, command: &CommandRecord) -> Result<serde_json::Value, String> {
        match command.cli_command_kind.as_deref() {
            Some("help") => Ok(serde_json::json!({
                "summary": crate::pipeline::render::render_help(),
            })),
            Some("status") => {
                let pending = self
                    .outbox
                    .records(Some(crate::outbox::OutboxState::Pending))
                    .await
                    .len();
                let active = self
                    .run_queue
                    .list(Some(&[RunState::Active, RunState::WaitingReview]), None)
                    .await
                    .len();
                let queued = self.run_queue.list(Some(&[RunState::Queued]), None).await.len();
                Ok(serde_json::json!({
                    "summary": format!(
                        "{active} active run(s), {queued} queued, {pending} outbound pending"
                    ),
                    "outbox_pending": pending,
                    "runs_active": active,
                    "runs_queued": queued,
                }))
            }
            Some("run_list") => {
                let rows = self.run_queue.list(None, Some(50)).await;
                Ok(serde_json::json!({
                    "summary": format!("{} run(s)", rows.len()),
                    "runs": rows
                        .iter()
                        .map(|r| serde_json::json!({
                            "queue_id": r.queue_id,
                            "state": r.state,
                            "root_issue_id": r.root_issue_id,
                        }))
                        .collect::<Vec<_>>(),
                }))
            }
            Some("run_status") => {
                let Some(target) = command.run_root_id.as_deref() else {
                    let rows = self.run_queue.list(None, Some(50)).await;
                    return Ok(serde_json::json!({
                        "summary": format!("{} run(s) in queue", rows.len()),
                    }));
                };
                match self.run_queue.get(target).await {
                    Some(row) => Ok(serde_json::json!({
                        "summary": format!("run {} is {:?}", row.queue_id, row.state),
                        "queue_id": row.queue_id,
                        "state": row.state,
                        "last_progress": row.last_progress,
                    })),
                    None => Err("run_not_found".to_owned()),
                }
            }
            _ => Err("issue_store_unavailable".to_owned()),
        }
    }
}

/// Placeholder seam for hosts that have not wired executors yet.
struct UnconfiguredSeam;

#[async_trait]
impl MutationExecutor for UnconfiguredSeam {
    async fn execute_mutation(&self, _command: &CommandRecord) -> MutationOutcome {
        MutationOutcome::failed("mutation_executor_unconfigured")
    }
}

#[async_trait]
impl SessionLifecycle for UnconfiguredSeam {
    async fn reload(&self, _command: &CommandRecord) -> MutationOutcome {
        MutationOutcome::failed("lifecycle_unconfigured")
    }

    async fn update(&self, _command: &CommandRecord) -> MutationOutcome {
        MutationOutcome::failed("lifecycle_unconfigured")
    }
}
