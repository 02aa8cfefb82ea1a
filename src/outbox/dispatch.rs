//! Outbox dispatcher: the drain loop feeding per-channel transports.
//!
//! One long-running task queries due pending records, calls the
//! channel's transport, and applies the outcome back onto the outbox.
//! Records are processed sequentially, so attempts of the same record
//! never interleave. Producers wake the loop through
//! [`OutboxDispatcher::schedule_drain`]; otherwise it sleeps until the
//! next retry comes due.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tracing::{info, warn};

use crate::types::{Channel, Clock};

use super::{Outbox, OutboxError, OutboxRecord, OutboxState};

/// Idle poll ceiling when nothing is due.
const IDLE_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Outcome of one transport delivery attempt.
#[derive(Debug, Clone)]
pub enum DeliveryOutcome {
    /// The message reached the channel.
    Delivered,
    /// Transient failure; retry after the optional delay.
    Retry {
        /// What went wrong.
        error: String,
        /// Transport-suggested delay; default backoff when absent.
        delay_ms: Option<i64>,
    },
    /// Non-retryable failure; dead-letter immediately.
    PermanentFailure {
        /// Why the record can never deliver.
        reason: String,
    },
}

/// A per-channel outbound transport.
#[async_trait]
pub trait OutboundTransport: Send + Sync {
    /// Attempt to deliver one record.
    async fn deliver(&self, record: &OutboxRecord) -> DeliveryOutcome;
}

/// The drain loop.
pub struct OutboxDispatcher {
    outbox: Arc<Outbox>,
    transports: HashMap<Channel, Arc<dyn OutboundTransport>>,
    clock: Arc<dyn Clock>,
    notify: Arc<Notify>,
    stopped: AtomicBool,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl OutboxDispatcher {
    /// Dispatcher over the given transports.
    pub fn new(
        outbox: Arc<Outbox>,
        transports: HashMap<Channel, Arc<dyn OutboundTransport>>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new(Self {
            outbox,
            transports,
            clock,
            notify: Arc::new(Notify::new()),
            stopped: AtomicBool::new(false),
            task: Mutex::new(None),
        })
    }

    /// Wake the loop; producers call this after enqueueing.
    pub fn schedule_drain(&self) {
        self.notify.notify_one();
    }

    /// Handle producers can clone to wake the loop.
    pub fn drain_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.notify)
    }

    /// Process every due record once. Returns how many were attempted.
    pub async fn drain_once(&self) -> Result<usize, OutboxError> {
        let now = self.clock.now_ms();
        let due = self.outbox.due(now).await;
        let mut attempted = 0usize;
        for record in due {
            if self.stopped.load(Ordering::SeqCst) {
                break;
            }
            self.deliver_one(&record).await?;
            attempted = attempted.saturating_add(1);
        }
        Ok(attempted)
    }

    async fn deliver_one(&self, record: &OutboxRecord) -> Result<(), OutboxError> {
        let Some(transport) = self.transports.get(&record.envelope.channel) else {
            warn!(
                outbox_id = %record.outbox_id,
                channel = %record.envelope.channel,
                "no transport for channel"
            );
            self.outbox
                .mark_failure(
                    &record.outbox_id,
                    "no_transport_for_channel",
                    self.clock.now_ms(),
                    None,
                )
                .await?;
            return Ok(());
        };

        let outcome = transport.deliver(record).await;
        let now = self.clock.now_ms();
        match outcome {
            DeliveryOutcome::Delivered => {
                self.outbox.mark_delivered(&record.outbox_id, now).await?;
            }
            DeliveryOutcome::Retry { error, delay_ms } => {
                self.outbox
                    .mark_failure(&record.outbox_id, &error, now, delay_ms)
                    .await?;
            }
            DeliveryOutcome::PermanentFailure { reason } => {
                self.outbox
                    .mark_permanent_failure(&record.outbox_id, &reason, now)
                    .await?;
            }
        }
        Ok(())
    }

    /// Spawn the long-running drain task.
    pub fn spawn(self: &Arc<Self>) {
        let dispatcher = Arc::clone(self);
        let handle = tokio::spawn(async move {
            dispatcher.run().await;
        });
        if let Ok(mut slot) = self.task.try_lock() {
            *slot = Some(handle);
        }
    }

    async fn run(self: Arc<Self>) {
        info!("outbox dispatcher started");
        while !self.stopped.load(Ordering::SeqCst) {
            match self.drain_once().await {
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "outbox drain pass failed");
                }
            }
            let sleep = self.time_to_next_attempt().await.unwrap_or(IDLE_POLL_INTERVAL);
            tokio::select! {
                () = self.notify.notified() => {}
                () = tokio::time::sleep(sleep) => {}
            }
        }
        info!("outbox dispatcher stopped");
    }

    async fn time_to_next_attempt(&self) -> Option<Duration> {
        let now = self.clock.now_ms();
        let pending = self.outbox.records(Some(OutboxState::Pending)).await;
        let next = pending.first()?;
        let wait_ms = next.next_attempt_at_ms.saturating_sub(now).max(0);
        let wait = u64::try_from(wait_ms).unwrap_or(u64::MAX);
        Some(Duration::from_millis(wait).min(IDLE_POLL_INTERVAL.saturating_mul(4)))
    }

    /// Stop the loop and wait briefly for the task to exit.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        self.notify.notify_one();
        let handle = self.task.lock().await.take();
        if let Some(handle) = handle {
            if tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .is_err()
            {
                warn!("outbox dispatcher did not stop in time");
            }
        }
    }
}
