//! Dispatcher — background drain of due nudges.
//!
//! Each cycle claims due rows from the store, re-checks every row against
//! the entity's *live* stage, and delivers survivors through the notifier
//! with bounded concurrency. A row's lease is renewed when it gets a send
//! permit, so rows queued behind the concurrency limit are never picked up
//! by a second dispatcher. Every row ends in exactly one terminal status
//! unless a repository error leaves it claimed, in which case it becomes
//! claimable again once the lease expires.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::channels::Notifier;
use crate::error::DatabaseError;
use crate::nudges::model::{MessageStatus, ScheduledMessage, reasons};
use crate::onboarding::state::Stage;
use crate::store::Database;

/// Tuning for the dispatch loop.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub poll_interval: Duration,
    pub batch_limit: usize,
    pub max_concurrent_sends: usize,
    pub send_timeout: Duration,
    /// Renewed per row just before delivery. Must exceed `send_timeout`,
    /// or a slow send can be claimed twice.
    pub claim_lease: Duration,
    /// Rows overdue by more than this are cancelled instead of sent.
    pub max_lateness: Option<Duration>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            batch_limit: 100,
            max_concurrent_sends: 8,
            send_timeout: Duration::from_secs(30),
            claim_lease: Duration::from_secs(300),
            max_lateness: None,
        }
    }
}

/// Tally of one dispatch cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub claimed: usize,
    pub sent: usize,
    pub cancelled: usize,
    pub failed: usize,
    /// Rows left claimed (repository error, lost race, panicked task).
    pub deferred: usize,
}

impl DispatchReport {
    fn record(&mut self, outcome: RowOutcome) {
        match outcome {
            RowOutcome::Sent => self.sent += 1,
            RowOutcome::Cancelled => self.cancelled += 1,
            RowOutcome::Failed => self.failed += 1,
            RowOutcome::Deferred => self.deferred += 1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowOutcome {
    Sent,
    Cancelled,
    Failed,
    Deferred,
}

/// Decision for one due row, before any delivery is attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Verdict {
    Deliver,
    Cancel(&'static str),
    Fail(&'static str),
}

/// Re-validate a due row against the live stage.
pub(crate) fn evaluate(
    msg: &ScheduledMessage,
    live: Option<Stage>,
    now: DateTime<Utc>,
    max_lateness: Option<Duration>,
) -> Verdict {
    let Some(live) = live else {
        return Verdict::Fail(reasons::ENTITY_NOT_FOUND);
    };
    if let Some(max) = max_lateness {
        let late = (now - msg.scheduled_at).to_std().unwrap_or_default();
        if late > max {
            return Verdict::Cancel(reasons::STALE);
        }
    }
    if !msg.required.is_empty() && !msg.required.contains(live) {
        return Verdict::Cancel(reasons::STAGE_ADVANCED);
    }
    if msg.blocking.contains(live) {
        return Verdict::Cancel(reasons::STAGE_BLOCKED);
    }
    Verdict::Deliver
}

pub struct Dispatcher {
    store: Arc<dyn Database>,
    notifier: Arc<dyn Notifier>,
    config: DispatcherConfig,
    permits: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn Database>,
        notifier: Arc<dyn Notifier>,
        config: DispatcherConfig,
    ) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_concurrent_sends.max(1)));
        Self {
            store,
            notifier,
            config,
            permits,
        }
    }

    /// Claim and resolve one batch of due rows.
    ///
    /// Only the claim itself can fail the cycle; per-row problems are
    /// logged and counted.
    pub async fn run_once(
        self: &Arc<Self>,
        now: DateTime<Utc>,
    ) -> Result<DispatchReport, DatabaseError> {
        let lease = chrono::Duration::from_std(self.config.claim_lease)
            .map_err(|e| DatabaseError::Query(format!("claim lease: {e}")))?;
        let due = self
            .store
            .fetch_due(now, self.config.batch_limit, self.config.claim_lease)
            .await?;

        let mut report = DispatchReport {
            claimed: due.len(),
            ..Default::default()
        };
        if due.is_empty() {
            return Ok(report);
        }
        debug!(claimed = due.len(), "Dispatch cycle started");

        let started = Instant::now();
        let mut tasks: JoinSet<RowOutcome> = JoinSet::new();
        for msg in due {
            let this = Arc::clone(self);
            tasks.spawn(async move {
                let Ok(_permit) = this.permits.clone().acquire_owned().await else {
                    return RowOutcome::Deferred;
                };
                let waited = chrono::Duration::from_std(started.elapsed())
                    .unwrap_or_else(|_| chrono::Duration::zero());
                if !this.renew_claim(&msg, now + waited + lease).await {
                    return RowOutcome::Deferred;
                }
                this.dispatch_one(msg, now).await
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => report.record(outcome),
                Err(e) => {
                    error!("Dispatch task aborted: {e}");
                    report.deferred += 1;
                }
            }
        }

        Ok(report)
    }

    /// Re-stamp the row's lease before working on it. `false` means another
    /// dispatcher owns the row now, or it was resolved meanwhile.
    async fn renew_claim(&self, msg: &ScheduledMessage, until: DateTime<Utc>) -> bool {
        let Some(held_until) = msg.claimed_until else {
            warn!(message_id = %msg.id, "Due row came back without a claim");
            return false;
        };
        match self.store.renew_claim(msg.id, held_until, until).await {
            Ok(true) => true,
            Ok(false) => {
                debug!(message_id = %msg.id, entity_id = %msg.entity_id, "Claim lost before delivery");
                false
            }
            Err(e) => {
                error!(message_id = %msg.id, entity_id = %msg.entity_id, "Claim renewal failed: {e}");
                false
            }
        }
    }

    async fn dispatch_one(&self, msg: ScheduledMessage, now: DateTime<Utc>) -> RowOutcome {
        let live = match self.store.get_stage(&msg.entity_id).await {
            Ok(stage) => stage,
            Err(e) => {
                error!(message_id = %msg.id, entity_id = %msg.entity_id, "Stage lookup failed: {e}");
                return RowOutcome::Deferred;
            }
        };

        match evaluate(&msg, live, now, self.config.max_lateness) {
            Verdict::Fail(reason) => {
                warn!(message_id = %msg.id, entity_id = %msg.entity_id, reason, "Nudge failed before delivery");
                self.resolve(&msg, MessageStatus::Failed, Some(reason), RowOutcome::Failed)
                    .await
            }
            Verdict::Cancel(reason) => {
                debug!(
                    message_id = %msg.id,
                    entity_id = %msg.entity_id,
                    live = ?live,
                    reason,
                    "Nudge no longer applies"
                );
                self.resolve(&msg, MessageStatus::Cancelled, Some(reason), RowOutcome::Cancelled)
                    .await
            }
            Verdict::Deliver => self.deliver(&msg).await,
        }
    }

    async fn deliver(&self, msg: &ScheduledMessage) -> RowOutcome {
        let send = self.notifier.send(&msg.entity_id, &msg.content_ref);
        match tokio::time::timeout(self.config.send_timeout, send).await {
            Ok(Ok(())) => {
                info!(
                    message_id = %msg.id,
                    entity_id = %msg.entity_id,
                    content_ref = %msg.content_ref,
                    channel = self.notifier.name(),
                    "Nudge sent"
                );
                self.resolve(msg, MessageStatus::Sent, None, RowOutcome::Sent)
                    .await
            }
            Ok(Err(e)) => {
                let reason = e.to_string();
                warn!(message_id = %msg.id, entity_id = %msg.entity_id, "Nudge delivery failed: {reason}");
                self.resolve(msg, MessageStatus::Failed, Some(reason.as_str()), RowOutcome::Failed)
                    .await
            }
            Err(_) => {
                let reason = format!("send timed out after {:?}", self.config.send_timeout);
                warn!(message_id = %msg.id, entity_id = %msg.entity_id, "{reason}");
                self.resolve(msg, MessageStatus::Failed, Some(reason.as_str()), RowOutcome::Failed)
                    .await
            }
        }
    }

    async fn resolve(
        &self,
        msg: &ScheduledMessage,
        status: MessageStatus,
        reason: Option<&str>,
        outcome: RowOutcome,
    ) -> RowOutcome {
        match self.store.update_status(msg.id, status, reason).await {
            Ok(true) => outcome,
            Ok(false) => {
                // Bulk-cancelled by a stage change while we were working on it.
                if status == MessageStatus::Sent {
                    warn!(message_id = %msg.id, entity_id = %msg.entity_id, "Nudge delivered after its batch was cancelled");
                } else {
                    debug!(message_id = %msg.id, "Row already resolved");
                }
                RowOutcome::Deferred
            }
            Err(e) => {
                error!(message_id = %msg.id, status = %status, "Failed to record nudge status: {e}");
                RowOutcome::Deferred
            }
        }
    }
}

/// Run the dispatcher every `poll_interval` until `shutdown` fires.
///
/// The first cycle runs immediately, picking up anything left claimed by a
/// previous process once its lease has expired. A cycle in progress when
/// shutdown is requested runs to completion.
pub fn spawn_dispatcher(
    dispatcher: Arc<Dispatcher>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(dispatcher.config.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            poll_secs = dispatcher.config.poll_interval.as_secs(),
            batch_limit = dispatcher.config.batch_limit,
            max_concurrent_sends = dispatcher.config.max_concurrent_sends,
            "Dispatcher started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown signal received, stopping dispatcher");
                    break;
                }

                _ = interval.tick() => {
                    match dispatcher.run_once(Utc::now()).await {
                        Ok(report) if report.claimed > 0 => {
                            info!(
                                claimed = report.claimed,
                                sent = report.sent,
                                cancelled = report.cancelled,
                                failed = report.failed,
                                deferred = report.deferred,
                                "Dispatch cycle complete"
                            );
                        }
                        Ok(_) => {}
                        Err(e) => error!("Dispatch cycle failed: {e}"),
                    }
                }
            }
        }
    })
}
