//! Scheduler — turns a stage transition into batch cancellations and a
//! freshly scheduled batch.

use std::sync::Arc;

use chrono::{DateTime, FixedOffset, Utc};
use tracing::{debug, info};

use crate::error::ScheduleError;
use crate::nudges::model::{ScheduledMessage, reasons};
use crate::onboarding::plan::{MessagePlan, superseded_tags};
use crate::onboarding::state::Stage;
use crate::store::Database;

/// What one `on_stage_changed` call did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleOutcome {
    pub cancelled: usize,
    pub scheduled: usize,
}

/// Creates and bulk-cancels scheduled messages. The only writer of new rows.
pub struct Scheduler {
    store: Arc<dyn Database>,
    tz: FixedOffset,
}

impl Scheduler {
    pub fn new(store: Arc<dyn Database>, tz: FixedOffset) -> Self {
        Self { store, tz }
    }

    /// Apply the plan for `new` to `entity_id`, entered at `entered_at`.
    ///
    /// Terminal stages cancel every live row. Otherwise the superseded
    /// batches are cancelled and the new batch inserted in one repository
    /// transaction, so a (entity, plan-tag) pair never holds two live batches.
    pub async fn on_stage_changed(
        &self,
        entity_id: &str,
        old: Option<Stage>,
        new: Stage,
        entered_at: DateTime<Utc>,
    ) -> Result<ScheduleOutcome, ScheduleError> {
        if new.is_terminal() {
            let cancelled = self
                .store
                .cancel_all(entity_id, reasons::TERMINAL_STAGE)
                .await?;
            info!(entity_id = %entity_id, stage = %new, cancelled, "Terminal stage; outstanding nudges cancelled");
            return Ok(ScheduleOutcome {
                cancelled,
                scheduled: 0,
            });
        }

        let cancel_tags: Vec<&str> = superseded_tags(new).iter().map(|s| s.plan_tag()).collect();

        let Some(plan) = MessagePlan::for_stage(new) else {
            let cancelled = self
                .store
                .cancel_by_tag(entity_id, &cancel_tags, reasons::SUPERSEDED)
                .await?;
            debug!(entity_id = %entity_id, stage = %new, cancelled, "No plan for stage");
            return Ok(ScheduleOutcome {
                cancelled,
                scheduled: 0,
            });
        };

        // Resolve every due time before touching the store.
        let rows = self.build_batch(entity_id, plan, entered_at)?;
        let cancelled = self
            .store
            .replace_batch(entity_id, &cancel_tags, reasons::SUPERSEDED, &rows)
            .await?;

        info!(
            entity_id = %entity_id,
            from = ?old,
            stage = %new,
            tag = plan.tag(),
            cancelled,
            scheduled = rows.len(),
            "Nudge batch scheduled"
        );
        Ok(ScheduleOutcome {
            cancelled,
            scheduled: rows.len(),
        })
    }

    fn build_batch(
        &self,
        entity_id: &str,
        plan: MessagePlan,
        entered_at: DateTime<Utc>,
    ) -> Result<Vec<ScheduledMessage>, ScheduleError> {
        plan.entries
            .iter()
            .map(|entry| -> Result<ScheduledMessage, ScheduleError> {
                let due = entry.delay.resolve(entered_at, &self.tz)?;
                Ok(
                    ScheduledMessage::new(entity_id, entry.content_ref, plan.tag(), due, entered_at)
                        .with_conditions(entry.required, entry.blocking),
                )
            })
            .collect()
    }
}
