//! StageTransitionCoordinator — the single entry point that moves an entity
//! through the funnel and hands the transition to the scheduler.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::error::{DatabaseError, Error};
use crate::nudges::model::ScheduledMessage;
use crate::nudges::scheduler::Scheduler;
use crate::store::Database;

use super::state::{Stage, StageTimeline};

/// Coordinates stage writes and scheduling for every entity.
///
/// Transitions for the same entity are serialized; different entities
/// proceed concurrently.
pub struct StageTransitionCoordinator {
    db: Arc<dyn Database>,
    scheduler: Arc<Scheduler>,
    entity_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl StageTransitionCoordinator {
    pub fn new(db: Arc<dyn Database>, scheduler: Arc<Scheduler>) -> Self {
        Self {
            db,
            scheduler,
            entity_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Register an entity at `new` if it is not known yet.
    pub async fn ensure_entity(&self, entity_id: &str) -> Result<bool, Error> {
        let created = self.db.ensure_entity(entity_id, Stage::New).await?;
        if created {
            tracing::info!(entity_id = %entity_id, "Entity registered");
        }
        Ok(created)
    }

    pub async fn timeline(&self, entity_id: &str) -> Result<Option<StageTimeline>, Error> {
        Ok(self.db.get_timeline(entity_id).await?)
    }

    /// Audit trail of every nudge ever scheduled for the entity.
    pub async fn scheduled_messages(&self, entity_id: &str) -> Result<Vec<ScheduledMessage>, Error> {
        Ok(self.db.list_scheduled(entity_id).await?)
    }

    /// Move `entity_id` to `stage` now. Returns whether anything changed.
    pub async fn advance(&self, entity_id: &str, stage: Stage) -> Result<bool, Error> {
        self.advance_at(entity_id, stage, Utc::now()).await
    }

    /// Move `entity_id` to `stage` as of `now`.
    ///
    /// Advancing to the current stage is a no-op. The stage write is the
    /// only fallible part: scheduling errors are logged and the stage stays
    /// written, so the next transition is the retry path.
    pub async fn advance_at(
        &self,
        entity_id: &str,
        stage: Stage,
        now: DateTime<Utc>,
    ) -> Result<bool, Error> {
        let lock = self.entity_lock(entity_id).await;
        let changed = {
            let _guard = lock.lock().await;
            self.advance_locked(entity_id, stage, now).await
        };
        drop(lock);
        self.release_entity_lock(entity_id).await;
        changed
    }

    async fn advance_locked(
        &self,
        entity_id: &str,
        stage: Stage,
        now: DateTime<Utc>,
    ) -> Result<bool, Error> {
        let current = self
            .db
            .get_stage(entity_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "entity".to_string(),
                id: entity_id.to_string(),
            })?;

        if current == stage {
            tracing::debug!(entity_id = %entity_id, stage = %stage, "Already at stage");
            return Ok(false);
        }
        if !current.can_transition_to(stage) {
            tracing::warn!(
                entity_id = %entity_id,
                from = %current,
                to = %stage,
                "Unexpected stage transition; applying anyway"
            );
        }

        let tracked_at = stage.is_tracked().then_some(now);
        self.db.set_stage(entity_id, stage, tracked_at).await?;
        tracing::info!(entity_id = %entity_id, from = %current, to = %stage, "Stage advanced");

        if let Err(e) = self
            .scheduler
            .on_stage_changed(entity_id, Some(current), stage, now)
            .await
        {
            tracing::error!(
                entity_id = %entity_id,
                stage = %stage,
                "Scheduling failed after stage change: {e}"
            );
        }

        Ok(true)
    }

    async fn entity_lock(&self, entity_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.entity_locks.lock().await;
        locks.entry(entity_id.to_string()).or_default().clone()
    }

    /// Drop the per-entity lock once nobody else holds or waits on it.
    async fn release_entity_lock(&self, entity_id: &str) {
        let mut locks = self.entity_locks.lock().await;
        if locks
            .get(entity_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(entity_id);
        }
    }
}
