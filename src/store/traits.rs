//! Unified `Database` trait — single async interface for all persistence.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::nudges::model::{MessageStatus, ScheduledMessage};
use crate::onboarding::state::{Stage, StageTimeline};

/// Backend-agnostic repository for entities and their scheduled messages.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Entities ────────────────────────────────────────────────────

    /// Create the entity at `initial` if it does not exist yet.
    /// Returns whether a row was created.
    async fn ensure_entity(&self, id: &str, initial: Stage) -> Result<bool, DatabaseError>;

    /// The entity's current stage, or `None` if it does not exist.
    async fn get_stage(&self, id: &str) -> Result<Option<Stage>, DatabaseError>;

    /// Current stage plus the recorded per-stage timestamps.
    async fn get_timeline(&self, id: &str) -> Result<Option<StageTimeline>, DatabaseError>;

    /// Persist a new current stage, recording `tracked_at` for that stage
    /// when given. Fails with `NotFound` for unknown entities.
    async fn set_stage(
        &self,
        id: &str,
        stage: Stage,
        tracked_at: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError>;

    // ── Scheduled messages ──────────────────────────────────────────

    /// Insert one scheduled message.
    async fn create_scheduled(&self, msg: &ScheduledMessage) -> Result<(), DatabaseError>;

    /// Cancel every still-scheduled row of the entity whose plan-tag is in `tags`.
    /// Returns the number of rows cancelled.
    async fn cancel_by_tag(
        &self,
        entity_id: &str,
        tags: &[&str],
        reason: &str,
    ) -> Result<usize, DatabaseError>;

    /// Cancel `cancel_tags` and insert `new_rows` in one transaction.
    /// Returns the number of rows cancelled.
    async fn replace_batch(
        &self,
        entity_id: &str,
        cancel_tags: &[&str],
        reason: &str,
        new_rows: &[ScheduledMessage],
    ) -> Result<usize, DatabaseError>;

    /// Cancel every still-scheduled row of the entity.
    async fn cancel_all(&self, entity_id: &str, reason: &str) -> Result<usize, DatabaseError>;

    /// Claim up to `limit` due rows, oldest first.
    ///
    /// A claimed row stays `Scheduled` but is hidden from other claimers
    /// until `now + lease`; if it is never resolved it becomes claimable again.
    /// Claimed rows that cannot be decoded are marked `Failed` instead of
    /// being returned.
    async fn fetch_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<ScheduledMessage>, DatabaseError>;

    /// Extend a claim that still reads `held_until` to `until`.
    ///
    /// Returns `false` when the row was resolved, or re-claimed by another
    /// dispatcher after the original lease expired.
    async fn renew_claim(
        &self,
        id: Uuid,
        held_until: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Move a still-scheduled row to a terminal status.
    /// Returns `false` when the row was no longer scheduled.
    async fn update_status(
        &self,
        id: Uuid,
        status: MessageStatus,
        reason: Option<&str>,
    ) -> Result<bool, DatabaseError>;

    /// Get a scheduled message by ID.
    async fn get_scheduled(&self, id: Uuid) -> Result<Option<ScheduledMessage>, DatabaseError>;

    /// Every row for the entity, ordered by due time.
    async fn list_scheduled(&self, entity_id: &str)
    -> Result<Vec<ScheduledMessage>, DatabaseError>;
}
