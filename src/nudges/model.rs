//! Scheduled message rows — the persisted audit trail of every nudge.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::onboarding::plan::StageSet;

/// Lifecycle of a scheduled message. Every state but `Scheduled` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Scheduled,
    Sent,
    Cancelled,
    Failed,
}

impl MessageStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Scheduled)
    }
}

impl std::fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MessageStatus::Scheduled => write!(f, "scheduled"),
            MessageStatus::Sent => write!(f, "sent"),
            MessageStatus::Cancelled => write!(f, "cancelled"),
            MessageStatus::Failed => write!(f, "failed"),
        }
    }
}

impl FromStr for MessageStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "scheduled" => Ok(MessageStatus::Scheduled),
            "sent" => Ok(MessageStatus::Sent),
            "cancelled" => Ok(MessageStatus::Cancelled),
            "failed" => Ok(MessageStatus::Failed),
            other => Err(format!("unknown message status: {other}")),
        }
    }
}

/// Reasons recorded on terminal rows.
pub mod reasons {
    pub const ENTITY_NOT_FOUND: &str = "entity not found";
    pub const STAGE_ADVANCED: &str = "stage advanced";
    pub const STAGE_BLOCKED: &str = "stage blocked";
    pub const STALE: &str = "stale";
    pub const SUPERSEDED: &str = "superseded";
    pub const TERMINAL_STAGE: &str = "terminal stage";
}

/// One nudge, scheduled for one entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledMessage {
    pub id: Uuid,
    pub entity_id: String,
    pub content_ref: String,
    /// Plan-tag of the batch this row belongs to.
    pub plan_tag: String,
    pub required: StageSet,
    pub blocking: StageSet,
    pub scheduled_at: DateTime<Utc>,
    pub status: MessageStatus,
    pub failure_reason: Option<String>,
    pub sent_at: Option<DateTime<Utc>>,
    /// Dispatcher claim; the row is invisible to other claimers until then.
    pub claimed_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ScheduledMessage {
    pub fn new(
        entity_id: &str,
        content_ref: &str,
        plan_tag: &str,
        scheduled_at: DateTime<Utc>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_id: entity_id.to_string(),
            content_ref: content_ref.to_string(),
            plan_tag: plan_tag.to_string(),
            required: StageSet::EMPTY,
            blocking: StageSet::EMPTY,
            scheduled_at,
            status: MessageStatus::Scheduled,
            failure_reason: None,
            sent_at: None,
            claimed_until: None,
            created_at,
            updated_at: created_at,
        }
    }

    pub fn with_conditions(mut self, required: StageSet, blocking: StageSet) -> Self {
        self.required = required;
        self.blocking = blocking;
        self
    }
}
