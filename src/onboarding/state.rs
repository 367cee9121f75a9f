//! Onboarding state machine — the funnel stages and per-entity timeline.

use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// The stages of the onboarding funnel.
///
/// Branching rather than linear: `WaitPayment` may be revisited after a
/// failed payment, and both `PaymentOk` and `WantJoin` follow a payment
/// confirmation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    New,
    IntroShown,
    WaitPayment,
    PaymentOk,
    WantJoin,
    Joined,
}

impl Stage {
    /// Every stage, in declaration order.
    pub const ALL: [Stage; 6] = [
        Stage::New,
        Stage::IntroShown,
        Stage::WaitPayment,
        Stage::PaymentOk,
        Stage::WantJoin,
        Stage::Joined,
    ];

    /// Whether `self → target` is one of the expected funnel edges.
    ///
    /// Unexpected edges are still applied by the coordinator; this only
    /// drives a warning.
    pub fn can_transition_to(&self, target: Stage) -> bool {
        use Stage::*;
        matches!(
            (self, target),
            (_, IntroShown)
                | (_, WaitPayment)
                | (WaitPayment, PaymentOk)
                | (WaitPayment, WantJoin)
                | (PaymentOk, WantJoin)
                | (PaymentOk, Joined)
                | (WantJoin, Joined)
        )
    }

    /// Stages whose entry time is persisted in the timeline.
    pub fn is_tracked(&self) -> bool {
        matches!(
            self,
            Self::WaitPayment | Self::PaymentOk | Self::WantJoin | Self::Joined
        )
    }

    /// Terminal stages cancel every outstanding nudge and schedule nothing.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::PaymentOk | Self::Joined)
    }

    /// The plan-tag grouping every message scheduled on entry to this stage.
    pub fn plan_tag(&self) -> &'static str {
        self.as_str()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "new",
            Self::IntroShown => "intro_shown",
            Self::WaitPayment => "wait_payment",
            Self::PaymentOk => "payment_ok",
            Self::WantJoin => "want_join",
            Self::Joined => "joined",
        }
    }

    /// Bit used by [`crate::onboarding::plan::StageSet`].
    pub(crate) const fn bit(self) -> u8 {
        1 << (self as u8)
    }
}

impl Default for Stage {
    fn default() -> Self {
        Self::New
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s)
            .ok_or_else(|| format!("unknown stage: {s}"))
    }
}

/// Current stage plus the latest recorded entry time of each tracked stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTimeline {
    pub current: Stage,
    #[serde(default)]
    pub entered_at: BTreeMap<Stage, DateTime<Utc>>,
}

impl StageTimeline {
    pub fn new(current: Stage) -> Self {
        Self {
            current,
            entered_at: BTreeMap::new(),
        }
    }

    /// Move to `stage`, recording `at` when the stage is tracked.
    ///
    /// Returns the timestamp that should be persisted, if any.
    pub fn record(&mut self, stage: Stage, at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.current = stage;
        if stage.is_tracked() {
            self.entered_at.insert(stage, at);
            Some(at)
        } else {
            None
        }
    }

    pub fn entered_at(&self, stage: Stage) -> Option<DateTime<Utc>> {
        self.entered_at.get(&stage).copied()
    }

    /// The most recently recorded transition.
    pub fn latest(&self) -> Option<(Stage, DateTime<Utc>)> {
        self.entered_at
            .iter()
            .max_by_key(|(_, at)| **at)
            .map(|(stage, at)| (*stage, *at))
    }
}
