//! Static message plans — which nudges each stage schedules, when, and
//! under which live stages they may still be delivered.

use std::time::Duration;

use chrono::{DateTime, Days, FixedOffset, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use super::state::Stage;
use crate::error::ScheduleError;

/// Nothing is ever scheduled further out than this from stage entry.
pub const MAX_HORIZON: Duration = Duration::from_secs(9 * 24 * 3600);

const HOUR: u64 = 3600;
const MINUTE: u64 = 60;

/// A typed set of stages.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct StageSet(u8);

impl StageSet {
    pub const EMPTY: StageSet = StageSet(0);

    pub const fn of(stages: &[Stage]) -> Self {
        let mut bits = 0u8;
        let mut i = 0;
        while i < stages.len() {
            bits |= stages[i].bit();
            i += 1;
        }
        StageSet(bits)
    }

    pub fn contains(&self, stage: Stage) -> bool {
        self.0 & stage.bit() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn insert(&mut self, stage: Stage) {
        self.0 |= stage.bit();
    }

    pub fn iter(&self) -> impl Iterator<Item = Stage> + '_ {
        Stage::ALL.into_iter().filter(|s| self.contains(*s))
    }
}

impl FromIterator<Stage> for StageSet {
    fn from_iter<I: IntoIterator<Item = Stage>>(iter: I) -> Self {
        let mut set = StageSet::EMPTY;
        for stage in iter {
            set.insert(stage);
        }
        set
    }
}

impl std::fmt::Debug for StageSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl Serialize for StageSet {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

impl<'de> Deserialize<'de> for StageSet {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let stages = Vec::<Stage>::deserialize(deserializer)?;
        Ok(stages.into_iter().collect())
    }
}

/// When a planned message becomes due, relative to stage entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelaySpec {
    /// A fixed delay after the stage was entered.
    AfterEntry(Duration),
    /// `day_offset` calendar days after entry, at `hour:minute` in the plan timezone.
    AtTimeOfDay {
        day_offset: u32,
        hour: u32,
        minute: u32,
    },
}

impl DelaySpec {
    /// Resolve the due time for a stage entered at `entry`.
    ///
    /// A time-of-day that would fall at or before `entry` rolls to the next day.
    pub fn resolve(
        &self,
        entry: DateTime<Utc>,
        tz: &FixedOffset,
    ) -> Result<DateTime<Utc>, ScheduleError> {
        let due = match *self {
            DelaySpec::AfterEntry(delay) => {
                let delay = chrono::Duration::from_std(delay)
                    .map_err(|_| ScheduleError::HorizonExceeded { delay })?;
                entry + delay
            }
            DelaySpec::AtTimeOfDay {
                day_offset,
                hour,
                minute,
            } => {
                let time = NaiveTime::from_hms_opt(hour, minute, 0)
                    .ok_or(ScheduleError::InvalidTimeOfDay { hour, minute })?;
                let date = entry
                    .with_timezone(tz)
                    .date_naive()
                    .checked_add_days(Days::new(u64::from(day_offset)))
                    .ok_or_else(|| ScheduleError::UnresolvableLocalTime(entry.to_rfc3339()))?;
                let local = tz
                    .from_local_datetime(&date.and_time(time))
                    .single()
                    .ok_or_else(|| ScheduleError::UnresolvableLocalTime(date.to_string()))?;
                let mut due = local.with_timezone(&Utc);
                if due <= entry {
                    due += chrono::Duration::days(1);
                }
                due
            }
        };

        let delay = (due - entry).to_std().unwrap_or_default();
        if delay > MAX_HORIZON {
            return Err(ScheduleError::HorizonExceeded { delay });
        }
        Ok(due)
    }
}

/// One nudge in a stage's plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanEntry {
    pub content_ref: &'static str,
    pub delay: DelaySpec,
    /// Live stages under which the nudge may be sent. Empty means any stage.
    pub required: StageSet,
    /// Live stages that veto the nudge.
    pub blocking: StageSet,
}

/// The static batch of nudges scheduled on entry to one stage.
#[derive(Debug, Clone, Copy)]
pub struct MessagePlan {
    pub stage: Stage,
    pub entries: &'static [PlanEntry],
}

impl MessagePlan {
    /// The plan scheduled when `stage` is entered, if it has one.
    pub fn for_stage(stage: Stage) -> Option<MessagePlan> {
        let entries: &'static [PlanEntry] = match stage {
            Stage::IntroShown => INTRO_SHOWN_PLAN,
            Stage::WaitPayment => WAIT_PAYMENT_PLAN,
            Stage::WantJoin => WANT_JOIN_PLAN,
            Stage::New | Stage::PaymentOk | Stage::Joined => return None,
        };
        Some(MessagePlan { stage, entries })
    }

    pub fn tag(&self) -> &'static str {
        self.stage.plan_tag()
    }
}

/// Plan-tags whose pending batches are cancelled when `entered` is entered.
///
/// Later stages subsume earlier ones, and every stage supersedes its own
/// tag so that re-entry replaces the batch.
pub fn superseded_tags(entered: Stage) -> &'static [Stage] {
    use Stage::*;
    match entered {
        New => &[New],
        IntroShown => &[New, IntroShown],
        WaitPayment => &[New, IntroShown, WaitPayment],
        WantJoin => &[New, IntroShown, WaitPayment, WantJoin],
        PaymentOk | Joined => &Stage::ALL,
    }
}

const INTRO_SHOWN_ONLY: StageSet = StageSet::of(&[Stage::IntroShown]);
const PAID_OR_JOINING: StageSet = StageSet::of(&[Stage::PaymentOk, Stage::WantJoin, Stage::Joined]);

static INTRO_SHOWN_PLAN: &[PlanEntry] = &[
    PlanEntry {
        content_ref: "intro_nudge_30m",
        delay: DelaySpec::AfterEntry(Duration::from_secs(30 * MINUTE)),
        required: INTRO_SHOWN_ONLY,
        blocking: StageSet::EMPTY,
    },
    PlanEntry {
        content_ref: "intro_nudge_3h30m",
        delay: DelaySpec::AfterEntry(Duration::from_secs(3 * HOUR + 30 * MINUTE)),
        required: INTRO_SHOWN_ONLY,
        blocking: StageSet::EMPTY,
    },
    PlanEntry {
        content_ref: "intro_next_day",
        delay: DelaySpec::AtTimeOfDay {
            day_offset: 1,
            hour: 11,
            minute: 0,
        },
        required: INTRO_SHOWN_ONLY,
        blocking: StageSet::EMPTY,
    },
    PlanEntry {
        content_ref: "intro_day_two",
        delay: DelaySpec::AtTimeOfDay {
            day_offset: 2,
            hour: 11,
            minute: 0,
        },
        required: INTRO_SHOWN_ONLY,
        blocking: StageSet::EMPTY,
    },
];

static WAIT_PAYMENT_PLAN: &[PlanEntry] = &[
    PlanEntry {
        content_ref: "payment_nudge_1h",
        delay: DelaySpec::AfterEntry(Duration::from_secs(HOUR)),
        required: StageSet::EMPTY,
        blocking: PAID_OR_JOINING,
    },
    PlanEntry {
        content_ref: "payment_next_day",
        delay: DelaySpec::AtTimeOfDay {
            day_offset: 1,
            hour: 19,
            minute: 0,
        },
        required: StageSet::EMPTY,
        blocking: PAID_OR_JOINING,
    },
    PlanEntry {
        content_ref: "payment_last_call",
        delay: DelaySpec::AtTimeOfDay {
            day_offset: 3,
            hour: 12,
            minute: 0,
        },
        required: StageSet::EMPTY,
        blocking: PAID_OR_JOINING,
    },
];

static WANT_JOIN_PLAN: &[PlanEntry] = &[
    PlanEntry {
        content_ref: "join_nudge_15m",
        delay: DelaySpec::AfterEntry(Duration::from_secs(15 * MINUTE)),
        required: StageSet::of(&[Stage::WantJoin]),
        blocking: StageSet::of(&[Stage::Joined]),
    },
    PlanEntry {
        content_ref: "join_next_day",
        delay: DelaySpec::AtTimeOfDay {
            day_offset: 1,
            hour: 10,
            minute: 0,
        },
        required: StageSet::of(&[Stage::WantJoin]),
        blocking: StageSet::of(&[Stage::Joined]),
    },
];
