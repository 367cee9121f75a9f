//! Nudges — scheduled reminder messages and the background dispatcher
//! that delivers them.

pub mod dispatcher;
pub mod model;
pub mod scheduler;

pub use dispatcher::{DispatchReport, Dispatcher, DispatcherConfig, spawn_dispatcher};
pub use model::{MessageStatus, ScheduledMessage};
pub use scheduler::{ScheduleOutcome, Scheduler};
