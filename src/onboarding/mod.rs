//! Onboarding funnel — stages, message plans, and the transition coordinator.
//!
//! An entity moves through a branching sequence of stages. Every transition
//! goes through [`StageTransitionCoordinator`], which persists the stage and
//! hands the change to the nudge scheduler.

pub mod manager;
pub mod plan;
pub mod routes;
pub mod state;

pub use manager::StageTransitionCoordinator;
pub use plan::{DelaySpec, MessagePlan, PlanEntry, StageSet};
pub use routes::{OnboardingRouteState, onboarding_routes};
pub use state::{Stage, StageTimeline};
