//! Onboard Drip — stage-driven onboarding nudges.

pub mod channels;
pub mod config;
pub mod error;
pub mod nudges;
pub mod onboarding;
pub mod store;
