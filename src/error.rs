//! Error types for the onboarding nudge service.

use std::time::Duration;

/// Error returned by stage-transition operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Delivery channel errors.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Failed to send message on channel {name}: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Unknown content reference: {0}")]
    UnknownContent(String),

    #[error("Rate limited on channel {name}")]
    RateLimited { name: String },

    #[error("HTTP error: {0}")]
    Http(String),
}

/// Errors raised while building or applying a message plan.
#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error("Invalid time of day {hour:02}:{minute:02}")]
    InvalidTimeOfDay { hour: u32, minute: u32 },

    #[error("Delay {delay:?} exceeds the nine-day scheduling horizon")]
    HorizonExceeded { delay: Duration },

    #[error("Could not resolve local time for {0}")]
    UnresolvableLocalTime(String),

    #[error("Repository error: {0}")]
    Database(#[from] DatabaseError),
}
