//! Configuration types, read from the environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::{FixedOffset, Offset, Utc};
use secrecy::SecretString;

use crate::error::ConfigError;
use crate::nudges::DispatcherConfig;

/// Moscow time; every time-of-day nudge is resolved in this zone.
const DEFAULT_TZ_OFFSET_MINUTES: i32 = 180;

/// Service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub db_path: PathBuf,
    pub http_port: u16,
    /// The single timezone used for time-of-day nudges.
    pub plan_timezone: FixedOffset,
    pub content_path: PathBuf,
    pub telegram_token: Option<SecretString>,
    pub dispatcher: DispatcherConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/onboard-drip.db"),
            http_port: 8080,
            plan_timezone: FixedOffset::east_opt(DEFAULT_TZ_OFFSET_MINUTES * 60)
                .unwrap_or_else(|| Utc.fix()),
            content_path: PathBuf::from("./content.json"),
            telegram_token: None,
            dispatcher: DispatcherConfig::default(),
        }
    }
}

impl ServiceConfig {
    /// Read `ONBOARD_*` and `TELEGRAM_BOT_TOKEN` from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset keys take their defaults;
    /// set but unparseable keys are an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let d = &defaults.dispatcher;

        let tz_minutes: i32 =
            parse_or(&lookup, "ONBOARD_TZ_OFFSET_MINUTES", DEFAULT_TZ_OFFSET_MINUTES)?;
        let plan_timezone =
            FixedOffset::east_opt(tz_minutes * 60).ok_or_else(|| ConfigError::InvalidValue {
                key: "ONBOARD_TZ_OFFSET_MINUTES".into(),
                message: format!("{tz_minutes} minutes is outside ±24h"),
            })?;

        let dispatcher = DispatcherConfig {
            poll_interval: secs_or(&lookup, "ONBOARD_POLL_INTERVAL_SECS", d.poll_interval)?,
            batch_limit: parse_or(&lookup, "ONBOARD_BATCH_LIMIT", d.batch_limit)?,
            max_concurrent_sends: parse_or(
                &lookup,
                "ONBOARD_MAX_CONCURRENT_SENDS",
                d.max_concurrent_sends,
            )?,
            send_timeout: secs_or(&lookup, "ONBOARD_SEND_TIMEOUT_SECS", d.send_timeout)?,
            claim_lease: secs_or(&lookup, "ONBOARD_CLAIM_LEASE_SECS", d.claim_lease)?,
            max_lateness: match lookup("ONBOARD_MAX_LATENESS_SECS") {
                Some(raw) => Some(Duration::from_secs(parse_value(
                    "ONBOARD_MAX_LATENESS_SECS",
                    &raw,
                )?)),
                None => None,
            },
        };

        if dispatcher.poll_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "ONBOARD_POLL_INTERVAL_SECS".into(),
                message: "must be greater than zero".into(),
            });
        }
        if dispatcher.batch_limit == 0 || dispatcher.max_concurrent_sends == 0 {
            return Err(ConfigError::InvalidValue {
                key: "ONBOARD_BATCH_LIMIT / ONBOARD_MAX_CONCURRENT_SENDS".into(),
                message: "must be greater than zero".into(),
            });
        }
        if dispatcher.claim_lease <= dispatcher.send_timeout {
            return Err(ConfigError::InvalidValue {
                key: "ONBOARD_CLAIM_LEASE_SECS".into(),
                message: format!(
                    "claim lease ({}s) must exceed the send timeout ({}s)",
                    dispatcher.claim_lease.as_secs(),
                    dispatcher.send_timeout.as_secs()
                ),
            });
        }

        Ok(Self {
            db_path: lookup("ONBOARD_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            http_port: parse_or(&lookup, "ONBOARD_HTTP_PORT", defaults.http_port)?,
            plan_timezone,
            content_path: lookup("ONBOARD_CONTENT_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.content_path),
            telegram_token: lookup("TELEGRAM_BOT_TOKEN")
                .filter(|t| !t.trim().is_empty())
                .map(SecretString::from),
            dispatcher,
        })
    }
}

impl ServiceConfig {
    /// The bot token, required to run the Telegram notifier.
    pub fn require_telegram_token(&self) -> Result<SecretString, ConfigError> {
        self.telegram_token
            .clone()
            .ok_or_else(|| ConfigError::MissingEnvVar("TELEGRAM_BOT_TOKEN".into()))
    }
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("{raw:?}: {e}"),
    })
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => parse_value(key, &raw),
        None => Ok(default),
    }
}

fn secs_or<F>(lookup: &F, key: &str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    parse_or(lookup, key, default.as_secs()).map(Duration::from_secs)
}
