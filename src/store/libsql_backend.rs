//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Stage sets are stored as
//! comma-separated stage names; timestamps as fixed-width RFC 3339 text so
//! that due-time comparisons can run in SQL.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::nudges::model::{MessageStatus, ScheduledMessage};
use crate::onboarding::plan::StageSet;
use crate::onboarding::state::{Stage, StageTimeline};
use crate::store::migrations;
use crate::store::traits::Database;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations. Writes
/// are serialized through `write_lock` so that a transaction opened on the
/// shared connection never absorbs statements issued by another task.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        })
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format: always nine fractional digits and a `Z` suffix,
/// so text order equals time order.
fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(ndt.and_utc());
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Ok(ndt.and_utc());
    }
    Err(DatabaseError::Serialization(format!("bad timestamp {s:?}")))
}

fn parse_optional_datetime(s: Option<String>) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    s.as_deref().map(parse_datetime).transpose()
}

/// Read a NOT NULL text column.
fn text_col(row: &libsql::Row, idx: i32, name: &str) -> Result<String, DatabaseError> {
    row.get::<String>(idx)
        .map_err(|e| DatabaseError::Serialization(format!("column {name}: {e}")))
}

/// Read a nullable text column.
fn opt_text_col(row: &libsql::Row, idx: i32, name: &str) -> Result<Option<String>, DatabaseError> {
    match row.get_value(idx) {
        Ok(libsql::Value::Null) => Ok(None),
        Ok(libsql::Value::Text(s)) => Ok(Some(s)),
        Ok(other) => Err(DatabaseError::Serialization(format!(
            "column {name}: expected text, got {other:?}"
        ))),
        Err(e) => Err(DatabaseError::Serialization(format!("column {name}: {e}"))),
    }
}

fn encode_stage_set(set: StageSet) -> String {
    set.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(",")
}

fn decode_stage_set(s: &str) -> Result<StageSet, DatabaseError> {
    s.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| part.parse::<Stage>().map_err(DatabaseError::Serialization))
        .collect()
}

fn parse_stage(s: &str) -> Result<Stage, DatabaseError> {
    s.parse().map_err(DatabaseError::Serialization)
}

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// `?{first}, ?{first+1}, …` for an IN list of `n` values.
fn placeholders(first: usize, n: usize) -> String {
    (first..first + n)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

const SCHEDULED_COLUMNS: &str = "id, entity_id, content_ref, plan_tag, required_stages, blocking_stages, scheduled_at, status, failure_reason, sent_at, claimed_until, created_at, updated_at";

fn row_to_scheduled(row: &libsql::Row) -> Result<ScheduledMessage, DatabaseError> {
    let id_str = text_col(row, 0, "id")?;
    let id = id_str
        .parse::<Uuid>()
        .map_err(|e| DatabaseError::Serialization(format!("bad message id {id_str}: {e}")))?;

    Ok(ScheduledMessage {
        id,
        entity_id: text_col(row, 1, "entity_id")?,
        content_ref: text_col(row, 2, "content_ref")?,
        plan_tag: text_col(row, 3, "plan_tag")?,
        required: decode_stage_set(&text_col(row, 4, "required_stages")?)?,
        blocking: decode_stage_set(&text_col(row, 5, "blocking_stages")?)?,
        scheduled_at: parse_datetime(&text_col(row, 6, "scheduled_at")?)?,
        status: text_col(row, 7, "status")?
            .parse()
            .map_err(DatabaseError::Serialization)?,
        failure_reason: opt_text_col(row, 8, "failure_reason")?,
        sent_at: parse_optional_datetime(opt_text_col(row, 9, "sent_at")?)?,
        claimed_until: parse_optional_datetime(opt_text_col(row, 10, "claimed_until")?)?,
        created_at: parse_datetime(&text_col(row, 11, "created_at")?)?,
        updated_at: parse_datetime(&text_col(row, 12, "updated_at")?)?,
    })
}

async fn collect_scheduled(
    mut rows: libsql::Rows,
    op: &str,
) -> Result<Vec<ScheduledMessage>, DatabaseError> {
    let mut out = Vec::new();
    loop {
        match rows.next().await {
            Ok(Some(row)) => match row_to_scheduled(&row) {
                Ok(msg) => out.push(msg),
                Err(e) => warn!("{op}: skipping unreadable scheduled row: {e}"),
            },
            Ok(None) => break,
            Err(e) => return Err(DatabaseError::Query(format!("{op}: {e}"))),
        }
    }
    Ok(out)
}

/// Claimed rows split into decodable messages and the raw ids of rows
/// that failed to decode.
async fn collect_claimed(
    mut rows: libsql::Rows,
) -> Result<(Vec<ScheduledMessage>, Vec<(String, DatabaseError)>), DatabaseError> {
    let mut claimed = Vec::new();
    let mut unreadable = Vec::new();
    loop {
        match rows.next().await {
            Ok(Some(row)) => match row_to_scheduled(&row) {
                Ok(msg) => claimed.push(msg),
                Err(e) => match text_col(&row, 0, "id") {
                    Ok(id) => unreadable.push((id, e)),
                    Err(_) => warn!("fetch_due: claimed row without a readable id: {e}"),
                },
            },
            Ok(None) => break,
            Err(e) => return Err(DatabaseError::Query(format!("fetch_due: {e}"))),
        }
    }
    Ok((claimed, unreadable))
}

/// Move a claimed row that cannot be decoded to FAILED, so it stops
/// occupying batch slots.
async fn fail_unreadable_on(
    conn: &Connection,
    id: &str,
    error: &DatabaseError,
    now: &str,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE scheduled_messages SET status = 'failed', failure_reason = ?1, claimed_until = NULL, updated_at = ?2
         WHERE id = ?3 AND status = 'scheduled'",
        params![format!("unreadable row: {error}"), now, id],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("fail_unreadable: {e}")))?;
    Ok(())
}

async fn insert_scheduled_on(
    conn: &Connection,
    msg: &ScheduledMessage,
) -> Result<(), DatabaseError> {
    conn.execute(
        &format!(
            "INSERT INTO scheduled_messages ({SCHEDULED_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
        ),
        params![
            msg.id.to_string(),
            msg.entity_id.clone(),
            msg.content_ref.clone(),
            msg.plan_tag.clone(),
            encode_stage_set(msg.required),
            encode_stage_set(msg.blocking),
            fmt_ts(msg.scheduled_at),
            msg.status.to_string(),
            opt_text(msg.failure_reason.as_deref()),
            opt_text(msg.sent_at.map(fmt_ts).as_deref()),
            opt_text(msg.claimed_until.map(fmt_ts).as_deref()),
            fmt_ts(msg.created_at),
            fmt_ts(msg.updated_at),
        ],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("create_scheduled: {e}")))?;
    Ok(())
}

async fn cancel_on(
    conn: &Connection,
    entity_id: &str,
    tags: Option<&[&str]>,
    reason: &str,
) -> Result<usize, DatabaseError> {
    let now = fmt_ts(Utc::now());
    let mut values = vec![
        libsql::Value::Text(reason.to_string()),
        libsql::Value::Text(now),
        libsql::Value::Text(entity_id.to_string()),
    ];
    let tag_filter = match tags {
        Some([]) => return Ok(0),
        Some(tags) => {
            values.extend(tags.iter().map(|t| libsql::Value::Text((*t).to_string())));
            format!(" AND plan_tag IN ({})", placeholders(4, tags.len()))
        }
        None => String::new(),
    };

    let count = conn
        .execute(
            &format!(
                "UPDATE scheduled_messages SET status = 'cancelled', failure_reason = ?1, claimed_until = NULL, updated_at = ?2 WHERE entity_id = ?3 AND status = 'scheduled'{tag_filter}"
            ),
            libsql::params::Params::Positional(values),
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("cancel_scheduled: {e}")))?;
    Ok(count as usize)
}

async fn set_stage_on(
    conn: &Connection,
    id: &str,
    stage: Stage,
    tracked_at: Option<DateTime<Utc>>,
) -> Result<(), DatabaseError> {
    let now = fmt_ts(Utc::now());
    let updated = conn
        .execute(
            "UPDATE entities SET stage = ?1, updated_at = ?2 WHERE id = ?3",
            params![stage.as_str(), now, id],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("set_stage: {e}")))?;
    if updated == 0 {
        return Err(DatabaseError::NotFound {
            entity: "entity".to_string(),
            id: id.to_string(),
        });
    }

    if let Some(at) = tracked_at {
        conn.execute(
            "INSERT INTO stage_timestamps (entity_id, stage, recorded_at) VALUES (?1, ?2, ?3)
             ON CONFLICT (entity_id, stage) DO UPDATE SET recorded_at = ?3",
            params![id, stage.as_str(), fmt_ts(at)],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("set_stage timestamp: {e}")))?;
    }
    Ok(())
}

async fn replace_batch_on(
    conn: &Connection,
    entity_id: &str,
    cancel_tags: &[&str],
    reason: &str,
    new_rows: &[ScheduledMessage],
) -> Result<usize, DatabaseError> {
    let cancelled = cancel_on(conn, entity_id, Some(cancel_tags), reason).await?;
    for msg in new_rows {
        insert_scheduled_on(conn, msg).await?;
    }
    Ok(cancelled)
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Entities ────────────────────────────────────────────────────

    async fn ensure_entity(&self, id: &str, initial: Stage) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let now = fmt_ts(Utc::now());
        let inserted = self
            .conn()
            .execute(
                "INSERT OR IGNORE INTO entities (id, stage, created_at, updated_at) VALUES (?1, ?2, ?3, ?3)",
                params![id, initial.as_str(), now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("ensure_entity: {e}")))?;
        if inserted > 0 {
            debug!(entity_id = %id, stage = %initial, "Entity created");
        }
        Ok(inserted > 0)
    }

    async fn get_stage(&self, id: &str) -> Result<Option<Stage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT stage FROM entities WHERE id = ?1", params![id])
            .await
            .map_err(|e| DatabaseError::Query(format!("get_stage: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let stage: String = row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("get_stage row parse: {e}")))?;
                Ok(Some(parse_stage(&stage)?))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_stage: {e}"))),
        }
    }

    async fn get_timeline(&self, id: &str) -> Result<Option<StageTimeline>, DatabaseError> {
        let Some(current) = self.get_stage(id).await? else {
            return Ok(None);
        };

        let mut rows = self
            .conn()
            .query(
                "SELECT stage, recorded_at FROM stage_timestamps WHERE entity_id = ?1",
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_timeline: {e}")))?;

        let mut timeline = StageTimeline::new(current);
        while let Ok(Some(row)) = rows.next().await {
            let parsed = text_col(&row, 0, "stage")
                .and_then(|s| parse_stage(&s))
                .and_then(|stage| {
                    let recorded = parse_datetime(&text_col(&row, 1, "recorded_at")?)?;
                    Ok((stage, recorded))
                });
            match parsed {
                Ok((stage, recorded)) => {
                    timeline.entered_at.insert(stage, recorded);
                }
                Err(e) => warn!(entity_id = %id, "Skipping stage timestamp row: {e}"),
            }
        }
        Ok(Some(timeline))
    }

    async fn set_stage(
        &self,
        id: &str,
        stage: Stage,
        tracked_at: Option<DateTime<Utc>>,
    ) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("set_stage begin: {e}")))?;

        match set_stage_on(&tx, id, stage, tracked_at).await {
            Ok(()) => {
                tx.commit()
                    .await
                    .map_err(|e| DatabaseError::Query(format!("set_stage commit: {e}")))?;
                debug!(entity_id = %id, stage = %stage, tracked = tracked_at.is_some(), "Stage persisted");
                Ok(())
            }
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    warn!(entity_id = %id, "set_stage rollback failed: {rb}");
                }
                Err(e)
            }
        }
    }

    // ── Scheduled messages ──────────────────────────────────────────

    async fn create_scheduled(&self, msg: &ScheduledMessage) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        insert_scheduled_on(self.conn(), msg).await?;
        debug!(message_id = %msg.id, entity_id = %msg.entity_id, tag = %msg.plan_tag, "Scheduled message inserted");
        Ok(())
    }

    async fn cancel_by_tag(
        &self,
        entity_id: &str,
        tags: &[&str],
        reason: &str,
    ) -> Result<usize, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        cancel_on(self.conn(), entity_id, Some(tags), reason).await
    }

    async fn replace_batch(
        &self,
        entity_id: &str,
        cancel_tags: &[&str],
        reason: &str,
        new_rows: &[ScheduledMessage],
    ) -> Result<usize, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("replace_batch begin: {e}")))?;

        match replace_batch_on(&tx, entity_id, cancel_tags, reason, new_rows).await {
            Ok(cancelled) => {
                tx.commit()
                    .await
                    .map_err(|e| DatabaseError::Query(format!("replace_batch commit: {e}")))?;
                Ok(cancelled)
            }
            Err(e) => {
                if let Err(rb) = tx.rollback().await {
                    warn!(entity_id = %entity_id, "replace_batch rollback failed: {rb}");
                }
                Err(e)
            }
        }
    }

    async fn cancel_all(&self, entity_id: &str, reason: &str) -> Result<usize, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        cancel_on(self.conn(), entity_id, None, reason).await
    }

    async fn fetch_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
        lease: Duration,
    ) -> Result<Vec<ScheduledMessage>, DatabaseError> {
        let lease = chrono::Duration::from_std(lease)
            .map_err(|e| DatabaseError::Query(format!("fetch_due lease: {e}")))?;
        let now_str = fmt_ts(now);
        let claimed_until = fmt_ts(now + lease);

        let _guard = self.write_lock.lock().await;
        let rows = self
            .conn()
            .query(
                &format!(
                    "UPDATE scheduled_messages SET claimed_until = ?1, updated_at = ?2
                     WHERE id IN (
                         SELECT id FROM scheduled_messages
                         WHERE status = 'scheduled' AND scheduled_at <= ?2
                           AND (claimed_until IS NULL OR claimed_until <= ?2)
                         ORDER BY scheduled_at ASC
                         LIMIT ?3
                     )
                     RETURNING {SCHEDULED_COLUMNS}"
                ),
                params![claimed_until, now_str.clone(), limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("fetch_due: {e}")))?;

        let (mut claimed, unreadable) = collect_claimed(rows).await?;
        for (id, e) in &unreadable {
            warn!(message_id = %id, "Failing unreadable scheduled row: {e}");
            fail_unreadable_on(self.conn(), id, e, &now_str).await?;
        }
        claimed.sort_by_key(|m| m.scheduled_at);
        Ok(claimed)
    }

    async fn renew_claim(
        &self,
        id: Uuid,
        held_until: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let renewed = self
            .conn()
            .execute(
                "UPDATE scheduled_messages SET claimed_until = ?1, updated_at = ?2
                 WHERE id = ?3 AND status = 'scheduled' AND claimed_until = ?4",
                params![
                    fmt_ts(until),
                    fmt_ts(Utc::now()),
                    id.to_string(),
                    fmt_ts(held_until),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("renew_claim: {e}")))?;
        Ok(renewed > 0)
    }

    async fn update_status(
        &self,
        id: Uuid,
        status: MessageStatus,
        reason: Option<&str>,
    ) -> Result<bool, DatabaseError> {
        if !status.is_terminal() {
            return Err(DatabaseError::Query(format!(
                "update_status: {status} is not a terminal status"
            )));
        }
        let now = Utc::now();
        let sent_at = (status == MessageStatus::Sent).then(|| fmt_ts(now));

        let _guard = self.write_lock.lock().await;
        let updated = self
            .conn()
            .execute(
                "UPDATE scheduled_messages SET status = ?1, failure_reason = ?2, sent_at = ?3, claimed_until = NULL, updated_at = ?4
                 WHERE id = ?5 AND status = 'scheduled'",
                params![
                    status.to_string(),
                    opt_text(reason),
                    opt_text(sent_at.as_deref()),
                    fmt_ts(now),
                    id.to_string(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_status: {e}")))?;

        debug!(message_id = %id, status = %status, applied = updated > 0, "Scheduled message resolved");
        Ok(updated > 0)
    }

    async fn get_scheduled(&self, id: Uuid) -> Result<Option<ScheduledMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {SCHEDULED_COLUMNS} FROM scheduled_messages WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_scheduled: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_scheduled(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_scheduled: {e}"))),
        }
    }

    async fn list_scheduled(
        &self,
        entity_id: &str,
    ) -> Result<Vec<ScheduledMessage>, DatabaseError> {
        let rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {SCHEDULED_COLUMNS} FROM scheduled_messages WHERE entity_id = ?1 ORDER BY scheduled_at ASC, created_at ASC"
                ),
                params![entity_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_scheduled: {e}")))?;
        collect_scheduled(rows, "list_scheduled").await
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    const LEASE: Duration = Duration::from_secs(300);

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn make_msg(entity: &str, tag: &str, due: DateTime<Utc>) -> ScheduledMessage {
        ScheduledMessage::new(entity, "intro_nudge_30m", tag, due, Utc::now())
    }

    // ── Entity tests ────────────────────────────────────────────────

    #[tokio::test]
    async fn ensure_entity_is_idempotent() {
        let db = test_db().await;
        assert!(db.ensure_entity("1001", Stage::New).await.unwrap());
        assert!(!db.ensure_entity("1001", Stage::IntroShown).await.unwrap());
        assert_eq!(db.get_stage("1001").await.unwrap(), Some(Stage::New));
    }

    #[tokio::test]
    async fn get_stage_unknown_entity() {
        let db = test_db().await;
        assert_eq!(db.get_stage("nobody").await.unwrap(), None);
        assert!(db.get_timeline("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn set_stage_records_tracked_timestamp() {
        let db = test_db().await;
        db.ensure_entity("1001", Stage::New).await.unwrap();

        db.set_stage("1001", Stage::IntroShown, None).await.unwrap();
        let at = Utc::now();
        db.set_stage("1001", Stage::WaitPayment, Some(at)).await.unwrap();

        let timeline = db.get_timeline("1001").await.unwrap().unwrap();
        assert_eq!(timeline.current, Stage::WaitPayment);
        assert_eq!(timeline.entered_at.len(), 1);
        assert_eq!(timeline.entered_at(Stage::WaitPayment), Some(at));
    }

    #[tokio::test]
    async fn set_stage_revisit_overwrites_timestamp() {
        let db = test_db().await;
        db.ensure_entity("1001", Stage::New).await.unwrap();
        let first = Utc::now();
        let second = first + ChronoDuration::hours(2);
        db.set_stage("1001", Stage::WaitPayment, Some(first)).await.unwrap();
        db.set_stage("1001", Stage::IntroShown, None).await.unwrap();
        db.set_stage("1001", Stage::WaitPayment, Some(second)).await.unwrap();

        let timeline = db.get_timeline("1001").await.unwrap().unwrap();
        assert_eq!(timeline.entered_at(Stage::WaitPayment), Some(second));
    }

    #[tokio::test]
    async fn set_stage_unknown_entity_is_not_found() {
        let db = test_db().await;
        let err = db.set_stage("ghost", Stage::IntroShown, None).await.unwrap_err();
        assert!(matches!(err, DatabaseError::NotFound { .. }));
    }

    // ── Scheduled message tests ─────────────────────────────────────

    #[tokio::test]
    async fn create_and_get_scheduled() {
        let db = test_db().await;
        let due = Utc::now() + ChronoDuration::minutes(30);
        let msg = make_msg("1001", "intro_shown", due).with_conditions(
            StageSet::of(&[Stage::IntroShown]),
            StageSet::of(&[Stage::PaymentOk, Stage::Joined]),
        );
        db.create_scheduled(&msg).await.unwrap();

        let fetched = db.get_scheduled(msg.id).await.unwrap().unwrap();
        assert_eq!(fetched.entity_id, "1001");
        assert_eq!(fetched.plan_tag, "intro_shown");
        assert_eq!(fetched.scheduled_at, due);
        assert_eq!(fetched.status, MessageStatus::Scheduled);
        assert_eq!(fetched.required, msg.required);
        assert_eq!(fetched.blocking, msg.blocking);
        assert!(fetched.failure_reason.is_none());
        assert!(fetched.claimed_until.is_none());
    }

    #[tokio::test]
    async fn get_scheduled_not_found() {
        let db = test_db().await;
        assert!(db.get_scheduled(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancel_by_tag_only_touches_matching_live_rows() {
        let db = test_db().await;
        let due = Utc::now();
        let intro = make_msg("1001", "intro_shown", due);
        let payment = make_msg("1001", "wait_payment", due);
        let other_entity = make_msg("2002", "intro_shown", due);
        for m in [&intro, &payment, &other_entity] {
            db.create_scheduled(m).await.unwrap();
        }

        let cancelled = db
            .cancel_by_tag("1001", &["new", "intro_shown"], "superseded")
            .await
            .unwrap();
        assert_eq!(cancelled, 1);

        let intro = db.get_scheduled(intro.id).await.unwrap().unwrap();
        assert_eq!(intro.status, MessageStatus::Cancelled);
        assert_eq!(intro.failure_reason.as_deref(), Some("superseded"));
        let payment = db.get_scheduled(payment.id).await.unwrap().unwrap();
        assert_eq!(payment.status, MessageStatus::Scheduled);
        let other = db.get_scheduled(other_entity.id).await.unwrap().unwrap();
        assert_eq!(other.status, MessageStatus::Scheduled);

        // Already-cancelled rows are not counted again
        let again = db
            .cancel_by_tag("1001", &["intro_shown"], "superseded")
            .await
            .unwrap();
        assert_eq!(again, 0);
    }

    #[tokio::test]
    async fn cancel_by_tag_empty_tag_list_is_noop() {
        let db = test_db().await;
        db.create_scheduled(&make_msg("1001", "intro_shown", Utc::now()))
            .await
            .unwrap();
        assert_eq!(db.cancel_by_tag("1001", &[], "x").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn replace_batch_cancels_and_creates() {
        let db = test_db().await;
        let now = Utc::now();
        let old = make_msg("1001", "intro_shown", now);
        db.create_scheduled(&old).await.unwrap();

        let new_rows = vec![
            make_msg("1001", "wait_payment", now + ChronoDuration::hours(1)),
            make_msg("1001", "wait_payment", now + ChronoDuration::hours(2)),
        ];
        let cancelled = db
            .replace_batch("1001", &["new", "intro_shown", "wait_payment"], "superseded", &new_rows)
            .await
            .unwrap();
        assert_eq!(cancelled, 1);

        let rows = db.list_scheduled("1001").await.unwrap();
        assert_eq!(rows.len(), 3);
        let live: Vec<_> = rows
            .iter()
            .filter(|m| m.status == MessageStatus::Scheduled)
            .collect();
        assert_eq!(live.len(), 2);
        assert!(live.iter().all(|m| m.plan_tag == "wait_payment"));
    }

    #[tokio::test]
    async fn replace_batch_rolls_back_on_failure() {
        let db = test_db().await;
        let now = Utc::now();
        let old = make_msg("1001", "intro_shown", now);
        db.create_scheduled(&old).await.unwrap();

        // Duplicate primary key makes the second insert fail mid-transaction
        let dup = make_msg("1001", "wait_payment", now);
        let rows = vec![dup.clone(), dup];
        let result = db
            .replace_batch("1001", &["intro_shown"], "superseded", &rows)
            .await;
        assert!(result.is_err());

        let old = db.get_scheduled(old.id).await.unwrap().unwrap();
        assert_eq!(old.status, MessageStatus::Scheduled, "cancel must roll back");
        assert_eq!(db.list_scheduled("1001").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn cancel_all_cancels_every_live_row() {
        let db = test_db().await;
        let now = Utc::now();
        for tag in ["intro_shown", "wait_payment", "want_join"] {
            db.create_scheduled(&make_msg("1001", tag, now)).await.unwrap();
        }
        let sent = make_msg("1001", "intro_shown", now);
        db.create_scheduled(&sent).await.unwrap();
        db.update_status(sent.id, MessageStatus::Sent, None).await.unwrap();

        assert_eq!(db.cancel_all("1001", "terminal stage").await.unwrap(), 3);
        let sent = db.get_scheduled(sent.id).await.unwrap().unwrap();
        assert_eq!(sent.status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn fetch_due_claims_oldest_first_up_to_limit() {
        let db = test_db().await;
        let now = Utc::now();
        let late = make_msg("1001", "intro_shown", now - ChronoDuration::minutes(1));
        let early = make_msg("2002", "intro_shown", now - ChronoDuration::minutes(10));
        let middle = make_msg("3003", "intro_shown", now - ChronoDuration::minutes(5));
        let future = make_msg("4004", "intro_shown", now + ChronoDuration::minutes(5));
        for m in [&late, &early, &middle, &future] {
            db.create_scheduled(m).await.unwrap();
        }

        let due = db.fetch_due(now, 2, LEASE).await.unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].id, early.id);
        assert_eq!(due[1].id, middle.id);
        assert!(due.iter().all(|m| m.claimed_until.is_some()));

        let rest = db.fetch_due(now, 10, LEASE).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, late.id);
    }

    #[tokio::test]
    async fn claimed_rows_are_hidden_until_lease_expires() {
        let db = test_db().await;
        let now = Utc::now();
        let msg = make_msg("1001", "intro_shown", now - ChronoDuration::minutes(1));
        db.create_scheduled(&msg).await.unwrap();

        assert_eq!(db.fetch_due(now, 10, LEASE).await.unwrap().len(), 1);
        // A second dispatcher inside the lease sees nothing
        assert!(db.fetch_due(now + ChronoDuration::seconds(10), 10, LEASE)
            .await
            .unwrap()
            .is_empty());

        // Simulated crash: nobody resolved the row, the lease lapses
        let after_lease = now + ChronoDuration::seconds(301);
        let reclaimed = db.fetch_due(after_lease, 10, LEASE).await.unwrap();
        assert_eq!(reclaimed.len(), 1);
        assert_eq!(reclaimed[0].id, msg.id);
        assert_eq!(reclaimed[0].status, MessageStatus::Scheduled);
    }

    #[tokio::test]
    async fn fetch_due_skips_terminal_rows() {
        let db = test_db().await;
        let now = Utc::now();
        let cancelled = make_msg("1001", "intro_shown", now - ChronoDuration::minutes(1));
        db.create_scheduled(&cancelled).await.unwrap();
        db.cancel_all("1001", "terminal stage").await.unwrap();

        assert!(db.fetch_due(now, 10, LEASE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn update_status_is_conditional_on_scheduled() {
        let db = test_db().await;
        let msg = make_msg("1001", "intro_shown", Utc::now());
        db.create_scheduled(&msg).await.unwrap();

        assert!(db.update_status(msg.id, MessageStatus::Sent, None).await.unwrap());
        let sent = db.get_scheduled(msg.id).await.unwrap().unwrap();
        assert_eq!(sent.status, MessageStatus::Sent);
        assert!(sent.sent_at.is_some());
        assert!(sent.claimed_until.is_none());

        // Terminal rows never change again
        assert!(!db
            .update_status(msg.id, MessageStatus::Failed, Some("late failure"))
            .await
            .unwrap());
        let still = db.get_scheduled(msg.id).await.unwrap().unwrap();
        assert_eq!(still.status, MessageStatus::Sent);
        assert!(still.failure_reason.is_none());
    }

    #[tokio::test]
    async fn update_status_records_failure_reason() {
        let db = test_db().await;
        let msg = make_msg("1001", "intro_shown", Utc::now());
        db.create_scheduled(&msg).await.unwrap();
        db.update_status(msg.id, MessageStatus::Failed, Some("chat not found"))
            .await
            .unwrap();

        let failed = db.get_scheduled(msg.id).await.unwrap().unwrap();
        assert_eq!(failed.status, MessageStatus::Failed);
        assert_eq!(failed.failure_reason.as_deref(), Some("chat not found"));
        assert!(failed.sent_at.is_none());
    }

    #[tokio::test]
    async fn list_scheduled_orders_by_due_time() {
        let db = test_db().await;
        let now = Utc::now();
        let b = make_msg("1001", "intro_shown", now + ChronoDuration::hours(2));
        let a = make_msg("1001", "intro_shown", now + ChronoDuration::hours(1));
        db.create_scheduled(&b).await.unwrap();
        db.create_scheduled(&a).await.unwrap();

        let rows = db.list_scheduled("1001").await.unwrap();
        assert_eq!(rows.iter().map(|m| m.id).collect::<Vec<_>>(), vec![a.id, b.id]);
    }

    #[tokio::test]
    async fn update_status_rejects_non_terminal_target() {
        let db = test_db().await;
        let msg = make_msg("1001", "intro_shown", Utc::now());
        db.create_scheduled(&msg).await.unwrap();

        assert!(db
            .update_status(msg.id, MessageStatus::Scheduled, None)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn renew_claim_requires_the_current_claim() {
        let db = test_db().await;
        let now = Utc::now();
        let msg = make_msg("1001", "intro_shown", now);
        db.create_scheduled(&msg).await.unwrap();
        let lease = Duration::from_secs(300);

        let claimed = db.fetch_due(now, 10, lease).await.unwrap().remove(0);
        let held = claimed.claimed_until.unwrap();
        let extended = held + ChronoDuration::seconds(60);
        assert!(db.renew_claim(msg.id, held, extended).await.unwrap());
        // The old value no longer matches.
        assert!(!db.renew_claim(msg.id, held, extended).await.unwrap());

        let row = db.get_scheduled(msg.id).await.unwrap().unwrap();
        assert_eq!(row.claimed_until, Some(extended));

        db.update_status(msg.id, MessageStatus::Sent, None).await.unwrap();
        assert!(!db
            .renew_claim(msg.id, extended, extended + ChronoDuration::seconds(60))
            .await
            .unwrap());
    }

    async fn raw_status(db: &LibSqlBackend, id: Uuid) -> (String, Option<String>, Option<String>) {
        let mut rows = db
            .conn()
            .query(
                "SELECT status, failure_reason, claimed_until FROM scheduled_messages WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .unwrap();
        let row = rows.next().await.unwrap().unwrap();
        (
            row.get(0).unwrap(),
            opt_text_col(&row, 1, "failure_reason").unwrap(),
            opt_text_col(&row, 2, "claimed_until").unwrap(),
        )
    }

    #[tokio::test]
    async fn fetch_due_fails_rows_with_unknown_stages() {
        let db = test_db().await;
        let now = Utc::now();
        let bad = make_msg("1001", "intro_shown", now - ChronoDuration::minutes(2));
        let good = make_msg("1001", "intro_shown", now - ChronoDuration::minutes(1));
        db.create_scheduled(&bad).await.unwrap();
        db.create_scheduled(&good).await.unwrap();
        db.conn()
            .execute(
                "UPDATE scheduled_messages SET required_stages = 'paid_legacy' WHERE id = ?1",
                params![bad.id.to_string()],
            )
            .await
            .unwrap();

        let lease = Duration::from_secs(300);
        let claimed = db.fetch_due(now, 10, lease).await.unwrap();
        assert_eq!(claimed.iter().map(|m| m.id).collect::<Vec<_>>(), vec![good.id]);

        let (status, reason, claimed_until) = raw_status(&db, bad.id).await;
        assert_eq!(status, "failed");
        assert!(reason.unwrap().starts_with("unreadable row:"));
        assert!(claimed_until.is_none());

        // Never handed out again.
        let later = now + ChronoDuration::seconds(301);
        assert!(db
            .fetch_due(later, 10, lease)
            .await
            .unwrap()
            .iter()
            .all(|m| m.id != bad.id));
        assert_eq!(raw_status(&db, bad.id).await.0, "failed");
    }

    #[tokio::test]
    async fn fetch_due_fails_rows_with_corrupt_timestamps() {
        let db = test_db().await;
        let now = Utc::now();
        let msg = make_msg("1001", "intro_shown", now - ChronoDuration::minutes(1));
        db.create_scheduled(&msg).await.unwrap();
        db.conn()
            .execute(
                "UPDATE scheduled_messages SET created_at = 'not a time' WHERE id = ?1",
                params![msg.id.to_string()],
            )
            .await
            .unwrap();

        assert!(db
            .fetch_due(now, 10, Duration::from_secs(300))
            .await
            .unwrap()
            .is_empty());
        let (status, reason, _) = raw_status(&db, msg.id).await;
        assert_eq!(status, "failed");
        assert!(reason.unwrap().contains("bad timestamp"));
        assert!(db.get_scheduled(msg.id).await.is_err());
    }

    // ── Encoding helpers ────────────────────────────────────────────

    #[test]
    fn stage_set_encoding() {
        let set = StageSet::of(&[Stage::PaymentOk, Stage::WantJoin]);
        let encoded = encode_stage_set(set);
        assert_eq!(encoded, "payment_ok,want_join");
        assert_eq!(decode_stage_set(&encoded).unwrap(), set);
        assert_eq!(decode_stage_set("").unwrap(), StageSet::EMPTY);
        assert!(decode_stage_set("payment_ok,bogus").is_err());
    }

    #[test]
    fn timestamp_text_sorts_chronologically() {
        let a = DateTime::parse_from_rfc3339("2026-03-10T08:00:00Z").unwrap().with_timezone(&Utc);
        let b = a + ChronoDuration::nanoseconds(1);
        let c = a + ChronoDuration::seconds(1);
        assert!(fmt_ts(a) < fmt_ts(b));
        assert!(fmt_ts(b) < fmt_ts(c));
        assert_eq!(parse_datetime(&fmt_ts(b)).unwrap(), b);
        assert!(parse_datetime("yesterday").is_err());
    }

    #[tokio::test]
    async fn on_disk_database_persists_rows() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("nested").join("drip.db");
        let msg = make_msg("1001", "intro_shown", Utc::now());
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.ensure_entity("1001", Stage::IntroShown).await.unwrap();
            db.create_scheduled(&msg).await.unwrap();
        }
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert_eq!(db.get_stage("1001").await.unwrap(), Some(Stage::IntroShown));
        assert!(db.get_scheduled(msg.id).await.unwrap().is_some());
    }
}
